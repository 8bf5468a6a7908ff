use std::sync::Arc;
use std::time::Duration;

use p256::ecdsa::Signature;
use signature::Signer;
use time::OffsetDateTime;

use crate::{
    config::Config,
    definitions::{
        card_data::CardIdentifiers,
        token::{self, assemble, encode_segment, Claims, Header, ProofClaims, ServiceClaims},
    },
    issuance::credentials::{self, key_id, CredentialStore},
};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("signing key unavailable: {0}")]
    Credentials(#[from] credentials::Error),
    #[error("error signing token: {0}")]
    Signature(#[from] signature::Error),
    #[error("error encoding token: {0}")]
    Encoding(#[from] token::Error),
}

/// Mints ES256 tokens with the key configured under `signingKeyAlias`.
#[derive(Debug, Clone)]
pub struct TokenIssuer {
    credentials: Arc<CredentialStore>,
    key_alias: String,
    token_type: String,
    proof_method: String,
    actor_id: Option<String>,
    actor_profession_oid: Option<String>,
    service_token_validity: Duration,
}

impl TokenIssuer {
    pub fn new(credentials: Arc<CredentialStore>, config: &Config) -> Self {
        Self {
            credentials,
            key_alias: config.signing_key_alias.clone(),
            token_type: config.token_type.clone(),
            proof_method: config.proof_method.clone(),
            actor_id: config.actor_id.clone(),
            actor_profession_oid: config.actor_profession_oid.clone(),
            service_token_validity: config.service_token_validity(),
        }
    }

    pub fn credentials(&self) -> &CredentialStore {
        &self.credentials
    }

    /// Claims for a scenario that completed at `proof_time`.
    pub fn proof_claims(
        &self,
        identifiers: &CardIdentifiers,
        proof_time: OffsetDateTime,
    ) -> ProofClaims {
        ProofClaims {
            proof_method: self.proof_method.clone(),
            patient_proof_time: proof_time.unix_timestamp(),
            issued_at: OffsetDateTime::now_utc().unix_timestamp(),
            patient_id: identifiers.patient_id.clone(),
            insurer_id: identifiers.insurer_id.clone(),
            actor_id: self.actor_id.clone(),
            actor_profession_oid: self.actor_profession_oid.clone(),
        }
    }

    /// Sign arbitrary claims with the configured key.
    pub fn issue<C: Claims>(&self, claims: &C) -> Result<String, Error> {
        let key = self.credentials.signing_key(&self.key_alias)?;
        let header = Header::es256(&self.token_type, key_id(key.verifying_key()));
        sign(&header, claims, key)
    }

    pub fn issue_proof(&self, claims: &ProofClaims) -> Result<String, Error> {
        let token = self.issue(claims)?;
        tracing::info!(
            proof_method = %claims.proof_method,
            patient_proof_time = claims.patient_proof_time,
            "issued proof token"
        );
        Ok(token)
    }

    /// A short lived token authorizing `subject` towards another service.
    pub fn issue_service_token(&self, subject: impl Into<String>) -> Result<String, Error> {
        let now = OffsetDateTime::now_utc().unix_timestamp();
        let claims = ServiceClaims {
            iss: self.actor_id.clone(),
            sub: subject.into(),
            iat: now,
            exp: now + self.service_token_validity.as_secs() as i64,
        };
        self.issue(&claims)
    }
}

/// Directly sign a header and claim set into the compact form.
pub fn sign<C, S>(header: &Header, claims: &C, signer: &S) -> Result<String, Error>
where
    C: Claims,
    S: Signer<Signature>,
{
    let signing_input = format!("{}.{}", encode_segment(header)?, encode_segment(claims)?);
    let signature = signer.try_sign(signing_input.as_bytes())?;
    Ok(assemble(&signing_input, &signature.to_bytes()))
}
