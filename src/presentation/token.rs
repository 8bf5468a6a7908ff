//! Reading tokens back.
//!
//! [TokenParser::parse_verified] is the only mode that establishes trust: the
//! signature must validate against one of the trusted certificates of the
//! credential store, and time based claims must hold.
//!
//! [TokenParser::parse_unverified] skips the signature entirely. It exists for
//! proof tokens this process minted itself (e.g. entries read back from the
//! token cache) and for diagnostics. It is a trust boundary decision, never a
//! default: claims obtained this way must not be used to authorize anything.
use std::sync::Arc;

use p256::ecdsa::Signature;
use signature::Verifier;
use time::OffsetDateTime;

use crate::{
    definitions::token::{decode, Claims, Decoded, Error},
    issuance::credentials::CredentialStore,
};

#[derive(Debug, Clone)]
pub struct TokenParser {
    trust_store: Arc<CredentialStore>,
}

impl TokenParser {
    pub fn new(trust_store: Arc<CredentialStore>) -> Self {
        Self { trust_store }
    }

    /// Decode, verify the signature against the trust store and validate the claims.
    pub fn parse_verified<C: Claims>(&self, token: &str) -> Result<Decoded<C>, Error> {
        let decoded = decode::<C>(token)?;
        let now = OffsetDateTime::now_utc();
        verify_signature(&decoded, &self.trust_store, now)?;
        decoded.claims.validate(now.unix_timestamp())?;
        Ok(decoded)
    }

    /// Decode without any signature or time checks. See the module documentation.
    pub fn parse_unverified<C: Claims>(token: &str) -> Result<Decoded<C>, Error> {
        decode(token)
    }
}

fn verify_signature<C>(
    decoded: &Decoded<C>,
    trust_store: &CredentialStore,
    now: OffsetDateTime,
) -> Result<(), Error> {
    let signature = Signature::from_slice(&decoded.signature).map_err(|_| Error::Signature)?;
    let mut anchors = trust_store.trusted_certificates_at(now).peekable();
    if anchors.peek().is_none() {
        return Err(Error::NoTrustAnchor);
    }
    let trusted = anchors.any(|anchor| {
        anchor
            .verifying_key()
            .verify(decoded.signing_input.as_bytes(), &signature)
            .is_ok()
    });
    if trusted {
        Ok(())
    } else {
        tracing::info!(kid = %decoded.header.kid, "token signature could not be validated");
        Err(Error::Signature)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::config::Config;
    use crate::definitions::token::{ProofClaims, ServiceClaims};
    use crate::issuance::credentials::test::{store, OTHER_CERT};
    use crate::issuance::TokenIssuer;

    fn issuer() -> TokenIssuer {
        TokenIssuer::new(Arc::new(store()), &Config::default())
    }

    #[test]
    fn verifies_against_trusted_certificate() {
        let token = issuer().issue_service_token("svc").unwrap();
        let parser = TokenParser::new(Arc::new(store()));
        let decoded = parser.parse_verified::<ServiceClaims>(&token).unwrap();
        assert_eq!(decoded.claims.sub, "svc");
    }

    #[test]
    fn rejects_untrusted_signer() {
        let token = issuer().issue_service_token("svc").unwrap();
        let other = CredentialStore::builder()
            .with_certificate_pem(OTHER_CERT)
            .unwrap()
            .build()
            .unwrap();
        let parser = TokenParser::new(Arc::new(other));
        assert!(matches!(
            parser.parse_verified::<ServiceClaims>(&token),
            Err(Error::Signature)
        ));
    }

    #[test]
    fn rejects_tampered_claims() {
        let token = issuer().issue_service_token("svc").unwrap();
        let mut parts: Vec<String> = token.split('.').map(str::to_string).collect();
        let forged = ServiceClaims {
            iss: None,
            sub: "admin".into(),
            iat: 0,
            exp: i64::MAX,
        };
        parts[1] = crate::definitions::token::encode_segment(&forged).unwrap();
        let parser = TokenParser::new(Arc::new(store()));
        assert!(matches!(
            parser.parse_verified::<ServiceClaims>(&parts.join(".")),
            Err(Error::Signature)
        ));
    }

    #[test]
    fn rejects_expired_tokens() {
        let key = store();
        let key = key.signing_key("popp-signer").unwrap();
        let header = crate::definitions::token::Header::es256("jwt", "k");
        let claims = ServiceClaims {
            iss: None,
            sub: "svc".into(),
            iat: 1,
            exp: 2,
        };
        let token = crate::issuance::token::sign(&header, &claims, key).unwrap();
        let parser = TokenParser::new(Arc::new(store()));
        assert!(matches!(
            parser.parse_verified::<ServiceClaims>(&token),
            Err(Error::Expired(2))
        ));
    }

    #[test]
    fn store_without_certificates_cannot_verify() {
        let keys_only = CredentialStore::builder()
            .with_signing_key(
                "popp-signer",
                store().signing_key("popp-signer").unwrap().clone(),
            )
            .build()
            .unwrap();
        let token = issuer().issue_service_token("svc").unwrap();
        let parser = TokenParser::new(Arc::new(keys_only));
        assert!(matches!(
            parser.parse_verified::<ServiceClaims>(&token),
            Err(Error::NoTrustAnchor)
        ));
    }

    #[test]
    fn lenient_mode_skips_signature() {
        let issuer = issuer();
        let claims = issuer.proof_claims(&Default::default(), OffsetDateTime::now_utc());
        let token = issuer.issue_proof(&claims).unwrap();
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[2] = "AAAA";
        let decoded = TokenParser::parse_unverified::<ProofClaims>(&parts.join(".")).unwrap();
        assert_eq!(decoded.claims, claims);
    }
}
