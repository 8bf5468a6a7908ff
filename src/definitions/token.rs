//! Signed tokens in compact form: `base64url(header).base64url(claims).base64url(signature)`.
//!
//! Two claim sets are used. [ProofClaims] attest that a card was present and
//! answered a scenario; [ServiceClaims] authorize one service towards another
//! for a short validity window.
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub const ALG_ES256: &str = "ES256";
const SEGMENT_SEPARATOR: char = '.';

/// Every variant means the token must be rejected.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("token must have three dot-separated segments, found {0}")]
    Structure(usize),
    #[error("token segment is not valid base64url: {0}")]
    Encoding(#[from] base64::DecodeError),
    #[error("token segment is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported signature algorithm '{0}'")]
    Algorithm(String),
    #[error("token signature is malformed or does not match any trusted certificate")]
    Signature,
    #[error("token expired at {0}")]
    Expired(i64),
    #[error("no trusted certificate available for verification")]
    NoTrustAnchor,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    pub typ: String,
    pub alg: String,
    pub kid: String,
}

impl Header {
    pub fn es256(typ: impl Into<String>, kid: impl Into<String>) -> Self {
        Self {
            typ: typ.into(),
            alg: ALG_ES256.to_string(),
            kid: kid.into(),
        }
    }
}

/// Claims attesting that a card was interrogated successfully.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofClaims {
    pub proof_method: String,
    /// Seconds since the epoch at which the scenario completed.
    pub patient_proof_time: i64,
    #[serde(rename = "iat")]
    pub issued_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub insurer_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actor_profession_oid: Option<String>,
}

/// Claims for service-to-service authorization. `sub` and `exp` are mandatory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceClaims {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub iss: Option<String>,
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claim sets that can be carried in a token.
pub trait Claims: Serialize + DeserializeOwned {
    /// Time based checks applied after the signature has been verified.
    fn validate(&self, _now: i64) -> Result<(), Error> {
        Ok(())
    }
}

impl Claims for ProofClaims {}

impl Claims for ServiceClaims {
    fn validate(&self, now: i64) -> Result<(), Error> {
        if self.exp <= now {
            return Err(Error::Expired(self.exp));
        }
        Ok(())
    }
}

/// A token split into its decoded parts.
#[derive(Debug, Clone)]
pub struct Decoded<C> {
    pub header: Header,
    pub claims: C,
    pub signature: Vec<u8>,
    /// `header.claims` as it was signed.
    pub signing_input: String,
}

pub fn encode_segment<T: Serialize>(value: &T) -> Result<String, Error> {
    let json = serde_json::to_vec(value)?;
    Ok(base64::encode_config(json, base64::URL_SAFE_NO_PAD))
}

fn decode_segment(segment: &str) -> Result<Vec<u8>, Error> {
    Ok(base64::decode_config(segment, base64::URL_SAFE_NO_PAD)?)
}

/// Join the signing input and the raw signature into the compact form.
pub fn assemble(signing_input: &str, signature: &[u8]) -> String {
    format!(
        "{signing_input}{SEGMENT_SEPARATOR}{}",
        base64::encode_config(signature, base64::URL_SAFE_NO_PAD)
    )
}

/// Split and decode a compact token without checking its signature.
pub fn decode<C: Claims>(token: &str) -> Result<Decoded<C>, Error> {
    let segments: Vec<&str> = token.trim().split(SEGMENT_SEPARATOR).collect();
    let [header, claims, signature] = segments.as_slice() else {
        return Err(Error::Structure(segments.len()));
    };
    let decoded_header: Header = serde_json::from_slice(&decode_segment(header)?)?;
    if decoded_header.alg != ALG_ES256 {
        return Err(Error::Algorithm(decoded_header.alg));
    }
    Ok(Decoded {
        header: decoded_header,
        claims: serde_json::from_slice(&decode_segment(claims)?)?,
        signature: decode_segment(signature)?,
        signing_input: format!("{header}{SEGMENT_SEPARATOR}{claims}"),
    })
}
