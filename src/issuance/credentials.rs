//! Signing keys and trusted certificates used for token issuance and verification.
//!
//! The [CredentialStore] is assembled once at startup with its [Builder] and
//! is immutable afterwards, so it can be shared between sessions behind an
//! [std::sync::Arc] without further synchronisation.
//!
//! # Examples
//!
//! ```ignore
//! use popp::issuance::CredentialStore;
//!
//! let store = CredentialStore::builder()
//!     .with_signing_key_pem("popp-signer", include_str!("../../tests/data/signer-key.pem"))?
//!     .with_certificate_pem(include_bytes!("../../tests/data/signer-cert.pem"))?
//!     .build()?;
//! ```
use std::collections::BTreeMap;
use std::fmt;
use std::{fs::File, io::Read, path::Path};

use der::referenced::OwnedToRef;
use p256::ecdsa::{SigningKey, VerifyingKey};
use p256::pkcs8::DecodePrivateKey;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;
use x509_cert::{der::Decode, Certificate};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("unable to parse pem: {0}")]
    Pem(String),
    #[error("unable to parse private key for alias '{alias}': {reason}")]
    PrivateKey { alias: String, reason: String },
    #[error("unable to parse certificate: {0}")]
    Certificate(String),
    #[error("certificate public key is not a P-256 key: {0}")]
    PublicKey(String),
    #[error("no signing key under alias '{0}'")]
    MissingKey(String),
    #[error("credential store contains no signing key and no certificate")]
    Empty,
    #[error("unable to read credential file: {0}")]
    Io(#[from] std::io::Error),
}

/// A trusted X.509 certificate with the P-256 key it certifies.
#[derive(Clone)]
pub struct TrustedCertificate {
    certificate: Certificate,
    verifying_key: VerifyingKey,
}

impl TrustedCertificate {
    pub fn from_der(bytes: &[u8]) -> Result<Self, Error> {
        let certificate =
            Certificate::from_der(bytes).map_err(|e| Error::Certificate(e.to_string()))?;
        Self::new(certificate)
    }

    pub fn from_pem(data: &[u8]) -> Result<Self, Error> {
        let bytes = pem_rfc7468::decode_vec(data)
            .map_err(|e| Error::Pem(e.to_string()))?
            .1;
        Self::from_der(&bytes)
    }

    fn new(certificate: Certificate) -> Result<Self, Error> {
        let public_key: p256::PublicKey = certificate
            .tbs_certificate
            .subject_public_key_info
            .owned_to_ref()
            .try_into()
            .map_err(|e: p256::pkcs8::spki::Error| Error::PublicKey(e.to_string()))?;
        Ok(Self {
            certificate,
            verifying_key: public_key.into(),
        })
    }

    pub fn verifying_key(&self) -> &VerifyingKey {
        &self.verifying_key
    }

    pub fn certificate(&self) -> &Certificate {
        &self.certificate
    }

    /// Whether `now` lies inside the certificate's validity period.
    pub fn is_valid_at(&self, now: OffsetDateTime) -> bool {
        let validity = &self.certificate.tbs_certificate.validity;
        let now = now.unix_timestamp();
        let not_before = validity.not_before.to_unix_duration().as_secs() as i64;
        let not_after = validity.not_after.to_unix_duration().as_secs() as i64;
        not_before <= now && now <= not_after
    }

    pub fn subject(&self) -> String {
        self.certificate.tbs_certificate.subject.to_string()
    }
}

impl fmt::Debug for TrustedCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrustedCertificate")
            .field("subject", &self.subject())
            .finish_non_exhaustive()
    }
}

/// Signing keys by alias plus the set of trusted certificates.
#[derive(Clone, Default)]
pub struct CredentialStore {
    keys: BTreeMap<String, SigningKey>,
    certificates: Vec<TrustedCertificate>,
}

impl CredentialStore {
    pub fn builder() -> Builder {
        Builder::default()
    }

    pub fn signing_key(&self, alias: &str) -> Result<&SigningKey, Error> {
        self.keys
            .get(alias)
            .ok_or_else(|| Error::MissingKey(alias.to_string()))
    }

    /// Certificates whose validity period includes `now`.
    pub fn trusted_certificates_at(
        &self,
        now: OffsetDateTime,
    ) -> impl Iterator<Item = &TrustedCertificate> {
        self.certificates.iter().filter(move |cert| {
            let valid = cert.is_valid_at(now);
            if !valid {
                tracing::debug!("skipping certificate outside its validity period: {}", cert.subject());
            }
            valid
        })
    }

    pub fn aliases(&self) -> impl Iterator<Item = &str> {
        self.keys.keys().map(String::as_str)
    }
}

impl fmt::Debug for CredentialStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialStore")
            .field("aliases", &self.keys.keys().collect::<Vec<_>>())
            .field("certificates", &self.certificates)
            .finish()
    }
}

/// Identifier for a signing key, derived from its SEC1-encoded public key.
pub fn key_id(key: &VerifyingKey) -> String {
    let digest = Sha256::digest(key.to_encoded_point(true).as_bytes());
    base64::encode_config(&digest[..16], base64::URL_SAFE_NO_PAD)
}

/// Builder for creating a [CredentialStore].
#[derive(Default)]
pub struct Builder {
    keys: BTreeMap<String, SigningKey>,
    certificates: Vec<TrustedCertificate>,
}

impl Builder {
    pub fn with_signing_key(mut self, alias: impl Into<String>, key: SigningKey) -> Self {
        self.keys.insert(alias.into(), key);
        self
    }

    /// Adds a `PEM`-encoded P-256 private key, either SEC1 (`EC PRIVATE KEY`) or PKCS#8.
    pub fn with_signing_key_pem(self, alias: impl Into<String>, pem: &str) -> Result<Builder, Error> {
        let alias = alias.into();
        let secret = p256::SecretKey::from_sec1_pem(pem)
            .or_else(|_| p256::SecretKey::from_pkcs8_pem(pem))
            .map_err(|e| Error::PrivateKey {
                alias: alias.clone(),
                reason: e.to_string(),
            })?;
        Ok(self.with_signing_key(alias, secret.into()))
    }

    pub fn with_signing_key_pem_file(
        self,
        alias: impl Into<String>,
        path: impl AsRef<Path>,
    ) -> Result<Builder, Error> {
        let mut pem = String::new();
        File::open(path)?.read_to_string(&mut pem)?;
        self.with_signing_key_pem(alias, &pem)
    }

    /// Adds a `PEM`-encoded certificate to the trusted set.
    pub fn with_certificate_pem(mut self, data: &[u8]) -> Result<Builder, Error> {
        self.certificates.push(TrustedCertificate::from_pem(data)?);
        Ok(self)
    }

    /// Adds a `DER`-encoded certificate to the trusted set.
    pub fn with_certificate_der(mut self, data: &[u8]) -> Result<Builder, Error> {
        self.certificates.push(TrustedCertificate::from_der(data)?);
        Ok(self)
    }

    pub fn with_certificate_pem_file(self, path: impl AsRef<Path>) -> Result<Builder, Error> {
        let mut data: Vec<u8> = vec![];
        File::open(path)?.read_to_end(&mut data)?;
        self.with_certificate_pem(&data)
    }

    pub fn build(self) -> Result<CredentialStore, Error> {
        if self.keys.is_empty() && self.certificates.is_empty() {
            return Err(Error::Empty);
        }
        Ok(CredentialStore {
            keys: self.keys,
            certificates: self.certificates,
        })
    }
}
