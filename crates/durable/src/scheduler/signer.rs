//! Keyed tags authenticating queue-delivered callbacks

use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Errors from signer construction
#[derive(Debug, thiserror::Error)]
pub enum SignerError {
    #[error("signing secret must not be empty")]
    EmptySecret,

    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

/// HMAC-SHA256 signer over ordered request fields
///
/// Every field is prefixed with its length before hashing, so
/// `["ab", "c"]` and `["a", "bc"]` produce different tags.
#[derive(Clone)]
pub struct Signer {
    key: HmacSha256,
}

impl std::fmt::Debug for Signer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Signer")
            .field("secret", &"[redacted]")
            .finish()
    }
}

impl Signer {
    pub fn new(secret: impl AsRef<[u8]>) -> Result<Self, SignerError> {
        let secret = secret.as_ref();
        if secret.is_empty() {
            return Err(SignerError::EmptySecret);
        }
        let key = <HmacSha256 as Mac>::new_from_slice(secret)
            .map_err(|e| SignerError::InvalidKey(e.to_string()))?;
        Ok(Self { key })
    }

    /// Hex-encoded tag over `fields`
    pub fn sign(&self, fields: &[&str]) -> String {
        hex::encode(self.mac(fields).finalize().into_bytes())
    }

    /// Check `tag` against the tag of `fields` in constant time
    pub fn verify(&self, fields: &[&str], tag: &str) -> bool {
        let Ok(tag) = hex::decode(tag) else {
            return false;
        };
        self.mac(fields).verify_slice(&tag).is_ok()
    }

    fn mac(&self, fields: &[&str]) -> HmacSha256 {
        let mut mac = self.key.clone();
        for field in fields {
            mac.update(&(field.len() as u64).to_be_bytes());
            mac.update(field.as_bytes());
        }
        mac
    }
}
