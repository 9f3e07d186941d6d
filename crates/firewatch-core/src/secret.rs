//! One-way digests of shared secrets.
//!
//! Sensors and monitors authenticate with a shared secret set by the
//! operator at daemon start. Only the SHA-256 digest is retained; the clear
//! text is dropped as soon as the hash is computed.

use std::fmt;

use sha2::{Digest, Sha256};

use crate::error::{DomainError, DomainResult};

/// SHA-256 digest of a shared secret.
#[derive(Clone, PartialEq, Eq)]
pub struct SecretHash([u8; 32]);

impl SecretHash {
    /// Hashes a clear-text secret.
    pub fn of(secret: &str) -> Self {
        Self(Sha256::digest(secret.as_bytes()).into())
    }

    /// Parses a previously stored hex digest.
    pub fn from_hex(digest: &str) -> DomainResult<Self> {
        let invalid = || DomainError::InvalidFieldValue {
            field: "secret hash".to_string(),
            value: digest.to_string(),
            expected: "64 hex characters".to_string(),
        };
        let bytes = hex::decode(digest.trim()).map_err(|_| invalid())?;
        let array: [u8; 32] = bytes.try_into().map_err(|_| invalid())?;
        Ok(Self(array))
    }

    /// Returns the digest as lowercase hex.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Checks a candidate secret against this digest.
    ///
    /// Compares the full digests without short-circuiting.
    #[must_use]
    pub fn matches(&self, candidate: &str) -> bool {
        let other = Self::of(candidate);
        self.0
            .iter()
            .zip(other.0.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl fmt::Debug for SecretHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hex = self.to_hex();
        write!(f, "SecretHash({}..)", hex.get(..8).unwrap_or(&hex))
    }
}
