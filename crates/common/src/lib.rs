use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};
use thiserror::Error;

pub mod config;
pub mod error;
pub mod types;

pub use config::{ConfigError, RotatorConfig};
pub use error::{Result, RotateError};
pub use types::{ByteCount, Timestamp};

pub const FINGERPRINT_LEN: usize = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error("invalid fingerprint length: expected {expected}, got {actual}")]
    InvalidFingerprint { expected: usize, actual: usize },
    #[error("invalid fingerprint hex: {0}")]
    InvalidFingerprintHex(String),
}

/// SHA-1 identity digest of a relay, rendered as 40 upper-case hex digits.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Fingerprint([u8; FINGERPRINT_LEN]);

impl Fingerprint {
    pub fn from_bytes(bytes: [u8; FINGERPRINT_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self, DomainError> {
        if bytes.len() != FINGERPRINT_LEN {
            return Err(DomainError::InvalidFingerprint {
                expected: FINGERPRINT_LEN,
                actual: bytes.len(),
            });
        }

        let mut array = [0u8; FINGERPRINT_LEN];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode_upper(self.0)
    }

    /// Parses a fingerprint, accepting the `$` prefix Tor uses in long names.
    pub fn from_hex(hex_str: &str) -> Result<Self, DomainError> {
        let trimmed = hex_str.strip_prefix('$').unwrap_or(hex_str);
        let decoded = hex::decode(trimmed)
            .map_err(|err| DomainError::InvalidFingerprintHex(err.to_string()))?;
        Self::from_slice(&decoded)
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl From<[u8; FINGERPRINT_LEN]> for Fingerprint {
    fn from(value: [u8; FINGERPRINT_LEN]) -> Self {
        Self::from_bytes(value)
    }
}

impl TryFrom<String> for Fingerprint {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::from_hex(&value)
    }
}

impl From<Fingerprint> for String {
    fn from(value: Fingerprint) -> Self {
        value.to_hex()
    }
}

impl FromStr for Fingerprint {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
