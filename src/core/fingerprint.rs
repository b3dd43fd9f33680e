//! Request fingerprints.
//!
//! A fingerprint is the SHA-256 of the operation type and the RFC 8785 (JCS)
//! canonical JSON of the request. Canonicalization sorts object keys and
//! normalizes number and whitespace formatting, so field order and incidental
//! formatting never change the fingerprint.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Errors computing a fingerprint
#[derive(Debug, Error)]
pub enum FingerprintError {
    #[error("Request cannot be canonicalized: {0}")]
    Canonicalize(#[from] serde_json::Error),
}

/// Fixed-size digest identifying a logical request
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestFingerprint([u8; 32]);

impl RequestFingerprint {
    /// Fingerprint any serializable request
    pub fn of<R: Serialize>(
        operation_type: &str,
        request: &R,
    ) -> Result<Self, FingerprintError> {
        let canonical = serde_jcs::to_string(request)?;
        Ok(Self::digest(operation_type, &canonical))
    }

    /// Fingerprint a raw JSON document
    pub fn of_json_str(operation_type: &str, json: &str) -> Result<Self, FingerprintError> {
        let value: serde_json::Value = serde_json::from_str(json)?;
        Self::of(operation_type, &value)
    }

    fn digest(operation_type: &str, canonical: &str) -> Self {
        let mut hasher = Sha256::new();
        // Length prefix keeps (op, body) pairs unambiguous
        hasher.update((operation_type.len() as u64).to_be_bytes());
        hasher.update(operation_type.as_bytes());
        hasher.update(canonical.as_bytes());
        Self(hasher.finalize().into())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for RequestFingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestFingerprint({})", &self.to_hex()[..16])
    }
}
