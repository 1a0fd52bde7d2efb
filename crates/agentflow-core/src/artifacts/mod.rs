//! Content-addressed artifact store.
//!
//! Context packages, integrated phase outputs and run reports are stored by
//! the SHA-256 of their bytes. JSON artifacts are stored in canonical form so
//! their address equals [`crate::domain::compute_digest`] of the value.

pub mod fs;
pub mod memory;

use std::fmt;
use std::str::FromStr;

use serde::Serialize;
use sha2::{Digest as Sha2Digest, Sha256};
use thiserror::Error;

/// SHA-256 digest used as a content address.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Digest([u8; 32]);

impl Digest {
    /// Compute the SHA-256 digest of `data`.
    pub fn compute(data: &[u8]) -> Self {
        let hash = Sha256::digest(data);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&hash);
        Self(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.to_hex().chars().take(12).collect::<String>())
    }
}

impl FromStr for Digest {
    type Err = ArtifactError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let bytes = hex::decode(s).map_err(|_| ArtifactError::InvalidDigest(s.to_string()))?;
        if bytes.len() != 32 {
            return Err(ArtifactError::InvalidDigest(s.to_string()));
        }
        let mut arr = [0u8; 32];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }
}

/// Errors from artifact store operations.
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("artifact not found: {0}")]
    NotFound(Digest),

    #[error("invalid digest hex: {0}")]
    InvalidDigest(String),

    #[error("artifact is not canonical JSON: {0}")]
    Encoding(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, ArtifactError>;

/// Content-addressed store interface.
pub trait ArtifactStore: Send + Sync {
    /// Store `data` and return its digest. Deduplicates automatically.
    fn put(&self, data: &[u8]) -> Result<Digest>;

    /// Retrieve the blob for `digest`.
    fn get(&self, digest: &Digest) -> Result<Vec<u8>>;

    /// Check whether `digest` exists without reading the blob.
    fn exists(&self, digest: &Digest) -> Result<bool>;
}

/// Store `value` as canonical JSON and return its address.
pub fn put_json<T: Serialize + ?Sized>(store: &dyn ArtifactStore, value: &T) -> Result<Digest> {
    let value = serde_json::to_value(value).map_err(|e| ArtifactError::Encoding(e.to_string()))?;
    let canonical =
        crate::domain::canonical_json(&value).map_err(|e| ArtifactError::Encoding(e.to_string()))?;
    store.put(canonical.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_display_fromstr_roundtrip() {
        let d = Digest::compute(b"context package");
        let parsed: Digest = d.to_string().parse().unwrap();
        assert_eq!(d, parsed);
    }

    #[test]
    fn digest_fromstr_rejects_bad_input() {
        assert!("not-valid-hex".parse::<Digest>().is_err());
        assert!("abcd".parse::<Digest>().is_err());
    }

    #[test]
    fn put_json_address_matches_compute_digest() {
        let store = memory::MemoryArtifactStore::new();
        let value = serde_json::json!({ "b": [1, 2], "a": 1.0 });
        let digest = put_json(&store, &value).unwrap();
        assert_eq!(digest.to_hex(), crate::domain::compute_digest(&value).unwrap());
    }
}
