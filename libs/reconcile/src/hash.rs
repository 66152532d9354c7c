//! Digests of offending user inputs.

use sha2::{Digest, Sha256};

/// SHA-256 digest of an input that was reported as a problem.
///
/// The notice tracker keeps one per reported notice, so a template or an
/// expression of any size costs a fixed 32 bytes to remember.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct InputDigest([u8; 32]);

impl InputDigest {
    fn digest(bytes: &[u8]) -> Self {
        let mut out = [0u8; 32];
        out.copy_from_slice(&Sha256::digest(bytes));
        Self(out)
    }

    /// Digest of a structured input. Object keys are sorted by
    /// `serde_json::Map`, so key order does not change the digest.
    pub fn of_json(value: &serde_json::Value) -> Self {
        Self::digest(value.to_string().as_bytes())
    }

    pub fn of_str(input: &str) -> Self {
        Self::digest(input.as_bytes())
    }
}

impl std::fmt::Display for InputDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sha256:{}", hex::encode(&self.0[..8]))
    }
}
