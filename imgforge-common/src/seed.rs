//! Seeds for the planner's pseudorandom stream.

use crate::error::CommonError;
use sha2::{Digest, Sha256};

/// Environment variable consulted by [`seed_from_env`].
pub const SEED_ENV: &str = "IMGFORGE_RNG_SEED";

/// Seed used when none is supplied.
pub const DEFAULT_SEED: i64 = 0;

pub fn parse_seed(var: &str, value: &str) -> Result<i64, CommonError> {
    value
        .trim()
        .parse::<i64>()
        .map_err(|e| CommonError::InvalidSeed {
            var: var.to_string(),
            value: value.to_string(),
            reason: e.to_string(),
        })
}

/// Read the seed from [`SEED_ENV`], falling back to [`DEFAULT_SEED`].
pub fn seed_from_env() -> Result<i64, CommonError> {
    match std::env::var(SEED_ENV) {
        Ok(value) => parse_seed(SEED_ENV, &value),
        Err(_) => Ok(DEFAULT_SEED),
    }
}

/// Derive a per-job seed from a base seed and the job's identifying parts.
///
/// Jobs that differ in any part get unrelated streams while staying
/// reproducible for the same base seed.
pub fn derive_seed(base: i64, parts: &[&str]) -> i64 {
    let mut hasher = Sha256::new();
    hasher.update(base.to_le_bytes());
    for part in parts {
        hasher.update(part.as_bytes());
        hasher.update([0u8]);
    }
    let digest = hasher.finalize();
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    i64::from_le_bytes(bytes)
}
