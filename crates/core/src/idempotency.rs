//! Deterministic idempotency keys: SHA-256 over a namespace and a stable
//! field tuple, truncated to 32 hex characters. Wall-clock never enters the
//! hash.

use sha2::{Digest, Sha256};

/// Derive an idempotency key from a namespace and ordered parts.
///
/// Parts are length-delimited before hashing so `["ab", "c"]` and
/// `["a", "bc"]` produce different keys.
pub fn derive_key(namespace: &str, parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(namespace.as_bytes());
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part.as_bytes());
    }
    let digest = hasher.finalize();
    hex::encode(&digest[..16])
}
