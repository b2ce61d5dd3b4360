//! Document hashing for change detection.
//!
//! This module computes deterministic fingerprints of desired-state
//! documents and storage-safe digests of context keys. Object keys are
//! hashed in sorted order so that field order never changes a fingerprint.

use serde_json::Value;
use sha2::{Digest, Sha256};

/// Hasher for computing document fingerprints.
#[derive(Debug, Default, Clone, Copy)]
pub struct DocumentHasher;

impl DocumentHasher {
    /// Creates a new document hasher.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    /// Computes the fingerprint of a document.
    #[must_use]
    pub fn fingerprint(&self, document: &Value) -> String {
        let mut hasher = Sha256::new();
        Self::feed(&mut hasher, document);
        hex::encode(hasher.finalize())
    }

    /// Computes a digest of an arbitrary string, used for file names.
    #[must_use]
    pub fn digest(&self, input: &str) -> String {
        hex::encode(Sha256::digest(input.as_bytes()))
    }

    fn feed(hasher: &mut Sha256, value: &Value) {
        // Each variant gets a tag byte so that e.g. "1" and 1 differ.
        match value {
            Value::Null => hasher.update([0u8]),
            Value::Bool(b) => {
                hasher.update([1u8]);
                hasher.update([u8::from(*b)]);
            }
            Value::Number(n) => {
                hasher.update([2u8]);
                hasher.update(n.to_string().as_bytes());
            }
            Value::String(s) => {
                hasher.update([3u8]);
                hasher.update((s.len() as u64).to_be_bytes());
                hasher.update(s.as_bytes());
            }
            Value::Array(items) => {
                hasher.update([4u8]);
                hasher.update((items.len() as u64).to_be_bytes());
                for item in items {
                    Self::feed(hasher, item);
                }
            }
            Value::Object(map) => {
                hasher.update([5u8]);
                hasher.update((map.len() as u64).to_be_bytes());
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort_unstable();
                for key in keys {
                    hasher.update((key.len() as u64).to_be_bytes());
                    hasher.update(key.as_bytes());
                    Self::feed(hasher, &map[key]);
                }
            }
        }
    }

    /// Computes a short hash (first 8 characters) for display purposes.
    #[must_use]
    pub fn short_hash(&self, hash: &str) -> String {
        hash.chars().take(8).collect()
    }

    /// Compares two hashes in constant time.
    #[must_use]
    pub fn hashes_match(hash1: &str, hash2: &str) -> bool {
        if hash1.len() != hash2.len() {
            return false;
        }

        hash1
            .bytes()
            .zip(hash2.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
