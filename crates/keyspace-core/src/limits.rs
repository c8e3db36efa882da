//! Key and value size limits enforced by the tuple and record codecs.
//!
//! Per the KV-store contract, keys are bounded to 10 KiB and a single
//! value is bounded to roughly 90 KiB before the record codec must switch
//! to external blob chunking (§4.B, §6).

use thiserror::Error;

/// Size limits enforced by the codecs. Defaults match the KV-store contract;
/// callers may relax them for an alternate backing store.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum encoded key length in bytes.
    pub max_key_bytes: usize,
    /// Inline value threshold; payloads at or under this size are stored
    /// directly in the item slot. Larger payloads are chunked externally.
    pub inline_value_threshold: usize,
    /// Size of each external blob chunk.
    pub blob_chunk_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Limits {
            max_key_bytes: 10 * 1024,
            inline_value_threshold: 90 * 1024,
            blob_chunk_size: 90 * 1024,
        }
    }
}

impl Limits {
    /// Limits scaled down for tests that need to exercise chunking or
    /// key-length rejection without allocating megabytes of data.
    pub fn with_small_limits() -> Self {
        Limits {
            max_key_bytes: 64,
            inline_value_threshold: 256,
            blob_chunk_size: 128,
        }
    }

    pub fn validate_key(&self, key: &[u8]) -> Result<(), LimitError> {
        if key.len() > self.max_key_bytes {
            return Err(LimitError::KeyTooLong {
                actual: key.len(),
                max: self.max_key_bytes,
            });
        }
        Ok(())
    }

    /// Returns true when a serialized payload must be externally chunked.
    pub fn requires_external_storage(&self, payload_len: usize) -> bool {
        payload_len > self.inline_value_threshold
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum LimitError {
    #[error("key too long: {actual} bytes exceeds maximum {max}")]
    KeyTooLong { actual: usize, max: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_at_max_length_is_valid() {
        let limits = Limits::with_small_limits();
        let key = vec![0u8; limits.max_key_bytes];
        assert!(limits.validate_key(&key).is_ok());
    }

    #[test]
    fn key_over_max_length_is_rejected() {
        let limits = Limits::with_small_limits();
        let key = vec![0u8; limits.max_key_bytes + 1];
        assert_eq!(
            limits.validate_key(&key),
            Err(LimitError::KeyTooLong {
                actual: limits.max_key_bytes + 1,
                max: limits.max_key_bytes
            })
        );
    }

    #[test]
    fn payload_under_threshold_is_inline() {
        let limits = Limits::with_small_limits();
        assert!(!limits.requires_external_storage(limits.inline_value_threshold));
        assert!(limits.requires_external_storage(limits.inline_value_threshold + 1));
    }

    #[test]
    fn default_limits_match_kv_store_contract() {
        let limits = Limits::default();
        assert_eq!(limits.max_key_bytes, 10 * 1024);
        assert_eq!(limits.inline_value_threshold, 90 * 1024);
    }
}
