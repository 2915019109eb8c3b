//! SHA-256 key hashing.

use sha2::{Digest, Sha256};

/// Compute the lookup hash of a raw API key (hex-encoded SHA-256).
///
/// Only this hash is ever stored; the raw key cannot be recovered from it.
pub fn hash_api_key(raw_key: &str) -> String {
    let hash = Sha256::digest(raw_key.trim().as_bytes());
    hex::encode(hash)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_empty_key() {
        // SHA-256 of empty string
        assert_eq!(
            hash_api_key(""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn test_hash_is_deterministic() {
        let hash1 = hash_api_key("kw_test-key-1");
        let hash2 = hash_api_key("kw_test-key-1");
        let hash3 = hash_api_key("kw_test-key-2");

        assert_eq!(hash1, hash2);
        assert_ne!(hash1, hash3);
        // Output is 64 hex chars (256 bits)
        assert_eq!(hash1.len(), 64);
    }

    #[test]
    fn test_hash_ignores_surrounding_whitespace() {
        assert_eq!(hash_api_key("  kw_abc \n"), hash_api_key("kw_abc"));
    }
}
