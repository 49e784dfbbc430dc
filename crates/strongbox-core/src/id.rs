//! Identifier and digest helpers.

use chrono::Utc;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Random UUID v4, used for audit record ids.
pub fn uuid() -> String {
    Uuid::new_v4().to_string()
}

/// `{prefix}_` followed by 24 random hex characters, e.g. `dk_3f9a...`.
pub fn prefixed(prefix: &str) -> String {
    let bytes: [u8; 12] = rand::random();
    format!("{prefix}_{}", hex::encode(bytes))
}

/// Hex SHA-256 digest.
pub fn sha256_hex(input: &[u8]) -> String {
    hex::encode(Sha256::digest(input))
}

/// Millisecond timestamp plus a random suffix. Ids sort by creation time.
pub fn timestamp_id() -> String {
    let suffix: [u8; 4] = rand::random();
    format!("{}-{}", Utc::now().format("%Y%m%d%H%M%S%3f"), hex::encode(suffix))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_prefixed_ids_are_unique() {
        let id = prefixed("dk");
        assert!(id.starts_with("dk_"));
        assert_eq!(id.len(), 3 + 24);
        assert_ne!(id, prefixed("dk"));
    }

    #[test]
    fn test_sha256_hex_known_vector() {
        assert_eq!(
            sha256_hex(b"hello"),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
    }

    #[test]
    fn test_timestamp_ids_sort_by_time() {
        let first = timestamp_id();
        std::thread::sleep(std::time::Duration::from_millis(2));
        let second = timestamp_id();
        assert!(first < second);
        assert_eq!(uuid().len(), 36);
    }
}
