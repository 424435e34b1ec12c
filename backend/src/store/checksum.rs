//! Content checksums for published values.

use sha2::{Digest, Sha256};

/// SHA-256 of the canonical JSON encoding of `value`, hex encoded.
///
/// `serde_json::Value` objects keep their keys sorted, so equal values give
/// equal checksums regardless of construction order.
pub fn value_checksum(value: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_checksum_ignores_key_order() {
        let a = json!({"flux": 1.0, "name": "CC_1"});
        let b = json!({"name": "CC_1", "flux": 1.0});
        assert_eq!(value_checksum(&a), value_checksum(&b));
        assert_eq!(value_checksum(&a).len(), 64);
    }

    #[test]
    fn test_different_values_differ() {
        assert_ne!(
            value_checksum(&json!({"flux": 1.0})),
            value_checksum(&json!({"flux": 2.0}))
        );
    }
}
