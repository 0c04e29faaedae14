//! Content hashing used for drift detection.
//!
//! Hashes are computed over the JSON encoding of a value. All K8s object maps are `BTreeMap`s,
//! so the encoding, and therefore the hash, is deterministic for equal values.

use serde::Serialize;

use crate::error::Result;

/// Compute the content hash of the given value, rendered as 16 lowercase hex characters.
pub fn compute_hash<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let bytes = serde_json::to_vec(value)?;
    Ok(format!("{:016x}", seahash::hash(&bytes)))
}

/// Compute the content hash of the given string.
pub fn hash_str(value: &str) -> String {
    format!("{:016x}", seahash::hash(value.as_bytes()))
}

/// Compute a short 8 character hash of the given string, used for building object names.
pub fn short_hash(value: &str) -> String {
    let mut hash = hash_str(value);
    hash.truncate(8);
    hash
}

#[cfg(test)]
mod test {
    use std::collections::BTreeMap;

    use super::*;

    #[test]
    fn compute_hash_is_stable_for_equal_values() -> Result<()> {
        let mut a = BTreeMap::new();
        a.insert("b", 2);
        a.insert("a", 1);
        let mut b = BTreeMap::new();
        b.insert("a", 1);
        b.insert("b", 2);

        let (hash_a, hash_b) = (compute_hash(&a)?, compute_hash(&b)?);
        assert_eq!(hash_a, hash_b, "expected equal maps to hash equally");
        assert_eq!(hash_a.len(), 16, "expected 16 hex chars, got {}", hash_a);
        assert_ne!(hash_a, compute_hash(&BTreeMap::from([("a", 1)]))?, "expected different maps to hash differently");
        Ok(())
    }

    #[test]
    fn short_hash_is_eight_chars() {
        for input in ["", "default", "a-much-longer-namespace-name"] {
            let hash = short_hash(input);
            assert_eq!(hash.len(), 8, "expected 8 chars for {:?}, got {}", input, hash);
            assert!(hash_str(input).starts_with(&hash));
        }
    }
}
