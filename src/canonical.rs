//! Canonical serialization for deterministic hashing.
//!
//! Virtual topic ids and topic set fingerprints are derived here, so the
//! same inputs must always hash to the same value.
//!
//! ## Determinism Guarantees
//!
//! - Stable field order: Struct fields serialize in declaration order
//! - Stable Vec order: Vectors serialize in index order
//! - No HashMap allowed: Use BTreeMap for maps in hashed data

use serde::Serialize;
use xxhash_rust::xxh64::xxh64;

/// Serialize a value to canonical JSON bytes for hashing.
///
/// Serialization of the plain data structs hashed by this crate cannot
/// fail; a failure degrades to hashing the empty input.
fn to_canonical_bytes<T: Serialize>(value: &T) -> Vec<u8> {
    serde_json::to_vec(value).unwrap_or_default()
}

/// Compute canonical hash of a serializable value.
pub fn canonical_hash<T: Serialize>(value: &T) -> u64 {
    let bytes = to_canonical_bytes(value);
    xxh64(&bytes, 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[derive(Serialize)]
    struct Membership {
        root: i64,
        members: Vec<i64>,
    }

    #[test]
    fn test_determinism() {
        let m = Membership { root: 1, members: vec![1, 2, 5] };

        let h1 = canonical_hash(&m);
        let h2 = canonical_hash(&m);
        assert_eq!(h1, h2);
        assert_eq!(to_canonical_bytes(&m), br#"{"root":1,"members":[1,2,5]}"#.to_vec());
    }

    #[test]
    fn test_btreemap_order_independent_of_insertion() {
        let mut a = BTreeMap::new();
        a.insert(2, "b");
        a.insert(1, "a");
        let mut b = BTreeMap::new();
        b.insert(1, "a");
        b.insert(2, "b");
        assert_eq!(canonical_hash(&a), canonical_hash(&b));
    }
}
