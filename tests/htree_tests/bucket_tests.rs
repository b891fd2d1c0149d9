//! Tests for BucketPage
//!
//! These tests verify:
//! - Insert, replace and remove
//! - Splitting by a hash bit
//! - Encoding and rejection of damaged pages

use keelstore::htree::{hash_key, BucketPage, Page};
use keelstore::KeelError;

// =============================================================================
// Helper Functions
// =============================================================================

fn bucket_with(count: usize) -> BucketPage {
    let mut bucket = BucketPage::new();
    for i in 0..count {
        bucket.insert(format!("key_{}", i).into_bytes(), format!("value_{}", i).into_bytes());
    }
    bucket
}

// =============================================================================
// Mutation
// =============================================================================

#[test]
fn test_insert_and_replace() {
    let mut bucket = BucketPage::new();

    assert_eq!(bucket.insert(b"k".to_vec(), b"v1".to_vec()), None);
    assert_eq!(bucket.insert(b"k".to_vec(), b"v2".to_vec()), Some(b"v1".to_vec()));

    assert_eq!(bucket.len(), 1);
    assert_eq!(bucket.get(b"k"), Some(&b"v2"[..]));
}

#[test]
fn test_remove() {
    let mut bucket = bucket_with(3);

    assert_eq!(bucket.remove(b"key_1"), Some(b"value_1".to_vec()));
    assert_eq!(bucket.remove(b"key_1"), None);
    assert!(!bucket.contains(b"key_1"));
    assert_eq!(bucket.len(), 2);
}

#[test]
fn test_empty_value_is_stored() {
    let mut bucket = BucketPage::new();
    bucket.insert(b"empty".to_vec(), Vec::new());

    assert_eq!(bucket.get(b"empty"), Some(&b""[..]));
}

// =============================================================================
// Split
// =============================================================================

#[test]
fn test_split_partitions_by_hash_bit() {
    let bucket = bucket_with(64);

    for bit in [0u32, 5, 31] {
        let (low, high) = bucket.clone().split(bit);

        assert_eq!(low.len() + high.len(), 64);
        for (key, _) in low.entries() {
            assert_eq!((hash_key(key) >> (31 - bit)) & 1, 0);
        }
        for (key, _) in high.entries() {
            assert_eq!((hash_key(key) >> (31 - bit)) & 1, 1);
        }
    }
}

// =============================================================================
// Encoding
// =============================================================================

#[test]
fn test_encode_layout() {
    let mut bucket = BucketPage::new();
    bucket.insert(b"ab".to_vec(), b"xyz".to_vec());

    let bytes = bucket.encode();

    assert_eq!(bytes[0], 0);
    assert_eq!(&bytes[1..5], &1u32.to_le_bytes());
    assert_eq!(&bytes[5..9], &2u32.to_le_bytes());
    assert_eq!(&bytes[9..13], &3u32.to_le_bytes());
    assert_eq!(&bytes[13..], b"abxyz");
}

#[test]
fn test_encode_decode() {
    let bucket = bucket_with(10);

    let decoded = BucketPage::decode(&bucket.encode()).unwrap();

    assert_eq!(decoded, bucket);
    assert!(Page::decode(&bucket.encode()).unwrap().is_bucket());
}

#[test]
fn test_decode_truncated() {
    let bytes = bucket_with(2).encode();

    let err = BucketPage::decode(&bytes[..bytes.len() - 1]).unwrap_err();

    assert!(matches!(err, KeelError::StructuralInvariantViolation(_)));
}

#[test]
fn test_decode_trailing_bytes() {
    let mut bytes = bucket_with(2).encode();
    bytes.push(0);

    let err = BucketPage::decode(&bytes).unwrap_err();

    assert!(matches!(err, KeelError::StructuralInvariantViolation(_)));
}

#[test]
fn test_decode_wrong_kind() {
    let err = BucketPage::decode(&[1, 0, 0, 0, 0]).unwrap_err();

    assert!(matches!(err, KeelError::StructuralInvariantViolation(_)));
}
