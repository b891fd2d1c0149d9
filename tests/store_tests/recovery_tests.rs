//! Tests for Store recovery
//!
//! These tests verify:
//! - A corrupted or torn current root block falls back to the previous commit
//! - A store with no valid root block cannot be opened
//! - Records written by a commit that never flipped its root block are ignored

use std::fs::OpenOptions;
use std::path::Path;

use keelstore::root_block::{slot_offset, OFF_CHALLIS_TAIL, OFF_RESERVED};
use keelstore::storage::BackingFile;
use keelstore::{KeelError, PendingWrites, Store, StoreConfig, StoreType};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(path: &Path, store_type: StoreType) -> StoreConfig {
    StoreConfig::builder().path(path).store_type(store_type).build()
}

fn put(store: &Store, key: &str, value: &str) {
    let mut writes = PendingWrites::new();
    writes.put("data", key, value);
    store.commit(writes).unwrap();
}

fn get(store: &Store, key: &str) -> Option<Vec<u8>> {
    store.get("data", key.as_bytes()).unwrap()
}

/// Overwrite bytes of the store file in place
fn patch(path: &Path, offset: u64, bytes: &[u8]) {
    let (file, _) = BackingFile::open(path, false, false).unwrap();
    file.write_at(bytes, offset).unwrap();
    file.sync().unwrap();
}

/// Two commits: "k" = "v1" at counter 1, "k" = "v2" at counter 2 (slot 0)
fn two_commits(path: &Path, store_type: StoreType) {
    let store = Store::open(config(path, store_type)).unwrap();
    put(&store, "k", "v1");
    put(&store, "k", "v2");
    assert_eq!(store.current_root_block().slot(), 0);
}

// =============================================================================
// Root Block Fallback
// =============================================================================

#[test]
fn test_corrupted_current_root_block_falls_back() {
    for store_type in [StoreType::Worm, StoreType::Rw] {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.jnl");
        two_commits(&path, store_type);

        patch(&path, slot_offset(0) + OFF_RESERVED as u64, &[0x5A]);
        let store = Store::open(config(&path, store_type)).unwrap();

        let report = store.recovery_report().unwrap();
        assert_eq!(report.chosen_slot, 1);
        assert_eq!(report.rejected.len(), 1);
        assert_eq!(store.current_root_block().commit_counter(), 1);
        assert_eq!(get(&store, "k"), Some(b"v1".to_vec()), "{}", store_type);
    }
}

#[test]
fn test_torn_current_root_block_falls_back() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.jnl");
    two_commits(&path, StoreType::Worm);

    patch(&path, slot_offset(0) + OFF_CHALLIS_TAIL as u64, &u64::MAX.to_le_bytes());
    let store = Store::open(config(&path, StoreType::Worm)).unwrap();

    assert_eq!(store.recovery_report().unwrap().torn_slots, vec![0]);
    assert_eq!(get(&store, "k"), Some(b"v1".to_vec()));
}

#[test]
fn test_commit_after_fallback_overwrites_bad_slot() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.jnl");
    two_commits(&path, StoreType::Worm);
    patch(&path, slot_offset(0), b"JUNK");

    {
        let store = Store::open(config(&path, StoreType::Worm)).unwrap();
        put(&store, "k", "v3");
        assert_eq!(store.current_root_block().commit_counter(), 2);
    }

    let store = Store::open(config(&path, StoreType::Worm)).unwrap();
    assert!(store.recovery_report().unwrap().is_clean());
    assert_eq!(get(&store, "k"), Some(b"v3".to_vec()));
}

#[test]
fn test_both_root_blocks_corrupted() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.jnl");
    two_commits(&path, StoreType::Worm);

    patch(&path, slot_offset(0), b"JUNK");
    patch(&path, slot_offset(1), b"JUNK");

    let err = Store::open(config(&path, StoreType::Worm)).err().unwrap();
    assert!(matches!(err, KeelError::Unrecoverable(_)));
}

#[test]
fn test_short_garbage_file_is_unrecoverable() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.jnl");
    std::fs::write(&path, b"definitely not a store").unwrap();

    let err = Store::open(config(&path, StoreType::Worm)).err().unwrap();

    assert!(matches!(err, KeelError::Unrecoverable(_)));
}

#[test]
fn test_truncated_data_area_is_detected() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.jnl");
    two_commits(&path, StoreType::Worm);

    OpenOptions::new()
        .write(true)
        .open(&path)
        .unwrap()
        .set_len(slot_offset(1) + 256)
        .unwrap();

    let err = Store::open(config(&path, StoreType::Worm)).err().unwrap();
    assert!(matches!(err, KeelError::RecordCorrupted { .. }));
}

// =============================================================================
// Interrupted Commits
// =============================================================================

#[test]
fn test_crash_after_prepare_is_invisible() {
    for store_type in [StoreType::Worm, StoreType::Rw] {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("store.jnl");
        {
            let store = Store::open(config(&path, store_type)).unwrap();
            put(&store, "k", "committed");

            let mut writes = PendingWrites::new();
            writes.put("data", "k", "prepared").put("data", "extra", "x");
            let prepared = store.prepare(writes).unwrap();
            // Process stops before the root block is written
            std::mem::forget(prepared);
        }

        let store = Store::open(config(&path, store_type)).unwrap();

        assert!(store.recovery_report().unwrap().is_clean());
        assert_eq!(store.current_root_block().commit_counter(), 1);
        assert_eq!(get(&store, "k"), Some(b"committed".to_vec()));
        assert_eq!(get(&store, "extra"), None);

        put(&store, "k", "after");
        assert_eq!(get(&store, "k"), Some(b"after".to_vec()));
    }
}

#[test]
fn test_fresh_store_survives_reopen_without_commits() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.jnl");
    let uuid = Store::open(config(&path, StoreType::Rw)).unwrap().uuid();

    let store = Store::open(config(&path, StoreType::Rw)).unwrap();

    assert_eq!(store.uuid(), uuid);
    assert_eq!(store.current_root_block().commit_counter(), 0);
    assert_eq!(store.recovery_report().unwrap().chosen_slot, 0);
    put(&store, "k", "v");
    assert_eq!(get(&store, "k"), Some(b"v".to_vec()));
}
