//! Tests for Store
//!
//! These tests verify:
//! - Basic put/get/delete/drop across named indices
//! - Each commit advances the counter by one
//! - Durability across reopen
//! - Prepare/commit/abort and implicit abort on drop
//! - Read-only and closed stores refuse writes
//! - Fatal errors disable further writes; oversized records do not

use std::path::Path;

use keelstore::storage::BackingFile;
use keelstore::{
    AddressCodec, HistoryRetention, KeelError, PendingWrites, Store, StoreConfig, StoreType,
    NULL_ADDR,
};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn config(dir: &TempDir, store_type: StoreType) -> StoreConfig {
    StoreConfig::builder()
        .path(dir.path().join("store.jnl"))
        .store_type(store_type)
        .history_retention(HistoryRetention::Commits(4))
        .htree_bucket_capacity(8)
        .build()
}

fn open(dir: &TempDir, store_type: StoreType) -> Store {
    Store::open(config(dir, store_type)).unwrap()
}

fn put(store: &Store, index: &str, key: &str, value: &str) {
    let mut writes = PendingWrites::new();
    writes.put(index, key, value);
    store.commit(writes).unwrap();
}

/// Edit a WORM record's payload in place and reseal its checksum
fn rewrite_record(path: &Path, addr: u64, edit: impl FnOnce(&mut Vec<u8>)) {
    let codec = AddressCodec::worm(42).unwrap();
    let (offset, nbytes) = codec.decode(addr).unwrap();
    let bytes = std::fs::read(path).unwrap();
    let start = offset as usize;
    let end = start + nbytes as usize - 4;
    let mut payload = bytes[start..end].to_vec();
    edit(&mut payload);
    payload.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());

    let (file, _) = BackingFile::open(path, false, false).unwrap();
    file.write_at(&payload, offset).unwrap();
    file.sync().unwrap();
}

fn get(store: &Store, index: &str, key: &str) -> Option<String> {
    store
        .get(index, key.as_bytes())
        .unwrap()
        .map(|v| String::from_utf8(v).unwrap())
}

// =============================================================================
// Basic Operations
// =============================================================================

#[test]
fn test_new_store_is_empty() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Worm);

    let rb = store.current_root_block();

    assert!(store.recovery_report().is_none());
    assert_eq!(rb.commit_counter(), 0);
    assert_eq!(rb.commit_record_addr(), NULL_ADDR);
    assert_eq!(get(&store, "users", "alice"), None);
    assert!(store.snapshot().unwrap().index_names().is_empty());
    assert!(store.commit_history().unwrap().is_empty());
}

#[test]
fn test_put_get_delete() {
    for store_type in [StoreType::Worm, StoreType::Rw] {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, store_type);

        put(&store, "users", "alice", "1");
        put(&store, "users", "bob", "2");
        assert_eq!(get(&store, "users", "alice"), Some("1".to_string()));

        let mut writes = PendingWrites::new();
        writes.delete("users", "alice").put("users", "bob", "3");
        store.commit(writes).unwrap();

        assert_eq!(get(&store, "users", "alice"), None, "{}", store_type);
        assert_eq!(get(&store, "users", "bob"), Some("3".to_string()));
    }
}

#[test]
fn test_indices_are_independent() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Worm);

    let mut writes = PendingWrites::new();
    writes.put("a", "k", "in a").put("b", "k", "in b");
    store.commit(writes).unwrap();

    assert_eq!(get(&store, "a", "k"), Some("in a".to_string()));
    assert_eq!(get(&store, "b", "k"), Some("in b".to_string()));
    assert_eq!(store.snapshot().unwrap().index_names(), vec!["a", "b"]);
}

#[test]
fn test_later_put_in_batch_wins() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Worm);

    let mut writes = PendingWrites::new();
    writes.put("i", "k", "first").put("i", "k", "second");
    store.commit(writes).unwrap();

    assert_eq!(get(&store, "i", "k"), Some("second".to_string()));
}

#[test]
fn test_delete_from_missing_index_is_noop() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Worm);

    let mut writes = PendingWrites::new();
    writes.delete("ghost", "k");
    store.commit(writes).unwrap();

    assert!(store.snapshot().unwrap().index_names().is_empty());
}

#[test]
fn test_drop_index() {
    for store_type in [StoreType::Worm, StoreType::Rw] {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, store_type);
        put(&store, "doomed", "k", "v");
        put(&store, "kept", "k", "v");

        let mut writes = PendingWrites::new();
        writes.drop_index("doomed");
        store.commit(writes).unwrap();

        assert_eq!(get(&store, "doomed", "k"), None);
        assert_eq!(get(&store, "kept", "k"), Some("v".to_string()));
        assert_eq!(store.snapshot().unwrap().index_names(), vec!["kept"]);
    }
}

#[test]
fn test_many_keys_in_one_commit() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Rw);

    let mut writes = PendingWrites::new();
    for i in 0..2_000 {
        writes.put("bulk", format!("key_{}", i), format!("value_{}", i));
    }
    store.commit(writes).unwrap();

    let snapshot = store.snapshot().unwrap();
    for i in (0..2_000).step_by(97) {
        let value = snapshot.get("bulk", format!("key_{}", i).as_bytes()).unwrap();
        assert_eq!(value, Some(format!("value_{}", i).into_bytes()));
    }
    let stats = snapshot.validate_index("bulk").unwrap().unwrap();
    assert_eq!(stats.entries, 2_000);
    assert_eq!(snapshot.scan("bulk").unwrap().len(), 2_000);
    assert!(snapshot.validate_index("missing").unwrap().is_none());
}

// =============================================================================
// Commit Counter and Durability
// =============================================================================

#[test]
fn test_each_commit_advances_counter_by_one() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Worm);

    for expected in 1..=5u64 {
        let rb = store.commit(PendingWrites::new()).unwrap();
        assert_eq!(rb.commit_counter(), expected);
        assert_eq!(rb.slot(), (expected % 2) as usize);
    }
}

#[test]
fn test_commit_times_strictly_increase() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Worm);

    let mut last = 0;
    for _ in 0..20 {
        let rb = store.commit(PendingWrites::new()).unwrap();
        assert!(rb.last_commit_time() > last);
        last = rb.last_commit_time();
    }
}

#[test]
fn test_reopen_sees_committed_state() {
    for store_type in [StoreType::Worm, StoreType::Rw] {
        let dir = TempDir::new().unwrap();
        let uuid = {
            let store = open(&dir, store_type);
            for i in 0..50 {
                put(&store, "data", &format!("k{}", i), &format!("v{}", i));
            }
            store.uuid()
        };

        let store = open(&dir, store_type);

        assert_eq!(store.uuid(), uuid);
        assert_eq!(store.current_root_block().commit_counter(), 50);
        assert!(store.recovery_report().unwrap().is_clean());
        for i in 0..50 {
            assert_eq!(get(&store, "data", &format!("k{}", i)), Some(format!("v{}", i)));
        }

        // And keeps accepting commits
        put(&store, "data", "after", "reopen");
        assert_eq!(get(&store, "data", "after"), Some("reopen".to_string()));
    }
}

#[test]
fn test_stored_settings_win_over_config() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir, StoreType::Worm);
        put(&store, "i", "k", "v");
    }

    let mut reopen = config(&dir, StoreType::Rw);
    reopen.offset_bits = 40;
    let store = Store::open(reopen).unwrap();

    assert_eq!(store.store_type(), StoreType::Worm);
    assert_eq!(store.current_root_block().offset_bits(), 42);
    assert_eq!(get(&store, "i", "k"), Some("v".to_string()));
}

#[test]
fn test_quorum_token() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Worm);
    assert_eq!(store.current_root_block().quorum_token(), -1);

    let rb = store.commit(PendingWrites::new().with_quorum_token(7)).unwrap();
    assert_eq!(rb.quorum_token(), 7);

    // Carried forward when a commit does not supply one
    let rb = store.commit(PendingWrites::new()).unwrap();
    assert_eq!(rb.quorum_token(), 7);
}

// =============================================================================
// Commit Ordering
// =============================================================================

#[test]
fn test_explicit_commit_time_must_increase() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Worm);
    store.commit(PendingWrites::new().with_commit_time(1_000)).unwrap();

    let err = store
        .commit(PendingWrites::new().with_commit_time(1_000))
        .unwrap_err();

    assert!(matches!(err, KeelError::CommitOrder { last: 1_000, attempted: 1_000 }));
    assert!(!store.is_poisoned());

    let rb = store.commit(PendingWrites::new().with_commit_time(1_001)).unwrap();
    assert_eq!(rb.commit_counter(), 2);
}

// =============================================================================
// Prepare / Abort
// =============================================================================

#[test]
fn test_prepare_then_commit() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Rw);
    put(&store, "i", "k", "old");

    let mut writes = PendingWrites::new();
    writes.put("i", "k", "new");
    let prepared = store.prepare(writes.with_commit_time(u64::MAX / 2)).unwrap();

    assert_eq!(prepared.commit_counter(), 2);
    assert_eq!(prepared.commit_time(), u64::MAX / 2);
    assert_ne!(prepared.commit_record_addr(), NULL_ADDR);

    let rb = prepared.commit().unwrap();
    assert_eq!(rb.commit_counter(), 2);
    assert_eq!(get(&store, "i", "k"), Some("new".to_string()));
}

#[test]
fn test_abort_discards_prepared_writes() {
    for store_type in [StoreType::Worm, StoreType::Rw] {
        let dir = TempDir::new().unwrap();
        let store = open(&dir, store_type);
        put(&store, "i", "k", "old");

        let mut writes = PendingWrites::new();
        writes.put("i", "k", "new").put("i", "other", "x");
        store.prepare(writes).unwrap().abort();

        assert_eq!(get(&store, "i", "k"), Some("old".to_string()));
        assert_eq!(get(&store, "i", "other"), None);
        assert_eq!(store.metrics().aborted_commits, 1);

        let rb = store.commit(PendingWrites::new()).unwrap();
        assert_eq!(rb.commit_counter(), 2);
        assert_eq!(get(&store, "i", "k"), Some("old".to_string()));
    }
}

#[test]
fn test_dropping_prepared_commit_aborts() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Rw);
    put(&store, "i", "k", "old");

    {
        let mut writes = PendingWrites::new();
        writes.put("i", "k", "new");
        let _prepared = store.prepare(writes).unwrap();
    }

    assert_eq!(get(&store, "i", "k"), Some("old".to_string()));
    assert_eq!(store.current_root_block().commit_counter(), 1);
    put(&store, "i", "k", "newer");
    assert_eq!(get(&store, "i", "k"), Some("newer".to_string()));
}

// =============================================================================
// Write Restrictions
// =============================================================================

#[test]
fn test_read_only_store() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir, StoreType::Worm);
        put(&store, "i", "k", "v");
    }

    let ro = StoreConfig::builder()
        .path(dir.path().join("store.jnl"))
        .read_only(true)
        .build();
    let store = Store::open(ro).unwrap();

    assert_eq!(get(&store, "i", "k"), Some("v".to_string()));
    assert!(matches!(store.commit(PendingWrites::new()), Err(KeelError::WritesDisabled(_))));
    assert!(matches!(store.close_for_writes(), Err(KeelError::WritesDisabled(_))));
}

#[test]
fn test_missing_file_without_create() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::builder()
        .path(dir.path().join("absent.jnl"))
        .create_if_missing(false)
        .build();

    assert!(matches!(Store::open(config), Err(KeelError::Config(_))));
    assert!(!dir.path().join("absent.jnl").exists());
}

#[test]
fn test_invalid_config_rejected() {
    let dir = TempDir::new().unwrap();
    let config = StoreConfig::builder()
        .path(dir.path().join("store.jnl"))
        .htree_address_bits(0)
        .build();

    assert!(matches!(Store::open(config), Err(KeelError::Config(_))));
}

#[test]
fn test_close_for_writes() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir, StoreType::Worm);
        put(&store, "i", "k", "v");
        let rb = store.close_for_writes().unwrap();
        assert!(rb.close_time() > 0);
        assert_eq!(rb.commit_counter(), 2);
        assert!(matches!(store.commit(PendingWrites::new()), Err(KeelError::WritesDisabled(_))));
    }

    let store = open(&dir, StoreType::Worm);

    assert!(store.current_root_block().close_time() > 0);
    assert_eq!(get(&store, "i", "k"), Some("v".to_string()));
    assert!(matches!(store.commit(PendingWrites::new()), Err(KeelError::WritesDisabled(_))));
}

#[test]
fn test_oversized_value_leaves_store_writable() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Worm);
    put(&store, "i", "small", "v");

    // 42 offset bits leave 22 bits of record length (4 MB)
    let mut writes = PendingWrites::new();
    writes.put("i", "big", vec![7u8; 5 * 1024 * 1024]);
    let err = store.commit(writes).unwrap_err();

    assert!(matches!(err, KeelError::RecordTooLarge { .. }));
    assert!(!store.is_poisoned());
    assert_eq!(store.current_root_block().commit_counter(), 1);
    put(&store, "i", "after", "ok");
    assert_eq!(get(&store, "i", "after"), Some("ok".to_string()));
    assert_eq!(get(&store, "i", "small"), Some("v".to_string()));
    assert_eq!(store.get("i", b"big").unwrap(), None);
}

#[test]
fn test_offset_bits_too_wide_for_pages() {
    let dir = TempDir::new().unwrap();
    // 48 offset bits leave 64 KB records; a 2^16 entry directory needs more
    let config = StoreConfig::builder()
        .path(dir.path().join("store.jnl"))
        .offset_bits(48)
        .htree_address_bits(16)
        .build();

    assert!(matches!(config.validate(), Err(KeelError::Config(_))));
    assert!(matches!(Store::open(config), Err(KeelError::Config(_))));
}

#[test]
fn test_stored_layout_checked_on_open() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.jnl");
    Store::open(StoreConfig::builder().path(&path).offset_bits(48).build()).unwrap();

    // The stored 48 bits win over the configured 42, so the wide directory
    // no longer fits
    let config = StoreConfig::builder()
        .path(&path)
        .offset_bits(42)
        .htree_address_bits(16)
        .build();
    assert!(config.validate().is_ok());

    assert!(matches!(Store::open(config), Err(KeelError::Config(_))));
}

#[test]
fn test_fatal_error_poisons_store() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("store.jnl");
    let store = open(&dir, StoreType::Worm);
    put(&store, "i", "k", "v");
    put(&store, "other", "k", "kept");

    // Rewrite the root directory of "i" with an impossible depth and a
    // matching checksum: the record reads fine, the page is corrupt
    let root = store.snapshot().unwrap().commit_record().root("i").unwrap();
    rewrite_record(&path, root, |page| page[1] = 17);

    let mut writes = PendingWrites::new();
    writes.put("i", "k2", "v2");
    let err = store.commit(writes).unwrap_err();

    assert!(matches!(err, KeelError::StructuralInvariantViolation(_)));
    assert!(err.is_fatal());
    assert!(store.is_poisoned());
    assert!(store.poison_reason().is_some());
    assert!(matches!(store.commit(PendingWrites::new()), Err(KeelError::WritesDisabled(_))));
    // Reads outside the corrupt index still work
    assert_eq!(get(&store, "other", "k"), Some("kept".to_string()));
    assert!(matches!(
        store.get("i", b"k"),
        Err(KeelError::StructuralInvariantViolation(_))
    ));
}

// =============================================================================
// Metrics
// =============================================================================

#[test]
fn test_metrics() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, StoreType::Worm);

    let mut writes = PendingWrites::new();
    for i in 0..100 {
        writes.put("i", format!("k{}", i), "v");
    }
    store.commit(writes).unwrap();
    let snapshot = store.snapshot().unwrap();
    snapshot.get("i", b"k1").unwrap();
    snapshot.get("i", b"absent").unwrap();

    let metrics = store.metrics();
    assert_eq!(metrics.commits, 1);
    assert!(metrics.records_written > 0);
    assert!(metrics.bytes_written > 0);
    assert!(metrics.splits > 0);
    assert_eq!(metrics.lookups, 2);
    assert_eq!(metrics.hits, 1);
    assert_eq!(metrics.misses, 1);
    assert_eq!(metrics.snapshots_opened, 1);
    assert_eq!(store.open_snapshots(), 1);

    drop(snapshot);
    assert_eq!(store.open_snapshots(), 0);
}
