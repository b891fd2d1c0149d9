//! Tests for RW space reclamation
//!
//! These tests verify:
//! - Superseded records are reused once outside the retained history
//! - KeepAll never reuses space
//! - Open snapshots hold back reclamation
//! - Released history is reported, not silently misread
//! - Allocator state survives reopen

use keelstore::{HistoryRetention, KeelError, PendingWrites, Store, StoreConfig, StoreType};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn open(dir: &TempDir, retention: HistoryRetention) -> Store {
    let config = StoreConfig::builder()
        .path(dir.path().join("store.jnl"))
        .store_type(StoreType::Rw)
        .history_retention(retention)
        .build();
    Store::open(config).unwrap()
}

fn put_at(store: &Store, timestamp: u64, value: &[u8]) {
    let mut writes = PendingWrites::new();
    writes.put("data", "k", value);
    store.commit(writes.with_commit_time(timestamp)).unwrap();
}

/// Rewrite one key `commits` times; returns the final file extent
fn churn(store: &Store, commits: u64) -> u64 {
    for i in 1..=commits {
        put_at(store, i * 10, &[i as u8; 300]);
    }
    store.current_root_block().next_offset()
}

// =============================================================================
// Reuse
// =============================================================================

#[test]
fn test_retained_window_reuses_space() {
    let keep_all_dir = TempDir::new().unwrap();
    let keep_all = open(&keep_all_dir, HistoryRetention::KeepAll);
    let reclaim_dir = TempDir::new().unwrap();
    let reclaim = open(&reclaim_dir, HistoryRetention::Commits(1));

    let keep_all_extent = churn(&keep_all, 60);
    let reclaim_extent = churn(&reclaim, 60);

    assert!(
        reclaim_extent < keep_all_extent,
        "reclaiming store grew to {}, keep-all store to {}",
        reclaim_extent,
        keep_all_extent
    );
    assert!(reclaim.metrics().records_reclaimed > 0);
    assert_eq!(keep_all.metrics().records_reclaimed, 0);
    assert_eq!(keep_all.release_horizon(), 0);
}

#[test]
fn test_reclaiming_store_stays_small() {
    let keep_all_dir = TempDir::new().unwrap();
    let keep_all = open(&keep_all_dir, HistoryRetention::KeepAll);
    let reclaim_dir = TempDir::new().unwrap();
    let reclaim = open(&reclaim_dir, HistoryRetention::Commits(2));

    let keep_all_extent = churn(&keep_all, 120);
    let reclaim_extent = churn(&reclaim, 120);

    // Only the last few commits stay live; keep-all holds every version
    assert!(reclaim_extent * 2 < keep_all_extent);
    assert_eq!(reclaim.get("data", b"k").unwrap(), Some(vec![120u8; 300]));
}

#[test]
fn test_horizon_follows_retention() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, HistoryRetention::Commits(3));

    churn(&store, 10);

    // Building commit 10 kept commits 8, 9 and 10
    assert_eq!(store.release_horizon(), 8);
    assert!(store.read_as_of(80).is_ok());
    assert!(matches!(
        store.read_as_of(70).err(),
        Some(KeelError::HistoryReleased(7))
    ));
}

// =============================================================================
// Snapshots
// =============================================================================

#[test]
fn test_open_snapshot_holds_back_reclamation() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, HistoryRetention::Commits(1));
    put_at(&store, 10, b"pinned value");

    let snapshot = store.snapshot().unwrap();
    for i in 2..=30u64 {
        put_at(&store, i * 10, &[i as u8; 300]);
    }

    assert!(store.release_horizon() <= snapshot.commit_counter());
    assert_eq!(snapshot.get("data", b"k").unwrap(), Some(b"pinned value".to_vec()));
    assert!(snapshot.validate_index("data").unwrap().is_some());

    // Once released, the horizon catches up on the next commit
    let pinned = snapshot.commit_counter();
    drop(snapshot);
    put_at(&store, 1_000, b"later");
    assert!(store.release_horizon() > pinned);
}

#[test]
fn test_historical_snapshot_holds_its_commit() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, HistoryRetention::Commits(2));
    churn(&store, 5);

    let old = store.read_as_of(40).unwrap();
    assert_eq!(old.commit_counter(), 4);
    for i in 6..=30u64 {
        put_at(&store, i * 10, &[i as u8; 300]);
    }

    assert_eq!(old.get("data", b"k").unwrap(), Some(vec![4u8; 300]));
    assert_eq!(store.release_horizon(), 4);
}

#[test]
fn test_released_history_is_reported() {
    let dir = TempDir::new().unwrap();
    let store = open(&dir, HistoryRetention::Commits(1));
    churn(&store, 5);

    assert!(matches!(store.read_as_of(10).err(), Some(KeelError::HistoryReleased(1))));
    assert_eq!(
        store.read_as_of(50).unwrap().get("data", b"k").unwrap(),
        Some(vec![5u8; 300])
    );
}

// =============================================================================
// Reopen
// =============================================================================

#[test]
fn test_allocator_state_survives_reopen() {
    let dir = TempDir::new().unwrap();
    let extent = {
        let store = open(&dir, HistoryRetention::Commits(2));
        churn(&store, 30)
    };

    let store = open(&dir, HistoryRetention::Commits(2));

    assert_eq!(store.current_root_block().next_offset(), extent);
    assert!(store.release_horizon() > 0);
    assert_eq!(store.get("data", b"k").unwrap(), Some(vec![30u8; 300]));

    for i in 31..=60u64 {
        put_at(&store, i * 10, &[i as u8; 300]);
    }
    assert!(store.metrics().records_reclaimed > 0);
    assert_eq!(store.get("data", b"k").unwrap(), Some(vec![60u8; 300]));
    assert!(store.snapshot().unwrap().validate_index("data").unwrap().is_some());
}

#[test]
fn test_switching_to_keep_all_stops_reuse() {
    let dir = TempDir::new().unwrap();
    {
        let store = open(&dir, HistoryRetention::Commits(1));
        churn(&store, 10);
    }

    let store = open(&dir, HistoryRetention::KeepAll);
    let before = store.current_root_block().next_offset();
    for i in 11..=20u64 {
        put_at(&store, i * 10, &[i as u8; 300]);
    }

    assert!(store.current_root_block().next_offset() > before);
    assert_eq!(store.metrics().records_reclaimed, 0);
}
