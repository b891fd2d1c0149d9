//! Store Metrics
//!
//! Per-store counters. Each `Store` owns one `StoreMetrics` and shares it
//! with its snapshots, so two stores in one process never mix counts.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::htree::SplitCounts;

/// Lock-free counters updated by the writer and by readers
#[derive(Debug, Default)]
pub struct StoreMetrics {
    commits: AtomicU64,
    aborted_commits: AtomicU64,
    records_written: AtomicU64,
    bytes_written: AtomicU64,
    lookups: AtomicU64,
    hits: AtomicU64,
    misses: AtomicU64,
    splits: AtomicU64,
    directory_doublings: AtomicU64,
    push_downs: AtomicU64,
    bucket_overflows: AtomicU64,
    snapshots_opened: AtomicU64,
    records_reclaimed: AtomicU64,
}

/// Point-in-time copy of `StoreMetrics`
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub commits: u64,
    pub aborted_commits: u64,
    pub records_written: u64,
    pub bytes_written: u64,
    pub lookups: u64,
    pub hits: u64,
    pub misses: u64,
    /// Bucket splits of any kind
    pub splits: u64,
    pub directory_doublings: u64,
    pub push_downs: u64,
    pub bucket_overflows: u64,
    pub snapshots_opened: u64,
    pub records_reclaimed: u64,
}

impl StoreMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_commit(&self, records: u64, bytes: u64) {
        self.commits.fetch_add(1, Ordering::Relaxed);
        self.records_written.fetch_add(records, Ordering::Relaxed);
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    pub fn record_abort(&self) {
        self.aborted_commits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_lookup(&self, hit: bool) {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if hit {
            self.hits.fetch_add(1, Ordering::Relaxed);
        } else {
            self.misses.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_splits(&self, splits: &SplitCounts) {
        self.splits.fetch_add(splits.total(), Ordering::Relaxed);
        self.directory_doublings.fetch_add(splits.doublings, Ordering::Relaxed);
        self.push_downs.fetch_add(splits.push_downs, Ordering::Relaxed);
        self.bucket_overflows.fetch_add(splits.overflows, Ordering::Relaxed);
    }

    pub fn record_snapshot(&self) {
        self.snapshots_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reclaimed(&self, records: u64) {
        self.records_reclaimed.fetch_add(records, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            commits: self.commits.load(Ordering::Relaxed),
            aborted_commits: self.aborted_commits.load(Ordering::Relaxed),
            records_written: self.records_written.load(Ordering::Relaxed),
            bytes_written: self.bytes_written.load(Ordering::Relaxed),
            lookups: self.lookups.load(Ordering::Relaxed),
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            splits: self.splits.load(Ordering::Relaxed),
            directory_doublings: self.directory_doublings.load(Ordering::Relaxed),
            push_downs: self.push_downs.load(Ordering::Relaxed),
            bucket_overflows: self.bucket_overflows.load(Ordering::Relaxed),
            snapshots_opened: self.snapshots_opened.load(Ordering::Relaxed),
            records_reclaimed: self.records_reclaimed.load(Ordering::Relaxed),
        }
    }
}
