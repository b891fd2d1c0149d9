//! Snapshots
//!
//! A read-only view of one commit. Snapshots never block the writer: every
//! page they can reach is immutable, and the registry keeps the RW
//! allocator from reusing those pages while the snapshot is open.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::commit::CommitRecord;
use crate::error::{KeelError, Result};
use crate::htree::{HTreeConfig, HashTree, TreeStats};
use crate::metrics::StoreMetrics;
use crate::storage::StoreReader;

// =============================================================================
// Snapshot Registry
// =============================================================================

#[derive(Debug, Default)]
struct RegistryState {
    /// Open snapshot count per commit counter
    open: BTreeMap<u64, usize>,
    /// Commits below this counter may have been reclaimed
    horizon: u64,
}

/// Tracks which commits open snapshots still need
///
/// Registering and advancing the horizon happen under one lock, so a commit
/// is either registered before the writer computes the horizon (and held
/// back by it) or refused.
#[derive(Debug, Default)]
pub struct SnapshotRegistry {
    state: Mutex<RegistryState>,
}

impl SnapshotRegistry {
    pub fn new(horizon: u64) -> Self {
        Self {
            state: Mutex::new(RegistryState {
                open: BTreeMap::new(),
                horizon,
            }),
        }
    }

    /// Pin `commit_counter` until the returned guard is dropped
    pub fn pin(self: &Arc<Self>, commit_counter: u64) -> Result<SnapshotPin> {
        let mut state = self.state.lock();
        if commit_counter < state.horizon {
            return Err(KeelError::HistoryReleased(commit_counter));
        }
        *state.open.entry(commit_counter).or_insert(0) += 1;
        Ok(SnapshotPin {
            registry: Arc::clone(self),
            commit_counter,
        })
    }

    /// Advance the horizon to `min(bound, oldest pinned commit)`
    ///
    /// Returns the horizon in effect afterwards. It never moves backwards.
    pub fn advance(&self, bound: u64) -> u64 {
        let mut state = self.state.lock();
        let oldest = state.open.keys().next().copied().unwrap_or(u64::MAX);
        let candidate = bound.min(oldest);
        if candidate > state.horizon {
            state.horizon = candidate;
        }
        state.horizon
    }

    pub fn horizon(&self) -> u64 {
        self.state.lock().horizon
    }

    /// Oldest pinned commit, if any
    pub fn oldest(&self) -> Option<u64> {
        self.state.lock().open.keys().next().copied()
    }

    /// Number of open pins
    pub fn open_count(&self) -> usize {
        self.state.lock().open.values().sum()
    }

    fn release(&self, commit_counter: u64) {
        let mut state = self.state.lock();
        if let Some(count) = state.open.get_mut(&commit_counter) {
            *count -= 1;
            if *count == 0 {
                state.open.remove(&commit_counter);
            }
        }
    }
}

/// Keeps one commit readable while alive
#[derive(Debug)]
pub struct SnapshotPin {
    registry: Arc<SnapshotRegistry>,
    commit_counter: u64,
}

impl SnapshotPin {
    pub fn commit_counter(&self) -> u64 {
        self.commit_counter
    }
}

impl Drop for SnapshotPin {
    fn drop(&mut self) {
        self.registry.release(self.commit_counter);
    }
}

// =============================================================================
// Snapshot
// =============================================================================

/// Read-only view of the store as of one commit
#[derive(Debug)]
pub struct Snapshot {
    reader: StoreReader,
    record: CommitRecord,
    htree: HTreeConfig,
    metrics: Arc<StoreMetrics>,
    _pin: SnapshotPin,
}

impl Snapshot {
    pub(crate) fn new(
        reader: StoreReader,
        record: CommitRecord,
        htree: HTreeConfig,
        metrics: Arc<StoreMetrics>,
        pin: SnapshotPin,
    ) -> Self {
        metrics.record_snapshot();
        Self {
            reader,
            record,
            htree,
            metrics,
            _pin: pin,
        }
    }

    /// Look up `key` in a named index
    ///
    /// A missing index reads as empty.
    pub fn get(&self, index: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let value = match self.record.root(index) {
            Some(root) => HashTree::load(self.htree, root).get(&self.reader, key)?,
            None => None,
        };
        self.metrics.record_lookup(value.is_some());
        Ok(value)
    }

    /// Every key/value pair of a named index
    pub fn scan(&self, index: &str) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        match self.record.root(index) {
            Some(root) => HashTree::load(self.htree, root).scan(&self.reader),
            None => Ok(Vec::new()),
        }
    }

    /// Check the page structure of a named index
    pub fn validate_index(&self, index: &str) -> Result<Option<TreeStats>> {
        match self.record.root(index) {
            Some(root) => Ok(Some(HashTree::load(self.htree, root).validate(&self.reader)?)),
            None => Ok(None),
        }
    }

    pub fn index_names(&self) -> Vec<String> {
        self.record.roots.keys().cloned().collect()
    }

    /// Timestamp of the commit (0 before the first commit)
    pub fn commit_time(&self) -> u64 {
        self.record.timestamp
    }

    pub fn commit_counter(&self) -> u64 {
        self.record.commit_counter
    }

    pub fn commit_record(&self) -> &CommitRecord {
        &self.record
    }
}
