//! Commit Record Index
//!
//! Ordered map from commit timestamp to commit record address, persisted
//! copy-on-write so every older root stays readable.
//!
//! ## Structure
//! ```text
//!                 ┌──────────────────────────────────────┐
//!   root  ──────► │ entry_count, last_timestamp           │
//!                 │ [(first_ts, leaf_addr, count), ...]   │
//!                 └───────┬──────────────┬───────────┬────┘
//!                         ▼              ▼           ▼
//!                    ┌────────┐     ┌────────┐   ┌────────┐
//!                    │ 128    │     │ 128    │   │ tail   │
//!                    │ entries│     │ entries│   │ (< 128)│
//!                    └────────┘     └────────┘   └────────┘
//! ```
//! Full leaves are sealed and never rewritten. Each flush rewrites the tail
//! leaf and the root only.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::address::NULL_ADDR;
use crate::error::{KeelError, Result};
use crate::raw::{RawStore, RawStoreWriter};

/// Entries per leaf
pub const LEAF_CAPACITY: usize = 128;

/// Encoded size of a full leaf: bincode length prefix plus three u64s per entry
pub const MAX_LEAF_BYTES: u64 = 8 + LEAF_CAPACITY as u64 * 24;

/// One commit in the index
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitIndexEntry {
    pub timestamp: u64,
    pub commit_counter: u64,
    pub commit_record_addr: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
struct LeafRef {
    first_timestamp: u64,
    addr: u64,
    count: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexRoot {
    entry_count: u64,
    last_timestamp: u64,
    leaves: Vec<LeafRef>,
}

/// Copy-on-write commit timestamp index
#[derive(Debug, Clone, Default)]
pub struct CommitRecordIndex {
    /// Address of the persisted root (NULL when empty or never flushed)
    root_addr: u64,
    /// Full leaves, oldest first
    sealed: Vec<LeafRef>,
    /// Entries after the last sealed leaf
    tail: Vec<CommitIndexEntry>,
    /// Address of the persisted tail leaf, if any
    tail_addr: u64,
    last_timestamp: u64,
    dirty: bool,
}

impl CommitRecordIndex {
    /// An empty index
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the index rooted at `addr` (NULL = empty)
    pub fn load<S: RawStore>(store: &S, addr: u64) -> Result<Self> {
        if addr == NULL_ADDR {
            return Ok(Self::new());
        }

        let root: IndexRoot = bincode::deserialize(&store.read(addr)?)?;
        let mut sealed = root.leaves;
        let mut counted = 0u64;
        for (i, leaf) in sealed.iter().enumerate() {
            let last = i + 1 == sealed.len();
            if leaf.count == 0 || leaf.count as usize > LEAF_CAPACITY {
                return Err(KeelError::StructuralInvariantViolation(format!(
                    "commit index leaf {} holds {} entries",
                    i, leaf.count
                )));
            }
            if !last && leaf.count as usize != LEAF_CAPACITY {
                return Err(KeelError::StructuralInvariantViolation(format!(
                    "commit index leaf {} is not full but is not the tail",
                    i
                )));
            }
            counted += leaf.count as u64;
        }
        if counted != root.entry_count {
            return Err(KeelError::StructuralInvariantViolation(format!(
                "commit index root counts {} entries, leaves hold {}",
                root.entry_count, counted
            )));
        }

        // A partially filled last leaf is loaded as the mutable tail
        let mut tail = Vec::new();
        let mut tail_addr = NULL_ADDR;
        if let Some(last) = sealed.last().copied() {
            if (last.count as usize) < LEAF_CAPACITY {
                sealed.pop();
                tail = read_leaf(store, &last)?;
                tail_addr = last.addr;
            }
        }

        Ok(Self {
            root_addr: addr,
            sealed,
            tail,
            tail_addr,
            last_timestamp: root.last_timestamp,
            dirty: false,
        })
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Add the newest commit; timestamps must strictly increase
    pub fn append(&mut self, entry: CommitIndexEntry) -> Result<()> {
        if !self.is_empty() && entry.timestamp <= self.last_timestamp {
            return Err(KeelError::CommitOrder {
                last: self.last_timestamp,
                attempted: entry.timestamp,
            });
        }
        self.tail.push(entry);
        self.last_timestamp = entry.timestamp;
        self.dirty = true;
        Ok(())
    }

    /// Write the tail leaves and a new root; returns the root address
    ///
    /// The superseded tail leaf and root are handed to `store.delete`.
    pub fn flush<W: RawStoreWriter>(&mut self, store: &mut W) -> Result<u64> {
        if !self.dirty {
            return Ok(self.root_addr);
        }

        let entry_count = self.len();
        let mut tail_ref = None;
        let mut remainder = Vec::new();
        for chunk in self.tail.chunks(LEAF_CAPACITY) {
            let addr = store.write(&bincode::serialize(chunk)?)?;
            let leaf = LeafRef {
                first_timestamp: chunk[0].timestamp,
                addr,
                count: chunk.len() as u32,
            };
            if chunk.len() == LEAF_CAPACITY {
                self.sealed.push(leaf);
            } else {
                tail_ref = Some(leaf);
                remainder = chunk.to_vec();
            }
        }

        let mut leaves = self.sealed.clone();
        leaves.extend(tail_ref);
        let root = IndexRoot {
            entry_count,
            last_timestamp: self.last_timestamp,
            leaves,
        };
        let root_addr = store.write(&bincode::serialize(&root)?)?;

        for old in [self.tail_addr, self.root_addr] {
            if old != NULL_ADDR {
                store.delete(old);
            }
        }

        trace!(
            entries = root.entry_count,
            sealed = self.sealed.len(),
            root_addr,
            "Flushed commit record index"
        );

        self.tail = remainder;
        self.tail_addr = tail_ref.map(|l| l.addr).unwrap_or(NULL_ADDR);
        self.root_addr = root_addr;
        self.dirty = false;
        Ok(root_addr)
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Latest commit at or before `timestamp`
    pub fn floor<S: RawStore>(&self, store: &S, timestamp: u64) -> Result<Option<CommitIndexEntry>> {
        if let Some(first) = self.tail.first() {
            if first.timestamp <= timestamp {
                return Ok(floor_in(&self.tail, timestamp));
            }
        }

        let pos = self.sealed.partition_point(|l| l.first_timestamp <= timestamp);
        if pos == 0 {
            return Ok(None);
        }
        let entries = read_leaf(store, &self.sealed[pos - 1])?;
        Ok(floor_in(&entries, timestamp))
    }

    /// Oldest commit
    pub fn first<S: RawStore>(&self, store: &S) -> Result<Option<CommitIndexEntry>> {
        match self.sealed.first() {
            Some(leaf) => Ok(read_leaf(store, leaf)?.first().copied()),
            None => Ok(self.tail.first().copied()),
        }
    }

    /// Newest commit
    pub fn last<S: RawStore>(&self, store: &S) -> Result<Option<CommitIndexEntry>> {
        if let Some(entry) = self.tail.last() {
            return Ok(Some(*entry));
        }
        match self.sealed.last() {
            Some(leaf) => Ok(read_leaf(store, leaf)?.last().copied()),
            None => Ok(None),
        }
    }

    /// Iterate all commits in timestamp order
    ///
    /// The iterator sees the history as of this call; later appends are not
    /// visible to it.
    pub fn iter<S: RawStore>(&self, store: S) -> CommitIndexIter<S> {
        CommitIndexIter {
            store,
            leaves: self.sealed.clone().into(),
            buffered: VecDeque::new(),
            tail: Some(self.tail.clone()),
        }
    }

    pub fn len(&self) -> u64 {
        self.sealed.len() as u64 * LEAF_CAPACITY as u64 + self.tail.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Address of the last persisted root
    pub fn root_addr(&self) -> u64 {
        self.root_addr
    }

    /// True when entries were appended since the last flush
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }
}

fn read_leaf<S: RawStore>(store: &S, leaf: &LeafRef) -> Result<Vec<CommitIndexEntry>> {
    let entries: Vec<CommitIndexEntry> = bincode::deserialize(&store.read(leaf.addr)?)?;
    if entries.len() != leaf.count as usize {
        return Err(KeelError::StructuralInvariantViolation(format!(
            "commit index leaf at {:#x} holds {} entries, root says {}",
            leaf.addr,
            entries.len(),
            leaf.count
        )));
    }
    Ok(entries)
}

fn floor_in(entries: &[CommitIndexEntry], timestamp: u64) -> Option<CommitIndexEntry> {
    let pos = entries.partition_point(|e| e.timestamp <= timestamp);
    if pos == 0 {
        None
    } else {
        Some(entries[pos - 1])
    }
}

// =============================================================================
// Iterator
// =============================================================================

/// Forward iterator over a fixed view of the index
pub struct CommitIndexIter<S> {
    store: S,
    leaves: VecDeque<LeafRef>,
    buffered: VecDeque<CommitIndexEntry>,
    tail: Option<Vec<CommitIndexEntry>>,
}

impl<S: RawStore> Iterator for CommitIndexIter<S> {
    type Item = Result<CommitIndexEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(entry) = self.buffered.pop_front() {
                return Some(Ok(entry));
            }
            if let Some(leaf) = self.leaves.pop_front() {
                match read_leaf(&self.store, &leaf) {
                    Ok(entries) => self.buffered.extend(entries),
                    Err(e) => {
                        self.leaves.clear();
                        self.tail = None;
                        return Some(Err(e));
                    }
                }
                continue;
            }
            match self.tail.take() {
                Some(tail) => self.buffered.extend(tail),
                None => return None,
            }
        }
    }
}
