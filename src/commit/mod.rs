//! Commit Module
//!
//! One immutable commit record per commit, plus the timestamp index over
//! all of them.
//!
//! ## Commit Record Format
//! bincode-encoded `CommitRecord`, framed by the record checksum like every
//! other record in the store.

mod index;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::raw::{RawStore, RawStoreWriter};

pub use index::{CommitIndexEntry, CommitIndexIter, CommitRecordIndex, LEAF_CAPACITY, MAX_LEAF_BYTES};

/// Everything needed to read the store as of one commit
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitRecord {
    /// Commit time (milliseconds unless supplied by the caller)
    pub timestamp: u64,
    /// Commit counter this record was written for
    pub commit_counter: u64,
    /// Root page address of every named index
    pub roots: BTreeMap<String, u64>,
}

impl CommitRecord {
    pub fn new(timestamp: u64, commit_counter: u64, roots: BTreeMap<String, u64>) -> Self {
        Self {
            timestamp,
            commit_counter,
            roots,
        }
    }

    /// Root address of a named index
    pub fn root(&self, index: &str) -> Option<u64> {
        self.roots.get(index).copied()
    }

    pub fn index_names(&self) -> impl Iterator<Item = &str> {
        self.roots.keys().map(String::as_str)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }

    /// Write this record and return its address
    pub fn write<W: RawStoreWriter>(&self, store: &mut W) -> Result<u64> {
        store.write(&self.to_bytes()?)
    }

    /// Read the record at `addr`
    pub fn read<S: RawStore>(store: &S, addr: u64) -> Result<Self> {
        let bytes = store.read(addr)?;
        Self::from_bytes(&bytes)
    }
}
