//! Hash Tree Module
//!
//! Extensible hash tree index with copy-on-write pages.
//!
//! ## Shape
//! ```text
//!   directory (globalDepth = 2)          hash bits consumed: [0, 2)
//!   ┌──────┬──────┬──────┬──────┐
//!   │ B l=1│ B l=1│ B l=2│ D l=2│
//!   └──┬───┴──┬───┴──┬───┴──┬───┘
//!      └──┬───┘      ▼      ▼
//!         ▼       bucket   directory (globalDepth = 1)   bits [2, 3)
//!      bucket              ┌──────┬──────┐
//!                          │ B l=1│ B l=1│
//!                          └──────┴──────┘
//! ```
//! A child with local depth `l` under a directory of global depth `g` is
//! referenced by an aligned run of `2^(g-l)` entries.
//!
//! ## Page Kinds
//! The first byte of every page says what it is:
//! - `0` bucket: key/value pairs
//! - `1` directory: entries pointing at buckets or child directories

mod bucket;
mod directory;
mod tree;

use crate::error::{KeelError, Result};

pub use bucket::BucketPage;
pub use directory::{DirectoryEntry, DirectoryPage};
pub use tree::{HashTree, SplitCounts, TreeStats};

/// Width of the key hash in bits
pub const HASH_BITS: u32 = 32;

/// Page kind byte of a bucket page
pub const KIND_BUCKET: u8 = 0;

/// Page kind byte of a directory page
pub const KIND_DIRECTORY: u8 = 1;

/// Hash a key (CRC-32)
pub fn hash_key(key: &[u8]) -> u32 {
    crc32fast::hash(key)
}

/// Reference to a child page
///
/// A dirty page has no address until it is flushed, so it is referenced by
/// its slot in the tree's dirty page arena instead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PageRef {
    /// Persisted page at a store address
    Stored(u64),
    /// Unflushed page in the dirty arena
    Dirty(usize),
}

impl PageRef {
    /// Store address, if persisted
    pub fn addr(&self) -> Option<u64> {
        match self {
            PageRef::Stored(addr) => Some(*addr),
            PageRef::Dirty(_) => None,
        }
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, PageRef::Dirty(_))
    }
}

/// Hash tree parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HTreeConfig {
    /// Maximum global depth of a directory page
    pub address_bits: u8,
    /// Pairs a bucket holds before it splits
    pub bucket_capacity: usize,
}

impl Default for HTreeConfig {
    fn default() -> Self {
        Self {
            address_bits: 10,
            bucket_capacity: 32,
        }
    }
}

/// A decoded page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Page {
    Bucket(BucketPage),
    Directory(DirectoryPage),
}

impl Page {
    pub fn encode(&self) -> Result<Vec<u8>> {
        match self {
            Page::Bucket(bucket) => Ok(bucket.encode()),
            Page::Directory(dir) => dir.encode(),
        }
    }

    /// Decode a page, dispatching on the kind byte
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        match bytes.first() {
            Some(&KIND_BUCKET) => Ok(Page::Bucket(BucketPage::decode(bytes)?)),
            Some(&KIND_DIRECTORY) => Ok(Page::Directory(DirectoryPage::decode(bytes)?)),
            Some(kind) => Err(KeelError::StructuralInvariantViolation(format!(
                "unknown page kind {}",
                kind
            ))),
            None => Err(KeelError::StructuralInvariantViolation(
                "empty page".to_string(),
            )),
        }
    }

    pub fn is_bucket(&self) -> bool {
        matches!(self, Page::Bucket(_))
    }
}
