//! Hash Tree
//!
//! Copy-on-write extensible hash tree over a `RawStore`.
//!
//! ## Write Path
//! 1. Descend from the root, copying every page on the path into the dirty
//!    arena (the stored original is retired)
//! 2. Insert into the bucket, splitting while it is full
//! 3. `flush` writes dirty pages children-first and returns the new root
//!    address; retired pages are handed to `delete`
//!
//! ## Split Policy
//! ```text
//!   bucket full at (prefix, localDepth l) in a directory of depth g
//!     prefix + l == 32          → allow the bucket to overflow
//!     l < g                     → split in place by hash bit prefix + l
//!     g < max, prefix + g < 32  → double the directory, retry
//!     otherwise                 → push the bucket down into a new child
//!                                 directory, retry
//! ```

use std::borrow::Cow;
use std::collections::HashMap;

use tracing::trace;

use super::{
    hash_key, BucketPage, DirectoryEntry, DirectoryPage, HTreeConfig, Page, PageRef, HASH_BITS,
};
use crate::error::{KeelError, Result};
use crate::raw::{RawStore, RawStoreWriter};

/// Split events since the counters were last taken
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SplitCounts {
    pub in_place: u64,
    pub doublings: u64,
    pub push_downs: u64,
    pub overflows: u64,
}

impl SplitCounts {
    pub fn total(&self) -> u64 {
        self.in_place + self.doublings + self.push_downs
    }
}

/// Shape of a tree, gathered by `validate`
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeStats {
    pub directories: u64,
    pub buckets: u64,
    pub entries: u64,
    /// Directory levels on the longest path
    pub depth: u32,
    pub unbalanced_directories: u64,
    /// Buckets holding more pairs than the configured capacity
    pub overfull_buckets: u64,
}

/// Position of a bucket reached by a mutable descent
struct Cursor {
    dir: usize,
    prefix: u32,
    index: usize,
    bucket: usize,
}

enum SplitOutcome {
    Retry,
    Overflow,
}

/// Extensible hash tree
#[derive(Debug, Clone)]
pub struct HashTree {
    config: HTreeConfig,
    root: PageRef,
    /// Dirty pages, addressed by `PageRef::Dirty`
    arena: Vec<Option<Page>>,
    /// Stored pages superseded by dirty copies
    retired: Vec<u64>,
    splits: SplitCounts,
}

impl HashTree {
    // =========================================================================
    // Construction
    // =========================================================================

    /// A new empty tree: one depth-0 directory holding one empty bucket
    pub fn create(config: HTreeConfig) -> Self {
        let arena = vec![
            Some(Page::Bucket(BucketPage::new())),
            Some(Page::Directory(DirectoryPage::with_bucket(PageRef::Dirty(0)))),
        ];
        Self {
            config,
            root: PageRef::Dirty(1),
            arena,
            retired: Vec::new(),
            splits: SplitCounts::default(),
        }
    }

    /// Open the tree rooted at a stored directory page
    pub fn load(config: HTreeConfig, root_addr: u64) -> Self {
        Self {
            config,
            root: PageRef::Stored(root_addr),
            arena: Vec::new(),
            retired: Vec::new(),
            splits: SplitCounts::default(),
        }
    }

    pub fn config(&self) -> &HTreeConfig {
        &self.config
    }

    /// Root address, `None` while the tree has unflushed changes
    pub fn root_addr(&self) -> Option<u64> {
        self.root.addr()
    }

    pub fn is_dirty(&self) -> bool {
        self.root.is_dirty()
    }

    /// Split counters since the last call
    pub fn take_splits(&mut self) -> SplitCounts {
        std::mem::take(&mut self.splits)
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Look up a key
    pub fn get<S: RawStore>(&self, store: &S, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        let mut current = self.root;
        let mut prefix = 0u32;
        let mut expect_bucket = false;

        loop {
            let page = self.page(store, current)?;
            match (page.as_ref(), expect_bucket) {
                (Page::Bucket(bucket), true) => {
                    return Ok(bucket.get(key).map(<[u8]>::to_vec));
                }
                (Page::Directory(dir), false) => {
                    let entry = dir.entry(dir.index_of(hash, prefix));
                    if let DirectoryEntry::Directory { local_depth, .. } = entry {
                        prefix += local_depth as u32;
                    }
                    expect_bucket = entry.is_bucket();
                    current = entry.child();
                }
                _ => return Err(kind_mismatch(current, expect_bucket)),
            }
        }
    }

    /// All key/value pairs, in tree order
    pub fn scan<S: RawStore>(&self, store: &S) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        let mut pairs = Vec::new();
        self.visit(store, self.root, &mut |_: PageRef, page: &Page| {
            if let Page::Bucket(bucket) = page {
                pairs.extend(bucket.entries().iter().cloned());
            }
            Ok(())
        })?;
        Ok(pairs)
    }

    /// Walk every page and check structure
    ///
    /// Beyond the per-page checks this verifies that each key hashes to the
    /// bucket it is stored in.
    pub fn validate<S: RawStore>(&self, store: &S) -> Result<TreeStats> {
        let mut stats = TreeStats::default();
        self.validate_directory(store, self.root, 0, 0, 1, &mut stats)?;
        Ok(stats)
    }

    fn validate_directory<S: RawStore>(
        &self,
        store: &S,
        r: PageRef,
        prefix: u32,
        path: u64,
        level: u32,
        stats: &mut TreeStats,
    ) -> Result<()> {
        let page = self.page(store, r)?;
        let dir = match page.as_ref() {
            Page::Directory(dir) => dir,
            Page::Bucket(_) => return Err(kind_mismatch(r, false)),
        };
        dir.validate()?;

        stats.directories += 1;
        stats.depth = stats.depth.max(level);
        if !dir.is_balanced() {
            stats.unbalanced_directories += 1;
        }

        let g = dir.global_depth();
        let mut i = 0;
        while i < dir.entries().len() {
            let entry = dir.entry(i);
            let l = entry.local_depth();
            let child_prefix = prefix + l as u32;
            if child_prefix > HASH_BITS {
                return Err(KeelError::StructuralInvariantViolation(format!(
                    "child at entry {} would consume {} hash bits",
                    i, child_prefix
                )));
            }
            let child_path = (path << l) | (i >> (g - l)) as u64;
            match entry {
                DirectoryEntry::Bucket { child, .. } => {
                    self.validate_bucket(store, child, child_prefix, child_path, stats)?;
                }
                DirectoryEntry::Directory { child, .. } => {
                    self.validate_directory(store, child, child_prefix, child_path, level + 1, stats)?;
                }
            }
            i = dir.run_of(i).end;
        }
        Ok(())
    }

    fn validate_bucket<S: RawStore>(
        &self,
        store: &S,
        r: PageRef,
        prefix: u32,
        path: u64,
        stats: &mut TreeStats,
    ) -> Result<()> {
        let page = self.page(store, r)?;
        let bucket = match page.as_ref() {
            Page::Bucket(bucket) => bucket,
            Page::Directory(_) => return Err(kind_mismatch(r, true)),
        };

        stats.buckets += 1;
        stats.entries += bucket.len() as u64;
        if bucket.len() > self.config.bucket_capacity {
            stats.overfull_buckets += 1;
        }

        if prefix > 0 {
            for (key, _) in bucket.entries() {
                let bits = (hash_key(key) as u64) >> (HASH_BITS - prefix);
                if bits != path {
                    return Err(KeelError::StructuralInvariantViolation(format!(
                        "key of {} bytes stored under hash prefix {:#x}/{} but hashes to {:#x}",
                        key.len(),
                        path,
                        prefix,
                        bits
                    )));
                }
            }
        }
        Ok(())
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Insert or replace; returns the previous value
    pub fn insert<S: RawStore>(
        &mut self,
        store: &S,
        key: &[u8],
        value: &[u8],
    ) -> Result<Option<Vec<u8>>> {
        let hash = hash_key(key);
        let capacity = self.config.bucket_capacity;

        loop {
            let cursor = self.descend_mut(store, hash)?;
            let bucket = self.bucket_mut(cursor.bucket)?;
            if bucket.contains(key) || bucket.len() < capacity {
                return Ok(bucket.insert(key.to_vec(), value.to_vec()));
            }

            match self.split(&cursor)? {
                SplitOutcome::Retry => continue,
                SplitOutcome::Overflow => {
                    let bucket = self.bucket_mut(cursor.bucket)?;
                    return Ok(bucket.insert(key.to_vec(), value.to_vec()));
                }
            }
        }
    }

    /// Remove a key; returns its value
    ///
    /// Pages are only copied when the key is actually present.
    pub fn remove<S: RawStore>(&mut self, store: &S, key: &[u8]) -> Result<Option<Vec<u8>>> {
        if self.get(store, key)?.is_none() {
            return Ok(None);
        }
        let cursor = self.descend_mut(store, hash_key(key))?;
        Ok(self.bucket_mut(cursor.bucket)?.remove(key))
    }

    /// Write every dirty page and return the root address
    pub fn flush<W: RawStoreWriter>(&mut self, store: &mut W) -> Result<u64> {
        if let PageRef::Stored(addr) = self.root {
            if self.retired.is_empty() {
                return Ok(addr);
            }
        }

        let mut written = HashMap::new();
        let root = self.write_page(store, self.root, &mut written)?;
        let retired = self.retired.len();
        for addr in self.retired.drain(..) {
            store.delete(addr);
        }
        self.arena.clear();
        self.root = PageRef::Stored(root);

        trace!(pages = written.len(), retired, root_addr = root, "Flushed hash tree");
        Ok(root)
    }

    /// Hand every page of this tree to `delete`; returns how many
    pub fn discard<W: RawStoreWriter>(self, store: &mut W) -> Result<usize> {
        let mut addrs = self.retired.clone();
        self.visit(&*store, self.root, &mut |r: PageRef, _: &Page| {
            if let PageRef::Stored(addr) = r {
                addrs.push(addr);
            }
            Ok(())
        })?;
        for addr in &addrs {
            store.delete(*addr);
        }
        Ok(addrs.len())
    }

    fn write_page<W: RawStoreWriter>(
        &mut self,
        store: &mut W,
        r: PageRef,
        written: &mut HashMap<usize, u64>,
    ) -> Result<u64> {
        let slot = match r {
            PageRef::Stored(addr) => return Ok(addr),
            PageRef::Dirty(slot) => slot,
        };
        if let Some(addr) = written.get(&slot) {
            return Ok(*addr);
        }

        let mut page = self
            .arena
            .get_mut(slot)
            .and_then(Option::take)
            .ok_or_else(|| missing_slot(slot))?;

        // Children first: a directory records its children's addresses
        if let Page::Directory(dir) = &mut page {
            for i in 0..dir.entries().len() {
                let entry = dir.entry(i);
                if entry.child().is_dirty() {
                    let addr = self.write_page(store, entry.child(), written)?;
                    dir.set_entry(i, entry.with_child(PageRef::Stored(addr)));
                }
            }
        }

        let addr = store.write(&page.encode()?)?;
        written.insert(slot, addr);
        Ok(addr)
    }

    /// Copy the path to `hash` into the arena
    fn descend_mut<S: RawStore>(&mut self, store: &S, hash: u32) -> Result<Cursor> {
        let root = self.make_dirty(store, self.root)?;
        self.root = PageRef::Dirty(root);

        let mut dir = root;
        let mut prefix = 0u32;
        loop {
            let (index, entry) = {
                let d = self.dir(dir)?;
                let index = d.index_of(hash, prefix);
                (index, d.entry(index))
            };

            let child = self.make_dirty(store, entry.child())?;
            if entry.child() != PageRef::Dirty(child) {
                self.dir_mut(dir)?.replace_child(index, PageRef::Dirty(child));
            }

            match entry {
                DirectoryEntry::Bucket { .. } => {
                    self.bucket_mut(child)?;
                    return Ok(Cursor {
                        dir,
                        prefix,
                        index,
                        bucket: child,
                    });
                }
                DirectoryEntry::Directory { local_depth, .. } => {
                    self.dir(child)?;
                    dir = child;
                    prefix += local_depth as u32;
                }
            }
        }
    }

    fn split(&mut self, cursor: &Cursor) -> Result<SplitOutcome> {
        let (g, l) = {
            let d = self.dir(cursor.dir)?;
            (d.global_depth(), d.entry(cursor.index).local_depth())
        };

        if cursor.prefix + l as u32 >= HASH_BITS {
            self.splits.overflows += 1;
            trace!(prefix = cursor.prefix, local_depth = l, "Hash bits exhausted, bucket overflows");
            return Ok(SplitOutcome::Overflow);
        }

        if l < g {
            self.split_in_place(cursor, l)?;
            self.splits.in_place += 1;
            trace!(prefix = cursor.prefix, local_depth = l + 1, "Split bucket in place");
        } else if g < self.config.address_bits && cursor.prefix + (g as u32) < HASH_BITS {
            let d = self.dir_mut(cursor.dir)?;
            *d = d.doubled();
            self.splits.doublings += 1;
            trace!(prefix = cursor.prefix, global_depth = g + 1, "Doubled directory");
        } else {
            let child = self.alloc(Page::Directory(DirectoryPage::with_bucket(PageRef::Dirty(
                cursor.bucket,
            ))));
            let d = self.dir_mut(cursor.dir)?;
            let run = d.run_of(cursor.index);
            d.set_run(
                run,
                DirectoryEntry::Directory {
                    child: PageRef::Dirty(child),
                    local_depth: l,
                },
            );
            self.splits.push_downs += 1;
            trace!(prefix = cursor.prefix + l as u32, "Pushed bucket down into child directory");
        }
        Ok(SplitOutcome::Retry)
    }

    /// Split a bucket referenced by a run of `2^(g-l)` entries into two
    /// buckets at depth `l + 1`
    fn split_in_place(&mut self, cursor: &Cursor, local_depth: u8) -> Result<()> {
        let bit = cursor.prefix + local_depth as u32;
        let bucket = std::mem::take(self.bucket_mut(cursor.bucket)?);
        let (low, high) = bucket.split(bit);
        *self.bucket_mut(cursor.bucket)? = low;
        let high_slot = self.alloc(Page::Bucket(high));

        let d = self.dir_mut(cursor.dir)?;
        let run = d.run_of(cursor.index);
        let mid = run.start + run.len() / 2;
        d.set_run(
            run.start..mid,
            DirectoryEntry::Bucket {
                child: PageRef::Dirty(cursor.bucket),
                local_depth: local_depth + 1,
            },
        );
        d.set_run(
            mid..run.end,
            DirectoryEntry::Bucket {
                child: PageRef::Dirty(high_slot),
                local_depth: local_depth + 1,
            },
        );
        Ok(())
    }

    // =========================================================================
    // Page Access
    // =========================================================================

    fn page<'a, S: RawStore>(&'a self, store: &S, r: PageRef) -> Result<Cow<'a, Page>> {
        match r {
            PageRef::Dirty(slot) => self
                .arena
                .get(slot)
                .and_then(Option::as_ref)
                .map(Cow::Borrowed)
                .ok_or_else(|| missing_slot(slot)),
            PageRef::Stored(addr) => Ok(Cow::Owned(Page::decode(&store.read(addr)?)?)),
        }
    }

    /// Visit each distinct page once, parents before children
    fn visit<S: RawStore>(
        &self,
        store: &S,
        r: PageRef,
        f: &mut dyn FnMut(PageRef, &Page) -> Result<()>,
    ) -> Result<()> {
        let page = self.page(store, r)?;
        f(r, page.as_ref())?;
        if let Page::Directory(dir) = page.as_ref() {
            let mut i = 0;
            while i < dir.entries().len() {
                self.visit(store, dir.entry(i).child(), f)?;
                i = dir.run_of(i).end;
            }
        }
        Ok(())
    }

    /// Copy a stored page into the arena, retiring the original
    fn make_dirty<S: RawStore>(&mut self, store: &S, r: PageRef) -> Result<usize> {
        match r {
            PageRef::Dirty(slot) => Ok(slot),
            PageRef::Stored(addr) => {
                let page = Page::decode(&store.read(addr)?)?;
                self.retired.push(addr);
                Ok(self.alloc(page))
            }
        }
    }

    fn alloc(&mut self, page: Page) -> usize {
        self.arena.push(Some(page));
        self.arena.len() - 1
    }

    fn dir(&self, slot: usize) -> Result<&DirectoryPage> {
        match self.arena.get(slot).and_then(Option::as_ref) {
            Some(Page::Directory(dir)) => Ok(dir),
            Some(Page::Bucket(_)) => Err(kind_mismatch(PageRef::Dirty(slot), false)),
            None => Err(missing_slot(slot)),
        }
    }

    fn dir_mut(&mut self, slot: usize) -> Result<&mut DirectoryPage> {
        match self.arena.get_mut(slot).and_then(Option::as_mut) {
            Some(Page::Directory(dir)) => Ok(dir),
            Some(Page::Bucket(_)) => Err(kind_mismatch(PageRef::Dirty(slot), false)),
            None => Err(missing_slot(slot)),
        }
    }

    fn bucket_mut(&mut self, slot: usize) -> Result<&mut BucketPage> {
        match self.arena.get_mut(slot).and_then(Option::as_mut) {
            Some(Page::Bucket(bucket)) => Ok(bucket),
            Some(Page::Directory(_)) => Err(kind_mismatch(PageRef::Dirty(slot), true)),
            None => Err(missing_slot(slot)),
        }
    }
}

fn kind_mismatch(r: PageRef, expected_bucket: bool) -> KeelError {
    let expected = if expected_bucket { "bucket" } else { "directory" };
    KeelError::StructuralInvariantViolation(format!("page {:?} is not a {}", r, expected))
}

fn missing_slot(slot: usize) -> KeelError {
    KeelError::StructuralInvariantViolation(format!("dirty page slot {} is empty", slot))
}
