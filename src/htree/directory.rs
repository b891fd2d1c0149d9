//! Directory Page
//!
//! `2^globalDepth` entries, each resolving a slice of the key hash to a
//! bucket or a child directory.
//!
//! ## Encoding
//! ```text
//! ┌──────────┬────────────┬──────────────────┬────────────────────┬──────────────────┐
//! │ kind=1   │ globalDepth│ discriminator    │ local depths       │ child addresses  │
//! │ (1 byte) │ (1 byte)   │ 1 bit per entry  │ w bits per entry   │ 8 bytes per entry│
//! └──────────┴────────────┴──────────────────┴────────────────────┴──────────────────┘
//! w = ceil(log2(globalDepth + 1)); bit fields are MSB-first, padded to a byte
//! ```
//! A discriminator bit of 1 marks a child directory. Local depths are
//! stored explicitly: a dirty child has no address to look them up from.

use std::collections::HashSet;
use std::ops::Range;

use bytes::{Buf, BufMut};

use super::{PageRef, HASH_BITS, KIND_DIRECTORY};
use crate::config::MAX_HTREE_ADDRESS_BITS;
use crate::error::{KeelError, Result};

/// One directory slot
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectoryEntry {
    Bucket { child: PageRef, local_depth: u8 },
    Directory { child: PageRef, local_depth: u8 },
}

impl DirectoryEntry {
    pub fn child(&self) -> PageRef {
        match self {
            DirectoryEntry::Bucket { child, .. } | DirectoryEntry::Directory { child, .. } => *child,
        }
    }

    pub fn local_depth(&self) -> u8 {
        match self {
            DirectoryEntry::Bucket { local_depth, .. }
            | DirectoryEntry::Directory { local_depth, .. } => *local_depth,
        }
    }

    pub fn is_bucket(&self) -> bool {
        matches!(self, DirectoryEntry::Bucket { .. })
    }

    /// Same entry pointing at a different child
    pub fn with_child(&self, child: PageRef) -> Self {
        match *self {
            DirectoryEntry::Bucket { local_depth, .. } => DirectoryEntry::Bucket { child, local_depth },
            DirectoryEntry::Directory { local_depth, .. } => {
                DirectoryEntry::Directory { child, local_depth }
            }
        }
    }
}

/// Directory page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirectoryPage {
    global_depth: u8,
    entries: Vec<DirectoryEntry>,
}

impl DirectoryPage {
    /// A depth-0 directory holding a single bucket
    pub fn with_bucket(bucket: PageRef) -> Self {
        Self {
            global_depth: 0,
            entries: vec![DirectoryEntry::Bucket {
                child: bucket,
                local_depth: 0,
            }],
        }
    }

    /// Build from raw parts, checking the run invariants
    pub fn from_entries(global_depth: u8, entries: Vec<DirectoryEntry>) -> Result<Self> {
        let page = Self {
            global_depth,
            entries,
        };
        page.validate()?;
        Ok(page)
    }

    pub fn global_depth(&self) -> u8 {
        self.global_depth
    }

    pub fn entries(&self) -> &[DirectoryEntry] {
        &self.entries
    }

    pub fn entry(&self, index: usize) -> DirectoryEntry {
        self.entries[index]
    }

    /// Entry index for `hash` in a directory `prefix` bits below the root
    pub fn index_of(&self, hash: u32, prefix: u32) -> usize {
        if self.global_depth == 0 || prefix >= HASH_BITS {
            return 0;
        }
        let shifted = ((hash as u64) << prefix) & 0xFFFF_FFFF;
        (shifted >> (HASH_BITS - self.global_depth as u32)) as usize
    }

    /// The aligned run of entries sharing the child at `index`
    pub fn run_of(&self, index: usize) -> Range<usize> {
        let local = self.entries[index].local_depth();
        let len = 1usize << (self.global_depth - local);
        let start = index & !(len - 1);
        start..start + len
    }

    /// True when every entry has the same discriminator
    pub fn is_balanced(&self) -> bool {
        let first = self.entries[0].is_bucket();
        self.entries.iter().all(|e| e.is_bucket() == first)
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    pub fn set_entry(&mut self, index: usize, entry: DirectoryEntry) {
        self.entries[index] = entry;
    }

    /// Replace every entry in `run` with `entry`
    pub fn set_run(&mut self, run: Range<usize>, entry: DirectoryEntry) {
        for slot in &mut self.entries[run] {
            *slot = entry;
        }
    }

    /// Point the run at `index` to a new child, keeping kind and depth
    pub fn replace_child(&mut self, index: usize, child: PageRef) {
        let run = self.run_of(index);
        let entry = self.entries[index].with_child(child);
        self.set_run(run, entry);
    }

    /// Doubled copy: entry `i` lands at `2i` and `2i + 1`
    pub fn doubled(&self) -> Self {
        let mut entries = Vec::with_capacity(self.entries.len() * 2);
        for entry in &self.entries {
            entries.push(*entry);
            entries.push(*entry);
        }
        Self {
            global_depth: self.global_depth + 1,
            entries,
        }
    }

    /// Check local depths and run alignment
    pub fn validate(&self) -> Result<()> {
        let g = self.global_depth;
        if g > MAX_HTREE_ADDRESS_BITS {
            return Err(violation(format!("global depth {} too large", g)));
        }
        if self.entries.len() != 1usize << g {
            return Err(violation(format!(
                "global depth {} needs {} entries, found {}",
                g,
                1usize << g,
                self.entries.len()
            )));
        }

        let mut seen = HashSet::new();
        let mut i = 0;
        while i < self.entries.len() {
            let entry = self.entries[i];
            let local = entry.local_depth();
            if local > g {
                return Err(violation(format!(
                    "entry {} local depth {} exceeds global depth {}",
                    i, local, g
                )));
            }
            let len = 1usize << (g - local);
            if i % len != 0 {
                return Err(violation(format!("entry {} starts a misaligned run", i)));
            }
            if self.entries[i..i + len].iter().any(|e| *e != entry) {
                return Err(violation(format!(
                    "run at {} is not {} identical entries",
                    i, len
                )));
            }
            if !seen.insert(entry.child()) {
                return Err(violation(format!(
                    "child {:?} referenced by more than one run",
                    entry.child()
                )));
            }
            i += len;
        }
        Ok(())
    }

    // =========================================================================
    // Encoding
    // =========================================================================

    /// Bits used per local depth
    pub fn local_depth_width(global_depth: u8) -> u32 {
        8 - global_depth.leading_zeros()
    }

    /// Encoded size of a directory of `global_depth`
    pub fn encoded_len(global_depth: u8) -> u64 {
        let n = 1u64 << global_depth;
        let width = u64::from(Self::local_depth_width(global_depth));
        2 + n.div_ceil(8) + (n * width).div_ceil(8) + n * 8
    }

    /// Serialize; every child must already be persisted
    pub fn encode(&self) -> Result<Vec<u8>> {
        let n = self.entries.len();
        let width = Self::local_depth_width(self.global_depth);

        let mut discriminators = BitWriter::new();
        let mut depths = BitWriter::new();
        let mut addrs = Vec::with_capacity(n);
        for entry in &self.entries {
            discriminators.push(u64::from(!entry.is_bucket()), 1);
            depths.push(entry.local_depth() as u64, width);
            match entry.child() {
                PageRef::Stored(addr) => addrs.push(addr),
                PageRef::Dirty(slot) => {
                    return Err(violation(format!(
                        "cannot encode directory with dirty child in slot {}",
                        slot
                    )));
                }
            }
        }

        let discriminators = discriminators.finish();
        let depths = depths.finish();
        let mut buf = Vec::with_capacity(2 + discriminators.len() + depths.len() + n * 8);
        buf.put_u8(KIND_DIRECTORY);
        buf.put_u8(self.global_depth);
        buf.put_slice(&discriminators);
        buf.put_slice(&depths);
        for addr in addrs {
            buf.put_u64_le(addr);
        }
        Ok(buf)
    }

    /// Deserialize and validate
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 2 || bytes[0] != KIND_DIRECTORY {
            return Err(violation("not a directory page".to_string()));
        }
        let g = bytes[1];
        if g > MAX_HTREE_ADDRESS_BITS {
            return Err(violation(format!("global depth {} too large", g)));
        }

        let n = 1usize << g;
        let width = Self::local_depth_width(g);
        let disc_len = n.div_ceil(8);
        let depth_len = (n * width as usize).div_ceil(8);
        let expected = 2 + disc_len + depth_len + n * 8;
        if bytes.len() != expected {
            return Err(violation(format!(
                "directory of depth {} should be {} bytes, found {}",
                g,
                expected,
                bytes.len()
            )));
        }

        let disc = &bytes[2..2 + disc_len];
        let depths = &bytes[2 + disc_len..2 + disc_len + depth_len];
        let mut addrs = &bytes[2 + disc_len + depth_len..];

        let mut entries = Vec::with_capacity(n);
        for i in 0..n {
            let is_directory = read_bits(disc, i, 1) == 1;
            let local_depth = read_bits(depths, i, width) as u8;
            let addr = addrs.get_u64_le();
            if addr == 0 {
                return Err(violation(format!("entry {} has a null child", i)));
            }
            let child = PageRef::Stored(addr);
            entries.push(if is_directory {
                DirectoryEntry::Directory { child, local_depth }
            } else {
                DirectoryEntry::Bucket { child, local_depth }
            });
        }

        Self::from_entries(g, entries)
    }
}

fn violation(msg: String) -> KeelError {
    KeelError::StructuralInvariantViolation(msg)
}

// =============================================================================
// Bit Packing
// =============================================================================

/// MSB-first bit packer
struct BitWriter {
    bytes: Vec<u8>,
    bit_len: usize,
}

impl BitWriter {
    fn new() -> Self {
        Self {
            bytes: Vec::new(),
            bit_len: 0,
        }
    }

    fn push(&mut self, value: u64, width: u32) {
        for shift in (0..width).rev() {
            if self.bit_len % 8 == 0 {
                self.bytes.push(0);
            }
            if (value >> shift) & 1 == 1 {
                let last = self.bytes.len() - 1;
                self.bytes[last] |= 0x80 >> (self.bit_len % 8);
            }
            self.bit_len += 1;
        }
    }

    fn finish(self) -> Vec<u8> {
        self.bytes
    }
}

/// Read field `index` of `width` bits from an MSB-first packed array
fn read_bits(bytes: &[u8], index: usize, width: u32) -> u64 {
    let mut value = 0u64;
    let start = index * width as usize;
    for bit in start..start + width as usize {
        let set = bytes[bit / 8] & (0x80 >> (bit % 8)) != 0;
        value = (value << 1) | u64::from(set);
    }
    value
}
