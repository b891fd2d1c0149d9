//! RW Slot Allocator
//!
//! Fixed-size slot allocator for RW stores. A record occupies a contiguous
//! run of slots; the run's first slot is the slot component of its address.
//!
//! ## Metabits
//! The allocation bitmap, the deferred-free list and the release horizon
//! are serialized together as the "metabits" record. Each commit writes a
//! fresh metabits record into allocator space and stores its address in
//! the root block (`metaBitsAddr`), so both root blocks always point at a
//! bitmap that matches their own commit.
//!
//! ## Deferred Frees
//! A record superseded by commit `C` is still referenced by commits before
//! `C`. It is only returned to the bitmap once the release horizon (the
//! oldest commit that must stay readable) reaches `C`.

use serde::{Deserialize, Serialize};

use crate::address::AddressCodec;
use crate::error::{KeelError, Result};

/// Allocation slot size in bytes
pub const RW_SLOT_SIZE: u64 = 128;

/// A record waiting for the release horizon to pass
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeferredFree {
    /// Address of the superseded record
    pub addr: u64,
    /// Commit counter of the commit that stopped referencing it
    pub released_at: u64,
}

/// Bitmap slot allocator
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RwAllocator {
    /// Byte offset of slot 0 (`metaStartAddr`)
    meta_start: u64,
    /// Slots ever in use; the allocation area ends here
    slot_count: u64,
    /// One bit per slot, 1 = allocated
    bits: Vec<u64>,
    deferred: Vec<DeferredFree>,
    /// Commits older than this may no longer be readable
    release_horizon: u64,
    /// False when history is kept forever (frees are dropped)
    track_frees: bool,
}

impl RwAllocator {
    /// Create an empty allocator whose slot 0 starts at `meta_start`
    pub fn new(meta_start: u64, track_frees: bool) -> Self {
        Self {
            meta_start,
            slot_count: 0,
            bits: Vec::new(),
            deferred: Vec::new(),
            release_horizon: 0,
            track_frees,
        }
    }

    /// Restore an allocator from a metabits record
    pub fn from_bytes(bytes: &[u8], track_frees: bool) -> Result<Self> {
        let mut allocator: RwAllocator = bincode::deserialize(bytes)?;
        if allocator.bits.len() as u64 * 64 < allocator.slot_count {
            return Err(KeelError::StructuralInvariantViolation(format!(
                "metabits bitmap covers {} slots but slot_count is {}",
                allocator.bits.len() * 64,
                allocator.slot_count
            )));
        }
        if !track_frees {
            allocator.deferred.clear();
        }
        allocator.track_frees = track_frees;
        Ok(allocator)
    }

    /// Serialize as a metabits record
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a run of slots for `nbytes`; returns the first slot
    pub fn alloc(&mut self, nbytes: u64) -> u64 {
        let needed = Self::slots_for(nbytes);

        // First fit over the existing area
        let mut run_start = 0u64;
        let mut run_len = 0u64;
        let mut slot = 0u64;
        while slot < self.slot_count {
            if run_len == 0 && slot % 64 == 0 && self.bits[(slot / 64) as usize] == u64::MAX {
                slot += 64;
                continue;
            }
            if self.is_allocated(slot) {
                run_len = 0;
            } else {
                if run_len == 0 {
                    run_start = slot;
                }
                run_len += 1;
                if run_len == needed {
                    self.mark(run_start, needed, true);
                    return run_start;
                }
            }
            slot += 1;
        }

        // Extend the area, reusing a free tail run if there is one
        let start = if run_len > 0 { run_start } else { self.slot_count };
        self.mark(start, needed, true);
        start
    }

    /// Mark a known run as allocated (the metabits record itself on load)
    pub fn claim(&mut self, slot: u64, nbytes: u64) {
        self.mark(slot, Self::slots_for(nbytes), true);
    }

    /// Return a run to the bitmap immediately
    pub fn free(&mut self, slot: u64, nbytes: u64) {
        self.mark(slot, Self::slots_for(nbytes), false);
    }

    /// Queue a superseded record for release once `released_at` is no
    /// longer needed by any retained commit
    pub fn defer_free(&mut self, addr: u64, released_at: u64) {
        if self.track_frees {
            self.deferred.push(DeferredFree { addr, released_at });
        }
    }

    /// Release every deferred record superseded at or before `horizon`
    ///
    /// Returns the number of records returned to the bitmap.
    pub fn reclaim(&mut self, codec: &AddressCodec, horizon: u64) -> Result<usize> {
        if horizon > self.release_horizon {
            self.release_horizon = horizon;
        }

        let (ready, waiting): (Vec<_>, Vec<_>) = self
            .deferred
            .iter()
            .copied()
            .partition(|d| d.released_at <= horizon);
        self.deferred = waiting;

        for d in &ready {
            let (slot, nbytes) = codec.decode(d.addr)?;
            self.free(slot, nbytes);
        }
        Ok(ready.len())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Byte offset of a slot in the store file
    pub fn slot_offset(&self, slot: u64) -> u64 {
        self.meta_start + slot * RW_SLOT_SIZE
    }

    /// First byte past the allocation area (`nextOffset` for RW stores)
    pub fn extent(&self) -> u64 {
        self.slot_offset(self.slot_count)
    }

    pub fn meta_start(&self) -> u64 {
        self.meta_start
    }

    pub fn is_allocated(&self, slot: u64) -> bool {
        match self.bits.get((slot / 64) as usize) {
            Some(word) => word & (1u64 << (slot % 64)) != 0,
            None => false,
        }
    }

    /// Number of slots currently allocated
    pub fn allocated_slots(&self) -> u64 {
        self.bits.iter().map(|w| w.count_ones() as u64).sum()
    }

    pub fn deferred(&self) -> &[DeferredFree] {
        &self.deferred
    }

    pub fn release_horizon(&self) -> u64 {
        self.release_horizon
    }

    /// Slots needed to hold `nbytes` (at least one)
    pub fn slots_for(nbytes: u64) -> u64 {
        nbytes.div_ceil(RW_SLOT_SIZE).max(1)
    }

    fn mark(&mut self, start: u64, len: u64, allocated: bool) {
        let end = start + len;
        let words = end.div_ceil(64) as usize;
        if self.bits.len() < words {
            self.bits.resize(words, 0);
        }
        for slot in start..end {
            let word = &mut self.bits[(slot / 64) as usize];
            let mask = 1u64 << (slot % 64);
            if allocated {
                *word |= mask;
            } else {
                *word &= !mask;
            }
        }
        if allocated && end > self.slot_count {
            self.slot_count = end;
        }
    }
}
