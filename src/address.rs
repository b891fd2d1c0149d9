//! Address Codec
//!
//! Packs a record location and its length into a single `u64` address.
//!
//! ## Address Shapes
//! ```text
//! WORM:  ┌────────────────────────────┬───────────────────────────┐
//!        │ byte offset (offset_bits)  │ byte count (64 - offset)  │
//!        └────────────────────────────┴───────────────────────────┘
//!
//! RW:    ┌────────────────────────────┬───────────────────────────┐
//!        │ slot index + 1 (32)        │ byte count (32)           │
//!        └────────────────────────────┴───────────────────────────┘
//! ```
//!
//! The all-zero address is the null address in both shapes. WORM offsets
//! are absolute file offsets; RW slots are resolved against the
//! allocation area that starts at the root block's `metaStartAddr`.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{KeelError, Result};

/// The null address (no record)
pub const NULL_ADDR: u64 = 0;

/// Smallest offset width accepted for a store
pub const MIN_OFFSET_BITS: u32 = 32;

/// Largest offset width accepted for a store (leaves 64 KB records)
pub const MAX_OFFSET_BITS: u32 = 48;

/// Default offset width (4 TB of addressable file, 4 MB records)
pub const DEFAULT_OFFSET_BITS: u32 = 42;

/// Width of the slot component of an RW address
const RW_SLOT_BITS: u32 = 32;

// =============================================================================
// Store Type
// =============================================================================

/// Addressing discipline of a store
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum StoreType {
    /// Write once, read many: append-only, offsets only grow
    Worm = 0,

    /// Read/write: slot allocator with reusable free space
    Rw = 1,
}

impl StoreType {
    /// Decode the on-disk byte
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(StoreType::Worm),
            1 => Some(StoreType::Rw),
            _ => None,
        }
    }

    /// On-disk byte for this store type
    pub fn as_byte(self) -> u8 {
        self as u8
    }
}

impl fmt::Display for StoreType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreType::Worm => write!(f, "WORM"),
            StoreType::Rw => write!(f, "RW"),
        }
    }
}

// =============================================================================
// Address Codec
// =============================================================================

/// Encodes and decodes store addresses for one store
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressCodec {
    store_type: StoreType,
    offset_bits: u32,
}

impl AddressCodec {
    /// Create a codec for the given store type and offset width
    ///
    /// An offset width outside `[MIN_OFFSET_BITS, MAX_OFFSET_BITS]` is a
    /// configuration error.
    pub fn new(store_type: StoreType, offset_bits: u32) -> Result<Self> {
        if !(MIN_OFFSET_BITS..=MAX_OFFSET_BITS).contains(&offset_bits) {
            return Err(KeelError::Config(format!(
                "offset_bits must be in [{}, {}], got {}",
                MIN_OFFSET_BITS, MAX_OFFSET_BITS, offset_bits
            )));
        }
        Ok(Self {
            store_type,
            offset_bits,
        })
    }

    /// WORM codec shortcut
    pub fn worm(offset_bits: u32) -> Result<Self> {
        Self::new(StoreType::Worm, offset_bits)
    }

    /// RW codec shortcut
    pub fn rw(offset_bits: u32) -> Result<Self> {
        Self::new(StoreType::Rw, offset_bits)
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    pub fn offset_bits(&self) -> u32 {
        self.offset_bits
    }

    /// Bits available for the byte count component
    pub fn byte_count_bits(&self) -> u32 {
        match self.store_type {
            StoreType::Worm => 64 - self.offset_bits,
            StoreType::Rw => 64 - RW_SLOT_BITS,
        }
    }

    /// Largest encodable offset (WORM) or slot index (RW)
    pub fn max_offset(&self) -> u64 {
        match self.store_type {
            StoreType::Worm => (1u64 << self.offset_bits) - 1,
            // slot + 1 must fit in the slot component
            StoreType::Rw => (1u64 << RW_SLOT_BITS) - 2,
        }
    }

    /// Largest encodable record length in bytes
    pub fn max_byte_count(&self) -> u64 {
        (1u64 << self.byte_count_bits()) - 1
    }

    /// Reject a record length the byte count component cannot hold
    ///
    /// Unlike an out-of-range offset this only fails the write at hand.
    pub fn check_byte_count(&self, nbytes: u64) -> Result<()> {
        if nbytes > self.max_byte_count() {
            return Err(KeelError::RecordTooLarge {
                nbytes,
                max: self.max_byte_count(),
            });
        }
        Ok(())
    }

    /// Encode `(offset, nbytes)` into an address
    ///
    /// For RW stores `offset` is the allocator slot index.
    pub fn encode(&self, offset: u64, nbytes: u64) -> Result<u64> {
        if offset > self.max_offset() {
            let bits = match self.store_type {
                StoreType::Worm => self.offset_bits,
                StoreType::Rw => RW_SLOT_BITS,
            };
            return Err(KeelError::AddressOutOfRange {
                what: "offset",
                value: offset,
                bits,
            });
        }
        self.check_byte_count(nbytes)?;

        let addr = match self.store_type {
            StoreType::Worm => (offset << self.byte_count_bits()) | nbytes,
            StoreType::Rw => ((offset + 1) << RW_SLOT_BITS) | nbytes,
        };
        Ok(addr)
    }

    /// Decode an address into `(offset, nbytes)`
    ///
    /// The null address decodes to `(0, 0)`. An RW address with a zero slot
    /// component but a non-zero length was never produced by `encode` and is
    /// rejected.
    pub fn decode(&self, addr: u64) -> Result<(u64, u64)> {
        if addr == NULL_ADDR {
            return Ok((0, 0));
        }
        let nbytes = addr & self.max_byte_count();
        match self.store_type {
            StoreType::Worm => Ok((addr >> self.byte_count_bits(), nbytes)),
            StoreType::Rw => {
                let slot_plus_one = addr >> RW_SLOT_BITS;
                if slot_plus_one == 0 {
                    return Err(KeelError::RecordCorrupted {
                        addr,
                        reason: "RW address has no slot component".to_string(),
                    });
                }
                Ok((slot_plus_one - 1, nbytes))
            }
        }
    }

    /// Offset (WORM) or slot (RW) component
    pub fn offset(&self, addr: u64) -> Result<u64> {
        self.decode(addr).map(|(offset, _)| offset)
    }

    /// Byte count component
    pub fn byte_count(&self, addr: u64) -> u64 {
        addr & self.max_byte_count()
    }

    /// Human readable form used by logs and the CLI
    pub fn describe(&self, addr: u64) -> String {
        if addr == NULL_ADDR {
            return "null".to_string();
        }
        match (self.store_type, self.decode(addr)) {
            (StoreType::Worm, Ok((offset, n))) => format!("{{offset={}, nbytes={}}}", offset, n),
            (StoreType::Rw, Ok((slot, n))) => format!("{{slot={}, nbytes={}}}", slot, n),
            (_, Err(_)) => format!("{{invalid {:#x}}}", addr),
        }
    }
}

/// True if `addr` is the null address
pub fn is_null(addr: u64) -> bool {
    addr == NULL_ADDR
}
