//! Root Block Module
//!
//! The two fixed slots at the head of the store file that say which commit
//! is current.
//!
//! ## Slot Layout (256 bytes, little endian)
//! ```text
//! ┌────────────┬────────────┬──────────────┬───────────────┐
//! │ magic (4)  │ version(4) │ offsetBits(4)│ storeType (1) │
//! ├────────────┴────────────┴──────────────┴───────────────┤
//! │ nextOffset (8) │ firstCommitTime (8) │ lastCommitTime (8)│
//! │ commitCounter (8) │ commitRecordAddr (8)                 │
//! │ commitRecordIndexAddr (8) │ storeUUID (16)               │
//! │ createTime (8) │ closeTime (8) │ metaBitsAddr (8)        │
//! │ metaStartAddr (8) │ quorumToken (8)                      │
//! ├──────────────────────────────────────────────────────────┤
//! │ challis head (8) │ reserved, zero (119)                  │
//! ├──────────────────────────────────────────────────────────┤
//! │ challis tail (8) │ CRC32 of bytes [0, 252) (4)           │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! The Challis field carries the commit counter. A slot whose head and tail
//! copies disagree was being written when the process stopped.

mod manager;

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use uuid::Uuid;

use crate::address::{StoreType, MAX_OFFSET_BITS, MIN_OFFSET_BITS, NULL_ADDR};
use crate::error::{KeelError, Result};

pub use manager::{CommitRequest, RecoveryReport, RootBlockManager};

// =============================================================================
// Layout Constants
// =============================================================================

/// Magic bytes identifying a KeelStore root block ("KEEL")
pub const MAGIC: u32 = 0x4c45_454b;

/// Current root block format version
pub const VERSION: u32 = 1;

/// Quorum token recorded when no replication quorum is involved
pub const NO_QUORUM: i64 = -1;

/// Size of one root block slot
pub const ROOT_BLOCK_SIZE: usize = 256;

/// File offset of slot 0
pub const ROOT_BLOCK0_OFFSET: u64 = 0;

/// File offset of slot 1
pub const ROOT_BLOCK1_OFFSET: u64 = ROOT_BLOCK_SIZE as u64;

/// First byte of the data area
pub const DATA_START: u64 = 2 * ROOT_BLOCK_SIZE as u64;

pub const OFF_MAGIC: usize = 0;
pub const OFF_VERSION: usize = 4;
pub const OFF_OFFSET_BITS: usize = 8;
pub const OFF_STORE_TYPE: usize = 12;
pub const OFF_NEXT_OFFSET: usize = 13;
pub const OFF_FIRST_COMMIT_TIME: usize = 21;
pub const OFF_LAST_COMMIT_TIME: usize = 29;
pub const OFF_COMMIT_COUNTER: usize = 37;
pub const OFF_COMMIT_RECORD_ADDR: usize = 45;
pub const OFF_COMMIT_RECORD_INDEX_ADDR: usize = 53;
pub const OFF_UUID: usize = 61;
pub const OFF_CREATE_TIME: usize = 77;
pub const OFF_CLOSE_TIME: usize = 85;
pub const OFF_META_BITS_ADDR: usize = 93;
pub const OFF_META_START_ADDR: usize = 101;
pub const OFF_QUORUM_TOKEN: usize = 109;
pub const OFF_CHALLIS_HEAD: usize = 117;
pub const OFF_RESERVED: usize = 125;
pub const OFF_CHALLIS_TAIL: usize = 244;
pub const OFF_CHECKSUM: usize = 252;

/// File offset of a slot
pub fn slot_offset(slot: usize) -> u64 {
    if slot == 0 {
        ROOT_BLOCK0_OFFSET
    } else {
        ROOT_BLOCK1_OFFSET
    }
}

// =============================================================================
// Root Block Fields
// =============================================================================

/// Decoded contents of a root block, used to build the next one
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RootBlockFields {
    pub offset_bits: u32,
    pub store_type: StoreType,
    pub next_offset: u64,
    pub first_commit_time: u64,
    pub last_commit_time: u64,
    pub commit_counter: u64,
    pub commit_record_addr: u64,
    pub commit_record_index_addr: u64,
    pub uuid: Uuid,
    pub create_time: u64,
    pub close_time: u64,
    pub meta_bits_addr: u64,
    pub meta_start_addr: u64,
    pub quorum_token: i64,
}

impl RootBlockFields {
    /// Fields of a freshly formatted store (no commits yet)
    pub fn initial(store_type: StoreType, offset_bits: u32, create_time: u64) -> Self {
        let meta_start_addr = match store_type {
            StoreType::Worm => 0,
            StoreType::Rw => DATA_START,
        };
        Self {
            offset_bits,
            store_type,
            next_offset: DATA_START,
            first_commit_time: 0,
            last_commit_time: 0,
            commit_counter: 0,
            commit_record_addr: NULL_ADDR,
            commit_record_index_addr: NULL_ADDR,
            uuid: Uuid::new_v4(),
            create_time,
            close_time: 0,
            meta_bits_addr: NULL_ADDR,
            meta_start_addr,
            quorum_token: NO_QUORUM,
        }
    }

    /// Reject field combinations no commit could produce
    fn check(&self) -> Result<()> {
        if !(MIN_OFFSET_BITS..=MAX_OFFSET_BITS).contains(&self.offset_bits) {
            return Err(KeelError::InvalidRootBlock(format!(
                "offset_bits {} out of range",
                self.offset_bits
            )));
        }
        if self.store_type == StoreType::Worm
            && (self.meta_bits_addr != 0 || self.meta_start_addr != 0)
        {
            return Err(KeelError::InvalidRootBlock(
                "WORM root block carries allocator metadata".to_string(),
            ));
        }
        if self.next_offset < DATA_START {
            return Err(KeelError::InvalidRootBlock(format!(
                "next_offset {} is inside the root block area",
                self.next_offset
            )));
        }
        if self.commit_counter == 0
            && (self.first_commit_time != 0
                || self.last_commit_time != 0
                || self.commit_record_addr != NULL_ADDR)
        {
            return Err(KeelError::InvalidRootBlock(
                "commit metadata present before the first commit".to_string(),
            ));
        }
        if self.first_commit_time > self.last_commit_time {
            return Err(KeelError::InvalidRootBlock(format!(
                "first commit time {} after last commit time {}",
                self.first_commit_time, self.last_commit_time
            )));
        }
        Ok(())
    }
}

// =============================================================================
// Root Block
// =============================================================================

/// Immutable, validated view over one root block slot
#[derive(Clone, PartialEq, Eq)]
pub struct RootBlock {
    /// Whether this view was read from (or written to) slot 0
    root_block0: bool,
    store_type: StoreType,
    buf: Bytes,
}

impl RootBlock {
    /// Encode `fields` for the given slot
    pub fn new(root_block0: bool, fields: &RootBlockFields) -> Result<Self> {
        fields.check()?;

        let mut buf = BytesMut::with_capacity(ROOT_BLOCK_SIZE);
        buf.put_u32_le(MAGIC);
        buf.put_u32_le(VERSION);
        buf.put_u32_le(fields.offset_bits);
        buf.put_u8(fields.store_type.as_byte());
        buf.put_u64_le(fields.next_offset);
        buf.put_u64_le(fields.first_commit_time);
        buf.put_u64_le(fields.last_commit_time);
        buf.put_u64_le(fields.commit_counter);
        buf.put_u64_le(fields.commit_record_addr);
        buf.put_u64_le(fields.commit_record_index_addr);
        buf.put_slice(fields.uuid.as_bytes());
        buf.put_u64_le(fields.create_time);
        buf.put_u64_le(fields.close_time);
        buf.put_u64_le(fields.meta_bits_addr);
        buf.put_u64_le(fields.meta_start_addr);
        buf.put_i64_le(fields.quorum_token);
        buf.put_u64_le(fields.commit_counter); // challis head
        buf.put_bytes(0, OFF_CHALLIS_TAIL - OFF_RESERVED);
        buf.put_u64_le(fields.commit_counter); // challis tail
        debug_assert_eq!(buf.len(), OFF_CHECKSUM);
        let checksum = crc32fast::hash(&buf[..OFF_CHECKSUM]);
        buf.put_u32_le(checksum);

        Ok(Self {
            root_block0,
            store_type: fields.store_type,
            buf: buf.freeze(),
        })
    }

    /// Wrap and validate the bytes read from a slot
    pub fn from_bytes(root_block0: bool, buf: Bytes) -> Result<Self> {
        if buf.len() != ROOT_BLOCK_SIZE {
            return Err(KeelError::InvalidRootBlock(format!(
                "expected {} bytes, got {}",
                ROOT_BLOCK_SIZE,
                buf.len()
            )));
        }
        let store_type = StoreType::from_byte(buf[OFF_STORE_TYPE]);
        let rb = Self {
            root_block0,
            store_type: store_type.unwrap_or(StoreType::Worm),
            buf,
        };
        rb.valid()?;
        if store_type.is_none() {
            return Err(KeelError::InvalidRootBlock(format!(
                "unknown store type byte {}",
                rb.buf[OFF_STORE_TYPE]
            )));
        }
        rb.fields().check()?;
        Ok(rb)
    }

    /// Check magic, Challis agreement and checksum
    ///
    /// A Challis disagreement is reported as a torn commit.
    pub fn valid(&self) -> Result<()> {
        if self.magic() != MAGIC {
            return Err(KeelError::InvalidRootBlock(format!(
                "bad magic {:#010x} in slot {}",
                self.magic(),
                self.slot()
            )));
        }
        if self.challis_head() != self.challis_tail() {
            return Err(KeelError::TornCommit { slot: self.slot() });
        }
        let computed = crc32fast::hash(&self.buf[..OFF_CHECKSUM]);
        if computed != self.checksum() {
            return Err(KeelError::InvalidRootBlock(format!(
                "checksum mismatch in slot {}: stored {:08x}, computed {:08x}",
                self.slot(),
                self.checksum(),
                computed
            )));
        }
        if self.version() != VERSION {
            return Err(KeelError::InvalidRootBlock(format!(
                "unsupported version {}",
                self.version()
            )));
        }
        Ok(())
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn is_root_block0(&self) -> bool {
        self.root_block0
    }

    /// Slot index (0 or 1)
    pub fn slot(&self) -> usize {
        if self.root_block0 {
            0
        } else {
            1
        }
    }

    pub fn magic(&self) -> u32 {
        self.u32_at(OFF_MAGIC)
    }

    pub fn version(&self) -> u32 {
        self.u32_at(OFF_VERSION)
    }

    pub fn offset_bits(&self) -> u32 {
        self.u32_at(OFF_OFFSET_BITS)
    }

    pub fn store_type(&self) -> StoreType {
        self.store_type
    }

    /// Next free byte offset in the store
    pub fn next_offset(&self) -> u64 {
        self.u64_at(OFF_NEXT_OFFSET)
    }

    /// Timestamp of the first commit, 0 if none
    pub fn first_commit_time(&self) -> u64 {
        self.u64_at(OFF_FIRST_COMMIT_TIME)
    }

    /// Timestamp of the most recent commit, 0 if none
    pub fn last_commit_time(&self) -> u64 {
        self.u64_at(OFF_LAST_COMMIT_TIME)
    }

    /// Store-local commit counter (authoritative for recovery)
    pub fn commit_counter(&self) -> u64 {
        self.u64_at(OFF_COMMIT_COUNTER)
    }

    pub fn commit_record_addr(&self) -> u64 {
        self.u64_at(OFF_COMMIT_RECORD_ADDR)
    }

    pub fn commit_record_index_addr(&self) -> u64 {
        self.u64_at(OFF_COMMIT_RECORD_INDEX_ADDR)
    }

    pub fn uuid(&self) -> Uuid {
        let mut raw = [0u8; 16];
        raw.copy_from_slice(&self.buf[OFF_UUID..OFF_UUID + 16]);
        Uuid::from_bytes(raw)
    }

    pub fn create_time(&self) -> u64 {
        self.u64_at(OFF_CREATE_TIME)
    }

    /// Time writes were disallowed, 0 while writable
    pub fn close_time(&self) -> u64 {
        self.u64_at(OFF_CLOSE_TIME)
    }

    /// Address of the allocator metabits record (RW only)
    pub fn meta_bits_addr(&self) -> u64 {
        self.u64_at(OFF_META_BITS_ADDR)
    }

    /// Start of the allocation area (RW only)
    pub fn meta_start_addr(&self) -> u64 {
        self.u64_at(OFF_META_START_ADDR)
    }

    pub fn quorum_token(&self) -> i64 {
        let mut b = &self.buf[OFF_QUORUM_TOKEN..OFF_QUORUM_TOKEN + 8];
        b.get_i64_le()
    }

    pub fn challis_head(&self) -> u64 {
        self.u64_at(OFF_CHALLIS_HEAD)
    }

    pub fn challis_tail(&self) -> u64 {
        self.u64_at(OFF_CHALLIS_TAIL)
    }

    pub fn checksum(&self) -> u32 {
        self.u32_at(OFF_CHECKSUM)
    }

    /// A read-only copy of the slot bytes
    ///
    /// Each call returns an independent `Bytes` handle, so cursors advanced
    /// by one caller never affect another.
    pub fn as_read_only_buffer(&self) -> Bytes {
        self.buf.clone()
    }

    /// Decode all fields
    pub fn fields(&self) -> RootBlockFields {
        RootBlockFields {
            offset_bits: self.offset_bits(),
            store_type: self.store_type(),
            next_offset: self.next_offset(),
            first_commit_time: self.first_commit_time(),
            last_commit_time: self.last_commit_time(),
            commit_counter: self.commit_counter(),
            commit_record_addr: self.commit_record_addr(),
            commit_record_index_addr: self.commit_record_index_addr(),
            uuid: self.uuid(),
            create_time: self.create_time(),
            close_time: self.close_time(),
            meta_bits_addr: self.meta_bits_addr(),
            meta_start_addr: self.meta_start_addr(),
            quorum_token: self.quorum_token(),
        }
    }

    fn u32_at(&self, off: usize) -> u32 {
        let mut b = &self.buf[off..off + 4];
        b.get_u32_le()
    }

    fn u64_at(&self, off: usize) -> u64 {
        let mut b = &self.buf[off..off + 8];
        b.get_u64_le()
    }
}

impl fmt::Debug for RootBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootBlock")
            .field("slot", &self.slot())
            .field("commit_counter", &self.commit_counter())
            .field("last_commit_time", &self.last_commit_time())
            .field("commit_record_addr", &self.commit_record_addr())
            .field("next_offset", &self.next_offset())
            .field("store_type", &self.store_type())
            .finish()
    }
}

impl fmt::Display for RootBlock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "rootBlock{} {{", self.slot())?;
        writeln!(f, "  version               = {}", self.version())?;
        writeln!(f, "  uuid                  = {}", self.uuid())?;
        writeln!(f, "  storeType             = {}", self.store_type())?;
        writeln!(f, "  offsetBits            = {}", self.offset_bits())?;
        writeln!(f, "  commitCounter         = {}", self.commit_counter())?;
        writeln!(f, "  firstCommitTime       = {}", self.first_commit_time())?;
        writeln!(f, "  lastCommitTime        = {}", self.last_commit_time())?;
        writeln!(f, "  nextOffset            = {}", self.next_offset())?;
        writeln!(f, "  commitRecordAddr      = {:#x}", self.commit_record_addr())?;
        writeln!(f, "  commitRecordIndexAddr = {:#x}", self.commit_record_index_addr())?;
        writeln!(f, "  createTime            = {}", self.create_time())?;
        writeln!(f, "  closeTime             = {}", self.close_time())?;
        writeln!(f, "  metaBitsAddr          = {:#x}", self.meta_bits_addr())?;
        writeln!(f, "  metaStartAddr         = {}", self.meta_start_addr())?;
        writeln!(f, "  quorumToken           = {}", self.quorum_token())?;
        write!(f, "}}")
    }
}
