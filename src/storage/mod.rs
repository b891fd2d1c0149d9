//! Storage Module
//!
//! Record I/O on the single store file.
//!
//! ## Responsibilities
//! - Resolve addresses to byte ranges (WORM offsets or RW slots)
//! - Frame every record with a CRC32 so torn or corrupted records are caught
//! - Hand out space for new records (append cursor or slot allocator)
//! - Share the file between the writer and any number of snapshot readers
//!
//! ## Record Format
//! ```text
//! ┌─────────────────────────────┬──────────────┐
//! │ Payload (nbytes - 4)        │ CRC32 (4)    │
//! └─────────────────────────────┴──────────────┘
//! ```
//! The address byte count covers the payload and the checksum.

mod allocator;
mod file;

use std::io;
use std::sync::Arc;

use bytes::Bytes;

use crate::address::{AddressCodec, StoreType, NULL_ADDR};
use crate::error::{KeelError, Result};
use crate::raw::{RawStore, RawStoreWriter};

pub use allocator::{DeferredFree, RwAllocator, RW_SLOT_SIZE};
pub use file::BackingFile;

/// Size of the trailing record checksum
pub const RECORD_CHECKSUM_SIZE: u64 = 4;

// =============================================================================
// Address Resolution
// =============================================================================

/// Maps addresses to byte ranges in the store file
#[derive(Debug, Clone, Copy)]
pub struct Resolver {
    codec: AddressCodec,
    /// Start of the RW allocation area (unused for WORM)
    meta_start: u64,
}

impl Resolver {
    pub fn new(codec: AddressCodec, meta_start: u64) -> Self {
        Self { codec, meta_start }
    }

    pub fn codec(&self) -> &AddressCodec {
        &self.codec
    }

    /// Byte offset and length of the record at `addr`
    pub fn resolve(&self, addr: u64) -> Result<(u64, u64)> {
        if addr == NULL_ADDR {
            return Err(KeelError::RecordCorrupted {
                addr,
                reason: "read of null address".to_string(),
            });
        }
        let (offset, nbytes) = self.codec.decode(addr)?;
        let byte_offset = match self.codec.store_type() {
            StoreType::Worm => offset,
            StoreType::Rw => self.meta_start + offset * RW_SLOT_SIZE,
        };
        Ok((byte_offset, nbytes))
    }
}

/// Append the record checksum to a payload
pub fn frame_record(payload: &[u8]) -> Vec<u8> {
    let mut framed = Vec::with_capacity(payload.len() + RECORD_CHECKSUM_SIZE as usize);
    framed.extend_from_slice(payload);
    framed.extend_from_slice(&crc32fast::hash(payload).to_le_bytes());
    framed
}

// =============================================================================
// Store Reader
// =============================================================================

/// Read-only view of committed records
///
/// Cheap to clone; every clone shares the file handle.
#[derive(Debug, Clone)]
pub struct StoreReader {
    file: Arc<BackingFile>,
    resolver: Resolver,
}

impl StoreReader {
    pub fn new(file: Arc<BackingFile>, resolver: Resolver) -> Self {
        Self { file, resolver }
    }

    pub fn resolver(&self) -> &Resolver {
        &self.resolver
    }
}

impl RawStore for StoreReader {
    fn read(&self, addr: u64) -> Result<Bytes> {
        let (offset, nbytes) = self.resolver.resolve(addr)?;
        if nbytes < RECORD_CHECKSUM_SIZE {
            return Err(KeelError::RecordCorrupted {
                addr,
                reason: format!("record length {} is shorter than its checksum", nbytes),
            });
        }

        let mut buf = vec![0u8; nbytes as usize];
        match self.file.read_at(&mut buf, offset) {
            Ok(()) => {}
            Err(KeelError::Io(e)) if e.kind() == io::ErrorKind::UnexpectedEof => {
                return Err(KeelError::RecordCorrupted {
                    addr,
                    reason: "record extends past end of file".to_string(),
                });
            }
            Err(e) => return Err(e),
        }

        // Verify the trailing checksum before handing out the payload
        let payload_len = buf.len() - RECORD_CHECKSUM_SIZE as usize;
        let mut stored = [0u8; 4];
        stored.copy_from_slice(&buf[payload_len..]);
        let stored = u32::from_le_bytes(stored);
        let actual = crc32fast::hash(&buf[..payload_len]);
        if stored != actual {
            return Err(KeelError::RecordCorrupted {
                addr,
                reason: format!("checksum mismatch: stored {:08x}, computed {:08x}", stored, actual),
            });
        }

        buf.truncate(payload_len);
        Ok(Bytes::from(buf))
    }
}

// =============================================================================
// Space Writer
// =============================================================================

/// Where the next record goes
#[derive(Debug, Clone)]
enum Space {
    /// Append cursor
    Worm { next_offset: u64 },
    /// Slot allocator
    Rw { allocator: RwAllocator },
}

/// Writer-side record store used while building a commit
///
/// Owned by the single writer. Records written here are durable only after
/// the root block that references them has been written.
#[derive(Debug)]
pub struct SpaceWriter {
    reader: StoreReader,
    space: Space,
    /// Counter of the commit being built (tags deferred frees)
    commit_counter: u64,
    records_written: u64,
    bytes_written: u64,
}

impl SpaceWriter {
    /// Writer for an append-only store
    pub fn worm(reader: StoreReader, next_offset: u64) -> Self {
        Self {
            reader,
            space: Space::Worm { next_offset },
            commit_counter: 0,
            records_written: 0,
            bytes_written: 0,
        }
    }

    /// Writer for an allocator-based store
    pub fn rw(reader: StoreReader, allocator: RwAllocator) -> Self {
        Self {
            reader,
            space: Space::Rw { allocator },
            commit_counter: 0,
            records_written: 0,
            bytes_written: 0,
        }
    }

    /// Start building commit `commit_counter`
    pub fn begin_commit(&mut self, commit_counter: u64) {
        self.commit_counter = commit_counter;
    }

    /// `nextOffset` to record in the root block
    pub fn next_offset(&self) -> u64 {
        match &self.space {
            Space::Worm { next_offset } => *next_offset,
            Space::Rw { allocator } => allocator.extent(),
        }
    }

    pub fn allocator(&self) -> Option<&RwAllocator> {
        match &self.space {
            Space::Worm { .. } => None,
            Space::Rw { allocator } => Some(allocator),
        }
    }

    pub fn allocator_mut(&mut self) -> Option<&mut RwAllocator> {
        match &mut self.space {
            Space::Worm { .. } => None,
            Space::Rw { allocator } => Some(allocator),
        }
    }

    pub fn reader(&self) -> &StoreReader {
        &self.reader
    }

    /// Records and bytes written since the last call
    pub fn take_write_counters(&mut self) -> (u64, u64) {
        let counters = (self.records_written, self.bytes_written);
        self.records_written = 0;
        self.bytes_written = 0;
        counters
    }

    /// Persist the allocator state for this commit (RW only)
    ///
    /// The previous metabits record is released with this commit. The new
    /// record's own slots are not part of the serialized bitmap; they are
    /// claimed again when the metabits are loaded.
    pub fn write_metabits(&mut self, previous: u64) -> Result<u64> {
        let commit_counter = self.commit_counter;
        let payload = match &mut self.space {
            Space::Worm { .. } => return Ok(NULL_ADDR),
            Space::Rw { allocator } => {
                if previous != NULL_ADDR {
                    allocator.defer_free(previous, commit_counter);
                }
                allocator.to_bytes()?
            }
        };
        self.write(&payload)
    }

    fn write_framed(&mut self, framed: &[u8]) -> Result<u64> {
        let nbytes = framed.len() as u64;
        let codec = *self.reader.resolver.codec();
        codec.check_byte_count(nbytes)?;
        let max_offset = 1u64 << codec.offset_bits();

        let (addr, byte_offset) = match &mut self.space {
            Space::Worm { next_offset } => {
                let addr = codec.encode(*next_offset, nbytes)?;
                let byte_offset = *next_offset;
                *next_offset += nbytes;
                (addr, byte_offset)
            }
            Space::Rw { allocator } => {
                let slot = allocator.alloc(nbytes);
                let byte_offset = allocator.slot_offset(slot);
                let addr = match codec.encode(slot, nbytes) {
                    Ok(addr) => addr,
                    Err(e) => {
                        allocator.free(slot, nbytes);
                        return Err(e);
                    }
                };
                if byte_offset + nbytes > max_offset {
                    allocator.free(slot, nbytes);
                    return Err(KeelError::AddressOutOfRange {
                        what: "file offset",
                        value: byte_offset + nbytes,
                        bits: codec.offset_bits(),
                    });
                }
                (addr, byte_offset)
            }
        };

        self.reader.file.write_at(framed, byte_offset)?;
        self.records_written += 1;
        self.bytes_written += nbytes;
        Ok(addr)
    }
}

impl RawStore for SpaceWriter {
    fn read(&self, addr: u64) -> Result<Bytes> {
        self.reader.read(addr)
    }
}

impl RawStoreWriter for SpaceWriter {
    fn write(&mut self, data: &[u8]) -> Result<u64> {
        let framed = frame_record(data);
        self.write_framed(&framed)
    }

    fn delete(&mut self, addr: u64) {
        if addr == NULL_ADDR {
            return;
        }
        let commit_counter = self.commit_counter;
        if let Space::Rw { allocator } = &mut self.space {
            allocator.defer_free(addr, commit_counter);
        }
    }
}
