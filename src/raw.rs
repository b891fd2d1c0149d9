//! Raw Store Seam
//!
//! Address-to-bytes interface shared by the hash tree and the commit record
//! index. The file-backed store implements it for committed and in-flight
//! records; `MemoryStore` implements it for purely in-memory use.

use bytes::Bytes;

use crate::address::NULL_ADDR;
use crate::error::{KeelError, Result};

/// Read access to immutable records
pub trait RawStore {
    /// Read the record stored at `addr`
    fn read(&self, addr: u64) -> Result<Bytes>;
}

/// Write access: records are written once and never updated in place
pub trait RawStoreWriter: RawStore {
    /// Write a new record and return its address
    fn write(&mut self, data: &[u8]) -> Result<u64>;

    /// Mark a record as superseded
    ///
    /// The space is not reused while a retained commit may still reference
    /// it; WORM stores never reuse it at all.
    fn delete(&mut self, addr: u64);
}

impl<T: RawStore + ?Sized> RawStore for &T {
    fn read(&self, addr: u64) -> Result<Bytes> {
        (**self).read(addr)
    }
}

impl<T: RawStore + ?Sized> RawStore for &mut T {
    fn read(&self, addr: u64) -> Result<Bytes> {
        (**self).read(addr)
    }
}

// =============================================================================
// MemoryStore
// =============================================================================

/// In-memory record store
///
/// Addresses are 1-based record numbers. Deleted records stay readable so
/// that older roots keep resolving, the same way a WORM store behaves.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    records: Vec<Bytes>,
    deleted: usize,
    bytes_written: u64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of records written
    pub fn record_count(&self) -> usize {
        self.records.len()
    }

    /// Number of `delete` calls received
    pub fn deleted_count(&self) -> usize {
        self.deleted
    }

    /// Total payload bytes written
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }
}

impl RawStore for MemoryStore {
    fn read(&self, addr: u64) -> Result<Bytes> {
        if addr == NULL_ADDR {
            return Err(KeelError::RecordCorrupted {
                addr,
                reason: "read of null address".to_string(),
            });
        }
        self.records
            .get((addr - 1) as usize)
            .cloned()
            .ok_or_else(|| KeelError::RecordCorrupted {
                addr,
                reason: "no such record".to_string(),
            })
    }
}

impl RawStoreWriter for MemoryStore {
    fn write(&mut self, data: &[u8]) -> Result<u64> {
        self.records.push(Bytes::copy_from_slice(data));
        self.bytes_written += data.len() as u64;
        Ok(self.records.len() as u64)
    }

    fn delete(&mut self, _addr: u64) {
        self.deleted += 1;
    }
}
