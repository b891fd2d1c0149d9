//! Configuration for KeelStore
//!
//! Centralized configuration with sensible defaults.

use std::path::PathBuf;

use crate::address::{
    AddressCodec, StoreType, DEFAULT_OFFSET_BITS, MAX_OFFSET_BITS, MIN_OFFSET_BITS,
};
use crate::commit::MAX_LEAF_BYTES;
use crate::error::{KeelError, Result};
use crate::htree::DirectoryPage;
use crate::storage::RECORD_CHECKSUM_SIZE;

/// Largest directory page: 2^16 entries
pub const MAX_HTREE_ADDRESS_BITS: u8 = 16;

/// Main configuration for a KeelStore instance
#[derive(Debug, Clone)]
pub struct StoreConfig {
    // -------------------------------------------------------------------------
    // Store File Configuration
    // -------------------------------------------------------------------------
    /// Path of the single store file
    /// Internal structure:
    ///   [0, 256)     root block slot 0
    ///   [256, 512)   root block slot 1
    ///   [512, ...)   data area
    pub path: PathBuf,

    /// Create the store if the file does not exist
    pub create_if_missing: bool,

    /// Open without write access (commits are rejected)
    pub read_only: bool,

    // -------------------------------------------------------------------------
    // Addressing Configuration (fixed at creation)
    // -------------------------------------------------------------------------
    /// WORM (append-only) or RW (slot allocator)
    pub store_type: StoreType,

    /// Bits of each address reserved for the byte offset
    pub offset_bits: u32,

    /// How long superseded pages stay readable in RW stores
    pub history_retention: HistoryRetention,

    // -------------------------------------------------------------------------
    // Durability Configuration
    // -------------------------------------------------------------------------
    /// Sync data before and after writing the root block
    /// (for media that reorder writes)
    pub double_sync: bool,

    // -------------------------------------------------------------------------
    // Hash Tree Configuration
    // -------------------------------------------------------------------------
    /// Maximum global depth of one directory page
    pub htree_address_bits: u8,

    /// Key/value slots per bucket page before it splits
    pub htree_bucket_capacity: usize,
}

/// History retention policy for RW stores
///
/// WORM stores never reuse space, so every commit stays readable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryRetention {
    /// Never reclaim superseded pages; every commit stays readable
    KeepAll,

    /// Keep the last N commits readable (plus any open snapshot)
    Commits(u64),
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./keelstore.jnl"),
            create_if_missing: true,
            read_only: false,
            store_type: StoreType::Worm,
            offset_bits: DEFAULT_OFFSET_BITS,
            history_retention: HistoryRetention::KeepAll,
            double_sync: false,
            htree_address_bits: 10,
            htree_bucket_capacity: 32,
        }
    }
}

impl StoreConfig {
    /// Create a new config builder
    pub fn builder() -> StoreConfigBuilder {
        StoreConfigBuilder::default()
    }

    /// Reject values the store cannot work with
    pub fn validate(&self) -> Result<()> {
        if !(MIN_OFFSET_BITS..=MAX_OFFSET_BITS).contains(&self.offset_bits) {
            return Err(KeelError::Config(format!(
                "offset_bits must be in [{}, {}], got {}",
                MIN_OFFSET_BITS, MAX_OFFSET_BITS, self.offset_bits
            )));
        }
        if self.htree_address_bits == 0 || self.htree_address_bits > MAX_HTREE_ADDRESS_BITS {
            return Err(KeelError::Config(format!(
                "htree_address_bits must be in [1, {}], got {}",
                MAX_HTREE_ADDRESS_BITS, self.htree_address_bits
            )));
        }
        if self.htree_bucket_capacity == 0 {
            return Err(KeelError::Config(
                "htree_bucket_capacity must be at least 1".to_string(),
            ));
        }
        self.check_record_capacity(&AddressCodec::new(self.store_type, self.offset_bits)?)
    }

    /// Reject an address layout too narrow for the store's own pages
    ///
    /// The largest directory page and a full commit index leaf must fit in
    /// one record. Also checked against the stored layout on open.
    pub fn check_record_capacity(&self, codec: &AddressCodec) -> Result<()> {
        let largest = DirectoryPage::encoded_len(self.htree_address_bits).max(MAX_LEAF_BYTES)
            + RECORD_CHECKSUM_SIZE;
        if largest > codec.max_byte_count() {
            return Err(KeelError::Config(format!(
                "{} offset bits leave {} byte records, but pages need up to {} bytes \
                 (htree_address_bits = {})",
                codec.offset_bits(),
                codec.max_byte_count(),
                largest,
                self.htree_address_bits
            )));
        }
        Ok(())
    }
}

/// Builder for StoreConfig
#[derive(Default)]
pub struct StoreConfigBuilder {
    config: StoreConfig,
}

impl StoreConfigBuilder {
    /// Set the store file path
    pub fn path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.path = path.into();
        self
    }

    /// Create the store file when it does not exist
    pub fn create_if_missing(mut self, create: bool) -> Self {
        self.config.create_if_missing = create;
        self
    }

    /// Open the store read-only
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.config.read_only = read_only;
        self
    }

    /// Set the addressing discipline (only used when creating)
    pub fn store_type(mut self, store_type: StoreType) -> Self {
        self.config.store_type = store_type;
        self
    }

    /// Set the address offset width (only used when creating)
    pub fn offset_bits(mut self, bits: u32) -> Self {
        self.config.offset_bits = bits;
        self
    }

    /// Set the RW history retention policy
    pub fn history_retention(mut self, retention: HistoryRetention) -> Self {
        self.config.history_retention = retention;
        self
    }

    /// Enable or disable double sync around the root block write
    pub fn double_sync(mut self, enabled: bool) -> Self {
        self.config.double_sync = enabled;
        self
    }

    /// Set the maximum directory page global depth
    pub fn htree_address_bits(mut self, bits: u8) -> Self {
        self.config.htree_address_bits = bits;
        self
    }

    /// Set the bucket page capacity
    pub fn htree_bucket_capacity(mut self, capacity: usize) -> Self {
        self.config.htree_bucket_capacity = capacity;
        self
    }

    pub fn build(self) -> StoreConfig {
        self.config
    }
}
