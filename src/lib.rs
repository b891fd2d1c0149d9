//! # KeelStore
//!
//! A single-file journal store with:
//! - Dual root block commits (Challis algorithm) for atomic, crash-safe commits
//! - Recovery that ignores torn or corrupted root blocks
//! - Copy-on-write extensible hash tree indices
//! - Historical reads as of any retained commit
//! - Single-writer/multi-reader concurrency with group commit
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │              Store  (commit lock, snapshots)                 │
//! │        GroupCommitter ──► Store::commit(PendingWrites)       │
//! └──────────┬──────────────────┬──────────────────┬────────────┘
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//!   ┌────────────────┐ ┌────────────────┐ ┌──────────────────┐
//!   │   HashTree     │ │ CommitRecord + │ │ RootBlockManager │
//!   │ (dir/bucket    │ │ CommitRecord-  │ │ (slot 0 / 1)     │
//!   │  pages)        │ │ Index          │ │                  │
//!   └───────┬────────┘ └───────┬────────┘ └────────┬─────────┘
//!           │                  │                   │
//!           ▼                  ▼                   │
//!   ┌─────────────────────────────────────┐        │
//!   │ RawStore: SpaceWriter / StoreReader │        │
//!   │ (AddressCodec, RW allocator, CRC)   │        │
//!   └──────────────────┬──────────────────┘        │
//!                      ▼                           ▼
//!   ┌─────────────────────────────────────────────────────────────┐
//!   │ store file: [root block 0][root block 1][data area ...]     │
//!   └─────────────────────────────────────────────────────────────┘
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;

pub mod address;
pub mod raw;
pub mod storage;
pub mod root_block;
pub mod commit;
pub mod htree;
pub mod metrics;
pub mod writes;
pub mod snapshot;
pub mod store;
pub mod group_commit;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{KeelError, Result};
pub use config::{HistoryRetention, StoreConfig, StoreConfigBuilder};
pub use address::{AddressCodec, StoreType, NULL_ADDR};
pub use raw::{MemoryStore, RawStore, RawStoreWriter};
pub use root_block::{RecoveryReport, RootBlock, RootBlockManager};
pub use commit::{CommitIndexEntry, CommitRecord, CommitRecordIndex};
pub use htree::{HTreeConfig, HashTree};
pub use metrics::{MetricsSnapshot, StoreMetrics};
pub use writes::{PendingWrites, WriteOp};
pub use snapshot::Snapshot;
pub use store::{PreparedCommit, Store};
pub use group_commit::{CommitTicket, GroupCommitter};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of KeelStore
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
