//! Error types for KeelStore
//!
//! Provides a unified error type for all operations.

use thiserror::Error;

/// Result type alias using KeelError
pub type Result<T> = std::result::Result<T, KeelError>;

/// Unified error type for KeelStore operations
#[derive(Debug, Error)]
pub enum KeelError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Root Block Errors
    // -------------------------------------------------------------------------
    /// Magic or checksum mismatch in a root block slot
    #[error("Invalid root block: {0}")]
    InvalidRootBlock(String),

    /// Head and tail Challis fields disagree (slot was being written)
    #[error("Torn commit detected in root block slot {slot}")]
    TornCommit { slot: usize },

    /// Neither root block slot is valid
    #[error("Store is unrecoverable: {0}")]
    Unrecoverable(String),

    // -------------------------------------------------------------------------
    // Addressing Errors
    // -------------------------------------------------------------------------
    #[error("Address out of range: {what} {value} does not fit in {bits} bits")]
    AddressOutOfRange {
        what: &'static str,
        value: u64,
        bits: u32,
    },

    // -------------------------------------------------------------------------
    // Page / Record Errors
    // -------------------------------------------------------------------------
    /// A persisted page violates a structural invariant (corruption)
    #[error("Structural invariant violation: {0}")]
    StructuralInvariantViolation(String),

    #[error("Record {addr:#x} is corrupted: {reason}")]
    RecordCorrupted { addr: u64, reason: String },

    /// A record longer than the address byte count can describe
    #[error("Record of {nbytes} bytes exceeds the {max} byte limit")]
    RecordTooLarge { nbytes: u64, max: u64 },

    #[error("Serialization error: {0}")]
    Serialization(String),

    // -------------------------------------------------------------------------
    // Commit Errors
    // -------------------------------------------------------------------------
    #[error("Commit time {attempted} is not after last commit time {last}")]
    CommitOrder { last: u64, attempted: u64 },

    #[error("No commit at or before timestamp {0}")]
    NoSuchCommit(u64),

    #[error("History for commit {0} has been released")]
    HistoryReleased(u64),

    #[error("Writes disabled: {0}")]
    WritesDisabled(String),

    #[error("Group commit failed: {0}")]
    GroupCommit(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<bincode::Error> for KeelError {
    fn from(e: bincode::Error) -> Self {
        KeelError::Serialization(e.to_string())
    }
}

impl KeelError {
    /// True for errors that mean the store must stop accepting writes
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            KeelError::StructuralInvariantViolation(_)
                | KeelError::Unrecoverable(_)
                | KeelError::AddressOutOfRange { .. }
        )
    }
}
