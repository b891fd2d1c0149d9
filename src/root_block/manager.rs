//! Root Block Manager
//!
//! Owns both root block slots for the lifetime of the store and implements
//! the commit flip and the recovery rule.
//!
//! ## Commit Flip
//! ```text
//!   current = slot 0 (counter N)
//!        │
//!        ▼
//!   [double sync] ─► write slot 1 (counter N+1) ─► sync ─► current = slot 1
//! ```
//!
//! ## Recovery
//! Both slots are read and validated. The valid slot with the larger commit
//! counter wins (slot 0 on a tie). A single valid slot wins regardless of
//! its counter. No valid slot means the store cannot be opened.

use std::sync::Arc;

use bytes::Bytes;
use tracing::{debug, info, warn};

use super::{slot_offset, RootBlock, RootBlockFields, ROOT_BLOCK_SIZE};
use crate::error::{KeelError, Result};
use crate::storage::BackingFile;

/// Values that change with each commit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommitRequest {
    /// Commit timestamp; must exceed the previous commit's
    pub commit_time: u64,
    pub commit_record_addr: u64,
    pub commit_record_index_addr: u64,
    pub next_offset: u64,
    /// Allocator metabits address (RW only, 0 for WORM)
    pub meta_bits_addr: u64,
    pub quorum_token: i64,
}

/// Outcome of choosing a root block on open
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Slot that became current
    pub chosen_slot: usize,
    /// Commit counter of the chosen slot
    pub commit_counter: u64,
    /// Slots whose Challis copies disagreed
    pub torn_slots: Vec<usize>,
    /// Slots rejected for any other reason, with the reason
    pub rejected: Vec<(usize, String)>,
}

impl RecoveryReport {
    /// True when both slots were valid
    pub fn is_clean(&self) -> bool {
        self.torn_slots.is_empty() && self.rejected.is_empty()
    }
}

/// Two-slot root block manager
#[derive(Debug)]
pub struct RootBlockManager {
    file: Arc<BackingFile>,
    current: RootBlock,
    double_sync: bool,
}

impl RootBlockManager {
    // =========================================================================
    // Open / Format
    // =========================================================================

    /// Initialize both slots of a new store with `fields`
    ///
    /// Both slots carry commit counter 0; slot 0 becomes current so the
    /// first commit lands in slot 1.
    pub fn format(file: Arc<BackingFile>, fields: &RootBlockFields, double_sync: bool) -> Result<Self> {
        let rb0 = RootBlock::new(true, fields)?;
        let rb1 = RootBlock::new(false, fields)?;

        file.write_at(&rb0.as_read_only_buffer(), slot_offset(0))?;
        file.write_at(&rb1.as_read_only_buffer(), slot_offset(1))?;
        file.sync()?;

        info!(
            uuid = %rb0.uuid(),
            store_type = %rb0.store_type(),
            offset_bits = rb0.offset_bits(),
            "Formatted new store"
        );

        Ok(Self {
            file,
            current: rb0,
            double_sync,
        })
    }

    /// Read both slots and choose the current root block
    pub fn open(file: Arc<BackingFile>, double_sync: bool) -> Result<(Self, RecoveryReport)> {
        let [rb0, rb1] = Self::read_slots(&file);
        let (current, report) = Self::choose(rb0, rb1)?;

        info!(
            slot = report.chosen_slot,
            commit_counter = report.commit_counter,
            last_commit_time = current.last_commit_time(),
            "Recovered root block"
        );

        Ok((
            Self {
                file,
                current,
                double_sync,
            },
            report,
        ))
    }

    /// Read and validate both slots without choosing
    pub fn read_slots(file: &BackingFile) -> [Result<RootBlock>; 2] {
        [Self::read_slot(file, 0), Self::read_slot(file, 1)]
    }

    fn read_slot(file: &BackingFile, slot: usize) -> Result<RootBlock> {
        let mut buf = vec![0u8; ROOT_BLOCK_SIZE];
        match file.read_at(&mut buf, slot_offset(slot)) {
            Ok(()) => {}
            Err(KeelError::Io(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(KeelError::InvalidRootBlock(format!(
                    "slot {} extends past end of file",
                    slot
                )));
            }
            Err(e) => return Err(e),
        }
        RootBlock::from_bytes(slot == 0, Bytes::from(buf))
    }

    /// Apply the recovery rule to the two slot read results
    pub fn choose(
        rb0: Result<RootBlock>,
        rb1: Result<RootBlock>,
    ) -> Result<(RootBlock, RecoveryReport)> {
        let mut torn_slots = Vec::new();
        let mut rejected = Vec::new();

        let mut note = |slot: usize, result: Result<RootBlock>| -> Result<Option<RootBlock>> {
            match result {
                Ok(rb) => Ok(Some(rb)),
                Err(KeelError::TornCommit { slot: torn }) => {
                    warn!(slot = torn, "Torn commit detected, ignoring root block");
                    torn_slots.push(torn);
                    Ok(None)
                }
                Err(KeelError::InvalidRootBlock(reason)) => {
                    warn!(slot, %reason, "Invalid root block, ignoring");
                    rejected.push((slot, reason));
                    Ok(None)
                }
                Err(e) => Err(e),
            }
        };

        let rb0 = note(0, rb0)?;
        let rb1 = note(1, rb1)?;

        let chosen = match (rb0, rb1) {
            (Some(a), Some(b)) => {
                if b.commit_counter() > a.commit_counter() {
                    b
                } else {
                    a
                }
            }
            (Some(a), None) => a,
            (None, Some(b)) => b,
            (None, None) => {
                return Err(KeelError::Unrecoverable(
                    "neither root block is valid".to_string(),
                ));
            }
        };

        let report = RecoveryReport {
            chosen_slot: chosen.slot(),
            commit_counter: chosen.commit_counter(),
            torn_slots,
            rejected,
        };
        Ok((chosen, report))
    }

    // =========================================================================
    // Commit
    // =========================================================================

    /// The current root block
    pub fn current(&self) -> &RootBlock {
        &self.current
    }

    pub fn double_sync(&self) -> bool {
        self.double_sync
    }

    /// Make a new commit current by writing the inactive slot
    ///
    /// Every record the commit references must already be written.
    pub fn commit(&mut self, req: CommitRequest) -> Result<RootBlock> {
        self.check_writable()?;

        let last = self.current.last_commit_time();
        if req.commit_time <= last {
            return Err(KeelError::CommitOrder {
                last,
                attempted: req.commit_time,
            });
        }

        let mut fields = self.current.fields();
        fields.commit_counter += 1;
        if fields.first_commit_time == 0 {
            fields.first_commit_time = req.commit_time;
        }
        fields.last_commit_time = req.commit_time;
        fields.commit_record_addr = req.commit_record_addr;
        fields.commit_record_index_addr = req.commit_record_index_addr;
        fields.next_offset = req.next_offset;
        fields.meta_bits_addr = req.meta_bits_addr;
        fields.quorum_token = req.quorum_token;

        let rb = RootBlock::new(!self.current.is_root_block0(), &fields)?;
        self.write_root_block(rb)
    }

    /// Write a root block that disallows any further commit
    ///
    /// The close is itself a commit: the counter advances and the other
    /// slot is written.
    pub fn close_for_writes(&mut self, close_time: u64) -> Result<RootBlock> {
        self.check_writable()?;

        let mut fields = self.current.fields();
        fields.commit_counter += 1;
        fields.close_time = close_time.max(1);

        let rb = RootBlock::new(!self.current.is_root_block0(), &fields)?;
        self.write_root_block(rb)
    }

    fn check_writable(&self) -> Result<()> {
        if self.current.close_time() != 0 {
            return Err(KeelError::WritesDisabled(format!(
                "store closed for writes at {}",
                self.current.close_time()
            )));
        }
        if self.file.is_read_only() {
            return Err(KeelError::WritesDisabled("store opened read-only".to_string()));
        }
        Ok(())
    }

    fn write_root_block(&mut self, rb: RootBlock) -> Result<RootBlock> {
        // Step 1: Make the records the new block references durable first
        if self.double_sync {
            self.file.sync()?;
        }

        // Step 2: Overwrite the inactive slot
        self.file.write_at(&rb.as_read_only_buffer(), slot_offset(rb.slot()))?;

        // Step 3: The flip is durable once this returns
        self.file.sync()?;

        debug!(
            slot = rb.slot(),
            commit_counter = rb.commit_counter(),
            commit_record_addr = rb.commit_record_addr(),
            next_offset = rb.next_offset(),
            "Wrote root block"
        );

        self.current = rb.clone();
        Ok(rb)
    }
}
