//! Group Commit
//!
//! Batches writes from many threads into fewer physical commits.
//!
//! ```text
//!   submitter ─┐
//!   submitter ─┼──► channel ──► committer thread ──► Store::commit(merged)
//!   submitter ─┘                     │
//!        ▲                           │ one root block per batch
//!        └──────── reply ◄───────────┘
//! ```
//! Every submitter in a batch receives the same root block. If the merged
//! commit fails, every submitter in the batch gets the error.

use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Receiver, Sender};
use tracing::{debug, info};

use crate::error::{KeelError, Result};
use crate::root_block::RootBlock;
use crate::store::Store;
use crate::writes::PendingWrites;

struct Submission {
    writes: PendingWrites,
    reply: Sender<Result<RootBlock>>,
}

/// Handle for one submitted batch of writes
pub struct CommitTicket {
    receiver: Receiver<Result<RootBlock>>,
}

impl CommitTicket {
    /// Block until the physical commit containing these writes is done
    pub fn wait(self) -> Result<RootBlock> {
        self.receiver
            .recv()
            .map_err(|_| KeelError::GroupCommit("committer stopped before replying".to_string()))?
    }
}

/// Background committer shared by many writers
pub struct GroupCommitter {
    sender: Option<Sender<Submission>>,
    handle: Option<JoinHandle<()>>,
}

impl GroupCommitter {
    /// Start the committer thread; at most `max_batch` submissions are
    /// merged into one commit
    pub fn start(store: Arc<Store>, max_batch: usize) -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let max_batch = max_batch.max(1);
        let handle = thread::Builder::new()
            .name("keelstore-group-commit".to_string())
            .spawn(move || run_committer(store, receiver, max_batch))?;

        info!(max_batch, "Started group committer");
        Ok(Self {
            sender: Some(sender),
            handle: Some(handle),
        })
    }

    /// Queue writes without waiting
    pub fn enqueue(&self, writes: PendingWrites) -> Result<CommitTicket> {
        let sender = self
            .sender
            .as_ref()
            .ok_or_else(|| KeelError::GroupCommit("committer shut down".to_string()))?;
        let (reply, receiver) = channel::bounded(1);
        sender
            .send(Submission { writes, reply })
            .map_err(|_| KeelError::GroupCommit("committer stopped".to_string()))?;
        Ok(CommitTicket { receiver })
    }

    /// Queue writes and wait for their commit
    pub fn submit(&self, writes: PendingWrites) -> Result<RootBlock> {
        self.enqueue(writes)?.wait()
    }

    /// Commit everything already queued, then stop the thread
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        // Closing the channel ends the committer loop once it is drained
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for GroupCommitter {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_committer(store: Arc<Store>, receiver: Receiver<Submission>, max_batch: usize) {
    while let Ok(first) = receiver.recv() {
        let mut batch = vec![first];
        while batch.len() < max_batch {
            match receiver.try_recv() {
                Ok(submission) => batch.push(submission),
                Err(_) => break,
            }
        }

        let mut merged = PendingWrites::new();
        let mut replies = Vec::with_capacity(batch.len());
        for submission in batch {
            merged.merge(submission.writes);
            replies.push(submission.reply);
        }

        let ops = merged.len();
        let result = store.commit(merged);
        debug!(
            submissions = replies.len(),
            ops,
            ok = result.is_ok(),
            "Group commit"
        );

        for reply in replies {
            let outcome = match &result {
                Ok(rb) => Ok(rb.clone()),
                Err(e) => Err(KeelError::GroupCommit(e.to_string())),
            };
            // A submitter that gave up waiting is not an error
            let _ = reply.send(outcome);
        }
    }
    debug!("Group committer stopped");
}
