//! Pending Writes
//!
//! A batch of index mutations applied atomically by one commit.

/// One mutation of a named index
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOp {
    /// Insert or overwrite a key
    Put {
        index: String,
        key: Vec<u8>,
        value: Vec<u8>,
    },

    /// Remove a key (no-op if absent)
    Delete { index: String, key: Vec<u8> },

    /// Remove an index and everything in it
    DropIndex { index: String },
}

impl WriteOp {
    /// Name of the index this operation touches
    pub fn index(&self) -> &str {
        match self {
            WriteOp::Put { index, .. } | WriteOp::Delete { index, .. } | WriteOp::DropIndex { index } => {
                index
            }
        }
    }
}

/// Ordered batch of writes for one commit
///
/// Operations apply in the order they were added, so a later `put` of the
/// same key wins.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PendingWrites {
    ops: Vec<WriteOp>,
    commit_time: Option<u64>,
    quorum_token: Option<i64>,
}

impl PendingWrites {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(
        &mut self,
        index: impl Into<String>,
        key: impl Into<Vec<u8>>,
        value: impl Into<Vec<u8>>,
    ) -> &mut Self {
        self.ops.push(WriteOp::Put {
            index: index.into(),
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, index: impl Into<String>, key: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(WriteOp::Delete {
            index: index.into(),
            key: key.into(),
        });
        self
    }

    pub fn drop_index(&mut self, index: impl Into<String>) -> &mut Self {
        self.ops.push(WriteOp::DropIndex {
            index: index.into(),
        });
        self
    }

    /// Use an explicit commit timestamp instead of the store clock
    pub fn with_commit_time(mut self, timestamp: u64) -> Self {
        self.commit_time = Some(timestamp);
        self
    }

    /// Record a replication quorum token in the root block
    pub fn with_quorum_token(mut self, token: i64) -> Self {
        self.quorum_token = Some(token);
        self
    }

    pub fn ops(&self) -> &[WriteOp] {
        &self.ops
    }

    pub fn commit_time(&self) -> Option<u64> {
        self.commit_time
    }

    pub fn quorum_token(&self) -> Option<i64> {
        self.quorum_token
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append another batch after this one
    ///
    /// The larger explicit commit time and the later quorum token win.
    pub fn merge(&mut self, other: PendingWrites) {
        self.ops.extend(other.ops);
        if let Some(t) = other.commit_time {
            self.commit_time = Some(self.commit_time.map_or(t, |own| own.max(t)));
        }
        if other.quorum_token.is_some() {
            self.quorum_token = other.quorum_token;
        }
    }
}
