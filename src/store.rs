//! Store Module
//!
//! The single-file store that ties the components together.
//!
//! ## Responsibilities
//! - Open or format the store file and recover the current root block
//! - Apply batches of index writes as atomic commits
//! - Hand out snapshots of the current or a historical commit
//! - Reclaim superseded RW space once no retained commit needs it
//!
//! ## Commit Sequence
//! ```text
//!   lock writer
//!     │
//!     ├─ reclaim released RW slots
//!     ├─ apply writes to dirty hash tree pages
//!     ├─ flush pages, commit record, commit index, metabits   (prepare)
//!     │
//!     └─ write inactive root block slot + sync                (commit)
//! ```
//! Nothing before the root block write changes what a reopened store sees.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use crate::address::{AddressCodec, StoreType, NULL_ADDR};
use crate::commit::{CommitIndexEntry, CommitRecord, CommitRecordIndex};
use crate::config::{HistoryRetention, StoreConfig};
use crate::error::{KeelError, Result};
use crate::htree::{HTreeConfig, HashTree};
use crate::metrics::{MetricsSnapshot, StoreMetrics};
use crate::raw::{RawStore, RawStoreWriter};
use crate::root_block::{
    CommitRequest, RecoveryReport, RootBlock, RootBlockFields, RootBlockManager,
};
use crate::snapshot::{Snapshot, SnapshotPin, SnapshotRegistry};
use crate::storage::{BackingFile, Resolver, RwAllocator, SpaceWriter, StoreReader};
use crate::writes::{PendingWrites, WriteOp};

/// Milliseconds since the Unix epoch
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// The store
///
/// ## Concurrency Model: Single-Writer / Multiple-Reader
///
/// - **Writes** (commit/prepare/close): serialized by the `writer` mutex,
///   which also owns both root block slots
/// - **Reads** (snapshots): take the current root block under a short read
///   lock, then read immutable pages without any store lock
pub struct Store {
    config: StoreConfig,
    htree: HTreeConfig,
    reader: StoreReader,

    /// Commit lock and everything only the writer touches
    writer: Mutex<WriterState>,

    /// Copy of the current root block for readers
    current: RwLock<RootBlock>,

    snapshots: Arc<SnapshotRegistry>,
    metrics: Arc<StoreMetrics>,

    /// Set once a fatal error is seen; writes are refused from then on
    poisoned: RwLock<Option<String>>,

    /// `None` when the store was formatted by this open
    recovery: Option<RecoveryReport>,
}

struct WriterState {
    root_blocks: RootBlockManager,
    work: WorkingSet,
}

/// Writer-side view of the current commit plus uncommitted changes
struct WorkingSet {
    space: SpaceWriter,
    index: CommitRecordIndex,
    /// Index roots of the commit being built
    roots: BTreeMap<String, u64>,
    /// Trees touched since the last commit
    trees: BTreeMap<String, HashTree>,
}

impl WorkingSet {
    /// Writer state matching a committed root block
    fn load(reader: &StoreReader, rb: &RootBlock, config: &StoreConfig) -> Result<Self> {
        let space = match rb.store_type() {
            StoreType::Worm => SpaceWriter::worm(reader.clone(), rb.next_offset()),
            StoreType::Rw => {
                let track_frees = matches!(config.history_retention, HistoryRetention::Commits(_));
                let allocator = if rb.meta_bits_addr() == NULL_ADDR {
                    RwAllocator::new(rb.meta_start_addr(), track_frees)
                } else {
                    let bytes = reader.read(rb.meta_bits_addr())?;
                    let mut allocator = RwAllocator::from_bytes(&bytes, track_frees)?;
                    // The metabits record is not part of its own bitmap
                    let (slot, nbytes) = reader.resolver().codec().decode(rb.meta_bits_addr())?;
                    allocator.claim(slot, nbytes);
                    allocator
                };
                SpaceWriter::rw(reader.clone(), allocator)
            }
        };

        let index = CommitRecordIndex::load(reader, rb.commit_record_index_addr())?;
        let roots = if rb.commit_record_addr() == NULL_ADDR {
            BTreeMap::new()
        } else {
            CommitRecord::read(reader, rb.commit_record_addr())?.roots
        };

        Ok(Self {
            space,
            index,
            roots,
            trees: BTreeMap::new(),
        })
    }
}

/// The working tree for `name`, created empty if the index does not exist
fn tree_or_create<'a>(
    trees: &'a mut BTreeMap<String, HashTree>,
    roots: &BTreeMap<String, u64>,
    name: &str,
    config: HTreeConfig,
) -> &'a mut HashTree {
    trees.entry(name.to_string()).or_insert_with(|| match roots.get(name) {
        Some(addr) => HashTree::load(config, *addr),
        None => HashTree::create(config),
    })
}

/// The working tree for `name`, if the index exists
fn existing_tree<'a>(
    trees: &'a mut BTreeMap<String, HashTree>,
    roots: &BTreeMap<String, u64>,
    name: &str,
    config: HTreeConfig,
) -> Option<&'a mut HashTree> {
    if !trees.contains_key(name) {
        let addr = roots.get(name)?;
        trees.insert(name.to_string(), HashTree::load(config, *addr));
    }
    trees.get_mut(name)
}

impl Store {
    // =========================================================================
    // Open
    // =========================================================================

    /// Open or create a store
    ///
    /// On startup:
    /// 1. Open (or create) the store file
    /// 2. Format a new file, or choose the current root block of an existing one
    /// 3. Adopt the addressing parameters recorded in the root block
    /// 4. Rebuild the writer state for the current commit
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;

        // Step 1: Open the file
        if !config.path.exists() && (!config.create_if_missing || config.read_only) {
            return Err(KeelError::Config(format!(
                "store file {} does not exist",
                config.path.display()
            )));
        }
        let (file, is_new) =
            BackingFile::open(&config.path, config.create_if_missing, config.read_only)?;
        let file = Arc::new(file);

        // Step 2: Format or recover
        let (root_blocks, recovery) = if is_new {
            let fields = RootBlockFields::initial(config.store_type, config.offset_bits, now_millis());
            let manager = RootBlockManager::format(Arc::clone(&file), &fields, config.double_sync)?;
            (manager, None)
        } else {
            let (manager, report) = RootBlockManager::open(Arc::clone(&file), config.double_sync)?;
            (manager, Some(report))
        };
        let current = root_blocks.current().clone();

        // Step 3: The root block wins over the config for creation-time settings
        if current.store_type() != config.store_type {
            warn!(
                configured = %config.store_type,
                stored = %current.store_type(),
                "Store type differs from configuration, using stored value"
            );
        }
        if current.offset_bits() != config.offset_bits {
            warn!(
                configured = config.offset_bits,
                stored = current.offset_bits(),
                "Offset bits differ from configuration, using stored value"
            );
        }
        let codec = AddressCodec::new(current.store_type(), current.offset_bits())?;
        config.check_record_capacity(&codec)?;
        let reader = StoreReader::new(Arc::clone(&file), Resolver::new(codec, current.meta_start_addr()));

        // Step 4: Writer state
        let work = WorkingSet::load(&reader, &current, &config)?;
        let horizon = work.space.allocator().map(|a| a.release_horizon()).unwrap_or(0);

        info!(
            path = %config.path.display(),
            uuid = %current.uuid(),
            store_type = %current.store_type(),
            commit_counter = current.commit_counter(),
            "Opened store"
        );

        let htree = HTreeConfig {
            address_bits: config.htree_address_bits,
            bucket_capacity: config.htree_bucket_capacity,
        };

        Ok(Self {
            config,
            htree,
            reader,
            writer: Mutex::new(WriterState { root_blocks, work }),
            current: RwLock::new(current),
            snapshots: Arc::new(SnapshotRegistry::new(horizon)),
            metrics: Arc::new(StoreMetrics::new()),
            poisoned: RwLock::new(None),
            recovery,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn uuid(&self) -> Uuid {
        self.current.read().uuid()
    }

    pub fn store_type(&self) -> StoreType {
        self.current.read().store_type()
    }

    /// The root block of the latest commit
    pub fn current_root_block(&self) -> RootBlock {
        self.current.read().clone()
    }

    /// What recovery found on open (`None` for a freshly formatted store)
    pub fn recovery_report(&self) -> Option<&RecoveryReport> {
        self.recovery.as_ref()
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        self.metrics.snapshot()
    }

    /// Commits below this counter may no longer be readable
    pub fn release_horizon(&self) -> u64 {
        self.snapshots.horizon()
    }

    /// Number of snapshots currently open
    pub fn open_snapshots(&self) -> usize {
        self.snapshots.open_count()
    }

    /// Why writes are disabled, if a fatal error occurred
    pub fn poison_reason(&self) -> Option<String> {
        self.poisoned.read().clone()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.read().is_some()
    }

    // =========================================================================
    // Write Path
    // =========================================================================

    /// Apply `writes` as one atomic commit
    pub fn commit(&self, writes: PendingWrites) -> Result<RootBlock> {
        self.prepare(writes)?.commit()
    }

    /// Write every record of a commit without making it current
    ///
    /// The returned handle holds the commit lock until it is committed,
    /// aborted or dropped.
    pub fn prepare(&self, writes: PendingWrites) -> Result<PreparedCommit<'_>> {
        let mut state = self.writer.lock();
        self.check_writable()?;

        let current = state.root_blocks.current().clone();
        if current.close_time() != 0 {
            return Err(KeelError::WritesDisabled(format!(
                "store closed for writes at {}",
                current.close_time()
            )));
        }

        let last = current.last_commit_time();
        let commit_time = match writes.commit_time() {
            Some(t) if t <= last => {
                return Err(KeelError::CommitOrder { last, attempted: t });
            }
            Some(t) => t,
            None => now_millis().max(last + 1),
        };

        match self.build_commit(&mut state.work, &current, &writes, commit_time) {
            Ok(request) => Ok(PreparedCommit {
                store: self,
                state,
                request,
                commit_counter: current.commit_counter() + 1,
                finished: false,
            }),
            Err(e) => {
                self.rollback(&mut state, Some(&e));
                Err(e)
            }
        }
    }

    fn build_commit(
        &self,
        work: &mut WorkingSet,
        current: &RootBlock,
        writes: &PendingWrites,
        commit_time: u64,
    ) -> Result<CommitRequest> {
        let commit_counter = current.commit_counter() + 1;
        work.space.begin_commit(commit_counter);

        // Step 1: Return space no retained commit can reach
        self.reclaim(work, current.commit_counter())?;

        // Step 2: Apply writes to dirty pages
        for op in writes.ops() {
            match op {
                WriteOp::Put { index, key, value } => {
                    let tree = tree_or_create(&mut work.trees, &work.roots, index, self.htree);
                    tree.insert(&work.space, key, value)?;
                }
                WriteOp::Delete { index, key } => {
                    if let Some(tree) = existing_tree(&mut work.trees, &work.roots, index, self.htree) {
                        tree.remove(&work.space, key)?;
                    }
                }
                WriteOp::DropIndex { index } => {
                    let tree = match work.trees.remove(index) {
                        Some(tree) => Some(tree),
                        None => work.roots.get(index).map(|addr| HashTree::load(self.htree, *addr)),
                    };
                    if let Some(tree) = tree {
                        let pages = tree.discard(&mut work.space)?;
                        trace!(index = %index, pages, "Dropped index");
                    }
                    work.roots.remove(index);
                }
            }
        }

        // Step 3: Flush dirty trees, children before parents
        for (name, tree) in work.trees.iter_mut() {
            if tree.is_dirty() {
                let root = tree.flush(&mut work.space)?;
                work.roots.insert(name.clone(), root);
            }
            self.metrics.record_splits(&tree.take_splits());
        }

        // Step 4: Commit record, superseding the previous one
        work.space.delete(current.commit_record_addr());
        let record = CommitRecord::new(commit_time, commit_counter, work.roots.clone());
        let commit_record_addr = record.write(&mut work.space)?;

        // Step 5: Commit index
        work.index.append(CommitIndexEntry {
            timestamp: commit_time,
            commit_counter,
            commit_record_addr,
        })?;
        let commit_record_index_addr = work.index.flush(&mut work.space)?;

        // Step 6: Allocator state (RW only), last so it covers every record above
        let meta_bits_addr = work.space.write_metabits(current.meta_bits_addr())?;

        Ok(CommitRequest {
            commit_time,
            commit_record_addr,
            commit_record_index_addr,
            next_offset: work.space.next_offset(),
            meta_bits_addr,
            quorum_token: writes.quorum_token().unwrap_or(current.quorum_token()),
        })
    }

    /// Release deferred frees below the new horizon
    fn reclaim(&self, work: &mut WorkingSet, current_counter: u64) -> Result<()> {
        let retained = match self.config.history_retention {
            HistoryRetention::KeepAll => return Ok(()),
            HistoryRetention::Commits(n) => n.max(1),
        };
        if work.space.allocator().is_none() {
            return Ok(());
        }

        // Keep the newest `retained` commits, counting the one being built
        let bound = (current_counter + 2).saturating_sub(retained).min(current_counter);
        let horizon = self.snapshots.advance(bound);

        let codec = *work.space.reader().resolver().codec();
        if let Some(allocator) = work.space.allocator_mut() {
            let freed = allocator.reclaim(&codec, horizon)?;
            if freed > 0 {
                trace!(freed, horizon, "Reclaimed superseded records");
                self.metrics.record_reclaimed(freed as u64);
            }
        }
        Ok(())
    }

    /// Write a final root block that refuses further commits
    pub fn close_for_writes(&self) -> Result<RootBlock> {
        let mut state = self.writer.lock();
        self.check_writable()?;

        let rb = state.root_blocks.close_for_writes(now_millis())?;
        *self.current.write() = rb.clone();

        info!(
            commit_counter = rb.commit_counter(),
            close_time = rb.close_time(),
            "Store closed for writes"
        );
        Ok(rb)
    }

    fn check_writable(&self) -> Result<()> {
        if let Some(reason) = self.poisoned.read().as_ref() {
            return Err(KeelError::WritesDisabled(reason.clone()));
        }
        if self.config.read_only {
            return Err(KeelError::WritesDisabled("store opened read-only".to_string()));
        }
        Ok(())
    }

    fn poison(&self, reason: String) {
        error!(%reason, "Store poisoned, further writes are disabled");
        let mut poisoned = self.poisoned.write();
        if poisoned.is_none() {
            *poisoned = Some(reason);
        }
    }

    /// Discard uncommitted writer state and reload it from the current root
    fn rollback(&self, state: &mut WriterState, cause: Option<&KeelError>) {
        self.metrics.record_abort();
        if let Some(e) = cause {
            if e.is_fatal() {
                self.poison(e.to_string());
            }
        }

        let current = state.root_blocks.current().clone();
        match WorkingSet::load(&self.reader, &current, &self.config) {
            Ok(work) => state.work = work,
            Err(e) => self.poison(format!("reloading writer state failed: {}", e)),
        }
        debug!(commit_counter = current.commit_counter(), "Rolled back uncommitted writes");
    }

    // =========================================================================
    // Read Path
    // =========================================================================

    /// Snapshot of the current commit
    pub fn snapshot(&self) -> Result<Snapshot> {
        let (rb, pin) = self.pin_current()?;
        self.open_snapshot(rb.commit_record_addr(), pin)
    }

    /// Snapshot of the latest commit at or before `timestamp`
    pub fn read_as_of(&self, timestamp: u64) -> Result<Snapshot> {
        // Hold the current commit while its index is read
        let (rb, _base) = self.pin_current()?;
        let index = CommitRecordIndex::load(&self.reader, rb.commit_record_index_addr())?;
        let entry = index
            .floor(&self.reader, timestamp)?
            .ok_or(KeelError::NoSuchCommit(timestamp))?;

        let pin = self.snapshots.pin(entry.commit_counter)?;
        self.open_snapshot(entry.commit_record_addr, pin)
    }

    /// Look up a key in the current commit
    pub fn get(&self, index: &str, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.snapshot()?.get(index, key)
    }

    /// Every commit in timestamp order
    pub fn commit_history(&self) -> Result<Vec<CommitIndexEntry>> {
        let (rb, _pin) = self.pin_current()?;
        let index = CommitRecordIndex::load(&self.reader, rb.commit_record_index_addr())?;
        index.iter(&self.reader).collect()
    }

    fn pin_current(&self) -> Result<(RootBlock, SnapshotPin)> {
        loop {
            let rb = self.current.read().clone();
            match self.snapshots.pin(rb.commit_counter()) {
                Ok(pin) => return Ok((rb, pin)),
                // The writer released this commit after we read it; the
                // next read sees a newer current commit
                Err(KeelError::HistoryReleased(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    fn open_snapshot(&self, commit_record_addr: u64, pin: SnapshotPin) -> Result<Snapshot> {
        let record = if commit_record_addr == NULL_ADDR {
            CommitRecord::default()
        } else {
            CommitRecord::read(&self.reader, commit_record_addr)?
        };
        Ok(Snapshot::new(
            self.reader.clone(),
            record,
            self.htree,
            Arc::clone(&self.metrics),
            pin,
        ))
    }
}

// =============================================================================
// Prepared Commit
// =============================================================================

/// A commit whose records are written but whose root block is not
///
/// Dropping it without calling `commit` aborts it.
pub struct PreparedCommit<'a> {
    store: &'a Store,
    state: MutexGuard<'a, WriterState>,
    request: CommitRequest,
    commit_counter: u64,
    finished: bool,
}

impl PreparedCommit<'_> {
    pub fn commit_time(&self) -> u64 {
        self.request.commit_time
    }

    /// Counter the commit will get
    pub fn commit_counter(&self) -> u64 {
        self.commit_counter
    }

    pub fn commit_record_addr(&self) -> u64 {
        self.request.commit_record_addr
    }

    /// Flip the root block; the commit is durable when this returns
    pub fn commit(mut self) -> Result<RootBlock> {
        self.finished = true;
        let request = self.request;

        match self.state.root_blocks.commit(request) {
            Ok(rb) => {
                *self.store.current.write() = rb.clone();
                let (records, bytes) = self.state.work.space.take_write_counters();
                self.store.metrics.record_commit(records, bytes);
                debug!(
                    commit_counter = rb.commit_counter(),
                    commit_time = rb.last_commit_time(),
                    records,
                    bytes,
                    "Committed"
                );
                Ok(rb)
            }
            Err(e) => {
                // The slot may be partly written; only recovery can tell
                self.store.poison(format!("root block write failed: {}", e));
                self.store.rollback(&mut self.state, Some(&e));
                Err(e)
            }
        }
    }

    /// Discard the prepared records
    pub fn abort(mut self) {
        self.finished = true;
        self.store.rollback(&mut self.state, None);
    }
}

impl Drop for PreparedCommit<'_> {
    fn drop(&mut self) {
        if !self.finished {
            self.store.rollback(&mut self.state, None);
        }
    }
}
