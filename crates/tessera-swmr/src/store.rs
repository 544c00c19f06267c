//! Single-writer multi-reader store.
//!
//! Committed states are immutable: a writer copies every node it changes
//! and publishes the new state by writing a metadata slot. Readers open
//! snapshots of any retained commit while the writer works.

use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tessera_common::{BlockId, CommitId, Result, StoreConfig, TesseraError};
use tessera_node::{NodeBlock, NodeSource};
use tracing::{info, warn};

use crate::allocation::{Allocation, AllocationMap, AllocationPool, AllocationStatus};
use crate::block_store::{BlockStore, FileBlockStore, METADATA_SLOTS, MemoryBlockStore};
use crate::commit::{ConsistencyPoint, WritableCommit};
use crate::commit_store::CommitBase;
use crate::counters::RefCounters;
use crate::descriptor::{CommitDescriptor, CommitInfo};
use crate::history::History;
use crate::snapshot::ReadOnlySnapshot;
use crate::superblock::{CommitMetadata, newest_slot};

/// Mutable store state, guarded by the store lock.
pub(crate) struct StoreState {
    pub store_id: u64,
    pub head: Option<Arc<CommitDescriptor>>,
    pub commits: BTreeMap<CommitId, Arc<CommitDescriptor>>,
    pub head_map: Arc<AllocationMap>,
    /// Allocation map of the last consistency point.
    pub cp_map: Arc<AllocationMap>,
    pub pool: AllocationPool,
    pub counters: Arc<RefCounters>,
    pub cp_postponed: Vec<Allocation>,
    pub sequence: u64,
    pub cp_sequence: u64,
    /// Slot holding the last consistency point.
    pub cp_slot: usize,
}

impl StoreState {
    pub(crate) fn head(&self) -> Result<&Arc<CommitDescriptor>> {
        self.head
            .as_ref()
            .ok_or_else(|| TesseraError::Internal("store has no committed state".to_string()))
    }

    pub(crate) fn base(&self) -> CommitBase {
        CommitBase {
            map: self.head_map.clone(),
            cp_map: self.cp_map.clone(),
            pool: self.pool.clone(),
            counters: self.counters.clone(),
            cp_postponed: self.cp_postponed.clone(),
        }
    }
}

/// Result of a prepared commit, applied to the store state on commit.
pub(crate) struct FinishedCommit {
    pub descriptor: Arc<CommitDescriptor>,
    pub metadata: Vec<u8>,
    pub map: AllocationMap,
    pub pool: AllocationPool,
    pub counters: RefCounters,
    pub cp_postponed: Vec<Allocation>,
    pub evicted: Vec<Arc<CommitDescriptor>>,
    pub reparented: Vec<(Arc<CommitDescriptor>, Option<CommitId>)>,
}

pub struct StoreInner {
    pub(crate) config: StoreConfig,
    pub(crate) blocks: Box<dyn BlockStore>,
    pub(crate) node_level: usize,
    pub(crate) state: Mutex<StoreState>,
    writer_active: AtomicBool,
}

impl StoreInner {
    pub(crate) fn acquire_writer(&self) -> Result<()> {
        self.writer_active
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(|_| TesseraError::WriterActive)
    }

    pub(crate) fn release_writer(&self) {
        self.writer_active.store(false, Ordering::Release);
    }

    /// Publishes a prepared commit as the new HEAD.
    pub(crate) fn do_commit(&self, done: FinishedCommit) -> Result<()> {
        let mut state = self.state.lock();
        let consistency_point = done.descriptor.is_consistency_point();
        let slot = 1 - state.cp_slot;
        let sync = consistency_point && self.config.fsync_enabled;
        if sync {
            self.blocks.sync()?;
        }
        self.blocks.write_slot(slot, &done.metadata)?;
        if sync {
            self.blocks.sync()?;
        }

        for evicted in &done.evicted {
            state.commits.remove(&evicted.id());
        }
        for (descriptor, parent) in done.reparented {
            descriptor.set_parent(parent);
        }
        let id = done.descriptor.id();
        state.sequence = done.descriptor.sequence();
        state.head_map = Arc::new(done.map);
        if consistency_point {
            state.cp_map = state.head_map.clone();
            state.cp_sequence = state.sequence;
            state.cp_slot = slot;
        }
        state.pool = done.pool;
        state.counters = Arc::new(done.counters);
        state.cp_postponed = done.cp_postponed;
        state.commits.insert(id, done.descriptor.clone());
        state.head = Some(done.descriptor);
        info!(
            commit_id = %id,
            sequence = state.sequence,
            slot,
            consistency_point,
            evicted = done.evicted.len(),
            "commit finished"
        );
        Ok(())
    }

    pub(crate) fn block_size(&self) -> usize {
        self.config.node_block_size
    }

    pub(crate) fn read_node(&self, id: BlockId) -> Result<NodeBlock> {
        let mut buf = vec![0u8; self.config.node_block_size];
        self.blocks.read(id.as_u64(), &mut buf)?;
        let node = NodeBlock::from_bytes(&buf)?;
        if node.block_id() != id {
            return Err(TesseraError::BlockCorrupted {
                block_id: id.0,
                reason: format!("block carries id {}", node.block_id()),
            });
        }
        Ok(node)
    }
}

impl NodeSource for StoreInner {
    fn block_size(&self) -> usize {
        StoreInner::block_size(self)
    }

    fn read_node(&self, id: BlockId) -> Result<NodeBlock> {
        StoreInner::read_node(self, id)
    }
}

/// A copy-on-write store with one writable commit at a time and any
/// number of read-only snapshots.
#[derive(Clone)]
pub struct SwmrStore {
    inner: Arc<StoreInner>,
}

impl SwmrStore {
    /// Creates a file-backed store at `config.store_path()`.
    pub fn create(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let blocks = FileBlockStore::create(
            &config.store_path(),
            config.basic_block_size,
            config.metadata_slot_size,
            config.initial_arena_blocks,
        )?;
        Self::initialize(config, Box::new(blocks))
    }

    /// Creates a store kept in memory.
    pub fn create_in_memory(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let blocks = MemoryBlockStore::new(
            config.basic_block_size,
            config.metadata_slot_size,
            config.initial_arena_blocks,
        );
        Self::initialize(config, Box::new(blocks))
    }

    fn initialize(config: StoreConfig, blocks: Box<dyn BlockStore>) -> Result<Self> {
        let map = Arc::new(AllocationMap::new(blocks.arena_blocks(), config.pool.levels)?);
        let state = StoreState {
            store_id: rand::random(),
            head: None,
            commits: BTreeMap::new(),
            head_map: map.clone(),
            cp_map: map,
            pool: AllocationPool::new(config.pool.clone()),
            counters: Arc::new(RefCounters::new()),
            cp_postponed: Vec::new(),
            sequence: 0,
            cp_sequence: 0,
            cp_slot: METADATA_SLOTS - 1,
        };
        let store = Self {
            inner: Arc::new(StoreInner {
                node_level: config.node_level(),
                config,
                blocks,
                state: Mutex::new(state),
                writer_active: AtomicBool::new(false),
            }),
        };
        let commit = WritableCommit::init_store_commit(store.inner.clone())?;
        store.finish_store_initialization(commit)?;
        Ok(store)
    }

    /// Commits the initial state as the first consistency point.
    fn finish_store_initialization(&self, mut commit: WritableCommit) -> Result<()> {
        let id = commit.commit(ConsistencyPoint::Yes)?;
        let state = self.inner.state.lock();
        info!(store_id = state.store_id, commit_id = %id, "created store");
        Ok(())
    }

    /// Opens an existing file-backed store, recovering the newest valid
    /// metadata slot.
    pub fn open(config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let blocks = FileBlockStore::open(
            &config.store_path(),
            config.basic_block_size,
            config.metadata_slot_size,
        )?;
        Self::recover(config, Box::new(blocks))
    }

    fn recover(config: StoreConfig, blocks: Box<dyn BlockStore>) -> Result<Self> {
        let mut slots = Vec::with_capacity(METADATA_SLOTS);
        for slot in 0..METADATA_SLOTS {
            let meta = match blocks.read_slot(slot)? {
                Some(bytes) => match CommitMetadata::decode(&bytes) {
                    Ok(meta) => Some(meta),
                    Err(err) => {
                        warn!(slot, error = %err, "skipping invalid metadata slot");
                        None
                    }
                },
                None => None,
            };
            slots.push(meta);
        }
        let newest = newest_slot(&slots)
            .ok_or_else(|| TesseraError::SuperblockCorrupted("no valid metadata slot".to_string()))?;
        let head_meta = slots[newest]
            .take()
            .ok_or_else(|| TesseraError::Internal("selected slot is empty".to_string()))?;
        let other = slots[1 - newest].take();
        let sb = head_meta.superblock;

        let head_map = Arc::new(AllocationMap::from_bytes(&head_meta.allocation_map)?);
        let (cp_map, cp_slot, cp_sequence) = if sb.is_consistency_point() {
            (head_map.clone(), newest, sb.sequence)
        } else {
            match other {
                Some(cp)
                    if cp.superblock.is_consistency_point()
                        && cp.superblock.store_id == sb.store_id
                        && cp.superblock.sequence == sb.cp_sequence =>
                {
                    let map = Arc::new(AllocationMap::from_bytes(&cp.allocation_map)?);
                    (map, 1 - newest, sb.cp_sequence)
                }
                _ => {
                    warn!(
                        sequence = sb.sequence,
                        cp_sequence = sb.cp_sequence,
                        "last consistency point is unreadable, using the newest commit"
                    );
                    (head_map.clone(), newest, sb.sequence)
                }
            }
        };

        let state = StoreState {
            store_id: sb.store_id,
            head: None,
            commits: BTreeMap::new(),
            head_map,
            cp_map,
            pool: AllocationPool::load(&head_meta.pool, config.pool.clone())?,
            counters: Arc::new(RefCounters::from_bytes(&head_meta.counters)?),
            cp_postponed: head_meta.cp_postponed,
            sequence: sb.sequence,
            cp_sequence,
            cp_slot,
        };
        let inner = Arc::new(StoreInner {
            node_level: config.node_level(),
            config,
            blocks,
            state: Mutex::new(state),
            writer_active: AtomicBool::new(false),
        });

        let history = History::open(&*inner, inner.config.node_config(), sb.history_root)?;
        let mut commits = BTreeMap::new();
        for record in history.records(&*inner)? {
            let history_root = if record.info.id == sb.commit_id {
                sb.history_root
            } else {
                record.history_root
            };
            if !history_root.is_valid() {
                return Err(TesseraError::SuperblockCorrupted(format!(
                    "commit {} has no history root",
                    record.info.id
                )));
            }
            let descriptor = CommitDescriptor::new(&record.info, record.directory_root, history_root);
            commits.insert(record.info.id, Arc::new(descriptor));
        }
        let head = commits.get(&sb.commit_id).cloned().ok_or_else(|| {
            TesseraError::SuperblockCorrupted(format!(
                "head commit {} is missing from history",
                sb.commit_id
            ))
        })?;
        if head.directory_root() != sb.directory_root {
            return Err(TesseraError::SuperblockCorrupted(format!(
                "head commit {} lists directory {}, superblock {}",
                sb.commit_id,
                head.directory_root(),
                sb.directory_root
            )));
        }
        {
            let mut state = inner.state.lock();
            state.commits = commits;
            state.head = Some(head);
        }
        info!(
            store_id = sb.store_id,
            commit_id = %sb.commit_id,
            sequence = sb.sequence,
            slot = newest,
            "opened store"
        );
        Ok(Self { inner })
    }

    pub fn config(&self) -> &StoreConfig {
        &self.inner.config
    }

    pub fn store_id(&self) -> u64 {
        self.inner.state.lock().store_id
    }

    /// Starts the writable commit. Fails while another one is open.
    pub fn begin(&self) -> Result<WritableCommit> {
        WritableCommit::begin(self.inner.clone())
    }

    pub fn head_id(&self) -> Result<CommitId> {
        Ok(self.inner.state.lock().head()?.id())
    }

    /// Snapshot of the latest commit.
    pub fn head(&self) -> Result<ReadOnlySnapshot> {
        let id = self.head_id()?;
        self.snapshot(id)
    }

    /// Snapshot of a retained commit.
    pub fn snapshot(&self, id: CommitId) -> Result<ReadOnlySnapshot> {
        ReadOnlySnapshot::open(self.inner.clone(), id)
    }

    /// Retained commits in id order.
    pub fn commits(&self) -> Vec<CommitInfo> {
        let state = self.inner.state.lock();
        state.commits.values().map(|d| d.info()).collect()
    }

    /// Keeps a commit until it is removed, or lets the next writer evict
    /// it once it is no longer HEAD.
    pub fn set_persistent(&self, id: CommitId, persistent: bool) -> Result<()> {
        let state = self.inner.state.lock();
        let descriptor = state
            .commits
            .get(&id)
            .ok_or(TesseraError::CommitNotFound(id.0))?;
        descriptor.set_persistent(persistent);
        Ok(())
    }

    /// Schedules a commit for eviction by the next writer. A commit with
    /// open snapshots is evicted once they are closed.
    pub fn remove_commit(&self, id: CommitId) -> Result<()> {
        let state = self.inner.state.lock();
        if state.head()?.id() == id {
            return Err(TesseraError::InvalidParameter {
                name: "commit".to_string(),
                value: format!("{} is HEAD", id),
            });
        }
        let descriptor = state
            .commits
            .get(&id)
            .ok_or(TesseraError::CommitNotFound(id.0))?;
        descriptor.set_persistent(false);
        Ok(())
    }

    /// Allocation status of a node block in HEAD's allocation map.
    pub fn allocation_status(&self, id: BlockId) -> Result<AllocationStatus> {
        let state = self.inner.state.lock();
        state
            .head_map
            .status_of(&Allocation::of_block(id, self.inner.node_level))
    }

    /// Basic blocks held by HEAD's allocation pool.
    pub fn pool_level0_total(&self) -> u64 {
        self.inner.state.lock().pool.level0_total()
    }

    /// Runs waiting for the next consistency point.
    pub fn cp_postponed(&self) -> Vec<Allocation> {
        self.inner.state.lock().cp_postponed.clone()
    }

    /// Recounts every reference reachable from the retained commits and
    /// compares the result with the persisted counters.
    pub fn check_refcounters(&self) -> Result<()> {
        let state = self.inner.state.lock();
        let mut expected: HashMap<BlockId, u64> = HashMap::new();
        let mut pending = Vec::new();
        for descriptor in state.commits.values() {
            for root in [descriptor.directory_root(), descriptor.history_root()] {
                *expected.entry(root).or_default() += 1;
                pending.push(root);
            }
        }
        let mut visited = HashSet::new();
        while let Some(id) = pending.pop() {
            if !visited.insert(id) {
                continue;
            }
            let alloc = Allocation::of_block(id, self.inner.node_level);
            if state.head_map.status_of(&alloc)? != AllocationStatus::Allocated {
                return Err(TesseraError::BlockCorrupted {
                    block_id: id.0,
                    reason: "referenced block is free in the allocation map".to_string(),
                });
            }
            let node = self.inner.read_node(id)?;
            node.for_all_block_refs(&mut |child| {
                *expected.entry(child).or_default() += 1;
                pending.push(child);
                Ok(())
            })?;
        }

        for (id, actual) in state.counters.iter() {
            let count = expected.remove(&id).unwrap_or(0);
            if count != actual {
                return Err(TesseraError::RefcountMismatch {
                    block_id: id.0,
                    expected: count,
                    actual,
                });
            }
        }
        if let Some((id, count)) = expected.into_iter().next() {
            return Err(TesseraError::RefcountMismatch {
                block_id: id.0,
                expected: count,
                actual: 0,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for SwmrStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("SwmrStore")
            .field("store_id", &state.store_id)
            .field("head", &state.head.as_ref().map(|d| d.id()))
            .field("commits", &state.commits.len())
            .finish()
    }
}
