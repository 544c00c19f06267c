//! Node storage of one writable commit: block allocation from the commit's
//! pool, commit-local reference counts and deferred deallocation.

use std::collections::HashSet;
use std::sync::Arc;
use tessera_common::{BlockId, CommitId, Result, TesseraError};
use tessera_node::{NodeBlock, NodeSource, NodeStore};
use tracing::{debug, warn};

use crate::allocation::{Allocation, AllocationMap, AllocationPool, AllocationStatus};
use crate::counters::{CounterOverlay, RefCounters};
use crate::store::StoreInner;

/// Lifecycle of a writable commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitState {
    Active,
    Prepared,
    Committed,
    RolledBack,
}

/// Allocation guard of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocatorMode {
    /// Allocations are served by the pool, repopulating it on demand.
    Idle,
    /// The pool is being repopulated; level-0 allocations use the reserve.
    Populating,
    /// Metadata is being finalized; allocations fail.
    Forbidden,
}

/// Allocation state a commit starts from.
pub(crate) struct CommitBase {
    pub map: Arc<AllocationMap>,
    pub cp_map: Arc<AllocationMap>,
    pub pool: AllocationPool,
    pub counters: Arc<RefCounters>,
    pub cp_postponed: Vec<Allocation>,
}

pub struct CommitStore {
    inner: Arc<StoreInner>,
    id: CommitId,
    pub(crate) state: CommitState,
    mode: AllocatorMode,
    /// This commit's allocation map, a copy-on-write copy of HEAD's.
    pub(crate) map: AllocationMap,
    head_map: Arc<AllocationMap>,
    cp_map: Arc<AllocationMap>,
    pub(crate) pool: AllocationPool,
    counters: Arc<RefCounters>,
    pub(crate) overlay: CounterOverlay,
    /// Blocks allocated by this commit; the only blocks it may write.
    created: HashSet<BlockId>,
    /// Runs freed when this commit is prepared.
    pub(crate) postponed: Vec<Allocation>,
    /// Runs freed by the next consistency point.
    pub(crate) cp_postponed: Vec<Allocation>,
}

impl CommitStore {
    pub(crate) fn new(inner: Arc<StoreInner>, id: CommitId, base: CommitBase) -> Self {
        Self {
            map: (*base.map).clone(),
            head_map: base.map,
            cp_map: base.cp_map,
            pool: base.pool,
            counters: base.counters,
            cp_postponed: base.cp_postponed,
            inner,
            id,
            state: CommitState::Active,
            mode: AllocatorMode::Idle,
            overlay: CounterOverlay::new(),
            created: HashSet::new(),
            postponed: Vec::new(),
        }
    }

    pub fn id(&self) -> CommitId {
        self.id
    }

    pub fn state(&self) -> CommitState {
        self.state
    }

    pub fn mode(&self) -> AllocatorMode {
        self.mode
    }

    pub(crate) fn set_mode(&mut self, mode: AllocatorMode) {
        self.mode = mode;
    }

    pub(crate) fn inner(&self) -> &Arc<StoreInner> {
        &self.inner
    }

    pub(crate) fn base_counters(&self) -> &RefCounters {
        &self.counters
    }

    pub fn pool(&self) -> &AllocationPool {
        &self.pool
    }

    pub fn allocation_map(&self) -> &AllocationMap {
        &self.map
    }

    pub(crate) fn check_active(&self) -> Result<()> {
        if self.state != CommitState::Active {
            return Err(TesseraError::CommitClosed(self.id.0));
        }
        Ok(())
    }

    /// Takes a run of `level` from the pool, repopulating it up to the
    /// configured number of attempts.
    pub fn allocate_one_or_throw(&mut self, level: usize) -> Result<Allocation> {
        self.check_active()?;
        match self.mode {
            AllocatorMode::Forbidden => Err(TesseraError::AllocationForbidden),
            AllocatorMode::Populating if level == 0 => self.pool.allocate_reserved(),
            AllocatorMode::Populating => Err(TesseraError::AllocationForbidden),
            AllocatorMode::Idle => {
                let attempts = self.inner.config.populate_retries;
                for _ in 0..attempts {
                    if let Some(alloc) = self.pool.allocate_one(level) {
                        return Ok(alloc);
                    }
                    self.populate_allocation_pool(level)?;
                }
                Err(TesseraError::AllocationFailed(format!(
                    "no free run at level {} after {} attempts",
                    level, attempts
                )))
            }
        }
    }

    /// Refills the pool's `level` queue from the allocation map, growing
    /// the arena when the map has no free run left.
    pub fn populate_allocation_pool(&mut self, level: usize) -> Result<bool> {
        self.check_active()?;
        match self.mode {
            AllocatorMode::Populating => {
                return Err(TesseraError::Internal(
                    "allocation pool population is not re-entrant".to_string(),
                ));
            }
            AllocatorMode::Forbidden => return Err(TesseraError::AllocationForbidden),
            AllocatorMode::Idle => {}
        }
        self.mode = AllocatorMode::Populating;
        let result = self.populate_from_map(level);
        self.mode = AllocatorMode::Idle;
        result
    }

    fn populate_from_map(&mut self, level: usize) -> Result<bool> {
        if self.map.populate_allocation_pool(&mut self.pool, level)? {
            debug!(commit_id = %self.id, level, total = self.pool.level0_total(), "populated allocation pool");
            return Ok(true);
        }
        let config = &self.inner.config;
        let arena = self.inner.blocks.arena_blocks();
        let target = if self.map.blocks() < arena {
            arena
        } else if arena < config.max_arena_blocks {
            let grown = (arena + config.arena_growth_blocks).min(config.max_arena_blocks);
            self.inner.blocks.grow(grown)?;
            grown
        } else {
            warn!(commit_id = %self.id, level, arena, "arena is at its maximum size");
            return Ok(false);
        };
        self.map.expand(target)?;
        debug!(commit_id = %self.id, arena_blocks = target, "expanded allocation map");
        self.map.populate_allocation_pool(&mut self.pool, level)
    }

    fn node_allocation(&self, id: BlockId) -> Allocation {
        Allocation::of_block(id, self.inner.node_level)
    }

    /// Returns a freed run to the pool, or defers it while older versions
    /// may still read it.
    fn deallocate(&mut self, alloc: Allocation, fresh: bool) -> Result<()> {
        if fresh || status_in(&self.head_map, &alloc)? == AllocationStatus::Free {
            if !self.pool.add(alloc) {
                warn!(commit_id = %self.id, block = alloc.position, "allocation pool is full, postponing");
                self.postponed.push(alloc);
            }
        } else if status_in(&self.cp_map, &alloc)? == AllocationStatus::Free {
            self.postponed.push(alloc);
        } else {
            self.cp_postponed.push(alloc);
        }
        Ok(())
    }

    /// Frees the postponed runs in this commit's map.
    ///
    /// At a consistency point the runs waiting for one are freed as well.
    pub(crate) fn do_postponed_deallocations(&mut self, consistency_point: bool) -> Result<()> {
        self.map.touch_bits(&self.postponed)?;
        if consistency_point {
            self.map.touch_bits(&self.cp_postponed)?;
        }
        self.map.setup_bits(&self.postponed, false)?;
        debug!(commit_id = %self.id, runs = self.postponed.len(), "freed postponed runs");
        self.postponed.clear();
        if consistency_point {
            self.map.setup_bits(&self.cp_postponed, false)?;
            debug!(commit_id = %self.id, runs = self.cp_postponed.len(), "freed runs held by the last consistency point");
            self.cp_postponed.clear();
        }
        Ok(())
    }
}

/// Status of a run in `map`; runs past the end of an older, smaller map
/// are free there.
fn status_in(map: &AllocationMap, alloc: &Allocation) -> Result<AllocationStatus> {
    if alloc.end() > map.blocks() {
        return Ok(AllocationStatus::Free);
    }
    map.status_of(alloc)
}

impl NodeSource for CommitStore {
    fn block_size(&self) -> usize {
        self.inner.block_size()
    }

    fn read_node(&self, id: BlockId) -> Result<NodeBlock> {
        self.inner.read_node(id)
    }
}

impl NodeStore for CommitStore {
    fn allocate_block(&mut self) -> Result<BlockId> {
        let alloc = self.allocate_one_or_throw(self.inner.node_level)?;
        let id = alloc.block_id();
        self.overlay.insert_new(&self.counters, id)?;
        self.created.insert(id);
        Ok(id)
    }

    fn write_node(&mut self, node: &NodeBlock) -> Result<()> {
        self.check_active()?;
        let id = node.block_id();
        if !self.created.contains(&id) {
            return Err(TesseraError::Internal(format!(
                "block {} is not writable in commit {}",
                id, self.id
            )));
        }
        if node.block_size() != self.block_size() {
            return Err(TesseraError::BlockSizeMismatch {
                expected: self.block_size(),
                actual: node.block_size(),
            });
        }
        self.inner.blocks.write(id.as_u64(), &node.to_bytes())
    }

    fn refcount(&self, id: BlockId) -> Result<u64> {
        self.overlay
            .get(&self.counters, id)
            .ok_or(TesseraError::BlockNotFound { block_id: id.0 })
    }

    fn ref_block(&mut self, id: BlockId) -> Result<()> {
        self.check_active()?;
        self.overlay.inc(&self.counters, id)?;
        Ok(())
    }

    fn unref_block(&mut self, id: BlockId) -> Result<u64> {
        self.check_active()?;
        self.overlay.dec(&self.counters, id)
    }

    fn remove_block(&mut self, id: BlockId) -> Result<()> {
        self.check_active()?;
        self.overlay.remove(&self.counters, id)?;
        let fresh = self.created.remove(&id);
        let alloc = self.node_allocation(id);
        self.deallocate(alloc, fresh)
    }
}

impl std::fmt::Debug for CommitStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitStore")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("mode", &self.mode)
            .field("created", &self.created.len())
            .field("postponed", &self.postponed.len())
            .field("cp_postponed", &self.cp_postponed.len())
            .finish()
    }
}
