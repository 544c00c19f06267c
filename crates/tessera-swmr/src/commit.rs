//! The writable commit and its prepare/commit/rollback protocol.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tessera_common::{BlockId, CommitId, ContainerId, Result, TesseraError};
use tessera_node::{BTree, NodeLayout, NodeStore, release_block};
use tracing::{debug, info, warn};

use crate::allocation::Allocation;
use crate::commit_store::{AllocatorMode, CommitState, CommitStore};
use crate::container::{Container, ContainerMut};
use crate::descriptor::{CommitDescriptor, CommitInfo};
use crate::directory::Directory;
use crate::history::{History, HistoryRecord};
use crate::store::{FinishedCommit, StoreInner};
use crate::superblock::{CommitMetadata, FLAG_PERSISTENT, Superblock, SuperblockStatus};

/// Whether a commit becomes a consistency point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsistencyPoint {
    Yes,
    No,
}

impl ConsistencyPoint {
    pub fn is_yes(self) -> bool {
        self == ConsistencyPoint::Yes
    }
}

/// The single writable commit of a store.
///
/// Dropping an unfinished commit rolls it back.
pub struct WritableCommit {
    store: CommitStore,
    directory: Directory,
    history: History,
    sequence: u64,
    persistent: bool,
    parent: Option<Arc<CommitDescriptor>>,
    evicted: Vec<Arc<CommitDescriptor>>,
    reparented: Vec<(Arc<CommitDescriptor>, Option<CommitId>)>,
    finished: Option<FinishedCommit>,
}

impl WritableCommit {
    pub(crate) fn begin(inner: Arc<StoreInner>) -> Result<Self> {
        inner.acquire_writer()?;
        Self::open_on_head(inner.clone()).inspect_err(|_| inner.release_writer())
    }

    fn open_on_head(inner: Arc<StoreInner>) -> Result<Self> {
        let (head, base, sequence) = {
            let state = inner.state.lock();
            (state.head()?.clone(), state.base(), state.sequence + 1)
        };
        let config = inner.config.node_config();
        let mut store = CommitStore::new(inner, head.id().next(), base);
        store.ref_block(head.directory_root())?;
        store.ref_block(head.history_root())?;
        let directory = Directory::open(&store, config.clone(), head.directory_root())?;
        let history = History::open(&store, config, head.history_root())?;
        debug!(commit_id = %store.id(), parent = %head.id(), sequence, "began commit");
        Ok(Self {
            store,
            directory,
            history,
            sequence,
            persistent: false,
            parent: Some(head),
            evicted: Vec::new(),
            reparented: Vec::new(),
            finished: None,
        })
    }

    /// The first commit of a new store, holding empty system containers.
    pub(crate) fn init_store_commit(inner: Arc<StoreInner>) -> Result<Self> {
        inner.acquire_writer()?;
        Self::create_initial(inner.clone()).inspect_err(|_| inner.release_writer())
    }

    fn create_initial(inner: Arc<StoreInner>) -> Result<Self> {
        let base = inner.state.lock().base();
        let config = inner.config.node_config();
        let mut store = CommitStore::new(inner, CommitId(1), base);
        let directory = Directory::create(&mut store, config.clone())?;
        let history = History::create(&mut store, config)?;
        Ok(Self {
            store,
            directory,
            history,
            sequence: 1,
            persistent: false,
            parent: None,
            evicted: Vec::new(),
            reparented: Vec::new(),
            finished: None,
        })
    }

    pub fn id(&self) -> CommitId {
        self.store.id()
    }

    pub fn state(&self) -> CommitState {
        self.store.state()
    }

    pub fn parent(&self) -> Option<CommitId> {
        self.parent.as_ref().map(|d| d.id())
    }

    /// Keeps this commit after it stops being HEAD.
    pub fn set_persistent(&mut self, persistent: bool) -> Result<()> {
        self.store.check_active()?;
        self.persistent = persistent;
        Ok(())
    }

    /// Node storage of this commit.
    pub fn store(&self) -> &CommitStore {
        &self.store
    }

    pub fn pool_level0_total(&self) -> u64 {
        self.store.pool().level0_total()
    }

    pub fn containers(&self) -> Result<Vec<ContainerId>> {
        Ok(self
            .directory
            .list(&self.store)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    /// Creates an empty container.
    pub fn create_container(
        &mut self,
        id: ContainerId,
        layout: NodeLayout,
    ) -> Result<ContainerMut<'_>> {
        self.store.check_active()?;
        check_user_container(id)?;
        if self.directory.lookup(&self.store, id)?.is_some() {
            return Err(TesseraError::ContainerAlreadyExists(id.0));
        }
        let config = self.store.inner().config.node_config();
        let tree = BTree::create(&mut self.store, layout, config, id)?;
        self.directory.insert(&mut self.store, id, tree.root())?;
        let (pos, _) = self
            .directory
            .lookup(&self.store, id)?
            .ok_or(TesseraError::ContainerNotFound(id.0))?;
        debug!(commit_id = %self.id(), ctr_id = %id, root = %tree.root(), "created container");
        Ok(ContainerMut::new(&mut self.store, &mut self.directory, pos, tree))
    }

    /// Removes a container, releasing the nodes no other commit shares.
    pub fn drop_container(&mut self, id: ContainerId) -> Result<()> {
        self.store.check_active()?;
        check_user_container(id)?;
        let root = self.directory.remove(&mut self.store, id)?;
        release_block(&mut self.store, root)?;
        debug!(commit_id = %self.id(), ctr_id = %id, root = %root, "dropped container");
        Ok(())
    }

    /// Opens a container for writing.
    pub fn container_mut(
        &mut self,
        id: ContainerId,
        layout: NodeLayout,
    ) -> Result<ContainerMut<'_>> {
        self.store.check_active()?;
        check_user_container(id)?;
        let (pos, _) = self
            .directory
            .lookup(&self.store, id)?
            .ok_or(TesseraError::ContainerNotFound(id.0))?;
        self.directory.touch(&mut self.store, pos)?;
        let (pos, root) = self
            .directory
            .lookup(&self.store, id)?
            .ok_or(TesseraError::ContainerNotFound(id.0))?;
        let config = self.store.inner().config.node_config();
        let tree = BTree::open(&self.store, layout, config, id, root)?;
        Ok(ContainerMut::new(&mut self.store, &mut self.directory, pos, tree))
    }

    /// Opens a container for reading in its current state.
    pub fn container(&self, id: ContainerId, layout: NodeLayout) -> Result<Container<'_>> {
        let (_, root) = self
            .directory
            .lookup(&self.store, id)?
            .ok_or(TesseraError::ContainerNotFound(id.0))?;
        let config = self.store.inner().config.node_config();
        let tree = BTree::open(&self.store, layout, config, id, root)?;
        Ok(Container::new(&self.store, tree))
    }

    pub fn allocate_one_or_throw(&mut self, level: usize) -> Result<Allocation> {
        self.store.allocate_one_or_throw(level)
    }

    pub fn populate_allocation_pool(&mut self, level: usize) -> Result<bool> {
        self.store.populate_allocation_pool(level)
    }

    pub fn ref_block(&mut self, id: BlockId) -> Result<()> {
        self.store.ref_block(id)
    }

    pub fn unref_block(&mut self, id: BlockId) -> Result<u64> {
        self.store.unref_block(id)
    }

    pub fn remove_block(&mut self, id: BlockId) -> Result<()> {
        self.store.remove_block(id)
    }

    /// Finalizes the commit's metadata.
    ///
    /// Evicts unused retained commits, records this commit in the history,
    /// applies postponed deallocations and freezes the allocation pool.
    /// No mutation is possible afterwards.
    ///
    /// A failed prepare has already released or rewritten blocks of the
    /// commit, so the commit is rolled back and stays closed.
    pub fn prepare(&mut self, cp: ConsistencyPoint) -> Result<()> {
        self.store.check_active()?;
        let result = self.do_prepare(cp);
        if let Err(err) = &result {
            warn!(commit_id = %self.id(), error = %err, "prepare failed, rolling back");
            if let Err(rollback) = self.rollback() {
                warn!(commit_id = %self.id(), error = %rollback, "rollback after prepare failed");
            }
        }
        result
    }

    fn do_prepare(&mut self, cp: ConsistencyPoint) -> Result<()> {
        let consistency_point = cp.is_yes();
        self.choose_evictions();
        self.sync_history(consistency_point)?;

        for descriptor in &self.evicted {
            release_block(&mut self.store, descriptor.directory_root())?;
            release_block(&mut self.store, descriptor.history_root())?;
            info!(
                commit_id = %descriptor.id(),
                evicted_by = %self.store.id(),
                "evicted commit"
            );
        }

        self.store.do_postponed_deallocations(consistency_point)?;
        if self.store.pool().level0_total() < 1 {
            self.store.populate_allocation_pool(0)?;
        }
        self.store.set_mode(AllocatorMode::Forbidden);

        if self.store.pool().level0_total() < 1 {
            return Err(TesseraError::AllocationFailed(
                "Superblock's allocation pool is empty at the end of the snapshot".to_string(),
            ));
        }

        let info = self.own_info(consistency_point);
        let (store_id, cp_sequence) = {
            let state = self.store.inner().state.lock();
            (state.store_id, state.cp_sequence)
        };
        let counters = self.store.overlay.apply(self.store.base_counters());
        let superblock = Superblock {
            status: if consistency_point {
                SuperblockStatus::ConsistencyPoint
            } else {
                SuperblockStatus::Committed
            },
            store_id,
            sequence: self.sequence,
            cp_sequence: if consistency_point {
                self.sequence
            } else {
                cp_sequence
            },
            commit_id: info.id,
            parent_commit: info.parent,
            arena_blocks: self.store.map.blocks(),
            directory_root: self.directory.root(),
            history_root: self.history.root(),
            flags: if self.persistent { FLAG_PERSISTENT } else { 0 },
        };
        let metadata = CommitMetadata {
            superblock,
            pool: self.store.pool.store(),
            allocation_map: self.store.map.to_bytes(),
            counters: counters.to_bytes(),
            cp_postponed: self.store.cp_postponed.clone(),
        }
        .encode();
        let available = self.store.inner().config.metadata_slot_size;
        if metadata.len() > available {
            return Err(TesseraError::OutOfSpace {
                requested: metadata.len(),
                available,
            });
        }

        let descriptor = Arc::new(CommitDescriptor::new(
            &info,
            self.directory.root(),
            self.history.root(),
        ));
        self.finished = Some(FinishedCommit {
            descriptor,
            metadata,
            map: self.store.map.clone(),
            pool: self.store.pool.clone(),
            counters,
            cp_postponed: self.store.cp_postponed.clone(),
            evicted: self.evicted.clone(),
            reparented: self.reparented.clone(),
        });
        self.store.state = CommitState::Prepared;
        debug!(
            commit_id = %info.id,
            sequence = self.sequence,
            consistency_point,
            evicted = self.evicted.len(),
            "prepared commit"
        );
        Ok(())
    }

    fn own_info(&self, consistency_point: bool) -> CommitInfo {
        CommitInfo {
            id: self.store.id(),
            parent: self.parent(),
            sequence: self.sequence,
            persistent: self.persistent,
            consistency_point,
        }
    }

    /// Marks every retained commit that is neither HEAD, persistent nor
    /// read for eviction. Snapshots of marked commits are refused.
    fn choose_evictions(&mut self) {
        let Some(head) = self.parent.as_ref() else {
            return;
        };
        let state = self.store.inner().state.lock();
        for descriptor in state.commits.values() {
            if descriptor.id() == head.id()
                || descriptor.is_persistent()
                || descriptor.readers() > 0
                || descriptor.is_evicting()
            {
                continue;
            }
            descriptor.set_evicting(true);
            self.evicted.push(descriptor.clone());
        }
    }

    fn clear_evictions(&mut self) {
        for descriptor in self.evicted.drain(..) {
            descriptor.set_evicting(false);
        }
        self.reparented.clear();
    }

    /// Rewrites the history for the retained commits and adds this
    /// commit's own record.
    fn sync_history(&mut self, consistency_point: bool) -> Result<()> {
        let retained: Vec<Arc<CommitDescriptor>> = {
            let state = self.store.inner().state.lock();
            state.commits.values().cloned().collect()
        };
        let evicted: HashMap<CommitId, Option<CommitId>> = self
            .evicted
            .iter()
            .map(|d| (d.id(), d.parent()))
            .collect();

        for id in evicted.keys() {
            self.history.remove(&mut self.store, *id)?;
        }
        let mut seen = HashSet::new();
        for descriptor in retained.iter().filter(|d| !evicted.contains_key(&d.id())) {
            let mut parent = descriptor.parent();
            seen.clear();
            while let Some(id) = parent {
                match evicted.get(&id) {
                    Some(next) if seen.insert(id) => parent = *next,
                    _ => break,
                }
            }
            if parent != descriptor.parent() {
                self.reparented.push((descriptor.clone(), parent));
            }
            let mut info = descriptor.info();
            info.parent = parent;
            self.history.upsert(
                &mut self.store,
                &HistoryRecord {
                    info,
                    directory_root: descriptor.directory_root(),
                    history_root: descriptor.history_root(),
                },
            )?;
        }
        let own = HistoryRecord {
            info: self.own_info(consistency_point),
            directory_root: self.directory.root(),
            history_root: BlockId::INVALID,
        };
        self.history.upsert(&mut self.store, &own)
    }

    /// Publishes the commit as the new HEAD, preparing it first if needed.
    ///
    /// A prepared commit keeps the consistency point choice made by
    /// `prepare`.
    pub fn commit(&mut self, cp: ConsistencyPoint) -> Result<CommitId> {
        if self.store.state() == CommitState::Active {
            self.prepare(cp)?;
        }
        if self.store.state() != CommitState::Prepared {
            return Err(TesseraError::CommitClosed(self.id().0));
        }
        let finished = self
            .finished
            .take()
            .ok_or_else(|| TesseraError::Internal("prepared commit lost its metadata".to_string()))?;
        let inner = self.store.inner().clone();
        if let Err(err) = inner.do_commit(finished) {
            self.rollback()?;
            return Err(err);
        }
        self.evicted.clear();
        self.reparented.clear();
        self.store.state = CommitState::Committed;
        inner.release_writer();
        Ok(self.id())
    }

    /// Abandons the commit. Blocks it allocated are never referenced by a
    /// committed state and are reused by the next writer.
    pub fn rollback(&mut self) -> Result<()> {
        match self.store.state() {
            CommitState::Active | CommitState::Prepared => {}
            CommitState::Committed | CommitState::RolledBack => {
                return Err(TesseraError::CommitClosed(self.id().0));
            }
        }
        self.clear_evictions();
        self.finished = None;
        self.store.state = CommitState::RolledBack;
        self.store.inner().release_writer();
        debug!(commit_id = %self.id(), "rolled back commit");
        Ok(())
    }
}

impl Drop for WritableCommit {
    fn drop(&mut self) {
        if matches!(
            self.store.state(),
            CommitState::Active | CommitState::Prepared
        ) {
            if let Err(err) = self.rollback() {
                warn!(commit_id = %self.id(), error = %err, "rollback on drop failed");
            }
        }
    }
}

fn check_user_container(id: ContainerId) -> Result<()> {
    if id.is_system() {
        return Err(TesseraError::InvalidParameter {
            name: "container".to_string(),
            value: id.to_string(),
        });
    }
    Ok(())
}

impl std::fmt::Debug for WritableCommit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritableCommit")
            .field("store", &self.store)
            .field("sequence", &self.sequence)
            .field("persistent", &self.persistent)
            .field("parent", &self.parent())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SwmrStore;
    use tessera_common::{PoolConfig, StoreConfig};

    fn config() -> StoreConfig {
        StoreConfig {
            basic_block_size: 512,
            node_block_size: 512,
            initial_arena_blocks: 256,
            arena_growth_blocks: 256,
            max_arena_blocks: 1024,
            metadata_slot_size: 64 * 1024,
            pool: PoolConfig {
                levels: 4,
                level0_capacity: 16,
                upper_capacity: 2,
                level0_reserved: 4,
            },
            fsync_enabled: false,
            populate_retries: 3,
            ..StoreConfig::default()
        }
    }

    #[test]
    fn test_forbidden_mode_rejects_allocations() {
        let store = SwmrStore::create_in_memory(config()).unwrap();
        let mut commit = store.begin().unwrap();
        commit.store.set_mode(AllocatorMode::Forbidden);
        let err = commit.allocate_one_or_throw(0).unwrap_err();
        assert_eq!(err.to_string(), "Block allocations are forbidden at this stage");
        assert!(matches!(
            commit.populate_allocation_pool(0),
            Err(TesseraError::AllocationForbidden)
        ));
        commit.store.set_mode(AllocatorMode::Idle);
        assert!(commit.allocate_one_or_throw(0).is_ok());
    }

    #[test]
    fn test_populating_mode_draws_from_reserve() {
        let store = SwmrStore::create_in_memory(config()).unwrap();
        let mut commit = store.begin().unwrap();
        commit.store.set_mode(AllocatorMode::Populating);
        for _ in 0..commit.store.pool().reserved() {
            commit.allocate_one_or_throw(0).unwrap();
        }
        let err = commit.allocate_one_or_throw(0).unwrap_err();
        assert!(err.to_string().contains("Empty reserved allocation pool"));
        assert!(matches!(
            commit.allocate_one_or_throw(1),
            Err(TesseraError::AllocationForbidden)
        ));
        assert!(commit.populate_allocation_pool(0).is_err());
        commit.store.set_mode(AllocatorMode::Idle);
        commit.rollback().unwrap();
    }

    #[test]
    fn test_allocation_fails_at_arena_limit() {
        let config = StoreConfig {
            max_arena_blocks: 256,
            ..config()
        };
        let store = SwmrStore::create_in_memory(config).unwrap();
        let mut commit = store.begin().unwrap();
        let mut allocated = 0;
        let err = loop {
            match commit.allocate_one_or_throw(0) {
                Ok(_) => allocated += 1,
                Err(err) => break err,
            }
        };
        assert!(matches!(err, TesseraError::AllocationFailed(_)));
        assert!(allocated > 200);
        assert_eq!(commit.pool_level0_total() as usize, commit.store.pool().reserved());
        commit.rollback().unwrap();
        // HEAD's pool is untouched by the abandoned commit.
        assert!(store.begin().unwrap().allocate_one_or_throw(0).is_ok());
    }

    #[test]
    fn test_prepare_records_evictions_and_history() {
        let store = SwmrStore::create_in_memory(config()).unwrap();
        let mut commit = store.begin().unwrap();
        commit.commit(ConsistencyPoint::No).unwrap();

        let mut commit = store.begin().unwrap();
        commit.set_persistent(true).unwrap();
        commit.prepare(ConsistencyPoint::Yes).unwrap();
        assert_eq!(commit.evicted.iter().map(|d| d.id()).collect::<Vec<_>>(), vec![CommitId(1)]);
        assert!(matches!(
            store.snapshot(CommitId(1)),
            Err(TesseraError::CommitNotFound(1))
        ));
        let records = commit.history.records(&commit.store).unwrap();
        assert_eq!(
            records.iter().map(|r| r.info.id).collect::<Vec<_>>(),
            vec![CommitId(2), CommitId(3)]
        );
        assert_eq!(records[0].info.parent, None);
        assert!(records[0].history_root.is_valid());
        assert!(records[1].info.persistent);
        assert!(records[1].info.consistency_point);
        assert_eq!(records[1].history_root, BlockId::INVALID);
        assert_eq!(commit.store.mode(), AllocatorMode::Forbidden);

        commit.rollback().unwrap();
        assert!(store.snapshot(CommitId(1)).is_ok());
        assert_eq!(store.commits().len(), 2);
    }
}
