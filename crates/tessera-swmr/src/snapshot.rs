use std::sync::Arc;
use tessera_common::{CommitId, ContainerId, Result, TesseraError};
use tessera_node::{BTree, NodeLayout};

use crate::container::Container;
use crate::descriptor::{CommitInfo, ReaderGuard};
use crate::directory::Directory;
use crate::store::StoreInner;

/// Read-only view of a committed state.
///
/// The commit it reads is not evicted while the snapshot is open.
pub struct ReadOnlySnapshot {
    inner: Arc<StoreInner>,
    guard: ReaderGuard,
    directory: Directory,
}

impl ReadOnlySnapshot {
    pub(crate) fn open(inner: Arc<StoreInner>, id: CommitId) -> Result<Self> {
        let guard = {
            let state = inner.state.lock();
            let descriptor = state
                .commits
                .get(&id)
                .filter(|d| !d.is_evicting())
                .ok_or(TesseraError::CommitNotFound(id.0))?;
            ReaderGuard::new(descriptor.clone())
        };
        let root = guard.descriptor().directory_root();
        let directory = Directory::open(&*inner, inner.config.node_config(), root)?;
        Ok(Self {
            inner,
            guard,
            directory,
        })
    }

    pub fn id(&self) -> CommitId {
        self.guard.descriptor().id()
    }

    pub fn info(&self) -> CommitInfo {
        self.guard.descriptor().info()
    }

    pub fn containers(&self) -> Result<Vec<ContainerId>> {
        Ok(self
            .directory
            .list(&*self.inner)?
            .into_iter()
            .map(|(id, _)| id)
            .collect())
    }

    pub fn container(&self, id: ContainerId, layout: NodeLayout) -> Result<Container<'_>> {
        let (_, root) = self
            .directory
            .lookup(&*self.inner, id)?
            .ok_or(TesseraError::ContainerNotFound(id.0))?;
        let tree = BTree::open(&*self.inner, layout, self.inner.config.node_config(), id, root)?;
        Ok(Container::new(&*self.inner, tree))
    }

    /// Checks the structure of the commit's directory.
    pub fn check(&self) -> Result<()> {
        self.directory.tree().check(&*self.inner)
    }
}

impl std::fmt::Debug for ReadOnlySnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadOnlySnapshot")
            .field("commit", &self.id())
            .finish()
    }
}
