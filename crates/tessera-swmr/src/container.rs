//! Container handles over the B-trees listed in a commit's directory.

use tessera_common::{BlockId, ContainerId, Result};
use tessera_node::{BTree, NodeSource};

use crate::commit_store::CommitStore;
use crate::directory::Directory;

/// Read access to a container of a committed state or of the writable
/// commit.
pub struct Container<'a> {
    source: &'a dyn NodeSource,
    tree: BTree,
}

impl<'a> Container<'a> {
    pub(crate) fn new(source: &'a dyn NodeSource, tree: BTree) -> Self {
        Self { source, tree }
    }

    pub fn id(&self) -> ContainerId {
        self.tree.ctr_id()
    }

    pub fn root(&self) -> BlockId {
        self.tree.root()
    }

    pub fn size(&self, stream: usize) -> Result<usize> {
        self.tree.size(self.source, stream)
    }

    pub fn sizes(&self) -> Result<Vec<usize>> {
        self.tree.sizes(self.source)
    }

    pub fn get(&self, stream: usize, pos: usize) -> Result<Vec<u64>> {
        self.tree.get(self.source, stream, pos)
    }

    pub fn scan(&self, stream: usize) -> Result<Vec<Vec<u64>>> {
        self.tree.scan(self.source, stream)
    }

    pub fn find_by_key(&self, stream: usize, column: usize, key: u64) -> Result<Option<usize>> {
        self.tree.find_by_key(self.source, stream, column, key)
    }

    pub fn prefix_sum(&self, stream: usize, end: usize) -> Result<Vec<u64>> {
        self.tree.prefix_sum(self.source, stream, end)
    }

    pub fn check(&self) -> Result<()> {
        self.tree.check(self.source)
    }
}

/// Write access to a container of the writable commit.
///
/// The directory path to the container is exclusively owned by the
/// commit while the handle lives; a changed root is written back to the
/// directory after every edit.
pub struct ContainerMut<'c> {
    store: &'c mut CommitStore,
    directory: &'c mut Directory,
    pos: usize,
    tree: BTree,
    listed_root: BlockId,
}

impl<'c> ContainerMut<'c> {
    pub(crate) fn new(
        store: &'c mut CommitStore,
        directory: &'c mut Directory,
        pos: usize,
        tree: BTree,
    ) -> Self {
        let listed_root = tree.root();
        Self {
            store,
            directory,
            pos,
            tree,
            listed_root,
        }
    }

    pub fn id(&self) -> ContainerId {
        self.tree.ctr_id()
    }

    pub fn root(&self) -> BlockId {
        self.tree.root()
    }

    pub fn size(&self, stream: usize) -> Result<usize> {
        self.tree.size(&*self.store, stream)
    }

    pub fn sizes(&self) -> Result<Vec<usize>> {
        self.tree.sizes(&*self.store)
    }

    pub fn get(&self, stream: usize, pos: usize) -> Result<Vec<u64>> {
        self.tree.get(&*self.store, stream, pos)
    }

    pub fn scan(&self, stream: usize) -> Result<Vec<Vec<u64>>> {
        self.tree.scan(&*self.store, stream)
    }

    pub fn find_by_key(&self, stream: usize, column: usize, key: u64) -> Result<Option<usize>> {
        self.tree.find_by_key(&*self.store, stream, column, key)
    }

    pub fn prefix_sum(&self, stream: usize, end: usize) -> Result<Vec<u64>> {
        self.tree.prefix_sum(&*self.store, stream, end)
    }

    /// Inserts rows into every stream of `group` before `at`.
    pub fn insert(&mut self, group: usize, at: usize, values: &[Vec<u64>]) -> Result<()> {
        self.store.check_active()?;
        let result = self.tree.insert(&mut *self.store, group, at, values);
        self.sync()?;
        result
    }

    /// Removes entries `[start, end)` from every stream of `group`.
    pub fn remove(&mut self, group: usize, start: usize, end: usize) -> Result<()> {
        self.store.check_active()?;
        let result = self.tree.remove(&mut *self.store, group, start, end);
        self.sync()?;
        result
    }

    pub fn update(&mut self, stream: usize, pos: usize, row: &[u64]) -> Result<()> {
        self.store.check_active()?;
        let result = self.tree.update(&mut *self.store, stream, pos, row);
        self.sync()?;
        result
    }

    pub fn check(&self) -> Result<()> {
        self.tree.check(&*self.store)
    }

    /// The directory lists the tree's current root after every edit,
    /// failed ones included.
    fn sync(&mut self) -> Result<()> {
        let root = self.tree.root();
        if root != self.listed_root {
            self.directory.set_root(&mut *self.store, self.pos, root)?;
            self.listed_root = root;
        }
        Ok(())
    }
}
