//! The directory container maps container ids to their root blocks.
//!
//! Roots are kept in a block-id stream, so every directory leaf holds one
//! reference on each container root it lists and copying a leaf shares
//! the containers with the copy.

use tessera_common::{BlockId, ContainerId, NodeConfig, Result, TesseraError};
use tessera_node::{BTree, NodeLayout, NodeSource, NodeStore};
use tessera_packed::{IndexKind, SubstreamDescriptor, SubstreamKind, SubstreamParams};

const KEYS: usize = 0;
const ROOTS: usize = 1;

pub(crate) fn layout() -> Result<NodeLayout> {
    NodeLayout::new(vec![
        SubstreamDescriptor::new(
            SubstreamKind::FseTree,
            0,
            SubstreamParams::columns(1).with_index(IndexKind::Max),
        ),
        SubstreamDescriptor::block_ids(0),
    ])
}

#[derive(Debug, Clone)]
pub(crate) struct Directory {
    tree: BTree,
}

impl Directory {
    pub(crate) fn create<S: NodeStore + ?Sized>(store: &mut S, config: NodeConfig) -> Result<Self> {
        let tree = BTree::create(store, layout()?, config, ContainerId::DIRECTORY)?;
        Ok(Self { tree })
    }

    pub(crate) fn open<S: NodeSource + ?Sized>(
        store: &S,
        config: NodeConfig,
        root: BlockId,
    ) -> Result<Self> {
        let tree = BTree::open(store, layout()?, config, ContainerId::DIRECTORY, root)?;
        Ok(Self { tree })
    }

    pub(crate) fn root(&self) -> BlockId {
        self.tree.root()
    }

    pub(crate) fn tree(&self) -> &BTree {
        &self.tree
    }

    /// Position of `id`, or the position it would be inserted at.
    fn position<S: NodeSource + ?Sized>(&self, store: &S, id: ContainerId) -> Result<(usize, bool)> {
        match self.tree.find_by_key(store, KEYS, 0, id.0)? {
            Some(pos) => {
                let key = self.tree.get(store, KEYS, pos)?[0];
                Ok((pos, key == id.0))
            }
            None => Ok((self.tree.size(store, KEYS)?, false)),
        }
    }

    /// Position and root of container `id`.
    pub(crate) fn lookup<S: NodeSource + ?Sized>(
        &self,
        store: &S,
        id: ContainerId,
    ) -> Result<Option<(usize, BlockId)>> {
        let (pos, found) = self.position(store, id)?;
        if !found {
            return Ok(None);
        }
        let root = BlockId(self.tree.get(store, ROOTS, pos)?[0]);
        Ok(Some((pos, root)))
    }

    pub(crate) fn list<S: NodeSource + ?Sized>(&self, store: &S) -> Result<Vec<(ContainerId, BlockId)>> {
        let keys = self.tree.scan(store, KEYS)?;
        let roots = self.tree.scan(store, ROOTS)?;
        Ok(keys
            .into_iter()
            .zip(roots)
            .map(|(key, root)| (ContainerId(key[0]), BlockId(root[0])))
            .collect())
    }

    /// Adds container `id`; the caller's reference on `root` moves to the
    /// directory.
    pub(crate) fn insert<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        id: ContainerId,
        root: BlockId,
    ) -> Result<()> {
        let (pos, found) = self.position(store, id)?;
        if found {
            return Err(TesseraError::ContainerAlreadyExists(id.0));
        }
        self.tree.insert(store, 0, pos, &[vec![id.0], vec![root.as_u64()]])
    }

    /// Removes container `id` and hands the directory's reference on its
    /// root to the caller.
    pub(crate) fn remove<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        id: ContainerId,
    ) -> Result<BlockId> {
        let (pos, _) = self
            .lookup(store, id)?
            .ok_or(TesseraError::ContainerNotFound(id.0))?;
        // The leaf copy made below takes its own reference on the root.
        self.tree.touch(store, ROOTS, pos)?;
        let root = BlockId(self.tree.get(store, ROOTS, pos)?[0]);
        self.tree.remove(store, 0, pos, pos + 1)?;
        Ok(root)
    }

    /// Makes the path to entry `pos` exclusively owned so the root it
    /// lists can be replaced.
    pub(crate) fn touch<S: NodeStore + ?Sized>(&mut self, store: &mut S, pos: usize) -> Result<()> {
        self.tree.touch(store, ROOTS, pos)
    }

    /// Replaces the root listed at `pos`. The reference moves with it.
    pub(crate) fn set_root<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        pos: usize,
        root: BlockId,
    ) -> Result<()> {
        self.tree.update(store, ROOTS, pos, &[root.as_u64()])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::BlockKind;
    use tessera_node::{MemoryNodeStore, create_node};

    const BLOCK: usize = 512;

    fn config() -> NodeConfig {
        NodeConfig {
            block_size: BLOCK,
            merge_threshold_percent: 50,
        }
    }

    fn container_root(store: &mut MemoryNodeStore) -> BlockId {
        let layout = NodeLayout::new(vec![SubstreamDescriptor::fse_tree(0, 1)]).unwrap();
        let mut node =
            create_node(store, BlockKind::Leaf, 0, ContainerId::FIRST_USER, &layout).unwrap();
        node.set_root(true);
        store.write_node(&node).unwrap();
        node.block_id()
    }

    #[test]
    fn test_insert_lookup_remove() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut dir = Directory::create(&mut store, config()).unwrap();
        let mut roots = Vec::new();
        for id in [40u64, 16, 90, 17] {
            let root = container_root(&mut store);
            dir.insert(&mut store, ContainerId(id), root).unwrap();
            roots.push((ContainerId(id), root));
        }
        roots.sort();
        assert_eq!(dir.list(&store).unwrap(), roots);
        assert_eq!(dir.lookup(&store, ContainerId(90)).unwrap(), Some((3, roots[3].1)));
        assert_eq!(dir.lookup(&store, ContainerId(50)).unwrap(), None);

        let dup = container_root(&mut store);
        assert!(matches!(
            dir.insert(&mut store, ContainerId(16), dup),
            Err(TesseraError::ContainerAlreadyExists(16))
        ));

        let root = dir.remove(&mut store, ContainerId(40)).unwrap();
        assert_eq!(root, roots[2].1);
        assert_eq!(store.refcount(root).unwrap(), 1);
        assert!(dir.remove(&mut store, ContainerId(40)).is_err());
        assert_eq!(dir.list(&store).unwrap().len(), 3);
    }

    #[test]
    fn test_shared_directory_keeps_roots() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut dir = Directory::create(&mut store, config()).unwrap();
        let root = container_root(&mut store);
        dir.insert(&mut store, ContainerId(16), root).unwrap();

        let old = dir.clone();
        store.ref_block(old.root()).unwrap();
        let removed = dir.remove(&mut store, ContainerId(16)).unwrap();
        assert_eq!(store.refcount(removed).unwrap(), 2);
        assert_eq!(old.lookup(&store, ContainerId(16)).unwrap(), Some((0, root)));
        assert_eq!(dir.lookup(&store, ContainerId(16)).unwrap(), None);
    }

    #[test]
    fn test_set_root_after_touch() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut dir = Directory::create(&mut store, config()).unwrap();
        let first = container_root(&mut store);
        dir.insert(&mut store, ContainerId(16), first).unwrap();
        let reopened = Directory::open(&store, config(), dir.root()).unwrap();
        assert_eq!(reopened.list(&store).unwrap(), vec![(ContainerId(16), first)]);

        let second = container_root(&mut store);
        dir.touch(&mut store, 0).unwrap();
        dir.set_root(&mut store, 0, second).unwrap();
        assert_eq!(dir.lookup(&store, ContainerId(16)).unwrap(), Some((0, second)));
    }
}
