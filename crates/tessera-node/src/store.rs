//! Node storage seams and the reference-counted copy-on-write helpers.

use std::collections::HashMap;

use tessera_common::{BlockId, BlockKind, ContainerId, Result, TesseraError};
use tracing::trace;

use crate::header::NodeBlock;
use crate::layout::NodeLayout;

/// Read access to node blocks.
pub trait NodeSource {
    /// Size of every node block.
    fn block_size(&self) -> usize;

    fn read_node(&self, id: BlockId) -> Result<NodeBlock>;
}

/// Mutable, reference-counted node storage.
///
/// A freshly allocated block carries one reference owned by the caller.
pub trait NodeStore: NodeSource {
    fn allocate_block(&mut self) -> Result<BlockId>;

    fn write_node(&mut self, node: &NodeBlock) -> Result<()>;

    fn refcount(&self, id: BlockId) -> Result<u64>;

    fn ref_block(&mut self, id: BlockId) -> Result<()>;

    /// Drops one reference and returns the remaining count.
    fn unref_block(&mut self, id: BlockId) -> Result<u64>;

    /// Releases the storage of a block whose count reached zero.
    fn remove_block(&mut self, id: BlockId) -> Result<()>;
}

/// Allocates and writes an empty node.
pub fn create_node<S: NodeStore + ?Sized>(
    store: &mut S,
    kind: BlockKind,
    level: u16,
    ctr_id: ContainerId,
    layout: &NodeLayout,
) -> Result<NodeBlock> {
    let id = store.allocate_block()?;
    let node = NodeBlock::new(id, kind, level, ctr_id, store.block_size(), layout)?;
    store.write_node(&node)?;
    Ok(node)
}

/// Copies `node` into a new block, taking a reference on every child.
pub fn clone_node<S: NodeStore + ?Sized>(store: &mut S, node: &NodeBlock) -> Result<NodeBlock> {
    let id = store.allocate_block()?;
    let mut copy = node.clone();
    copy.set_block_id(id);
    node.for_all_block_refs(&mut |child| store.ref_block(child))?;
    store.write_node(&copy)?;
    Ok(copy)
}

/// Makes block `id` exclusively owned before it is modified.
///
/// A shared block is cloned; the caller's reference moves from the old
/// block to the returned clone. An exclusive block is returned as is.
pub fn prepare_for_update<S: NodeStore + ?Sized>(store: &mut S, id: BlockId) -> Result<BlockId> {
    if store.refcount(id)? <= 1 {
        return Ok(id);
    }
    let node = store.read_node(id)?;
    let copy = clone_node(store, &node)?;
    release_block(store, id)?;
    trace!(from = %id, to = %copy.block_id(), "copied shared node");
    Ok(copy.block_id())
}

/// Drops one reference to `id`, removing every block that becomes
/// unreachable.
pub fn release_block<S: NodeStore + ?Sized>(store: &mut S, id: BlockId) -> Result<()> {
    let mut pending = vec![id];
    while let Some(id) = pending.pop() {
        if store.unref_block(id)? > 0 {
            continue;
        }
        let node = store.read_node(id)?;
        node.for_all_block_refs(&mut |child| {
            pending.push(child);
            Ok(())
        })?;
        store.remove_block(id)?;
        trace!(block = %id, "released node");
    }
    Ok(())
}

/// Heap-backed node store.
#[derive(Debug)]
pub struct MemoryNodeStore {
    block_size: usize,
    blocks: HashMap<BlockId, Vec<u8>>,
    refcounts: HashMap<BlockId, u64>,
    next_id: u64,
}

impl MemoryNodeStore {
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size,
            blocks: HashMap::new(),
            refcounts: HashMap::new(),
            next_id: 1,
        }
    }

    /// Number of live blocks.
    pub fn len(&self) -> usize {
        self.refcounts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.refcounts.is_empty()
    }

    pub fn contains(&self, id: BlockId) -> bool {
        self.refcounts.contains_key(&id)
    }

    /// Ids of every live block.
    pub fn block_ids(&self) -> Vec<BlockId> {
        let mut ids: Vec<BlockId> = self.refcounts.keys().copied().collect();
        ids.sort();
        ids
    }
}

impl NodeSource for MemoryNodeStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn read_node(&self, id: BlockId) -> Result<NodeBlock> {
        let bytes = self
            .blocks
            .get(&id)
            .ok_or(TesseraError::BlockNotFound { block_id: id.0 })?;
        NodeBlock::from_bytes(bytes)
    }
}

impl NodeStore for MemoryNodeStore {
    fn allocate_block(&mut self) -> Result<BlockId> {
        let id = BlockId(self.next_id);
        self.next_id += 1;
        self.refcounts.insert(id, 1);
        Ok(id)
    }

    fn write_node(&mut self, node: &NodeBlock) -> Result<()> {
        let id = node.block_id();
        if !self.refcounts.contains_key(&id) {
            return Err(TesseraError::BlockNotFound { block_id: id.0 });
        }
        if node.block_size() != self.block_size {
            return Err(TesseraError::BlockSizeMismatch {
                expected: self.block_size,
                actual: node.block_size(),
            });
        }
        self.blocks.insert(id, node.to_bytes());
        Ok(())
    }

    fn refcount(&self, id: BlockId) -> Result<u64> {
        self.refcounts
            .get(&id)
            .copied()
            .ok_or(TesseraError::BlockNotFound { block_id: id.0 })
    }

    fn ref_block(&mut self, id: BlockId) -> Result<()> {
        let count = self
            .refcounts
            .get_mut(&id)
            .ok_or(TesseraError::BlockNotFound { block_id: id.0 })?;
        *count += 1;
        Ok(())
    }

    fn unref_block(&mut self, id: BlockId) -> Result<u64> {
        let count = self
            .refcounts
            .get_mut(&id)
            .ok_or(TesseraError::BlockNotFound { block_id: id.0 })?;
        if *count == 0 {
            return Err(TesseraError::Internal(format!(
                "unref of unreferenced block {}",
                id
            )));
        }
        *count -= 1;
        Ok(*count)
    }

    fn remove_block(&mut self, id: BlockId) -> Result<()> {
        match self.refcounts.get(&id) {
            Some(0) => {
                self.refcounts.remove(&id);
                self.blocks.remove(&id);
                Ok(())
            }
            Some(count) => Err(TesseraError::RefcountMismatch {
                block_id: id.0,
                expected: 0,
                actual: *count,
            }),
            None => Err(TesseraError::BlockNotFound { block_id: id.0 }),
        }
    }
}
