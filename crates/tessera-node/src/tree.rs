//! Copy-on-write packed B-tree.
//!
//! A [`BTree`] is addressed by rank: every stream is a sequence of entries
//! and positions are counted within one stream group. Mutations descend
//! from the root, making every node on the path exclusively owned through
//! [`prepare_for_update`] before touching it, so trees sharing subtrees
//! with older versions never observe each other's changes.
//!
//! The owner of a tree holds one reference on its root. Whenever the root
//! moves (copy, growth or collapse) that reference moves with it; the owner
//! only has to store the new [`BTree::root`].

use std::ops::Deref;

use tessera_common::{BlockId, BlockKind, ContainerId, NodeConfig, Result, TesseraError};
use tessera_packed::UpdateStatus;
use tracing::{debug, trace};

use crate::branch::BranchNodeSo;
use crate::entry::BranchNodeEntry;
use crate::header::NodeBlock;
use crate::layout::NodeLayout;
use crate::leaf::LeafNodeSo;
use crate::store::{NodeSource, NodeStore, create_node, prepare_for_update, release_block};

/// One node on a root-to-leaf path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PathStep {
    id: BlockId,
    /// Child index of this node inside its parent.
    index: usize,
}

/// An exclusively owned root-to-leaf path.
struct Descent {
    path: Vec<PathStep>,
    leaf: NodeBlock,
    /// Position inside the leaf.
    pos: usize,
}

/// Packed B-tree rooted in one node store block.
#[derive(Debug, Clone)]
pub struct BTree {
    layout: NodeLayout,
    config: NodeConfig,
    ctr_id: ContainerId,
    root: BlockId,
}

impl BTree {
    /// Creates an empty tree made of a single root leaf.
    pub fn create<S: NodeStore + ?Sized>(
        store: &mut S,
        layout: NodeLayout,
        config: NodeConfig,
        ctr_id: ContainerId,
    ) -> Result<Self> {
        check_block_size(store.block_size(), &config)?;
        let mut root = create_node(store, BlockKind::Leaf, 0, ctr_id, &layout)?;
        root.set_root(true);
        store.write_node(&root)?;
        debug!(ctr_id = %ctr_id, root = %root.block_id(), "created tree");
        Ok(Self {
            layout,
            config,
            ctr_id,
            root: root.block_id(),
        })
    }

    /// Opens the tree rooted at `root`.
    pub fn open<S: NodeSource + ?Sized>(
        store: &S,
        layout: NodeLayout,
        config: NodeConfig,
        ctr_id: ContainerId,
        root: BlockId,
    ) -> Result<Self> {
        check_block_size(store.block_size(), &config)?;
        let node = store.read_node(root)?;
        node.check_layout(&layout)?;
        if !node.is_root() {
            return Err(TesseraError::BlockCorrupted {
                block_id: root.0,
                reason: "tree root lacks the root flag".to_string(),
            });
        }
        Ok(Self {
            layout,
            config,
            ctr_id,
            root,
        })
    }

    pub fn root(&self) -> BlockId {
        self.root
    }

    pub fn layout(&self) -> &NodeLayout {
        &self.layout
    }

    pub fn ctr_id(&self) -> ContainerId {
        self.ctr_id
    }

    /// Height of the tree; a single leaf has height 1.
    pub fn height<S: NodeSource + ?Sized>(&self, store: &S) -> Result<usize> {
        Ok(store.read_node(self.root)?.level() as usize + 1)
    }

    /// Totals of the whole tree.
    pub fn entry<S: NodeSource + ?Sized>(&self, store: &S) -> Result<BranchNodeEntry> {
        self.entry_of(&store.read_node(self.root)?)
    }

    /// Entries per stream.
    pub fn sizes<S: NodeSource + ?Sized>(&self, store: &S) -> Result<Vec<usize>> {
        let entry = self.entry(store)?;
        (0..self.layout.streams())
            .map(|stream| Ok(entry.size(stream, self.layout.entry_layout())? as usize))
            .collect()
    }

    pub fn size<S: NodeSource + ?Sized>(&self, store: &S, stream: usize) -> Result<usize> {
        Ok(self.entry(store)?.size(stream, self.layout.entry_layout())? as usize)
    }

    pub fn is_empty<S: NodeSource + ?Sized>(&self, store: &S) -> Result<bool> {
        Ok(self.sizes(store)?.iter().all(|&s| s == 0))
    }

    /// Entry `pos` of `stream`.
    pub fn get<S: NodeSource + ?Sized>(
        &self,
        store: &S,
        stream: usize,
        pos: usize,
    ) -> Result<Vec<u64>> {
        let size = self.size(store, stream)?;
        if pos >= size {
            return Err(TesseraError::IndexOutOfBounds { index: pos, size });
        }
        let (leaf, local) = self.locate(store, stream, pos as u64)?;
        LeafNodeSo::new(&self.layout, &leaf)?.get(stream, local)
    }

    /// Rank of the first entry of `stream` whose `column` is at least `key`.
    ///
    /// Needs a stream with a maximum index and entries sorted by `column`.
    pub fn find_by_key<S: NodeSource + ?Sized>(
        &self,
        store: &S,
        stream: usize,
        column: usize,
        key: u64,
    ) -> Result<Option<usize>> {
        let mut rank = 0usize;
        let mut node = store.read_node(self.root)?;
        loop {
            if node.is_leaf() {
                let leaf = LeafNodeSo::new(&self.layout, &node)?;
                return Ok(leaf.find_ge(stream, column, key)?.map(|idx| rank + idx));
            }
            let branch = BranchNodeSo::new(&self.layout, &node)?;
            let Some(idx) = branch.find_child_by_key(stream, column, key)? else {
                return Ok(None);
            };
            rank += branch.sums(stream, 0, idx)?[0] as usize;
            let child = branch.child(idx)?;
            node = store.read_node(child)?;
        }
    }

    /// Statistics of `stream` over entries `[0, end)`.
    ///
    /// The result has the layout of the stream's entry slots: the entry
    /// count followed by the stream's statistics.
    pub fn prefix_sum<S: NodeSource + ?Sized>(
        &self,
        store: &S,
        stream: usize,
        end: usize,
    ) -> Result<Vec<u64>> {
        let size = self.size(store, stream)?;
        if end > size {
            return Err(TesseraError::RangeOutOfBounds {
                start: 0,
                end,
                size,
            });
        }
        let entry_layout = self.layout.entry_layout();
        let mut acc = BranchNodeEntry::zero(entry_layout);
        let mut pos = end as u64;
        let mut node = store.read_node(self.root)?;
        loop {
            if node.is_leaf() {
                let leaf = LeafNodeSo::new(&self.layout, &node)?;
                leaf.sums_into(stream, 0, pos as usize, &mut acc)?;
                break;
            }
            let branch = BranchNodeSo::new(&self.layout, &node)?;
            let Some((idx, before)) = branch.find_child_by_rank(stream, pos)? else {
                let children = branch.size()?;
                branch.sums_into(stream, 0, children, &mut acc)?;
                break;
            };
            branch.sums_into(stream, 0, idx, &mut acc)?;
            pos -= before;
            let child = branch.child(idx)?;
            node = store.read_node(child)?;
        }
        Ok(acc.stream(stream, entry_layout)?.to_vec())
    }

    /// Every entry of `stream` in order.
    pub fn scan<S: NodeSource + ?Sized>(&self, store: &S, stream: usize) -> Result<Vec<Vec<u64>>> {
        let mut rows = Vec::new();
        let mut pending = vec![self.root];
        while let Some(id) = pending.pop() {
            let node = store.read_node(id)?;
            if node.is_leaf() {
                let leaf = LeafNodeSo::new(&self.layout, &node)?;
                for idx in 0..leaf.size(stream)? {
                    rows.push(leaf.get(stream, idx)?);
                }
            } else {
                let branch = BranchNodeSo::new(&self.layout, &node)?;
                pending.extend(branch.children()?.into_iter().rev());
            }
        }
        Ok(rows)
    }

    /// Inserts entries into every stream of `group` before position `at`.
    ///
    /// `values[k]` holds the row-major rows for the k-th stream of the
    /// group; all streams must receive the same number of entries.
    pub fn insert<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: usize,
        at: usize,
        values: &[Vec<u64>],
    ) -> Result<()> {
        let members = self.layout.group_members(group)?;
        let widths = self.entry_widths(&members)?;
        let count = self.batch_len(&members, &widths, values)?;
        if count == 0 {
            return Ok(());
        }
        let size = self.size(store, members[0])?;
        if at > size {
            return Err(TesseraError::IndexOutOfBounds { index: at, size });
        }

        let mut descent = self.descend_mut(store, members[0], at as u64)?;
        let status = LeafNodeSo::new(&self.layout, &mut descent.leaf)?.insert_group(
            group,
            descent.pos,
            values,
        )?;
        if status.is_success() {
            store.write_node(&descent.leaf)?;
            return self.refresh_path(store, &descent.path);
        }

        if count > 1 {
            for k in 0..count {
                let single: Vec<Vec<u64>> = values
                    .iter()
                    .zip(&widths)
                    .map(|(rows, &w)| rows[k * w..(k + 1) * w].to_vec())
                    .collect();
                self.insert(store, group, at + k, &single)?;
            }
            return Ok(());
        }
        self.insert_with_split(store, descent, group, values)
    }

    /// Removes entries `[start, end)` from every stream of `group`.
    pub fn remove<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        group: usize,
        start: usize,
        end: usize,
    ) -> Result<()> {
        let members = self.layout.group_members(group)?;
        let size = self.size(store, members[0])?;
        if start > end || end > size {
            return Err(TesseraError::RangeOutOfBounds { start, end, size });
        }
        let mut remaining = end - start;
        while remaining > 0 {
            let mut descent = self.descend_mut(store, members[0], start as u64)?;
            let local = descent.pos;
            let mut leaf = LeafNodeSo::new(&self.layout, &mut descent.leaf)?;
            let held = leaf.group_size(group)?;
            let count = remaining.min(held - local);
            if leaf.remove_group(group, local, local + count)?.is_success() {
                store.write_node(&descent.leaf)?;
                self.refresh_path(store, &descent.path)?;
                self.rebalance(store, &descent.path)?;
                remaining -= count;
                continue;
            }
            // Removal grew an encoding past the node; isolate the range.
            let at = if local > 0 { local } else { count };
            let Descent { path, leaf, .. } = descent;
            self.split_leaf(store, path, leaf, group, at)?;
        }
        self.collapse_root(store)
    }

    /// Replaces entry `pos` of `stream`.
    pub fn update<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        stream: usize,
        pos: usize,
        row: &[u64],
    ) -> Result<()> {
        let size = self.size(store, stream)?;
        if pos >= size {
            return Err(TesseraError::IndexOutOfBounds { index: pos, size });
        }
        let group = self.layout.group_of(stream)?;
        let mut isolated = false;
        loop {
            let mut descent = self.descend_mut(store, stream, pos as u64)?;
            let local = descent.pos;
            let mut leaf = LeafNodeSo::new(&self.layout, &mut descent.leaf)?;
            if leaf.set(stream, local, row)?.is_success() {
                store.write_node(&descent.leaf)?;
                return self.refresh_path(store, &descent.path);
            }
            let held = leaf.group_size(group)?;
            if isolated || held == 1 {
                return Err(too_large("row"));
            }
            let at = if local > 0 { local } else { 1 };
            isolated = local == 0 || local + 1 == held;
            let Descent { path, leaf, .. } = descent;
            self.split_leaf(store, path, leaf, group, at)?;
        }
    }

    /// Makes every node on the path to entry `pos` of `stream` exclusively
    /// owned without changing any entry.
    pub fn touch<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        stream: usize,
        pos: usize,
    ) -> Result<()> {
        let size = self.size(store, stream)?;
        if pos >= size {
            return Err(TesseraError::IndexOutOfBounds { index: pos, size });
        }
        self.descend_mut(store, stream, pos as u64)?;
        Ok(())
    }

    /// Drops the owner's reference on the root, releasing every node no
    /// other tree shares.
    pub fn release<S: NodeStore + ?Sized>(self, store: &mut S) -> Result<()> {
        release_block(store, self.root)
    }

    /// Checks the structure of the whole tree.
    pub fn check<S: NodeSource + ?Sized>(&self, store: &S) -> Result<()> {
        let root = store.read_node(self.root)?;
        if !root.is_root() {
            return Err(self.corrupted(self.root, "root lacks the root flag"));
        }
        let mut pending = vec![root];
        while let Some(node) = pending.pop() {
            let id = node.block_id();
            if node.ctr_id() != self.ctr_id {
                return Err(self.corrupted(id, "node belongs to another container"));
            }
            if node.is_leaf() {
                if node.next_leaf_id().is_valid() {
                    return Err(self.corrupted(id, "leaf links a sibling"));
                }
                LeafNodeSo::new(&self.layout, &node)?.check()?;
                continue;
            }
            let branch = BranchNodeSo::new(&self.layout, &node)?;
            branch.check()?;
            if branch.size()? == 0 {
                return Err(self.corrupted(id, "branch without children"));
            }
            for idx in 0..branch.size()? {
                let child = store.read_node(branch.child(idx)?)?;
                if child.level() + 1 != node.level() {
                    return Err(self.corrupted(child.block_id(), "unexpected node level"));
                }
                if child.is_root() {
                    return Err(self.corrupted(child.block_id(), "inner node has the root flag"));
                }
                if branch.child_entry(idx)? != self.entry_of(&child)? {
                    return Err(self.corrupted(id, "child entry differs from the child's totals"));
                }
                pending.push(child);
            }
        }
        Ok(())
    }

    fn corrupted(&self, id: BlockId, reason: &str) -> TesseraError {
        TesseraError::BlockCorrupted {
            block_id: id.0,
            reason: reason.to_string(),
        }
    }

    fn entry_widths(&self, members: &[usize]) -> Result<Vec<usize>> {
        members
            .iter()
            .map(|&stream| {
                let desc = self.layout.leaf().descriptor(stream)?;
                Ok(desc.params.entry_width(desc.kind))
            })
            .collect()
    }

    /// Number of entries in a group batch.
    fn batch_len(&self, members: &[usize], widths: &[usize], values: &[Vec<u64>]) -> Result<usize> {
        if values.len() != members.len() {
            return Err(TesseraError::InvalidParameter {
                name: "values".to_string(),
                value: format!("{} row sets for {} streams", values.len(), members.len()),
            });
        }
        let mut count = None;
        for (rows, &width) in values.iter().zip(widths) {
            if rows.len() % width != 0 || count.is_some_and(|c| c != rows.len() / width) {
                return Err(TesseraError::InvalidParameter {
                    name: "values".to_string(),
                    value: "row sets of unequal length".to_string(),
                });
            }
            count = Some(rows.len() / width);
        }
        Ok(count.unwrap_or(0))
    }

    fn entry_of(&self, node: &NodeBlock) -> Result<BranchNodeEntry> {
        if node.is_leaf() {
            LeafNodeSo::new(&self.layout, node)?.node_entry()
        } else {
            BranchNodeSo::new(&self.layout, node)?.node_entry()
        }
    }

    /// Child covering `pos` of `stream` and the entries before it.
    ///
    /// A position at the end of the stream maps to the last child.
    fn pick_child<N: Deref<Target = NodeBlock>>(
        branch: &BranchNodeSo<'_, N>,
        stream: usize,
        pos: u64,
    ) -> Result<(usize, u64)> {
        if let Some(found) = branch.find_child_by_rank(stream, pos)? {
            return Ok(found);
        }
        let children = branch.size()?;
        if children == 0 {
            return Err(TesseraError::BlockCorrupted {
                block_id: branch.node().block_id().0,
                reason: "branch without children".to_string(),
            });
        }
        let last = children - 1;
        Ok((last, branch.sums(stream, 0, last)?[0]))
    }

    /// Leaf holding `pos` of `stream` and the position inside it.
    fn locate<S: NodeSource + ?Sized>(
        &self,
        store: &S,
        stream: usize,
        mut pos: u64,
    ) -> Result<(NodeBlock, usize)> {
        let mut node = store.read_node(self.root)?;
        while !node.is_leaf() {
            let branch = BranchNodeSo::new(&self.layout, &node)?;
            let (idx, before) = Self::pick_child(&branch, stream, pos)?;
            pos -= before;
            let child = branch.child(idx)?;
            node = store.read_node(child)?;
        }
        Ok((node, pos as usize))
    }

    /// Descends to `pos` of `stream`, copying every shared node on the way.
    fn descend_mut<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        stream: usize,
        mut pos: u64,
    ) -> Result<Descent> {
        self.root = prepare_for_update(store, self.root)?;
        let mut path = vec![PathStep {
            id: self.root,
            index: 0,
        }];
        let mut node = store.read_node(self.root)?;
        while !node.is_leaf() {
            let (idx, child, before) = {
                let branch = BranchNodeSo::new(&self.layout, &node)?;
                let (idx, before) = Self::pick_child(&branch, stream, pos)?;
                (idx, branch.child(idx)?, before)
            };
            pos -= before;
            let owned = prepare_for_update(store, child)?;
            if owned != child {
                BranchNodeSo::new(&self.layout, &mut node)?.set_child(idx, owned)?;
                store.write_node(&node)?;
            }
            path.push(PathStep { id: owned, index: idx });
            node = store.read_node(owned)?;
        }
        Ok(Descent {
            path,
            leaf: node,
            pos: pos as usize,
        })
    }

    /// Rewrites the child entries along `path`, bottom-up.
    fn refresh_path<S: NodeStore + ?Sized>(&self, store: &mut S, path: &[PathStep]) -> Result<()> {
        for depth in (1..path.len()).rev() {
            let entry = self.entry_of(&store.read_node(path[depth].id)?)?;
            let mut parent = store.read_node(path[depth - 1].id)?;
            BranchNodeSo::new(&self.layout, &mut parent)?.update_entry(path[depth].index, &entry)?;
            store.write_node(&parent)?;
        }
        Ok(())
    }

    /// Splits leaf `left`, the last node of `path`, moving `group` entries
    /// from `at` on into a new right sibling.
    fn split_leaf<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        path: Vec<PathStep>,
        mut left: NodeBlock,
        group: usize,
        at: usize,
    ) -> Result<()> {
        let mut right = create_node(store, BlockKind::Leaf, 0, self.ctr_id, &self.layout)?;
        let status = {
            let mut left_leaf = LeafNodeSo::new(&self.layout, &mut left)?;
            let from = left_leaf.split_points(group, at)?;
            let mut right_leaf = LeafNodeSo::new(&self.layout, &mut right)?;
            left_leaf.split_to(&mut right_leaf, &from)?
        };
        if !status.is_success() {
            release_block(store, right.block_id())?;
            return Err(too_large("values"));
        }
        debug!(left = %left.block_id(), right = %right.block_id(), at, "split leaf");
        self.propagate_split(store, &path, left, right)
    }

    /// Splits the leaf of `descent` and inserts a single entry into the
    /// half covering its position.
    fn insert_with_split<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        descent: Descent,
        group: usize,
        values: &[Vec<u64>],
    ) -> Result<()> {
        let Descent {
            path,
            leaf: mut left,
            pos,
        } = descent;
        let (sizes, half, to_left, from) = {
            let leaf = LeafNodeSo::new(&self.layout, &left)?;
            let held = leaf.group_size(group)?;
            // A group holding at most one entry is split at the insert position.
            let half = if held > 1 { held / 2 } else { pos };
            let to_left = if held > 1 { pos <= half } else { pos == 0 };
            (leaf.sizes()?, half, to_left, leaf.split_points(group, half)?)
        };
        if from == sizes && to_left {
            return Err(too_large("values"));
        }

        let mut right = create_node(store, BlockKind::Leaf, 0, self.ctr_id, &self.layout)?;
        let status = {
            let mut left_leaf = LeafNodeSo::new(&self.layout, &mut left)?;
            let mut right_leaf = LeafNodeSo::new(&self.layout, &mut right)?;
            if !left_leaf.split_to(&mut right_leaf, &from)?.is_success() {
                UpdateStatus::Failure
            } else if to_left {
                left_leaf.insert_group(group, pos, values)?
            } else {
                right_leaf.insert_group(group, pos - half, values)?
            }
        };
        if !status.is_success() {
            // The stored left leaf is still the unsplit original.
            release_block(store, right.block_id())?;
            return Err(too_large("values"));
        }
        debug!(left = %left.block_id(), right = %right.block_id(), half, "split leaf");
        self.propagate_split(store, &path, left, right)
    }

    /// Hooks `right`, the new right sibling of the last node of `path`,
    /// into the tree, splitting full parents up to the root.
    fn propagate_split<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        path: &[PathStep],
        mut left: NodeBlock,
        mut right: NodeBlock,
    ) -> Result<()> {
        let mut depth = path.len() - 1;
        loop {
            store.write_node(&left)?;
            store.write_node(&right)?;
            let left_entry = self.entry_of(&left)?;
            let right_entry = self.entry_of(&right)?;

            if depth == 0 {
                return self.create_new_root(store, left, right, &left_entry, &right_entry);
            }

            let idx = path[depth].index;
            let mut parent = store.read_node(path[depth - 1].id)?;
            let status = {
                let mut branch = BranchNodeSo::new(&self.layout, &mut parent)?;
                branch.update_entry(idx, &left_entry)?;
                branch.insert_child(idx + 1, right.block_id(), &right_entry)?
            };
            if status.is_success() {
                store.write_node(&parent)?;
                return self.refresh_path(store, &path[..depth]);
            }

            // Split the parent
            let mut sibling =
                create_node(store, BlockKind::Branch, parent.level(), self.ctr_id, &self.layout)?;
            {
                let mut branch = BranchNodeSo::new(&self.layout, &mut parent)?;
                let children = branch.size()?;
                if children < 2 {
                    return Err(TesseraError::Internal(format!(
                        "branch {} is full with {} children",
                        path[depth - 1].id,
                        children
                    )));
                }
                let half = children / 2;
                let mut other = BranchNodeSo::new(&self.layout, &mut sibling)?;
                if !branch.split_to(&mut other, half)?.is_success() {
                    return Err(TesseraError::Internal(format!(
                        "half of branch {} does not fit an empty branch",
                        path[depth - 1].id
                    )));
                }
                let status = if idx < half {
                    branch.insert_child(idx + 1, right.block_id(), &right_entry)?
                } else {
                    other.insert_child(idx + 1 - half, right.block_id(), &right_entry)?
                };
                if !status.is_success() {
                    return Err(TesseraError::Internal(
                        "child entry does not fit a half-full branch".to_string(),
                    ));
                }
            }
            debug!(left = %parent.block_id(), right = %sibling.block_id(), level = parent.level(), "split branch");

            left = parent;
            right = sibling;
            depth -= 1;
        }
    }

    /// Grows the tree by one level above `left` (the old root) and `right`.
    fn create_new_root<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        mut left: NodeBlock,
        right: NodeBlock,
        left_entry: &BranchNodeEntry,
        right_entry: &BranchNodeEntry,
    ) -> Result<()> {
        let level = left.level() + 1;
        let mut root = create_node(store, BlockKind::Branch, level, self.ctr_id, &self.layout)?;
        {
            let mut branch = BranchNodeSo::new(&self.layout, &mut root)?;
            let first = branch.insert_child(0, left.block_id(), left_entry)?;
            let second = branch.insert_child(1, right.block_id(), right_entry)?;
            if !(first.is_success() && second.is_success()) {
                return Err(TesseraError::Internal(
                    "two child entries do not fit an empty branch".to_string(),
                ));
            }
        }
        root.set_root(true);
        store.write_node(&root)?;
        left.set_root(false);
        store.write_node(&left)?;
        self.root = root.block_id();
        debug!(root = %self.root, level, "grew tree");
        Ok(())
    }

    /// Merges underfull nodes on `path` into a sibling, bottom-up.
    ///
    /// Merging preserves subtree totals, so ancestors need no refresh.
    fn rebalance<S: NodeStore + ?Sized>(&mut self, store: &mut S, path: &[PathStep]) -> Result<()> {
        let threshold = self.config.merge_threshold_percent;
        for depth in (1..path.len()).rev() {
            let node = store.read_node(path[depth].id)?;
            let underfull = if node.is_leaf() {
                LeafNodeSo::new(&self.layout, &node)?.should_be_merged_with_siblings(threshold)
            } else {
                BranchNodeSo::new(&self.layout, &node)?.should_be_merged_with_siblings(threshold)
            };
            if !underfull || !self.merge_with_sibling(store, path[depth - 1].id, path[depth].index, node)? {
                break;
            }
        }
        Ok(())
    }

    /// Merges child `idx` of `parent_id` with a sibling. Returns false when
    /// neither sibling can take the merge.
    fn merge_with_sibling<S: NodeStore + ?Sized>(
        &mut self,
        store: &mut S,
        parent_id: BlockId,
        idx: usize,
        node: NodeBlock,
    ) -> Result<bool> {
        let mut parent = store.read_node(parent_id)?;
        let children = BranchNodeSo::new(&self.layout, &parent)?.children()?;

        // The survivor is the left node of the pair; it must be exclusive.
        let (survivor_idx, mut survivor, removed) = if idx + 1 < children.len() {
            let right = store.read_node(children[idx + 1])?;
            if !self.mergeable(&right, &node)? {
                return Ok(false);
            }
            (idx, node, right)
        } else if idx > 0 {
            let left = store.read_node(children[idx - 1])?;
            if !self.mergeable(&node, &left)? {
                return Ok(false);
            }
            let owned = prepare_for_update(store, children[idx - 1])?;
            if owned != children[idx - 1] {
                BranchNodeSo::new(&self.layout, &mut parent)?.set_child(idx - 1, owned)?;
            }
            (idx - 1, store.read_node(owned)?, node)
        } else {
            return Ok(false);
        };

        let status = if survivor.is_leaf() {
            let mut target = LeafNodeSo::new(&self.layout, &mut survivor)?;
            LeafNodeSo::new(&self.layout, &removed)?.merge_with(&mut target)?
        } else {
            let mut target = BranchNodeSo::new(&self.layout, &mut survivor)?;
            BranchNodeSo::new(&self.layout, &removed)?.merge_with(&mut target)?
        };
        if !status.is_success() {
            store.write_node(&parent)?;
            return Ok(false);
        }
        // The survivor now shares the removed node's references.
        removed.for_all_block_refs(&mut |id| store.ref_block(id))?;
        store.write_node(&survivor)?;

        let entry = self.entry_of(&survivor)?;
        {
            let mut branch = BranchNodeSo::new(&self.layout, &mut parent)?;
            branch.remove_children(survivor_idx + 1, survivor_idx + 2)?;
            branch.update_entry(survivor_idx, &entry)?;
        }
        store.write_node(&parent)?;
        release_block(store, removed.block_id())?;
        debug!(
            survivor = %survivor.block_id(),
            removed = %removed.block_id(),
            level = survivor.level(),
            "merged nodes"
        );
        Ok(true)
    }

    /// Whether `src` can be appended to `dst`.
    fn mergeable(&self, src: &NodeBlock, dst: &NodeBlock) -> Result<bool> {
        if src.is_leaf() {
            LeafNodeSo::new(&self.layout, src)?.can_be_merged_with(&LeafNodeSo::new(&self.layout, dst)?)
        } else {
            BranchNodeSo::new(&self.layout, src)?
                .can_be_merged_with(&BranchNodeSo::new(&self.layout, dst)?)
        }
    }

    /// Replaces a root branch holding a single child by that child.
    fn collapse_root<S: NodeStore + ?Sized>(&mut self, store: &mut S) -> Result<()> {
        loop {
            let node = store.read_node(self.root)?;
            if node.is_leaf() {
                return Ok(());
            }
            let branch = BranchNodeSo::new(&self.layout, &node)?;
            if branch.size()? != 1 {
                return Ok(());
            }
            let child = branch.child(0)?;
            store.ref_block(child)?;
            release_block(store, self.root)?;
            let owned = prepare_for_update(store, child)?;
            let mut root = store.read_node(owned)?;
            root.set_root(true);
            store.write_node(&root)?;
            trace!(from = %self.root, to = %owned, "collapsed root");
            self.root = owned;
        }
    }
}

fn too_large(name: &str) -> TesseraError {
    TesseraError::InvalidParameter {
        name: name.to_string(),
        value: "entry does not fit an empty node".to_string(),
    }
}

fn check_block_size(block_size: usize, config: &NodeConfig) -> Result<()> {
    if block_size != config.block_size {
        return Err(TesseraError::BlockSizeMismatch {
            expected: config.block_size,
            actual: block_size,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryNodeStore;
    use tessera_packed::{IndexKind, SubstreamDescriptor, SubstreamKind, SubstreamParams};

    const BLOCK: usize = 512;

    fn config() -> NodeConfig {
        NodeConfig {
            block_size: BLOCK,
            merge_threshold_percent: 50,
        }
    }

    fn keyed_layout() -> NodeLayout {
        NodeLayout::new(vec![SubstreamDescriptor::new(
            SubstreamKind::FseTree,
            0,
            SubstreamParams::columns(1).with_index(IndexKind::Max),
        )])
        .unwrap()
    }

    fn two_group_layout() -> NodeLayout {
        NodeLayout::new(vec![
            SubstreamDescriptor::fse_tree(0, 1),
            SubstreamDescriptor::vle_array(1, 1),
        ])
        .unwrap()
    }

    fn tree(store: &mut MemoryNodeStore, layout: NodeLayout) -> BTree {
        BTree::create(store, layout, config(), ContainerId(16)).unwrap()
    }

    fn fill(store: &mut MemoryNodeStore, tree: &mut BTree, count: u64) {
        for value in 0..count {
            tree.insert(store, 0, value as usize, &[vec![value * 10]]).unwrap();
        }
    }

    #[test]
    fn test_empty_tree() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let tree = tree(&mut store, keyed_layout());
        assert_eq!(tree.sizes(&store).unwrap(), vec![0]);
        assert_eq!(tree.height(&store).unwrap(), 1);
        assert!(tree.is_empty(&store).unwrap());
        assert!(tree.get(&store, 0, 0).is_err());
        tree.check(&store).unwrap();
    }

    #[test]
    fn test_insert_grows_tree() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut tree = tree(&mut store, keyed_layout());
        fill(&mut store, &mut tree, 1000);

        assert!(tree.height(&store).unwrap() >= 3);
        assert_eq!(tree.size(&store, 0).unwrap(), 1000);
        for pos in [0usize, 1, 57, 499, 999] {
            assert_eq!(tree.get(&store, 0, pos).unwrap(), vec![pos as u64 * 10]);
        }
        let scanned: Vec<u64> = tree.scan(&store, 0).unwrap().into_iter().map(|r| r[0]).collect();
        assert_eq!(scanned, (0..1000).map(|v| v * 10).collect::<Vec<_>>());
        tree.check(&store).unwrap();
    }

    #[test]
    fn test_find_by_key_and_prefix_sum() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut tree = tree(&mut store, keyed_layout());
        fill(&mut store, &mut tree, 300);

        assert_eq!(tree.find_by_key(&store, 0, 0, 0).unwrap(), Some(0));
        assert_eq!(tree.find_by_key(&store, 0, 0, 1234).unwrap(), Some(124));
        assert_eq!(tree.find_by_key(&store, 0, 0, 2990).unwrap(), Some(299));
        assert_eq!(tree.find_by_key(&store, 0, 0, 2991).unwrap(), None);

        // count, then the running maximum
        assert_eq!(tree.prefix_sum(&store, 0, 0).unwrap(), vec![0, 0]);
        assert_eq!(tree.prefix_sum(&store, 0, 150).unwrap(), vec![150, 1490]);
        assert_eq!(tree.prefix_sum(&store, 0, 300).unwrap(), vec![300, 2990]);
        assert!(tree.prefix_sum(&store, 0, 301).is_err());
    }

    #[test]
    fn test_insert_in_the_middle() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut tree = tree(&mut store, two_group_layout());
        for value in 0..200u64 {
            tree.insert(&mut store, 0, 0, &[vec![value]]).unwrap();
        }
        tree.insert(&mut store, 0, 100, &[vec![7, 8, 9]]).unwrap();
        tree.insert(&mut store, 1, 0, &[vec![42]]).unwrap();

        assert_eq!(tree.sizes(&store).unwrap(), vec![203, 1]);
        assert_eq!(tree.get(&store, 0, 100).unwrap(), vec![7]);
        assert_eq!(tree.get(&store, 0, 102).unwrap(), vec![9]);
        assert_eq!(tree.get(&store, 0, 103).unwrap(), vec![99]);
        assert_eq!(tree.get(&store, 1, 0).unwrap(), vec![42]);
        tree.check(&store).unwrap();
    }

    #[test]
    fn test_remove_shrinks_tree() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut tree = tree(&mut store, keyed_layout());
        fill(&mut store, &mut tree, 400);

        tree.remove(&mut store, 0, 10, 390).unwrap();
        assert_eq!(tree.size(&store, 0).unwrap(), 20);
        let scanned: Vec<u64> = tree.scan(&store, 0).unwrap().into_iter().map(|r| r[0]).collect();
        let expected: Vec<u64> = (0..10).chain(390..400).map(|v| v * 10).collect();
        assert_eq!(scanned, expected);
        tree.check(&store).unwrap();

        tree.remove(&mut store, 0, 0, 20).unwrap();
        assert!(tree.is_empty(&store).unwrap());
        tree.check(&store).unwrap();
        tree.release(&mut store).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_update() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut tree = tree(&mut store, keyed_layout());
        fill(&mut store, &mut tree, 100);
        tree.update(&mut store, 0, 50, &[5000]).unwrap();
        assert_eq!(tree.get(&store, 0, 50).unwrap(), vec![5000]);
        assert_eq!(tree.prefix_sum(&store, 0, 100).unwrap(), vec![100, 5000]);
        assert!(tree.update(&mut store, 0, 100, &[1]).is_err());
        tree.check(&store).unwrap();
    }

    #[test]
    fn test_shared_root_is_copied() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut tree = tree(&mut store, keyed_layout());
        fill(&mut store, &mut tree, 200);

        let snapshot = tree.clone();
        store.ref_block(snapshot.root()).unwrap();
        tree.insert(&mut store, 0, 0, &[vec![1]]).unwrap();

        assert_ne!(tree.root(), snapshot.root());
        assert_eq!(snapshot.size(&store, 0).unwrap(), 200);
        assert_eq!(tree.size(&store, 0).unwrap(), 201);
        snapshot.check(&store).unwrap();
        tree.check(&store).unwrap();

        snapshot.release(&mut store).unwrap();
        tree.check(&store).unwrap();
        tree.release(&mut store).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_touch_copies_path_only() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut tree = tree(&mut store, keyed_layout());
        fill(&mut store, &mut tree, 400);
        let snapshot = tree.clone();
        store.ref_block(snapshot.root()).unwrap();
        let before = store.len();

        tree.touch(&mut store, 0, 399).unwrap();
        assert_eq!(store.len() - before, tree.height(&store).unwrap());
        assert_eq!(tree.scan(&store, 0).unwrap(), snapshot.scan(&store, 0).unwrap());
        assert!(tree.touch(&mut store, 0, 400).is_err());

        let touched = store.len();
        tree.touch(&mut store, 0, 399).unwrap();
        assert_eq!(store.len(), touched);

        snapshot.release(&mut store).unwrap();
        tree.release(&mut store).unwrap();
        assert!(store.is_empty());
    }

    #[test]
    fn test_open_checks_root() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut tree = tree(&mut store, keyed_layout());
        fill(&mut store, &mut tree, 200);

        let reopened =
            BTree::open(&store, keyed_layout(), config(), ContainerId(16), tree.root()).unwrap();
        assert_eq!(reopened.size(&store, 0).unwrap(), 200);

        assert!(matches!(
            BTree::open(&store, two_group_layout(), config(), ContainerId(16), tree.root()),
            Err(TesseraError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn test_group_batches_are_validated() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut tree = tree(&mut store, two_group_layout());
        assert!(tree.insert(&mut store, 0, 0, &[vec![1], vec![2]]).is_err());
        assert!(tree.insert(&mut store, 2, 0, &[vec![1]]).is_err());
        assert!(tree.insert(&mut store, 0, 1, &[vec![1]]).is_err());
        assert!(tree.remove(&mut store, 0, 0, 1).is_err());
    }

    #[test]
    fn test_leaves_stay_unlinked() {
        let mut store = MemoryNodeStore::new(BLOCK);
        let mut tree = tree(&mut store, keyed_layout());
        fill(&mut store, &mut tree, 300);
        assert!(tree.height(&store).unwrap() > 1);
        tree.check(&store).unwrap();

        let (mut leaf, _) = tree.locate(&store, 0, 0).unwrap();
        assert_eq!(leaf.next_leaf_id(), BlockId::INVALID);
        leaf.set_next_leaf_id(BlockId(99));
        store.write_node(&leaf).unwrap();
        assert!(matches!(
            tree.check(&store),
            Err(TesseraError::BlockCorrupted { .. })
        ));
    }
}
