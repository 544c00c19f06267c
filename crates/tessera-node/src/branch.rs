//! Branch node operations.
//!
//! A branch keeps one row per child in every per-stream tree (the child's
//! [`BranchNodeEntry`] slots for that stream) and the child ids in its last
//! substream. Children are addressed by index.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use tessera_common::{BlockId, BlockKind, Result, TesseraError};
use tessera_packed::{FseTreeView, PackedDispatcher, PreparedMutation, UpdateStatus};

use crate::entry::{BranchNodeEntry, SlotKind};
use crate::events::{DataEventHandler, TextDumpHandler};
use crate::header::NodeBlock;
use crate::layout::NodeLayout;
use crate::ops;
use crate::store::{NodeStore, release_block};

/// Branch operations over a node borrowed or owned as `N`.
#[derive(Debug)]
pub struct BranchNodeSo<'l, N> {
    layout: &'l NodeLayout,
    node: N,
}

fn fixed_size(status: Result<UpdateStatus>) -> Result<()> {
    match status? {
        UpdateStatus::Success => Ok(()),
        UpdateStatus::Failure => Err(TesseraError::Internal(
            "same-size branch update does not fit".to_string(),
        )),
    }
}

impl<'l, N: Deref<Target = NodeBlock>> BranchNodeSo<'l, N> {
    pub fn new(layout: &'l NodeLayout, node: N) -> Result<Self> {
        if node.kind() != BlockKind::Branch {
            return Err(TesseraError::InvalidBlockKind(node.kind() as u8));
        }
        node.check_layout(layout)?;
        Ok(Self { layout, node })
    }

    pub fn node(&self) -> &NodeBlock {
        &self.node
    }

    pub fn into_inner(self) -> N {
        self.node
    }

    pub fn layout(&self) -> &'l NodeLayout {
        self.layout
    }

    fn dispatcher(&self) -> &'l PackedDispatcher {
        self.layout.branch()
    }

    /// Number of children.
    pub fn size(&self) -> Result<usize> {
        self.dispatcher()
            .size(self.node.allocator(), self.layout.children_index())
    }

    pub fn child(&self, idx: usize) -> Result<BlockId> {
        let size = self.size()?;
        let view = self
            .dispatcher()
            .view(self.node.allocator(), self.layout.children_index())?
            .ok_or(TesseraError::IndexOutOfBounds { index: idx, size })?;
        match view.as_block_ids() {
            Some(ids) => ids.get(idx),
            None => Err(TesseraError::Internal("children are not block ids".to_string())),
        }
    }

    pub fn children(&self) -> Result<Vec<BlockId>> {
        (0..self.size()?).map(|idx| self.child(idx)).collect()
    }

    /// Index of child `id`.
    pub fn position_of(&self, id: BlockId) -> Result<Option<usize>> {
        Ok(self.children()?.iter().position(|&c| c == id))
    }

    fn stream_tree(&self, stream: usize) -> Result<Option<FseTreeView<'_>>> {
        match self.dispatcher().view(self.node.allocator(), stream)? {
            Some(view) => Ok(view.as_fse_tree().copied()),
            None => Ok(None),
        }
    }

    /// Entry kept for child `idx`.
    pub fn child_entry(&self, idx: usize) -> Result<BranchNodeEntry> {
        let size = self.size()?;
        if idx >= size {
            return Err(TesseraError::IndexOutOfBounds { index: idx, size });
        }
        let mut values = Vec::with_capacity(self.layout.entry_layout().width());
        for stream in 0..self.layout.streams() {
            match self.stream_tree(stream)? {
                Some(tree) => values.extend(tree.row(idx)?),
                None => {
                    return Err(TesseraError::PackedCorrupted(format!(
                        "branch {} lacks entries for stream {}",
                        self.node.block_id(),
                        stream
                    )));
                }
            }
        }
        Ok(BranchNodeEntry::from_values(values))
    }

    /// Slots of `stream` combined over children `[start, end)`.
    pub fn sums(&self, stream: usize, start: usize, end: usize) -> Result<Vec<u64>> {
        let slots = self.layout.entry_layout().stream_slots(stream)?;
        let Some(tree) = self.stream_tree(stream)? else {
            if start == 0 && end == 0 {
                return Ok(vec![0; slots.len()]);
            }
            return Err(TesseraError::RangeOutOfBounds {
                start,
                end,
                size: 0,
            });
        };
        slots
            .iter()
            .enumerate()
            .map(|(col, slot)| match slot {
                SlotKind::Max => tree.max(col, start, end),
                SlotKind::Size | SlotKind::Sum => tree.sum(col, start, end),
            })
            .collect()
    }

    pub fn sums_into(
        &self,
        stream: usize,
        start: usize,
        end: usize,
        entry: &mut BranchNodeEntry,
    ) -> Result<()> {
        let sums = self.sums(stream, start, end)?;
        entry.accumulate_stream(stream, &sums, self.layout.entry_layout())
    }

    /// The entry a parent keeps for this branch.
    pub fn node_entry(&self) -> Result<BranchNodeEntry> {
        let size = self.size()?;
        let mut entry = BranchNodeEntry::zero(self.layout.entry_layout());
        for stream in 0..self.layout.streams() {
            self.sums_into(stream, 0, size, &mut entry)?;
        }
        Ok(entry)
    }

    /// Folds the maximum slots of this branch into `entry`.
    pub fn max(&self, entry: &mut BranchNodeEntry) -> Result<()> {
        let mine = self.node_entry()?;
        let mut values = entry.values().to_vec();
        for (pos, slot) in self.layout.entry_layout().slots().iter().enumerate() {
            if *slot == SlotKind::Max {
                values[pos] = values[pos].max(mine.values()[pos]);
            }
        }
        *entry = BranchNodeEntry::from_values(values);
        Ok(())
    }

    /// Leaf entries below this branch, per stream.
    pub fn sizes(&self) -> Result<Vec<usize>> {
        let size = self.size()?;
        (0..self.layout.streams())
            .map(|stream| Ok(self.sums(stream, 0, size)?[0] as usize))
            .collect()
    }

    pub fn size_sums(&self) -> Result<Vec<u64>> {
        Ok(self.sizes()?.into_iter().map(|s| s as u64).collect())
    }

    /// Child holding entry `pos` of `stream`, with the entries before it.
    ///
    /// Returns `None` when `pos` is not below the stream size.
    pub fn find_child_by_rank(&self, stream: usize, pos: u64) -> Result<Option<(usize, u64)>> {
        match self.stream_tree(stream)? {
            Some(tree) => tree.find_sum(0, pos),
            None => Ok(None),
        }
    }

    /// First child whose maximum of `column` in `stream` is at least `key`.
    pub fn find_child_by_key(&self, stream: usize, column: usize, key: u64) -> Result<Option<usize>> {
        let slots = self.layout.entry_layout().stream_slots(stream)?;
        match slots.get(1 + column) {
            Some(SlotKind::Max) => {}
            _ => {
                return Err(TesseraError::InvalidParameter {
                    name: "column".to_string(),
                    value: format!("stream {} column {} has no maximum index", stream, column),
                });
            }
        }
        match self.stream_tree(stream)? {
            Some(tree) => tree.find_ge(1 + column, key),
            None => Ok(None),
        }
    }

    /// Whether appending this branch's children to `other` fits `other`.
    pub fn can_be_merged_with<M: Deref<Target = NodeBlock>>(
        &self,
        other: &BranchNodeSo<'_, M>,
    ) -> Result<bool> {
        ops::can_merge(self.dispatcher(), self.node.allocator(), other.node.allocator())
    }

    pub fn prepare_merge_with<'o, M: DerefMut<Target = NodeBlock>>(
        &self,
        other: &'o mut BranchNodeSo<'_, M>,
    ) -> Result<PreparedMutation<'o>> {
        ops::prepare_merge(
            self.dispatcher(),
            self.node.allocator(),
            other.node.allocator_mut(),
        )
    }

    pub fn commit_merge_with(prepared: PreparedMutation<'_>) {
        prepared.commit();
    }

    /// Appends every child of this branch to `other`.
    pub fn merge_with<M: DerefMut<Target = NodeBlock>>(
        &self,
        other: &mut BranchNodeSo<'_, M>,
    ) -> Result<UpdateStatus> {
        ops::apply(self.prepare_merge_with(other))
    }

    pub fn should_be_merged_with_siblings(&self, threshold_percent: u8) -> bool {
        ops::should_merge(self.node.allocator(), threshold_percent)
    }

    pub fn check(&self) -> Result<()> {
        if self.node.level() == 0 {
            return Err(TesseraError::PackedCorrupted(format!(
                "branch {} has level 0",
                self.node.block_id()
            )));
        }
        ops::check(self.dispatcher(), self.node.allocator())
    }

    pub fn generate_data_events(&self, handler: &mut dyn DataEventHandler) -> Result<()> {
        ops::generate_events(self.dispatcher(), &self.node, handler)
    }

    pub fn dump(&self) -> Result<String> {
        let mut handler = TextDumpHandler::new();
        self.generate_data_events(&mut handler)?;
        Ok(handler.into_string())
    }

    pub fn for_all_block_refs(&self, f: &mut dyn FnMut(BlockId) -> Result<()>) -> Result<()> {
        self.node.for_all_block_refs(f)
    }

    pub fn cow_ref_children<S: NodeStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        self.for_all_block_refs(&mut |id| store.ref_block(id))
    }

    pub fn cow_unref_children<S: NodeStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        for id in self.children()? {
            release_block(store, id)?;
        }
        Ok(())
    }
}

impl<'l, N: DerefMut<Target = NodeBlock>> BranchNodeSo<'l, N> {
    pub fn node_mut(&mut self) -> &mut NodeBlock {
        &mut self.node
    }

    /// Prepares inserting child `id` with `entry` before child `idx`.
    pub fn prepare_insert(
        &mut self,
        idx: usize,
        id: BlockId,
        entry: &BranchNodeEntry,
    ) -> Result<PreparedMutation<'_>> {
        let layout = self.layout;
        let dispatcher = self.dispatcher();
        let alloc = self.node.allocator_mut();
        let mut edits = BTreeMap::new();
        for stream in 0..layout.streams() {
            let mut data = dispatcher.data(alloc, stream)?;
            data.insert_rows(idx, entry.stream(stream, layout.entry_layout())?)?;
            edits.insert(stream, data);
        }
        let mut children = dispatcher.data(alloc, layout.children_index())?;
        children.insert_rows(idx, &[id.as_u64()])?;
        edits.insert(layout.children_index(), children);
        ops::prepare_edits(dispatcher, alloc, edits)
    }

    pub fn insert_child(
        &mut self,
        idx: usize,
        id: BlockId,
        entry: &BranchNodeEntry,
    ) -> Result<UpdateStatus> {
        ops::apply(self.prepare_insert(idx, id, entry))
    }

    /// Prepares removing children `[start, end)`.
    pub fn prepare_remove(&mut self, start: usize, end: usize) -> Result<PreparedMutation<'_>> {
        let dispatcher = self.dispatcher();
        let from = vec![start; dispatcher.len()];
        let to = vec![end; dispatcher.len()];
        let edits = ops::remove_edits(dispatcher, self.node.allocator(), &from, &to)?;
        ops::prepare_edits(dispatcher, self.node.allocator_mut(), edits)
    }

    pub fn commit_remove(prepared: PreparedMutation<'_>) {
        prepared.commit();
    }

    pub fn remove(&mut self, start: usize, end: usize) -> Result<UpdateStatus> {
        ops::apply(self.prepare_remove(start, end))
    }

    /// Removes children `[start, end)`; shrinking fixed-size rows always fits.
    pub fn remove_children(&mut self, start: usize, end: usize) -> Result<()> {
        fixed_size(self.remove(start, end))
    }

    /// Replaces the id of child `idx`.
    pub fn set_child(&mut self, idx: usize, id: BlockId) -> Result<()> {
        let dispatcher = self.dispatcher();
        let children_index = self.layout.children_index();
        let alloc = self.node.allocator_mut();
        let mut children = dispatcher.data(alloc, children_index)?;
        children.set_row(idx, &[id.as_u64()])?;
        fixed_size(ops::apply(ops::prepare_edits(
            dispatcher,
            alloc,
            BTreeMap::from([(children_index, children)]),
        )))
    }

    /// Replaces the entry of child `idx`.
    pub fn update_entry(&mut self, idx: usize, entry: &BranchNodeEntry) -> Result<()> {
        let layout = self.layout;
        let dispatcher = self.dispatcher();
        let alloc = self.node.allocator_mut();
        let mut edits = BTreeMap::new();
        for stream in 0..layout.streams() {
            let mut data = dispatcher.data(alloc, stream)?;
            data.set_row(idx, entry.stream(stream, layout.entry_layout())?)?;
            edits.insert(stream, data);
        }
        fixed_size(ops::apply(ops::prepare_edits(dispatcher, alloc, edits)))
    }

    /// Moves children `[at, size)` in front of the children of `other`,
    /// or returns [`UpdateStatus::Failure`] leaving both untouched.
    pub fn split_to<M: DerefMut<Target = NodeBlock>>(
        &mut self,
        other: &mut BranchNodeSo<'_, M>,
        at: usize,
    ) -> Result<UpdateStatus> {
        let from = vec![at; self.dispatcher().len()];
        ops::split_streams(
            self.dispatcher(),
            self.node.allocator_mut(),
            other.node.allocator_mut(),
            &from,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_common::ContainerId;
    use tessera_packed::{IndexKind, SubstreamDescriptor, SubstreamKind, SubstreamParams};

    fn layout() -> NodeLayout {
        NodeLayout::new(vec![
            SubstreamDescriptor::new(
                SubstreamKind::FseTree,
                0,
                SubstreamParams::columns(1).with_index(IndexKind::Max),
            ),
            SubstreamDescriptor::seq(1, 1),
        ])
        .unwrap()
    }

    fn branch_node(layout: &NodeLayout, id: u64) -> NodeBlock {
        NodeBlock::new(BlockId(id), BlockKind::Branch, 1, ContainerId(16), 4096, layout).unwrap()
    }

    fn entry(values: &[u64]) -> BranchNodeEntry {
        BranchNodeEntry::from_values(values.to_vec())
    }

    fn filled(layout: &NodeLayout) -> NodeBlock {
        let mut node = branch_node(layout, 1);
        let mut branch = BranchNodeSo::new(layout, &mut node).unwrap();
        // size, max | size, zeros, ones
        branch.insert_child(0, BlockId(10), &entry(&[4, 40, 2, 1, 1])).unwrap();
        branch.insert_child(1, BlockId(11), &entry(&[3, 70, 5, 5, 0])).unwrap();
        branch.insert_child(2, BlockId(12), &entry(&[5, 90, 0, 0, 0])).unwrap();
        node
    }

    #[test]
    fn test_children_and_entries() {
        let layout = layout();
        let node = filled(&layout);
        let branch = BranchNodeSo::new(&layout, &node).unwrap();
        assert_eq!(branch.size().unwrap(), 3);
        assert_eq!(
            branch.children().unwrap(),
            vec![BlockId(10), BlockId(11), BlockId(12)]
        );
        assert_eq!(branch.child_entry(1).unwrap().values(), &[3, 70, 5, 5, 0]);
        assert_eq!(branch.node_entry().unwrap().values(), &[12, 90, 7, 6, 1]);
        assert_eq!(branch.sizes().unwrap(), vec![12, 7]);
        assert_eq!(branch.sums(0, 0, 2).unwrap(), vec![7, 70]);
        branch.check().unwrap();
    }

    #[test]
    fn test_find_child() {
        let layout = layout();
        let node = filled(&layout);
        let branch = BranchNodeSo::new(&layout, &node).unwrap();
        assert_eq!(branch.find_child_by_rank(0, 0).unwrap(), Some((0, 0)));
        assert_eq!(branch.find_child_by_rank(0, 4).unwrap(), Some((1, 4)));
        assert_eq!(branch.find_child_by_rank(0, 11).unwrap(), Some((2, 7)));
        assert_eq!(branch.find_child_by_rank(0, 12).unwrap(), None);
        // stream 1 skips the empty third child
        assert_eq!(branch.find_child_by_rank(1, 6).unwrap(), Some((1, 2)));

        assert_eq!(branch.find_child_by_key(0, 0, 50).unwrap(), Some(1));
        assert_eq!(branch.find_child_by_key(0, 0, 91).unwrap(), None);
        assert!(branch.find_child_by_key(1, 0, 1).is_err());
    }

    #[test]
    fn test_set_child_and_update_entry() {
        let layout = layout();
        let mut node = filled(&layout);
        let mut branch = BranchNodeSo::new(&layout, &mut node).unwrap();
        branch.set_child(1, BlockId(99)).unwrap();
        branch.update_entry(1, &entry(&[1, 1, 0, 0, 0])).unwrap();
        assert_eq!(branch.child(1).unwrap(), BlockId(99));
        assert_eq!(branch.node_entry().unwrap().values(), &[10, 90, 2, 1, 1]);
        assert_eq!(branch.position_of(BlockId(99)).unwrap(), Some(1));
    }

    #[test]
    fn test_remove_children() {
        let layout = layout();
        let mut node = filled(&layout);
        let mut branch = BranchNodeSo::new(&layout, &mut node).unwrap();
        branch.remove_children(0, 2).unwrap();
        assert_eq!(branch.children().unwrap(), vec![BlockId(12)]);
        assert_eq!(branch.node_entry().unwrap().values(), &[5, 90, 0, 0, 0]);
    }

    #[test]
    fn test_split_and_merge() {
        let layout = layout();
        let mut left_node = filled(&layout);
        let mut right_node = branch_node(&layout, 2);
        let mut left = BranchNodeSo::new(&layout, &mut left_node).unwrap();
        let mut right = BranchNodeSo::new(&layout, &mut right_node).unwrap();

        assert!(left.split_to(&mut right, 1).unwrap().is_success());
        assert_eq!(left.children().unwrap(), vec![BlockId(10)]);
        assert_eq!(right.children().unwrap(), vec![BlockId(11), BlockId(12)]);
        assert_eq!(right.child_entry(0).unwrap().values(), &[3, 70, 5, 5, 0]);

        assert!(right.can_be_merged_with(&left).unwrap());
        assert!(right.merge_with(&mut left).unwrap().is_success());
        assert_eq!(
            left.children().unwrap(),
            vec![BlockId(10), BlockId(11), BlockId(12)]
        );
        assert_eq!(left.node().block_refs().unwrap().len(), 3);
    }
}
