//! Leaf node operations.
//!
//! A leaf hosts one substream per stream of its [`NodeLayout`]. Mutations
//! follow a prepare/commit protocol: `prepare_*` builds the complete new
//! state of every touched substream and checks it fits, leaving the node
//! untouched on failure; the returned [`PreparedMutation`] then commits
//! everything at once.

use std::collections::BTreeMap;
use std::ops::{Deref, DerefMut};

use tessera_common::{BlockId, BlockKind, Result, TesseraError};
use tessera_packed::{PackedDispatcher, PreparedMutation, SubstreamKind, UpdateStatus};

use crate::entry::{BranchNodeEntry, SlotKind};
use crate::events::{DataEventHandler, TextDumpHandler};
use crate::header::NodeBlock;
use crate::layout::NodeLayout;
use crate::ops;
use crate::store::{NodeStore, release_block};
use crate::symbols::{self, SymbolsEdit};

/// One entry position per stream.
pub type Position = Vec<usize>;

/// Rows to insert into one stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInsert {
    pub stream: usize,
    /// Entry before which the rows go.
    pub at: usize,
    /// Row-major values, one row per entry.
    pub rows: Vec<u64>,
}

impl StreamInsert {
    pub fn new(stream: usize, at: usize, rows: Vec<u64>) -> Self {
        Self { stream, at, rows }
    }
}

/// Leaf operations over a node borrowed or owned as `N`.
#[derive(Debug)]
pub struct LeafNodeSo<'l, N> {
    layout: &'l NodeLayout,
    node: N,
}

impl<'l, N: Deref<Target = NodeBlock>> LeafNodeSo<'l, N> {
    pub fn new(layout: &'l NodeLayout, node: N) -> Result<Self> {
        if node.kind() != BlockKind::Leaf {
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
        self.layout.leaf()
    }

    /// Entries of every stream.
    pub fn sizes(&self) -> Result<Position> {
        self.dispatcher().sizes(self.node.allocator())
    }

    pub fn size(&self, stream: usize) -> Result<usize> {
        self.dispatcher().size(self.node.allocator(), stream)
    }

    /// Entries of every stream, as counters.
    pub fn size_sums(&self) -> Result<Vec<u64>> {
        Ok(self.sizes()?.into_iter().map(|s| s as u64).collect())
    }

    /// Entries held by every stream of `group`.
    pub fn group_size(&self, group: usize) -> Result<usize> {
        let first = self.layout.group_members(group)?[0];
        self.size(first)
    }

    /// Group tags of the leaf's packed entries, when the layout has a
    /// symbols stream.
    pub fn symbols(&self) -> Result<Option<Vec<u64>>> {
        match self.layout.symbols() {
            Some(idx) => Ok(Some(
                self.dispatcher().data(self.node.allocator(), idx)?.symbols()?,
            )),
            None => Ok(None),
        }
    }

    /// Split position leaving entries `[0, at)` of `group` in this leaf.
    ///
    /// Without a symbols stream the other groups split in half. With one,
    /// every group splits where the symbols stream does.
    pub fn split_points(&self, group: usize, at: usize) -> Result<Position> {
        let members = self.layout.group_members(group)?;
        let sizes = self.sizes()?;
        let Some(order) = self.symbols()? else {
            return Ok(sizes
                .iter()
                .enumerate()
                .map(|(stream, &size)| {
                    if members.contains(&stream) {
                        at.min(size)
                    } else {
                        size / 2
                    }
                })
                .collect());
        };
        // An empty group has no place of its own; split the packed entries in half.
        let held = sizes[members[0]];
        let pos = if held == 0 {
            order.len() / 2
        } else {
            symbols::insert_position(&order, group, at.min(held))?
        };
        self.symbol_split(&order, pos)
    }

    /// Position of every stream at symbols position `pos`.
    fn symbol_split(&self, order: &[u64], pos: usize) -> Result<Position> {
        let ranks = symbols::ranks(order, self.layout.data_groups(), pos);
        (0..self.layout.streams())
            .map(|stream| {
                let group = self.layout.group_of(stream)?;
                Ok(ranks.get(group).copied().unwrap_or(pos))
            })
            .collect()
    }

    pub fn get(&self, stream: usize, idx: usize) -> Result<Vec<u64>> {
        self.dispatcher()
            .view(self.node.allocator(), stream)?
            .ok_or(TesseraError::IndexOutOfBounds { index: idx, size: 0 })?
            .row(idx)
    }

    /// Size and statistics of `stream` over `[start, end)`, in the slot
    /// order of the stream's branch entry.
    pub fn sums(&self, stream: usize, start: usize, end: usize) -> Result<Vec<u64>> {
        let width = self.layout.entry_layout().stream_range(stream)?.len();
        let mut out = vec![(end.saturating_sub(start)) as u64];
        match self.dispatcher().view(self.node.allocator(), stream)? {
            Some(view) => out.extend(view.stats(start, end)?),
            None if start == 0 && end == 0 => out.resize(width, 0),
            None => {
                return Err(TesseraError::RangeOutOfBounds {
                    start,
                    end,
                    size: 0,
                });
            }
        }
        Ok(out)
    }

    /// Adds the statistics of `stream` over `[start, end)` into `entry`.
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

    /// Folds the maximum slots of this leaf into `entry`.
    pub fn max(&self, entry: &mut BranchNodeEntry) -> Result<()> {
        let layout = self.layout.entry_layout();
        let mine = self.node_entry()?;
        let mut values = entry.values().to_vec();
        for (pos, slot) in layout.slots().iter().enumerate() {
            if *slot == SlotKind::Max {
                values[pos] = values[pos].max(mine.values()[pos]);
            }
        }
        *entry = BranchNodeEntry::from_values(values);
        Ok(())
    }

    /// The entry a parent branch keeps for this leaf.
    pub fn node_entry(&self) -> Result<BranchNodeEntry> {
        let layout = self.layout.entry_layout();
        let mut entry = BranchNodeEntry::zero(layout);
        for stream in 0..self.layout.streams() {
            let size = self.size(stream)?;
            self.sums_into(stream, 0, size, &mut entry)?;
        }
        Ok(entry)
    }

    /// First entry of `stream` whose value in `column` is at least `key`.
    ///
    /// Only fixed-size tree streams support key search.
    pub fn find_ge(&self, stream: usize, column: usize, key: u64) -> Result<Option<usize>> {
        let descriptor = self.dispatcher().descriptor(stream)?;
        if descriptor.kind != SubstreamKind::FseTree {
            return Err(TesseraError::SubstreamMismatch {
                index: stream,
                expected: SubstreamKind::FseTree.to_string(),
                actual: descriptor.kind.to_string(),
            });
        }
        match self.dispatcher().view(self.node.allocator(), stream)? {
            Some(view) => match view.as_fse_tree() {
                Some(tree) => tree.find_ge(column, key),
                None => Ok(None),
            },
            None => Ok(None),
        }
    }

    /// Whether appending this leaf to `other` fits `other`.
    pub fn can_be_merged_with<M: Deref<Target = NodeBlock>>(
        &self,
        other: &LeafNodeSo<'_, M>,
    ) -> Result<bool> {
        ops::can_merge(self.dispatcher(), self.node.allocator(), other.node.allocator())
    }

    /// Prepares appending every stream of this leaf to `other`.
    pub fn prepare_merge_with<'o, M: DerefMut<Target = NodeBlock>>(
        &self,
        other: &'o mut LeafNodeSo<'_, M>,
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

    /// Appends every stream of this leaf to `other`.
    pub fn merge_with<M: DerefMut<Target = NodeBlock>>(
        &self,
        other: &mut LeafNodeSo<'_, M>,
    ) -> Result<UpdateStatus> {
        ops::apply(self.prepare_merge_with(other))
    }

    /// Whether the leaf is filled below `threshold_percent` of its area.
    pub fn should_be_merged_with_siblings(&self, threshold_percent: u8) -> bool {
        ops::should_merge(self.node.allocator(), threshold_percent)
    }

    pub fn check(&self) -> Result<()> {
        if self.node.level() != 0 {
            return Err(TesseraError::PackedCorrupted(format!(
                "leaf {} has level {}",
                self.node.block_id(),
                self.node.level()
            )));
        }
        ops::check(self.dispatcher(), self.node.allocator())?;
        let Some(idx) = self.layout.symbols() else {
            return Ok(());
        };
        let data = self.dispatcher().data(self.node.allocator(), idx)?;
        let alphabet = 1usize << data.params().symbol_bits;
        let counts = symbols::counts(&data.symbols()?, alphabet);
        for (group, &count) in counts.iter().enumerate() {
            let size = if group < self.layout.data_groups() {
                self.group_size(group)?
            } else {
                0
            };
            if count != size {
                return Err(TesseraError::PackedCorrupted(format!(
                    "leaf {} tags {} entries of group {} holding {}",
                    self.node.block_id(),
                    count,
                    group,
                    size
                )));
            }
        }
        Ok(())
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

    /// Takes a reference on every block id held by the leaf.
    pub fn cow_ref_children<S: NodeStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        self.for_all_block_refs(&mut |id| store.ref_block(id))
    }

    /// Drops the references taken by [`cow_ref_children`](Self::cow_ref_children).
    pub fn cow_unref_children<S: NodeStore + ?Sized>(&self, store: &mut S) -> Result<()> {
        for id in self.node.block_refs()? {
            release_block(store, id)?;
        }
        Ok(())
    }
}

impl<'l, N: DerefMut<Target = NodeBlock>> LeafNodeSo<'l, N> {
    pub fn node_mut(&mut self) -> &mut NodeBlock {
        &mut self.node
    }

    /// Prepares inserting rows into one or more streams.
    ///
    /// Every group must keep equal sizes across its streams once all
    /// inserts are applied. The symbols stream follows the inserts into
    /// the first stream of each group and takes no inserts of its own.
    pub fn prepare_insert(&mut self, inserts: &[StreamInsert]) -> Result<PreparedMutation<'_>> {
        let layout = self.layout;
        let dispatcher = self.dispatcher();
        for insert in inserts {
            self.check_data_stream(insert.stream)?;
        }
        let mut symbols = self.symbols_edit()?;
        let alloc = self.node.allocator_mut();
        let mut edits = BTreeMap::new();
        for insert in inserts {
            if !edits.contains_key(&insert.stream) {
                edits.insert(insert.stream, dispatcher.data(alloc, insert.stream)?);
            }
            if let Some(data) = edits.get_mut(&insert.stream) {
                data.insert_rows(insert.at, &insert.rows)?;
            }
            if let Some((_, edit)) = &mut symbols {
                let group = layout.group_of(insert.stream)?;
                if layout.group_members(group)?[0] == insert.stream {
                    let width = dispatcher.descriptor(insert.stream)?.entry_width().max(1);
                    edit.insert(group, insert.at, insert.rows.len() / width)?;
                }
            }
        }
        if let Some((idx, edit)) = symbols {
            if let Some(data) = edit.into_data() {
                edits.insert(idx, data);
            }
        }
        ops::prepare_edits(dispatcher, alloc, edits)
    }

    pub fn insert(&mut self, inserts: &[StreamInsert]) -> Result<UpdateStatus> {
        ops::apply(self.prepare_insert(inserts))
    }

    /// Inserts the same number of entries into every stream of `group`.
    ///
    /// `values[k]` holds the rows for the k-th stream of the group.
    pub fn insert_group(
        &mut self,
        group: usize,
        at: usize,
        values: &[Vec<u64>],
    ) -> Result<UpdateStatus> {
        let members = self.layout.group_members(group)?;
        if values.len() != members.len() {
            return Err(TesseraError::InvalidParameter {
                name: "values".to_string(),
                value: format!("{} row sets for {} streams", values.len(), members.len()),
            });
        }
        let inserts: Vec<StreamInsert> = members
            .iter()
            .zip(values)
            .map(|(&stream, rows)| StreamInsert::new(stream, at, rows.clone()))
            .collect();
        self.insert(&inserts)
    }

    /// Prepares removing `[start[i], end[i])` from every stream `i`.
    ///
    /// The range of the symbols stream must be empty: its tags go with
    /// the entries removed from the first stream of each group.
    pub fn prepare_remove(&mut self, start: &[usize], end: &[usize]) -> Result<PreparedMutation<'_>> {
        let dispatcher = self.dispatcher();
        let mut edits = ops::remove_edits(dispatcher, self.node.allocator(), start, end)?;
        if let Some((idx, mut edit)) = self.symbols_edit()? {
            if start[idx] != end[idx] {
                return Err(TesseraError::InvalidParameter {
                    name: "range".to_string(),
                    value: format!("symbols stream {} is not removed from directly", idx),
                });
            }
            edits.remove(&idx);
            let ranges = (0..self.layout.data_groups())
                .map(|group| {
                    let first = self.layout.group_members(group)?[0];
                    Ok((group, start[first], end[first]))
                })
                .collect::<Result<Vec<_>>>()?;
            edit.remove(&ranges)?;
            if let Some(data) = edit.into_data() {
                edits.insert(idx, data);
            }
        }
        ops::prepare_edits(dispatcher, self.node.allocator_mut(), edits)
    }

    pub fn commit_remove(prepared: PreparedMutation<'_>) {
        prepared.commit();
    }

    pub fn remove(&mut self, start: &[usize], end: &[usize]) -> Result<UpdateStatus> {
        let prepared = self.prepare_remove(start, end);
        match prepared {
            Ok(prepared) => {
                Self::commit_remove(prepared);
                Ok(UpdateStatus::Success)
            }
            Err(err) if err.is_out_of_space() => Ok(UpdateStatus::Failure),
            Err(err) => Err(err),
        }
    }

    /// Removes entries `[start, end)` from every stream of `group`.
    pub fn remove_group(&mut self, group: usize, start: usize, end: usize) -> Result<UpdateStatus> {
        let (from, to) = self.group_range(group, start, end)?;
        self.remove(&from, &to)
    }

    fn group_range(&self, group: usize, start: usize, end: usize) -> Result<(Position, Position)> {
        let members = self.layout.group_members(group)?;
        let mut from = vec![0; self.layout.streams()];
        let mut to = vec![0; self.layout.streams()];
        for stream in members {
            from[stream] = start;
            to[stream] = end;
        }
        Ok((from, to))
    }

    /// Prepares replacing entry `idx` of `stream`.
    pub fn prepare_set(
        &mut self,
        stream: usize,
        idx: usize,
        row: &[u64],
    ) -> Result<PreparedMutation<'_>> {
        self.check_data_stream(stream)?;
        let dispatcher = self.dispatcher();
        let alloc = self.node.allocator_mut();
        let mut data = dispatcher.data(alloc, stream)?;
        data.set_row(idx, row)?;
        ops::prepare_edits(dispatcher, alloc, BTreeMap::from([(stream, data)]))
    }

    pub fn set(&mut self, stream: usize, idx: usize, row: &[u64]) -> Result<UpdateStatus> {
        ops::apply(self.prepare_set(stream, idx, row))
    }

    /// Moves entries `[from[i], size)` of every stream into `other`, in
    /// front of what `other` already holds.
    ///
    /// With a symbols stream, `from` must be the position of every stream
    /// at `from[symbols]`. Returns [`UpdateStatus::Failure`], changing
    /// neither leaf, when either side cannot hold its new content.
    pub fn split_to<M: DerefMut<Target = NodeBlock>>(
        &mut self,
        other: &mut LeafNodeSo<'_, M>,
        from: &[usize],
    ) -> Result<UpdateStatus> {
        if let (Some(idx), Some(order)) = (self.layout.symbols(), self.symbols()?) {
            ops::check_position(self.dispatcher(), from)?;
            let expected = self.symbol_split(&order, from[idx])?;
            if from != expected.as_slice() {
                return Err(TesseraError::InvalidParameter {
                    name: "split position".to_string(),
                    value: format!("{:?} does not match the symbols split {:?}", from, expected),
                });
            }
        }
        ops::split_streams(
            self.dispatcher(),
            self.node.allocator_mut(),
            other.node.allocator_mut(),
            from,
        )
    }

    fn symbols_edit(&self) -> Result<Option<(usize, SymbolsEdit)>> {
        match self.layout.symbols() {
            Some(idx) => {
                let data = self.dispatcher().data(self.node.allocator(), idx)?;
                Ok(Some((idx, SymbolsEdit::new(data)?)))
            }
            None => Ok(None),
        }
    }

    fn check_data_stream(&self, stream: usize) -> Result<()> {
        if self.layout.symbols() == Some(stream) {
            return Err(TesseraError::InvalidParameter {
                name: "stream".to_string(),
                value: format!("symbols stream {} is written through the data streams", stream),
            });
        }
        Ok(())
    }
}
