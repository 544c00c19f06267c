//! Typed dispatch over the substreams of an allocator.
//!
//! A [`PackedDispatcher`] is the compile-time description of a node's
//! substream list: one [`SubstreamDescriptor`] per allocator element,
//! starting at a fixed allocator index. Dispatch resolves an element to
//! its typed view and hands it to a closure together with a
//! [`SubstreamContext`].

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tessera_common::{Result, TesseraError};
use tracing::trace;

use crate::allocator::{ElementUpdate, PackedAllocator};
use crate::substream::{SubstreamData, SubstreamKind, SubstreamParams, SubstreamView};
use crate::update::PreparedMutation;

/// Static description of one substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubstreamDescriptor {
    pub kind: SubstreamKind,
    /// Substreams of one group always hold the same number of entries.
    pub group: usize,
    pub params: SubstreamParams,
}

impl SubstreamDescriptor {
    pub fn new(kind: SubstreamKind, group: usize, params: SubstreamParams) -> Self {
        Self {
            kind,
            group,
            params,
        }
    }

    pub fn fse_tree(group: usize, columns: usize) -> Self {
        Self::new(SubstreamKind::FseTree, group, SubstreamParams::columns(columns))
    }

    pub fn vle_tree(group: usize, columns: usize) -> Self {
        Self::new(SubstreamKind::VleTree, group, SubstreamParams::columns(columns))
    }

    pub fn vle_array(group: usize, columns: usize) -> Self {
        Self::new(SubstreamKind::VleArray, group, SubstreamParams::columns(columns))
    }

    pub fn seq(group: usize, symbol_bits: usize) -> Self {
        Self::new(SubstreamKind::Seq, group, SubstreamParams::symbols(symbol_bits))
    }

    pub fn ssrle_seq(group: usize, symbol_bits: usize) -> Self {
        Self::new(
            SubstreamKind::SsrleSeq,
            group,
            SubstreamParams::symbols(symbol_bits),
        )
    }

    pub fn block_ids(group: usize) -> Self {
        Self::new(SubstreamKind::BlockIds, group, SubstreamParams::default())
    }

    /// Values per entry.
    pub fn entry_width(&self) -> usize {
        self.params.entry_width(self.kind)
    }

    /// Statistics published per entry range.
    pub fn stat_width(&self) -> usize {
        self.params.stat_width(self.kind)
    }

    /// An empty owned model of this substream.
    pub fn empty_data(&self) -> Result<SubstreamData> {
        SubstreamData::empty(self.kind, self.params)
    }
}

/// Position of a substream, passed to dispatch closures.
#[derive(Debug, Clone, Copy)]
pub struct SubstreamContext<'a> {
    /// Index in the substream list.
    pub list_index: usize,
    /// Index of the backing allocator element.
    pub allocator_index: usize,
    pub descriptor: &'a SubstreamDescriptor,
}

impl SubstreamContext<'_> {
    pub fn group(&self) -> usize {
        self.descriptor.group
    }

    pub fn kind(&self) -> SubstreamKind {
        self.descriptor.kind
    }
}

/// Ordered list of substream descriptors mapped onto allocator elements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PackedDispatcher {
    descriptors: Vec<SubstreamDescriptor>,
    start: usize,
}

impl PackedDispatcher {
    /// Maps `descriptors` onto allocator elements `start..`.
    pub fn new(descriptors: Vec<SubstreamDescriptor>, start: usize) -> Result<Self> {
        for d in &descriptors {
            d.params.check(d.kind)?;
        }
        Ok(Self { descriptors, start })
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    pub fn descriptors(&self) -> &[SubstreamDescriptor] {
        &self.descriptors
    }

    pub fn descriptor(&self, idx: usize) -> Result<&SubstreamDescriptor> {
        self.descriptors
            .get(idx)
            .ok_or(TesseraError::InvalidSubstream(idx))
    }

    /// First allocator element used by substreams.
    pub fn start(&self) -> usize {
        self.start
    }

    /// Allocator elements needed to host every substream.
    pub fn allocator_elements(&self) -> usize {
        self.start + self.descriptors.len()
    }

    /// Number of groups (highest group id plus one).
    pub fn groups(&self) -> usize {
        self.descriptors
            .iter()
            .map(|d| d.group + 1)
            .max()
            .unwrap_or(0)
    }

    /// List indexes of the substreams of `group`.
    pub fn group_members(&self, group: usize) -> impl Iterator<Item = usize> + '_ {
        self.descriptors
            .iter()
            .enumerate()
            .filter(move |(_, d)| d.group == group)
            .map(|(idx, _)| idx)
    }

    pub fn context(&self, idx: usize) -> Result<SubstreamContext<'_>> {
        Ok(SubstreamContext {
            list_index: idx,
            allocator_index: self.start + idx,
            descriptor: self.descriptor(idx)?,
        })
    }

    /// Typed view of substream `idx`, `None` if its element is empty.
    ///
    /// An element tagged with a different kind than its descriptor is an
    /// error.
    pub fn view<'a>(
        &self,
        alloc: &'a PackedAllocator,
        idx: usize,
    ) -> Result<Option<SubstreamView<'a>>> {
        let ctx = self.context(idx)?;
        if alloc.is_empty(ctx.allocator_index)? {
            return Ok(None);
        }
        let tag = alloc.element_kind(ctx.allocator_index)?;
        if tag != ctx.kind().as_u8() {
            let actual = SubstreamKind::try_from(tag)
                .map(|k| k.to_string())
                .unwrap_or_else(|_| format!("tag {}", tag));
            return Err(TesseraError::SubstreamMismatch {
                index: idx,
                expected: ctx.kind().to_string(),
                actual,
            });
        }
        let bytes = alloc.element(ctx.allocator_index)?;
        SubstreamView::parse(ctx.kind(), bytes).map(Some)
    }

    /// Number of entries in substream `idx` (0 when empty).
    pub fn size(&self, alloc: &PackedAllocator, idx: usize) -> Result<usize> {
        Ok(self.view(alloc, idx)?.map_or(0, |v| v.size()))
    }

    /// Owned model of substream `idx`; an empty model if the element is empty.
    pub fn data(&self, alloc: &PackedAllocator, idx: usize) -> Result<SubstreamData> {
        let descriptor = self.descriptor(idx)?;
        match self.view(alloc, idx)? {
            Some(view) => view.to_data(descriptor.params),
            None => descriptor.empty_data(),
        }
    }

    /// Resolves substream `idx` and runs `f` on it.
    pub fn dispatch<'a, R>(
        &'a self,
        alloc: &'a PackedAllocator,
        idx: usize,
        f: impl FnOnce(&SubstreamContext<'a>, Option<SubstreamView<'a>>) -> Result<R>,
    ) -> Result<R> {
        let ctx = self.context(idx)?;
        let view = self.view(alloc, idx)?;
        f(&ctx, view)
    }

    /// Runs `f` on the raw element of substream `idx` for in-place edits.
    pub fn dispatch_mut<R>(
        &self,
        alloc: &mut PackedAllocator,
        idx: usize,
        f: impl FnOnce(&SubstreamContext<'_>, &mut [u8]) -> Result<R>,
    ) -> Result<R> {
        let ctx = self.context(idx)?;
        // validates the kind tag and the encoding before handing out bytes
        self.view(alloc, idx)?;
        f(&ctx, alloc.element_mut(ctx.allocator_index)?)
    }

    /// Runs `f` on every substream in order, collecting the results.
    pub fn dispatch_all<'a, R>(
        &'a self,
        alloc: &'a PackedAllocator,
        mut f: impl FnMut(&SubstreamContext<'a>, Option<SubstreamView<'a>>) -> Result<R>,
    ) -> Result<Vec<R>> {
        (0..self.len())
            .map(|idx| {
                let ctx = self.context(idx)?;
                f(&ctx, self.view(alloc, idx)?)
            })
            .collect()
    }

    /// Runs `f` on every substream in order.
    pub fn for_all<'a>(
        &'a self,
        alloc: &'a PackedAllocator,
        mut f: impl FnMut(&SubstreamContext<'a>, Option<SubstreamView<'a>>) -> Result<()>,
    ) -> Result<()> {
        for idx in 0..self.len() {
            let ctx = self.context(idx)?;
            f(&ctx, self.view(alloc, idx)?)?;
        }
        Ok(())
    }

    /// Runs `f` on every non-empty substream.
    pub fn dispatch_not_empty<'a, R>(
        &'a self,
        alloc: &'a PackedAllocator,
        mut f: impl FnMut(&SubstreamContext<'a>, SubstreamView<'a>) -> Result<R>,
    ) -> Result<Vec<R>> {
        let mut out = Vec::new();
        for idx in 0..self.len() {
            if let Some(view) = self.view(alloc, idx)? {
                out.push(f(&self.context(idx)?, view)?);
            }
        }
        Ok(out)
    }

    /// Runs `f` on the substreams of `group`.
    pub fn dispatch_group<'a, R>(
        &'a self,
        alloc: &'a PackedAllocator,
        group: usize,
        mut f: impl FnMut(&SubstreamContext<'a>, Option<SubstreamView<'a>>) -> Result<R>,
    ) -> Result<Vec<R>> {
        self.group_members(group)
            .map(|idx| {
                let ctx = self.context(idx)?;
                f(&ctx, self.view(alloc, idx)?)
            })
            .collect()
    }

    /// Allocates substream `idx` as an encoded empty instance.
    pub fn allocate_empty(&self, alloc: &mut PackedAllocator, idx: usize) -> Result<()> {
        let ctx = self.context(idx)?;
        let bytes = ctx.descriptor.empty_data()?.encode()?;
        trace!(
            substream = idx,
            kind = %ctx.kind(),
            bytes = bytes.len(),
            "allocating empty substream"
        );
        alloc.allocate(ctx.allocator_index, bytes.len(), ctx.kind().as_u8())?;
        alloc.element_mut(ctx.allocator_index)?[..bytes.len()].copy_from_slice(&bytes);
        Ok(())
    }

    /// Entries of every substream.
    pub fn sizes(&self, alloc: &PackedAllocator) -> Result<Vec<usize>> {
        (0..self.len()).map(|idx| self.size(alloc, idx)).collect()
    }

    /// Fails unless all substreams of a group hold the same number of
    /// entries in `sizes`.
    pub fn check_group_sizes(&self, sizes: &[usize]) -> Result<()> {
        for group in 0..self.groups() {
            let mut members = self.group_members(group);
            let Some(first) = members.next() else {
                continue;
            };
            if let Some(bad) = members.find(|&idx| sizes[idx] != sizes[first]) {
                return Err(TesseraError::InvalidParameter {
                    name: "group size".to_string(),
                    value: format!(
                        "substream {} has {} entries, substream {} has {}",
                        bad, sizes[bad], first, sizes[first]
                    ),
                });
            }
        }
        Ok(())
    }

    /// Validates storing every `edits` entry as the content of its
    /// substream, without modifying `alloc`.
    ///
    /// Groups must keep equal sizes once the edits apply. Fails with
    /// `OutOfSpace` when the result would not fit the allocator.
    pub fn prepare<'a>(
        &self,
        alloc: &'a mut PackedAllocator,
        edits: &BTreeMap<usize, SubstreamData>,
    ) -> Result<PreparedMutation<'a>> {
        let mut sizes = self.sizes(alloc)?;
        let mut updates = Vec::with_capacity(edits.len());
        for (&idx, data) in edits {
            updates.push(self.update_for(idx, data)?);
            sizes[idx] = data.size();
        }
        self.check_group_sizes(&sizes)?;
        PreparedMutation::prepare(alloc, updates)
    }

    /// Builds the allocator update that stores `data` as substream `idx`.
    ///
    /// Empty data frees the element, keeping empty substreams absent.
    pub fn update_for(&self, idx: usize, data: &SubstreamData) -> Result<ElementUpdate> {
        let ctx = self.context(idx)?;
        if data.kind() != ctx.kind() {
            return Err(TesseraError::SubstreamMismatch {
                index: idx,
                expected: ctx.kind().to_string(),
                actual: data.kind().to_string(),
            });
        }
        if data.is_empty() {
            return Ok(ElementUpdate::free(ctx.allocator_index));
        }
        Ok(ElementUpdate::replace(
            ctx.allocator_index,
            data.encode()?,
            ctx.kind().as_u8(),
        ))
    }
}
