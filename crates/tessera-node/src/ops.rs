//! Substream-wise operations shared by leaf and branch nodes.

use std::collections::BTreeMap;

use tessera_common::{Result, TesseraError};
use tessera_packed::{
    PackedAllocator, PackedDispatcher, PreparedMutation, SubstreamData, UpdateStatus, align_up,
};

use crate::events::DataEventHandler;
use crate::header::NodeBlock;

/// Prepares replacing the substreams in `edits` with their new content.
pub(crate) fn prepare_edits<'a>(
    dispatcher: &PackedDispatcher,
    alloc: &'a mut PackedAllocator,
    edits: BTreeMap<usize, SubstreamData>,
) -> Result<PreparedMutation<'a>> {
    dispatcher.prepare(alloc, &edits)
}

/// Commits a prepared mutation, turning a capacity failure into
/// [`UpdateStatus::Failure`].
pub(crate) fn apply(prepared: Result<PreparedMutation<'_>>) -> Result<UpdateStatus> {
    match prepared {
        Ok(prepared) => {
            prepared.commit();
            Ok(UpdateStatus::Success)
        }
        Err(err) if err.is_out_of_space() => Ok(UpdateStatus::Failure),
        Err(err) => Err(err),
    }
}

/// Per-substream removal of `[start[i], end[i])`.
pub(crate) fn remove_edits(
    dispatcher: &PackedDispatcher,
    alloc: &PackedAllocator,
    start: &[usize],
    end: &[usize],
) -> Result<BTreeMap<usize, SubstreamData>> {
    check_position(dispatcher, start)?;
    check_position(dispatcher, end)?;
    let mut edits = BTreeMap::new();
    for idx in 0..dispatcher.len() {
        if start[idx] == end[idx] {
            continue;
        }
        let mut data = dispatcher.data(alloc, idx)?;
        data.remove(start[idx], end[idx])?;
        edits.insert(idx, data);
    }
    Ok(edits)
}

pub(crate) fn check_position(dispatcher: &PackedDispatcher, pos: &[usize]) -> Result<()> {
    if pos.len() != dispatcher.len() {
        return Err(TesseraError::InvalidParameter {
            name: "position".to_string(),
            value: format!("{} values for {} substreams", pos.len(), dispatcher.len()),
        });
    }
    Ok(())
}

/// Moves the tail `[from[i], size)` of every substream of `src` to the
/// front of the matching substream of `dst`. Neither side changes when
/// either cannot hold its new content.
pub(crate) fn split_streams(
    dispatcher: &PackedDispatcher,
    src: &mut PackedAllocator,
    dst: &mut PackedAllocator,
    from: &[usize],
) -> Result<UpdateStatus> {
    check_position(dispatcher, from)?;
    let mut src_edits = BTreeMap::new();
    let mut dst_edits = BTreeMap::new();
    for (idx, &at) in from.iter().enumerate() {
        let mut head = dispatcher.data(src, idx)?;
        if at == head.size() {
            continue;
        }
        let mut tail = head.split_off(at)?;
        tail.append(dispatcher.data(dst, idx)?)?;
        src_edits.insert(idx, head);
        dst_edits.insert(idx, tail);
    }
    let dst_prepared = match prepare_edits(dispatcher, dst, dst_edits) {
        Ok(prepared) => prepared,
        Err(err) if err.is_out_of_space() => return Ok(UpdateStatus::Failure),
        Err(err) => return Err(err),
    };
    let src_prepared = match prepare_edits(dispatcher, src, src_edits) {
        Ok(prepared) => prepared,
        Err(err) if err.is_out_of_space() => return Ok(UpdateStatus::Failure),
        Err(err) => return Err(err),
    };
    dst_prepared.commit();
    src_prepared.commit();
    Ok(UpdateStatus::Success)
}

/// Content of `dst` with `src` appended, per substream.
fn merged(
    dispatcher: &PackedDispatcher,
    src: &PackedAllocator,
    dst: &PackedAllocator,
) -> Result<BTreeMap<usize, SubstreamData>> {
    let mut edits = BTreeMap::new();
    for idx in 0..dispatcher.len() {
        let tail = dispatcher.data(src, idx)?;
        if tail.is_empty() {
            continue;
        }
        let mut data = dispatcher.data(dst, idx)?;
        data.append(tail)?;
        edits.insert(idx, data);
    }
    Ok(edits)
}

/// Whether appending `src` to `dst` fits `dst`'s client area.
pub(crate) fn can_merge(
    dispatcher: &PackedDispatcher,
    src: &PackedAllocator,
    dst: &PackedAllocator,
) -> Result<bool> {
    let edits = merged(dispatcher, src, dst)?;
    let mut total = 0usize;
    for idx in 0..dispatcher.len() {
        total += match edits.get(&idx) {
            Some(data) if data.is_empty() => 0,
            Some(data) => align_up(data.encode()?.len()),
            None => dst.element_size(dispatcher.context(idx)?.allocator_index)?,
        };
    }
    Ok(total <= dst.client_area())
}

pub(crate) fn prepare_merge<'a>(
    dispatcher: &PackedDispatcher,
    src: &PackedAllocator,
    dst: &'a mut PackedAllocator,
) -> Result<PreparedMutation<'a>> {
    let edits = merged(dispatcher, src, dst)?;
    prepare_edits(dispatcher, dst, edits)
}

pub(crate) fn should_merge(alloc: &PackedAllocator, threshold_percent: u8) -> bool {
    alloc.data_end() < alloc.client_area() * threshold_percent as usize / 100
}

/// Parses every substream and checks the group invariant.
pub(crate) fn check(dispatcher: &PackedDispatcher, alloc: &PackedAllocator) -> Result<()> {
    alloc.check()?;
    if alloc.elements() != dispatcher.allocator_elements() {
        return Err(TesseraError::PackedCorrupted(format!(
            "node has {} elements, layout needs {}",
            alloc.elements(),
            dispatcher.allocator_elements()
        )));
    }
    let sizes = dispatcher.sizes(alloc)?;
    dispatcher.check_group_sizes(&sizes)
}

pub(crate) fn generate_events(
    dispatcher: &PackedDispatcher,
    node: &NodeBlock,
    handler: &mut dyn DataEventHandler,
) -> Result<()> {
    let alloc = node.allocator();
    handler.start_node(node.block_id(), node.kind(), node.level())?;
    handler.value("allocated", alloc.allocated() as u64)?;
    handler.value("free_space", alloc.free_space() as u64)?;
    dispatcher.for_all(alloc, |ctx, view| {
        let size = view.map_or(0, |v| v.size());
        handler.start_substream(ctx.list_index, ctx.kind(), size)?;
        if let Some(view) = view {
            for idx in 0..size {
                handler.entry(idx, &view.row(idx)?)?;
            }
        }
        handler.end_substream()
    })?;
    handler.end_node()
}
