//! Packed in-block data structures for tessera.
//!
//! This crate provides:
//! - `PackedAllocator`: resizable elements inside a single block
//! - Substreams: fixed and variable-length trees, VLE arrays, symbol
//!   sequences, SSRLE sequences and block id arrays
//! - `PackedDispatcher`: typed fan-out over a node's substream list
//! - `PreparedMutation`: prepare/commit updates that never partially apply

pub mod allocator;
pub mod dispatcher;
pub mod substream;
pub mod update;
pub mod varint;

pub use allocator::{
    ALLOCATOR_HEADER_SIZE, AllocationPlan, ElementUpdate, PACKED_ALIGNMENT, PackedAllocator,
    align_up,
};
pub use dispatcher::{PackedDispatcher, SubstreamContext, SubstreamDescriptor};
pub use substream::{
    BlockIdsView, ColumnData, FseTreeView, HoldsBlockReferences, IndexKind, SeqView,
    SsrleSeqData, SsrleSeqView, SubstreamData, SubstreamKind, SubstreamParams, SubstreamView,
    VleView,
};
pub use update::{PreparedMutation, UpdateStatus};
