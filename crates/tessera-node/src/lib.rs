//! Packed B-tree nodes for tessera.
//!
//! This crate provides:
//! - `NodeBlock`: block header, node header and the packed allocator of a node
//! - `NodeLayout`: leaf stream groups, an optional symbols stream interleaving
//!   them, and the derived branch and entry layouts
//! - `LeafNodeSo` / `BranchNodeSo`: typed operations over a node's substreams
//!   with prepare/commit mutations
//! - `BranchNodeEntry`: per-child totals propagated from leaves to branches
//! - `NodeStore`: reference-counted node storage with copy-on-write helpers
//! - `BTree`: rank-addressed copy-on-write B-tree

pub mod branch;
pub mod entry;
pub mod events;
pub mod header;
pub mod layout;
pub mod leaf;
mod ops;
pub mod store;
mod symbols;
pub mod tree;

pub use branch::BranchNodeSo;
pub use entry::{BranchNodeEntry, EntryLayout, SlotKind};
pub use events::{DataEventHandler, TextDumpHandler};
pub use header::{NodeBlock, NodeHeader};
pub use layout::NodeLayout;
pub use leaf::{LeafNodeSo, Position, StreamInsert};
pub use store::{
    MemoryNodeStore, NodeSource, NodeStore, clone_node, create_node, prepare_for_update,
    release_block,
};
pub use tree::BTree;
