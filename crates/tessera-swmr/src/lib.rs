//! Copy-on-write multi-version store for tessera.
//!
//! This crate provides:
//! - `BlockStore`: the block arena and the two metadata slots, in memory or
//!   in a file
//! - `AllocationMap` / `AllocationPool`: multi-level allocation bitmap and
//!   the per-commit pool of free runs
//! - `RefCounters`: persisted block reference counts with a per-commit
//!   overlay
//! - `Superblock` / `CommitMetadata`: the metadata slot codec
//! - `WritableCommit`: the single writer, with prepare/commit/rollback
//! - `ReadOnlySnapshot`: readers of retained commits
//! - `SwmrStore`: creation, recovery, and the commit registry

pub mod allocation;
pub mod block_store;
mod commit;
mod commit_store;
mod container;
pub mod counters;
mod descriptor;
mod directory;
mod history;
mod snapshot;
mod store;
pub mod superblock;

pub use allocation::{Allocation, AllocationMap, AllocationPool, AllocationStatus};
pub use block_store::{BlockStore, FileBlockStore, MemoryBlockStore};
pub use commit::{ConsistencyPoint, WritableCommit};
pub use commit_store::{AllocatorMode, CommitState, CommitStore};
pub use container::{Container, ContainerMut};
pub use counters::{CounterOverlay, RefCounters};
pub use descriptor::{CommitDescriptor, CommitInfo, ReaderGuard};
pub use snapshot::ReadOnlySnapshot;
pub use store::SwmrStore;
pub use superblock::{CommitMetadata, Superblock, SuperblockStatus};
