//! tessera common types, errors, and configuration.
//!
//! This crate provides shared definitions used across all tessera components:
//! - The error taxonomy and `Result` alias
//! - Store, pool, and node configuration
//! - Block, container, and commit identifiers and the arena block header

pub mod block;
pub mod config;
pub mod error;

pub use block::{
    ALLOCATION_LEVELS, ALLOCATION_SIZE, BASIC_BLOCK_SIZE, BlockHeader, BlockId, BlockKind,
    CommitId, ContainerId, level_for_size,
};
pub use config::{NodeConfig, PoolConfig, StoreConfig};
pub use error::{Result, TesseraError};
