//! Configuration structures for tessera.

use crate::block::{ALLOCATION_LEVELS, BASIC_BLOCK_SIZE};
use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Configuration of the per-commit allocation pool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolConfig {
    /// Number of allocation levels (level k allocates 2^k basic blocks).
    pub levels: usize,
    /// Maximum number of runs queued at level 0.
    pub level0_capacity: usize,
    /// Maximum number of runs queued at every level above 0.
    pub upper_capacity: usize,
    /// Level-0 blocks held back for allocations made while the pool
    /// is being repopulated.
    pub level0_reserved: u64,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            levels: ALLOCATION_LEVELS,
            level0_capacity: 64,
            upper_capacity: 4,
            level0_reserved: 32,
        }
    }
}

/// Storage configuration for a SWMR store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Directory for the store file.
    pub data_dir: PathBuf,
    /// Name of the store file inside `data_dir`.
    pub file_name: String,
    /// Size of a level-0 block in bytes.
    pub basic_block_size: usize,
    /// Size of a B-tree node block in bytes.
    pub node_block_size: usize,
    /// Arena size in basic blocks when a store is created.
    pub initial_arena_blocks: u64,
    /// Number of basic blocks added when the arena grows.
    pub arena_growth_blocks: u64,
    /// Upper bound for the arena size in basic blocks.
    pub max_arena_blocks: u64,
    /// Size of each of the two metadata slots in bytes.
    pub metadata_slot_size: usize,
    /// Allocation pool geometry.
    pub pool: PoolConfig,
    /// Enable fsync on consistency points.
    pub fsync_enabled: bool,
    /// Attempts to repopulate the allocation pool before failing.
    pub populate_retries: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            file_name: "tessera.store".to_string(),
            basic_block_size: BASIC_BLOCK_SIZE,
            node_block_size: BASIC_BLOCK_SIZE,
            initial_arena_blocks: 4096, // 16 MB with 4 KB blocks
            arena_growth_blocks: 4096,
            max_arena_blocks: 1 << 22, // 16 GB
            metadata_slot_size: 4 * 1024 * 1024,
            pool: PoolConfig::default(),
            fsync_enabled: true,
            populate_retries: 10,
        }
    }
}

impl StoreConfig {
    /// Returns the allocation level used for node blocks.
    pub fn node_level(&self) -> usize {
        (self.node_block_size / self.basic_block_size).trailing_zeros() as usize
    }

    /// Returns the full path of the store file.
    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join(&self.file_name)
    }

    /// Returns the node configuration implied by this store configuration.
    pub fn node_config(&self) -> NodeConfig {
        NodeConfig {
            block_size: self.node_block_size,
            ..NodeConfig::default()
        }
    }

    /// Checks the configuration for values the store cannot work with.
    pub fn validate(&self) -> Result<()> {
        if !self.basic_block_size.is_power_of_two() {
            return Err(TesseraError::ConfigError(
                "basic block size must be a power of two".to_string(),
            ));
        }
        if !self.node_block_size.is_power_of_two() || self.node_block_size < self.basic_block_size
        {
            return Err(TesseraError::ConfigError(
                "node block size must be a power of two not smaller than the basic block"
                    .to_string(),
            ));
        }
        if self.node_level() >= self.pool.levels {
            return Err(TesseraError::InvalidParameter {
                name: "node_block_size".to_string(),
                value: self.node_block_size.to_string(),
            });
        }
        if self.populate_retries == 0 {
            return Err(TesseraError::InvalidParameter {
                name: "populate_retries".to_string(),
                value: "0".to_string(),
            });
        }
        let top_run = 1u64 << (self.pool.levels - 1);
        if self.initial_arena_blocks < top_run || self.initial_arena_blocks % top_run != 0 {
            return Err(TesseraError::InvalidParameter {
                name: "initial_arena_blocks".to_string(),
                value: self.initial_arena_blocks.to_string(),
            });
        }
        if self.arena_growth_blocks % top_run != 0 {
            return Err(TesseraError::InvalidParameter {
                name: "arena_growth_blocks".to_string(),
                value: self.arena_growth_blocks.to_string(),
            });
        }
        if self.max_arena_blocks < self.initial_arena_blocks {
            return Err(TesseraError::ConfigError(
                "max arena size is smaller than the initial arena".to_string(),
            ));
        }
        Ok(())
    }
}

/// Node geometry for packed B-tree nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Size of a node block in bytes.
    pub block_size: usize,
    /// Fill percentage under which a node asks to be merged with a sibling.
    pub merge_threshold_percent: u8,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            block_size: BASIC_BLOCK_SIZE,
            merge_threshold_percent: 50,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_config_defaults() {
        let config = PoolConfig::default();
        assert_eq!(config.levels, 9);
        assert_eq!(config.level0_capacity, 64);
        assert_eq!(config.upper_capacity, 4);
        assert_eq!(config.level0_reserved, 32);
    }

    #[test]
    fn test_store_config_defaults() {
        let config = StoreConfig::default();
        assert_eq!(config.data_dir, PathBuf::from("./data"));
        assert_eq!(config.basic_block_size, 4096);
        assert_eq!(config.node_block_size, 4096);
        assert_eq!(config.node_level(), 0);
        assert_eq!(config.populate_retries, 10);
        assert!(config.fsync_enabled);
        assert!(config.validate().is_ok());
        assert_eq!(
            config.store_path(),
            PathBuf::from("./data").join("tessera.store")
        );
    }

    #[test]
    fn test_node_level_for_larger_nodes() {
        let config = StoreConfig {
            node_block_size: 16 * 1024,
            ..Default::default()
        };
        assert_eq!(config.node_level(), 2);
        assert_eq!(config.node_config().block_size, 16 * 1024);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_block_sizes() {
        let config = StoreConfig {
            basic_block_size: 3000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TesseraError::ConfigError(_))
        ));

        let config = StoreConfig {
            node_block_size: 1024,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TesseraError::ConfigError(_))
        ));
    }

    #[test]
    fn test_validate_rejects_zero_retries() {
        let config = StoreConfig {
            populate_retries: 0,
            ..Default::default()
        };
        let err = config.validate().unwrap_err();
        assert_eq!(err.to_string(), "Invalid parameter: populate_retries = 0");
    }

    #[test]
    fn test_validate_rejects_unaligned_arena() {
        let config = StoreConfig {
            initial_arena_blocks: 1000,
            ..Default::default()
        };
        assert!(matches!(
            config.validate(),
            Err(TesseraError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_store_config_serde_roundtrip() {
        let original = StoreConfig::default();
        let serialized = serde_json::to_string(&original).unwrap();
        let deserialized: StoreConfig = serde_json::from_str(&serialized).unwrap();

        assert_eq!(original.data_dir, deserialized.data_dir);
        assert_eq!(original.node_block_size, deserialized.node_block_size);
        assert_eq!(original.initial_arena_blocks, deserialized.initial_arena_blocks);
        assert_eq!(original.pool, deserialized.pool);
    }

    #[test]
    fn test_node_config_defaults() {
        let config = NodeConfig::default();
        assert_eq!(config.block_size, 4096);
        assert_eq!(config.merge_threshold_percent, 50);

        let serialized = serde_json::to_string(&config).unwrap();
        let deserialized: NodeConfig = serde_json::from_str(&serialized).unwrap();
        assert_eq!(config, deserialized);
    }
}
