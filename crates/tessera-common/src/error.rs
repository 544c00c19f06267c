//! Error types for tessera.

use thiserror::Error;

/// Result type alias using TesseraError.
pub type Result<T> = std::result::Result<T, TesseraError>;

/// Errors that can occur in tessera operations.
#[derive(Debug, Error)]
pub enum TesseraError {
    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O error: {0}")]
    IoError(String),

    // Capacity errors
    #[error("Out of space: requested {requested} bytes, {available} available")]
    OutOfSpace { requested: usize, available: usize },

    // Block errors
    #[error("Block not found: {block_id}")]
    BlockNotFound { block_id: u64 },

    #[error("Block corrupted: {block_id}, reason: {reason}")]
    BlockCorrupted { block_id: u64, reason: String },

    #[error("Block size mismatch: expected {expected}, got {actual}")]
    BlockSizeMismatch { expected: usize, actual: usize },

    #[error("Invalid block kind: {0}")]
    InvalidBlockKind(u8),

    // Structural contract errors
    #[error("Index out of bounds: {index} (size {size})")]
    IndexOutOfBounds { index: usize, size: usize },

    #[error("Range out of bounds: [{start}, {end}) (size {size})")]
    RangeOutOfBounds { start: usize, end: usize, size: usize },

    #[error("Unknown substream index: {0}")]
    InvalidSubstream(usize),

    #[error("Substream kind mismatch at {index}: expected {expected}, got {actual}")]
    SubstreamMismatch {
        index: usize,
        expected: String,
        actual: String,
    },

    #[error("Packed structure corrupted: {0}")]
    PackedCorrupted(String),

    #[error("Run contract violated: {0}")]
    RunContract(String),

    // Commit errors
    #[error("Commit {0} is already closed")]
    CommitClosed(u64),

    #[error("Block allocations are forbidden at this stage")]
    AllocationForbidden,

    #[error("Allocation failed: {0}")]
    AllocationFailed(String),

    #[error("Another writable commit is active")]
    WriterActive,

    #[error("Container not found: {0}")]
    ContainerNotFound(u64),

    #[error("Container already exists: {0}")]
    ContainerAlreadyExists(u64),

    #[error("Commit not found: {0}")]
    CommitNotFound(u64),

    #[error("Refcount mismatch for block {block_id}: expected {expected}, got {actual}")]
    RefcountMismatch {
        block_id: u64,
        expected: u64,
        actual: u64,
    },

    #[error("Superblock corrupted: {0}")]
    SuperblockCorrupted(String),

    // Tree errors
    #[error("Key not found")]
    KeyNotFound,

    #[error("Layout mismatch: expected {expected:#x}, got {actual:#x}")]
    LayoutMismatch { expected: u64, actual: u64 },

    // Configuration errors
    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Invalid parameter: {name} = {value}")]
    InvalidParameter { name: String, value: String },

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

impl TesseraError {
    /// Returns true for capacity failures that a caller may recover from
    /// by splitting or retrying with a smaller batch.
    pub fn is_out_of_space(&self) -> bool {
        matches!(self, TesseraError::OutOfSpace { .. })
    }
}
