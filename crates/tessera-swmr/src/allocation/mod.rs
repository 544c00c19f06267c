//! Block allocation: the multi-level allocation map and the per-commit
//! allocation pool.

mod map;
mod pool;

pub use map::{Allocation, AllocationMap, AllocationStatus};
pub use pool::AllocationPool;
