//! Per-commit pool of free block runs.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::VecDeque;
use tessera_common::{PoolConfig, Result, TesseraError};

use super::map::Allocation;

/// Bounded queues of free runs, one per allocation level, plus a small
/// level-0 reserve used while the pool is being repopulated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AllocationPool {
    config: PoolConfig,
    queues: Vec<VecDeque<Allocation>>,
    reserved: Vec<Allocation>,
}

impl AllocationPool {
    pub fn new(config: PoolConfig) -> Self {
        Self {
            queues: vec![VecDeque::new(); config.levels],
            reserved: Vec::new(),
            config,
        }
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    fn capacity(&self, level: usize) -> usize {
        if level == 0 {
            self.config.level0_capacity
        } else {
            self.config.upper_capacity
        }
    }

    fn reserve_is_full(&self) -> bool {
        self.reserved.len() as u64 >= self.config.level0_reserved
    }

    /// Whether `add` would accept another run of `level`.
    pub fn has_room(&self, level: usize) -> bool {
        let Some(queue) = self.queues.get(level) else {
            return false;
        };
        (level == 0 && !self.reserve_is_full()) || queue.len() < self.capacity(level)
    }

    /// Returns a run to the pool. Level-0 runs refill the reserve first.
    /// Returns false when the pool has no room for it.
    pub fn add(&mut self, alloc: Allocation) -> bool {
        let level = alloc.level as usize;
        if level == 0 && !self.reserve_is_full() {
            self.reserved.push(alloc);
            return true;
        }
        if !self.has_room(level) {
            return false;
        }
        self.queues[level].push_back(alloc);
        true
    }

    /// Takes a run of `level`, splitting a larger run when the level's
    /// queue is empty. The reserve is never touched.
    pub fn allocate_one(&mut self, level: usize) -> Option<Allocation> {
        if let Some(alloc) = self.queues.get_mut(level)?.pop_front() {
            return Some(alloc);
        }
        let from = (level + 1..self.queues.len()).find(|&l| !self.queues[l].is_empty())?;
        let mut run = self.queues[from].pop_front()?;
        while run.level as usize > level {
            let (left, right) = run.halves()?;
            self.queues[right.level as usize].push_back(right);
            run = left;
        }
        Some(run)
    }

    /// Takes a level-0 block from the reserve.
    pub fn allocate_reserved(&mut self) -> Result<Allocation> {
        self.reserved.pop().ok_or_else(|| {
            TesseraError::AllocationFailed("Empty reserved allocation pool".to_string())
        })
    }

    /// Basic blocks held by the pool, reserve included.
    pub fn level0_total(&self) -> u64 {
        let queued: u64 = self
            .queues
            .iter()
            .flat_map(|queue| queue.iter())
            .map(Allocation::blocks)
            .sum();
        queued + self.reserved.len() as u64
    }

    /// Runs queued at `level`.
    pub fn len(&self, level: usize) -> usize {
        self.queues.get(level).map_or(0, VecDeque::len)
    }

    pub fn reserved(&self) -> usize {
        self.reserved.len()
    }

    pub fn is_empty(&self) -> bool {
        self.level0_total() == 0
    }

    /// Every run held by the pool.
    pub fn allocations(&self) -> impl Iterator<Item = &Allocation> {
        self.queues.iter().flatten().chain(self.reserved.iter())
    }

    pub fn store(&self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u32_le(self.queues.len() as u32);
        for queue in &self.queues {
            buf.put_u32_le(queue.len() as u32);
            for alloc in queue {
                buf.put_u64_le(alloc.position);
            }
        }
        buf.put_u32_le(self.reserved.len() as u32);
        for alloc in &self.reserved {
            buf.put_u64_le(alloc.position);
        }
        buf.to_vec()
    }

    pub fn load(mut data: &[u8], config: PoolConfig) -> Result<Self> {
        fn truncated() -> TesseraError {
            TesseraError::SuperblockCorrupted("allocation pool is truncated".to_string())
        }
        fn positions(data: &mut &[u8]) -> Result<Vec<u64>> {
            if data.remaining() < 4 {
                return Err(truncated());
            }
            let count = data.get_u32_le() as usize;
            if data.remaining() < count * 8 {
                return Err(truncated());
            }
            Ok((0..count).map(|_| data.get_u64_le()).collect())
        }

        if data.remaining() < 4 {
            return Err(truncated());
        }
        let levels = data.get_u32_le() as usize;
        if levels != config.levels {
            return Err(TesseraError::SuperblockCorrupted(format!(
                "allocation pool has {} levels, configured {}",
                levels, config.levels
            )));
        }
        let mut pool = Self::new(config);
        for level in 0..levels {
            pool.queues[level] = positions(&mut data)?
                .into_iter()
                .map(|pos| Allocation::new(pos, level as u8))
                .collect();
        }
        pool.reserved = positions(&mut data)?
            .into_iter()
            .map(|pos| Allocation::new(pos, 0))
            .collect();
        if data.has_remaining() {
            return Err(TesseraError::SuperblockCorrupted(
                "trailing bytes after allocation pool".to_string(),
            ));
        }
        Ok(pool)
    }
}
