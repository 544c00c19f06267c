//! Multi-level allocation bitmap.
//!
//! Level k holds one bit per run of 2^k basic blocks; a bit is set when any
//! level-0 block of its run is allocated, so a clear level-k bit names a
//! fully free run. Bits live in fixed-size chunks shared between commit
//! versions and copied on first write.

use bytes::{Buf, BufMut, BytesMut};
use std::sync::Arc;
use tessera_common::{BlockId, Result, TesseraError};

use super::pool::AllocationPool;

const CHUNK_WORDS: usize = 64;
const CHUNK_BITS: u64 = (CHUNK_WORDS * 64) as u64;

type Chunk = [u64; CHUNK_WORDS];

/// Allocation state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationStatus {
    Free,
    Allocated,
}

/// A run of 2^level basic blocks starting at a level-0 position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Allocation {
    pub position: u64,
    pub level: u8,
}

impl Allocation {
    pub fn new(position: u64, level: u8) -> Self {
        Self { position, level }
    }

    /// Run addressed by a block id.
    pub fn of_block(id: BlockId, level: usize) -> Self {
        Self::new(id.as_u64(), level as u8)
    }

    /// Number of basic blocks in the run.
    pub fn blocks(&self) -> u64 {
        1 << self.level
    }

    pub fn end(&self) -> u64 {
        self.position + self.blocks()
    }

    pub fn block_id(&self) -> BlockId {
        BlockId(self.position)
    }

    /// Splits the run into its two halves.
    pub fn halves(&self) -> Option<(Allocation, Allocation)> {
        let level = self.level.checked_sub(1)?;
        let half = 1u64 << level;
        Some((
            Allocation::new(self.position, level),
            Allocation::new(self.position + half, level),
        ))
    }
}

#[derive(Debug, Clone)]
struct Bitmap {
    bits: u64,
    chunks: Vec<Arc<Chunk>>,
}

impl Bitmap {
    fn new(bits: u64) -> Self {
        let mut map = Self {
            bits: 0,
            chunks: Vec::new(),
        };
        map.resize(bits);
        map
    }

    fn resize(&mut self, bits: u64) {
        let chunks = bits.div_ceil(CHUNK_BITS) as usize;
        while self.chunks.len() < chunks {
            self.chunks.push(Arc::new([0; CHUNK_WORDS]));
        }
        self.bits = self.bits.max(bits);
    }

    fn locate(idx: u64) -> (usize, usize, u64) {
        let chunk = (idx / CHUNK_BITS) as usize;
        let bit = idx % CHUNK_BITS;
        (chunk, (bit / 64) as usize, 1u64 << (bit % 64))
    }

    fn get(&self, idx: u64) -> bool {
        let (chunk, word, mask) = Self::locate(idx);
        self.chunks[chunk][word] & mask != 0
    }

    fn set(&mut self, idx: u64, value: bool) {
        let (chunk, word, mask) = Self::locate(idx);
        if self.get(idx) == value {
            return;
        }
        let words = Arc::make_mut(&mut self.chunks[chunk]);
        if value {
            words[word] |= mask;
        } else {
            words[word] &= !mask;
        }
    }

    fn touch(&mut self, idx: u64) {
        let chunk = (idx / CHUNK_BITS) as usize;
        Arc::make_mut(&mut self.chunks[chunk]);
    }

    /// First clear bit at or after `from`.
    fn find_clear(&self, from: u64) -> Option<u64> {
        let mut idx = from;
        while idx < self.bits {
            let (chunk, word, _) = Self::locate(idx);
            let shift = idx % 64;
            let free = !self.chunks[chunk][word] >> shift;
            if free != 0 {
                let found = idx + free.trailing_zeros() as u64;
                return (found < self.bits).then_some(found);
            }
            idx += 64 - shift;
        }
        None
    }

    fn count_ones(&self) -> u64 {
        self.chunks
            .iter()
            .flat_map(|chunk| chunk.iter())
            .map(|word| word.count_ones() as u64)
            .sum()
    }

    fn words(&self) -> impl Iterator<Item = u64> + '_ {
        let words = self.bits.div_ceil(64) as usize;
        self.chunks.iter().flat_map(|chunk| chunk.iter()).copied().take(words)
    }
}

/// Allocation bitmap over the whole arena.
#[derive(Debug, Clone)]
pub struct AllocationMap {
    blocks: u64,
    levels: Vec<Bitmap>,
}

impl AllocationMap {
    /// Creates a map over `blocks` free basic blocks.
    pub fn new(blocks: u64, levels: usize) -> Result<Self> {
        if levels == 0 || blocks % (1u64 << (levels - 1)) != 0 {
            return Err(TesseraError::InvalidParameter {
                name: "arena blocks".to_string(),
                value: blocks.to_string(),
            });
        }
        Ok(Self {
            blocks,
            levels: (0..levels).map(|level| Bitmap::new(blocks >> level)).collect(),
        })
    }

    /// Arena size in basic blocks.
    pub fn blocks(&self) -> u64 {
        self.blocks
    }

    pub fn levels(&self) -> usize {
        self.levels.len()
    }

    /// Number of allocated basic blocks.
    pub fn allocated_blocks(&self) -> u64 {
        self.levels[0].count_ones()
    }

    /// Status of run `pos` at `level`, where `pos` counts runs of that level.
    pub fn get_allocation_status(&self, level: usize, pos: u64) -> Option<AllocationStatus> {
        let bitmap = self.levels.get(level)?;
        (pos < bitmap.bits).then(|| {
            if bitmap.get(pos) {
                AllocationStatus::Allocated
            } else {
                AllocationStatus::Free
            }
        })
    }

    /// Status of the run an allocation names.
    pub fn status_of(&self, alloc: &Allocation) -> Result<AllocationStatus> {
        self.check(alloc)?;
        let level = alloc.level as usize;
        self.get_allocation_status(level, alloc.position >> level)
            .ok_or(TesseraError::BlockNotFound {
                block_id: alloc.position,
            })
    }

    fn check(&self, alloc: &Allocation) -> Result<()> {
        let level = alloc.level as usize;
        if level >= self.levels.len()
            || alloc.position % alloc.blocks() != 0
            || alloc.end() > self.blocks
        {
            return Err(TesseraError::InvalidParameter {
                name: "allocation".to_string(),
                value: format!("{} at level {}", alloc.position, alloc.level),
            });
        }
        Ok(())
    }

    /// Marks every block of `allocs` allocated or free, updating all levels.
    pub fn setup_bits(&mut self, allocs: &[Allocation], allocated: bool) -> Result<()> {
        for alloc in allocs {
            self.check(alloc)?;
            let run = alloc.level as usize;
            for level in 0..=run {
                let start = alloc.position >> level;
                let end = alloc.end() >> level;
                for idx in start..end {
                    self.levels[level].set(idx, allocated);
                }
            }
            let mut idx = alloc.position >> run;
            for level in run + 1..self.levels.len() {
                idx >>= 1;
                let value = if allocated {
                    true
                } else {
                    let below = &self.levels[level - 1];
                    below.get(idx * 2) || below.get(idx * 2 + 1)
                };
                self.levels[level].set(idx, value);
            }
        }
        Ok(())
    }

    /// Copies the chunks covering `allocs` at every level without changing
    /// any bit.
    pub fn touch_bits(&mut self, allocs: &[Allocation]) -> Result<()> {
        for alloc in allocs {
            self.check(alloc)?;
            for (level, bitmap) in self.levels.iter_mut().enumerate() {
                let start = alloc.position >> level;
                let last = (alloc.end() - 1) >> level;
                let mut idx = start;
                while idx <= last {
                    bitmap.touch(idx);
                    idx = (idx / CHUNK_BITS + 1) * CHUNK_BITS;
                }
            }
        }
        Ok(())
    }

    /// Moves free runs of `level` into the pool until its queue is full.
    ///
    /// The runs are marked allocated: pooled blocks belong to the pool
    /// until they are handed out or returned. Returns whether any run was
    /// added.
    pub fn populate_allocation_pool(
        &mut self,
        pool: &mut AllocationPool,
        level: usize,
    ) -> Result<bool> {
        if level >= self.levels.len() {
            return Err(TesseraError::InvalidParameter {
                name: "level".to_string(),
                value: level.to_string(),
            });
        }
        let mut added = false;
        let mut from = 0;
        while pool.has_room(level) {
            let Some(idx) = self.levels[level].find_clear(from) else {
                break;
            };
            let alloc = Allocation::new(idx << level, level as u8);
            self.setup_bits(&[alloc], true)?;
            if !pool.add(alloc) {
                self.setup_bits(&[alloc], false)?;
                break;
            }
            added = true;
            from = idx + 1;
        }
        Ok(added)
    }

    /// Grows the map to `blocks` basic blocks; new blocks are free.
    pub fn expand(&mut self, blocks: u64) -> Result<()> {
        let top_run = 1u64 << (self.levels.len() - 1);
        if blocks % top_run != 0 {
            return Err(TesseraError::InvalidParameter {
                name: "arena blocks".to_string(),
                value: blocks.to_string(),
            });
        }
        if blocks <= self.blocks {
            return Ok(());
        }
        for (level, bitmap) in self.levels.iter_mut().enumerate() {
            bitmap.resize(blocks >> level);
        }
        self.blocks = blocks;
        Ok(())
    }

    /// Whether the chunk holding level-0 bit `pos` is shared with `other`.
    pub fn shares_chunk_with(&self, other: &AllocationMap, pos: u64) -> bool {
        let chunk = (pos / CHUNK_BITS) as usize;
        match (self.levels[0].chunks.get(chunk), other.levels[0].chunks.get(chunk)) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }

    /// Serializes the level-0 bits; upper levels are rebuilt on load.
    pub fn to_bytes(&self) -> Vec<u8> {
        let words = self.blocks.div_ceil(64) as usize;
        let mut buf = BytesMut::with_capacity(12 + words * 8);
        buf.put_u64_le(self.blocks);
        buf.put_u32_le(self.levels.len() as u32);
        for word in self.levels[0].words() {
            buf.put_u64_le(word);
        }
        buf.to_vec()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < 12 {
            return Err(TesseraError::SuperblockCorrupted(
                "allocation map is truncated".to_string(),
            ));
        }
        let blocks = data.get_u64_le();
        let levels = data.get_u32_le() as usize;
        let words = blocks.div_ceil(64) as usize;
        if levels == 0 || data.len() != words * 8 {
            return Err(TesseraError::SuperblockCorrupted(format!(
                "allocation map of {} blocks carries {} bytes",
                blocks,
                data.len()
            )));
        }
        let mut map = Self::new(blocks, levels)?;
        for word_idx in 0..words {
            let word = data.get_u64_le();
            if word == 0 {
                continue;
            }
            let chunk = word_idx / CHUNK_WORDS;
            Arc::make_mut(&mut map.levels[0].chunks[chunk])[word_idx % CHUNK_WORDS] = word;
        }
        for level in 1..levels {
            for idx in 0..map.levels[level].bits {
                let below = &map.levels[level - 1];
                if below.get(idx * 2) || below.get(idx * 2 + 1) {
                    map.levels[level].set(idx, true);
                }
            }
        }
        Ok(map)
    }
}
