//! Raw block storage backing a SWMR store.
//!
//! A block store holds two metadata slots and an arena of basic blocks.
//! Arena positions are level-0 block numbers; a node occupies a run of
//! `node_block_size / basic_block_size` consecutive positions starting at
//! its block id.

use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tessera_common::{Result, TesseraError};
use tracing::debug;

/// Number of metadata slots in every store.
pub const METADATA_SLOTS: usize = 2;

/// Byte-level access to the metadata slots and the block arena.
pub trait BlockStore: Send + Sync {
    fn basic_block_size(&self) -> usize;

    /// Capacity of each metadata slot in bytes.
    fn slot_size(&self) -> usize;

    /// Current arena size in basic blocks.
    fn arena_blocks(&self) -> u64;

    /// Grows the arena to `blocks` basic blocks.
    fn grow(&self, blocks: u64) -> Result<()>;

    /// Reads `buf.len()` bytes starting at arena position `pos`.
    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<()>;

    fn write(&self, pos: u64, data: &[u8]) -> Result<()>;

    /// Content of a metadata slot, or `None` if it was never written.
    fn read_slot(&self, slot: usize) -> Result<Option<Vec<u8>>>;

    fn write_slot(&self, slot: usize, data: &[u8]) -> Result<()>;

    /// Makes every completed write durable.
    fn sync(&self) -> Result<()>;
}

fn check_slot(slot: usize, slot_size: usize, len: usize) -> Result<()> {
    if slot >= METADATA_SLOTS {
        return Err(TesseraError::IndexOutOfBounds {
            index: slot,
            size: METADATA_SLOTS,
        });
    }
    if len > slot_size {
        return Err(TesseraError::OutOfSpace {
            requested: len,
            available: slot_size,
        });
    }
    Ok(())
}

fn check_range(pos: u64, len: usize, basic: usize, arena: u64) -> Result<()> {
    let blocks = len.div_ceil(basic) as u64;
    if pos.checked_add(blocks).is_none_or(|end| end > arena) {
        return Err(TesseraError::BlockNotFound { block_id: pos });
    }
    Ok(())
}

#[derive(Debug, Default)]
struct MemoryArena {
    arena_blocks: u64,
    blocks: HashMap<u64, Vec<u8>>,
    slots: [Option<Vec<u8>>; METADATA_SLOTS],
}

/// Heap-backed block store.
///
/// Writes are kept per start position, so a read must address the same
/// position and length as the write that produced it.
#[derive(Debug)]
pub struct MemoryBlockStore {
    basic_block_size: usize,
    slot_size: usize,
    inner: RwLock<MemoryArena>,
}

impl MemoryBlockStore {
    pub fn new(basic_block_size: usize, slot_size: usize, arena_blocks: u64) -> Self {
        Self {
            basic_block_size,
            slot_size,
            inner: RwLock::new(MemoryArena {
                arena_blocks,
                ..MemoryArena::default()
            }),
        }
    }

    /// Number of arena positions that hold written data.
    pub fn written_blocks(&self) -> usize {
        self.inner.read().blocks.len()
    }
}

impl BlockStore for MemoryBlockStore {
    fn basic_block_size(&self) -> usize {
        self.basic_block_size
    }

    fn slot_size(&self) -> usize {
        self.slot_size
    }

    fn arena_blocks(&self) -> u64 {
        self.inner.read().arena_blocks
    }

    fn grow(&self, blocks: u64) -> Result<()> {
        let mut inner = self.inner.write();
        inner.arena_blocks = inner.arena_blocks.max(blocks);
        Ok(())
    }

    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        let inner = self.inner.read();
        check_range(pos, buf.len(), self.basic_block_size, inner.arena_blocks)?;
        let data = inner
            .blocks
            .get(&pos)
            .ok_or(TesseraError::BlockNotFound { block_id: pos })?;
        if data.len() != buf.len() {
            return Err(TesseraError::BlockSizeMismatch {
                expected: buf.len(),
                actual: data.len(),
            });
        }
        buf.copy_from_slice(data);
        Ok(())
    }

    fn write(&self, pos: u64, data: &[u8]) -> Result<()> {
        let mut inner = self.inner.write();
        check_range(pos, data.len(), self.basic_block_size, inner.arena_blocks)?;
        inner.blocks.insert(pos, data.to_vec());
        Ok(())
    }

    fn read_slot(&self, slot: usize) -> Result<Option<Vec<u8>>> {
        check_slot(slot, self.slot_size, 0)?;
        Ok(self.inner.read().slots[slot].clone())
    }

    fn write_slot(&self, slot: usize, data: &[u8]) -> Result<()> {
        check_slot(slot, self.slot_size, data.len())?;
        self.inner.write().slots[slot] = Some(data.to_vec());
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        Ok(())
    }
}

/// Block store kept in a single file.
///
/// The file starts with the two metadata slots, each `slot_size` bytes
/// long, followed by the arena. A slot begins with its payload length as
/// a little-endian u32; a zero length marks an unwritten slot.
pub struct FileBlockStore {
    path: PathBuf,
    basic_block_size: usize,
    slot_size: usize,
    file: Mutex<File>,
    arena_blocks: RwLock<u64>,
}

impl FileBlockStore {
    /// Creates a new store file, failing if one already exists.
    pub fn create(
        path: &Path,
        basic_block_size: usize,
        slot_size: usize,
        arena_blocks: u64,
    ) -> Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        let store = Self {
            path: path.to_path_buf(),
            basic_block_size,
            slot_size,
            file: Mutex::new(file),
            arena_blocks: RwLock::new(0),
        };
        store.grow(arena_blocks)?;
        debug!(path = %path.display(), arena_blocks, "created store file");
        Ok(store)
    }

    /// Opens an existing store file.
    pub fn open(path: &Path, basic_block_size: usize, slot_size: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        let arena_start = Self::arena_offset(slot_size);
        if len < arena_start {
            return Err(TesseraError::SuperblockCorrupted(format!(
                "store file {} is shorter than its metadata slots",
                path.display()
            )));
        }
        let arena_blocks = (len - arena_start) / basic_block_size as u64;
        Ok(Self {
            path: path.to_path_buf(),
            basic_block_size,
            slot_size,
            file: Mutex::new(file),
            arena_blocks: RwLock::new(arena_blocks),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn arena_offset(slot_size: usize) -> u64 {
        (METADATA_SLOTS * (slot_size + 4)) as u64
    }

    fn block_offset(&self, pos: u64) -> u64 {
        Self::arena_offset(self.slot_size) + pos * self.basic_block_size as u64
    }

    fn slot_offset(&self, slot: usize) -> u64 {
        (slot * (self.slot_size + 4)) as u64
    }
}

impl BlockStore for FileBlockStore {
    fn basic_block_size(&self) -> usize {
        self.basic_block_size
    }

    fn slot_size(&self) -> usize {
        self.slot_size
    }

    fn arena_blocks(&self) -> u64 {
        *self.arena_blocks.read()
    }

    fn grow(&self, blocks: u64) -> Result<()> {
        let mut arena = self.arena_blocks.write();
        if blocks <= *arena {
            return Ok(());
        }
        let file = self.file.lock();
        file.set_len(self.block_offset(blocks))?;
        *arena = blocks;
        Ok(())
    }

    fn read(&self, pos: u64, buf: &mut [u8]) -> Result<()> {
        check_range(pos, buf.len(), self.basic_block_size, self.arena_blocks())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.block_offset(pos)))?;
        file.read_exact(buf)?;
        Ok(())
    }

    fn write(&self, pos: u64, data: &[u8]) -> Result<()> {
        check_range(pos, data.len(), self.basic_block_size, self.arena_blocks())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.block_offset(pos)))?;
        file.write_all(data)?;
        Ok(())
    }

    fn read_slot(&self, slot: usize) -> Result<Option<Vec<u8>>> {
        check_slot(slot, self.slot_size, 0)?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.slot_offset(slot)))?;
        let mut len = [0u8; 4];
        file.read_exact(&mut len)?;
        let len = u32::from_le_bytes(len) as usize;
        if len == 0 {
            return Ok(None);
        }
        if len > self.slot_size {
            return Err(TesseraError::SuperblockCorrupted(format!(
                "slot {} claims {} bytes",
                slot, len
            )));
        }
        let mut data = vec![0u8; len];
        file.read_exact(&mut data)?;
        Ok(Some(data))
    }

    fn write_slot(&self, slot: usize, data: &[u8]) -> Result<()> {
        check_slot(slot, self.slot_size, data.len())?;
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(self.slot_offset(slot)))?;
        file.write_all(&(data.len() as u32).to_le_bytes())?;
        file.write_all(data)?;
        Ok(())
    }

    fn sync(&self) -> Result<()> {
        self.file.lock().sync_all()?;
        Ok(())
    }
}

impl std::fmt::Debug for FileBlockStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileBlockStore")
            .field("path", &self.path)
            .field("arena_blocks", &self.arena_blocks())
            .finish()
    }
}
