//! Block structures for tessera storage.

use crate::error::{Result, TesseraError};
use serde::{Deserialize, Serialize};

/// Size of a level-0 block in bytes (4 KB).
pub const BASIC_BLOCK_SIZE: usize = 4096;

/// Number of allocation levels. A level-k allocation spans 2^k basic blocks.
pub const ALLOCATION_LEVELS: usize = 9;

/// Number of basic blocks covered by one top-level allocation.
pub const ALLOCATION_SIZE: u64 = 1 << (ALLOCATION_LEVELS - 1);

/// Returns the allocation level needed for a block of `size` bytes.
///
/// Sizes are rounded up to the next power-of-two multiple of the basic
/// block size.
pub fn level_for_size(size: usize, basic_block_size: usize) -> usize {
    let blocks = size.div_ceil(basic_block_size).max(1);
    blocks.next_power_of_two().trailing_zeros() as usize
}

/// Identifier of a block in the arena.
///
/// The value is the block's position in level-0 units, so a level-k block
/// always has an id aligned to 2^k.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct BlockId(pub u64);

impl BlockId {
    /// Marker for "no block".
    pub const INVALID: BlockId = BlockId(u64::MAX);

    /// Returns the id as a u64.
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Creates a BlockId from a u64 representation.
    pub fn from_u64(value: u64) -> Self {
        Self(value)
    }

    /// Returns true unless this is the INVALID marker.
    pub fn is_valid(&self) -> bool {
        self.0 != u64::MAX
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_valid() {
            write!(f, "#{}", self.0)
        } else {
            write!(f, "#invalid")
        }
    }
}

/// Identifier of a container (a B-tree rooted in the directory).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ContainerId(pub u64);

impl ContainerId {
    /// Directory of containers.
    pub const DIRECTORY: ContainerId = ContainerId(1);
    /// Commit history.
    pub const HISTORY: ContainerId = ContainerId(2);
    /// First id available to user containers.
    pub const FIRST_USER: ContainerId = ContainerId(16);

    /// Returns true for ids reserved by the store itself.
    pub fn is_system(&self) -> bool {
        self.0 < Self::FIRST_USER.0
    }
}

impl std::fmt::Display for ContainerId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctr:{}", self.0)
    }
}

/// Identifier of a commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct CommitId(pub u64);

impl CommitId {
    /// Returns the next commit id.
    pub fn next(&self) -> Self {
        Self(self.0 + 1)
    }
}

impl std::fmt::Display for CommitId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Kinds of blocks in the arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockKind {
    /// Unallocated block.
    Free = 0,
    /// Untyped payload.
    Raw = 1,
    /// B-tree leaf node.
    Leaf = 2,
    /// B-tree branch node.
    Branch = 3,
}

impl TryFrom<u8> for BlockKind {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(BlockKind::Free),
            1 => Ok(BlockKind::Raw),
            2 => Ok(BlockKind::Leaf),
            3 => Ok(BlockKind::Branch),
            other => Err(TesseraError::InvalidBlockKind(other)),
        }
    }
}

/// Header at the beginning of every arena block.
///
/// ```text
/// +----------+------+-------+---------+--------+--------------+----------+----------+
/// | block_id | kind | level | flags   | ctr_id | payload_size | checksum | reserved |
/// | 8        | 1    | 1     | 2       | 8      | 4            | 4        | 4        |
/// +----------+------+-------+---------+--------+--------------+----------+----------+
/// ```
///
/// The checksum is the CRC32 of the `payload_size` bytes following the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    /// Id of the block this header belongs to.
    pub block_id: BlockId,
    /// Kind of payload.
    pub kind: BlockKind,
    /// Allocation level of the block.
    pub level: u8,
    /// Reserved flag bits.
    pub flags: u16,
    /// Container the block belongs to.
    pub ctr_id: ContainerId,
    /// Number of meaningful payload bytes.
    pub payload_size: u32,
    /// CRC32 of the payload.
    pub checksum: u32,
}

impl BlockHeader {
    /// Size of the block header in bytes.
    pub const SIZE: usize = 32;

    /// Creates a header with an empty payload.
    pub fn new(block_id: BlockId, kind: BlockKind, level: u8, ctr_id: ContainerId) -> Self {
        Self {
            block_id,
            kind,
            level,
            flags: 0,
            ctr_id,
            payload_size: 0,
            checksum: 0,
        }
    }

    /// Records size and checksum of `payload`.
    pub fn seal(&mut self, payload: &[u8]) {
        self.payload_size = payload.len() as u32;
        self.checksum = crc32fast::hash(payload);
    }

    /// Verifies `payload` against the recorded size and checksum.
    pub fn verify(&self, payload: &[u8]) -> Result<()> {
        if payload.len() != self.payload_size as usize {
            return Err(TesseraError::BlockCorrupted {
                block_id: self.block_id.0,
                reason: format!(
                    "payload size {} does not match header {}",
                    payload.len(),
                    self.payload_size
                ),
            });
        }
        let computed = crc32fast::hash(payload);
        if computed != self.checksum {
            return Err(TesseraError::BlockCorrupted {
                block_id: self.block_id.0,
                reason: format!(
                    "checksum mismatch: stored={}, computed={}",
                    self.checksum, computed
                ),
            });
        }
        Ok(())
    }

    /// Serializes the header to bytes.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.block_id.0.to_le_bytes());
        buf[8] = self.kind as u8;
        buf[9] = self.level;
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[12..20].copy_from_slice(&self.ctr_id.0.to_le_bytes());
        buf[20..24].copy_from_slice(&self.payload_size.to_le_bytes());
        buf[24..28].copy_from_slice(&self.checksum.to_le_bytes());
        // bytes 28-31 are reserved (already zeroed)
        buf
    }

    /// Deserializes the header from bytes.
    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(TesseraError::BlockSizeMismatch {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        let block_id = u64::from_le_bytes([
            buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
        ]);
        let kind = BlockKind::try_from(buf[8])?;
        let level = buf[9];
        let flags = u16::from_le_bytes([buf[10], buf[11]]);
        let ctr_id = u64::from_le_bytes([
            buf[12], buf[13], buf[14], buf[15], buf[16], buf[17], buf[18], buf[19],
        ]);
        let payload_size = u32::from_le_bytes([buf[20], buf[21], buf[22], buf[23]]);
        let checksum = u32::from_le_bytes([buf[24], buf[25], buf[26], buf[27]]);

        Ok(Self {
            block_id: BlockId(block_id),
            kind,
            level,
            flags,
            ctr_id: ContainerId(ctr_id),
            payload_size,
            checksum,
        })
    }
}
