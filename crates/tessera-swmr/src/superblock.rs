//! Superblock and metadata slot encoding.

use bytes::{Buf, BufMut, BytesMut};
use tessera_common::{BlockId, CommitId, Result, TesseraError};

use crate::allocation::Allocation;

/// Status recorded by the commit that wrote a superblock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum SuperblockStatus {
    /// Written by a commit that was not a consistency point.
    Committed = 1,
    /// Written by a consistency point; the slot was synced.
    ConsistencyPoint = 2,
}

impl TryFrom<u32> for SuperblockStatus {
    type Error = TesseraError;

    fn try_from(value: u32) -> Result<Self> {
        match value {
            1 => Ok(SuperblockStatus::Committed),
            2 => Ok(SuperblockStatus::ConsistencyPoint),
            _ => Err(TesseraError::SuperblockCorrupted(format!(
                "unknown status {}",
                value
            ))),
        }
    }
}

/// Commit flag bits.
pub const FLAG_PERSISTENT: u32 = 1;

/// Fixed part of a metadata slot.
///
/// Layout (88 bytes, little-endian):
/// - magic: 8 bytes ("TESSERA1")
/// - version: 4 bytes
/// - status: 4 bytes
/// - store_id: 8 bytes
/// - sequence: 8 bytes
/// - cp_sequence: 8 bytes
/// - commit_id: 8 bytes
/// - parent_commit: 8 bytes (u64::MAX for none)
/// - arena_blocks: 8 bytes
/// - directory_root: 8 bytes
/// - history_root: 8 bytes
/// - flags: 4 bytes
/// - reserved: 4 bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Superblock {
    pub status: SuperblockStatus,
    /// Random id chosen when the store is created.
    pub store_id: u64,
    /// Incremented by every commit.
    pub sequence: u64,
    /// Sequence of the latest consistency point, this one included.
    pub cp_sequence: u64,
    pub commit_id: CommitId,
    pub parent_commit: Option<CommitId>,
    pub arena_blocks: u64,
    pub directory_root: BlockId,
    pub history_root: BlockId,
    pub flags: u32,
}

impl Superblock {
    pub const MAGIC: [u8; 8] = *b"TESSERA1";
    pub const VERSION: u32 = 1;
    pub const SIZE: usize = 88;

    pub fn is_consistency_point(&self) -> bool {
        self.status == SuperblockStatus::ConsistencyPoint
    }

    pub fn is_persistent(&self) -> bool {
        self.flags & FLAG_PERSISTENT != 0
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = BytesMut::with_capacity(Self::SIZE);
        buf.put_slice(&Self::MAGIC);
        buf.put_u32_le(Self::VERSION);
        buf.put_u32_le(self.status as u32);
        buf.put_u64_le(self.store_id);
        buf.put_u64_le(self.sequence);
        buf.put_u64_le(self.cp_sequence);
        buf.put_u64_le(self.commit_id.0);
        buf.put_u64_le(self.parent_commit.map_or(u64::MAX, |id| id.0));
        buf.put_u64_le(self.arena_blocks);
        buf.put_u64_le(self.directory_root.as_u64());
        buf.put_u64_le(self.history_root.as_u64());
        buf.put_u32_le(self.flags);
        buf.put_u32_le(0);

        let mut out = [0u8; Self::SIZE];
        out.copy_from_slice(&buf);
        out
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(TesseraError::SuperblockCorrupted(format!(
                "superblock needs {} bytes, got {}",
                Self::SIZE,
                data.len()
            )));
        }
        let mut magic = [0u8; 8];
        data.copy_to_slice(&mut magic);
        if magic != Self::MAGIC {
            return Err(TesseraError::SuperblockCorrupted("bad magic".to_string()));
        }
        let version = data.get_u32_le();
        if version != Self::VERSION {
            return Err(TesseraError::SuperblockCorrupted(format!(
                "unsupported version {}",
                version
            )));
        }
        let status = SuperblockStatus::try_from(data.get_u32_le())?;
        let store_id = data.get_u64_le();
        let sequence = data.get_u64_le();
        let cp_sequence = data.get_u64_le();
        let commit_id = CommitId(data.get_u64_le());
        let parent_commit = match data.get_u64_le() {
            u64::MAX => None,
            id => Some(CommitId(id)),
        };
        let arena_blocks = data.get_u64_le();
        let directory_root = BlockId(data.get_u64_le());
        let history_root = BlockId(data.get_u64_le());
        let flags = data.get_u32_le();
        Ok(Self {
            status,
            store_id,
            sequence,
            cp_sequence,
            commit_id,
            parent_commit,
            arena_blocks,
            directory_root,
            history_root,
            flags,
        })
    }
}

/// Everything a commit persists in a metadata slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitMetadata {
    pub superblock: Superblock,
    /// Encoded allocation pool.
    pub pool: Vec<u8>,
    /// Encoded allocation map.
    pub allocation_map: Vec<u8>,
    /// Encoded reference counters.
    pub counters: Vec<u8>,
    /// Runs freed at the next consistency point.
    pub cp_postponed: Vec<Allocation>,
}

impl CommitMetadata {
    /// Encodes the slot payload: superblock, four length-prefixed sections
    /// and a trailing CRC32 over everything before it.
    pub fn encode(&self) -> Vec<u8> {
        let mut postponed = BytesMut::with_capacity(self.cp_postponed.len() * 9);
        for alloc in &self.cp_postponed {
            postponed.put_u64_le(alloc.position);
            postponed.put_u8(alloc.level);
        }

        let sections: [&[u8]; 4] = [&self.pool, &self.allocation_map, &self.counters, &postponed];
        let body: usize = sections.iter().map(|s| 4 + s.len()).sum();
        let mut buf = BytesMut::with_capacity(Superblock::SIZE + body + 4);
        buf.put_slice(&self.superblock.to_bytes());
        for section in sections {
            buf.put_u32_le(section.len() as u32);
            buf.put_slice(section);
        }
        let checksum = crc32fast::hash(&buf);
        buf.put_u32_le(checksum);
        buf.to_vec()
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Superblock::SIZE + 4 {
            return Err(TesseraError::SuperblockCorrupted(
                "metadata slot is truncated".to_string(),
            ));
        }
        let (body, tail) = data.split_at(data.len() - 4);
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        let computed = crc32fast::hash(body);
        if stored != computed {
            return Err(TesseraError::SuperblockCorrupted(format!(
                "checksum mismatch: stored {:#010x}, computed {:#010x}",
                stored, computed
            )));
        }

        let superblock = Superblock::from_bytes(body)?;
        let mut rest = &body[Superblock::SIZE..];
        let mut sections = Vec::with_capacity(4);
        for _ in 0..4 {
            if rest.remaining() < 4 {
                return Err(TesseraError::SuperblockCorrupted(
                    "metadata section header is truncated".to_string(),
                ));
            }
            let len = rest.get_u32_le() as usize;
            if rest.remaining() < len {
                return Err(TesseraError::SuperblockCorrupted(
                    "metadata section is truncated".to_string(),
                ));
            }
            sections.push(rest[..len].to_vec());
            rest.advance(len);
        }
        let postponed = sections.pop().unwrap_or_default();
        if postponed.len() % 9 != 0 {
            return Err(TesseraError::SuperblockCorrupted(
                "postponed deallocations are truncated".to_string(),
            ));
        }
        let mut raw: &[u8] = &postponed;
        let mut cp_postponed = Vec::with_capacity(raw.len() / 9);
        while raw.has_remaining() {
            let position = raw.get_u64_le();
            cp_postponed.push(Allocation::new(position, raw.get_u8()));
        }
        let counters = sections.pop().unwrap_or_default();
        let allocation_map = sections.pop().unwrap_or_default();
        let pool = sections.pop().unwrap_or_default();
        Ok(Self {
            superblock,
            pool,
            allocation_map,
            counters,
            cp_postponed,
        })
    }
}

/// Index of the slot holding the newest valid metadata.
pub fn newest_slot(slots: &[Option<CommitMetadata>]) -> Option<usize> {
    slots
        .iter()
        .enumerate()
        .filter_map(|(idx, slot)| slot.as_ref().map(|meta| (idx, meta.superblock.sequence)))
        .max_by_key(|(_, sequence)| *sequence)
        .map(|(idx, _)| idx)
}
