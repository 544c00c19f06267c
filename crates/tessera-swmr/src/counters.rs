//! Persisted block reference counts and the commit-local overlay on top
//! of them.

use bytes::{Buf, BufMut, BytesMut};
use std::collections::HashMap;
use tessera_common::{BlockId, Result, TesseraError};
use tracing::trace;

/// Reference count of every live block, as of the last commit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RefCounters {
    counts: HashMap<BlockId, u64>,
}

impl RefCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: BlockId) -> Option<u64> {
        self.counts.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.counts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (BlockId, u64)> + '_ {
        self.counts.iter().map(|(id, count)| (*id, *count))
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut entries: Vec<_> = self.iter().collect();
        entries.sort_unstable();
        let mut buf = BytesMut::with_capacity(8 + entries.len() * 16);
        buf.put_u64_le(entries.len() as u64);
        for (id, count) in entries {
            buf.put_u64_le(id.as_u64());
            buf.put_u64_le(count);
        }
        buf.to_vec()
    }

    pub fn from_bytes(mut data: &[u8]) -> Result<Self> {
        if data.remaining() < 8 {
            return Err(TesseraError::SuperblockCorrupted(
                "reference counters are truncated".to_string(),
            ));
        }
        let len = data.get_u64_le() as usize;
        if data.remaining() != len * 16 {
            return Err(TesseraError::SuperblockCorrupted(format!(
                "{} reference counters in {} bytes",
                len,
                data.remaining()
            )));
        }
        let mut counts = HashMap::with_capacity(len);
        for _ in 0..len {
            let id = BlockId(data.get_u64_le());
            counts.insert(id, data.get_u64_le());
        }
        Ok(Self { counts })
    }
}

/// Counter changes made by one writable commit.
///
/// Lookups fall through to the base counters for blocks the commit has
/// not touched. A removed block shadows its base entry.
#[derive(Debug, Default)]
pub struct CounterOverlay {
    changes: HashMap<BlockId, Option<u64>>,
}

impl CounterOverlay {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, base: &RefCounters, id: BlockId) -> Option<u64> {
        match self.changes.get(&id) {
            Some(count) => *count,
            None => base.get(id),
        }
    }

    fn require(&self, base: &RefCounters, id: BlockId) -> Result<u64> {
        self.get(base, id)
            .ok_or(TesseraError::BlockNotFound { block_id: id.0 })
    }

    /// Registers a freshly allocated block with one reference.
    pub fn insert_new(&mut self, base: &RefCounters, id: BlockId) -> Result<()> {
        if let Some(count) = self.get(base, id) {
            return Err(TesseraError::Internal(format!(
                "allocated block {} is still referenced {} times",
                id, count
            )));
        }
        self.changes.insert(id, Some(1));
        Ok(())
    }

    pub fn inc(&mut self, base: &RefCounters, id: BlockId) -> Result<u64> {
        let count = self.require(base, id)? + 1;
        self.changes.insert(id, Some(count));
        trace!(block = %id, count, "ref");
        Ok(count)
    }

    pub fn dec(&mut self, base: &RefCounters, id: BlockId) -> Result<u64> {
        let count = self.require(base, id)?;
        if count == 0 {
            return Err(TesseraError::Internal(format!(
                "unref of unreferenced block {}",
                id
            )));
        }
        self.changes.insert(id, Some(count - 1));
        trace!(block = %id, count = count - 1, "unref");
        Ok(count - 1)
    }

    /// Drops the counter of a block whose count reached zero.
    pub fn remove(&mut self, base: &RefCounters, id: BlockId) -> Result<()> {
        match self.require(base, id)? {
            0 => {
                self.changes.insert(id, None);
                Ok(())
            }
            actual => Err(TesseraError::RefcountMismatch {
                block_id: id.0,
                expected: 0,
                actual,
            }),
        }
    }

    /// Number of blocks the commit changed.
    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Base counters with this commit's changes applied.
    pub fn apply(&self, base: &RefCounters) -> RefCounters {
        let mut merged = base.clone();
        for (id, count) in &self.changes {
            match count {
                Some(count) => merged.counts.insert(*id, *count),
                None => merged.counts.remove(id),
            };
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> RefCounters {
        let mut overlay = CounterOverlay::new();
        let empty = RefCounters::new();
        overlay.insert_new(&empty, BlockId(1)).unwrap();
        overlay.insert_new(&empty, BlockId(2)).unwrap();
        overlay.inc(&empty, BlockId(2)).unwrap();
        overlay.apply(&empty)
    }

    #[test]
    fn test_overlay_falls_through_to_base() {
        let base = base();
        let mut overlay = CounterOverlay::new();
        assert_eq!(overlay.get(&base, BlockId(2)), Some(2));
        assert_eq!(overlay.dec(&base, BlockId(2)).unwrap(), 1);
        assert_eq!(overlay.get(&base, BlockId(2)), Some(1));
        assert_eq!(base.get(BlockId(2)), Some(2));
        assert!(matches!(
            overlay.inc(&base, BlockId(3)),
            Err(TesseraError::BlockNotFound { block_id: 3 })
        ));
    }

    #[test]
    fn test_remove_requires_zero() {
        let base = base();
        let mut overlay = CounterOverlay::new();
        assert!(matches!(
            overlay.remove(&base, BlockId(1)),
            Err(TesseraError::RefcountMismatch { actual: 1, .. })
        ));
        assert_eq!(overlay.dec(&base, BlockId(1)).unwrap(), 0);
        assert!(overlay.dec(&base, BlockId(1)).is_err());
        overlay.remove(&base, BlockId(1)).unwrap();
        assert_eq!(overlay.get(&base, BlockId(1)), None);

        let merged = overlay.apply(&base);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged.get(BlockId(2)), Some(2));
    }

    #[test]
    fn test_reallocating_a_removed_block() {
        let base = base();
        let mut overlay = CounterOverlay::new();
        assert!(overlay.insert_new(&base, BlockId(1)).is_err());
        overlay.dec(&base, BlockId(1)).unwrap();
        overlay.remove(&base, BlockId(1)).unwrap();
        overlay.insert_new(&base, BlockId(1)).unwrap();
        assert_eq!(overlay.apply(&base).get(BlockId(1)), Some(1));
    }

    #[test]
    fn test_bytes() {
        let base = base();
        assert_eq!(RefCounters::from_bytes(&base.to_bytes()).unwrap(), base);
        assert!(RefCounters::from_bytes(&[0, 0]).is_err());
        let mut bytes = base.to_bytes();
        bytes.pop();
        assert!(RefCounters::from_bytes(&bytes).is_err());
    }
}
