//! Array of child block identifiers.
//!
//! The only substream kind holding references to other blocks.

use bytes::{Buf, BufMut};
use tessera_common::{BlockId, Result, TesseraError};

use super::{HoldsBlockReferences, SUBSTREAM_HEADER_SIZE, check_len, u64_at};

pub fn encoded_size(size: usize) -> usize {
    SUBSTREAM_HEADER_SIZE + 8 * size
}

pub fn encode(ids: &[u64]) -> Vec<u8> {
    let mut out = Vec::with_capacity(encoded_size(ids.len()));
    out.put_u32_le(ids.len() as u32);
    out.put_bytes(0, SUBSTREAM_HEADER_SIZE - 4);
    for &id in ids {
        out.put_u64_le(id);
    }
    out
}

#[derive(Debug, Clone, Copy)]
pub struct BlockIdsView<'a> {
    bytes: &'a [u8],
    size: usize,
}

impl<'a> BlockIdsView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        check_len(bytes, SUBSTREAM_HEADER_SIZE, "block id header")?;
        let size = (&bytes[..4]).get_u32_le() as usize;
        check_len(bytes, encoded_size(size), "block id body")?;
        Ok(Self { bytes, size })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn get(&self, idx: usize) -> Result<BlockId> {
        if idx >= self.size {
            return Err(TesseraError::IndexOutOfBounds {
                index: idx,
                size: self.size,
            });
        }
        Ok(BlockId(u64_at(self.bytes, SUBSTREAM_HEADER_SIZE + 8 * idx)))
    }

    pub fn iter(&self) -> impl Iterator<Item = BlockId> + 'a {
        let bytes = self.bytes;
        (0..self.size).map(move |idx| BlockId(u64_at(bytes, SUBSTREAM_HEADER_SIZE + 8 * idx)))
    }

    pub fn position(&self, id: BlockId) -> Option<usize> {
        self.iter().position(|b| b == id)
    }

    pub fn to_ids(&self) -> Vec<u64> {
        self.iter().map(|b| b.as_u64()).collect()
    }
}

impl HoldsBlockReferences for BlockIdsView<'_> {
    fn block_ref_count(&self) -> usize {
        self.size
    }

    fn block_ref(&self, idx: usize) -> Result<BlockId> {
        self.get(idx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_block_ids_view() {
        let bytes = encode(&[7, 9, 11]);
        let view = BlockIdsView::parse(&bytes).unwrap();
        assert_eq!(view.size(), 3);
        assert_eq!(view.get(1).unwrap(), BlockId(9));
        assert_eq!(view.position(BlockId(11)), Some(2));
        assert_eq!(view.position(BlockId(1)), None);
        assert!(view.get(3).is_err());
    }

    #[test]
    fn test_for_each_block_ref() {
        let bytes = encode(&[3, 4]);
        let view = BlockIdsView::parse(&bytes).unwrap();
        let mut seen = Vec::new();
        view.for_each_block_ref(&mut |id| {
            seen.push(id);
            Ok(())
        })
        .unwrap();
        assert_eq!(seen, vec![BlockId(3), BlockId(4)]);
    }
}
