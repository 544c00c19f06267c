//! Packed symbol sequence with a per-block count index.
//!
//! ```text
//! +----------------------------------------------------------+
//! | size u32 | bps u8 | rsv [u8; 3] | blocks u32 | rsv u32   |  16 bytes
//! +----------------------------------------------------------+
//! | symbols: ceil(size * bps / 64) u64 words                 |
//! +----------------------------------------------------------+
//! | counts: blocks x 2^bps u16, padded to 8                  |
//! +----------------------------------------------------------+
//! ```
//!
//! Symbol `i` lives at bit `i * bps` of the word array; `bps` divides 64 so
//! no symbol straddles two words. Each count block covers [`SEQ_BLOCK`]
//! symbols.

use bytes::{Buf, BufMut};
use tessera_common::{Result, TesseraError};

use super::{SUBSTREAM_HEADER_SIZE, check_len, u64_at};
use crate::allocator::align_up;

/// Symbols covered by one count block.
pub const SEQ_BLOCK: usize = 512;

fn blocks_for(size: usize) -> usize {
    size.div_ceil(SEQ_BLOCK)
}

fn words_for(size: usize, bps: usize) -> usize {
    (size * bps).div_ceil(64)
}

/// Validates a symbol width.
pub fn check_bps(bps: usize) -> Result<()> {
    if !matches!(bps, 1 | 2 | 4 | 8) {
        return Err(TesseraError::InvalidParameter {
            name: "symbol_bits".to_string(),
            value: bps.to_string(),
        });
    }
    Ok(())
}

pub fn encoded_size(bps: usize, size: usize) -> usize {
    SUBSTREAM_HEADER_SIZE + 8 * words_for(size, bps) + align_up(2 * blocks_for(size) * (1 << bps))
}

/// Encodes `symbols`, each of which must be below `2^bps`.
pub fn encode(bps: usize, symbols: &[u64]) -> Vec<u8> {
    let size = symbols.len();
    let alphabet = 1usize << bps;
    let mut out = Vec::with_capacity(encoded_size(bps, size));

    out.put_u32_le(size as u32);
    out.put_u8(bps as u8);
    out.put_bytes(0, 3);
    out.put_u32_le(blocks_for(size) as u32);
    out.put_u32_le(0);

    let per_word = 64 / bps;
    for chunk in symbols.chunks(per_word) {
        let word = chunk
            .iter()
            .enumerate()
            .fold(0u64, |w, (i, &s)| w | (s << (i * bps)));
        out.put_u64_le(word);
    }

    let counts_start = out.len();
    for chunk in symbols.chunks(SEQ_BLOCK) {
        let mut counts = vec![0u16; alphabet];
        for &s in chunk {
            counts[s as usize] += 1;
        }
        for c in counts {
            out.put_u16_le(c);
        }
    }
    let counts_len = out.len() - counts_start;
    out.put_bytes(0, align_up(counts_len) - counts_len);
    out
}

/// Read view over an encoded sequence.
#[derive(Debug, Clone, Copy)]
pub struct SeqView<'a> {
    bytes: &'a [u8],
    size: usize,
    bps: usize,
}

impl<'a> SeqView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        check_len(bytes, SUBSTREAM_HEADER_SIZE, "sequence header")?;
        let mut header = bytes;
        let size = header.get_u32_le() as usize;
        let bps = header.get_u8() as usize;
        header.advance(3);
        let blocks = header.get_u32_le() as usize;

        check_bps(bps)?;
        if blocks != blocks_for(size) {
            return Err(TesseraError::PackedCorrupted(format!(
                "sequence of {} symbols has {} count blocks",
                size, blocks
            )));
        }
        check_len(bytes, encoded_size(bps, size), "sequence body")?;
        Ok(Self { bytes, size, bps })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn bps(&self) -> usize {
        self.bps
    }

    pub fn alphabet(&self) -> usize {
        1 << self.bps
    }

    #[inline]
    fn raw(&self, idx: usize) -> u64 {
        let per_word = 64 / self.bps;
        let word = u64_at(self.bytes, SUBSTREAM_HEADER_SIZE + 8 * (idx / per_word));
        (word >> ((idx % per_word) * self.bps)) & ((1u64 << self.bps) - 1)
    }

    fn block_count(&self, block: usize, symbol: u64) -> u64 {
        let base = SUBSTREAM_HEADER_SIZE + 8 * words_for(self.size, self.bps);
        let pos = base + 2 * (block * self.alphabet() + symbol as usize);
        u16::from_le_bytes([self.bytes[pos], self.bytes[pos + 1]]) as u64
    }

    fn check_symbol(&self, symbol: u64) -> Result<()> {
        if symbol >= self.alphabet() as u64 {
            return Err(TesseraError::InvalidParameter {
                name: "symbol".to_string(),
                value: symbol.to_string(),
            });
        }
        Ok(())
    }

    pub fn symbol(&self, idx: usize) -> Result<u64> {
        if idx >= self.size {
            return Err(TesseraError::IndexOutOfBounds {
                index: idx,
                size: self.size,
            });
        }
        Ok(self.raw(idx))
    }

    /// Occurrences of `symbol` in `[0, idx)`.
    pub fn rank(&self, idx: usize, symbol: u64) -> Result<u64> {
        self.check_symbol(symbol)?;
        if idx > self.size {
            return Err(TesseraError::IndexOutOfBounds {
                index: idx,
                size: self.size,
            });
        }
        let full = idx / SEQ_BLOCK;
        let mut rank: u64 = (0..full).map(|b| self.block_count(b, symbol)).sum();
        rank += (full * SEQ_BLOCK..idx)
            .filter(|&i| self.raw(i) == symbol)
            .count() as u64;
        Ok(rank)
    }

    /// Position of the occurrence of `symbol` preceded by `rank` others.
    pub fn select(&self, rank: u64, symbol: u64) -> Result<Option<usize>> {
        self.check_symbol(symbol)?;
        let mut remaining = rank;
        for block in 0..blocks_for(self.size) {
            let count = self.block_count(block, symbol);
            if remaining >= count {
                remaining -= count;
                continue;
            }
            let start = block * SEQ_BLOCK;
            let end = (start + SEQ_BLOCK).min(self.size);
            for idx in start..end {
                if self.raw(idx) == symbol {
                    if remaining == 0 {
                        return Ok(Some(idx));
                    }
                    remaining -= 1;
                }
            }
        }
        Ok(None)
    }

    /// Per-symbol counts over `[start, end)`.
    pub fn counts(&self, start: usize, end: usize) -> Result<Vec<u64>> {
        if start > end || end > self.size {
            return Err(TesseraError::RangeOutOfBounds {
                start,
                end,
                size: self.size,
            });
        }
        let mut counts = vec![0u64; self.alphabet()];
        let mut pos = start;
        while pos < end {
            let block = pos / SEQ_BLOCK;
            let block_end = ((block + 1) * SEQ_BLOCK).min(self.size);
            if pos == block * SEQ_BLOCK && block_end <= end {
                for (s, c) in counts.iter_mut().enumerate() {
                    *c += self.block_count(block, s as u64);
                }
                pos = block_end;
            } else {
                counts[self.raw(pos) as usize] += 1;
                pos += 1;
            }
        }
        Ok(counts)
    }

    pub fn to_symbols(&self) -> Vec<u64> {
        (0..self.size).map(|i| self.raw(i)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pattern(size: usize, bps: usize) -> Vec<u64> {
        (0..size).map(|i| ((i * 7 + i / 3) % (1 << bps)) as u64).collect()
    }

    #[test]
    fn test_symbols_roundtrip_per_width() {
        for bps in [1, 2, 4, 8] {
            let symbols = pattern(1000, bps);
            let bytes = encode(bps, &symbols);
            assert_eq!(bytes.len(), encoded_size(bps, symbols.len()));
            let view = SeqView::parse(&bytes).unwrap();
            assert_eq!(view.to_symbols(), symbols);
        }
    }

    #[test]
    fn test_rank_matches_scan() {
        let symbols = pattern(1300, 2);
        let bytes = encode(2, &symbols);
        let view = SeqView::parse(&bytes).unwrap();
        for idx in [0, 1, 511, 512, 513, 1024, 1300] {
            for sym in 0..4 {
                let expected = symbols[..idx].iter().filter(|&&s| s == sym).count() as u64;
                assert_eq!(view.rank(idx, sym).unwrap(), expected);
            }
        }
        assert!(view.rank(1301, 0).is_err());
    }

    #[test]
    fn test_select_inverts_rank() {
        let symbols = pattern(1100, 4);
        let bytes = encode(4, &symbols);
        let view = SeqView::parse(&bytes).unwrap();
        for idx in [0, 17, 600, 1099] {
            let sym = symbols[idx];
            let rank = view.rank(idx, sym).unwrap();
            assert_eq!(view.select(rank, sym).unwrap(), Some(idx));
        }
        let total = view.rank(1100, 3).unwrap();
        assert_eq!(view.select(total, 3).unwrap(), None);
    }

    #[test]
    fn test_counts_over_range() {
        let symbols = pattern(1200, 1);
        let bytes = encode(1, &symbols);
        let view = SeqView::parse(&bytes).unwrap();
        let counts = view.counts(100, 1100).unwrap();
        let ones = symbols[100..1100].iter().filter(|&&s| s == 1).count() as u64;
        assert_eq!(counts, vec![1000 - ones, ones]);
    }

    #[test]
    fn test_invalid_symbol() {
        let bytes = encode(1, &[0, 1, 1]);
        let view = SeqView::parse(&bytes).unwrap();
        assert!(view.rank(1, 2).is_err());
    }
}
