//! Fixed-size-element tree: u64 columns with a per-block sum/max index.
//!
//! ```text
//! +--------------------------------------------------------------+
//! | size u32 | columns u16 | index u8 | rsv u8 | blocks u32 | rsv |  16 bytes
//! +--------------------------------------------------------------+
//! | values: columns x size u64, column-major                     |
//! +--------------------------------------------------------------+
//! | index: columns x blocks x (sum u64, max u64)                 |
//! +--------------------------------------------------------------+
//! ```

use bytes::{Buf, BufMut};
use tessera_common::{Result, TesseraError};

use super::columns::ColumnData;
use super::{IndexKind, SUBSTREAM_HEADER_SIZE, check_len, u64_at};

/// Values covered by one index entry.
pub const FSE_INDEX_SPAN: usize = 32;

fn blocks_for(size: usize) -> usize {
    size.div_ceil(FSE_INDEX_SPAN)
}

/// Encoded size of a tree holding `size` rows of `columns` values.
pub fn encoded_size(columns: usize, size: usize) -> usize {
    SUBSTREAM_HEADER_SIZE + 8 * columns * size + 16 * columns * blocks_for(size)
}

pub fn encode(index: IndexKind, data: &ColumnData) -> Vec<u8> {
    let columns = data.width();
    let size = data.len();
    let blocks = blocks_for(size);
    let mut out = Vec::with_capacity(encoded_size(columns, size));

    out.put_u32_le(size as u32);
    out.put_u16_le(columns as u16);
    out.put_u8(index.as_u8());
    out.put_u8(0);
    out.put_u32_le(blocks as u32);
    out.put_u32_le(0);

    for column in data.columns() {
        for &value in column {
            out.put_u64_le(value);
        }
    }
    for column in data.columns() {
        for chunk in column.chunks(FSE_INDEX_SPAN) {
            out.put_u64_le(chunk.iter().fold(0u64, |acc, &v| acc.wrapping_add(v)));
            out.put_u64_le(chunk.iter().copied().max().unwrap_or(0));
        }
    }
    out
}

/// Read view over an encoded tree.
#[derive(Debug, Clone, Copy)]
pub struct FseTreeView<'a> {
    bytes: &'a [u8],
    size: usize,
    columns: usize,
    index: IndexKind,
}

impl<'a> FseTreeView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        check_len(bytes, SUBSTREAM_HEADER_SIZE, "fse tree header")?;
        let mut header = bytes;
        let size = header.get_u32_le() as usize;
        let columns = header.get_u16_le() as usize;
        let index = IndexKind::try_from(header.get_u8())?;
        header.advance(1);
        let blocks = header.get_u32_le() as usize;

        if columns == 0 || blocks != blocks_for(size) {
            return Err(TesseraError::PackedCorrupted(format!(
                "fse tree header is inconsistent: size {}, columns {}, blocks {}",
                size, columns, blocks
            )));
        }
        check_len(bytes, encoded_size(columns, size), "fse tree body")?;
        Ok(Self {
            bytes,
            size,
            columns,
            index,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn index_kind(&self) -> IndexKind {
        self.index
    }

    fn blocks(&self) -> usize {
        blocks_for(self.size)
    }

    fn check_column(&self, col: usize) -> Result<()> {
        if col >= self.columns {
            return Err(TesseraError::IndexOutOfBounds {
                index: col,
                size: self.columns,
            });
        }
        Ok(())
    }

    fn check_range(&self, start: usize, end: usize) -> Result<()> {
        if start > end || end > self.size {
            return Err(TesseraError::RangeOutOfBounds {
                start,
                end,
                size: self.size,
            });
        }
        Ok(())
    }

    #[inline]
    fn raw(&self, col: usize, idx: usize) -> u64 {
        u64_at(self.bytes, SUBSTREAM_HEADER_SIZE + 8 * (col * self.size + idx))
    }

    #[inline]
    fn index_entry(&self, col: usize, block: usize) -> (u64, u64) {
        let base = SUBSTREAM_HEADER_SIZE
            + 8 * self.columns * self.size
            + 16 * (col * self.blocks() + block);
        (u64_at(self.bytes, base), u64_at(self.bytes, base + 8))
    }

    pub fn value(&self, col: usize, idx: usize) -> Result<u64> {
        self.check_column(col)?;
        if idx >= self.size {
            return Err(TesseraError::IndexOutOfBounds {
                index: idx,
                size: self.size,
            });
        }
        Ok(self.raw(col, idx))
    }

    pub fn row(&self, idx: usize) -> Result<Vec<u64>> {
        (0..self.columns).map(|col| self.value(col, idx)).collect()
    }

    /// Values of column `col` in `[start, end)`, reduced block-wise.
    fn reduce(
        &self,
        col: usize,
        start: usize,
        end: usize,
        pick: impl Fn((u64, u64)) -> u64,
        fold: impl Fn(u64, u64) -> u64,
    ) -> Result<u64> {
        self.check_column(col)?;
        self.check_range(start, end)?;
        let mut acc = 0u64;
        let mut pos = start;
        while pos < end {
            let block = pos / FSE_INDEX_SPAN;
            let block_start = block * FSE_INDEX_SPAN;
            let block_end = (block_start + FSE_INDEX_SPAN).min(self.size);
            if pos == block_start && block_end <= end {
                acc = fold(acc, pick(self.index_entry(col, block)));
                pos = block_end;
            } else {
                acc = fold(acc, self.raw(col, pos));
                pos += 1;
            }
        }
        Ok(acc)
    }

    /// Sum of column `col` over `[start, end)`.
    pub fn sum(&self, col: usize, start: usize, end: usize) -> Result<u64> {
        self.reduce(col, start, end, |(s, _)| s, u64::wrapping_add)
    }

    /// Maximum of column `col` over `[start, end)`, zero when empty.
    pub fn max(&self, col: usize, start: usize, end: usize) -> Result<u64> {
        self.reduce(col, start, end, |(_, m)| m, u64::max)
    }

    /// The statistic this tree publishes for a column.
    pub fn stat(&self, col: usize, start: usize, end: usize) -> Result<u64> {
        match self.index {
            IndexKind::Sum => self.sum(col, start, end),
            IndexKind::Max => self.max(col, start, end),
        }
    }

    /// Finds the row whose prefix-sum interval contains `target`.
    ///
    /// Returns the row index and the sum of all rows before it, or `None`
    /// when `target` is not below the column total.
    pub fn find_sum(&self, col: usize, target: u64) -> Result<Option<(usize, u64)>> {
        self.check_column(col)?;
        let mut acc = 0u64;
        for block in 0..self.blocks() {
            let (block_sum, _) = self.index_entry(col, block);
            if acc.saturating_add(block_sum) <= target {
                acc += block_sum;
                continue;
            }
            let start = block * FSE_INDEX_SPAN;
            let end = (start + FSE_INDEX_SPAN).min(self.size);
            for idx in start..end {
                let value = self.raw(col, idx);
                if acc + value > target {
                    return Ok(Some((idx, acc)));
                }
                acc += value;
            }
        }
        Ok(None)
    }

    /// Finds the first row whose value in column `col` is at least `key`.
    pub fn find_ge(&self, col: usize, key: u64) -> Result<Option<usize>> {
        self.check_column(col)?;
        for block in 0..self.blocks() {
            let (_, block_max) = self.index_entry(col, block);
            if block_max < key {
                continue;
            }
            let start = block * FSE_INDEX_SPAN;
            let end = (start + FSE_INDEX_SPAN).min(self.size);
            if let Some(idx) = (start..end).find(|&idx| self.raw(col, idx) >= key) {
                return Ok(Some(idx));
            }
        }
        Ok(None)
    }

    pub fn to_data(&self) -> Result<ColumnData> {
        let columns = (0..self.columns)
            .map(|col| (0..self.size).map(|idx| self.raw(col, idx)).collect())
            .collect();
        ColumnData::from_columns(columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(index: IndexKind, rows: &[u64], columns: usize) -> Vec<u8> {
        let mut data = ColumnData::new(columns);
        data.insert_rows(0, rows).unwrap();
        encode(index, &data)
    }

    #[test]
    fn test_encode_layout() {
        let bytes = build(IndexKind::Sum, &[1, 2, 3, 4], 2);
        assert_eq!(bytes.len(), encoded_size(2, 2));
        let view = FseTreeView::parse(&bytes).unwrap();
        assert_eq!(view.size(), 2);
        assert_eq!(view.columns(), 2);
        assert_eq!(view.row(1).unwrap(), vec![3, 4]);
    }

    #[test]
    fn test_sum_and_max_across_blocks() {
        let values: Vec<u64> = (0..100).collect();
        let bytes = build(IndexKind::Max, &values, 1);
        let view = FseTreeView::parse(&bytes).unwrap();

        assert_eq!(view.sum(0, 0, 100).unwrap(), 4950);
        assert_eq!(view.sum(0, 10, 70).unwrap(), (10..70).sum::<u64>());
        assert_eq!(view.max(0, 5, 40).unwrap(), 39);
        assert_eq!(view.max(0, 0, 0).unwrap(), 0);
        assert_eq!(view.stat(0, 0, 100).unwrap(), 99);
    }

    #[test]
    fn test_find_sum() {
        let bytes = build(IndexKind::Sum, &[100, 50, 0, 25], 1);
        let view = FseTreeView::parse(&bytes).unwrap();
        assert_eq!(view.find_sum(0, 0).unwrap(), Some((0, 0)));
        assert_eq!(view.find_sum(0, 99).unwrap(), Some((0, 0)));
        assert_eq!(view.find_sum(0, 100).unwrap(), Some((1, 100)));
        // zero-sized rows are skipped
        assert_eq!(view.find_sum(0, 150).unwrap(), Some((3, 150)));
        assert_eq!(view.find_sum(0, 175).unwrap(), None);
    }

    #[test]
    fn test_find_ge() {
        let values: Vec<u64> = (0..80).map(|v| v * 2).collect();
        let bytes = build(IndexKind::Max, &values, 1);
        let view = FseTreeView::parse(&bytes).unwrap();
        assert_eq!(view.find_ge(0, 0).unwrap(), Some(0));
        assert_eq!(view.find_ge(0, 77).unwrap(), Some(39));
        assert_eq!(view.find_ge(0, 158).unwrap(), Some(79));
        assert_eq!(view.find_ge(0, 159).unwrap(), None);
    }

    #[test]
    fn test_parse_rejects_truncated() {
        let bytes = build(IndexKind::Sum, &[1, 2, 3], 1);
        assert!(FseTreeView::parse(&bytes[..bytes.len() - 8]).is_err());
        assert!(FseTreeView::parse(&bytes[..8]).is_err());
    }

    #[test]
    fn test_bounds_errors() {
        let bytes = build(IndexKind::Sum, &[1, 2], 1);
        let view = FseTreeView::parse(&bytes).unwrap();
        assert!(view.value(1, 0).is_err());
        assert!(view.value(0, 2).is_err());
        assert!(matches!(
            view.sum(0, 1, 3),
            Err(TesseraError::RangeOutOfBounds { .. })
        ));
    }
}
