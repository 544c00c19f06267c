//! Variable-length-element columns: the VLE tree (with sums) and the VLE
//! array (offsets only).
//!
//! ```text
//! +-----------------------------------------------------------------+
//! | size u32 | columns u16 | flags u8 | rsv u8 | blocks u32 | len u32 |  16 bytes
//! +-----------------------------------------------------------------+
//! | column starts: columns x u32, padded to 8                       |
//! +-----------------------------------------------------------------+
//! | index: columns x blocks x entry                                 |
//! |   tree:  (offset u32, rsv u32, sum u64)                         |
//! |   array: (offset u32, rsv u32)                                  |
//! +-----------------------------------------------------------------+
//! | data: LEB128 values, one column after the other                 |
//! +-----------------------------------------------------------------+
//! ```
//!
//! Index offsets are relative to the column start and point at the first
//! value of each block of [`VLE_INDEX_SPAN`] values.

use bytes::{Buf, BufMut};
use tessera_common::{Result, TesseraError};

use super::columns::ColumnData;
use super::{SUBSTREAM_HEADER_SIZE, check_len, u32_at, u64_at};
use crate::allocator::align_up;
use crate::varint::{read_varint, varint_len, write_varint};

/// Values covered by one index entry.
pub const VLE_INDEX_SPAN: usize = 32;

const FLAG_SUMS: u8 = 0x01;

fn blocks_for(size: usize) -> usize {
    size.div_ceil(VLE_INDEX_SPAN)
}

fn entry_size(with_sums: bool) -> usize {
    if with_sums { 16 } else { 8 }
}

fn directory_size(columns: usize) -> usize {
    align_up(4 * columns)
}

/// Encoded size of `data`.
pub fn encoded_size(data: &ColumnData, with_sums: bool) -> usize {
    let data_len: usize = data
        .columns()
        .iter()
        .flat_map(|c| c.iter())
        .map(|&v| varint_len(v))
        .sum();
    SUBSTREAM_HEADER_SIZE
        + directory_size(data.width())
        + entry_size(with_sums) * data.width() * blocks_for(data.len())
        + data_len
}

pub fn encode(data: &ColumnData, with_sums: bool) -> Vec<u8> {
    let columns = data.width();
    let size = data.len();
    let blocks = blocks_for(size);

    let mut payload = Vec::new();
    let mut starts = Vec::with_capacity(columns);
    let mut index = Vec::with_capacity(columns * blocks);
    for column in data.columns() {
        let start = payload.len();
        starts.push(start);
        for chunk in column.chunks(VLE_INDEX_SPAN) {
            let offset = payload.len() - start;
            let sum = chunk.iter().fold(0u64, |acc, &v| acc.wrapping_add(v));
            index.push((offset, sum));
            for &value in chunk {
                write_varint(&mut payload, value);
            }
        }
    }

    let mut out = Vec::with_capacity(encoded_size(data, with_sums));
    out.put_u32_le(size as u32);
    out.put_u16_le(columns as u16);
    out.put_u8(if with_sums { FLAG_SUMS } else { 0 });
    out.put_u8(0);
    out.put_u32_le(blocks as u32);
    out.put_u32_le(payload.len() as u32);

    for start in starts {
        out.put_u32_le(start as u32);
    }
    out.resize(SUBSTREAM_HEADER_SIZE + directory_size(columns), 0);

    for (offset, sum) in index {
        out.put_u32_le(offset as u32);
        out.put_u32_le(0);
        if with_sums {
            out.put_u64_le(sum);
        }
    }
    out.extend_from_slice(&payload);
    out
}

/// Read view over an encoded VLE tree or array.
#[derive(Debug, Clone, Copy)]
pub struct VleView<'a> {
    bytes: &'a [u8],
    size: usize,
    columns: usize,
    with_sums: bool,
    index_start: usize,
    data_start: usize,
    data_len: usize,
}

impl<'a> VleView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        check_len(bytes, SUBSTREAM_HEADER_SIZE, "vle header")?;
        let mut header = bytes;
        let size = header.get_u32_le() as usize;
        let columns = header.get_u16_le() as usize;
        let flags = header.get_u8();
        header.advance(1);
        let blocks = header.get_u32_le() as usize;
        let data_len = header.get_u32_le() as usize;

        if columns == 0 || blocks != blocks_for(size) {
            return Err(TesseraError::PackedCorrupted(format!(
                "vle header is inconsistent: size {}, columns {}, blocks {}",
                size, columns, blocks
            )));
        }
        let with_sums = flags & FLAG_SUMS != 0;
        let index_start = SUBSTREAM_HEADER_SIZE + directory_size(columns);
        let data_start = index_start + entry_size(with_sums) * columns * blocks;
        check_len(bytes, data_start + data_len, "vle body")?;

        Ok(Self {
            bytes,
            size,
            columns,
            with_sums,
            index_start,
            data_start,
            data_len,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn columns(&self) -> usize {
        self.columns
    }

    pub fn has_sums(&self) -> bool {
        self.with_sums
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

    fn column_start(&self, col: usize) -> usize {
        u32_at(self.bytes, SUBSTREAM_HEADER_SIZE + 4 * col) as usize
    }

    fn entry_pos(&self, col: usize, block: usize) -> usize {
        self.index_start + entry_size(self.with_sums) * (col * blocks_for(self.size) + block)
    }

    fn block_offset(&self, col: usize, block: usize) -> usize {
        self.column_start(col) + u32_at(self.bytes, self.entry_pos(col, block)) as usize
    }

    fn block_sum(&self, col: usize, block: usize) -> u64 {
        u64_at(self.bytes, self.entry_pos(col, block) + 8)
    }

    /// Decodes values of column `col` starting at block `block`.
    fn values_from(&self, col: usize, block: usize) -> VleValues<'a> {
        let data = &self.bytes[self.data_start..self.data_start + self.data_len];
        let pos = self.block_offset(col, block);
        VleValues {
            data,
            pos,
            remaining: self.size - block * VLE_INDEX_SPAN,
        }
    }

    pub fn value(&self, col: usize, idx: usize) -> Result<u64> {
        self.check_column(col)?;
        if idx >= self.size {
            return Err(TesseraError::IndexOutOfBounds {
                index: idx,
                size: self.size,
            });
        }
        let block = idx / VLE_INDEX_SPAN;
        self.values_from(col, block)
            .nth(idx % VLE_INDEX_SPAN)
            .unwrap_or_else(|| {
                Err(TesseraError::PackedCorrupted(format!(
                    "vle value {} of column {} is missing",
                    idx, col
                )))
            })
    }

    pub fn row(&self, idx: usize) -> Result<Vec<u64>> {
        (0..self.columns).map(|col| self.value(col, idx)).collect()
    }

    /// Iterates over every value of column `col`.
    pub fn column_values(&self, col: usize) -> Result<VleValues<'a>> {
        self.check_column(col)?;
        let values = if self.size == 0 {
            VleValues {
                data: &[],
                pos: 0,
                remaining: 0,
            }
        } else {
            self.values_from(col, 0)
        };
        Ok(values)
    }

    /// Sum of column `col` over `[0, end)`. Requires the sum index.
    pub fn prefix_sum(&self, col: usize, end: usize) -> Result<u64> {
        self.check_column(col)?;
        if !self.with_sums {
            return Err(TesseraError::InvalidParameter {
                name: "index".to_string(),
                value: "vle array has no sums".to_string(),
            });
        }
        if end > self.size {
            return Err(TesseraError::IndexOutOfBounds {
                index: end,
                size: self.size,
            });
        }
        let full_blocks = end / VLE_INDEX_SPAN;
        let mut acc = (0..full_blocks).fold(0u64, |acc, b| acc.wrapping_add(self.block_sum(col, b)));
        let rem = end % VLE_INDEX_SPAN;
        if rem > 0 {
            for value in self.values_from(col, full_blocks).take(rem) {
                acc = acc.wrapping_add(value?);
            }
        }
        Ok(acc)
    }

    /// Sum of column `col` over `[start, end)`.
    pub fn sum(&self, col: usize, start: usize, end: usize) -> Result<u64> {
        if start > end {
            return Err(TesseraError::RangeOutOfBounds {
                start,
                end,
                size: self.size,
            });
        }
        Ok(self
            .prefix_sum(col, end)?
            .wrapping_sub(self.prefix_sum(col, start)?))
    }

    /// Finds the row whose prefix-sum interval contains `target`.
    pub fn find_sum(&self, col: usize, target: u64) -> Result<Option<(usize, u64)>> {
        self.prefix_sum(col, 0)?;
        let mut acc = 0u64;
        for block in 0..blocks_for(self.size) {
            let block_sum = self.block_sum(col, block);
            if acc.saturating_add(block_sum) <= target {
                acc += block_sum;
                continue;
            }
            let start = block * VLE_INDEX_SPAN;
            for (i, value) in self.values_from(col, block).take(VLE_INDEX_SPAN).enumerate() {
                let value = value?;
                if acc + value > target {
                    return Ok(Some((start + i, acc)));
                }
                acc += value;
            }
        }
        Ok(None)
    }

    pub fn to_data(&self) -> Result<ColumnData> {
        let mut columns = Vec::with_capacity(self.columns);
        for col in 0..self.columns {
            columns.push(self.column_values(col)?.collect::<Result<Vec<u64>>>()?);
        }
        ColumnData::from_columns(columns)
    }
}

/// Sequential decoder over one column.
pub struct VleValues<'a> {
    data: &'a [u8],
    pos: usize,
    remaining: usize,
}

impl Iterator for VleValues<'_> {
    type Item = Result<u64>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let slice = self.data.get(self.pos..).unwrap_or(&[]);
        match read_varint(slice) {
            Ok((value, len)) => {
                self.pos += len;
                Some(Ok(value))
            }
            Err(e) => {
                self.remaining = 0;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(rows: &[u64], columns: usize, with_sums: bool) -> Vec<u8> {
        let mut data = ColumnData::new(columns);
        data.insert_rows(0, rows).unwrap();
        encode(&data, with_sums)
    }

    #[test]
    fn test_encoded_size_matches() {
        let mut data = ColumnData::new(2);
        data.insert_rows(0, &[1, 300, 70000, 5]).unwrap();
        assert_eq!(encode(&data, true).len(), encoded_size(&data, true));
        assert_eq!(encode(&data, false).len(), encoded_size(&data, false));
    }

    #[test]
    fn test_values_across_blocks() {
        let values: Vec<u64> = (0..100).map(|v| v * 1000).collect();
        let bytes = build(&values, 1, true);
        let view = VleView::parse(&bytes).unwrap();
        assert_eq!(view.size(), 100);
        for (idx, expected) in values.iter().enumerate() {
            assert_eq!(view.value(0, idx).unwrap(), *expected);
        }
        assert_eq!(view.sum(0, 0, 100).unwrap(), values.iter().sum::<u64>());
        assert_eq!(view.sum(0, 33, 65).unwrap(), values[33..65].iter().sum::<u64>());
    }

    #[test]
    fn test_find_sum() {
        let bytes = build(&[100, 50, 25], 1, true);
        let view = VleView::parse(&bytes).unwrap();
        assert_eq!(view.find_sum(0, 120).unwrap(), Some((1, 100)));
        assert_eq!(view.find_sum(0, 175).unwrap(), None);
    }

    #[test]
    fn test_array_has_no_sums() {
        let bytes = build(&[7, 8, u64::MAX], 1, false);
        let view = VleView::parse(&bytes).unwrap();
        assert!(!view.has_sums());
        assert_eq!(view.value(0, 2).unwrap(), u64::MAX);
        assert!(view.sum(0, 0, 3).is_err());
    }

    #[test]
    fn test_multi_column_rows() {
        let bytes = build(&[1, 2, 3, 4, 5, 6], 3, false);
        let view = VleView::parse(&bytes).unwrap();
        assert_eq!(view.row(1).unwrap(), vec![4, 5, 6]);
        assert_eq!(view.to_data().unwrap().column(2), &[3, 6]);
    }

    #[test]
    fn test_empty_column() {
        let bytes = build(&[], 1, true);
        let view = VleView::parse(&bytes).unwrap();
        assert_eq!(view.size(), 0);
        assert_eq!(view.prefix_sum(0, 0).unwrap(), 0);
        assert_eq!(view.to_data().unwrap().len(), 0);
    }
}
