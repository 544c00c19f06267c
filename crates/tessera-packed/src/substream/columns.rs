//! Owned column-major rows shared by the column-oriented substreams.

use tessera_common::{Result, TesseraError};

/// Rows of `columns.len()` values, stored one vector per column.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ColumnData {
    columns: Vec<Vec<u64>>,
}

impl ColumnData {
    pub fn new(columns: usize) -> Self {
        Self {
            columns: vec![Vec::new(); columns],
        }
    }

    pub fn from_columns(columns: Vec<Vec<u64>>) -> Result<Self> {
        if let Some(first) = columns.first() {
            let len = first.len();
            if columns.iter().any(|c| c.len() != len) {
                return Err(TesseraError::PackedCorrupted(
                    "columns have different lengths".to_string(),
                ));
            }
        }
        Ok(Self { columns })
    }

    pub fn width(&self) -> usize {
        self.columns.len()
    }

    pub fn len(&self) -> usize {
        self.columns.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn column(&self, col: usize) -> &[u64] {
        &self.columns[col]
    }

    pub fn columns(&self) -> &[Vec<u64>] {
        &self.columns
    }

    fn check_range(&self, start: usize, end: usize) -> Result<()> {
        if start > end || end > self.len() {
            return Err(TesseraError::RangeOutOfBounds {
                start,
                end,
                size: self.len(),
            });
        }
        Ok(())
    }

    /// Inserts row-major `rows` before row `at`.
    pub fn insert_rows(&mut self, at: usize, rows: &[u64]) -> Result<()> {
        let width = self.width();
        if at > self.len() {
            return Err(TesseraError::IndexOutOfBounds {
                index: at,
                size: self.len(),
            });
        }
        if width == 0 || rows.len() % width != 0 {
            return Err(TesseraError::InvalidParameter {
                name: "rows".to_string(),
                value: format!("{} values for {} columns", rows.len(), width),
            });
        }
        for (col, column) in self.columns.iter_mut().enumerate() {
            let values = rows.iter().skip(col).step_by(width).copied();
            column.splice(at..at, values);
        }
        Ok(())
    }

    pub fn remove(&mut self, start: usize, end: usize) -> Result<()> {
        self.check_range(start, end)?;
        for column in &mut self.columns {
            column.drain(start..end);
        }
        Ok(())
    }

    /// Moves rows `[at, len)` into a new value.
    pub fn split_off(&mut self, at: usize) -> Result<Self> {
        self.check_range(at, self.len())?;
        Ok(Self {
            columns: self.columns.iter_mut().map(|c| c.split_off(at)).collect(),
        })
    }

    pub fn append(&mut self, mut other: ColumnData) -> Result<()> {
        if other.width() != self.width() {
            return Err(TesseraError::InvalidParameter {
                name: "columns".to_string(),
                value: format!("{} != {}", other.width(), self.width()),
            });
        }
        for (column, tail) in self.columns.iter_mut().zip(other.columns.iter_mut()) {
            column.append(tail);
        }
        Ok(())
    }

    pub fn row(&self, idx: usize) -> Result<Vec<u64>> {
        if idx >= self.len() {
            return Err(TesseraError::IndexOutOfBounds {
                index: idx,
                size: self.len(),
            });
        }
        Ok(self.columns.iter().map(|c| c[idx]).collect())
    }

    pub fn set_row(&mut self, idx: usize, row: &[u64]) -> Result<()> {
        if idx >= self.len() {
            return Err(TesseraError::IndexOutOfBounds {
                index: idx,
                size: self.len(),
            });
        }
        if row.len() != self.width() {
            return Err(TesseraError::InvalidParameter {
                name: "row".to_string(),
                value: format!("{} values for {} columns", row.len(), self.width()),
            });
        }
        for (column, &value) in self.columns.iter_mut().zip(row) {
            column[idx] = value;
        }
        Ok(())
    }
}
