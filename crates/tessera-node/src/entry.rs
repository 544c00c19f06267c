//! Branch node entries: the per-child statistics a branch keeps.

use std::fmt;
use std::ops::Range;

use tessera_common::{Result, TesseraError};
use tessera_packed::{IndexKind, SubstreamDescriptor};

/// How one entry slot combines across children.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotKind {
    /// Number of entries of a leaf stream.
    Size,
    /// Sum of a published statistic.
    Sum,
    /// Maximum of a published statistic.
    Max,
}

impl SlotKind {
    fn combine(&self, acc: u64, value: u64) -> u64 {
        match self {
            SlotKind::Size | SlotKind::Sum => acc.wrapping_add(value),
            SlotKind::Max => acc.max(value),
        }
    }
}

/// Translation from leaf streams to branch entry slots.
///
/// Each leaf stream owns a contiguous slot range: its size followed by
/// the statistics it publishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryLayout {
    slots: Vec<SlotKind>,
    offsets: Vec<usize>,
}

impl EntryLayout {
    pub fn for_streams(streams: &[SubstreamDescriptor]) -> Self {
        let mut slots = Vec::new();
        let mut offsets = Vec::with_capacity(streams.len() + 1);
        for desc in streams {
            offsets.push(slots.len());
            slots.push(SlotKind::Size);
            let stat = match desc.params.stat_kind(desc.kind) {
                IndexKind::Sum => SlotKind::Sum,
                IndexKind::Max => SlotKind::Max,
            };
            slots.extend(std::iter::repeat_n(stat, desc.stat_width()));
        }
        offsets.push(slots.len());
        Self { slots, offsets }
    }

    /// Total number of slots.
    pub fn width(&self) -> usize {
        self.slots.len()
    }

    pub fn streams(&self) -> usize {
        self.offsets.len() - 1
    }

    pub fn slots(&self) -> &[SlotKind] {
        &self.slots
    }

    /// Slot range of leaf stream `stream`.
    pub fn stream_range(&self, stream: usize) -> Result<Range<usize>> {
        if stream >= self.streams() {
            return Err(TesseraError::InvalidSubstream(stream));
        }
        Ok(self.offsets[stream]..self.offsets[stream + 1])
    }

    /// Slot kinds of leaf stream `stream`.
    pub fn stream_slots(&self, stream: usize) -> Result<&[SlotKind]> {
        Ok(&self.slots[self.stream_range(stream)?])
    }
}

/// Statistics of one subtree, laid out per [`EntryLayout`].
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BranchNodeEntry {
    values: Vec<u64>,
}

impl BranchNodeEntry {
    pub fn zero(layout: &EntryLayout) -> Self {
        Self {
            values: vec![0; layout.width()],
        }
    }

    pub fn from_values(values: Vec<u64>) -> Self {
        Self { values }
    }

    pub fn values(&self) -> &[u64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Folds `other` into `self` slot by slot.
    pub fn accumulate(&mut self, other: &BranchNodeEntry, layout: &EntryLayout) -> Result<()> {
        self.check_width(layout)?;
        other.check_width(layout)?;
        for (slot, (acc, value)) in layout
            .slots()
            .iter()
            .zip(self.values.iter_mut().zip(other.values.iter()))
        {
            *acc = slot.combine(*acc, *value);
        }
        Ok(())
    }

    /// Folds the values of one stream into its slots.
    pub fn accumulate_stream(
        &mut self,
        stream: usize,
        values: &[u64],
        layout: &EntryLayout,
    ) -> Result<()> {
        self.check_width(layout)?;
        let range = layout.stream_range(stream)?;
        if values.len() != range.len() {
            return Err(TesseraError::InvalidParameter {
                name: "stream values".to_string(),
                value: format!("{} for {} slots", values.len(), range.len()),
            });
        }
        for (pos, value) in range.zip(values) {
            self.values[pos] = layout.slots()[pos].combine(self.values[pos], *value);
        }
        Ok(())
    }

    /// Size slot of `stream`.
    pub fn size(&self, stream: usize, layout: &EntryLayout) -> Result<u64> {
        let range = layout.stream_range(stream)?;
        self.values
            .get(range.start)
            .copied()
            .ok_or(TesseraError::IndexOutOfBounds {
                index: range.start,
                size: self.values.len(),
            })
    }

    /// Slots of `stream`.
    pub fn stream(&self, stream: usize, layout: &EntryLayout) -> Result<&[u64]> {
        self.check_width(layout)?;
        Ok(&self.values[layout.stream_range(stream)?])
    }

    pub fn set_stream(&mut self, stream: usize, values: &[u64], layout: &EntryLayout) -> Result<()> {
        self.check_width(layout)?;
        let range = layout.stream_range(stream)?;
        if values.len() != range.len() {
            return Err(TesseraError::InvalidParameter {
                name: "stream values".to_string(),
                value: format!("{} for {} slots", values.len(), range.len()),
            });
        }
        self.values[range].copy_from_slice(values);
        Ok(())
    }

    fn check_width(&self, layout: &EntryLayout) -> Result<()> {
        if self.values.len() != layout.width() {
            return Err(TesseraError::InvalidParameter {
                name: "entry width".to_string(),
                value: format!("{} != {}", self.values.len(), layout.width()),
            });
        }
        Ok(())
    }
}

impl fmt::Display for BranchNodeEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[")?;
        for (idx, value) in self.values.iter().enumerate() {
            if idx > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{}", value)?;
        }
        f.write_str("]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_packed::{SubstreamKind, SubstreamParams};

    fn layout() -> EntryLayout {
        EntryLayout::for_streams(&[
            SubstreamDescriptor::new(
                SubstreamKind::FseTree,
                0,
                SubstreamParams::columns(1).with_index(IndexKind::Max),
            ),
            SubstreamDescriptor::seq(0, 1),
            SubstreamDescriptor::block_ids(1),
        ])
    }

    #[test]
    fn test_slot_translation() {
        let layout = layout();
        assert_eq!(layout.width(), 6);
        assert_eq!(layout.stream_range(0).unwrap(), 0..2);
        assert_eq!(layout.stream_range(1).unwrap(), 2..5);
        assert_eq!(layout.stream_range(2).unwrap(), 5..6);
        assert_eq!(
            layout.stream_slots(1).unwrap(),
            &[SlotKind::Size, SlotKind::Sum, SlotKind::Sum]
        );
        assert_eq!(layout.stream_slots(0).unwrap(), &[SlotKind::Size, SlotKind::Max]);
        assert!(layout.stream_range(3).is_err());
    }

    #[test]
    fn test_accumulate_adds_sizes_and_takes_max() {
        let layout = layout();
        let mut acc = BranchNodeEntry::zero(&layout);
        acc.accumulate(&BranchNodeEntry::from_values(vec![3, 40, 3, 2, 1, 1]), &layout)
            .unwrap();
        acc.accumulate(&BranchNodeEntry::from_values(vec![2, 10, 2, 0, 2, 1]), &layout)
            .unwrap();
        assert_eq!(acc.values(), &[5, 40, 5, 2, 3, 2]);
        assert_eq!(acc.size(1, &layout).unwrap(), 5);
        assert_eq!(acc.to_string(), "[5, 40, 5, 2, 3, 2]");
    }

    #[test]
    fn test_stream_slots() {
        let layout = layout();
        let mut entry = BranchNodeEntry::zero(&layout);
        entry.set_stream(1, &[4, 1, 3], &layout).unwrap();
        entry.accumulate_stream(0, &[2, 9], &layout).unwrap();
        entry.accumulate_stream(0, &[1, 4], &layout).unwrap();
        assert_eq!(entry.stream(0, &layout).unwrap(), &[3, 9]);
        assert_eq!(entry.stream(1, &layout).unwrap(), &[4, 1, 3]);
        assert!(entry.set_stream(2, &[1, 2], &layout).is_err());
    }

    #[test]
    fn test_width_mismatch_is_an_error() {
        let layout = layout();
        let mut entry = BranchNodeEntry::from_values(vec![1, 2]);
        assert!(entry.accumulate(&BranchNodeEntry::zero(&layout), &layout).is_err());
    }
}
