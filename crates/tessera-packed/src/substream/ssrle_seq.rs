//! Run-length encoded symbol sequence built on SSRLE segments.
//!
//! ```text
//! +--------------------------------------------------------+
//! | size u64 | bps u8 | rsv [u8; 3] | segments u32          |  16 bytes
//! +--------------------------------------------------------+
//! | index: groups x (symbols u64, counts[2^bps] u64)        |
//! +--------------------------------------------------------+
//! | segments x 32 code units (u16)                          |
//! +--------------------------------------------------------+
//! ```
//!
//! One index group summarizes [`SSRLE_GROUP_SEGMENTS`] consecutive segments.
//! Runs never cross a segment boundary.

use bytes::{Buf, BufMut};
use tessera_common::{Result, TesseraError};
use tessera_ssrle::{
    RunTraits, SEGMENT_UNITS, SsrleRun, SymbolCmp, compactify_runs, decode_segment, read_runs,
    total_length, write_segments_to,
};

use super::{SUBSTREAM_HEADER_SIZE, check_len, u64_at};

/// Segments summarized by one index group.
pub const SSRLE_GROUP_SEGMENTS: usize = 4;

fn groups_for(segments: usize) -> usize {
    segments.div_ceil(SSRLE_GROUP_SEGMENTS)
}

fn index_size(segments: usize, alphabet: usize) -> usize {
    8 * groups_for(segments) * (1 + alphabet)
}

/// Encoded image of one full index group left unchanged since decoding.
#[derive(Debug, Clone)]
struct CleanGroup {
    units: Vec<u16>,
    /// Runs the group's segments hold.
    runs: usize,
    /// Index entry: symbols, then per-symbol counts.
    stats: Vec<u64>,
}

/// Leading groups whose encoding still matches the run list.
#[derive(Debug, Clone, Default)]
struct CleanPrefix {
    groups: Vec<CleanGroup>,
}

impl CleanPrefix {
    fn runs(&self) -> usize {
        self.groups.iter().map(|g| g.runs).sum()
    }

    /// Drops the groups holding run `first_changed` or later.
    fn truncate_to(&mut self, first_changed: usize) {
        let mut end = 0;
        let keep = self
            .groups
            .iter()
            .take_while(|g| {
                end += g.runs;
                end <= first_changed
            })
            .count();
        self.groups.truncate(keep);
    }
}

/// Index entry of one group of segments.
fn group_stats(units: &[u16], traits: &RunTraits) -> Result<Vec<u64>> {
    let mut stats = vec![0u64; 1 + traits.symbols()];
    for segment in units.chunks(SEGMENT_UNITS) {
        for run in decode_segment(segment, traits)? {
            stats[0] += run.full_run_length();
            for (s, c) in stats[1..].iter_mut().enumerate() {
                *c += run.full_rank(s as u64, SymbolCmp::Eq, traits);
            }
        }
    }
    Ok(stats)
}

/// Owned run list of an SSRLE sequence.
///
/// Edits split or merge only the runs around the edit point. Data decoded
/// from an encoding remembers the image of its leading index groups, and
/// [`encode`](Self::encode) rewrites segments from the first group an
/// edit touched onward.
#[derive(Debug, Clone)]
pub struct SsrleSeqData {
    traits: RunTraits,
    runs: Vec<SsrleRun>,
    clean: CleanPrefix,
}

impl PartialEq for SsrleSeqData {
    fn eq(&self, other: &Self) -> bool {
        self.traits == other.traits
            && compactify_runs(&self.runs, &self.traits)
                == compactify_runs(&other.runs, &other.traits)
    }
}

impl Eq for SsrleSeqData {}

impl SsrleSeqData {
    pub fn new(bps: usize) -> Result<Self> {
        Ok(Self {
            traits: RunTraits::new(bps)?,
            runs: Vec::new(),
            clean: CleanPrefix::default(),
        })
    }

    pub fn from_runs(traits: RunTraits, runs: Vec<SsrleRun>) -> Self {
        Self {
            runs: compactify_runs(&runs, &traits),
            traits,
            clean: CleanPrefix::default(),
        }
    }

    pub fn traits(&self) -> &RunTraits {
        &self.traits
    }

    pub fn runs(&self) -> &[SsrleRun] {
        &self.runs
    }

    pub fn len(&self) -> usize {
        total_length(&self.runs) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Runs whose encoding is reused by the next [`encode`](Self::encode).
    pub fn clean_runs(&self) -> usize {
        self.clean.runs()
    }

    fn check_symbol(&self, symbol: u64) -> Result<()> {
        if symbol > self.traits.symbol_mask() {
            return Err(TesseraError::InvalidParameter {
                name: "symbol".to_string(),
                value: symbol.to_string(),
            });
        }
        Ok(())
    }

    /// Run holding symbol `pos` and the symbols before it. The end of the
    /// sequence maps to one past the last run.
    fn find_run(&self, pos: u64) -> (usize, u64) {
        let mut base = 0u64;
        for (idx, run) in self.runs.iter().enumerate() {
            let len = run.full_run_length();
            if pos < base + len {
                return (idx, base);
            }
            base += len;
        }
        (self.runs.len(), base)
    }

    /// Replaces `runs[from..to]` by `pieces`, merging them with one
    /// neighbour on each side.
    fn splice(&mut self, from: usize, to: usize, pieces: Vec<SsrleRun>) {
        let lo = from.saturating_sub(1);
        let hi = (to + 1).min(self.runs.len());
        let mut window = self.runs[lo..from].to_vec();
        window.extend(pieces);
        window.extend_from_slice(&self.runs[to..hi]);
        let window = compactify_runs(&window, &self.traits);
        self.runs.splice(lo..hi, window);
        self.clean.truncate_to(lo);
    }

    /// Runs covering symbols `[start, end)`.
    pub fn extract(&self, start: usize, end: usize) -> Result<Vec<SsrleRun>> {
        let size = self.len();
        if start > end || end > size {
            return Err(TesseraError::RangeOutOfBounds { start, end, size });
        }
        let (start, end) = (start as u64, end as u64);
        let mut out = Vec::new();
        let mut base = 0u64;
        for run in &self.runs {
            let len = run.full_run_length();
            let (lo, hi) = (start.max(base), end.min(base + len));
            if lo < hi {
                run.extract_to(&mut out, lo - base, hi - lo, &self.traits)?;
            }
            base += len;
            if base >= end {
                break;
            }
        }
        Ok(out)
    }

    /// Inserts `run` before symbol `at`.
    pub fn insert_run(&mut self, at: usize, run: SsrleRun) -> Result<()> {
        let size = self.len();
        if at > size {
            return Err(TesseraError::IndexOutOfBounds { index: at, size });
        }
        if run.is_empty() {
            return Ok(());
        }
        let (idx, base) = self.find_run(at as u64);
        if idx == self.runs.len() {
            self.splice(idx, idx, vec![run]);
        } else {
            let pieces = self.runs[idx].insert(&run, at as u64 - base, &self.traits)?;
            self.splice(idx, idx + 1, pieces);
        }
        Ok(())
    }

    /// Inserts individual symbols before position `at`.
    pub fn insert_symbols(&mut self, at: usize, symbols: &[u64]) -> Result<()> {
        for &symbol in symbols {
            self.check_symbol(symbol)?;
        }
        let size = self.len();
        if at > size {
            return Err(TesseraError::IndexOutOfBounds { index: at, size });
        }
        if symbols.is_empty() {
            return Ok(());
        }
        let runs: Vec<SsrleRun> = symbols.iter().map(|&s| SsrleRun::repeated(s, 1)).collect();
        let runs = compactify_runs(&runs, &self.traits);

        let (idx, base) = self.find_run(at as u64);
        if idx == self.runs.len() {
            self.splice(idx, idx, runs);
        } else {
            let split = self.runs[idx].split(at as u64 - base, &self.traits)?;
            let mut pieces = split.left;
            pieces.extend(runs);
            pieces.extend(split.right);
            self.splice(idx, idx + 1, pieces);
        }
        Ok(())
    }

    pub fn remove(&mut self, start: usize, end: usize) -> Result<()> {
        let size = self.len();
        if start > end || end > size {
            return Err(TesseraError::RangeOutOfBounds { start, end, size });
        }
        if start == end {
            return Ok(());
        }
        let (first, first_base) = self.find_run(start as u64);
        let (last, last_base) = self.find_run(end as u64 - 1);
        let mut pieces = Vec::new();
        self.runs[first].extract_to(&mut pieces, 0, start as u64 - first_base, &self.traits)?;
        let last_run = self.runs[last];
        let cut = end as u64 - last_base;
        last_run.extract_to(&mut pieces, cut, last_run.full_run_length() - cut, &self.traits)?;
        self.splice(first, last + 1, pieces);
        Ok(())
    }

    pub fn split_off(&mut self, at: usize) -> Result<Self> {
        let size = self.len();
        if at > size {
            return Err(TesseraError::IndexOutOfBounds { index: at, size });
        }
        let mut tail = Self {
            traits: self.traits,
            runs: Vec::new(),
            clean: CleanPrefix::default(),
        };
        let (idx, base) = self.find_run(at as u64);
        if idx == self.runs.len() {
            return Ok(tail);
        }
        let split = self.runs[idx].split(at as u64 - base, &self.traits)?;
        tail.runs = self.runs.split_off(idx + 1);
        tail.splice(0, 0, split.right);
        self.splice(idx, idx + 1, split.left);
        Ok(tail)
    }

    pub fn append(&mut self, other: SsrleSeqData) -> Result<()> {
        if other.traits != self.traits {
            return Err(TesseraError::InvalidParameter {
                name: "symbol_bits".to_string(),
                value: other.traits.bps().to_string(),
            });
        }
        let junction = self.runs.len();
        self.runs.extend(other.runs);
        self.splice(junction, junction, Vec::new());
        Ok(())
    }

    pub fn symbol(&self, idx: usize) -> Result<u64> {
        let (run, base) = self.find_run(idx as u64);
        match self.runs.get(run) {
            Some(run) => run.symbol(idx as u64 - base, &self.traits),
            None => Err(TesseraError::IndexOutOfBounds {
                index: idx,
                size: base as usize,
            }),
        }
    }

    pub fn set_symbol(&mut self, idx: usize, symbol: u64) -> Result<()> {
        self.check_symbol(symbol)?;
        let size = self.len();
        if idx >= size {
            return Err(TesseraError::IndexOutOfBounds { index: idx, size });
        }
        self.remove(idx, idx + 1)?;
        self.insert_symbols(idx, &[symbol])
    }

    pub fn encoded_size(&self) -> Result<usize> {
        Ok(self.encode()?.len())
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        let fresh = write_segments_to(&self.runs[self.clean.runs()..], &self.traits)?;
        let group_units = SSRLE_GROUP_SEGMENTS * SEGMENT_UNITS;
        let mut stats: Vec<Vec<u64>> = self.clean.groups.iter().map(|g| g.stats.clone()).collect();
        for group in fresh.chunks(group_units) {
            stats.push(group_stats(group, &self.traits)?);
        }
        let clean_units = self.clean.groups.len() * group_units;
        let segments = (clean_units + fresh.len()) / SEGMENT_UNITS;
        let alphabet = self.traits.symbols();

        let mut out = Vec::with_capacity(
            SUBSTREAM_HEADER_SIZE + index_size(segments, alphabet) + 2 * (clean_units + fresh.len()),
        );
        out.put_u64_le(total_length(&self.runs));
        out.put_u8(self.traits.bps() as u8);
        out.put_bytes(0, 3);
        out.put_u32_le(segments as u32);
        for value in stats.into_iter().flatten() {
            out.put_u64_le(value);
        }
        for group in &self.clean.groups {
            for &unit in &group.units {
                out.put_u16_le(unit);
            }
        }
        for unit in fresh {
            out.put_u16_le(unit);
        }
        Ok(out)
    }
}

/// Read view over an encoded SSRLE sequence.
#[derive(Debug, Clone, Copy)]
pub struct SsrleSeqView<'a> {
    bytes: &'a [u8],
    size: usize,
    traits: RunTraits,
    segments: usize,
}

impl<'a> SsrleSeqView<'a> {
    pub fn parse(bytes: &'a [u8]) -> Result<Self> {
        check_len(bytes, SUBSTREAM_HEADER_SIZE, "ssrle header")?;
        let mut header = bytes;
        let size = header.get_u64_le() as usize;
        let traits = RunTraits::new(header.get_u8() as usize)?;
        header.advance(3);
        let segments = header.get_u32_le() as usize;

        let expected = SUBSTREAM_HEADER_SIZE
            + index_size(segments, traits.symbols())
            + 2 * segments * SEGMENT_UNITS;
        check_len(bytes, expected, "ssrle body")?;
        Ok(Self {
            bytes,
            size,
            traits,
            segments,
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn traits(&self) -> &RunTraits {
        &self.traits
    }

    pub fn alphabet(&self) -> usize {
        self.traits.symbols()
    }

    fn groups(&self) -> usize {
        groups_for(self.segments)
    }

    fn group_entry(&self, group: usize, slot: usize) -> u64 {
        let pos = SUBSTREAM_HEADER_SIZE + 8 * (group * (1 + self.alphabet()) + slot);
        u64_at(self.bytes, pos)
    }

    fn group_len(&self, group: usize) -> u64 {
        self.group_entry(group, 0)
    }

    fn group_count(&self, group: usize, symbol: u64) -> u64 {
        self.group_entry(group, 1 + symbol as usize)
    }

    fn units_from(&self, first_segment: usize, segments: usize) -> Vec<u16> {
        let start = SUBSTREAM_HEADER_SIZE
            + index_size(self.segments, self.alphabet())
            + 2 * first_segment * SEGMENT_UNITS;
        let end = start + 2 * segments * SEGMENT_UNITS;
        self.bytes[start..end]
            .chunks_exact(2)
            .map(|c| u16::from_le_bytes([c[0], c[1]]))
            .collect()
    }

    fn group_runs(&self, group: usize) -> Result<Vec<SsrleRun>> {
        let first = group * SSRLE_GROUP_SEGMENTS;
        let count = SSRLE_GROUP_SEGMENTS.min(self.segments - first);
        read_runs(&self.units_from(first, count), &self.traits)
    }

    /// Every run of the sequence.
    pub fn runs(&self) -> Result<Vec<SsrleRun>> {
        read_runs(&self.units_from(0, self.segments), &self.traits)
    }

    fn check_symbol(&self, symbol: u64) -> Result<()> {
        if symbol > self.traits.symbol_mask() {
            return Err(TesseraError::InvalidParameter {
                name: "symbol".to_string(),
                value: symbol.to_string(),
            });
        }
        Ok(())
    }

    /// Finds the group holding position `pos` and the symbols before it.
    fn locate(&self, pos: u64) -> Option<(usize, u64)> {
        let mut base = 0u64;
        for group in 0..self.groups() {
            let len = self.group_len(group);
            if pos < base + len {
                return Some((group, base));
            }
            base += len;
        }
        None
    }

    pub fn symbol(&self, idx: usize) -> Result<u64> {
        let pos = idx as u64;
        let (group, mut base) = self.locate(pos).ok_or(TesseraError::IndexOutOfBounds {
            index: idx,
            size: self.size,
        })?;
        for run in self.group_runs(group)? {
            let len = run.full_run_length();
            if pos < base + len {
                return run.symbol(pos - base, &self.traits);
            }
            base += len;
        }
        Err(TesseraError::PackedCorrupted(format!(
            "ssrle index points past the runs for position {}",
            idx
        )))
    }

    /// Occurrences of `symbol` per the comparison `cmp` in `[0, idx)`.
    pub fn rank(&self, idx: usize, symbol: u64, cmp: SymbolCmp) -> Result<u64> {
        self.check_symbol(symbol)?;
        if idx > self.size {
            return Err(TesseraError::IndexOutOfBounds {
                index: idx,
                size: self.size,
            });
        }
        let target = idx as u64;
        let alphabet = self.alphabet() as u64;
        let mut rank = 0u64;
        let mut base = 0u64;
        for group in 0..self.groups() {
            let len = self.group_len(group);
            if base + len <= target {
                rank += (0..alphabet)
                    .filter(|&s| cmp.matches(s, symbol))
                    .map(|s| self.group_count(group, s))
                    .sum::<u64>();
                base += len;
                continue;
            }
            for run in self.group_runs(group)? {
                let len = run.full_run_length();
                if base + len <= target {
                    rank += run.full_rank(symbol, cmp, &self.traits);
                    base += len;
                } else {
                    rank += run.rank(target - base, symbol, cmp, &self.traits)?;
                    break;
                }
            }
            break;
        }
        Ok(rank)
    }

    pub fn rank_eq(&self, idx: usize, symbol: u64) -> Result<u64> {
        self.rank(idx, symbol, SymbolCmp::Eq)
    }

    /// Position of the matching symbol preceded by `rank` other matches.
    pub fn select(&self, rank: u64, symbol: u64, cmp: SymbolCmp) -> Result<Option<usize>> {
        self.check_symbol(symbol)?;
        let alphabet = self.alphabet() as u64;
        let mut remaining = rank;
        let mut base = 0u64;
        for group in 0..self.groups() {
            let count: u64 = (0..alphabet)
                .filter(|&s| cmp.matches(s, symbol))
                .map(|s| self.group_count(group, s))
                .sum();
            if remaining >= count {
                remaining -= count;
                base += self.group_len(group);
                continue;
            }
            for run in self.group_runs(group)? {
                if let Some(pos) = run.select_fw(remaining, symbol, cmp, &self.traits) {
                    return Ok(Some((base + pos) as usize));
                }
                remaining -= run.full_rank(symbol, cmp, &self.traits);
                base += run.full_run_length();
            }
            return Err(TesseraError::PackedCorrupted(format!(
                "ssrle group {} counts disagree with its runs",
                group
            )));
        }
        Ok(None)
    }

    pub fn select_eq(&self, rank: u64, symbol: u64) -> Result<Option<usize>> {
        self.select(rank, symbol, SymbolCmp::Eq)
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
        (0..self.alphabet() as u64)
            .map(|s| Ok(self.rank_eq(end, s)? - self.rank_eq(start, s)?))
            .collect()
    }

    /// Decodes the run list, keeping the image of every full group.
    pub fn to_data(&self) -> Result<SsrleSeqData> {
        let mut runs = Vec::new();
        let mut clean = CleanPrefix::default();
        for group in 0..self.groups() {
            let group_runs = self.group_runs(group)?;
            let first = group * SSRLE_GROUP_SEGMENTS;
            if self.segments - first >= SSRLE_GROUP_SEGMENTS {
                clean.groups.push(CleanGroup {
                    units: self.units_from(first, SSRLE_GROUP_SEGMENTS),
                    runs: group_runs.len(),
                    stats: (0..=self.alphabet()).map(|slot| self.group_entry(group, slot)).collect(),
                });
            }
            runs.extend(group_runs);
        }
        Ok(SsrleSeqData {
            traits: self.traits,
            runs,
            clean,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(bps: usize) -> (SsrleSeqData, Vec<u64>) {
        let mut data = SsrleSeqData::new(bps).unwrap();
        let mut expected = Vec::new();
        let mask = (1u64 << bps) - 1;
        for i in 0..300u64 {
            let symbol = (i / 7) & mask;
            let count = 1 + (i % 5);
            let at = expected.len();
            data.insert_run(at, SsrleRun::repeated(symbol, count)).unwrap();
            expected.extend(std::iter::repeat_n(symbol, count as usize));
        }
        (data, expected)
    }

    #[test]
    fn test_encode_and_read_back() {
        let (data, expected) = sample(2);
        let bytes = data.encode().unwrap();
        let view = SsrleSeqView::parse(&bytes).unwrap();
        assert_eq!(view.size(), expected.len());
        for idx in [0, 1, 100, expected.len() - 1] {
            assert_eq!(view.symbol(idx).unwrap(), expected[idx]);
        }
        assert_eq!(view.to_data().unwrap(), data);
    }

    #[test]
    fn test_rank_and_select() {
        let (data, expected) = sample(4);
        let bytes = data.encode().unwrap();
        let view = SsrleSeqView::parse(&bytes).unwrap();
        for idx in [0, 5, 250, 600, expected.len()] {
            for sym in [0u64, 3, 9] {
                let scan = expected[..idx].iter().filter(|&&s| s == sym).count() as u64;
                assert_eq!(view.rank_eq(idx, sym).unwrap(), scan);
            }
        }
        let idx = 401;
        let sym = expected[idx];
        let rank = view.rank_eq(idx, sym).unwrap();
        assert_eq!(view.select_eq(rank, sym).unwrap(), Some(idx));
        let total = view.rank_eq(expected.len(), sym).unwrap();
        assert_eq!(view.select_eq(total, sym).unwrap(), None);
    }

    #[test]
    fn test_rank_with_comparison() {
        let (data, expected) = sample(2);
        let bytes = data.encode().unwrap();
        let view = SsrleSeqView::parse(&bytes).unwrap();
        let idx = expected.len() / 2;
        let lt = expected[..idx].iter().filter(|&&s| s < 2).count() as u64;
        assert_eq!(view.rank(idx, 2, SymbolCmp::Lt).unwrap(), lt);
    }

    #[test]
    fn test_insert_symbols_and_remove() {
        let mut data = SsrleSeqData::new(1).unwrap();
        data.insert_symbols(0, &[1, 1, 1, 0, 0]).unwrap();
        data.insert_symbols(2, &[0]).unwrap();
        let symbols: Vec<u64> = (0..data.len()).map(|i| data.symbol(i).unwrap()).collect();
        assert_eq!(symbols, vec![1, 1, 0, 1, 0, 0]);

        data.remove(1, 4).unwrap();
        let symbols: Vec<u64> = (0..data.len()).map(|i| data.symbol(i).unwrap()).collect();
        assert_eq!(symbols, vec![1, 0, 0]);
        assert!(data.insert_symbols(0, &[2]).is_err());
    }

    #[test]
    fn test_split_off_and_append() {
        let (mut data, expected) = sample(1);
        let tail = data.split_off(100).unwrap();
        assert_eq!(data.len(), 100);
        assert_eq!(tail.len(), expected.len() - 100);
        data.append(tail).unwrap();
        let restored: Vec<u64> = (0..data.len()).map(|i| data.symbol(i).unwrap()).collect();
        assert_eq!(restored, expected);
    }

    #[test]
    fn test_long_run_is_compact() {
        let mut data = SsrleSeqData::new(8).unwrap();
        data.insert_run(0, SsrleRun::repeated(42, 1_000_000)).unwrap();
        let bytes = data.encode().unwrap();
        let view = SsrleSeqView::parse(&bytes).unwrap();
        assert_eq!(view.size(), 1_000_000);
        assert_eq!(view.rank_eq(999_999, 42).unwrap(), 999_999);
        assert_eq!(view.symbol(123_456).unwrap(), 42);
    }

    #[test]
    fn test_edits_reuse_leading_groups() {
        let mut data = SsrleSeqData::new(2).unwrap();
        let mut expected = Vec::new();
        for i in 0..3000u64 {
            let (symbol, count) = (i % 4, 1 + i % 3);
            data.insert_run(expected.len(), SsrleRun::repeated(symbol, count)).unwrap();
            expected.extend(std::iter::repeat_n(symbol, count as usize));
        }
        let bytes = data.encode().unwrap();
        let view = SsrleSeqView::parse(&bytes).unwrap();
        assert!(view.groups() > 2);
        let full_groups = view.segments / SSRLE_GROUP_SEGMENTS;

        let mut decoded = view.to_data().unwrap();
        assert_eq!(decoded.clean.groups.len(), full_groups);
        let at = expected.len() - 3;
        decoded.remove(at, at + 2).unwrap();
        expected.drain(at..at + 2);
        assert!(decoded.clean.groups.len() >= full_groups - 1);
        assert!(decoded.clean_runs() > 0);

        let bytes = decoded.encode().unwrap();
        let edited = SsrleSeqView::parse(&bytes).unwrap();
        assert_eq!(edited.size(), expected.len());
        for sym in 0..4u64 {
            let count = expected.iter().filter(|&&s| s == sym).count() as u64;
            assert_eq!(edited.rank_eq(expected.len(), sym).unwrap(), count);
        }
        for idx in (0..expected.len()).step_by(11) {
            assert_eq!(edited.symbol(idx).unwrap(), expected[idx]);
        }

        let mut front = edited.to_data().unwrap();
        front.insert_symbols(0, &[3]).unwrap();
        assert_eq!(front.clean_runs(), 0);
        expected.insert(0, 3);
        let bytes = front.encode().unwrap();
        let view = SsrleSeqView::parse(&bytes).unwrap();
        assert_eq!(view.symbol(0).unwrap(), 3);
        assert_eq!(view.symbol(expected.len() - 1).unwrap(), expected[expected.len() - 1]);
    }

    #[test]
    fn test_remove_across_runs() {
        let mut data = SsrleSeqData::new(2).unwrap();
        data.insert_run(0, SsrleRun::repeated(1, 5)).unwrap();
        data.insert_run(5, SsrleRun::repeated(2, 5)).unwrap();
        data.insert_run(10, SsrleRun::repeated(1, 5)).unwrap();
        assert_eq!(data.runs().len(), 3);

        data.remove(3, 12).unwrap();
        assert_eq!(data.len(), 6);
        assert_eq!(data.runs(), &[SsrleRun::repeated(1, 6)]);
    }

    #[test]
    fn test_set_symbol() {
        let mut data = SsrleSeqData::new(2).unwrap();
        data.insert_symbols(0, &[0, 0, 0, 0]).unwrap();
        data.set_symbol(2, 3).unwrap();
        assert_eq!(data.symbol(2).unwrap(), 3);
        assert_eq!(data.len(), 4);
    }
}
