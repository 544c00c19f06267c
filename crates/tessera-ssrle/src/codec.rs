//! Code-unit encoding of runs and the 64-byte segment layout.
//!
//! A run is encoded into 1 to 4 little-endian 16-bit code units:
//!
//! ```text
//! bit 0             2              2+L            2+L+pl*bps          units*16
//! +-----------------+--------------+--------------+-------------------+
//! | units - 1       | pl           | pattern      | run_length        |
//! +-----------------+--------------+--------------+-------------------+
//! ```
//!
//! When no bits remain for the run length it is implied to be 1. A code
//! unit of zero is a null run and ends the segment it appears in. Runs never
//! straddle a segment: the writer closes a segment with a padding run
//! (`pl = 0`, `run_length` = covered units) followed by zero units.

use crate::run::SsrleRun;
use crate::traits::{
    CODE_UNIT_BITS, MAX_CODE_UNITS, RunTraits, SEGMENT_UNITS, SIZE_SELECTOR_BITS, low_mask,
};
use tessera_common::{Result, TesseraError};

/// Number of code units `run` occupies when encoded.
pub fn encoded_units(run: &SsrleRun, traits: &RunTraits) -> usize {
    if run.pattern_length() == 0 {
        1
    } else {
        traits.estimate_size(run.pattern_length(), run.run_length())
    }
}

/// Encodes `run`, appending its code units to `out`. Returns the unit count.
pub fn encode_run(run: &SsrleRun, traits: &RunTraits, out: &mut Vec<u16>) -> Result<usize> {
    let len_shift = SIZE_SELECTOR_BITS;
    let pattern_shift = len_shift + traits.len_bits();

    if run.pattern_length() == 0 {
        let max_padding = low_mask(CODE_UNIT_BITS - pattern_shift);
        if run.run_length() == 0 || run.run_length() > max_padding {
            return Err(TesseraError::RunContract(format!(
                "padding of {} units cannot be encoded",
                run.run_length()
            )));
        }
        out.push((run.run_length() << pattern_shift) as u16);
        return Ok(1);
    }

    if !traits.is_fit(run.pattern_length(), run.run_length()) {
        return Err(TesseraError::RunContract(format!(
            "run {} does not fit into {} code units",
            run, MAX_CODE_UNITS
        )));
    }

    let units = traits.estimate_size(run.pattern_length(), run.run_length());
    let run_shift = traits.pattern_end_bit(run.pattern_length());
    let pattern = run.pattern() & low_mask(run.pattern_length() * traits.bps());

    let mut code: u128 = (units as u128 - 1)
        | ((run.pattern_length() as u128) << len_shift)
        | ((pattern as u128) << pattern_shift);
    if units * CODE_UNIT_BITS > run_shift {
        code |= (run.run_length() as u128) << run_shift;
    }

    for i in 0..units {
        out.push((code >> (i * CODE_UNIT_BITS)) as u16);
    }
    Ok(units)
}

/// Decodes the run starting at `units[0]`. Returns the run and its unit count.
///
/// Null units decode to a null run of one unit; padding runs report the
/// units they cover.
pub fn decode_run(units: &[u16], traits: &RunTraits) -> Result<(SsrleRun, usize)> {
    let first = *units
        .first()
        .ok_or_else(|| TesseraError::PackedCorrupted("empty code unit stream".to_string()))?;
    if first == 0 {
        return Ok((SsrleRun::default(), 1));
    }

    let size = (first as usize & 0b11) + 1;
    if units.len() < size {
        return Err(TesseraError::PackedCorrupted(format!(
            "run needs {} code units, {} available",
            size,
            units.len()
        )));
    }

    let mut code: u128 = 0;
    for (i, &unit) in units[..size].iter().enumerate() {
        code |= (unit as u128) << (i * CODE_UNIT_BITS);
    }

    let pattern_shift = SIZE_SELECTOR_BITS + traits.len_bits();
    let pattern_length = ((code >> SIZE_SELECTOR_BITS) as u64 & low_mask(traits.len_bits())) as usize;

    if pattern_length == 0 {
        let covered = (code >> pattern_shift) as u64 & low_mask(CODE_UNIT_BITS - pattern_shift);
        return Ok((SsrleRun::padding(covered), 1));
    }
    if pattern_length > traits.max_pattern_length() {
        return Err(TesseraError::PackedCorrupted(format!(
            "pattern length {} exceeds maximum {}",
            pattern_length,
            traits.max_pattern_length()
        )));
    }

    let run_shift = traits.pattern_end_bit(pattern_length);
    let total_bits = size * CODE_UNIT_BITS;
    if run_shift > total_bits {
        return Err(TesseraError::PackedCorrupted(format!(
            "pattern of {} symbols does not fit {} code units",
            pattern_length, size
        )));
    }

    let pattern = (code >> pattern_shift) as u64 & low_mask(pattern_length * traits.bps());
    let run_bits = total_bits - run_shift;
    let run_length = if run_bits == 0 {
        1
    } else {
        (code >> run_shift) as u64 & low_mask(run_bits)
    };
    if run_length == 0 {
        return Err(TesseraError::PackedCorrupted(
            "run with zero run length".to_string(),
        ));
    }

    Ok((SsrleRun::new(pattern_length, pattern, run_length), size))
}

/// Writes runs into 64-byte segments.
#[derive(Debug, Clone)]
pub struct SegmentWriter {
    traits: RunTraits,
    units: Vec<u16>,
}

impl SegmentWriter {
    pub fn new(traits: RunTraits) -> Self {
        Self {
            traits,
            units: Vec::new(),
        }
    }

    fn segment_pos(&self) -> usize {
        self.units.len() % SEGMENT_UNITS
    }

    /// Appends `run`, closing the current segment first if it does not fit.
    pub fn push(&mut self, run: &SsrleRun) -> Result<()> {
        if run.is_empty() {
            return Ok(());
        }
        let size = encoded_units(run, &self.traits);
        let pos = self.segment_pos();
        if pos > 0 && pos + size > SEGMENT_UNITS {
            let remainder = SEGMENT_UNITS - pos;
            encode_run(&SsrleRun::padding(remainder as u64), &self.traits, &mut self.units)?;
            self.units.resize(self.units.len() + remainder - 1, 0);
        }
        encode_run(run, &self.traits, &mut self.units)?;
        Ok(())
    }

    /// Zero-fills the last segment and returns the unit stream.
    pub fn finish(mut self) -> Vec<u16> {
        let pos = self.segment_pos();
        if pos > 0 {
            self.units.resize(self.units.len() + SEGMENT_UNITS - pos, 0);
        }
        self.units
    }
}

/// Encodes `runs` into whole segments.
pub fn write_segments_to(runs: &[SsrleRun], traits: &RunTraits) -> Result<Vec<u16>> {
    let mut writer = SegmentWriter::new(*traits);
    for run in runs {
        writer.push(run)?;
    }
    Ok(writer.finish())
}

/// Decodes the runs of one segment.
pub fn decode_segment(segment: &[u16], traits: &RunTraits) -> Result<Vec<SsrleRun>> {
    let mut runs = Vec::new();
    let mut pos = 0;
    while pos < segment.len() {
        let (run, size) = decode_run(&segment[pos..], traits)?;
        if run.is_null() {
            break;
        }
        if run.is_padding() {
            pos += run.run_length() as usize;
            continue;
        }
        runs.push(run);
        pos += size;
    }
    Ok(runs)
}

/// Iterates decoded runs over a segmented unit stream, skipping padding.
pub struct RunReader<'a> {
    units: &'a [u16],
    traits: RunTraits,
    pos: usize,
}

impl<'a> RunReader<'a> {
    pub fn new(units: &'a [u16], traits: RunTraits) -> Self {
        Self {
            units,
            traits,
            pos: 0,
        }
    }

    /// Unit offset of the next run to be read.
    pub fn position(&self) -> usize {
        self.pos
    }
}

impl Iterator for RunReader<'_> {
    type Item = Result<SsrleRun>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.units.len() {
            let (run, size) = match decode_run(&self.units[self.pos..], &self.traits) {
                Ok(decoded) => decoded,
                Err(e) => {
                    self.pos = self.units.len();
                    return Some(Err(e));
                }
            };
            if run.is_null() {
                let in_segment = self.pos % SEGMENT_UNITS;
                self.pos += SEGMENT_UNITS - in_segment;
                continue;
            }
            if run.is_padding() {
                self.pos += run.run_length() as usize;
                continue;
            }
            self.pos += size;
            return Some(Ok(run));
        }
        None
    }
}

/// Decodes every run of a segmented unit stream.
pub fn read_runs(units: &[u16], traits: &RunTraits) -> Result<Vec<SsrleRun>> {
    RunReader::new(units, *traits).collect()
}
