//! Code-word geometry of SSRLE runs.

use serde::{Deserialize, Serialize};
use tessera_common::{Result, TesseraError};

/// Width of one code unit in bits.
pub const CODE_UNIT_BITS: usize = 16;

/// Maximum number of code units one run may occupy.
pub const MAX_CODE_UNITS: usize = 4;

/// Width of the size selector at the bottom of the first code unit.
pub const SIZE_SELECTOR_BITS: usize = 2;

/// Maximum width of an encoded run in bits.
pub const CODE_WORD_BITS: usize = CODE_UNIT_BITS * MAX_CODE_UNITS;

/// Size of a segment in bytes.
pub const SEGMENT_SIZE: usize = 64;

/// Number of code units in a segment.
pub const SEGMENT_UNITS: usize = SEGMENT_SIZE / (CODE_UNIT_BITS / 8);

/// Returns the number of bits needed to represent `value`.
pub(crate) fn bit_width(value: u64) -> usize {
    (u64::BITS - value.leading_zeros()) as usize
}

/// Returns a mask with the lowest `bits` bits set.
pub(crate) fn low_mask(bits: usize) -> u64 {
    if bits >= 64 { u64::MAX } else { (1u64 << bits) - 1 }
}

/// Geometry of runs for a given symbol width (`bps`, bits per symbol).
///
/// The pattern-length field is `len_bits` wide: the smallest width that can
/// express the longest pattern fitting into a full code word next to the
/// size selector. That gives 6 bits at 1 bps (56 symbols max), 5 bits at
/// 2 bps (28), 4 bits at 4 bps (14) and 3 bits at 8 bps (7).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RunTraits {
    bps: usize,
    len_bits: usize,
}

impl RunTraits {
    /// Creates the traits for `bps` bits per symbol (1, 2, 4 or 8).
    pub fn new(bps: usize) -> Result<Self> {
        if !matches!(bps, 1 | 2 | 4 | 8) {
            return Err(TesseraError::InvalidParameter {
                name: "bps".to_string(),
                value: bps.to_string(),
            });
        }

        let payload = CODE_WORD_BITS - SIZE_SELECTOR_BITS;
        let mut len_bits = 1;
        while (payload - len_bits) / bps > (1usize << len_bits) - 1 {
            len_bits += 1;
        }

        Ok(Self { bps, len_bits })
    }

    /// Bits per symbol.
    pub fn bps(&self) -> usize {
        self.bps
    }

    /// Width of the pattern-length field.
    pub fn len_bits(&self) -> usize {
        self.len_bits
    }

    /// Alphabet size.
    pub fn symbols(&self) -> usize {
        1 << self.bps
    }

    /// Mask of one symbol.
    pub fn symbol_mask(&self) -> u64 {
        low_mask(self.bps)
    }

    /// Longest pattern a run can carry.
    pub fn max_pattern_length(&self) -> usize {
        (CODE_WORD_BITS - SIZE_SELECTOR_BITS - self.len_bits) / self.bps
    }

    /// Bits occupied by the header fields and a pattern of `pattern_length`.
    pub(crate) fn pattern_end_bit(&self, pattern_length: usize) -> usize {
        SIZE_SELECTOR_BITS + self.len_bits + pattern_length * self.bps
    }

    /// Number of code units needed to encode a run.
    ///
    /// A run length of 1 is implied when no bits are left for it, so it
    /// costs nothing.
    pub fn estimate_size(&self, pattern_length: usize, run_length: u64) -> usize {
        let run_bits = if run_length > 1 { bit_width(run_length) } else { 0 };
        (self.pattern_end_bit(pattern_length) + run_bits).div_ceil(CODE_UNIT_BITS)
    }

    /// Returns true if a run with this shape fits into a code word.
    pub fn is_fit(&self, pattern_length: usize, run_length: u64) -> bool {
        pattern_length >= 1
            && pattern_length <= self.max_pattern_length()
            && run_length >= 1
            && self.estimate_size(pattern_length, run_length) <= MAX_CODE_UNITS
    }

    /// Largest run length for a pattern of `pattern_length` symbols.
    pub fn max_run_length(&self, pattern_length: usize) -> u64 {
        let end = self.pattern_end_bit(pattern_length);
        if end >= CODE_WORD_BITS {
            1
        } else {
            low_mask(CODE_WORD_BITS - end)
        }
    }
}
