//! The SSRLE run: a short symbol pattern repeated a number of times.

use crate::traits::{RunTraits, low_mask};
use tessera_common::{Result, TesseraError};

/// Comparison applied between a stored symbol and the queried symbol in
/// rank and select operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SymbolCmp {
    Eq,
    Neq,
    Lt,
    Le,
    Gt,
    Ge,
}

impl SymbolCmp {
    /// Returns true if `stored` matches `symbol` under this comparison.
    #[inline]
    pub fn matches(&self, stored: u64, symbol: u64) -> bool {
        match self {
            SymbolCmp::Eq => stored == symbol,
            SymbolCmp::Neq => stored != symbol,
            SymbolCmp::Lt => stored < symbol,
            SymbolCmp::Le => stored <= symbol,
            SymbolCmp::Gt => stored > symbol,
            SymbolCmp::Ge => stored >= symbol,
        }
    }
}

/// Result of splitting a run: the runs before and after the split point.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSplit {
    pub left: Vec<SsrleRun>,
    pub right: Vec<SsrleRun>,
}

/// A pattern of `pattern_length` symbols repeated `run_length` times.
///
/// Symbol `i` of the pattern occupies bits `[i * bps, (i + 1) * bps)` of
/// `pattern`; bits above the pattern are always zero. A run with
/// `pattern_length == 0` is padding: it carries no symbols and its
/// `run_length` counts the code units it covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct SsrleRun {
    pattern: u64,
    pattern_length: usize,
    run_length: u64,
}

impl SsrleRun {
    /// Creates a run. `pattern` must not have bits above the pattern.
    pub fn new(pattern_length: usize, pattern: u64, run_length: u64) -> Self {
        Self {
            pattern,
            pattern_length,
            run_length,
        }
    }

    /// A single symbol repeated `count` times.
    pub fn repeated(symbol: u64, count: u64) -> Self {
        Self::new(1, symbol, count)
    }

    /// A literal pattern occurring once.
    pub fn literal(symbols: &[u64], traits: &RunTraits) -> Result<Self> {
        if symbols.is_empty() || symbols.len() > traits.max_pattern_length() {
            return Err(TesseraError::RunContract(format!(
                "literal of {} symbols does not fit a pattern of at most {}",
                symbols.len(),
                traits.max_pattern_length()
            )));
        }
        let mut pattern = 0u64;
        for (i, &sym) in symbols.iter().enumerate() {
            if sym > traits.symbol_mask() {
                return Err(TesseraError::RunContract(format!(
                    "symbol {} does not fit into {} bits",
                    sym,
                    traits.bps()
                )));
            }
            pattern |= sym << (i * traits.bps());
        }
        Ok(Self::new(symbols.len(), pattern, 1))
    }

    /// A padding run covering `units` code units.
    pub fn padding(units: u64) -> Self {
        Self::new(0, 0, units)
    }

    pub fn pattern(&self) -> u64 {
        self.pattern
    }

    pub fn pattern_length(&self) -> usize {
        self.pattern_length
    }

    pub fn run_length(&self) -> u64 {
        self.run_length
    }

    /// Total number of symbols the run represents.
    pub fn full_run_length(&self) -> u64 {
        self.pattern_length as u64 * self.run_length
    }

    pub fn is_padding(&self) -> bool {
        self.pattern_length == 0 && self.run_length > 0
    }

    /// An all-zero code unit decodes to this.
    pub fn is_null(&self) -> bool {
        self.pattern_length == 0 && self.run_length == 0
    }

    /// True for runs carrying no symbols.
    pub fn is_empty(&self) -> bool {
        self.full_run_length() == 0
    }

    /// Symbol at `idx` of the pattern.
    #[inline]
    pub fn pattern_symbol(&self, idx: usize, traits: &RunTraits) -> u64 {
        (self.pattern >> (idx * traits.bps())) & traits.symbol_mask()
    }

    /// Symbol at position `idx` of the run.
    pub fn symbol(&self, idx: u64, traits: &RunTraits) -> Result<u64> {
        self.check_position(idx, false, "symbol position")?;
        let in_pattern = (idx % self.pattern_length as u64) as usize;
        Ok(self.pattern_symbol(in_pattern, traits))
    }

    /// All symbols of the run, in order.
    pub fn expand(&self, traits: &RunTraits) -> Vec<u64> {
        let mut out = Vec::with_capacity(self.full_run_length() as usize);
        for _ in 0..self.run_length {
            for i in 0..self.pattern_length {
                out.push(self.pattern_symbol(i, traits));
            }
        }
        out
    }

    /// First `len` symbols of the pattern.
    fn pattern_prefix(&self, len: usize, traits: &RunTraits) -> u64 {
        self.pattern & low_mask(len * traits.bps())
    }

    /// Pattern symbols from `start` to the end.
    fn pattern_suffix(&self, start: usize, traits: &RunTraits) -> u64 {
        let shift = start * traits.bps();
        if shift >= 64 { 0 } else { self.pattern >> shift }
    }

    fn check_position(&self, pos: u64, inclusive: bool, what: &str) -> Result<()> {
        let full = self.full_run_length();
        let out = if inclusive { pos > full } else { pos >= full };
        if out {
            return Err(TesseraError::RunContract(format!(
                "{} {} is outside of run length {}",
                what, pos, full
            )));
        }
        Ok(())
    }

    /// Splits the run at symbol position `at`.
    ///
    /// A cut inside a repetition materializes that repetition as two
    /// literal runs between the repeated prefix and suffix.
    pub fn split(&self, at: u64, traits: &RunTraits) -> Result<RunSplit> {
        self.check_position(at, true, "split position")?;

        let full = self.full_run_length();
        let mut result = RunSplit::default();
        if at == 0 {
            result.right.push(*self);
            return Ok(result);
        }
        if at == full {
            result.left.push(*self);
            return Ok(result);
        }

        let pl = self.pattern_length;
        if self.run_length == 1 {
            let cut = at as usize;
            result
                .left
                .push(Self::new(cut, self.pattern_prefix(cut, traits), 1));
            result
                .right
                .push(Self::new(pl - cut, self.pattern_suffix(cut, traits), 1));
            return Ok(result);
        }

        let reps = at / pl as u64;
        let rem = (at % pl as u64) as usize;

        if rem == 0 {
            result.left.push(Self::new(pl, self.pattern, reps));
            result
                .right
                .push(Self::new(pl, self.pattern, self.run_length - reps));
            return Ok(result);
        }

        if reps > 0 {
            result.left.push(Self::new(pl, self.pattern, reps));
        }
        result
            .left
            .push(Self::new(rem, self.pattern_prefix(rem, traits), 1));
        result
            .right
            .push(Self::new(pl - rem, self.pattern_suffix(rem, traits), 1));
        let tail = self.run_length - reps - 1;
        if tail > 0 {
            result.right.push(Self::new(pl, self.pattern, tail));
        }

        Ok(result)
    }

    /// Appends the runs covering `[start, start + size)` to `out`.
    pub fn extract_to(
        &self,
        out: &mut Vec<SsrleRun>,
        start: u64,
        size: u64,
        traits: &RunTraits,
    ) -> Result<()> {
        let end = start.checked_add(size).ok_or_else(|| {
            TesseraError::RunContract(format!("range {}+{} overflows", start, size))
        })?;
        self.check_position(end, true, "range end")?;
        if size == 0 {
            return Ok(());
        }

        let tail = self.split(start, traits)?.right;
        let mut remaining = size;
        for run in tail {
            if remaining == 0 {
                break;
            }
            let len = run.full_run_length();
            if len <= remaining {
                out.push(run);
                remaining -= len;
            } else {
                out.extend(run.split(remaining, traits)?.left);
                remaining = 0;
            }
        }
        Ok(())
    }

    /// Inserts `other` at symbol position `at`, returning the replacement runs.
    ///
    /// Inserting one literal into another yields a single literal when the
    /// combined pattern fits; otherwise the run is split around `at` and the
    /// pieces are compacted, which also absorbs insertions of the same
    /// pattern on a repetition boundary.
    pub fn insert(&self, other: &SsrleRun, at: u64, traits: &RunTraits) -> Result<Vec<SsrleRun>> {
        self.check_position(at, true, "insert position")?;
        if other.is_empty() {
            return Ok(vec![*self]);
        }

        if self.run_length == 1 && other.run_length == 1 {
            let combined = self.pattern_length + other.pattern_length;
            if traits.is_fit(combined, 1) {
                let cut = at as usize;
                let bps = traits.bps();
                let pattern = self.pattern_prefix(cut, traits)
                    | (other.pattern << (cut * bps))
                    | (self.pattern_suffix(cut, traits) << ((cut + other.pattern_length) * bps));
                return Ok(vec![Self::new(combined, pattern, 1)]);
            }
        }

        let split = self.split(at, traits)?;
        let mut pieces = split.left;
        pieces.push(*other);
        pieces.extend(split.right);
        Ok(compactify_runs(&pieces, traits))
    }

    /// Merges `other` into `self` if the result still fits one code word.
    ///
    /// Runs with the same pattern extend the run length; two literals
    /// concatenate their patterns. Returns false when no merge happened.
    pub fn merge(&mut self, other: &SsrleRun, traits: &RunTraits) -> bool {
        if self.is_empty() || other.is_empty() {
            return false;
        }

        if self.pattern_length == other.pattern_length && self.pattern == other.pattern {
            if let Some(run_length) = self.run_length.checked_add(other.run_length) {
                if traits.is_fit(self.pattern_length, run_length) {
                    self.run_length = run_length;
                    return true;
                }
            }
        }

        if self.run_length == 1 && other.run_length == 1 {
            let combined = self.pattern_length + other.pattern_length;
            if traits.is_fit(combined, 1) {
                self.pattern |= other.pattern << (self.pattern_length * traits.bps());
                self.pattern_length = combined;
                return true;
            }
        }

        false
    }

    /// Matches among the first `len` pattern symbols.
    pub fn pattern_rank(&self, len: usize, symbol: u64, cmp: SymbolCmp, traits: &RunTraits) -> u64 {
        (0..len.min(self.pattern_length))
            .filter(|&i| cmp.matches(self.pattern_symbol(i, traits), symbol))
            .count() as u64
    }

    /// Position within the pattern of the match with 0-based `rank`.
    pub fn pattern_select_fw(
        &self,
        rank: u64,
        symbol: u64,
        cmp: SymbolCmp,
        traits: &RunTraits,
    ) -> Option<usize> {
        let mut seen = 0u64;
        for i in 0..self.pattern_length {
            if cmp.matches(self.pattern_symbol(i, traits), symbol) {
                if seen == rank {
                    return Some(i);
                }
                seen += 1;
            }
        }
        None
    }

    /// Number of matching symbols in `[0, idx)`.
    pub fn rank(&self, idx: u64, symbol: u64, cmp: SymbolCmp, traits: &RunTraits) -> Result<u64> {
        self.check_position(idx, true, "rank position")?;
        if self.pattern_length == 0 {
            return Ok(0);
        }
        let pl = self.pattern_length as u64;
        let reps = idx / pl;
        let rem = (idx % pl) as usize;
        let mut rank = 0;
        if reps > 0 {
            rank += reps * self.pattern_rank(self.pattern_length, symbol, cmp, traits);
        }
        Ok(rank + self.pattern_rank(rem, symbol, cmp, traits))
    }

    /// Number of matching symbols in the whole run.
    pub fn full_rank(&self, symbol: u64, cmp: SymbolCmp, traits: &RunTraits) -> u64 {
        self.run_length * self.pattern_rank(self.pattern_length, symbol, cmp, traits)
    }

    /// Position of the match with 0-based `rank`, if the run has that many.
    pub fn select_fw(&self, rank: u64, symbol: u64, cmp: SymbolCmp, traits: &RunTraits) -> Option<u64> {
        let per_pattern = self.pattern_rank(self.pattern_length, symbol, cmp, traits);
        if per_pattern == 0 {
            return None;
        }
        let rank_base = rank / per_pattern;
        if rank_base >= self.run_length {
            return None;
        }
        let local = self.pattern_select_fw(rank % per_pattern, symbol, cmp, traits)?;
        Some(rank_base * self.pattern_length as u64 + local as u64)
    }

    /// Per-symbol counts over `[0, idx)`.
    pub fn ranks(&self, idx: u64, traits: &RunTraits) -> Result<Vec<u64>> {
        self.check_position(idx, true, "rank position")?;
        let mut counts = vec![0u64; traits.symbols()];
        if self.pattern_length == 0 {
            return Ok(counts);
        }
        let pl = self.pattern_length as u64;
        let reps = idx / pl;
        let rem = (idx % pl) as usize;
        for i in 0..self.pattern_length {
            let sym = self.pattern_symbol(i, traits) as usize;
            counts[sym] += reps;
            if i < rem {
                counts[sym] += 1;
            }
        }
        Ok(counts)
    }

    pub fn rank_eq(&self, idx: u64, symbol: u64, traits: &RunTraits) -> Result<u64> {
        self.rank(idx, symbol, SymbolCmp::Eq, traits)
    }

    pub fn rank_neq(&self, idx: u64, symbol: u64, traits: &RunTraits) -> Result<u64> {
        self.rank(idx, symbol, SymbolCmp::Neq, traits)
    }

    pub fn rank_lt(&self, idx: u64, symbol: u64, traits: &RunTraits) -> Result<u64> {
        self.rank(idx, symbol, SymbolCmp::Lt, traits)
    }

    pub fn rank_le(&self, idx: u64, symbol: u64, traits: &RunTraits) -> Result<u64> {
        self.rank(idx, symbol, SymbolCmp::Le, traits)
    }

    pub fn rank_gt(&self, idx: u64, symbol: u64, traits: &RunTraits) -> Result<u64> {
        self.rank(idx, symbol, SymbolCmp::Gt, traits)
    }

    pub fn rank_ge(&self, idx: u64, symbol: u64, traits: &RunTraits) -> Result<u64> {
        self.rank(idx, symbol, SymbolCmp::Ge, traits)
    }

    pub fn full_rank_eq(&self, symbol: u64, traits: &RunTraits) -> u64 {
        self.full_rank(symbol, SymbolCmp::Eq, traits)
    }

    pub fn full_rank_neq(&self, symbol: u64, traits: &RunTraits) -> u64 {
        self.full_rank(symbol, SymbolCmp::Neq, traits)
    }

    pub fn full_rank_lt(&self, symbol: u64, traits: &RunTraits) -> u64 {
        self.full_rank(symbol, SymbolCmp::Lt, traits)
    }

    pub fn full_rank_le(&self, symbol: u64, traits: &RunTraits) -> u64 {
        self.full_rank(symbol, SymbolCmp::Le, traits)
    }

    pub fn full_rank_gt(&self, symbol: u64, traits: &RunTraits) -> u64 {
        self.full_rank(symbol, SymbolCmp::Gt, traits)
    }

    pub fn full_rank_ge(&self, symbol: u64, traits: &RunTraits) -> u64 {
        self.full_rank(symbol, SymbolCmp::Ge, traits)
    }

    pub fn select_fw_eq(&self, rank: u64, symbol: u64, traits: &RunTraits) -> Option<u64> {
        self.select_fw(rank, symbol, SymbolCmp::Eq, traits)
    }

    pub fn select_fw_neq(&self, rank: u64, symbol: u64, traits: &RunTraits) -> Option<u64> {
        self.select_fw(rank, symbol, SymbolCmp::Neq, traits)
    }

    pub fn select_fw_lt(&self, rank: u64, symbol: u64, traits: &RunTraits) -> Option<u64> {
        self.select_fw(rank, symbol, SymbolCmp::Lt, traits)
    }

    pub fn select_fw_le(&self, rank: u64, symbol: u64, traits: &RunTraits) -> Option<u64> {
        self.select_fw(rank, symbol, SymbolCmp::Le, traits)
    }

    pub fn select_fw_gt(&self, rank: u64, symbol: u64, traits: &RunTraits) -> Option<u64> {
        self.select_fw(rank, symbol, SymbolCmp::Gt, traits)
    }

    pub fn select_fw_ge(&self, rank: u64, symbol: u64, traits: &RunTraits) -> Option<u64> {
        self.select_fw(rank, symbol, SymbolCmp::Ge, traits)
    }
}

impl std::fmt::Display for SsrleRun {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{{{}, {:#x}, {}}}",
            self.pattern_length, self.pattern, self.run_length
        )
    }
}

/// Merges neighbouring runs where possible and drops runs without symbols.
pub fn compactify_runs(runs: &[SsrleRun], traits: &RunTraits) -> Vec<SsrleRun> {
    let mut out: Vec<SsrleRun> = Vec::with_capacity(runs.len());
    for run in runs.iter().filter(|r| !r.is_empty()) {
        if let Some(last) = out.last_mut() {
            if last.merge(run, traits) {
                continue;
            }
        }
        out.push(*run);
    }
    out
}

/// Total number of symbols in `runs`.
pub fn total_length(runs: &[SsrleRun]) -> u64 {
    runs.iter().map(SsrleRun::full_run_length).sum()
}
