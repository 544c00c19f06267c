//! Packed substreams: the typed element kinds hosted by a [`PackedAllocator`].
//!
//! Every kind has a zero-copy read view over its encoded bytes and an owned
//! data model used to build replacement bytes for mutations. All encodings
//! begin with a 16-byte kind-specific header.
//!
//! [`PackedAllocator`]: crate::PackedAllocator

pub mod block_ids;
pub mod columns;
pub mod fse_tree;
pub mod seq;
pub mod ssrle_seq;
pub mod vle;

use std::fmt;

use bytes::Buf;
use serde::{Deserialize, Serialize};
use tessera_common::{BlockId, Result, TesseraError};
use tessera_ssrle::SsrleRun;

pub use block_ids::BlockIdsView;
pub use columns::ColumnData;
pub use fse_tree::FseTreeView;
pub use seq::SeqView;
pub use ssrle_seq::{SsrleSeqData, SsrleSeqView};
pub use vle::VleView;

/// Size of every substream header.
pub const SUBSTREAM_HEADER_SIZE: usize = 16;

pub(crate) fn check_len(bytes: &[u8], needed: usize, what: &str) -> Result<()> {
    if bytes.len() < needed {
        return Err(TesseraError::PackedCorrupted(format!(
            "{} needs {} bytes, {} present",
            what,
            needed,
            bytes.len()
        )));
    }
    Ok(())
}

#[inline]
pub(crate) fn u64_at(bytes: &[u8], pos: usize) -> u64 {
    (&bytes[pos..pos + 8]).get_u64_le()
}

#[inline]
pub(crate) fn u32_at(bytes: &[u8], pos: usize) -> u32 {
    (&bytes[pos..pos + 4]).get_u32_le()
}

/// Closed set of substream kinds. The discriminant is the allocator tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum SubstreamKind {
    /// Fixed-size u64 columns with sum and max index (PackedTree).
    FseTree = 1,
    /// Varint columns with a sum index (PkdVQTree).
    VleTree = 2,
    /// Varint columns with an offset index only (PkdVDArray).
    VleArray = 3,
    /// Bit-packed symbol sequence with counts (PackedSeq).
    Seq = 4,
    /// SSRLE run-length symbol sequence.
    SsrleSeq = 5,
    /// Child block identifiers.
    BlockIds = 6,
}

impl SubstreamKind {
    pub fn as_u8(&self) -> u8 {
        *self as u8
    }

    /// True for kinds whose entries are symbols rather than column rows.
    pub fn is_sequence(&self) -> bool {
        matches!(self, SubstreamKind::Seq | SubstreamKind::SsrleSeq)
    }
}

impl TryFrom<u8> for SubstreamKind {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(SubstreamKind::FseTree),
            2 => Ok(SubstreamKind::VleTree),
            3 => Ok(SubstreamKind::VleArray),
            4 => Ok(SubstreamKind::Seq),
            5 => Ok(SubstreamKind::SsrleSeq),
            6 => Ok(SubstreamKind::BlockIds),
            other => Err(TesseraError::PackedCorrupted(format!(
                "unknown substream kind tag {}",
                other
            ))),
        }
    }
}

impl fmt::Display for SubstreamKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SubstreamKind::FseTree => "fse-tree",
            SubstreamKind::VleTree => "vle-tree",
            SubstreamKind::VleArray => "vle-array",
            SubstreamKind::Seq => "seq",
            SubstreamKind::SsrleSeq => "ssrle-seq",
            SubstreamKind::BlockIds => "block-ids",
        };
        f.write_str(name)
    }
}

/// Statistic a substream publishes for a range of entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum IndexKind {
    #[default]
    Sum,
    Max,
}

impl IndexKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            IndexKind::Sum => 0,
            IndexKind::Max => 1,
        }
    }
}

impl TryFrom<u8> for IndexKind {
    type Error = TesseraError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            0 => Ok(IndexKind::Sum),
            1 => Ok(IndexKind::Max),
            other => Err(TesseraError::PackedCorrupted(format!(
                "unknown index kind {}",
                other
            ))),
        }
    }
}

/// Shape parameters of a substream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubstreamParams {
    /// Values per entry for column kinds.
    pub columns: usize,
    /// Bits per symbol for sequence kinds.
    pub symbol_bits: usize,
    /// Statistic of FSE trees.
    pub index: IndexKind,
}

impl Default for SubstreamParams {
    fn default() -> Self {
        Self {
            columns: 1,
            symbol_bits: 1,
            index: IndexKind::Sum,
        }
    }
}

impl SubstreamParams {
    pub fn columns(columns: usize) -> Self {
        Self {
            columns,
            ..Self::default()
        }
    }

    pub fn symbols(symbol_bits: usize) -> Self {
        Self {
            symbol_bits,
            ..Self::default()
        }
    }

    pub fn with_index(mut self, index: IndexKind) -> Self {
        self.index = index;
        self
    }

    /// Validates the parameters for `kind`.
    pub fn check(&self, kind: SubstreamKind) -> Result<()> {
        match kind {
            SubstreamKind::Seq | SubstreamKind::SsrleSeq => seq::check_bps(self.symbol_bits),
            SubstreamKind::BlockIds => Ok(()),
            _ if self.columns == 0 || self.columns > u16::MAX as usize => {
                Err(TesseraError::InvalidParameter {
                    name: "columns".to_string(),
                    value: self.columns.to_string(),
                })
            }
            _ => Ok(()),
        }
    }

    /// Values per entry of a substream of `kind`.
    pub fn entry_width(&self, kind: SubstreamKind) -> usize {
        match kind {
            SubstreamKind::FseTree | SubstreamKind::VleTree | SubstreamKind::VleArray => {
                self.columns
            }
            _ => 1,
        }
    }

    /// Number of statistics a substream of `kind` publishes.
    pub fn stat_width(&self, kind: SubstreamKind) -> usize {
        match kind {
            SubstreamKind::FseTree | SubstreamKind::VleTree => self.columns,
            SubstreamKind::Seq | SubstreamKind::SsrleSeq => 1 << self.symbol_bits,
            SubstreamKind::VleArray | SubstreamKind::BlockIds => 0,
        }
    }

    /// How the statistics of a substream of `kind` combine.
    pub fn stat_kind(&self, kind: SubstreamKind) -> IndexKind {
        match kind {
            SubstreamKind::FseTree => self.index,
            _ => IndexKind::Sum,
        }
    }
}

/// Capability of substreams that reference other blocks.
pub trait HoldsBlockReferences {
    fn block_ref_count(&self) -> usize;

    fn block_ref(&self, idx: usize) -> Result<BlockId>;

    fn for_each_block_ref(&self, f: &mut dyn FnMut(BlockId) -> Result<()>) -> Result<()> {
        for idx in 0..self.block_ref_count() {
            f(self.block_ref(idx)?)?;
        }
        Ok(())
    }
}

/// Read view over one encoded substream.
#[derive(Debug, Clone, Copy)]
pub enum SubstreamView<'a> {
    FseTree(FseTreeView<'a>),
    VleTree(VleView<'a>),
    VleArray(VleView<'a>),
    Seq(SeqView<'a>),
    SsrleSeq(SsrleSeqView<'a>),
    BlockIds(BlockIdsView<'a>),
}

impl<'a> SubstreamView<'a> {
    pub fn parse(kind: SubstreamKind, bytes: &'a [u8]) -> Result<Self> {
        Ok(match kind {
            SubstreamKind::FseTree => SubstreamView::FseTree(FseTreeView::parse(bytes)?),
            SubstreamKind::VleTree => SubstreamView::VleTree(VleView::parse(bytes)?),
            SubstreamKind::VleArray => SubstreamView::VleArray(VleView::parse(bytes)?),
            SubstreamKind::Seq => SubstreamView::Seq(SeqView::parse(bytes)?),
            SubstreamKind::SsrleSeq => SubstreamView::SsrleSeq(SsrleSeqView::parse(bytes)?),
            SubstreamKind::BlockIds => SubstreamView::BlockIds(BlockIdsView::parse(bytes)?),
        })
    }

    pub fn kind(&self) -> SubstreamKind {
        match self {
            SubstreamView::FseTree(_) => SubstreamKind::FseTree,
            SubstreamView::VleTree(_) => SubstreamKind::VleTree,
            SubstreamView::VleArray(_) => SubstreamKind::VleArray,
            SubstreamView::Seq(_) => SubstreamKind::Seq,
            SubstreamView::SsrleSeq(_) => SubstreamKind::SsrleSeq,
            SubstreamView::BlockIds(_) => SubstreamKind::BlockIds,
        }
    }

    /// Number of entries.
    pub fn size(&self) -> usize {
        match self {
            SubstreamView::FseTree(v) => v.size(),
            SubstreamView::VleTree(v) | SubstreamView::VleArray(v) => v.size(),
            SubstreamView::Seq(v) => v.size(),
            SubstreamView::SsrleSeq(v) => v.size(),
            SubstreamView::BlockIds(v) => v.size(),
        }
    }

    /// Values of entry `idx`.
    pub fn row(&self, idx: usize) -> Result<Vec<u64>> {
        match self {
            SubstreamView::FseTree(v) => v.row(idx),
            SubstreamView::VleTree(v) | SubstreamView::VleArray(v) => v.row(idx),
            SubstreamView::Seq(v) => Ok(vec![v.symbol(idx)?]),
            SubstreamView::SsrleSeq(v) => Ok(vec![v.symbol(idx)?]),
            SubstreamView::BlockIds(v) => Ok(vec![v.get(idx)?.as_u64()]),
        }
    }

    /// Statistics over entries `[start, end)`: column sums or maxima for
    /// trees, per-symbol counts for sequences, nothing for the rest.
    pub fn stats(&self, start: usize, end: usize) -> Result<Vec<u64>> {
        match self {
            SubstreamView::FseTree(v) => (0..v.columns()).map(|c| v.stat(c, start, end)).collect(),
            SubstreamView::VleTree(v) => (0..v.columns()).map(|c| v.sum(c, start, end)).collect(),
            SubstreamView::Seq(v) => v.counts(start, end),
            SubstreamView::SsrleSeq(v) => v.counts(start, end),
            SubstreamView::VleArray(v) => check_range(start, end, v.size()).map(|_| Vec::new()),
            SubstreamView::BlockIds(v) => check_range(start, end, v.size()).map(|_| Vec::new()),
        }
    }

    /// Statistics over every entry.
    pub fn full_stats(&self) -> Result<Vec<u64>> {
        self.stats(0, self.size())
    }

    pub fn as_fse_tree(&self) -> Option<&FseTreeView<'a>> {
        match self {
            SubstreamView::FseTree(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_vle(&self) -> Option<&VleView<'a>> {
        match self {
            SubstreamView::VleTree(v) | SubstreamView::VleArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_seq(&self) -> Option<&SeqView<'a>> {
        match self {
            SubstreamView::Seq(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_ssrle_seq(&self) -> Option<&SsrleSeqView<'a>> {
        match self {
            SubstreamView::SsrleSeq(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_block_ids(&self) -> Option<&BlockIdsView<'a>> {
        match self {
            SubstreamView::BlockIds(v) => Some(v),
            _ => None,
        }
    }

    /// The block-reference capability, for the kinds that have it.
    pub fn as_block_references(&self) -> Option<&dyn HoldsBlockReferences> {
        match self {
            SubstreamView::BlockIds(v) => Some(v),
            _ => None,
        }
    }

    /// Decodes the owned data model.
    pub fn to_data(&self, params: SubstreamParams) -> Result<SubstreamData> {
        let body = match self {
            SubstreamView::FseTree(v) => DataBody::Columns(v.to_data()?),
            SubstreamView::VleTree(v) | SubstreamView::VleArray(v) => {
                DataBody::Columns(v.to_data()?)
            }
            SubstreamView::Seq(v) => {
                DataBody::Columns(ColumnData::from_columns(vec![v.to_symbols()])?)
            }
            SubstreamView::SsrleSeq(v) => DataBody::Runs(v.to_data()?),
            SubstreamView::BlockIds(v) => {
                DataBody::Columns(ColumnData::from_columns(vec![v.to_ids()])?)
            }
        };
        let params = match self {
            SubstreamView::FseTree(v) => SubstreamParams {
                columns: v.columns(),
                index: v.index_kind(),
                ..params
            },
            SubstreamView::VleTree(v) | SubstreamView::VleArray(v) => SubstreamParams {
                columns: v.columns(),
                ..params
            },
            SubstreamView::Seq(v) => SubstreamParams {
                symbol_bits: v.bps(),
                ..params
            },
            SubstreamView::SsrleSeq(v) => SubstreamParams {
                symbol_bits: v.traits().bps(),
                ..params
            },
            SubstreamView::BlockIds(_) => params,
        };
        Ok(SubstreamData {
            kind: self.kind(),
            params,
            body,
        })
    }
}

fn check_range(start: usize, end: usize, size: usize) -> Result<()> {
    if start > end || end > size {
        return Err(TesseraError::RangeOutOfBounds { start, end, size });
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DataBody {
    Columns(ColumnData),
    Runs(SsrleSeqData),
}

/// Owned, mutable model of one substream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubstreamData {
    kind: SubstreamKind,
    params: SubstreamParams,
    body: DataBody,
}

impl SubstreamData {
    /// An empty substream of `kind`.
    pub fn empty(kind: SubstreamKind, params: SubstreamParams) -> Result<Self> {
        params.check(kind)?;
        let body = match kind {
            SubstreamKind::SsrleSeq => DataBody::Runs(SsrleSeqData::new(params.symbol_bits)?),
            _ => DataBody::Columns(ColumnData::new(params.entry_width(kind))),
        };
        Ok(Self { kind, params, body })
    }

    pub fn kind(&self) -> SubstreamKind {
        self.kind
    }

    pub fn params(&self) -> &SubstreamParams {
        &self.params
    }

    /// Values per entry.
    pub fn entry_width(&self) -> usize {
        self.params.entry_width(self.kind)
    }

    pub fn size(&self) -> usize {
        match &self.body {
            DataBody::Columns(c) => c.len(),
            DataBody::Runs(r) => r.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn columns(&self) -> Option<&ColumnData> {
        match &self.body {
            DataBody::Columns(c) => Some(c),
            DataBody::Runs(_) => None,
        }
    }

    pub fn runs(&self) -> Option<&SsrleSeqData> {
        match &self.body {
            DataBody::Runs(r) => Some(r),
            DataBody::Columns(_) => None,
        }
    }

    /// Every symbol of a sequence substream, in order.
    pub fn symbols(&self) -> Result<Vec<u64>> {
        match &self.body {
            DataBody::Runs(r) => Ok(r
                .runs()
                .iter()
                .flat_map(|run| run.expand(r.traits()))
                .collect()),
            DataBody::Columns(c) if self.kind == SubstreamKind::Seq => Ok(c.column(0).to_vec()),
            DataBody::Columns(_) => Err(TesseraError::InvalidParameter {
                name: "kind".to_string(),
                value: self.kind.to_string(),
            }),
        }
    }

    fn check_values(&self, values: &[u64]) -> Result<()> {
        if self.kind.is_sequence() {
            let limit = 1u64 << self.params.symbol_bits;
            if let Some(&bad) = values.iter().find(|&&v| v >= limit) {
                return Err(TesseraError::InvalidParameter {
                    name: "symbol".to_string(),
                    value: bad.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Inserts row-major entries before entry `at`.
    pub fn insert_rows(&mut self, at: usize, rows: &[u64]) -> Result<()> {
        self.check_values(rows)?;
        match &mut self.body {
            DataBody::Columns(c) => c.insert_rows(at, rows),
            DataBody::Runs(r) => r.insert_symbols(at, rows),
        }
    }

    /// Inserts an SSRLE run before symbol `at`.
    pub fn insert_run(&mut self, at: usize, run: SsrleRun) -> Result<()> {
        match &mut self.body {
            DataBody::Runs(r) => r.insert_run(at, run),
            DataBody::Columns(_) => Err(TesseraError::InvalidParameter {
                name: "kind".to_string(),
                value: self.kind.to_string(),
            }),
        }
    }

    pub fn remove(&mut self, start: usize, end: usize) -> Result<()> {
        match &mut self.body {
            DataBody::Columns(c) => c.remove(start, end),
            DataBody::Runs(r) => r.remove(start, end),
        }
    }

    /// Moves entries `[at, size)` into a new substream of the same shape.
    pub fn split_off(&mut self, at: usize) -> Result<Self> {
        let body = match &mut self.body {
            DataBody::Columns(c) => DataBody::Columns(c.split_off(at)?),
            DataBody::Runs(r) => DataBody::Runs(r.split_off(at)?),
        };
        Ok(Self {
            kind: self.kind,
            params: self.params,
            body,
        })
    }

    /// Appends the entries of `other`, which must have the same shape.
    pub fn append(&mut self, other: SubstreamData) -> Result<()> {
        if other.kind != self.kind {
            return Err(TesseraError::InvalidParameter {
                name: "kind".to_string(),
                value: format!("{} != {}", other.kind, self.kind),
            });
        }
        match (&mut self.body, other.body) {
            (DataBody::Columns(a), DataBody::Columns(b)) => a.append(b),
            (DataBody::Runs(a), DataBody::Runs(b)) => a.append(b),
            _ => Err(TesseraError::Internal(
                "substream bodies of one kind differ".to_string(),
            )),
        }
    }

    pub fn row(&self, idx: usize) -> Result<Vec<u64>> {
        match &self.body {
            DataBody::Columns(c) => c.row(idx),
            DataBody::Runs(r) => Ok(vec![r.symbol(idx)?]),
        }
    }

    pub fn set_row(&mut self, idx: usize, row: &[u64]) -> Result<()> {
        self.check_values(row)?;
        match &mut self.body {
            DataBody::Columns(c) => c.set_row(idx, row),
            DataBody::Runs(r) => match row {
                [symbol] => r.set_symbol(idx, *symbol),
                _ => Err(TesseraError::InvalidParameter {
                    name: "row".to_string(),
                    value: format!("{} values for a symbol", row.len()),
                }),
            },
        }
    }

    /// Encodes the substream.
    pub fn encode(&self) -> Result<Vec<u8>> {
        match &self.body {
            DataBody::Runs(r) => r.encode(),
            DataBody::Columns(c) => Ok(match self.kind {
                SubstreamKind::FseTree => fse_tree::encode(self.params.index, c),
                SubstreamKind::VleTree => vle::encode(c, true),
                SubstreamKind::VleArray => vle::encode(c, false),
                SubstreamKind::Seq => seq::encode(self.params.symbol_bits, c.column(0)),
                SubstreamKind::BlockIds => block_ids::encode(c.column(0)),
                SubstreamKind::SsrleSeq => {
                    return Err(TesseraError::Internal(
                        "ssrle substream without runs".to_string(),
                    ));
                }
            }),
        }
    }
}
