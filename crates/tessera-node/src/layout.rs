//! Node layouts: the substream lists of leaves and of the derived branches.

use bytes::BufMut;
use tessera_common::{Result, TesseraError};
use tessera_packed::{PackedDispatcher, SubstreamDescriptor, SubstreamKind, SubstreamParams};

use crate::entry::EntryLayout;

/// Substream description of one tree type.
///
/// Leaves hold the described data streams. Branches hold, for every leaf
/// stream, a fixed-size tree with one row per child (the stream's size
/// followed by its statistics), plus the child block ids as the last
/// substream. Every branch substream lives in group 0.
///
/// A layout built with [`with_symbols`](Self::with_symbols) also carries a
/// symbols stream as the last leaf stream, alone in its own group. Entry
/// `p` of it is the group the `p`-th packed entry of the leaf belongs to,
/// so the rank of symbol `g` is the size of group `g`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeLayout {
    leaf: PackedDispatcher,
    branch: PackedDispatcher,
    entry: EntryLayout,
    symbols: Option<usize>,
    hash: u64,
}

impl NodeLayout {
    pub fn new(streams: Vec<SubstreamDescriptor>) -> Result<Self> {
        Self::build(streams, None)
    }

    /// Layout of `streams` plus a trailing symbols stream of `kind`, which
    /// must be [`SubstreamKind::Seq`] or [`SubstreamKind::SsrleSeq`].
    pub fn with_symbols(streams: Vec<SubstreamDescriptor>, kind: SubstreamKind) -> Result<Self> {
        if !kind.is_sequence() {
            return Err(TesseraError::InvalidParameter {
                name: "symbols kind".to_string(),
                value: kind.to_string(),
            });
        }
        Self::build(streams, Some(kind))
    }

    fn build(
        mut streams: Vec<SubstreamDescriptor>,
        symbols: Option<SubstreamKind>,
    ) -> Result<Self> {
        if streams.is_empty() {
            return Err(TesseraError::InvalidParameter {
                name: "streams".to_string(),
                value: "0".to_string(),
            });
        }
        let groups = streams.iter().map(|d| d.group + 1).max().unwrap_or(0);
        if let Some(missing) = (0..groups).find(|g| !streams.iter().any(|d| d.group == *g)) {
            return Err(TesseraError::InvalidParameter {
                name: "group".to_string(),
                value: format!("group {} has no streams", missing),
            });
        }
        let symbols = match symbols {
            Some(kind) => {
                let bps = symbol_bits(groups)?;
                streams.push(SubstreamDescriptor::new(
                    kind,
                    groups,
                    SubstreamParams::symbols(bps),
                ));
                Some(streams.len() - 1)
            }
            None => None,
        };

        let entry = EntryLayout::for_streams(&streams);
        let mut branch_streams: Vec<SubstreamDescriptor> = streams
            .iter()
            .map(|d| {
                let columns = SubstreamParams::columns(1 + d.stat_width());
                SubstreamDescriptor::new(SubstreamKind::FseTree, 0, columns)
            })
            .collect();
        branch_streams.push(SubstreamDescriptor::block_ids(0));

        let hash = layout_hash(&streams);
        Ok(Self {
            leaf: PackedDispatcher::new(streams, 0)?,
            branch: PackedDispatcher::new(branch_streams, 0)?,
            entry,
            symbols,
            hash,
        })
    }

    pub fn leaf(&self) -> &PackedDispatcher {
        &self.leaf
    }

    pub fn branch(&self) -> &PackedDispatcher {
        &self.branch
    }

    pub fn entry_layout(&self) -> &EntryLayout {
        &self.entry
    }

    pub fn hash(&self) -> u64 {
        self.hash
    }

    /// Number of leaf streams.
    pub fn streams(&self) -> usize {
        self.leaf.len()
    }

    /// Number of leaf stream groups, the symbols group included.
    pub fn groups(&self) -> usize {
        self.leaf.groups()
    }

    /// Leaf stream holding the symbols, if any.
    pub fn symbols(&self) -> Option<usize> {
        self.symbols
    }

    /// Number of groups holding data streams.
    pub fn data_groups(&self) -> usize {
        self.groups() - usize::from(self.symbols.is_some())
    }

    /// Leaf streams of `group`.
    pub fn group_members(&self, group: usize) -> Result<Vec<usize>> {
        let members: Vec<usize> = self.leaf.group_members(group).collect();
        if members.is_empty() {
            return Err(TesseraError::InvalidParameter {
                name: "group".to_string(),
                value: group.to_string(),
            });
        }
        Ok(members)
    }

    /// Group of leaf stream `stream`.
    pub fn group_of(&self, stream: usize) -> Result<usize> {
        Ok(self.leaf.descriptor(stream)?.group)
    }

    /// Branch substream holding the child ids.
    pub fn children_index(&self) -> usize {
        self.branch.len() - 1
    }
}

/// Narrowest sequence width with a symbol per group.
fn symbol_bits(groups: usize) -> Result<usize> {
    [1, 2, 4, 8]
        .into_iter()
        .find(|&bps| groups <= 1usize << bps)
        .ok_or_else(|| TesseraError::InvalidParameter {
            name: "groups".to_string(),
            value: groups.to_string(),
        })
}

fn layout_hash(streams: &[SubstreamDescriptor]) -> u64 {
    let mut buf = Vec::with_capacity(streams.len() * 16);
    for d in streams {
        buf.put_u8(d.kind.as_u8());
        buf.put_u32_le(d.group as u32);
        buf.put_u32_le(d.params.columns as u32);
        buf.put_u8(d.params.symbol_bits as u8);
        buf.put_u8(d.params.index.as_u8());
    }
    ((streams.len() as u64) << 32) | crc32fast::hash(&buf) as u64
}
