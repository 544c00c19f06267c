//! Node block framing: block header, node header and the packed allocator.

use tessera_common::{
    BASIC_BLOCK_SIZE, BlockHeader, BlockId, BlockKind, ContainerId, Result, TesseraError,
    level_for_size,
};
use tessera_packed::{PackedAllocator, SubstreamKind, SubstreamView};

use crate::layout::NodeLayout;

/// Header stored right after the block header of every node.
///
/// ```text
/// +-------------+-------+-------+----------+--------------+
/// | layout_hash | level | flags | reserved | next_leaf_id |
/// | 8           | 2     | 2     | 4        | 8            |
/// +-------------+-------+-------+----------+--------------+
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NodeHeader {
    /// Hash of the layout the node was built with.
    pub layout_hash: u64,
    /// Tree level, 0 for leaves.
    pub level: u16,
    pub flags: u16,
    /// Right sibling of a leaf, [`BlockId::INVALID`] when unlinked.
    pub next_leaf_id: BlockId,
}

impl NodeHeader {
    /// Size of the node header in bytes.
    pub const SIZE: usize = 24;

    /// The node is the root of its tree.
    pub const FLAG_ROOT: u16 = 0x0001;

    pub fn new(layout_hash: u64, level: u16) -> Self {
        Self {
            layout_hash,
            level,
            flags: 0,
            next_leaf_id: BlockId::INVALID,
        }
    }

    pub fn is_root(&self) -> bool {
        self.flags & Self::FLAG_ROOT != 0
    }

    pub fn set_root(&mut self, root: bool) {
        if root {
            self.flags |= Self::FLAG_ROOT;
        } else {
            self.flags &= !Self::FLAG_ROOT;
        }
    }

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut buf = [0u8; Self::SIZE];
        buf[0..8].copy_from_slice(&self.layout_hash.to_le_bytes());
        buf[8..10].copy_from_slice(&self.level.to_le_bytes());
        buf[10..12].copy_from_slice(&self.flags.to_le_bytes());
        buf[16..24].copy_from_slice(&self.next_leaf_id.0.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8]) -> Result<Self> {
        if buf.len() < Self::SIZE {
            return Err(TesseraError::BlockSizeMismatch {
                expected: Self::SIZE,
                actual: buf.len(),
            });
        }
        let mut hash = [0u8; 8];
        hash.copy_from_slice(&buf[0..8]);
        let mut next = [0u8; 8];
        next.copy_from_slice(&buf[16..24]);
        Ok(Self {
            layout_hash: u64::from_le_bytes(hash),
            level: u16::from_le_bytes([buf[8], buf[9]]),
            flags: u16::from_le_bytes([buf[10], buf[11]]),
            next_leaf_id: BlockId(u64::from_le_bytes(next)),
        })
    }
}

/// One B-tree node as stored in a block.
///
/// The block image is the block header, the node header and the
/// allocator image, in this order. The block checksum covers everything
/// after the block header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeBlock {
    header: BlockHeader,
    node: NodeHeader,
    allocator: PackedAllocator,
}

impl NodeBlock {
    /// Bytes of a block not available to the allocator.
    pub const OVERHEAD: usize = BlockHeader::SIZE + NodeHeader::SIZE;

    /// Creates an empty node for `layout`.
    pub fn new(
        block_id: BlockId,
        kind: BlockKind,
        level: u16,
        ctr_id: ContainerId,
        block_size: usize,
        layout: &NodeLayout,
    ) -> Result<Self> {
        let elements = match kind {
            BlockKind::Leaf => layout.leaf().allocator_elements(),
            BlockKind::Branch => layout.branch().allocator_elements(),
            other => {
                return Err(TesseraError::InvalidParameter {
                    name: "kind".to_string(),
                    value: format!("{:?}", other),
                });
            }
        };
        if (kind == BlockKind::Leaf) != (level == 0) {
            return Err(TesseraError::InvalidParameter {
                name: "level".to_string(),
                value: level.to_string(),
            });
        }
        if block_size <= Self::OVERHEAD {
            return Err(TesseraError::BlockSizeMismatch {
                expected: Self::OVERHEAD + 1,
                actual: block_size,
            });
        }
        let allocator = PackedAllocator::new(block_size - Self::OVERHEAD, elements)?;
        let alloc_level = level_for_size(block_size, BASIC_BLOCK_SIZE) as u8;
        Ok(Self {
            header: BlockHeader::new(block_id, kind, alloc_level, ctr_id),
            node: NodeHeader::new(layout.hash(), level),
            allocator,
        })
    }

    pub fn block_id(&self) -> BlockId {
        self.header.block_id
    }

    pub fn set_block_id(&mut self, id: BlockId) {
        self.header.block_id = id;
    }

    pub fn kind(&self) -> BlockKind {
        self.header.kind
    }

    pub fn is_leaf(&self) -> bool {
        self.header.kind == BlockKind::Leaf
    }

    pub fn ctr_id(&self) -> ContainerId {
        self.header.ctr_id
    }

    pub fn level(&self) -> u16 {
        self.node.level
    }

    pub fn is_root(&self) -> bool {
        self.node.is_root()
    }

    pub fn set_root(&mut self, root: bool) {
        self.node.set_root(root);
    }

    pub fn layout_hash(&self) -> u64 {
        self.node.layout_hash
    }

    pub fn next_leaf_id(&self) -> BlockId {
        self.node.next_leaf_id
    }

    pub fn set_next_leaf_id(&mut self, id: BlockId) {
        self.node.next_leaf_id = id;
    }

    pub fn block_header(&self) -> &BlockHeader {
        &self.header
    }

    pub fn node_header(&self) -> &NodeHeader {
        &self.node
    }

    pub fn allocator(&self) -> &PackedAllocator {
        &self.allocator
    }

    pub fn allocator_mut(&mut self) -> &mut PackedAllocator {
        &mut self.allocator
    }

    /// Size of the whole block in bytes.
    pub fn block_size(&self) -> usize {
        Self::OVERHEAD + self.allocator.block_size()
    }

    /// Fails unless the node was built with `layout`.
    pub fn check_layout(&self, layout: &NodeLayout) -> Result<()> {
        if self.node.layout_hash != layout.hash() {
            return Err(TesseraError::LayoutMismatch {
                expected: layout.hash(),
                actual: self.node.layout_hash,
            });
        }
        Ok(())
    }

    /// Serializes the node into a sealed block image.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut payload = Vec::with_capacity(NodeHeader::SIZE + self.allocator.block_size());
        payload.extend_from_slice(&self.node.to_bytes());
        payload.extend_from_slice(self.allocator.as_bytes());

        let mut header = self.header;
        header.seal(&payload);

        let mut out = Vec::with_capacity(BlockHeader::SIZE + payload.len());
        out.extend_from_slice(&header.to_bytes());
        out.extend_from_slice(&payload);
        out
    }

    /// Parses and verifies a block image.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let header = BlockHeader::from_bytes(bytes)?;
        let end = BlockHeader::SIZE + header.payload_size as usize;
        if bytes.len() < end {
            return Err(TesseraError::BlockCorrupted {
                block_id: header.block_id.0,
                reason: format!("block image of {} bytes is truncated", bytes.len()),
            });
        }
        let payload = &bytes[BlockHeader::SIZE..end];
        header.verify(payload)?;
        if !matches!(header.kind, BlockKind::Leaf | BlockKind::Branch) {
            return Err(TesseraError::BlockCorrupted {
                block_id: header.block_id.0,
                reason: format!("{:?} block is not a node", header.kind),
            });
        }
        let node = NodeHeader::from_bytes(payload)?;
        let allocator = PackedAllocator::from_bytes(&payload[NodeHeader::SIZE..])?;
        Ok(Self {
            header,
            node,
            allocator,
        })
    }

    /// Visits every block id stored in the node.
    ///
    /// Walks the allocator elements tagged as block id arrays, so it needs
    /// no layout and works for leaves and branches alike.
    pub fn for_all_block_refs(&self, f: &mut dyn FnMut(BlockId) -> Result<()>) -> Result<()> {
        let tag = SubstreamKind::BlockIds.as_u8();
        for idx in 0..self.allocator.elements() {
            if self.allocator.is_empty(idx)? || self.allocator.element_kind(idx)? != tag {
                continue;
            }
            let view = SubstreamView::parse(SubstreamKind::BlockIds, self.allocator.element(idx)?)?;
            if let Some(refs) = view.as_block_references() {
                refs.for_each_block_ref(f)?;
            }
        }
        Ok(())
    }

    /// Every block id stored in the node.
    pub fn block_refs(&self) -> Result<Vec<BlockId>> {
        let mut refs = Vec::new();
        self.for_all_block_refs(&mut |id| {
            refs.push(id);
            Ok(())
        })?;
        Ok(refs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tessera_packed::SubstreamDescriptor;

    fn layout() -> NodeLayout {
        NodeLayout::new(vec![
            SubstreamDescriptor::fse_tree(0, 1),
            SubstreamDescriptor::block_ids(1),
        ])
        .unwrap()
    }

    #[test]
    fn test_node_header_roundtrip() {
        let mut header = NodeHeader::new(0xfeed_beef, 3);
        assert_eq!(header.next_leaf_id, BlockId::INVALID);
        header.set_root(true);
        let parsed = NodeHeader::from_bytes(&header.to_bytes()).unwrap();
        assert_eq!(parsed, header);
        assert!(parsed.is_root());

        header.next_leaf_id = BlockId(0x0102_0304_0506);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[16..24], &0x0102_0304_0506u64.to_le_bytes());
        assert_eq!(NodeHeader::from_bytes(&bytes).unwrap().next_leaf_id, BlockId(0x0102_0304_0506));

        header.set_root(false);
        assert!(!header.is_root());
    }

    #[test]
    fn test_node_block_roundtrip() {
        let layout = layout();
        let mut node =
            NodeBlock::new(BlockId(7), BlockKind::Leaf, 0, ContainerId(16), 1024, &layout).unwrap();
        node.set_root(true);
        node.set_next_leaf_id(BlockId(8));
        let bytes = node.to_bytes();
        assert_eq!(bytes.len(), 1024);

        let parsed = NodeBlock::from_bytes(&bytes).unwrap();
        assert_eq!(parsed, node);
        assert_eq!(parsed.next_leaf_id(), BlockId(8));
        assert!(parsed.check_layout(&layout).is_ok());
    }

    #[test]
    fn test_corrupted_block_is_rejected() {
        let layout = layout();
        let node =
            NodeBlock::new(BlockId(1), BlockKind::Leaf, 0, ContainerId(16), 512, &layout).unwrap();
        let mut bytes = node.to_bytes();
        bytes[100] ^= 0xff;
        let err = NodeBlock::from_bytes(&bytes).unwrap_err();
        assert!(err.to_string().contains("checksum mismatch"));
    }

    #[test]
    fn test_level_must_match_kind() {
        let layout = layout();
        assert!(
            NodeBlock::new(BlockId(1), BlockKind::Leaf, 1, ContainerId(16), 512, &layout).is_err()
        );
        assert!(
            NodeBlock::new(BlockId(1), BlockKind::Branch, 0, ContainerId(16), 512, &layout)
                .is_err()
        );
    }

    #[test]
    fn test_layout_mismatch() {
        let node = NodeBlock::new(BlockId(1), BlockKind::Leaf, 0, ContainerId(16), 512, &layout())
            .unwrap();
        let other = NodeLayout::new(vec![SubstreamDescriptor::vle_tree(0, 2)]).unwrap();
        assert!(matches!(
            node.check_layout(&other),
            Err(TesseraError::LayoutMismatch { .. })
        ));
    }

    #[test]
    fn test_block_refs_are_found_without_layout() {
        let layout = layout();
        let mut node =
            NodeBlock::new(BlockId(1), BlockKind::Leaf, 0, ContainerId(16), 1024, &layout).unwrap();
        let ids = tessera_packed::substream::block_ids::encode(&[5, 9]);
        let tag = SubstreamKind::BlockIds.as_u8();
        node.allocator_mut().allocate(1, ids.len(), tag).unwrap();
        node.allocator_mut().element_mut(1).unwrap().copy_from_slice(&ids);

        assert_eq!(node.block_refs().unwrap(), vec![BlockId(5), BlockId(9)]);
    }
}
