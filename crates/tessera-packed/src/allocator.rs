//! Intra-block allocator hosting independently resizable elements.
//!
//! ```text
//! +--------------+---------------------+----------------+-----+------------------------+
//! | header (16)  | offsets[n + 1] (u32)| kinds[n] (u8)  | pad | element payloads  free |
//! +--------------+---------------------+----------------+-----+------------------------+
//! ^ 0                                                         ^ layout_size
//! ```
//!
//! Header: version, block size, layout size, element count (all u32 LE).
//! Element `i` occupies `[offsets[i], offsets[i + 1])` relative to the
//! payload start. Payloads are contiguous and 8-byte aligned; the area after
//! the last payload is zero. An element of size 0 is absent.

use bytes::{Buf, BufMut};
use tessera_common::{Result, TesseraError};

/// Alignment of element payloads.
pub const PACKED_ALIGNMENT: usize = 8;

/// Current layout version.
pub const ALLOCATOR_VERSION: u32 = 1;

/// Size of the allocator header.
pub const ALLOCATOR_HEADER_SIZE: usize = 16;

/// Rounds `size` up to the payload alignment.
#[inline]
pub fn align_up(size: usize) -> usize {
    size.div_ceil(PACKED_ALIGNMENT) * PACKED_ALIGNMENT
}

/// Replacement of one element, applied as part of an [`AllocationPlan`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ElementUpdate {
    /// Element index.
    pub index: usize,
    /// New payload and kind tag, or `None` to free the element.
    pub payload: Option<(Vec<u8>, u8)>,
}

impl ElementUpdate {
    pub fn replace(index: usize, bytes: Vec<u8>, kind: u8) -> Self {
        Self {
            index,
            payload: Some((bytes, kind)),
        }
    }

    pub fn free(index: usize) -> Self {
        Self {
            index,
            payload: None,
        }
    }
}

/// A validated set of element replacements for one allocator state.
#[derive(Debug, Clone)]
pub struct AllocationPlan {
    updates: Vec<Option<ElementUpdate>>,
    data_end: usize,
    free_space_delta: isize,
}

impl AllocationPlan {
    /// Change of free space once applied (negative when the plan grows).
    pub fn free_space_delta(&self) -> isize {
        self.free_space_delta
    }

    /// Payload bytes in use once applied.
    pub fn data_end(&self) -> usize {
        self.data_end
    }
}

/// Allocator over a single block of memory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PackedAllocator {
    buf: Vec<u8>,
}

impl PackedAllocator {
    /// Computes the layout size for `elements` directory entries.
    pub fn layout_size_for(elements: usize) -> usize {
        align_up(ALLOCATOR_HEADER_SIZE + 4 * (elements + 1) + elements)
    }

    /// Creates an allocator of `block_size` bytes with `elements` empty slots.
    pub fn new(block_size: usize, elements: usize) -> Result<Self> {
        let layout_size = Self::layout_size_for(elements);
        if layout_size > block_size || block_size > u32::MAX as usize {
            return Err(TesseraError::OutOfSpace {
                requested: layout_size,
                available: block_size,
            });
        }

        let mut buf = vec![0u8; block_size];
        {
            let mut header = &mut buf[..ALLOCATOR_HEADER_SIZE];
            header.put_u32_le(ALLOCATOR_VERSION);
            header.put_u32_le(block_size as u32);
            header.put_u32_le(layout_size as u32);
            header.put_u32_le(elements as u32);
        }
        Ok(Self { buf })
    }

    /// Restores an allocator from its byte image, validating the directory.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < ALLOCATOR_HEADER_SIZE {
            return Err(TesseraError::PackedCorrupted(format!(
                "allocator image of {} bytes is shorter than its header",
                bytes.len()
            )));
        }
        let mut header = &bytes[..ALLOCATOR_HEADER_SIZE];
        let version = header.get_u32_le();
        let block_size = header.get_u32_le() as usize;
        let layout_size = header.get_u32_le() as usize;
        let elements = header.get_u32_le() as usize;

        if version != ALLOCATOR_VERSION {
            return Err(TesseraError::PackedCorrupted(format!(
                "unsupported allocator version {}",
                version
            )));
        }
        if block_size != bytes.len() {
            return Err(TesseraError::BlockSizeMismatch {
                expected: block_size,
                actual: bytes.len(),
            });
        }
        if layout_size != Self::layout_size_for(elements) || layout_size > block_size {
            return Err(TesseraError::PackedCorrupted(format!(
                "layout size {} is invalid for {} elements",
                layout_size, elements
            )));
        }

        let allocator = Self {
            buf: bytes.to_vec(),
        };
        allocator.check()?;
        Ok(allocator)
    }

    /// The allocator's byte image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn header_u32(&self, pos: usize) -> usize {
        u32::from_le_bytes([
            self.buf[pos],
            self.buf[pos + 1],
            self.buf[pos + 2],
            self.buf[pos + 3],
        ]) as usize
    }

    fn set_header_u32(&mut self, pos: usize, value: usize) {
        self.buf[pos..pos + 4].copy_from_slice(&(value as u32).to_le_bytes());
    }

    pub fn block_size(&self) -> usize {
        self.header_u32(4)
    }

    pub fn layout_size(&self) -> usize {
        self.header_u32(8)
    }

    /// Number of element slots.
    pub fn elements(&self) -> usize {
        self.header_u32(12)
    }

    fn offset(&self, idx: usize) -> usize {
        self.header_u32(ALLOCATOR_HEADER_SIZE + 4 * idx)
    }

    fn set_offset(&mut self, idx: usize, value: usize) {
        self.set_header_u32(ALLOCATOR_HEADER_SIZE + 4 * idx, value);
    }

    fn kind_pos(&self, idx: usize) -> usize {
        ALLOCATOR_HEADER_SIZE + 4 * (self.elements() + 1) + idx
    }

    fn check_index(&self, idx: usize) -> Result<()> {
        if idx >= self.elements() {
            return Err(TesseraError::IndexOutOfBounds {
                index: idx,
                size: self.elements(),
            });
        }
        Ok(())
    }

    /// Payload bytes in use.
    pub fn data_end(&self) -> usize {
        self.offset(self.elements())
    }

    /// Bytes available to element payloads in total.
    pub fn client_area(&self) -> usize {
        self.block_size() - self.layout_size()
    }

    /// Bytes in use, directory included.
    pub fn allocated(&self) -> usize {
        self.layout_size() + self.data_end()
    }

    pub fn free_space(&self) -> usize {
        self.block_size() - self.allocated()
    }

    /// Absolute byte offset of element `idx`.
    pub fn element_offset(&self, idx: usize) -> Result<usize> {
        self.check_index(idx)?;
        Ok(self.layout_size() + self.offset(idx))
    }

    pub fn element_size(&self, idx: usize) -> Result<usize> {
        self.check_index(idx)?;
        Ok(self.offset(idx + 1) - self.offset(idx))
    }

    /// True if element `idx` has never been allocated, or was freed.
    pub fn is_empty(&self, idx: usize) -> Result<bool> {
        Ok(self.element_size(idx)? == 0)
    }

    pub fn element_kind(&self, idx: usize) -> Result<u8> {
        self.check_index(idx)?;
        Ok(self.buf[self.kind_pos(idx)])
    }

    pub fn element(&self, idx: usize) -> Result<&[u8]> {
        let start = self.element_offset(idx)?;
        let size = self.element_size(idx)?;
        Ok(&self.buf[start..start + size])
    }

    pub fn element_mut(&mut self, idx: usize) -> Result<&mut [u8]> {
        let start = self.element_offset(idx)?;
        let size = self.element_size(idx)?;
        Ok(&mut self.buf[start..start + size])
    }

    /// Allocates element `idx` with `size` zeroed bytes tagged `kind`.
    ///
    /// An existing element is resized and cleared.
    pub fn allocate(&mut self, idx: usize, size: usize, kind: u8) -> Result<()> {
        self.check_index(idx)?;
        let size = align_up(size.max(1));
        self.resize_block(idx, size)?;
        self.element_mut(idx)?.fill(0);
        let pos = self.kind_pos(idx);
        self.buf[pos] = kind;
        Ok(())
    }

    /// Resizes element `idx` in place, shifting every higher element.
    pub fn resize_block(&mut self, idx: usize, new_size: usize) -> Result<()> {
        self.check_index(idx)?;
        let new_size = align_up(new_size);
        let old_size = self.element_size(idx)?;
        if new_size == old_size {
            return Ok(());
        }

        let layout = self.layout_size();
        let data_end = self.data_end();
        let tail_start = layout + self.offset(idx + 1);
        let tail_end = layout + data_end;

        if new_size > old_size {
            let delta = new_size - old_size;
            if delta > self.free_space() {
                return Err(TesseraError::OutOfSpace {
                    requested: delta,
                    available: self.free_space(),
                });
            }
            self.buf.copy_within(tail_start..tail_end, tail_start + delta);
            self.buf[tail_start..tail_start + delta].fill(0);
            for j in idx + 1..=self.elements() {
                let off = self.offset(j);
                self.set_offset(j, off + delta);
            }
        } else {
            let delta = old_size - new_size;
            self.buf.copy_within(tail_start..tail_end, tail_start - delta);
            self.buf[tail_end - delta..tail_end].fill(0);
            for j in idx + 1..=self.elements() {
                let off = self.offset(j);
                self.set_offset(j, off - delta);
            }
        }
        Ok(())
    }

    /// Releases element `idx`.
    pub fn free(&mut self, idx: usize) -> Result<()> {
        self.resize_block(idx, 0)?;
        let pos = self.kind_pos(idx);
        self.buf[pos] = 0;
        Ok(())
    }

    /// Copies element `src_idx` of `src` into slot `dst_idx`.
    pub fn import_block(&mut self, dst_idx: usize, src: &PackedAllocator, src_idx: usize) -> Result<()> {
        let bytes = src.element(src_idx)?;
        let kind = src.element_kind(src_idx)?;
        self.check_index(dst_idx)?;
        if bytes.is_empty() {
            return self.free(dst_idx);
        }
        self.resize_block(dst_idx, bytes.len())?;
        self.element_mut(dst_idx)?.copy_from_slice(bytes);
        let pos = self.kind_pos(dst_idx);
        self.buf[pos] = kind;
        Ok(())
    }

    /// Changes the block size. The new size must hold every allocated byte.
    pub fn resize_allocator(&mut self, new_block_size: usize) -> Result<()> {
        if new_block_size < self.allocated() || new_block_size > u32::MAX as usize {
            return Err(TesseraError::OutOfSpace {
                requested: self.allocated(),
                available: new_block_size,
            });
        }
        self.buf.resize(new_block_size, 0);
        self.set_header_u32(4, new_block_size);
        Ok(())
    }

    /// Validates `updates` against the current state without mutating it.
    pub fn plan(&self, updates: Vec<ElementUpdate>) -> Result<AllocationPlan> {
        let elements = self.elements();
        let mut slots: Vec<Option<ElementUpdate>> = vec![None; elements];
        for update in updates {
            self.check_index(update.index)?;
            let idx = update.index;
            slots[idx] = Some(match update.payload {
                // an empty payload is an absent element, whatever its tag
                Some((bytes, _)) if bytes.is_empty() => ElementUpdate::free(idx),
                _ => update,
            });
        }

        let mut data_end = 0usize;
        for (idx, slot) in slots.iter().enumerate() {
            data_end += match slot {
                Some(ElementUpdate {
                    payload: Some((bytes, _)),
                    ..
                }) => align_up(bytes.len()),
                Some(ElementUpdate { payload: None, .. }) => 0,
                None => self.element_size(idx)?,
            };
        }

        if data_end > self.client_area() {
            return Err(TesseraError::OutOfSpace {
                requested: data_end - self.data_end(),
                available: self.free_space(),
            });
        }

        Ok(AllocationPlan {
            updates: slots,
            data_end,
            free_space_delta: self.data_end() as isize - data_end as isize,
        })
    }

    /// Applies a plan produced by [`plan`](Self::plan) on this same state.
    pub(crate) fn apply(&mut self, plan: AllocationPlan) {
        let layout = self.layout_size();
        let elements = self.elements();
        let mut data = vec![0u8; self.client_area()];
        let mut kinds = Vec::with_capacity(elements);
        let mut offsets = Vec::with_capacity(elements + 1);
        let mut pos = 0usize;

        for (idx, slot) in plan.updates.into_iter().enumerate() {
            offsets.push(pos);
            match slot {
                Some(ElementUpdate {
                    payload: Some((bytes, kind)),
                    ..
                }) => {
                    data[pos..pos + bytes.len()].copy_from_slice(&bytes);
                    pos += align_up(bytes.len());
                    kinds.push(kind);
                }
                Some(ElementUpdate { payload: None, .. }) => kinds.push(0),
                None => {
                    let start = layout + self.offset(idx);
                    let size = self.offset(idx + 1) - self.offset(idx);
                    data[pos..pos + size].copy_from_slice(&self.buf[start..start + size]);
                    pos += size;
                    kinds.push(self.buf[self.kind_pos(idx)]);
                }
            }
        }
        offsets.push(pos);

        for (idx, off) in offsets.into_iter().enumerate() {
            self.set_offset(idx, off);
        }
        for (idx, kind) in kinds.into_iter().enumerate() {
            let kp = self.kind_pos(idx);
            self.buf[kp] = kind;
        }
        self.buf[layout..].copy_from_slice(&data);
    }

    /// Verifies header and directory invariants.
    pub fn check(&self) -> Result<()> {
        let elements = self.elements();
        if self.buf.len() != self.block_size() {
            return Err(TesseraError::BlockSizeMismatch {
                expected: self.block_size(),
                actual: self.buf.len(),
            });
        }
        if self.offset(0) != 0 {
            return Err(TesseraError::PackedCorrupted(
                "first element does not start at the payload area".to_string(),
            ));
        }
        for idx in 0..elements {
            let (start, end) = (self.offset(idx), self.offset(idx + 1));
            if end < start || start % PACKED_ALIGNMENT != 0 || end % PACKED_ALIGNMENT != 0 {
                return Err(TesseraError::PackedCorrupted(format!(
                    "element {} has invalid bounds [{}, {})",
                    idx, start, end
                )));
            }
        }
        if self.allocated() > self.block_size() {
            return Err(TesseraError::PackedCorrupted(format!(
                "{} bytes allocated in a block of {}",
                self.allocated(),
                self.block_size()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fill(alloc: &mut PackedAllocator, idx: usize, byte: u8) {
        alloc.element_mut(idx).unwrap().fill(byte);
    }

    #[test]
    fn test_new_allocator_layout() {
        let alloc = PackedAllocator::new(1024, 4).unwrap();
        assert_eq!(alloc.block_size(), 1024);
        assert_eq!(alloc.elements(), 4);
        // 16 + 4 * 5 + 4 = 40
        assert_eq!(alloc.layout_size(), 40);
        assert_eq!(alloc.client_area(), 984);
        assert_eq!(alloc.free_space(), 984);
        for idx in 0..4 {
            assert!(alloc.is_empty(idx).unwrap());
        }
    }

    #[test]
    fn test_new_allocator_too_small() {
        let err = PackedAllocator::new(32, 8).unwrap_err();
        assert!(err.is_out_of_space());
    }

    #[test]
    fn test_allocate_and_align() {
        let mut alloc = PackedAllocator::new(512, 3).unwrap();
        alloc.allocate(1, 13, 7).unwrap();
        assert_eq!(alloc.element_size(1).unwrap(), 16);
        assert_eq!(alloc.element_kind(1).unwrap(), 7);
        assert!(alloc.is_empty(0).unwrap());
        assert!(!alloc.is_empty(1).unwrap());
        assert_eq!(alloc.free_space(), alloc.client_area() - 16);
    }

    #[test]
    fn test_allocate_out_of_space() {
        let mut alloc = PackedAllocator::new(128, 2).unwrap();
        let client = alloc.client_area();
        alloc.allocate(0, client, 1).unwrap();
        let err = alloc.allocate(1, 8, 1).unwrap_err();
        assert!(matches!(
            err,
            TesseraError::OutOfSpace {
                requested: 8,
                available: 0
            }
        ));
    }

    #[test]
    fn test_resize_preserves_other_elements() {
        let mut alloc = PackedAllocator::new(1024, 3).unwrap();
        alloc.allocate(0, 16, 1).unwrap();
        alloc.allocate(1, 24, 2).unwrap();
        alloc.allocate(2, 8, 3).unwrap();
        fill(&mut alloc, 0, 0xAA);
        fill(&mut alloc, 1, 0xBB);
        fill(&mut alloc, 2, 0xCC);

        alloc.resize_block(0, 64).unwrap();
        assert!(alloc.element(1).unwrap().iter().all(|&b| b == 0xBB));
        assert!(alloc.element(2).unwrap().iter().all(|&b| b == 0xCC));
        assert_eq!(&alloc.element(0).unwrap()[..16], &[0xAA; 16]);
        assert!(alloc.element(0).unwrap()[16..].iter().all(|&b| b == 0));

        alloc.resize_block(1, 8).unwrap();
        assert_eq!(alloc.element(1).unwrap(), &[0xBB; 8]);
        assert!(alloc.element(2).unwrap().iter().all(|&b| b == 0xCC));
        alloc.check().unwrap();
    }

    #[test]
    fn test_free_slot_is_distinguishable() {
        let mut alloc = PackedAllocator::new(256, 2).unwrap();
        alloc.allocate(0, 8, 4).unwrap();
        alloc.free(0).unwrap();
        assert!(alloc.is_empty(0).unwrap());
        assert_eq!(alloc.element_kind(0).unwrap(), 0);
        assert_eq!(alloc.data_end(), 0);
    }

    #[test]
    fn test_shrink_zeroes_free_area() {
        let mut alloc = PackedAllocator::new(256, 2).unwrap();
        alloc.allocate(0, 32, 1).unwrap();
        alloc.allocate(1, 32, 1).unwrap();
        fill(&mut alloc, 1, 0x11);
        alloc.free(0).unwrap();

        let layout = alloc.layout_size();
        let bytes = alloc.as_bytes();
        assert!(bytes[layout + 32..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_import_block() {
        let mut src = PackedAllocator::new(256, 2).unwrap();
        src.allocate(1, 24, 5).unwrap();
        fill(&mut src, 1, 0x5A);

        let mut dst = PackedAllocator::new(512, 3).unwrap();
        dst.import_block(2, &src, 1).unwrap();
        assert_eq!(dst.element(2).unwrap(), src.element(1).unwrap());
        assert_eq!(dst.element_kind(2).unwrap(), 5);

        dst.import_block(2, &src, 0).unwrap();
        assert!(dst.is_empty(2).unwrap());
    }

    #[test]
    fn test_index_out_of_bounds() {
        let alloc = PackedAllocator::new(256, 2).unwrap();
        assert!(matches!(
            alloc.element_size(2),
            Err(TesseraError::IndexOutOfBounds { index: 2, size: 2 })
        ));
    }

    #[test]
    fn test_bytes_roundtrip_and_validation() {
        let mut alloc = PackedAllocator::new(256, 2).unwrap();
        alloc.allocate(0, 40, 3).unwrap();
        fill(&mut alloc, 0, 0x42);

        let restored = PackedAllocator::from_bytes(alloc.as_bytes()).unwrap();
        assert_eq!(restored, alloc);

        let mut corrupted = alloc.as_bytes().to_vec();
        corrupted[0] = 9;
        assert!(PackedAllocator::from_bytes(&corrupted).is_err());

        let truncated = &alloc.as_bytes()[..128];
        assert!(matches!(
            PackedAllocator::from_bytes(truncated),
            Err(TesseraError::BlockSizeMismatch { .. })
        ));
    }

    #[test]
    fn test_resize_allocator() {
        let mut alloc = PackedAllocator::new(256, 2).unwrap();
        alloc.allocate(0, 100, 1).unwrap();
        alloc.resize_allocator(1024).unwrap();
        assert_eq!(alloc.block_size(), 1024);
        assert_eq!(alloc.as_bytes().len(), 1024);
        assert!(alloc.resize_allocator(64).is_err());
        alloc.check().unwrap();
    }

    #[test]
    fn test_plan_and_apply() {
        let mut alloc = PackedAllocator::new(512, 3).unwrap();
        alloc.allocate(0, 16, 1).unwrap();
        alloc.allocate(2, 16, 3).unwrap();
        fill(&mut alloc, 2, 0x33);

        let plan = alloc
            .plan(vec![
                ElementUpdate::replace(0, vec![7u8; 40], 1),
                ElementUpdate::replace(1, vec![9u8; 8], 2),
            ])
            .unwrap();
        assert_eq!(plan.free_space_delta(), -48);
        alloc.apply(plan);

        assert_eq!(alloc.element(0).unwrap(), &[7u8; 40]);
        assert_eq!(alloc.element(1).unwrap(), &[9u8; 8]);
        assert_eq!(alloc.element(2).unwrap(), &[0x33; 16]);
        assert_eq!(alloc.element_kind(1).unwrap(), 2);
        alloc.check().unwrap();
    }

    #[test]
    fn test_empty_replacement_frees_the_element() {
        let mut alloc = PackedAllocator::new(256, 2).unwrap();
        alloc.allocate(0, 24, 1).unwrap();
        let plan = alloc
            .plan(vec![
                ElementUpdate::replace(0, Vec::new(), 4),
                ElementUpdate::replace(1, Vec::new(), 5),
            ])
            .unwrap();
        assert_eq!(plan.free_space_delta(), 24);
        alloc.apply(plan);

        for idx in 0..2 {
            assert!(alloc.is_empty(idx).unwrap());
            assert_eq!(alloc.element_kind(idx).unwrap(), 0);
        }
        alloc.check().unwrap();
    }

    #[test]
    fn test_plan_rejects_overflow_without_mutation() {
        let mut alloc = PackedAllocator::new(128, 2).unwrap();
        alloc.allocate(0, 16, 1).unwrap();
        let before = alloc.clone();
        let err = alloc
            .plan(vec![ElementUpdate::replace(1, vec![0u8; 200], 1)])
            .unwrap_err();
        assert!(err.is_out_of_space());
        assert_eq!(alloc, before);
    }
}
