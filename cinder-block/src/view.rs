//! Typed read-only views over a fixed-up block.
//!
//! Views translate resolved pointer cells into slices borrowed from the
//! block; nothing is copied and nothing is owned. Dropping a view never
//! touches the underlying storage, which keeps the non-owning contract
//! for containers reconstituted out of serialized blocks.

use crate::WORD_SIZE;
use crate::block::{BlockError, BlockHeader};

/// Read-only window over a block that has been through
/// [`crate::block::block_initialize`] with the default base.
#[derive(Debug, Clone, Copy)]
pub struct BlockView<'a> {
    data: &'a [u8],
    primary_size: usize,
}

impl<'a> BlockView<'a> {
    pub fn new(block: &'a [u8]) -> Result<Self, BlockError> {
        let header = BlockHeader::from_bytes(block)?;
        Ok(Self {
            data: &block[BlockHeader::SIZE..header.ptr_table_offset as usize],
            primary_size: header.primary_size as usize,
        })
    }

    /// Wraps a bare data region (no header), as produced by embedding a
    /// nested serializer into a parent block.
    pub fn from_data(data: &'a [u8], primary_size: usize) -> Self {
        Self { data, primary_size }
    }

    /// The whole data region: primary plus trailing.
    pub fn bytes(&self) -> &'a [u8] {
        self.data
    }

    /// The root object bytes (primary region).
    pub fn first_object(&self) -> &'a [u8] {
        &self.data[..self.primary_size.min(self.data.len())]
    }

    /// Reads a resolved pointer cell, returning the target's data-region
    /// offset.
    pub fn resolve(&self, cell_offset: usize) -> Result<usize, BlockError> {
        let bytes = self.slice_at(cell_offset, WORD_SIZE)?;
        let target = u64::from_le_bytes(bytes.try_into().unwrap()) as usize;
        if target > self.data.len() {
            return Err(BlockError::BadPointerTarget {
                cell: cell_offset,
                target,
            });
        }
        Ok(target)
    }

    /// Reads the u64 count cell that follows a pointer cell.
    pub fn count_at(&self, cell_offset: usize) -> Result<usize, BlockError> {
        let bytes = self.slice_at(cell_offset + WORD_SIZE, WORD_SIZE)?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()) as usize)
    }

    pub fn slice_at(&self, offset: usize, len: usize) -> Result<&'a [u8], BlockError> {
        let end = offset.checked_add(len).ok_or(BlockError::OutOfBounds {
            offset,
            end: usize::MAX,
            len: self.data.len(),
        })?;
        if end > self.data.len() {
            return Err(BlockError::OutOfBounds {
                offset,
                end,
                len: self.data.len(),
            });
        }
        Ok(&self.data[offset..end])
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, BlockError> {
        Ok(u32::from_le_bytes(self.slice_at(offset, 4)?.try_into().unwrap()))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, BlockError> {
        Ok(u64::from_le_bytes(self.slice_at(offset, 8)?.try_into().unwrap()))
    }

    /// Reconstitutes a Vector-tagged sub-block written at `cell_offset`.
    pub fn vec_view<T: bytemuck::AnyBitPattern>(
        &self,
        cell_offset: usize,
    ) -> Result<SerializedVecView<'a, T>, BlockError> {
        let target = self.resolve(cell_offset)?;
        let count = self.count_at(cell_offset)?;
        let byte_len = count
            .checked_mul(size_of::<T>())
            .ok_or(BlockError::BadPayload("element count overflows"))?;
        let bytes = self.slice_at(target, byte_len)?;
        let items = bytemuck::try_cast_slice(bytes)
            .map_err(|_| BlockError::BadPayload("misaligned or ill-sized element bytes"))?;
        Ok(SerializedVecView { items })
    }

    /// Reconstitutes a String-tagged sub-block written at `cell_offset`.
    pub fn string_view(&self, cell_offset: usize) -> Result<&'a str, BlockError> {
        let target = self.resolve(cell_offset)?;
        let len = self.count_at(cell_offset)?;
        let bytes = self.slice_at(target, len)?;
        std::str::from_utf8(bytes).map_err(|_| BlockError::BadPayload("string is not UTF-8"))
    }
}

/// Non-owning view of a serialized vector.
///
/// The element storage belongs to the block; this type only borrows it.
#[derive(Debug, Clone, Copy)]
pub struct SerializedVecView<'a, T> {
    items: &'a [T],
}

impl<'a, T> SerializedVecView<'a, T> {
    pub fn as_slice(&self) -> &'a [T] {
        self.items
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'a, T> {
        self.items.iter()
    }
}

impl<'a, T> std::ops::Index<usize> for SerializedVecView<'a, T> {
    type Output = T;
    fn index(&self, index: usize) -> &T {
        &self.items[index]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::block_initialize;
    use crate::serializer::{BlockSerializer, SpecialBuffer};

    fn build(values: &[f32]) -> Vec<u8> {
        let mut ser = BlockSerializer::new();
        ser.serialize_u32(values.len() as u32);
        ser.serialize_sub_block(values, SpecialBuffer::Vector);
        let mut block = ser.as_memory_block();
        block_initialize(&mut block).unwrap();
        block.to_vec()
    }

    #[test]
    fn test_vec_view_matches_written_elements() {
        let values = [0.5f32, -2.0, 12.25];
        let block = build(&values);
        let view = BlockView::new(&block).unwrap();
        assert_eq!(view.read_u32(0).unwrap(), 3);
        let read = view.vec_view::<f32>(4).unwrap();
        assert_eq!(read.len(), 3);
        assert_eq!(read.as_slice(), &values);
    }

    #[test]
    fn test_out_of_bounds_read_is_error() {
        let block = build(&[1.0]);
        let view = BlockView::new(&block).unwrap();
        assert!(view.slice_at(view.bytes().len(), 1).is_err());
        assert!(view.read_u64(usize::MAX - 4).is_err());
    }

    #[test]
    fn test_empty_vector_view() {
        let mut ser = BlockSerializer::new();
        ser.serialize_sub_block::<u64>(&[], SpecialBuffer::Vector);
        let mut block = ser.as_memory_block();
        block_initialize(&mut block).unwrap();
        let view = BlockView::new(&block).unwrap();
        let read = view.vec_view::<u64>(0).unwrap();
        assert!(read.is_empty());
    }
}
