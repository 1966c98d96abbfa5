//! Header parsing and pointer fix-up for relocatable blocks.
//!
//! A freshly loaded block is position independent: every pointer cell
//! holds a bit-tagged self-relative offset. [`block_initialize`] rewrites
//! the cells in place into resolved offsets measured from the data-region
//! base, after which the block is position dependent and directly usable
//! through [`crate::view::BlockView`].

use crate::{PTR_MASK, WORD_SIZE};

/// Owned block storage, aligned to the machine word so typed views can be
/// taken directly over the contained bytes.
#[derive(Debug, Clone, Default)]
pub struct AlignedBlock {
    words: Vec<u64>,
    len: usize,
}

impl AlignedBlock {
    /// Copies `bytes` into fresh word-aligned storage.
    pub fn from_bytes(bytes: &[u8]) -> Self {
        let mut words = vec![0u64; bytes.len().div_ceil(WORD_SIZE)];
        bytemuck::cast_slice_mut(&mut words)[..bytes.len()].copy_from_slice(bytes);
        Self {
            words,
            len: bytes.len(),
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl std::ops::Deref for AlignedBlock {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &bytemuck::cast_slice(&self.words)[..self.len]
    }
}

impl std::ops::DerefMut for AlignedBlock {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut bytemuck::cast_slice_mut(&mut self.words)[..self.len]
    }
}

impl AsRef<[u8]> for AlignedBlock {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

/// Errors raised while reading a serialized block.
#[derive(Debug, thiserror::Error)]
pub enum BlockError {
    #[error("block is truncated: expected at least {expected} bytes, got {actual}")]
    Truncated { expected: usize, actual: usize },
    #[error("block header is inconsistent: {0}")]
    BadHeader(&'static str),
    #[error("pointer cell at offset {cell} targets {target}, outside the block data region")]
    BadPointerTarget { cell: usize, target: usize },
    #[error("read at offset {offset}..{end} is out of bounds for data region of {len} bytes")]
    OutOfBounds { offset: usize, end: usize, len: usize },
    #[error("sub-block payload is not valid for the requested view: {0}")]
    BadPayload(&'static str),
}

/// Fixed-layout block header.
///
/// All fields are little-endian u64, machine word aligned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    /// Size of the whole block including this header and the pointer table.
    pub total_size: u64,
    /// Size of the primary region alone.
    pub primary_size: u64,
    /// Number of internal pointer cells.
    pub ptr_count: u64,
    /// Byte offset from block start to the internal-pointer table.
    pub ptr_table_offset: u64,
}

impl BlockHeader {
    pub const SIZE: usize = 32;

    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut bytes = [0u8; Self::SIZE];
        bytes[0..8].copy_from_slice(&self.total_size.to_le_bytes());
        bytes[8..16].copy_from_slice(&self.primary_size.to_le_bytes());
        bytes[16..24].copy_from_slice(&self.ptr_count.to_le_bytes());
        bytes[24..32].copy_from_slice(&self.ptr_table_offset.to_le_bytes());
        bytes
    }

    pub fn from_bytes(block: &[u8]) -> Result<Self, BlockError> {
        if block.len() < Self::SIZE {
            return Err(BlockError::Truncated {
                expected: Self::SIZE,
                actual: block.len(),
            });
        }
        let header = Self {
            total_size: u64::from_le_bytes(block[0..8].try_into().unwrap()),
            primary_size: u64::from_le_bytes(block[8..16].try_into().unwrap()),
            ptr_count: u64::from_le_bytes(block[16..24].try_into().unwrap()),
            ptr_table_offset: u64::from_le_bytes(block[24..32].try_into().unwrap()),
        };
        if (block.len() as u64) < header.total_size {
            return Err(BlockError::Truncated {
                expected: header.total_size as usize,
                actual: block.len(),
            });
        }
        let table_end = header
            .ptr_table_offset
            .checked_add(header.ptr_count * WORD_SIZE as u64)
            .ok_or(BlockError::BadHeader("pointer table overflows"))?;
        if table_end > header.total_size || header.ptr_table_offset < Self::SIZE as u64 {
            return Err(BlockError::BadHeader("pointer table out of range"));
        }
        if header.primary_size > header.ptr_table_offset - Self::SIZE as u64 {
            return Err(BlockError::BadHeader("primary region out of range"));
        }
        Ok(header)
    }
}

/// Rewrites every internal pointer cell from self-relative encoded form
/// into a resolved offset from the data-region start.
///
/// After this call the block is position dependent: running fix-up a
/// second time on the same bytes corrupts the cells. Call exactly once per
/// freshly loaded block.
pub fn block_initialize(block: &mut [u8]) -> Result<(), BlockError> {
    block_initialize_with_base(block, 0)
}

/// As [`block_initialize`], with every resolved cell biased by `base`.
pub fn block_initialize_with_base(block: &mut [u8], base: u64) -> Result<(), BlockError> {
    let header = BlockHeader::from_bytes(block)?;
    let data_len = header.ptr_table_offset as usize - BlockHeader::SIZE;
    for entry in 0..header.ptr_count as usize {
        let entry_offset = header.ptr_table_offset as usize + entry * WORD_SIZE;
        let cell_in_block =
            u64::from_le_bytes(block[entry_offset..entry_offset + WORD_SIZE].try_into().unwrap())
                as usize;
        if cell_in_block < BlockHeader::SIZE
            || cell_in_block + WORD_SIZE > header.ptr_table_offset as usize
        {
            return Err(BlockError::BadHeader("pointer table entry out of range"));
        }
        let cell = cell_in_block - BlockHeader::SIZE;
        let encoded = u64::from_le_bytes(
            block[cell_in_block..cell_in_block + WORD_SIZE].try_into().unwrap(),
        );
        let target = cell as u64 + (encoded & PTR_MASK);
        if target as usize > data_len {
            return Err(BlockError::BadPointerTarget {
                cell,
                target: target as usize,
            });
        }
        let resolved = base + target;
        block[cell_in_block..cell_in_block + WORD_SIZE].copy_from_slice(&resolved.to_le_bytes());
    }
    Ok(())
}

/// Returns the fixed-up address of the root object: the data region,
/// beginning at the primary block.
pub fn block_get_first_object(block: &[u8]) -> Result<&[u8], BlockError> {
    let header = BlockHeader::from_bytes(block)?;
    Ok(&block[BlockHeader::SIZE..header.ptr_table_offset as usize])
}

/// Total block size recorded in the header.
pub fn block_get_size(block: &[u8]) -> Result<u64, BlockError> {
    Ok(BlockHeader::from_bytes(block)?.total_size)
}

/// Copies a block into a fresh owned aligned buffer.
pub fn block_duplicate(block: &[u8]) -> Result<AlignedBlock, BlockError> {
    let size = block_get_size(block)? as usize;
    Ok(AlignedBlock::from_bytes(&block[..size]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::serializer::{BlockSerializer, SpecialBuffer};

    #[test]
    fn test_header_round_trip() {
        let header = BlockHeader {
            total_size: 128,
            primary_size: 40,
            ptr_count: 2,
            ptr_table_offset: 112,
        };
        let mut bytes = header.to_bytes().to_vec();
        bytes.resize(128, 0);
        assert_eq!(BlockHeader::from_bytes(&bytes).unwrap(), header);
    }

    #[test]
    fn test_from_bytes_rejects_truncation() {
        assert!(matches!(
            BlockHeader::from_bytes(&[0u8; 16]),
            Err(BlockError::Truncated { .. })
        ));
    }

    #[test]
    fn test_initialize_resolves_self_relative_cells() {
        let mut ser = BlockSerializer::new();
        ser.serialize_sub_block(&[1u32, 2, 3], SpecialBuffer::Vector);
        let mut block = ser.as_memory_block();

        let header = BlockHeader::from_bytes(&block).unwrap();
        let table = header.ptr_table_offset as usize;
        let cell_in_block =
            u64::from_le_bytes(block[table..table + 8].try_into().unwrap()) as usize;
        let before = u64::from_le_bytes(block[cell_in_block..cell_in_block + 8].try_into().unwrap());
        assert_ne!(before & crate::PTR_FLAG_BIT, 0);

        block_initialize(&mut block).unwrap();
        let after = u64::from_le_bytes(block[cell_in_block..cell_in_block + 8].try_into().unwrap());
        assert_eq!(after & crate::PTR_FLAG_BIT, 0);
        // the cell sits at data offset 0; the target is the trailing region
        assert_eq!(after, header.primary_size);
    }

    #[test]
    fn test_initialize_with_base_biases_cells() {
        let mut ser = BlockSerializer::new();
        ser.serialize_sub_block(&[9u8], SpecialBuffer::Vector);
        let mut plain = ser.as_memory_block();
        let mut biased = plain.clone();
        block_initialize(&mut plain).unwrap();
        block_initialize_with_base(&mut biased, 0x1000).unwrap();

        let header = BlockHeader::from_bytes(&plain).unwrap();
        let table = header.ptr_table_offset as usize;
        let cell = u64::from_le_bytes(plain[table..table + 8].try_into().unwrap()) as usize;
        let a = u64::from_le_bytes(plain[cell..cell + 8].try_into().unwrap());
        let b = u64::from_le_bytes(biased[cell..cell + 8].try_into().unwrap());
        assert_eq!(b - a, 0x1000);
    }

    #[test]
    fn test_first_object_and_size() {
        let mut ser = BlockSerializer::new();
        ser.serialize_u64(17);
        let block = ser.as_memory_block();
        let first = block_get_first_object(&block).unwrap();
        assert_eq!(u64::from_le_bytes(first[0..8].try_into().unwrap()), 17);
        assert_eq!(block_get_size(&block).unwrap() as usize, block.len());
    }

    #[test]
    fn test_duplicate_copies_exact_block() {
        let mut ser = BlockSerializer::new();
        ser.serialize_u32(3);
        let block = ser.as_memory_block();
        let copy = block_duplicate(&block).unwrap();
        assert_eq!(&copy[..], &block[..]);
    }
}
