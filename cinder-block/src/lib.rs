//! Relocatable block serialization for Cinder scaffolds.
//!
//! A *block* is a single contiguous byte buffer holding arbitrary POD-like
//! data plus embedded internal pointers. Before fix-up the block is
//! position independent and can be written to disk or memory-mapped; after
//! [`block_initialize`] every pointer cell resolves directly, so the block
//! is usable without any parsing step.
//!
//! # Layout
//! ```text
//! 0x00: BlockHeader (32 bytes)
//! 0x20: primary block          (fixed-layout objects, pointer cells)
//! var:  trailing sub-blocks    (deep payload: vector contents, strings,
//!                               embedded nested blocks)
//! var:  internal-pointer table (u64 byte offset from block start per cell)
//! ```
//!
//! # Modules
//!
//! - [`serializer`] - [`BlockSerializer`], the write side
//! - [`block`] - header parsing and pointer fix-up
//! - [`view`] - typed read-only views over a fixed-up block

pub mod block;
pub mod serializer;
pub mod view;

pub use block::{
    AlignedBlock, BlockError, BlockHeader, block_duplicate, block_get_first_object,
    block_get_size, block_initialize, block_initialize_with_base,
};
pub use serializer::{BlockSerializer, RecallId, SerializeBlock, SpecialBuffer};
pub use view::{BlockView, SerializedVecView};

/// Flag bit marking a pointer cell whose target lies in the trailing
/// sub-block region. The remaining bits are the self-relative byte offset.
pub const PTR_FLAG_BIT: u64 = 1 << 63;

/// Mask selecting the offset portion of an encoded pointer cell.
pub const PTR_MASK: u64 = !PTR_FLAG_BIT;

/// Alignment of pointer cells and sub-block starts, in bytes.
pub const WORD_SIZE: usize = 8;
