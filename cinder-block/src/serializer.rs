//! Write side of the relocatable block format.
//!
//! [`BlockSerializer`] accumulates primitive values, raw ranges and
//! sub-blocks into two growing buffers: the primary block (fixed-layout
//! data plus pointer cells) and the trailing sub-block region (deep
//! payload). [`BlockSerializer::as_memory_block`] emits the final
//! relocatable buffer with every pointer cell in self-relative encoded
//! form.

use crate::block::{AlignedBlock, BlockHeader};
use crate::{PTR_FLAG_BIT, WORD_SIZE};

/// Tag describing the container convention of a sub-block, so readers can
/// reconstitute the matching view type.
///
/// Containers materialised from a serialized block are non-owning; the
/// bytes belong to the block and must never be freed through the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SpecialBuffer {
    /// No container convention; a single pointer cell.
    #[default]
    Unknown,
    /// Pointer cell + u64 element count.
    Vector,
    /// Pointer cell + u64 byte length (UTF-8 payload).
    String,
    /// Single pointer cell to one object.
    UniquePtr,
    /// Pointer cell + u64 element count.
    IteratorRange,
    /// Pointer cell + u64 byte length.
    StringSection,
}

impl SpecialBuffer {
    fn has_count_cell(self) -> bool {
        !matches!(self, SpecialBuffer::Unknown | SpecialBuffer::UniquePtr)
    }
}

/// Opaque handle to a reserved slot, returned by
/// [`BlockSerializer::create_recall`]. Consumed exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecallId(u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Primary,
    Trailing,
}

#[derive(Debug, Clone, Copy)]
struct InternalPointer {
    cell_region: Region,
    cell_offset: usize,
    /// Target byte offset within the trailing region.
    target_offset: usize,
}

#[derive(Debug, Clone, Copy)]
struct Recall {
    id: u32,
    offset: usize,
    size: usize,
}

/// Pointer-preserving binary serializer.
///
/// Single-owner: exclusive mutation while writing; the produced byte block
/// is immutable and shareable once returned.
#[derive(Debug, Default)]
pub struct BlockSerializer {
    primary: Vec<u8>,
    trailing: Vec<u8>,
    internal_pointers: Vec<InternalPointer>,
    pending_recalls: Vec<Recall>,
    next_recall_id: u32,
}

impl BlockSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a primitive at the current primary-block cursor.
    pub fn serialize_u8(&mut self, value: u8) {
        self.primary.push(value);
    }

    pub fn serialize_u16(&mut self, value: u16) {
        self.primary.extend_from_slice(&value.to_le_bytes());
    }

    pub fn serialize_u32(&mut self, value: u32) {
        self.primary.extend_from_slice(&value.to_le_bytes());
    }

    pub fn serialize_u64(&mut self, value: u64) {
        self.primary.extend_from_slice(&value.to_le_bytes());
    }

    pub fn serialize_f32(&mut self, value: f32) {
        self.primary.extend_from_slice(&value.to_le_bytes());
    }

    /// Appends a string as a String-tagged sub-block.
    pub fn serialize_string(&mut self, value: &str) {
        self.serialize_raw_sub_block(value.as_bytes(), value.len(), SpecialBuffer::String);
    }

    /// Appends `size_in_bytes` zero bytes at the primary-block cursor.
    pub fn add_padding(&mut self, size_in_bytes: usize) {
        self.primary.resize(self.primary.len() + size_in_bytes, 0);
    }

    /// Appends raw bytes to the primary block, without pointer semantics.
    pub fn serialize_raw(&mut self, data: &[u8]) {
        self.primary.extend_from_slice(data);
    }

    /// Appends a POD value byte-for-byte to the primary block.
    pub fn serialize_pod<T: bytemuck::NoUninit>(&mut self, value: &T) {
        self.primary.extend_from_slice(bytemuck::bytes_of(value));
    }

    /// Writes a pointer cell targeting a newly appended trailing sub-block
    /// holding `items` verbatim. For tags with a count convention the
    /// element count follows the pointer cell in the primary block.
    pub fn serialize_sub_block<T: bytemuck::NoUninit>(
        &mut self,
        items: &[T],
        special: SpecialBuffer,
    ) {
        self.serialize_raw_sub_block(bytemuck::cast_slice(items), items.len(), special);
    }

    /// As [`Self::serialize_sub_block`], but each element is re-serialized
    /// through a transient serializer, so transitive pointers nest.
    pub fn serialize_items<T: SerializeBlock>(&mut self, items: &[T], special: SpecialBuffer) {
        let mut transient = BlockSerializer::new();
        for item in items {
            item.serialize(&mut transient);
        }
        self.serialize_nested_with_count(&transient, items.len(), special);
    }

    /// Embeds a finished nested serializer's block as a sub-block,
    /// adjusting all of its internal pointer cells into this serializer's
    /// frame.
    pub fn serialize_nested(&mut self, nested: &BlockSerializer, special: SpecialBuffer) {
        self.serialize_nested_with_count(nested, 1, special);
    }

    fn serialize_nested_with_count(
        &mut self,
        nested: &BlockSerializer,
        count: usize,
        special: SpecialBuffer,
    ) {
        assert!(
            nested.pending_recalls.is_empty(),
            "embedding a nested serializer with unconsumed recalls"
        );
        self.align_trailing();
        let base = self.trailing.len();
        let nested_primary_len = nested.primary.len();
        self.write_pointer_cell(base, count, special);
        self.trailing.extend_from_slice(&nested.primary);
        // keep the nested trailing region aligned the same way the nested
        // serializer would have laid it out
        let pad = nested_primary_len.next_multiple_of(WORD_SIZE) - nested_primary_len;
        self.trailing.resize(self.trailing.len() + pad, 0);
        let nested_trailing_base = base + nested_primary_len + pad;
        self.trailing.extend_from_slice(&nested.trailing);

        for ptr in &nested.internal_pointers {
            let cell_offset = match ptr.cell_region {
                Region::Primary => base + ptr.cell_offset,
                Region::Trailing => nested_trailing_base + ptr.cell_offset,
            };
            self.internal_pointers.push(InternalPointer {
                cell_region: Region::Trailing,
                cell_offset,
                target_offset: nested_trailing_base + ptr.target_offset,
            });
        }
    }

    fn serialize_raw_sub_block(&mut self, data: &[u8], count: usize, special: SpecialBuffer) {
        self.align_trailing();
        let target = self.trailing.len();
        self.trailing.extend_from_slice(data);
        self.write_pointer_cell(target, count, special);
    }

    // Cells are written at the current cursor without alignment padding;
    // record framing in scaffold streams fixes cell offsets, and cells are
    // always read byte-wise. Sub-block targets stay word-aligned so typed
    // views can cast their payload.
    fn write_pointer_cell(&mut self, target_offset: usize, count: usize, special: SpecialBuffer) {
        self.internal_pointers.push(InternalPointer {
            cell_region: Region::Primary,
            cell_offset: self.primary.len(),
            target_offset,
        });
        self.serialize_u64(0); // placeholder, rewritten at as_memory_block
        if special.has_count_cell() {
            self.serialize_u64(count as u64);
        }
    }

    fn align_trailing(&mut self) {
        let len = self.trailing.len().next_multiple_of(WORD_SIZE);
        self.trailing.resize(len, 0);
    }

    /// Reserves `size` zeroed bytes at the primary-block cursor.
    ///
    /// The returned id is consumed by exactly one of
    /// [`Self::push_at_recall`] or [`Self::push_size_value_at_recall`].
    pub fn create_recall(&mut self, size: usize) -> RecallId {
        let id = self.next_recall_id;
        self.next_recall_id += 1;
        self.pending_recalls.push(Recall {
            id,
            offset: self.primary.len(),
            size,
        });
        self.primary.resize(self.primary.len() + size, 0);
        RecallId(id)
    }

    /// Overwrites a reserved slot with the given bytes.
    ///
    /// # Panics
    ///
    /// Panics if the recall was already consumed or `value` does not match
    /// the reserved size.
    pub fn push_at_recall(&mut self, recall: RecallId, value: &[u8]) {
        let recall = self.take_recall(recall);
        assert_eq!(
            value.len(),
            recall.size,
            "recall value size does not match the reserved slot"
        );
        self.primary[recall.offset..recall.offset + recall.size].copy_from_slice(value);
    }

    /// Overwrites a reserved slot with the number of bytes appended to the
    /// primary block since the recall's creation, expressed in the slot's
    /// native width (4 or 8 bytes).
    ///
    /// # Panics
    ///
    /// Panics if the recall was already consumed, the slot width is not 4
    /// or 8 bytes, or the byte count does not fit the slot.
    pub fn push_size_value_at_recall(&mut self, recall: RecallId) {
        let recall = self.take_recall(recall);
        let appended = self.primary.len() - (recall.offset + recall.size);
        let slot = &mut self.primary[recall.offset..recall.offset + recall.size];
        match recall.size {
            4 => {
                let v = u32::try_from(appended).expect("recall size value exceeds u32 slot");
                slot.copy_from_slice(&v.to_le_bytes());
            }
            8 => slot.copy_from_slice(&(appended as u64).to_le_bytes()),
            other => panic!("unsupported recall slot width: {other}"),
        }
    }

    fn take_recall(&mut self, recall: RecallId) -> Recall {
        let idx = self
            .pending_recalls
            .iter()
            .position(|r| r.id == recall.0)
            .expect("recall id is unknown or already consumed");
        self.pending_recalls.swap_remove(idx)
    }

    /// Total byte count: primary plus trailing regions.
    pub fn size(&self) -> usize {
        self.primary.len() + self.trailing.len()
    }

    /// Byte count of the primary block alone.
    pub fn size_primary_block(&self) -> usize {
        self.primary.len()
    }

    /// Emits the finished relocatable block: header, primary and trailing
    /// regions concatenated, and the internal-pointer table, with every
    /// pointer cell rewritten as a bit-tagged self-relative offset.
    pub fn as_memory_block(&self) -> AlignedBlock {
        let primary_len = self.primary.len().next_multiple_of(WORD_SIZE);
        let data_len = primary_len + self.trailing.len();
        let table_offset = BlockHeader::SIZE + data_len.next_multiple_of(WORD_SIZE);
        let total = table_offset + self.internal_pointers.len() * WORD_SIZE;

        let header = BlockHeader {
            total_size: total as u64,
            primary_size: primary_len as u64,
            ptr_count: self.internal_pointers.len() as u64,
            ptr_table_offset: table_offset as u64,
        };

        let mut block = Vec::with_capacity(total);
        block.extend_from_slice(&header.to_bytes());
        block.extend_from_slice(&self.primary);
        block.resize(BlockHeader::SIZE + primary_len, 0);
        block.extend_from_slice(&self.trailing);
        block.resize(table_offset, 0);

        for ptr in &self.internal_pointers {
            let cell = match ptr.cell_region {
                Region::Primary => ptr.cell_offset,
                Region::Trailing => primary_len + ptr.cell_offset,
            };
            let target = primary_len + ptr.target_offset;
            let encoded = (target - cell) as u64 | PTR_FLAG_BIT;
            let cell_in_block = BlockHeader::SIZE + cell;
            block[cell_in_block..cell_in_block + WORD_SIZE].copy_from_slice(&encoded.to_le_bytes());
            block.extend_from_slice(&(cell_in_block as u64).to_le_bytes());
        }

        AlignedBlock::from_bytes(&block)
    }
}

/// Objects that serialize themselves into a [`BlockSerializer`].
///
/// Plays the role the serialization-operator overload set plays in the
/// engine's other tool code: anything placed in a non-POD sub-block
/// implements this.
pub trait SerializeBlock {
    fn serialize(&self, serializer: &mut BlockSerializer);
}

impl SerializeBlock for u8 {
    fn serialize(&self, serializer: &mut BlockSerializer) {
        serializer.serialize_u8(*self);
    }
}

impl SerializeBlock for u16 {
    fn serialize(&self, serializer: &mut BlockSerializer) {
        serializer.serialize_u16(*self);
    }
}

impl SerializeBlock for u32 {
    fn serialize(&self, serializer: &mut BlockSerializer) {
        serializer.serialize_u32(*self);
    }
}

impl SerializeBlock for u64 {
    fn serialize(&self, serializer: &mut BlockSerializer) {
        serializer.serialize_u64(*self);
    }
}

impl SerializeBlock for f32 {
    fn serialize(&self, serializer: &mut BlockSerializer) {
        serializer.serialize_f32(*self);
    }
}

impl SerializeBlock for String {
    fn serialize(&self, serializer: &mut BlockSerializer) {
        serializer.serialize_string(self);
    }
}

impl<A: SerializeBlock, B: SerializeBlock> SerializeBlock for (A, B) {
    fn serialize(&self, serializer: &mut BlockSerializer) {
        self.0.serialize(serializer);
        self.1.serialize(serializer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::block::{BlockHeader, block_get_size, block_initialize};
    use crate::view::BlockView;

    #[test]
    fn test_empty_serializer_header_only_block() {
        let ser = BlockSerializer::new();
        let block = ser.as_memory_block();
        assert_eq!(block.len(), BlockHeader::SIZE);
        assert_eq!(block_get_size(&block).unwrap(), BlockHeader::SIZE as u64);
        assert_eq!(ser.size(), 0);
        assert_eq!(ser.size_primary_block(), 0);
    }

    #[test]
    fn test_primitive_values_round_trip() {
        let mut ser = BlockSerializer::new();
        ser.serialize_u32(0xDEAD_BEEF);
        ser.serialize_f32(1.5);
        let mut block = ser.as_memory_block();
        block_initialize(&mut block).unwrap();

        let view = BlockView::new(&block).unwrap();
        let first = view.first_object();
        assert_eq!(u32::from_le_bytes(first[0..4].try_into().unwrap()), 0xDEAD_BEEF);
        assert_eq!(f32::from_le_bytes(first[4..8].try_into().unwrap()), 1.5);
    }

    #[test]
    fn test_pod_sub_block_round_trip() {
        let values: Vec<u32> = (0..64).collect();
        let mut ser = BlockSerializer::new();
        ser.serialize_sub_block(&values, SpecialBuffer::Vector);
        let mut block = ser.as_memory_block();
        block_initialize(&mut block).unwrap();

        let view = BlockView::new(&block).unwrap();
        let read = view.vec_view::<u32>(0).unwrap();
        assert_eq!(read.as_slice(), values.as_slice());
    }

    #[test]
    fn test_string_sub_block_round_trip() {
        let mut ser = BlockSerializer::new();
        ser.serialize_string("skeleton:thigh_l");
        let mut block = ser.as_memory_block();
        block_initialize(&mut block).unwrap();

        let view = BlockView::new(&block).unwrap();
        assert_eq!(view.string_view(0).unwrap(), "skeleton:thigh_l");
    }

    #[test]
    fn test_nested_serializer_pointers_adjusted() {
        // inner block carries its own sub-block; embedding it must keep
        // the inner pointer resolvable from the host frame
        let inner_payload: Vec<u16> = vec![7, 11, 13];
        let mut inner = BlockSerializer::new();
        inner.serialize_u64(42);
        inner.serialize_sub_block(&inner_payload, SpecialBuffer::Vector);

        let mut outer = BlockSerializer::new();
        outer.serialize_u64(99);
        outer.serialize_nested(&inner, SpecialBuffer::UniquePtr);

        let mut block = outer.as_memory_block();
        block_initialize(&mut block).unwrap();
        let view = BlockView::new(&block).unwrap();

        let first = view.first_object();
        assert_eq!(u64::from_le_bytes(first[0..8].try_into().unwrap()), 99);

        // cell at offset 8 points at the embedded inner primary block
        let inner_start = view.resolve(8).unwrap();
        let inner_bytes = view.slice_at(inner_start, 8).unwrap();
        assert_eq!(u64::from_le_bytes(inner_bytes.try_into().unwrap()), 42);

        // the inner sub-block pointer lives 8 bytes into the inner primary
        let read = view.vec_view::<u16>(inner_start + 8).unwrap();
        assert_eq!(read.as_slice(), inner_payload.as_slice());
    }

    #[test]
    fn test_unaligned_cell_still_resolves() {
        let mut ser = BlockSerializer::new();
        ser.serialize_u8(1); // misaligns the cursor; cells are read byte-wise
        ser.serialize_sub_block(&[2u8, 3, 4], SpecialBuffer::Vector);
        let mut block = ser.as_memory_block();
        block_initialize(&mut block).unwrap();
        let view = BlockView::new(&block).unwrap();
        let read = view.vec_view::<u8>(1).unwrap();
        assert_eq!(read.as_slice(), &[2, 3, 4]);
    }

    #[test]
    fn test_recall_push_value() {
        let mut ser = BlockSerializer::new();
        let recall = ser.create_recall(4);
        ser.serialize_u32(5);
        ser.push_at_recall(recall, &7u32.to_le_bytes());
        let mut block = ser.as_memory_block();
        block_initialize(&mut block).unwrap();
        let view = BlockView::new(&block).unwrap();
        let first = view.first_object();
        assert_eq!(u32::from_le_bytes(first[0..4].try_into().unwrap()), 7);
        assert_eq!(u32::from_le_bytes(first[4..8].try_into().unwrap()), 5);
    }

    #[test]
    fn test_recall_size_value_counts_bytes_after_creation() {
        let mut ser = BlockSerializer::new();
        let recall = ser.create_recall(4);
        ser.serialize_u64(0);
        ser.serialize_u64(0);
        ser.push_size_value_at_recall(recall);
        let mut block = ser.as_memory_block();
        block_initialize(&mut block).unwrap();
        let view = BlockView::new(&block).unwrap();
        let first = view.first_object();
        assert_eq!(u32::from_le_bytes(first[0..4].try_into().unwrap()), 16);
    }

    #[test]
    #[should_panic(expected = "already consumed")]
    fn test_duplicate_recall_consumption_panics() {
        let mut ser = BlockSerializer::new();
        let recall = ser.create_recall(4);
        ser.push_size_value_at_recall(recall);
        ser.push_size_value_at_recall(recall);
    }

    #[test]
    fn test_serialize_items_non_pod() {
        let names = vec!["alpha".to_string(), "beta".to_string()];
        let mut ser = BlockSerializer::new();
        ser.serialize_items(&names, SpecialBuffer::Vector);
        let mut block = ser.as_memory_block();
        block_initialize(&mut block).unwrap();

        let view = BlockView::new(&block).unwrap();
        // the vector cell points at a packed array of (ptr, len) string
        // records, each 16 bytes
        let base = view.resolve(0).unwrap();
        let count = view.count_at(0).unwrap();
        assert_eq!(count, 2);
        assert_eq!(view.string_view(base).unwrap(), "alpha");
        assert_eq!(view.string_view(base + 16).unwrap(), "beta");
    }
}
