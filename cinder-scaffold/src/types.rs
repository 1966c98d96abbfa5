//! Wire-level POD types shared between scaffold writers and readers.

use bytemuck::{Pod, Zeroable};

/// Primitive topology of a draw call. Stored as a raw u32 in records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum Topology {
    PointList = 1,
    LineList = 2,
    LineStrip = 3,
    #[default]
    TriangleList = 4,
    TriangleStrip = 5,
}

impl Topology {
    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => Topology::PointList,
            2 => Topology::LineList,
            3 => Topology::LineStrip,
            4 => Topology::TriangleList,
            5 => Topology::TriangleStrip,
            _ => return None,
        })
    }
}

/// Index buffer element format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u32)]
pub enum IndexFormat {
    #[default]
    U16 = 1,
    U32 = 2,
}

impl IndexFormat {
    pub fn bytes_per_index(self) -> usize {
        match self {
            IndexFormat::U16 => 2,
            IndexFormat::U32 => 4,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => IndexFormat::U16,
            2 => IndexFormat::U32,
            _ => return None,
        })
    }
}

/// Vertex attribute storage format in a native vertex buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum VertexFormat {
    Float1 = 1,
    Float2,
    Float3,
    Float4,
    Half2,
    Half4,
    UNorm8x4,
    SNorm16x2,
    SNorm16x4,
}

impl VertexFormat {
    pub fn size_bytes(self) -> usize {
        match self {
            VertexFormat::Float1 => 4,
            VertexFormat::Float2 => 8,
            VertexFormat::Float3 => 12,
            VertexFormat::Float4 => 16,
            VertexFormat::Half2 => 4,
            VertexFormat::Half4 => 8,
            VertexFormat::UNorm8x4 => 4,
            VertexFormat::SNorm16x2 => 4,
            VertexFormat::SNorm16x4 => 8,
        }
    }

    pub fn component_count(self) -> usize {
        match self {
            VertexFormat::Float1 => 1,
            VertexFormat::Float2 | VertexFormat::Half2 | VertexFormat::SNorm16x2 => 2,
            VertexFormat::Float3 => 3,
            VertexFormat::Float4
            | VertexFormat::Half4
            | VertexFormat::UNorm8x4
            | VertexFormat::SNorm16x4 => 4,
        }
    }

    pub fn from_u32(value: u32) -> Option<Self> {
        Some(match value {
            1 => VertexFormat::Float1,
            2 => VertexFormat::Float2,
            3 => VertexFormat::Float3,
            4 => VertexFormat::Float4,
            5 => VertexFormat::Half2,
            6 => VertexFormat::Half4,
            7 => VertexFormat::UNorm8x4,
            8 => VertexFormat::SNorm16x2,
            9 => VertexFormat::SNorm16x4,
            _ => return None,
        })
    }
}

/// One attribute of a native vertex layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct VertexElement {
    pub semantic_hash: u64,
    pub semantic_index: u32,
    /// Raw [`VertexFormat`] discriminant.
    pub format: u32,
    pub aligned_byte_offset: u32,
    pub _pad: u32,
}

/// A draw call within a geo machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct DrawCallDesc {
    pub first_index: u32,
    pub index_count: u32,
    /// Raw [`Topology`] discriminant.
    pub topology: u32,
}

/// A span within the large-resource byte stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct LargeBlockRef {
    pub offset: u64,
    pub size: u64,
}

impl LargeBlockRef {
    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Index buffer reference inside a geo machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct IndexBufferRef {
    /// Raw [`IndexFormat`] discriminant.
    pub format: u32,
    pub _pad: u32,
    pub block: LargeBlockRef,
}

/// Skinned (animated) vertex buffer reference inside a geo machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct AnimatedVertexBufferRef {
    pub block: LargeBlockRef,
    pub stride: u32,
    pub _pad: u32,
}

/// Skeleton-binding table reference inside a geo machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SkeletonBindingRef {
    pub block: LargeBlockRef,
    pub joint_count: u32,
    pub _pad: u32,
}

/// Fixed-function state selection for a material.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct RenderStateSet {
    pub double_sided: u32,
    pub blend_type: u32,
    pub depth_bias: i32,
    pub flags: u32,
}

/// Sampler configuration bound by a material machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Pod, Zeroable)]
#[repr(C)]
pub struct SamplerDesc {
    pub filter: u32,
    pub address_u: u32,
    pub address_v: u32,
    pub address_w: u32,
    pub comparison: u32,
    pub flags: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vertex_format_sizes() {
        assert_eq!(VertexFormat::Float3.size_bytes(), 12);
        assert_eq!(VertexFormat::Half4.size_bytes(), 8);
        assert_eq!(VertexFormat::SNorm16x2.size_bytes(), 4);
    }

    #[test]
    fn test_format_round_trip_discriminants() {
        for f in [
            VertexFormat::Float1,
            VertexFormat::Float4,
            VertexFormat::Half2,
            VertexFormat::UNorm8x4,
            VertexFormat::SNorm16x4,
        ] {
            assert_eq!(VertexFormat::from_u32(f as u32), Some(f));
        }
        assert_eq!(VertexFormat::from_u32(0), None);
    }

    #[test]
    fn test_index_format() {
        assert_eq!(IndexFormat::U16.bytes_per_index(), 2);
        assert_eq!(IndexFormat::U32.bytes_per_index(), 4);
        assert_eq!(IndexFormat::from_u32(7), None);
    }
}
