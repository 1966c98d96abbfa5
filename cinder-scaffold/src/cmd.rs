//! Command-stream tags and record framing.
//!
//! Every machine in a scaffold is a linear sequence of variable-length
//! records:
//!
//! ```text
//! [ u32 cmd_tag | u32 block_size | block_size bytes payload ]
//! ```
//!
//! Tag namespaces are reserved in disjoint numeric ranges so machines can
//! be embedded in one another without ambiguity. Readers iterate linearly
//! and must skip unknown tags by the prefixed block size; the full tag
//! universe is never required.

use crate::ScaffoldError;

pub const CMD_BEGIN_TRANSFORMATION_MACHINE: u32 = 0x500;
pub const CMD_BEGIN_MODEL_MACHINE: u32 = 0x1000;
pub const CMD_BEGIN_SKELETON_MACHINE: u32 = 0x1500;
pub const CMD_BEGIN_MATERIAL_MACHINE: u32 = 0x2000;
pub const CMD_BEGIN_SCAFFOLD_MACHINE: u32 = 0x2500;
pub const CMD_BEGIN_DRAWABLE_CONSTRUCTOR: u32 = 0x3000;

/// Top-level scaffold records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ScaffoldCommand {
    BeginSubModel = CMD_BEGIN_SCAFFOLD_MACHINE,
    /// `{ u64 data_size; u64 ptr }` - embedded geo sub-machine
    Geo,
    /// `{ u64 guid; u64 data_size; u64 ptr }` - embedded material machine
    Material,
    /// `{ u64 data_size; u64 ptr }` - embedded skeleton block
    Skeleton,
    /// `{ u64 hash; u64 text_size; u64 ptr }` - text-formatter payload
    ShaderPatchCollection,
    /// `{ u64 stream_guid; u64 data_size; u64 ptr }`
    ModelCommandStream,
    /// Vector cell of `(u64, string)` entries sorted by the first key
    MaterialNameDehash,
    /// Vector cell of Mat4 default transforms + `(Vec3, Vec3)` bound box
    DefaultPoseData,
    /// `{ u32 max_lod }`
    ModelRootData,
}

/// Model-machine records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum ModelCommand {
    /// `{ u32 geo_id }`
    GeoCall = CMD_BEGIN_MODEL_MACHINE,
    /// `{ u32 transform_marker }`
    SetTransformMarker,
    /// `u64[]`, one entry per draw call of the referenced geo
    SetMaterialAssignments,
    /// `u64[]`, deduplicated and sorted
    SetGroups,
    /// `u64[]`, hashed `(skeleton, joint)` pairs for the stream
    InputInterface,
}

/// Geo-machine records (drawable-constructor namespace).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum GeoCommand {
    /// `{ u32 vertex_stride; u32 element_count; VertexElement[] }`
    AttachInputAssembly = CMD_BEGIN_DRAWABLE_CONSTRUCTOR,
    /// `DrawCallDesc[]`
    AttachDrawCalls,
    /// `{ u32 index_format; u32 _pad; u64 offset; u64 size }` into large blocks
    AttachIndexBuffer,
    /// `{ u64 offset; u64 size }` into large blocks
    AttachVertexBuffer,
    /// `[f32; 16]` column-major geo-space to node-space transform
    AttachGeoSpaceToNode,
    /// `{ u32 count }`
    AttachUnifiedVertexCount,
    /// `{ u64 offset; u64 size; u32 stride; u32 _pad }` skinned vertex data
    AttachAnimatedVertexBuffer,
    /// `{ u64 offset; u64 size; u32 joint_count; u32 _pad }` joint tables
    AttachSkeletonBinding,
    /// `{ u32 index_format; u32 _pad; u64 offset; u64 size }` adjacency IB
    AttachTopologicalIndexBuffer,
}

/// Material-machine records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum MaterialCommand {
    /// Serialized parameter box: shader resource bindings
    AttachShaderResourceBindings = CMD_BEGIN_MATERIAL_MACHINE,
    /// Serialized parameter box: shader selection parameters
    AttachSelectors,
    /// `RenderStateSet`
    AttachStateSet,
    /// Serialized parameter box: shader constants
    AttachConstants,
    /// `{ u64 hash; SamplerDesc }[]`
    AttachSamplerBindings,
    /// `{ u64 patch_collection_hash }`
    AttachPatchCollectionId,
}

const RECORD_PREFIX: usize = 8;

/// A single decoded record: tag plus raw payload bytes.
#[derive(Debug, Clone, Copy)]
pub struct ScaffoldCmd<'a> {
    pub cmd: u32,
    pub payload: &'a [u8],
}

impl<'a> ScaffoldCmd<'a> {
    pub fn block_size(&self) -> u32 {
        self.payload.len() as u32
    }

    /// Reinterprets the payload as a single POD value.
    pub fn as_pod<T: bytemuck::AnyBitPattern>(&self) -> Result<T, ScaffoldError> {
        if self.payload.len() != size_of::<T>() {
            return Err(ScaffoldError::TruncatedRecord(0));
        }
        Ok(bytemuck::pod_read_unaligned(self.payload))
    }

    /// Reinterprets the payload as a packed POD array.
    pub fn as_pod_slice<T: bytemuck::AnyBitPattern + bytemuck::NoUninit>(
        &self,
    ) -> Result<Vec<T>, ScaffoldError> {
        if !self.payload.len().is_multiple_of(size_of::<T>()) {
            return Err(ScaffoldError::TruncatedRecord(0));
        }
        Ok(self
            .payload
            .chunks_exact(size_of::<T>())
            .map(bytemuck::pod_read_unaligned)
            .collect())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, ScaffoldError> {
        let bytes = self
            .payload
            .get(offset..offset + 4)
            .ok_or(ScaffoldError::TruncatedRecord(offset))?;
        Ok(u32::from_le_bytes(bytes.try_into().unwrap()))
    }

    pub fn read_u64(&self, offset: usize) -> Result<u64, ScaffoldError> {
        let bytes = self
            .payload
            .get(offset..offset + 8)
            .ok_or(ScaffoldError::TruncatedRecord(offset))?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }
}

/// Forward iterator over the records of one command stream.
///
/// Dereferences to a `(tag, payload)` view; advancing skips past the
/// payload by the prefixed size. Truncated records end iteration with an
/// error.
#[derive(Debug, Clone)]
pub struct ScaffoldCmdIterator<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> ScaffoldCmdIterator<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, offset: 0 }
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.offset
    }
}

impl<'a> Iterator for ScaffoldCmdIterator<'a> {
    type Item = Result<ScaffoldCmd<'a>, ScaffoldError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.offset >= self.data.len() {
            return None;
        }
        if self.offset + RECORD_PREFIX > self.data.len() {
            self.offset = self.data.len();
            return Some(Err(ScaffoldError::TruncatedRecord(self.offset)));
        }
        let cmd = u32::from_le_bytes(self.data[self.offset..self.offset + 4].try_into().unwrap());
        let size =
            u32::from_le_bytes(self.data[self.offset + 4..self.offset + 8].try_into().unwrap())
                as usize;
        let payload_start = self.offset + RECORD_PREFIX;
        let payload_end = payload_start + size;
        if payload_end > self.data.len() {
            self.offset = self.data.len();
            return Some(Err(ScaffoldError::TruncatedRecord(payload_start)));
        }
        self.offset = payload_end;
        Some(Ok(ScaffoldCmd {
            cmd,
            payload: &self.data[payload_start..payload_end],
        }))
    }
}

/// Append-only writer for flat command streams (no internal pointers).
///
/// Machines whose payloads are pure POD (model machines, geo machines,
/// material machines) are built with this and embedded into the outer
/// scaffold as raw sub-blocks.
#[derive(Debug, Default)]
pub struct CmdWriter {
    bytes: Vec<u8>,
}

impl CmdWriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, cmd: u32, payload: &[u8]) {
        self.bytes.extend_from_slice(&cmd.to_le_bytes());
        self.bytes.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        self.bytes.extend_from_slice(payload);
    }

    pub fn record_pod<T: bytemuck::NoUninit>(&mut self, cmd: u32, payload: &T) {
        self.record(cmd, bytemuck::bytes_of(payload));
    }

    pub fn record_pod_slice<T: bytemuck::NoUninit>(&mut self, cmd: u32, payload: &[T]) {
        self.record(cmd, bytemuck::cast_slice(payload));
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn finish(self) -> Vec<u8> {
        self.bytes
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_round_trip() {
        let mut writer = CmdWriter::new();
        writer.record_pod(ModelCommand::GeoCall as u32, &7u32);
        writer.record_pod_slice(ModelCommand::SetMaterialAssignments as u32, &[1u64, 2, 3]);
        let bytes = writer.finish();

        let mut iter = ScaffoldCmdIterator::new(&bytes);
        let first = iter.next().unwrap().unwrap();
        assert_eq!(first.cmd, ModelCommand::GeoCall as u32);
        assert_eq!(first.as_pod::<u32>().unwrap(), 7);

        let second = iter.next().unwrap().unwrap();
        assert_eq!(second.cmd, ModelCommand::SetMaterialAssignments as u32);
        assert_eq!(second.as_pod_slice::<u64>().unwrap(), vec![1, 2, 3]);

        assert!(iter.next().is_none());
    }

    #[test]
    fn test_unknown_tag_skippable() {
        let mut writer = CmdWriter::new();
        writer.record(0xFFFF, &[0xAB; 13]);
        writer.record_pod(ModelCommand::SetTransformMarker as u32, &4u32);
        let bytes = writer.finish();

        let mut iter = ScaffoldCmdIterator::new(&bytes);
        let unknown = iter.next().unwrap().unwrap();
        assert_eq!(unknown.cmd, 0xFFFF);
        assert_eq!(unknown.payload.len(), 13);
        let next = iter.next().unwrap().unwrap();
        assert_eq!(next.cmd, ModelCommand::SetTransformMarker as u32);
    }

    #[test]
    fn test_truncated_record_is_error() {
        let mut writer = CmdWriter::new();
        writer.record(ModelCommand::GeoCall as u32, &[1, 2, 3, 4]);
        let mut bytes = writer.finish();
        bytes.truncate(bytes.len() - 2);

        let mut iter = ScaffoldCmdIterator::new(&bytes);
        assert!(iter.next().unwrap().is_err());
        assert!(iter.next().is_none());
    }

    #[test]
    fn test_empty_stream() {
        let mut iter = ScaffoldCmdIterator::new(&[]);
        assert!(iter.next().is_none());
    }
}
