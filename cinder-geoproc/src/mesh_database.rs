//! Mesh database: vertex attribute streams with remap tables.
//!
//! Attribute values are held in a canonical f32x4 form while the mesh is
//! being processed; the native vertex buffer is only packed at the end of
//! instantiation, once the final layout is chosen. Each stream may carry
//! a vertex map (unified vertex index to stream element index), which is
//! how per-stream deduplication avoids touching other attributes.

use glam::Mat4;
use half::f16;
use hashbrown::HashMap;

use cinder_scaffold::hash::hash64;
use cinder_scaffold::types::{VertexElement, VertexFormat};

use crate::GeoProcError;

pub const SEMANTIC_POSITION: &str = "POSITION";
pub const SEMANTIC_NORMAL: &str = "NORMAL";
pub const SEMANTIC_TEXCOORD: &str = "TEXCOORD";
pub const SEMANTIC_TANGENT: &str = "TEXTANGENT";
pub const SEMANTIC_BITANGENT: &str = "TEXBITANGENT";
pub const SEMANTIC_COLOR: &str = "COLOR";

/// One attribute stream.
#[derive(Debug, Clone)]
pub struct VertexStream {
    semantic_name: String,
    semantic_index: u32,
    /// Canonical f32x4 element data; unused components are zero
    /// (w defaults to 1 for positions at pack time).
    data: Vec<[f32; 4]>,
    component_count: usize,
    /// unified vertex index -> element index; empty means identity.
    vertex_map: Vec<u32>,
}

impl VertexStream {
    pub fn semantic_name(&self) -> &str {
        &self.semantic_name
    }

    pub fn semantic_index(&self) -> u32 {
        self.semantic_index
    }

    pub fn component_count(&self) -> usize {
        self.component_count
    }

    pub fn element_count(&self) -> usize {
        self.data.len()
    }

    pub fn vertex_map(&self) -> &[u32] {
        &self.vertex_map
    }

    pub fn elements(&self) -> &[[f32; 4]] {
        &self.data
    }

    /// Value for a unified vertex, resolving the vertex map.
    pub fn value(&self, unified_vertex: usize) -> [f32; 4] {
        let element = if self.vertex_map.is_empty() {
            unified_vertex
        } else {
            self.vertex_map[unified_vertex] as usize
        };
        self.data[element]
    }

    /// Stream element index for a unified vertex.
    pub fn element_index(&self, unified_vertex: usize) -> u32 {
        if self.vertex_map.is_empty() {
            unified_vertex as u32
        } else {
            self.vertex_map[unified_vertex]
        }
    }
}

/// Settings governing native vertex layout selection.
#[derive(Debug, Clone, Copy, Default)]
pub struct NativeVbSettings {
    pub use_16_bit_floats: bool,
}

/// A chosen native vertex layout.
#[derive(Debug, Clone)]
pub struct NativeVbLayout {
    pub elements: Vec<VertexElement>,
    pub vertex_stride: usize,
}

/// Streams of vertex attributes making up one mesh.
#[derive(Debug, Clone, Default)]
pub struct MeshDatabase {
    streams: Vec<VertexStream>,
    unified_vertex_count: usize,
}

impl MeshDatabase {
    pub fn new(unified_vertex_count: usize) -> Self {
        Self {
            streams: Vec::new(),
            unified_vertex_count,
        }
    }

    pub fn unified_vertex_count(&self) -> usize {
        self.unified_vertex_count
    }

    pub fn streams(&self) -> &[VertexStream] {
        &self.streams
    }

    /// Adds a stream whose element count equals the unified vertex count.
    pub fn add_stream(
        &mut self,
        semantic_name: &str,
        semantic_index: u32,
        data: Vec<[f32; 4]>,
        component_count: usize,
    ) -> Result<(), GeoProcError> {
        if data.len() != self.unified_vertex_count {
            return Err(GeoProcError::InvalidData(format!(
                "stream {semantic_name}{semantic_index} has {} elements for {} unified vertices",
                data.len(),
                self.unified_vertex_count
            )));
        }
        self.streams.push(VertexStream {
            semantic_name: semantic_name.to_string(),
            semantic_index,
            data,
            component_count,
            vertex_map: Vec::new(),
        });
        Ok(())
    }

    /// Replaces the stream at `index` with remapped data.
    pub fn insert_stream(
        &mut self,
        index: usize,
        data: Vec<[f32; 4]>,
        vertex_map: Vec<u32>,
        semantic_name: &str,
        semantic_index: u32,
        component_count: usize,
    ) {
        self.streams.insert(
            index,
            VertexStream {
                semantic_name: semantic_name.to_string(),
                semantic_index,
                data,
                component_count,
                vertex_map,
            },
        );
    }

    pub fn remove_stream(&mut self, index: usize) {
        self.streams.remove(index);
    }

    /// Index of the stream matching semantic name + index, if present.
    pub fn find_element(&self, semantic_name: &str, semantic_index: u32) -> Option<usize> {
        self.streams.iter().position(|s| {
            s.semantic_name == semantic_name && s.semantic_index == semantic_index
        })
    }

    /// Transforms positions by `transform`; normals, tangents and
    /// bitangents by the inverse-transpose.
    pub fn transform(&mut self, transform: Mat4) {
        let normal_transform = transform.inverse().transpose();
        for stream in &mut self.streams {
            match stream.semantic_name.as_str() {
                SEMANTIC_POSITION => {
                    for v in &mut stream.data {
                        let p = transform.transform_point3(glam::Vec3::new(v[0], v[1], v[2]));
                        *v = [p.x, p.y, p.z, v[3]];
                    }
                }
                SEMANTIC_NORMAL | SEMANTIC_TANGENT | SEMANTIC_BITANGENT => {
                    for v in &mut stream.data {
                        let n = normal_transform
                            .transform_vector3(glam::Vec3::new(v[0], v[1], v[2]))
                            .normalize_or_zero();
                        *v = [n.x, n.y, n.z, v[3]];
                    }
                }
                _ => {}
            }
        }
    }

    /// Merges unified vertices whose element index is identical in every
    /// stream, remapping the streams in place. Returns the old-to-new
    /// mapping when a reduction happened.
    pub fn merge_identical_unified_vertices(&mut self) -> Option<Vec<u32>> {
        if self.streams.is_empty() {
            return None;
        }
        let mut seen: HashMap<Vec<u32>, u32> = HashMap::new();
        let mut mapping = Vec::with_capacity(self.unified_vertex_count);
        let mut kept: Vec<usize> = Vec::new();
        for v in 0..self.unified_vertex_count {
            let key: Vec<u32> = self.streams.iter().map(|s| s.element_index(v)).collect();
            match seen.get(&key) {
                Some(&existing) => mapping.push(existing),
                None => {
                    let new_index = kept.len() as u32;
                    seen.insert(key, new_index);
                    mapping.push(new_index);
                    kept.push(v);
                }
            }
        }
        if kept.len() == self.unified_vertex_count {
            return None;
        }
        for stream in &mut self.streams {
            let new_map: Vec<u32> = kept.iter().map(|&v| stream.element_index(v)).collect();
            stream.vertex_map = new_map;
        }
        self.unified_vertex_count = kept.len();
        Some(mapping)
    }

    /// Chooses a native layout for the current streams.
    pub fn build_default_layout(&self, settings: NativeVbSettings) -> NativeVbLayout {
        let mut elements = Vec::with_capacity(self.streams.len());
        let mut offset = 0usize;
        for stream in &self.streams {
            let format = choose_format(
                &stream.semantic_name,
                stream.component_count,
                settings.use_16_bit_floats,
            );
            elements.push(VertexElement {
                semantic_hash: hash64(&stream.semantic_name),
                semantic_index: stream.semantic_index,
                format: format as u32,
                aligned_byte_offset: offset as u32,
                _pad: 0,
            });
            offset += format.size_bytes();
        }
        NativeVbLayout {
            elements,
            vertex_stride: offset,
        }
    }

    /// Packs the final native vertex buffer for the given layout.
    pub fn build_native_vertex_buffer(&self, layout: &NativeVbLayout) -> Vec<u8> {
        let mut buffer = vec![0u8; layout.vertex_stride * self.unified_vertex_count];
        for (stream, element) in self.streams.iter().zip(&layout.elements) {
            let format = VertexFormat::from_u32(element.format).expect("layout built by us");
            for v in 0..self.unified_vertex_count {
                let value = stream.value(v);
                let dst = v * layout.vertex_stride + element.aligned_byte_offset as usize;
                pack_value(&mut buffer[dst..dst + format.size_bytes()], value, format);
            }
        }
        buffer
    }
}

fn choose_format(semantic_name: &str, component_count: usize, use_16_bit: bool) -> VertexFormat {
    match semantic_name {
        SEMANTIC_COLOR => VertexFormat::UNorm8x4,
        SEMANTIC_POSITION => {
            if use_16_bit {
                VertexFormat::Half4
            } else {
                VertexFormat::Float3
            }
        }
        SEMANTIC_NORMAL | SEMANTIC_TANGENT | SEMANTIC_BITANGENT => {
            if use_16_bit {
                VertexFormat::SNorm16x4
            } else {
                VertexFormat::Float3
            }
        }
        SEMANTIC_TEXCOORD => {
            if use_16_bit {
                VertexFormat::Half2
            } else {
                VertexFormat::Float2
            }
        }
        _ => match component_count {
            1 => VertexFormat::Float1,
            2 => VertexFormat::Float2,
            3 => VertexFormat::Float3,
            _ => VertexFormat::Float4,
        },
    }
}

fn pack_value(dst: &mut [u8], value: [f32; 4], format: VertexFormat) {
    match format {
        VertexFormat::Float1 | VertexFormat::Float2 | VertexFormat::Float3
        | VertexFormat::Float4 => {
            for (i, chunk) in dst.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&value[i].to_le_bytes());
            }
        }
        VertexFormat::Half2 => {
            for (i, chunk) in dst.chunks_exact_mut(2).enumerate() {
                chunk.copy_from_slice(&f16::from_f32(value[i]).to_le_bytes());
            }
        }
        VertexFormat::Half4 => {
            // positions pack with w = 1
            let v = [value[0], value[1], value[2], 1.0];
            for (i, chunk) in dst.chunks_exact_mut(2).enumerate() {
                chunk.copy_from_slice(&f16::from_f32(v[i]).to_le_bytes());
            }
        }
        VertexFormat::UNorm8x4 => {
            for (i, byte) in dst.iter_mut().enumerate() {
                *byte = (value[i].clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        }
        VertexFormat::SNorm16x2 | VertexFormat::SNorm16x4 => {
            for (i, chunk) in dst.chunks_exact_mut(2).enumerate() {
                let packed = (value[i].clamp(-1.0, 1.0) * 32767.0).round() as i16;
                chunk.copy_from_slice(&packed.to_le_bytes());
            }
        }
    }
}

/// Collapses bitwise-identical elements. Returns the new data and the
/// old-to-new element mapping, or `None` when nothing collapsed.
pub fn remove_bitwise_identicals(data: &[[f32; 4]]) -> Option<(Vec<[f32; 4]>, Vec<u32>)> {
    let mut seen: HashMap<[u32; 4], u32> = HashMap::new();
    let mut result = Vec::new();
    let mut mapping = Vec::with_capacity(data.len());
    for value in data {
        let key = value.map(f32::to_bits);
        match seen.get(&key) {
            Some(&existing) => mapping.push(existing),
            None => {
                let index = result.len() as u32;
                seen.insert(key, index);
                result.push(*value);
                mapping.push(index);
            }
        }
    }
    if result.len() == data.len() {
        None
    } else {
        Some((result, mapping))
    }
}

/// Collapses elements within `threshold` of an earlier element, per
/// component. Returns the new data and old-to-new mapping, or `None`
/// when nothing collapsed.
pub fn remove_duplicates(
    data: &[[f32; 4]],
    threshold: f32,
) -> Option<(Vec<[f32; 4]>, Vec<u32>)> {
    // sort by first component so candidates cluster into a window
    let mut order: Vec<u32> = (0..data.len() as u32).collect();
    order.sort_by(|&a, &b| {
        data[a as usize][0]
            .partial_cmp(&data[b as usize][0])
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let close = |a: &[f32; 4], b: &[f32; 4]| {
        a.iter().zip(b).all(|(x, y)| (x - y).abs() <= threshold)
    };

    let mut mapping = vec![u32::MAX; data.len()];
    let mut kept: Vec<u32> = Vec::new();
    for (pos, &idx) in order.iter().enumerate() {
        let value = &data[idx as usize];
        let mut merged = false;
        // walk back through the sorted window while the first component
        // stays within the threshold
        for &candidate in order[..pos].iter().rev() {
            if (data[candidate as usize][0] - value[0]).abs() > threshold {
                break;
            }
            let target = mapping[candidate as usize];
            if target != u32::MAX && close(value, &data[candidate as usize]) {
                mapping[idx as usize] = target;
                merged = true;
                break;
            }
        }
        if !merged {
            mapping[idx as usize] = kept.len() as u32;
            kept.push(idx);
        }
    }

    if kept.len() == data.len() {
        return None;
    }
    let result: Vec<[f32; 4]> = kept.iter().map(|&i| data[i as usize]).collect();
    Some((result, mapping))
}

/// Applies both deduplication passes to every stream, then merges
/// unified vertices that became identical across all streams.
///
/// Bitwise collapse runs first because epsilon matching scales poorly
/// when the input carries large numbers of exactly identical elements.
pub fn merge_duplicate_vertices(mesh: &mut MeshDatabase, threshold: f32) -> Option<Vec<u32>> {
    for stream_index in 0..mesh.streams.len() {
        let stream = &mesh.streams[stream_index];
        let mut converted_mapping: Vec<u32> = stream.vertex_map.clone();
        let mut data = stream.data.clone();

        if let Some((new_data, new_mapping)) = remove_bitwise_identicals(&data) {
            if converted_mapping.is_empty() {
                converted_mapping = new_mapping;
            } else {
                for entry in &mut converted_mapping {
                    *entry = new_mapping[*entry as usize];
                }
            }
            data = new_data;
        }

        if let Some((new_data, new_mapping)) = remove_duplicates(&data, threshold) {
            if converted_mapping.is_empty() {
                converted_mapping = new_mapping;
            } else {
                for entry in &mut converted_mapping {
                    *entry = new_mapping[*entry as usize];
                }
            }
            data = new_data;
        }

        if data.len() < mesh.streams[stream_index].data.len() {
            let name = mesh.streams[stream_index].semantic_name.clone();
            let index = mesh.streams[stream_index].semantic_index;
            let components = mesh.streams[stream_index].component_count;
            mesh.insert_stream(stream_index, data, converted_mapping, &name, index, components);
            mesh.remove_stream(stream_index + 1);
        }
    }

    mesh.merge_identical_unified_vertices()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v(x: f32, y: f32, z: f32) -> [f32; 4] {
        [x, y, z, 0.0]
    }

    #[test]
    fn test_add_and_find_streams() {
        let mut mesh = MeshDatabase::new(3);
        mesh.add_stream(SEMANTIC_POSITION, 0, vec![v(0.0, 0.0, 0.0); 3], 3)
            .unwrap();
        mesh.add_stream(SEMANTIC_TEXCOORD, 0, vec![v(0.0, 0.0, 0.0); 3], 2)
            .unwrap();
        assert_eq!(mesh.find_element(SEMANTIC_POSITION, 0), Some(0));
        assert_eq!(mesh.find_element(SEMANTIC_TEXCOORD, 0), Some(1));
        assert_eq!(mesh.find_element(SEMANTIC_NORMAL, 0), None);
        assert!(
            mesh.add_stream(SEMANTIC_NORMAL, 0, vec![v(0.0, 1.0, 0.0); 2], 3)
                .is_err()
        );
    }

    #[test]
    fn test_remove_bitwise_identicals() {
        let data = vec![v(1.0, 0.0, 0.0), v(1.0, 0.0, 0.0), v(2.0, 0.0, 0.0)];
        let (result, mapping) = remove_bitwise_identicals(&data).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(mapping, vec![0, 0, 1]);
        assert!(remove_bitwise_identicals(&result).is_none());
    }

    #[test]
    fn test_remove_duplicates_epsilon() {
        let data = vec![
            v(0.0, 0.0, 0.0),
            v(0.0, 1e-7, 0.0), // within threshold of the first
            v(1.0, 0.0, 0.0),
        ];
        let (result, mapping) = remove_duplicates(&data, 1e-5).unwrap();
        assert_eq!(result.len(), 2);
        assert_eq!(mapping[0], mapping[1]);
        assert_ne!(mapping[0], mapping[2]);
    }

    #[test]
    fn test_merge_duplicate_vertices_remaps_mesh() {
        let mut mesh = MeshDatabase::new(4);
        mesh.add_stream(
            SEMANTIC_POSITION,
            0,
            vec![
                v(0.0, 0.0, 0.0),
                v(1.0, 0.0, 0.0),
                v(0.0, 5e-7, 0.0), // near-identical to vertex 0
                v(1.0, 0.0, 0.0), // bitwise-identical to vertex 1
            ],
            3,
        )
        .unwrap();

        let mapping = merge_duplicate_vertices(&mut mesh, 1e-5).unwrap();
        assert_eq!(mesh.unified_vertex_count(), 2);
        assert_eq!(mapping.len(), 4);
        assert_eq!(mapping[0], mapping[2]);
        assert_eq!(mapping[1], mapping[3]);
        assert_ne!(mapping[0], mapping[1]);
    }

    #[test]
    fn test_native_layout_and_packing() {
        let mut mesh = MeshDatabase::new(2);
        mesh.add_stream(
            SEMANTIC_POSITION,
            0,
            vec![v(1.0, 2.0, 3.0), v(-1.0, -2.0, -3.0)],
            3,
        )
        .unwrap();
        mesh.add_stream(SEMANTIC_TEXCOORD, 0, vec![v(0.5, 0.5, 0.0); 2], 2)
            .unwrap();

        let layout = mesh.build_default_layout(NativeVbSettings::default());
        assert_eq!(layout.vertex_stride, 12 + 8);
        let buffer = mesh.build_native_vertex_buffer(&layout);
        assert_eq!(buffer.len(), 2 * 20);
        let x = f32::from_le_bytes(buffer[0..4].try_into().unwrap());
        assert_eq!(x, 1.0);
        let u = f32::from_le_bytes(buffer[12..16].try_into().unwrap());
        assert_eq!(u, 0.5);
    }

    #[test]
    fn test_16_bit_layout_is_smaller() {
        let mut mesh = MeshDatabase::new(1);
        mesh.add_stream(SEMANTIC_POSITION, 0, vec![v(1.0, 0.0, 0.0)], 3)
            .unwrap();
        mesh.add_stream(SEMANTIC_NORMAL, 0, vec![v(0.0, 1.0, 0.0)], 3)
            .unwrap();
        let full = mesh.build_default_layout(NativeVbSettings {
            use_16_bit_floats: false,
        });
        let packed = mesh.build_default_layout(NativeVbSettings {
            use_16_bit_floats: true,
        });
        assert!(packed.vertex_stride < full.vertex_stride);
        assert_eq!(packed.vertex_stride, 8 + 8);
    }

    #[test]
    fn test_transform_positions_and_normals() {
        let mut mesh = MeshDatabase::new(1);
        mesh.add_stream(SEMANTIC_POSITION, 0, vec![v(1.0, 0.0, 0.0)], 3)
            .unwrap();
        mesh.add_stream(SEMANTIC_NORMAL, 0, vec![v(1.0, 0.0, 0.0)], 3)
            .unwrap();
        mesh.transform(Mat4::from_translation(glam::Vec3::new(0.0, 3.0, 0.0)));
        assert_eq!(mesh.streams()[0].value(0), [1.0, 3.0, 0.0, 0.0]);
        // translation leaves directions untouched
        assert_eq!(mesh.streams()[1].value(0), [1.0, 0.0, 0.0, 0.0]);
    }
}
