//! Geometry algorithms over a mesh database: flat triangle lists,
//! tangent-frame synthesis, redundant-bitangent removal, adjacency index
//! buffers and index-buffer remapping.

use glam::Vec3;
use hashbrown::HashMap;

use cinder_scaffold::types::{DrawCallDesc, IndexFormat, Topology};

use crate::GeoProcError;
use crate::mesh_database::{
    MeshDatabase, SEMANTIC_BITANGENT, SEMANTIC_NORMAL, SEMANTIC_POSITION, SEMANTIC_TANGENT,
    SEMANTIC_TEXCOORD,
};

/// Which parts of the tangent frame to synthesise.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TangentFrameFlags {
    pub normals: bool,
    pub tangents: bool,
    pub bitangents: bool,
}

impl TangentFrameFlags {
    pub fn any(self) -> bool {
        self.normals || self.tangents || self.bitangents
    }
}

/// Reads one index from a raw index buffer.
pub fn read_index(indices: &[u8], format: IndexFormat, position: usize) -> u32 {
    match format {
        IndexFormat::U16 => {
            u16::from_le_bytes(indices[position * 2..position * 2 + 2].try_into().unwrap()) as u32
        }
        IndexFormat::U32 => {
            u32::from_le_bytes(indices[position * 4..position * 4 + 4].try_into().unwrap())
        }
    }
}

/// Writes one index into a raw index buffer.
pub fn write_index(indices: &mut [u8], format: IndexFormat, position: usize, value: u32) {
    match format {
        IndexFormat::U16 => indices[position * 2..position * 2 + 2]
            .copy_from_slice(&(value as u16).to_le_bytes()),
        IndexFormat::U32 => {
            indices[position * 4..position * 4 + 4].copy_from_slice(&value.to_le_bytes())
        }
    }
}

/// Expands the draw calls of a geometry into a flat triangle list of
/// unified vertex indices.
pub fn build_flat_tri_list(
    indices: &[u8],
    format: IndexFormat,
    draw_calls: &[(u32, u32, Topology)],
) -> Result<Vec<[u32; 3]>, GeoProcError> {
    let mut tris = Vec::new();
    let available = indices.len() / format.bytes_per_index();
    for &(first_index, index_count, topology) in draw_calls {
        let first = first_index as usize;
        let count = index_count as usize;
        if first + count > available {
            return Err(GeoProcError::InvalidData(
                "draw call reads past the end of the index buffer".into(),
            ));
        }
        match topology {
            Topology::TriangleList => {
                for tri in 0..count / 3 {
                    tris.push([
                        read_index(indices, format, first + tri * 3),
                        read_index(indices, format, first + tri * 3 + 1),
                        read_index(indices, format, first + tri * 3 + 2),
                    ]);
                }
            }
            Topology::TriangleStrip => {
                for i in 2..count {
                    let (a, b) = if i % 2 == 0 { (i - 2, i - 1) } else { (i - 1, i - 2) };
                    tris.push([
                        read_index(indices, format, first + a),
                        read_index(indices, format, first + b),
                        read_index(indices, format, first + i),
                    ]);
                }
            }
            _ => {
                // point and line topologies contribute no triangles
            }
        }
    }
    Ok(tris)
}

/// Rewrites every index through an old-to-new vertex mapping, preserving
/// draw-call boundaries (the buffer layout is untouched, only values
/// change).
pub fn remap_index_buffer(indices: &mut [u8], format: IndexFormat, mapping: &[u32]) {
    let count = indices.len() / format.bytes_per_index();
    for position in 0..count {
        let old = read_index(indices, format, position) as usize;
        let new = mapping.get(old).copied().unwrap_or(0);
        write_index(indices, format, position, new);
    }
}

/// Synthesises normal/tangent/bitangent streams for one semantic index
/// from a flat triangle list. Texture-space tangents require a TEXCOORD
/// stream with the same semantic index.
pub fn generate_tangent_frame(
    mesh: &mut MeshDatabase,
    semantic_index: u32,
    flags: TangentFrameFlags,
    tris: &[[u32; 3]],
    _equivalence_threshold: f32,
) -> Result<(), GeoProcError> {
    let position_stream = mesh
        .find_element(SEMANTIC_POSITION, semantic_index)
        .or_else(|| mesh.find_element(SEMANTIC_POSITION, 0))
        .ok_or_else(|| {
            GeoProcError::MissingElement("POSITION stream required for tangent frame".into())
        })?;
    let texcoord_stream = mesh.find_element(SEMANTIC_TEXCOORD, semantic_index);
    if (flags.tangents || flags.bitangents) && texcoord_stream.is_none() {
        return Err(GeoProcError::MissingElement(
            "TEXCOORD stream required for tangent synthesis".into(),
        ));
    }

    let vertex_count = mesh.unified_vertex_count();
    let mut normals = vec![Vec3::ZERO; vertex_count];
    let mut tangents = vec![Vec3::ZERO; vertex_count];
    let mut bitangents = vec![Vec3::ZERO; vertex_count];

    for tri in tris {
        let [i0, i1, i2] = tri.map(|i| i as usize);
        if i0 >= vertex_count || i1 >= vertex_count || i2 >= vertex_count {
            return Err(GeoProcError::InvalidData(
                "triangle references vertex outside the mesh".into(),
            ));
        }
        let p = |i: usize| {
            let v = mesh.streams()[position_stream].value(i);
            Vec3::new(v[0], v[1], v[2])
        };
        let (p0, p1, p2) = (p(i0), p(i1), p(i2));
        let face_normal = (p1 - p0).cross(p2 - p0);

        if flags.normals {
            // area-weighted accumulation
            normals[i0] += face_normal;
            normals[i1] += face_normal;
            normals[i2] += face_normal;
        }

        if flags.tangents || flags.bitangents {
            let uv_stream = texcoord_stream.unwrap();
            let uv = |i: usize| {
                let v = mesh.streams()[uv_stream].value(i);
                (v[0], v[1])
            };
            let (u0, v0) = uv(i0);
            let (u1, v1) = uv(i1);
            let (u2, v2) = uv(i2);
            let (du1, dv1) = (u1 - u0, v1 - v0);
            let (du2, dv2) = (u2 - u0, v2 - v0);
            let det = du1 * dv2 - du2 * dv1;
            if det.abs() > 1e-12 {
                let r = 1.0 / det;
                let e1 = p1 - p0;
                let e2 = p2 - p0;
                let tangent = (e1 * dv2 - e2 * dv1) * r;
                let bitangent = (e2 * du1 - e1 * du2) * r;
                for i in [i0, i1, i2] {
                    tangents[i] += tangent;
                    bitangents[i] += bitangent;
                }
            }
        }
    }

    let to_stream = |vectors: Vec<Vec3>| -> Vec<[f32; 4]> {
        vectors
            .into_iter()
            .map(|v| {
                let n = v.normalize_or_zero();
                [n.x, n.y, n.z, 0.0]
            })
            .collect()
    };

    if flags.normals {
        mesh.add_stream(SEMANTIC_NORMAL, semantic_index, to_stream(normals), 3)?;
    }
    if flags.tangents {
        mesh.add_stream(SEMANTIC_TANGENT, semantic_index, to_stream(tangents), 3)?;
    }
    if flags.bitangents {
        mesh.add_stream(SEMANTIC_BITANGENT, semantic_index, to_stream(bitangents), 3)?;
    }
    Ok(())
}

/// Drops bitangent streams that are implied by a normal + tangent pair
/// with the same semantic index.
pub fn remove_redundant_bitangents(mesh: &mut MeshDatabase) {
    let mut index = 0;
    while index < mesh.streams().len() {
        let stream = &mesh.streams()[index];
        if stream.semantic_name() == SEMANTIC_BITANGENT {
            let semantic_index = stream.semantic_index();
            let has_normal = mesh.find_element(SEMANTIC_NORMAL, semantic_index).is_some();
            let has_tangent = mesh.find_element(SEMANTIC_TANGENT, semantic_index).is_some();
            if has_normal && has_tangent {
                mesh.remove_stream(index);
                continue;
            }
        }
        index += 1;
    }
}

/// Builds a triangle-adjacency index buffer over unique positions.
///
/// Output is six indices per input triangle: corner, adjacent-opposite,
/// corner, adjacent-opposite, corner, adjacent-opposite; the sentinel
/// (format maximum) marks an open edge. Adjacency is computed on
/// bitwise-unique positions so seams in secondary attributes do not break
/// silhouettes.
pub fn build_adjacency_index_buffer(
    mesh: &MeshDatabase,
    tris: &[[u32; 3]],
    format: IndexFormat,
) -> Result<Vec<u8>, GeoProcError> {
    let position_stream = mesh
        .find_element(SEMANTIC_POSITION, 0)
        .ok_or_else(|| GeoProcError::MissingElement("POSITION stream for adjacency".into()))?;

    // unify positions bitwise
    let mut unique: HashMap<[u32; 3], u32> = HashMap::new();
    let mut position_of_vertex = Vec::with_capacity(mesh.unified_vertex_count());
    for v in 0..mesh.unified_vertex_count() {
        let value = mesh.streams()[position_stream].value(v);
        let key = [value[0].to_bits(), value[1].to_bits(), value[2].to_bits()];
        let next = unique.len() as u32;
        let id = *unique.entry(key).or_insert(next);
        position_of_vertex.push(id);
    }

    // edge (min,max of unique position ids) -> (triangle, opposite vertex)
    let mut edge_map: HashMap<(u32, u32), Vec<(usize, u32)>> = HashMap::new();
    for (tri_index, tri) in tris.iter().enumerate() {
        for corner in 0..3 {
            let a = position_of_vertex[tri[corner] as usize];
            let b = position_of_vertex[tri[(corner + 1) % 3] as usize];
            let opposite = tri[(corner + 2) % 3];
            let key = (a.min(b), a.max(b));
            edge_map.entry(key).or_default().push((tri_index, opposite));
        }
    }

    let sentinel = match format {
        IndexFormat::U16 => u16::MAX as u32,
        IndexFormat::U32 => u32::MAX,
    };

    let mut out = vec![0u8; tris.len() * 6 * format.bytes_per_index()];
    for (tri_index, tri) in tris.iter().enumerate() {
        for corner in 0..3 {
            let a = position_of_vertex[tri[corner] as usize];
            let b = position_of_vertex[tri[(corner + 1) % 3] as usize];
            let key = (a.min(b), a.max(b));
            let adjacent = edge_map
                .get(&key)
                .and_then(|entries| {
                    entries
                        .iter()
                        .find(|(other_tri, _)| *other_tri != tri_index)
                        .map(|(_, opposite)| *opposite)
                })
                .unwrap_or(sentinel);
            write_index(&mut out, format, tri_index * 6 + corner * 2, tri[corner]);
            write_index(&mut out, format, tri_index * 6 + corner * 2 + 1, adjacent);
        }
    }
    Ok(out)
}

/// Convenience conversion from [`DrawCallDesc`] records.
pub fn draw_calls_for_geo_algorithm(
    draw_calls: &[DrawCallDesc],
) -> Vec<(u32, u32, Topology)> {
    draw_calls
        .iter()
        .map(|d| {
            (
                d.first_index,
                d.index_count,
                Topology::from_u32(d.topology).unwrap_or_default(),
            )
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh_database::MeshDatabase;

    fn quad_mesh() -> (MeshDatabase, Vec<u8>) {
        // two triangles sharing the diagonal edge 1-2
        let mut mesh = MeshDatabase::new(4);
        mesh.add_stream(
            SEMANTIC_POSITION,
            0,
            vec![
                [0.0, 0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0, 0.0],
            ],
            3,
        )
        .unwrap();
        mesh.add_stream(
            SEMANTIC_TEXCOORD,
            0,
            vec![
                [0.0, 0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [1.0, 1.0, 0.0, 0.0],
            ],
            2,
        )
        .unwrap();
        let indices: Vec<u8> = [0u16, 1, 2, 2, 1, 3]
            .iter()
            .flat_map(|i| i.to_le_bytes())
            .collect();
        (mesh, indices)
    }

    #[test]
    fn test_flat_tri_list() {
        let (_, indices) = quad_mesh();
        let tris = build_flat_tri_list(
            &indices,
            IndexFormat::U16,
            &[(0, 6, Topology::TriangleList)],
        )
        .unwrap();
        assert_eq!(tris, vec![[0, 1, 2], [2, 1, 3]]);
    }

    #[test]
    fn test_flat_tri_list_bounds_checked() {
        let (_, indices) = quad_mesh();
        assert!(
            build_flat_tri_list(&indices, IndexFormat::U16, &[(0, 9, Topology::TriangleList)])
                .is_err()
        );
    }

    #[test]
    fn test_generate_normals() {
        let (mut mesh, indices) = quad_mesh();
        let tris = build_flat_tri_list(
            &indices,
            IndexFormat::U16,
            &[(0, 6, Topology::TriangleList)],
        )
        .unwrap();
        generate_tangent_frame(
            &mut mesh,
            0,
            TangentFrameFlags {
                normals: true,
                ..Default::default()
            },
            &tris,
            1e-5,
        )
        .unwrap();
        let normal_stream = mesh.find_element(SEMANTIC_NORMAL, 0).unwrap();
        for v in 0..4 {
            let n = mesh.streams()[normal_stream].value(v);
            assert!((n[2] - 1.0).abs() < 1e-6, "flat quad normal is +Z, got {n:?}");
        }
    }

    #[test]
    fn test_generate_tangent_frame_and_drop_bitangent() {
        let (mut mesh, indices) = quad_mesh();
        let tris = build_flat_tri_list(
            &indices,
            IndexFormat::U16,
            &[(0, 6, Topology::TriangleList)],
        )
        .unwrap();
        generate_tangent_frame(
            &mut mesh,
            0,
            TangentFrameFlags {
                normals: true,
                tangents: true,
                bitangents: true,
            },
            &tris,
            1e-5,
        )
        .unwrap();
        assert!(mesh.find_element(SEMANTIC_BITANGENT, 0).is_some());

        remove_redundant_bitangents(&mut mesh);
        assert!(mesh.find_element(SEMANTIC_BITANGENT, 0).is_none());
        assert!(mesh.find_element(SEMANTIC_NORMAL, 0).is_some());
        assert!(mesh.find_element(SEMANTIC_TANGENT, 0).is_some());

        let tangent_stream = mesh.find_element(SEMANTIC_TANGENT, 0).unwrap();
        let t = mesh.streams()[tangent_stream].value(0);
        assert!((t[0] - 1.0).abs() < 1e-5, "U runs along +X, got {t:?}");
    }

    #[test]
    fn test_remap_index_buffer() {
        let mut indices: Vec<u8> = [0u16, 1, 2, 2, 1, 3]
            .iter()
            .flat_map(|i| i.to_le_bytes())
            .collect();
        remap_index_buffer(&mut indices, IndexFormat::U16, &[0, 1, 1, 2]);
        let remapped: Vec<u32> = (0..6).map(|i| read_index(&indices, IndexFormat::U16, i)).collect();
        assert_eq!(remapped, vec![0, 1, 1, 1, 1, 2]);
    }

    #[test]
    fn test_adjacency_marks_shared_and_open_edges() {
        let (mesh, indices) = quad_mesh();
        let tris = build_flat_tri_list(
            &indices,
            IndexFormat::U16,
            &[(0, 6, Topology::TriangleList)],
        )
        .unwrap();
        let adjacency = build_adjacency_index_buffer(&mesh, &tris, IndexFormat::U16).unwrap();
        assert_eq!(adjacency.len(), 2 * 6 * 2);

        let value = |i: usize| read_index(&adjacency, IndexFormat::U16, i);
        // triangle 0: edges (0,1) open, (1,2) shared with tri 1, (2,0) open
        assert_eq!(value(0), 0);
        assert_eq!(value(1), u16::MAX as u32); // edge 0-1 open
        assert_eq!(value(2), 1);
        assert_eq!(value(3), 3); // edge 1-2 adjacent to vertex 3
        assert_eq!(value(4), 2);
        assert_eq!(value(5), u16::MAX as u32); // edge 2-0 open
    }
}
