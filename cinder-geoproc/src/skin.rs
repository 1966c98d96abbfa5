//! Skin controllers and controller binding.
//!
//! An [`UnboundSkinController`] carries inverse-bind matrices, joint
//! names and per-vertex influences straight from the source document.
//! Binding pairs it with instantiated geometry, packing the animated
//! vertex elements (bone indices + weights) and the skeleton-binding
//! table that maps controller joints onto command-stream input-interface
//! markers.

use glam::{Mat4, Vec3};
use smallvec::SmallVec;

use crate::GeoProcError;
use crate::mesh_database::SEMANTIC_POSITION;
use crate::nascent_model::NascentRawGeometry;

/// One joint influence on one vertex.
pub type Influence = (u16, f32);

/// Maximum influences kept per vertex in the packed animated stream.
pub const MAX_INFLUENCES_PER_VERTEX: usize = 4;

/// Bytes per vertex in the packed animated stream: 4 bone indices + 4
/// unorm8 weights.
pub const ANIMATED_VERTEX_STRIDE: usize = 8;

/// A skin controller before binding to geometry.
#[derive(Debug, Clone)]
pub struct UnboundSkinController {
    inverse_bind_matrices: Vec<Mat4>,
    joint_names: Vec<String>,
    /// Influences per source vertex.
    influences: Vec<SmallVec<[Influence; MAX_INFLUENCES_PER_VERTEX]>>,
}

impl UnboundSkinController {
    /// Validates that every joint index addresses a named joint.
    pub fn new(
        inverse_bind_matrices: Vec<Mat4>,
        joint_names: Vec<String>,
        influences: Vec<SmallVec<[Influence; MAX_INFLUENCES_PER_VERTEX]>>,
    ) -> Result<Self, GeoProcError> {
        if inverse_bind_matrices.len() != joint_names.len() {
            return Err(GeoProcError::InvalidData(format!(
                "{} inverse bind matrices for {} joints",
                inverse_bind_matrices.len(),
                joint_names.len()
            )));
        }
        let joint_count = joint_names.len() as u16;
        for (vertex, list) in influences.iter().enumerate() {
            for (joint, _) in list {
                if *joint >= joint_count {
                    return Err(GeoProcError::InvalidData(format!(
                        "vertex {vertex} references joint {joint} of {joint_count}"
                    )));
                }
            }
        }
        Ok(Self {
            inverse_bind_matrices,
            joint_names,
            influences,
        })
    }

    pub fn joint_names(&self) -> &[String] {
        &self.joint_names
    }

    pub fn inverse_bind_matrices(&self) -> &[Mat4] {
        &self.inverse_bind_matrices
    }

    pub fn influences(&self) -> &[SmallVec<[Influence; MAX_INFLUENCES_PER_VERTEX]>] {
        &self.influences
    }
}

/// A controller paired with its joint-matrix index table (controller
/// joint index to command-stream input-interface marker).
pub struct ControllerAndJointMatrices<'a> {
    pub controller: &'a UnboundSkinController,
    pub joint_matrices: Vec<u16>,
}

/// Skinned geometry ready for scaffold emission.
#[derive(Debug, Clone, Default)]
pub struct NascentBoundSkinnedGeometry {
    pub unanimated_base: NascentRawGeometry,
    /// Packed bone indices (u8x4) + weights (unorm8x4) per vertex.
    pub animated_vertex_elements: Vec<u8>,
    pub animated_vertex_stride: u32,
    /// Serialized joint tables + inverse binds, streamed as a large block.
    pub skeleton_binding: Vec<u8>,
    pub local_bounding_box: (Vec3, Vec3),
}

/// Binds instantiated geometry against its skin controllers.
///
/// Influences address source vertices; the geometry's
/// mesh-vertex-to-source map carries them across any vertex merging that
/// happened during instantiation. Weights are renormalised over the kept
/// top influences.
pub fn bind_controller(
    unanimated_base: NascentRawGeometry,
    controllers: &[ControllerAndJointMatrices<'_>],
    positions: &[[f32; 3]],
) -> Result<NascentBoundSkinnedGeometry, GeoProcError> {
    if controllers.is_empty() {
        return Err(GeoProcError::InvalidData(
            "bind_controller requires at least one controller".into(),
        ));
    }

    let vertex_count = unanimated_base.unified_vertex_count;
    let mut animated = vec![0u8; vertex_count * ANIMATED_VERTEX_STRIDE];

    // influences from the first controller drive the packed stream; the
    // joint-matrix table turns controller-local indices into
    // input-interface markers shared by every controller
    let primary = &controllers[0];
    for vertex in 0..vertex_count {
        let src_vertex = unanimated_base
            .mesh_vertex_index_to_src_index
            .get(vertex)
            .copied()
            .unwrap_or(vertex as u32) as usize;
        let Some(influences) = primary.controller.influences.get(src_vertex) else {
            continue;
        };

        let mut kept: SmallVec<[Influence; MAX_INFLUENCES_PER_VERTEX]> =
            influences.iter().copied().collect();
        kept.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        kept.truncate(MAX_INFLUENCES_PER_VERTEX);
        let total: f32 = kept.iter().map(|(_, w)| w).sum();
        if total <= 0.0 {
            continue;
        }

        let base = vertex * ANIMATED_VERTEX_STRIDE;
        for (slot, (joint, weight)) in kept.iter().enumerate() {
            let marker = primary
                .joint_matrices
                .get(*joint as usize)
                .copied()
                .unwrap_or(0);
            if marker > u8::MAX as u16 {
                return Err(GeoProcError::InvalidData(format!(
                    "joint marker {marker} exceeds the packed index range"
                )));
            }
            animated[base + slot] = marker as u8;
            animated[base + 4 + slot] =
                ((weight / total).clamp(0.0, 1.0) * 255.0).round() as u8;
        }
    }

    // skeleton binding table: per controller the marker table and the
    // inverse bind matrices, flat POD for streaming
    let mut binding = Vec::new();
    binding.extend_from_slice(&(controllers.len() as u32).to_le_bytes());
    for entry in controllers {
        let joint_count = entry.controller.joint_names.len() as u32;
        binding.extend_from_slice(&joint_count.to_le_bytes());
        for joint in 0..joint_count as usize {
            let marker = entry.joint_matrices.get(joint).copied().unwrap_or(u16::MAX);
            binding.extend_from_slice(&(marker as u32).to_le_bytes());
        }
        for matrix in &entry.controller.inverse_bind_matrices {
            for value in matrix.to_cols_array() {
                binding.extend_from_slice(&value.to_le_bytes());
            }
        }
    }

    let local_bounding_box = bounding_box_of(positions);

    Ok(NascentBoundSkinnedGeometry {
        unanimated_base,
        animated_vertex_elements: animated,
        animated_vertex_stride: ANIMATED_VERTEX_STRIDE as u32,
        skeleton_binding: binding,
        local_bounding_box,
    })
}

fn bounding_box_of(positions: &[[f32; 3]]) -> (Vec3, Vec3) {
    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);
    for p in positions {
        let v = Vec3::from_array(*p);
        min = min.min(v);
        max = max.max(v);
    }
    if positions.is_empty() {
        (Vec3::ZERO, Vec3::ZERO)
    } else {
        (min, max)
    }
}

/// Positions of a mesh database, for bounding boxes.
pub fn collect_positions(mesh: &crate::mesh_database::MeshDatabase) -> Vec<[f32; 3]> {
    let Some(stream) = mesh.find_element(SEMANTIC_POSITION, 0) else {
        return Vec::new();
    };
    (0..mesh.unified_vertex_count())
        .map(|v| {
            let value = mesh.streams()[stream].value(v);
            [value[0], value[1], value[2]]
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use smallvec::smallvec;

    fn controller(joints: usize) -> UnboundSkinController {
        UnboundSkinController::new(
            vec![Mat4::IDENTITY; joints],
            (0..joints).map(|i| format!("bone-{i}")).collect(),
            vec![smallvec![(0u16, 1.0f32)]; 3],
        )
        .unwrap()
    }

    #[test]
    fn test_joint_indices_validated() {
        let result = UnboundSkinController::new(
            vec![Mat4::IDENTITY],
            vec!["root".into()],
            vec![smallvec![(3u16, 1.0f32)]],
        );
        assert!(matches!(result, Err(GeoProcError::InvalidData(_))));
    }

    #[test]
    fn test_matrix_count_must_match_joints() {
        let result = UnboundSkinController::new(
            vec![Mat4::IDENTITY; 2],
            vec!["root".into()],
            Vec::new(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn test_bind_packs_weights() {
        let ctrl = UnboundSkinController::new(
            vec![Mat4::IDENTITY; 2],
            vec!["a".into(), "b".into()],
            vec![
                smallvec![(0u16, 0.75f32), (1u16, 0.25f32)],
                smallvec![(1u16, 1.0f32)],
                smallvec![(0u16, 2.0f32), (1u16, 2.0f32)], // renormalised
            ],
        )
        .unwrap();

        let base = NascentRawGeometry {
            unified_vertex_count: 3,
            ..Default::default()
        };
        let bound = bind_controller(
            base,
            &[ControllerAndJointMatrices {
                controller: &ctrl,
                joint_matrices: vec![5, 9],
            }],
            &[[0.0, 0.0, 0.0], [1.0, 2.0, 3.0], [-1.0, 0.0, 0.0]],
        )
        .unwrap();

        assert_eq!(bound.animated_vertex_elements.len(), 3 * ANIMATED_VERTEX_STRIDE);
        // vertex 0: markers 5 and 9, weights 191/64
        assert_eq!(bound.animated_vertex_elements[0], 5);
        assert_eq!(bound.animated_vertex_elements[1], 9);
        assert_eq!(bound.animated_vertex_elements[4], 191);
        assert_eq!(bound.animated_vertex_elements[5], 64);
        // vertex 2: equal weights renormalise to ~128 each
        let v2 = &bound.animated_vertex_elements[16..24];
        assert_eq!(v2[4], 128);
        assert_eq!(v2[5], 128);

        assert_eq!(bound.local_bounding_box.0, Vec3::new(-1.0, 0.0, 0.0));
        assert_eq!(bound.local_bounding_box.1, Vec3::new(1.0, 2.0, 3.0));
    }

    #[test]
    fn test_binding_table_layout() {
        let ctrl = controller(2);
        let base = NascentRawGeometry {
            unified_vertex_count: 3,
            ..Default::default()
        };
        let bound = bind_controller(
            base,
            &[ControllerAndJointMatrices {
                controller: &ctrl,
                joint_matrices: vec![0, 1],
            }],
            &[],
        )
        .unwrap();

        // u32 controller count, u32 joint count, 2 u32 markers, 2 Mat4s
        assert_eq!(bound.skeleton_binding.len(), 4 + 4 + 8 + 2 * 64);
        assert_eq!(
            u32::from_le_bytes(bound.skeleton_binding[0..4].try_into().unwrap()),
            1
        );
        assert_eq!(
            u32::from_le_bytes(bound.skeleton_binding[4..8].try_into().unwrap()),
            2
        );
    }
}
