//! Nascent model: the intermediate object graph a front end populates.
//!
//! A model is a flat mapping from object guid to geometry blocks, skin
//! controller blocks and commands. Commands reference geometry by guid,
//! bind it to a local-to-model point and assign material symbols per draw
//! call. [`complete_instantiation`] turns one geometry block into the
//! packed [`NascentRawGeometry`] the scaffold writer consumes.

use glam::Mat4;

use cinder_scaffold::hash::hash64;
use cinder_scaffold::types::{DrawCallDesc, IndexFormat, VertexElement};

use crate::GeoProcError;
use crate::config::RawGeoRules;
use crate::geometry_algorithm::{
    TangentFrameFlags, build_adjacency_index_buffer, build_flat_tri_list,
    draw_calls_for_geo_algorithm, generate_tangent_frame, remap_index_buffer,
    remove_redundant_bitangents,
};
use crate::mesh_database::{
    MeshDatabase, NativeVbSettings, SEMANTIC_BITANGENT, SEMANTIC_NORMAL, SEMANTIC_TANGENT,
    SEMANTIC_TEXCOORD, merge_duplicate_vertices,
};
use crate::skin::UnboundSkinController;

/// Identifier of a nascent object: `(namespace, object)` pair.
///
/// Front ends may use explicit ids to match a source format's identifier
/// space; namespace 0 is reserved for defaulted sequential assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct NascentObjectGuid {
    pub object_id: u64,
    pub namespace_id: u64,
}

impl NascentObjectGuid {
    pub fn new(object_id: u64) -> Self {
        Self {
            object_id,
            namespace_id: 0,
        }
    }

    pub fn with_namespace(object_id: u64, namespace_id: u64) -> Self {
        Self {
            object_id,
            namespace_id,
        }
    }
}

/// A mesh plus its draw calls and raw index buffer.
#[derive(Debug, Clone, Default)]
pub struct GeometryBlock {
    pub mesh: MeshDatabase,
    pub draw_calls: Vec<DrawCallDesc>,
    /// `src_index = mesh_vertex_index_to_src_index[unified_vertex_index]`
    pub mesh_vertex_index_to_src_index: Vec<u32>,
    pub geo_space_to_node_space: Mat4,
    pub indices: Vec<u8>,
    pub index_format: IndexFormat,
    /// Label matched against per-geo rule patterns in the compile config.
    pub rules_label: String,
}

/// An unbound skin controller plus the skeleton it binds to.
#[derive(Debug, Clone)]
pub struct SkinControllerBlock {
    pub controller: UnboundSkinController,
    pub skeleton: String,
}

/// One model command: place a geometry (optionally skinned) at a binding
/// point with per-draw-call material symbols.
#[derive(Debug, Clone, Default)]
pub struct Command {
    pub geometry_block: NascentObjectGuid,
    pub skin_controller_blocks: Vec<NascentObjectGuid>,
    pub local_to_model: String,
    pub material_binding_symbols: Vec<String>,
    pub groups: Vec<String>,
    pub level_of_detail: u32,
}

/// Instantiated geometry ready for scaffold emission.
#[derive(Debug, Clone, Default)]
pub struct NascentRawGeometry {
    pub vertices: Vec<u8>,
    pub indices: Vec<u8>,
    pub input_assembly_elements: Vec<VertexElement>,
    pub vertex_stride: usize,
    pub index_format: IndexFormat,
    pub draw_calls: Vec<DrawCallDesc>,
    pub geo_space_to_node_space: Mat4,
    pub unified_vertex_count: usize,
    pub mesh_vertex_index_to_src_index: Vec<u32>,
    pub adjacency_index_buffer: Vec<u8>,
}

/// The nascent object graph for one source document.
#[derive(Debug, Clone, Default)]
pub struct NascentModel {
    geo_blocks: Vec<(NascentObjectGuid, GeometryBlock)>,
    skin_blocks: Vec<(NascentObjectGuid, SkinControllerBlock)>,
    commands: Vec<(NascentObjectGuid, Command)>,
    next_namespace0_id: u64,
}

impl NascentModel {
    pub fn new() -> Self {
        Self {
            next_namespace0_id: 1,
            ..Default::default()
        }
    }

    pub fn find_geometry_block(&self, id: NascentObjectGuid) -> Option<&GeometryBlock> {
        self.geo_blocks.iter().find(|(g, _)| *g == id).map(|(_, b)| b)
    }

    pub fn find_geometry_block_mut(&mut self, id: NascentObjectGuid) -> Option<&mut GeometryBlock> {
        self.geo_blocks
            .iter_mut()
            .find(|(g, _)| *g == id)
            .map(|(_, b)| b)
    }

    pub fn find_skin_controller_block(&self, id: NascentObjectGuid) -> Option<&SkinControllerBlock> {
        self.skin_blocks.iter().find(|(g, _)| *g == id).map(|(_, b)| b)
    }

    pub fn find_command(&self, id: NascentObjectGuid) -> Option<&Command> {
        self.commands.iter().find(|(g, _)| *g == id).map(|(_, c)| c)
    }

    fn note_id(&mut self, id: NascentObjectGuid) {
        if id.namespace_id == 0 {
            self.next_namespace0_id = self.next_namespace0_id.max(id.object_id + 1);
        }
    }

    pub fn add_geometry_block(
        &mut self,
        id: NascentObjectGuid,
        block: GeometryBlock,
    ) -> Result<(), GeoProcError> {
        if self.find_geometry_block(id).is_some() {
            return Err(GeoProcError::DuplicateId(id));
        }
        self.note_id(id);
        self.geo_blocks.push((id, block));
        Ok(())
    }

    pub fn add_skin_controller_block(
        &mut self,
        id: NascentObjectGuid,
        block: SkinControllerBlock,
    ) -> Result<(), GeoProcError> {
        if self.find_skin_controller_block(id).is_some() {
            return Err(GeoProcError::DuplicateId(id));
        }
        self.note_id(id);
        self.skin_blocks.push((id, block));
        Ok(())
    }

    pub fn add_command(
        &mut self,
        id: NascentObjectGuid,
        command: Command,
    ) -> Result<(), GeoProcError> {
        if self.find_command(id).is_some() {
            return Err(GeoProcError::DuplicateId(id));
        }
        self.note_id(id);
        self.commands.push((id, command));
        Ok(())
    }

    /// Registers with the next available defaulted id.
    pub fn add_geometry_block_defaulted(&mut self, block: GeometryBlock) -> NascentObjectGuid {
        let id = NascentObjectGuid::new(self.next_namespace0_id);
        self.add_geometry_block(id, block).expect("fresh id");
        id
    }

    pub fn add_skin_controller_block_defaulted(
        &mut self,
        block: SkinControllerBlock,
    ) -> NascentObjectGuid {
        let id = NascentObjectGuid::new(self.next_namespace0_id);
        self.add_skin_controller_block(id, block).expect("fresh id");
        id
    }

    pub fn add_command_defaulted(&mut self, command: Command) -> NascentObjectGuid {
        let id = NascentObjectGuid::new(self.next_namespace0_id);
        self.add_command(id, command).expect("fresh id");
        id
    }

    pub fn geometry_blocks(&self) -> &[(NascentObjectGuid, GeometryBlock)] {
        &self.geo_blocks
    }

    pub fn skin_controller_blocks(&self) -> &[(NascentObjectGuid, SkinControllerBlock)] {
        &self.skin_blocks
    }

    pub fn commands(&self) -> &[(NascentObjectGuid, Command)] {
        &self.commands
    }

    /// Folds a transform into the meshes bound to `binding_point` and
    /// reattaches them to "identity".
    pub fn apply_transform(&mut self, binding_point: &str, transform: Mat4) {
        let affected: Vec<NascentObjectGuid> = self
            .commands
            .iter()
            .filter(|(_, c)| c.local_to_model == binding_point)
            .map(|(_, c)| c.geometry_block)
            .collect();
        for (_, command) in &mut self.commands {
            if command.local_to_model == binding_point {
                command.local_to_model = "identity".to_string();
            }
        }
        for guid in affected {
            if let Some(geo) = self.find_geometry_block_mut(guid) {
                geo.mesh.transform(transform);
            }
        }
    }

    /// The `(skeleton, joint)` pairs referenced by commands and skin
    /// controllers, in first-reference order.
    pub fn build_skeleton_interface(&self) -> Vec<(String, String)> {
        let mut result: Vec<(String, String)> = Vec::new();
        for (_, command) in &self.commands {
            let entry = (String::new(), command.local_to_model.clone());
            if !result.contains(&entry) {
                result.push(entry);
            }
        }
        for (_, controller) in &self.skin_blocks {
            for joint in controller.controller.joint_names() {
                let entry = (controller.skeleton.clone(), joint.clone());
                if !result.contains(&entry) {
                    result.push(entry);
                }
            }
        }
        result
    }
}

fn remove_excluded_attributes(mesh: &mut MeshDatabase, exclude: &[u64]) {
    for &deny in exclude {
        let mut stream = 0;
        while stream < mesh.streams().len() {
            let name = mesh.streams()[stream].semantic_name().to_string();
            let with_index =
                format!("{name}{}", mesh.streams()[stream].semantic_index());
            if hash64(&name) == deny || hash64(&with_index) == deny {
                mesh.remove_stream(stream);
            } else {
                stream += 1;
            }
        }
    }
}

fn build_included_attributes(
    geo_block: &mut GeometryBlock,
    rules: &RawGeoRules,
) -> Result<(), GeoProcError> {
    let mesh = &mut geo_block.mesh;
    let max_semantic_index = mesh
        .streams()
        .iter()
        .map(|s| s.semantic_index())
        .max()
        .unwrap_or(0);

    // to-be-rebuilt attributes are dropped first
    if rules.rebuild_tangents.unwrap_or(false) {
        for index in 0..=max_semantic_index {
            while let Some(s) = mesh.find_element(SEMANTIC_TANGENT, index) {
                mesh.remove_stream(s);
            }
            while let Some(s) = mesh.find_element(SEMANTIC_BITANGENT, index) {
                mesh.remove_stream(s);
            }
        }
    }
    if rules.rebuild_normals.unwrap_or(false) {
        for index in 0..=max_semantic_index {
            while let Some(s) = mesh.find_element(SEMANTIC_NORMAL, index) {
                mesh.remove_stream(s);
            }
        }
    }

    for semantic_index in 0..=max_semantic_index {
        let wants = |semantic: &str| {
            let base = hash64(semantic);
            let indexed = hash64(&format!("{semantic}{semantic_index}"));
            rules
                .include_attributes
                .iter()
                .any(|&a| a == base || a == indexed)
        };

        let mut flags = TangentFrameFlags::default();
        if wants(SEMANTIC_NORMAL) && mesh.find_element(SEMANTIC_NORMAL, semantic_index).is_none() {
            flags.normals = true;
        }
        if mesh.find_element(SEMANTIC_TEXCOORD, semantic_index).is_some() {
            if wants(SEMANTIC_TANGENT)
                && mesh.find_element(SEMANTIC_TANGENT, semantic_index).is_none()
            {
                flags.tangents = true;
            }
            if wants(SEMANTIC_BITANGENT)
                && mesh.find_element(SEMANTIC_BITANGENT, semantic_index).is_none()
            {
                flags.bitangents = true;
            }
        }

        if flags.any() {
            let tris = build_flat_tri_list(
                &geo_block.indices,
                geo_block.index_format,
                &draw_calls_for_geo_algorithm(&geo_block.draw_calls),
            )?;
            let equivalence_threshold = 1e-5;
            generate_tangent_frame(mesh, semantic_index, flags, &tris, equivalence_threshold)?;
        }
    }
    Ok(())
}

/// Applies the per-geo normalisation pipeline and packs the native
/// vertex buffer.
pub fn complete_instantiation(
    geo_block: &mut GeometryBlock,
    rules: &RawGeoRules,
    build_topological_index_buffer: bool,
) -> Result<NascentRawGeometry, GeoProcError> {
    if geo_block.draw_calls.is_empty() {
        return Err(GeoProcError::EmptyResult("Geometry object is empty".into()));
    }

    remove_excluded_attributes(&mut geo_block.mesh, &rules.exclude_attributes);

    if rules.merge_duplicate_vertices.unwrap_or(false) {
        let merge_threshold = 1e-5;
        if let Some(mapping) = merge_duplicate_vertices(&mut geo_block.mesh, merge_threshold) {
            // densely packed index buffer assumed; draw call ranges stay
            remap_index_buffer(&mut geo_block.indices, geo_block.index_format, &mapping);
            if geo_block.mesh_vertex_index_to_src_index.is_empty() {
                geo_block.mesh_vertex_index_to_src_index = invert_merge_mapping(
                    &mapping,
                    geo_block.mesh.unified_vertex_count(),
                );
            } else {
                let old = std::mem::take(&mut geo_block.mesh_vertex_index_to_src_index);
                let inverted =
                    invert_merge_mapping(&mapping, geo_block.mesh.unified_vertex_count());
                geo_block.mesh_vertex_index_to_src_index =
                    inverted.iter().map(|&i| old[i as usize]).collect();
            }
        }
    }

    build_included_attributes(geo_block, rules)?;

    // with normals, tangents and bitangents all present, the bitangent is
    // implied by the other two
    remove_redundant_bitangents(&mut geo_block.mesh);

    let mut adjacency_index_buffer = Vec::new();
    if build_topological_index_buffer {
        let tris = build_flat_tri_list(
            &geo_block.indices,
            geo_block.index_format,
            &draw_calls_for_geo_algorithm(&geo_block.draw_calls),
        )?;
        adjacency_index_buffer =
            build_adjacency_index_buffer(&geo_block.mesh, &tris, geo_block.index_format)?;
    }

    let layout = geo_block.mesh.build_default_layout(NativeVbSettings {
        use_16_bit_floats: rules.native_16_bit_types.unwrap_or(false),
    });
    let vertices = geo_block.mesh.build_native_vertex_buffer(&layout);

    Ok(NascentRawGeometry {
        vertices,
        indices: geo_block.indices.clone(),
        input_assembly_elements: layout.elements,
        vertex_stride: layout.vertex_stride,
        index_format: geo_block.index_format,
        draw_calls: geo_block.draw_calls.clone(),
        geo_space_to_node_space: geo_block.geo_space_to_node_space,
        unified_vertex_count: geo_block.mesh.unified_vertex_count(),
        mesh_vertex_index_to_src_index: geo_block.mesh_vertex_index_to_src_index.clone(),
        adjacency_index_buffer,
    })
}

/// Builds a new-to-old table from a merge's old-to-new mapping.
fn invert_merge_mapping(mapping: &[u32], new_count: usize) -> Vec<u32> {
    let mut result = vec![0u32; new_count];
    for (old, &new) in mapping.iter().enumerate().rev() {
        result[new as usize] = old as u32;
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh_database::SEMANTIC_POSITION;
    use cinder_scaffold::types::Topology;

    fn triangle_block() -> GeometryBlock {
        let mut mesh = MeshDatabase::new(3);
        mesh.add_stream(
            SEMANTIC_POSITION,
            0,
            vec![
                [0.0, 0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
            ],
            3,
        )
        .unwrap();
        GeometryBlock {
            mesh,
            draw_calls: vec![DrawCallDesc {
                first_index: 0,
                index_count: 3,
                topology: Topology::TriangleList as u32,
            }],
            indices: [0u16, 1, 2].iter().flat_map(|i| i.to_le_bytes()).collect(),
            index_format: IndexFormat::U16,
            ..Default::default()
        }
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let mut model = NascentModel::new();
        let id = NascentObjectGuid::new(7);
        model.add_geometry_block(id, triangle_block()).unwrap();
        assert!(matches!(
            model.add_geometry_block(id, triangle_block()),
            Err(GeoProcError::DuplicateId(_))
        ));
        // defaulted ids skip past explicitly registered ones
        let next = model.add_command_defaulted(Command::default());
        assert_eq!(next.object_id, 8);
    }

    #[test]
    fn test_empty_draw_calls_is_explicit_failure() {
        let mut block = GeometryBlock::default();
        let result = complete_instantiation(&mut block, &RawGeoRules::default(), false);
        assert!(matches!(result, Err(GeoProcError::EmptyResult(_))));
    }

    #[test]
    fn test_complete_instantiation_packs_vertices() {
        let mut block = triangle_block();
        let geo = complete_instantiation(&mut block, &RawGeoRules::default(), false).unwrap();
        assert_eq!(geo.unified_vertex_count, 3);
        assert_eq!(geo.vertex_stride, 12);
        assert_eq!(geo.vertices.len(), 36);
        assert_eq!(geo.draw_calls.len(), 1);
        assert!(geo.adjacency_index_buffer.is_empty());
    }

    #[test]
    fn test_exclude_attribute_by_hash() {
        let mut block = triangle_block();
        block
            .mesh
            .add_stream(SEMANTIC_TEXCOORD, 0, vec![[0.0; 4]; 3], 2)
            .unwrap();
        let rules = RawGeoRules {
            exclude_attributes: vec![hash64(SEMANTIC_TEXCOORD)],
            ..Default::default()
        };
        let geo = complete_instantiation(&mut block, &rules, false).unwrap();
        assert_eq!(geo.input_assembly_elements.len(), 1);
        assert_eq!(geo.vertex_stride, 12);
    }

    #[test]
    fn test_merge_duplicates_reduces_and_remaps() {
        // two triangles with an epsilon-duplicated vertex pair
        let mut mesh = MeshDatabase::new(4);
        mesh.add_stream(
            SEMANTIC_POSITION,
            0,
            vec![
                [0.0, 0.0, 0.0, 0.0],
                [1.0, 0.0, 0.0, 0.0],
                [0.0, 1.0, 0.0, 0.0],
                [1.0, 5e-7, 0.0, 0.0], // near-duplicate of vertex 1
            ],
            3,
        )
        .unwrap();
        let mut block = GeometryBlock {
            mesh,
            draw_calls: vec![DrawCallDesc {
                first_index: 0,
                index_count: 6,
                topology: Topology::TriangleList as u32,
            }],
            indices: [0u16, 1, 2, 2, 3, 0]
                .iter()
                .flat_map(|i| i.to_le_bytes())
                .collect(),
            index_format: IndexFormat::U16,
            ..Default::default()
        };
        let rules = RawGeoRules {
            merge_duplicate_vertices: Some(true),
            ..Default::default()
        };
        let geo = complete_instantiation(&mut block, &rules, false).unwrap();
        assert_eq!(geo.unified_vertex_count, 3);

        // winding preserved: triangle 2 now references the merged vertex
        let idx: Vec<u32> = (0..6)
            .map(|i| crate::geometry_algorithm::read_index(&geo.indices, IndexFormat::U16, i))
            .collect();
        assert_eq!(idx, vec![0, 1, 2, 2, 1, 0]);
    }

    #[test]
    fn test_synthesise_normals_when_requested() {
        let mut block = triangle_block();
        let rules = RawGeoRules {
            include_attributes: vec![hash64(SEMANTIC_NORMAL)],
            ..Default::default()
        };
        let geo = complete_instantiation(&mut block, &rules, false).unwrap();
        assert_eq!(geo.input_assembly_elements.len(), 2);
        assert_eq!(geo.vertex_stride, 24);
    }

    #[test]
    fn test_topological_index_buffer_built() {
        let mut block = triangle_block();
        let geo = complete_instantiation(&mut block, &RawGeoRules::default(), true).unwrap();
        // one triangle, six adjacency indices
        assert_eq!(geo.adjacency_index_buffer.len(), 6 * 2);
    }

    #[test]
    fn test_apply_transform_reattaches_to_identity() {
        let mut model = NascentModel::new();
        let geo = model.add_geometry_block_defaulted(triangle_block());
        model.add_command_defaulted(Command {
            geometry_block: geo,
            local_to_model: "hull".into(),
            material_binding_symbols: vec!["m".into()],
            ..Default::default()
        });
        model.apply_transform("hull", Mat4::from_translation(glam::Vec3::X));
        assert_eq!(model.commands()[0].1.local_to_model, "identity");
        let moved = model.find_geometry_block(geo).unwrap();
        assert_eq!(moved.mesh.streams()[0].value(0)[0], 1.0);
    }

    #[test]
    fn test_skeleton_interface_collects_commands_first() {
        let mut model = NascentModel::new();
        let geo = model.add_geometry_block_defaulted(triangle_block());
        model.add_command_defaulted(Command {
            geometry_block: geo,
            local_to_model: "root".into(),
            material_binding_symbols: vec!["m".into()],
            ..Default::default()
        });
        model.add_command_defaulted(Command {
            geometry_block: geo,
            local_to_model: "root".into(),
            material_binding_symbols: vec!["m".into()],
            ..Default::default()
        });
        let interface = model.build_skeleton_interface();
        assert_eq!(interface, vec![(String::new(), "root".to_string())]);
    }
}
