//! Scaffold emission: turns a populated nascent model into artifacts.
//!
//! The writer produces three artifacts per model: the scaffold block
//! (outer command stream + embedded machines), the flat large-resource
//! stream holding vertex/index/binding data, and (in debug builds) a
//! human-readable metrics dump.

use glam::{Mat4, Vec3};

use cinder_block::{BlockSerializer, SpecialBuffer};
use cinder_scaffold::chunks::{
    CHUNK_TYPE_METRICS, CHUNK_TYPE_MODEL_SCAFFOLD, CHUNK_TYPE_MODEL_SCAFFOLD_LARGE_BLOCKS,
    MODEL_SCAFFOLD_LARGE_BLOCKS_VERSION, MODEL_SCAFFOLD_VERSION, SerializedArtifact,
};
use cinder_scaffold::cmd::{CmdWriter, GeoCommand, ModelCommand, ScaffoldCmdIterator, ScaffoldCommand};
use cinder_scaffold::hash::{hash64, hash_combine};
use cinder_scaffold::skeleton::SkeletonBinding;
use cinder_scaffold::types::{
    AnimatedVertexBufferRef, IndexBufferRef, LargeBlockRef, SkeletonBindingRef,
};

use crate::GeoProcError;
use crate::config::{ModelCompilationConfiguration, adjacency_stream_guid};
use crate::nascent_model::{
    Command, NascentModel, NascentObjectGuid, NascentRawGeometry, complete_instantiation,
};
use crate::nascent_skeleton::NascentSkeleton;
use crate::skin::{
    ControllerAndJointMatrices, NascentBoundSkinnedGeometry, collect_positions,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CmdStreamMode {
    Normal,
    Topological,
}

#[derive(Default)]
struct RawGeoLargeBlocks {
    vb: LargeBlockRef,
    ib: LargeBlockRef,
    topological_ib: LargeBlockRef,
}

struct RawGeoEntry {
    src_guid: NascentObjectGuid,
    geo: NascentRawGeometry,
    positions: Vec<[f32; 3]>,
    id: Option<u32>,
    topological_id: Option<u32>,
    blocks: RawGeoLargeBlocks,
}

#[derive(Default)]
struct SkinnedGeoLargeBlocks {
    vb: LargeBlockRef,
    animated_vb: LargeBlockRef,
    ib: LargeBlockRef,
    topological_ib: LargeBlockRef,
    skeleton_binding: LargeBlockRef,
}

struct SkinnedGeoEntry {
    src_hash: u64,
    geo: NascentBoundSkinnedGeometry,
    joint_count: u32,
    id: Option<u32>,
    topological_id: Option<u32>,
    blocks: SkinnedGeoLargeBlocks,
}

#[derive(Default)]
struct GeometryHelper {
    raw_geos: Vec<RawGeoEntry>,
    skinned_geos: Vec<SkinnedGeoEntry>,
    next_id: u32,
}

/// Per-stream bookkeeping: the input interface registered so far and the
/// hash-to-name table for metrics and material dehashing.
#[derive(Debug, Clone, Default)]
struct CmdStreamHelper {
    input_interface_names: Vec<(String, String)>,
    dehash_table: Vec<(u64, String)>,
}

impl CmdStreamHelper {
    fn register_input_interface_marker(&mut self, skeleton: &str, name: &str) -> u32 {
        let key = (skeleton.to_string(), name.to_string());
        if let Some(existing) = self.input_interface_names.iter().position(|e| *e == key) {
            return existing as u32;
        }
        self.input_interface_names.push(key);
        (self.input_interface_names.len() - 1) as u32
    }

    fn build_hashed_input_interface(&self) -> Vec<u64> {
        self.input_interface_names
            .iter()
            .map(|(skeleton, name)| hash_combine(hash64(skeleton), hash64(name)))
            .collect()
    }

    fn register_hash_pair(&mut self, hash: u64, name: &str) {
        if !self.dehash_table.iter().any(|(h, _)| *h == hash) {
            self.dehash_table.push((hash, name.to_string()));
        }
    }

    fn try_dehash(&self, hash: u64) -> Option<&str> {
        self.dehash_table
            .iter()
            .find(|(h, _)| *h == hash)
            .map(|(_, n)| n.as_str())
    }

    fn guid_or_number(&mut self, symbol: &str) -> u64 {
        if let Ok(parsed) = symbol.parse::<u64>() {
            return parsed;
        }
        let hash = hash64(symbol);
        self.register_hash_pair(hash, symbol);
        hash
    }
}

fn hash_of_geo_and_skin_controller_ids(command: &Command) -> u64 {
    let mut result = hash_combine(command.geometry_block.object_id, command.geometry_block.namespace_id);
    for controller in &command.skin_controller_blocks {
        result = hash_combine(controller.object_id, result);
        result = hash_combine(controller.namespace_id, result);
    }
    result
}

fn outer_record(serializer: &mut BlockSerializer, tag: ScaffoldCommand, payload_size: u32) {
    serializer.serialize_u32(tag as u32);
    serializer.serialize_u32(payload_size);
}

/// Writes an embedded machine record: `{ u64 data_size; ptr }`.
fn emit_machine_record(serializer: &mut BlockSerializer, tag: ScaffoldCommand, machine: &[u8]) {
    outer_record(serializer, tag, 16);
    serializer.serialize_u64(machine.len() as u64);
    serializer.serialize_sub_block(machine, SpecialBuffer::Unknown);
}

struct LargeResourceConstructor {
    bytes: Vec<u8>,
}

impl LargeResourceConstructor {
    fn new() -> Self {
        Self { bytes: Vec::new() }
    }

    fn add_block(&mut self, data: &[u8]) -> LargeBlockRef {
        if data.is_empty() {
            return LargeBlockRef::default();
        }
        // keep blocks 16-byte aligned for upload paths
        let aligned = self.bytes.len().next_multiple_of(16);
        self.bytes.resize(aligned, 0);
        let reference = LargeBlockRef {
            offset: aligned as u64,
            size: data.len() as u64,
        };
        self.bytes.extend_from_slice(data);
        reference
    }
}

fn geo_machine_common(writer: &mut CmdWriter, geo: &NascentRawGeometry) {
    let mut ia = Vec::new();
    ia.extend_from_slice(&(geo.vertex_stride as u32).to_le_bytes());
    ia.extend_from_slice(&(geo.input_assembly_elements.len() as u32).to_le_bytes());
    ia.extend_from_slice(bytemuck::cast_slice(&geo.input_assembly_elements));
    writer.record(GeoCommand::AttachInputAssembly as u32, &ia);
    writer.record_pod(
        GeoCommand::AttachGeoSpaceToNode as u32,
        &geo.geo_space_to_node_space.to_cols_array(),
    );
    writer.record_pod(
        GeoCommand::AttachUnifiedVertexCount as u32,
        &(geo.unified_vertex_count as u32),
    );
}

fn raw_geo_machine(geo: &NascentRawGeometry, blocks: &RawGeoLargeBlocks) -> Vec<u8> {
    let mut writer = CmdWriter::new();
    geo_machine_common(&mut writer, geo);
    writer.record_pod_slice(GeoCommand::AttachDrawCalls as u32, &geo.draw_calls);
    writer.record_pod(GeoCommand::AttachVertexBuffer as u32, &blocks.vb);
    writer.record_pod(
        GeoCommand::AttachIndexBuffer as u32,
        &IndexBufferRef {
            format: geo.index_format as u32,
            _pad: 0,
            block: blocks.ib,
        },
    );
    writer.finish()
}

fn raw_geo_topological_machine(geo: &NascentRawGeometry, blocks: &RawGeoLargeBlocks) -> Vec<u8> {
    let mut writer = CmdWriter::new();
    geo_machine_common(&mut writer, geo);
    writer.record_pod(GeoCommand::AttachVertexBuffer as u32, &blocks.vb);
    writer.record_pod(
        GeoCommand::AttachTopologicalIndexBuffer as u32,
        &IndexBufferRef {
            format: geo.index_format as u32,
            _pad: 0,
            block: blocks.topological_ib,
        },
    );
    writer.finish()
}

fn skinned_geo_machine(entry: &SkinnedGeoEntry, topological: bool) -> Vec<u8> {
    let geo = &entry.geo.unanimated_base;
    let mut writer = CmdWriter::new();
    geo_machine_common(&mut writer, geo);
    writer.record_pod(GeoCommand::AttachVertexBuffer as u32, &entry.blocks.vb);
    if topological {
        writer.record_pod(
            GeoCommand::AttachTopologicalIndexBuffer as u32,
            &IndexBufferRef {
                format: geo.index_format as u32,
                _pad: 0,
                block: entry.blocks.topological_ib,
            },
        );
    } else {
        writer.record_pod_slice(GeoCommand::AttachDrawCalls as u32, &geo.draw_calls);
        writer.record_pod(
            GeoCommand::AttachIndexBuffer as u32,
            &IndexBufferRef {
                format: geo.index_format as u32,
                _pad: 0,
                block: entry.blocks.ib,
            },
        );
    }
    writer.record_pod(
        GeoCommand::AttachAnimatedVertexBuffer as u32,
        &AnimatedVertexBufferRef {
            block: entry.blocks.animated_vb,
            stride: entry.geo.animated_vertex_stride,
            _pad: 0,
        },
    );
    writer.record_pod(
        GeoCommand::AttachSkeletonBinding as u32,
        &SkeletonBindingRef {
            block: entry.blocks.skeleton_binding,
            joint_count: entry.joint_count,
            _pad: 0,
        },
    );
    writer.finish()
}

fn instantiate_raw_geo(
    model: &NascentModel,
    guid: NascentObjectGuid,
    config: &ModelCompilationConfiguration,
    build_topological: bool,
) -> Result<(NascentRawGeometry, Vec<[f32; 3]>), GeoProcError> {
    let geo_block = model.find_geometry_block(guid).ok_or_else(|| {
        GeoProcError::MissingElement(
            "geometry block referenced by command list is missing".into(),
        )
    })?;
    let rules = config.match_raw_geo_rules(&geo_block.rules_label);
    let mut working = geo_block.clone();
    let geo = complete_instantiation(&mut working, &rules, build_topological)?;
    let positions = collect_positions(&working.mesh);
    Ok((geo, positions))
}

/// Serialises a nascent model into its scaffold artifacts.
pub fn serialize_to_chunks(
    model: &NascentModel,
    name: &str,
    embedded_skeleton: &NascentSkeleton,
    config: &ModelCompilationConfiguration,
) -> Result<Vec<SerializedArtifact>, GeoProcError> {
    let mut serializer = BlockSerializer::new();
    let recall = serializer.create_recall(size_of::<u32>());

    // resolve the command stream list; duplicates collapse, empty config
    // gets the single default stream
    let mut cmd_streams: Vec<(u64, CmdStreamMode)> = Vec::new();
    for &guid in &config.command_streams {
        if cmd_streams.iter().any(|(g, _)| *g == guid) {
            continue;
        }
        let mode = if guid == adjacency_stream_guid() {
            CmdStreamMode::Topological
        } else {
            CmdStreamMode::Normal
        };
        cmd_streams.push((guid, mode));
    }
    if cmd_streams.is_empty() {
        cmd_streams.push((0, CmdStreamMode::Normal));
    }
    let build_topological = cmd_streams
        .iter()
        .any(|(_, mode)| *mode == CmdStreamMode::Topological);

    let mut geo_objects = GeometryHelper::default();
    let mut main_stream_helper: Option<CmdStreamHelper> = None;
    let mut generated_streams: Vec<Vec<u8>> = Vec::new();
    let mut stream_helpers: Vec<CmdStreamHelper> = Vec::new();

    for &(stream_guid, mode) in &cmd_streams {
        let mut stream = CmdWriter::new();
        let mut helper = CmdStreamHelper::default();
        let is_topological = mode == CmdStreamMode::Topological;

        let mut current_transform_marker: Option<u32> = None;
        let mut current_materials: Option<Vec<u64>> = None;
        let mut current_groups: Option<Vec<u64>> = None;

        for (command_guid, command) in model.commands() {
            let Some(geo_block) = model.find_geometry_block(command.geometry_block) else {
                return Err(GeoProcError::MissingElement(
                    "geometry block referenced by command list is missing".into(),
                ));
            };

            // material binding symbols are parallel to the geo's draw calls
            if geo_block.draw_calls.len() != command.material_binding_symbols.len() {
                return Err(GeoProcError::InvalidData(format!(
                    "command {command_guid:?} carries {} material symbols for {} draw calls",
                    command.material_binding_symbols.len(),
                    geo_block.draw_calls.len()
                )));
            }

            let materials: Vec<u64> = command
                .material_binding_symbols
                .iter()
                .map(|symbol| helper.guid_or_number(symbol))
                .collect();
            let mut group_guids: Vec<u64> = command
                .groups
                .iter()
                .map(|group| helper.guid_or_number(group))
                .collect();
            group_guids.sort_unstable();
            group_guids.dedup();

            let local_to_world =
                helper.register_input_interface_marker("", &command.local_to_model);

            if current_transform_marker != Some(local_to_world) {
                stream.record_pod(ModelCommand::SetTransformMarker as u32, &local_to_world);
                current_transform_marker = Some(local_to_world);
            }
            if current_materials.as_ref() != Some(&materials) {
                stream.record_pod_slice(ModelCommand::SetMaterialAssignments as u32, &materials);
                current_materials = Some(materials);
            }
            if current_groups.as_ref() != Some(&group_guids) {
                stream.record_pod_slice(ModelCommand::SetGroups as u32, &group_guids);
                current_groups = Some(group_guids);
            }

            let assigned = if command.skin_controller_blocks.is_empty() {
                let entry_index = match geo_objects
                    .raw_geos
                    .iter()
                    .position(|e| e.src_guid == command.geometry_block)
                {
                    Some(index) => index,
                    None => {
                        let (geo, positions) = match instantiate_raw_geo(
                            model,
                            command.geometry_block,
                            config,
                            build_topological,
                        ) {
                            Ok(done) => done,
                            Err(err) => {
                                tracing::warn!(
                                    command = ?command_guid,
                                    error = %err,
                                    "skipping geometry instance"
                                );
                                continue;
                            }
                        };
                        geo_objects.raw_geos.push(RawGeoEntry {
                            src_guid: command.geometry_block,
                            geo,
                            positions,
                            id: None,
                            topological_id: None,
                            blocks: RawGeoLargeBlocks::default(),
                        });
                        geo_objects.raw_geos.len() - 1
                    }
                };
                let next_id = &mut geo_objects.next_id;
                let entry = &mut geo_objects.raw_geos[entry_index];
                let slot = if is_topological {
                    &mut entry.topological_id
                } else {
                    &mut entry.id
                };
                match *slot {
                    Some(id) => id,
                    None => {
                        let id = *next_id;
                        *next_id += 1;
                        *slot = Some(id);
                        id
                    }
                }
            } else {
                let hashed = hash_of_geo_and_skin_controller_ids(command);
                let entry_index = match geo_objects
                    .skinned_geos
                    .iter()
                    .position(|e| e.src_hash == hashed)
                {
                    Some(index) => index,
                    None => {
                        let built = (|| -> Result<SkinnedGeoEntry, GeoProcError> {
                            let (geo, positions) = instantiate_raw_geo(
                                model,
                                command.geometry_block,
                                config,
                                build_topological,
                            )?;
                            let mut controllers = Vec::new();
                            for controller_id in &command.skin_controller_blocks {
                                let block = model
                                    .find_skin_controller_block(*controller_id)
                                    .ok_or_else(|| {
                                        GeoProcError::MissingElement(
                                            "skin controller referenced by command is missing"
                                                .into(),
                                        )
                                    })?;
                                let joint_matrices: Vec<u16> = block
                                    .controller
                                    .joint_names()
                                    .iter()
                                    .map(|joint| {
                                        helper.register_input_interface_marker(
                                            &block.skeleton,
                                            joint,
                                        ) as u16
                                    })
                                    .collect();
                                controllers.push(ControllerAndJointMatrices {
                                    controller: &block.controller,
                                    joint_matrices,
                                });
                            }
                            let joint_count = controllers
                                .iter()
                                .map(|c| c.controller.joint_names().len() as u32)
                                .sum();
                            let bound = crate::skin::bind_controller(
                                geo,
                                &controllers,
                                &positions,
                            )?;
                            Ok(SkinnedGeoEntry {
                                src_hash: hashed,
                                geo: bound,
                                joint_count,
                                id: None,
                                topological_id: None,
                                blocks: SkinnedGeoLargeBlocks::default(),
                            })
                        })();
                        match built {
                            Ok(entry) => {
                                geo_objects.skinned_geos.push(entry);
                                geo_objects.skinned_geos.len() - 1
                            }
                            Err(err) => {
                                tracing::warn!(
                                    command = ?command_guid,
                                    error = %err,
                                    "skipping skinned geometry instance"
                                );
                                continue;
                            }
                        }
                    }
                };
                let next_id = &mut geo_objects.next_id;
                let entry = &mut geo_objects.skinned_geos[entry_index];
                let slot = if is_topological {
                    &mut entry.topological_id
                } else {
                    &mut entry.id
                };
                match *slot {
                    Some(id) => id,
                    None => {
                        let id = *next_id;
                        *next_id += 1;
                        *slot = Some(id);
                        id
                    }
                }
            };

            stream.record_pod(ModelCommand::GeoCall as u32, &assigned);
        }

        let hashed_interface = helper.build_hashed_input_interface();
        stream.record_pod_slice(ModelCommand::InputInterface as u32, &hashed_interface);

        let stream_bytes = stream.finish();
        outer_record(&mut serializer, ScaffoldCommand::ModelCommandStream, 24);
        serializer.serialize_u64(stream_guid);
        serializer.serialize_u64(stream_bytes.len() as u64);
        serializer.serialize_sub_block(&stream_bytes, SpecialBuffer::Unknown);

        generated_streams.push(stream_bytes);
        stream_helpers.push(helper.clone());
        if main_stream_helper.is_none() {
            main_stream_helper = Some(helper);
        }
    }
    let main_stream_helper = main_stream_helper.unwrap_or_default();

    // large resources: all VBs first, then IBs, then topological IBs,
    // then skeleton bindings, to favour sequential streaming loads
    let mut large_resources = LargeResourceConstructor::new();
    for entry in &mut geo_objects.raw_geos {
        entry.blocks.vb = large_resources.add_block(&entry.geo.vertices);
    }
    for entry in &mut geo_objects.skinned_geos {
        entry.blocks.vb = large_resources.add_block(&entry.geo.unanimated_base.vertices);
    }
    for entry in &mut geo_objects.skinned_geos {
        entry.blocks.animated_vb =
            large_resources.add_block(&entry.geo.animated_vertex_elements);
    }
    for entry in &mut geo_objects.raw_geos {
        entry.blocks.ib = large_resources.add_block(&entry.geo.indices);
    }
    for entry in &mut geo_objects.skinned_geos {
        entry.blocks.ib = large_resources.add_block(&entry.geo.unanimated_base.indices);
    }
    for entry in &mut geo_objects.raw_geos {
        entry.blocks.topological_ib =
            large_resources.add_block(&entry.geo.adjacency_index_buffer);
    }
    for entry in &mut geo_objects.skinned_geos {
        entry.blocks.topological_ib =
            large_resources.add_block(&entry.geo.unanimated_base.adjacency_index_buffer);
    }
    for entry in &mut geo_objects.skinned_geos {
        entry.blocks.skeleton_binding =
            large_resources.add_block(&entry.geo.skeleton_binding);
    }

    // one Geo record per assigned id, in id order
    for id in 0..geo_objects.next_id {
        if let Some(entry) = geo_objects.raw_geos.iter().find(|e| e.id == Some(id)) {
            let machine = raw_geo_machine(&entry.geo, &entry.blocks);
            emit_machine_record(&mut serializer, ScaffoldCommand::Geo, &machine);
            continue;
        }
        if let Some(entry) = geo_objects.skinned_geos.iter().find(|e| e.id == Some(id)) {
            let machine = skinned_geo_machine(entry, false);
            emit_machine_record(&mut serializer, ScaffoldCommand::Geo, &machine);
            continue;
        }
        if let Some(entry) = geo_objects
            .raw_geos
            .iter()
            .find(|e| e.topological_id == Some(id))
        {
            let machine = raw_geo_topological_machine(&entry.geo, &entry.blocks);
            emit_machine_record(&mut serializer, ScaffoldCommand::Geo, &machine);
            continue;
        }
        if let Some(entry) = geo_objects
            .skinned_geos
            .iter()
            .find(|e| e.topological_id == Some(id))
        {
            let machine = skinned_geo_machine(entry, true);
            emit_machine_record(&mut serializer, ScaffoldCommand::Geo, &machine);
        }
    }

    // embedded skeleton
    {
        let mut nested = BlockSerializer::new();
        embedded_skeleton.serialize(&mut nested);
        outer_record(&mut serializer, ScaffoldCommand::Skeleton, 16);
        serializer.serialize_u64(nested.size_primary_block() as u64);
        serializer.serialize_nested(&nested, SpecialBuffer::Unknown);
    }

    // material name dehash, merged across streams and sorted by hash
    {
        let mut entries: Vec<(u64, String)> = Vec::new();
        for helper in &stream_helpers {
            for (hash, name) in &helper.dehash_table {
                if !entries.iter().any(|(h, _)| h == hash) {
                    entries.push((*hash, name.clone()));
                }
            }
        }
        entries.sort_by_key(|(hash, _)| *hash);
        outer_record(&mut serializer, ScaffoldCommand::MaterialNameDehash, 16);
        serializer.serialize_items(&entries, SpecialBuffer::Vector);
    }

    // default pose data
    {
        let pose = calculate_default_pose_data(
            model,
            embedded_skeleton,
            &geo_objects,
            &main_stream_helper,
        );
        outer_record(&mut serializer, ScaffoldCommand::DefaultPoseData, 40);
        let transforms: Vec<[f32; 16]> = pose
            .default_transforms
            .iter()
            .map(|m| m.to_cols_array())
            .collect();
        serializer.serialize_sub_block(&transforms, SpecialBuffer::Vector);
        for value in [
            pose.bounding_box.0.x,
            pose.bounding_box.0.y,
            pose.bounding_box.0.z,
            pose.bounding_box.1.x,
            pose.bounding_box.1.y,
            pose.bounding_box.1.z,
        ] {
            serializer.serialize_f32(value);
        }
    }

    // model root data
    {
        let max_lod = model
            .commands()
            .iter()
            .map(|(_, c)| c.level_of_detail)
            .filter(|&lod| lod != u32::MAX)
            .max()
            .unwrap_or(0);
        outer_record(&mut serializer, ScaffoldCommand::ModelRootData, 4);
        serializer.serialize_u32(max_lod);
    }

    serializer.push_size_value_at_recall(recall);

    let scaffold_block = serializer.as_memory_block();
    let mut artifacts = vec![
        SerializedArtifact {
            chunk_type_code: CHUNK_TYPE_MODEL_SCAFFOLD,
            version: MODEL_SCAFFOLD_VERSION,
            name: name.to_string(),
            data: scaffold_block.to_vec(),
        },
        SerializedArtifact {
            chunk_type_code: CHUNK_TYPE_MODEL_SCAFFOLD_LARGE_BLOCKS,
            version: MODEL_SCAFFOLD_LARGE_BLOCKS_VERSION,
            name: name.to_string(),
            data: large_resources.bytes,
        },
    ];

    if cfg!(debug_assertions) {
        let metrics = trace_metrics(
            &geo_objects,
            &generated_streams,
            embedded_skeleton,
            &stream_helpers,
        );
        artifacts.push(SerializedArtifact {
            chunk_type_code: CHUNK_TYPE_METRICS,
            version: 0,
            name: format!("skin-{name}"),
            data: metrics.into_bytes(),
        });
    }

    Ok(artifacts)
}

struct DefaultPoseData {
    default_transforms: Vec<Mat4>,
    bounding_box: (Vec3, Vec3),
}

fn calculate_default_pose_data(
    model: &NascentModel,
    skeleton: &NascentSkeleton,
    geo_objects: &GeometryHelper,
    helper: &CmdStreamHelper,
) -> DefaultPoseData {
    let machine = skeleton.skeleton_machine();
    let skeleton_output = machine.generate_output_transforms();
    let skeleton_interface = machine.build_hashed_output_interface();
    let stream_interface = helper.build_hashed_input_interface();
    let binding = SkeletonBinding::new(&skeleton_interface, &stream_interface);

    let mut default_transforms: Vec<Mat4> = (0..stream_interface.len())
        .map(|joint| {
            let output = binding.model_joint_to_machine_output(joint);
            if output == u32::MAX {
                Mat4::IDENTITY
            } else {
                skeleton_output[output as usize]
            }
        })
        .collect();

    // many models carry no internal transforms at all; write zero
    // default transforms in that case
    let tolerance = 1e-6;
    let has_non_identity = default_transforms.iter().any(|m| {
        m.to_cols_array()
            .iter()
            .zip(Mat4::IDENTITY.to_cols_array().iter())
            .any(|(a, b)| (a - b).abs() > tolerance)
    });
    if !has_non_identity {
        default_transforms.clear();
    }

    // bounding box: transform every vertex position (or skinned local
    // AABB corner) through the bind pose
    let mut min = Vec3::splat(f32::MAX);
    let mut max = Vec3::splat(f32::MIN);
    let mut any_point = false;
    let mut helper_copy = helper.clone();
    for (_, command) in model.commands() {
        let local_to_world_id =
            helper_copy.register_input_interface_marker("", &command.local_to_model) as usize;
        let local_to_world = default_transforms
            .get(local_to_world_id)
            .copied()
            .unwrap_or(Mat4::IDENTITY);

        if command.skin_controller_blocks.is_empty() {
            let Some(entry) = geo_objects
                .raw_geos
                .iter()
                .find(|e| e.src_guid == command.geometry_block)
            else {
                continue;
            };
            let combined = local_to_world * entry.geo.geo_space_to_node_space;
            for p in &entry.positions {
                let v = combined.transform_point3(Vec3::from_array(*p));
                min = min.min(v);
                max = max.max(v);
                any_point = true;
            }
        } else {
            let hashed = hash_of_geo_and_skin_controller_ids(command);
            let Some(entry) = geo_objects
                .skinned_geos
                .iter()
                .find(|e| e.src_hash == hashed)
            else {
                continue;
            };
            let combined = local_to_world * entry.geo.unanimated_base.geo_space_to_node_space;
            let (lo, hi) = entry.geo.local_bounding_box;
            for corner in 0..8 {
                let v = Vec3::new(
                    if corner & 1 == 0 { lo.x } else { hi.x },
                    if corner & 2 == 0 { lo.y } else { hi.y },
                    if corner & 4 == 0 { lo.z } else { hi.z },
                );
                let v = combined.transform_point3(v);
                min = min.min(v);
                max = max.max(v);
                any_point = true;
            }
        }
    }
    if !any_point {
        min = Vec3::ZERO;
        max = Vec3::ZERO;
    }

    DefaultPoseData {
        default_transforms,
        bounding_box: (min, max),
    }
}

fn trace_command_stream(out: &mut String, bytes: &[u8], helper: &CmdStreamHelper) {
    use std::fmt::Write;
    for cmd in ScaffoldCmdIterator::new(bytes) {
        let Ok(cmd) = cmd else {
            let _ = writeln!(out, "<truncated record>");
            return;
        };
        match cmd.cmd {
            c if c == ModelCommand::GeoCall as u32 => {
                let _ = writeln!(out, "Geo call ({})", cmd.read_u32(0).unwrap_or(0));
            }
            c if c == ModelCommand::SetTransformMarker as u32 => {
                let _ = writeln!(out, "Transform marker ({})", cmd.read_u32(0).unwrap_or(0));
            }
            c if c == ModelCommand::SetMaterialAssignments as u32 => {
                let guids = cmd.as_pod_slice::<u64>().unwrap_or_default();
                let _ = write!(out, "Material assignments (");
                for (i, guid) in guids.iter().enumerate() {
                    if i != 0 {
                        let _ = write!(out, ", ");
                    }
                    let _ = write!(out, "{guid:#x}");
                    if let Some(name) = helper.try_dehash(*guid) {
                        let _ = write!(out, " [{name}]");
                    }
                }
                let _ = writeln!(out, ")");
            }
            c if c == ModelCommand::SetGroups as u32 => {
                let guids = cmd.as_pod_slice::<u64>().unwrap_or_default();
                let _ = write!(out, "Groups (");
                for (i, guid) in guids.iter().enumerate() {
                    if i != 0 {
                        let _ = write!(out, ", ");
                    }
                    let _ = write!(out, "{guid:#x}");
                }
                let _ = writeln!(out, ")");
            }
            c if c == ModelCommand::InputInterface as u32 => {
                let hashes = cmd.as_pod_slice::<u64>().unwrap_or_default();
                let _ = writeln!(out, "Input interface");
                for (i, hash) in hashes.iter().enumerate() {
                    let name = helper
                        .input_interface_names
                        .get(i)
                        .map(|(s, j)| format!("{s} : {j}"))
                        .unwrap_or_default();
                    let _ = writeln!(out, "  [{i}] {name}, Hashed: {hash:#x}");
                }
            }
            other => {
                let _ = writeln!(out, "Unknown command ({other})");
            }
        }
    }
}

fn trace_metrics(
    geo_objects: &GeometryHelper,
    streams: &[Vec<u8>],
    skeleton: &NascentSkeleton,
    helpers: &[CmdStreamHelper],
) -> String {
    use std::fmt::Write;
    let mut out = String::new();

    let _ = writeln!(out, "============== Geometry Objects ==============");
    let _ = writeln!(out, " --- Geos:");
    for entry in &geo_objects.raw_geos {
        let _ = writeln!(
            out,
            "[{}] ({:#x}) Geo --- {} vertices, {} draw calls, stride {}",
            entry.id.map(|v| v as i64).unwrap_or(-1),
            entry.src_guid.object_id,
            entry.geo.unified_vertex_count,
            entry.geo.draw_calls.len(),
            entry.geo.vertex_stride,
        );
    }
    let _ = writeln!(out, " --- Skinned Geos:");
    for entry in &geo_objects.skinned_geos {
        let _ = writeln!(
            out,
            "[{}] ({:#x}) Skinned geo --- {} vertices, {} joints",
            entry.id.map(|v| v as i64).unwrap_or(-1),
            entry.src_hash,
            entry.geo.unanimated_base.unified_vertex_count,
            entry.joint_count,
        );
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "============== Command stream ==============");
    for (index, stream) in streams.iter().enumerate() {
        let _ = writeln!(out, "Command stream [{index}]");
        if let Some(helper) = helpers.get(index) {
            trace_command_stream(&mut out, stream, helper);
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "============== Transformation Machine ==============");
    out.push_str(&skeleton.skeleton_machine().trace());
    out
}
