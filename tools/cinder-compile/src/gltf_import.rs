//! glTF front end: populates nascent objects from a .gltf/.glb document.
//!
//! The scene node hierarchy becomes the transformation machine, mesh
//! primitives become geometry blocks plus commands, skins become skin
//! controllers and animations become drivers over sampled curves.

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use glam::Mat4;
use smallvec::SmallVec;

use cinder_geoproc::mesh_database::{
    MeshDatabase, SEMANTIC_COLOR, SEMANTIC_NORMAL, SEMANTIC_POSITION, SEMANTIC_TEXCOORD,
};
use cinder_geoproc::skin::{Influence, MAX_INFLUENCES_PER_VERTEX};
use cinder_geoproc::{
    Command, GeometryBlock, NascentAnimationSet, NascentModel, NascentObjectGuid, NascentSkeleton,
    RawAnimationCurve, SkinControllerBlock, Transform, UnboundSkinController, curve_format,
};
use cinder_scaffold::skeleton::sampler_type;
use cinder_scaffold::types::{DrawCallDesc, IndexFormat, Topology};

use crate::config::ImportConfiguration;

/// Everything a compile operation needs from one source document.
pub struct ImportedDocument {
    pub model: NascentModel,
    pub skeleton: NascentSkeleton,
    pub animations: NascentAnimationSet,
    /// Material binding symbols referenced by the model, in first-use
    /// order.
    pub material_names: Vec<String>,
    /// Distinct skeleton (skin) names referenced by skin controllers.
    pub skeleton_names: Vec<String>,
}

fn node_name(node: &gltf::Node) -> String {
    node.name()
        .map(|n| n.to_string())
        .unwrap_or_else(|| format!("node-{}", node.index()))
}

fn skin_name(skin: &gltf::Skin) -> String {
    skin.name()
        .map(|n| n.to_string())
        .unwrap_or_else(|| format!("skin-{}", skin.index()))
}

fn material_symbol(primitive: &gltf::Primitive) -> String {
    match primitive.material().name() {
        Some(name) => name.to_string(),
        None => match primitive.material().index() {
            Some(index) => index.to_string(),
            None => "default".to_string(),
        },
    }
}

/// Imports a glTF document into nascent objects.
pub fn import_document(path: &Path, import_config: &ImportConfiguration) -> Result<ImportedDocument> {
    let (document, buffers, _images) =
        gltf::import(path).with_context(|| format!("failed to load glTF: {}", path.display()))?;

    let mut model = NascentModel::new();
    let mut material_names: Vec<String> = Vec::new();
    let mut skeleton_names: Vec<String> = Vec::new();

    // geometry blocks, one per mesh primitive, keyed in a stable
    // namespace so repeated node references share the block
    let mut primitive_guids: Vec<Vec<NascentObjectGuid>> = Vec::new();
    for mesh in document.meshes() {
        let mut guids = Vec::new();
        for primitive in mesh.primitives() {
            let guid = NascentObjectGuid::with_namespace(
                (mesh.index() as u64) << 16 | primitive.index() as u64,
                1,
            );
            let block = convert_primitive(&primitive, &buffers, &mesh)?;
            model.add_geometry_block(guid, block)?;
            guids.push(guid);
        }
        primitive_guids.push(guids);
    }

    // skins become unbound controllers
    let mut skin_guids: Vec<NascentObjectGuid> = Vec::new();
    for skin in document.skins() {
        let guid = NascentObjectGuid::with_namespace(skin.index() as u64, 2);
        let name = skin_name(&skin);
        let controller = convert_skin(&skin, &buffers, &document)?;
        model.add_skin_controller_block(
            guid,
            SkinControllerBlock {
                controller,
                skeleton: name.clone(),
            },
        )?;
        if !skeleton_names.contains(&name) {
            skeleton_names.push(name);
        }
        skin_guids.push(guid);
    }

    // joint markers are emitted per node, with the owning skin's name
    let mut joint_tags: Vec<Vec<String>> = vec![Vec::new(); document.nodes().count()];
    for skin in document.skins() {
        let name = skin_name(&skin);
        for joint in skin.joints() {
            joint_tags[joint.index()].push(name.clone());
        }
    }

    // walk the scene, emitting skeleton commands and model commands
    let mut skeleton = NascentSkeleton::new();
    let scene = document
        .default_scene()
        .or_else(|| document.scenes().next())
        .ok_or_else(|| anyhow!("no visual scene in document"))?;
    for node in scene.nodes() {
        walk_node(
            &node,
            &mut skeleton,
            &mut model,
            &primitive_guids,
            &skin_guids,
            &joint_tags,
            &mut material_names,
            import_config,
        )?;
    }

    // animations drive node-local channels
    let mut animations = NascentAnimationSet::new();
    for animation in document.animations() {
        let clip_name = animation
            .name()
            .map(|n| n.to_string())
            .unwrap_or_else(|| format!("animation-{}", animation.index()));
        let mut clip = NascentAnimationSet::new();
        for channel in animation.channels() {
            import_channel(&channel, &buffers, &mut clip)?;
        }
        animations.merge_in_as_individual_animation(&clip, &clip_name)?;
    }

    Ok(ImportedDocument {
        model,
        skeleton,
        animations,
        material_names,
        skeleton_names,
    })
}

fn convert_primitive(
    primitive: &gltf::Primitive,
    buffers: &[gltf::buffer::Data],
    mesh: &gltf::Mesh,
) -> Result<GeometryBlock> {
    let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));

    let positions: Vec<[f32; 3]> = reader
        .read_positions()
        .ok_or_else(|| anyhow!("mesh primitive has no positions"))?
        .collect();
    let vertex_count = positions.len();

    let mut database = MeshDatabase::new(vertex_count);
    database.add_stream(
        SEMANTIC_POSITION,
        0,
        positions.iter().map(|p| [p[0], p[1], p[2], 0.0]).collect(),
        3,
    )?;

    if let Some(normals) = reader.read_normals() {
        database.add_stream(
            SEMANTIC_NORMAL,
            0,
            normals.map(|n| [n[0], n[1], n[2], 0.0]).collect(),
            3,
        )?;
    }
    if let Some(uvs) = reader.read_tex_coords(0) {
        database.add_stream(
            SEMANTIC_TEXCOORD,
            0,
            uvs.into_f32().map(|uv| [uv[0], uv[1], 0.0, 0.0]).collect(),
            2,
        )?;
    }
    if let Some(colors) = reader.read_colors(0) {
        database.add_stream(
            SEMANTIC_COLOR,
            0,
            colors.into_rgba_f32().collect(),
            4,
        )?;
    }

    let indices: Vec<u32> = match reader.read_indices() {
        Some(read) => read.into_u32().collect(),
        None => (0..vertex_count as u32).collect(),
    };
    let (index_bytes, index_format) = if vertex_count <= u16::MAX as usize + 1 {
        (
            indices
                .iter()
                .flat_map(|&i| (i as u16).to_le_bytes())
                .collect::<Vec<u8>>(),
            IndexFormat::U16,
        )
    } else {
        (
            indices.iter().flat_map(|i| i.to_le_bytes()).collect(),
            IndexFormat::U32,
        )
    };

    let topology = match primitive.mode() {
        gltf::mesh::Mode::Points => Topology::PointList,
        gltf::mesh::Mode::Lines => Topology::LineList,
        gltf::mesh::Mode::LineStrip => Topology::LineStrip,
        gltf::mesh::Mode::TriangleStrip => Topology::TriangleStrip,
        _ => Topology::TriangleList,
    };

    Ok(GeometryBlock {
        mesh: database,
        draw_calls: vec![DrawCallDesc {
            first_index: 0,
            index_count: indices.len() as u32,
            topology: topology as u32,
        }],
        indices: index_bytes,
        index_format,
        rules_label: mesh.name().unwrap_or("").to_string(),
        ..Default::default()
    })
}

fn convert_skin(
    skin: &gltf::Skin,
    buffers: &[gltf::buffer::Data],
    document: &gltf::Document,
) -> Result<UnboundSkinController> {
    let reader = skin.reader(|buffer| Some(&buffers[buffer.index()]));
    let joint_names: Vec<String> = skin.joints().map(|j| node_name(&j)).collect();
    let inverse_binds: Vec<Mat4> = match reader.read_inverse_bind_matrices() {
        Some(matrices) => matrices.map(|m| Mat4::from_cols_array_2d(&m)).collect(),
        None => vec![Mat4::IDENTITY; joint_names.len()],
    };

    // influences come from the first primitive of the first skinned mesh
    // referencing this skin
    let mut influences: Vec<SmallVec<[Influence; MAX_INFLUENCES_PER_VERTEX]>> = Vec::new();
    'outer: for node in document.nodes() {
        let Some(node_skin) = node.skin() else { continue };
        if node_skin.index() != skin.index() {
            continue;
        }
        let Some(mesh) = node.mesh() else { continue };
        for primitive in mesh.primitives() {
            let reader = primitive.reader(|buffer| Some(&buffers[buffer.index()]));
            let (Some(joints), Some(weights)) =
                (reader.read_joints(0), reader.read_weights(0))
            else {
                continue;
            };
            for (joint_set, weight_set) in joints.into_u16().zip(weights.into_f32()) {
                let mut vertex: SmallVec<[Influence; MAX_INFLUENCES_PER_VERTEX]> =
                    SmallVec::new();
                for (joint, weight) in joint_set.into_iter().zip(weight_set) {
                    if weight > 0.0 {
                        vertex.push((joint, weight));
                    }
                }
                influences.push(vertex);
            }
            break 'outer;
        }
    }

    Ok(UnboundSkinController::new(
        inverse_binds,
        joint_names,
        influences,
    )?)
}

#[allow(clippy::too_many_arguments)]
fn walk_node(
    node: &gltf::Node,
    skeleton: &mut NascentSkeleton,
    model: &mut NascentModel,
    primitive_guids: &[Vec<NascentObjectGuid>],
    skin_guids: &[NascentObjectGuid],
    joint_tags: &[Vec<String>],
    material_names: &mut Vec<String>,
    import_config: &ImportConfiguration,
) -> Result<()> {
    let name = node_name(node);
    skeleton.write_push_local_to_model();
    let matrix = Mat4::from_cols_array_2d(&node.transform().matrix());
    if matrix != Mat4::IDENTITY {
        skeleton.write_static_transform(&Transform::matrix(matrix));
    }
    skeleton.write_output_marker("", &name);
    for skin in &joint_tags[node.index()] {
        skeleton.write_output_marker(skin, &name);
    }

    if let Some(mesh) = node.mesh() {
        let skin_controllers: Vec<NascentObjectGuid> = node
            .skin()
            .map(|skin| vec![skin_guids[skin.index()]])
            .unwrap_or_default();

        for (primitive, guid) in mesh.primitives().zip(&primitive_guids[mesh.index()]) {
            let symbol = material_symbol(&primitive);
            let Some(symbol) = import_config.remap_binding(&symbol) else {
                tracing::debug!(binding = symbol, "suppressed by import configuration");
                continue;
            };
            if !material_names.contains(&symbol) {
                material_names.push(symbol.clone());
            }
            model.add_command_defaulted(Command {
                geometry_block: *guid,
                skin_controller_blocks: skin_controllers.clone(),
                local_to_model: name.clone(),
                material_binding_symbols: vec![symbol],
                groups: Vec::new(),
                level_of_detail: 0,
            });
        }
    }

    for child in node.children() {
        walk_node(
            &child,
            skeleton,
            model,
            primitive_guids,
            skin_guids,
            joint_tags,
            material_names,
            import_config,
        )?;
    }
    skeleton.write_pop_local_to_model(1);
    Ok(())
}

fn import_channel(
    channel: &gltf::animation::Channel,
    buffers: &[gltf::buffer::Data],
    clip: &mut NascentAnimationSet,
) -> Result<()> {
    use gltf::animation::util::ReadOutputs;

    let reader = channel.reader(|buffer| Some(&buffers[buffer.index()]));
    let Some(inputs) = reader.read_inputs() else {
        return Ok(());
    };
    let time_markers: Vec<f32> = inputs.collect();
    let target = node_name(&channel.target().node());

    let (parameter, curve, sampler) = match reader.read_outputs() {
        Some(ReadOutputs::Translations(values)) => (
            format!("{target}/translation"),
            RawAnimationCurve {
                time_markers,
                key_data: values.flat_map(|v| bytemuck::cast::<[f32; 3], [u8; 12]>(v)).collect(),
                key_format: curve_format::F32X3,
                elements_per_key: 3,
            },
            sampler_type::FLOAT3,
        ),
        Some(ReadOutputs::Rotations(values)) => (
            format!("{target}/rotation"),
            RawAnimationCurve {
                time_markers,
                key_data: values
                    .into_f32()
                    .flat_map(|v| bytemuck::cast::<[f32; 4], [u8; 16]>(v))
                    .collect(),
                key_format: curve_format::F32X4,
                elements_per_key: 4,
            },
            sampler_type::QUATERNION,
        ),
        Some(ReadOutputs::Scales(values)) => (
            format!("{target}/scale"),
            RawAnimationCurve {
                time_markers,
                key_data: values.flat_map(|v| bytemuck::cast::<[f32; 3], [u8; 12]>(v)).collect(),
                key_format: curve_format::F32X3,
                elements_per_key: 3,
            },
            sampler_type::FLOAT3,
        ),
        _ => return Ok(()),
    };

    let curve_index = clip.add_curve(curve);
    clip.add_animation_driver(&parameter, curve_index, sampler, 0)?;
    Ok(())
}
