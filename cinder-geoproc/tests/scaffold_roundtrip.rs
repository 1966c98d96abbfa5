//! End-to-end: compile nascent models to scaffolds and read them back.

use glam::{Mat4, Vec3};

use cinder_geoproc::mesh_database::{MeshDatabase, SEMANTIC_POSITION};
use cinder_geoproc::{
    Command, GeometryBlock, ModelCompilationConfiguration, NascentModel, NascentSkeleton,
    SkinControllerBlock, UnboundSkinController, serialize_to_chunks,
};
use cinder_scaffold::chunks::ChunkFile;
use cinder_scaffold::cmd::{GeoCommand, ModelCommand};
use cinder_scaffold::hash::{hash64, hash_combine};
use cinder_scaffold::types::{DrawCallDesc, IndexBufferRef, IndexFormat, LargeBlockRef, Topology};
use cinder_scaffold::{DependencyValidation, ModelScaffold};

const CUBE_CORNERS: [[f32; 3]; 8] = [
    [-1.0, -1.0, -1.0],
    [1.0, -1.0, -1.0],
    [-1.0, 1.0, -1.0],
    [1.0, 1.0, -1.0],
    [-1.0, -1.0, 1.0],
    [1.0, -1.0, 1.0],
    [-1.0, 1.0, 1.0],
    [1.0, 1.0, 1.0],
];

// 12 triangles, 36 indices
const CUBE_INDICES: [u16; 36] = [
    0, 2, 1, 1, 2, 3, // -Z
    4, 5, 6, 5, 7, 6, // +Z
    0, 4, 2, 2, 4, 6, // -X
    1, 3, 5, 3, 7, 5, // +X
    0, 1, 4, 1, 5, 4, // -Y
    2, 6, 3, 3, 6, 7, // +Y
];

fn cube_geometry() -> GeometryBlock {
    let mut mesh = MeshDatabase::new(8);
    mesh.add_stream(
        SEMANTIC_POSITION,
        0,
        CUBE_CORNERS.map(|p| [p[0], p[1], p[2], 0.0]).to_vec(),
        3,
    )
    .unwrap();
    GeometryBlock {
        mesh,
        draw_calls: vec![DrawCallDesc {
            first_index: 0,
            index_count: 36,
            topology: Topology::TriangleList as u32,
        }],
        indices: CUBE_INDICES.iter().flat_map(|i| i.to_le_bytes()).collect(),
        index_format: IndexFormat::U16,
        ..Default::default()
    }
}

fn root_skeleton() -> NascentSkeleton {
    let mut skeleton = NascentSkeleton::new();
    skeleton.write_push_local_to_model();
    skeleton.write_output_marker("", "root");
    skeleton.write_pop_local_to_model(1);
    skeleton
}

fn cube_model() -> NascentModel {
    let mut model = NascentModel::new();
    let geo = model.add_geometry_block_defaulted(cube_geometry());
    model.add_command_defaulted(Command {
        geometry_block: geo,
        local_to_model: "root".into(),
        material_binding_symbols: vec!["Material0".into()],
        ..Default::default()
    });
    model
}

fn compile(model: &NascentModel) -> ModelScaffold {
    let artifacts = serialize_to_chunks(
        model,
        "cube",
        &root_skeleton(),
        &ModelCompilationConfiguration::default(),
    )
    .unwrap();
    let chunks = ChunkFile::from_artifacts(artifacts);
    ModelScaffold::new(&chunks, DependencyValidation::new()).unwrap()
}

#[test]
fn cube_mesh_round_trip() {
    let model = cube_model();
    let scaffold = compile(&model);

    // exactly one command stream, the default one
    assert_eq!(scaffold.collate_command_streams(), vec![0]);

    // exactly one GeoCall(0)
    let geo_calls: Vec<u32> = scaffold
        .command_stream(0)
        .map(|cmd| cmd.unwrap())
        .filter(|cmd| cmd.cmd == ModelCommand::GeoCall as u32)
        .map(|cmd| cmd.as_pod::<u32>().unwrap())
        .collect();
    assert_eq!(geo_calls, vec![0]);

    // one geo record whose draw calls sum to 36 indices
    assert_eq!(scaffold.geo_count(), 1);
    let mut total_indices = 0;
    let mut vb = LargeBlockRef::default();
    let mut ib = IndexBufferRef::default();
    for cmd in scaffold.geo_machine(0) {
        let cmd = cmd.unwrap();
        if cmd.cmd == GeoCommand::AttachDrawCalls as u32 {
            for draw_call in cmd.as_pod_slice::<DrawCallDesc>().unwrap() {
                total_indices += draw_call.index_count;
            }
        } else if cmd.cmd == GeoCommand::AttachVertexBuffer as u32 {
            vb = cmd.as_pod().unwrap();
        } else if cmd.cmd == GeoCommand::AttachIndexBuffer as u32 {
            ib = cmd.as_pod().unwrap();
        }
    }
    assert_eq!(total_indices, 36);
    assert_eq!(vb.size, 8 * 12); // eight Float3 positions
    assert_eq!(ib.block.size, 36 * 2);
    assert_eq!(ib.format, IndexFormat::U16 as u32);

    // large blocks stream serves the recorded ranges
    let large = scaffold.open_large_blocks().unwrap();
    let indices = large.read_range(ib.block.offset, ib.block.size).unwrap();
    assert_eq!(indices.len(), 72);
    assert_eq!(u16::from_le_bytes(indices[0..2].try_into().unwrap()), 0);

    // bounding box covers the unit cube
    let (min, max) = scaffold.static_bounding_box(0);
    assert_eq!(min, Vec3::new(-1.0, -1.0, -1.0));
    assert_eq!(max, Vec3::new(1.0, 1.0, 1.0));

    assert_eq!(scaffold.max_lod(), 0);
    assert_eq!(
        scaffold.dehash_material_name(hash64("Material0")),
        Some("Material0")
    );

    // the skeleton rides along and regenerates its outputs
    let machine = scaffold.embedded_skeleton().unwrap();
    assert_eq!(machine.output_matrix_count, 1);
    let outputs =
        machine.generate_output_transforms(&cinder_scaffold::TransformParams::new());
    assert_eq!(outputs, vec![Mat4::IDENTITY]);

    // all-identity default pose stores zero transforms
    assert!(scaffold.default_pose_data().default_transforms.is_empty());

    // the stream input interface carries the hashed binding point
    assert_eq!(
        scaffold.command_stream_input_interface(),
        &[hash_combine(hash64(""), hash64("root"))]
    );
}

#[test]
fn material_assignments_parallel_draw_calls() {
    let model = cube_model();
    let scaffold = compile(&model);

    // the SetMaterialAssignments record preceding each GeoCall carries
    // exactly one entry per draw call of the referenced geo
    let mut current_materials = 0usize;
    for cmd in scaffold.command_stream(0) {
        let cmd = cmd.unwrap();
        if cmd.cmd == ModelCommand::SetMaterialAssignments as u32 {
            current_materials = cmd.as_pod_slice::<u64>().unwrap().len();
        } else if cmd.cmd == ModelCommand::GeoCall as u32 {
            let geo_idx = cmd.as_pod::<u32>().unwrap() as usize;
            let draw_calls: usize = scaffold
                .geo_machine(geo_idx)
                .map(|c| c.unwrap())
                .filter(|c| c.cmd == GeoCommand::AttachDrawCalls as u32)
                .map(|c| c.as_pod_slice::<DrawCallDesc>().unwrap().len())
                .sum();
            assert_eq!(current_materials, draw_calls);
        }
    }
}

#[test]
fn mismatched_material_symbol_count_is_rejected() {
    let mut model = NascentModel::new();
    let geo = model.add_geometry_block_defaulted(cube_geometry());
    model.add_command_defaulted(Command {
        geometry_block: geo,
        local_to_model: "root".into(),
        material_binding_symbols: vec!["a".into(), "b".into()], // one draw call
        ..Default::default()
    });
    let result = serialize_to_chunks(
        &model,
        "bad",
        &root_skeleton(),
        &ModelCompilationConfiguration::default(),
    );
    assert!(result.is_err());
}

#[test]
fn compile_is_deterministic() {
    let model = cube_model();
    let config = ModelCompilationConfiguration::default();
    let first = serialize_to_chunks(&model, "cube", &root_skeleton(), &config).unwrap();
    let second = serialize_to_chunks(&model, "cube", &root_skeleton(), &config).unwrap();
    assert_eq!(first[0].data, second[0].data);
    assert_eq!(first[1].data, second[1].data);
}

#[test]
fn skinned_cube_with_eight_bones() {
    let mut model = NascentModel::new();
    let geo = model.add_geometry_block_defaulted(cube_geometry());

    // each vertex weighted by inverse distance to each bone; bones sit at
    // the cube corners
    let influences = CUBE_CORNERS
        .iter()
        .map(|vertex| {
            let v = Vec3::from_array(*vertex);
            (0u16..8)
                .map(|bone| {
                    let b = Vec3::from_array(CUBE_CORNERS[bone as usize]);
                    (bone, 1.0 / (1.0 + (v - b).length()))
                })
                .collect()
        })
        .collect();
    let controller = UnboundSkinController::new(
        vec![Mat4::IDENTITY; 8],
        (0..8).map(|i| format!("bone-{i}")).collect(),
        influences,
    )
    .unwrap();
    let skin = model.add_skin_controller_block_defaulted(SkinControllerBlock {
        controller,
        skeleton: "skinning".into(),
    });
    model.add_command_defaulted(Command {
        geometry_block: geo,
        skin_controller_blocks: vec![skin],
        local_to_model: "root".into(),
        material_binding_symbols: vec!["Material0".into()],
        ..Default::default()
    });

    let scaffold = compile(&model);

    // one skinned geo record with a skeleton binding attached
    assert_eq!(scaffold.geo_count(), 1);
    let has_binding = scaffold.geo_machine(0).any(|cmd| {
        cmd.map(|c| c.cmd == GeoCommand::AttachSkeletonBinding as u32)
            .unwrap_or(false)
    });
    assert!(has_binding);

    // input interface: the per-command binding plus 8 hashed
    // (skinning, bone-N) pairs
    let interface = scaffold.command_stream_input_interface();
    assert_eq!(interface.len(), 9);
    assert_eq!(interface[0], hash_combine(hash64(""), hash64("root")));
    for bone in 0..8 {
        assert_eq!(
            interface[bone + 1],
            hash_combine(hash64("skinning"), hash64(&format!("bone-{bone}")))
        );
    }
}

#[test]
fn skeleton_pose_survives_scaffold_round_trip() {
    let mut skeleton = NascentSkeleton::new();
    skeleton.write_push_local_to_model();
    skeleton.write_static_transform(&cinder_geoproc::Transform::decomposed(
        Vec3::new(0.5, 1.5, -2.0),
        glam::Quat::from_rotation_y(0.3),
        1.25,
    ));
    skeleton.write_output_marker("", "root");
    skeleton.write_push_local_to_model();
    skeleton.write_static_transform(&cinder_geoproc::Transform::decomposed(
        Vec3::new(0.0, 2.0, 0.0),
        glam::Quat::IDENTITY,
        1.0,
    ));
    skeleton.write_output_marker("", "arm");
    skeleton.write_pop_local_to_model(2);

    let before = skeleton.skeleton_machine().generate_output_transforms();

    let mut model = NascentModel::new();
    let geo = model.add_geometry_block_defaulted(cube_geometry());
    model.add_command_defaulted(Command {
        geometry_block: geo,
        local_to_model: "root".into(),
        material_binding_symbols: vec!["Material0".into()],
        ..Default::default()
    });
    let artifacts = serialize_to_chunks(
        &model,
        "posed",
        &skeleton,
        &ModelCompilationConfiguration::default(),
    )
    .unwrap();
    let chunks = ChunkFile::from_artifacts(artifacts);
    let scaffold = ModelScaffold::new(&chunks, DependencyValidation::new()).unwrap();

    let machine = scaffold.embedded_skeleton().unwrap();
    let after = machine.generate_output_transforms(&cinder_scaffold::TransformParams::new());
    assert_eq!(before.len(), after.len());
    for (a, b) in before.iter().zip(after.iter()) {
        for (x, y) in a.to_cols_array().iter().zip(b.to_cols_array().iter()) {
            assert!((x - y).abs() < 1e-6);
        }
    }

    // the dehash table rides along with the machine
    assert_eq!(machine.dehash_name(hash64("arm")), Some("arm"));
}
