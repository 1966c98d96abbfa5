//! Model scaffold reader.
//!
//! Structural data describing a model, loaded from a chunk container. The
//! scaffold is light weight: the large vertex/index resources stay in the
//! separate large-blocks chunk and are only opened on demand. Once
//! constructed a scaffold is immutable and may be queried from many
//! threads.

use cinder_block::{AlignedBlock, BlockView, block_initialize};
use glam::{Mat4, Vec3};

use crate::ScaffoldError;
use crate::chunks::{
    CHUNK_TYPE_MODEL_SCAFFOLD, CHUNK_TYPE_MODEL_SCAFFOLD_LARGE_BLOCKS, ChunkFile, ChunkReopen,
    MODEL_SCAFFOLD_VERSION,
};
use crate::cmd::{ModelCommand, ScaffoldCmdIterator, ScaffoldCommand};
use crate::depval::DependencyValidation;
use crate::skeleton::SkeletonMachine;

/// Default command stream guid.
pub const CMD_STREAM_GUID_DEFAULT: u64 = 0;

#[derive(Debug, Clone, Copy)]
struct MachineRange {
    start: usize,
    size: usize,
}

/// Default pose data stored in the scaffold.
#[derive(Debug, Clone, Default)]
pub struct ModelDefaultPoseData {
    pub default_transforms: Vec<Mat4>,
    pub bounding_box: (Vec3, Vec3),
}

/// Root-level model data.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelRootData {
    pub max_lod: u32,
}

/// Structural data describing a compiled model.
#[derive(Debug)]
pub struct ModelScaffold {
    block: AlignedBlock,
    primary_size: usize,
    data_end: usize,
    command_streams: Vec<(u64, MachineRange)>,
    geo_machines: Vec<MachineRange>,
    material_machines: Vec<(u64, MachineRange)>,
    embedded_skeleton: Option<SkeletonMachine>,
    default_pose: ModelDefaultPoseData,
    root_data: ModelRootData,
    material_name_dehash: Vec<(u64, String)>,
    input_interface: Vec<u64>,
    large_blocks: Option<ChunkReopen>,
    depval: DependencyValidation,
}

impl ModelScaffold {
    pub fn new(chunks: &ChunkFile, depval: DependencyValidation) -> Result<Self, ScaffoldError> {
        let data = chunks.require(CHUNK_TYPE_MODEL_SCAFFOLD, MODEL_SCAFFOLD_VERSION)?;
        let mut block = AlignedBlock::from_bytes(data);
        block_initialize(&mut block)?;
        let large_blocks = chunks.reopen(CHUNK_TYPE_MODEL_SCAFFOLD_LARGE_BLOCKS).ok();

        let view = BlockView::new(&block)?;
        let primary_size = view.first_object().len();
        let data_end = cinder_block::BlockHeader::SIZE + view.bytes().len();

        let mut command_streams = Vec::new();
        let mut geo_machines = Vec::new();
        let mut material_machines = Vec::new();
        let mut embedded_skeleton = None;
        let mut default_pose = ModelDefaultPoseData::default();
        let mut root_data = ModelRootData::default();
        let mut material_name_dehash = Vec::new();

        // the outer command stream is length-prefixed with a u32 byte count
        let outer_len = view.read_u32(0)? as usize;
        let mut offset = 4usize;
        let outer_end = 4 + outer_len;
        while offset < outer_end {
            let cmd = view.read_u32(offset)?;
            let size = view.read_u32(offset + 4)? as usize;
            let payload = offset + 8;
            if payload + size > outer_end {
                return Err(ScaffoldError::TruncatedRecord(offset));
            }

            match cmd {
                c if c == ScaffoldCommand::ModelCommandStream as u32 => {
                    let guid = view.read_u64(payload)?;
                    let data_size = view.read_u64(payload + 8)? as usize;
                    let start = view.resolve(payload + 16)?;
                    command_streams.push((guid, MachineRange { start, size: data_size }));
                }
                c if c == ScaffoldCommand::Geo as u32 => {
                    let data_size = view.read_u64(payload)? as usize;
                    let start = view.resolve(payload + 8)?;
                    geo_machines.push(MachineRange { start, size: data_size });
                }
                c if c == ScaffoldCommand::Material as u32 => {
                    let guid = view.read_u64(payload)?;
                    let data_size = view.read_u64(payload + 8)? as usize;
                    let start = view.resolve(payload + 16)?;
                    material_machines.push((guid, MachineRange { start, size: data_size }));
                }
                c if c == ScaffoldCommand::Skeleton as u32 => {
                    let start = view.resolve(payload + 8)?;
                    embedded_skeleton = Some(SkeletonMachine::parse(&view, start)?);
                }
                c if c == ScaffoldCommand::DefaultPoseData as u32 => {
                    let transforms = view.vec_view::<[f32; 16]>(payload)?;
                    default_pose.default_transforms = transforms
                        .iter()
                        .map(|cols| Mat4::from_cols_array(cols))
                        .collect();
                    let bb = view.slice_at(payload + 16, 24)?;
                    let f = |i: usize| {
                        f32::from_le_bytes(bb[i * 4..i * 4 + 4].try_into().unwrap())
                    };
                    default_pose.bounding_box = (
                        Vec3::new(f(0), f(1), f(2)),
                        Vec3::new(f(3), f(4), f(5)),
                    );
                }
                c if c == ScaffoldCommand::ModelRootData as u32 => {
                    root_data.max_lod = view.read_u32(payload)?;
                }
                c if c == ScaffoldCommand::MaterialNameDehash as u32 => {
                    let base = view.resolve(payload)?;
                    let count = view.count_at(payload)?;
                    for i in 0..count {
                        let entry = base + i * 24;
                        let hash = view.read_u64(entry)?;
                        let name = view.string_view(entry + 8)?.to_string();
                        material_name_dehash.push((hash, name));
                    }
                }
                _ => {
                    // unknown records are skippable by their block size
                }
            }
            offset = payload + size;
        }

        command_streams.sort_by_key(|(guid, _)| *guid);
        material_machines.sort_by_key(|(guid, _)| *guid);
        material_name_dehash.sort_by_key(|(hash, _)| *hash);

        let mut scaffold = Self {
            block,
            primary_size,
            data_end,
            command_streams,
            geo_machines,
            material_machines,
            embedded_skeleton,
            default_pose,
            root_data,
            material_name_dehash,
            input_interface: Vec::new(),
            large_blocks,
            depval,
        };
        scaffold.input_interface = scaffold.find_input_interface()?;
        Ok(scaffold)
    }

    fn view(&self) -> BlockView<'_> {
        BlockView::from_data(
            &self.block[cinder_block::BlockHeader::SIZE..self.data_end],
            self.primary_size,
        )
    }

    fn machine_bytes(&self, range: MachineRange) -> &[u8] {
        let data = &self.block[cinder_block::BlockHeader::SIZE..self.data_end];
        &data[range.start..range.start + range.size]
    }

    fn find_input_interface(&self) -> Result<Vec<u64>, ScaffoldError> {
        for cmd in self.command_stream(CMD_STREAM_GUID_DEFAULT) {
            let cmd = cmd?;
            if cmd.cmd == ModelCommand::InputInterface as u32 {
                return cmd.as_pod_slice::<u64>();
            }
        }
        Ok(Vec::new())
    }

    /// Iterates the scaffold commands of one stream; empty for an unknown
    /// guid.
    pub fn command_stream(&self, stream_guid: u64) -> ScaffoldCmdIterator<'_> {
        match self
            .command_streams
            .binary_search_by_key(&stream_guid, |(g, _)| *g)
        {
            Ok(idx) => ScaffoldCmdIterator::new(self.machine_bytes(self.command_streams[idx].1)),
            Err(_) => ScaffoldCmdIterator::new(&[]),
        }
    }

    /// Guids of every command stream in the scaffold.
    pub fn collate_command_streams(&self) -> Vec<u64> {
        self.command_streams.iter().map(|(g, _)| *g).collect()
    }

    /// Iterator over the geo machine with the given dense index.
    pub fn geo_machine(&self, geo_idx: usize) -> ScaffoldCmdIterator<'_> {
        match self.geo_machines.get(geo_idx) {
            Some(range) => ScaffoldCmdIterator::new(self.machine_bytes(*range)),
            None => ScaffoldCmdIterator::new(&[]),
        }
    }

    pub fn geo_count(&self) -> usize {
        self.geo_machines.len()
    }

    /// O(log n) lookup of a material machine by guid.
    pub fn material_machine(&self, guid: u64) -> Option<ScaffoldCmdIterator<'_>> {
        self.material_machines
            .binary_search_by_key(&guid, |(g, _)| *g)
            .ok()
            .map(|idx| ScaffoldCmdIterator::new(self.machine_bytes(self.material_machines[idx].1)))
    }

    pub fn static_bounding_box(&self, _lod_index: usize) -> (Vec3, Vec3) {
        self.default_pose.bounding_box
    }

    pub fn max_lod(&self) -> u32 {
        self.root_data.max_lod
    }

    pub fn default_pose_data(&self) -> &ModelDefaultPoseData {
        &self.default_pose
    }

    pub fn embedded_skeleton(&self) -> Option<&SkeletonMachine> {
        self.embedded_skeleton.as_ref()
    }

    /// The hashed `(skeleton, joint)` input interface of the default
    /// command stream.
    pub fn command_stream_input_interface(&self) -> &[u64] {
        &self.input_interface
    }

    /// Resolves a material guid back to its source name, when the writer
    /// recorded it.
    pub fn dehash_material_name(&self, guid: u64) -> Option<&str> {
        self.material_name_dehash
            .binary_search_by_key(&guid, |(h, _)| *h)
            .ok()
            .map(|idx| self.material_name_dehash[idx].1.as_str())
    }

    /// Re-openable handle for streaming vertex/index data on demand.
    pub fn open_large_blocks(&self) -> Option<ChunkReopen> {
        self.large_blocks.clone()
    }

    pub fn dependency_validation(&self) -> &DependencyValidation {
        &self.depval
    }

    /// Raw view over the underlying block, for diagnostic tooling.
    pub fn raw_view(&self) -> BlockView<'_> {
        self.view()
    }
}
