//! Skeleton and animation-set scaffold read side.
//!
//! The writer lays a skeleton out as a small relocatable block:
//!
//! ```text
//! 0x00: vector cell -> u32[] transformation command stream
//! 0x10: vector cell -> u64[] hashed output interface
//! 0x20: vector cell -> u64[] hashed parameter interface
//! 0x30: u64 output matrix count
//! 0x38: vector cell -> dehash entries { u64 hash; string cell } (24 bytes)
//! ```
//!
//! An animation set block:
//!
//! ```text
//! 0x00: vector cell -> AnimationDriver[]
//! 0x10: vector cell -> ConstantDriver[]
//! 0x20: vector cell -> u8[] constant data
//! 0x30: vector cell -> u64[] parameter interface hashes
//! 0x40: vector cell -> animations { string cell; Animation pod } (40 bytes)
//! 0x50: vector cell -> curves { vector cell time markers;
//!                               vector cell key data;
//!                               u32 key_format; u32 elements_per_key } (40 bytes)
//! ```

use bytemuck::{Pod, Zeroable};
use cinder_block::{AlignedBlock, BlockView, block_initialize};
use glam::Mat4;

use crate::ScaffoldError;
use crate::chunks::{CHUNK_TYPE_ANIMATION_SET, CHUNK_TYPE_SKELETON, ChunkFile};
use crate::depval::DependencyValidation;
use crate::transform::{TransformParams, generate_output_transforms};

/// Sampler type of an animation driver, stored as a raw u32.
pub mod sampler_type {
    pub const FLOAT: u32 = 1;
    pub const FLOAT3: u32 = 2;
    pub const FLOAT4: u32 = 3;
    pub const QUATERNION: u32 = 4;
    pub const MATRIX: u32 = 5;
}

/// A curve-driven animation parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct AnimationDriver {
    pub curve_index: u32,
    pub parameter_index: u32,
    pub sampler_type: u32,
    pub sampler_offset: u32,
}

/// A constant-valued animation parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
#[repr(C)]
pub struct ConstantDriver {
    pub data_offset: u32,
    pub data_size: u32,
    pub format: u32,
    pub parameter_index: u32,
    pub sampler_type: u32,
    pub sampler_offset: u32,
}

/// Time and driver ranges of one named animation.
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
#[repr(C)]
pub struct AnimationDesc {
    pub begin_time: f32,
    pub end_time: f32,
    pub driver_begin: u32,
    pub driver_end: u32,
    pub constant_begin: u32,
    pub constant_end: u32,
}

/// Parsed transformation machine plus its binding interfaces.
#[derive(Debug, Clone, Default)]
pub struct SkeletonMachine {
    pub commands: Vec<u32>,
    pub output_interface: Vec<u64>,
    pub parameter_interface: Vec<u64>,
    pub output_matrix_count: usize,
    pub dehash: Vec<(u64, String)>,
}

impl SkeletonMachine {
    /// Parses a skeleton block laid out at `offset` inside `view`.
    pub fn parse(view: &BlockView, offset: usize) -> Result<Self, ScaffoldError> {
        let commands = view.vec_view::<u32>(offset)?.as_slice().to_vec();
        let output_interface = view.vec_view::<u64>(offset + 0x10)?.as_slice().to_vec();
        let parameter_interface = view.vec_view::<u64>(offset + 0x20)?.as_slice().to_vec();
        let output_matrix_count = view.read_u64(offset + 0x30)? as usize;

        let dehash_base = view.resolve(offset + 0x38)?;
        let dehash_count = view.count_at(offset + 0x38)?;
        let mut dehash = Vec::with_capacity(dehash_count);
        for i in 0..dehash_count {
            let entry = dehash_base + i * 24;
            let hash = view.read_u64(entry)?;
            let name = view.string_view(entry + 8)?.to_string();
            dehash.push((hash, name));
        }

        Ok(Self {
            commands,
            output_interface,
            parameter_interface,
            output_matrix_count,
            dehash,
        })
    }

    /// Runs the machine with the given parameters.
    pub fn generate_output_transforms(&self, params: &TransformParams) -> Vec<Mat4> {
        generate_output_transforms(&self.commands, self.output_matrix_count, params)
    }

    pub fn dehash_name(&self, hash: u64) -> Option<&str> {
        self.dehash
            .iter()
            .find(|(h, _)| *h == hash)
            .map(|(_, n)| n.as_str())
    }
}

/// Maps a command stream's input interface onto a skeleton machine's
/// output interface.
#[derive(Debug, Clone, Default)]
pub struct SkeletonBinding {
    model_joint_to_machine_output: Vec<u32>,
}

impl SkeletonBinding {
    pub fn new(machine_output_interface: &[u64], stream_input_interface: &[u64]) -> Self {
        let model_joint_to_machine_output = stream_input_interface
            .iter()
            .map(|joint| {
                machine_output_interface
                    .iter()
                    .position(|o| o == joint)
                    .map(|p| p as u32)
                    .unwrap_or(u32::MAX)
            })
            .collect();
        Self {
            model_joint_to_machine_output,
        }
    }

    /// Machine output index for a model joint, or `u32::MAX` when unbound.
    pub fn model_joint_to_machine_output(&self, model_joint: usize) -> u32 {
        self.model_joint_to_machine_output
            .get(model_joint)
            .copied()
            .unwrap_or(u32::MAX)
    }

    pub fn model_joint_count(&self) -> usize {
        self.model_joint_to_machine_output.len()
    }
}

/// Standalone skeleton scaffold loaded from a chunk container.
#[derive(Debug)]
pub struct SkeletonScaffold {
    machine: SkeletonMachine,
    depval: DependencyValidation,
}

impl SkeletonScaffold {
    pub fn new(chunks: &ChunkFile, depval: DependencyValidation) -> Result<Self, ScaffoldError> {
        let data = chunks.require(CHUNK_TYPE_SKELETON, 1)?;
        let mut block = AlignedBlock::from_bytes(data);
        block_initialize(&mut block)?;
        let view = BlockView::new(&block)?;
        let machine = SkeletonMachine::parse(&view, 0)?;
        Ok(Self { machine, depval })
    }

    pub fn skeleton_machine(&self) -> &SkeletonMachine {
        &self.machine
    }

    pub fn dependency_validation(&self) -> &DependencyValidation {
        &self.depval
    }
}

/// A raw animation curve: time markers plus packed key data.
#[derive(Debug, Clone, Default)]
pub struct AnimationCurve {
    pub time_markers: Vec<f32>,
    pub key_data: Vec<u8>,
    pub key_format: u32,
    pub elements_per_key: u32,
}

/// Parsed animation set.
#[derive(Debug, Clone, Default)]
pub struct AnimationSet {
    pub drivers: Vec<AnimationDriver>,
    pub constant_drivers: Vec<ConstantDriver>,
    pub constant_data: Vec<u8>,
    pub parameter_interface: Vec<u64>,
    pub animations: Vec<(String, AnimationDesc)>,
    pub curves: Vec<AnimationCurve>,
}

impl AnimationSet {
    pub fn parse(view: &BlockView, offset: usize) -> Result<Self, ScaffoldError> {
        let drivers = view.vec_view::<AnimationDriver>(offset)?.as_slice().to_vec();
        let constant_drivers = view
            .vec_view::<ConstantDriver>(offset + 0x10)?
            .as_slice()
            .to_vec();
        let constant_data = view.vec_view::<u8>(offset + 0x20)?.as_slice().to_vec();
        let parameter_interface = view.vec_view::<u64>(offset + 0x30)?.as_slice().to_vec();

        let anim_base = view.resolve(offset + 0x40)?;
        let anim_count = view.count_at(offset + 0x40)?;
        let mut animations = Vec::with_capacity(anim_count);
        for i in 0..anim_count {
            let entry = anim_base + i * 40;
            let name = view.string_view(entry)?.to_string();
            let desc: AnimationDesc =
                bytemuck::pod_read_unaligned(view.slice_at(entry + 16, 24)?);
            animations.push((name, desc));
        }

        let curve_base = view.resolve(offset + 0x50)?;
        let curve_count = view.count_at(offset + 0x50)?;
        let mut curves = Vec::with_capacity(curve_count);
        for i in 0..curve_count {
            let entry = curve_base + i * 40;
            curves.push(AnimationCurve {
                time_markers: view.vec_view::<f32>(entry)?.as_slice().to_vec(),
                key_data: view.vec_view::<u8>(entry + 16)?.as_slice().to_vec(),
                key_format: view.read_u32(entry + 32)?,
                elements_per_key: view.read_u32(entry + 36)?,
            });
        }

        Ok(Self {
            drivers,
            constant_drivers,
            constant_data,
            parameter_interface,
            animations,
            curves,
        })
    }

    pub fn find_animation(&self, name: &str) -> Option<&AnimationDesc> {
        self.animations
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, d)| d)
    }
}

/// Animation set scaffold loaded from a chunk container.
#[derive(Debug)]
pub struct AnimationSetScaffold {
    set: AnimationSet,
    depval: DependencyValidation,
}

impl AnimationSetScaffold {
    pub fn new(chunks: &ChunkFile, depval: DependencyValidation) -> Result<Self, ScaffoldError> {
        let data = chunks.require(CHUNK_TYPE_ANIMATION_SET, 1)?;
        let mut block = AlignedBlock::from_bytes(data);
        block_initialize(&mut block)?;
        let view = BlockView::new(&block)?;
        let set = AnimationSet::parse(&view, 0)?;
        Ok(Self { set, depval })
    }

    pub fn animation_set(&self) -> &AnimationSet {
        &self.set
    }

    pub fn dependency_validation(&self) -> &DependencyValidation {
        &self.depval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skeleton_binding_maps_joints() {
        let machine_outputs = [10u64, 20, 30];
        let stream_inputs = [30u64, 10, 99];
        let binding = SkeletonBinding::new(&machine_outputs, &stream_inputs);
        assert_eq!(binding.model_joint_count(), 3);
        assert_eq!(binding.model_joint_to_machine_output(0), 2);
        assert_eq!(binding.model_joint_to_machine_output(1), 0);
        assert_eq!(binding.model_joint_to_machine_output(2), u32::MAX);
        assert_eq!(binding.model_joint_to_machine_output(5), u32::MAX);
    }
}
