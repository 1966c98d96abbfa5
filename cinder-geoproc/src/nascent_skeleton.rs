//! Nascent skeleton: the write side of the transformation machine.
//!
//! A source node hierarchy arrives as push/pop scoped writes; the
//! machine flattens it into the linear u32 command stream the runtime
//! interprets. Output markers form a dense zero-based index space in
//! registration order.

use glam::{Mat4, Quat, Vec3};

use cinder_block::{BlockSerializer, SpecialBuffer};
use cinder_scaffold::hash::{hash64, hash_combine};
use cinder_scaffold::transform::{
    TransformCommand, TransformOptimizer, TransformParams, generate_output_transforms,
    optimize_transformation_machine, remap_output_matrices, trace_transformation_machine,
};

use crate::GeoProcError;
use crate::config::SkeletonRules;
use crate::nascent_model::NascentModel;

/// A decomposed or full transform to write into the machine.
#[derive(Debug, Clone, Default)]
pub struct Transform {
    pub full_transform: Option<Mat4>,
    pub translation: Option<Vec3>,
    pub rotation: Option<Quat>,
    pub arbitrary_scale: Option<Vec3>,
    pub uniform_scale: Option<f32>,
}

impl Transform {
    pub fn matrix(matrix: Mat4) -> Self {
        Self {
            full_transform: Some(matrix),
            ..Default::default()
        }
    }

    pub fn decomposed(translation: Vec3, rotation: Quat, scale: f32) -> Self {
        Self {
            translation: Some(translation),
            rotation: Some(rotation),
            uniform_scale: Some(scale),
            ..Default::default()
        }
    }
}

/// The linearised transformation machine under construction.
#[derive(Debug, Clone, Default)]
pub struct NascentSkeletonMachine {
    commands: Vec<u32>,
    /// `(skeleton name, joint name)` per output marker, dense order.
    output_interface: Vec<(String, String)>,
    /// Parameter names, dense order.
    parameter_interface: Vec<String>,
    pending_pops: u32,
}

impl NascentSkeletonMachine {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn commands(&self) -> &[u32] {
        &self.commands
    }

    pub fn output_interface(&self) -> &[(String, String)] {
        &self.output_interface
    }

    pub fn parameter_interface(&self) -> &[String] {
        &self.parameter_interface
    }

    pub fn output_matrix_count(&self) -> usize {
        self.output_interface.len()
    }

    fn resolve_pending_pops(&mut self) {
        if self.pending_pops > 0 {
            self.commands.push(TransformCommand::PopLocalToModel as u32);
            self.commands.push(self.pending_pops);
            self.pending_pops = 0;
        }
    }

    pub fn write_push_local_to_model(&mut self) {
        self.resolve_pending_pops();
        self.commands.push(TransformCommand::PushLocalToModel as u32);
    }

    /// Pops coalesce: consecutive pops merge into a single command.
    pub fn write_pop_local_to_model(&mut self, pop_count: u32) {
        self.pending_pops += pop_count;
    }

    /// Registers a `(skeleton, joint)` tag, reusing an existing marker for
    /// a repeated registration. Markers are dense and zero-based.
    pub fn try_register_joint_name(&mut self, skeleton: &str, joint: &str) -> u32 {
        let key = (skeleton.to_string(), joint.to_string());
        if let Some(existing) = self.output_interface.iter().position(|e| *e == key) {
            return existing as u32;
        }
        self.output_interface.push(key);
        (self.output_interface.len() - 1) as u32
    }

    pub fn write_output_marker(&mut self, skeleton: &str, joint: &str) -> u32 {
        let marker = self.try_register_joint_name(skeleton, joint);
        self.resolve_pending_pops();
        self.commands.push(TransformCommand::WriteOutputMatrix as u32);
        self.commands.push(marker);
        marker
    }

    pub fn write_static_transform(&mut self, transform: &Transform) {
        self.resolve_pending_pops();
        if let Some(full) = transform.full_transform {
            self.commands.push(TransformCommand::TransformStatic as u32);
            self.push_f32s(&full.to_cols_array());
            return;
        }
        if let Some(translation) = transform.translation {
            self.commands.push(TransformCommand::TranslateStatic as u32);
            self.push_f32s(&translation.to_array());
        }
        if let Some(rotation) = transform.rotation {
            self.commands
                .push(TransformCommand::RotateQuaternionStatic as u32);
            self.push_f32s(&rotation.to_array());
        }
        if let Some(scale) = transform.uniform_scale {
            self.commands.push(TransformCommand::UniformScaleStatic as u32);
            self.push_f32s(&[scale]);
        }
        if let Some(scale) = transform.arbitrary_scale {
            self.commands
                .push(TransformCommand::ArbitraryScaleStatic as u32);
            self.push_f32s(&scale.to_array());
        }
    }

    /// Writes a parameterised transform; the supplied transform values
    /// double as the inline defaults used when the parameter is absent at
    /// evaluation time.
    pub fn write_parameterized_transform(&mut self, parameter: &str, transform: &Transform) {
        self.resolve_pending_pops();
        let index = self.register_parameter(parameter);
        if let Some(full) = transform.full_transform {
            self.commands
                .push(TransformCommand::TransformParameter as u32);
            self.commands.push(index);
            self.push_f32s(&full.to_cols_array());
            return;
        }
        if let Some(translation) = transform.translation {
            self.commands
                .push(TransformCommand::TranslateParameter as u32);
            self.commands.push(index);
            self.push_f32s(&translation.to_array());
        }
        if let Some(rotation) = transform.rotation {
            self.commands
                .push(TransformCommand::RotateQuaternionParameter as u32);
            self.commands.push(index);
            self.push_f32s(&rotation.to_array());
        }
        if let Some(scale) = transform.uniform_scale {
            self.commands
                .push(TransformCommand::UniformScaleParameter as u32);
            self.commands.push(index);
            self.push_f32s(&[scale]);
        }
        if let Some(scale) = transform.arbitrary_scale {
            self.commands
                .push(TransformCommand::ArbitraryScaleParameter as u32);
            self.commands.push(index);
            self.push_f32s(&scale.to_array());
        }
    }

    fn register_parameter(&mut self, name: &str) -> u32 {
        if let Some(existing) = self.parameter_interface.iter().position(|p| p == name) {
            return existing as u32;
        }
        self.parameter_interface.push(name.to_string());
        (self.parameter_interface.len() - 1) as u32
    }

    fn push_f32s(&mut self, values: &[f32]) {
        self.commands.extend(values.iter().map(|v| v.to_bits()));
    }

    pub fn generate_output_transforms(&self) -> Vec<Mat4> {
        generate_output_transforms(
            &self.commands,
            self.output_matrix_count(),
            &TransformParams::new(),
        )
    }

    /// Hashed `(skeleton, joint)` pairs in marker order.
    pub fn build_hashed_output_interface(&self) -> Vec<u64> {
        self.output_interface
            .iter()
            .map(|(skeleton, joint)| hash_combine(hash64(skeleton), hash64(joint)))
            .collect()
    }

    pub fn build_hashed_parameter_interface(&self) -> Vec<u64> {
        self.parameter_interface.iter().map(|p| hash64(p)).collect()
    }

    /// Keeps only outputs present in `filter_in`, remapping surviving
    /// markers into a dense zero-based space.
    pub fn filter_output_interface(&mut self, filter_in: &[(String, String)]) {
        let mut new_interface: Vec<(String, String)> = Vec::new();
        let mut mapping = vec![u32::MAX; self.output_interface.len()];
        for (old_index, entry) in self.output_interface.iter().enumerate() {
            if let Some(existing) = new_interface.iter().position(|e| e == entry) {
                mapping[old_index] = existing as u32;
            } else if filter_in.contains(entry) {
                mapping[old_index] = new_interface.len() as u32;
                new_interface.push(entry.clone());
            }
        }
        self.commands = remap_output_matrices(&self.commands, &mapping);
        self.output_interface = new_interface;
    }

    /// Keeps only parameters whose name hash appears in `preserve`.
    /// Dropped parameters fall back to their inline defaults, so the
    /// commands themselves are untouched.
    pub fn filter_parameter_interface(&mut self, preserve: &[u64]) {
        self.parameter_interface
            .retain(|name| preserve.contains(&hash64(name)));
    }

    pub fn optimize(&mut self, optimizer: &mut dyn TransformOptimizer) {
        self.commands = optimize_transformation_machine(
            &self.commands,
            self.output_matrix_count(),
            optimizer,
        );
    }

    /// Human-readable trace of the machine.
    pub fn trace(&self) -> String {
        let mut out = String::new();
        let outputs = self.output_interface.clone();
        let params = self.parameter_interface.clone();
        trace_transformation_machine(
            &mut out,
            &self.commands,
            &move |marker| {
                outputs
                    .get(marker as usize)
                    .map(|(s, j)| {
                        if s.is_empty() {
                            j.clone()
                        } else {
                            format!("{s}:{j}")
                        }
                    })
                    .unwrap_or_else(|| "<unknown>".to_string())
            },
            &move |param| {
                params
                    .get(param as usize)
                    .cloned()
                    .unwrap_or_else(|| "<unknown>".to_string())
            },
        );
        out
    }
}

/// A skeleton: the transformation machine plus the dehash table mapping
/// hashed joint names back to strings.
#[derive(Debug, Clone, Default)]
pub struct NascentSkeleton {
    machine: NascentSkeletonMachine,
    dehash_table: Vec<(u64, String)>,
}

impl NascentSkeleton {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn skeleton_machine(&self) -> &NascentSkeletonMachine {
        &self.machine
    }

    pub fn skeleton_machine_mut(&mut self) -> &mut NascentSkeletonMachine {
        &mut self.machine
    }

    pub fn write_push_local_to_model(&mut self) {
        self.machine.write_push_local_to_model();
    }

    pub fn write_pop_local_to_model(&mut self, pop_count: u32) {
        self.machine.write_pop_local_to_model(pop_count);
    }

    pub fn write_static_transform(&mut self, transform: &Transform) {
        self.machine.write_static_transform(transform);
    }

    pub fn write_parameterized_transform(&mut self, parameter: &str, transform: &Transform) {
        self.register_dehash(parameter);
        self.machine.write_parameterized_transform(parameter, transform);
    }

    pub fn write_output_marker(&mut self, skeleton: &str, joint: &str) -> u32 {
        self.register_dehash(joint);
        if !skeleton.is_empty() {
            self.register_dehash(skeleton);
        }
        self.machine.write_output_marker(skeleton, joint)
    }

    fn register_dehash(&mut self, name: &str) {
        let hash = hash64(name);
        if !self.dehash_table.iter().any(|(h, _)| *h == hash) {
            self.dehash_table.push((hash, name.to_string()));
        }
    }

    pub fn dehash_table(&self) -> &[(u64, String)] {
        &self.dehash_table
    }

    /// Serialises the skeleton block:
    /// commands, hashed outputs, hashed parameters, output count, dehash.
    pub fn serialize(&self, serializer: &mut BlockSerializer) {
        serializer.serialize_sub_block(self.machine.commands(), SpecialBuffer::Vector);
        serializer.serialize_sub_block(
            &self.machine.build_hashed_output_interface(),
            SpecialBuffer::Vector,
        );
        serializer.serialize_sub_block(
            &self.machine.build_hashed_parameter_interface(),
            SpecialBuffer::Vector,
        );
        serializer.serialize_u64(self.machine.output_matrix_count() as u64);
        let mut entries: Vec<(u64, String)> = self.dehash_table.clone();
        entries.sort_by_key(|(h, _)| *h);
        serializer.serialize_items(&entries, SpecialBuffer::Vector);
    }
}

/// Bakes static transforms into geometry where the model structure
/// allows it: the marker must be attached to at least one command, none
/// of them skinned, and the attached geometry must not also appear at a
/// different binding point.
pub struct ModelTransformOptimizer {
    can_bake: Vec<bool>,
    baked: Vec<Mat4>,
}

impl ModelTransformOptimizer {
    pub fn new(
        model: &NascentModel,
        binding_name_interface: &[(String, String)],
        allow_transform_bake: bool,
    ) -> Self {
        let count = binding_name_interface.len();
        let mut can_bake = vec![false; count];
        if allow_transform_bake {
            for (index, (skeleton, joint)) in binding_name_interface.iter().enumerate() {
                if !skeleton.is_empty() {
                    continue;
                }
                let mut at_least_one_attached = false;
                let mut skin_attached = false;
                let mut doubly_attached = false;
                for (_, command) in model.commands() {
                    if command.local_to_model != *joint {
                        continue;
                    }
                    at_least_one_attached = true;
                    skin_attached |= !command.skin_controller_blocks.is_empty();
                    for (_, other) in model.commands() {
                        doubly_attached |= other.geometry_block == command.geometry_block
                            && other.local_to_model != command.local_to_model;
                    }
                }
                can_bake[index] = at_least_one_attached && !skin_attached && !doubly_attached;
            }
        }
        Self {
            can_bake,
            baked: vec![Mat4::IDENTITY; count],
        }
    }

    pub fn baked_transforms(&self) -> &[Mat4] {
        &self.baked
    }
}

impl TransformOptimizer for ModelTransformOptimizer {
    fn can_bake_into_output_matrix(&self, output_matrix: u32) -> bool {
        self.can_bake
            .get(output_matrix as usize)
            .copied()
            .unwrap_or(false)
    }

    fn bake_into_output_matrix(&mut self, output_matrix: u32, transform: Mat4) {
        self.baked[output_matrix as usize] =
            self.baked[output_matrix as usize] * transform;
    }
}

/// Filters the skeleton down to what the model references and optionally
/// bakes static transforms into the attached geometry.
pub fn optimize_skeleton(
    skeleton: &mut NascentSkeleton,
    model: &mut NascentModel,
    rules: &SkeletonRules,
) -> Result<(), GeoProcError> {
    if !rules.preserve_all_outputs.unwrap_or(false) {
        let mut filter: Vec<(String, String)> = model.build_skeleton_interface();
        filter.insert(0, (String::new(), "identity".to_string()));
        for (_, command) in model.commands() {
            let entry = (String::new(), command.local_to_model.clone());
            if !filter.contains(&entry) {
                filter.push(entry);
            }
        }
        for &preserved in &rules.preserve_outputs {
            if let Some(name) = skeleton
                .dehash_table()
                .iter()
                .find(|(h, _)| *h == preserved)
                .map(|(_, n)| n.clone())
            {
                filter.push((String::new(), name));
            }
        }
        skeleton
            .skeleton_machine_mut()
            .filter_output_interface(&filter);
    }

    if !rules.preserve_all_parameters.unwrap_or(false) {
        skeleton
            .skeleton_machine_mut()
            .filter_parameter_interface(&rules.preserve_parameters);
    }

    if rules.optimize.unwrap_or(true) {
        let interface = skeleton.skeleton_machine().output_interface().to_vec();
        let mut optimizer = ModelTransformOptimizer::new(
            model,
            &interface,
            rules.bake_static_transforms.unwrap_or(true),
        );
        skeleton.skeleton_machine_mut().optimize(&mut optimizer);

        let tolerance = 1e-3;
        for (index, (skeleton_name, joint)) in interface.iter().enumerate() {
            let baked = optimizer.baked_transforms()[index];
            if !mat4_equivalent(baked, Mat4::IDENTITY, tolerance) {
                if !skeleton_name.is_empty() {
                    return Err(GeoProcError::InvalidData(
                        "static bake attempted on a named-skeleton output".into(),
                    ));
                }
                model.apply_transform(joint, baked);
            }
        }
    }
    Ok(())
}

fn mat4_equivalent(a: Mat4, b: Mat4, tolerance: f32) -> bool {
    a.to_cols_array()
        .iter()
        .zip(b.to_cols_array().iter())
        .all(|(x, y)| (x - y).abs() <= tolerance)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_markers_are_dense_and_reused() {
        let mut machine = NascentSkeletonMachine::new();
        assert_eq!(machine.write_output_marker("", "root"), 0);
        assert_eq!(machine.write_output_marker("", "arm"), 1);
        assert_eq!(machine.write_output_marker("", "root"), 0);
        assert_eq!(machine.output_matrix_count(), 2);
    }

    #[test]
    fn test_pending_pops_coalesce() {
        let mut machine = NascentSkeletonMachine::new();
        machine.write_push_local_to_model();
        machine.write_push_local_to_model();
        machine.write_pop_local_to_model(1);
        machine.write_pop_local_to_model(1);
        machine.write_output_marker("", "root");

        // two pops merged into one command
        let pops: Vec<usize> = machine
            .commands()
            .iter()
            .enumerate()
            .filter(|&(_, &c)| c == TransformCommand::PopLocalToModel as u32)
            .map(|(i, _)| i)
            .collect();
        assert_eq!(pops.len(), 1);
        assert_eq!(machine.commands()[pops[0] + 1], 2);
    }

    #[test]
    fn test_static_transform_round_trips_through_machine() {
        let mut machine = NascentSkeletonMachine::new();
        machine.write_push_local_to_model();
        machine.write_static_transform(&Transform::decomposed(
            Vec3::new(1.0, 2.0, 3.0),
            Quat::IDENTITY,
            2.0,
        ));
        machine.write_output_marker("", "node");
        machine.write_pop_local_to_model(1);

        let outputs = machine.generate_output_transforms();
        assert_eq!(outputs.len(), 1);
        let transformed = outputs[0].transform_point3(Vec3::ZERO);
        assert!((transformed - Vec3::new(1.0, 2.0, 3.0)).length() < 1e-6);
        let scaled = outputs[0].transform_vector3(Vec3::X);
        assert!((scaled - Vec3::new(2.0, 0.0, 0.0)).length() < 1e-6);
    }

    #[test]
    fn test_filter_output_interface_remaps_dense() {
        let mut machine = NascentSkeletonMachine::new();
        machine.write_output_marker("", "a");
        machine.write_output_marker("", "b");
        machine.write_output_marker("", "c");
        machine.filter_output_interface(&[
            (String::new(), "a".to_string()),
            (String::new(), "c".to_string()),
        ]);
        assert_eq!(machine.output_matrix_count(), 2);
        assert_eq!(
            machine.output_interface(),
            &[
                (String::new(), "a".to_string()),
                (String::new(), "c".to_string())
            ]
        );
        // surviving write commands carry remapped dense markers
        let outputs = machine.generate_output_transforms();
        assert_eq!(outputs.len(), 2);
    }

    #[test]
    fn test_parameterized_transform_registers_parameter() {
        let mut machine = NascentSkeletonMachine::new();
        machine.write_parameterized_transform(
            "spin",
            &Transform {
                rotation: Some(Quat::IDENTITY),
                ..Default::default()
            },
        );
        machine.write_output_marker("", "node");
        assert_eq!(machine.parameter_interface(), &["spin".to_string()]);
        assert_eq!(machine.build_hashed_parameter_interface(), vec![hash64("spin")]);
    }
}
