//! Transformation machine: command set and interpreter.
//!
//! A skeleton is stored as a linear u32 command stream with push/pop
//! operations; running the machine produces one local-to-model matrix per
//! output marker. Parameterised commands read their value from an
//! animation parameter set, falling back to an inline default when the
//! parameter is absent.

use glam::{Mat4, Quat, Vec3};
use hashbrown::HashMap;

/// Transformation machine command tags (0x500 namespace).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransformCommand {
    /// No payload.
    PushLocalToModel = 0x500,
    /// `{ u32 pop_count }`
    PopLocalToModel,
    /// `[f32; 16]` column-major
    TransformStatic,
    /// `[f32; 3]`
    TranslateStatic,
    /// `{ f32 radians }`
    RotateXStatic,
    RotateYStatic,
    RotateZStatic,
    /// `[f32; 4]` axis + radians
    RotateAxisAngleStatic,
    /// `[f32; 4]` quaternion x y z w
    RotateQuaternionStatic,
    /// `{ f32 }`
    UniformScaleStatic,
    /// `[f32; 3]`
    ArbitraryScaleStatic,
    /// `{ u32 param } + [f32; 16]` default
    TransformParameter,
    /// `{ u32 param } + [f32; 3]` default
    TranslateParameter,
    /// `{ u32 param } + f32` default
    RotateXParameter,
    RotateYParameter,
    RotateZParameter,
    /// `{ u32 param } + [f32; 4]` default
    RotateAxisAngleParameter,
    RotateQuaternionParameter,
    /// `{ u32 param } + f32` default
    UniformScaleParameter,
    /// `{ u32 param } + [f32; 3]` default
    ArbitraryScaleParameter,
    /// `{ u32 output_marker }`
    WriteOutputMatrix,
    /// `{ u32 word_count } + words` - skipped by the interpreter
    Comment,
}

impl TransformCommand {
    pub fn from_u32(value: u32) -> Option<Self> {
        if !(0x500..=TransformCommand::Comment as u32).contains(&value) {
            return None;
        }
        // values are contiguous from PushLocalToModel
        Some(unsafe { std::mem::transmute::<u32, TransformCommand>(value) })
    }
}

/// Payload word count for a command, excluding the tag itself.
///
/// `Comment` is variable length; its first payload word is the count of
/// words that follow.
pub fn payload_word_count(cmd: TransformCommand, stream: &[u32]) -> usize {
    match cmd {
        TransformCommand::PushLocalToModel => 0,
        TransformCommand::PopLocalToModel => 1,
        TransformCommand::TransformStatic => 16,
        TransformCommand::TranslateStatic => 3,
        TransformCommand::RotateXStatic
        | TransformCommand::RotateYStatic
        | TransformCommand::RotateZStatic
        | TransformCommand::UniformScaleStatic => 1,
        TransformCommand::RotateAxisAngleStatic | TransformCommand::RotateQuaternionStatic => 4,
        TransformCommand::ArbitraryScaleStatic => 3,
        TransformCommand::TransformParameter => 17,
        TransformCommand::TranslateParameter | TransformCommand::ArbitraryScaleParameter => 4,
        TransformCommand::RotateXParameter
        | TransformCommand::RotateYParameter
        | TransformCommand::RotateZParameter
        | TransformCommand::UniformScaleParameter => 2,
        TransformCommand::RotateAxisAngleParameter
        | TransformCommand::RotateQuaternionParameter => 5,
        TransformCommand::WriteOutputMatrix => 1,
        TransformCommand::Comment => 1 + stream.first().copied().unwrap_or(0) as usize,
    }
}

/// Value supplied for a parameterised transform command.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TransformParamValue {
    Float(f32),
    Float3([f32; 3]),
    Float4([f32; 4]),
    Matrix([f32; 16]),
}

/// Animation parameter set handed to the interpreter.
#[derive(Debug, Clone, Default)]
pub struct TransformParams {
    values: HashMap<u32, TransformParamValue>,
}

impl TransformParams {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, parameter: u32, value: TransformParamValue) {
        self.values.insert(parameter, value);
    }

    pub fn get(&self, parameter: u32) -> Option<TransformParamValue> {
        self.values.get(&parameter).copied()
    }
}

fn f32_at(stream: &[u32], idx: usize) -> f32 {
    f32::from_bits(stream[idx])
}

fn mat4_at(stream: &[u32]) -> Mat4 {
    let mut cols = [0.0f32; 16];
    for (i, c) in cols.iter_mut().enumerate() {
        *c = f32_at(stream, i);
    }
    Mat4::from_cols_array(&cols)
}

/// Runs the machine, producing one matrix per output marker.
///
/// `output_count` sizes the result; markers never written stay identity.
pub fn generate_output_transforms(
    stream: &[u32],
    output_count: usize,
    params: &TransformParams,
) -> Vec<Mat4> {
    let mut result = vec![Mat4::IDENTITY; output_count];
    let mut stack: Vec<Mat4> = Vec::new();
    let mut current = Mat4::IDENTITY;

    let mut cursor = 0usize;
    while cursor < stream.len() {
        let Some(cmd) = TransformCommand::from_u32(stream[cursor]) else {
            tracing::warn!(tag = stream[cursor], "unknown transformation command, stopping");
            break;
        };
        cursor += 1;
        let payload = &stream[cursor..];
        let advance = payload_word_count(cmd, payload);

        match cmd {
            TransformCommand::PushLocalToModel => stack.push(current),
            TransformCommand::PopLocalToModel => {
                for _ in 0..payload[0] {
                    current = stack.pop().unwrap_or(Mat4::IDENTITY);
                }
            }
            TransformCommand::TransformStatic => current *= mat4_at(payload),
            TransformCommand::TranslateStatic => {
                current *= Mat4::from_translation(Vec3::new(
                    f32_at(payload, 0),
                    f32_at(payload, 1),
                    f32_at(payload, 2),
                ));
            }
            TransformCommand::RotateXStatic => {
                current *= Mat4::from_rotation_x(f32_at(payload, 0));
            }
            TransformCommand::RotateYStatic => {
                current *= Mat4::from_rotation_y(f32_at(payload, 0));
            }
            TransformCommand::RotateZStatic => {
                current *= Mat4::from_rotation_z(f32_at(payload, 0));
            }
            TransformCommand::RotateAxisAngleStatic => {
                let axis = Vec3::new(f32_at(payload, 0), f32_at(payload, 1), f32_at(payload, 2));
                current *= Mat4::from_axis_angle(axis.normalize_or_zero(), f32_at(payload, 3));
            }
            TransformCommand::RotateQuaternionStatic => {
                current *= Mat4::from_quat(Quat::from_xyzw(
                    f32_at(payload, 0),
                    f32_at(payload, 1),
                    f32_at(payload, 2),
                    f32_at(payload, 3),
                ));
            }
            TransformCommand::UniformScaleStatic => {
                current *= Mat4::from_scale(Vec3::splat(f32_at(payload, 0)));
            }
            TransformCommand::ArbitraryScaleStatic => {
                current *= Mat4::from_scale(Vec3::new(
                    f32_at(payload, 0),
                    f32_at(payload, 1),
                    f32_at(payload, 2),
                ));
            }
            TransformCommand::TransformParameter => {
                let m = match params.get(payload[0]) {
                    Some(TransformParamValue::Matrix(m)) => Mat4::from_cols_array(&m),
                    _ => mat4_at(&payload[1..]),
                };
                current *= m;
            }
            TransformCommand::TranslateParameter => {
                let v = match params.get(payload[0]) {
                    Some(TransformParamValue::Float3(v)) => v,
                    _ => [f32_at(payload, 1), f32_at(payload, 2), f32_at(payload, 3)],
                };
                current *= Mat4::from_translation(Vec3::from_array(v));
            }
            TransformCommand::RotateXParameter
            | TransformCommand::RotateYParameter
            | TransformCommand::RotateZParameter => {
                let angle = match params.get(payload[0]) {
                    Some(TransformParamValue::Float(v)) => v,
                    _ => f32_at(payload, 1),
                };
                current *= match cmd {
                    TransformCommand::RotateXParameter => Mat4::from_rotation_x(angle),
                    TransformCommand::RotateYParameter => Mat4::from_rotation_y(angle),
                    _ => Mat4::from_rotation_z(angle),
                };
            }
            TransformCommand::RotateAxisAngleParameter => {
                let v = match params.get(payload[0]) {
                    Some(TransformParamValue::Float4(v)) => v,
                    _ => [
                        f32_at(payload, 1),
                        f32_at(payload, 2),
                        f32_at(payload, 3),
                        f32_at(payload, 4),
                    ],
                };
                let axis = Vec3::new(v[0], v[1], v[2]);
                current *= Mat4::from_axis_angle(axis.normalize_or_zero(), v[3]);
            }
            TransformCommand::RotateQuaternionParameter => {
                let v = match params.get(payload[0]) {
                    Some(TransformParamValue::Float4(v)) => v,
                    _ => [
                        f32_at(payload, 1),
                        f32_at(payload, 2),
                        f32_at(payload, 3),
                        f32_at(payload, 4),
                    ],
                };
                current *= Mat4::from_quat(Quat::from_xyzw(v[0], v[1], v[2], v[3]));
            }
            TransformCommand::UniformScaleParameter => {
                let s = match params.get(payload[0]) {
                    Some(TransformParamValue::Float(v)) => v,
                    _ => f32_at(payload, 1),
                };
                current *= Mat4::from_scale(Vec3::splat(s));
            }
            TransformCommand::ArbitraryScaleParameter => {
                let v = match params.get(payload[0]) {
                    Some(TransformParamValue::Float3(v)) => v,
                    _ => [f32_at(payload, 1), f32_at(payload, 2), f32_at(payload, 3)],
                };
                current *= Mat4::from_scale(Vec3::from_array(v));
            }
            TransformCommand::WriteOutputMatrix => {
                let marker = payload[0] as usize;
                if marker < result.len() {
                    result[marker] = current;
                }
            }
            TransformCommand::Comment => {}
        }
        cursor += advance;
    }
    result
}

/// Words consumed by the command at the start of `stream`, including the
/// tag, or `None` for an unknown tag.
pub fn next_transformation_command(stream: &[u32]) -> Option<usize> {
    let cmd = TransformCommand::from_u32(*stream.first()?)?;
    Some(1 + payload_word_count(cmd, &stream[1..]))
}

/// For each output marker, the immediate parent marker (`u32::MAX` for
/// roots): the last marker written in an enclosing scope at write time.
pub fn calculate_parent_pointers(stream: &[u32], output_count: usize) -> Vec<u32> {
    let mut result = vec![u32::MAX; output_count];
    let mut last_written = u32::MAX;
    let mut saved: Vec<u32> = Vec::new();

    let mut cursor = 0usize;
    while cursor < stream.len() {
        let Some(cmd) = TransformCommand::from_u32(stream[cursor]) else {
            break;
        };
        cursor += 1;
        let payload = &stream[cursor..];
        match cmd {
            TransformCommand::PushLocalToModel => saved.push(last_written),
            TransformCommand::PopLocalToModel => {
                for _ in 0..payload[0] {
                    last_written = saved.pop().unwrap_or(u32::MAX);
                }
            }
            TransformCommand::WriteOutputMatrix => {
                let marker = payload[0] as usize;
                if marker < result.len() {
                    result[marker] = last_written;
                }
                last_written = payload[0];
            }
            _ => {}
        }
        cursor += payload_word_count(cmd, payload);
    }
    result
}

/// Rewrites output markers through `mapping`; markers mapped to
/// `u32::MAX` have their write command dropped.
pub fn remap_output_matrices(stream: &[u32], mapping: &[u32]) -> Vec<u32> {
    let mut result = Vec::with_capacity(stream.len());
    let mut cursor = 0usize;
    while cursor < stream.len() {
        let Some(cmd) = TransformCommand::from_u32(stream[cursor]) else {
            result.extend_from_slice(&stream[cursor..]);
            break;
        };
        let advance = 1 + payload_word_count(cmd, &stream[cursor + 1..]);
        if cmd == TransformCommand::WriteOutputMatrix {
            let old = stream[cursor + 1] as usize;
            let new = mapping.get(old).copied().unwrap_or(u32::MAX);
            if new != u32::MAX {
                result.push(TransformCommand::WriteOutputMatrix as u32);
                result.push(new);
            }
        } else {
            result.extend_from_slice(&stream[cursor..cursor + advance]);
        }
        cursor += advance;
    }
    result
}

/// Hook deciding which output matrices a static prefix transform may be
/// baked into.
pub trait TransformOptimizer {
    fn can_bake_into_output_matrix(&self, output_matrix: u32) -> bool;
    fn bake_into_output_matrix(&mut self, output_matrix: u32, transform: Mat4);
}

/// Bakes static prefix transforms into eligible output matrices.
///
/// Only fully static machines are flattened; a machine containing any
/// parameterised command is returned unchanged (its markers animate, so
/// there is no static prefix worth folding).
pub fn optimize_transformation_machine(
    stream: &[u32],
    output_count: usize,
    optimizer: &mut dyn TransformOptimizer,
) -> Vec<u32> {
    let mut cursor = 0usize;
    while cursor < stream.len() {
        let Some(cmd) = TransformCommand::from_u32(stream[cursor]) else {
            return stream.to_vec();
        };
        if matches!(
            cmd,
            TransformCommand::TransformParameter
                | TransformCommand::TranslateParameter
                | TransformCommand::RotateXParameter
                | TransformCommand::RotateYParameter
                | TransformCommand::RotateZParameter
                | TransformCommand::RotateAxisAngleParameter
                | TransformCommand::RotateQuaternionParameter
                | TransformCommand::UniformScaleParameter
                | TransformCommand::ArbitraryScaleParameter
        ) {
            return stream.to_vec();
        }
        cursor += 1 + payload_word_count(cmd, &stream[cursor + 1..]);
    }

    let outputs = generate_output_transforms(stream, output_count, &TransformParams::new());
    let mut result = Vec::new();
    for (marker, transform) in outputs.iter().enumerate() {
        let marker = marker as u32;
        result.push(TransformCommand::PushLocalToModel as u32);
        if optimizer.can_bake_into_output_matrix(marker) {
            optimizer.bake_into_output_matrix(marker, *transform);
        } else if *transform != Mat4::IDENTITY {
            result.push(TransformCommand::TransformStatic as u32);
            for v in transform.to_cols_array() {
                result.push(v.to_bits());
            }
        }
        result.push(TransformCommand::WriteOutputMatrix as u32);
        result.push(marker);
        result.push(TransformCommand::PopLocalToModel as u32);
        result.push(1);
    }
    result
}

/// Appends a human-readable trace of the machine to `out`.
pub fn trace_transformation_machine(
    out: &mut String,
    stream: &[u32],
    output_name: &dyn Fn(u32) -> String,
    parameter_name: &dyn Fn(u32) -> String,
) {
    use std::fmt::Write;

    let mut indent = 1usize;
    let mut cursor = 0usize;
    while cursor < stream.len() {
        let Some(cmd) = TransformCommand::from_u32(stream[cursor]) else {
            let _ = writeln!(out, "Unknown command ({:#x})", stream[cursor]);
            break;
        };
        cursor += 1;
        let payload = &stream[cursor..];
        if cmd == TransformCommand::PopLocalToModel {
            indent = indent.saturating_sub(payload[0] as usize).max(1);
        }
        let pad = "  ".repeat(indent);
        match cmd {
            TransformCommand::PushLocalToModel => {
                let _ = writeln!(out, "{pad}Push");
                indent += 1;
            }
            TransformCommand::PopLocalToModel => {
                let _ = writeln!(out, "{pad}Pop ({})", payload[0]);
            }
            TransformCommand::WriteOutputMatrix => {
                let _ = writeln!(
                    out,
                    "{pad}WriteOutput [{}] {}",
                    payload[0],
                    output_name(payload[0])
                );
            }
            TransformCommand::TransformStatic => {
                let _ = writeln!(out, "{pad}Static transform");
            }
            TransformCommand::TranslateStatic => {
                let _ = writeln!(
                    out,
                    "{pad}Translate ({}, {}, {})",
                    f32_at(payload, 0),
                    f32_at(payload, 1),
                    f32_at(payload, 2)
                );
            }
            TransformCommand::TransformParameter
            | TransformCommand::TranslateParameter
            | TransformCommand::RotateXParameter
            | TransformCommand::RotateYParameter
            | TransformCommand::RotateZParameter
            | TransformCommand::RotateAxisAngleParameter
            | TransformCommand::RotateQuaternionParameter
            | TransformCommand::UniformScaleParameter
            | TransformCommand::ArbitraryScaleParameter => {
                let _ = writeln!(
                    out,
                    "{pad}{:?} param [{}] {}",
                    cmd,
                    payload[0],
                    parameter_name(payload[0])
                );
            }
            _ => {
                let _ = writeln!(out, "{pad}{cmd:?}");
            }
        }
        cursor += payload_word_count(cmd, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn push(stream: &mut Vec<u32>) {
        stream.push(TransformCommand::PushLocalToModel as u32);
    }

    fn pop(stream: &mut Vec<u32>, count: u32) {
        stream.push(TransformCommand::PopLocalToModel as u32);
        stream.push(count);
    }

    fn translate(stream: &mut Vec<u32>, v: [f32; 3]) {
        stream.push(TransformCommand::TranslateStatic as u32);
        stream.extend(v.iter().map(|f| f.to_bits()));
    }

    fn write_output(stream: &mut Vec<u32>, marker: u32) {
        stream.push(TransformCommand::WriteOutputMatrix as u32);
        stream.push(marker);
    }

    #[test]
    fn test_generate_output_transforms_nesting() {
        let mut stream = Vec::new();
        push(&mut stream);
        translate(&mut stream, [1.0, 0.0, 0.0]);
        write_output(&mut stream, 0);
        push(&mut stream);
        translate(&mut stream, [0.0, 2.0, 0.0]);
        write_output(&mut stream, 1);
        pop(&mut stream, 1);
        pop(&mut stream, 1);
        write_output(&mut stream, 2);

        let outputs = generate_output_transforms(&stream, 3, &TransformParams::new());
        assert_eq!(outputs[0].w_axis.truncate(), glam::Vec3::new(1.0, 0.0, 0.0));
        assert_eq!(outputs[1].w_axis.truncate(), glam::Vec3::new(1.0, 2.0, 0.0));
        assert_eq!(outputs[2], Mat4::IDENTITY);
    }

    #[test]
    fn test_parameter_fallback_to_default() {
        let mut stream = Vec::new();
        stream.push(TransformCommand::UniformScaleParameter as u32);
        stream.push(7); // parameter index
        stream.push(3.0f32.to_bits()); // inline default
        write_output(&mut stream, 0);

        let defaulted = generate_output_transforms(&stream, 1, &TransformParams::new());
        assert_eq!(defaulted[0].x_axis.x, 3.0);

        let mut params = TransformParams::new();
        params.set(7, TransformParamValue::Float(0.5));
        let animated = generate_output_transforms(&stream, 1, &params);
        assert_eq!(animated[0].x_axis.x, 0.5);
    }

    #[test]
    fn test_parent_pointers_follow_scopes() {
        let mut stream = Vec::new();
        write_output(&mut stream, 0); // root
        push(&mut stream);
        write_output(&mut stream, 1); // child of 0
        push(&mut stream);
        write_output(&mut stream, 2); // child of 1
        pop(&mut stream, 2);
        push(&mut stream);
        write_output(&mut stream, 3); // sibling of 1 -> child of 0
        pop(&mut stream, 1);

        let parents = calculate_parent_pointers(&stream, 4);
        assert_eq!(parents, vec![u32::MAX, 0, 1, 0]);
    }

    #[test]
    fn test_remap_drops_filtered_markers() {
        let mut stream = Vec::new();
        write_output(&mut stream, 0);
        write_output(&mut stream, 1);
        let remapped = remap_output_matrices(&stream, &[u32::MAX, 0]);
        let outputs = generate_output_transforms(&remapped, 1, &TransformParams::new());
        assert_eq!(outputs.len(), 1);
        // only one write command survives
        assert_eq!(remapped.len(), 2);
        assert_eq!(remapped[1], 0);
    }

    struct BakeAll {
        baked: Vec<Mat4>,
    }

    impl TransformOptimizer for BakeAll {
        fn can_bake_into_output_matrix(&self, _: u32) -> bool {
            true
        }
        fn bake_into_output_matrix(&mut self, output_matrix: u32, transform: Mat4) {
            self.baked[output_matrix as usize] = transform;
        }
    }

    #[test]
    fn test_optimize_bakes_static_transforms() {
        let mut stream = Vec::new();
        push(&mut stream);
        translate(&mut stream, [0.0, 5.0, 0.0]);
        write_output(&mut stream, 0);
        pop(&mut stream, 1);

        let mut optimizer = BakeAll {
            baked: vec![Mat4::IDENTITY; 1],
        };
        let optimized = optimize_transformation_machine(&stream, 1, &mut optimizer);
        assert_eq!(
            optimizer.baked[0].w_axis.truncate(),
            glam::Vec3::new(0.0, 5.0, 0.0)
        );
        let outputs = generate_output_transforms(&optimized, 1, &TransformParams::new());
        assert_eq!(outputs[0], Mat4::IDENTITY);
    }

    #[test]
    fn test_optimize_leaves_parameterised_machines_untouched() {
        let mut stream = Vec::new();
        stream.push(TransformCommand::RotateXParameter as u32);
        stream.push(0);
        stream.push(0.0f32.to_bits());
        write_output(&mut stream, 0);

        let mut optimizer = BakeAll {
            baked: vec![Mat4::IDENTITY; 1],
        };
        let optimized = optimize_transformation_machine(&stream, 1, &mut optimizer);
        assert_eq!(optimized, stream);
    }
}
