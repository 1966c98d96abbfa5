//! Compile-operation surface.
//!
//! A compile plugin exposes a [`CompileOperation`]: it reports the target
//! codes it can materialise for one source asset and serializes each
//! target into a list of artifacts. The [`CompilerDesc`] carries the
//! registration data a host uses to route source files to compilers.

use crate::chunks::SerializedArtifact;
use crate::depval::DependencyValidation;
use crate::hash::hash64_const;

/// Target code: compiled model scaffold + large blocks.
pub const TARGET_MODEL: u64 = hash64_const(b"Model");
/// Target code: resolved material scaffold.
pub const TARGET_RAW_MAT: u64 = hash64_const(b"RawMat");
/// Target code: standalone skeleton scaffold.
pub const TARGET_SKELETON: u64 = hash64_const(b"Skeleton");
/// Target code: animation set scaffold.
pub const TARGET_ANIMATION_SET: u64 = hash64_const(b"AnimationSet");

/// Readiness state of a compiled asset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AssetState {
    Pending,
    Ready,
    Invalid,
}

/// One target a compile operation can produce.
#[derive(Debug, Clone)]
pub struct TargetDesc {
    pub target_code: u64,
    pub name: &'static str,
}

/// The artifacts of one serialized target, with the dependency validation
/// they were produced under.
#[derive(Debug, Clone)]
pub struct SerializedTarget {
    pub artifacts: Vec<SerializedArtifact>,
    pub depval: DependencyValidation,
}

/// A compile operation over one source asset.
///
/// Implementations materialise artifacts per target; a failure in one
/// target must not prevent other targets of the same operation from
/// succeeding.
pub trait CompileOperation {
    fn targets(&self) -> Vec<TargetDesc>;
    fn serialize_target(&mut self, idx: usize) -> Result<SerializedTarget, CompileError>;
    fn dependency_validation(&self) -> DependencyValidation;
}

/// Registration data for a compile plugin.
#[derive(Debug, Clone)]
pub struct CompilerDesc {
    pub description: String,
    /// Hashes of the source file kinds this compiler recognises.
    pub file_kinds: Vec<u64>,
    /// Extension glob, e.g. `*.gltf`.
    pub extension_glob: String,
    pub short_name: String,
}

/// Failure of a compile operation.
#[derive(Debug, thiserror::Error)]
pub enum CompileError {
    /// A required record was not found in the source document. Fatal for
    /// the current target; other targets may still succeed.
    #[error("missing element: {0}")]
    MissingElement(String),
    /// Legitimate "nothing to do"; surfaced without stopping the compile.
    #[error("empty result: {0}")]
    EmptyResult(String),
    /// Wraps a downstream error together with the dependency validation of
    /// the failed build, so caches do not poison dependent compiles.
    #[error("construction error: {message}")]
    Construction {
        message: String,
        depval: DependencyValidation,
    },
}

impl CompileError {
    pub fn construction(message: impl Into<String>, depval: DependencyValidation) -> Self {
        CompileError::Construction {
            message: message.into(),
            depval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_target_codes_distinct() {
        let codes = [TARGET_MODEL, TARGET_RAW_MAT, TARGET_SKELETON, TARGET_ANIMATION_SET];
        for (i, a) in codes.iter().enumerate() {
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }
}
