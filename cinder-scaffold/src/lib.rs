//! Scaffold command streams, artifact containers and readers.
//!
//! A *scaffold* is a compiled asset in relocatable binary form: a
//! [`cinder_block`] memory block whose primary region is a linear command
//! stream of `(tag, size, payload)` records, plus a separate flat
//! large-resource stream for bulk vertex/index data. This crate owns the
//! tag namespaces and record layouts, the chunked artifact container the
//! scaffolds are stored in, and the read-side types:
//! [`ModelScaffold`], [`MaterialScaffold`], [`SkeletonScaffold`],
//! [`AnimationSetScaffold`] and [`RendererConstruction`].
//!
//! Scaffolds are immutable once constructed and may be read from many
//! threads in parallel.

pub mod chunks;
pub mod cmd;
pub mod compile;
pub mod construction;
pub mod depval;
pub mod hash;
pub mod material_scaffold;
pub mod model_scaffold;
pub mod params;
pub mod skeleton;
pub mod transform;
pub mod types;

pub use chunks::{ChunkFile, ChunkHeader, ChunkReopen, SerializedArtifact};
pub use cmd::{
    CmdWriter, GeoCommand, MaterialCommand, ModelCommand, ScaffoldCmd, ScaffoldCmdIterator,
    ScaffoldCommand,
};
pub use compile::{
    AssetState, CompileError, CompileOperation, CompilerDesc, SerializedTarget, TargetDesc,
};
pub use construction::{
    AssetMarker, ConstructionElement, PollResult, RendererConstruction, ScaffoldResolver,
    ScaffoldSource,
};
pub use depval::DependencyValidation;
pub use hash::{guid_or_number, hash64, hash_combine};
pub use material_scaffold::{MaterialScaffold, MaterialScaffoldMaterial};
pub use model_scaffold::{CMD_STREAM_GUID_DEFAULT, ModelDefaultPoseData, ModelScaffold};
pub use params::{ParamBox, ParamValue};
pub use skeleton::{
    AnimationSet, AnimationSetScaffold, SkeletonBinding, SkeletonMachine, SkeletonScaffold,
};
pub use transform::{
    TransformCommand, TransformOptimizer, TransformParams, generate_output_transforms,
};
pub use types::{
    DrawCallDesc, IndexFormat, LargeBlockRef, RenderStateSet, SamplerDesc, Topology,
    VertexElement, VertexFormat,
};

/// Errors raised while reading scaffolds and artifact containers.
#[derive(Debug, thiserror::Error)]
pub enum ScaffoldError {
    #[error(transparent)]
    Block(#[from] cinder_block::BlockError),
    #[error("command record truncated at offset {0}")]
    TruncatedRecord(usize),
    #[error("artifact container: {0}")]
    Container(String),
    #[error("required chunk {type_code:#018x} (version {version}) not found")]
    MissingChunk { type_code: u64, version: u32 },
    #[error("missing element: {0}")]
    MissingElement(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
