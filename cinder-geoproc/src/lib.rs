//! Geometry processing for the Cinder asset pipeline.
//!
//! This crate holds the intermediate ("nascent") representation produced
//! by source-format front ends, the normalisation and optimisation passes
//! applied to it, and the writer that emits the final model scaffold:
//!
//! - [`NascentModel`] - geometry blocks, skin controllers and commands
//! - [`MeshDatabase`] - attribute streams with per-stream remap tables
//! - [`NascentSkeleton`] - the transformation machine in stack form
//! - [`NascentAnimationSet`] - drivers, curves and named animations
//! - [`serialize_to_chunks`] - scaffold + large-block + metrics emission

pub mod animation;
pub mod config;
pub mod geometry_algorithm;
pub mod mesh_database;
pub mod nascent_model;
pub mod nascent_skeleton;
pub mod serialize;
pub mod skin;

pub use animation::{NascentAnimationSet, RawAnimationCurve, curve_format};
pub use config::{ModelCompilationConfiguration, RawGeoRules, SkeletonRules, adjacency_stream_guid};
pub use mesh_database::{MeshDatabase, NativeVbLayout, NativeVbSettings, VertexStream};
pub use nascent_model::{
    Command, GeometryBlock, NascentModel, NascentObjectGuid, NascentRawGeometry,
    SkinControllerBlock, complete_instantiation,
};
pub use nascent_skeleton::{
    ModelTransformOptimizer, NascentSkeleton, NascentSkeletonMachine, Transform,
    optimize_skeleton,
};
pub use serialize::serialize_to_chunks;
pub use skin::{
    ControllerAndJointMatrices, NascentBoundSkinnedGeometry, UnboundSkinController,
    bind_controller,
};

/// Errors raised while processing nascent objects.
#[derive(Debug, thiserror::Error)]
pub enum GeoProcError {
    /// A required element of the source document was not found. Fatal for
    /// the current target.
    #[error("missing element: {0}")]
    MissingElement(String),
    /// A legitimate "nothing to do" outcome.
    #[error("empty result: {0}")]
    EmptyResult(String),
    /// The nascent data violates an invariant.
    #[error("invalid data: {0}")]
    InvalidData(String),
    /// Identifier collision while registering a nascent object.
    #[error("id already in use: {0:?}")]
    DuplicateId(nascent_model::NascentObjectGuid),
}
