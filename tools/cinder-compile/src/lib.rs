//! cinder-compile - Cinder asset compiler
//!
//! Converts authored model sources (glTF/GLB plus sidecar material and
//! rule files) into scaffold artifacts: the relocatable model scaffold,
//! its large-resource stream, resolved material scaffolds, a standalone
//! skeleton scaffold and an animation set.

pub mod config;
pub mod gltf_import;
pub mod material;
pub mod operation;

pub use config::{ImportConfiguration, load_model_rules};
pub use material::{RawMaterialDocument, ResolvedMaterial, resolve_materials};
pub use operation::{ModelCompileOperation, compiler_desc};
