//! The model compile operation.
//!
//! One operation wraps one source document and materialises artifacts
//! per target: the model scaffold (+ large blocks + metrics), resolved
//! materials, the standalone skeleton and the animation set. A failure
//! in one target leaves the others compilable; top-level failures wrap
//! into a construction error carrying the dependency validation.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use cinder_block::BlockSerializer;
use cinder_geoproc::{
    ModelCompilationConfiguration, NascentAnimationSet, NascentModel, NascentSkeleton,
    optimize_skeleton, serialize_to_chunks,
};
use cinder_scaffold::chunks::{CHUNK_TYPE_ANIMATION_SET, CHUNK_TYPE_SKELETON, SerializedArtifact};
use cinder_scaffold::compile::{
    CompileError, CompileOperation, CompilerDesc, SerializedTarget, TARGET_ANIMATION_SET,
    TARGET_MODEL, TARGET_RAW_MAT, TARGET_SKELETON, TargetDesc,
};
use cinder_scaffold::depval::DependencyValidation;
use cinder_scaffold::hash::hash64;

use crate::config::{ImportConfiguration, load_model_rules};
use crate::gltf_import::{ImportedDocument, import_document};
use crate::material::{RawMaterialDocument, resolve_materials, serialize_material_scaffold};

/// Registration data for this compiler.
pub fn compiler_desc() -> CompilerDesc {
    CompilerDesc {
        description: "Cinder model compiler (glTF front end)".to_string(),
        file_kinds: vec![hash64("gltf"), hash64("glb")],
        extension_glob: "*.gltf;*.glb".to_string(),
        short_name: "cinder".to_string(),
    }
}

/// A compile operation over one source document.
pub struct ModelCompileOperation {
    name: String,
    model: NascentModel,
    skeleton: NascentSkeleton,
    animations: NascentAnimationSet,
    material_documents: Vec<RawMaterialDocument>,
    material_names: Vec<String>,
    skeleton_names: Vec<String>,
    config: ModelCompilationConfiguration,
    depval: DependencyValidation,
    skeleton_optimized: bool,
}

impl ModelCompileOperation {
    /// Loads the source document and its sidecars.
    pub fn create(source: &Path) -> Result<Self> {
        let name = source
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or("model")
            .to_string();

        let import_config = ImportConfiguration::load_for(source)?;
        let config = load_model_rules(source)?;
        let imported = import_document(source, &import_config)?;

        let mut material_documents = Vec::new();
        for candidate in material_sidecars(source) {
            if candidate.exists() {
                let label = candidate
                    .file_name()
                    .and_then(|s| s.to_str())
                    .unwrap_or("material")
                    .to_string();
                let text = std::fs::read_to_string(&candidate)
                    .with_context(|| format!("failed to read {}", candidate.display()))?;
                material_documents.push(RawMaterialDocument::parse(&label, &text)?);
            }
        }

        Ok(Self::from_parts(name, imported, material_documents, config))
    }

    /// Assembles an operation from already-imported parts.
    pub fn from_parts(
        name: String,
        imported: ImportedDocument,
        material_documents: Vec<RawMaterialDocument>,
        config: ModelCompilationConfiguration,
    ) -> Self {
        Self {
            name,
            model: imported.model,
            skeleton: imported.skeleton,
            animations: imported.animations,
            material_documents,
            material_names: imported.material_names,
            skeleton_names: imported.skeleton_names,
            config,
            depval: DependencyValidation::new(),
            skeleton_optimized: false,
        }
    }

    fn construction_error(&self, message: impl std::fmt::Display) -> CompileError {
        CompileError::construction(message.to_string(), self.depval.clone())
    }

    fn serialize_model(&mut self) -> Result<Vec<SerializedArtifact>, CompileError> {
        if !self.skeleton_optimized {
            // optimising against several skeletons at once is rejected;
            // compile each skeleton's model separately instead
            if self.skeleton_names.len() > 1
                && self.config.skeleton_rules.optimize.unwrap_or(true)
            {
                return Err(self.construction_error(
                    "model references multiple skeletons; skeleton optimisation over \
                     multiple skeletons is unsupported",
                ));
            }
            optimize_skeleton(&mut self.skeleton, &mut self.model, &self.config.skeleton_rules)
                .map_err(|e| self.construction_error(e))?;
            self.skeleton_optimized = true;
        }
        serialize_to_chunks(&self.model, &self.name, &self.skeleton, &self.config)
            .map_err(|e| self.construction_error(e))
    }

    fn serialize_materials(&self) -> Result<Vec<SerializedArtifact>, CompileError> {
        let resolved = resolve_materials(&self.material_documents, &self.material_names)
            .map_err(|e| self.construction_error(e))?;
        Ok(vec![serialize_material_scaffold(&resolved, &self.name)])
    }

    fn serialize_skeleton(&self) -> Vec<SerializedArtifact> {
        let mut serializer = BlockSerializer::new();
        self.skeleton.serialize(&mut serializer);
        vec![SerializedArtifact {
            chunk_type_code: CHUNK_TYPE_SKELETON,
            version: 1,
            name: self.name.clone(),
            data: serializer.as_memory_block().to_vec(),
        }]
    }

    fn serialize_animation_set(&self) -> Vec<SerializedArtifact> {
        let mut serializer = BlockSerializer::new();
        self.animations.serialize(&mut serializer);
        vec![SerializedArtifact {
            chunk_type_code: CHUNK_TYPE_ANIMATION_SET,
            version: 1,
            name: self.name.clone(),
            data: serializer.as_memory_block().to_vec(),
        }]
    }
}

impl CompileOperation for ModelCompileOperation {
    fn targets(&self) -> Vec<TargetDesc> {
        vec![
            TargetDesc {
                target_code: TARGET_MODEL,
                name: "Model",
            },
            TargetDesc {
                target_code: TARGET_RAW_MAT,
                name: "RawMat",
            },
            TargetDesc {
                target_code: TARGET_SKELETON,
                name: "Skeleton",
            },
            TargetDesc {
                target_code: TARGET_ANIMATION_SET,
                name: "AnimationSet",
            },
        ]
    }

    fn serialize_target(&mut self, idx: usize) -> Result<SerializedTarget, CompileError> {
        let artifacts = match idx {
            0 => self.serialize_model()?,
            1 => self.serialize_materials()?,
            2 => self.serialize_skeleton(),
            3 => self.serialize_animation_set(),
            other => {
                return Err(CompileError::MissingElement(format!(
                    "no target with index {other}"
                )));
            }
        };
        Ok(SerializedTarget {
            artifacts,
            depval: self.depval.clone(),
        })
    }

    fn dependency_validation(&self) -> DependencyValidation {
        self.depval.clone()
    }
}

/// Candidate material sidecars for a source, nearest first.
fn material_sidecars(source: &Path) -> Vec<PathBuf> {
    let mut candidates = vec![source.with_extension("material")];
    if let Some(parent) = source.parent() {
        candidates.push(parent.join("shared.material"));
    }
    candidates
}
