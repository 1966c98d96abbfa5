//! cinder-compile - Cinder asset compiler CLI
//!
//! Compiles authored model sources into chunked scaffold artifacts.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use rayon::prelude::*;

use cinder_compile::operation::ModelCompileOperation;
use cinder_scaffold::chunks::{CHUNK_TYPE_COMPILE_LOG, ChunkFile, SerializedArtifact};
use cinder_scaffold::compile::{CompileOperation, TARGET_MODEL};

#[derive(Parser)]
#[command(name = "cinder-compile")]
#[command(about = "Cinder asset compiler")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Compile model sources into scaffold artifacts
    Compile {
        /// Input model files (glTF/GLB)
        inputs: Vec<PathBuf>,

        /// Output directory (defaults to each input's directory)
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Only serialize the named target (Model, RawMat, Skeleton,
        /// AnimationSet)
        #[arg(short, long)]
        target: Option<String>,
    },

    /// Validate sources and sidecars without writing artifacts
    Check {
        /// Input model files
        inputs: Vec<PathBuf>,
    },
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Compile {
            inputs,
            output,
            target,
        } => {
            if inputs.is_empty() {
                bail!("no input files");
            }
            let failures: usize = inputs
                .par_iter()
                .map(|input| match compile_one(input, output.as_deref(), target.as_deref()) {
                    Ok(()) => 0usize,
                    Err(err) => {
                        tracing::error!(input = %input.display(), error = %format!("{err:#}"), "compile failed");
                        1
                    }
                })
                .sum();
            if failures > 0 {
                bail!("{failures} of {} compiles failed", inputs.len());
            }
            Ok(())
        }
        Commands::Check { inputs } => {
            for input in &inputs {
                ModelCompileOperation::create(input)
                    .with_context(|| format!("check failed for {}", input.display()))?;
                tracing::info!(input = %input.display(), "ok");
            }
            Ok(())
        }
    }
}

fn compile_one(input: &Path, output: Option<&Path>, only_target: Option<&str>) -> Result<()> {
    let mut operation = ModelCompileOperation::create(input)?;
    let stem = input
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("model")
        .to_string();
    let out_dir = output
        .map(Path::to_path_buf)
        .or_else(|| input.parent().map(Path::to_path_buf))
        .unwrap_or_else(|| PathBuf::from("."));
    std::fs::create_dir_all(&out_dir)
        .with_context(|| format!("failed to create {}", out_dir.display()))?;

    let targets = operation.targets();
    let mut any_failed = false;
    for (index, target) in targets.iter().enumerate() {
        if let Some(only) = only_target
            && !target.name.eq_ignore_ascii_case(only)
        {
            continue;
        }

        let path = out_dir.join(format!("{stem}-{}.chunk", target.name.to_lowercase()));
        match operation.serialize_target(index) {
            Ok(serialized) => {
                let container = ChunkFile::from_artifacts(serialized.artifacts);
                container
                    .write_to(&path)
                    .with_context(|| format!("failed to write {}", path.display()))?;
                tracing::info!(target = target.name, path = %path.display(), "wrote artifact");
            }
            Err(err) => {
                any_failed = true;
                tracing::error!(target = target.name, error = %err, "target failed");
                // a failed compile still produces an artifact holding
                // only the error log, gated by the depval for re-runs
                if target.target_code == TARGET_MODEL {
                    let log = ChunkFile::from_artifacts([SerializedArtifact {
                        chunk_type_code: CHUNK_TYPE_COMPILE_LOG,
                        version: 0,
                        name: stem.clone(),
                        data: err.to_string().into_bytes(),
                    }]);
                    log.write_to(&path)
                        .with_context(|| format!("failed to write {}", path.display()))?;
                }
            }
        }
    }
    if any_failed {
        bail!("one or more targets failed");
    }
    Ok(())
}
