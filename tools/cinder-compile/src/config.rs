//! Sidecar configuration files.
//!
//! Two sidecars steer a compile:
//!
//! - `modelimport.dat` (per directory): binding renames and suppression
//!   lists applied while importing. Absence is tolerated; defaults
//!   apply.
//! - `<basename>.model`: per-geo and per-skeleton compilation rules.
//!
//! Both are TOML. Attribute names in rule files are given as plain
//! semantic names (`NORMAL`, `TEXCOORD0`) and hashed here.

use std::collections::BTreeMap;
use std::path::Path;

use anyhow::{Context, Result};
use serde::Deserialize;

use cinder_geoproc::{ModelCompilationConfiguration, RawGeoRules, SkeletonRules};
use cinder_scaffold::hash::hash64;

/// File name of the per-directory import configuration.
pub const IMPORT_CONFIG_NAME: &str = "modelimport.dat";

/// Binding renames and suppression lists applied during import.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImportConfiguration {
    /// Material binding symbol renames, applied before hashing.
    pub binding_renames: BTreeMap<String, String>,
    /// Binding symbols dropped entirely.
    pub suppressed_bindings: Vec<String>,
}

impl ImportConfiguration {
    /// Loads the configuration next to `source`; a missing file yields
    /// the defaults.
    pub fn load_for(source: &Path) -> Result<Self> {
        let path = source
            .parent()
            .unwrap_or_else(|| Path::new("."))
            .join(IMPORT_CONFIG_NAME);
        if !path.exists() {
            return Ok(Self::default());
        }
        let text = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("failed to parse {}", path.display()))
    }

    /// Applies renames and suppression to one binding symbol.
    pub fn remap_binding(&self, symbol: &str) -> Option<String> {
        if self.suppressed_bindings.iter().any(|s| s == symbol) {
            return None;
        }
        Some(
            self.binding_renames
                .get(symbol)
                .cloned()
                .unwrap_or_else(|| symbol.to_string()),
        )
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct GeoRulesToml {
    pattern: String,
    exclude_attributes: Vec<String>,
    include_attributes: Vec<String>,
    rebuild_normals: Option<bool>,
    rebuild_tangents: Option<bool>,
    merge_duplicate_vertices: Option<bool>,
    native_16_bit_types: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct SkeletonRulesToml {
    preserve_all_outputs: Option<bool>,
    preserve_outputs: Vec<String>,
    preserve_all_parameters: Option<bool>,
    preserve_parameters: Vec<String>,
    optimize: Option<bool>,
    bake_static_transforms: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
struct ModelRulesToml {
    command_streams: Vec<String>,
    geo_rules: Vec<GeoRulesToml>,
    skeleton: SkeletonRulesToml,
}

/// Loads `<basename>.model` rules for a source file; absence yields the
/// default configuration.
pub fn load_model_rules(source: &Path) -> Result<ModelCompilationConfiguration> {
    let path = source.with_extension("model");
    if !path.exists() {
        return Ok(ModelCompilationConfiguration::default());
    }
    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    parse_model_rules(&text).with_context(|| format!("failed to parse {}", path.display()))
}

/// Parses rule TOML text into the pipeline configuration.
pub fn parse_model_rules(text: &str) -> Result<ModelCompilationConfiguration> {
    let parsed: ModelRulesToml = toml::from_str(text)?;
    let mut config = ModelCompilationConfiguration {
        command_streams: parsed.command_streams.iter().map(|s| hash64(s)).collect(),
        skeleton_rules: SkeletonRules {
            preserve_all_outputs: parsed.skeleton.preserve_all_outputs,
            preserve_outputs: parsed
                .skeleton
                .preserve_outputs
                .iter()
                .map(|s| hash64(s))
                .collect(),
            preserve_all_parameters: parsed.skeleton.preserve_all_parameters,
            preserve_parameters: parsed
                .skeleton
                .preserve_parameters
                .iter()
                .map(|s| hash64(s))
                .collect(),
            optimize: parsed.skeleton.optimize,
            bake_static_transforms: parsed.skeleton.bake_static_transforms,
        },
        ..Default::default()
    };
    for rules in parsed.geo_rules {
        let pattern = if rules.pattern.is_empty() {
            "*".to_string()
        } else {
            rules.pattern.clone()
        };
        config.raw_geo_rules.push((
            pattern,
            RawGeoRules {
                exclude_attributes: rules.exclude_attributes.iter().map(|s| hash64(s)).collect(),
                include_attributes: rules.include_attributes.iter().map(|s| hash64(s)).collect(),
                rebuild_normals: rules.rebuild_normals,
                rebuild_tangents: rules.rebuild_tangents,
                merge_duplicate_vertices: rules.merge_duplicate_vertices,
                native_16_bit_types: rules.native_16_bit_types,
            },
        ));
    }
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_model_rules() {
        let config = parse_model_rules(
            r#"
            command_streams = ["adjacency"]

            [[geo_rules]]
            pattern = "*"
            merge_duplicate_vertices = true
            include_attributes = ["NORMAL"]

            [[geo_rules]]
            pattern = "hull"
            native_16_bit_types = true

            [skeleton]
            optimize = true
            preserve_outputs = ["root"]
            "#,
        )
        .unwrap();

        assert_eq!(config.command_streams, vec![hash64("adjacency")]);
        assert_eq!(config.raw_geo_rules.len(), 2);
        let hull = config.match_raw_geo_rules("hull");
        assert_eq!(hull.merge_duplicate_vertices, Some(true));
        assert_eq!(hull.native_16_bit_types, Some(true));
        assert_eq!(hull.include_attributes, vec![hash64("NORMAL")]);
        assert_eq!(config.skeleton_rules.preserve_outputs, vec![hash64("root")]);
    }

    #[test]
    fn test_missing_sidecars_tolerated() {
        let dir = tempfile::tempdir().unwrap();
        let source = dir.path().join("crate01.gltf");
        let import = ImportConfiguration::load_for(&source).unwrap();
        assert!(import.binding_renames.is_empty());
        let rules = load_model_rules(&source).unwrap();
        assert!(rules.raw_geo_rules.is_empty());
    }

    #[test]
    fn test_binding_remap_and_suppression() {
        let config: ImportConfiguration = toml::from_str(
            r#"
            suppressed_bindings = ["debug_proxy"]

            [binding_renames]
            old_metal = "metal"
            "#,
        )
        .unwrap();
        assert_eq!(config.remap_binding("old_metal"), Some("metal".to_string()));
        assert_eq!(config.remap_binding("wood"), Some("wood".to_string()));
        assert_eq!(config.remap_binding("debug_proxy"), None);
    }
}
