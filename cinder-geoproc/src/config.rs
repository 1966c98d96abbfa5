//! Compile configuration: per-geo and per-skeleton rules.
//!
//! Rules arrive from a `<basename>.model` sidecar (parsed by the compile
//! tool); this module holds the resolved form the pipeline consumes.
//! Geo rules are matched by label pattern, `*` matching everything, and
//! merged most-general first so specific rules override the wildcard.

use cinder_scaffold::hash::hash64;

/// Rules applied to one geometry block during instantiation.
#[derive(Debug, Clone, Default)]
pub struct RawGeoRules {
    /// Hashes of semantic names (or `NAME<index>` forms) to drop.
    pub exclude_attributes: Vec<u64>,
    /// Hashes of semantic names to synthesise when missing.
    pub include_attributes: Vec<u64>,
    pub rebuild_normals: Option<bool>,
    pub rebuild_tangents: Option<bool>,
    pub merge_duplicate_vertices: Option<bool>,
    pub native_16_bit_types: Option<bool>,
}

impl RawGeoRules {
    /// Overlays `other`; set options in `other` win, attribute lists
    /// accumulate.
    pub fn merge_from(&mut self, other: &RawGeoRules) {
        for &a in &other.exclude_attributes {
            if !self.exclude_attributes.contains(&a) {
                self.exclude_attributes.push(a);
            }
        }
        for &a in &other.include_attributes {
            if !self.include_attributes.contains(&a) {
                self.include_attributes.push(a);
            }
        }
        if other.rebuild_normals.is_some() {
            self.rebuild_normals = other.rebuild_normals;
        }
        if other.rebuild_tangents.is_some() {
            self.rebuild_tangents = other.rebuild_tangents;
        }
        if other.merge_duplicate_vertices.is_some() {
            self.merge_duplicate_vertices = other.merge_duplicate_vertices;
        }
        if other.native_16_bit_types.is_some() {
            self.native_16_bit_types = other.native_16_bit_types;
        }
    }
}

/// Rules applied to the embedded skeleton before serialisation.
#[derive(Debug, Clone, Default)]
pub struct SkeletonRules {
    pub preserve_all_outputs: Option<bool>,
    /// Hashes of joint names to keep even when unreferenced.
    pub preserve_outputs: Vec<u64>,
    pub preserve_all_parameters: Option<bool>,
    pub preserve_parameters: Vec<u64>,
    pub optimize: Option<bool>,
    pub bake_static_transforms: Option<bool>,
}

/// Full compile configuration for one model.
#[derive(Debug, Clone, Default)]
pub struct ModelCompilationConfiguration {
    /// `(label pattern, rules)`; `*` matches every geometry block.
    pub raw_geo_rules: Vec<(String, RawGeoRules)>,
    pub skeleton_rules: SkeletonRules,
    /// Command stream guids to emit, in declaration order. Empty means a
    /// single default stream.
    pub command_streams: Vec<u64>,
}

/// Stream guid whose command stream is built in topological
/// (adjacency) mode.
pub fn adjacency_stream_guid() -> u64 {
    hash64("adjacency")
}

impl ModelCompilationConfiguration {
    /// Resolves the rules for one geometry block label.
    pub fn match_raw_geo_rules(&self, label: &str) -> RawGeoRules {
        let mut result = RawGeoRules::default();
        for (pattern, rules) in &self.raw_geo_rules {
            if pattern == "*" {
                result.merge_from(rules);
            }
        }
        for (pattern, rules) in &self.raw_geo_rules {
            if pattern != "*" && pattern == label {
                result.merge_from(rules);
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wildcard_then_specific() {
        let mut config = ModelCompilationConfiguration::default();
        config.raw_geo_rules.push((
            "*".into(),
            RawGeoRules {
                merge_duplicate_vertices: Some(true),
                native_16_bit_types: Some(false),
                ..Default::default()
            },
        ));
        config.raw_geo_rules.push((
            "hull".into(),
            RawGeoRules {
                native_16_bit_types: Some(true),
                ..Default::default()
            },
        ));

        let hull = config.match_raw_geo_rules("hull");
        assert_eq!(hull.merge_duplicate_vertices, Some(true));
        assert_eq!(hull.native_16_bit_types, Some(true));

        let other = config.match_raw_geo_rules("mast");
        assert_eq!(other.native_16_bit_types, Some(false));
    }
}
