//! Raw materials and their resolution into a material scaffold.
//!
//! Material sidecars (`*.material`, TOML) declare named configurations.
//! A `"*"` entry applies to every material; `inherit` lists walk
//! base-to-derived with later settings winning. Several documents may
//! contribute (the model's own material file plus an override sidecar);
//! they apply in the order given. Each resolved material records a
//! colon-delimited source trace, stored in the scaffold's dehash table.

use anyhow::{Context, Result, anyhow, bail};

use cinder_block::{BlockSerializer, SpecialBuffer};
use cinder_scaffold::chunks::{
    CHUNK_TYPE_RESOLVED_MATERIAL, RESOLVED_MATERIAL_VERSION, SerializedArtifact,
};
use cinder_scaffold::cmd::{CmdWriter, MaterialCommand, ScaffoldCommand};
use cinder_scaffold::hash::{guid_or_number, hash64};
use cinder_scaffold::material_scaffold::MaterialScaffoldMaterial;
use cinder_scaffold::params::{ParamBox, ParamValue};
use cinder_scaffold::types::RenderStateSet;

/// One source entry within a material document.
#[derive(Debug, Clone, Default)]
pub struct RawMaterialEntry {
    pub inherit: Vec<String>,
    pub bindings: ParamBox,
    pub selectors: ParamBox,
    pub constants: ParamBox,
    pub state_set: Option<RenderStateSet>,
    pub patch_collection: Option<String>,
}

/// One parsed `.material` document.
#[derive(Debug, Clone, Default)]
pub struct RawMaterialDocument {
    /// Label used in source traces, typically the file name.
    pub label: String,
    pub entries: Vec<(String, RawMaterialEntry)>,
}

impl RawMaterialDocument {
    pub fn find(&self, name: &str) -> Option<&RawMaterialEntry> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, e)| e)
    }

    /// Parses TOML text. Top-level tables are material entries; the
    /// `"*"` key declares the wildcard entry.
    pub fn parse(label: &str, text: &str) -> Result<Self> {
        let value: toml::Table = toml::from_str(text)
            .with_context(|| format!("failed to parse material document {label}"))?;
        let mut document = RawMaterialDocument {
            label: label.to_string(),
            entries: Vec::new(),
        };
        for (name, entry) in value {
            let table = entry
                .as_table()
                .ok_or_else(|| anyhow!("material entry {name} is not a table"))?;
            document.entries.push((name.clone(), parse_entry(table)?));
        }
        Ok(document)
    }
}

fn parse_entry(table: &toml::Table) -> Result<RawMaterialEntry> {
    let mut entry = RawMaterialEntry::default();
    for (key, value) in table {
        match key.as_str() {
            "inherit" => {
                let list = value
                    .as_array()
                    .ok_or_else(|| anyhow!("inherit must be a list"))?;
                for item in list {
                    entry.inherit.push(
                        item.as_str()
                            .ok_or_else(|| anyhow!("inherit entries must be strings"))?
                            .to_string(),
                    );
                }
            }
            "constants" => entry.constants = parse_param_table(value)?,
            "bindings" => entry.bindings = parse_param_table(value)?,
            "selectors" => entry.selectors = parse_param_table(value)?,
            "states" => entry.state_set = Some(parse_state_set(value)?),
            "patch_collection" => {
                entry.patch_collection = Some(
                    value
                        .as_str()
                        .ok_or_else(|| anyhow!("patch_collection must be a string"))?
                        .to_string(),
                );
            }
            other => bail!("unknown material key '{other}'"),
        }
    }
    Ok(entry)
}

fn parse_param_table(value: &toml::Value) -> Result<ParamBox> {
    let table = value
        .as_table()
        .ok_or_else(|| anyhow!("parameter collection must be a table"))?;
    let mut params = ParamBox::new();
    for (name, value) in table {
        params.set(name, parse_param_value(value)?);
    }
    Ok(params)
}

fn parse_param_value(value: &toml::Value) -> Result<ParamValue> {
    Ok(match value {
        toml::Value::Boolean(v) => ParamValue::Bool(*v),
        toml::Value::Integer(v) => ParamValue::Int(*v),
        toml::Value::Float(v) => ParamValue::Float(*v as f32),
        toml::Value::String(v) => ParamValue::String(v.clone()),
        toml::Value::Array(items) => {
            let mut floats = Vec::with_capacity(items.len());
            for item in items {
                floats.push(match item {
                    toml::Value::Integer(v) => *v as f32,
                    toml::Value::Float(v) => *v as f32,
                    _ => bail!("vector parameters must be numeric"),
                });
            }
            match floats.len() {
                2 => ParamValue::Float2([floats[0], floats[1]]),
                3 => ParamValue::Float3([floats[0], floats[1], floats[2]]),
                4 => ParamValue::Float4([floats[0], floats[1], floats[2], floats[3]]),
                other => bail!("vector parameters must have 2-4 components, got {other}"),
            }
        }
        _ => bail!("unsupported parameter value"),
    })
}

fn parse_state_set(value: &toml::Value) -> Result<RenderStateSet> {
    let table = value
        .as_table()
        .ok_or_else(|| anyhow!("states must be a table"))?;
    let mut states = RenderStateSet::default();
    for (key, value) in table {
        let number = value
            .as_integer()
            .ok_or_else(|| anyhow!("state values must be integers"))?;
        match key.as_str() {
            "double_sided" => states.double_sided = number as u32,
            "blend_type" => states.blend_type = number as u32,
            "depth_bias" => states.depth_bias = number as i32,
            "flags" => states.flags = number as u32,
            other => bail!("unknown state '{other}'"),
        }
    }
    Ok(states)
}

/// A material after resolution across documents and inherit chains.
#[derive(Debug, Clone)]
pub struct ResolvedMaterial {
    pub name: String,
    pub guid: u64,
    pub material: MaterialScaffoldMaterial,
    /// Colon-delimited chain of contributing entries.
    pub trace: String,
}

fn apply_entry(
    target: &mut MaterialScaffoldMaterial,
    trace: &mut Vec<String>,
    document: &RawMaterialDocument,
    entry_name: &str,
    depth: usize,
) -> Result<()> {
    if depth > 16 {
        bail!("inherit chain too deep resolving {entry_name}");
    }
    let Some(entry) = document.find(entry_name) else {
        return Ok(());
    };
    for base in &entry.inherit {
        apply_entry(target, trace, document, base, depth + 1)?;
    }
    target.bindings.merge_from(&entry.bindings);
    target.selectors.merge_from(&entry.selectors);
    target.constants.merge_from(&entry.constants);
    if let Some(states) = entry.state_set {
        target.state_set = states;
    }
    if let Some(patch) = &entry.patch_collection {
        target.patch_collection = hash64(patch);
    }
    let label = format!("{}:{}", document.label, entry_name);
    if !trace.contains(&label) {
        trace.push(label);
    }
    Ok(())
}

/// Resolves one material by name across the given documents, in order.
///
/// Per document, the wildcard entry applies first, then the named entry
/// with its inherit chain (base first, so derived settings win).
pub fn resolve_material(
    documents: &[RawMaterialDocument],
    name: &str,
) -> Result<ResolvedMaterial> {
    let mut material = MaterialScaffoldMaterial::default();
    let mut trace = Vec::new();
    for document in documents {
        apply_entry(&mut material, &mut trace, document, "*", 0)?;
        apply_entry(&mut material, &mut trace, document, name, 0)?;
    }
    Ok(ResolvedMaterial {
        name: name.to_string(),
        guid: guid_or_number(name),
        material,
        trace: trace.join(":"),
    })
}

/// Resolves every named material.
pub fn resolve_materials(
    documents: &[RawMaterialDocument],
    names: &[String],
) -> Result<Vec<ResolvedMaterial>> {
    names
        .iter()
        .map(|name| resolve_material(documents, name))
        .collect()
}

fn material_machine(material: &MaterialScaffoldMaterial) -> Vec<u8> {
    let mut writer = CmdWriter::new();
    if !material.bindings.is_empty() {
        writer.record(
            MaterialCommand::AttachShaderResourceBindings as u32,
            &material.bindings.to_bytes(),
        );
    }
    if !material.selectors.is_empty() {
        writer.record(
            MaterialCommand::AttachSelectors as u32,
            &material.selectors.to_bytes(),
        );
    }
    writer.record_pod(MaterialCommand::AttachStateSet as u32, &material.state_set);
    if !material.constants.is_empty() {
        writer.record(
            MaterialCommand::AttachConstants as u32,
            &material.constants.to_bytes(),
        );
    }
    if !material.sampler_bindings.is_empty() {
        let mut payload = Vec::new();
        for (hash, desc) in &material.sampler_bindings {
            payload.extend_from_slice(&hash.to_le_bytes());
            payload.extend_from_slice(bytemuck::bytes_of(desc));
        }
        writer.record(MaterialCommand::AttachSamplerBindings as u32, &payload);
    }
    if material.patch_collection != 0 {
        writer.record_pod(
            MaterialCommand::AttachPatchCollectionId as u32,
            &material.patch_collection,
        );
    }
    writer.finish()
}

/// Serialises resolved materials into a material scaffold artifact.
pub fn serialize_material_scaffold(
    resolved: &[ResolvedMaterial],
    name: &str,
) -> SerializedArtifact {
    let mut serializer = BlockSerializer::new();
    let recall = serializer.create_recall(size_of::<u32>());

    let mut sorted: Vec<&ResolvedMaterial> = resolved.iter().collect();
    sorted.sort_by_key(|m| m.guid);

    for material in &sorted {
        let machine = material_machine(&material.material);
        serializer.serialize_u32(ScaffoldCommand::Material as u32);
        serializer.serialize_u32(24);
        serializer.serialize_u64(material.guid);
        serializer.serialize_u64(machine.len() as u64);
        serializer.serialize_sub_block(&machine, SpecialBuffer::Unknown);
    }

    let mut dehash: Vec<(u64, String)> = sorted
        .iter()
        .map(|m| (m.guid, m.trace.clone()))
        .collect();
    dehash.sort_by_key(|(hash, _)| *hash);
    serializer.serialize_u32(ScaffoldCommand::MaterialNameDehash as u32);
    serializer.serialize_u32(16);
    serializer.serialize_items(&dehash, SpecialBuffer::Vector);

    serializer.push_size_value_at_recall(recall);

    SerializedArtifact {
        chunk_type_code: CHUNK_TYPE_RESOLVED_MATERIAL,
        version: RESOLVED_MATERIAL_VERSION,
        name: name.to_string(),
        data: serializer.as_memory_block().to_vec(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_document() -> RawMaterialDocument {
        RawMaterialDocument::parse(
            "test.material",
            r#"
            ["*"]
            constants = { OnEverything = 75 }

            [BaseSetting]
            constants = { MaterialDiffuse = [0.1, 0.1, 0.1], SharedConstant = [1.0, 1.0, 1.0] }

            [Material0]
            inherit = ["BaseSetting"]
            "#,
        )
        .unwrap()
    }

    #[test]
    fn test_wildcard_and_inherit_chain() {
        let documents = [base_document()];
        let resolved = resolve_material(&documents, "Material0").unwrap();
        let constants = &resolved.material.constants;
        assert_eq!(constants.get("OnEverything"), Some(&ParamValue::Int(75)));
        assert_eq!(
            constants.get("MaterialDiffuse"),
            Some(&ParamValue::Float3([0.1, 0.1, 0.1]))
        );
        assert_eq!(
            constants.get("SharedConstant"),
            Some(&ParamValue::Float3([1.0, 1.0, 1.0]))
        );
        assert_eq!(
            resolved.trace,
            "test.material:*:test.material:BaseSetting:test.material:Material0"
        );
    }

    #[test]
    fn test_sidecar_supplies_missing_material() {
        let sidecar = RawMaterialDocument::parse(
            "sidecar.material",
            r#"
            [Material1]
            constants = { Brightness = 33, Emissive = [2.5, 0.25, 0.15] }
            "#,
        )
        .unwrap();
        let documents = [base_document(), sidecar];
        let resolved = resolve_material(&documents, "Material1").unwrap();
        let constants = &resolved.material.constants;
        assert_eq!(constants.get("OnEverything"), Some(&ParamValue::Int(75)));
        assert_eq!(constants.get("Brightness"), Some(&ParamValue::Int(33)));
        assert_eq!(
            constants.get("Emissive"),
            Some(&ParamValue::Float3([2.5, 0.25, 0.15]))
        );
    }

    #[test]
    fn test_derived_overrides_base() {
        let document = RawMaterialDocument::parse(
            "m.material",
            r#"
            [Base]
            constants = { Tint = [1.0, 1.0, 1.0], Rough = 0.5 }

            [Shiny]
            inherit = ["Base"]
            constants = { Rough = 0.1 }
            "#,
        )
        .unwrap();
        let resolved = resolve_material(&[document], "Shiny").unwrap();
        assert_eq!(
            resolved.material.constants.get("Rough"),
            Some(&ParamValue::Float(0.1))
        );
        assert_eq!(
            resolved.material.constants.get("Tint"),
            Some(&ParamValue::Float3([1.0, 1.0, 1.0]))
        );
    }

    #[test]
    fn test_numeric_material_names_keep_explicit_guid() {
        let document = RawMaterialDocument::parse("m.material", "[Plain]\n").unwrap();
        let resolved = resolve_material(&[document], "12345").unwrap();
        assert_eq!(resolved.guid, 12345);
    }
}
