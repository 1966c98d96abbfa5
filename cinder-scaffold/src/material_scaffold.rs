//! Material scaffold reader.
//!
//! A material scaffold adopts the same outer framing as a model scaffold:
//! one `Material` record per resolved material (guid + embedded material
//! machine), a `MaterialNameDehash` table carrying the colon-delimited
//! source trace for each guid, and optional `ShaderPatchCollection`
//! records.

use cinder_block::{AlignedBlock, BlockView, block_initialize};

use crate::ScaffoldError;
use crate::chunks::{CHUNK_TYPE_RESOLVED_MATERIAL, ChunkFile, RESOLVED_MATERIAL_VERSION};
use crate::cmd::{MaterialCommand, ScaffoldCmdIterator, ScaffoldCommand};
use crate::depval::DependencyValidation;
use crate::params::ParamBox;
use crate::types::{RenderStateSet, SamplerDesc};

#[derive(Debug, Clone, Copy)]
struct MachineRange {
    start: usize,
    size: usize,
}

/// A material's settings, decoded from its machine.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaterialScaffoldMaterial {
    /// Shader resource bindings.
    pub bindings: ParamBox,
    /// Parameters used for selecting the shader variation.
    pub selectors: ParamBox,
    /// Fixed-function state selection.
    pub state_set: RenderStateSet,
    /// Values passed to shader constants.
    pub constants: ParamBox,
    /// Sampler bindings by name hash.
    pub sampler_bindings: Vec<(u64, SamplerDesc)>,
    pub patch_collection: u64,
}

/// An asset containing compiled material settings.
#[derive(Debug)]
pub struct MaterialScaffold {
    block: AlignedBlock,
    data_end: usize,
    material_machines: Vec<(u64, MachineRange)>,
    name_dehash: Vec<(u64, String)>,
    patch_collections: Vec<(u64, String)>,
    depval: DependencyValidation,
}

impl MaterialScaffold {
    pub fn new(chunks: &ChunkFile, depval: DependencyValidation) -> Result<Self, ScaffoldError> {
        let data = chunks.require(CHUNK_TYPE_RESOLVED_MATERIAL, RESOLVED_MATERIAL_VERSION)?;
        let mut block = AlignedBlock::from_bytes(data);
        block_initialize(&mut block)?;
        let view = BlockView::new(&block)?;
        let data_end = cinder_block::BlockHeader::SIZE + view.bytes().len();

        let mut material_machines = Vec::new();
        let mut name_dehash = Vec::new();
        let mut patch_collections = Vec::new();

        let outer_len = view.read_u32(0)? as usize;
        let mut offset = 4usize;
        let outer_end = 4 + outer_len;
        while offset < outer_end {
            let cmd = view.read_u32(offset)?;
            let size = view.read_u32(offset + 4)? as usize;
            let payload = offset + 8;
            if payload + size > outer_end {
                return Err(ScaffoldError::TruncatedRecord(offset));
            }

            match cmd {
                c if c == ScaffoldCommand::Material as u32 => {
                    let guid = view.read_u64(payload)?;
                    let data_size = view.read_u64(payload + 8)? as usize;
                    let start = view.resolve(payload + 16)?;
                    material_machines.push((guid, MachineRange { start, size: data_size }));
                }
                c if c == ScaffoldCommand::MaterialNameDehash as u32 => {
                    let base = view.resolve(payload)?;
                    let count = view.count_at(payload)?;
                    for i in 0..count {
                        let entry = base + i * 24;
                        let hash = view.read_u64(entry)?;
                        let name = view.string_view(entry + 8)?.to_string();
                        name_dehash.push((hash, name));
                    }
                }
                c if c == ScaffoldCommand::ShaderPatchCollection as u32 => {
                    let hash = view.read_u64(payload)?;
                    let text_size = view.read_u64(payload + 8)? as usize;
                    let start = view.resolve(payload + 16)?;
                    let text = std::str::from_utf8(view.slice_at(start, text_size)?)
                        .map_err(|_| {
                            ScaffoldError::Container("patch collection is not UTF-8".into())
                        })?
                        .to_string();
                    patch_collections.push((hash, text));
                }
                _ => {}
            }
            offset = payload + size;
        }

        material_machines.sort_by_key(|(guid, _)| *guid);
        name_dehash.sort_by_key(|(hash, _)| *hash);

        Ok(Self {
            block,
            data_end,
            material_machines,
            name_dehash,
            patch_collections,
            depval,
        })
    }

    fn machine_bytes(&self, range: MachineRange) -> &[u8] {
        let data = &self.block[cinder_block::BlockHeader::SIZE..self.data_end];
        &data[range.start..range.start + range.size]
    }

    /// O(log n) lookup of a material machine by guid.
    pub fn material_machine(&self, guid: u64) -> Option<ScaffoldCmdIterator<'_>> {
        self.material_machines
            .binary_search_by_key(&guid, |(g, _)| *g)
            .ok()
            .map(|idx| ScaffoldCmdIterator::new(self.machine_bytes(self.material_machines[idx].1)))
    }

    /// All material guids, sorted.
    pub fn materials(&self) -> Vec<u64> {
        self.material_machines.iter().map(|(g, _)| *g).collect()
    }

    /// The colon-delimited source trace for a material guid.
    pub fn dehash_material_name(&self, guid: u64) -> Option<&str> {
        self.name_dehash
            .binary_search_by_key(&guid, |(h, _)| *h)
            .ok()
            .map(|idx| self.name_dehash[idx].1.as_str())
    }

    pub fn shader_patch_collection(&self, hash: u64) -> Option<&str> {
        self.patch_collections
            .iter()
            .find(|(h, _)| *h == hash)
            .map(|(_, text)| text.as_str())
    }

    /// Decodes a material machine into its settings.
    pub fn material(&self, guid: u64) -> Result<Option<MaterialScaffoldMaterial>, ScaffoldError> {
        let Some(machine) = self.material_machine(guid) else {
            return Ok(None);
        };
        let mut material = MaterialScaffoldMaterial::default();
        for record in machine {
            let record = record?;
            match record.cmd {
                c if c == MaterialCommand::AttachShaderResourceBindings as u32 => {
                    material.bindings = ParamBox::from_bytes(record.payload)?;
                }
                c if c == MaterialCommand::AttachSelectors as u32 => {
                    material.selectors = ParamBox::from_bytes(record.payload)?;
                }
                c if c == MaterialCommand::AttachStateSet as u32 => {
                    material.state_set = record.as_pod()?;
                }
                c if c == MaterialCommand::AttachConstants as u32 => {
                    material.constants = ParamBox::from_bytes(record.payload)?;
                }
                c if c == MaterialCommand::AttachSamplerBindings as u32 => {
                    let entry_size = 8 + size_of::<SamplerDesc>();
                    if !record.payload.len().is_multiple_of(entry_size) {
                        return Err(ScaffoldError::TruncatedRecord(0));
                    }
                    for chunk in record.payload.chunks_exact(entry_size) {
                        let hash = u64::from_le_bytes(chunk[0..8].try_into().unwrap());
                        let desc: SamplerDesc = bytemuck::pod_read_unaligned(&chunk[8..]);
                        material.sampler_bindings.push((hash, desc));
                    }
                }
                c if c == MaterialCommand::AttachPatchCollectionId as u32 => {
                    material.patch_collection = record.as_pod()?;
                }
                _ => {}
            }
        }
        Ok(Some(material))
    }

    pub fn dependency_validation(&self) -> &DependencyValidation {
        &self.depval
    }
}
