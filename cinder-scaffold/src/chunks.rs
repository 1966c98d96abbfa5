//! Chunked artifact container.
//!
//! Compiled artifacts are stored on disk as a small chunk file: a magic
//! header followed by a chunk table and packed chunk data. Each chunk
//! carries a 64-bit type code, a version and a name; a scaffold is stored
//! as one block-serializer chunk plus one flat large-blocks chunk.
//!
//! # Layout
//! ```text
//! 0x00: magic "CNSF"
//! 0x04: container version u32
//! 0x08: chunk count u32
//! 0x0C: per chunk: { u64 type_code; u32 version; u32 name_len;
//!                    u64 data_offset; u64 data_size; name bytes }
//! var:  packed chunk data
//! ```

use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::ScaffoldError;
use crate::depval::DependencyValidation;

pub const CHUNK_FILE_MAGIC: &[u8; 4] = b"CNSF";
pub const CHUNK_FILE_VERSION: u32 = 1;

/// Chunk type code for the model scaffold block.
pub const CHUNK_TYPE_MODEL_SCAFFOLD: u64 = crate::hash::hash64_const(b"ModelScaffold");
/// Chunk type code for the model scaffold large-resource stream.
pub const CHUNK_TYPE_MODEL_SCAFFOLD_LARGE_BLOCKS: u64 =
    crate::hash::hash64_const(b"ModelScaffold-large-blocks");
/// Chunk type code for resolved material scaffolds.
pub const CHUNK_TYPE_RESOLVED_MATERIAL: u64 = crate::hash::hash64_const(b"ResolvedMat");
/// Chunk type code for standalone skeleton scaffolds.
pub const CHUNK_TYPE_SKELETON: u64 = crate::hash::hash64_const(b"Skeleton");
/// Chunk type code for animation set scaffolds.
pub const CHUNK_TYPE_ANIMATION_SET: u64 = crate::hash::hash64_const(b"AnimationSet");
/// Chunk type code for human-readable metrics dumps.
pub const CHUNK_TYPE_METRICS: u64 = crate::hash::hash64_const(b"Metrics");
/// Chunk type code for compile error logs.
pub const CHUNK_TYPE_COMPILE_LOG: u64 = crate::hash::hash64_const(b"CompileLog");

pub const MODEL_SCAFFOLD_VERSION: u32 = 1;
pub const MODEL_SCAFFOLD_LARGE_BLOCKS_VERSION: u32 = 0;
pub const RESOLVED_MATERIAL_VERSION: u32 = 1;

/// One artifact produced by a compile operation.
#[derive(Debug, Clone)]
pub struct SerializedArtifact {
    pub chunk_type_code: u64,
    pub version: u32,
    pub name: String,
    pub data: Vec<u8>,
}

/// Descriptor of a chunk inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkHeader {
    pub type_code: u64,
    pub version: u32,
    pub name: String,
    pub data_offset: u64,
    pub data_size: u64,
}

/// An in-memory chunk container.
#[derive(Debug, Clone, Default)]
pub struct ChunkFile {
    chunks: Vec<(ChunkHeader, Vec<u8>)>,
    /// Where this container was loaded from, when it came from disk.
    source_path: Option<PathBuf>,
}

impl ChunkFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_artifacts(artifacts: impl IntoIterator<Item = SerializedArtifact>) -> Self {
        let mut file = Self::new();
        for artifact in artifacts {
            file.push(artifact);
        }
        file
    }

    pub fn push(&mut self, artifact: SerializedArtifact) {
        self.chunks.push((
            ChunkHeader {
                type_code: artifact.chunk_type_code,
                version: artifact.version,
                name: artifact.name,
                data_offset: 0,
                data_size: artifact.data.len() as u64,
            },
            artifact.data,
        ));
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn headers(&self) -> impl Iterator<Item = &ChunkHeader> {
        self.chunks.iter().map(|(h, _)| h)
    }

    /// Finds the first chunk with the given type code.
    pub fn find(&self, type_code: u64) -> Option<(&ChunkHeader, &[u8])> {
        self.chunks
            .iter()
            .find(|(h, _)| h.type_code == type_code)
            .map(|(h, d)| (h, d.as_slice()))
    }

    /// As [`Self::find`], but requires an exact version and reports a
    /// missing-chunk error otherwise.
    pub fn require(&self, type_code: u64, version: u32) -> Result<&[u8], ScaffoldError> {
        match self.find(type_code) {
            Some((header, data)) if header.version == version => Ok(data),
            _ => Err(ScaffoldError::MissingChunk { type_code, version }),
        }
    }

    /// Returns a handle that can re-open a chunk's data on demand, for
    /// streaming loads of large resources. When the container was loaded
    /// from disk the reopen goes back to the file; otherwise it clones the
    /// in-memory bytes.
    pub fn reopen(&self, type_code: u64) -> Result<ChunkReopen, ScaffoldError> {
        let (header, data) = self.find(type_code).ok_or(ScaffoldError::MissingChunk {
            type_code,
            version: 0,
        })?;
        match (&self.source_path, header.data_offset) {
            (Some(path), offset) if offset != 0 => Ok(ChunkReopen::File {
                path: path.clone(),
                offset,
                size: header.data_size,
            }),
            _ => Ok(ChunkReopen::Memory(data.to_vec())),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut header_size = 12usize;
        for (h, _) in &self.chunks {
            header_size += 8 + 4 + 4 + 8 + 8 + h.name.len();
        }

        let mut bytes = Vec::new();
        bytes.extend_from_slice(CHUNK_FILE_MAGIC);
        bytes.extend_from_slice(&CHUNK_FILE_VERSION.to_le_bytes());
        bytes.extend_from_slice(&(self.chunks.len() as u32).to_le_bytes());

        let mut data_cursor = header_size as u64;
        for (h, d) in &self.chunks {
            bytes.extend_from_slice(&h.type_code.to_le_bytes());
            bytes.extend_from_slice(&h.version.to_le_bytes());
            bytes.extend_from_slice(&(h.name.len() as u32).to_le_bytes());
            bytes.extend_from_slice(&data_cursor.to_le_bytes());
            bytes.extend_from_slice(&(d.len() as u64).to_le_bytes());
            bytes.extend_from_slice(h.name.as_bytes());
            data_cursor += d.len() as u64;
        }
        for (_, d) in &self.chunks {
            bytes.extend_from_slice(d);
        }
        bytes
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ScaffoldError> {
        fn take<'a>(
            bytes: &'a [u8],
            cursor: &mut usize,
            n: usize,
        ) -> Result<&'a [u8], ScaffoldError> {
            let slice = bytes
                .get(*cursor..*cursor + n)
                .ok_or_else(|| ScaffoldError::Container("truncated header".into()))?;
            *cursor += n;
            Ok(slice)
        }
        let mut cursor = 0usize;

        if take(bytes, &mut cursor, 4)? != CHUNK_FILE_MAGIC {
            return Err(ScaffoldError::Container("bad magic".into()));
        }
        let version = u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().unwrap());
        if version != CHUNK_FILE_VERSION {
            return Err(ScaffoldError::Container(format!(
                "unsupported container version {version}"
            )));
        }
        let count = u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().unwrap()) as usize;

        let mut headers = Vec::with_capacity(count);
        for _ in 0..count {
            let type_code = u64::from_le_bytes(take(bytes, &mut cursor, 8)?.try_into().unwrap());
            let version = u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().unwrap());
            let name_len = u32::from_le_bytes(take(bytes, &mut cursor, 4)?.try_into().unwrap()) as usize;
            let data_offset = u64::from_le_bytes(take(bytes, &mut cursor, 8)?.try_into().unwrap());
            let data_size = u64::from_le_bytes(take(bytes, &mut cursor, 8)?.try_into().unwrap());
            let name = std::str::from_utf8(take(bytes, &mut cursor, name_len)?)
                .map_err(|_| ScaffoldError::Container("chunk name is not UTF-8".into()))?
                .to_string();
            headers.push(ChunkHeader {
                type_code,
                version,
                name,
                data_offset,
                data_size,
            });
        }

        let mut chunks = Vec::with_capacity(count);
        for header in headers {
            let start = header.data_offset as usize;
            let end = start + header.data_size as usize;
            let data = bytes
                .get(start..end)
                .ok_or_else(|| ScaffoldError::Container("chunk data out of range".into()))?
                .to_vec();
            chunks.push((header, data));
        }
        Ok(Self {
            chunks,
            source_path: None,
        })
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ScaffoldError> {
        std::fs::write(path, self.to_bytes())?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, ScaffoldError> {
        let bytes = std::fs::read(path)?;
        let mut file = Self::from_bytes(&bytes)?;
        file.source_path = Some(path.to_path_buf());
        Ok(file)
    }
}

/// Re-openable handle onto one chunk's data.
#[derive(Debug, Clone)]
pub enum ChunkReopen {
    File {
        path: PathBuf,
        offset: u64,
        size: u64,
    },
    Memory(Vec<u8>),
}

impl ChunkReopen {
    /// Reads a sub-range of the chunk.
    pub fn read_range(&self, offset: u64, size: u64) -> Result<Vec<u8>, ScaffoldError> {
        match self {
            ChunkReopen::File {
                path,
                offset: base,
                size: total,
            } => {
                if offset + size > *total {
                    return Err(ScaffoldError::Container("range beyond chunk".into()));
                }
                let mut file = std::fs::File::open(path)?;
                file.seek(SeekFrom::Start(base + offset))?;
                let mut out = vec![0u8; size as usize];
                file.read_exact(&mut out)?;
                Ok(out)
            }
            ChunkReopen::Memory(bytes) => {
                let start = offset as usize;
                let end = start + size as usize;
                bytes
                    .get(start..end)
                    .map(|s| s.to_vec())
                    .ok_or_else(|| ScaffoldError::Container("range beyond chunk".into()))
            }
        }
    }

    pub fn read_all(&self) -> Result<Vec<u8>, ScaffoldError> {
        match self {
            ChunkReopen::File { size, .. } => self.read_range(0, *size),
            ChunkReopen::Memory(bytes) => Ok(bytes.clone()),
        }
    }
}

/// Chunks paired with the dependency validation they were produced under.
#[derive(Debug, Clone)]
pub struct ArtifactChunks {
    pub container: ChunkFile,
    pub depval: DependencyValidation,
}
