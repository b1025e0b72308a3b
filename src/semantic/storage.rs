//! Persistence for the index + id map pair.
//!
//! Two files, always written and loaded together.
//!
//! `style.index`
//!
//! Header (63 bytes):
//! - version: u8 (1)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - build_tag: u128 (ULID, little-endian)
//! - dimensions: u16 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Body: entry_count rows of `[f32; dimensions]` (little-endian). The row
//! position is the ordinal.
//!
//! `ids.json`: `{ "build_tag": "<ULID>", "model": "...", "ids": [...] }`,
//! one id per ordinal.
//!
//! The index file is renamed into place before the id file. A crash between
//! the two renames leaves a pair with different build tags, which `load`
//! rejects.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::semantic::embeddings::model_id_hash;
use crate::semantic::id_map::IdMap;
use crate::semantic::index::SimilarityIndex;
use crate::semantic::normalize::UnitVector;
use crate::semantic::snapshot::{BuildTag, IndexSnapshot};

/// Current file format version
const FORMAT_VERSION: u8 = 1;

/// version(1) + model_id(32) + build_tag(16) + dimensions(2) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 63;
const CHECKSUMMED_LEN: usize = HEADER_SIZE - 4;

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum IndexStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("id map is not valid json: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: index was built with a different model")]
    ModelMismatch,

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("vector at ordinal {0} is not unit-norm")]
    CorruptVector(usize),

    #[error("index and id map do not belong together: {0}")]
    IndexMapMismatch(String),
}

#[derive(Serialize, Deserialize)]
struct IdsFile {
    build_tag: String,
    model: String,
    ids: IdMap,
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    build_tag: u128,
    dimensions: u16,
    entry_count: u64,
}

/// Reads and writes one persisted pair.
pub struct IndexStorage {
    index_path: PathBuf,
    ids_path: PathBuf,
}

impl IndexStorage {
    pub fn new(index_path: PathBuf, ids_path: PathBuf) -> Self {
        Self {
            index_path,
            ids_path,
        }
    }

    pub fn index_path(&self) -> &Path {
        &self.index_path
    }

    pub fn ids_path(&self) -> &Path {
        &self.ids_path
    }

    /// True when either half exists. A lone half still goes through `load`
    /// so the missing partner is reported instead of silently ignored.
    pub fn exists(&self) -> bool {
        self.index_path.exists() || self.ids_path.exists()
    }

    /// Persist a snapshot. Uses atomic write per file: temp file -> fsync -> rename
    pub fn save(&self, snapshot: &IndexSnapshot, model_name: &str) -> Result<(), IndexStorageError> {
        if snapshot.index.len() != snapshot.id_map.len() {
            return Err(IndexStorageError::IndexMapMismatch(format!(
                "refusing to save {} vectors with {} ids",
                snapshot.index.len(),
                snapshot.id_map.len()
            )));
        }

        let dimensions = u16::try_from(snapshot.index.dimensions()).map_err(|_| {
            IndexStorageError::InvalidFormat(format!(
                "{} dimensions do not fit the header",
                snapshot.index.dimensions()
            ))
        })?;

        let header = Header {
            version: FORMAT_VERSION,
            model_id: model_id_hash(model_name),
            build_tag: snapshot.build_tag.as_u128(),
            dimensions,
            entry_count: snapshot.index.len() as u64,
        };

        write_atomic(&self.index_path, |writer| {
            write_header(writer, &header)?;
            for row in snapshot.index.vectors() {
                for value in row {
                    writer.write_all(&value.to_le_bytes())?;
                }
            }
            Ok(())
        })?;

        let ids_file = IdsFile {
            build_tag: snapshot.build_tag.to_string(),
            model: model_name.to_string(),
            ids: snapshot.id_map.clone(),
        };
        write_atomic(&self.ids_path, |writer| {
            serde_json::to_writer(&mut *writer, &ids_file)?;
            Ok(())
        })?;

        Ok(())
    }

    /// Load both halves and verify they belong together.
    pub fn load(
        &self,
        expected_model: &str,
        expected_dimensions: usize,
    ) -> Result<IndexSnapshot, IndexStorageError> {
        if !self.ids_path.exists() && self.index_path.exists() {
            return Err(IndexStorageError::IndexMapMismatch(format!(
                "{} has no id map at {}",
                self.index_path.display(),
                self.ids_path.display()
            )));
        }
        if !self.index_path.exists() && self.ids_path.exists() {
            return Err(IndexStorageError::IndexMapMismatch(format!(
                "{} has no index at {}",
                self.ids_path.display(),
                self.index_path.display()
            )));
        }

        let mut reader = BufReader::new(File::open(&self.index_path)?);
        let header = read_header(&mut reader)?;

        if header.model_id != model_id_hash(expected_model) {
            return Err(IndexStorageError::ModelMismatch);
        }

        if header.dimensions as usize != expected_dimensions {
            return Err(IndexStorageError::DimensionMismatch {
                expected: expected_dimensions,
                got: header.dimensions as usize,
            });
        }

        let ids_file: IdsFile = serde_json::from_reader(BufReader::new(File::open(&self.ids_path)?))?;

        let ids_tag: BuildTag = ids_file.build_tag.parse().map_err(|_| {
            IndexStorageError::InvalidFormat(format!("bad build tag '{}'", ids_file.build_tag))
        })?;
        if ids_tag.as_u128() != header.build_tag {
            return Err(IndexStorageError::IndexMapMismatch(format!(
                "index build {} vs id map build {}",
                BuildTag::from_u128(header.build_tag),
                ids_tag
            )));
        }

        if ids_file.model != expected_model {
            return Err(IndexStorageError::ModelMismatch);
        }

        if ids_file.ids.len() as u64 != header.entry_count {
            return Err(IndexStorageError::IndexMapMismatch(format!(
                "index holds {} vectors, id map holds {} ids",
                header.entry_count,
                ids_file.ids.len()
            )));
        }

        if let Some(id) = ids_file.ids.first_duplicate() {
            return Err(IndexStorageError::IndexMapMismatch(format!(
                "catalog id {id} is mapped to more than one vector"
            )));
        }

        let index = read_body(&mut reader, &header)?;

        Ok(IndexSnapshot {
            index,
            id_map: ids_file.ids,
            build_tag: ids_tag,
        })
    }
}

fn write_atomic<F>(path: &Path, write: F) -> Result<(), IndexStorageError>
where
    F: FnOnce(&mut BufWriter<File>) -> Result<(), IndexStorageError>,
{
    let temp_path = path.with_extension("tmp");

    let result = (|| -> Result<(), IndexStorageError> {
        let mut writer = BufWriter::new(File::create(&temp_path)?);
        write(&mut writer)?;
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        Ok(())
    })();

    if result.is_err() {
        // Clean up temp file on error
        let _ = std::fs::remove_file(&temp_path);
        return result;
    }

    std::fs::rename(&temp_path, path)?;
    Ok(())
}

fn write_header(writer: &mut impl Write, header: &Header) -> Result<(), IndexStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];

    bytes[0] = header.version;
    bytes[1..33].copy_from_slice(&header.model_id);
    bytes[33..49].copy_from_slice(&header.build_tag.to_le_bytes());
    bytes[49..51].copy_from_slice(&header.dimensions.to_le_bytes());
    bytes[51..59].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&bytes[..CHECKSUMMED_LEN]);
    bytes[59..63].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&bytes)?;
    Ok(())
}

fn read_header(reader: &mut impl Read) -> Result<Header, IndexStorageError> {
    let mut bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut bytes).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            IndexStorageError::InvalidFormat("file shorter than header".to_string())
        }
        _ => e.into(),
    })?;

    let version = bytes[0];
    if version > FORMAT_VERSION {
        return Err(IndexStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&bytes[59..63]);
    if u32::from_le_bytes(checksum) != crc32fast::hash(&bytes[..CHECKSUMMED_LEN]) {
        return Err(IndexStorageError::ChecksumMismatch);
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&bytes[1..33]);
    let mut build_tag = [0u8; 16];
    build_tag.copy_from_slice(&bytes[33..49]);
    let mut dimensions = [0u8; 2];
    dimensions.copy_from_slice(&bytes[49..51]);
    let mut entry_count = [0u8; 8];
    entry_count.copy_from_slice(&bytes[51..59]);

    Ok(Header {
        version,
        model_id,
        build_tag: u128::from_le_bytes(build_tag),
        dimensions: u16::from_le_bytes(dimensions),
        entry_count: u64::from_le_bytes(entry_count),
    })
}

fn read_body(reader: &mut impl Read, header: &Header) -> Result<SimilarityIndex, IndexStorageError> {
    let dimensions = header.dimensions as usize;
    let count = usize::try_from(header.entry_count)
        .map_err(|_| IndexStorageError::InvalidFormat("entry count overflows".to_string()))?;

    let mut index = SimilarityIndex::with_capacity(dimensions, count);
    let mut row_bytes = vec![0u8; dimensions * 4];
    let mut rows = Vec::with_capacity(count);

    for ordinal in 0..count {
        reader.read_exact(&mut row_bytes).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => IndexStorageError::InvalidFormat(format!(
                "truncated at ordinal {ordinal} of {count}"
            )),
            _ => e.into(),
        })?;

        let values = row_bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect();

        let vector =
            UnitVector::from_stored(values).ok_or(IndexStorageError::CorruptVector(ordinal))?;
        rows.push(vector);
    }

    let mut trailing = [0u8; 1];
    if reader.read(&mut trailing)? != 0 {
        return Err(IndexStorageError::InvalidFormat(
            "trailing bytes after last vector".to_string(),
        ));
    }

    index
        .add(rows)
        .map_err(|e| IndexStorageError::InvalidFormat(e.to_string()))?;
    Ok(index)
}
