//! On-disk layout of a built index.
//!
//! The index directory holds three files:
//! - `vectors.bin`: header followed by the normalized rows
//! - `ids.json`: ordered id list, `ids[i]` belongs to row `i`
//! - `manifest.json`: model tag, dimensions, count, build time
//!
//! vectors.bin header (49 bytes):
//! - version: u8 (2)
//! - model_id: [u8; 32] (SHA256 hash of model name)
//! - dimensions: u32 (little-endian)
//! - entry_count: u64 (little-endian)
//! - checksum: u32 (CRC32 of header fields before checksum)
//!
//! Rows follow as `entry_count * dimensions` little-endian f32 values.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::embeddings::model_id_hash;
use super::index::FlatIndex;
use crate::storage;

/// Current file format version
const FORMAT_VERSION: u8 = 2;

/// Header size in bytes: version(1) + model_id(32) + dimensions(4) + entry_count(8) + checksum(4)
const HEADER_SIZE: usize = 49;

const VECTORS_FILE: &str = "vectors.bin";
const IDS_FILE: &str = "ids.json";
const MANIFEST_FILE: &str = "manifest.json";

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum VectorStorageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid file format: {0}")]
    InvalidFormat(String),

    #[error("Version mismatch: file version {0}, supported version {1}")]
    VersionMismatch(u8, u8),

    #[error("Model mismatch: vectors were not built with model {0}")]
    ModelMismatch(String),

    #[error("Checksum mismatch: file may be corrupted")]
    ChecksumMismatch,

    #[error("Dimension mismatch: expected {expected}, file has {got}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Dimension mismatch: {vectors} vectors but {ids} ids, index is corrupt")]
    IdCountMismatch { vectors: usize, ids: usize },

    #[error("No index found at {0}, run `cde index` first")]
    NotFound(PathBuf),
}

/// Metadata written next to the vectors.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexManifest {
    pub model: String,
    pub dimensions: usize,
    pub count: usize,
    pub built_at: DateTime<Utc>,
}

/// Reads and writes the index directory.
pub struct IndexStorage {
    dir: PathBuf,
}

impl IndexStorage {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn exists(&self) -> bool {
        self.dir.join(MANIFEST_FILE).exists()
    }

    /// Write `index` into a staging directory and swap it in for the live
    /// one.
    pub fn save(&self, index: &FlatIndex, model: &str) -> Result<IndexManifest, VectorStorageError> {
        let staging = storage::sibling_with_suffix(&self.dir, "staging");
        if staging.exists() {
            std::fs::remove_dir_all(&staging)?;
        }
        std::fs::create_dir_all(&staging)?;

        let manifest = IndexManifest {
            model: model.to_string(),
            dimensions: index.dimensions(),
            count: index.len(),
            built_at: Utc::now(),
        };

        let result = Self::write_all(&staging, index, &manifest)
            .and_then(|_| storage::replace_dir(&staging, &self.dir).map_err(Into::into));

        if result.is_err() {
            // Clean up staging on error
            let _ = std::fs::remove_dir_all(&staging);
        }
        result?;

        log::debug!(
            "saved index: {} vectors, {} dimensions, model {}",
            manifest.count,
            manifest.dimensions,
            manifest.model
        );

        Ok(manifest)
    }

    pub fn load_manifest(&self) -> Result<IndexManifest, VectorStorageError> {
        let path = self.dir.join(MANIFEST_FILE);
        if !path.exists() {
            return Err(VectorStorageError::NotFound(self.dir.clone()));
        }
        let data = std::fs::read(&path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    /// Load the index, checking the header against the manifest and the id
    /// list.
    pub fn load(&self) -> Result<(FlatIndex, IndexManifest), VectorStorageError> {
        let manifest = self.load_manifest()?;

        let ids: Vec<String> = serde_json::from_slice(&std::fs::read(self.dir.join(IDS_FILE))?)?;

        let file = File::open(self.dir.join(VECTORS_FILE))?;
        let mut reader = BufReader::new(file);

        let header = read_header(&mut reader)?;
        validate_header(&header, &manifest)?;

        let count = header.entry_count as usize;
        if count != ids.len() {
            return Err(VectorStorageError::IdCountMismatch {
                vectors: count,
                ids: ids.len(),
            });
        }

        let dimensions = header.dimensions as usize;
        let vectors = read_rows(&mut reader, count * dimensions)?;

        let mut trailing = [0u8; 1];
        if reader.read(&mut trailing)? != 0 {
            return Err(VectorStorageError::InvalidFormat(
                "trailing bytes after last vector".to_string(),
            ));
        }

        let index = FlatIndex::from_parts(dimensions, vectors, ids)
            .map_err(|e| VectorStorageError::InvalidFormat(e.to_string()))?;

        Ok((index, manifest))
    }

    fn write_all(
        dir: &Path,
        index: &FlatIndex,
        manifest: &IndexManifest,
    ) -> Result<(), VectorStorageError> {
        write_vectors(&dir.join(VECTORS_FILE), index, &model_id_hash(&manifest.model))?;
        storage::write_atomic(&dir.join(IDS_FILE), &serde_json::to_vec(index.ids())?)?;
        storage::write_atomic(
            &dir.join(MANIFEST_FILE),
            &serde_json::to_vec_pretty(manifest)?,
        )?;
        Ok(())
    }
}

/// File header structure.
#[derive(Debug)]
struct Header {
    version: u8,
    model_id: [u8; 32],
    dimensions: u32,
    entry_count: u64,
}

fn write_vectors(path: &Path, index: &FlatIndex, model_id: &[u8; 32]) -> Result<(), VectorStorageError> {
    let file = File::create(path)?;
    let mut writer = BufWriter::new(file);

    let dimensions = u32::try_from(index.dimensions()).map_err(|_| {
        VectorStorageError::InvalidFormat(format!("too many dimensions: {}", index.dimensions()))
    })?;

    write_header(
        &mut writer,
        &Header {
            version: FORMAT_VERSION,
            model_id: *model_id,
            dimensions,
            entry_count: index.len() as u64,
        },
    )?;

    for row in index.rows() {
        for &value in row {
            writer.write_all(&value.to_le_bytes())?;
        }
    }

    // Flush and sync
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;

    Ok(())
}

fn write_header<W: Write>(writer: &mut W, header: &Header) -> Result<(), VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];

    header_bytes[0] = header.version;
    header_bytes[1..33].copy_from_slice(&header.model_id);
    header_bytes[33..37].copy_from_slice(&header.dimensions.to_le_bytes());
    header_bytes[37..45].copy_from_slice(&header.entry_count.to_le_bytes());

    let checksum = crc32fast::hash(&header_bytes[0..45]);
    header_bytes[45..49].copy_from_slice(&checksum.to_le_bytes());

    writer.write_all(&header_bytes)?;
    Ok(())
}

fn read_header<R: Read>(reader: &mut R) -> Result<Header, VectorStorageError> {
    let mut header_bytes = [0u8; HEADER_SIZE];
    reader.read_exact(&mut header_bytes).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            VectorStorageError::InvalidFormat("file shorter than header".to_string())
        }
        _ => e.into(),
    })?;

    let stored_checksum = u32::from_le_bytes(le_array(&header_bytes[45..49]));
    if stored_checksum != crc32fast::hash(&header_bytes[0..45]) {
        return Err(VectorStorageError::ChecksumMismatch);
    }

    let version = header_bytes[0];
    if version != FORMAT_VERSION {
        return Err(VectorStorageError::VersionMismatch(version, FORMAT_VERSION));
    }

    let mut model_id = [0u8; 32];
    model_id.copy_from_slice(&header_bytes[1..33]);

    Ok(Header {
        version,
        model_id,
        dimensions: u32::from_le_bytes(le_array(&header_bytes[33..37])),
        entry_count: u64::from_le_bytes(le_array(&header_bytes[37..45])),
    })
}

fn validate_header(header: &Header, manifest: &IndexManifest) -> Result<(), VectorStorageError> {
    if header.model_id != model_id_hash(&manifest.model) {
        return Err(VectorStorageError::ModelMismatch(manifest.model.clone()));
    }

    if header.dimensions as usize != manifest.dimensions {
        return Err(VectorStorageError::DimensionMismatch {
            expected: manifest.dimensions,
            got: header.dimensions as usize,
        });
    }

    if header.entry_count as usize != manifest.count {
        return Err(VectorStorageError::IdCountMismatch {
            vectors: header.entry_count as usize,
            ids: manifest.count,
        });
    }

    Ok(())
}

fn read_rows<R: Read>(reader: &mut R, len: usize) -> Result<Vec<f32>, VectorStorageError> {
    let mut bytes = vec![0u8; len * 4];
    reader.read_exact(&mut bytes).map_err(|e| match e.kind() {
        std::io::ErrorKind::UnexpectedEof => {
            VectorStorageError::InvalidFormat("vector data is truncated".to_string())
        }
        _ => e.into(),
    })?;

    Ok(bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes(le_array(chunk)))
        .collect())
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Seek, SeekFrom};

    const MODEL: &str = "voyage-large-2";

    fn sample_index() -> FlatIndex {
        let mut index = FlatIndex::new(3);
        index.insert("CDE-1".into(), vec![1.0, 0.0, 0.0]).unwrap();
        index.insert("CDE-2".into(), vec![0.0, 2.0, 0.0]).unwrap();
        index.insert("CDE-3".into(), vec![1.0, 1.0, 1.0]).unwrap();
        index
    }

    #[test]
    fn test_save_and_load() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = IndexStorage::new(tmp.path().join("index"));
        let index = sample_index();

        let manifest = storage.save(&index, MODEL).unwrap();
        assert_eq!(manifest.count, 3);
        assert_eq!(manifest.dimensions, 3);
        assert!(storage.exists());

        let (loaded, loaded_manifest) = storage.load().unwrap();
        assert_eq!(loaded, index);
        assert_eq!(loaded_manifest, manifest);
        assert_eq!(loaded.id(1), Some("CDE-2"));
    }

    #[test]
    fn test_header_size_on_disk() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = IndexStorage::new(tmp.path().join("index"));
        storage.save(&sample_index(), MODEL).unwrap();

        let len = std::fs::metadata(storage.dir().join(VECTORS_FILE)).unwrap().len();
        assert_eq!(len as usize, HEADER_SIZE + 3 * 3 * 4);
    }

    #[test]
    fn test_save_replaces_previous_and_leaves_no_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join("index");
        let storage = IndexStorage::new(dir.clone());

        storage.save(&sample_index(), MODEL).unwrap();

        let mut smaller = FlatIndex::new(2);
        smaller.insert("only".into(), vec![0.0, 1.0]).unwrap();
        storage.save(&smaller, MODEL).unwrap();

        let (loaded, _) = storage.load().unwrap();
        assert_eq!(loaded.ids(), &["only".to_string()]);

        let entries: Vec<_> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(entries, vec!["index".to_string()]);
    }

    #[test]
    fn test_missing_index() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = IndexStorage::new(tmp.path().join("index"));

        assert!(!storage.exists());
        assert!(matches!(storage.load(), Err(VectorStorageError::NotFound(_))));
    }

    #[test]
    fn test_id_count_mismatch_is_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = IndexStorage::new(tmp.path().join("index"));
        storage.save(&sample_index(), MODEL).unwrap();

        std::fs::write(storage.dir().join(IDS_FILE), r#"["CDE-1","CDE-2"]"#).unwrap();

        assert!(matches!(
            storage.load(),
            Err(VectorStorageError::IdCountMismatch { vectors: 3, ids: 2 })
        ));
    }

    #[test]
    fn test_manifest_model_mismatch() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = IndexStorage::new(tmp.path().join("index"));
        let mut manifest = storage.save(&sample_index(), MODEL).unwrap();

        manifest.model = "voyage-3".to_string();
        std::fs::write(
            storage.dir().join(MANIFEST_FILE),
            serde_json::to_vec(&manifest).unwrap(),
        )
        .unwrap();

        assert!(matches!(
            storage.load(),
            Err(VectorStorageError::ModelMismatch(model)) if model == "voyage-3"
        ));
    }

    #[test]
    fn test_checksum_detects_corruption() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = IndexStorage::new(tmp.path().join("index"));
        storage.save(&sample_index(), MODEL).unwrap();

        // Corrupt the file
        let mut file = std::fs::OpenOptions::new()
            .write(true)
            .open(storage.dir().join(VECTORS_FILE))
            .unwrap();
        file.seek(SeekFrom::Start(10)).unwrap();
        file.write_all(&[0xFF]).unwrap();

        assert!(matches!(
            storage.load(),
            Err(VectorStorageError::ChecksumMismatch)
        ));
    }

    #[test]
    fn test_truncated_rows_detected() {
        let tmp = tempfile::tempdir().unwrap();
        let storage = IndexStorage::new(tmp.path().join("index"));
        storage.save(&sample_index(), MODEL).unwrap();

        let path = storage.dir().join(VECTORS_FILE);
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len((HEADER_SIZE + 10) as u64).unwrap();

        assert!(matches!(
            storage.load(),
            Err(VectorStorageError::InvalidFormat(_))
        ));
    }
}
