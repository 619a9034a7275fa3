//! Record types and the JSON-lines files that carry them between stages.
//!
//! `cleaned.jsonl` holds one [`Record`] per line, `embeddings.jsonl` one
//! [`EmbeddedRecord`] per line. Both are read line by line so a large
//! embeddings file never has to be held twice in memory.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::marker::PhantomData;
use std::path::Path;

use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::storage;

/// One cleaned CDE: an identifier and its normalized text.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub id: String,
    pub text: String,
}

impl Record {
    pub fn text_hash(&self) -> String {
        text_hash(&self.text)
    }
}

/// Hex SHA256 of a cleaned text. Ties a stored vector to the text it was
/// computed from.
pub fn text_hash(text: &str) -> String {
    let digest = Sha256::digest(text.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

/// A record id paired with the vector the embedding model produced for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddedRecord {
    pub id: String,
    /// [`text_hash`] of the embedded text; empty in files written before
    /// hashes were recorded, which makes those entries stale
    #[serde(default)]
    pub text_hash: String,
    pub vector: Vec<f32>,
}

/// Sidecar of `embeddings.jsonl` naming the model that produced its vectors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddingsMeta {
    pub model: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl EmbeddingsMeta {
    pub fn new(model: impl Into<String>) -> Self {
        Self {
            model: model.into(),
            created_at: chrono::Utc::now(),
        }
    }

    /// `None` when the sidecar does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>, RecordFileError> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        serde_json::from_slice(&data)
            .map(Some)
            .map_err(|source| RecordFileError::Json { line: 1, source })
    }

    pub fn save(&self, path: &Path) -> Result<(), RecordFileError> {
        let data = serde_json::to_vec_pretty(self)
            .map_err(|source| RecordFileError::Json { line: 1, source })?;
        storage::write_atomic(path, &data)?;
        Ok(())
    }

    pub fn clear(path: &Path) -> Result<(), RecordFileError> {
        match std::fs::remove_file(path) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(err.into()),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RecordFileError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed record on line {line}: {source}")]
    Json {
        line: usize,
        source: serde_json::Error,
    },
}

/// Streaming reader over a JSON-lines file.
pub struct JsonLines<T> {
    reader: BufReader<File>,
    line: usize,
    buf: String,
    _marker: PhantomData<T>,
}

impl<T: DeserializeOwned> JsonLines<T> {
    pub fn open(path: &Path) -> Result<Self, RecordFileError> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            line: 0,
            buf: String::new(),
            _marker: PhantomData,
        })
    }
}

impl<T: DeserializeOwned> Iterator for JsonLines<T> {
    type Item = Result<T, RecordFileError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {
                    self.line += 1;
                    let trimmed = self.buf.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    return Some(serde_json::from_str(trimmed).map_err(|source| {
                        RecordFileError::Json {
                            line: self.line,
                            source,
                        }
                    }));
                }
                Err(err) => return Some(Err(err.into())),
            }
        }
    }
}

/// Write `items` as JSON lines, replacing `path` atomically.
pub fn write_jsonl<'a, T, I>(path: &Path, items: I) -> Result<usize, RecordFileError>
where
    T: Serialize + 'a,
    I: IntoIterator<Item = &'a T>,
{
    let temp = storage::create_temp_beside(path)?;
    let mut writer = BufWriter::new(temp);
    let mut count = 0;

    for item in items {
        serde_json::to_writer(&mut writer, item).map_err(|source| RecordFileError::Json {
            line: count + 1,
            source,
        })?;
        writer.write_all(b"\n")?;
        count += 1;
    }

    writer.flush()?;
    let temp = writer.into_inner().map_err(|e| e.into_error())?;
    storage::commit(temp, path)?;

    Ok(count)
}

/// Append embedded records to `path`, creating it when missing.
///
/// Used by resumable embedding runs: each finished batch is appended and
/// synced before the next API call.
pub fn append_embedded(path: &Path, records: &[EmbeddedRecord]) -> Result<(), RecordFileError> {
    if records.is_empty() {
        return Ok(());
    }

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);

    for (idx, record) in records.iter().enumerate() {
        serde_json::to_writer(&mut writer, record).map_err(|source| RecordFileError::Json {
            line: idx + 1,
            source,
        })?;
        writer.write_all(b"\n")?;
    }

    writer.flush()?;
    writer.get_ref().sync_all()?;
    Ok(())
}

/// Rewrite an embeddings file keeping only the records `keep` accepts.
/// The file is replaced only when something was dropped. Returns the number
/// of records dropped.
pub fn retain_embedded<F>(path: &Path, mut keep: F) -> Result<usize, RecordFileError>
where
    F: FnMut(&EmbeddedRecord) -> bool,
{
    let temp = storage::create_temp_beside(path)?;
    let mut writer = BufWriter::new(temp);
    let mut dropped = 0;

    for (idx, record) in JsonLines::<EmbeddedRecord>::open(path)?.enumerate() {
        let record = record?;
        if !keep(&record) {
            dropped += 1;
            continue;
        }
        serde_json::to_writer(&mut writer, &record).map_err(|source| RecordFileError::Json {
            line: idx + 1,
            source,
        })?;
        writer.write_all(b"\n")?;
    }

    writer.flush()?;
    let temp = writer.into_inner().map_err(|e| e.into_error())?;
    if dropped > 0 {
        storage::commit(temp, path)?;
    }

    Ok(dropped)
}

/// Load every cleaned record from `path`.
pub fn read_records(path: &Path) -> Result<Vec<Record>, RecordFileError> {
    JsonLines::<Record>::open(path)?.collect()
}

/// Text hash of every id in an embeddings file. A later line for the same id
/// overrides an earlier one. A missing file yields an empty map.
pub fn embedded_hashes(path: &Path) -> Result<HashMap<String, String>, RecordFileError> {
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let mut hashes = HashMap::new();
    for record in JsonLines::<EmbeddedRecord>::open(path)? {
        let record = record?;
        hashes.insert(record.id, record.text_hash);
    }
    Ok(hashes)
}

/// Repair the end of an append-only JSON-lines file after an interrupted
/// write. An unparsable last line is cut off; a complete last line missing
/// its newline gets one. Returns the number of bytes removed.
pub fn discard_torn_tail(path: &Path) -> Result<u64, RecordFileError> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(err) => return Err(err.into()),
    };

    let len = file.metadata()?.len();
    let tail_start = last_line_start(&mut file, len)?;
    if tail_start == len {
        return Ok(0);
    }

    let mut tail = Vec::new();
    file.seek(SeekFrom::Start(tail_start))?;
    file.read_to_end(&mut tail)?;

    if tail.iter().all(u8::is_ascii_whitespace) {
        return Ok(0);
    }

    if serde_json::from_slice::<serde_json::Value>(&tail).is_ok() {
        file.seek(SeekFrom::End(0))?;
        file.write_all(b"\n")?;
        file.sync_all()?;
        return Ok(0);
    }

    file.set_len(tail_start)?;
    file.sync_all()?;
    Ok(len - tail_start)
}

/// Offset just past the last newline, or 0 when there is none.
fn last_line_start(file: &mut File, len: u64) -> io::Result<u64> {
    const CHUNK: u64 = 64 * 1024;

    let mut buf = vec![0u8; CHUNK as usize];
    let mut end = len;
    while end > 0 {
        let start = end.saturating_sub(CHUNK);
        let chunk = &mut buf[..(end - start) as usize];
        file.seek(SeekFrom::Start(start))?;
        file.read_exact(chunk)?;
        if let Some(pos) = chunk.iter().rposition(|&b| b == b'\n') {
            return Ok(start + pos as u64 + 1);
        }
        end = start;
    }
    Ok(0)
}
