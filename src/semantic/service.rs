//! Query service: embeds a query and ranks indexed CDEs against it.
//!
//! The service owns everything a search needs (embedder, index, id → text
//! lookup) and mutates nothing after construction, so it can be shared
//! behind an `Arc`.

use std::collections::HashMap;

use serde::Serialize;

use super::embeddings::{Embedder, EmbeddingError};
use super::index::{FlatIndex, IndexError};
use super::storage::{IndexManifest, IndexStorage, VectorStorageError};
use crate::cleaner::clean_text;
use crate::paths::DataPaths;
use crate::records::{JsonLines, Record, RecordFileError};

/// Shown when the cleaned records no longer contain an indexed id
pub const MISSING_TEXT: &str = "(text unavailable)";

/// Errors that can occur during query operations.
#[derive(Debug, thiserror::Error)]
pub enum SearchError {
    #[error("Query is empty")]
    EmptyQuery,

    #[error("Number of results must be at least 1")]
    InvalidK,

    #[error("Embedding service unavailable: {0}")]
    Unavailable(#[source] EmbeddingError),

    #[error("Index was built with model {indexed} but {configured} is configured, rebuild the index")]
    ModelMismatch { configured: String, indexed: String },

    #[error("Query vector has {got} dimensions, index has {expected}")]
    DimensionMismatch { expected: usize, got: usize },

    #[error("Storage error: {0}")]
    Storage(#[from] VectorStorageError),

    #[error("Failed to read cleaned records: {0}")]
    Records(#[from] RecordFileError),
}

/// One ranked hit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    /// 1-based
    pub rank: usize,
    pub id: String,
    pub text: String,
    pub score: f32,
}

#[derive(Debug, Clone, Serialize)]
pub struct IndexStatus {
    pub model: String,
    pub dimensions: usize,
    pub count: usize,
    pub built_at: chrono::DateTime<chrono::Utc>,
}

pub struct QueryService {
    embedder: Box<dyn Embedder>,
    index: FlatIndex,
    manifest: IndexManifest,
    texts: HashMap<String, String>,
    max_k: usize,
}

impl QueryService {
    /// Load the index and cleaned records from `paths`.
    pub fn open(
        paths: &DataPaths,
        embedder: Box<dyn Embedder>,
        max_k: usize,
    ) -> Result<Self, SearchError> {
        // fail on a model mismatch before reading the vectors
        let storage = IndexStorage::new(paths.index_dir.clone());
        let manifest = storage.load_manifest()?;
        check_model(embedder.as_ref(), &manifest)?;

        let (index, manifest) = storage.load()?;
        let texts = load_texts(paths)?;

        log::info!(
            "loaded index: {} vectors ({} dimensions, model {})",
            index.len(),
            index.dimensions(),
            manifest.model
        );

        Self::new(embedder, index, manifest, texts, max_k)
    }

    pub fn new(
        embedder: Box<dyn Embedder>,
        index: FlatIndex,
        manifest: IndexManifest,
        texts: HashMap<String, String>,
        max_k: usize,
    ) -> Result<Self, SearchError> {
        check_model(embedder.as_ref(), &manifest)?;

        Ok(Self {
            embedder,
            index,
            manifest,
            texts,
            max_k,
        })
    }

    pub fn status(&self) -> IndexStatus {
        IndexStatus {
            model: self.manifest.model.clone(),
            dimensions: self.index.dimensions(),
            count: self.index.len(),
            built_at: self.manifest.built_at,
        }
    }

    /// Top-`k` CDEs for `query`, best first.
    ///
    /// `k` is clamped to the configured maximum and the index size. The
    /// query is cleaned the same way as indexed text; an empty result is
    /// rejected before the embedder is called.
    pub fn search(&self, query: &str, k: usize) -> Result<Vec<QueryResult>, SearchError> {
        let query = clean_text(query);
        if query.is_empty() {
            return Err(SearchError::EmptyQuery);
        }
        if k == 0 {
            return Err(SearchError::InvalidK);
        }

        let k = k.min(self.max_k).min(self.index.len());
        if k == 0 {
            return Ok(vec![]);
        }

        let vector = self
            .embedder
            .embed_query(&query)
            .map_err(SearchError::Unavailable)?;

        if vector.len() != self.index.dimensions() {
            return Err(SearchError::DimensionMismatch {
                expected: self.index.dimensions(),
                got: vector.len(),
            });
        }

        let hits = self.index.search(&vector, k).map_err(|e| match e {
            IndexError::ZeroNormVector => SearchError::Unavailable(EmbeddingError::Malformed(
                "query embedding has zero norm".to_string(),
            )),
            IndexError::DimensionMismatch { expected, got } => {
                SearchError::DimensionMismatch { expected, got }
            }
            other => SearchError::Unavailable(EmbeddingError::Malformed(other.to_string())),
        })?;

        log::debug!("query {:?}: {} hits", query, hits.len());

        Ok(hits
            .into_iter()
            .enumerate()
            .filter_map(|(rank, hit)| {
                let id = self.index.id(hit.position)?;
                Some(QueryResult {
                    rank: rank + 1,
                    id: id.to_string(),
                    text: self
                        .texts
                        .get(id)
                        .cloned()
                        .unwrap_or_else(|| MISSING_TEXT.to_string()),
                    score: hit.score,
                })
            })
            .collect())
    }
}

fn check_model(embedder: &dyn Embedder, manifest: &IndexManifest) -> Result<(), SearchError> {
    if embedder.model_name() != manifest.model {
        return Err(SearchError::ModelMismatch {
            configured: embedder.model_name().to_string(),
            indexed: manifest.model.clone(),
        });
    }
    Ok(())
}

fn load_texts(paths: &DataPaths) -> Result<HashMap<String, String>, SearchError> {
    if !paths.cleaned_path.exists() {
        log::warn!(
            "{} not found, results will show placeholder text",
            paths.cleaned_path.display()
        );
        return Ok(HashMap::new());
    }

    let mut texts = HashMap::new();
    for record in JsonLines::<Record>::open(&paths.cleaned_path)? {
        let record = record?;
        texts.entry(record.id).or_insert(record.text);
    }
    Ok(texts)
}
