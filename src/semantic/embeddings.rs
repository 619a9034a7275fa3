//! Embedding providers.
//!
//! - `Embedder`: the text → vector boundary used by batch embedding and
//!   query search
//! - `VoyageEmbedder` (see `voyage.rs`): Voyage AI HTTP API
//! - `LocalEmbedder`: fastembed model, behind the `local-embeddings` feature

use std::path::Path;

use serde::Serialize;

use crate::config::{EmbeddingConfig, EmbeddingProvider};

/// Environment variable holding the Voyage AI key
pub const API_KEY_ENV: &str = "VOYAGE_API_KEY";

/// Whether the texts are corpus documents or search queries. Voyage tunes
/// the embedding for retrieval based on this.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum InputType {
    Document,
    Query,
}

/// Vectors returned for one embedding call, in input order.
#[derive(Debug, Clone, Default)]
pub struct Embeddings {
    pub vectors: Vec<Vec<f32>>,
    /// Token usage when the provider reports it
    pub total_tokens: Option<u64>,
}

/// Error type for embedding operations
#[derive(Debug, thiserror::Error)]
pub enum EmbeddingError {
    #[error("rate limited by embedding API: {0}")]
    RateLimited(String),

    #[error("embedding request timed out: {0}")]
    Timeout(String),

    #[error("embedding quota exceeded: {0}")]
    QuotaExceeded(String),

    #[error("embedding API rejected credentials: {0}")]
    Unauthorized(String),

    #[error("embedding API server error ({status}): {body}")]
    Server { status: u16, body: String },

    #[error("malformed embedding response: {0}")]
    Malformed(String),

    #[error("embedding request failed: {0}")]
    Request(String),

    #[error("VOYAGE_API_KEY is not set")]
    MissingApiKey,

    #[error("Model initialization failed: {0}")]
    InitFailed(String),

    #[error("Invalid model name: {0}")]
    InvalidModel(String),
}

impl EmbeddingError {
    /// Short machine-readable kind, used in failure reports.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::RateLimited(_) => "rate_limited",
            Self::Timeout(_) => "timeout",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::Unauthorized(_) => "unauthorized",
            Self::Server { .. } => "server",
            Self::Malformed(_) => "malformed",
            Self::Request(_) => "request",
            Self::MissingApiKey => "missing_api_key",
            Self::InitFailed(_) => "init_failed",
            Self::InvalidModel(_) => "invalid_model",
        }
    }

    /// Errors after which further calls in the same run cannot succeed.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::QuotaExceeded(_)
                | Self::Unauthorized(_)
                | Self::MissingApiKey
                | Self::InitFailed(_)
                | Self::InvalidModel(_)
        )
    }
}

/// Text → vector boundary.
///
/// Implementations return exactly one vector per input text, in order.
pub trait Embedder: Send + Sync {
    /// Model identifier recorded alongside the index
    fn model_name(&self) -> &str;

    fn embed(&self, texts: &[String], input_type: InputType) -> Result<Embeddings, EmbeddingError>;

    /// Embed a single query string.
    fn embed_query(&self, text: &str) -> Result<Vec<f32>, EmbeddingError> {
        let embeddings = self.embed(&[text.to_string()], InputType::Query)?;
        embeddings
            .vectors
            .into_iter()
            .next()
            .ok_or_else(|| EmbeddingError::Malformed("No embedding returned".to_string()))
    }
}

/// Build the embedder selected in the config. `cache_dir` holds downloaded
/// local models.
pub fn create_embedder(
    config: &EmbeddingConfig,
    cache_dir: &Path,
) -> Result<Box<dyn Embedder>, EmbeddingError> {
    match config.provider {
        EmbeddingProvider::Voyage => {
            let api_key = std::env::var(API_KEY_ENV)
                .ok()
                .map(|key| key.trim().to_string())
                .filter(|key| !key.is_empty())
                .ok_or(EmbeddingError::MissingApiKey)?;

            let embedder = super::voyage::VoyageEmbedder::new(
                &api_key,
                &config.api_base_url,
                &config.model,
                config.request_timeout(),
                config.truncation,
            )?;
            Ok(Box::new(embedder))
        }

        #[cfg(feature = "local-embeddings")]
        EmbeddingProvider::Local => Ok(Box::new(local::LocalEmbedder::new(
            &config.model,
            cache_dir.to_path_buf(),
        )?)),

        #[cfg(not(feature = "local-embeddings"))]
        EmbeddingProvider::Local => {
            let _ = cache_dir;
            Err(EmbeddingError::InitFailed(
                "built without the local-embeddings feature".to_string(),
            ))
        }
    }
}

/// Compute SHA256 hash of the model name for storage identification.
pub fn model_id_hash(model_name: &str) -> [u8; 32] {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(model_name.as_bytes());
    hasher.finalize().into()
}

#[cfg(feature = "local-embeddings")]
pub mod local {
    use std::path::PathBuf;
    use std::sync::Mutex;

    use fastembed::{InitOptions, TextEmbedding};

    use super::{Embedder, EmbeddingError, Embeddings, InputType};

    /// Wrapper around fastembed's TextEmbedding model.
    /// Uses a Mutex because fastembed's embed() requires &mut self.
    pub struct LocalEmbedder {
        model: Mutex<TextEmbedding>,
        model_name: String,
    }

    impl LocalEmbedder {
        /// Models are cached in the `models/` subdirectory of `cache_dir` and
        /// downloaded on first use.
        pub fn new(model_name: &str, cache_dir: PathBuf) -> Result<Self, EmbeddingError> {
            let model_enum = Self::parse_model_name(model_name)?;

            let models_dir = cache_dir.join("models");
            std::fs::create_dir_all(&models_dir).map_err(|e| {
                EmbeddingError::InitFailed(format!("Failed to create models directory: {}", e))
            })?;

            let options = InitOptions::new(model_enum)
                .with_cache_dir(models_dir)
                .with_show_download_progress(true);

            let model = TextEmbedding::try_new(options)
                .map_err(|e| EmbeddingError::InitFailed(e.to_string()))?;

            Ok(Self {
                model: Mutex::new(model),
                model_name: model_name.to_string(),
            })
        }

        fn parse_model_name(name: &str) -> Result<fastembed::EmbeddingModel, EmbeddingError> {
            match name.to_lowercase().as_str() {
                "all-minilm-l6-v2" => Ok(fastembed::EmbeddingModel::AllMiniLML6V2),
                "bge-small-en-v1.5" => Ok(fastembed::EmbeddingModel::BGESmallENV15),
                "bge-base-en-v1.5" => Ok(fastembed::EmbeddingModel::BGEBaseENV15),
                "bge-large-en-v1.5" => Ok(fastembed::EmbeddingModel::BGELargeENV15),
                _ => Err(EmbeddingError::InvalidModel(format!(
                    "Unknown local model: {}. Supported models: all-MiniLM-L6-v2, bge-small-en-v1.5, bge-base-en-v1.5, bge-large-en-v1.5",
                    name
                ))),
            }
        }
    }

    impl Embedder for LocalEmbedder {
        fn model_name(&self) -> &str {
            &self.model_name
        }

        // Local models embed queries and documents the same way.
        fn embed(&self, texts: &[String], _input_type: InputType) -> Result<Embeddings, EmbeddingError> {
            if texts.is_empty() {
                return Ok(Embeddings::default());
            }

            let mut model = self.model.lock().map_err(|e| {
                EmbeddingError::Request(format!("Failed to acquire model lock: {}", e))
            })?;

            let vectors = model
                .embed(texts.to_vec(), None)
                .map_err(|e| EmbeddingError::Request(e.to_string()))?;

            Ok(Embeddings {
                vectors,
                total_tokens: None,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(EmbeddingError::QuotaExceeded("x".into()).is_fatal());
        assert!(EmbeddingError::Unauthorized("x".into()).is_fatal());
        assert!(EmbeddingError::MissingApiKey.is_fatal());
        assert!(!EmbeddingError::RateLimited("x".into()).is_fatal());
        assert!(!EmbeddingError::Timeout("x".into()).is_fatal());
        assert!(!EmbeddingError::Malformed("x".into()).is_fatal());
        assert!(!EmbeddingError::Server {
            status: 503,
            body: String::new()
        }
        .is_fatal());
    }

    #[test]
    fn test_kinds_are_distinct() {
        let kinds = [
            EmbeddingError::RateLimited(String::new()).kind(),
            EmbeddingError::Timeout(String::new()).kind(),
            EmbeddingError::QuotaExceeded(String::new()).kind(),
            EmbeddingError::Malformed(String::new()).kind(),
        ];
        let unique: std::collections::HashSet<_> = kinds.iter().collect();
        assert_eq!(unique.len(), kinds.len());
    }

    #[test]
    fn test_model_id_hash_consistency() {
        assert_eq!(model_id_hash("voyage-large-2"), model_id_hash("voyage-large-2"));
        assert_ne!(model_id_hash("voyage-large-2"), model_id_hash("voyage-3"));
    }

    #[test]
    fn test_input_type_serializes_lowercase() {
        assert_eq!(serde_json::to_string(&InputType::Document).unwrap(), "\"document\"");
        assert_eq!(serde_json::to_string(&InputType::Query).unwrap(), "\"query\"");
    }
}
