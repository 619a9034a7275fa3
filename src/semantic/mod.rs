//! Embedding, indexing and similarity search for CDE question texts.
//!
//! # Architecture
//!
//! - `embeddings`: the `Embedder` trait and provider selection
//! - `voyage`: Voyage AI HTTP client
//! - `batch`: batched, rate-limited embedding with failure reporting
//! - `index`: in-memory flat index with inner-product search
//! - `storage`: index directory persistence (vectors.bin, ids.json, manifest.json)
//! - `service`: query service used by the web UI, CLI and evaluation

pub mod batch;
pub mod embeddings;
pub mod index;
pub mod service;
pub mod storage;
mod voyage;

#[cfg(test)]
pub(crate) mod testing;

pub use batch::{BatchEmbedder, EmbedReport, FailureReport, RateLimiter};
pub use embeddings::{create_embedder, Embedder};
pub use index::IndexBuilder;
pub use service::{IndexStatus, QueryResult, QueryService, SearchError};
pub use storage::{IndexManifest, IndexStorage};
