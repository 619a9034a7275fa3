use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context};
use serde::{Deserialize, Serialize};

use crate::storage;

const CONFIG_FILE: &str = "config.yaml";

/// Default Voyage AI model (must match between indexing and querying)
const DEFAULT_MODEL: &str = "voyage-large-2";
const DEFAULT_API_BASE_URL: &str = "https://api.voyageai.com/v1";
/// Voyage accepts at most 128 inputs per request
const DEFAULT_BATCH_SIZE: usize = 128;
/// Free tier ceiling: 3 requests per minute, i.e. one call every 20 seconds
const DEFAULT_REQUESTS_PER_MINUTE: u32 = 3;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 60;

const DEFAULT_TEXT_COLUMN: &str = "Question Texts";

const DEFAULT_K: usize = 10;
const MAX_K: usize = 50;

const DEFAULT_LISTEN: &str = "0.0.0.0:8080";

const DEFAULT_EVALUATION_K: usize = 5;
const DEFAULT_EVALUATION_OUTPUT: &str = "test_results.txt";

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EmbeddingProvider {
    /// Voyage AI HTTP API
    Voyage,
    /// Local fastembed model (requires the `local-embeddings` feature)
    Local,
}

/// Where the raw catalog comes from and which columns matter.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct InputConfig {
    /// CSV export of the CDE catalog. Relative paths resolve against the
    /// current directory.
    #[serde(default)]
    pub csv_path: Option<PathBuf>,

    /// Identifier column. When unset, the data row number is used.
    #[serde(default)]
    pub id_column: Option<String>,

    /// Free-text column that gets embedded
    #[serde(default = "default_text_column")]
    pub text_column: String,
}

impl Default for InputConfig {
    fn default() -> Self {
        Self {
            csv_path: None,
            id_column: None,
            text_column: DEFAULT_TEXT_COLUMN.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: EmbeddingProvider,

    /// Model name; recorded in the index manifest and checked at query time
    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_api_base_url")]
    pub api_base_url: String,

    /// Inputs per embedding request
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// External rate ceiling. Batches are spaced `60 / requests_per_minute`
    /// seconds apart.
    #[serde(default = "default_requests_per_minute")]
    pub requests_per_minute: u32,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Let the API truncate inputs that exceed the model context
    #[serde(default = "default_truncation")]
    pub truncation: bool,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            api_base_url: default_api_base_url(),
            batch_size: DEFAULT_BATCH_SIZE,
            requests_per_minute: DEFAULT_REQUESTS_PER_MINUTE,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
            truncation: true,
        }
    }
}

impl EmbeddingConfig {
    /// Minimum time between the starts of two consecutive API calls.
    pub fn min_interval(&self) -> Duration {
        if self.requests_per_minute == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(60.0 / self.requests_per_minute as f64)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SearchConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,

    /// Upper bound for a single request's result count
    #[serde(default = "max_k")]
    pub max_k: usize,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            default_k: DEFAULT_K,
            max_k: MAX_K,
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WebConfig {
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            listen: DEFAULT_LISTEN.to_string(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EvaluationConfig {
    #[serde(default = "default_evaluation_queries")]
    pub queries: Vec<String>,

    #[serde(default = "default_evaluation_k")]
    pub k: usize,

    #[serde(default = "default_evaluation_output")]
    pub output: PathBuf,
}

impl Default for EvaluationConfig {
    fn default() -> Self {
        Self {
            queries: default_evaluation_queries(),
            k: DEFAULT_EVALUATION_K,
            output: default_evaluation_output(),
        }
    }
}

fn default_text_column() -> String {
    DEFAULT_TEXT_COLUMN.to_string()
}

fn default_provider() -> EmbeddingProvider {
    EmbeddingProvider::Voyage
}

fn default_model() -> String {
    DEFAULT_MODEL.to_string()
}

fn default_api_base_url() -> String {
    DEFAULT_API_BASE_URL.to_string()
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_requests_per_minute() -> u32 {
    DEFAULT_REQUESTS_PER_MINUTE
}

fn default_request_timeout_secs() -> u64 {
    DEFAULT_REQUEST_TIMEOUT_SECS
}

fn default_truncation() -> bool {
    true
}

fn default_k() -> usize {
    DEFAULT_K
}

fn max_k() -> usize {
    MAX_K
}

fn default_listen() -> String {
    DEFAULT_LISTEN.to_string()
}

fn default_evaluation_queries() -> Vec<String> {
    [
        "patient reported symptoms of high blood pressure",
        "assessment scale for patient pain level",
        "demographic information including age and gender",
        "measurement of body weight",
        "history of diabetes mellitus",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

fn default_evaluation_k() -> usize {
    DEFAULT_EVALUATION_K
}

fn default_evaluation_output() -> PathBuf {
    PathBuf::from(DEFAULT_EVALUATION_OUTPUT)
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub input: InputConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub search: SearchConfig,
    #[serde(default)]
    pub web: WebConfig,
    #[serde(default)]
    pub evaluation: EvaluationConfig,

    #[serde(skip_serializing, skip_deserializing)]
    base_path: PathBuf,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input.text_column.trim().is_empty() {
            bail!("input.text_column cannot be empty");
        }

        let emb = &self.embedding;
        if emb.model.trim().is_empty() {
            bail!("embedding.model cannot be empty");
        }
        if emb.batch_size == 0 {
            bail!("embedding.batch_size must be greater than 0");
        }
        if emb.requests_per_minute == 0 {
            bail!("embedding.requests_per_minute must be greater than 0");
        }
        if emb.request_timeout_secs == 0 {
            bail!("embedding.request_timeout_secs must be greater than 0");
        }

        let search = &self.search;
        if search.max_k == 0 {
            bail!("search.max_k must be greater than 0");
        }
        if search.default_k == 0 || search.default_k > search.max_k {
            bail!(
                "search.default_k must be between 1 and search.max_k ({}), got {}",
                search.max_k,
                search.default_k
            );
        }

        if self.evaluation.k == 0 {
            bail!("evaluation.k must be greater than 0");
        }

        Ok(())
    }

    /// Load `config.yaml` from `base_path`, creating it with defaults when
    /// missing.
    pub fn load_with(base_path: &Path) -> anyhow::Result<Self> {
        let path = base_path.join(CONFIG_FILE);

        // create new if does not exist
        if !path.exists() {
            log::info!("Creating default config at {}", path.display());
            let config_str = serde_yml::to_string(&Self::default())?;
            storage::write_atomic(&path, config_str.as_bytes())
                .with_context(|| format!("failed to write {}", path.display()))?;
        }

        let config_str = std::fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let mut config: Self = serde_yml::from_str(&config_str)
            .with_context(|| format!("config is malformed: {}", path.display()))?;

        config.base_path = base_path.to_path_buf();

        config.validate()?;

        // resave in case config version needs an upgrade
        if config_str != serde_yml::to_string(&config)? {
            config.save()?;
        }

        Ok(config)
    }

    pub fn save(&self) -> anyhow::Result<()> {
        let config_str = serde_yml::to_string(&self)?;
        storage::write_atomic(&self.base_path.join(CONFIG_FILE), config_str.as_bytes())?;
        Ok(())
    }
}
