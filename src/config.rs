//! Configuration parsing and validation.
//!
//! The live index is configured through a TOML file (default
//! `./config/frag.toml`). Every section is optional; a missing section takes
//! the defaults below, so an empty file is a valid hashing-only setup.
//!
//! ```toml
//! [index]
//! dims = 256
//! wal_path = "./data/commit.jsonl"
//!
//! [embedding]
//! provider = "hashing"
//!
//! [sources.feeds.market]
//! path = "./feeds/ticks.jsonl"
//!
//! [sources.documents.research]
//! root = "./research"
//! ```

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use fintech_rag_core::embedding::EmbeddingStageOptions;
use fintech_rag_core::normalize::NormalizerOptions;
use fintech_rag_core::query::QueryOptions;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub normalizer: NormalizerConfig,
    #[serde(default)]
    pub query: QueryConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub sources: SourcesConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct IndexConfig {
    #[serde(default = "default_dims")]
    pub dims: usize,
    /// Commit log location. `None` keeps the index purely in memory.
    #[serde(default = "default_wal_path")]
    pub wal_path: Option<PathBuf>,
    /// fsync the commit log after every append.
    #[serde(default)]
    pub fsync: bool,
    #[serde(default = "default_compaction_interval_secs")]
    pub compaction_interval_secs: u64,
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            dims: default_dims(),
            wal_path: default_wal_path(),
            fsync: false,
            compaction_interval_secs: default_compaction_interval_secs(),
        }
    }
}

fn default_dims() -> usize {
    256
}
fn default_wal_path() -> Option<PathBuf> {
    Some(PathBuf::from("./data/commit.jsonl"))
}
fn default_compaction_interval_secs() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    /// Must equal `index.dims` when set.
    #[serde(default)]
    pub dims: Option<usize>,
    /// Base URL override (Ollama, OpenAI-compatible gateways).
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            dims: None,
            url: None,
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            timeout_secs: default_timeout_secs(),
            cache_capacity: default_cache_capacity(),
            max_payload_bytes: default_max_payload_bytes(),
        }
    }
}

fn default_provider() -> String {
    "hashing".to_string()
}
fn default_batch_size() -> usize {
    64
}
fn default_max_retries() -> u32 {
    5
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_cache_capacity() -> usize {
    10_000
}
fn default_max_payload_bytes() -> usize {
    32 * 1024
}

impl EmbeddingConfig {
    pub fn is_remote(&self) -> bool {
        matches!(self.provider.as_str(), "openai" | "ollama")
    }

    pub fn stage_options(&self) -> EmbeddingStageOptions {
        EmbeddingStageOptions {
            max_payload_bytes: self.max_payload_bytes,
            cache_capacity: self.cache_capacity,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct NormalizerConfig {
    #[serde(default = "default_chunk_max_tokens")]
    pub chunk_max_tokens: usize,
    #[serde(default = "default_max_embedding_attempts")]
    pub max_embedding_attempts: u32,
    #[serde(default = "default_retry_base_ms")]
    pub retry_base_ms: u64,
    #[serde(default = "default_retry_max_ms")]
    pub retry_max_ms: u64,
}

impl Default for NormalizerConfig {
    fn default() -> Self {
        Self {
            chunk_max_tokens: default_chunk_max_tokens(),
            max_embedding_attempts: default_max_embedding_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

fn default_chunk_max_tokens() -> usize {
    700
}
fn default_max_embedding_attempts() -> u32 {
    3
}
fn default_retry_base_ms() -> u64 {
    1_000
}
fn default_retry_max_ms() -> u64 {
    32_000
}

impl NormalizerConfig {
    pub fn options(&self) -> NormalizerOptions {
        NormalizerOptions {
            chunk_max_tokens: self.chunk_max_tokens,
            max_embedding_attempts: self.max_embedding_attempts,
            retry_base_delay: Duration::from_millis(self.retry_base_ms),
            retry_max_delay: Duration::from_millis(self.retry_max_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct QueryConfig {
    #[serde(default = "default_k")]
    pub default_k: usize,
    #[serde(default = "default_max_k")]
    pub max_k: usize,
    #[serde(default = "default_bound_secs")]
    pub default_bound_secs: u64,
    /// Upper limit on the opt-in freshness wait of a single query.
    #[serde(default = "default_max_wait_ms")]
    pub max_wait_ms: u64,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            default_k: default_k(),
            max_k: default_max_k(),
            default_bound_secs: default_bound_secs(),
            max_wait_ms: default_max_wait_ms(),
        }
    }
}

fn default_k() -> usize {
    10
}
fn default_max_k() -> usize {
    100
}
fn default_bound_secs() -> u64 {
    5
}
fn default_max_wait_ms() -> u64 {
    2_000
}

impl QueryConfig {
    pub fn options(&self) -> QueryOptions {
        QueryOptions {
            default_k: self.default_k,
            max_k: self.max_k,
            default_bound: Duration::from_secs(self.default_bound_secs),
            max_wait: Duration::from_millis(self.max_wait_ms),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    /// `EnvFilter` directive; `RUST_LOG` takes precedence when set.
    #[serde(default = "default_log_filter")]
    pub filter: String,
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

fn default_log_filter() -> String {
    "info".to_string()
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct SourcesConfig {
    #[serde(default)]
    pub feeds: BTreeMap<String, FeedSourceConfig>,
    #[serde(default)]
    pub documents: BTreeMap<String, DocumentSourceConfig>,
}

/// A JSON-lines file of source records, tailed as it grows.
#[derive(Debug, Deserialize, Clone)]
pub struct FeedSourceConfig {
    pub path: PathBuf,
    #[serde(default = "default_feed_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_feed_poll_ms() -> u64 {
    500
}

/// A watched directory of text documents.
#[derive(Debug, Deserialize, Clone)]
pub struct DocumentSourceConfig {
    pub root: PathBuf,
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_documents_poll_ms")]
    pub poll_interval_ms: u64,
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*.md".to_string(), "**/*.txt".to_string()]
}
fn default_documents_poll_ms() -> u64 {
    2_000
}

impl SourcesConfig {
    /// Configured source ids, feeds first.
    pub fn names(&self) -> Vec<String> {
        self.feeds
            .keys()
            .chain(self.documents.keys())
            .cloned()
            .collect()
    }
}

impl Config {
    /// In-memory configuration with default settings and no sources.
    pub fn minimal() -> Self {
        Self {
            index: IndexConfig {
                wal_path: None,
                ..IndexConfig::default()
            },
            ..Config::default()
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

pub fn validate(config: &Config) -> Result<()> {
    if config.index.dims == 0 {
        anyhow::bail!("index.dims must be > 0");
    }

    if config.query.default_k < 1 {
        anyhow::bail!("query.default_k must be >= 1");
    }
    if config.query.max_k < config.query.default_k {
        anyhow::bail!(
            "query.max_k ({}) must be >= query.default_k ({})",
            config.query.max_k,
            config.query.default_k
        );
    }

    if config.normalizer.chunk_max_tokens == 0 {
        anyhow::bail!("normalizer.chunk_max_tokens must be > 0");
    }
    if config.normalizer.max_embedding_attempts == 0 {
        anyhow::bail!("normalizer.max_embedding_attempts must be >= 1");
    }

    match config.embedding.provider.as_str() {
        "hashing" | "openai" | "ollama" => {}
        other => anyhow::bail!(
            "Unknown embedding provider: '{}'. Must be hashing, openai, or ollama.",
            other
        ),
    }
    if config.embedding.is_remote() && config.embedding.model.is_none() {
        anyhow::bail!(
            "embedding.model must be specified when provider is '{}'",
            config.embedding.provider
        );
    }
    if let Some(dims) = config.embedding.dims {
        if dims != config.index.dims {
            anyhow::bail!(
                "embedding.dims ({}) must equal index.dims ({})",
                dims,
                config.index.dims
            );
        }
    }
    if config.embedding.batch_size == 0 {
        anyhow::bail!("embedding.batch_size must be > 0");
    }

    for name in config.sources.names() {
        if name.is_empty() || name.contains('/') {
            anyhow::bail!("source name '{}' must be non-empty and contain no '/'", name);
        }
    }
    for name in config.sources.feeds.keys() {
        if config.sources.documents.contains_key(name) {
            anyhow::bail!("source '{}' is configured as both a feed and a document source", name);
        }
    }

    Ok(())
}
