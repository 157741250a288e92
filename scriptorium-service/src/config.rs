//! Service configuration.
//!
//! Loaded once at startup from `config.toml` plus `SCRIPTORIUM__`-prefixed
//! environment variables. Every knob has a serde default so a bare deploy
//! starts with sane values.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Deserialize)]
pub struct StaticConfig {
    #[serde(default = "default_server")]
    pub server: ServerConfig,

    #[serde(default = "default_storage")]
    pub storage: StorageConfig,

    #[serde(default = "default_embedding")]
    pub embedding: EmbeddingConfig,

    #[serde(default = "default_chunking")]
    pub chunking: ChunkingConfig,

    #[serde(default = "default_pipeline")]
    pub pipeline: PipelineConfig,
}

/// HTTP server configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

/// Storage configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Embedding provider configuration (Ollama-compatible API)
#[derive(Debug, Clone, Deserialize)]
pub struct EmbeddingConfig {
    #[serde(default = "default_embedding_url")]
    pub base_url: String,

    #[serde(default = "default_embedding_model")]
    pub model: String,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

/// Chunking configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ChunkingConfig {
    /// Upper bound on chunk size in characters.
    #[serde(default = "default_max_chunk_chars")]
    pub max_chunk_chars: usize,

    /// Paragraphs are packed together until at least this many characters.
    #[serde(default = "default_min_chunk_chars")]
    pub min_chunk_chars: usize,

    /// Documents above this size are rejected rather than chunked.
    #[serde(default = "default_max_document_chars")]
    pub max_document_chars: usize,
}

/// Batch embedding pipeline configuration.
///
/// All knobs the background processor consumes; the processor itself
/// hardcodes nothing.
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Upper bound on documents handled by a manual sweep.
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,

    /// Concurrent embedding-provider calls within a pass.
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Seconds between processing cycles.
    #[serde(default = "default_processing_interval_secs")]
    pub processing_interval_secs: u64,

    /// Documents pulled from the retry queue per cycle.
    #[serde(default = "default_retry_batch_size")]
    pub retry_batch_size: usize,

    /// Consecutive failed cycles before the circuit breaker opens.
    #[serde(default = "default_breaker_failure_threshold")]
    pub breaker_failure_threshold: u32,

    /// Seconds the circuit breaker stays open once tripped.
    #[serde(default = "default_breaker_open_secs")]
    pub breaker_open_secs: u64,

    /// Whether the retry queue is drained at the start of each cycle.
    #[serde(default = "default_process_retry_queue")]
    pub process_retry_queue: bool,

    /// Per-item debug logging in the passes.
    #[serde(default)]
    pub verbose_logging: bool,

    /// Retry budget assigned to newly registered documents.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

impl PipelineConfig {
    pub fn processing_interval(&self) -> Duration {
        Duration::from_secs(self.processing_interval_secs.max(1))
    }

    pub fn breaker_open_duration(&self) -> Duration {
        Duration::from_secs(self.breaker_open_secs.max(1))
    }
}

// ==================== Default Value Functions ====================

pub(crate) fn default_server() -> ServerConfig {
    ServerConfig {
        host: default_host(),
        port: default_port(),
    }
}

pub(crate) fn default_host() -> String {
    "0.0.0.0".to_string()
}

pub(crate) fn default_port() -> u16 {
    8080
}

pub(crate) fn default_storage() -> StorageConfig {
    StorageConfig {
        data_dir: default_data_dir(),
    }
}

pub(crate) fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

pub(crate) fn default_embedding() -> EmbeddingConfig {
    EmbeddingConfig {
        base_url: default_embedding_url(),
        model: default_embedding_model(),
        request_timeout_secs: default_request_timeout_secs(),
    }
}

pub(crate) fn default_embedding_url() -> String {
    "http://localhost:11434".to_string()
}

pub(crate) fn default_embedding_model() -> String {
    "nomic-embed-text".to_string()
}

pub(crate) fn default_request_timeout_secs() -> u64 {
    60
}

pub(crate) fn default_chunking() -> ChunkingConfig {
    ChunkingConfig {
        max_chunk_chars: default_max_chunk_chars(),
        min_chunk_chars: default_min_chunk_chars(),
        max_document_chars: default_max_document_chars(),
    }
}

pub(crate) fn default_max_chunk_chars() -> usize {
    1200
}

pub(crate) fn default_min_chunk_chars() -> usize {
    200
}

pub(crate) fn default_max_document_chars() -> usize {
    2_000_000
}

pub(crate) fn default_pipeline() -> PipelineConfig {
    PipelineConfig {
        max_batch_size: default_max_batch_size(),
        max_concurrency: default_max_concurrency(),
        processing_interval_secs: default_processing_interval_secs(),
        retry_batch_size: default_retry_batch_size(),
        breaker_failure_threshold: default_breaker_failure_threshold(),
        breaker_open_secs: default_breaker_open_secs(),
        process_retry_queue: default_process_retry_queue(),
        verbose_logging: false,
        default_max_retries: default_max_retries(),
    }
}

pub(crate) fn default_max_batch_size() -> usize {
    32
}

pub(crate) fn default_max_concurrency() -> usize {
    4
}

pub(crate) fn default_processing_interval_secs() -> u64 {
    30
}

pub(crate) fn default_retry_batch_size() -> usize {
    16
}

pub(crate) fn default_breaker_failure_threshold() -> u32 {
    5
}

pub(crate) fn default_breaker_open_secs() -> u64 {
    300
}

pub(crate) fn default_process_retry_queue() -> bool {
    true
}

pub(crate) fn default_max_retries() -> u32 {
    5
}
