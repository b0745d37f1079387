//! Configuration management for Docflow
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config/default, config/{APP_ENV}, config/local)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Embedding provider configuration
    #[serde(default)]
    pub embedding: EmbeddingConfig,

    /// Completion (chat) provider configuration
    #[serde(default)]
    pub completion: CompletionConfig,

    /// Token chunking configuration
    #[serde(default)]
    pub chunking: ChunkingConfig,

    /// Retrieval and cutoff configuration
    #[serde(default)]
    pub retrieval: RetrievalConfig,

    /// Content store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Task queue configuration (SQS)
    #[serde(default)]
    pub queue: QueueConfig,

    /// Repository indexing configuration
    #[serde(default)]
    pub indexing: IndexingConfig,

    /// Suggestion generation configuration
    #[serde(default)]
    pub generation: GenerationConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    #[serde(default = "default_database_url")]
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Apply pending migrations at startup
    #[serde(default)]
    pub run_migrations: bool,

    /// Directory holding the SQL migrations
    #[serde(default = "default_migrations_dir")]
    pub migrations_dir: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EmbeddingConfig {
    /// Embedding provider: openai, mock
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for embedding service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Model to use
    #[serde(default = "default_embedding_model")]
    pub model: String,

    /// Embedding dimension
    #[serde(default = "default_embedding_dimension")]
    pub dimension: usize,

    /// Request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff (delay = base * 2^attempt)
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Texts per provider batch call
    #[serde(default = "default_embedding_batch_size")]
    pub batch_size: usize,

    /// Pause between batch calls
    #[serde(default = "default_batch_delay")]
    pub batch_delay_ms: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CompletionConfig {
    /// Completion provider: openai, mock
    #[serde(default = "default_provider")]
    pub provider: String,

    /// API key for the completion service
    pub api_key: Option<String>,

    /// API base URL (for custom endpoints)
    pub api_base: Option<String>,

    /// Chat model to use
    #[serde(default = "default_completion_model")]
    pub model: String,

    /// Request timeout in seconds
    #[serde(default = "default_completion_timeout")]
    pub timeout_secs: u64,

    /// Maximum retries after the first attempt
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay for exponential backoff
    #[serde(default = "default_retry_base_delay")]
    pub retry_base_delay_ms: u64,

    /// Sampling temperature
    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Token limit for operation generation
    #[serde(default = "default_completion_max_tokens")]
    pub max_tokens: u32,

    /// Token limit for file selection
    #[serde(default = "default_selection_max_tokens")]
    pub selection_max_tokens: u32,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ChunkingConfig {
    /// Maximum tokens per chunk
    #[serde(default = "default_chunk_max_tokens")]
    pub max_tokens: usize,

    /// Tokens shared between consecutive chunks
    #[serde(default = "default_chunk_overlap")]
    pub overlap_tokens: usize,

    /// Characters searched backwards when locating a chunk in its source
    #[serde(default = "default_lookback_chars")]
    pub lookback_chars: usize,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RetrievalConfig {
    /// Candidates fetched for file selection
    #[serde(default = "default_candidate_limit")]
    pub candidate_limit: usize,

    /// Similarity floor for the file selection vector search
    #[serde(default)]
    pub candidate_floor: f64,

    /// Absolute floor below which vector matches are discarded
    #[serde(default = "default_noise_floor")]
    pub noise_floor: f64,

    /// Apply the elbow cutoff to file selection candidates
    #[serde(default = "default_true")]
    pub use_elbow_cutoff: bool,

    /// Token budget for candidate file content in the selection prompt
    #[serde(default = "default_context_budget")]
    pub context_token_budget: usize,

    /// Elbow analyzer tuning
    #[serde(default)]
    pub elbow: ElbowConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ElbowConfig {
    /// Safety floor for the cutoff
    #[serde(default = "default_min_docs")]
    pub min_docs: usize,

    /// Scores considered at most
    #[serde(default = "default_max_docs")]
    pub max_docs: usize,

    /// Scores below this are not significant
    #[serde(default = "default_significance_threshold")]
    pub significance_threshold: f64,

    /// Candidates fetched before the cutoff is applied
    #[serde(default = "default_initial_limit")]
    pub initial_limit: usize,

    /// Similarity floor for the initial fetch
    #[serde(default = "default_min_similarity")]
    pub min_similarity: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    /// Content store provider: supabase, memory
    #[serde(default = "default_storage_provider")]
    pub provider: String,

    /// Storage service base URL
    pub url: Option<String>,

    /// Service key for the storage API
    pub api_key: Option<String>,

    /// Bucket holding document content
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Download retries
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Request timeout in seconds
    #[serde(default = "default_provider_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct QueueConfig {
    /// SQS task queue URL
    pub task_queue_url: Option<String>,

    /// Dead letter queue URL
    pub dlq_url: Option<String>,

    /// Maximum messages to receive per poll
    #[serde(default = "default_queue_batch_size")]
    pub batch_size: u32,

    /// Long polling timeout in seconds
    #[serde(default = "default_queue_poll_timeout")]
    pub poll_timeout_secs: u64,

    /// Visibility timeout in seconds
    #[serde(default = "default_visibility_timeout")]
    pub visibility_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct IndexingConfig {
    /// Documentation file extensions
    #[serde(default = "default_extensions")]
    pub allowed_extensions: Vec<String>,

    /// Leading bytes inspected for a null byte
    #[serde(default = "default_sniff_bytes")]
    pub binary_sniff_bytes: usize,

    /// Prefix for the ephemeral clone workspace
    #[serde(default = "default_workspace_prefix")]
    pub workspace_prefix: String,

    /// Git host used to build clone URLs
    #[serde(default = "default_git_host")]
    pub git_host: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GenerationConfig {
    /// Confidence recorded on generated suggestions
    #[serde(default = "default_confidence")]
    pub confidence: f64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level (debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_true")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,

    /// Service name for logs and metrics
    #[serde(default = "default_service_name")]
    pub service_name: String,
}

// Default value functions
fn default_database_url() -> String { "postgres://localhost/docflow".to_string() }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_migrations_dir() -> String { "migrations".to_string() }
fn default_provider() -> String { "openai".to_string() }
fn default_embedding_model() -> String { crate::DEFAULT_EMBEDDING_MODEL.to_string() }
fn default_embedding_dimension() -> usize { crate::DEFAULT_EMBEDDING_DIMENSION }
fn default_provider_timeout() -> u64 { 30 }
fn default_max_retries() -> u32 { 3 }
fn default_retry_base_delay() -> u64 { 1000 }
fn default_embedding_batch_size() -> usize { 100 }
fn default_batch_delay() -> u64 { 100 }
fn default_completion_model() -> String { "gpt-4o-mini".to_string() }
fn default_completion_timeout() -> u64 { 120 }
fn default_temperature() -> f32 { 0.1 }
fn default_completion_max_tokens() -> u32 { 3000 }
fn default_selection_max_tokens() -> u32 { 1000 }
fn default_chunk_max_tokens() -> usize { 1000 }
fn default_chunk_overlap() -> usize { 100 }
fn default_lookback_chars() -> usize { 200 }
fn default_candidate_limit() -> usize { 30 }
fn default_noise_floor() -> f64 { 0.05 }
fn default_context_budget() -> usize { 50_000 }
fn default_min_docs() -> usize { 3 }
fn default_max_docs() -> usize { 50 }
fn default_significance_threshold() -> f64 { 0.15 }
fn default_initial_limit() -> usize { 100 }
fn default_min_similarity() -> f64 { 0.05 }
fn default_storage_provider() -> String { "supabase".to_string() }
fn default_bucket() -> String { "docs".to_string() }
fn default_queue_batch_size() -> u32 { 1 }
fn default_queue_poll_timeout() -> u64 { 20 }
fn default_visibility_timeout() -> u64 { 900 }
fn default_extensions() -> Vec<String> { vec![".md".to_string(), ".mdx".to_string()] }
fn default_sniff_bytes() -> usize { 1024 }
fn default_workspace_prefix() -> String { "docflow_index_".to_string() }
fn default_git_host() -> String { "github.com".to_string() }
fn default_confidence() -> f64 { 0.8 }
fn default_log_level() -> String { "info".to_string() }
fn default_metrics_port() -> u16 { 9090 }
fn default_service_name() -> String { "docflow".to_string() }
fn default_true() -> bool { true }

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))
            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))
            // Load local overrides
            .add_source(File::with_name("config/local").required(false))
            // Load from environment variables with APP__ prefix
            // e.g., APP__EMBEDDING__API_KEY=sk-...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a specific TOML file
    pub fn from_file(path: &str) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Self = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Reject combinations the pipeline cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.chunking.max_tokens == 0 {
            return Err(ConfigError::Message(
                "chunking.max_tokens must be greater than zero".to_string(),
            ));
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            return Err(ConfigError::Message(format!(
                "chunking.overlap_tokens ({}) must be smaller than chunking.max_tokens ({})",
                self.chunking.overlap_tokens, self.chunking.max_tokens
            )));
        }
        let elbow = &self.retrieval.elbow;
        if elbow.min_docs == 0 || elbow.min_docs > elbow.max_docs {
            return Err(ConfigError::Message(format!(
                "retrieval.elbow.min_docs ({}) must be in 1..=max_docs ({})",
                elbow.min_docs, elbow.max_docs
            )));
        }
        if self.embedding.batch_size == 0 {
            return Err(ConfigError::Message(
                "embedding.batch_size must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    /// Get the read database URL (falls back to primary)
    pub fn read_database_url(&self) -> &str {
        self.database.read_url.as_deref().unwrap_or(&self.database.url)
    }
}

impl EmbeddingConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }

    pub fn batch_delay(&self) -> Duration {
        Duration::from_millis(self.batch_delay_ms)
    }
}

impl CompletionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_millis(self.retry_base_delay_ms)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database: DatabaseConfig::default(),
            embedding: EmbeddingConfig::default(),
            completion: CompletionConfig::default(),
            chunking: ChunkingConfig::default(),
            retrieval: RetrievalConfig::default(),
            storage: StorageConfig::default(),
            queue: QueueConfig::default(),
            indexing: IndexingConfig::default(),
            generation: GenerationConfig::default(),
            observability: ObservabilityConfig::default(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            read_url: None,
            max_connections: default_max_connections(),
            min_connections: default_min_connections(),
            connect_timeout_secs: default_connect_timeout(),
            idle_timeout_secs: default_idle_timeout(),
            run_migrations: false,
            migrations_dir: default_migrations_dir(),
        }
    }
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_base: None,
            model: default_embedding_model(),
            dimension: default_embedding_dimension(),
            timeout_secs: default_provider_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            batch_size: default_embedding_batch_size(),
            batch_delay_ms: default_batch_delay(),
        }
    }
}

impl Default for CompletionConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            api_key: None,
            api_base: None,
            model: default_completion_model(),
            timeout_secs: default_completion_timeout(),
            max_retries: default_max_retries(),
            retry_base_delay_ms: default_retry_base_delay(),
            temperature: default_temperature(),
            max_tokens: default_completion_max_tokens(),
            selection_max_tokens: default_selection_max_tokens(),
        }
    }
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_chunk_max_tokens(),
            overlap_tokens: default_chunk_overlap(),
            lookback_chars: default_lookback_chars(),
        }
    }
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            candidate_limit: default_candidate_limit(),
            candidate_floor: 0.0,
            noise_floor: default_noise_floor(),
            use_elbow_cutoff: true,
            context_token_budget: default_context_budget(),
            elbow: ElbowConfig::default(),
        }
    }
}

impl Default for ElbowConfig {
    fn default() -> Self {
        Self {
            min_docs: default_min_docs(),
            max_docs: default_max_docs(),
            significance_threshold: default_significance_threshold(),
            initial_limit: default_initial_limit(),
            min_similarity: default_min_similarity(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            provider: default_storage_provider(),
            url: None,
            api_key: None,
            bucket: default_bucket(),
            max_retries: default_max_retries(),
            timeout_secs: default_provider_timeout(),
        }
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            task_queue_url: None,
            dlq_url: None,
            batch_size: default_queue_batch_size(),
            poll_timeout_secs: default_queue_poll_timeout(),
            visibility_timeout_secs: default_visibility_timeout(),
        }
    }
}

impl Default for IndexingConfig {
    fn default() -> Self {
        Self {
            allowed_extensions: default_extensions(),
            binary_sniff_bytes: default_sniff_bytes(),
            workspace_prefix: default_workspace_prefix(),
            git_host: default_git_host(),
        }
    }
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            confidence: default_confidence(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: true,
            metrics_port: default_metrics_port(),
            service_name: default_service_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.embedding.model, "text-embedding-3-small");
        assert_eq!(config.embedding.dimension, 1536);
        assert_eq!(config.chunking.max_tokens, 1000);
        assert_eq!(config.chunking.overlap_tokens, 100);
        assert_eq!(config.retrieval.elbow.min_docs, 3);
        assert_eq!(config.retrieval.elbow.max_docs, 50);
        assert_eq!(config.storage.bucket, "docs");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_read_database_fallback() {
        let config = AppConfig::default();
        assert_eq!(config.read_database_url(), "postgres://localhost/docflow");
    }

    #[test]
    fn test_rejects_overlap_not_smaller_than_window() {
        let mut config = AppConfig::default();
        config.chunking.overlap_tokens = config.chunking.max_tokens;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rejects_min_docs_above_max_docs() {
        let mut config = AppConfig::default();
        config.retrieval.elbow.min_docs = 60;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_partial_sections_use_defaults() {
        let config: AppConfig = serde_json::from_value(serde_json::json!({
            "embedding": { "provider": "mock" },
            "chunking": { "max_tokens": 500 }
        }))
        .unwrap();
        assert_eq!(config.embedding.provider, "mock");
        assert_eq!(config.embedding.batch_size, 100);
        assert_eq!(config.chunking.max_tokens, 500);
        assert_eq!(config.chunking.lookback_chars, 200);
        assert_eq!(config.indexing.allowed_extensions, vec![".md", ".mdx"]);
    }
}
