//! Docflow Common Library
//!
//! Shared code for the Docflow crates including:
//! - Configuration management
//! - Error types and handling
//! - Record store entities, trait and implementations
//! - Embedding and completion provider clients
//! - Tokenizer, content store and task queue abstractions
//! - Job tracking and metrics

pub mod completion;
pub mod config;
pub mod db;
pub mod embeddings;
pub mod errors;
pub mod jobs;
pub mod metrics;
pub mod queue;
pub mod storage;
pub mod tokens;

// Re-export commonly used types
pub use completion::{ChatMessage, CompletionClient, CompletionModel};
pub use config::AppConfig;
pub use db::{ChunkMatch, RecordStore};
pub use embeddings::{Embedder, EmbeddingClient};
pub use errors::{AppError, Result};
pub use storage::ContentStore;
pub use tokens::Tokenizer;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default embedding model
pub const DEFAULT_EMBEDDING_MODEL: &str = "text-embedding-3-small";

/// Default embedding dimension
pub const DEFAULT_EMBEDDING_DIMENSION: usize = 1536;

/// Compute the hex-encoded sha256 of a string.
///
/// Used for chunk identity, file content hashes and Merkle roots.
pub fn sha256_hex(content: &str) -> String {
    use sha2::{Digest, Sha256};

    let mut hasher = Sha256::new();
    hasher.update(content.as_bytes());
    hex::encode(hasher.finalize())
}
