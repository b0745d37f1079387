//! Similarity retrieval
//!
//! Three retrieval modes, tried in order until one returns matches:
//! - Vector search (cosine similarity over chunk embeddings)
//! - Full-text search (ranked lexical match)
//! - Keyword search (substring match on the leading query words)

mod fallback;
mod fulltext;
mod keyword;
mod vector;

pub use fallback::SimilarityRetriever;
pub use fulltext::FulltextRetriever;
pub use keyword::{extract_keywords, KeywordRetriever};
pub use vector::VectorRetriever;

use docflow_common::db::ChunkMatch;
use docflow_common::errors::Result;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Retrieval mode
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum RetrievalMode {
    /// Embedding similarity
    Vector,
    /// Ranked full-text match
    Fulltext,
    /// Substring match over query keywords
    Keyword,
}

impl RetrievalMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            RetrievalMode::Vector => "vector",
            RetrievalMode::Fulltext => "fulltext",
            RetrievalMode::Keyword => "keyword",
        }
    }
}

/// Search request parameters
#[derive(Debug, Clone)]
pub struct SearchRequest {
    /// Repository scope
    pub repo_id: Uuid,

    /// Query text, used by the lexical modes
    pub query: String,

    /// Query embedding, required for vector search
    pub query_embedding: Option<Vec<f32>>,

    /// Maximum results to return
    pub limit: usize,

    /// Minimum cosine similarity for vector matches
    pub similarity_threshold: f64,
}

impl SearchRequest {
    pub fn new(repo_id: Uuid, query: impl Into<String>) -> Self {
        Self {
            repo_id,
            query: query.into(),
            query_embedding: None,
            limit: 10,
            similarity_threshold: 0.7,
        }
    }

    pub fn with_embedding(mut self, embedding: Vec<f32>) -> Self {
        self.query_embedding = Some(embedding);
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.similarity_threshold = threshold;
        self
    }
}

/// Search response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResponse {
    /// Matches, best first
    pub chunks: Vec<ChunkMatch>,

    /// Mode that produced the matches; `None` when every mode came back empty
    pub mode: Option<RetrievalMode>,

    /// Query processing time in milliseconds
    pub query_time_ms: u64,
}

/// Common trait for all retrievers
#[async_trait::async_trait]
pub trait Retriever: Send + Sync {
    /// Retrieve chunks matching the request
    async fn retrieve(&self, request: &SearchRequest) -> Result<Vec<ChunkMatch>>;

    /// Get the retrieval mode
    fn mode(&self) -> RetrievalMode;
}
