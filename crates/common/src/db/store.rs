//! Record store interface
//!
//! Every structured-record access in the pipeline goes through
//! [`RecordStore`]. Postgres ([`super::PgRecordStore`]) is the production
//! backend; [`super::MemoryRecordStore`] backs tests.
//!
//! # Operations
//!
//! | Area | Methods |
//! |------|---------|
//! | Repos | `find_repo`, `update_repo_sync` |
//! | Files | `upsert_file`, `update_file_hash`, `find_file`, `list_files` |
//! | Chunks | `chunk_exists`, `insert_chunk_if_absent` |
//! | Links | `upsert_file_chunk`, `prune_file_chunks`, `file_chunk_contents` |
//! | Search | `vector_search`, `fulltext_search`, `keyword_search` |
//! | Merkle | `upsert_merkle_node` |
//! | Suggestions | `create_suggestion` |
//! | Jobs | `create_job`, `update_job`, `find_job` |

use crate::db::models::{FileChunkLink, FileRecord, Job, JobStatus, Repo, ReviewDecision, Suggestion};
use crate::errors::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A chunk matched by a search, located inside a file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChunkMatch {
    pub chunk_hash: String,
    pub content: String,
    /// Cosine similarity for vector matches, lexical rank otherwise
    pub similarity: f64,
    pub file_path: String,
    pub chunk_order: i32,
    pub start_line: i32,
    pub end_line: i32,
}

/// Vector similarity query
#[derive(Debug, Clone)]
pub struct VectorQuery<'a> {
    pub embedding: &'a [f32],
    pub repo_id: Uuid,
    pub limit: usize,
    /// Minimum cosine similarity
    pub threshold: f64,
}

/// Fields written when a file is upserted by (repo_id, path)
#[derive(Debug, Clone)]
pub struct NewFile {
    pub repo_id: Uuid,
    pub path: String,
    pub content_hash: String,
    pub storage_key: String,
}

/// Fields of a new content-addressed chunk
#[derive(Debug, Clone)]
pub struct NewChunk {
    pub hash: String,
    pub content: String,
    pub embedding: Vec<f32>,
    pub token_count: i32,
}

/// Fields of a new Merkle node
#[derive(Debug, Clone)]
pub struct NewMerkleNode {
    pub repo_id: Uuid,
    pub path: String,
    pub hash: String,
    pub parent_path: Option<String>,
}

/// Suggestion payload
#[derive(Debug, Clone)]
pub struct NewSuggestion {
    pub file_id: Uuid,
    pub operations_json: Option<serde_json::Value>,
    pub patch_unified_diff: Option<String>,
    pub confidence: f64,
    pub model_used: String,
}

/// Partial job update; `None` leaves a field unchanged
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    /// Fraction complete, 0..=1
    pub progress: Option<f64>,
    pub metadata: Option<serde_json::Value>,
    pub error_msg: Option<String>,
}

/// Abstract structured-record store
#[async_trait]
pub trait RecordStore: Send + Sync {
    /// Check connectivity
    async fn ping(&self) -> Result<()>;

    // Repos

    async fn find_repo(&self, repo_id: Uuid) -> Result<Option<Repo>>;

    /// Record the snapshot fingerprint and synced revision
    async fn update_repo_sync(
        &self,
        repo_id: Uuid,
        root_hash: &str,
        last_sync_sha: Option<&str>,
    ) -> Result<()>;

    // Files

    /// Insert or update a file by (repo_id, path); clears uncommitted changes
    async fn upsert_file(&self, file: NewFile) -> Result<FileRecord>;

    /// Update the content hash of an existing file
    async fn update_file_hash(
        &self,
        repo_id: Uuid,
        path: &str,
        content_hash: &str,
    ) -> Result<Option<FileRecord>>;

    async fn find_file(&self, repo_id: Uuid, path: &str) -> Result<Option<FileRecord>>;

    async fn list_files(&self, repo_id: Uuid) -> Result<Vec<FileRecord>>;

    // Chunks

    async fn chunk_exists(&self, hash: &str) -> Result<bool>;

    /// Atomic insert-if-absent. Returns whether a row was written.
    async fn insert_chunk_if_absent(&self, chunk: NewChunk) -> Result<bool>;

    // File/chunk links

    /// Insert or update the link at (file_id, chunk_order)
    async fn upsert_file_chunk(&self, link: FileChunkLink) -> Result<()>;

    /// Delete links with chunk_order >= keep. Returns rows removed.
    async fn prune_file_chunks(&self, file_id: Uuid, keep: i32) -> Result<u64>;

    /// Chunk contents of a file in chunk order
    async fn file_chunk_contents(&self, file_id: Uuid) -> Result<Vec<String>>;

    // Search

    /// Cosine similarity search, descending
    async fn vector_search(&self, query: VectorQuery<'_>) -> Result<Vec<ChunkMatch>>;

    /// Ranked lexical search over chunk text
    async fn fulltext_search(&self, repo_id: Uuid, query: &str, limit: usize) -> Result<Vec<ChunkMatch>>;

    /// Case-insensitive substring search over any keyword, similarity 0
    async fn keyword_search(
        &self,
        repo_id: Uuid,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<ChunkMatch>>;

    // Merkle

    async fn upsert_merkle_node(&self, node: NewMerkleNode) -> Result<()>;

    // Suggestions

    /// Persist a suggestion and its pending review decision atomically
    async fn create_suggestion(
        &self,
        suggestion: NewSuggestion,
        reviewer_id: Uuid,
    ) -> Result<(Suggestion, ReviewDecision)>;

    // Jobs

    async fn create_job(&self, task_id: &str, kind: &str, metadata: serde_json::Value) -> Result<Job>;

    async fn update_job(&self, task_id: &str, update: JobUpdate) -> Result<Job>;

    async fn find_job(&self, task_id: &str) -> Result<Option<Job>>;
}
