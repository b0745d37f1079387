//! In-memory [`RecordStore`] for tests and local runs.
//!
//! All tables live in one `RwLock`-guarded state so every call sees a
//! consistent snapshot. Vector search is brute-force cosine similarity;
//! full-text search ranks by the share of query terms present in a chunk.

use crate::db::models::chunk::{format_embedding, parse_embedding};
use crate::db::models::*;
use crate::db::store::{
    ChunkMatch, JobUpdate, NewChunk, NewFile, NewMerkleNode, NewSuggestion, RecordStore, VectorQuery,
};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use uuid::Uuid;

#[derive(Default)]
struct State {
    repos: HashMap<Uuid, Repo>,
    files: HashMap<Uuid, FileRecord>,
    chunks: HashMap<String, Chunk>,
    /// Keyed by (file_id, chunk_order)
    links: BTreeMap<(Uuid, i32), FileChunkLink>,
    merkle_nodes: BTreeMap<(Uuid, String), MerkleNode>,
    suggestions: Vec<Suggestion>,
    decisions: Vec<ReviewDecision>,
    jobs: HashMap<String, Job>,
}

/// In-memory record store
#[derive(Default)]
pub struct MemoryRecordStore {
    state: RwLock<State>,
    vector_search_unavailable: AtomicBool,
}

fn poisoned(_: impl std::fmt::Display) -> AppError {
    AppError::Store {
        message: "record store lock poisoned".to_string(),
    }
}

fn now() -> chrono::DateTime<chrono::FixedOffset> {
    chrono::Utc::now().into()
}

fn cosine_sim(a: &[f32], b: &[f32]) -> f64 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let dot: f32 = a.iter().zip(b.iter()).map(|(x, y)| x * y).sum();
    let mag_a: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let mag_b: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if mag_a < f32::EPSILON || mag_b < f32::EPSILON {
        0.0
    } else {
        (dot / (mag_a * mag_b)) as f64
    }
}

fn terms(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_lowercase)
        .collect()
}

impl MemoryRecordStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a repository record
    pub fn insert_repo(&self, full_name: &str, branch: &str, docs_directory: &str) -> Result<Repo> {
        let repo = Repo {
            id: Uuid::new_v4(),
            full_name: full_name.to_string(),
            branch: branch.to_string(),
            docs_directory: docs_directory.to_string(),
            root_hash: None,
            last_sync_sha: None,
            last_synced_at: None,
            created_at: now(),
        };
        self.state
            .write()
            .map_err(poisoned)?
            .repos
            .insert(repo.id, repo.clone());
        Ok(repo)
    }

    /// Make `vector_search` fail with a store error
    pub fn set_vector_search_unavailable(&self, unavailable: bool) {
        self.vector_search_unavailable
            .store(unavailable, Ordering::SeqCst);
    }

    pub fn chunk_count(&self) -> usize {
        self.state.read().map(|s| s.chunks.len()).unwrap_or(0)
    }

    pub fn chunk(&self, hash: &str) -> Option<Chunk> {
        self.state.read().ok()?.chunks.get(hash).cloned()
    }

    /// Links of one file in chunk order
    pub fn links_for(&self, file_id: Uuid) -> Vec<FileChunkLink> {
        self.state
            .read()
            .map(|s| {
                s.links
                    .values()
                    .filter(|l| l.file_id == file_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn merkle_nodes(&self, repo_id: Uuid) -> Vec<MerkleNode> {
        self.state
            .read()
            .map(|s| {
                s.merkle_nodes
                    .values()
                    .filter(|n| n.repo_id == repo_id)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    pub fn suggestions(&self) -> Vec<Suggestion> {
        self.state
            .read()
            .map(|s| s.suggestions.clone())
            .unwrap_or_default()
    }

    pub fn review_decisions(&self) -> Vec<ReviewDecision> {
        self.state
            .read()
            .map(|s| s.decisions.clone())
            .unwrap_or_default()
    }

    fn matches_where<F>(&self, repo_id: Uuid, limit: usize, mut score: F) -> Result<Vec<ChunkMatch>>
    where
        F: FnMut(&Chunk) -> Option<f64>,
    {
        let state = self.state.read().map_err(poisoned)?;
        let mut matches = Vec::new();

        for link in state.links.values() {
            let Some(file) = state.files.get(&link.file_id) else {
                continue;
            };
            if file.repo_id != repo_id {
                continue;
            }
            let Some(chunk) = state.chunks.get(&link.chunk_hash) else {
                continue;
            };
            if let Some(similarity) = score(chunk) {
                matches.push(ChunkMatch {
                    chunk_hash: chunk.hash.clone(),
                    content: chunk.content.clone(),
                    similarity,
                    file_path: file.path.clone(),
                    chunk_order: link.chunk_order,
                    start_line: link.start_line,
                    end_line: link.end_line,
                });
            }
        }

        matches.sort_by(|a, b| {
            b.similarity
                .partial_cmp(&a.similarity)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.file_path.cmp(&b.file_path))
                .then_with(|| a.chunk_order.cmp(&b.chunk_order))
        });
        matches.truncate(limit);
        Ok(matches)
    }
}

#[async_trait]
impl RecordStore for MemoryRecordStore {
    async fn ping(&self) -> Result<()> {
        self.state.read().map_err(poisoned).map(|_| ())
    }

    async fn find_repo(&self, repo_id: Uuid) -> Result<Option<Repo>> {
        Ok(self.state.read().map_err(poisoned)?.repos.get(&repo_id).cloned())
    }

    async fn update_repo_sync(
        &self,
        repo_id: Uuid,
        root_hash: &str,
        last_sync_sha: Option<&str>,
    ) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        let repo = state
            .repos
            .get_mut(&repo_id)
            .ok_or_else(|| AppError::not_found("repository", repo_id))?;
        repo.root_hash = Some(root_hash.to_string());
        if let Some(sha) = last_sync_sha {
            repo.last_sync_sha = Some(sha.to_string());
        }
        repo.last_synced_at = Some(now());
        Ok(())
    }

    async fn upsert_file(&self, file: NewFile) -> Result<FileRecord> {
        let mut state = self.state.write().map_err(poisoned)?;
        let timestamp = now();

        if let Some(existing) = state
            .files
            .values_mut()
            .find(|f| f.repo_id == file.repo_id && f.path == file.path)
        {
            existing.content_hash = file.content_hash;
            existing.storage_key = file.storage_key;
            existing.has_uncommitted_changes = false;
            existing.updated_at = timestamp;
            return Ok(existing.clone());
        }

        let record = FileRecord {
            id: Uuid::new_v4(),
            repo_id: file.repo_id,
            path: file.path,
            content_hash: file.content_hash,
            storage_key: file.storage_key,
            has_uncommitted_changes: false,
            created_at: timestamp,
            updated_at: timestamp,
        };
        state.files.insert(record.id, record.clone());
        Ok(record)
    }

    async fn update_file_hash(
        &self,
        repo_id: Uuid,
        path: &str,
        content_hash: &str,
    ) -> Result<Option<FileRecord>> {
        let mut state = self.state.write().map_err(poisoned)?;
        Ok(state
            .files
            .values_mut()
            .find(|f| f.repo_id == repo_id && f.path == path)
            .map(|f| {
                f.content_hash = content_hash.to_string();
                f.updated_at = now();
                f.clone()
            }))
    }

    async fn find_file(&self, repo_id: Uuid, path: &str) -> Result<Option<FileRecord>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .files
            .values()
            .find(|f| f.repo_id == repo_id && f.path == path)
            .cloned())
    }

    async fn list_files(&self, repo_id: Uuid) -> Result<Vec<FileRecord>> {
        let state = self.state.read().map_err(poisoned)?;
        let mut files: Vec<FileRecord> = state
            .files
            .values()
            .filter(|f| f.repo_id == repo_id)
            .cloned()
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn chunk_exists(&self, hash: &str) -> Result<bool> {
        Ok(self.state.read().map_err(poisoned)?.chunks.contains_key(hash))
    }

    async fn insert_chunk_if_absent(&self, chunk: NewChunk) -> Result<bool> {
        let mut state = self.state.write().map_err(poisoned)?;
        if state.chunks.contains_key(&chunk.hash) {
            return Ok(false);
        }
        state.chunks.insert(
            chunk.hash.clone(),
            Chunk {
                hash: chunk.hash,
                content: chunk.content,
                embedding: Some(format_embedding(&chunk.embedding)),
                token_count: chunk.token_count,
                created_at: now(),
            },
        );
        Ok(true)
    }

    async fn upsert_file_chunk(&self, link: FileChunkLink) -> Result<()> {
        self.state
            .write()
            .map_err(poisoned)?
            .links
            .insert((link.file_id, link.chunk_order), link);
        Ok(())
    }

    async fn prune_file_chunks(&self, file_id: Uuid, keep: i32) -> Result<u64> {
        let mut state = self.state.write().map_err(poisoned)?;
        let before = state.links.len();
        state
            .links
            .retain(|(id, order), _| *id != file_id || *order < keep);
        Ok((before - state.links.len()) as u64)
    }

    async fn file_chunk_contents(&self, file_id: Uuid) -> Result<Vec<String>> {
        let state = self.state.read().map_err(poisoned)?;
        Ok(state
            .links
            .range((file_id, i32::MIN)..=(file_id, i32::MAX))
            .filter_map(|(_, link)| state.chunks.get(&link.chunk_hash))
            .map(|chunk| chunk.content.clone())
            .collect())
    }

    async fn vector_search(&self, query: VectorQuery<'_>) -> Result<Vec<ChunkMatch>> {
        if self.vector_search_unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Store {
                message: "vector search unavailable".to_string(),
            });
        }

        self.matches_where(query.repo_id, query.limit, |chunk| {
            let embedding = chunk.embedding.as_deref().and_then(parse_embedding)?;
            // Zero-vector fallbacks have no direction to compare
            if embedding.iter().all(|x| *x == 0.0) {
                return None;
            }
            let similarity = cosine_sim(query.embedding, &embedding);
            (similarity >= query.threshold).then_some(similarity)
        })
    }

    async fn fulltext_search(&self, repo_id: Uuid, query: &str, limit: usize) -> Result<Vec<ChunkMatch>> {
        let query_terms = terms(query);
        if query_terms.is_empty() {
            return Ok(Vec::new());
        }

        self.matches_where(repo_id, limit, |chunk| {
            let chunk_terms = terms(&chunk.content);
            let hits = query_terms
                .iter()
                .filter(|t| chunk_terms.contains(t))
                .count();
            (hits > 0).then(|| hits as f64 / query_terms.len() as f64)
        })
    }

    async fn keyword_search(
        &self,
        repo_id: Uuid,
        keywords: &[String],
        limit: usize,
    ) -> Result<Vec<ChunkMatch>> {
        let lowered: Vec<String> = keywords.iter().map(|k| k.to_lowercase()).collect();
        if lowered.is_empty() {
            return Ok(Vec::new());
        }

        self.matches_where(repo_id, limit, |chunk| {
            let content = chunk.content.to_lowercase();
            lowered
                .iter()
                .any(|k| content.contains(k.as_str()))
                .then_some(0.0)
        })
    }

    async fn upsert_merkle_node(&self, node: NewMerkleNode) -> Result<()> {
        let mut state = self.state.write().map_err(poisoned)?;
        state.merkle_nodes.insert(
            (node.repo_id, node.path.clone()),
            MerkleNode {
                repo_id: node.repo_id,
                path: node.path,
                hash: node.hash,
                node_type: "file".to_string(),
                parent_path: node.parent_path,
                updated_at: now(),
            },
        );
        Ok(())
    }

    async fn create_suggestion(
        &self,
        suggestion: NewSuggestion,
        reviewer_id: Uuid,
    ) -> Result<(Suggestion, ReviewDecision)> {
        let mut state = self.state.write().map_err(poisoned)?;
        let timestamp = now();

        let created = Suggestion {
            id: Uuid::new_v4(),
            file_id: suggestion.file_id,
            operations_json: suggestion.operations_json,
            patch_unified_diff: suggestion.patch_unified_diff,
            status: ReviewStatus::Pending.into(),
            confidence: suggestion.confidence,
            model_used: suggestion.model_used,
            created_at: timestamp,
        };
        let decision = ReviewDecision {
            id: Uuid::new_v4(),
            suggestion_id: created.id,
            reviewer_id,
            decision: ReviewStatus::Pending.into(),
            created_at: timestamp,
        };

        state.suggestions.push(created.clone());
        state.decisions.push(decision.clone());
        Ok((created, decision))
    }

    async fn create_job(&self, task_id: &str, kind: &str, metadata: serde_json::Value) -> Result<Job> {
        let timestamp = now();
        let job = Job {
            task_id: task_id.to_string(),
            kind: kind.to_string(),
            status: JobStatus::Pending.into(),
            progress: 0.0,
            metadata,
            error_msg: None,
            created_at: timestamp,
            updated_at: timestamp,
        };
        self.state
            .write()
            .map_err(poisoned)?
            .jobs
            .insert(job.task_id.clone(), job.clone());
        Ok(job)
    }

    async fn update_job(&self, task_id: &str, update: JobUpdate) -> Result<Job> {
        let mut state = self.state.write().map_err(poisoned)?;
        let job = state.jobs.get_mut(task_id).ok_or_else(|| AppError::JobNotFound {
            id: task_id.to_string(),
        })?;

        if let Some(status) = update.status {
            job.status = status.into();
        }
        if let Some(progress) = update.progress {
            job.progress = progress.clamp(0.0, 1.0);
        }
        if let Some(metadata) = update.metadata {
            job.metadata = metadata;
        }
        if let Some(error_msg) = update.error_msg {
            job.error_msg = Some(error_msg);
        }
        job.updated_at = now();
        Ok(job.clone())
    }

    async fn find_job(&self, task_id: &str) -> Result<Option<Job>> {
        Ok(self.state.read().map_err(poisoned)?.jobs.get(task_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn seeded_chunk(store: &MemoryRecordStore, file_id: Uuid, order: i32, content: &str, embedding: Vec<f32>) {
        let hash = crate::sha256_hex(content);
        store
            .insert_chunk_if_absent(NewChunk {
                hash: hash.clone(),
                content: content.to_string(),
                embedding,
                token_count: 1,
            })
            .await
            .unwrap();
        store
            .upsert_file_chunk(FileChunkLink {
                file_id,
                chunk_order: order,
                chunk_hash: hash,
                start_line: 1,
                end_line: 1,
            })
            .await
            .unwrap();
    }

    async fn file(store: &MemoryRecordStore, repo_id: Uuid, path: &str) -> FileRecord {
        store
            .upsert_file(NewFile {
                repo_id,
                path: path.to_string(),
                content_hash: "h".to_string(),
                storage_key: format!("{}/{}", repo_id, path),
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_upsert_file_is_keyed_by_path() {
        let store = MemoryRecordStore::new();
        let repo = store.insert_repo("acme/docs", "main", "docs").unwrap();
        let first = file(&store, repo.id, "a.md").await;
        let second = file(&store, repo.id, "a.md").await;
        assert_eq!(first.id, second.id);
        assert_eq!(store.list_files(repo.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_insert_chunk_if_absent_is_idempotent() {
        let store = MemoryRecordStore::new();
        let chunk = NewChunk {
            hash: "abc".to_string(),
            content: "text".to_string(),
            embedding: vec![1.0, 0.0],
            token_count: 1,
        };
        assert!(store.insert_chunk_if_absent(chunk.clone()).await.unwrap());
        assert!(!store.insert_chunk_if_absent(chunk).await.unwrap());
        assert_eq!(store.chunk_count(), 1);
    }

    #[tokio::test]
    async fn test_vector_search_ranks_by_cosine() {
        let store = MemoryRecordStore::new();
        let repo = store.insert_repo("acme/docs", "main", "docs").unwrap();
        let f = file(&store, repo.id, "a.md").await;
        seeded_chunk(&store, f.id, 0, "close", vec![1.0, 0.1]).await;
        seeded_chunk(&store, f.id, 1, "far", vec![0.0, 1.0]).await;
        seeded_chunk(&store, f.id, 2, "zero", vec![0.0, 0.0]).await;

        let results = store
            .vector_search(VectorQuery {
                embedding: &[1.0, 0.0],
                repo_id: repo.id,
                limit: 10,
                threshold: 0.0,
            })
            .await
            .unwrap();

        assert_eq!(results[0].content, "close");
        assert!(results[0].similarity > results[1].similarity);
    }

    #[tokio::test]
    async fn test_vector_search_skips_zero_vectors() {
        let store = MemoryRecordStore::new();
        let repo = store.insert_repo("acme/docs", "main", "docs").unwrap();
        let f = file(&store, repo.id, "a.md").await;
        seeded_chunk(&store, f.id, 0, "embedded", vec![0.0, 1.0]).await;
        seeded_chunk(&store, f.id, 1, "fallback", vec![0.0, 0.0]).await;

        let results = store
            .vector_search(VectorQuery {
                embedding: &[1.0, 0.0],
                repo_id: repo.id,
                limit: 10,
                threshold: 0.0,
            })
            .await
            .unwrap();

        assert_eq!(results.len(), 1);
        assert_eq!(results[0].content, "embedded");
        assert!(!results[0].similarity.is_nan());
    }

    #[tokio::test]
    async fn test_search_is_scoped_to_repo() {
        let store = MemoryRecordStore::new();
        let repo = store.insert_repo("acme/docs", "main", "docs").unwrap();
        let other = store.insert_repo("acme/other", "main", "docs").unwrap();
        let f = file(&store, other.id, "a.md").await;
        seeded_chunk(&store, f.id, 0, "install guide", vec![1.0]).await;

        let hits = store.fulltext_search(repo.id, "install", 10).await.unwrap();
        assert!(hits.is_empty());
        let hits = store.fulltext_search(other.id, "install", 10).await.unwrap();
        assert_eq!(hits.len(), 1);
    }

    #[tokio::test]
    async fn test_keyword_search_is_case_insensitive() {
        let store = MemoryRecordStore::new();
        let repo = store.insert_repo("acme/docs", "main", "docs").unwrap();
        let f = file(&store, repo.id, "a.md").await;
        seeded_chunk(&store, f.id, 0, "Configure the Webhook", vec![1.0]).await;

        let hits = store
            .keyword_search(repo.id, &["webhook".to_string()], 5)
            .await
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].similarity, 0.0);
    }

    #[tokio::test]
    async fn test_prune_and_contents_in_order() {
        let store = MemoryRecordStore::new();
        let repo = store.insert_repo("acme/docs", "main", "docs").unwrap();
        let f = file(&store, repo.id, "a.md").await;
        seeded_chunk(&store, f.id, 1, "second", vec![1.0]).await;
        seeded_chunk(&store, f.id, 0, "first", vec![1.0]).await;
        seeded_chunk(&store, f.id, 2, "stale", vec![1.0]).await;

        assert_eq!(store.prune_file_chunks(f.id, 2).await.unwrap(), 1);
        assert_eq!(
            store.file_chunk_contents(f.id).await.unwrap(),
            vec!["first".to_string(), "second".to_string()]
        );
    }

    #[tokio::test]
    async fn test_suggestion_has_pending_decision() {
        let store = MemoryRecordStore::new();
        let reviewer = Uuid::new_v4();
        let (suggestion, decision) = store
            .create_suggestion(
                NewSuggestion {
                    file_id: Uuid::new_v4(),
                    operations_json: Some(serde_json::json!([])),
                    patch_unified_diff: None,
                    confidence: 0.8,
                    model_used: "m".to_string(),
                },
                reviewer,
            )
            .await
            .unwrap();
        assert_eq!(decision.suggestion_id, suggestion.id);
        assert_eq!(suggestion.review_status(), ReviewStatus::Pending);
        assert_eq!(store.review_decisions().len(), 1);
    }

    #[tokio::test]
    async fn test_update_missing_job() {
        let store = MemoryRecordStore::new();
        let err = store.update_job("nope", JobUpdate::default()).await.unwrap_err();
        assert!(matches!(err, AppError::JobNotFound { .. }));
    }

    #[tokio::test]
    async fn test_repo_sync_keeps_previous_sha() {
        let store = MemoryRecordStore::new();
        let repo = store.insert_repo("acme/docs", "main", "docs").unwrap();
        store.update_repo_sync(repo.id, "root1", Some("sha1")).await.unwrap();
        store.update_repo_sync(repo.id, "root2", None).await.unwrap();
        let repo = store.find_repo(repo.id).await.unwrap().unwrap();
        assert_eq!(repo.root_hash.as_deref(), Some("root2"));
        assert_eq!(repo.last_sync_sha.as_deref(), Some("sha1"));
    }
}
