//! Indexing orchestrator
//!
//! Drives one repository through fetch, chunking, embedding, persistence and
//! the Merkle update, reporting each stage through the job tracker.
//!
//! ```text
//! Starting ─┬─ Cloning ─ ProcessingFiles ──────────┬─ GeneratingEmbeddings ─ StoringData
//!           └─ FetchingExisting ─ FilesProcessed ──┘
//!   ─ MerkleTree ─ Notifying ─ Completed
//! ```
//!
//! Any stage may end the job in the failed state. The ephemeral clone
//! workspace is removed when the run leaves scope, on success or failure.

use docflow_common::config::IndexingConfig;
use docflow_common::db::models::FileChunkLink;
use docflow_common::db::{NewFile, RecordStore};
use docflow_common::embeddings::EmbeddingClient;
use docflow_common::errors::AppError;
use docflow_common::jobs::{JobMetadata, JobTracker};
use docflow_common::queue::{RepoSource, TaskMessage};
use docflow_common::storage::{object_key, ContentStore};
use docflow_common::{metrics, sha256_hex};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::chunk_store::ContentAddressedChunkStore;
use crate::chunker::{locate_chunks, LineSpan, TokenChunker};
use crate::errors::IngestionError;
use crate::merkle::{root_hash, FileHash, MerkleSynchronizer};
use crate::sources::{collect_documents, read_stored_documents, DiskDocument, SourceFetcher};

const DEFAULT_LOOKBACK_CHARS: usize = 200;

/// Named stage of an indexing run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexStage {
    Starting,
    Cloning,
    ProcessingFiles,
    FetchingExisting,
    FilesProcessed,
    GeneratingEmbeddings,
    StoringData,
    MerkleTree,
    Notifying,
    Completed,
}

impl IndexStage {
    pub fn percent(self) -> u8 {
        match self {
            IndexStage::Starting => 0,
            IndexStage::Cloning => 10,
            IndexStage::FetchingExisting => 20,
            IndexStage::ProcessingFiles => 30,
            IndexStage::FilesProcessed => 40,
            IndexStage::GeneratingEmbeddings => 60,
            IndexStage::StoringData => 80,
            IndexStage::MerkleTree => 90,
            IndexStage::Notifying => 95,
            IndexStage::Completed => 100,
        }
    }

    pub fn step(self) -> &'static str {
        match self {
            IndexStage::Starting => "starting",
            IndexStage::Cloning => "cloning",
            IndexStage::ProcessingFiles => "processing_files",
            IndexStage::FetchingExisting => "fetching_existing_files",
            IndexStage::FilesProcessed => "files_processed",
            IndexStage::GeneratingEmbeddings => "generating_embeddings",
            IndexStage::StoringData => "storing_data",
            IndexStage::MerkleTree => "merkle_tree",
            IndexStage::Notifying => "notifying",
            IndexStage::Completed => "completed",
        }
    }
}

/// One index task
#[derive(Debug, Clone)]
pub struct IndexRequest {
    pub task_id: String,
    pub repo_id: Uuid,
    pub source: RepoSource,
    pub docs_directory: String,
    pub soft_reindex: bool,
}

impl IndexRequest {
    /// Build from a queue message; `None` for other task kinds
    pub fn from_message(message: &TaskMessage) -> Option<Self> {
        match message {
            TaskMessage::Index {
                task_id,
                repo_id,
                source,
                docs_directory,
                soft_reindex,
            } => Some(Self {
                task_id: task_id.clone(),
                repo_id: *repo_id,
                source: source.clone(),
                docs_directory: docs_directory.clone(),
                soft_reindex: *soft_reindex,
            }),
            _ => None,
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct IndexOutcome {
    pub files_processed: usize,
    pub chunks_linked: usize,
    pub chunks_created: usize,
    pub root_hash: String,
    /// Whether the snapshot matched the previously stored root hash
    pub unchanged: bool,
    pub soft_reindex: bool,
}

impl IndexOutcome {
    pub fn message(&self) -> String {
        format!(
            "Indexing completed. {} files processed, {} chunks linked ({} new).",
            self.files_processed, self.chunks_linked, self.chunks_created
        )
    }
}

/// A document with its chunk hashes and line spans
struct ChunkedFile {
    document: DiskDocument,
    content_hash: String,
    chunks: Vec<(String, LineSpan)>,
}

/// Indexing pipeline coordinator
pub struct IndexingOrchestrator {
    records: Arc<dyn RecordStore>,
    content: Arc<dyn ContentStore>,
    chunk_store: ContentAddressedChunkStore,
    chunker: TokenChunker,
    merkle: MerkleSynchronizer,
    fetcher: Arc<dyn SourceFetcher>,
    bucket: String,
    config: IndexingConfig,
    lookback: usize,
}

impl IndexingOrchestrator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        content: Arc<dyn ContentStore>,
        embeddings: EmbeddingClient,
        chunker: TokenChunker,
        fetcher: Arc<dyn SourceFetcher>,
        bucket: impl Into<String>,
        config: IndexingConfig,
    ) -> Self {
        Self {
            chunk_store: ContentAddressedChunkStore::new(records.clone(), embeddings),
            merkle: MerkleSynchronizer::new(records.clone()),
            records,
            content,
            chunker,
            fetcher,
            bucket: bucket.into(),
            config,
            lookback: DEFAULT_LOOKBACK_CHARS,
        }
    }

    /// Lookback used when recovering chunk line spans
    pub fn with_lookback(mut self, lookback: usize) -> Self {
        self.lookback = lookback;
        self
    }

    /// Run one index task to a terminal job state
    #[instrument(
        skip(self, request),
        fields(task_id = %request.task_id, repo_id = %request.repo_id, soft = request.soft_reindex)
    )]
    pub async fn run(&self, request: IndexRequest) -> Result<IndexOutcome, IngestionError> {
        let tracker = JobTracker::new(self.records.clone(), request.task_id.clone());
        tracker.start(JobMetadata::for_repo(request.repo_id)).await;

        let started = Instant::now();
        let result = self.execute(&request, &tracker).await;
        metrics::record_indexing(
            started.elapsed().as_secs_f64(),
            request.soft_reindex,
            result.is_ok(),
        );

        match &result {
            Ok(outcome) => {
                info!(
                    files = outcome.files_processed,
                    chunks = outcome.chunks_linked,
                    unchanged = outcome.unchanged,
                    "Indexing completed"
                );
                tracker
                    .complete(
                        &outcome.message(),
                        JobMetadata {
                            files_processed: Some(outcome.files_processed),
                            unchanged: Some(outcome.unchanged),
                            ..JobMetadata::default()
                        },
                    )
                    .await;
            }
            Err(e) => tracker.fail(e).await,
        }

        result
    }

    async fn report(&self, tracker: &JobTracker, stage: IndexStage) {
        tracker.progress(stage.step(), stage.percent()).await;
    }

    async fn execute(
        &self,
        request: &IndexRequest,
        tracker: &JobTracker,
    ) -> Result<IndexOutcome, IngestionError> {
        self.report(tracker, IndexStage::Starting).await;

        let repo = self
            .records
            .find_repo(request.repo_id)
            .await?
            .ok_or(IngestionError::RepoNotFound(request.repo_id))?;

        let (documents, revision) = if request.soft_reindex {
            (self.stored_documents(request, tracker).await?, None)
        } else {
            let (documents, revision) = self.cloned_documents(request, tracker).await?;
            (documents, Some(revision))
        };

        // Both modes converge here
        self.report(tracker, IndexStage::GeneratingEmbeddings).await;
        let mut chunks_created = 0;
        let mut chunked = Vec::with_capacity(documents.len());
        for document in documents {
            let (file, created) = self.chunk_document(document).await;
            chunks_created += created;
            chunked.push(file);
        }

        self.report(tracker, IndexStage::StoringData).await;
        let mut chunks_linked = 0;
        let mut files_processed = 0;
        for file in &chunked {
            if let Some(linked) = self.store_file(repo.id, file, request.soft_reindex).await? {
                chunks_linked += linked;
                files_processed += 1;
            }
        }

        self.report(tracker, IndexStage::MerkleTree).await;
        let hashes: Vec<FileHash> = chunked
            .iter()
            .map(|f| (f.document.path.clone(), f.content_hash.clone()))
            .collect();
        let unchanged = self.merkle.compare(repo.id, &hashes).await?;
        self.merkle.store_nodes(repo.id, &hashes).await?;
        let root = root_hash(&hashes);
        self.records
            .update_repo_sync(repo.id, &root, revision.as_deref())
            .await?;
        info!(root_hash = %root, unchanged, "Repository sync info updated");

        self.report(tracker, IndexStage::Notifying).await;

        Ok(IndexOutcome {
            files_processed,
            chunks_linked,
            chunks_created,
            root_hash: root,
            unchanged,
            soft_reindex: request.soft_reindex,
        })
    }

    /// Soft mode: re-read what a previous run stored
    async fn stored_documents(
        &self,
        request: &IndexRequest,
        tracker: &JobTracker,
    ) -> Result<Vec<DiskDocument>, IngestionError> {
        self.report(tracker, IndexStage::FetchingExisting).await;

        let files = self.records.list_files(request.repo_id).await?;
        if files.is_empty() {
            return Err(IngestionError::NothingToReindex(request.repo_id));
        }

        let documents = read_stored_documents(self.content.as_ref(), &self.bucket, &files).await;
        info!(stored = files.len(), readable = documents.len(), "Loaded stored files");

        self.report(tracker, IndexStage::FilesProcessed).await;
        Ok(documents)
    }

    /// Hard mode: clone, walk and upload. Returns the documents and the
    /// checkout revision.
    async fn cloned_documents(
        &self,
        request: &IndexRequest,
        tracker: &JobTracker,
    ) -> Result<(Vec<DiskDocument>, String), IngestionError> {
        self.report(tracker, IndexStage::Cloning).await;

        // Removed on drop, including early returns
        let workspace = tempfile::Builder::new()
            .prefix(&self.config.workspace_prefix)
            .tempdir()?;

        let checkout = self
            .fetcher
            .fetch(&request.source, &request.docs_directory, workspace.path())
            .await?;

        self.report(tracker, IndexStage::ProcessingFiles).await;

        let docs_root: PathBuf = checkout.join(request.docs_directory.trim_matches('/'));
        let allowed = self.config.allowed_extensions.clone();
        let sniff = self.config.binary_sniff_bytes;
        let found = tokio::task::spawn_blocking(move || collect_documents(&docs_root, &allowed, sniff))
            .await
            .map_err(|e| AppError::Internal {
                message: format!("document walk panicked: {}", e),
            })??;

        let mut documents = Vec::with_capacity(found.len());
        for document in found {
            let key = object_key(request.repo_id, &document.path);
            match self
                .content
                .put(&self.bucket, &key, document.content.as_bytes().to_vec())
                .await
            {
                Ok(()) => documents.push(document),
                Err(e) => warn!(path = %document.path, error = %e, "Upload failed, skipping file"),
            }
        }

        let revision = self.fetcher.current_revision(&checkout).await?;
        debug!(revision = %revision, workspace = %workspace.path().display(), "Checkout complete");

        Ok((documents, revision))
    }

    /// Chunk and ensure every chunk of one document. Failing chunks are
    /// skipped. Returns the file and how many chunks were newly created.
    async fn chunk_document(&self, document: DiskDocument) -> (ChunkedFile, usize) {
        let texts = self.chunker.split(&document.content);
        let spans = locate_chunks(&document.content, &texts, self.lookback);

        let mut chunks = Vec::with_capacity(texts.len());
        let mut created = 0;
        for (text, span) in texts.iter().zip(spans) {
            match self.chunk_store.ensure_chunk(text).await {
                Ok(ensured) => {
                    if ensured.created {
                        created += 1;
                    }
                    chunks.push((ensured.hash, span));
                }
                Err(e) => warn!(file = %document.path, error = %e, "Skipping chunk"),
            }
        }

        debug!(file = %document.path, chunks = chunks.len(), "Document chunked");
        let file = ChunkedFile {
            content_hash: sha256_hex(&document.content),
            document,
            chunks,
        };
        (file, created)
    }

    /// Persist the file record and its chunk links. Returns the number of
    /// links, or `None` when a soft re-index finds no record to update.
    async fn store_file(
        &self,
        repo_id: Uuid,
        file: &ChunkedFile,
        soft: bool,
    ) -> Result<Option<usize>, IngestionError> {
        let path = &file.document.path;
        let record = if soft {
            match self
                .records
                .update_file_hash(repo_id, path, &file.content_hash)
                .await?
            {
                Some(record) => record,
                None => {
                    warn!(file = %path, "File record vanished during soft re-index");
                    return Ok(None);
                }
            }
        } else {
            self.records
                .upsert_file(NewFile {
                    repo_id,
                    path: path.clone(),
                    content_hash: file.content_hash.clone(),
                    storage_key: object_key(repo_id, path),
                })
                .await?
        };

        for (order, (hash, span)) in file.chunks.iter().enumerate() {
            self.records
                .upsert_file_chunk(FileChunkLink {
                    file_id: record.id,
                    chunk_order: order as i32,
                    chunk_hash: hash.clone(),
                    start_line: span.start_line,
                    end_line: span.end_line,
                })
                .await?;
        }

        let pruned = self
            .records
            .prune_file_chunks(record.id, file.chunks.len() as i32)
            .await?;
        if pruned > 0 {
            debug!(file = %path, pruned, "Pruned stale chunk links");
        }

        Ok(Some(file.chunks.len()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk_store::testing::CountingEmbedder;
    use async_trait::async_trait;
    use docflow_common::db::models::JobStatus;
    use docflow_common::db::MemoryRecordStore;
    use docflow_common::storage::MemoryContentStore;
    use docflow_common::tokens::WordTokenizer;
    use std::path::Path;

    /// Writes a fixed file set into the workspace instead of cloning
    struct StaticFetcher {
        files: Vec<(String, String)>,
    }

    #[async_trait]
    impl SourceFetcher for StaticFetcher {
        async fn fetch(
            &self,
            _source: &RepoSource,
            docs_directory: &str,
            dest: &Path,
        ) -> Result<PathBuf, IngestionError> {
            let checkout = dest.join("repo");
            let docs = checkout.join(docs_directory);
            for (path, content) in &self.files {
                let target = docs.join(path);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, content)?;
            }
            Ok(checkout)
        }

        async fn current_revision(&self, _checkout: &Path) -> Result<String, IngestionError> {
            Ok("abc123".to_string())
        }
    }

    struct Harness {
        records: Arc<MemoryRecordStore>,
        content: Arc<MemoryContentStore>,
        embedder: Arc<CountingEmbedder>,
        orchestrator: IndexingOrchestrator,
        repo_id: Uuid,
    }

    fn harness(files: &[(&str, &str)]) -> Harness {
        let records = Arc::new(MemoryRecordStore::new());
        let content = Arc::new(MemoryContentStore::new());
        let embedder = Arc::new(CountingEmbedder::new(8));
        let tokenizer = Arc::new(WordTokenizer::new());
        let embeddings = EmbeddingClient::new(embedder.clone(), tokenizer.clone());
        let chunker = TokenChunker::new(tokenizer, 50, 5).unwrap();
        let fetcher = Arc::new(StaticFetcher {
            files: files
                .iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
        });
        let repo = records.insert_repo("acme/docs", "main", "docs").unwrap();

        let orchestrator = IndexingOrchestrator::new(
            records.clone(),
            content.clone(),
            embeddings,
            chunker,
            fetcher,
            "docs",
            IndexingConfig::default(),
        );

        Harness {
            records,
            content,
            embedder,
            orchestrator,
            repo_id: repo.id,
        }
    }

    fn request(repo_id: Uuid, soft: bool) -> IndexRequest {
        IndexRequest {
            task_id: Uuid::new_v4().to_string(),
            repo_id,
            source: RepoSource {
                full_name: "acme/docs".to_string(),
                branch: "main".to_string(),
                access_token: None,
            },
            docs_directory: "docs".to_string(),
            soft_reindex: soft,
        }
    }

    async fn dispatch(h: &Harness, soft: bool) -> (IndexRequest, Result<IndexOutcome, IngestionError>) {
        let req = request(h.repo_id, soft);
        h.records
            .create_job(&req.task_id, "index", JobMetadata::for_repo(h.repo_id).to_value())
            .await
            .unwrap();
        let result = h.orchestrator.run(req.clone()).await;
        (req, result)
    }

    #[tokio::test]
    async fn test_identical_files_share_one_chunk() {
        let text = "Install the CLI with cargo install docflow.";
        let h = harness(&[("install.md", text), ("guide/copy.md", text)]);

        let (req, result) = dispatch(&h, false).await;
        let outcome = result.unwrap();

        assert_eq!(outcome.files_processed, 2);
        assert_eq!(outcome.chunks_created, 1);
        assert_eq!(h.records.chunk_count(), 1);
        assert_eq!(h.embedder.calls(), 1);

        let hash = sha256_hex(text);
        for path in ["install.md", "guide/copy.md"] {
            let file = h.records.find_file(h.repo_id, path).await.unwrap().unwrap();
            let links = h.records.links_for(file.id);
            assert_eq!(links.len(), 1);
            assert_eq!(links[0].chunk_hash, hash);
            assert_eq!(file.storage_key, format!("{}/{}", h.repo_id, path));
        }

        // Uploaded for later soft re-indexes
        let stored = h
            .content
            .get("docs", &object_key(h.repo_id, "install.md"))
            .await
            .unwrap();
        assert_eq!(stored.as_deref(), Some(text.as_bytes()));

        let repo = h.records.find_repo(h.repo_id).await.unwrap().unwrap();
        assert_eq!(repo.last_sync_sha.as_deref(), Some("abc123"));
        assert_eq!(repo.root_hash.as_deref(), Some(outcome.root_hash.as_str()));

        let job = h.records.find_job(&req.task_id).await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Completed);
        assert_eq!(job.progress, 1.0);
    }

    #[tokio::test]
    async fn test_soft_reindex_without_files_fails_before_embedding() {
        let h = harness(&[]);

        let (req, result) = dispatch(&h, true).await;
        let err = result.unwrap_err();

        assert!(matches!(err, IngestionError::NothingToReindex(_)));
        assert!(err.to_string().contains("Cannot perform soft re-index"));
        assert_eq!(h.embedder.calls(), 0);

        let job = h.records.find_job(&req.task_id).await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Failed);
        assert!(job.error_msg.unwrap().contains("Cannot perform soft re-index"));
    }

    #[tokio::test]
    async fn test_soft_reindex_reads_stored_content() {
        let h = harness(&[("index.md", "Welcome to the docs.")]);
        let (_, first) = dispatch(&h, false).await;
        let first = first.unwrap();

        let edited = "Welcome to the new docs.";
        h.content
            .put("docs", &object_key(h.repo_id, "index.md"), edited.as_bytes().to_vec())
            .await
            .unwrap();

        let (_, second) = dispatch(&h, true).await;
        let second = second.unwrap();

        assert!(second.soft_reindex);
        assert_eq!(second.files_processed, 1);
        assert_ne!(second.root_hash, first.root_hash);
        assert!(!second.unchanged);

        let file = h.records.find_file(h.repo_id, "index.md").await.unwrap().unwrap();
        assert_eq!(file.content_hash, sha256_hex(edited));

        // Soft mode keeps the previously synced revision
        let repo = h.records.find_repo(h.repo_id).await.unwrap().unwrap();
        assert_eq!(repo.last_sync_sha.as_deref(), Some("abc123"));
    }

    #[tokio::test]
    async fn test_reindex_unchanged_snapshot() {
        let h = harness(&[("a.md", "Alpha."), ("b.md", "Beta.")]);
        let (_, first) = dispatch(&h, false).await;
        assert!(!first.unwrap().unchanged);

        let (_, second) = dispatch(&h, false).await;
        let second = second.unwrap();
        assert!(second.unchanged);
        assert_eq!(second.chunks_created, 0);
    }

    #[tokio::test]
    async fn test_shrinking_file_prunes_links() {
        let long: String = (0..120).map(|i| format!("word{} ", i)).collect();
        let h = harness(&[("long.md", long.as_str())]);
        dispatch(&h, false).await.1.unwrap();

        let file = h.records.find_file(h.repo_id, "long.md").await.unwrap().unwrap();
        assert!(h.records.links_for(file.id).len() > 1);

        h.content
            .put("docs", &object_key(h.repo_id, "long.md"), b"short now".to_vec())
            .await
            .unwrap();
        dispatch(&h, true).await.1.unwrap();

        let links = h.records.links_for(file.id);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].chunk_order, 0);
        assert_eq!(links[0].chunk_hash, sha256_hex("short now"));
    }

    #[tokio::test]
    async fn test_missing_repo_fails_job() {
        let h = harness(&[]);
        let mut req = request(Uuid::new_v4(), false);
        req.task_id = "missing-repo".to_string();
        h.records
            .create_job(&req.task_id, "index", serde_json::json!({}))
            .await
            .unwrap();

        let err = h.orchestrator.run(req).await.unwrap_err();
        assert!(matches!(err, IngestionError::RepoNotFound(_)));
        let job = h.records.find_job("missing-repo").await.unwrap().unwrap();
        assert_eq!(job.job_status(), JobStatus::Failed);
    }

    #[test]
    fn test_stage_percentages() {
        assert_eq!(IndexStage::Cloning.percent(), 10);
        assert_eq!(IndexStage::FetchingExisting.percent(), 20);
        assert_eq!(IndexStage::Notifying.percent(), 95);
        assert_eq!(IndexStage::FilesProcessed.step(), "files_processed");
    }
}
