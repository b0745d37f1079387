//! Two-pass edit generation
//!
//! ```text
//! Start ─ FileSelection ─┬─ FileSelectionDone ─ OperationGeneration ─ Complete
//!                        └─ FileSelectionEmpty
//! ```
//!
//! Pass 1 retrieves candidate chunks, loads the full content of every
//! candidate file and asks the model which files need to change. Pass 2
//! asks for operations one file at a time against the content cached in
//! pass 1, so both passes see the same text.

use async_trait::async_trait;
use docflow_common::completion::{ChatMessage, CompletionClient, CompletionParams};
use docflow_common::config::{AppConfig, RetrievalConfig};
use docflow_common::db::{ChunkMatch, RecordStore};
use docflow_common::embeddings::EmbeddingClient;
use docflow_common::errors::{AppError, Result};
use docflow_common::storage::{decode_utf8_lossy, object_key, ContentStore};
use docflow_search::{
    CutoffMethod, ElbowDiagnostics, ElbowRetrieval, RetrievalMode, SearchRequest, SimilarityRetriever,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use crate::diff::DIFF_HEADER;
use crate::operations::{parse_operations, strip_code_fence, Operation};
use crate::prompts::{
    candidate_block, file_operations_prompt, file_selection_prompt, CandidateFile,
    FILE_SELECTION_SYSTEM_PROMPT, OPERATIONS_SYSTEM_PROMPT,
};

/// Full file content by path, as shown to the model in pass 1
pub type ContentCache = BTreeMap<String, String>;

/// Generation state for one query
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationState {
    Start,
    FileSelection,
    FileSelectionDone,
    FileSelectionEmpty,
    OperationGeneration,
    Complete,
}

/// Receives state transitions as generation proceeds
#[async_trait]
pub trait StateObserver: Send + Sync {
    async fn on_state(&self, state: GenerationState);
}

/// Observer that ignores every transition
pub struct NoopObserver;

#[async_trait]
impl StateObserver for NoopObserver {
    async fn on_state(&self, _state: GenerationState) {}
}

/// Result of pass 1
#[derive(Debug, Clone, Default)]
pub struct FileSelection {
    /// Files the model chose, all present in `contents`
    pub files: Vec<String>,
    pub contents: ContentCache,
    /// Chunks that survived the noise floor and cutoff
    pub candidates: usize,
    pub elbow: Option<ElbowDiagnostics>,
}

/// Result of a full two-pass run
#[derive(Debug, Clone)]
pub struct Generation {
    /// `Complete` or `FileSelectionEmpty`
    pub state: GenerationState,
    pub files: Vec<String>,
    pub operations: Vec<Operation>,
    /// Pass-2 answers given as unified diffs, one per file
    pub diffs: Vec<String>,
}

/// Pass-2 edits across the selected files
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FileEdits {
    pub operations: Vec<Operation>,
    pub diffs: Vec<String>,
}

/// Pass-2 answer for one file
enum FileAnswer {
    Operations(Vec<Operation>),
    Diff(String),
}

/// Generator tuning
#[derive(Debug, Clone)]
pub struct GeneratorConfig {
    pub retrieval: RetrievalConfig,
    pub selection: CompletionParams,
    pub operations: CompletionParams,
    pub bucket: String,
}

impl GeneratorConfig {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            retrieval: config.retrieval.clone(),
            selection: CompletionParams {
                temperature: config.completion.temperature,
                max_tokens: config.completion.selection_max_tokens,
            },
            operations: CompletionParams {
                temperature: config.completion.temperature,
                max_tokens: config.completion.max_tokens,
            },
            bucket: config.storage.bucket.clone(),
        }
    }
}

impl Default for GeneratorConfig {
    fn default() -> Self {
        Self::from_app_config(&AppConfig::default())
    }
}

/// Parse the pass-1 answer: a JSON array of paths
pub fn parse_file_selection(raw: &str) -> Result<Vec<String>> {
    let cleaned = strip_code_fence(raw);
    serde_json::from_str::<Vec<String>>(&cleaned).map_err(|e| AppError::Parse {
        message: format!("File selection is not a JSON array of paths: {}", e),
    })
}

fn normalize_path(path: &str) -> String {
    path.trim().trim_start_matches("./").trim_start_matches('/').to_string()
}

/// Two-pass generator
pub struct TwoPassGenerator {
    records: Arc<dyn RecordStore>,
    content: Arc<dyn ContentStore>,
    embeddings: EmbeddingClient,
    completion: CompletionClient,
    retriever: Arc<SimilarityRetriever>,
    elbow: ElbowRetrieval,
    config: GeneratorConfig,
}

impl TwoPassGenerator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        content: Arc<dyn ContentStore>,
        embeddings: EmbeddingClient,
        completion: CompletionClient,
        config: GeneratorConfig,
    ) -> Self {
        let retriever = Arc::new(SimilarityRetriever::new(records.clone()));
        Self {
            elbow: ElbowRetrieval::new(retriever.clone(), &config.retrieval.elbow),
            retriever,
            records,
            content,
            embeddings,
            completion,
            config,
        }
    }

    pub fn model_name(&self) -> &str {
        self.completion.model_name()
    }

    /// Run both passes for one query
    #[instrument(skip(self, query, observer), fields(repo_id = %repo_id))]
    pub async fn generate(
        &self,
        repo_id: Uuid,
        query: &str,
        observer: &dyn StateObserver,
    ) -> Result<Generation> {
        observer.on_state(GenerationState::Start).await;
        observer.on_state(GenerationState::FileSelection).await;

        let selection = self.select_files(repo_id, query).await?;
        if selection.files.is_empty() {
            observer.on_state(GenerationState::FileSelectionEmpty).await;
            return Ok(Generation {
                state: GenerationState::FileSelectionEmpty,
                files: Vec::new(),
                operations: Vec::new(),
                diffs: Vec::new(),
            });
        }
        observer.on_state(GenerationState::FileSelectionDone).await;

        observer.on_state(GenerationState::OperationGeneration).await;
        let edits = self.generate_operations(query, &selection).await;

        observer.on_state(GenerationState::Complete).await;
        Ok(Generation {
            state: GenerationState::Complete,
            files: selection.files,
            operations: edits.operations,
            diffs: edits.diffs,
        })
    }

    /// Pass 1: choose the files to edit and cache their content.
    ///
    /// An unparsable selection answer fails the run; retrieval finding
    /// nothing is an empty selection.
    pub async fn select_files(&self, repo_id: Uuid, query: &str) -> Result<FileSelection> {
        let (chunks, elbow) = self.candidates(repo_id, query).await?;
        if chunks.is_empty() {
            info!("Pass 1: no relevant chunks found");
            return Ok(FileSelection::default());
        }

        // Distinct files in rank order with their best score
        let mut ranked: Vec<(String, f64)> = Vec::new();
        for chunk in &chunks {
            if !ranked.iter().any(|(path, _)| path == &chunk.file_path) {
                ranked.push((chunk.file_path.clone(), chunk.similarity));
            }
        }

        let mut contents = ContentCache::new();
        let mut blocks = Vec::new();
        let mut used_tokens = 0;
        for (path, similarity) in &ranked {
            let Some(text) = self.file_content(repo_id, path).await else {
                warn!(file = %path, "Pass 1: no content for candidate file");
                continue;
            };

            let block = candidate_block(&CandidateFile {
                path,
                content: &text,
                similarity: *similarity,
            });
            let tokens = self.embeddings.count_tokens(&block);
            if used_tokens + tokens > self.config.retrieval.context_token_budget {
                warn!(
                    file = %path,
                    tokens,
                    budget = self.config.retrieval.context_token_budget,
                    "Pass 1: candidate file exceeds the context budget, omitted"
                );
                continue;
            }
            used_tokens += tokens;
            blocks.push(block);
            contents.insert(path.clone(), text);
        }

        if contents.is_empty() {
            warn!("Pass 1: no candidate file content available");
            return Ok(FileSelection {
                candidates: chunks.len(),
                elbow,
                ..FileSelection::default()
            });
        }

        let messages = [
            ChatMessage::system(FILE_SELECTION_SYSTEM_PROMPT),
            ChatMessage::user(file_selection_prompt(query, &blocks)),
        ];
        let response = self
            .completion
            .complete_with_retry(&messages, self.config.selection)
            .await?;

        let mut files = Vec::new();
        for path in parse_file_selection(&response)? {
            let path = normalize_path(&path);
            if !contents.contains_key(&path) {
                warn!(file = %path, "Pass 1: selected file was not a candidate, dropped");
            } else if !files.contains(&path) {
                files.push(path);
            }
        }

        info!(
            candidates = contents.len(),
            selected = files.len(),
            "Pass 1: files selected"
        );
        Ok(FileSelection {
            files,
            contents,
            candidates: chunks.len(),
            elbow,
        })
    }

    /// Pass 2: edits for each selected file, failures skipped.
    ///
    /// A file answered with a unified diff contributes the diff instead of
    /// operations.
    pub async fn generate_operations(&self, query: &str, selection: &FileSelection) -> FileEdits {
        let mut edits = FileEdits::default();

        for path in &selection.files {
            let Some(content) = selection.contents.get(path) else {
                warn!(file = %path, "Pass 2: no cached content, skipped");
                continue;
            };

            match self.edits_for_file(query, path, content).await {
                Ok(FileAnswer::Operations(file_ops)) if file_ops.is_empty() => {
                    info!(file = %path, "Pass 2: no changes needed");
                }
                Ok(FileAnswer::Operations(file_ops)) => {
                    info!(file = %path, count = file_ops.len(), "Pass 2: operations generated");
                    edits.operations.extend(file_ops);
                }
                Ok(FileAnswer::Diff(diff)) => {
                    info!(file = %path, "Pass 2: unified diff generated");
                    edits.diffs.push(diff);
                }
                Err(e) => {
                    warn!(file = %path, error = %e, "Pass 2: operation generation failed, skipped");
                }
            }
        }

        info!(
            operations = edits.operations.len(),
            diffs = edits.diffs.len(),
            "Pass 2: generation finished"
        );
        edits
    }

    async fn edits_for_file(&self, query: &str, path: &str, content: &str) -> Result<FileAnswer> {
        let messages = [
            ChatMessage::system(OPERATIONS_SYSTEM_PROMPT),
            ChatMessage::user(file_operations_prompt(query, path, content)),
        ];
        let response = self
            .completion
            .complete_with_retry(&messages, self.config.operations)
            .await?;

        let cleaned = strip_code_fence(&response);
        if cleaned.starts_with(DIFF_HEADER) {
            return Ok(FileAnswer::Diff(cleaned));
        }

        let mut operations = parse_operations(&response)?;
        for op in &mut operations {
            if op.file != path {
                debug!(file = %path, reported = %op.file, "Normalizing operation file");
                op.file = path.to_string();
            }
        }
        Ok(FileAnswer::Operations(operations))
    }

    /// Ranked candidate chunks for pass 1.
    ///
    /// With the elbow cutoff on, a wide set of `initial_limit` matches above
    /// `min_similarity` is cut at the elbow. Otherwise the top
    /// `candidate_limit` matches above `candidate_floor` are kept. Vector
    /// matches below the noise floor are dropped either way.
    async fn candidates(
        &self,
        repo_id: Uuid,
        query: &str,
    ) -> Result<(Vec<ChunkMatch>, Option<ElbowDiagnostics>)> {
        let retrieval = &self.config.retrieval;

        let embedding = match self.embeddings.embed_with_retry(query).await {
            Ok(embedding) => embedding,
            Err(e) => {
                warn!(error = %e, "Query embedding failed, using lexical search only");
                None
            }
        };

        if retrieval.use_elbow_cutoff {
            let (mut chunks, diagnostics) = self.elbow.search_with_elbow(repo_id, query, embedding).await?;
            if diagnostics.method != CutoffMethod::LexicalFallback {
                self.drop_below_noise_floor(&mut chunks);
            }
            debug!(
                kept = chunks.len(),
                method = diagnostics.method.as_str(),
                "Elbow cutoff applied to candidates"
            );
            return Ok((chunks, Some(diagnostics)));
        }

        let mut request = SearchRequest::new(repo_id, query)
            .with_limit(retrieval.candidate_limit)
            .with_threshold(retrieval.candidate_floor);
        if let Some(embedding) = embedding {
            request = request.with_embedding(embedding);
        }

        let response = self.retriever.search(&request).await?;
        let mut chunks = response.chunks;

        // Lexical scores are ranks, not similarities
        if response.mode == Some(RetrievalMode::Vector) {
            self.drop_below_noise_floor(&mut chunks);
        }
        Ok((chunks, None))
    }

    fn drop_below_noise_floor(&self, chunks: &mut Vec<ChunkMatch>) {
        let floor = self.config.retrieval.noise_floor;
        let before = chunks.len();
        chunks.retain(|c| c.similarity >= floor);
        if chunks.len() < before {
            debug!(dropped = before - chunks.len(), floor, "Discarded matches below the noise floor");
        }
    }

    /// Full file text from the content store, or reassembled from its chunks
    async fn file_content(&self, repo_id: Uuid, path: &str) -> Option<String> {
        let key = object_key(repo_id, path);
        match self.content.get(&self.config.bucket, &key).await {
            Ok(Some(bytes)) => return Some(decode_utf8_lossy(&bytes)),
            Ok(None) => debug!(file = %path, "Content object missing, reassembling from chunks"),
            Err(e) => warn!(file = %path, error = %e, "Content store read failed, reassembling from chunks"),
        }

        let file = match self.records.find_file(repo_id, path).await {
            Ok(Some(file)) => file,
            Ok(None) => return None,
            Err(e) => {
                warn!(file = %path, error = %e, "File lookup failed");
                return None;
            }
        };

        match self.records.file_chunk_contents(file.id).await {
            Ok(parts) if !parts.is_empty() => Some(parts.join("\n")),
            Ok(_) => None,
            Err(e) => {
                warn!(file = %path, error = %e, "Chunk reassembly failed");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{generator, Fixture};
    use docflow_common::completion::ScriptedCompletionModel;
    use std::sync::Mutex;

    struct RecordingObserver(Mutex<Vec<GenerationState>>);

    #[async_trait]
    impl StateObserver for RecordingObserver {
        async fn on_state(&self, state: GenerationState) {
            self.0.lock().unwrap().push(state);
        }
    }

    #[test]
    fn test_parse_file_selection() {
        assert_eq!(
            parse_file_selection("```json\n[\"docs/a.md\"]\n```").unwrap(),
            vec!["docs/a.md"]
        );
        assert!(parse_file_selection("[]").unwrap().is_empty());
        assert!(matches!(
            parse_file_selection("docs/a.md"),
            Err(AppError::Parse { .. })
        ));
        assert!(parse_file_selection(r#"[{"file": "a.md"}]"#).is_err());
    }

    #[tokio::test]
    async fn test_two_passes_produce_operations() {
        let fx = Fixture::new();
        fx.seed("docs/release.md", "Version v1.0 released, see v1.0 docs\n", vec![1.0, 0.0]).await;
        fx.seed("docs/install.md", "Install with cargo.\n", vec![0.9, 0.1]).await;

        let model = Arc::new(
            ScriptedCompletionModel::new()
                .respond(r#"["docs/release.md", "docs/unknown.md"]"#)
                .respond(r#"[{"file": "release.md", "op": "replace", "find": "v1.0", "replace": "v2.0"}]"#),
        );
        let gen = generator(&fx, model.clone(), vec![1.0, 0.0]);
        let observer = RecordingObserver(Mutex::new(Vec::new()));

        let result = gen.generate(fx.repo_id, "bump the version to v2.0", &observer).await.unwrap();

        assert_eq!(result.state, GenerationState::Complete);
        assert_eq!(result.files, vec!["docs/release.md"]);
        assert_eq!(
            result.operations,
            vec![Operation::replace("docs/release.md", "v1.0", "v2.0")]
        );
        assert_eq!(
            *observer.0.lock().unwrap(),
            vec![
                GenerationState::Start,
                GenerationState::FileSelection,
                GenerationState::FileSelectionDone,
                GenerationState::OperationGeneration,
                GenerationState::Complete,
            ]
        );

        // Pass 2 saw the same content pass 1 showed
        let prompts = model.prompts();
        assert_eq!(prompts.len(), 2);
        assert!(prompts[0][1].content.contains("Install with cargo."));
        assert!(prompts[1][1].content.contains("Version v1.0 released, see v1.0 docs"));
        assert!(!prompts[1][1].content.contains("Install with cargo."));
    }

    #[tokio::test]
    async fn test_matches_below_noise_floor_select_nothing() {
        let fx = Fixture::new();
        // cos ≈ 0.03 against the query axis
        fx.seed("docs/a.md", "Unrelated text.", vec![0.03, 0.9995]).await;
        let model = Arc::new(ScriptedCompletionModel::new());
        let gen = generator(&fx, model.clone(), vec![1.0, 0.0]);

        let result = gen.generate(fx.repo_id, "kubernetes", &NoopObserver).await.unwrap();

        assert_eq!(result.state, GenerationState::FileSelectionEmpty);
        assert!(result.operations.is_empty());
        assert!(model.prompts().is_empty());
    }

    #[tokio::test]
    async fn test_unparsable_selection_fails() {
        let fx = Fixture::new();
        fx.seed("docs/a.md", "Alpha.", vec![1.0, 0.0]).await;
        let model = Arc::new(ScriptedCompletionModel::new().respond("I would edit docs/a.md"));
        let gen = generator(&fx, model, vec![1.0, 0.0]);

        let err = gen.generate(fx.repo_id, "alpha", &NoopObserver).await.unwrap_err();
        assert!(matches!(err, AppError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_failed_file_does_not_stop_others() {
        let fx = Fixture::new();
        fx.seed("a.md", "Alpha text.", vec![1.0, 0.0]).await;
        fx.seed("b.md", "Beta text.", vec![0.95, 0.05]).await;

        let model = Arc::new(
            ScriptedCompletionModel::new()
                .respond(r#"["a.md", "b.md"]"#)
                .respond("not json")
                .respond(r#"[{"file": "b.md", "op": "insertAfter", "find": "Beta text.", "insert": "More."}]"#),
        );
        let gen = generator(&fx, model, vec![1.0, 0.0]);

        let result = gen.generate(fx.repo_id, "text", &NoopObserver).await.unwrap();
        assert_eq!(result.files.len(), 2);
        assert_eq!(result.operations.len(), 1);
        assert_eq!(result.operations[0].file, "b.md");
    }

    #[tokio::test]
    async fn test_diff_answer_is_kept_as_diff() {
        let fx = Fixture::new();
        fx.seed("a.md", "Alpha text.\n", vec![1.0, 0.0]).await;
        fx.seed("b.md", "Beta text.\n", vec![0.95, 0.05]).await;

        let model = Arc::new(
            ScriptedCompletionModel::new()
                .respond(r#"["a.md", "b.md"]"#)
                .respond("```diff\n--- a/a.md\n+++ b/a.md\n@@ -1 +1 @@\n-Alpha text.\n+Alpha prose.\n```")
                .respond(r#"[{"file": "b.md", "op": "replace", "find": "Beta", "replace": "Gamma"}]"#),
        );
        let gen = generator(&fx, model, vec![1.0, 0.0]);

        let result = gen.generate(fx.repo_id, "text", &NoopObserver).await.unwrap();
        assert_eq!(result.diffs.len(), 1);
        assert!(result.diffs[0].starts_with("--- a/a.md"));
        assert!(result.diffs[0].ends_with("+Alpha prose."));
        assert_eq!(result.operations, vec![Operation::replace("b.md", "Beta", "Gamma")]);
    }

    #[tokio::test]
    async fn test_content_falls_back_to_chunks() {
        let fx = Fixture::new();
        fx.seed_chunks_only("docs/a.md", "Chunk only content.", vec![1.0, 0.0]).await;
        let model = Arc::new(ScriptedCompletionModel::new().respond(r#"["docs/a.md"]"#).respond("[]"));
        let gen = generator(&fx, model, vec![1.0, 0.0]);

        let selection = gen.select_files(fx.repo_id, "chunk").await.unwrap();
        assert_eq!(selection.files, vec!["docs/a.md"]);
        assert_eq!(selection.contents["docs/a.md"], "Chunk only content.");
    }

    /// Four close files, then a long tail of weaker ones
    async fn seed_with_tail(fx: &Fixture) {
        let mut angles = vec![0.05f32, 0.08, 0.11, 0.14];
        angles.extend((0..10).map(|i| 1.05 + i as f32 * 0.01));
        for (i, angle) in angles.into_iter().enumerate() {
            let path = format!("docs/{:02}.md", i);
            fx.seed(&path, &format!("Section {}.", i), vec![angle.cos(), angle.sin()]).await;
        }
    }

    #[tokio::test]
    async fn test_elbow_cutoff_trims_candidates() {
        let fx = Fixture::new();
        seed_with_tail(&fx).await;
        let model = Arc::new(ScriptedCompletionModel::new().respond("[]"));
        let gen = generator(&fx, model.clone(), vec![1.0, 0.0]);

        let selection = gen.select_files(fx.repo_id, "section").await.unwrap();

        let elbow = selection.elbow.expect("elbow diagnostics");
        assert_eq!(elbow.initial_retrieval_count, Some(14));
        assert!(selection.candidates < 14);
        assert!(selection.contents.contains_key("docs/00.md"));
        assert!(!selection.contents.contains_key("docs/13.md"));
        assert!(!model.prompts()[0][1].content.contains("Section 13."));
    }

    #[tokio::test]
    async fn test_without_elbow_cutoff_keeps_candidate_limit() {
        let fx = Fixture::new();
        seed_with_tail(&fx).await;
        let model = Arc::new(ScriptedCompletionModel::new().respond("[]"));
        let mut config = GeneratorConfig::default();
        config.retrieval.use_elbow_cutoff = false;
        config.retrieval.candidate_limit = 6;
        let gen = crate::testing::generator_with(&fx, model, vec![1.0, 0.0], config);

        let selection = gen.select_files(fx.repo_id, "section").await.unwrap();

        assert!(selection.elbow.is_none());
        assert_eq!(selection.candidates, 6);
        assert!(selection.contents.contains_key("docs/05.md"));
    }

    #[tokio::test]
    async fn test_context_budget_omits_files() {
        let fx = Fixture::new();
        let big: String = (0..200).map(|i| format!("w{} ", i)).collect();
        fx.seed("big.md", &big, vec![1.0, 0.0]).await;
        fx.seed("small.md", "Small.", vec![0.9, 0.1]).await;

        let model = Arc::new(ScriptedCompletionModel::new().respond(r#"["big.md", "small.md"]"#));
        let mut config = GeneratorConfig::default();
        config.retrieval.context_token_budget = 50;
        let gen = crate::testing::generator_with(&fx, model, vec![1.0, 0.0], config);

        let selection = gen.select_files(fx.repo_id, "size").await.unwrap();
        assert_eq!(selection.files, vec!["small.md"]);
        assert!(!selection.contents.contains_key("big.md"));
    }
}
