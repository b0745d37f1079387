//! Docflow context engine
//!
//! Turns a natural-language change request into reviewable edits:
//! - Two-pass generation: file selection, then per-file operations
//! - Anchor operations: parsing, validation and application
//! - Unified diff parsing for diff-style answers
//! - Suggestion persistence and the query job pipeline

pub mod diff;
pub mod generator;
pub mod operations;
pub mod processor;
pub mod prompts;
pub mod suggestions;

pub use generator::{
    ContentCache, FileEdits, FileSelection, Generation, GenerationState, GeneratorConfig,
    NoopObserver, StateObserver, TwoPassGenerator,
};
pub use operations::{
    apply_operation, apply_operations, parse_operations, validate_against_content, Edit,
    Operation, OperationError,
};
pub use processor::{QueryOutcome, QueryProcessor, QueryRequest, QueryStage};
pub use suggestions::{CreatedSuggestion, SuggestionCreator};

#[cfg(test)]
pub(crate) mod testing {
    use crate::generator::{GeneratorConfig, TwoPassGenerator};
    use async_trait::async_trait;
    use docflow_common::completion::{CompletionClient, CompletionModel};
    use docflow_common::db::models::FileChunkLink;
    use docflow_common::db::{MemoryRecordStore, NewChunk, NewFile, RecordStore};
    use docflow_common::embeddings::{Embedder, EmbeddingClient, RetryPolicy};
    use docflow_common::errors::Result;
    use docflow_common::sha256_hex;
    use docflow_common::storage::{object_key, ContentStore, MemoryContentStore};
    use docflow_common::tokens::WordTokenizer;
    use std::sync::Arc;
    use std::time::Duration;
    use uuid::Uuid;

    /// Embeds every text as the same vector
    pub struct FixedEmbedder(pub Vec<f32>);

    #[async_trait]
    impl Embedder for FixedEmbedder {
        async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
            Ok(self.0.clone())
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            Ok(texts.iter().map(|_| self.0.clone()).collect())
        }

        fn model_name(&self) -> &str {
            "fixed"
        }

        fn dimension(&self) -> usize {
            self.0.len()
        }
    }

    pub struct Fixture {
        pub records: Arc<MemoryRecordStore>,
        pub content: Arc<MemoryContentStore>,
        pub repo_id: Uuid,
    }

    impl Fixture {
        pub fn new() -> Self {
            let records = Arc::new(MemoryRecordStore::new());
            let repo = records.insert_repo("acme/docs", "main", "docs").unwrap();
            Self {
                records,
                content: Arc::new(MemoryContentStore::new()),
                repo_id: repo.id,
            }
        }

        /// Index `text` as a single chunk and store it as the live content
        pub async fn seed(&self, path: &str, text: &str, embedding: Vec<f32>) {
            self.seed_chunks_only(path, text, embedding).await;
            self.content
                .put("docs", &object_key(self.repo_id, path), text.as_bytes().to_vec())
                .await
                .unwrap();
        }

        /// Index `text` without a content-store object
        pub async fn seed_chunks_only(&self, path: &str, text: &str, embedding: Vec<f32>) {
            let file = self
                .records
                .upsert_file(NewFile {
                    repo_id: self.repo_id,
                    path: path.to_string(),
                    content_hash: sha256_hex(text),
                    storage_key: object_key(self.repo_id, path),
                })
                .await
                .unwrap();

            let hash = sha256_hex(text);
            self.records
                .insert_chunk_if_absent(NewChunk {
                    hash: hash.clone(),
                    content: text.to_string(),
                    embedding,
                    token_count: text.split_whitespace().count() as i32,
                })
                .await
                .unwrap();

            self.records
                .upsert_file_chunk(FileChunkLink {
                    file_id: file.id,
                    chunk_order: 0,
                    chunk_hash: hash,
                    start_line: 1,
                    end_line: text.lines().count().max(1) as i32,
                })
                .await
                .unwrap();
        }
    }

    pub fn generator(
        fx: &Fixture,
        model: Arc<dyn CompletionModel>,
        query_embedding: Vec<f32>,
    ) -> TwoPassGenerator {
        generator_with(fx, model, query_embedding, GeneratorConfig::default())
    }

    pub fn generator_with(
        fx: &Fixture,
        model: Arc<dyn CompletionModel>,
        query_embedding: Vec<f32>,
        config: GeneratorConfig,
    ) -> TwoPassGenerator {
        let fast = RetryPolicy {
            max_retries: 0,
            base_delay: Duration::from_millis(1),
        };
        let embeddings = EmbeddingClient::new(
            Arc::new(FixedEmbedder(query_embedding)),
            Arc::new(WordTokenizer::new()),
        )
        .with_retry(fast.clone());
        let completion = CompletionClient::new(model).with_retry(fast);

        TwoPassGenerator::new(fx.records.clone(), fx.content.clone(), embeddings, completion, config)
    }
}
