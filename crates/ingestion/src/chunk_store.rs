//! Content-addressed chunk store
//!
//! A chunk's identity is the sha256 of its text. Identical text anywhere in
//! the corpus is embedded once and shared by every file that contains it.

use docflow_common::db::{NewChunk, RecordStore};
use docflow_common::embeddings::EmbeddingClient;
use docflow_common::errors::Result;
use docflow_common::{metrics, sha256_hex};
use std::sync::Arc;
use tracing::debug;

/// Result of ensuring a chunk exists
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnsuredChunk {
    pub hash: String,
    /// Whether this call wrote the row
    pub created: bool,
}

/// Deduplicating chunk writer
#[derive(Clone)]
pub struct ContentAddressedChunkStore {
    records: Arc<dyn RecordStore>,
    embeddings: EmbeddingClient,
}

impl ContentAddressedChunkStore {
    pub fn new(records: Arc<dyn RecordStore>, embeddings: EmbeddingClient) -> Self {
        Self {
            records,
            embeddings,
        }
    }

    /// Make sure a chunk with this content exists and return its hash.
    ///
    /// Existing chunks return without embedding. New chunks are embedded with
    /// retry (zero vector on exhaustion) and written insert-if-absent, so
    /// concurrent callers with the same content converge on one row.
    pub async fn ensure_chunk(&self, content: &str) -> Result<EnsuredChunk> {
        let hash = sha256_hex(content);

        if self.records.chunk_exists(&hash).await? {
            debug!(hash = &hash[..8], "Using existing chunk");
            metrics::record_chunk(false);
            return Ok(EnsuredChunk {
                hash,
                created: false,
            });
        }

        let embedding = self.embeddings.embed_or_zero(content).await;
        let token_count = self.embeddings.count_tokens(content) as i32;

        let created = self
            .records
            .insert_chunk_if_absent(NewChunk {
                hash: hash.clone(),
                content: content.to_string(),
                embedding,
                token_count,
            })
            .await?;

        debug!(hash = &hash[..8], created, "Stored chunk");
        metrics::record_chunk(created);

        Ok(EnsuredChunk { hash, created })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use async_trait::async_trait;
    use docflow_common::embeddings::{Embedder, MockEmbedder};
    use docflow_common::errors::Result;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Mock embedder counting provider calls
    pub struct CountingEmbedder {
        inner: MockEmbedder,
        calls: AtomicUsize,
    }

    impl CountingEmbedder {
        pub fn new(dimension: usize) -> Self {
            Self {
                inner: MockEmbedder::new(dimension),
                calls: AtomicUsize::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Embedder for CountingEmbedder {
        async fn embed(&self, text: &str) -> Result<Vec<f32>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed(text).await
        }

        async fn embed_batch(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.inner.embed_batch(texts).await
        }

        fn model_name(&self) -> &str {
            "counting"
        }

        fn dimension(&self) -> usize {
            self.inner.dimension()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::CountingEmbedder;
    use super::*;
    use docflow_common::db::MemoryRecordStore;
    use docflow_common::tokens::WordTokenizer;

    fn store() -> (ContentAddressedChunkStore, Arc<MemoryRecordStore>, Arc<CountingEmbedder>) {
        let records = Arc::new(MemoryRecordStore::new());
        let embedder = Arc::new(CountingEmbedder::new(8));
        let client = EmbeddingClient::new(embedder.clone(), Arc::new(WordTokenizer::new()));
        (
            ContentAddressedChunkStore::new(records.clone(), client),
            records,
            embedder,
        )
    }

    #[tokio::test]
    async fn test_ensure_chunk_is_idempotent() {
        let (chunks, records, embedder) = store();

        let first = chunks.ensure_chunk("Install with cargo.").await.unwrap();
        let second = chunks.ensure_chunk("Install with cargo.").await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.hash, second.hash);
        assert_eq!(first.hash, sha256_hex("Install with cargo."));
        assert_eq!(records.chunk_count(), 1);
        assert_eq!(embedder.calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_ensure_converges() {
        let (chunks, records, _) = store();

        let (a, b) = tokio::join!(
            chunks.ensure_chunk("shared text"),
            chunks.ensure_chunk("shared text")
        );

        assert_eq!(a.unwrap().hash, b.unwrap().hash);
        assert_eq!(records.chunk_count(), 1);
    }

    #[tokio::test]
    async fn test_stored_chunk_fields() {
        let (chunks, records, _) = store();
        let ensured = chunks.ensure_chunk("three word chunk").await.unwrap();

        let stored = records.chunk(&ensured.hash).unwrap();
        assert_eq!(stored.content, "three word chunk");
        assert_eq!(stored.token_count, 3);
        assert_eq!(stored.parse_embedding().unwrap().len(), 8);
    }
}
