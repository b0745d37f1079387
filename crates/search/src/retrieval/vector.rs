//! Vector similarity search
//!
//! Delegates the nearest-neighbour query to the record store

use super::{RetrievalMode, Retriever, SearchRequest};
use docflow_common::db::{ChunkMatch, RecordStore, VectorQuery};
use docflow_common::errors::{AppError, Result};
use std::sync::Arc;

/// Vector retriever over chunk embeddings
pub struct VectorRetriever {
    records: Arc<dyn RecordStore>,
}

impl VectorRetriever {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait::async_trait]
impl Retriever for VectorRetriever {
    async fn retrieve(&self, request: &SearchRequest) -> Result<Vec<ChunkMatch>> {
        let embedding = request
            .query_embedding
            .as_deref()
            .ok_or_else(|| AppError::Validation {
                message: "Vector search requires a query embedding".to_string(),
                field: Some("query_embedding".to_string()),
            })?;

        self.records
            .vector_search(VectorQuery {
                embedding,
                repo_id: request.repo_id,
                limit: request.limit,
                threshold: request.similarity_threshold,
            })
            .await
    }

    fn mode(&self) -> RetrievalMode {
        RetrievalMode::Vector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use docflow_common::db::MemoryRecordStore;
    use uuid::Uuid;

    #[tokio::test]
    async fn test_requires_embedding() {
        let retriever = VectorRetriever::new(Arc::new(MemoryRecordStore::new()));
        let err = retriever
            .retrieve(&SearchRequest::new(Uuid::new_v4(), "setup"))
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
    }
}
