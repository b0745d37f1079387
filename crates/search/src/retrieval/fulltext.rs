//! Ranked full-text search

use super::{RetrievalMode, Retriever, SearchRequest};
use docflow_common::db::{ChunkMatch, RecordStore};
use docflow_common::errors::Result;
use std::sync::Arc;

/// Lexical retriever using the store's full-text ranking
pub struct FulltextRetriever {
    records: Arc<dyn RecordStore>,
}

impl FulltextRetriever {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait::async_trait]
impl Retriever for FulltextRetriever {
    async fn retrieve(&self, request: &SearchRequest) -> Result<Vec<ChunkMatch>> {
        let query = request.query.trim();
        if query.is_empty() {
            return Ok(vec![]);
        }

        self.records
            .fulltext_search(request.repo_id, query, request.limit)
            .await
    }

    fn mode(&self) -> RetrievalMode {
        RetrievalMode::Fulltext
    }
}
