//! Retrieval with lexical fallbacks
//!
//! Vector search first; full-text search when it finds nothing; keyword
//! substring search when the full-text query is too strict.

use super::{
    fulltext::FulltextRetriever, keyword::KeywordRetriever, vector::VectorRetriever,
    RetrievalMode, Retriever, SearchRequest, SearchResponse,
};
use docflow_common::db::RecordStore;
use docflow_common::errors::Result;
use docflow_common::metrics;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, instrument, warn};

/// Similarity retriever with the vector → full-text → keyword chain
pub struct SimilarityRetriever {
    vector: VectorRetriever,
    fulltext: FulltextRetriever,
    keyword: KeywordRetriever,
}

impl SimilarityRetriever {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self {
            vector: VectorRetriever::new(records.clone()),
            fulltext: FulltextRetriever::new(records.clone()),
            keyword: KeywordRetriever::new(records),
        }
    }

    /// Search, falling back to the lexical modes on an empty result.
    ///
    /// Vector and full-text failures are logged and treated as empty so the
    /// next mode still runs. A keyword search failure is returned.
    #[instrument(skip(self, request), fields(repo_id = %request.repo_id, limit = request.limit))]
    pub async fn search(&self, request: &SearchRequest) -> Result<SearchResponse> {
        let started = Instant::now();

        if request.query_embedding.is_some() {
            if let Some(response) = self.attempt(&self.vector, request, started).await {
                return Ok(response);
            }
        }

        if let Some(response) = self.attempt(&self.fulltext, request, started).await {
            return Ok(response);
        }

        let chunks = self.keyword.retrieve(request).await?;
        let query_time_ms = started.elapsed().as_millis() as u64;
        metrics::record_search(
            started.elapsed().as_secs_f64(),
            RetrievalMode::Keyword.as_str(),
            chunks.len(),
        );

        if chunks.is_empty() {
            info!("No matches in any retrieval mode");
            return Ok(SearchResponse {
                chunks,
                mode: None,
                query_time_ms,
            });
        }

        info!(count = chunks.len(), "Keyword fallback matched");
        Ok(SearchResponse {
            chunks,
            mode: Some(RetrievalMode::Keyword),
            query_time_ms,
        })
    }

    /// Run one mode; `None` when it failed or matched nothing
    async fn attempt(
        &self,
        retriever: &dyn Retriever,
        request: &SearchRequest,
        started: Instant,
    ) -> Option<SearchResponse> {
        let mode = retriever.mode();
        let chunks = match retriever.retrieve(request).await {
            Ok(chunks) => chunks,
            Err(e) => {
                warn!(mode = mode.as_str(), error = %e, "Retrieval failed, falling back");
                Vec::new()
            }
        };
        metrics::record_search(started.elapsed().as_secs_f64(), mode.as_str(), chunks.len());

        if chunks.is_empty() {
            debug!(mode = mode.as_str(), "No matches, falling back");
            return None;
        }

        debug!(mode = mode.as_str(), count = chunks.len(), "Retrieved matches");
        Some(SearchResponse {
            chunks,
            mode: Some(mode),
            query_time_ms: started.elapsed().as_millis() as u64,
        })
    }
}
