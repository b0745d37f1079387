//! Retrieval with a dynamic relevance cutoff

use super::{CutoffMethod, ElbowAnalyzer, ElbowDiagnostics, SimilarityRange};
use crate::retrieval::{RetrievalMode, SearchRequest, SimilarityRetriever};
use docflow_common::config::ElbowConfig;
use docflow_common::db::ChunkMatch;
use docflow_common::errors::Result;
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Fetches a wide candidate set and keeps the part before the elbow
pub struct ElbowRetrieval {
    retriever: Arc<SimilarityRetriever>,
    analyzer: ElbowAnalyzer,
    initial_limit: usize,
    min_similarity: f64,
}

impl ElbowRetrieval {
    pub fn new(retriever: Arc<SimilarityRetriever>, config: &ElbowConfig) -> Self {
        Self {
            retriever,
            analyzer: ElbowAnalyzer::from_config(config),
            initial_limit: config.initial_limit,
            min_similarity: config.min_similarity,
        }
    }

    pub fn analyzer(&self) -> &ElbowAnalyzer {
        &self.analyzer
    }

    pub fn initial_limit(&self) -> usize {
        self.initial_limit
    }

    pub fn min_similarity(&self) -> f64 {
        self.min_similarity
    }

    /// Search and cut the ranked matches at the elbow point.
    ///
    /// Without an embedding only the lexical modes run. Lexical fallback
    /// matches carry no comparable similarity, so they are kept up to the
    /// minimum count instead of being analysed.
    #[instrument(skip(self, query, embedding), fields(repo_id = %repo_id))]
    pub async fn search_with_elbow(
        &self,
        repo_id: Uuid,
        query: &str,
        embedding: Option<Vec<f32>>,
    ) -> Result<(Vec<ChunkMatch>, ElbowDiagnostics)> {
        let mut request = SearchRequest::new(repo_id, query)
            .with_limit(self.initial_limit)
            .with_threshold(self.min_similarity);
        if let Some(embedding) = embedding {
            request = request.with_embedding(embedding);
        }

        let response = self.retriever.search(&request).await?;
        let mut chunks = response.chunks;

        match response.mode {
            None => {
                warn!("No chunks found for elbow analysis");
                Ok((chunks, ElbowDiagnostics::new(CutoffMethod::NoResults, &[], 0)))
            }
            Some(RetrievalMode::Vector) => {
                let scores: Vec<f64> = chunks.iter().map(|c| c.similarity).collect();
                let (count, mut diagnostics) = self.analyzer.find_cutoff(&scores);
                let kept = count.min(chunks.len());
                chunks.truncate(kept);

                diagnostics.initial_retrieval_count = Some(scores.len());
                diagnostics.similarity_range = kept.checked_sub(1).map(|last| SimilarityRange {
                    highest: scores[0],
                    lowest: scores[last],
                    cutoff_score: scores[last],
                });

                info!(
                    initial = scores.len(),
                    kept,
                    method = diagnostics.method.as_str(),
                    "Elbow cutoff applied"
                );
                Ok((chunks, diagnostics))
            }
            Some(mode) => {
                let initial = chunks.len();
                chunks.truncate(self.analyzer.min_docs);
                let scores: Vec<f64> = chunks.iter().map(|c| c.similarity).collect();

                let mut diagnostics =
                    ElbowDiagnostics::new(CutoffMethod::LexicalFallback, &scores, scores.len());
                diagnostics.chosen_point = Some(chunks.len());
                diagnostics.initial_retrieval_count = Some(initial);

                info!(mode = mode.as_str(), kept = chunks.len(), "Lexical fallback used for elbow retrieval");
                Ok((chunks, diagnostics))
            }
        }
    }
}
