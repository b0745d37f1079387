//! Keyword substring search, the last-resort lexical mode

use super::{RetrievalMode, Retriever, SearchRequest};
use docflow_common::db::{ChunkMatch, RecordStore};
use docflow_common::errors::Result;
use std::sync::Arc;

/// Keywords considered per query
const MAX_KEYWORDS: usize = 5;

/// Leading query words longer than two characters, lowercased with
/// surrounding parentheses stripped
pub fn extract_keywords(query: &str) -> Vec<String> {
    query
        .split_whitespace()
        .filter(|w| w.chars().count() > 2)
        .take(MAX_KEYWORDS)
        .map(|w| w.trim_matches(|c| c == '(' || c == ')').to_lowercase())
        .filter(|w| !w.is_empty())
        .collect()
}

/// Case-insensitive substring retriever; matches carry similarity 0
pub struct KeywordRetriever {
    records: Arc<dyn RecordStore>,
}

impl KeywordRetriever {
    pub fn new(records: Arc<dyn RecordStore>) -> Self {
        Self { records }
    }
}

#[async_trait::async_trait]
impl Retriever for KeywordRetriever {
    async fn retrieve(&self, request: &SearchRequest) -> Result<Vec<ChunkMatch>> {
        let keywords = extract_keywords(&request.query);
        if keywords.is_empty() {
            return Ok(vec![]);
        }

        self.records
            .keyword_search(request.repo_id, &keywords, request.limit)
            .await
    }

    fn mode(&self) -> RetrievalMode {
        RetrievalMode::Keyword
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_keywords() {
        assert_eq!(
            extract_keywords("How do I (Configure) the API key for an app"),
            vec!["how", "configure", "the", "api", "key"]
        );
    }

    #[test]
    fn test_short_words_dropped() {
        assert!(extract_keywords("a an to").is_empty());
        assert_eq!(extract_keywords("go to TLS"), vec!["tls"]);
    }
}
