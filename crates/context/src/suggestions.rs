//! Suggestion creation
//!
//! Operations are grouped per file, checked against the file's live content
//! and persisted as one pending suggestion per file, paired with a pending
//! review decision.

use docflow_common::db::{NewSuggestion, RecordStore};
use docflow_common::storage::{decode_utf8_lossy, object_key, ContentStore};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

use crate::diff::{is_valid_unified_diff, parse_unified_diffs};
use crate::operations::{operations_to_json, validate_against_content, Operation};

/// A persisted suggestion
#[derive(Debug, Clone, PartialEq)]
pub struct CreatedSuggestion {
    pub id: Uuid,
    pub file_id: Uuid,
    pub file_path: String,
}

/// Group operations by file, keeping first-seen file order and the order of
/// operations within each file
pub fn group_by_file(operations: &[Operation]) -> Vec<(String, Vec<Operation>)> {
    let mut groups: Vec<(String, Vec<Operation>)> = Vec::new();
    for op in operations {
        match groups.iter_mut().find(|(file, _)| file == &op.file) {
            Some((_, ops)) => ops.push(op.clone()),
            None => groups.push((op.file.clone(), vec![op.clone()])),
        }
    }
    groups
}

/// Turns generated edits into reviewable suggestions
pub struct SuggestionCreator {
    records: Arc<dyn RecordStore>,
    content: Arc<dyn ContentStore>,
    bucket: String,
    confidence: f64,
}

impl SuggestionCreator {
    pub fn new(
        records: Arc<dyn RecordStore>,
        content: Arc<dyn ContentStore>,
        bucket: impl Into<String>,
        confidence: f64,
    ) -> Self {
        Self {
            records,
            content,
            bucket: bucket.into(),
            confidence,
        }
    }

    /// Persist one suggestion per file whose operations apply cleanly.
    ///
    /// Files without a record and batches that fail validation are skipped.
    #[instrument(skip(self, operations), fields(repo_id = %repo_id, operations = operations.len()))]
    pub async fn create_from_operations(
        &self,
        repo_id: Uuid,
        reviewer_id: Uuid,
        operations: &[Operation],
        model_used: &str,
    ) -> Vec<CreatedSuggestion> {
        let mut created = Vec::new();

        for (path, file_ops) in group_by_file(operations) {
            let Some(file_id) = self.file_id(repo_id, &path).await else {
                continue;
            };

            if !self.validate(repo_id, &path, &file_ops).await {
                continue;
            }

            let suggestion = NewSuggestion {
                file_id,
                operations_json: Some(operations_to_json(&file_ops)),
                patch_unified_diff: None,
                confidence: self.confidence,
                model_used: model_used.to_string(),
            };
            if let Some(s) = self.persist(suggestion, &path, reviewer_id).await {
                created.push(s);
            }
        }

        info!(created = created.len(), "Suggestions created from operations");
        created
    }

    /// Persist one suggestion per well-formed patch in a unified-diff response
    #[instrument(skip(self, response), fields(repo_id = %repo_id))]
    pub async fn create_from_diffs(
        &self,
        repo_id: Uuid,
        reviewer_id: Uuid,
        response: &str,
        model_used: &str,
    ) -> Vec<CreatedSuggestion> {
        let mut created = Vec::new();

        for patch in parse_unified_diffs(response) {
            if !is_valid_unified_diff(&patch.diff) {
                warn!(file = %patch.path, "Malformed unified diff, skipped");
                continue;
            }
            let Some(file_id) = self.file_id(repo_id, &patch.path).await else {
                continue;
            };

            let suggestion = NewSuggestion {
                file_id,
                operations_json: None,
                patch_unified_diff: Some(patch.diff),
                confidence: self.confidence,
                model_used: model_used.to_string(),
            };
            if let Some(s) = self.persist(suggestion, &patch.path, reviewer_id).await {
                created.push(s);
            }
        }

        created
    }

    async fn file_id(&self, repo_id: Uuid, path: &str) -> Option<Uuid> {
        match self.records.find_file(repo_id, path).await {
            Ok(Some(file)) => Some(file.id),
            Ok(None) => {
                warn!(file = %path, "File not found in repository, skipped");
                None
            }
            Err(e) => {
                warn!(file = %path, error = %e, "File lookup failed, skipped");
                None
            }
        }
    }

    /// Dry-run the batch against live content.
    ///
    /// When the live content cannot be read the batch is accepted unchecked.
    async fn validate(&self, repo_id: Uuid, path: &str, operations: &[Operation]) -> bool {
        let key = object_key(repo_id, path);
        let content = match self.content.get(&self.bucket, &key).await {
            Ok(Some(bytes)) => decode_utf8_lossy(&bytes),
            Ok(None) => {
                warn!(file = %path, "No live content to validate against, accepting operations");
                return true;
            }
            Err(e) => {
                warn!(file = %path, error = %e, "Could not fetch live content, accepting operations");
                return true;
            }
        };

        match validate_against_content(&content, operations) {
            Ok(()) => true,
            Err(e) => {
                warn!(file = %path, error = %e, "Operations do not apply to live content, skipped");
                false
            }
        }
    }

    async fn persist(
        &self,
        suggestion: NewSuggestion,
        path: &str,
        reviewer_id: Uuid,
    ) -> Option<CreatedSuggestion> {
        match self.records.create_suggestion(suggestion, reviewer_id).await {
            Ok((suggestion, _decision)) => Some(CreatedSuggestion {
                id: suggestion.id,
                file_id: suggestion.file_id,
                file_path: path.to_string(),
            }),
            Err(e) => {
                warn!(file = %path, error = %e, "Failed to persist suggestion");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::Fixture;
    use docflow_common::db::models::ReviewStatus;

    fn creator(fx: &Fixture) -> SuggestionCreator {
        SuggestionCreator::new(fx.records.clone(), fx.content.clone(), "docs", 0.8)
    }

    #[test]
    fn test_group_keeps_order() {
        let ops = vec![
            Operation::replace("b.md", "1", "2"),
            Operation::replace("a.md", "x", "y"),
            Operation::replace("b.md", "2", "3"),
        ];
        let groups = group_by_file(&ops);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].0, "b.md");
        assert_eq!(groups[0].1, vec![ops[0].clone(), ops[2].clone()]);
        assert_eq!(groups[1].0, "a.md");
    }

    #[tokio::test]
    async fn test_valid_operations_become_pending_suggestion() {
        let fx = Fixture::new();
        fx.seed("docs/release.md", "Version v1.0 released, see v1.0 docs\n", vec![1.0, 0.0]).await;
        let reviewer = Uuid::new_v4();

        let ops = vec![Operation::replace("docs/release.md", "v1.0", "v2.0")];
        let created = creator(&fx)
            .create_from_operations(fx.repo_id, reviewer, &ops, "gpt-4o-mini")
            .await;

        assert_eq!(created.len(), 1);
        let stored = fx.records.suggestions();
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].id, created[0].id);
        assert_eq!(stored[0].review_status(), ReviewStatus::Pending);
        assert_eq!(stored[0].model_used, "gpt-4o-mini");
        assert_eq!(stored[0].confidence, 0.8);
        assert_eq!(stored[0].operations_json, Some(operations_to_json(&ops)));

        let decisions = fx.records.review_decisions();
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].suggestion_id, created[0].id);
        assert_eq!(decisions[0].reviewer_id, reviewer);
    }

    #[tokio::test]
    async fn test_stale_operations_dropped() {
        let fx = Fixture::new();
        fx.seed("a.md", "Current text.\n", vec![1.0, 0.0]).await;
        fx.seed("b.md", "Other text.\n", vec![1.0, 0.0]).await;

        let ops = vec![
            Operation::replace("a.md", "Text from an older revision", "x"),
            Operation::insert_after("b.md", "Other text.", "Added."),
        ];
        let created = creator(&fx)
            .create_from_operations(fx.repo_id, Uuid::new_v4(), &ops, "m")
            .await;

        assert_eq!(created.len(), 1);
        assert_eq!(created[0].file_path, "b.md");
    }

    #[tokio::test]
    async fn test_unknown_file_skipped() {
        let fx = Fixture::new();
        let ops = vec![Operation::replace("ghost.md", "a", "b")];
        let created = creator(&fx)
            .create_from_operations(fx.repo_id, Uuid::new_v4(), &ops, "m")
            .await;
        assert!(created.is_empty());
        assert!(fx.records.suggestions().is_empty());
    }

    #[tokio::test]
    async fn test_store_unavailable_skips_validation() {
        let fx = Fixture::new();
        fx.seed("a.md", "Current text.\n", vec![1.0, 0.0]).await;
        fx.content.set_unavailable(true);

        // Would fail validation if the content were readable
        let ops = vec![Operation::replace("a.md", "missing anchor", "x")];
        let created = creator(&fx)
            .create_from_operations(fx.repo_id, Uuid::new_v4(), &ops, "m")
            .await;
        assert_eq!(created.len(), 1);
    }

    #[tokio::test]
    async fn test_diff_suggestions() {
        let fx = Fixture::new();
        fx.seed("docs/install.md", "# Install\nUse v1.0\n", vec![1.0, 0.0]).await;

        let response = "--- a/docs/install.md\n+++ b/docs/install.md\n@@ -1,2 +1,2 @@\n # Install\n-Use v1.0\n+Use v2.0\n\
--- a/docs/ghost.md\n+++ b/docs/ghost.md\n@@ -1 +1 @@\n-a\n+b\n\
--- a/docs/install.md\nno hunks here";
        let created = creator(&fx)
            .create_from_diffs(fx.repo_id, Uuid::new_v4(), response, "m")
            .await;

        assert_eq!(created.len(), 1);
        let stored = fx.records.suggestions();
        assert!(stored[0].operations_json.is_none());
        assert!(stored[0]
            .patch_unified_diff
            .as_deref()
            .unwrap()
            .ends_with("+Use v2.0"));
    }
}
