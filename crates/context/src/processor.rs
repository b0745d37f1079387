//! Query processing
//!
//! Runs one change request through the two-pass generator and the
//! suggestion creator, reporting progress on the task's job row.

use async_trait::async_trait;
use docflow_common::db::RecordStore;
use docflow_common::errors::{AppError, Result};
use docflow_common::jobs::{JobMetadata, JobTracker};
use docflow_common::metrics;
use docflow_common::queue::TaskMessage;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, instrument};
use uuid::Uuid;

use crate::generator::{GenerationState, StateObserver, TwoPassGenerator};
use crate::suggestions::SuggestionCreator;

/// Completion message when retrieval or selection found nothing to edit
pub const NO_RELEVANT_DOCS_MESSAGE: &str = "No relevant documentation found for query";

/// Named step of a query run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStage {
    WarmingUp,
    Understanding,
    SelectingFiles,
    Generating,
    Validating,
    Completed,
}

impl QueryStage {
    pub fn percent(self) -> u8 {
        match self {
            QueryStage::WarmingUp => 0,
            QueryStage::Understanding => 10,
            QueryStage::SelectingFiles => 20,
            QueryStage::Generating => 60,
            QueryStage::Validating => 80,
            QueryStage::Completed => 100,
        }
    }

    pub fn step(self) -> &'static str {
        match self {
            QueryStage::WarmingUp => "Warming up the engines",
            QueryStage::Understanding => "Understanding your request",
            QueryStage::SelectingFiles => "Selecting the right files",
            QueryStage::Generating => "Generating suggestions",
            QueryStage::Validating => "Validating suggestions",
            QueryStage::Completed => "completed",
        }
    }
}

/// One query task
#[derive(Debug, Clone)]
pub struct QueryRequest {
    pub task_id: String,
    pub query: String,
    pub repo_id: Uuid,
    pub reviewer_id: Uuid,
}

impl QueryRequest {
    /// Build from a queue message; `None` for other task kinds
    pub fn from_message(message: &TaskMessage) -> Option<Self> {
        match message {
            TaskMessage::Query {
                task_id,
                query,
                repo_id,
                reviewer_id,
            } => Some(Self {
                task_id: task_id.clone(),
                query: query.clone(),
                repo_id: *repo_id,
                reviewer_id: *reviewer_id,
            }),
            _ => None,
        }
    }
}

/// Result of a successful run
#[derive(Debug, Clone, PartialEq)]
pub struct QueryOutcome {
    pub suggestions_created: usize,
    pub files_modified: usize,
    pub files_to_edit: Vec<String>,
    pub suggestion_ids: Vec<Uuid>,
    pub message: String,
}

impl QueryOutcome {
    fn nothing_found() -> Self {
        Self {
            suggestions_created: 0,
            files_modified: 0,
            files_to_edit: Vec::new(),
            suggestion_ids: Vec::new(),
            message: NO_RELEVANT_DOCS_MESSAGE.to_string(),
        }
    }

    fn metadata(&self) -> JobMetadata {
        JobMetadata {
            suggestions_created: Some(self.suggestions_created),
            files_to_edit: Some(self.files_to_edit.clone()),
            suggestion_ids: Some(self.suggestion_ids.clone()),
            ..JobMetadata::default()
        }
    }
}

fn completion_message(suggestions_created: usize) -> String {
    if suggestions_created == 0 {
        "Two-pass query processed successfully. No suggestions were generated.".to_string()
    } else {
        format!(
            "Two-pass query processed successfully. {} suggestions created.",
            suggestions_created
        )
    }
}

/// Maps generator states onto job progress
struct ProgressObserver<'a> {
    tracker: &'a JobTracker,
}

#[async_trait]
impl StateObserver for ProgressObserver<'_> {
    async fn on_state(&self, state: GenerationState) {
        let stage = match state {
            GenerationState::Start => QueryStage::Understanding,
            GenerationState::FileSelection => QueryStage::SelectingFiles,
            GenerationState::OperationGeneration => QueryStage::Generating,
            _ => return,
        };
        self.tracker.progress(stage.step(), stage.percent()).await;
    }
}

/// Query pipeline coordinator
pub struct QueryProcessor {
    records: Arc<dyn RecordStore>,
    generator: TwoPassGenerator,
    creator: SuggestionCreator,
}

impl QueryProcessor {
    pub fn new(records: Arc<dyn RecordStore>, generator: TwoPassGenerator, creator: SuggestionCreator) -> Self {
        Self {
            records,
            generator,
            creator,
        }
    }

    /// Run one query task to a terminal job state
    #[instrument(skip(self, request), fields(task_id = %request.task_id, repo_id = %request.repo_id))]
    pub async fn run(&self, request: QueryRequest) -> Result<QueryOutcome> {
        let tracker = JobTracker::new(self.records.clone(), request.task_id.clone());
        tracker.start(JobMetadata::for_repo(request.repo_id)).await;

        let started = Instant::now();
        let result = self.execute(&request, &tracker).await;
        metrics::record_query(
            started.elapsed().as_secs_f64(),
            result.as_ref().map(|o| o.suggestions_created).unwrap_or(0),
            result.is_ok(),
        );

        match &result {
            Ok(outcome) => {
                info!(
                    suggestions = outcome.suggestions_created,
                    files = outcome.files_to_edit.len(),
                    "Query processed"
                );
                tracker.complete(&outcome.message, outcome.metadata()).await;
            }
            Err(e) => tracker.fail(e).await,
        }

        result
    }

    async fn execute(&self, request: &QueryRequest, tracker: &JobTracker) -> Result<QueryOutcome> {
        let stage = QueryStage::WarmingUp;
        tracker.progress(stage.step(), stage.percent()).await;

        let repo = self
            .records
            .find_repo(request.repo_id)
            .await?
            .ok_or_else(|| AppError::not_found("repository", request.repo_id))?;

        let observer = ProgressObserver { tracker };
        let generation = self
            .generator
            .generate(repo.id, &request.query, &observer)
            .await?;

        if generation.state == GenerationState::FileSelectionEmpty {
            info!("No files selected for editing");
            return Ok(QueryOutcome::nothing_found());
        }

        let stage = QueryStage::Validating;
        tracker.progress(stage.step(), stage.percent()).await;
        let model_used = self.generator.model_name();
        let mut created = self
            .creator
            .create_from_operations(repo.id, request.reviewer_id, &generation.operations, model_used)
            .await;
        for diff in &generation.diffs {
            created.extend(
                self.creator
                    .create_from_diffs(repo.id, request.reviewer_id, diff, model_used)
                    .await,
            );
        }

        Ok(QueryOutcome {
            suggestions_created: created.len(),
            files_modified: created.len(),
            files_to_edit: generation.files,
            suggestion_ids: created.iter().map(|s| s.id).collect(),
            message: completion_message(created.len()),
        })
    }
}
