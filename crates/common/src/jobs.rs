//! Job tracking
//!
//! A job row is created when a task is dispatched and mutated by the
//! running pipeline through a [`JobTracker`]. Callers poll it through
//! [`JobService::poll`].

use crate::db::models::{Job, JobStatus};
use crate::db::{JobUpdate, RecordStore};
use crate::errors::{AppError, Result};
use crate::queue::{RepoSource, TaskMessage, TaskQueue};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Typed job metadata, stored as the job's JSON blob
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct JobMetadata {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo_id: Option<Uuid>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_step: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completion_message: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestions_created: Option<usize>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_to_edit: Option<Vec<String>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suggestion_ids: Option<Vec<Uuid>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_processed: Option<usize>,

    /// Whether the indexed snapshot matched the previous root hash
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unchanged: Option<bool>,
}

impl JobMetadata {
    pub fn for_repo(repo_id: Uuid) -> Self {
        Self {
            repo_id: Some(repo_id),
            ..Self::default()
        }
    }

    /// Parse a stored blob, tolerating unknown or malformed content
    pub fn from_value(value: &serde_json::Value) -> Self {
        serde_json::from_value(value.clone()).unwrap_or_default()
    }

    pub fn to_value(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_else(|_| serde_json::json!({}))
    }

    /// Overlay the set fields of `other` onto `self`
    pub fn merge(&mut self, other: JobMetadata) {
        macro_rules! overlay {
            ($($field:ident),*) => {
                $(if other.$field.is_some() { self.$field = other.$field; })*
            };
        }
        overlay!(
            repo_id,
            current_step,
            completion_message,
            suggestions_created,
            files_to_edit,
            suggestion_ids,
            files_processed,
            unchanged
        );
    }
}

/// Progress callback bound to one task id.
///
/// Reporting never fails the pipeline: store errors are logged and
/// swallowed.
#[derive(Clone)]
pub struct JobTracker {
    store: Arc<dyn RecordStore>,
    task_id: String,
    metadata: Arc<std::sync::Mutex<JobMetadata>>,
}

impl JobTracker {
    pub fn new(store: Arc<dyn RecordStore>, task_id: impl Into<String>) -> Self {
        Self {
            store,
            task_id: task_id.into(),
            metadata: Arc::new(std::sync::Mutex::new(JobMetadata::default())),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    fn with_metadata(&self, update: JobMetadata) -> serde_json::Value {
        let mut guard = match self.metadata.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        guard.merge(update);
        guard.to_value()
    }

    async fn write(&self, update: JobUpdate) {
        if let Err(e) = self.store.update_job(&self.task_id, update).await {
            warn!(task_id = %self.task_id, error = %e, "Failed to update job");
        }
    }

    /// Load existing metadata and mark the job running
    pub async fn start(&self, initial: JobMetadata) {
        let mut seeded = match self.store.find_job(&self.task_id).await {
            Ok(Some(job)) => JobMetadata::from_value(&job.metadata),
            Ok(None) => JobMetadata::default(),
            Err(e) => {
                warn!(task_id = %self.task_id, error = %e, "Failed to load job");
                JobMetadata::default()
            }
        };
        seeded.merge(initial);
        let metadata = self.with_metadata(seeded);

        self.write(JobUpdate {
            status: Some(JobStatus::Running),
            progress: Some(0.0),
            metadata: Some(metadata),
            ..JobUpdate::default()
        })
        .await;
    }

    /// Report a named step with a percentage in 0..=100
    pub async fn progress(&self, step: &str, percent: u8) {
        info!(task_id = %self.task_id, step, percent, "Job progress");
        let metadata = self.with_metadata(JobMetadata {
            current_step: Some(step.to_string()),
            ..JobMetadata::default()
        });

        self.write(JobUpdate {
            status: Some(JobStatus::Running),
            progress: Some(f64::from(percent.min(100)) / 100.0),
            metadata: Some(metadata),
            ..JobUpdate::default()
        })
        .await;
    }

    /// Mark the job completed with its outcome
    pub async fn complete(&self, message: &str, outcome: JobMetadata) {
        let mut update = outcome;
        update.current_step = Some("Completed".to_string());
        update.completion_message = Some(message.to_string());
        let metadata = self.with_metadata(update);

        self.write(JobUpdate {
            status: Some(JobStatus::Completed),
            progress: Some(1.0),
            metadata: Some(metadata),
            ..JobUpdate::default()
        })
        .await;
    }

    /// Mark the job failed with the error message
    pub async fn fail<E: std::fmt::Display>(&self, error: E) {
        warn!(task_id = %self.task_id, error = %error, "Job failed");
        let metadata = self.with_metadata(JobMetadata {
            current_step: Some("Failed".to_string()),
            ..JobMetadata::default()
        });

        self.write(JobUpdate {
            status: Some(JobStatus::Failed),
            metadata: Some(metadata),
            error_msg: Some(error.to_string()),
            ..JobUpdate::default()
        })
        .await;
    }
}

/// Handle returned by a dispatch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobHandle {
    pub task_id: String,
    pub status: JobStatus,
}

/// Polled view of a job
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobView {
    pub task_id: String,
    pub status: JobStatus,
    /// Percentage, 0..=100
    pub progress: f64,
    pub step: Option<String>,
    pub error: Option<String>,
    pub metadata: JobMetadata,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        let metadata = JobMetadata::from_value(&job.metadata);
        Self {
            status: job.job_status(),
            progress: job.progress_percent(),
            step: metadata.current_step.clone(),
            error: job.error_msg,
            task_id: job.task_id,
            metadata,
        }
    }
}

/// Creates job rows, enqueues tasks and answers polls
#[derive(Clone)]
pub struct JobService {
    store: Arc<dyn RecordStore>,
    queue: Arc<dyn TaskQueue>,
}

impl JobService {
    pub fn new(store: Arc<dyn RecordStore>, queue: Arc<dyn TaskQueue>) -> Self {
        Self { store, queue }
    }

    async fn dispatch(&self, message: TaskMessage, metadata: JobMetadata) -> Result<JobHandle> {
        let job = self
            .store
            .create_job(message.task_id(), message.kind(), metadata.to_value())
            .await?;

        if let Err(e) = self.queue.enqueue(&message).await {
            let _ = self
                .store
                .update_job(
                    &job.task_id,
                    JobUpdate {
                        status: Some(JobStatus::Failed),
                        error_msg: Some(e.to_string()),
                        ..JobUpdate::default()
                    },
                )
                .await;
            return Err(e);
        }

        info!(task_id = %job.task_id, kind = %job.kind, "Task dispatched");
        Ok(JobHandle {
            task_id: job.task_id,
            status: JobStatus::Pending,
        })
    }

    /// Dispatch an index task for a repository
    pub async fn dispatch_index(
        &self,
        repo_id: Uuid,
        source: RepoSource,
        docs_directory: &str,
        soft_reindex: bool,
    ) -> Result<JobHandle> {
        let message = TaskMessage::Index {
            task_id: Uuid::new_v4().to_string(),
            repo_id,
            source,
            docs_directory: docs_directory.to_string(),
            soft_reindex,
        };
        self.dispatch(message, JobMetadata::for_repo(repo_id)).await
    }

    /// Dispatch a query task against a repository
    pub async fn dispatch_query(&self, query: &str, repo_id: Uuid, reviewer_id: Uuid) -> Result<JobHandle> {
        if query.trim().is_empty() {
            return Err(AppError::Validation {
                message: "query must not be empty".to_string(),
                field: Some("query".to_string()),
            });
        }

        let message = TaskMessage::Query {
            task_id: Uuid::new_v4().to_string(),
            query: query.to_string(),
            repo_id,
            reviewer_id,
        };
        self.dispatch(message, JobMetadata::for_repo(repo_id)).await
    }

    /// Current view of a job
    pub async fn poll(&self, task_id: &str) -> Result<JobView> {
        self.store
            .find_job(task_id)
            .await?
            .map(JobView::from)
            .ok_or_else(|| AppError::JobNotFound {
                id: task_id.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryRecordStore;
    use crate::queue::MemoryTaskQueue;

    fn service() -> (JobService, Arc<MemoryRecordStore>, Arc<MemoryTaskQueue>) {
        let store = Arc::new(MemoryRecordStore::new());
        let queue = Arc::new(MemoryTaskQueue::new());
        (JobService::new(store.clone(), queue.clone()), store, queue)
    }

    #[tokio::test]
    async fn test_dispatch_creates_pending_job_and_enqueues() {
        let (service, _, queue) = service();
        let repo_id = Uuid::new_v4();
        let handle = service
            .dispatch_query("add a FAQ entry", repo_id, Uuid::new_v4())
            .await
            .unwrap();

        assert_eq!(handle.status, JobStatus::Pending);
        assert_eq!(queue.pending_count(), 1);

        let view = service.poll(&handle.task_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Pending);
        assert_eq!(view.progress, 0.0);
        assert_eq!(view.metadata.repo_id, Some(repo_id));
    }

    #[tokio::test]
    async fn test_empty_query_rejected() {
        let (service, _, queue) = service();
        let err = service
            .dispatch_query("   ", Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, AppError::Validation { .. }));
        assert_eq!(queue.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_tracker_lifecycle() {
        let (service, store, _) = service();
        let handle = service
            .dispatch_index(
                Uuid::new_v4(),
                RepoSource {
                    full_name: "acme/docs".to_string(),
                    branch: "main".to_string(),
                    access_token: None,
                },
                "docs",
                false,
            )
            .await
            .unwrap();

        let tracker = JobTracker::new(store.clone(), handle.task_id.clone());
        tracker.start(JobMetadata::default()).await;
        tracker.progress("Processing files", 30).await;

        let view = service.poll(&handle.task_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Running);
        assert_eq!(view.progress, 30.0);
        assert_eq!(view.step.as_deref(), Some("Processing files"));
        // Dispatch metadata survives progress updates
        assert!(view.metadata.repo_id.is_some());

        tracker
            .complete(
                "done",
                JobMetadata {
                    files_processed: Some(2),
                    ..JobMetadata::default()
                },
            )
            .await;
        let view = service.poll(&handle.task_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Completed);
        assert_eq!(view.progress, 100.0);
        assert_eq!(view.metadata.files_processed, Some(2));
        assert_eq!(view.metadata.completion_message.as_deref(), Some("done"));
    }

    #[tokio::test]
    async fn test_fail_records_error() {
        let (service, store, _) = service();
        let handle = service
            .dispatch_query("q", Uuid::new_v4(), Uuid::new_v4())
            .await
            .unwrap();
        let tracker = JobTracker::new(store, handle.task_id.clone());
        tracker
            .fail(&AppError::Parse {
                message: "not a list".to_string(),
            })
            .await;

        let view = service.poll(&handle.task_id).await.unwrap();
        assert_eq!(view.status, JobStatus::Failed);
        assert!(view.error.unwrap().contains("not a list"));
    }

    #[tokio::test]
    async fn test_tracker_swallows_missing_job() {
        let store = Arc::new(MemoryRecordStore::new());
        let tracker = JobTracker::new(store, "missing");
        tracker.progress("anything", 10).await;
    }

    #[tokio::test]
    async fn test_poll_unknown_job() {
        let (service, _, _) = service();
        assert!(matches!(
            service.poll("nope").await.unwrap_err(),
            AppError::JobNotFound { .. }
        ));
    }
}
