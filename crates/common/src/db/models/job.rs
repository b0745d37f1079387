//! Job entity for queued index and query tasks

use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Job status enum
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }
}

impl From<String> for JobStatus {
    fn from(s: String) -> Self {
        match s.as_str() {
            "running" => JobStatus::Running,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            _ => JobStatus::Pending,
        }
    }
}

impl From<JobStatus> for String {
    fn from(status: JobStatus) -> Self {
        status.as_str().to_string()
    }
}

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false, column_type = "Text")]
    pub task_id: String,

    /// "index" or "query"
    #[sea_orm(column_type = "Text")]
    pub kind: String,

    #[sea_orm(column_type = "Text")]
    pub status: String,

    /// Fraction complete, 0..=1
    pub progress: f64,

    #[sea_orm(column_type = "JsonBinary")]
    pub metadata: Json,

    #[sea_orm(column_type = "Text", nullable)]
    pub error_msg: Option<String>,

    pub created_at: DateTimeWithTimeZone,

    pub updated_at: DateTimeWithTimeZone,
}

impl Model {
    /// Get the job status as an enum
    pub fn job_status(&self) -> JobStatus {
        JobStatus::from(self.status.clone())
    }

    /// Check if the job is in a terminal state
    pub fn is_terminal(&self) -> bool {
        self.job_status().is_terminal()
    }

    /// Progress as a percentage
    pub fn progress_percent(&self) -> f64 {
        (self.progress * 100.0).clamp(0.0, 100.0)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
