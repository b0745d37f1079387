//! Ingestion error types

use docflow_common::errors::AppError;
use thiserror::Error;
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum IngestionError {
    #[error("Repository not found: {0}")]
    RepoNotFound(Uuid),

    #[error("No files found for repository {0}. Cannot perform soft re-index.")]
    NothingToReindex(Uuid),

    #[error("Failed to clone repository {repo}: {message}")]
    Clone { repo: String, message: String },

    #[error("Chunking error: {0}")]
    Chunking(String),

    #[error(transparent)]
    App(#[from] AppError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<IngestionError> for AppError {
    fn from(e: IngestionError) -> Self {
        match e {
            IngestionError::RepoNotFound(id) => AppError::not_found("repository", id),
            IngestionError::NothingToReindex(_) => AppError::Validation {
                message: e.to_string(),
                field: Some("soft_reindex".to_string()),
            },
            IngestionError::App(inner) => inner,
            other => AppError::Internal {
                message: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_soft_reindex_message() {
        let id = Uuid::nil();
        let err = IngestionError::NothingToReindex(id);
        assert!(err.to_string().contains("Cannot perform soft re-index"));
        assert!(matches!(AppError::from(err), AppError::Validation { .. }));
    }

    #[test]
    fn test_app_error_passes_through() {
        let err = IngestionError::from(AppError::Store {
            message: "down".to_string(),
        });
        assert!(matches!(AppError::from(err), AppError::Store { .. }));
    }
}
