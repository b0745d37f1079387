//! Error types for Docflow
//!
//! Provides the error taxonomy shared by every crate:
//! - Provider failures (embedding/completion calls)
//! - Parse failures (model output that does not match a schema)
//! - Apply failures (anchor text that cannot be located)
//! - Missing records and unavailable stores
//! - Error codes for machine-readable identification

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias using AppError
pub type Result<T> = std::result::Result<T, AppError>;

/// Error codes for machine-readable error identification
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    // Validation errors (1xxx)
    ValidationError,
    InvalidFormat,

    // Model output errors (2xxx)
    ParseError,
    ApplyError,

    // Resource errors (4xxx)
    NotFound,
    RepositoryNotFound,
    FileNotFound,
    JobNotFound,

    // Store errors (7xxx)
    DatabaseError,
    ConnectionError,
    StoreError,

    // External service errors (8xxx)
    ProviderError,
    UpstreamError,
    QueueError,

    // Internal errors (9xxx)
    InternalError,
    ConfigurationError,
    SerializationError,
}

impl ErrorCode {
    /// Get the numeric code for this error
    pub fn as_code(&self) -> u16 {
        match self {
            ErrorCode::ValidationError => 1001,
            ErrorCode::InvalidFormat => 1002,

            ErrorCode::ParseError => 2001,
            ErrorCode::ApplyError => 2002,

            ErrorCode::NotFound => 4001,
            ErrorCode::RepositoryNotFound => 4002,
            ErrorCode::FileNotFound => 4003,
            ErrorCode::JobNotFound => 4004,

            ErrorCode::DatabaseError => 7001,
            ErrorCode::ConnectionError => 7002,
            ErrorCode::StoreError => 7003,

            ErrorCode::ProviderError => 8001,
            ErrorCode::UpstreamError => 8002,
            ErrorCode::QueueError => 8003,

            ErrorCode::InternalError => 9001,
            ErrorCode::ConfigurationError => 9002,
            ErrorCode::SerializationError => 9003,
        }
    }
}

/// Application error types
#[derive(Error, Debug)]
pub enum AppError {
    // Validation errors
    #[error("Validation failed: {message}")]
    Validation {
        message: String,
        field: Option<String>,
    },

    #[error("Invalid format: {message}")]
    InvalidFormat { message: String },

    // Model output errors
    #[error("Parse error: {message}")]
    Parse { message: String },

    #[error("Failed to apply operation on file {file}: {message}")]
    Apply {
        file: String,
        anchor: String,
        message: String,
    },

    // Resource errors
    #[error("Resource not found: {resource_type} with id {id}")]
    NotFound { resource_type: String, id: String },

    #[error("Job not found: {id}")]
    JobNotFound { id: String },

    // Store errors
    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Database connection error: {message}")]
    DatabaseConnection { message: String },

    #[error("Store unavailable: {message}")]
    Store { message: String },

    // External service errors
    #[error("{provider} provider error: {message}")]
    Provider { provider: String, message: String },

    #[error("Queue error: {message}")]
    QueueError { message: String },

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    // Internal errors
    #[error("Internal error: {message}")]
    Internal { message: String },

    #[error("Configuration error: {message}")]
    Configuration { message: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // Generic
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl AppError {
    /// Shorthand for a missing record
    pub fn not_found(resource_type: &str, id: impl ToString) -> Self {
        AppError::NotFound {
            resource_type: resource_type.to_string(),
            id: id.to_string(),
        }
    }

    /// Shorthand for a provider failure
    pub fn provider(provider: &str, message: impl Into<String>) -> Self {
        AppError::Provider {
            provider: provider.to_string(),
            message: message.into(),
        }
    }

    /// Get the error code for this error
    pub fn code(&self) -> ErrorCode {
        match self {
            AppError::Validation { .. } => ErrorCode::ValidationError,
            AppError::InvalidFormat { .. } => ErrorCode::InvalidFormat,
            AppError::Parse { .. } => ErrorCode::ParseError,
            AppError::Apply { .. } => ErrorCode::ApplyError,
            AppError::NotFound { resource_type, .. } => match resource_type.as_str() {
                "repository" => ErrorCode::RepositoryNotFound,
                "file" => ErrorCode::FileNotFound,
                _ => ErrorCode::NotFound,
            },
            AppError::JobNotFound { .. } => ErrorCode::JobNotFound,
            AppError::Database(_) => ErrorCode::DatabaseError,
            AppError::DatabaseConnection { .. } => ErrorCode::ConnectionError,
            AppError::Store { .. } => ErrorCode::StoreError,
            AppError::Provider { .. } => ErrorCode::ProviderError,
            AppError::QueueError { .. } => ErrorCode::QueueError,
            AppError::HttpClient(_) => ErrorCode::UpstreamError,
            AppError::Internal { .. } => ErrorCode::InternalError,
            AppError::Configuration { .. } => ErrorCode::ConfigurationError,
            AppError::Serialization(_) => ErrorCode::SerializationError,
            AppError::Other(_) => ErrorCode::InternalError,
        }
    }

    /// Transient failures that a retry loop may recover from
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            AppError::Provider { .. }
                | AppError::HttpClient(_)
                | AppError::Store { .. }
                | AppError::DatabaseConnection { .. }
                | AppError::QueueError { .. }
        )
    }

    /// Failures scoped to one chunk, file or operation batch.
    ///
    /// Callers log these and skip the unit instead of failing the job.
    pub fn is_item_local(&self) -> bool {
        matches!(
            self,
            AppError::Parse { .. } | AppError::Apply { .. } | AppError::NotFound { .. }
        )
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal {
            message: err.to_string(),
        }
    }
}

impl From<sqlx::migrate::MigrateError> for AppError {
    fn from(err: sqlx::migrate::MigrateError) -> Self {
        AppError::DatabaseConnection {
            message: format!("Migration failed: {}", err),
        }
    }
}
