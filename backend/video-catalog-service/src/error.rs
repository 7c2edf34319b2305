/// Error types for the video catalog service.
///
/// Every command and stage operation returns [`AppError`]; callers branch on
/// [`AppError::kind`] to decide between retrying and surfacing the failure.
use std::fmt;
use std::time::Duration;
use thiserror::Error;

use crate::db::StoreError;
use crate::events::EventBuildError;
use crate::models::ParseEnumError;

/// Result type for catalog operations
pub type Result<T> = std::result::Result<T, AppError>;

#[derive(Debug, Error)]
pub enum AppError {
    /// Bad input; never retried automatically
    #[error("Validation error: {0}")]
    Validation(String),

    /// Optimistic-concurrency or state precondition failed
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Deadline expired; the transaction was rolled back
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Error category, stable across messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Validation,
    Conflict,
    NotFound,
    Timeout,
    Internal,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Conflict => "conflict",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl AppError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            AppError::Validation(_) => ErrorKind::Validation,
            AppError::Conflict(_) => ErrorKind::Conflict,
            AppError::NotFound(_) => ErrorKind::NotFound,
            AppError::Timeout(_) => ErrorKind::Timeout,
            AppError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Timeouts can be retried as-is; conflicts after re-reading state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::Timeout(_) | AppError::Conflict(_))
    }

    pub fn validation(msg: impl Into<String>) -> Self {
        AppError::Validation(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        AppError::Conflict(msg.into())
    }
}

impl From<StoreError> for AppError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Duplicate(what) => AppError::Conflict(format!("{what} already exists")),
            StoreError::WriteConflict(msg) => AppError::Conflict(msg),
            other => {
                tracing::error!(error = %other, "Storage failure");
                AppError::Internal("storage failure".to_string())
            }
        }
    }
}

impl From<validator::ValidationErrors> for AppError {
    fn from(err: validator::ValidationErrors) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<ParseEnumError> for AppError {
    fn from(err: ParseEnumError) -> Self {
        AppError::Validation(err.to_string())
    }
}

impl From<EventBuildError> for AppError {
    fn from(err: EventBuildError) -> Self {
        match err {
            EventBuildError::EmptyChangeset => AppError::Validation("no fields to update".into()),
            other => AppError::Internal(other.to_string()),
        }
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(format!("event encoding failed: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_conflicts_surface_as_conflict() {
        let err: AppError = StoreError::Duplicate("video 1".into()).into();
        assert_eq!(err.kind(), ErrorKind::Conflict);

        let err: AppError = StoreError::WriteConflict("lost race".into()).into();
        assert!(err.is_retryable());
    }

    #[test]
    fn test_storage_failures_are_opaque() {
        let err: AppError = StoreError::Unavailable("db down".into()).into();
        assert_eq!(err.kind(), ErrorKind::Internal);
        assert!(!err.to_string().contains("db down"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_timeout_is_retryable() {
        assert!(AppError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!AppError::validation("bad").is_retryable());
    }
}
