//! Synchronization errors

use orghier_core::HierarchyError;
use thiserror::Error;

/// Directory synchronization errors.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The directory service failed or returned something unusable
    #[error("Directory source error: {0}")]
    Source(String),

    /// The hierarchy rejected the update
    #[error(transparent)]
    Hierarchy(#[from] HierarchyError),
}

impl SyncError {
    /// Get error code for API responses.
    pub fn error_code(&self) -> &'static str {
        match self {
            SyncError::Source(_) => "DIRECTORY_SOURCE_ERROR",
            SyncError::Hierarchy(err) => err.error_code(),
        }
    }

    /// Whether retrying later might succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, SyncError::Source(_))
    }
}

/// Result type for synchronization operations.
pub type SyncResult<T> = Result<T, SyncError>;
