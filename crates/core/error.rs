//! Error types for the rowq task queue.

use thiserror::Error;

/// Store-level and configuration errors.
///
/// Errors raised by a task body never take this shape; those are
/// [`TaskError`](crate::TaskError) and are recorded on the task row instead
/// of escaping the worker loop.
#[derive(Error, Debug)]
pub enum RowqError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Store-specific error (connection loss, lock timeout, bad SQL).
    #[error("Backend error: {0}")]
    Backend(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Task not found.
    #[error("Task not found: {0}")]
    TaskNotFound(String),

    /// A task kind was registered twice.
    #[error("Duplicate task kind: {0}")]
    DuplicateKind(String),
}

/// Result type alias using RowqError.
pub type Result<T> = std::result::Result<T, RowqError>;
