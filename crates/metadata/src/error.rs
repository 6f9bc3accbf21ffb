//! Metadata store error types.

use thiserror::Error;

/// Format offending ids for display, capping at MAX_DISPLAYED to prevent log bloat.
pub(crate) fn format_ids(ids: &[i64]) -> String {
    const MAX_DISPLAYED: usize = 5;
    if ids.len() <= MAX_DISPLAYED {
        format!("{:?}", ids)
    } else {
        let sample: Vec<_> = ids.iter().take(MAX_DISPLAYED).collect();
        format!("{:?} (and {} more)", sample, ids.len() - MAX_DISPLAYED)
    }
}

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// A uniqueness or referential constraint rejected a write because a
    /// concurrent writer got there first.
    #[error("conflict: {0}")]
    Conflict(String),

    /// A composite operation wrote some of its rows and could not undo them.
    #[error("{operation} left a partial write for task {task_id}: {detail}")]
    PartialWrite {
        operation: &'static str,
        task_id: i64,
        detail: String,
    },

    #[error("invalid state transition: {from} -> {to}")]
    InvalidStateTransition { from: String, to: String },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("replicas {} no longer exist", format_ids(.replica_ids))]
    MissingReplicas { replica_ids: Vec<i64> },
}

impl MetadataError {
    /// Whether the error stems from losing a race against a concurrent writer.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_) | Self::MissingReplicas { .. })
    }
}

impl From<stager_core::Error> for MetadataError {
    fn from(e: stager_core::Error) -> Self {
        match e {
            stager_core::Error::InvalidConfig(msg) => Self::Config(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(e: std::io::Error) -> Self {
        Self::Config(e.to_string())
    }
}

/// Classify constraint violations reported by the database as conflicts,
/// leaving every other failure as a database error.
pub(crate) fn classify(operation: &str, err: sqlx::Error) -> MetadataError {
    if let sqlx::Error::Database(db_err) = &err
        && (db_err.is_unique_violation() || db_err.is_foreign_key_violation())
    {
        return MetadataError::Conflict(format!("{operation}: {}", db_err.message()));
    }
    MetadataError::Database(err)
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
