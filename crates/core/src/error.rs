//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown task status: {0}")]
    UnknownTaskStatus(String),

    #[error("unknown replica status: {0}")]
    UnknownReplicaStatus(String),

    #[error("unknown stage status: {0}")]
    UnknownStageStatus(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
