//! Error types for workflow-tracker.
//!
//! Internal layers return [`Result`]. The public tracker API converts every
//! error into a per-operation fallback value, so these rarely reach callers
//! (the exception is [`WorkflowTracker::start_workflow`]).
//!
//! [`WorkflowTracker::start_workflow`]: crate::tracker::WorkflowTracker::start_workflow

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid input: {0}")]
    Validation(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, Error>;
