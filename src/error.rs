//! Error types shared by every stage and sink of the pipeline.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Broad classification of a failure, surfaced in the terminal report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The pipeline could not be initialized.
    Startup,
    /// A record violated a hard input requirement.
    Input,
    /// A durable write failed.
    Storage,
}

/// The error type for all pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sink-csv")]
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[cfg(feature = "sink-sqlite")]
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[cfg(feature = "sink-mysql")]
    #[error("MySQL error: {0}")]
    Mysql(#[from] sqlx::Error),

    #[cfg(feature = "sink-mongo")]
    #[error("MongoDB error: {0}")]
    Mongo(#[from] mongodb::error::Error),

    #[error("record has no id")]
    MissingId,

    #[error("Record error: {0}")]
    Record(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Startup failed: {0}")]
    Startup(String),

    #[error("backing store {path:?} is malformed: {source}")]
    CorruptStore {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("sink '{sink}' timed out after {after:?}")]
    Timeout { sink: String, after: Duration },

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Maps this error onto the coarse category reported to the caller.
    pub fn category(&self) -> FailureKind {
        match self {
            PipelineError::MissingId | PipelineError::Record(_) => FailureKind::Input,
            PipelineError::Config(_)
            | PipelineError::Startup(_)
            | PipelineError::CorruptStore { .. } => FailureKind::Startup,
            _ => FailureKind::Storage,
        }
    }
}
