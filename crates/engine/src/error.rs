//! Error types shared across the engine.

use std::path::PathBuf;
use thiserror::Error;

/// Failure to read a persisted job record.
///
/// Readers must tell a missing record apart from one that exists but cannot
/// be decoded; both are otherwise treated as "no usable state".
#[derive(Error, Debug)]
pub enum StateError {
    #[error("job state not found: {path}")]
    NotFound { path: PathBuf },

    #[error("job state at {path} is invalid: {message}")]
    Invalid { path: PathBuf, message: String },

    #[error("I/O error on job state {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl StateError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, StateError::NotFound { .. })
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("job {0} not found")]
    JobNotFound(String),

    #[error("job {job_id} is already being tracked")]
    AlreadyActive { job_id: String },

    #[error("writer for job {0} has shut down")]
    WriterClosed(String),

    #[error(transparent)]
    State(#[from] StateError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
