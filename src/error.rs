//! Engine error kinds
//!
//! Each kind drives a different reaction at the API boundary: validation
//! errors never change state, conflicts map to illegal transitions, and
//! transient failures may be retried with a different strategy before
//! becoming fatal.

use thiserror::Error;

/// Errors surfaced by the engine facade and its components.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Rejected input (bad repo name, bad git URL, path traversal).
    /// Never changes any state.
    #[error("validation error: {0}")]
    Validation(String),

    /// Job or repository not present.
    #[error("not found: {0}")]
    NotFound(String),

    /// Entity already exists, or the job is not in a legal state for the
    /// requested transition.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Network or subprocess failure where a different strategy may still
    /// succeed (watcher -> reconcile, retry on rename).
    #[error("transient failure: {0}")]
    Transient(String),

    /// Unrecoverable error; the job ends failed with this text in its output.
    #[error(transparent)]
    Fatal(#[from] anyhow::Error),
}

pub type EngineResult<T> = Result<T, EngineError>;

impl EngineError {
    pub fn validation(msg: impl Into<String>) -> Self {
        EngineError::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        EngineError::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        EngineError::Conflict(msg.into())
    }

    pub fn transient(msg: impl Into<String>) -> Self {
        EngineError::Transient(msg.into())
    }
}
