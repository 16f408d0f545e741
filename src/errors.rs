// src/errors.rs

use thiserror::Error;

/// Error taxonomy surfaced by the stores and the command façade.
///
/// Callers branch on the variant to map results onto their own response
/// codes: not-found, conflict, validation, contention, and I/O are the five
/// categories; everything constructed here is carried inside `anyhow::Error`
/// and recoverable via `downcast_ref::<WorkflowError>()`.
#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("operation in progress: {0}")]
    Contention(String),

    #[error("apply failed: {0}")]
    ApplyFailed(String),
}

impl WorkflowError {
    pub fn not_found(what: impl Into<String>) -> anyhow::Error {
        WorkflowError::NotFound(what.into()).into()
    }

    pub fn conflict(reason: impl Into<String>) -> anyhow::Error {
        WorkflowError::Conflict(reason.into()).into()
    }

    pub fn validation(reason: impl Into<String>) -> anyhow::Error {
        WorkflowError::Validation(reason.into()).into()
    }

    pub fn contention(operation: impl Into<String>) -> anyhow::Error {
        WorkflowError::Contention(operation.into()).into()
    }

    pub fn apply_failed(reason: impl Into<String>) -> anyhow::Error {
        WorkflowError::ApplyFailed(reason.into()).into()
    }
}
