use thiserror::Error;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database connection error")]
    Connection,

    #[error("query error: {0}")]
    Query(String),

    #[error("entity not found")]
    NotFound,

    #[error("conflict: {0}")]
    Conflict(String),
}

/// Errors raised while validating a task payload or resolution.
#[derive(Debug, Error, PartialEq)]
pub enum TaskPayloadError {
    #[error("payload field '{field}' is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("payload type '{actual}' does not match task type '{expected}'")]
    TypeMismatch { expected: String, actual: String },
}
