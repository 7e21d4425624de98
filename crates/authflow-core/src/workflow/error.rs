//! Engine error taxonomy.

use authflow_types::error::{RepositoryError, TaskPayloadError};
use uuid::Uuid;

use super::tool::ToolError;

/// Errors raised by the workflow engine and by node handlers.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Bad intake, definition, configuration or payload. Never retried.
    #[error("validation error: {0}")]
    Validation(String),

    /// No outgoing edge of `node` matched the state.
    #[error("no route from node '{node}': {reason}")]
    Routing { node: String, reason: String },

    #[error("step limit of {limit} exceeded")]
    StepLimitExceeded { limit: u32 },

    #[error("tool error: {0}")]
    Tool(#[from] ToolError),

    #[error("reasoning output violated schema: {0}")]
    SchemaViolation(String),

    #[error("reasoning failed after {attempts} attempts: {last_error}")]
    ReasoningExhausted { attempts: u32, last_error: String },

    /// The store rejected or could not take a write.
    #[error("persistence error: {0}")]
    Persistence(String),

    #[error("instance {0} already has an open task")]
    TaskAlreadyOpen(Uuid),

    #[error("workflow instance not found: {0}")]
    InstanceNotFound(Uuid),

    #[error("workflow definition not found: {0}")]
    DefinitionNotFound(String),

    #[error("human task not found: {0}")]
    TaskNotFound(Uuid),

    #[error("human task {0} is not open")]
    TaskNotOpen(Uuid),

    /// The instance is not in a state that allows the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("node '{node}' failed: {message}")]
    NodeFailed { node: String, message: String },

    #[error("watch capacity of {0} reached")]
    WatchCapacityExceeded(usize),

    #[error("instance {0} was cancelled")]
    Cancelled(Uuid),
}

impl EngineError {
    /// Whether repeating the same call may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            EngineError::Tool(e) => e.is_transient(),
            EngineError::SchemaViolation(_) | EngineError::Persistence(_) => true,
            _ => false,
        }
    }

    /// Whether this error, surfacing from a node, marks the instance FAILED.
    ///
    /// Rejected requests and storage hiccups leave the instance where it was.
    pub fn is_instance_fatal(&self) -> bool {
        !matches!(
            self,
            EngineError::Persistence(_)
                | EngineError::TaskAlreadyOpen(_)
                | EngineError::TaskNotOpen(_)
                | EngineError::Cancelled(_)
        )
    }
}

impl From<RepositoryError> for EngineError {
    fn from(e: RepositoryError) -> Self {
        EngineError::Persistence(e.to_string())
    }
}

impl From<TaskPayloadError> for EngineError {
    fn from(e: TaskPayloadError) -> Self {
        EngineError::Validation(e.to_string())
    }
}
