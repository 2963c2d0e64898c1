//! Core error type for Roomflow.
//!
//! `EngineError` is used by the stores, the flowchart engine and the task
//! queue. Expected step failures never surface here: handlers report them
//! through `NodeResult::failure` instead.

#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Bad template or step configuration, raised at authoring time.
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// The instance or graph is not in a state the operation can act on.
    #[error("Illegal state: {0}")]
    IllegalState(String),

    /// Unknown or duplicate node type in the handler registry.
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Completion error: {0}")]
    Completion(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<serde_json::Error> for EngineError {
    fn from(e: serde_json::Error) -> Self {
        EngineError::Internal(format!("JSON error: {}", e))
    }
}
