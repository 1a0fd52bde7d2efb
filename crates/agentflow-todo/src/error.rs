//! Error types for agentflow-todo

use thiserror::Error;

use crate::model::{TodoId, TodoState};

/// Errors that can occur in the todo persistence layer
#[derive(Error, Debug)]
pub enum TodoError {
    /// Todo id not present in the store
    #[error("todo not found: {0}")]
    NotFound(TodoId),

    /// Requested transition is not allowed by the automaton
    #[error("todo {id}: illegal transition {from} -> {to}")]
    InvalidTransition {
        id: TodoId,
        from: TodoState,
        to: TodoState,
    },

    /// A log record in the middle of the journal could not be decoded
    #[error("corrupt todo log at line {line}: {detail}")]
    CorruptLog { line: usize, detail: String },

    /// The serial writer lane has shut down
    #[error("todo store writer is closed")]
    Closed,

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Filesystem error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
