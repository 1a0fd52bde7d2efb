//! Domain-level error taxonomy for agentflow.

use serde::{Deserialize, Serialize};

use crate::arbiter::ArbiterError;
use crate::artifacts::ArtifactError;

/// Machine-readable error kind attached to envelopes, phase records and run outcomes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorKind {
    UnknownAgent,
    InvalidDescriptor,
    InvalidPlan,
    ForbiddenCallee,
    ResourceUnavailable,
    AcquireTimeout,
    DeadlockAbort,
    LeaseExpired,
    WorkerTimeout,
    WorkerPanic,
    WorkerFailed,
    InvalidResponse,
    UpstreamFailed,
    Cancelled,
    ConsensusLow,
    AuditFailed,
    RunAborted,
    Internal,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::UnknownAgent => "UNKNOWN_AGENT",
            ErrorKind::InvalidDescriptor => "INVALID_DESCRIPTOR",
            ErrorKind::InvalidPlan => "INVALID_PLAN",
            ErrorKind::ForbiddenCallee => "FORBIDDEN_CALLEE",
            ErrorKind::ResourceUnavailable => "RESOURCE_UNAVAILABLE",
            ErrorKind::AcquireTimeout => "ACQUIRE_TIMEOUT",
            ErrorKind::DeadlockAbort => "DEADLOCK_ABORT",
            ErrorKind::LeaseExpired => "LEASE_EXPIRED",
            ErrorKind::WorkerTimeout => "WORKER_TIMEOUT",
            ErrorKind::WorkerPanic => "WORKER_PANIC",
            ErrorKind::WorkerFailed => "WORKER_FAILED",
            ErrorKind::InvalidResponse => "INVALID_RESPONSE",
            ErrorKind::UpstreamFailed => "UPSTREAM_FAILED",
            ErrorKind::Cancelled => "CANCELLED",
            ErrorKind::ConsensusLow => "CONSENSUS_LOW",
            ErrorKind::AuditFailed => "AUDIT_FAILED",
            ErrorKind::RunAborted => "RUN_ABORTED",
            ErrorKind::Internal => "INTERNAL",
        }
    }

    /// Resource and timeout kinds are retried locally with backoff.
    pub fn is_recoverable(self) -> bool {
        matches!(
            self,
            ErrorKind::ResourceUnavailable
                | ErrorKind::AcquireTimeout
                | ErrorKind::DeadlockAbort
                | ErrorKind::LeaseExpired
                | ErrorKind::WorkerTimeout
                | ErrorKind::WorkerPanic
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// agentflow orchestration errors.
#[derive(Debug, thiserror::Error)]
pub enum OrchestrationError {
    #[error("unknown agent: {0}")]
    UnknownAgent(String),

    #[error("invalid descriptor {origin}: {reason}")]
    InvalidDescriptor { origin: String, reason: String },

    #[error("invalid plan: {0}")]
    InvalidPlan(String),

    #[error("forbidden callee: {caller} may not invoke {callee}")]
    ForbiddenCallee { caller: String, callee: String },

    #[error("invalid worker response: {0}")]
    InvalidResponse(String),

    #[error("context for {specialist} needs {needed} tokens, budget is {budget}")]
    ContextOverflow { specialist: String, budget: u32, needed: u64 },

    #[error("canonical JSON error: {0}")]
    Canonicalization(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("resource arbiter: {0}")]
    Arbiter(#[from] ArbiterError),

    #[error("artifact store: {0}")]
    Artifact(#[from] ArtifactError),

    #[error("todo store: {0}")]
    Todo(#[from] agentflow_todo::TodoError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl OrchestrationError {
    /// The machine-readable kind surfaced for this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            OrchestrationError::UnknownAgent(_) => ErrorKind::UnknownAgent,
            OrchestrationError::InvalidDescriptor { .. } => ErrorKind::InvalidDescriptor,
            OrchestrationError::InvalidPlan(_) => ErrorKind::InvalidPlan,
            OrchestrationError::ForbiddenCallee { .. } => ErrorKind::ForbiddenCallee,
            OrchestrationError::InvalidResponse(_) => ErrorKind::InvalidResponse,
            OrchestrationError::ContextOverflow { .. } => ErrorKind::InvalidDescriptor,
            OrchestrationError::Arbiter(e) => e.kind(),
            OrchestrationError::Canonicalization(_)
            | OrchestrationError::Config(_)
            | OrchestrationError::Artifact(_)
            | OrchestrationError::Todo(_)
            | OrchestrationError::Serialization(_)
            | OrchestrationError::Io(_)
            | OrchestrationError::Internal(_) => ErrorKind::Internal,
        }
    }

    pub(crate) fn invalid_descriptor(origin: impl Into<String>, reason: impl Into<String>) -> Self {
        OrchestrationError::InvalidDescriptor {
            origin: origin.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for agentflow domain operations.
pub type Result<T> = std::result::Result<T, OrchestrationError>;
