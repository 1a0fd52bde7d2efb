//! Result envelopes: the typed record of one terminal task instance.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::error::ErrorKind;
use crate::domain::task::{InstanceStatus, Task};

/// One piece of evidence cited by a specialist.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Evidence {
    pub origin: String,
    pub kind: String,
    pub reference: String,
    pub content_hash: String,
}

/// Finding severity, ordered from least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warn,
    Error,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Info => "info",
            Severity::Warn => "warn",
            Severity::Error => "error",
            Severity::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// A finding reported by a specialist or synthesized by the core.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub severity: Severity,
    pub kind: String,
    pub reference: String,
    #[serde(default)]
    pub content_hash: String,
    #[serde(default)]
    pub message: String,
    /// Specialist or component that produced the finding.
    #[serde(default)]
    pub origin: String,
}

impl Finding {
    pub fn new(severity: Severity, kind: impl Into<String>, reference: impl Into<String>) -> Self {
        Self {
            severity,
            kind: kind.into(),
            reference: reference.into(),
            content_hash: String::new(),
            message: String::new(),
            origin: String::new(),
        }
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = message.into();
        self
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    pub fn with_hash(mut self, hash: impl Into<String>) -> Self {
        self.content_hash = hash.into();
        self
    }

    /// Deduplication key.
    pub fn key(&self) -> (&str, &str, &str) {
        (&self.kind, &self.reference, &self.content_hash)
    }
}

/// Structured response recorded for exactly one terminal instance.
///
/// Synthetic envelopes stand in for nodes that were never dispatched
/// (skipped on upstream failure, cancelled before start); they are not counted
/// as instances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultEnvelope {
    pub instance_id: String,
    pub task_id: String,
    pub specialist_id: String,
    pub status: InstanceStatus,
    pub confidence: f64,
    pub success: bool,
    pub payload: serde_json::Value,
    pub evidence: Vec<Evidence>,
    pub findings: Vec<Finding>,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
    pub duration_ms: u64,
    pub tokens_used: u64,
    /// Worker reported that it changed tracked state.
    #[serde(default)]
    pub modified_state: bool,
    #[serde(default)]
    pub synthetic: bool,
}

impl ResultEnvelope {
    /// Failed envelope for a dispatched instance.
    pub fn failure(
        instance_id: impl Into<String>,
        task: &Task,
        status: InstanceStatus,
        kind: ErrorKind,
        message: impl Into<String>,
    ) -> Self {
        Self {
            instance_id: instance_id.into(),
            task_id: task.id.clone(),
            specialist_id: task.specialist_id.clone(),
            status,
            confidence: 0.0,
            success: false,
            payload: serde_json::Value::Null,
            evidence: Vec::new(),
            findings: Vec::new(),
            error_kind: Some(kind),
            error_message: Some(message.into()),
            duration_ms: 0,
            tokens_used: 0,
            modified_state: false,
            synthetic: false,
        }
    }

    /// Synthetic envelope for a node that was never dispatched.
    pub fn synthetic(task: &Task, status: InstanceStatus, kind: ErrorKind, message: impl Into<String>) -> Self {
        let mut env = Self::failure(format!("synthetic:{}", task.id), task, status, kind, message);
        env.synthetic = true;
        env
    }

    /// `UPSTREAM_FAILED` stand-in propagated to consumers of a failed node.
    pub fn upstream_failed(task: &Task, upstream_task: &str) -> Self {
        Self::synthetic(
            task,
            InstanceStatus::Cancelled,
            ErrorKind::UpstreamFailed,
            format!("upstream task {upstream_task} did not succeed"),
        )
    }

    /// Short human-readable title used in digests and reports.
    pub fn title(&self) -> String {
        match (&self.error_kind, self.success) {
            (_, true) => format!("{} ({}) ok, confidence {:.2}", self.task_id, self.specialist_id, self.confidence),
            (Some(kind), false) => format!("{} ({}) failed: {}", self.task_id, self.specialist_id, kind),
            (None, false) => format!("{} ({}) failed", self.task_id, self.specialist_id),
        }
    }

    /// Highest finding severity, if any.
    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn task() -> Task {
        Task {
            id: "t1".into(),
            specialist_id: "reviewer".into(),
            phase: 4,
            input_ref: None,
            resources: vec![],
            priority: 0,
            max_retries: 0,
            timeout: Duration::from_secs(1),
            parent: None,
            instruction: None,
        }
    }

    #[test]
    fn test_severity_order() {
        assert!(Severity::Info < Severity::Warn);
        assert!(Severity::Error < Severity::Critical);
        let json = serde_json::to_string(&Severity::Critical).unwrap();
        assert_eq!(json, r#""critical""#);
    }

    #[test]
    fn test_upstream_failed_is_synthetic() {
        let env = ResultEnvelope::upstream_failed(&task(), "t0");
        assert!(env.synthetic);
        assert!(!env.success);
        assert_eq!(env.error_kind, Some(ErrorKind::UpstreamFailed));
        assert!(env.error_message.unwrap().contains("t0"));
    }

    #[test]
    fn test_max_severity() {
        let mut env = ResultEnvelope::failure("i", &task(), InstanceStatus::Failed, ErrorKind::WorkerFailed, "x");
        assert_eq!(env.max_severity(), None);
        env.findings.push(Finding::new(Severity::Warn, "k", "r"));
        env.findings.push(Finding::new(Severity::Critical, "k2", "r"));
        assert_eq!(env.max_severity(), Some(Severity::Critical));
    }
}
