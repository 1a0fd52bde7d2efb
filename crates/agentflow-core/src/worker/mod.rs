//! Worker invocation contract.
//!
//! Specialists are opaque. The executor hands each instance a
//! [`WorkerRequest`], a [`HeartbeatSender`] and a cancellation token, and
//! expects one [`WorkerResponse`] back. Anything the worker returns is
//! validated before it becomes an envelope.

pub mod command;

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::context::ContextPackage;
use crate::domain::descriptor::SpecialistDescriptor;
use crate::domain::envelope::{Evidence, Finding};
use crate::domain::error::{ErrorKind, OrchestrationError, Result};

pub use command::CommandWorker;

/// Progress report from a running instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub instance_id: String,
    /// Fraction of work done, clamped to [0, 1].
    pub progress: f64,
    /// Number of beats sent so far.
    #[serde(default)]
    pub seq: u64,
}

/// Worker-side end of the heartbeat stream.
#[derive(Debug, Clone)]
pub struct HeartbeatSender {
    tx: Arc<watch::Sender<Heartbeat>>,
}

impl HeartbeatSender {
    /// New stream for `instance_id` plus the executor-side receiver.
    pub fn channel(instance_id: &str) -> (Self, watch::Receiver<Heartbeat>) {
        let (tx, rx) = watch::channel(Heartbeat {
            instance_id: instance_id.to_string(),
            progress: 0.0,
            seq: 0,
        });
        (Self { tx: Arc::new(tx) }, rx)
    }

    pub fn beat(&self, progress: f64) {
        let progress = if progress.is_finite() { progress.clamp(0.0, 1.0) } else { 0.0 };
        self.tx.send_modify(|hb| {
            hb.progress = progress;
            hb.seq += 1;
        });
    }
}

/// Request payload for one instance.
#[derive(Debug, Clone)]
pub struct WorkerRequest {
    pub instance_id: String,
    pub task_id: String,
    pub specialist_id: String,
    pub attempt: u32,
    pub deadline: DateTime<Utc>,
    pub context_package: Arc<ContextPackage>,
    /// Content address of `context_package`.
    pub package_ref: String,
    pub forbidden_callees: Vec<String>,
    /// Descriptor snapshot the instance was planned against.
    pub descriptor: Arc<SpecialistDescriptor>,
}

/// Response payload from one instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerResponse {
    pub confidence: f64,
    pub success: bool,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub evidence: Vec<Evidence>,
    #[serde(default)]
    pub findings: Vec<Finding>,
    #[serde(default)]
    pub error_kind: Option<ErrorKind>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub tokens_used: u64,
    /// Specialists this worker asked to have invoked. Never run in-phase.
    #[serde(default)]
    pub spawn_requests: Vec<String>,
    /// The worker changed tracked state (drives the phase-8 handoff).
    #[serde(default)]
    pub modified_state: bool,
}

impl WorkerResponse {
    pub fn ok(confidence: f64, payload: Value) -> Self {
        Self {
            confidence,
            success: true,
            payload,
            evidence: Vec::new(),
            findings: Vec::new(),
            error_kind: None,
            error_message: None,
            tokens_used: 0,
            spawn_requests: Vec::new(),
            modified_state: false,
        }
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            error_kind: Some(ErrorKind::WorkerFailed),
            error_message: Some(message.into()),
            ..Self::ok(0.0, Value::Null)
        }
    }

    pub fn with_evidence(mut self, evidence: Evidence) -> Self {
        self.evidence.push(evidence);
        self
    }

    pub fn with_finding(mut self, finding: Finding) -> Self {
        self.findings.push(finding);
        self
    }

    pub fn with_tokens(mut self, tokens: u64) -> Self {
        self.tokens_used = tokens;
        self
    }

    pub fn with_spawn_request(mut self, specialist_id: impl Into<String>) -> Self {
        self.spawn_requests.push(specialist_id.into());
        self
    }

    pub fn modifying_state(mut self) -> Self {
        self.modified_state = true;
        self
    }

    /// Structural checks applied on receipt.
    pub fn validate(&self) -> Result<()> {
        if !self.confidence.is_finite() || !(0.0..=1.0).contains(&self.confidence) {
            return Err(OrchestrationError::InvalidResponse(format!(
                "confidence {} outside [0, 1]",
                self.confidence
            )));
        }
        if let Some(e) = self
            .evidence
            .iter()
            .find(|e| e.origin.trim().is_empty() || e.kind.trim().is_empty() || e.reference.trim().is_empty())
        {
            return Err(OrchestrationError::InvalidResponse(format!(
                "evidence entry is missing origin, kind or reference: {e:?}"
            )));
        }
        if self.success && self.error_kind.is_some() {
            return Err(OrchestrationError::InvalidResponse(
                "successful response carries an error kind".into(),
            ));
        }
        Ok(())
    }
}

/// A specialist implementation.
#[async_trait]
pub trait SpecialistWorker: Send + Sync {
    /// Run one instance. Must observe `cancel` at its own suspension points.
    async fn invoke(
        &self,
        request: WorkerRequest,
        heartbeat: HeartbeatSender,
        cancel: CancellationToken,
    ) -> anyhow::Result<WorkerResponse>;
}

type WorkerFn = dyn Fn(WorkerRequest, HeartbeatSender, CancellationToken) -> BoxFuture<'static, anyhow::Result<WorkerResponse>>
    + Send
    + Sync;

/// Worker backed by an async closure.
#[derive(Clone)]
pub struct FnWorker {
    f: Arc<WorkerFn>,
}

impl FnWorker {
    pub fn new<F, Fut>(f: F) -> Self
    where
        F: Fn(WorkerRequest, HeartbeatSender, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<WorkerResponse>> + Send + 'static,
    {
        Self {
            f: Arc::new(move |req, hb, cancel| Box::pin(f(req, hb, cancel))),
        }
    }
}

impl fmt::Debug for FnWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnWorker")
    }
}

#[async_trait]
impl SpecialistWorker for FnWorker {
    async fn invoke(
        &self,
        request: WorkerRequest,
        heartbeat: HeartbeatSender,
        cancel: CancellationToken,
    ) -> anyhow::Result<WorkerResponse> {
        (self.f)(request, heartbeat, cancel).await
    }
}

/// Succeeds immediately with a fixed confidence. Used by `run --dry-run`.
#[derive(Debug, Clone, Copy)]
pub struct DryRunWorker {
    pub confidence: f64,
}

impl Default for DryRunWorker {
    fn default() -> Self {
        Self { confidence: 0.9 }
    }
}

#[async_trait]
impl SpecialistWorker for DryRunWorker {
    async fn invoke(
        &self,
        request: WorkerRequest,
        heartbeat: HeartbeatSender,
        _cancel: CancellationToken,
    ) -> anyhow::Result<WorkerResponse> {
        heartbeat.beat(1.0);
        Ok(WorkerResponse::ok(
            self.confidence,
            json!({
                "dry_run": true,
                "specialist": request.specialist_id,
                "task": request.task_id,
            }),
        ))
    }
}

/// Maps specialists to workers.
///
/// Resolution order: an explicit registration, then the descriptor's
/// `command`, then the fallback.
#[derive(Clone, Default)]
pub struct WorkerSet {
    by_specialist: HashMap<String, Arc<dyn SpecialistWorker>>,
    fallback: Option<Arc<dyn SpecialistWorker>>,
}

impl fmt::Debug for WorkerSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut ids: Vec<&String> = self.by_specialist.keys().collect();
        ids.sort();
        f.debug_struct("WorkerSet")
            .field("specialists", &ids)
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

impl WorkerSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, specialist_id: impl Into<String>, worker: impl SpecialistWorker + 'static) -> Self {
        self.by_specialist.insert(specialist_id.into(), Arc::new(worker));
        self
    }

    pub fn with_fallback(mut self, worker: impl SpecialistWorker + 'static) -> Self {
        self.fallback = Some(Arc::new(worker));
        self
    }

    pub fn resolve(&self, descriptor: &SpecialistDescriptor) -> Option<Arc<dyn SpecialistWorker>> {
        if let Some(w) = self.by_specialist.get(&descriptor.id) {
            return Some(Arc::clone(w));
        }
        if !descriptor.command.is_empty() {
            return Some(Arc::new(CommandWorker::new(descriptor.command.clone())));
        }
        self.fallback.clone()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::domain::request::RunRequest;

    pub(crate) fn request_for(specialist: &str) -> WorkerRequest {
        let descriptor = Arc::new(SpecialistDescriptor::new(specialist, "test"));
        WorkerRequest {
            instance_id: "inst-test".into(),
            task_id: "t".into(),
            specialist_id: specialist.into(),
            attempt: 0,
            deadline: Utc::now(),
            context_package: Arc::new(ContextPackage {
                specialist_id: specialist.into(),
                request: RunRequest::new("test"),
                instruction: None,
                upstream: Vec::new(),
                indirect: Vec::new(),
                forbidden_callees: Vec::new(),
                token_budget: 100,
                estimated_tokens: 0,
                truncated: false,
            }),
            package_ref: "0".repeat(64),
            forbidden_callees: Vec::new(),
            descriptor,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_out_of_range_confidence() {
        assert!(WorkerResponse::ok(1.2, Value::Null).validate().is_err());
        assert!(WorkerResponse::ok(f64::NAN, Value::Null).validate().is_err());
        assert!(WorkerResponse::ok(0.0, Value::Null).validate().is_ok());
        assert!(WorkerResponse::ok(1.0, Value::Null).validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_empty_evidence_reference() {
        let resp = WorkerResponse::ok(0.5, Value::Null).with_evidence(Evidence {
            origin: "reviewer".into(),
            kind: "file".into(),
            reference: " ".into(),
            content_hash: "abc".into(),
        });
        let err = resp.validate().unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidResponse);
    }

    #[test]
    fn test_response_deserializes_with_defaults() {
        let resp: WorkerResponse = serde_json::from_str(r#"{"confidence":0.7,"success":true}"#).unwrap();
        assert!(resp.success);
        assert!(resp.evidence.is_empty());
        assert!(resp.spawn_requests.is_empty());
    }

    #[test]
    fn test_heartbeat_clamps_and_counts() {
        let (hb, rx) = HeartbeatSender::channel("i1");
        hb.beat(2.0);
        hb.beat(0.25);
        let last = rx.borrow().clone();
        assert_eq!(last.seq, 2);
        assert_eq!(last.progress, 0.25);
        assert_eq!(last.instance_id, "i1");
    }

    #[tokio::test]
    async fn test_fn_and_dry_run_workers() {
        let w = FnWorker::new(|req, hb, _cancel| async move {
            hb.beat(0.5);
            Ok(WorkerResponse::ok(0.8, json!({ "echo": req.specialist_id })))
        });
        let (hb, _rx) = HeartbeatSender::channel("i");
        let resp = w
            .invoke(testing::request_for("writer"), hb.clone(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(resp.payload["echo"], "writer");

        let resp = DryRunWorker::default()
            .invoke(testing::request_for("writer"), hb, CancellationToken::new())
            .await
            .unwrap();
        assert!(resp.success);
        assert_eq!(resp.payload["dry_run"], true);
    }

    #[test]
    fn test_worker_set_resolution_order() {
        let set = WorkerSet::new()
            .with("writer", DryRunWorker::default())
            .with_fallback(DryRunWorker { confidence: 0.1 });
        assert!(set.resolve(&SpecialistDescriptor::new("writer", "docs")).is_some());
        assert!(set.resolve(&SpecialistDescriptor::new("other", "docs")).is_some());
        assert!(WorkerSet::new().resolve(&SpecialistDescriptor::new("other", "docs")).is_none());

        let mut with_cmd = SpecialistDescriptor::new("ext", "docs");
        with_cmd.command = vec!["true".into()];
        assert!(WorkerSet::new().resolve(&with_cmd).is_some());
    }
}
