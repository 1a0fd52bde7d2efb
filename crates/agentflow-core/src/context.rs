//! Context package builder.
//!
//! One package per downstream invocation, sized to the specialist's token
//! budget:
//! 1. the user request, verbatim;
//! 2. every direct predecessor's envelope, payloads summarized when the total
//!    exceeds what the budget leaves;
//! 3. a digest (title plus findings) of each indirect predecessor;
//! 4. the specialist's forbidden callees.
//!
//! The assembled estimate never exceeds the budget. Payloads are summarized
//! first, then indirect findings and upstream evidence lists are dropped.
//!
//! A package is identified by the digest of its canonical JSON. Identical
//! packages built for sibling instances share one `Arc`.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::artifacts::{put_json, ArtifactStore};
use crate::domain::descriptor::SpecialistDescriptor;
use crate::domain::envelope::{Evidence, Finding, ResultEnvelope};
use crate::domain::error::{OrchestrationError, Result};
use crate::domain::request::RunRequest;
use crate::domain::task::Task;

/// Rough token estimate: four characters per token.
pub fn estimate_tokens(text: &str) -> u64 {
    (text.chars().count() as u64).div_ceil(4)
}

fn value_tokens(value: &Value) -> u64 {
    estimate_tokens(&value.to_string())
}

/// Direct predecessor output as seen by the consumer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpstreamEntry {
    pub task_id: String,
    pub specialist_id: String,
    pub success: bool,
    pub confidence: f64,
    pub payload: Value,
    pub evidence: Vec<Evidence>,
    pub findings: Vec<Finding>,
    /// Payload was replaced by a summary.
    pub summarized: bool,
}

/// Compressed view of an indirect predecessor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndirectDigest {
    pub task_id: String,
    pub title: String,
    pub findings: Vec<Finding>,
}

/// Bundle handed to one specialist invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextPackage {
    pub specialist_id: String,
    pub request: RunRequest,
    pub instruction: Option<String>,
    pub upstream: Vec<UpstreamEntry>,
    pub indirect: Vec<IndirectDigest>,
    pub forbidden_callees: Vec<String>,
    pub token_budget: u32,
    pub estimated_tokens: u64,
    pub truncated: bool,
}

/// Shrinks a payload to fit a token allowance.
pub trait Summarizer: Send + Sync {
    fn summarize(&self, payload: &Value, max_tokens: u64) -> Value;
}

/// Keeps a prefix of the serialized payload, shortened until the wrapped
/// summary itself fits in `max_tokens`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TruncatingSummarizer;

impl Summarizer for TruncatingSummarizer {
    fn summarize(&self, payload: &Value, max_tokens: u64) -> Value {
        let text = payload.to_string();
        let original_tokens = estimate_tokens(&text);
        if original_tokens <= max_tokens {
            return payload.clone();
        }
        let mut keep = usize::try_from(max_tokens.saturating_mul(4)).unwrap_or(usize::MAX);
        loop {
            let head: String = text.chars().take(keep).collect();
            let summary = json!({
                "summary": head,
                "truncated": true,
                "original_tokens": original_tokens,
            });
            let tokens = value_tokens(&summary);
            if tokens <= max_tokens || keep == 0 {
                return summary;
            }
            // Escaping makes the serialized head longer than `keep`.
            let excess = usize::try_from((tokens - max_tokens).saturating_mul(4)).unwrap_or(usize::MAX);
            keep = keep.saturating_sub(excess.max(1));
        }
    }
}

/// Package plus its content address.
#[derive(Debug, Clone)]
pub struct PackageRef {
    pub digest: String,
    pub package: Arc<ContextPackage>,
}

pub struct ContextPackageBuilder {
    artifacts: Arc<dyn ArtifactStore>,
    summarizers: HashMap<String, Arc<dyn Summarizer>>,
    default_summarizer: Arc<dyn Summarizer>,
    cache: Mutex<HashMap<String, Arc<ContextPackage>>>,
}

impl std::fmt::Debug for ContextPackageBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContextPackageBuilder")
            .field("summarizers", &self.summarizers.keys().collect::<Vec<_>>())
            .field("cached", &self.cache.lock().len())
            .finish()
    }
}

impl ContextPackageBuilder {
    pub fn new(artifacts: Arc<dyn ArtifactStore>) -> Self {
        Self {
            artifacts,
            summarizers: HashMap::new(),
            default_summarizer: Arc::new(TruncatingSummarizer),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Use `summarizer` for payloads produced by `specialist_id`.
    pub fn with_summarizer(mut self, specialist_id: impl Into<String>, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizers.insert(specialist_id.into(), summarizer);
        self
    }

    /// Number of distinct packages built so far.
    pub fn distinct_packages(&self) -> usize {
        self.cache.lock().len()
    }

    pub fn artifacts(&self) -> &Arc<dyn ArtifactStore> {
        &self.artifacts
    }

    fn summarizer_for(&self, specialist_id: &str) -> &Arc<dyn Summarizer> {
        self.summarizers.get(specialist_id).unwrap_or(&self.default_summarizer)
    }

    /// Build (or reuse) the package for one invocation of `task`.
    ///
    /// Fails with [`OrchestrationError::ContextOverflow`] when even the
    /// request, instruction and stripped upstream entries exceed the budget.
    pub fn build(
        &self,
        request: &RunRequest,
        descriptor: &SpecialistDescriptor,
        task: &Task,
        direct: &[&ResultEnvelope],
        indirect: &[&ResultEnvelope],
    ) -> Result<PackageRef> {
        let mut direct: Vec<&ResultEnvelope> = direct.to_vec();
        direct.sort_by(|a, b| a.task_id.cmp(&b.task_id));
        let mut indirect: Vec<&ResultEnvelope> = indirect.to_vec();
        indirect.sort_by(|a, b| a.task_id.cmp(&b.task_id));

        let indirect: Vec<IndirectDigest> = indirect
            .into_iter()
            .map(|e| IndirectDigest {
                task_id: e.task_id.clone(),
                title: e.title(),
                findings: e.findings.clone(),
            })
            .collect();

        let mut package = ContextPackage {
            specialist_id: descriptor.id.clone(),
            request: request.clone(),
            instruction: task.instruction.clone(),
            upstream: direct
                .iter()
                .map(|e| UpstreamEntry {
                    task_id: e.task_id.clone(),
                    specialist_id: e.specialist_id.clone(),
                    success: e.success,
                    confidence: e.confidence,
                    payload: e.payload.clone(),
                    evidence: e.evidence.clone(),
                    findings: e.findings.clone(),
                    summarized: false,
                })
                .collect(),
            indirect,
            forbidden_callees: descriptor.forbidden_callees.iter().cloned().collect(),
            token_budget: descriptor.token_budget,
            estimated_tokens: 0,
            truncated: false,
        };
        measure(&mut package)?;
        self.fit_to_budget(&mut package, &direct)?;

        let digest = put_json(self.artifacts.as_ref(), &package)?.to_hex();
        let package = self
            .cache
            .lock()
            .entry(digest.clone())
            .or_insert_with(|| Arc::new(package))
            .clone();
        Ok(PackageRef { digest, package })
    }
}

impl ContextPackageBuilder {
    /// Shrink `package` until its estimate is within the token budget.
    ///
    /// Payloads are summarized first with a shrinking per-entry share, then
    /// indirect digests lose their findings, then upstream entries lose
    /// their evidence lists. A package that still does not fit is an error.
    fn fit_to_budget(&self, package: &mut ContextPackage, direct: &[&ResultEnvelope]) -> Result<()> {
        let budget = u64::from(package.token_budget);
        if package.estimated_tokens <= budget {
            return Ok(());
        }

        if !direct.is_empty() {
            let n = direct.len() as u64;
            let payload_total: u64 = direct.iter().map(|e| value_tokens(&e.payload)).sum();
            let fixed = package.estimated_tokens.saturating_sub(payload_total);
            let mut share = budget.saturating_sub(fixed) / n;
            loop {
                for (entry, env) in package.upstream.iter_mut().zip(direct) {
                    let over = value_tokens(&env.payload) > share;
                    entry.payload = if over {
                        self.summarizer_for(&env.specialist_id).summarize(&env.payload, share)
                    } else {
                        env.payload.clone()
                    };
                    entry.summarized = over;
                }
                package.truncated = package.upstream.iter().any(|e| e.summarized);
                measure(package)?;
                if package.estimated_tokens <= budget || share == 0 {
                    break;
                }
                let excess = package.estimated_tokens - budget;
                share = share.saturating_sub(excess.div_ceil(n).max(1));
            }
        }

        if package.estimated_tokens > budget && package.indirect.iter().any(|d| !d.findings.is_empty()) {
            for digest in &mut package.indirect {
                digest.findings.clear();
            }
            package.truncated = true;
            measure(package)?;
        }

        if package.estimated_tokens > budget && package.upstream.iter().any(|e| !e.evidence.is_empty()) {
            for entry in &mut package.upstream {
                entry.evidence.clear();
            }
            package.truncated = true;
            measure(package)?;
        }

        if package.estimated_tokens > budget {
            return Err(OrchestrationError::ContextOverflow {
                specialist: package.specialist_id.clone(),
                budget: package.token_budget,
                needed: package.estimated_tokens,
            });
        }
        Ok(())
    }
}

fn measure(package: &mut ContextPackage) -> Result<()> {
    package.estimated_tokens = value_tokens(&serde_json::to_value(&*package)?);
    package.estimated_tokens = value_tokens(&serde_json::to_value(&*package)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::memory::MemoryArtifactStore;
    use crate::domain::envelope::Severity;
    use crate::domain::error::ErrorKind;
    use crate::domain::task::InstanceStatus;
    use crate::graph::test_task;

    fn envelope(task_id: &str, payload: Value) -> ResultEnvelope {
        let task = test_task(task_id, "writer");
        let mut env = ResultEnvelope::failure("i", &task, InstanceStatus::Completed, ErrorKind::Internal, "");
        env.success = true;
        env.error_kind = None;
        env.error_message = None;
        env.confidence = 0.9;
        env.payload = payload;
        env
    }

    fn builder() -> ContextPackageBuilder {
        ContextPackageBuilder::new(Arc::new(MemoryArtifactStore::new()))
    }

    #[test]
    fn test_package_carries_request_and_forbidden_callees() {
        let b = builder();
        let req = RunRequest::new("summarize the repo");
        let d = SpecialistDescriptor::new("reviewer", "review").with_forbidden_callees(["project-orchestrator"]);
        let up = envelope("draft", json!({"text": "short"}));
        let pkg = b.build(&req, &d, &test_task("review", "reviewer"), &[&up], &[]).unwrap();

        assert_eq!(pkg.package.request, req);
        assert_eq!(pkg.package.forbidden_callees, vec!["project-orchestrator".to_string()]);
        assert_eq!(pkg.package.upstream.len(), 1);
        assert!(!pkg.package.truncated);
        assert_eq!(pkg.digest.len(), 64);
    }

    #[test]
    fn test_oversized_payload_is_summarized_within_budget() {
        let b = builder();
        let req = RunRequest::new("x");
        let d = SpecialistDescriptor::new("reviewer", "review").with_token_budget(200);
        let big = envelope("draft", json!({"text": "y".repeat(10_000)}));
        let pkg = b.build(&req, &d, &test_task("review", "reviewer"), &[&big], &[]).unwrap();

        assert!(pkg.package.truncated);
        assert!(pkg.package.upstream[0].summarized);
        assert_eq!(pkg.package.upstream[0].payload["truncated"], json!(true));
        assert!(!pkg.package.upstream[0].payload["summary"].as_str().unwrap().is_empty());
        assert!(pkg.package.estimated_tokens <= 200, "{}", pkg.package.estimated_tokens);
    }

    #[test]
    fn test_payloads_share_the_budget_evenly() {
        let b = builder();
        let req = RunRequest::new("x");
        let d = SpecialistDescriptor::new("reviewer", "review").with_token_budget(600);
        let one = envelope("draft-a", json!({"text": "a\"b".repeat(3_000)}));
        let two = envelope("draft-b", json!({"text": "z".repeat(8_000)}));
        let pkg = b.build(&req, &d, &test_task("review", "reviewer"), &[&one, &two], &[]).unwrap();

        assert!(pkg.package.upstream.iter().all(|e| e.summarized));
        assert!(pkg.package.estimated_tokens <= 600, "{}", pkg.package.estimated_tokens);
    }

    #[test]
    fn test_budget_smaller_than_request_is_an_error() {
        let b = builder();
        let req = RunRequest::new("a goal far too long for the budget ".repeat(20));
        let d = SpecialistDescriptor::new("reviewer", "review").with_token_budget(50);
        let err = b.build(&req, &d, &test_task("review", "reviewer"), &[], &[]).unwrap_err();

        assert!(matches!(err, OrchestrationError::ContextOverflow { budget: 50, .. }));
        assert_eq!(err.kind(), ErrorKind::InvalidDescriptor);
    }

    #[test]
    fn test_indirect_predecessors_are_digested() {
        let b = builder();
        let req = RunRequest::new("x");
        let d = SpecialistDescriptor::new("reviewer", "review");
        let mut far = envelope("research", json!({"notes": "lots of detail"}));
        far.findings.push(Finding::new(Severity::Warn, "stale-doc", "README.md"));
        let pkg = b.build(&req, &d, &test_task("review", "reviewer"), &[], &[&far]).unwrap();

        let digest = &pkg.package.indirect[0];
        assert_eq!(digest.task_id, "research");
        assert!(digest.title.contains("ok"));
        assert_eq!(digest.findings.len(), 1);
        assert!(pkg.package.upstream.is_empty());
    }

    #[test]
    fn test_identical_packages_share_one_arc() {
        let b = builder();
        let req = RunRequest::new("audit");
        let d = SpecialistDescriptor::new("auditor", "audit");
        let up = envelope("work", json!({"ok": true}));
        let p1 = b.build(&req, &d, &test_task("audit:auditor:0", "auditor"), &[&up], &[]).unwrap();
        let p2 = b.build(&req, &d, &test_task("audit:auditor:1", "auditor"), &[&up], &[]).unwrap();

        assert_eq!(p1.digest, p2.digest);
        assert!(Arc::ptr_eq(&p1.package, &p2.package));
        assert_eq!(b.distinct_packages(), 1);
        assert!(b.artifacts().exists(&p1.digest.parse().unwrap()).unwrap());
    }

    #[test]
    fn test_truncating_summarizer_passthrough_when_small() {
        let v = json!({"a": 1});
        assert_eq!(TruncatingSummarizer.summarize(&v, 100), v);
    }

    #[test]
    fn test_truncating_summarizer_output_fits_allowance() {
        let v = json!({"quotes": "\"\"".repeat(2_000)});
        let summary = TruncatingSummarizer.summarize(&v, 120);
        assert_eq!(summary["truncated"], json!(true));
        assert!(value_tokens(&summary) <= 120);
    }
}
