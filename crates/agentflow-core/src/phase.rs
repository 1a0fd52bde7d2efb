//! Phase controller: drives one run through phases 0-9.
//!
//! Each phase ends in a declarative gate. A failed gate re-runs the phase
//! while its retry budget lasts, then ends the run: `AUDIT_FAILED` for the
//! meta-audit, `RUN_ABORTED` everywhere else. Plan-time errors abort without
//! retry; internal errors map to exit code 3.

use std::collections::BTreeSet;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use agentflow_todo::{Todo, TodoId, TodoStore};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::arbiter::ResourceArbiter;
use crate::artifacts::{put_json, ArtifactStore};
use crate::config::OrchestratorConfig;
use crate::consensus::{aggregate, detect_conflicts, Classification, ConsensusPolicy, ConsensusRecord};
use crate::context::ContextPackageBuilder;
use crate::domain::descriptor::{DOMAIN_PLANNING, DOMAIN_RESEARCH, DOMAIN_VALIDATION, DOMAIN_VERSION_CONTROL};
use crate::domain::envelope::{Finding, ResultEnvelope, Severity};
use crate::domain::error::{ErrorKind, OrchestrationError, Result};
use crate::domain::request::RunRequest;
use crate::domain::task::InstanceStatus;
use crate::executor::{ExecutionControl, ExecutionReport, ExecutionScope, Executor, ExecutorConfig, InstanceRecord};
use crate::gate::{evaluate_gate, GateInput, GatePredicate, GateRule, GateVerdict, Violation};
use crate::graph::{plan_fanout, DefaultPlanner, PlanInput, Planner, TaskGraph};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::{AgentRegistry, RegistrySnapshot};
use crate::reporting::{self, RunReport};
use crate::worker::WorkerSet;

/// Phase names, indexed by phase number.
pub const PHASE_NAMES: [&str; 10] = [
    "init",
    "research",
    "plan",
    "context",
    "execute",
    "integrate",
    "quality-gate",
    "document",
    "version-control",
    "meta-audit",
];

/// Default gate retries per phase.
const DEFAULT_RETRY_BUDGET: [u32; 10] = [0, 1, 0, 0, 1, 0, 1, 0, 0, 0];

// ---------------------------------------------------------------------------
// Run outcome
// ---------------------------------------------------------------------------

/// Final status of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RunStatus {
    Green,
    RunAborted,
    AuditFailed,
    Internal,
}

impl RunStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            RunStatus::Green => 0,
            RunStatus::RunAborted => 1,
            RunStatus::AuditFailed => 2,
            RunStatus::Internal => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RunStatus::Green => "GREEN",
            RunStatus::RunAborted => "RUN_ABORTED",
            RunStatus::AuditFailed => "AUDIT_FAILED",
            RunStatus::Internal => "INTERNAL",
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Passed,
    Failed,
    Skipped,
}

/// What happened in one phase.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseRecord {
    pub phase: u8,
    pub name: String,
    pub status: PhaseStatus,
    /// Attempts made, 0 when skipped.
    pub attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub violations: Vec<Violation>,
    /// Instances dispatched across all attempts.
    pub dispatched: usize,
    pub duration_ms: u64,
}

/// Everything a finished run hands back.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub status: RunStatus,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub report: RunReport,
    /// Every dispatched instance with its envelope, all phases.
    pub instances: Vec<InstanceRecord>,
    /// The phase-4 graph, when planning got that far.
    pub graph: Option<TaskGraph>,
    /// Artifact digest of the final report.
    pub report_ref: Option<String>,
}

impl RunOutcome {
    pub fn exit_code(&self) -> i32 {
        self.status.exit_code()
    }

    pub fn phase(&self, phase: u8) -> Option<&PhaseRecord> {
        self.report.phases.iter().find(|p| p.phase == phase)
    }
}

// ---------------------------------------------------------------------------
// Controller
// ---------------------------------------------------------------------------

enum PhaseStep {
    Skipped(String),
    Gated(GateVerdict),
    Aborted { kind: ErrorKind, message: String },
}

struct Terminal {
    status: RunStatus,
    kind: ErrorKind,
    message: String,
}

/// Mutable per-run state threaded through the phases.
struct RunState {
    run_id: String,
    request: RunRequest,
    registry: Arc<RegistrySnapshot>,
    cancel: CancellationToken,
    working_set: Vec<Todo>,
    summary_ref: Option<String>,
    research: Vec<ResultEnvelope>,
    planning: Vec<ResultEnvelope>,
    graph: Option<TaskGraph>,
    packages: usize,
    execution: Vec<ResultEnvelope>,
    validation: Vec<ResultEnvelope>,
    artifact_set: Option<String>,
    consensus: Vec<ConsensusRecord>,
    findings: Vec<Finding>,
    instances: Vec<InstanceRecord>,
    phases: Vec<PhaseRecord>,
    deferred: Vec<TodoId>,
    modified_state: bool,
    phase_dispatched: usize,
}

impl RunState {
    fn seed_with_working_set(&self) -> Vec<ResultEnvelope> {
        self.working_set.iter().map(todo_seed).collect()
    }

    fn successes(envelopes: &[ResultEnvelope]) -> Vec<ResultEnvelope> {
        envelopes.iter().filter(|e| e.success).cloned().collect()
    }
}

/// Drives runs against one registry, worker set and todo store.
pub struct PhaseController {
    config: OrchestratorConfig,
    registry: Arc<AgentRegistry>,
    planner: Arc<dyn Planner>,
    executor: Executor,
    artifacts: Arc<dyn ArtifactStore>,
    todos: Option<TodoStore>,
    policy: ConsensusPolicy,
    retry_budget: [u32; 10],
    report_dir: Option<PathBuf>,
}

impl fmt::Debug for PhaseController {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhaseController")
            .field("config", &self.config)
            .field("executor", &self.executor)
            .field("retry_budget", &self.retry_budget)
            .field("report_dir", &self.report_dir)
            .finish()
    }
}

impl PhaseController {
    pub fn new(
        config: OrchestratorConfig,
        registry: Arc<AgentRegistry>,
        workers: WorkerSet,
        artifacts: Arc<dyn ArtifactStore>,
    ) -> Self {
        let executor = Executor::new(
            ExecutorConfig::from(&config),
            Arc::new(ResourceArbiter::new()),
            workers,
            Arc::new(ContextPackageBuilder::new(Arc::clone(&artifacts))),
        );
        Self {
            planner: Arc::new(DefaultPlanner::new(config.default_timeout)),
            config,
            registry,
            executor,
            artifacts,
            todos: None,
            policy: ConsensusPolicy::default(),
            retry_budget: DEFAULT_RETRY_BUDGET,
            report_dir: None,
        }
    }

    /// Read the working set from, and record deferrals in, `todos`.
    pub fn with_todos(mut self, todos: TodoStore) -> Self {
        self.executor = self.executor.with_todos(todos.clone());
        self.todos = Some(todos);
        self
    }

    pub fn with_planner(mut self, planner: impl Planner + 'static) -> Self {
        self.planner = Arc::new(planner);
        self
    }

    pub fn with_consensus_policy(mut self, policy: ConsensusPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Gate retries allowed for `phase` (ignored for phases above 9).
    pub fn with_retry_budget(mut self, phase: u8, retries: u32) -> Self {
        if let Some(slot) = self.retry_budget.get_mut(usize::from(phase)) {
            *slot = retries;
        }
        self
    }

    /// Write `run-<id>.json` and `run-<id>.md` into `dir` when a run ends.
    pub fn with_report_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.report_dir = Some(dir.into());
        self
    }

    pub fn executor(&self) -> &Executor {
        &self.executor
    }

    /// Run `request` through every phase. Never fails: internal errors are
    /// folded into the outcome with [`RunStatus::Internal`].
    pub async fn run(&self, request: RunRequest, cancel: CancellationToken) -> RunOutcome {
        let run_id = format!("run-{}", uuid::Uuid::new_v4());
        let span = obs::run_span(&run_id);
        self.run_with_id(run_id, request, cancel).instrument(span).await
    }

    async fn run_with_id(&self, run_id: String, request: RunRequest, cancel: CancellationToken) -> RunOutcome {
        let started = Instant::now();
        obs::emit_run_started(&run_id, &request.goal, &request.phases);

        let mut state = RunState {
            run_id,
            registry: self.registry.snapshot(),
            request,
            cancel,
            working_set: Vec::new(),
            summary_ref: None,
            research: Vec::new(),
            planning: Vec::new(),
            graph: None,
            packages: 0,
            execution: Vec::new(),
            validation: Vec::new(),
            artifact_set: None,
            consensus: Vec::new(),
            findings: Vec::new(),
            instances: Vec::new(),
            phases: Vec::new(),
            deferred: Vec::new(),
            modified_state: false,
            phase_dispatched: 0,
        };

        let terminal = self.drive(&mut state).await;
        self.finish(state, terminal, started).await
    }

    async fn drive(&self, state: &mut RunState) -> Option<Terminal> {
        for phase in 0..=9u8 {
            let name = PHASE_NAMES[usize::from(phase)];
            if state.cancel.is_cancelled() {
                return Some(Terminal {
                    status: RunStatus::RunAborted,
                    kind: ErrorKind::Cancelled,
                    message: format!("run cancelled before phase {phase} ({name})"),
                });
            }
            if !state.request.wants_phase(phase) {
                self.record_skip(state, phase, "not requested");
                continue;
            }

            let budget = self.retry_budget[usize::from(phase)];
            let phase_started = Instant::now();
            state.phase_dispatched = 0;
            let mut attempt = 0u32;
            loop {
                obs::emit_phase_started(&state.run_id, phase, name, attempt);
                let step = self.run_phase(phase, state).await;
                let elapsed = millis(phase_started);

                let verdict = match step {
                    Ok(PhaseStep::Skipped(reason)) => {
                        self.record_skip(state, phase, &reason);
                        break;
                    }
                    Ok(PhaseStep::Aborted { kind, message }) => {
                        self.record(state, phase, PhaseStatus::Failed, attempt + 1, Some(message.clone()), Vec::new(), elapsed);
                        return Some(Terminal {
                            status: RunStatus::RunAborted,
                            kind,
                            message,
                        });
                    }
                    Err(e) => {
                        let kind = e.kind();
                        let message = e.to_string();
                        warn!(phase, error = %message, "phase failed");
                        self.record(state, phase, PhaseStatus::Failed, attempt + 1, Some(message.clone()), Vec::new(), elapsed);
                        let status = if kind == ErrorKind::Internal {
                            RunStatus::Internal
                        } else {
                            RunStatus::RunAborted
                        };
                        return Some(Terminal { status, kind, message });
                    }
                    Ok(PhaseStep::Gated(verdict)) => verdict,
                };

                obs::emit_gate_evaluated(&state.run_id, phase, verdict.passed(), verdict.violations.len());
                if verdict.passed() {
                    self.record(state, phase, PhaseStatus::Passed, attempt + 1, None, Vec::new(), elapsed);
                    break;
                }
                if attempt < budget {
                    attempt += 1;
                    info!(phase, attempt, "gate failed; retrying phase");
                    continue;
                }

                let reasons: Vec<String> = verdict.violations.iter().map(|v| v.reason.clone()).collect();
                let message = format!("phase {phase} ({name}) gate failed: {}", reasons.join("; "));
                let consensus_only = verdict.consensus_only();
                self.record(
                    state,
                    phase,
                    PhaseStatus::Failed,
                    attempt + 1,
                    Some(message.clone()),
                    verdict.violations,
                    elapsed,
                );
                let terminal = if phase == 9 && consensus_only {
                    Terminal {
                        status: RunStatus::AuditFailed,
                        kind: ErrorKind::AuditFailed,
                        message,
                    }
                } else {
                    Terminal {
                        status: RunStatus::RunAborted,
                        kind: if consensus_only {
                            ErrorKind::ConsensusLow
                        } else {
                            ErrorKind::RunAborted
                        },
                        message,
                    }
                };
                return Some(terminal);
            }
        }
        None
    }

    async fn run_phase(&self, phase: u8, state: &mut RunState) -> Result<PhaseStep> {
        match phase {
            0 => self.init(state).await,
            1 => self.research(state).await,
            2 => self.plan(state).await,
            3 => self.synthesize_context(state),
            4 => self.execute_plan(state).await,
            5 => self.integrate(state),
            6 => self.quality_gate(state).await,
            7 => self.document(state).await,
            8 => self.version_control(state).await,
            9 => self.meta_audit(state).await,
            _ => Err(OrchestrationError::Internal(format!("no phase {phase}"))),
        }
    }

    // -----------------------------------------------------------------------
    // Phases
    // -----------------------------------------------------------------------

    /// 0: registry health and the todo working set.
    async fn init(&self, state: &mut RunState) -> Result<PhaseStep> {
        if state.registry.is_empty() {
            return Err(OrchestrationError::InvalidDescriptor {
                origin: "registry".into(),
                reason: "no specialists loaded".into(),
            });
        }
        let Some(todos) = &self.todos else {
            return Ok(PhaseStep::Gated(GateVerdict::default()));
        };

        let recovered = todos.reap_expired(Default::default()).await?;
        if !recovered.is_empty() {
            info!(count = recovered.len(), "returned expired todos to pending");
        }
        let claimed = todos.claim(state.run_id.clone(), self.config.concurrency.max(1)).await?;
        for _ in &claimed {
            METRICS.inc_todos();
        }
        debug!(claimed = claimed.len(), "working set claimed");
        state.working_set.extend(claimed);
        Ok(PhaseStep::Gated(GateVerdict::default()))
    }

    /// 1: research specialists over the request and working set.
    async fn research(&self, state: &mut RunState) -> Result<PhaseStep> {
        let graph = plan_fanout(&state.registry, DOMAIN_RESEARCH, 1, 1, self.config.default_timeout)?;
        if graph.is_empty() {
            return Ok(PhaseStep::Skipped("no research specialists registered".into()));
        }
        let seed = state.seed_with_working_set();
        let report = self.execute(state, &graph, seed).await?;
        if report.cancelled {
            return Ok(cancelled_step(1));
        }
        state.research = report.final_envelopes();
        let verdict = self.gate(state, &GatePredicate::open().with_rule(GateRule::MandatorySucceeded), &state.research, &[], &[]);
        Ok(PhaseStep::Gated(verdict))
    }

    /// 2: planning specialists, then the planner, then registry validation.
    async fn plan(&self, state: &mut RunState) -> Result<PhaseStep> {
        let planners = plan_fanout(&state.registry, DOMAIN_PLANNING, 2, 1, self.config.default_timeout)?;
        if !planners.is_empty() {
            let mut seed = RunState::successes(&state.research);
            seed.extend(state.seed_with_working_set());
            let report = self.execute(state, &planners, seed).await?;
            if report.cancelled {
                return Ok(cancelled_step(2));
            }
            state.planning = report.final_envelopes();
        }

        let research = RunState::successes(&state.research);
        let planning = RunState::successes(&state.planning);
        let input_ref = put_json(self.artifacts.as_ref(), &state.request.context)?.to_hex();
        let graph = self.planner.plan(&PlanInput {
            request: &state.request,
            registry: &state.registry,
            research: &research,
            planning: &planning,
            input_ref: Some(&input_ref),
        })?;
        state.registry.validate_graph(&graph)?;
        info!(nodes = graph.len(), edges = graph.edges().len(), "task graph planned");
        state.graph = Some(graph);
        Ok(PhaseStep::Gated(GateVerdict::default()))
    }

    /// 3: packages for the plan's root nodes. Inner nodes get theirs at
    /// dispatch, once their upstream envelopes exist.
    fn synthesize_context(&self, state: &mut RunState) -> Result<PhaseStep> {
        let Some(graph) = &state.graph else {
            return Ok(PhaseStep::Skipped("no task graph".into()));
        };
        let seed: Vec<ResultEnvelope> = RunState::successes(&state.research)
            .into_iter()
            .chain(RunState::successes(&state.planning))
            .collect();
        let direct: Vec<&ResultEnvelope> = seed.iter().collect();
        let contexts = self.executor.contexts();

        let mut digests = BTreeSet::new();
        for (id, task) in graph.nodes() {
            if !graph.predecessors(id).is_empty() {
                continue;
            }
            let descriptor = state.registry.lookup(&task.specialist_id)?;
            let package = contexts.build(&state.request, &descriptor, task, &direct, &[])?;
            digests.insert(package.digest);
        }
        debug!(packages = digests.len(), "context packages built");
        state.packages = digests.len();
        Ok(PhaseStep::Gated(GateVerdict::default()))
    }

    /// 4: run the plan.
    async fn execute_plan(&self, state: &mut RunState) -> Result<PhaseStep> {
        let Some(graph) = state.graph.clone() else {
            return Ok(PhaseStep::Skipped("no task graph".into()));
        };
        let seed: Vec<ResultEnvelope> = RunState::successes(&state.research)
            .into_iter()
            .chain(RunState::successes(&state.planning))
            .collect();
        let report = self.execute(state, &graph, seed).await?;
        if report.cancelled {
            return Ok(cancelled_step(4));
        }
        state.modified_state |= report.modified_state();
        state.execution = report.final_envelopes();
        let verdict = self.gate(state, &GatePredicate::standard(), &state.execution, &[], &[]);
        Ok(PhaseStep::Gated(verdict))
    }

    /// 5: merge outputs into one artifact set and surface conflicts.
    fn integrate(&self, state: &mut RunState) -> Result<PhaseStep> {
        if state.execution.is_empty() {
            return Ok(PhaseStep::Skipped("nothing to integrate".into()));
        }
        let members: Vec<serde_json::Value> = state
            .execution
            .iter()
            .filter(|e| e.success)
            .map(|e| {
                json!({
                    "task_id": e.task_id,
                    "specialist_id": e.specialist_id,
                    "instance_id": e.instance_id,
                    "confidence": e.confidence,
                    "payload": e.payload,
                    "evidence": e.evidence,
                })
            })
            .collect();
        let set = json!({ "run_id": state.run_id, "members": members });
        state.artifact_set = Some(put_json(self.artifacts.as_ref(), &set)?.to_hex());

        let conflicts = detect_conflicts(&state.execution);
        if !conflicts.is_empty() {
            warn!(conflicts = conflicts.len(), "cross-specialist conflicts detected");
        }
        state.findings.extend(conflicts.iter().cloned());
        let predicate = GatePredicate::open().with_rule(GateRule::MaxSeverity {
            below: Severity::Critical,
        });
        let verdict = self.gate(state, &predicate, &state.execution, &[], &conflicts);
        Ok(PhaseStep::Gated(verdict))
    }

    /// 6: validator consensus.
    async fn quality_gate(&self, state: &mut RunState) -> Result<PhaseStep> {
        let graph = plan_fanout(
            &state.registry,
            DOMAIN_VALIDATION,
            6,
            self.config.auditor_instances,
            self.config.default_timeout,
        )?;
        if graph.is_empty() {
            return Ok(PhaseStep::Skipped("no validator specialists registered".into()));
        }
        let seed = state.execution.clone();
        let report = self.execute(state, &graph, seed).await?;
        if report.cancelled {
            return Ok(cancelled_step(6));
        }
        state.validation = report.final_envelopes();
        let records = self.consensus_for(&graph, &report);
        let verdict = self.gate(state, &GatePredicate::consensus(), &state.validation, &records, &[]);
        state.consensus.extend(records);
        Ok(PhaseStep::Gated(verdict))
    }

    /// 7: persist a run summary. The working set is settled in `finish` once
    /// the final status is known.
    async fn document(&self, state: &mut RunState) -> Result<PhaseStep> {
        let summary = reporting::RunReport::interim(
            &state.run_id,
            &state.request.goal,
            &state.phases,
            &state.instances,
            &state.consensus,
            &state.findings,
            state.artifact_set.clone(),
        );
        let summary_ref = put_json(self.artifacts.as_ref(), &summary)?.to_hex();
        info!(summary_ref = %summary_ref, "run summary persisted");
        state.summary_ref = Some(summary_ref);
        Ok(PhaseStep::Gated(GateVerdict::default()))
    }

    /// 8: atomic-commit handoff when tracked state changed.
    async fn version_control(&self, state: &mut RunState) -> Result<PhaseStep> {
        let modified = state.request.modifies_state.unwrap_or(state.modified_state);
        if !modified {
            return Ok(PhaseStep::Skipped("no tracked state changed".into()));
        }
        let graph = plan_fanout(&state.registry, DOMAIN_VERSION_CONTROL, 8, 1, self.config.default_timeout)?;
        if graph.is_empty() {
            return Ok(PhaseStep::Skipped("no version-control specialist registered".into()));
        }
        let seed = state.execution.clone();
        let report = self.execute(state, &graph, seed).await?;
        if report.cancelled {
            return Ok(cancelled_step(8));
        }
        let finals = report.final_envelopes();
        let committers: BTreeSet<String> = finals.iter().map(|e| e.specialist_id.clone()).collect();
        let verdict = evaluate_gate(
            &GatePredicate::standard(),
            &GateInput {
                envelopes: &finals,
                consensus: &[],
                findings: &[],
                mandatory: &committers,
            },
        );
        Ok(PhaseStep::Gated(verdict))
    }

    /// 9: independent auditor instances must reach `medium` consensus.
    async fn meta_audit(&self, state: &mut RunState) -> Result<PhaseStep> {
        let graph = self.planner.plan_audit(&state.registry, self.config.auditor_instances)?;
        if graph.is_empty() {
            return Ok(PhaseStep::Skipped("no auditors registered".into()));
        }
        let mut seed = state.execution.clone();
        seed.extend(state.validation.iter().cloned());
        let report = self.execute(state, &graph, seed).await?;
        if report.cancelled {
            return Ok(cancelled_step(9));
        }
        let finals = report.final_envelopes();
        let records = self.consensus_for(&graph, &report);
        let verdict = self.gate(state, &GatePredicate::consensus(), &finals, &records, &[]);

        for record in &records {
            state.findings.extend(record.findings.iter().cloned());
            if record.classification < Classification::Medium {
                state.findings.push(
                    Finding::new(Severity::Error, "consensus-low", record.role.as_str())
                        .with_message(format!(
                            "{} auditors reached {} consensus (mean {:.2}, stddev {:.2})",
                            record.role, record.classification, record.mean, record.stddev
                        ))
                        .with_origin("aggregator"),
                );
            }
        }
        state.consensus.extend(records);
        Ok(PhaseStep::Gated(verdict))
    }

    // -----------------------------------------------------------------------
    // Helpers
    // -----------------------------------------------------------------------

    async fn execute(&self, state: &mut RunState, graph: &TaskGraph, seed: Vec<ResultEnvelope>) -> Result<ExecutionReport> {
        let control = ExecutionControl::new(graph, &state.cancel);
        let scope = ExecutionScope {
            run_id: state.run_id.clone(),
            request: state.request.clone(),
            registry: Arc::clone(&state.registry),
            seed,
        };
        let report = self.executor.execute(graph, &scope, &control).await?;
        state.phase_dispatched += report.dispatched();
        state.instances.extend(report.instances.iter().cloned());
        state.deferred.extend(report.deferred.iter().copied());
        Ok(report)
    }

    fn consensus_for(&self, graph: &TaskGraph, report: &ExecutionReport) -> Vec<ConsensusRecord> {
        graph
            .consensus_groups()
            .keys()
            .map(|role| {
                let members = report.group(graph, role);
                let needed = self.policy.min_successes.min(members.len()).max(1);
                aggregate(role, &members, &self.policy.with_min_successes(needed))
            })
            .collect()
    }

    fn gate(
        &self,
        state: &RunState,
        predicate: &GatePredicate,
        envelopes: &[ResultEnvelope],
        consensus: &[ConsensusRecord],
        findings: &[Finding],
    ) -> GateVerdict {
        let mandatory: BTreeSet<String> = state
            .registry
            .list(|d| d.mandatory)
            .iter()
            .map(|d| d.id.clone())
            .collect();
        evaluate_gate(
            predicate,
            &GateInput {
                envelopes,
                consensus,
                findings,
                mandatory: &mandatory,
            },
        )
    }

    fn record_skip(&self, state: &mut RunState, phase: u8, reason: &str) {
        obs::emit_phase_skipped(&state.run_id, phase, reason);
        self.record(state, phase, PhaseStatus::Skipped, 0, Some(reason.to_string()), Vec::new(), 0);
    }

    #[allow(clippy::too_many_arguments)]
    fn record(
        &self,
        state: &mut RunState,
        phase: u8,
        status: PhaseStatus,
        attempts: u32,
        reason: Option<String>,
        violations: Vec<Violation>,
        duration_ms: u64,
    ) {
        if status != PhaseStatus::Skipped {
            obs::emit_phase_finished(&state.run_id, phase, status == PhaseStatus::Passed, duration_ms);
        }
        state.phases.push(PhaseRecord {
            phase,
            name: PHASE_NAMES[usize::from(phase)].to_string(),
            status,
            attempts,
            reason,
            violations,
            dispatched: if status == PhaseStatus::Skipped { 0 } else { state.phase_dispatched },
            duration_ms,
        });
    }

    async fn finish(&self, state: RunState, terminal: Option<Terminal>, started: Instant) -> RunOutcome {
        let (status, kind, message) = match terminal {
            None => (RunStatus::Green, None, None),
            Some(t) => (t.status, Some(t.kind), Some(t.message)),
        };
        let duration_ms = millis(started);

        let mut report = RunReport::interim(
            &state.run_id,
            &state.request.goal,
            &state.phases,
            &state.instances,
            &state.consensus,
            &state.findings,
            state.artifact_set.clone(),
        );
        report.status = Some(status);
        report.exit_code = Some(status.exit_code());
        report.error_kind = kind;
        report.message = message.clone();
        report.working_set = state.working_set.iter().map(|t| t.id).collect();
        report.deferred = state.deferred.clone();
        report.duration_ms = duration_ms;

        let report_ref = match put_json(self.artifacts.as_ref(), &report) {
            Ok(d) => Some(d.to_hex()),
            Err(e) => {
                warn!(error = %e, "failed to store run report");
                None
            }
        };

        let result_ref = report_ref.as_deref().or(state.summary_ref.as_deref());
        self.settle_working_set(&state, status, result_ref).await;

        if let Some(dir) = &self.report_dir {
            if let Err(e) = reporting::write_reports(dir, &report) {
                warn!(dir = %dir.display(), error = %e, "failed to write run report");
            }
        }

        METRICS.flush();
        obs::emit_run_finished(&state.run_id, duration_ms, status.as_str(), status.exit_code());

        RunOutcome {
            run_id: state.run_id,
            status,
            error_kind: kind,
            message,
            report,
            instances: state.instances,
            graph: state.graph,
            report_ref,
        }
    }

    /// Complete the working set on success; otherwise hand it back to pending
    /// with the failure recorded.
    async fn settle_working_set(&self, state: &RunState, status: RunStatus, result_ref: Option<&str>) {
        let Some(todos) = &self.todos else {
            return;
        };
        for todo in &state.working_set {
            let settled = if status == RunStatus::Green {
                todos
                    .complete(todo.id, result_ref.unwrap_or(&state.run_id).to_string())
                    .await
                    .map(|_| ())
            } else {
                match todos.block(todo.id, format!("run {} ended {status}", state.run_id)).await {
                    Ok(_) => todos.release(todo.id).await.map(|_| ()),
                    Err(e) => Err(e),
                }
            };
            match settled {
                Ok(()) => METRICS.inc_todos(),
                Err(e) => warn!(todo = %todo.id, error = %e, "failed to settle working-set todo"),
            }
        }
    }
}

fn cancelled_step(phase: u8) -> PhaseStep {
    PhaseStep::Aborted {
        kind: ErrorKind::Cancelled,
        message: format!("run cancelled during phase {phase} ({})", PHASE_NAMES[usize::from(phase)]),
    }
}

fn millis(since: Instant) -> u64 {
    u64::try_from(since.elapsed().as_millis()).unwrap_or(u64::MAX)
}

/// Seed envelope carrying a claimed todo into specialist context.
fn todo_seed(todo: &Todo) -> ResultEnvelope {
    let id = format!("todo:{}", todo.id);
    ResultEnvelope {
        instance_id: id.clone(),
        task_id: id,
        specialist_id: "todo-store".into(),
        status: InstanceStatus::Completed,
        confidence: 1.0,
        success: true,
        payload: json!({
            "description": todo.description,
            "priority": todo.priority,
            "originating_task": todo.originating_task,
            "deadline": todo.deadline,
        }),
        evidence: Vec::new(),
        findings: Vec::new(),
        error_kind: None,
        error_message: None,
        duration_ms: 0,
        tokens_used: 0,
        modified_state: false,
        synthetic: true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::memory::MemoryArtifactStore;
    use crate::domain::descriptor::DOMAIN_AUDIT;
    use crate::domain::SpecialistDescriptor;
    use crate::worker::{DryRunWorker, FnWorker, WorkerResponse};
    use std::time::Duration;

    fn config() -> OrchestratorConfig {
        OrchestratorConfig {
            drain_timeout: Duration::from_millis(100),
            retry_backoff: Duration::from_millis(1),
            ..OrchestratorConfig::default()
        }
    }

    fn controller(descriptors: Vec<SpecialistDescriptor>, workers: WorkerSet) -> PhaseController {
        PhaseController::new(
            config(),
            Arc::new(AgentRegistry::from_descriptors(descriptors).unwrap()),
            workers,
            Arc::new(MemoryArtifactStore::new()),
        )
    }

    #[test]
    fn test_exit_codes() {
        assert_eq!(RunStatus::Green.exit_code(), 0);
        assert_eq!(RunStatus::RunAborted.exit_code(), 1);
        assert_eq!(RunStatus::AuditFailed.exit_code(), 2);
        assert_eq!(RunStatus::Internal.exit_code(), 3);
        assert_eq!(serde_json::to_string(&RunStatus::AuditFailed).unwrap(), "\"AUDIT_FAILED\"");
    }

    #[tokio::test]
    async fn test_unrequested_phases_are_skipped_with_reason() {
        let ctl = controller(
            vec![SpecialistDescriptor::new("coder", "engineering")],
            WorkerSet::new().with_fallback(DryRunWorker::default()),
        );
        let outcome = ctl
            .run(RunRequest::new("just init").with_phases([0]), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Green);
        assert_eq!(outcome.report.phases.len(), 10);
        let p4 = outcome.phase(4).unwrap();
        assert_eq!(p4.status, PhaseStatus::Skipped);
        assert_eq!(p4.reason.as_deref(), Some("not requested"));
    }

    #[tokio::test]
    async fn test_empty_registry_aborts_in_init() {
        let ctl = controller(Vec::new(), WorkerSet::new());
        let outcome = ctl.run(RunRequest::new("nothing"), CancellationToken::new()).await;
        assert_eq!(outcome.exit_code(), 1);
        assert_eq!(outcome.error_kind, Some(ErrorKind::InvalidDescriptor));
    }

    #[tokio::test]
    async fn test_full_dry_run_is_green() {
        let ctl = controller(
            vec![
                SpecialistDescriptor::new("scout", DOMAIN_RESEARCH),
                SpecialistDescriptor::new("coder", "engineering"),
                SpecialistDescriptor::new("checker", DOMAIN_VALIDATION),
                SpecialistDescriptor::new("auditor", DOMAIN_AUDIT),
            ],
            WorkerSet::new().with_fallback(DryRunWorker::default()),
        );
        let outcome = ctl.run(RunRequest::new("ship it"), CancellationToken::new()).await;

        assert_eq!(outcome.status, RunStatus::Green, "{:?}", outcome.message);
        assert_eq!(outcome.phase(8).unwrap().reason.as_deref(), Some("no tracked state changed"));
        assert_eq!(outcome.phase(9).unwrap().status, PhaseStatus::Passed);
        // 1 research + 1 plan node + 2 validators + 2 auditors
        assert_eq!(outcome.instances.len(), 6);
        assert_eq!(outcome.report.consensus.len(), 2);
        assert!(outcome.report_ref.is_some());
    }

    #[tokio::test]
    async fn test_failing_mandatory_specialist_exhausts_phase_budget() {
        let ctl = controller(
            vec![SpecialistDescriptor::new("coder", "engineering").mandatory()],
            WorkerSet::new().with(
                "coder",
                FnWorker::new(|_r, _h, _c| async move { Ok(WorkerResponse::failed("nope")) }),
            ),
        );
        let outcome = ctl
            .run(RunRequest::new("fail").with_phases([0, 2, 4]), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::RunAborted);
        assert_eq!(outcome.error_kind, Some(ErrorKind::RunAborted));
        let p4 = outcome.phase(4).unwrap();
        assert_eq!(p4.attempts, 2);
        assert_eq!(p4.dispatched, 2);
        assert!(!p4.violations.is_empty());
    }

    #[tokio::test]
    async fn test_state_change_triggers_version_control() {
        let ctl = controller(
            vec![
                SpecialistDescriptor::new("coder", "engineering"),
                SpecialistDescriptor::new("committer", DOMAIN_VERSION_CONTROL),
            ],
            WorkerSet::new()
                .with(
                    "coder",
                    FnWorker::new(|_r, _h, _c| async move {
                        Ok(WorkerResponse::ok(0.9, json!({"changed": ["src/lib.rs"]})).modifying_state())
                    }),
                )
                .with_fallback(DryRunWorker::default()),
        );
        let outcome = ctl
            .run(RunRequest::new("edit").with_phases([0, 2, 4, 8]), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Green);
        let p8 = outcome.phase(8).unwrap();
        assert_eq!(p8.status, PhaseStatus::Passed);
        assert_eq!(p8.dispatched, 1);
    }

    #[tokio::test]
    async fn test_working_set_completed_when_run_is_green() {
        let todos = TodoStore::in_memory(agentflow_todo::TodoConfig::default());
        let carried = todos.add("finish the migration", 5, None, None).await.unwrap();
        let ctl = controller(
            vec![SpecialistDescriptor::new("coder", "engineering")],
            WorkerSet::new().with_fallback(DryRunWorker::default()),
        )
        .with_todos(todos.clone());

        let outcome = ctl
            .run(RunRequest::new("continue").with_phases([0, 2, 4, 7]), CancellationToken::new())
            .await;
        assert_eq!(outcome.status, RunStatus::Green);
        assert_eq!(outcome.report.working_set, vec![carried.id]);
        let todo = todos.get(carried.id).unwrap();
        assert_eq!(todo.state, agentflow_todo::TodoState::Completed);
        assert!(todo.result_ref.is_some());
    }

    #[tokio::test]
    async fn test_aborted_run_returns_working_set_to_pending() {
        let todos = TodoStore::in_memory(agentflow_todo::TodoConfig::default());
        let carried = todos.add("retry me", 1, None, None).await.unwrap();
        let ctl = controller(
            vec![SpecialistDescriptor::new("coder", "engineering").mandatory()],
            WorkerSet::new().with_fallback(FnWorker::new(|_r, _h, _c| async move { Ok(WorkerResponse::failed("no")) })),
        )
        .with_todos(todos.clone())
        .with_retry_budget(4, 0);

        let outcome = ctl
            .run(RunRequest::new("fail").with_phases([0, 2, 4, 7]), CancellationToken::new())
            .await;
        assert_eq!(outcome.exit_code(), 1);
        let todo = todos.get(carried.id).unwrap();
        assert_eq!(todo.state, agentflow_todo::TodoState::Pending);
        assert!(todo.reason.unwrap_or_default().contains("RUN_ABORTED"));
    }

    #[tokio::test]
    async fn test_failed_audit_after_documentation_keeps_working_set_pending() {
        let todos = TodoStore::in_memory(agentflow_todo::TodoConfig::default());
        let carried = todos.add("needs a clean audit", 2, None, None).await.unwrap();
        let ctl = controller(
            vec![
                SpecialistDescriptor::new("coder", "engineering"),
                SpecialistDescriptor::new("auditor", DOMAIN_AUDIT),
            ],
            WorkerSet::new()
                .with(
                    "auditor",
                    FnWorker::new(|_r, _h, _c| async move { Ok(WorkerResponse::ok(0.4, json!({}))) }),
                )
                .with_fallback(DryRunWorker::default()),
        )
        .with_todos(todos.clone());

        let outcome = ctl.run(RunRequest::new("audit me"), CancellationToken::new()).await;
        assert_eq!(outcome.status, RunStatus::AuditFailed);
        assert_eq!(outcome.phase(7).unwrap().status, PhaseStatus::Passed);

        let todo = todos.get(carried.id).unwrap();
        assert_eq!(todo.state, agentflow_todo::TodoState::Pending);
        assert!(todo.result_ref.is_none());
        assert!(todo.reason.unwrap_or_default().contains("AUDIT_FAILED"));
    }
}
