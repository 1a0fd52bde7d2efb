//! Parallel executor.
//!
//! A single coordinator loop walks the graph in waves. A node is ready once
//! every predecessor is terminal; ready nodes are admitted up to the free slot
//! count and split into lanes: nodes whose resource claims conflict share a
//! lane and run one after another, disjoint lanes run concurrently. Overflow
//! is deferred to the todo store with reason `BACKPRESSURE`.
//!
//! Lanes report every terminal instance and every finished node on one
//! completion channel. Locks are always released before an instance's
//! envelope is sent.
//!
//! Cancelling the run stops admission, cancels every node token, waits up to
//! the drain timeout for lanes to report, then aborts what is left and
//! synthesizes `cancelled` envelopes for it.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use agentflow_todo::{TodoId, TodoStore, BACKPRESSURE};
use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::{AbortHandle, JoinSet};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::arbiter::ResourceArbiter;
use crate::artifacts::{put_json, ArtifactStore};
use crate::config::OrchestratorConfig;
use crate::context::{ContextPackageBuilder, PackageRef};
use crate::domain::descriptor::SpecialistDescriptor;
use crate::domain::envelope::ResultEnvelope;
use crate::domain::error::{ErrorKind, Result};
use crate::domain::request::{EdgePolicy, RunRequest};
use crate::domain::task::{merge_claims, InstanceStatus, Task, TaskInstance};
use crate::graph::{NodeId, TaskGraph};
use crate::metrics::METRICS;
use crate::obs;
use crate::registry::RegistrySnapshot;
use crate::worker::{HeartbeatSender, WorkerRequest, WorkerResponse, WorkerSet};

/// Executor knobs, derived from [`OrchestratorConfig`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutorConfig {
    pub slots: usize,
    pub default_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub drain_timeout: Duration,
    pub acquire_timeout: Duration,
    pub retry_backoff: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self::from(&OrchestratorConfig::default())
    }
}

impl From<&OrchestratorConfig> for ExecutorConfig {
    fn from(cfg: &OrchestratorConfig) -> Self {
        Self {
            slots: cfg.concurrency.max(1),
            default_timeout: cfg.default_timeout,
            heartbeat_interval: cfg.heartbeat_interval,
            drain_timeout: cfg.drain_timeout,
            acquire_timeout: cfg.acquire_timeout,
            retry_backoff: cfg.retry_backoff,
        }
    }
}

impl ExecutorConfig {
    fn effective_timeout(&self, declared: Duration) -> Duration {
        if declared.is_zero() {
            self.default_timeout
        } else {
            declared
        }
    }

    fn reaper_period(&self) -> Duration {
        self.heartbeat_interval
            .min(Duration::from_secs(1))
            .max(Duration::from_millis(10))
    }

    /// Extra time the coordinator waits past the drain timeout before forcing.
    fn force_grace(&self) -> Duration {
        self.drain_timeout / 2 + Duration::from_millis(50)
    }
}

/// One dispatched instance and the envelope it produced.
#[derive(Debug, Clone)]
pub struct InstanceRecord {
    pub node: NodeId,
    pub instance: TaskInstance,
    pub envelope: ResultEnvelope,
}

/// Everything one `execute` call produced.
#[derive(Debug, Clone, Default)]
pub struct ExecutionReport {
    /// Final envelope per node: the last attempt, or a synthetic stand-in.
    pub finals: BTreeMap<NodeId, ResultEnvelope>,
    /// Every dispatched instance, in completion order.
    pub instances: Vec<InstanceRecord>,
    /// A `halt-graph` edge fired.
    pub halted: bool,
    pub cancelled: bool,
    /// Todos created for backpressure and deferred spawn requests.
    pub deferred: Vec<TodoId>,
}

impl ExecutionReport {
    /// Final envelopes in node order.
    pub fn final_envelopes(&self) -> Vec<ResultEnvelope> {
        self.finals.values().cloned().collect()
    }

    pub fn dispatched(&self) -> usize {
        self.instances.len()
    }

    /// Every node finished with a successful envelope.
    pub fn all_succeeded(&self) -> bool {
        self.finals.values().all(|e| e.success)
    }

    /// Final envelopes of the members of consensus group `role`.
    pub fn group(&self, graph: &TaskGraph, role: &str) -> Vec<ResultEnvelope> {
        graph
            .consensus_groups()
            .get(role)
            .map(|members| members.iter().filter_map(|n| self.finals.get(n).cloned()).collect())
            .unwrap_or_default()
    }

    /// Some successful instance reported changing tracked state.
    pub fn modified_state(&self) -> bool {
        self.instances
            .iter()
            .any(|r| r.envelope.success && r.envelope.modified_state)
    }
}

/// Cancellation handles for one execution.
#[derive(Debug, Clone)]
pub struct ExecutionControl {
    run: CancellationToken,
    nodes: Arc<Vec<CancellationToken>>,
    descendants: Arc<Vec<BTreeSet<NodeId>>>,
}

impl ExecutionControl {
    /// Tokens for every node of `graph`, all children of `parent`.
    pub fn new(graph: &TaskGraph, parent: &CancellationToken) -> Self {
        let run = parent.child_token();
        let nodes = graph.node_ids().map(|_| run.child_token()).collect();
        let descendants = graph.node_ids().map(|n| graph.descendants(n)).collect();
        Self {
            run,
            nodes: Arc::new(nodes),
            descendants: Arc::new(descendants),
        }
    }

    /// Cancel one node and everything downstream of it.
    pub fn cancel_node(&self, node: NodeId) {
        if let Some(t) = self.nodes.get(node.0) {
            t.cancel();
        }
        if let Some(desc) = self.descendants.get(node.0) {
            for d in desc {
                if let Some(t) = self.nodes.get(d.0) {
                    t.cancel();
                }
            }
        }
    }

    pub fn cancel_all(&self) {
        self.run.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.run.is_cancelled()
    }

    fn node_token(&self, node: NodeId) -> CancellationToken {
        self.nodes
            .get(node.0)
            .cloned()
            .unwrap_or_else(|| self.run.child_token())
    }
}

/// Per-call inputs.
#[derive(Debug, Clone)]
pub struct ExecutionScope {
    pub run_id: String,
    pub request: RunRequest,
    /// Registry snapshot the graph was planned against.
    pub registry: Arc<RegistrySnapshot>,
    /// Envelopes from earlier phases: direct context for root nodes,
    /// indirect context for everything else.
    pub seed: Vec<ResultEnvelope>,
}

/// Runs task graphs.
pub struct Executor {
    config: ExecutorConfig,
    arbiter: Arc<ResourceArbiter>,
    workers: WorkerSet,
    contexts: Arc<ContextPackageBuilder>,
    todos: Option<TodoStore>,
}

impl std::fmt::Debug for Executor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Executor")
            .field("config", &self.config)
            .field("workers", &self.workers)
            .field("todos", &self.todos.is_some())
            .finish()
    }
}

impl Executor {
    pub fn new(
        config: ExecutorConfig,
        arbiter: Arc<ResourceArbiter>,
        workers: WorkerSet,
        contexts: Arc<ContextPackageBuilder>,
    ) -> Self {
        Self {
            config,
            arbiter,
            workers,
            contexts,
            todos: None,
        }
    }

    /// Record backpressure and spawn-request deferrals in `todos`.
    pub fn with_todos(mut self, todos: TodoStore) -> Self {
        self.todos = Some(todos);
        self
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    pub fn arbiter(&self) -> &Arc<ResourceArbiter> {
        &self.arbiter
    }

    pub fn contexts(&self) -> &Arc<ContextPackageBuilder> {
        &self.contexts
    }

    /// Run `graph` to completion (or cancellation).
    pub async fn execute(
        &self,
        graph: &TaskGraph,
        scope: &ExecutionScope,
        control: &ExecutionControl,
    ) -> Result<ExecutionReport> {
        graph.topological_order()?;

        let shared = Arc::new(Shared {
            config: self.config.clone(),
            arbiter: Arc::clone(&self.arbiter),
            workers: self.workers.clone(),
            artifacts: Arc::clone(self.contexts.artifacts()),
            todos: self.todos.clone(),
            run_id: scope.run_id.clone(),
            running: Mutex::new(HashMap::new()),
        });

        let reaper_stop = CancellationToken::new();
        let reaper = self
            .arbiter
            .spawn_reaper(self.config.reaper_period(), reaper_stop.clone());

        let (tx, rx) = mpsc::unbounded_channel();
        let coordinator = Coordinator {
            exec: self,
            graph,
            scope,
            control,
            shared,
            done: vec![false; graph.len()],
            admitted: BTreeSet::new(),
            doomed: BTreeMap::new(),
            halted_by: None,
            alt_tried: BTreeSet::new(),
            backpressure: HashMap::new(),
            resumed: BTreeSet::new(),
            in_flight: 0,
            report: ExecutionReport::default(),
            lanes: JoinSet::new(),
            tx,
            rx,
        };
        let result = coordinator.run().await;

        reaper_stop.cancel();
        if let Err(e) = reaper.await {
            debug!(error = %e, "lease reaper ended abnormally");
        }
        result
    }
}

// ---------------------------------------------------------------------------
// Lanes
// ---------------------------------------------------------------------------

struct RunningInstance {
    instance: TaskInstance,
    task: Task,
    worker: Option<AbortHandle>,
}

/// State shared by the coordinator and its lanes.
struct Shared {
    config: ExecutorConfig,
    arbiter: Arc<ResourceArbiter>,
    workers: WorkerSet,
    artifacts: Arc<dyn ArtifactStore>,
    todos: Option<TodoStore>,
    run_id: String,
    running: Mutex<HashMap<NodeId, RunningInstance>>,
}

struct Job {
    node: NodeId,
    task: Task,
    descriptor: Arc<SpecialistDescriptor>,
    package: PackageRef,
    token: CancellationToken,
}

enum LaneMsg {
    Instance {
        record: Box<InstanceRecord>,
        deferred: Vec<TodoId>,
    },
    Finished {
        node: NodeId,
        envelope: Box<ResultEnvelope>,
    },
}

enum Interrupt {
    Cancelled,
    LeaseExpired,
    Deadline,
    Stale,
}

impl Shared {
    /// Terminal bookkeeping: release locks, store the envelope, emit.
    fn finish_instance(
        &self,
        node: NodeId,
        mut instance: TaskInstance,
        envelope: ResultEnvelope,
        deferred: Vec<TodoId>,
        tx: &mpsc::UnboundedSender<LaneMsg>,
    ) {
        self.arbiter.release_all(&instance.instance_id);
        self.running.lock().remove(&node);

        instance.status = envelope.status;
        instance.finished_at = Some(Utc::now());
        instance.result_ref = match put_json(self.artifacts.as_ref(), &envelope) {
            Ok(d) => Some(d.to_hex()),
            Err(e) => {
                warn!(instance_id = %instance.instance_id, error = %e, "failed to store envelope");
                None
            }
        };

        METRICS.inc_envelopes();
        obs::emit_instance_terminal(
            &instance.instance_id,
            &envelope.status.to_string(),
            envelope.error_kind.map(ErrorKind::as_str),
            envelope.duration_ms,
        );
        let record = InstanceRecord {
            node,
            instance,
            envelope,
        };
        if tx
            .send(LaneMsg::Instance {
                record: Box::new(record),
                deferred,
            })
            .is_err()
        {
            debug!("coordinator gone; dropping instance record");
        }
    }

    async fn run_lane(self: Arc<Self>, jobs: Vec<Job>, tx: mpsc::UnboundedSender<LaneMsg>) {
        for job in jobs {
            let node = job.node;
            let envelope = self.run_node(&job, &tx).await;
            if tx
                .send(LaneMsg::Finished {
                    node,
                    envelope: Box::new(envelope),
                })
                .is_err()
            {
                return;
            }
        }
    }

    /// All attempts of one node. Returns the node's final envelope.
    async fn run_node(&self, job: &Job, tx: &mpsc::UnboundedSender<LaneMsg>) -> ResultEnvelope {
        let mut last = None;
        for attempt in 0..=job.task.max_retries {
            if job.token.is_cancelled() {
                break;
            }
            let task = if attempt == 0 {
                job.task.clone()
            } else {
                Task {
                    id: format!("{}~retry{attempt}", job.task.id),
                    parent: Some(job.task.id.clone()),
                    ..job.task.clone()
                }
            };

            let envelope = self.run_instance(job, &task, attempt, tx).await;
            let retry = !envelope.success
                && envelope.error_kind.is_some_and(ErrorKind::is_recoverable)
                && attempt < job.task.max_retries
                && !job.token.is_cancelled();
            last = Some(envelope);
            if !retry {
                break;
            }

            METRICS.inc_retries();
            let backoff = self.config.retry_backoff.saturating_mul(1u32 << attempt.min(16));
            debug!(task_id = %job.task.id, attempt, ?backoff, "retrying after recoverable failure");
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = job.token.cancelled() => break,
            }
        }
        last.unwrap_or_else(|| {
            ResultEnvelope::synthetic(
                &job.task,
                InstanceStatus::Cancelled,
                ErrorKind::Cancelled,
                "cancelled before dispatch",
            )
        })
    }

    /// The per-instance dispatch contract. Sends exactly one instance record.
    async fn run_instance(
        &self,
        job: &Job,
        task: &Task,
        attempt: u32,
        tx: &mpsc::UnboundedSender<LaneMsg>,
    ) -> ResultEnvelope {
        let mut instance = TaskInstance::new(task, attempt);
        let id = instance.instance_id.clone();
        let started = Instant::now();
        let timeout = self.config.effective_timeout(task.timeout);

        self.running.lock().insert(
            job.node,
            RunningInstance {
                instance: instance.clone(),
                task: task.clone(),
                worker: None,
            },
        );
        METRICS.inc_dispatched();
        obs::emit_instance_dispatched(&id, &task.id, &task.specialist_id, attempt);

        let finish = |instance: TaskInstance, mut envelope: ResultEnvelope, deferred: Vec<TodoId>| {
            envelope.duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
            self.finish_instance(job.node, instance, envelope.clone(), deferred, tx);
            envelope
        };

        // 1. Resources.
        let lease_token = CancellationToken::new();
        let lease = timeout + self.config.drain_timeout * 2;
        let acquired = tokio::select! {
            r = self.arbiter.acquire(&id, &task.resources, self.config.acquire_timeout, Some(lease), lease_token.clone()) => Some(r),
            _ = job.token.cancelled() => None,
        };
        let locks = match acquired {
            None => {
                let env = ResultEnvelope::failure(&id, task, InstanceStatus::Cancelled, ErrorKind::Cancelled, "cancelled while waiting for resources");
                return finish(instance, env, Vec::new());
            }
            Some(Err(e)) => {
                let env = ResultEnvelope::failure(&id, task, InstanceStatus::Failed, e.kind(), e.to_string());
                return finish(instance, env, Vec::new());
            }
            Some(Ok(locks)) => locks,
        };

        instance.status = InstanceStatus::Running;
        instance.started_at = Some(Utc::now());
        instance.held_resources = locks
            .iter()
            .map(|l| crate::domain::task::ResourceClaim {
                resource: l.resource.clone(),
                mode: l.mode,
            })
            .collect();
        if let Some(r) = self.running.lock().get_mut(&job.node) {
            r.instance = instance.clone();
        }

        // 2-3. Worker invocation.
        let Some(worker) = self.workers.resolve(&job.descriptor) else {
            let env = ResultEnvelope::failure(
                &id,
                task,
                InstanceStatus::Failed,
                ErrorKind::WorkerFailed,
                format!("no worker registered for specialist {}", task.specialist_id),
            );
            return finish(instance, env, Vec::new());
        };

        let (hb, mut hb_rx) = HeartbeatSender::channel(&id);
        let worker_cancel = CancellationToken::new();
        let request = WorkerRequest {
            instance_id: id.clone(),
            task_id: task.id.clone(),
            specialist_id: task.specialist_id.clone(),
            attempt,
            deadline: Utc::now() + chrono::Duration::from_std(timeout).unwrap_or(chrono::Duration::days(1)),
            context_package: Arc::clone(&job.package.package),
            package_ref: job.package.digest.clone(),
            forbidden_callees: job.package.package.forbidden_callees.clone(),
            descriptor: Arc::clone(&job.descriptor),
        };
        let wc = worker_cancel.clone();
        let mut handle = tokio::spawn(async move { worker.invoke(request, hb, wc).await });
        if let Some(r) = self.running.lock().get_mut(&job.node) {
            r.worker = Some(handle.abort_handle());
        }

        // 4. Heartbeats and deadlines.
        let hard_deadline = tokio::time::sleep(timeout);
        tokio::pin!(hard_deadline);
        let stale_after = self.config.heartbeat_interval * 2;
        let mut last_beat = Instant::now();
        let mut hb_open = true;

        let joined = loop {
            let stale = tokio::time::sleep_until(last_beat + stale_after);
            tokio::select! {
                biased;
                res = &mut handle => break Ok(res),
                _ = job.token.cancelled() => break Err(Interrupt::Cancelled),
                _ = lease_token.cancelled() => break Err(Interrupt::LeaseExpired),
                _ = &mut hard_deadline => break Err(Interrupt::Deadline),
                _ = stale => break Err(Interrupt::Stale),
                changed = hb_rx.changed(), if hb_open => match changed {
                    Ok(()) => {
                        last_beat = Instant::now();
                        instance.heartbeat_at = Some(Utc::now());
                    }
                    Err(_) => hb_open = false,
                },
            }
        };

        let joined = match joined {
            Ok(res) => Ok(res),
            Err(why) => {
                worker_cancel.cancel();
                match tokio::time::timeout(self.config.drain_timeout, &mut handle).await {
                    Ok(_) => {}
                    Err(_) => {
                        debug!(instance_id = %id, "worker ignored cancellation; aborting");
                        handle.abort();
                    }
                }
                Err(why)
            }
        };

        // 5. Terminal transition.
        let mut deferred = Vec::new();
        let envelope = match joined {
            Err(Interrupt::Cancelled) => {
                ResultEnvelope::failure(&id, task, InstanceStatus::Cancelled, ErrorKind::Cancelled, "cancelled")
            }
            Err(Interrupt::LeaseExpired) => ResultEnvelope::failure(
                &id,
                task,
                InstanceStatus::Failed,
                ErrorKind::LeaseExpired,
                "resource lease expired",
            ),
            Err(Interrupt::Deadline) => ResultEnvelope::failure(
                &id,
                task,
                InstanceStatus::TimedOut,
                ErrorKind::WorkerTimeout,
                format!("exceeded deadline of {timeout:?}"),
            ),
            Err(Interrupt::Stale) => ResultEnvelope::failure(
                &id,
                task,
                InstanceStatus::TimedOut,
                ErrorKind::WorkerTimeout,
                format!("no heartbeat for {stale_after:?}"),
            ),
            Ok(Err(join_err)) if join_err.is_panic() => ResultEnvelope::failure(
                &id,
                task,
                InstanceStatus::Failed,
                ErrorKind::WorkerPanic,
                "worker panicked",
            ),
            Ok(Err(_)) => {
                ResultEnvelope::failure(&id, task, InstanceStatus::Cancelled, ErrorKind::Cancelled, "worker aborted")
            }
            Ok(Ok(Err(e))) if job.token.is_cancelled() => ResultEnvelope::failure(
                &id,
                task,
                InstanceStatus::Cancelled,
                ErrorKind::Cancelled,
                format!("cancelled: {e:#}"),
            ),
            Ok(Ok(Err(e))) => {
                ResultEnvelope::failure(&id, task, InstanceStatus::Failed, ErrorKind::WorkerFailed, format!("{e:#}"))
            }
            Ok(Ok(Ok(resp))) => {
                let (env, d) = self.accept_response(&id, task, &job.descriptor, resp).await;
                deferred = d;
                env
            }
        };
        finish(instance, envelope, deferred)
    }

    /// Validate a response and apply the re-entrant request guard.
    async fn accept_response(
        &self,
        instance_id: &str,
        task: &Task,
        descriptor: &SpecialistDescriptor,
        resp: WorkerResponse,
    ) -> (ResultEnvelope, Vec<TodoId>) {
        if let Err(e) = resp.validate() {
            return (
                ResultEnvelope::failure(instance_id, task, InstanceStatus::Failed, e.kind(), e.to_string()),
                Vec::new(),
            );
        }
        if let Some(callee) = resp.spawn_requests.iter().find(|s| descriptor.forbids(s)) {
            return (
                ResultEnvelope::failure(
                    instance_id,
                    task,
                    InstanceStatus::Failed,
                    ErrorKind::ForbiddenCallee,
                    format!("{} requested forbidden callee {callee}", descriptor.id),
                ),
                Vec::new(),
            );
        }

        let mut deferred = Vec::new();
        if let Some(todos) = &self.todos {
            for callee in &resp.spawn_requests {
                match todos
                    .defer(
                        format!("spawn request for {callee} from task {}", task.id),
                        task.priority,
                        Some(task.id.clone()),
                        self.run_id.clone(),
                        format!("spawn request for {callee}"),
                    )
                    .await
                {
                    Ok(todo) => {
                        METRICS.inc_todos();
                        deferred.push(todo.id);
                    }
                    Err(e) => warn!(callee = %callee, error = %e, "failed to defer spawn request"),
                }
            }
        } else if !resp.spawn_requests.is_empty() {
            debug!(requests = ?resp.spawn_requests, "no todo store; dropping spawn requests");
        }

        let success = resp.success;
        let envelope = ResultEnvelope {
            instance_id: instance_id.to_string(),
            task_id: task.id.clone(),
            specialist_id: task.specialist_id.clone(),
            status: if success {
                InstanceStatus::Completed
            } else {
                InstanceStatus::Failed
            },
            confidence: resp.confidence,
            success,
            payload: resp.payload,
            evidence: resp.evidence,
            findings: resp.findings,
            error_kind: if success {
                None
            } else {
                Some(resp.error_kind.unwrap_or(ErrorKind::WorkerFailed))
            },
            error_message: resp.error_message,
            duration_ms: 0,
            tokens_used: resp.tokens_used,
            modified_state: resp.modified_state,
            synthetic: false,
        };
        (envelope, deferred)
    }
}

// ---------------------------------------------------------------------------
// Coordinator
// ---------------------------------------------------------------------------

struct Coordinator<'a> {
    exec: &'a Executor,
    graph: &'a TaskGraph,
    scope: &'a ExecutionScope,
    control: &'a ExecutionControl,
    shared: Arc<Shared>,
    done: Vec<bool>,
    /// Handed to a lane and not yet finished.
    admitted: BTreeSet<NodeId>,
    /// Node -> failed upstream task that dooms it.
    doomed: BTreeMap<NodeId, String>,
    halted_by: Option<String>,
    alt_tried: BTreeSet<NodeId>,
    backpressure: HashMap<NodeId, TodoId>,
    resumed: BTreeSet<NodeId>,
    in_flight: usize,
    report: ExecutionReport,
    lanes: JoinSet<()>,
    tx: mpsc::UnboundedSender<LaneMsg>,
    rx: mpsc::UnboundedReceiver<LaneMsg>,
}

impl Coordinator<'_> {
    async fn run(mut self) -> Result<ExecutionReport> {
        loop {
            if !self.report.cancelled {
                self.admit().await;
            }
            if self.in_flight == 0 {
                break;
            }
            tokio::select! {
                biased;
                _ = self.control.run.cancelled(), if !self.report.cancelled => {
                    self.report.cancelled = true;
                    info!(run_id = %self.scope.run_id, in_flight = self.in_flight, "execution cancelled; draining");
                    break;
                }
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.on_message(msg).await,
                    None => break,
                },
            }
        }

        if self.report.cancelled {
            self.drain().await;
        }

        // Anything still unfinished never got dispatched.
        for node in self.graph.node_ids() {
            if !self.done[node.0] {
                let (kind, msg) = if self.report.cancelled {
                    (ErrorKind::Cancelled, "run cancelled before dispatch".to_string())
                } else {
                    (ErrorKind::Internal, "node was never scheduled".to_string())
                };
                let env = ResultEnvelope::synthetic(self.graph.node(node), InstanceStatus::Cancelled, kind, msg);
                self.finish_node(node, env).await;
            }
        }

        Ok(self.report)
    }

    fn is_ready(&self, node: NodeId) -> bool {
        !self.done[node.0]
            && !self.admitted.contains(&node)
            && self.graph.predecessors(node).iter().all(|p| self.done[p.0])
    }

    /// Settle doomed/halted/cancelled nodes, then admit one wave.
    async fn admit(&mut self) {
        let runnable = loop {
            let ready: Vec<NodeId> = self.graph.node_ids().filter(|n| self.is_ready(*n)).collect();
            let mut runnable = Vec::new();
            let mut settled = false;
            for node in ready {
                let task = self.graph.node(node);
                let stand_in = if let Some(up) = &self.halted_by {
                    Some(ResultEnvelope::synthetic(
                        task,
                        InstanceStatus::Cancelled,
                        ErrorKind::UpstreamFailed,
                        format!("graph halted after failure of {up}"),
                    ))
                } else if self.control.node_token(node).is_cancelled() {
                    Some(ResultEnvelope::synthetic(
                        task,
                        InstanceStatus::Cancelled,
                        ErrorKind::Cancelled,
                        "cancelled before dispatch",
                    ))
                } else {
                    self.doomed.get(&node).map(|up| ResultEnvelope::upstream_failed(task, up))
                };
                match stand_in {
                    Some(env) => {
                        self.finish_node(node, env).await;
                        settled = true;
                    }
                    None => runnable.push(node),
                }
            }
            if !settled {
                break runnable;
            }
        };
        if runnable.is_empty() {
            return;
        }

        let mut runnable = runnable;
        runnable.sort_by(|a, b| {
            self.graph
                .node(*b)
                .priority
                .cmp(&self.graph.node(*a).priority)
                .then(a.cmp(b))
        });
        let capacity = self.exec.config.slots.saturating_sub(self.in_flight);
        let overflow = runnable.split_off(capacity.min(runnable.len()));
        for node in overflow {
            self.defer_for_backpressure(node).await;
        }

        let mut jobs = Vec::new();
        for node in runnable {
            let task = self.graph.node(node).clone();
            if let Some(todo) = self.backpressure.get(&node).copied() {
                if let Some(store) = &self.exec.todos {
                    match store.resume(todo, self.scope.run_id.clone()).await {
                        Ok(_) => {
                            self.resumed.insert(node);
                        }
                        Err(e) => warn!(todo = %todo, error = %e, "failed to resume deferred todo"),
                    }
                }
            }
            match self.job_for(node, task) {
                Ok(job) => jobs.push(job),
                Err(env) => self.finish_node(node, env).await,
            }
        }
        for lane in lanes_of(jobs) {
            self.spawn_lane(lane);
        }
    }

    fn job_for(&self, node: NodeId, task: Task) -> std::result::Result<Job, ResultEnvelope> {
        let descriptor = self.scope.registry.lookup(&task.specialist_id).map_err(|e| {
            ResultEnvelope::synthetic(&task, InstanceStatus::Failed, e.kind(), e.to_string())
        })?;

        let preds = self.graph.predecessors(node);
        let finals = &self.report.finals;
        let direct: Vec<&ResultEnvelope> = if preds.is_empty() {
            self.scope.seed.iter().collect()
        } else {
            preds.iter().filter_map(|p| finals.get(p)).collect()
        };
        let mut indirect: Vec<&ResultEnvelope> = self
            .graph
            .ancestors(node)
            .difference(&preds)
            .filter_map(|a| finals.get(a))
            .collect();
        if !preds.is_empty() {
            indirect.extend(self.scope.seed.iter());
        }

        let package = self
            .exec
            .contexts
            .build(&self.scope.request, &descriptor, &task, &direct, &indirect)
            .map_err(|e| ResultEnvelope::synthetic(&task, InstanceStatus::Failed, e.kind(), e.to_string()))?;

        Ok(Job {
            node,
            task,
            descriptor,
            package,
            token: self.control.node_token(node),
        })
    }

    fn spawn_lane(&mut self, jobs: Vec<Job>) {
        for job in &jobs {
            self.admitted.insert(job.node);
        }
        self.in_flight += jobs.len();
        let shared = Arc::clone(&self.shared);
        let tx = self.tx.clone();
        self.lanes.spawn(shared.run_lane(jobs, tx));
    }

    async fn defer_for_backpressure(&mut self, node: NodeId) {
        if self.backpressure.contains_key(&node) {
            return;
        }
        let Some(store) = &self.exec.todos else {
            return;
        };
        let task = self.graph.node(node);
        match store
            .defer(
                format!("run {} task {} ({})", self.scope.run_id, task.id, task.specialist_id),
                task.priority,
                Some(task.id.clone()),
                self.scope.run_id.clone(),
                BACKPRESSURE,
            )
            .await
        {
            Ok(todo) => {
                METRICS.inc_todos();
                debug!(task_id = %task.id, todo = %todo.id, "deferred for backpressure");
                self.backpressure.insert(node, todo.id);
                self.report.deferred.push(todo.id);
            }
            Err(e) => warn!(task_id = %task.id, error = %e, "failed to record backpressure"),
        }
    }

    async fn on_message(&mut self, msg: LaneMsg) {
        match msg {
            LaneMsg::Instance { record, deferred } => {
                self.report.deferred.extend(deferred);
                self.report.instances.push(*record);
            }
            LaneMsg::Finished { node, envelope } => {
                self.in_flight = self.in_flight.saturating_sub(1);
                self.admitted.remove(&node);
                if !envelope.success && !self.report.cancelled && self.try_alternate(node) {
                    return;
                }
                self.finish_node(node, *envelope).await;
            }
        }
    }

    /// Re-dispatch a failed node on its alternate specialist, once.
    fn try_alternate(&mut self, node: NodeId) -> bool {
        let wants = self
            .graph
            .outgoing(node)
            .any(|e| e.policy == EdgePolicy::TryAlternate);
        let Some(alt) = self.graph.alternate(node) else {
            return false;
        };
        if !wants || !self.alt_tried.insert(node) {
            return false;
        }
        let original = self.graph.node(node);
        let Ok(descriptor) = self.scope.registry.lookup(alt) else {
            return false;
        };
        let task = Task {
            id: format!("{}~alt", original.id),
            specialist_id: alt.to_string(),
            resources: merge_claims(&descriptor.default_claims(), &[]),
            max_retries: descriptor.max_retries,
            timeout: descriptor.timeout,
            parent: Some(original.id.clone()),
            ..original.clone()
        };
        info!(task_id = %original.id, alternate = %alt, "trying alternate specialist");
        match self.job_for(node, task) {
            Ok(job) => {
                self.spawn_lane(vec![job]);
                true
            }
            Err(_) => false,
        }
    }

    /// Record a node's final envelope and propagate failure along its edges.
    async fn finish_node(&mut self, node: NodeId, envelope: ResultEnvelope) {
        self.done[node.0] = true;
        self.admitted.remove(&node);

        if let Some(todo) = self.backpressure.remove(&node) {
            self.settle_backpressure(node, todo, &envelope).await;
        }

        if !envelope.success {
            let failed = self.graph.node(node).id.clone();
            for e in self.graph.outgoing(node) {
                match e.policy {
                    EdgePolicy::HaltGraph => {
                        if self.halted_by.is_none() {
                            warn!(task_id = %failed, "halt-graph edge fired");
                            self.halted_by = Some(failed.clone());
                        }
                        self.report.halted = true;
                    }
                    EdgePolicy::SkipConsumers | EdgePolicy::TryAlternate => {
                        self.doomed.entry(e.to).or_insert_with(|| failed.clone());
                    }
                }
            }
        }
        self.report.finals.insert(node, envelope);
    }

    /// Close out the todo recorded when `node` overflowed the slot pool.
    ///
    /// A node that never left the queue because the run was cancelled goes
    /// back to pending so a later session can pick it up.
    async fn settle_backpressure(&mut self, node: NodeId, todo: TodoId, envelope: &ResultEnvelope) {
        let Some(store) = &self.exec.todos else {
            return;
        };
        let resumed = self.resumed.remove(&node);
        let outcome = if !resumed && self.report.cancelled {
            store.release(todo).await
        } else {
            let claimed = if resumed {
                Ok(())
            } else {
                store.resume(todo, self.scope.run_id.clone()).await.map(|_| ())
            };
            match claimed {
                Err(e) => Err(e),
                Ok(()) if envelope.success => {
                    let result_ref = self
                        .report
                        .instances
                        .iter()
                        .rev()
                        .find(|r| r.node == node)
                        .and_then(|r| r.instance.result_ref.clone())
                        .unwrap_or_else(|| envelope.instance_id.clone());
                    store.complete(todo, result_ref).await
                }
                Ok(()) => {
                    let reason = envelope
                        .error_message
                        .clone()
                        .or_else(|| envelope.error_kind.map(|k| k.to_string()))
                        .unwrap_or_default();
                    store.abandon(todo, reason).await
                }
            }
        };
        match outcome {
            Ok(_) => METRICS.inc_todos(),
            Err(e) => debug!(todo = %todo, error = %e, "could not settle backpressure todo"),
        }
    }

    /// Wait for lanes to report after cancellation, then force the rest.
    async fn drain(&mut self) {
        let give_up = Instant::now() + self.exec.config.drain_timeout + self.exec.config.force_grace();
        while self.in_flight > 0 {
            tokio::select! {
                msg = self.rx.recv() => match msg {
                    Some(msg) => self.on_message(msg).await,
                    None => break,
                },
                _ = tokio::time::sleep_until(give_up) => break,
            }
        }
        if self.in_flight == 0 {
            return;
        }

        warn!(run_id = %self.scope.run_id, outstanding = self.in_flight, "drain timeout; forcing cancellation");
        self.lanes.abort_all();
        while let Ok(msg) = self.rx.try_recv() {
            self.on_message(msg).await;
        }

        let stuck: Vec<(NodeId, RunningInstance)> = self.shared.running.lock().drain().collect();
        for (node, running) in stuck {
            if let Some(w) = &running.worker {
                w.abort();
            }
            let env = ResultEnvelope::failure(
                &running.instance.instance_id,
                &running.task,
                InstanceStatus::Cancelled,
                ErrorKind::Cancelled,
                "force-cancelled after drain timeout",
            );
            let (tx, mut rx) = mpsc::unbounded_channel();
            self.shared.finish_instance(node, running.instance, env.clone(), Vec::new(), &tx);
            if let Some(msg) = rx.recv().await {
                self.on_message(msg).await;
            }
            self.finish_node(node, env).await;
        }

        for node in std::mem::take(&mut self.admitted) {
            if !self.done[node.0] {
                let env = ResultEnvelope::synthetic(
                    self.graph.node(node),
                    InstanceStatus::Cancelled,
                    ErrorKind::Cancelled,
                    "cancelled before dispatch",
                );
                self.finish_node(node, env).await;
            }
        }
        self.in_flight = 0;
    }
}

/// Split jobs into lanes: connected components of the resource-conflict graph.
fn lanes_of(jobs: Vec<Job>) -> Vec<Vec<Job>> {
    let n = jobs.len();
    let mut parent: Vec<usize> = (0..n).collect();

    fn find(parent: &mut [usize], mut i: usize) -> usize {
        while parent[i] != i {
            parent[i] = parent[parent[i]];
            i = parent[i];
        }
        i
    }

    for i in 0..n {
        for j in (i + 1)..n {
            let conflict = jobs[i]
                .task
                .resources
                .iter()
                .any(|a| jobs[j].task.resources.iter().any(|b| a.conflicts_with(b)));
            if conflict {
                let (ri, rj) = (find(&mut parent, i), find(&mut parent, j));
                if ri != rj {
                    parent[rj] = ri;
                }
            }
        }
    }

    let mut lanes: BTreeMap<usize, Vec<Job>> = BTreeMap::new();
    for (i, job) in jobs.into_iter().enumerate() {
        let root = find(&mut parent, i);
        lanes.entry(root).or_default().push(job);
    }
    lanes.into_values().collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::artifacts::memory::MemoryArtifactStore;
    use crate::domain::task::ResourceClaim;
    use crate::graph::{test_task, GraphBuilder};
    use crate::worker::{FnWorker, SpecialistWorker};
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn registry(ids: &[&str]) -> Arc<RegistrySnapshot> {
        Arc::new(
            RegistrySnapshot::from_descriptors(
                ids.iter().map(|id| crate::domain::SpecialistDescriptor::new(*id, "work")),
                1,
            )
            .unwrap(),
        )
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig {
            slots: 10,
            default_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(60),
            drain_timeout: Duration::from_millis(200),
            acquire_timeout: Duration::from_secs(5),
            retry_backoff: Duration::from_millis(1),
        }
    }

    fn executor(cfg: ExecutorConfig, workers: WorkerSet) -> Executor {
        Executor::new(
            cfg,
            Arc::new(ResourceArbiter::new()),
            workers,
            Arc::new(ContextPackageBuilder::new(Arc::new(MemoryArtifactStore::new()))),
        )
    }

    fn scope(reg: Arc<RegistrySnapshot>) -> ExecutionScope {
        ExecutionScope {
            run_id: "run-test".into(),
            request: RunRequest::new("test"),
            registry: reg,
            seed: Vec::new(),
        }
    }

    fn ok_worker(confidence: f64) -> FnWorker {
        FnWorker::new(move |req, _hb, _c| async move {
            Ok(WorkerResponse::ok(confidence, json!({ "task": req.task_id })))
        })
    }

    fn failing_worker() -> FnWorker {
        FnWorker::new(|_req, _hb, _c| async move { Ok(WorkerResponse::failed("boom")) })
    }

    async fn run(exec: &Executor, graph: &TaskGraph, reg: Arc<RegistrySnapshot>) -> ExecutionReport {
        let control = ExecutionControl::new(graph, &CancellationToken::new());
        exec.execute(graph, &scope(reg), &control).await.unwrap()
    }

    #[tokio::test]
    async fn test_chain_runs_in_order_and_passes_context() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        let worker = FnWorker::new(move |req, _hb, _c| {
            let s = Arc::clone(&s);
            async move {
                s.lock().push((req.task_id.clone(), req.context_package.upstream.len()));
                Ok(WorkerResponse::ok(0.9, json!({ "from": req.task_id })))
            }
        });
        let reg = registry(&["a", "b"]);
        let mut g = GraphBuilder::new();
        let a = g.add_node(test_task("first", "a"));
        let b = g.add_node(test_task("second", "b"));
        g.add_edge(a, b, EdgePolicy::SkipConsumers);
        let graph = g.build().unwrap();

        let exec = executor(config(), WorkerSet::new().with_fallback(worker));
        let report = run(&exec, &graph, reg).await;

        assert!(report.all_succeeded());
        assert_eq!(report.dispatched(), 2);
        assert_eq!(
            *seen.lock(),
            vec![("first".to_string(), 0), ("second".to_string(), 1)]
        );
        assert_eq!(exec.arbiter().held_count(), 0);
    }

    #[tokio::test]
    async fn test_skip_consumers_synthesizes_upstream_failed() {
        let reg = registry(&["bad", "good"]);
        let mut g = GraphBuilder::new();
        let a = g.add_node(test_task("producer", "bad"));
        let b = g.add_node(test_task("consumer", "good"));
        let c = g.add_node(test_task("grandchild", "good"));
        let d = g.add_node(test_task("sibling", "good"));
        g.add_edge(a, b, EdgePolicy::SkipConsumers);
        g.add_edge(b, c, EdgePolicy::SkipConsumers);
        let graph = g.build().unwrap();

        let exec = executor(
            config(),
            WorkerSet::new().with("bad", failing_worker()).with("good", ok_worker(0.9)),
        );
        let report = run(&exec, &graph, reg).await;

        assert_eq!(report.dispatched(), 2);
        assert_eq!(report.finals[&b].error_kind, Some(ErrorKind::UpstreamFailed));
        assert!(report.finals[&b].synthetic);
        assert_eq!(report.finals[&c].error_kind, Some(ErrorKind::UpstreamFailed));
        assert!(report.finals[&d].success);
        assert!(!report.halted);
    }

    #[tokio::test]
    async fn test_halt_graph_stops_pending_nodes() {
        let reg = registry(&["bad", "good"]);
        let mut g = GraphBuilder::new();
        let a = g.add_node(test_task("producer", "bad"));
        let b = g.add_node(test_task("consumer", "good"));
        g.add_edge(a, b, EdgePolicy::HaltGraph);
        let graph = g.build().unwrap();

        let exec = executor(
            config(),
            WorkerSet::new().with("bad", failing_worker()).with("good", ok_worker(0.9)),
        );
        let report = run(&exec, &graph, reg).await;
        assert!(report.halted);
        assert_eq!(report.dispatched(), 1);
        assert!(report.finals[&b].error_message.as_deref().unwrap_or("").contains("halted"));
    }

    #[tokio::test]
    async fn test_try_alternate_reruns_on_alternate_specialist() {
        let reg = registry(&["bad", "backup", "good"]);
        let mut g = GraphBuilder::new();
        let a = g.add_node(test_task("producer", "bad"));
        let b = g.add_node(test_task("consumer", "good"));
        g.add_edge(a, b, EdgePolicy::TryAlternate);
        g.set_alternate(a, "backup");
        let graph = g.build().unwrap();

        let exec = executor(
            config(),
            WorkerSet::new()
                .with("bad", failing_worker())
                .with("backup", ok_worker(0.7))
                .with("good", ok_worker(0.9)),
        );
        let report = run(&exec, &graph, reg).await;

        assert_eq!(report.dispatched(), 3);
        assert_eq!(report.finals[&a].specialist_id, "backup");
        assert_eq!(report.finals[&a].task_id, "producer~alt");
        assert!(report.all_succeeded());
    }

    #[tokio::test]
    async fn test_panicking_worker_is_isolated() {
        let reg = registry(&["panics", "fine"]);
        let mut g = GraphBuilder::new();
        let a = g.add_node(test_task("p", "panics"));
        let b = g.add_node(test_task("f", "fine"));
        let graph = g.build().unwrap();

        let panicker = FnWorker::new(|_req, _hb, _c| async move {
            if true {
                panic!("specialist blew up");
            }
            Ok(WorkerResponse::ok(1.0, json!(null)))
        });
        let exec = executor(config(), WorkerSet::new().with("panics", panicker).with("fine", ok_worker(0.8)));
        let report = run(&exec, &graph, reg).await;

        assert_eq!(report.finals[&a].error_kind, Some(ErrorKind::WorkerPanic));
        assert!(report.finals[&b].success);
        assert_eq!(report.dispatched(), 2);
    }

    #[tokio::test]
    async fn test_recoverable_failure_is_retried_as_derived_task() {
        let calls = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&calls);
        let flaky = FnWorker::new(move |_req, _hb, _cancel| {
            let c = Arc::clone(&c);
            async move {
                if c.fetch_add(1, Ordering::SeqCst) == 0 {
                    let mut r = WorkerResponse::failed("transient");
                    r.error_kind = Some(ErrorKind::WorkerTimeout);
                    Ok(r)
                } else {
                    Ok(WorkerResponse::ok(0.9, json!(null)))
                }
            }
        });
        let reg = registry(&["flaky"]);
        let mut g = GraphBuilder::new();
        let mut task = test_task("t", "flaky");
        task.max_retries = 2;
        let a = g.add_node(task);
        let graph = g.build().unwrap();

        let exec = executor(config(), WorkerSet::new().with("flaky", flaky));
        let report = run(&exec, &graph, reg).await;

        assert_eq!(report.dispatched(), 2);
        assert!(report.finals[&a].success);
        assert_eq!(report.finals[&a].task_id, "t~retry1");
        assert_eq!(report.instances[1].instance.attempt, 1);
    }

    #[tokio::test]
    async fn test_forbidden_spawn_request_fails_instance() {
        let reg = Arc::new(
            RegistrySnapshot::from_descriptors(
                [crate::domain::SpecialistDescriptor::new("planner", "work").with_forbidden_callees(["orchestrator"])],
                1,
            )
            .unwrap(),
        );
        let w = FnWorker::new(|_req, _hb, _c| async move {
            Ok(WorkerResponse::ok(0.9, json!(null)).with_spawn_request("orchestrator"))
        });
        let mut g = GraphBuilder::new();
        let a = g.add_node(test_task("t", "planner"));
        let graph = g.build().unwrap();

        let exec = executor(config(), WorkerSet::new().with("planner", w));
        let report = run(&exec, &graph, reg).await;
        assert_eq!(report.finals[&a].error_kind, Some(ErrorKind::ForbiddenCallee));
    }

    #[tokio::test]
    async fn test_allowed_spawn_request_becomes_blocked_todo() {
        let todos = TodoStore::in_memory(agentflow_todo::TodoConfig::default());
        let reg = registry(&["planner"]);
        let w = FnWorker::new(|_req, _hb, _c| async move {
            Ok(WorkerResponse::ok(0.9, json!(null)).with_spawn_request("researcher"))
        });
        let mut g = GraphBuilder::new();
        let a = g.add_node(test_task("t", "planner"));
        let graph = g.build().unwrap();

        let exec = executor(config(), WorkerSet::new().with("planner", w)).with_todos(todos.clone());
        let report = run(&exec, &graph, reg).await;

        assert!(report.finals[&a].success);
        assert_eq!(report.deferred.len(), 1);
        let todo = todos.get(report.deferred[0]).unwrap();
        assert_eq!(todo.state, agentflow_todo::TodoState::Blocked);
        assert!(todo.description.contains("researcher"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_worker_times_out_after_two_heartbeats() {
        let reg = registry(&["silent"]);
        let silent = FnWorker::new(|_req, hb, cancel| async move {
            // keep the sender alive without beating
            let _hb = hb;
            cancel.cancelled().await;
            anyhow::bail!("stopped")
        });
        let mut g = GraphBuilder::new();
        let a = g.add_node(test_task("t", "silent"));
        let graph = g.build().unwrap();

        let mut cfg = config();
        cfg.heartbeat_interval = Duration::from_millis(100);
        let exec = executor(cfg, WorkerSet::new().with("silent", silent));
        let started = Instant::now();
        let report = run(&exec, &graph, reg).await;

        let env = &report.finals[&a];
        assert_eq!(env.status, InstanceStatus::TimedOut);
        assert_eq!(env.error_kind, Some(ErrorKind::WorkerTimeout));
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_millis(200));
        assert!(elapsed < Duration::from_millis(200) + Duration::from_millis(250));
    }

    #[tokio::test(start_paused = true)]
    async fn test_backpressure_defers_overflow_and_settles_todos() {
        let todos = TodoStore::in_memory(agentflow_todo::TodoConfig::default());
        let reg = registry(&["w"]);
        let slow = FnWorker::new(|_req, _hb, _c| async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            Ok(WorkerResponse::ok(0.9, json!(null)))
        });
        let mut g = GraphBuilder::new();
        for i in 0..3 {
            g.add_node(test_task(&format!("t{i}"), "w"));
        }
        let graph = g.build().unwrap();

        let mut cfg = config();
        cfg.slots = 1;
        let exec = executor(cfg, WorkerSet::new().with("w", slow)).with_todos(todos.clone());
        let report = run(&exec, &graph, reg).await;

        assert!(report.all_succeeded());
        assert_eq!(report.deferred.len(), 2);
        for id in &report.deferred {
            assert_eq!(todos.get(*id).unwrap().state, agentflow_todo::TodoState::Completed);
        }
    }

    #[test]
    fn test_conflicting_claims_share_a_lane() {
        let mk = |id: &str, claim: ResourceClaim| {
            let mut t = test_task(id, "w");
            t.resources = vec![claim];
            t
        };
        let reg = registry(&["w"]);
        let jobs: Vec<Job> = [
            mk("a", ResourceClaim::exclusive("r")),
            mk("b", ResourceClaim::shared("r")),
            mk("c", ResourceClaim::shared("other")),
        ]
        .into_iter()
        .enumerate()
        .map(|(i, task)| Job {
            node: NodeId(i),
            descriptor: reg.lookup("w").unwrap(),
            package: PackageRef {
                digest: String::new(),
                package: crate::worker::testing::request_for("w").context_package,
            },
            token: CancellationToken::new(),
            task,
        })
        .collect();

        let lanes = lanes_of(jobs);
        let mut sizes: Vec<usize> = lanes.iter().map(Vec::len).collect();
        sizes.sort();
        assert_eq!(sizes, vec![1, 2]);
    }

    #[tokio::test]
    async fn test_no_worker_fails_instance() {
        let reg = registry(&["orphan"]);
        let mut g = GraphBuilder::new();
        let a = g.add_node(test_task("t", "orphan"));
        let graph = g.build().unwrap();
        let exec = executor(config(), WorkerSet::new());
        let report = run(&exec, &graph, reg).await;
        assert_eq!(report.finals[&a].error_kind, Some(ErrorKind::WorkerFailed));
        assert_eq!(report.dispatched(), 1);
    }

    #[allow(dead_code)]
    fn assert_worker_object_safe(_: &dyn SpecialistWorker) {}
}
