//! agentflow-core: phased multi-agent orchestration
//!
//! A request is researched, planned into a task graph over registered
//! specialists, executed concurrently under resource locks, integrated,
//! validated and finally meta-audited by independent auditor instances.
//! Every phase ends in a declarative gate.
//!
//! ## Layer 1 - Orchestration
//!
//! ## Key Components
//!
//! - `AgentRegistry`: specialist descriptors with copy-on-write reloads
//! - `TaskGraph` / `Planner`: immutable arena graph and the planners that build it
//! - `ResourceArbiter`: all-or-nothing shared/exclusive locks with deadlock detection
//! - `Executor`: wave scheduler over a bounded slot pool
//! - `ContextPackageBuilder`: budget-capped, content-addressed context bundles
//! - `consensus` / `gate`: aggregation of independent runs and phase predicates
//! - `PhaseController`: phases 0-9, retries, exit codes

pub mod arbiter;
pub mod artifacts;
pub mod config;
pub mod consensus;
pub mod context;
pub mod domain;
pub mod executor;
pub mod gate;
pub mod graph;
pub mod metrics;
pub mod obs;
pub mod phase;
pub mod registry;
pub mod reporting;
pub mod telemetry;
pub mod worker;

pub use domain::{
    Capability, EdgePolicy, ErrorKind, Evidence, Finding, InstanceStatus, LockMode,
    OrchestrationError, ResourceClaim, Result, ResultEnvelope, RunRequest, Severity,
    SpecialistDescriptor, Task, TaskInstance, TaskSpec,
};

pub use arbiter::{ArbiterError, ResourceArbiter, ResourceLock};
pub use artifacts::fs::FsArtifactStore;
pub use artifacts::memory::MemoryArtifactStore;
pub use artifacts::{put_json, ArtifactError, ArtifactStore, Digest};
pub use config::OrchestratorConfig;
pub use consensus::{aggregate, detect_conflicts, Classification, ConsensusPolicy, ConsensusRecord};
pub use context::{ContextPackage, ContextPackageBuilder, PackageRef, Summarizer, TruncatingSummarizer};
pub use executor::{
    ExecutionControl, ExecutionReport, ExecutionScope, Executor, ExecutorConfig, InstanceRecord,
};
pub use gate::{evaluate_gate, GateInput, GatePredicate, GateRule, GateVerdict, Violation};
pub use graph::{plan_fanout, DefaultPlanner, GraphBuilder, NodeId, PlanInput, Planner, TaskGraph};
pub use metrics::METRICS;
pub use phase::{PhaseController, PhaseRecord, PhaseStatus, RunOutcome, RunStatus, PHASE_NAMES};
pub use registry::{AgentRegistry, DescriptorSource, DirectorySource, InlineSource, RegistrySnapshot};
pub use reporting::{render_report_md, write_reports, RunReport};
pub use worker::{
    CommandWorker, DryRunWorker, FnWorker, Heartbeat, HeartbeatSender, SpecialistWorker,
    WorkerRequest, WorkerResponse, WorkerSet,
};

/// Crate version, reported by the CLI.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
