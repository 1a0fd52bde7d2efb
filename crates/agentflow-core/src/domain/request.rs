//! User run requests and planner task specifications.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::domain::error::{OrchestrationError, Result};
use crate::domain::task::ResourceClaim;

/// What happens to consumers when a producer fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EdgePolicy {
    /// Stop dispatching anything else in the graph.
    HaltGraph,
    /// Skip the consumer with a synthetic `UPSTREAM_FAILED` envelope.
    #[default]
    SkipConsumers,
    /// Re-run the producer on its alternate specialist before giving up.
    TryAlternate,
}

/// One task as emitted by a planning specialist or written in a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct TaskSpec {
    /// Local name used by `depends_on`; defaults to `<specialist>-<index>`.
    #[serde(default)]
    pub key: Option<String>,
    pub specialist: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Task-specific resource overrides merged over the descriptor's set.
    #[serde(default)]
    pub resources: Vec<ResourceClaim>,
    #[serde(default)]
    pub priority: u32,
    #[serde(default)]
    pub instruction: Option<String>,
    /// Policy applied to every incoming edge of this task.
    #[serde(default)]
    pub on_upstream_failure: EdgePolicy,
    /// Specialist to try when this task fails and a consumer asks for it.
    #[serde(default)]
    pub alternate: Option<String>,
}

impl TaskSpec {
    pub fn new(specialist: impl Into<String>) -> Self {
        Self {
            key: None,
            specialist: specialist.into(),
            depends_on: Vec::new(),
            resources: Vec::new(),
            priority: 0,
            instruction: None,
            on_upstream_failure: EdgePolicy::default(),
            alternate: None,
        }
    }

    pub fn key(mut self, key: impl Into<String>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn depends_on(mut self, key: impl Into<String>) -> Self {
        self.depends_on.push(key.into());
        self
    }

    pub fn resource(mut self, claim: ResourceClaim) -> Self {
        self.resources.push(claim);
        self
    }

    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn on_upstream_failure(mut self, policy: EdgePolicy) -> Self {
        self.on_upstream_failure = policy;
        self
    }

    pub fn alternate(mut self, specialist: impl Into<String>) -> Self {
        self.alternate = Some(specialist.into());
        self
    }
}

fn all_phases() -> Vec<u8> {
    (0..=9).collect()
}

/// A user request driving one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRequest {
    pub goal: String,
    /// Phases to execute; unlisted phases are skipped with a recorded reason.
    #[serde(default = "all_phases")]
    pub phases: Vec<u8>,
    /// Tasks the requester wants planned in addition to planner output.
    #[serde(default)]
    pub tasks: Vec<TaskSpec>,
    /// Force or suppress the version-control handoff; inferred from worker
    /// responses when absent.
    #[serde(default)]
    pub modifies_state: Option<bool>,
    /// Opaque requester context handed to every specialist.
    #[serde(default)]
    pub context: serde_json::Value,
}

impl RunRequest {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            phases: all_phases(),
            tasks: Vec::new(),
            modifies_state: None,
            context: serde_json::Value::Null,
        }
    }

    pub fn with_phases(mut self, phases: impl IntoIterator<Item = u8>) -> Self {
        self.phases = phases.into_iter().collect();
        self
    }

    pub fn with_task(mut self, task: TaskSpec) -> Self {
        self.tasks.push(task);
        self
    }

    pub fn wants_phase(&self, phase: u8) -> bool {
        self.phases.contains(&phase)
    }

    /// Parse a request document (YAML or JSON).
    pub fn parse(text: &str) -> Result<Self> {
        let request: RunRequest = serde_yaml::from_str(text)
            .map_err(|e| OrchestrationError::InvalidPlan(format!("request: {e}")))?;
        request.validate()?;
        Ok(request)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::parse(&text)
    }

    fn validate(&self) -> Result<()> {
        if self.goal.trim().is_empty() {
            return Err(OrchestrationError::InvalidPlan("request goal is empty".into()));
        }
        if let Some(p) = self.phases.iter().find(|p| **p > 9) {
            return Err(OrchestrationError::InvalidPlan(format!("unknown phase {p}")));
        }
        Ok(())
    }
}
