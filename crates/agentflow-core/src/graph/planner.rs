//! Planning: turning a request plus registry into a [`TaskGraph`].
//!
//! Planning is a pure function of its inputs. Task specs come from the
//! planning specialists' payloads (`{"tasks": [...]}`) followed by the
//! request's own `tasks`; with neither, every non-reserved specialist gets one
//! independent node.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;
use tracing::debug;

use crate::domain::descriptor::{is_reserved_domain, SpecialistDescriptor, DOMAIN_AUDIT};
use crate::domain::envelope::ResultEnvelope;
use crate::domain::error::{OrchestrationError, Result};
use crate::domain::request::{RunRequest, TaskSpec};
use crate::domain::task::{merge_claims, Task};
use crate::graph::{GraphBuilder, TaskGraph};
use crate::registry::RegistrySnapshot;

/// Everything the planner may look at.
#[derive(Debug, Clone, Copy)]
pub struct PlanInput<'a> {
    pub request: &'a RunRequest,
    pub registry: &'a RegistrySnapshot,
    /// Successful phase-1 envelopes.
    pub research: &'a [ResultEnvelope],
    /// Successful envelopes from planning specialists.
    pub planning: &'a [ResultEnvelope],
    /// Artifact reference of the request-level input context.
    pub input_ref: Option<&'a str>,
}

/// Builds execution and audit graphs.
pub trait Planner: Send + Sync {
    /// Phase-4 execution graph.
    fn plan(&self, input: &PlanInput<'_>) -> Result<TaskGraph>;

    /// Phase-9 audit sub-graph: independent instances per auditor role.
    fn plan_audit(&self, registry: &RegistrySnapshot, instances: usize) -> Result<TaskGraph> {
        plan_fanout(registry, DOMAIN_AUDIT, 9, instances, Duration::ZERO)
    }
}

#[derive(Debug, Deserialize)]
struct PlannedTasks {
    #[serde(default)]
    tasks: Vec<TaskSpec>,
}

/// Planner driven by planning-specialist payloads and request task lists.
#[derive(Debug, Clone)]
pub struct DefaultPlanner {
    default_timeout: Duration,
}

impl Default for DefaultPlanner {
    fn default() -> Self {
        Self::new(Duration::from_secs(300))
    }
}

impl DefaultPlanner {
    pub fn new(default_timeout: Duration) -> Self {
        Self { default_timeout }
    }

    fn collect_specs(&self, input: &PlanInput<'_>) -> Result<Vec<TaskSpec>> {
        let mut planning: Vec<&ResultEnvelope> = input.planning.iter().filter(|e| e.success).collect();
        planning.sort_by(|a, b| (&a.specialist_id, &a.task_id).cmp(&(&b.specialist_id, &b.task_id)));

        let mut specs = Vec::new();
        for env in planning {
            if env.payload.is_null() {
                continue;
            }
            let planned: PlannedTasks = serde_json::from_value(env.payload.clone()).map_err(|e| {
                OrchestrationError::InvalidPlan(format!("planner {} emitted malformed tasks: {e}", env.specialist_id))
            })?;
            specs.extend(planned.tasks);
        }
        specs.extend(input.request.tasks.iter().cloned());

        if specs.is_empty() {
            specs = input
                .registry
                .list(|d| !is_reserved_domain(&d.domain))
                .iter()
                .map(|d| TaskSpec::new(d.id.clone()))
                .collect();
            debug!(nodes = specs.len(), "no planned tasks; one node per specialist");
        }
        Ok(specs)
    }

    fn task_for(&self, key: &str, spec: &TaskSpec, descriptor: &SpecialistDescriptor, input_ref: Option<&str>) -> Task {
        Task {
            id: key.to_string(),
            specialist_id: descriptor.id.clone(),
            phase: 4,
            input_ref: input_ref.map(str::to_string),
            resources: merge_claims(&descriptor.default_claims(), &spec.resources),
            priority: spec.priority,
            max_retries: descriptor.max_retries,
            timeout: effective(descriptor.timeout, self.default_timeout),
            parent: None,
            instruction: spec.instruction.clone(),
        }
    }
}

impl Planner for DefaultPlanner {
    fn plan(&self, input: &PlanInput<'_>) -> Result<TaskGraph> {
        let specs = self.collect_specs(input)?;
        if specs.is_empty() {
            return Err(OrchestrationError::InvalidPlan(
                "nothing to plan: no tasks and no executable specialists".into(),
            ));
        }

        let mut builder = GraphBuilder::new();
        let mut by_key = HashMap::new();
        for (idx, spec) in specs.iter().enumerate() {
            let descriptor = input.registry.lookup(&spec.specialist)?;
            let key = spec
                .key
                .clone()
                .unwrap_or_else(|| format!("{}-{idx}", spec.specialist));
            let node = builder.add_node(self.task_for(&key, spec, &descriptor, input.input_ref));
            if by_key.insert(key.clone(), node).is_some() {
                return Err(OrchestrationError::InvalidPlan(format!("duplicate task key {key}")));
            }
            if let Some(alt) = &spec.alternate {
                input.registry.lookup(alt)?;
                builder.set_alternate(node, alt.clone());
            }
        }

        for (idx, spec) in specs.iter().enumerate() {
            let to = crate::graph::NodeId(idx);
            for dep in &spec.depends_on {
                let from = by_key.get(dep).copied().ok_or_else(|| {
                    OrchestrationError::InvalidPlan(format!("task {} depends on unknown task {dep}", specs[idx].specialist))
                })?;
                builder.add_edge(from, to, spec.on_upstream_failure);
            }
        }

        builder.build()
    }
}

fn effective(declared: Duration, default: Duration) -> Duration {
    if declared.is_zero() {
        default
    } else {
        declared
    }
}

/// One independent node per instance of every specialist in `domain`.
///
/// Node ids are `<domain>:<specialist>:<i>`; instances of the same specialist
/// form one consensus group keyed by the specialist id. A descriptor's own
/// `instances` overrides `default_instances`.
pub fn plan_fanout(
    registry: &RegistrySnapshot,
    domain: &str,
    phase: u8,
    default_instances: usize,
    default_timeout: Duration,
) -> Result<TaskGraph> {
    let mut builder = GraphBuilder::new();
    for d in registry.in_domain(domain) {
        let n = d.instances.unwrap_or(default_instances).max(1);
        for i in 0..n {
            let node = builder.add_node(Task {
                id: format!("{domain}:{}:{i}", d.id),
                specialist_id: d.id.clone(),
                phase,
                input_ref: None,
                resources: d.default_claims(),
                priority: 0,
                max_retries: d.max_retries,
                timeout: effective(d.timeout, default_timeout),
                parent: None,
                instruction: None,
            });
            builder.add_to_group(d.id.clone(), node);
        }
    }
    builder.build()
}
