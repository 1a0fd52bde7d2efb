//! Task graph: an immutable DAG of specialist invocations.
//!
//! Nodes live in an arena and are addressed by [`NodeId`] indices; edges are
//! `(from, to)` index pairs meaning "`to` consumes the output of `from`".
//! Graphs are produced by [`GraphBuilder::build`], which rejects cycles, and
//! are never mutated afterwards. Retries and alternates are derived tasks that
//! reference the original as `parent`; they do not change the graph.

pub mod planner;

use std::collections::{BTreeMap, BTreeSet, HashSet, VecDeque};

use serde::{Deserialize, Serialize};

use crate::domain::error::{OrchestrationError, Result};
use crate::domain::request::EdgePolicy;
use crate::domain::task::Task;

pub use planner::{plan_fanout, DefaultPlanner, PlanInput, Planner};

/// Index of a node in its graph's arena.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId(pub usize);

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Dependency edge: `to` starts only after `from` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Edge {
    pub from: NodeId,
    pub to: NodeId,
    pub policy: EdgePolicy,
}

/// Immutable plan handed to the executor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskGraph {
    nodes: Vec<Task>,
    edges: Vec<Edge>,
    /// Audit role -> nodes whose envelopes are aggregated together.
    consensus_groups: BTreeMap<String, BTreeSet<NodeId>>,
    /// Specialist to fall back on when a node fails under `try-alternate`.
    alternates: BTreeMap<NodeId, String>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn node(&self, id: NodeId) -> &Task {
        &self.nodes[id.0]
    }

    pub fn get(&self, id: NodeId) -> Option<&Task> {
        self.nodes.get(id.0)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = NodeId> {
        (0..self.nodes.len()).map(NodeId)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (NodeId, &Task)> {
        self.nodes.iter().enumerate().map(|(i, t)| (NodeId(i), t))
    }

    pub fn find(&self, task_id: &str) -> Option<NodeId> {
        self.nodes.iter().position(|t| t.id == task_id).map(NodeId)
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn incoming(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.to == id)
    }

    pub fn outgoing(&self, id: NodeId) -> impl Iterator<Item = &Edge> {
        self.edges.iter().filter(move |e| e.from == id)
    }

    pub fn predecessors(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.incoming(id).map(|e| e.from).collect()
    }

    pub fn successors(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.outgoing(id).map(|e| e.to).collect()
    }

    /// Every node reachable from `id` (excluding `id`).
    pub fn descendants(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.reach(id, |g, n| g.successors(n))
    }

    /// Every node `id` transitively depends on (excluding `id`).
    pub fn ancestors(&self, id: NodeId) -> BTreeSet<NodeId> {
        self.reach(id, |g, n| g.predecessors(n))
    }

    fn reach<F>(&self, start: NodeId, next: F) -> BTreeSet<NodeId>
    where
        F: Fn(&Self, NodeId) -> BTreeSet<NodeId>,
    {
        let mut seen = BTreeSet::new();
        let mut queue: VecDeque<NodeId> = next(self, start).into_iter().collect();
        while let Some(n) = queue.pop_front() {
            if seen.insert(n) {
                queue.extend(next(self, n));
            }
        }
        seen
    }

    pub fn consensus_groups(&self) -> &BTreeMap<String, BTreeSet<NodeId>> {
        &self.consensus_groups
    }

    pub fn alternate(&self, id: NodeId) -> Option<&str> {
        self.alternates.get(&id).map(String::as_str)
    }

    /// Nodes in dependency order (Kahn). Ties resolve by ascending [`NodeId`].
    pub fn topological_order(&self) -> Result<Vec<NodeId>> {
        let mut in_degree = vec![0usize; self.nodes.len()];
        for e in &self.edges {
            in_degree[e.to.0] += 1;
        }

        let mut ready: BTreeSet<NodeId> = self
            .node_ids()
            .filter(|n| in_degree[n.0] == 0)
            .collect();
        let mut sorted = Vec::with_capacity(self.nodes.len());

        while let Some(n) = ready.pop_first() {
            sorted.push(n);
            for e in self.outgoing(n) {
                in_degree[e.to.0] -= 1;
                if in_degree[e.to.0] == 0 {
                    ready.insert(e.to);
                }
            }
        }

        if sorted.len() != self.nodes.len() {
            let stuck: Vec<String> = self
                .node_ids()
                .filter(|n| in_degree[n.0] > 0)
                .map(|n| self.node(n).id.clone())
                .collect();
            return Err(OrchestrationError::InvalidPlan(format!(
                "dependency cycle among tasks: {}",
                stuck.join(", ")
            )));
        }
        Ok(sorted)
    }

    /// Id-independent structural signature: the sorted multiset of node
    /// specialists and of `(from specialist, to specialist, policy)` edges.
    ///
    /// Two plans with equal signatures are isomorphic up to task ids.
    pub fn structure_signature(&self) -> (Vec<String>, Vec<(String, String, EdgePolicy)>) {
        let mut nodes: Vec<String> = self.nodes.iter().map(|t| t.specialist_id.clone()).collect();
        nodes.sort();
        let mut edges: Vec<(String, String, EdgePolicy)> = self
            .edges
            .iter()
            .map(|e| {
                (
                    self.node(e.from).specialist_id.clone(),
                    self.node(e.to).specialist_id.clone(),
                    e.policy,
                )
            })
            .collect();
        edges.sort_by(|a, b| (&a.0, &a.1).cmp(&(&b.0, &b.1)));
        (nodes, edges)
    }
}

/// Mutable staging area for a [`TaskGraph`].
#[derive(Debug, Default)]
pub struct GraphBuilder {
    graph: TaskGraph,
}

impl GraphBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, task: Task) -> NodeId {
        self.graph.nodes.push(task);
        NodeId(self.graph.nodes.len() - 1)
    }

    pub fn add_edge(&mut self, from: NodeId, to: NodeId, policy: EdgePolicy) -> &mut Self {
        self.graph.edges.push(Edge { from, to, policy });
        self
    }

    pub fn add_to_group(&mut self, role: impl Into<String>, node: NodeId) -> &mut Self {
        self.graph
            .consensus_groups
            .entry(role.into())
            .or_default()
            .insert(node);
        self
    }

    pub fn set_alternate(&mut self, node: NodeId, specialist: impl Into<String>) -> &mut Self {
        self.graph.alternates.insert(node, specialist.into());
        self
    }

    /// Validate and freeze.
    pub fn build(self) -> Result<TaskGraph> {
        let graph = self.graph;
        let n = graph.nodes.len();

        let mut ids = HashSet::new();
        for t in &graph.nodes {
            if !ids.insert(t.id.as_str()) {
                return Err(OrchestrationError::InvalidPlan(format!("duplicate task id {}", t.id)));
            }
        }

        let mut seen_edges = HashSet::new();
        for e in &graph.edges {
            if e.from.0 >= n || e.to.0 >= n {
                return Err(OrchestrationError::InvalidPlan(format!(
                    "edge {} -> {} references a missing node",
                    e.from, e.to
                )));
            }
            if e.from == e.to {
                return Err(OrchestrationError::InvalidPlan(format!(
                    "task {} depends on itself",
                    graph.node(e.from).id
                )));
            }
            if !seen_edges.insert((e.from, e.to)) {
                return Err(OrchestrationError::InvalidPlan(format!(
                    "duplicate edge {} -> {}",
                    graph.node(e.from).id,
                    graph.node(e.to).id
                )));
            }
        }

        for members in graph.consensus_groups.values() {
            if let Some(bad) = members.iter().find(|m| m.0 >= n) {
                return Err(OrchestrationError::InvalidPlan(format!(
                    "consensus group references missing node {bad}"
                )));
            }
        }

        graph.topological_order()?;
        Ok(graph)
    }
}

#[cfg(test)]
pub(crate) fn test_task(id: &str, specialist: &str) -> Task {
    Task {
        id: id.to_string(),
        specialist_id: specialist.to_string(),
        phase: 4,
        input_ref: None,
        resources: Vec::new(),
        priority: 0,
        max_retries: 0,
        timeout: std::time::Duration::from_secs(5),
        parent: None,
        instruction: None,
    }
}
