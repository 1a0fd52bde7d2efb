//! Agent registry: the source of truth for declared specialists.
//!
//! The registry holds an immutable [`RegistrySnapshot`] behind a lock.
//! [`AgentRegistry::load`] builds a complete new snapshot and swaps it in;
//! readers holding an older `Arc<RegistrySnapshot>` (in-flight runs) keep the
//! descriptors they started with.

pub mod parser;
pub mod source;

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::domain::descriptor::SpecialistDescriptor;
use crate::domain::error::{OrchestrationError, Result};
use crate::graph::TaskGraph;

pub use parser::parse_descriptor;
pub use source::{DescriptorDocument, DescriptorSource, DirectorySource, InlineSource};

/// Frozen set of descriptors.
#[derive(Debug, Default)]
pub struct RegistrySnapshot {
    descriptors: BTreeMap<String, Arc<SpecialistDescriptor>>,
    generation: u64,
}

impl RegistrySnapshot {
    /// Build a snapshot, rejecting duplicate ids.
    pub fn from_descriptors(
        descriptors: impl IntoIterator<Item = SpecialistDescriptor>,
        generation: u64,
    ) -> Result<Self> {
        let mut map = BTreeMap::new();
        for d in descriptors {
            let id = d.id.clone();
            if map.insert(id.clone(), Arc::new(d)).is_some() {
                return Err(OrchestrationError::invalid_descriptor(
                    id.clone(),
                    format!("duplicate specialist id {id}"),
                ));
            }
        }
        for d in map.values() {
            for callee in &d.forbidden_callees {
                if !map.contains_key(callee) {
                    warn!(specialist = %d.id, callee = %callee, "forbidden callee is not a registered specialist");
                }
            }
        }
        Ok(Self {
            descriptors: map,
            generation,
        })
    }

    /// Descriptor for `id`, or `UNKNOWN_AGENT`.
    pub fn lookup(&self, id: &str) -> Result<Arc<SpecialistDescriptor>> {
        self.descriptors
            .get(id)
            .cloned()
            .ok_or_else(|| OrchestrationError::UnknownAgent(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.descriptors.contains_key(id)
    }

    /// Descriptors matching `predicate`, ordered by id.
    pub fn list<P>(&self, predicate: P) -> Vec<Arc<SpecialistDescriptor>>
    where
        P: Fn(&SpecialistDescriptor) -> bool,
    {
        self.descriptors
            .values()
            .filter(|d| predicate(d))
            .cloned()
            .collect()
    }

    pub fn in_domain(&self, domain: &str) -> Vec<Arc<SpecialistDescriptor>> {
        self.list(|d| d.domain == domain)
    }

    pub fn len(&self) -> usize {
        self.descriptors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.descriptors.is_empty()
    }

    /// Incremented on every successful load.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Check that every node names a known specialist and that no node's
    /// descendants include one of its forbidden callees.
    pub fn validate_graph(&self, graph: &TaskGraph) -> Result<()> {
        for (_, task) in graph.nodes() {
            self.lookup(&task.specialist_id)?;
        }
        for (id, task) in graph.nodes() {
            let caller = self.lookup(&task.specialist_id)?;
            if caller.forbidden_callees.is_empty() {
                continue;
            }
            for child in graph.descendants(id) {
                let callee = &graph.node(child).specialist_id;
                if caller.forbids(callee) {
                    return Err(OrchestrationError::ForbiddenCallee {
                        caller: caller.id.clone(),
                        callee: callee.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Thread-safe registry handle with copy-on-write reloads.
#[derive(Debug, Default)]
pub struct AgentRegistry {
    current: RwLock<Arc<RegistrySnapshot>>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_source(source: &dyn DescriptorSource) -> Result<Self> {
        let registry = Self::new();
        registry.load(source)?;
        Ok(registry)
    }

    pub fn from_descriptors(descriptors: impl IntoIterator<Item = SpecialistDescriptor>) -> Result<Self> {
        let registry = Self::new();
        registry.replace(descriptors)?;
        Ok(registry)
    }

    /// Parse every document from `source` and swap the registry atomically.
    ///
    /// On any error the previous registry stays in place. Returns the number
    /// of descriptors loaded.
    pub fn load(&self, source: &dyn DescriptorSource) -> Result<usize> {
        let docs = source.documents()?;
        let descriptors = docs
            .iter()
            .map(|doc| parse_descriptor(&doc.origin, &doc.text))
            .collect::<Result<Vec<_>>>()?;
        let count = self.replace(descriptors)?;
        info!(source = %source.name(), descriptors = count, "registry loaded");
        Ok(count)
    }

    /// Swap in a new descriptor set.
    pub fn replace(&self, descriptors: impl IntoIterator<Item = SpecialistDescriptor>) -> Result<usize> {
        let mut current = self.current.write();
        let snapshot = RegistrySnapshot::from_descriptors(descriptors, current.generation + 1)?;
        let count = snapshot.len();
        *current = Arc::new(snapshot);
        Ok(count)
    }

    /// The current frozen snapshot.
    pub fn snapshot(&self) -> Arc<RegistrySnapshot> {
        self.current.read().clone()
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<SpecialistDescriptor>> {
        self.snapshot().lookup(id)
    }

    pub fn list<P>(&self, predicate: P) -> Vec<Arc<SpecialistDescriptor>>
    where
        P: Fn(&SpecialistDescriptor) -> bool,
    {
        self.snapshot().list(predicate)
    }

    pub fn validate_graph(&self, graph: &TaskGraph) -> Result<()> {
        self.snapshot().validate_graph(graph)
    }
}
