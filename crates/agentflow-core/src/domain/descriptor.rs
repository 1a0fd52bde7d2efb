//! Specialist descriptors: the registry's unit of truth.

use std::collections::BTreeSet;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::digest::digest_of;
use crate::domain::error::Result;
use crate::domain::task::ResourceClaim;

/// Domain of research specialists (phase 1).
pub const DOMAIN_RESEARCH: &str = "research";
/// Domain of planning specialists (phase 2).
pub const DOMAIN_PLANNING: &str = "planning";
/// Domain of validator specialists (phase 6).
pub const DOMAIN_VALIDATION: &str = "validation";
/// Domain of auditors (phase 9).
pub const DOMAIN_AUDIT: &str = "audit";
/// Domain of the atomic-commit specialist (phase 8).
pub const DOMAIN_VERSION_CONTROL: &str = "version-control";

/// Domains driven by a dedicated phase rather than the phase-4 plan.
pub const RESERVED_DOMAINS: [&str; 5] = [
    DOMAIN_RESEARCH,
    DOMAIN_PLANNING,
    DOMAIN_VALIDATION,
    DOMAIN_AUDIT,
    DOMAIN_VERSION_CONTROL,
];

pub fn is_reserved_domain(domain: &str) -> bool {
    RESERVED_DOMAINS.contains(&domain)
}

/// Capability a specialist requires from its host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Capability {
    MayReadFiles,
    MayWriteFiles,
    MayQueryNet,
    MayExec,
}

impl std::str::FromStr for Capability {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "may-read-files" => Ok(Capability::MayReadFiles),
            "may-write-files" => Ok(Capability::MayWriteFiles),
            "may-query-net" => Ok(Capability::MayQueryNet),
            "may-exec" => Ok(Capability::MayExec),
            other => Err(format!("unknown capability: {other}")),
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Capability::MayReadFiles => "may-read-files",
            Capability::MayWriteFiles => "may-write-files",
            Capability::MayQueryNet => "may-query-net",
            Capability::MayExec => "may-exec",
        };
        f.write_str(s)
    }
}

/// A declared specialist. Immutable once loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpecialistDescriptor {
    pub id: String,
    pub domain: String,
    pub inputs: Vec<String>,
    pub outputs: Vec<String>,
    pub token_budget: u32,
    /// Zero means "use the orchestrator default".
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    pub parallel_safe: bool,
    pub forbidden_callees: BTreeSet<String>,
    pub required_capabilities: BTreeSet<Capability>,
    /// A failure of this specialist fails its phase gate.
    pub mandatory: bool,
    /// Default resource set for tasks running this specialist.
    pub resources: Vec<ResourceClaim>,
    /// Independent instances per consensus group (validators and auditors).
    pub instances: Option<usize>,
    pub max_retries: u32,
    /// External worker argv, if the specialist runs as a subprocess.
    pub command: Vec<String>,
    /// Free-form document body; informational only.
    pub body: String,
}

impl SpecialistDescriptor {
    /// Minimal descriptor with defaults for every optional field.
    pub fn new(id: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            domain: domain.into(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            token_budget: 4_000,
            timeout: Duration::from_secs(300),
            parallel_safe: true,
            forbidden_callees: BTreeSet::new(),
            required_capabilities: BTreeSet::new(),
            mandatory: false,
            resources: Vec::new(),
            instances: None,
            max_retries: 0,
            command: Vec::new(),
            body: String::new(),
        }
    }

    pub fn with_forbidden_callees<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.forbidden_callees = ids.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_resources(mut self, resources: Vec<ResourceClaim>) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_token_budget(mut self, budget: u32) -> Self {
        self.token_budget = budget;
        self
    }

    pub fn with_instances(mut self, n: usize) -> Self {
        self.instances = Some(n);
        self
    }

    pub fn with_max_retries(mut self, n: u32) -> Self {
        self.max_retries = n;
        self
    }

    pub fn mandatory(mut self) -> Self {
        self.mandatory = true;
        self
    }

    pub fn forbids(&self, callee: &str) -> bool {
        self.forbidden_callees.contains(callee)
    }

    pub fn has_capability(&self, cap: Capability) -> bool {
        self.required_capabilities.contains(&cap)
    }

    pub fn sequential(mut self) -> Self {
        self.parallel_safe = false;
        self
    }

    pub fn with_capabilities(mut self, caps: impl IntoIterator<Item = Capability>) -> Self {
        self.required_capabilities = caps.into_iter().collect();
        self
    }

    /// Claims every task of this specialist starts from: the declared
    /// resources, plus an exclusive `agent:<id>` lock when instances may not
    /// overlap.
    pub fn default_claims(&self) -> Vec<ResourceClaim> {
        let mut claims = self.resources.clone();
        if !self.parallel_safe {
            claims.push(ResourceClaim::exclusive(format!("agent:{}", self.id)));
        }
        claims
    }

    /// Content hash over the canonical JSON form.
    ///
    /// Structurally identical descriptors hash identically regardless of the
    /// order their header keys were written in.
    pub fn content_hash(&self) -> Result<String> {
        digest_of(self)
    }
}
