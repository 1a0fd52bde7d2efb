//! Domain types shared by every agentflow component.

pub mod descriptor;
pub mod digest;
pub mod envelope;
pub mod error;
pub mod request;
pub mod task;

pub use descriptor::{
    is_reserved_domain, Capability, SpecialistDescriptor, DOMAIN_AUDIT, DOMAIN_PLANNING,
    DOMAIN_RESEARCH, DOMAIN_VALIDATION, DOMAIN_VERSION_CONTROL, RESERVED_DOMAINS,
};
pub use digest::{canonical_json, compute_digest, digest_of};
pub use envelope::{Evidence, Finding, ResultEnvelope, Severity};
pub use error::{ErrorKind, OrchestrationError, Result};
pub use request::{EdgePolicy, RunRequest, TaskSpec};
pub use task::{merge_claims, InstanceStatus, LockMode, ResourceClaim, Task, TaskInstance};
