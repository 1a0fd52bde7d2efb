//! Planned tasks, their runtime instances, and declared resource claims.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lock mode requested for a named resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LockMode {
    Shared,
    Exclusive,
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => f.write_str("shared"),
            LockMode::Exclusive => f.write_str("exclusive"),
        }
    }
}

/// A named resource plus the mode it is needed in.
///
/// Written as `fs:/repo/src` (shared) or `fs:/out/report:exclusive`. Resource
/// names are opaque and may themselves contain colons; only a trailing
/// `:shared` / `:exclusive` is interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ResourceClaim {
    pub resource: String,
    pub mode: LockMode,
}

impl ResourceClaim {
    pub fn shared(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            mode: LockMode::Shared,
        }
    }

    pub fn exclusive(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            mode: LockMode::Exclusive,
        }
    }

    /// Whether two claims cannot be held at the same time by different holders.
    pub fn conflicts_with(&self, other: &ResourceClaim) -> bool {
        self.resource == other.resource
            && (self.mode == LockMode::Exclusive || other.mode == LockMode::Exclusive)
    }
}

impl fmt::Display for ResourceClaim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.mode {
            LockMode::Shared => f.write_str(&self.resource),
            LockMode::Exclusive => write!(f, "{}:exclusive", self.resource),
        }
    }
}

impl FromStr for ResourceClaim {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let s = s.trim();
        let (resource, mode) = if let Some(r) = s.strip_suffix(":exclusive") {
            (r, LockMode::Exclusive)
        } else if let Some(r) = s.strip_suffix(":shared") {
            (r, LockMode::Shared)
        } else {
            (s, LockMode::Shared)
        };
        if resource.is_empty() {
            return Err(format!("empty resource name in claim {s:?}"));
        }
        Ok(Self {
            resource: resource.to_string(),
            mode,
        })
    }
}

impl TryFrom<String> for ResourceClaim {
    type Error = String;

    fn try_from(value: String) -> std::result::Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ResourceClaim> for String {
    fn from(value: ResourceClaim) -> Self {
        value.to_string()
    }
}

/// Merge `overrides` into `base`: a claim on an already-declared resource
/// replaces the declared mode.
pub fn merge_claims(base: &[ResourceClaim], overrides: &[ResourceClaim]) -> Vec<ResourceClaim> {
    let mut merged: Vec<ResourceClaim> = base.to_vec();
    for claim in overrides {
        match merged.iter_mut().find(|c| c.resource == claim.resource) {
            Some(existing) => existing.mode = claim.mode,
            None => merged.push(claim.clone()),
        }
    }
    merged.sort();
    merged.dedup();
    merged
}

/// A planned specialist invocation (node payload in the task graph).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub specialist_id: String,
    pub phase: u8,
    /// Reference to the request-level input context this task starts from.
    pub input_ref: Option<String>,
    pub resources: Vec<ResourceClaim>,
    pub priority: u32,
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
    /// Original task when this one was derived from it (retry or alternate).
    pub parent: Option<String>,
    /// Free-text instruction supplied by the planner.
    pub instruction: Option<String>,
}

/// Runtime status of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Cancelled,
    TimedOut,
}

impl InstanceStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            InstanceStatus::Completed
                | InstanceStatus::Failed
                | InstanceStatus::Cancelled
                | InstanceStatus::TimedOut
        )
    }
}

impl fmt::Display for InstanceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            InstanceStatus::Pending => "pending",
            InstanceStatus::Running => "running",
            InstanceStatus::Completed => "completed",
            InstanceStatus::Failed => "failed",
            InstanceStatus::Cancelled => "cancelled",
            InstanceStatus::TimedOut => "timed_out",
        };
        f.write_str(s)
    }
}

/// Runtime materialization of a [`Task`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub instance_id: String,
    pub task_id: String,
    pub specialist_id: String,
    /// 0 for the first attempt.
    pub attempt: u32,
    pub started_at: Option<DateTime<Utc>>,
    pub heartbeat_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub status: InstanceStatus,
    /// Artifact digest of the emitted envelope.
    pub result_ref: Option<String>,
    pub held_resources: Vec<ResourceClaim>,
}

impl TaskInstance {
    pub fn new(task: &Task, attempt: u32) -> Self {
        Self {
            instance_id: format!("inst-{}", uuid::Uuid::new_v4()),
            task_id: task.id.clone(),
            specialist_id: task.specialist_id.clone(),
            attempt,
            started_at: None,
            heartbeat_at: None,
            finished_at: None,
            status: InstanceStatus::Pending,
            result_ref: None,
            held_resources: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_parses_trailing_mode_only() {
        let c: ResourceClaim = "fs:/out/report:exclusive".parse().unwrap();
        assert_eq!(c, ResourceClaim::exclusive("fs:/out/report"));

        let c: ResourceClaim = "svc:postgres".parse().unwrap();
        assert_eq!(c, ResourceClaim::shared("svc:postgres"));

        assert!(":exclusive".parse::<ResourceClaim>().is_err());
    }

    #[test]
    fn test_claim_serde_uses_string_form() {
        let c = ResourceClaim::exclusive("fs:/tmp/x");
        let json = serde_json::to_string(&c).unwrap();
        assert_eq!(json, r#""fs:/tmp/x:exclusive""#);
        let back: ResourceClaim = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }

    #[test]
    fn test_conflicts() {
        let a = ResourceClaim::shared("r");
        let b = ResourceClaim::shared("r");
        let x = ResourceClaim::exclusive("r");
        assert!(!a.conflicts_with(&b));
        assert!(a.conflicts_with(&x));
        assert!(x.conflicts_with(&x));
        assert!(!x.conflicts_with(&ResourceClaim::exclusive("other")));
    }

    #[test]
    fn test_merge_claims_overrides_mode() {
        let base = vec![ResourceClaim::shared("fs:/src"), ResourceClaim::shared("svc:db")];
        let over = vec![ResourceClaim::exclusive("fs:/src"), ResourceClaim::shared("fs:/out")];
        let merged = merge_claims(&base, &over);
        assert!(merged.contains(&ResourceClaim::exclusive("fs:/src")));
        assert!(merged.contains(&ResourceClaim::shared("svc:db")));
        assert!(merged.contains(&ResourceClaim::shared("fs:/out")));
        assert_eq!(merged.len(), 3);
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(!InstanceStatus::Running.is_terminal());
        assert!(InstanceStatus::TimedOut.is_terminal());
        assert!(InstanceStatus::Cancelled.is_terminal());
    }
}
