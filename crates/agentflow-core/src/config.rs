//! Orchestrator configuration.
//!
//! Values come from `AGENTFLOW_*` environment variables with documented
//! defaults. [`OrchestratorConfig::from_lookup`] takes any key lookup so tests
//! never touch the process environment.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::domain::error::{OrchestrationError, Result};

pub const ENV_CONCURRENCY: &str = "AGENTFLOW_CONCURRENCY";
pub const ENV_DEFAULT_TIMEOUT_SECS: &str = "AGENTFLOW_DEFAULT_TIMEOUT_SECS";
pub const ENV_HEARTBEAT_INTERVAL_MS: &str = "AGENTFLOW_HEARTBEAT_INTERVAL_MS";
pub const ENV_DRAIN_TIMEOUT_MS: &str = "AGENTFLOW_DRAIN_TIMEOUT_MS";
pub const ENV_TODO_PATH: &str = "AGENTFLOW_TODO_PATH";
pub const ENV_ACQUIRE_TIMEOUT_MS: &str = "AGENTFLOW_ACQUIRE_TIMEOUT_MS";
pub const ENV_TODO_LEASE_SECS: &str = "AGENTFLOW_TODO_LEASE_SECS";
pub const ENV_AUDITOR_INSTANCES: &str = "AGENTFLOW_AUDITOR_INSTANCES";

/// Runtime knobs shared by the executor, arbiter and phase controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrchestratorConfig {
    /// Executor worker slots.
    pub concurrency: usize,
    /// Timeout for specialists whose descriptor declares `0s`.
    pub default_timeout: Duration,
    /// Expected heartbeat cadence; two missed beats time an instance out.
    pub heartbeat_interval: Duration,
    /// How long cancelled instances get to release cleanly.
    pub drain_timeout: Duration,
    pub todo_path: PathBuf,
    /// Deadline for one all-or-nothing lock acquisition.
    pub acquire_timeout: Duration,
    /// Lease after which an orphaned in-progress todo returns to pending.
    pub todo_lease: Duration,
    /// Independent instances per auditor/validator role.
    pub auditor_instances: usize,
    /// Base delay for local retries; doubles per attempt.
    pub retry_backoff: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            concurrency: 10,
            default_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_millis(10_000),
            drain_timeout: Duration::from_millis(5_000),
            todo_path: PathBuf::from(".agentflow/todos"),
            acquire_timeout: Duration::from_millis(30_000),
            todo_lease: Duration::from_secs(600),
            auditor_instances: 2,
            retry_backoff: Duration::from_millis(100),
        }
    }
}

impl OrchestratorConfig {
    /// Read configuration from the process environment.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Read configuration through `lookup`; missing keys keep their defaults.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut cfg = Self::default();

        if let Some(n) = parse_var::<usize, _>(&lookup, ENV_CONCURRENCY)? {
            cfg.concurrency = n;
        }
        if let Some(s) = parse_var::<u64, _>(&lookup, ENV_DEFAULT_TIMEOUT_SECS)? {
            cfg.default_timeout = Duration::from_secs(s);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_HEARTBEAT_INTERVAL_MS)? {
            cfg.heartbeat_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_DRAIN_TIMEOUT_MS)? {
            cfg.drain_timeout = Duration::from_millis(ms);
        }
        if let Some(path) = lookup(ENV_TODO_PATH).filter(|p| !p.trim().is_empty()) {
            cfg.todo_path = PathBuf::from(path);
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, ENV_ACQUIRE_TIMEOUT_MS)? {
            cfg.acquire_timeout = Duration::from_millis(ms);
        }
        if let Some(s) = parse_var::<u64, _>(&lookup, ENV_TODO_LEASE_SECS)? {
            cfg.todo_lease = Duration::from_secs(s);
        }
        if let Some(n) = parse_var::<usize, _>(&lookup, ENV_AUDITOR_INSTANCES)? {
            cfg.auditor_instances = n;
        }

        cfg.validate()?;
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<()> {
        if self.concurrency == 0 {
            return Err(OrchestrationError::Config(format!("{ENV_CONCURRENCY} must be at least 1")));
        }
        if self.heartbeat_interval.is_zero() {
            return Err(OrchestrationError::Config(format!(
                "{ENV_HEARTBEAT_INTERVAL_MS} must be greater than 0"
            )));
        }
        if self.auditor_instances == 0 {
            return Err(OrchestrationError::Config(format!(
                "{ENV_AUDITOR_INSTANCES} must be at least 1"
            )));
        }
        Ok(())
    }

    /// Effective timeout for a descriptor-declared value.
    pub fn effective_timeout(&self, declared: Duration) -> Duration {
        if declared.is_zero() {
            self.default_timeout
        } else {
            declared
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|e| OrchestrationError::Config(format!("{key}={raw:?}: {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |k: &str| map.get(k).cloned()
    }

    #[test]
    fn test_defaults_when_unset() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(cfg, OrchestratorConfig::default());
        assert_eq!(cfg.concurrency, 10);
        assert_eq!(cfg.heartbeat_interval, Duration::from_secs(10));
        assert_eq!(cfg.todo_path, PathBuf::from(".agentflow/todos"));
    }

    #[test]
    fn test_overrides_are_applied() {
        let cfg = OrchestratorConfig::from_lookup(lookup(&[
            (ENV_CONCURRENCY, "3"),
            (ENV_DEFAULT_TIMEOUT_SECS, "45"),
            (ENV_HEARTBEAT_INTERVAL_MS, "250"),
            (ENV_DRAIN_TIMEOUT_MS, "1000"),
            (ENV_TODO_PATH, "/var/lib/agentflow"),
            (ENV_AUDITOR_INSTANCES, "3"),
        ]))
        .unwrap();
        assert_eq!(cfg.concurrency, 3);
        assert_eq!(cfg.default_timeout, Duration::from_secs(45));
        assert_eq!(cfg.heartbeat_interval, Duration::from_millis(250));
        assert_eq!(cfg.drain_timeout, Duration::from_secs(1));
        assert_eq!(cfg.todo_path, PathBuf::from("/var/lib/agentflow"));
        assert_eq!(cfg.auditor_instances, 3);
    }

    #[test]
    fn test_malformed_value_names_the_variable() {
        let err = OrchestratorConfig::from_lookup(lookup(&[(ENV_CONCURRENCY, "many")])).unwrap_err();
        assert!(err.to_string().contains(ENV_CONCURRENCY), "got {err}");
    }

    #[test]
    fn test_zero_concurrency_rejected() {
        assert!(OrchestratorConfig::from_lookup(lookup(&[(ENV_CONCURRENCY, "0")])).is_err());
    }

    #[test]
    fn test_effective_timeout() {
        let cfg = OrchestratorConfig::default();
        assert_eq!(cfg.effective_timeout(Duration::ZERO), cfg.default_timeout);
        assert_eq!(cfg.effective_timeout(Duration::from_secs(5)), Duration::from_secs(5));
    }
}
