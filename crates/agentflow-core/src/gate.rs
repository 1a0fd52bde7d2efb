//! Phase gate rules engine.
//!
//! Evaluates a phase's final envelopes and consensus records against a
//! [`GatePredicate`] (a conjunction of [`GateRule`]s) to produce a
//! [`GateVerdict`].

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::consensus::{Classification, ConsensusRecord};
use crate::domain::envelope::{Finding, ResultEnvelope, Severity};

// ---------------------------------------------------------------------------
// Gate input
// ---------------------------------------------------------------------------

/// What a phase produced, as seen by its gate.
#[derive(Debug, Clone, Copy)]
pub struct GateInput<'a> {
    /// One final envelope per node (synthetic ones included).
    pub envelopes: &'a [ResultEnvelope],
    pub consensus: &'a [ConsensusRecord],
    /// Findings synthesized outside any envelope (e.g. conflict detection).
    pub findings: &'a [Finding],
    /// Ids of specialists whose failure fails the gate.
    pub mandatory: &'a BTreeSet<String>,
}

// ---------------------------------------------------------------------------
// Gate rules
// ---------------------------------------------------------------------------

/// A single rule that can fail a phase.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GateRule {
    /// Mean confidence over dispatched envelopes must reach `threshold`.
    MinMeanConfidence { threshold: f64 },
    /// No finding may reach severity `below` or higher.
    MaxSeverity { below: Severity },
    /// Every envelope from a mandatory specialist must be a success.
    MandatorySucceeded,
    /// Every consensus record must classify at `at_least` or better.
    MinClassification { at_least: Classification },
}

/// Conjunction of rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GatePredicate {
    pub rules: Vec<GateRule>,
}

impl GatePredicate {
    /// Always passes.
    pub fn open() -> Self {
        Self::default()
    }

    /// Mandatory specialists succeeded and nothing critical was found.
    pub fn standard() -> Self {
        Self::open()
            .with_rule(GateRule::MandatorySucceeded)
            .with_rule(GateRule::MaxSeverity {
                below: Severity::Critical,
            })
    }

    /// Every consensus group reached `medium`.
    pub fn consensus() -> Self {
        Self::open().with_rule(GateRule::MinClassification {
            at_least: Classification::Medium,
        })
    }

    pub fn with_rule(mut self, rule: GateRule) -> Self {
        self.rules.push(rule);
        self
    }
}

// ---------------------------------------------------------------------------
// Verdict
// ---------------------------------------------------------------------------

/// A single rule violation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Violation {
    pub rule: GateRule,
    pub reason: String,
}

/// The outcome of evaluating a predicate.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GateVerdict {
    pub violations: Vec<Violation>,
}

impl GateVerdict {
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Whether the only failures are consensus classifications.
    pub fn consensus_only(&self) -> bool {
        !self.passed()
            && self
                .violations
                .iter()
                .all(|v| matches!(v.rule, GateRule::MinClassification { .. }))
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub fn evaluate_gate(predicate: &GatePredicate, input: &GateInput<'_>) -> GateVerdict {
    GateVerdict {
        violations: predicate
            .rules
            .iter()
            .filter_map(|rule| check_rule(rule, input))
            .collect(),
    }
}

fn check_rule(rule: &GateRule, input: &GateInput<'_>) -> Option<Violation> {
    let violation = |reason: String| {
        Some(Violation {
            rule: rule.clone(),
            reason,
        })
    };

    match rule {
        GateRule::MinMeanConfidence { threshold } => {
            let dispatched: Vec<f64> = input
                .envelopes
                .iter()
                .filter(|e| !e.synthetic)
                .map(|e| e.confidence)
                .collect();
            if dispatched.is_empty() {
                return None;
            }
            let mean = dispatched.iter().sum::<f64>() / dispatched.len() as f64;
            if mean < *threshold {
                violation(format!("mean confidence {mean:.2} < required {threshold:.2}"))
            } else {
                None
            }
        }
        GateRule::MaxSeverity { below } => {
            let offending: Vec<String> = input
                .envelopes
                .iter()
                .flat_map(|e| e.findings.iter())
                .chain(input.consensus.iter().flat_map(|c| c.findings.iter()))
                .chain(input.findings.iter())
                .filter(|f| f.severity >= *below)
                .map(|f| format!("{}:{}", f.kind, f.reference))
                .collect();
            if offending.is_empty() {
                None
            } else {
                violation(format!(
                    "{} finding(s) at severity {below} or above: [{}]",
                    offending.len(),
                    offending.join(", ")
                ))
            }
        }
        GateRule::MandatorySucceeded => {
            let failed: BTreeSet<&str> = input
                .envelopes
                .iter()
                .filter(|e| !e.success && input.mandatory.contains(&e.specialist_id))
                .map(|e| e.specialist_id.as_str())
                .collect();
            if failed.is_empty() {
                None
            } else {
                violation(format!(
                    "mandatory specialist(s) failed: [{}]",
                    failed.into_iter().collect::<Vec<_>>().join(", ")
                ))
            }
        }
        GateRule::MinClassification { at_least } => {
            let low: Vec<String> = input
                .consensus
                .iter()
                .filter(|c| c.classification < *at_least)
                .map(|c| format!("{} ({}, mean {:.2})", c.role, c.classification, c.mean))
                .collect();
            if low.is_empty() {
                None
            } else {
                violation(format!("consensus below {at_least}: [{}]", low.join(", ")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::consensus::{aggregate, ConsensusPolicy};
    use crate::domain::error::ErrorKind;
    use crate::domain::task::InstanceStatus;
    use crate::graph::test_task;

    fn env(specialist: &str, confidence: f64, success: bool) -> ResultEnvelope {
        let task = test_task(&format!("t-{specialist}"), specialist);
        let mut e = ResultEnvelope::failure(format!("i-{specialist}"), &task, InstanceStatus::Completed, ErrorKind::WorkerFailed, "");
        e.success = success;
        e.confidence = confidence;
        e
    }

    fn input<'a>(
        envelopes: &'a [ResultEnvelope],
        consensus: &'a [ConsensusRecord],
        mandatory: &'a BTreeSet<String>,
    ) -> GateInput<'a> {
        GateInput {
            envelopes,
            consensus,
            findings: &[],
            mandatory,
        }
    }

    #[test]
    fn test_open_gate_passes_everything() {
        let envs = [env("a", 0.0, false)];
        let none = BTreeSet::new();
        assert!(evaluate_gate(&GatePredicate::open(), &input(&envs, &[], &none)).passed());
    }

    #[test]
    fn test_mandatory_failure_fails_standard_gate() {
        let envs = [env("writer", 0.9, true), env("reviewer", 0.0, false)];
        let mandatory: BTreeSet<String> = ["reviewer".to_string()].into();
        let verdict = evaluate_gate(&GatePredicate::standard(), &input(&envs, &[], &mandatory));
        assert!(!verdict.passed());
        assert!(verdict.violations[0].reason.contains("reviewer"));

        let none = BTreeSet::new();
        assert!(evaluate_gate(&GatePredicate::standard(), &input(&envs, &[], &none)).passed());
    }

    #[test]
    fn test_critical_finding_fails_standard_gate() {
        let mut e = env("writer", 0.9, true);
        e.findings.push(Finding::new(Severity::Critical, "secret-leak", ".env"));
        let envs = [e];
        let none = BTreeSet::new();
        let verdict = evaluate_gate(&GatePredicate::standard(), &input(&envs, &[], &none));
        assert_eq!(verdict.violations.len(), 1);
        assert!(verdict.violations[0].reason.contains("secret-leak:.env"));
    }

    #[test]
    fn test_min_mean_confidence_ignores_synthetic() {
        let mut skipped = env("b", 0.0, false);
        skipped.synthetic = true;
        let envs = [env("a", 0.8, true), skipped];
        let none = BTreeSet::new();
        let p = GatePredicate::open().with_rule(GateRule::MinMeanConfidence { threshold: 0.7 });
        assert!(evaluate_gate(&p, &input(&envs, &[], &none)).passed());
    }

    #[test]
    fn test_low_consensus_fails_consensus_gate() {
        let records = [aggregate(
            "auditor",
            &[env("auditor", 0.4, true), env("auditor", 0.4, true)],
            &ConsensusPolicy::default(),
        )];
        let none = BTreeSet::new();
        let verdict = evaluate_gate(&GatePredicate::consensus(), &input(&[], &records, &none));
        assert!(!verdict.passed());
        assert!(verdict.consensus_only());
    }

    #[test]
    fn test_rule_serde_tagged() {
        let json = serde_json::to_string(&GateRule::MaxSeverity { below: Severity::Error }).unwrap();
        assert_eq!(json, r#"{"type":"max_severity","below":"error"}"#);
    }
}
