//! Evidence and consensus aggregation.
//!
//! A consensus group is the set of instances run for one audit or validation
//! role. Its record depends only on the multiset of member envelopes: members
//! are sorted by instance id before anything is enumerated.

use std::collections::{BTreeMap, HashSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::domain::envelope::{Finding, ResultEnvelope, Severity};
use crate::obs;

/// Agreement level of a consensus group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    Low,
    Medium,
    High,
}

impl fmt::Display for Classification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Classification::Low => f.write_str("low"),
            Classification::Medium => f.write_str("medium"),
            Classification::High => f.write_str("high"),
        }
    }
}

/// Classification thresholds.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ConsensusPolicy {
    /// Fewer successful members than this forces `low`.
    pub min_successes: usize,
    pub high_mean: f64,
    pub high_stddev: f64,
    pub medium_mean: f64,
    pub medium_stddev: f64,
}

impl Default for ConsensusPolicy {
    fn default() -> Self {
        Self {
            min_successes: 2,
            high_mean: 0.85,
            high_stddev: 0.1,
            medium_mean: 0.6,
            medium_stddev: 0.2,
        }
    }
}

impl ConsensusPolicy {
    pub fn with_min_successes(mut self, n: usize) -> Self {
        self.min_successes = n;
        self
    }

    pub fn classify(&self, mean: f64, stddev: f64, successes: usize) -> Classification {
        if successes < self.min_successes {
            Classification::Low
        } else if mean >= self.high_mean && stddev <= self.high_stddev {
            Classification::High
        } else if mean >= self.medium_mean && stddev <= self.medium_stddev {
            Classification::Medium
        } else {
            Classification::Low
        }
    }
}

/// One member's contribution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemberScore {
    pub instance_id: String,
    pub confidence: f64,
    pub success: bool,
}

/// Aggregated outcome of a consensus group.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsensusRecord {
    pub role: String,
    pub members: Vec<MemberScore>,
    pub mean: f64,
    pub stddev: f64,
    pub successes: usize,
    pub classification: Classification,
    /// Union of member findings, deduplicated by (kind, reference, content hash).
    pub findings: Vec<Finding>,
}

impl ConsensusRecord {
    pub fn instance_ids(&self) -> Vec<&str> {
        self.members.iter().map(|m| m.instance_id.as_str()).collect()
    }

    pub fn max_severity(&self) -> Option<Severity> {
        self.findings.iter().map(|f| f.severity).max()
    }
}

/// Aggregate the final envelopes of one group.
pub fn aggregate(role: &str, envelopes: &[ResultEnvelope], policy: &ConsensusPolicy) -> ConsensusRecord {
    let mut members: Vec<&ResultEnvelope> = envelopes.iter().collect();
    members.sort_by(|a, b| {
        a.instance_id
            .cmp(&b.instance_id)
            .then_with(|| a.confidence.total_cmp(&b.confidence))
    });

    let n = members.len();
    let (mean, stddev) = if n == 0 {
        (0.0, 0.0)
    } else {
        let mean = members.iter().map(|e| e.confidence).sum::<f64>() / n as f64;
        let var = members
            .iter()
            .map(|e| (e.confidence - mean).powi(2))
            .sum::<f64>()
            / n as f64;
        (mean, var.sqrt())
    };
    let successes = members.iter().filter(|e| e.success).count();
    let classification = policy.classify(mean, stddev, successes);

    let mut seen = HashSet::new();
    let mut findings = Vec::new();
    for env in &members {
        for f in &env.findings {
            let key = (f.kind.clone(), f.reference.clone(), f.content_hash.clone());
            if seen.insert(key) {
                let mut f = f.clone();
                if f.origin.is_empty() {
                    f.origin = env.specialist_id.clone();
                }
                findings.push(f);
            }
        }
    }

    let record = ConsensusRecord {
        role: role.to_string(),
        members: members
            .iter()
            .map(|e| MemberScore {
                instance_id: e.instance_id.clone(),
                confidence: e.confidence,
                success: e.success,
            })
            .collect(),
        mean,
        stddev,
        successes,
        classification,
        findings,
    };
    obs::emit_consensus_recorded(role, mean, stddev, &classification.to_string(), n);
    record
}

/// Findings for evidence two specialists disagree on.
///
/// Two successful envelopes from different specialists citing the same
/// reference with different content hashes yield one `error` finding per
/// reference.
pub fn detect_conflicts(envelopes: &[ResultEnvelope]) -> Vec<Finding> {
    let mut cited: BTreeMap<&str, BTreeMap<&str, &str>> = BTreeMap::new();
    let mut sorted: Vec<&ResultEnvelope> = envelopes.iter().filter(|e| e.success).collect();
    sorted.sort_by(|a, b| (&a.specialist_id, &a.task_id).cmp(&(&b.specialist_id, &b.task_id)));

    for env in sorted {
        for ev in &env.evidence {
            cited
                .entry(ev.reference.as_str())
                .or_default()
                .entry(env.specialist_id.as_str())
                .or_insert(ev.content_hash.as_str());
        }
    }

    cited
        .into_iter()
        .filter_map(|(reference, by_specialist)| {
            let hashes: HashSet<&str> = by_specialist.values().copied().collect();
            if by_specialist.len() < 2 || hashes.len() < 2 {
                return None;
            }
            let who: Vec<String> = by_specialist
                .iter()
                .map(|(s, h)| format!("{s}@{}", short_hash(h)))
                .collect();
            Some(
                Finding::new(Severity::Error, "conflicting-evidence", reference)
                    .with_message(format!("specialists disagree on {reference}: {}", who.join(", ")))
                    .with_origin("aggregator"),
            )
        })
        .collect()
}

/// First twelve characters of a worker-supplied hash, for messages.
fn short_hash(hash: &str) -> String {
    hash.chars().take(12).collect()
}
