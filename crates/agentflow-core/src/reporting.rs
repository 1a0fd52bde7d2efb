use anyhow::{Context, Result};
use agentflow_todo::TodoId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::consensus::ConsensusRecord;
use crate::domain::envelope::Finding;
use crate::domain::error::ErrorKind;
use crate::domain::task::InstanceStatus;
use crate::executor::InstanceRecord;
use crate::phase::{PhaseRecord, PhaseStatus, RunStatus};

pub const REPORT_SCHEMA_VERSION: &str = "1.0";

/// One dispatched instance as it appears in the run report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InstanceSummary {
    pub instance_id: String,
    pub task_id: String,
    pub specialist_id: String,
    pub attempt: u32,
    pub status: InstanceStatus,
    pub success: bool,
    pub confidence: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result_ref: Option<String>,
}

impl From<&InstanceRecord> for InstanceSummary {
    fn from(r: &InstanceRecord) -> Self {
        Self {
            instance_id: r.instance.instance_id.clone(),
            task_id: r.instance.task_id.clone(),
            specialist_id: r.instance.specialist_id.clone(),
            attempt: r.instance.attempt,
            status: r.envelope.status,
            success: r.envelope.success,
            confidence: r.envelope.confidence,
            error_kind: r.envelope.error_kind,
            duration_ms: r.envelope.duration_ms,
            result_ref: r.instance.result_ref.clone(),
        }
    }
}

/// Run report written as `run-<id>.json` and rendered to `run-<id>.md`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunReport {
    pub schema_version: String,
    pub generated_at: DateTime<Utc>,
    pub run_id: String,
    pub goal: String,
    /// Unset while the run is still in progress (phase-7 summaries).
    pub status: Option<RunStatus>,
    pub exit_code: Option<i32>,
    pub error_kind: Option<ErrorKind>,
    pub message: Option<String>,
    pub phases: Vec<PhaseRecord>,
    pub instances: Vec<InstanceSummary>,
    pub consensus: Vec<ConsensusRecord>,
    pub findings: Vec<Finding>,
    /// Digest of the phase-5 artifact set.
    pub artifact_set: Option<String>,
    pub working_set: Vec<TodoId>,
    pub deferred: Vec<TodoId>,
    pub duration_ms: u64,
}

impl RunReport {
    /// Report for a run that has not finished yet.
    pub fn interim(
        run_id: &str,
        goal: &str,
        phases: &[PhaseRecord],
        instances: &[InstanceRecord],
        consensus: &[ConsensusRecord],
        findings: &[Finding],
        artifact_set: Option<String>,
    ) -> Self {
        Self {
            schema_version: REPORT_SCHEMA_VERSION.to_string(),
            generated_at: Utc::now(),
            run_id: run_id.to_string(),
            goal: goal.to_string(),
            status: None,
            exit_code: None,
            error_kind: None,
            message: None,
            phases: phases.to_vec(),
            instances: instances.iter().map(InstanceSummary::from).collect(),
            consensus: consensus.to_vec(),
            findings: findings.to_vec(),
            artifact_set,
            working_set: Vec::new(),
            deferred: Vec::new(),
            duration_ms: 0,
        }
    }
}

/// Write the report in pretty JSON format.
pub fn write_report_json(path: &Path, report: &RunReport) -> Result<()> {
    let content = serde_json::to_string_pretty(report).context("serialize run report")?;
    std::fs::write(path, content).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Render the markdown summary.
pub fn render_report_md(report: &RunReport) -> String {
    let mut out = String::new();
    out.push_str(&format!("# Run {}\n\n", report.run_id));
    out.push_str(&format!("- goal: {}\n", report.goal));
    match report.status {
        Some(status) => out.push_str(&format!(
            "- status: **{}** (exit {})\n",
            status,
            status.exit_code()
        )),
        None => out.push_str("- status: in progress\n"),
    }
    if let Some(kind) = report.error_kind {
        out.push_str(&format!("- error: `{}`", kind));
        if let Some(msg) = &report.message {
            out.push_str(&format!(" {}", msg));
        }
        out.push('\n');
    }
    out.push_str(&format!(
        "- instances: {}\n- duration: {} ms\n\n",
        report.instances.len(),
        report.duration_ms
    ));

    out.push_str("## Phases\n\n| # | phase | status | attempts | dispatched | note |\n|---|---|---|---|---|---|\n");
    for p in &report.phases {
        let status = match p.status {
            PhaseStatus::Passed => "passed",
            PhaseStatus::Failed => "FAILED",
            PhaseStatus::Skipped => "skipped",
        };
        out.push_str(&format!(
            "| {} | {} | {} | {} | {} | {} |\n",
            p.phase,
            p.name,
            status,
            p.attempts,
            p.dispatched,
            p.reason.as_deref().unwrap_or("")
        ));
    }
    out.push('\n');

    if !report.consensus.is_empty() {
        out.push_str("## Consensus\n\n");
        for c in &report.consensus {
            out.push_str(&format!(
                "- `{}`: {} (mean {:.2}, stddev {:.2}, {}/{} succeeded)\n",
                c.role,
                c.classification,
                c.mean,
                c.stddev,
                c.successes,
                c.members.len()
            ));
        }
        out.push('\n');
    }

    if !report.findings.is_empty() {
        out.push_str("## Findings\n\n");
        let mut findings: Vec<&Finding> = report.findings.iter().collect();
        findings.sort_by(|a, b| b.severity.cmp(&a.severity).then_with(|| a.kind.cmp(&b.kind)));
        for f in findings {
            out.push_str(&format!("- **{}** `{}` {}", f.severity, f.kind, f.reference));
            if !f.message.is_empty() {
                out.push_str(&format!(": {}", f.message));
            }
            out.push('\n');
        }
        out.push('\n');
    }

    let failed: Vec<&InstanceSummary> = report.instances.iter().filter(|i| !i.success).collect();
    if !failed.is_empty() {
        out.push_str("## Failed instances\n\n");
        for i in failed {
            out.push_str(&format!(
                "- `{}` ({}) attempt {}: {}\n",
                i.task_id,
                i.specialist_id,
                i.attempt,
                i.error_kind.map(|k| k.as_str()).unwrap_or("-")
            ));
        }
    }
    out
}

/// Write the markdown summary.
pub fn write_report_md(path: &Path, report: &RunReport) -> Result<()> {
    let md = render_report_md(report);
    std::fs::write(path, md).with_context(|| format!("write {:?}", path))?;
    Ok(())
}

/// Write both report files into `dir`, creating it if needed.
pub fn write_reports(dir: &Path, report: &RunReport) -> Result<(PathBuf, PathBuf)> {
    std::fs::create_dir_all(dir).with_context(|| format!("create report dir {:?}", dir))?;
    let json_path = dir.join(format!("{}.json", report.run_id));
    let md_path = dir.join(format!("{}.md", report.run_id));
    write_report_json(&json_path, report)?;
    write_report_md(&md_path, report)?;
    Ok((json_path, md_path))
}
