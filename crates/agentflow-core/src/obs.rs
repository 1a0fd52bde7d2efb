//! Structured observability hooks for orchestration lifecycle events.
//!
//! - Run-scoped tracing spans via the `RunSpan` RAII guard
//! - One emission function per lifecycle event, all at `info!` level except
//!   lock revocation which is a warning
//!
//! Filter with `RUST_LOG`; pass `--json` to the CLI for JSON lines.

use tracing::{info, warn};

/// RAII guard that enters a run-scoped tracing span.
///
/// ```ignore
/// let _span = RunSpan::enter("run-12345");
/// // every event below carries run_id = "run-12345"
/// ```
pub struct RunSpan {
    _span: tracing::span::EnteredSpan,
}

impl RunSpan {
    pub fn enter(run_id: &str) -> Self {
        Self {
            _span: run_span(run_id).entered(),
        }
    }
}

/// The `agentflow.run` span, for instrumenting futures that cross await points.
pub fn run_span(run_id: &str) -> tracing::Span {
    tracing::info_span!("agentflow.run", run_id = %run_id)
}

pub fn emit_run_started(run_id: &str, goal: &str, phases: &[u8]) {
    info!(event = "run.started", run_id = %run_id, goal = %goal, phases = ?phases);
}

pub fn emit_run_finished(run_id: &str, duration_ms: u64, status: &str, exit_code: i32) {
    info!(
        event = "run.finished",
        run_id = %run_id,
        duration_ms = duration_ms,
        status = %status,
        exit_code = exit_code,
    );
}

pub fn emit_phase_started(run_id: &str, phase: u8, name: &str, attempt: u32) {
    info!(event = "phase.started", run_id = %run_id, phase = phase, name = %name, attempt = attempt);
}

pub fn emit_phase_finished(run_id: &str, phase: u8, passed: bool, duration_ms: u64) {
    info!(
        event = "phase.finished",
        run_id = %run_id,
        phase = phase,
        passed = passed,
        duration_ms = duration_ms,
    );
}

pub fn emit_phase_skipped(run_id: &str, phase: u8, reason: &str) {
    info!(event = "phase.skipped", run_id = %run_id, phase = phase, reason = %reason);
}

/// Gate evaluation with the number of violated rules.
pub fn emit_gate_evaluated(run_id: &str, phase: u8, passed: bool, violations: usize) {
    info!(
        event = "gate.evaluated",
        run_id = %run_id,
        phase = phase,
        passed = passed,
        violations = violations,
    );
}

pub fn emit_instance_dispatched(instance_id: &str, task_id: &str, specialist_id: &str, attempt: u32) {
    info!(
        event = "instance.dispatched",
        instance_id = %instance_id,
        task_id = %task_id,
        specialist = %specialist_id,
        attempt = attempt,
    );
}

pub fn emit_instance_terminal(instance_id: &str, status: &str, error_kind: Option<&str>, duration_ms: u64) {
    info!(
        event = "instance.terminal",
        instance_id = %instance_id,
        status = %status,
        error_kind = error_kind.unwrap_or("-"),
        duration_ms = duration_ms,
    );
}

pub fn emit_consensus_recorded(role: &str, mean: f64, stddev: f64, classification: &str, members: usize) {
    info!(
        event = "consensus.recorded",
        role = %role,
        mean = mean,
        stddev = stddev,
        classification = %classification,
        members = members,
    );
}

pub fn emit_lock_revoked(instance_id: &str, resources: usize) {
    warn!(event = "lock.revoked", instance_id = %instance_id, resources = resources);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_span_create() {
        let _span = RunSpan::enter("test-run-id");
        emit_phase_skipped("test-run-id", 8, "no tracked state changed");
    }
}
