//! Global atomic counters for orchestration observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (the phase controller does so at the end of a run).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    instances_dispatched: AtomicU64,
    envelopes_emitted: AtomicU64,
    retries: AtomicU64,
    locks_revoked: AtomicU64,
    deadlocks_aborted: AtomicU64,
    todos_transitioned: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            instances_dispatched: AtomicU64::new(0),
            envelopes_emitted: AtomicU64::new(0),
            retries: AtomicU64::new(0),
            locks_revoked: AtomicU64::new(0),
            deadlocks_aborted: AtomicU64::new(0),
            todos_transitioned: AtomicU64::new(0),
        }
    }

    pub fn inc_dispatched(&self) {
        self.instances_dispatched.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "instances_dispatched", "counter incremented");
    }

    pub fn inc_envelopes(&self) {
        self.envelopes_emitted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "envelopes_emitted", "counter incremented");
    }

    pub fn inc_retries(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "retries", "counter incremented");
    }

    pub fn inc_locks_revoked(&self) {
        self.locks_revoked.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "locks_revoked", "counter incremented");
    }

    pub fn inc_deadlocks(&self) {
        self.deadlocks_aborted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deadlocks_aborted", "counter incremented");
    }

    pub fn inc_todos(&self) {
        self.todos_transitioned.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "todos_transitioned", "counter incremented");
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            instances_dispatched = self.instances_dispatched(),
            envelopes_emitted = self.envelopes_emitted(),
            retries = self.retries(),
            locks_revoked = self.locks_revoked(),
            deadlocks_aborted = self.deadlocks_aborted(),
            todos_transitioned = self.todos_transitioned(),
        );
    }

    pub fn instances_dispatched(&self) -> u64 {
        self.instances_dispatched.load(Ordering::Relaxed)
    }

    pub fn envelopes_emitted(&self) -> u64 {
        self.envelopes_emitted.load(Ordering::Relaxed)
    }

    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    pub fn locks_revoked(&self) -> u64 {
        self.locks_revoked.load(Ordering::Relaxed)
    }

    pub fn deadlocks_aborted(&self) -> u64 {
        self.deadlocks_aborted.load(Ordering::Relaxed)
    }

    pub fn todos_transitioned(&self) -> u64 {
        self.todos_transitioned.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.instances_dispatched.store(0, Ordering::Relaxed);
        self.envelopes_emitted.store(0, Ordering::Relaxed);
        self.retries.store(0, Ordering::Relaxed);
        self.locks_revoked.store(0, Ordering::Relaxed);
        self.deadlocks_aborted.store(0, Ordering::Relaxed);
        self.todos_transitioned.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_dispatched();
        m.inc_dispatched();
        m.inc_envelopes();
        m.inc_retries();
        m.inc_locks_revoked();
        m.inc_deadlocks();
        m.inc_todos();
        assert_eq!(m.instances_dispatched(), 2);
        assert_eq!(m.envelopes_emitted(), 1);
        assert_eq!(m.retries(), 1);
        assert_eq!(m.locks_revoked(), 1);
        assert_eq!(m.deadlocks_aborted(), 1);
        assert_eq!(m.todos_transitioned(), 1);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_dispatched();
        m.inc_todos();
        m.reset();
        assert_eq!(m.instances_dispatched(), 0);
        assert_eq!(m.todos_transitioned(), 0);
    }
}
