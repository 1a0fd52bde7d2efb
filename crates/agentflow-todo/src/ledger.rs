//! Synchronous todo state machine with write-ahead journaling.
//!
//! Every mutation is validated against the automaton, appended to the
//! journal, and only then applied in memory. A failed append leaves the
//! in-memory state untouched.

use std::collections::{BTreeMap, HashSet};
use std::path::Path;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::error::TodoError;
use crate::journal::{Journal, LogRecord, SnapshotFile};
use crate::model::{Todo, TodoId, TodoOp, TodoSnapshot, TodoState};
use crate::Result;

/// Tuning knobs for the ledger.
#[derive(Debug, Clone)]
pub struct TodoConfig {
    /// How long an in-progress todo may go unowned before recovery returns it
    /// to pending.
    pub lease_timeout: Duration,
    /// Rewrite the snapshot after this many appended records (0 disables).
    pub compact_every: usize,
}

impl Default for TodoConfig {
    fn default() -> Self {
        Self {
            lease_timeout: Duration::from_secs(600),
            compact_every: 64,
        }
    }
}

/// The todo state machine.
#[derive(Debug)]
pub struct TodoLedger {
    todos: BTreeMap<TodoId, Todo>,
    last_seq: u64,
    journal: Option<Journal>,
    config: TodoConfig,
    appended_since_snapshot: usize,
}

impl TodoLedger {
    /// A ledger with no backing files (tests, dry runs).
    pub fn in_memory(config: TodoConfig) -> Self {
        Self {
            todos: BTreeMap::new(),
            last_seq: 0,
            journal: None,
            config,
            appended_since_snapshot: 0,
        }
    }

    /// Open the journal in `dir`, replay it, and return expired leases to pending.
    ///
    /// Owners recorded by a previous process cannot be alive in this one, so
    /// every in-progress todo whose lease has run out is recovered here.
    pub fn open(dir: impl AsRef<Path>, config: TodoConfig) -> Result<Self> {
        Self::open_at(dir, config, Utc::now())
    }

    /// [`TodoLedger::open`] with an explicit clock.
    pub fn open_at(dir: impl AsRef<Path>, config: TodoConfig, now: DateTime<Utc>) -> Result<Self> {
        let (journal, recovered) = Journal::open(dir)?;

        let mut ledger = Self {
            todos: recovered
                .snapshot
                .todos
                .into_iter()
                .map(|t| (t.id, t))
                .collect(),
            last_seq: recovered.snapshot.last_seq,
            journal: None,
            config,
            appended_since_snapshot: recovered.records.len(),
        };

        for (line, record) in recovered.records.into_iter().enumerate() {
            ledger.check(&record.op).map_err(|e| TodoError::CorruptLog {
                line: line + 1,
                detail: e.to_string(),
            })?;
            ledger.apply(record.op);
            ledger.last_seq = record.seq;
        }

        ledger.journal = Some(journal);
        info!(todos = ledger.todos.len(), last_seq = ledger.last_seq, "todo ledger recovered");

        let recovered = ledger.reap_expired(&HashSet::new(), now)?;
        if !recovered.is_empty() {
            warn!(count = recovered.len(), "returned orphaned in-progress todos to pending");
        }
        Ok(ledger)
    }

    // -- reads ------------------------------------------------------------

    /// Consistent copy of every todo, ordered by creation.
    pub fn snapshot(&self) -> TodoSnapshot {
        let mut todos: Vec<Todo> = self.todos.values().cloned().collect();
        todos.sort_by_key(|t| t.created_seq);
        TodoSnapshot {
            last_seq: self.last_seq,
            todos,
        }
    }

    pub fn get(&self, id: TodoId) -> Option<&Todo> {
        self.todos.get(&id)
    }

    pub fn last_seq(&self) -> u64 {
        self.last_seq
    }

    // -- mutations --------------------------------------------------------

    /// Add a new pending todo.
    pub fn add(
        &mut self,
        description: impl Into<String>,
        priority: u32,
        originating_task: Option<String>,
        deadline: Option<DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Todo> {
        let todo = Todo {
            id: TodoId::new(),
            created_at: now,
            priority,
            state: TodoState::Pending,
            originating_task,
            description: description.into(),
            deadline,
            owner: None,
            claimed_at: None,
            result_ref: None,
            reason: None,
            created_seq: self.last_seq + 1,
            updated_at: now,
        };
        self.commit(TodoOp::Added { todo: todo.clone() })?;
        Ok(todo)
    }

    /// Move up to `k` pending todos to in-progress for `worker`.
    ///
    /// Highest priority first; equal priorities are claimed in creation order.
    pub fn claim(&mut self, worker: &str, k: usize, now: DateTime<Utc>) -> Result<Vec<Todo>> {
        let mut pending: Vec<&Todo> = self
            .todos
            .values()
            .filter(|t| t.state == TodoState::Pending)
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.created_seq.cmp(&b.created_seq))
        });
        let ids: Vec<TodoId> = pending.into_iter().take(k).map(|t| t.id).collect();

        let mut claimed = Vec::with_capacity(ids.len());
        for id in ids {
            self.commit(TodoOp::Claimed {
                id,
                worker: worker.to_string(),
                at: now,
            })?;
            if let Some(t) = self.todos.get(&id) {
                claimed.push(t.clone());
            }
        }
        Ok(claimed)
    }

    /// Claim one specific pending todo.
    pub fn claim_id(&mut self, id: TodoId, worker: &str, now: DateTime<Utc>) -> Result<Todo> {
        self.commit(TodoOp::Claimed {
            id,
            worker: worker.to_string(),
            at: now,
        })?;
        self.require(id)
    }

    pub fn complete(&mut self, id: TodoId, result_ref: impl Into<String>, now: DateTime<Utc>) -> Result<Todo> {
        self.commit(TodoOp::Completed {
            id,
            result_ref: result_ref.into(),
            at: now,
        })?;
        self.require(id)
    }

    pub fn block(&mut self, id: TodoId, reason: impl Into<String>, now: DateTime<Utc>) -> Result<Todo> {
        self.commit(TodoOp::Blocked {
            id,
            reason: reason.into(),
            at: now,
        })?;
        self.require(id)
    }

    /// Return a blocked todo to pending.
    pub fn release(&mut self, id: TodoId, now: DateTime<Utc>) -> Result<Todo> {
        self.commit(TodoOp::Released { id, at: now })?;
        self.require(id)
    }

    pub fn abandon(&mut self, id: TodoId, reason: impl Into<String>, now: DateTime<Utc>) -> Result<Todo> {
        self.commit(TodoOp::Abandoned {
            id,
            reason: reason.into(),
            at: now,
        })?;
        self.require(id)
    }

    /// Record work that cannot start now: add, claim for `worker`, then block.
    ///
    /// Walks the regular automaton so the log stays replayable.
    pub fn defer(
        &mut self,
        description: impl Into<String>,
        priority: u32,
        originating_task: Option<String>,
        worker: &str,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Result<Todo> {
        let todo = self.add(description, priority, originating_task, None, now)?;
        self.commit(TodoOp::Claimed {
            id: todo.id,
            worker: worker.to_string(),
            at: now,
        })?;
        self.block(todo.id, reason, now)
    }

    /// Return in-progress todos to pending when their owner is not in
    /// `live_workers` and their lease has run out.
    pub fn reap_expired(&mut self, live_workers: &HashSet<String>, now: DateTime<Utc>) -> Result<Vec<TodoId>> {
        let lease = chrono::Duration::from_std(self.config.lease_timeout)
            .unwrap_or_else(|_| chrono::Duration::days(36_500));
        let expired: Vec<TodoId> = self
            .todos
            .values()
            .filter(|t| t.state == TodoState::InProgress)
            .filter(|t| !t.owner.as_ref().is_some_and(|o| live_workers.contains(o)))
            .filter(|t| {
                t.claimed_at
                    .map(|at| at + lease <= now)
                    .unwrap_or(true)
            })
            .map(|t| t.id)
            .collect();

        for id in &expired {
            self.commit(TodoOp::LeaseExpired { id: *id, at: now })?;
        }
        Ok(expired)
    }

    /// Fold the log into a fresh snapshot.
    pub fn compact(&mut self) -> Result<()> {
        let snapshot = self.snapshot();
        if let Some(journal) = self.journal.as_mut() {
            journal.write_snapshot(&SnapshotFile {
                last_seq: snapshot.last_seq,
                todos: snapshot.todos,
            })?;
        }
        self.appended_since_snapshot = 0;
        Ok(())
    }

    // -- internals --------------------------------------------------------

    fn require(&self, id: TodoId) -> Result<Todo> {
        self.todos.get(&id).cloned().ok_or(TodoError::NotFound(id))
    }

    fn commit(&mut self, op: TodoOp) -> Result<()> {
        self.check(&op)?;
        let record = LogRecord {
            seq: self.last_seq + 1,
            op,
        };
        if let Some(journal) = self.journal.as_mut() {
            journal.append(&record)?;
        }
        debug!(seq = record.seq, todo = %record.op.todo_id(), "todo transition committed");
        self.last_seq = record.seq;
        self.apply(record.op);

        self.appended_since_snapshot += 1;
        if self.config.compact_every > 0 && self.appended_since_snapshot >= self.config.compact_every {
            self.compact()?;
        }
        Ok(())
    }

    /// Validate `op` against the current state without mutating anything.
    fn check(&self, op: &TodoOp) -> Result<()> {
        let (id, target) = match op {
            TodoOp::Added { todo } => {
                if self.todos.contains_key(&todo.id) {
                    return Err(TodoError::CorruptLog {
                        line: 0,
                        detail: format!("duplicate todo id {}", todo.id),
                    });
                }
                return Ok(());
            }
            TodoOp::Claimed { id, .. } => (*id, TodoState::InProgress),
            TodoOp::Completed { id, .. } => (*id, TodoState::Completed),
            TodoOp::Blocked { id, .. } => (*id, TodoState::Blocked),
            TodoOp::Released { id, .. } => (*id, TodoState::Pending),
            TodoOp::Abandoned { id, .. } => (*id, TodoState::Abandoned),
            TodoOp::LeaseExpired { id, .. } => {
                let current = self.todos.get(id).ok_or(TodoError::NotFound(*id))?;
                if current.state != TodoState::InProgress {
                    return Err(TodoError::InvalidTransition {
                        id: *id,
                        from: current.state,
                        to: TodoState::Pending,
                    });
                }
                return Ok(());
            }
        };

        let current = self.todos.get(&id).ok_or(TodoError::NotFound(id))?;
        if !current.state.can_transition_to(target) {
            return Err(TodoError::InvalidTransition {
                id,
                from: current.state,
                to: target,
            });
        }
        Ok(())
    }

    /// Apply a validated op.
    fn apply(&mut self, op: TodoOp) {
        match op {
            TodoOp::Added { todo } => {
                self.todos.insert(todo.id, todo);
            }
            TodoOp::Claimed { id, worker, at } => {
                if let Some(t) = self.todos.get_mut(&id) {
                    t.state = TodoState::InProgress;
                    t.owner = Some(worker);
                    t.claimed_at = Some(at);
                    t.updated_at = at;
                }
            }
            TodoOp::Completed { id, result_ref, at } => {
                if let Some(t) = self.todos.get_mut(&id) {
                    t.state = TodoState::Completed;
                    t.result_ref = Some(result_ref);
                    t.owner = None;
                    t.updated_at = at;
                }
            }
            TodoOp::Blocked { id, reason, at } => {
                if let Some(t) = self.todos.get_mut(&id) {
                    t.state = TodoState::Blocked;
                    t.reason = Some(reason);
                    t.owner = None;
                    t.updated_at = at;
                }
            }
            TodoOp::Released { id, at } | TodoOp::LeaseExpired { id, at } => {
                if let Some(t) = self.todos.get_mut(&id) {
                    t.state = TodoState::Pending;
                    t.owner = None;
                    t.claimed_at = None;
                    t.updated_at = at;
                }
            }
            TodoOp::Abandoned { id, reason, at } => {
                if let Some(t) = self.todos.get_mut(&id) {
                    t.state = TodoState::Abandoned;
                    t.reason = Some(reason);
                    t.owner = None;
                    t.updated_at = at;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ledger() -> TodoLedger {
        TodoLedger::in_memory(TodoConfig::default())
    }

    #[test]
    fn test_claim_orders_by_priority_then_fifo() {
        let mut l = ledger();
        let now = Utc::now();
        let low = l.add("low", 1, None, None, now).unwrap();
        let high_a = l.add("high a", 5, None, None, now).unwrap();
        let high_b = l.add("high b", 5, None, None, now).unwrap();

        let claimed = l.claim("w1", 2, now).unwrap();
        let ids: Vec<TodoId> = claimed.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![high_a.id, high_b.id]);
        assert!(claimed.iter().all(|t| t.state == TodoState::InProgress));
        assert_eq!(l.get(low.id).unwrap().state, TodoState::Pending);
    }

    #[test]
    fn test_complete_requires_in_progress() {
        let mut l = ledger();
        let now = Utc::now();
        let t = l.add("x", 0, None, None, now).unwrap();
        let err = l.complete(t.id, "ref", now).unwrap_err();
        assert!(matches!(err, TodoError::InvalidTransition { .. }));

        l.claim("w", 1, now).unwrap();
        let done = l.complete(t.id, "ref", now).unwrap();
        assert_eq!(done.state, TodoState::Completed);
        assert_eq!(done.result_ref.as_deref(), Some("ref"));
    }

    #[test]
    fn test_blocked_only_returns_to_pending() {
        let mut l = ledger();
        let now = Utc::now();
        let t = l.add("x", 0, None, None, now).unwrap();
        l.claim("w", 1, now).unwrap();
        l.block(t.id, "waiting", now).unwrap();

        assert!(l.complete(t.id, "ref", now).is_err());
        assert!(l.abandon(t.id, "nope", now).is_err());
        let released = l.release(t.id, now).unwrap();
        assert_eq!(released.state, TodoState::Pending);
    }

    #[test]
    fn test_defer_leaves_todo_blocked_with_reason() {
        let mut l = ledger();
        let t = l
            .defer("overflow", 3, Some("task-9".into()), "run-1", crate::BACKPRESSURE, Utc::now())
            .unwrap();
        assert_eq!(t.state, TodoState::Blocked);
        assert_eq!(t.reason.as_deref(), Some(crate::BACKPRESSURE));
        assert_eq!(t.originating_task.as_deref(), Some("task-9"));
    }

    #[test]
    fn test_reap_respects_live_workers_and_lease() {
        let mut l = TodoLedger::in_memory(TodoConfig {
            lease_timeout: Duration::from_secs(60),
            compact_every: 0,
        });
        let t0 = Utc::now();
        let a = l.add("a", 0, None, None, t0).unwrap();
        let b = l.add("b", 0, None, None, t0).unwrap();
        l.claim("alive", 1, t0).unwrap();
        l.claim("dead", 1, t0).unwrap();

        let live: HashSet<String> = ["alive".to_string()].into_iter().collect();

        // Lease not yet expired.
        assert!(l.reap_expired(&live, t0 + chrono::Duration::seconds(30)).unwrap().is_empty());

        let reaped = l.reap_expired(&live, t0 + chrono::Duration::seconds(61)).unwrap();
        assert_eq!(reaped, vec![b.id]);
        assert_eq!(l.get(a.id).unwrap().state, TodoState::InProgress);
        assert_eq!(l.get(b.id).unwrap().state, TodoState::Pending);
    }

    #[test]
    fn test_claim_id_takes_exactly_that_todo() {
        let mut l = ledger();
        let now = Utc::now();
        let _first = l.add("first", 9, None, None, now).unwrap();
        let second = l.add("second", 0, None, None, now).unwrap();

        let claimed = l.claim_id(second.id, "w", now).unwrap();
        assert_eq!(claimed.id, second.id);
        assert_eq!(claimed.owner.as_deref(), Some("w"));
        assert!(l.claim_id(second.id, "w", now).is_err());
    }

    #[test]
    fn test_unknown_id_is_not_found() {
        let mut l = ledger();
        let err = l.release(TodoId::new(), Utc::now()).unwrap_err();
        assert!(matches!(err, TodoError::NotFound(_)));
    }
}
