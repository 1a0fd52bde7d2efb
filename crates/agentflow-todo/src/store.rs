//! Async handle over [`TodoLedger`].
//!
//! All writes are funnelled through a single blocking writer lane, so
//! transitions are applied one at a time in arrival order. After each
//! committed write the lane publishes a fresh [`TodoSnapshot`] on a watch
//! channel; readers never observe a half-applied transition.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info};

use crate::error::TodoError;
use crate::ledger::{TodoConfig, TodoLedger};
use crate::model::{Todo, TodoId, TodoSnapshot, TodoState};
use crate::Result;

type Reply = Box<dyn FnOnce() + Send>;
type Command = Box<dyn FnOnce(&mut TodoLedger) -> Reply + Send>;

/// Cloneable async front-end to the todo ledger.
#[derive(Clone)]
pub struct TodoStore {
    tx: mpsc::UnboundedSender<Command>,
    snapshot: watch::Receiver<Arc<TodoSnapshot>>,
}

impl std::fmt::Debug for TodoStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TodoStore")
            .field("last_seq", &self.snapshot.borrow().last_seq)
            .finish()
    }
}

impl TodoStore {
    /// Open (or create) the store in `dir`, running crash recovery.
    pub async fn open(dir: impl Into<PathBuf>, config: TodoConfig) -> Result<Self> {
        let dir = dir.into();
        let ledger = tokio::task::spawn_blocking(move || TodoLedger::open(dir, config))
            .await
            .map_err(|e| TodoError::Io(std::io::Error::new(std::io::ErrorKind::Other, e.to_string())))??;
        Ok(Self::spawn(ledger))
    }

    /// Store with no backing files.
    pub fn in_memory(config: TodoConfig) -> Self {
        Self::spawn(TodoLedger::in_memory(config))
    }

    /// Start the writer lane for an already-open ledger.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn(mut ledger: TodoLedger) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Command>();
        let (snap_tx, snap_rx) = watch::channel(Arc::new(ledger.snapshot()));

        tokio::task::spawn_blocking(move || {
            let mut published = ledger.last_seq();
            while let Some(cmd) = rx.blocking_recv() {
                let reply = cmd(&mut ledger);
                if ledger.last_seq() != published {
                    published = ledger.last_seq();
                    snap_tx.send_replace(Arc::new(ledger.snapshot()));
                }
                // Reply only once the snapshot is visible.
                reply();
            }
            debug!("todo writer lane stopped");
        });
        info!("todo writer lane started");

        Self {
            tx,
            snapshot: snap_rx,
        }
    }

    async fn call<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut TodoLedger) -> Result<T> + Send + 'static,
    {
        let (reply_tx, reply_rx) = oneshot::channel();
        let cmd: Command = Box::new(move |ledger: &mut TodoLedger| -> Reply {
            let result = f(ledger);
            Box::new(move || {
                let _ = reply_tx.send(result);
            })
        });
        self.tx.send(cmd).map_err(|_| TodoError::Closed)?;
        reply_rx.await.map_err(|_| TodoError::Closed)?
    }

    // -- reads ------------------------------------------------------------

    /// Latest consistent snapshot.
    pub fn snapshot(&self) -> Arc<TodoSnapshot> {
        self.snapshot.borrow().clone()
    }

    /// Watch channel that yields a new snapshot after every committed write.
    pub fn subscribe(&self) -> watch::Receiver<Arc<TodoSnapshot>> {
        self.snapshot.clone()
    }

    pub fn get(&self, id: TodoId) -> Option<Todo> {
        self.snapshot.borrow().get(id).cloned()
    }

    /// Todos filtered by state (all when `None`), creation order.
    pub fn list(&self, state: Option<TodoState>) -> Vec<Todo> {
        let snap = self.snapshot.borrow();
        snap.todos
            .iter()
            .filter(|t| state.map_or(true, |s| t.state == s))
            .cloned()
            .collect()
    }

    // -- writes -----------------------------------------------------------

    pub async fn add(
        &self,
        description: impl Into<String>,
        priority: u32,
        originating_task: Option<String>,
        deadline: Option<DateTime<Utc>>,
    ) -> Result<Todo> {
        let description = description.into();
        self.call(move |l| l.add(description, priority, originating_task, deadline, Utc::now()))
            .await
    }

    pub async fn claim(&self, worker: impl Into<String>, k: usize) -> Result<Vec<Todo>> {
        let worker = worker.into();
        self.call(move |l| l.claim(&worker, k, Utc::now())).await
    }

    pub async fn claim_id(&self, id: TodoId, worker: impl Into<String>) -> Result<Todo> {
        let worker = worker.into();
        self.call(move |l| l.claim_id(id, &worker, Utc::now())).await
    }

    /// Return a blocked todo to pending and immediately claim it for `worker`.
    pub async fn resume(&self, id: TodoId, worker: impl Into<String>) -> Result<Todo> {
        let worker = worker.into();
        self.call(move |l| {
            let now = Utc::now();
            l.release(id, now)?;
            l.claim_id(id, &worker, now)
        })
        .await
    }

    pub async fn complete(&self, id: TodoId, result_ref: impl Into<String>) -> Result<Todo> {
        let result_ref = result_ref.into();
        self.call(move |l| l.complete(id, result_ref, Utc::now())).await
    }

    pub async fn block(&self, id: TodoId, reason: impl Into<String>) -> Result<Todo> {
        let reason = reason.into();
        self.call(move |l| l.block(id, reason, Utc::now())).await
    }

    pub async fn release(&self, id: TodoId) -> Result<Todo> {
        self.call(move |l| l.release(id, Utc::now())).await
    }

    pub async fn abandon(&self, id: TodoId, reason: impl Into<String>) -> Result<Todo> {
        let reason = reason.into();
        self.call(move |l| l.abandon(id, reason, Utc::now())).await
    }

    /// See [`TodoLedger::defer`].
    pub async fn defer(
        &self,
        description: impl Into<String>,
        priority: u32,
        originating_task: Option<String>,
        worker: impl Into<String>,
        reason: impl Into<String>,
    ) -> Result<Todo> {
        let description = description.into();
        let worker = worker.into();
        let reason = reason.into();
        self.call(move |l| l.defer(description, priority, originating_task, &worker, reason, Utc::now()))
            .await
    }

    pub async fn reap_expired(&self, live_workers: HashSet<String>) -> Result<Vec<TodoId>> {
        self.call(move |l| l.reap_expired(&live_workers, Utc::now())).await
    }

    pub async fn compact(&self) -> Result<()> {
        self.call(|l| l.compact()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_reflects_committed_writes() {
        let store = TodoStore::in_memory(TodoConfig::default());
        let todo = store.add("write docs", 1, None, None).await.unwrap();

        let snap = store.snapshot();
        assert_eq!(snap.todos.len(), 1);
        assert_eq!(snap.get(todo.id).unwrap().state, TodoState::Pending);
    }

    #[tokio::test]
    async fn test_concurrent_claims_never_double_assign() {
        let store = TodoStore::in_memory(TodoConfig::default());
        for i in 0..20 {
            store.add(format!("item {i}"), 0, None, None).await.unwrap();
        }

        let mut handles = Vec::new();
        for w in 0..8 {
            let s = store.clone();
            handles.push(tokio::spawn(async move { s.claim(format!("w{w}"), 3).await.unwrap() }));
        }
        let mut seen = HashSet::new();
        let mut total = 0;
        for h in handles {
            for t in h.await.unwrap() {
                assert!(seen.insert(t.id), "todo {} claimed twice", t.id);
                total += 1;
            }
        }
        assert_eq!(total, 20);
        assert!(store.list(Some(TodoState::Pending)).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_transition_is_reported_and_state_unchanged() {
        let store = TodoStore::in_memory(TodoConfig::default());
        let t = store.add("x", 0, None, None).await.unwrap();
        let before = store.snapshot().last_seq;

        let err = store.complete(t.id, "ref").await.unwrap_err();
        assert!(matches!(err, TodoError::InvalidTransition { .. }));
        assert_eq!(store.snapshot().last_seq, before);
        assert_eq!(store.get(t.id).unwrap().state, TodoState::Pending);
    }

    #[tokio::test]
    async fn test_subscribe_sees_new_snapshot() {
        let store = TodoStore::in_memory(TodoConfig::default());
        let mut rx = store.subscribe();
        rx.borrow_and_update();

        store.add("x", 0, None, None).await.unwrap();
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().todos.len(), 1);
    }
}
