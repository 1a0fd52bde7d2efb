//! agentflow-todo: durable todo store for the agentflow orchestrator
//!
//! Work items that outlive a single orchestration run live here. Every state
//! transition is appended to a log before it becomes visible; the log is
//! periodically folded into a compacted snapshot.
//!
//! ## Layer 0 - Persistence
//!
//! Focus: transition integrity and crash recovery.
//!
//! ## Key Components
//!
//! - `Todo` / `TodoState`: the work item and its transition automaton
//! - `Journal`: append-only log + snapshot files on disk
//! - `TodoLedger`: synchronous state machine backed by an optional journal
//! - `TodoStore`: async handle that funnels all writes through one serial lane

mod error;
pub mod journal;
pub mod ledger;
pub mod model;
pub mod store;

pub use error::TodoError;
pub use journal::{Journal, LogRecord, SnapshotFile};
pub use ledger::{TodoConfig, TodoLedger};
pub use model::{Todo, TodoId, TodoOp, TodoSnapshot, TodoState};
pub use store::TodoStore;

/// Block reason recorded when the executor cannot fit work into a wave.
pub const BACKPRESSURE: &str = "BACKPRESSURE";

/// Result type for todo-store operations
pub type Result<T> = std::result::Result<T, TodoError>;
