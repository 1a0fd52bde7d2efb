//! Todo items, their state automaton and the transition records written to the log.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable identifier of a todo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TodoId(pub Uuid);

impl TodoId {
    /// Generate a new random id.
    pub fn new() -> Self {
        TodoId(Uuid::new_v4())
    }
}

impl Default for TodoId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TodoId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for TodoId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Ok(TodoId(Uuid::parse_str(s)?))
    }
}

/// Lifecycle state of a todo.
///
/// `pending -> in_progress -> (completed | blocked | abandoned)`, and
/// `blocked -> pending`. Completed and abandoned are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoState {
    Pending,
    InProgress,
    Blocked,
    Completed,
    Abandoned,
}

impl TodoState {
    /// Whether the automaton permits `self -> next`.
    pub fn can_transition_to(self, next: TodoState) -> bool {
        use TodoState::*;
        matches!(
            (self, next),
            (Pending, InProgress)
                | (InProgress, Completed)
                | (InProgress, Blocked)
                | (InProgress, Abandoned)
                | (Blocked, Pending)
        )
    }

    /// Completed and abandoned todos never change again.
    pub fn is_terminal(self) -> bool {
        matches!(self, TodoState::Completed | TodoState::Abandoned)
    }
}

impl std::fmt::Display for TodoState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            TodoState::Pending => "pending",
            TodoState::InProgress => "in_progress",
            TodoState::Blocked => "blocked",
            TodoState::Completed => "completed",
            TodoState::Abandoned => "abandoned",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for TodoState {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "pending" => Ok(TodoState::Pending),
            "in_progress" => Ok(TodoState::InProgress),
            "blocked" => Ok(TodoState::Blocked),
            "completed" => Ok(TodoState::Completed),
            "abandoned" => Ok(TodoState::Abandoned),
            other => Err(format!("unknown todo state: {other}")),
        }
    }
}

/// A durable unit of cross-session work.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Todo {
    pub id: TodoId,
    pub created_at: DateTime<Utc>,
    /// Higher values are claimed first.
    pub priority: u32,
    pub state: TodoState,
    /// Task that produced this todo, if any.
    pub originating_task: Option<String>,
    pub description: String,
    pub deadline: Option<DateTime<Utc>>,
    /// Worker currently holding the todo (set while in progress).
    pub owner: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    /// Artifact reference recorded on completion.
    pub result_ref: Option<String>,
    /// Reason for the most recent block or abandonment.
    pub reason: Option<String>,
    /// Log sequence number of the `Added` record; FIFO tie-break for claims.
    pub created_seq: u64,
    pub updated_at: DateTime<Utc>,
}

/// A single state transition as written to the append-only log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum TodoOp {
    Added {
        todo: Todo,
    },
    Claimed {
        id: TodoId,
        worker: String,
        at: DateTime<Utc>,
    },
    Completed {
        id: TodoId,
        result_ref: String,
        at: DateTime<Utc>,
    },
    Blocked {
        id: TodoId,
        reason: String,
        at: DateTime<Utc>,
    },
    Released {
        id: TodoId,
        at: DateTime<Utc>,
    },
    Abandoned {
        id: TodoId,
        reason: String,
        at: DateTime<Utc>,
    },
    /// Crash recovery: an in-progress todo whose owner is gone returns to pending.
    LeaseExpired {
        id: TodoId,
        at: DateTime<Utc>,
    },
}

impl TodoOp {
    /// The todo this record applies to.
    pub fn todo_id(&self) -> TodoId {
        match self {
            TodoOp::Added { todo } => todo.id,
            TodoOp::Claimed { id, .. }
            | TodoOp::Completed { id, .. }
            | TodoOp::Blocked { id, .. }
            | TodoOp::Released { id, .. }
            | TodoOp::Abandoned { id, .. }
            | TodoOp::LeaseExpired { id, .. } => *id,
        }
    }
}

/// Consistent, read-only view of the store at one log position.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TodoSnapshot {
    /// Sequence number of the last transition folded into this view.
    pub last_seq: u64,
    /// All todos ordered by creation sequence.
    pub todos: Vec<Todo>,
}

impl TodoSnapshot {
    /// Todos in the given state, creation order.
    pub fn in_state(&self, state: TodoState) -> Vec<&Todo> {
        self.todos.iter().filter(|t| t.state == state).collect()
    }

    pub fn get(&self, id: TodoId) -> Option<&Todo> {
        self.todos.iter().find(|t| t.id == id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_automaton_allows_declared_edges() {
        use TodoState::*;
        assert!(Pending.can_transition_to(InProgress));
        assert!(InProgress.can_transition_to(Completed));
        assert!(InProgress.can_transition_to(Blocked));
        assert!(InProgress.can_transition_to(Abandoned));
        assert!(Blocked.can_transition_to(Pending));
    }

    #[test]
    fn test_automaton_rejects_everything_else() {
        use TodoState::*;
        let all = [Pending, InProgress, Blocked, Completed, Abandoned];
        let allowed = [
            (Pending, InProgress),
            (InProgress, Completed),
            (InProgress, Blocked),
            (InProgress, Abandoned),
            (Blocked, Pending),
        ];
        for from in all {
            for to in all {
                assert_eq!(
                    from.can_transition_to(to),
                    allowed.contains(&(from, to)),
                    "{from} -> {to}"
                );
            }
        }
    }

    #[test]
    fn test_state_parses_cli_spellings() {
        assert_eq!("in-progress".parse::<TodoState>().unwrap(), TodoState::InProgress);
        assert_eq!("Blocked".parse::<TodoState>().unwrap(), TodoState::Blocked);
        assert!("done".parse::<TodoState>().is_err());
    }

    #[test]
    fn test_op_serializes_with_tag() {
        let id = TodoId::new();
        let op = TodoOp::Released {
            id,
            at: Utc::now(),
        };
        let json = serde_json::to_value(&op).unwrap();
        assert_eq!(json["op"], "released");
        assert_eq!(op.todo_id(), id);
    }
}
