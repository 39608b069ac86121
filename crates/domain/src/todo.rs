//! Turn plan items: the deterministic sub-goal list a turn can build and
//! work through via delegation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Pending,
    InProgress,
    Completed,
    Cancelled,
}

impl TodoStatus {
    /// Open items keep the plan loop alive (and its extended iteration cap).
    pub fn is_open(self) -> bool {
        matches!(self, Self::Pending | Self::InProgress)
    }

    pub fn is_terminal(self) -> bool {
        !self.is_open()
    }
}

/// A plan item scoped to one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnTodo {
    pub id: String,
    pub turn_id: String,
    pub title: String,
    /// Specialist type that should carry this item out.
    pub agent_type: String,
    pub status: TodoStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<String>,
    pub created_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl TurnTodo {
    pub fn new(
        turn_id: impl Into<String>,
        title: impl Into<String>,
        agent_type: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            turn_id: turn_id.into(),
            title: title.into(),
            agent_type: agent_type.into(),
            status: TodoStatus::Pending,
            outcome: None,
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
        }
    }
}

/// Per-status counts for one turn's plan.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct TodoCounts {
    pub pending: u32,
    pub in_progress: u32,
    pub completed: u32,
    pub cancelled: u32,
}

impl TodoCounts {
    pub fn open(&self) -> u32 {
        self.pending + self.in_progress
    }

    pub fn total(&self) -> u32 {
        self.pending + self.in_progress + self.completed + self.cancelled
    }
}
