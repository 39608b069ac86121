//! Delegation bookkeeping: task assignments and the worker result
//! hand-off.
//!
//! The worker/parent exchange is a request/response contract: the worker
//! records its outcome here *before* `handle_delegated_task` returns, so
//! the delegating turn's read after the await always observes it.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;

use fm_domain::citation::CitationSource;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Assignments
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStatus {
    Pending,
    Started,
    Completed,
    Failed,
}

/// One delegated task, as tracked by the supervisor that created it.
#[derive(Debug, Clone, Serialize)]
pub struct TaskAssignment {
    pub id: String,
    pub description: String,
    pub assigned_by: String,
    /// Worker instance carrying the task out.
    pub agent_id: String,
    pub status: AssignmentStatus,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Worker outcome
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerStatus {
    Completed,
    Failed,
}

/// The `task_result` payload a worker reports to its parent.
#[derive(Debug, Clone)]
pub struct WorkerOutcome {
    pub result: String,
    pub status: WorkerStatus,
    pub citations: Vec<CitationSource>,
}

impl WorkerOutcome {
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            result: error.into(),
            status: WorkerStatus::Failed,
            citations: Vec::new(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tracker
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Shared between a supervisor and the workers it spawns. Assignments are
/// single-writer per entry (the owning supervisor); results are written by
/// the worker and drained by the delegating turn.
#[derive(Default)]
pub struct DelegationTracker {
    tasks: Mutex<HashMap<String, TaskAssignment>>,
    /// Worker agent id → outcome, written before the worker returns.
    results: Mutex<HashMap<String, WorkerOutcome>>,
}

impl DelegationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a new pending assignment. Returns its id.
    pub fn create_assignment(
        &self,
        description: &str,
        assigned_by: &str,
        agent_id: &str,
    ) -> String {
        let id = uuid::Uuid::new_v4().to_string();
        self.tasks.lock().insert(
            id.clone(),
            TaskAssignment {
                id: id.clone(),
                description: description.to_string(),
                assigned_by: assigned_by.to_string(),
                agent_id: agent_id.to_string(),
                status: AssignmentStatus::Pending,
                created_at: Utc::now(),
                completed_at: None,
            },
        );
        id
    }

    /// The worker's `status_update: started` notification.
    pub fn mark_started(&self, assignment_id: &str) {
        let mut tasks = self.tasks.lock();
        if let Some(task) = tasks.get_mut(assignment_id) {
            task.status = AssignmentStatus::Started;
        }
    }

    /// The worker's synchronous `task_result`. Flips the assignment to its
    /// terminal status and stores the outcome for the parent to drain.
    pub fn complete(&self, assignment_id: &str, agent_id: &str, outcome: WorkerOutcome) {
        {
            let mut tasks = self.tasks.lock();
            if let Some(task) = tasks.get_mut(assignment_id) {
                task.status = match outcome.status {
                    WorkerStatus::Completed => AssignmentStatus::Completed,
                    WorkerStatus::Failed => AssignmentStatus::Failed,
                };
                task.completed_at = Some(Utc::now());
            }
        }
        self.results.lock().insert(agent_id.to_string(), outcome);
    }

    /// Drain the result a worker left for the parent.
    pub fn take_result(&self, agent_id: &str) -> Option<WorkerOutcome> {
        self.results.lock().remove(agent_id)
    }

    pub fn assignment(&self, assignment_id: &str) -> Option<TaskAssignment> {
        self.tasks.lock().get(assignment_id).cloned()
    }

    /// Snapshot of all assignments, newest first.
    pub fn assignments(&self) -> Vec<TaskAssignment> {
        let tasks = self.tasks.lock();
        let mut all: Vec<TaskAssignment> = tasks.values().cloned().collect();
        all.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        all
    }
}
