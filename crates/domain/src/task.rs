//! Scheduled task records. The scheduler evaluates each task's cadence and
//! surfaces due tasks as synthetic `task_run` messages.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Per-task configuration rendered into the synthetic instruction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskConfig {
    #[serde(default)]
    pub description: String,
    /// Tools the task's turn may use. Empty = no restriction.
    #[serde(default)]
    pub allowed_tools: Vec<String>,
    /// Target conversation. Usually a well-known id (e.g. `feed`); unset
    /// means the scheduler's default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
}

/// A recurring task owned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub name: String,
    /// 5-field cron expression (min hour dom month dow).
    pub cadence: String,
    /// IANA timezone the cadence is evaluated in. Invalid values fall back
    /// to UTC.
    #[serde(default = "d_utc")]
    pub timezone: String,
    #[serde(default)]
    pub config: TaskConfig,
    #[serde(default = "d_true")]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(name: impl Into<String>, cadence: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            cadence: cadence.into(),
            timezone: d_utc(),
            config: TaskConfig::default(),
            enabled: true,
            last_run_at: None,
            next_run_at: None,
        }
    }
}

fn d_utc() -> String {
    "UTC".into()
}

fn d_true() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_task_defaults() {
        let task = Task::new("morning digest", "0 7 * * *");
        assert!(task.enabled);
        assert_eq!(task.timezone, "UTC");
        assert!(task.last_run_at.is_none());
        assert!(task.config.allowed_tools.is_empty());
    }

    #[test]
    fn deserializes_sparse_toml() {
        let task: Task = toml::from_str(
            r#"
            id = "t1"
            name = "metrics sweep"
            cadence = "*/30 * * * *"
            [config]
            description = "collect metrics"
            allowed_tools = ["web_search"]
            conversation_id = "feed"
            "#,
        )
        .unwrap();
        assert!(task.enabled);
        assert_eq!(task.config.allowed_tools, vec!["web_search"]);
        assert_eq!(task.config.conversation_id.as_deref(), Some("feed"));
    }
}
