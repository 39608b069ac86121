//! Background scheduler.
//!
//! An interval ticker surfaces due tasks as synthetic `task_run` messages:
//! the event funnel persists the instruction row (pre-allocating the turn
//! id), then the message enters through the same front door as
//! interactive input.

pub mod cron;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;

use fm_domain::config::KernelConfig;
use fm_domain::message::{InboundMessage, MessageKind};
use fm_domain::task::Task;
use fm_domain::Result;

use crate::events::MessageEventService;
use crate::ports::ChannelSink;
use crate::router::MessageRouter;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Task store
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// In-memory registry of scheduled tasks.
#[derive(Default)]
pub struct TaskStore {
    tasks: RwLock<HashMap<String, Task>>,
}

impl TaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a task. A missing `next_run_at` is derived from now, so a
    /// fresh task fires at its next cron boundary rather than immediately.
    pub fn insert(&self, mut task: Task) {
        if task.next_run_at.is_none() {
            let tz = cron::parse_tz(&task.timezone);
            task.next_run_at = cron::next_occurrence(&task.cadence, &Utc::now(), tz);
        }
        self.tasks.write().insert(task.id.clone(), task);
    }

    pub fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().get(task_id).cloned()
    }

    /// All tasks, sorted by name.
    pub fn list(&self) -> Vec<Task> {
        let tasks = self.tasks.read();
        let mut all: Vec<Task> = tasks.values().cloned().collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }

    /// Update a task in place. Returns true if found.
    pub fn update<F>(&self, task_id: &str, f: F) -> bool
    where
        F: FnOnce(&mut Task),
    {
        let mut tasks = self.tasks.write();
        if let Some(task) = tasks.get_mut(task_id) {
            f(task);
            return true;
        }
        false
    }

    /// Enabled tasks whose next run is due at `now`.
    pub fn due(&self, now: &DateTime<Utc>) -> Vec<Task> {
        let tasks = self.tasks.read();
        let mut due: Vec<Task> = tasks
            .values()
            .filter(|t| t.enabled && t.next_run_at.map(|at| at <= *now).unwrap_or(false))
            .cloned()
            .collect();
        due.sort_by(|a, b| a.name.cmp(&b.name));
        due
    }

    /// Record a fire: stamp `last_run_at` and advance `next_run_at`.
    pub fn record_run(&self, task_id: &str, now: &DateTime<Utc>) {
        self.update(task_id, |task| {
            task.last_run_at = Some(*now);
            let tz = cron::parse_tz(&task.timezone);
            task.next_run_at = cron::next_occurrence(&task.cadence, now, tz);
        });
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scheduler
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct Scheduler {
    store: Arc<TaskStore>,
    router: Arc<MessageRouter>,
    events: Arc<MessageEventService>,
    channel: Arc<dyn ChannelSink>,
    config: Arc<KernelConfig>,
}

impl Scheduler {
    pub fn new(
        router: Arc<MessageRouter>,
        events: Arc<MessageEventService>,
        channel: Arc<dyn ChannelSink>,
        config: Arc<KernelConfig>,
    ) -> Self {
        let store = Arc::new(TaskStore::new());
        for task in &config.scheduler.tasks {
            store.insert(task.clone());
        }
        tracing::info!(tasks = store.list().len(), "scheduler loaded");
        Self {
            store,
            router,
            events,
            channel,
            config,
        }
    }

    pub fn tasks(&self) -> &Arc<TaskStore> {
        &self.store
    }

    /// Run the ticker until aborted.
    pub fn spawn(self: Arc<Self>) -> tokio::task::JoinHandle<()> {
        let every = Duration::from_secs(self.config.scheduler.tick_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                self.tick(Utc::now()).await;
            }
        })
    }

    /// Evaluate due tasks once. Each due task fires exactly once per
    /// evaluation; `next_run_at` re-derives from now.
    pub async fn tick(&self, now: DateTime<Utc>) {
        for task in self.store.due(&now) {
            tracing::info!(task_id = %task.id, name = %task.name, "scheduled task due");
            if let Err(e) = self.fire(&task).await {
                tracing::error!(error = %e, task_id = %task.id, "scheduled task dispatch failed");
            }
            self.store.record_run(&task.id, &now);
        }
    }

    /// Synthesize the `task_run` message and push it through the front
    /// door. The persisted row carries the pre-allocated turn id.
    async fn fire(&self, task: &Task) -> Result<()> {
        let conversation_id = task
            .config
            .conversation_id
            .clone()
            .unwrap_or_else(|| self.config.scheduler.default_conversation.clone());

        let row = self
            .events
            .emit_task_run_event(task, &conversation_id, &self.channel)
            .await?;

        let allowed_tools = if task.config.allowed_tools.is_empty() {
            None
        } else {
            Some(task.config.allowed_tools.clone())
        };

        self.router.deliver(InboundMessage {
            id: row.id.clone(),
            text: row.content.clone(),
            conversation_id: Some(conversation_id),
            turn_id: row.meta.turn_id.clone(),
            kind: MessageKind::TaskRun,
            allowed_tools,
            agent_command: None,
            attachments: Vec::new(),
        });
        Ok(())
    }
}
