//! The message event funnel.
//!
//! Every observable step of a turn (tool activity, delegations, task
//! runs, errors, and the chat messages themselves) is persisted and
//! broadcast through this service, and nowhere else. That single path is
//! what keeps `conversation_id`/`turn_id` tagging consistent across the
//! kernel.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;

use fm_domain::citation::CitationData;
use fm_domain::llm::{Role, TurnUsage};
use fm_domain::message::{
    DelegationInfo, InboundMessage, MessageKind, StoredMessage,
};
use fm_domain::task::Task;
use fm_domain::{Error, Result};
use fm_store::ConversationStore;

use crate::agent::AgentIdentity;
use crate::ports::{caller_id, BroadcastEvent, ChannelSink, ToolEvent, ToolEventKind};

pub struct MessageEventService {
    store: Arc<dyn ConversationStore>,
    /// `(event id, kind)` pairs already emitted; re-emission is a no-op.
    seen_events: Mutex<HashSet<String>>,
    /// Per-conversation persisted-write counters (auto-naming threshold).
    message_counts: Mutex<HashMap<String, u64>>,
}

impl MessageEventService {
    pub fn new(store: Arc<dyn ConversationStore>) -> Self {
        Self {
            store,
            seen_events: Mutex::new(HashSet::new()),
            message_counts: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    /// Persisted writes observed for a conversation since process start.
    pub fn message_count(&self, conversation_id: &str) -> u64 {
        *self
            .message_counts
            .lock()
            .get(conversation_id)
            .unwrap_or(&0)
    }

    /// Persist a row and broadcast it. All emit paths funnel through here.
    ///
    /// A persistence failure is logged and the unpersisted row is returned
    /// as-is: the turn keeps its in-memory view and the caller is not
    /// interrupted.
    async fn persist_and_broadcast(
        &self,
        message: StoredMessage,
        channel: &Arc<dyn ChannelSink>,
    ) -> Result<StoredMessage> {
        let conversation_id = message.conversation_id.clone();
        let stored = match self.store.create_message(message.clone()).await {
            Ok(stored) => stored,
            Err(e) => {
                tracing::error!(
                    error = %e,
                    conversation_id = %conversation_id,
                    "failed to persist message"
                );
                message
            }
        };

        *self
            .message_counts
            .lock()
            .entry(conversation_id)
            .or_insert(0) += 1;

        if let Err(e) = channel
            .broadcast(BroadcastEvent::MessageCreated {
                message: stored.clone(),
            })
            .await
        {
            tracing::warn!(error = %e, "message broadcast failed");
        }
        Ok(stored)
    }

    fn event_key(event_id: &str, kind: &str) -> String {
        format!("{event_id}:{kind}")
    }

    /// Record `(id, kind)`; returns false when it was already emitted.
    fn first_emission(&self, event_id: &str, kind: &str) -> bool {
        self.seen_events
            .lock()
            .insert(Self::event_key(event_id, kind))
    }

    // ── Tool events ───────────────────────────────────────────────

    /// Persist + broadcast a tool event observed by `agent`'s turn.
    ///
    /// Events whose `caller_id` does not match the subscribing
    /// `(agent, conversation)` pair are dropped; several turns share one
    /// tool runner, and this filter is what prevents cross-turn echo.
    /// Idempotent by `(event.id, event.kind)`.
    pub async fn emit_tool_event(
        &self,
        event: &ToolEvent,
        conversation_id: &str,
        agent: &AgentIdentity,
        turn_id: &str,
        channel: &Arc<dyn ChannelSink>,
    ) -> Result<Option<StoredMessage>> {
        if event.caller_id != caller_id(&agent.id, conversation_id) {
            tracing::debug!(
                event_id = %event.id,
                caller_id = %event.caller_id,
                "dropping tool event for another caller"
            );
            return Ok(None);
        }

        let kind_label = match event.kind {
            ToolEventKind::Started => "started",
            ToolEventKind::Finished => "finished",
        };
        if !self.first_emission(&event.id, kind_label) {
            return Ok(None);
        }

        let mut row = StoredMessage::new(
            conversation_id,
            Role::Tool,
            format!("{} {}", event.tool_name, kind_label),
        );
        row.meta.kind = MessageKind::ToolEvent;
        row.meta.turn_id = Some(turn_id.to_string());
        row.meta.tool_event = Some(event.payload.clone());
        agent.stamp(&mut row.meta);

        self.persist_and_broadcast(row, channel).await.map(Some)
    }

    // ── Delegation events ─────────────────────────────────────────

    /// Persist + broadcast a delegation. Exactly one row per assignment:
    /// retries with the same `task_id` are no-ops.
    pub async fn emit_delegation_event(
        &self,
        info: &DelegationInfo,
        conversation_id: &str,
        turn_id: &str,
        channel: &Arc<dyn ChannelSink>,
    ) -> Result<Option<StoredMessage>> {
        if !self.first_emission(&info.task_id, "delegation") {
            return Ok(None);
        }

        let mut row = StoredMessage::new(
            conversation_id,
            Role::Assistant,
            format!("Delegating to {}: {}", info.agent_type, info.mission),
        );
        row.meta.kind = MessageKind::Delegation;
        row.meta.turn_id = Some(turn_id.to_string());
        row.meta.agent_id = Some(info.agent_id.clone());
        row.meta.agent_type = Some(info.agent_type.clone());
        row.meta.delegation = Some(info.clone());

        self.persist_and_broadcast(row, channel).await.map(Some)
    }

    // ── Task-run events ───────────────────────────────────────────

    /// Persist the synthetic user message for a due scheduled task.
    ///
    /// Pre-allocates the `turn_id` so everything downstream of the
    /// scheduler can reference it; the returned row carries it in
    /// metadata.
    pub async fn emit_task_run_event(
        &self,
        task: &Task,
        conversation_id: &str,
        channel: &Arc<dyn ChannelSink>,
    ) -> Result<StoredMessage> {
        let turn_id = uuid::Uuid::new_v4().to_string();

        let config = serde_json::to_string(&task.config)?;
        let mut row = StoredMessage::new(
            conversation_id,
            Role::User,
            format!(
                "Scheduled task \"{}\" is due. Carry it out now.\nTask config: {config}",
                task.name
            ),
        );
        row.meta.kind = MessageKind::TaskRun;
        row.meta.turn_id = Some(turn_id);
        row.meta.allowed_tools = task.config.allowed_tools.clone();

        self.persist_and_broadcast(row, channel).await
    }

    // ── Error events ──────────────────────────────────────────────

    /// Surface a sanitized error to the channel and persist an error row.
    /// Full details go to the log only.
    pub async fn emit_error_event(
        &self,
        err: &Error,
        conversation_id: &str,
        turn_id: &str,
        channel: &Arc<dyn ChannelSink>,
    ) {
        tracing::error!(
            error = %err,
            conversation_id = %conversation_id,
            turn_id = %turn_id,
            "turn failed"
        );

        let sanitized = err.sanitized();
        if let Err(e) = channel
            .send_error("Agent error", &sanitized, conversation_id)
            .await
        {
            tracing::warn!(error = %e, "error broadcast failed");
        }

        let mut row = StoredMessage::new(conversation_id, Role::System, sanitized);
        row.meta.kind = MessageKind::Error;
        row.meta.turn_id = Some(turn_id.to_string());
        let _ = self.persist_and_broadcast(row, channel).await;
    }

    // ── Chat rows ─────────────────────────────────────────────────

    /// Persist the inbound user message (idempotent on its id).
    pub async fn save_user(
        &self,
        inbound: &InboundMessage,
        conversation_id: &str,
        channel: &Arc<dyn ChannelSink>,
    ) -> Result<StoredMessage> {
        let mut row = StoredMessage::new(conversation_id, Role::User, inbound.text.clone());
        row.id = inbound.id.clone();
        row.meta.kind = inbound.kind;
        row.meta.turn_id = inbound.turn_id.clone();
        row.meta.attachments = inbound.attachments.clone();
        self.persist_and_broadcast(row, channel).await
    }

    /// Canonical write path for assistant output. Every streamed or final
    /// assistant message lands here.
    #[allow(clippy::too_many_arguments)]
    pub async fn save_assistant(
        &self,
        content: &str,
        conversation_id: &str,
        turn_id: &str,
        agent: &AgentIdentity,
        citations: Option<&CitationData>,
        usage: Option<&TurnUsage>,
        channel: &Arc<dyn ChannelSink>,
    ) -> Result<StoredMessage> {
        let mut row = StoredMessage::new(conversation_id, Role::Assistant, content);
        row.meta.turn_id = Some(turn_id.to_string());
        agent.stamp(&mut row.meta);
        if let Some(data) = citations {
            row.meta.citations = data.cited().cloned().collect();
        }
        if let Some(usage) = usage {
            row.meta.usage = Some(usage.clone());
        }
        self.persist_and_broadcast(row, channel).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingChannel;
    use fm_store::MemoryStore;

    fn service() -> (Arc<MessageEventService>, Arc<dyn ChannelSink>) {
        let store = Arc::new(MemoryStore::new());
        let channel: Arc<dyn ChannelSink> = Arc::new(RecordingChannel::new());
        (Arc::new(MessageEventService::new(store)), channel)
    }

    fn agent() -> AgentIdentity {
        AgentIdentity {
            id: "sup-1".into(),
            agent_type: "supervisor".into(),
            name: "Supervisor".into(),
            emoji: "🧭".into(),
        }
    }

    fn tool_event(caller: &str) -> ToolEvent {
        ToolEvent {
            id: "ev-1".into(),
            kind: ToolEventKind::Finished,
            caller_id: caller.into(),
            tool_name: "web_search".into(),
            payload: serde_json::json!({"query": "x"}),
        }
    }

    #[tokio::test]
    async fn tool_event_persists_with_turn_tagging() {
        let (svc, channel) = service();
        let row = svc
            .emit_tool_event(&tool_event("sup-1:c1"), "c1", &agent(), "t1", &channel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(row.meta.kind, MessageKind::ToolEvent);
        assert_eq!(row.meta.turn_id.as_deref(), Some("t1"));
        assert_eq!(row.conversation_id, "c1");
        assert_eq!(row.role, Role::Tool);
    }

    #[tokio::test]
    async fn tool_event_with_foreign_caller_is_dropped() {
        let (svc, channel) = service();
        let row = svc
            .emit_tool_event(
                &tool_event("other-agent:c1"),
                "c1",
                &agent(),
                "t1",
                &channel,
            )
            .await
            .unwrap();
        assert!(row.is_none());
        assert_eq!(svc.message_count("c1"), 0);
    }

    #[tokio::test]
    async fn tool_event_is_idempotent_by_id_and_kind() {
        let (svc, channel) = service();
        let ev = tool_event("sup-1:c1");
        assert!(svc
            .emit_tool_event(&ev, "c1", &agent(), "t1", &channel)
            .await
            .unwrap()
            .is_some());
        assert!(svc
            .emit_tool_event(&ev, "c1", &agent(), "t1", &channel)
            .await
            .unwrap()
            .is_none());

        // Same id, different kind is a distinct event.
        let mut started = ev.clone();
        started.kind = ToolEventKind::Started;
        assert!(svc
            .emit_tool_event(&started, "c1", &agent(), "t1", &channel)
            .await
            .unwrap()
            .is_some());
    }

    #[tokio::test]
    async fn delegation_event_is_exactly_once_per_task() {
        let (svc, channel) = service();
        let info = DelegationInfo {
            task_id: "task-1".into(),
            agent_type: "writer".into(),
            agent_id: "writer-abc".into(),
            mission: "write a sonnet".into(),
            rationale: None,
        };
        assert!(svc
            .emit_delegation_event(&info, "c1", "t1", &channel)
            .await
            .unwrap()
            .is_some());
        assert!(svc
            .emit_delegation_event(&info, "c1", "t1", &channel)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn task_run_event_preallocates_turn_id() {
        let (svc, channel) = service();
        let task = Task::new("digest", "0 7 * * *");
        let row = svc.emit_task_run_event(&task, "feed", &channel).await.unwrap();
        assert_eq!(row.meta.kind, MessageKind::TaskRun);
        assert!(row.meta.turn_id.is_some());
        assert!(row.content.contains("digest"));
    }

    #[tokio::test]
    async fn save_user_is_idempotent_on_message_id() {
        let (svc, channel) = service();
        let inbound = InboundMessage::user("hello");
        svc.save_user(&inbound, "c1", &channel).await.unwrap();
        svc.save_user(&inbound, "c1", &channel).await.unwrap();
        let rows = svc
            .store()
            .find_by_conversation("c1", Default::default())
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn save_assistant_records_identity_and_usage() {
        let (svc, channel) = service();
        let usage = TurnUsage {
            total_tokens: 42,
            ..Default::default()
        };
        let row = svc
            .save_assistant("answer", "c1", "t1", &agent(), None, Some(&usage), &channel)
            .await
            .unwrap();
        assert_eq!(row.meta.agent_id.as_deref(), Some("sup-1"));
        assert_eq!(row.meta.usage.as_ref().unwrap().total_tokens, 42);
        assert!(row.llm_visible());
    }

    #[tokio::test]
    async fn message_counts_accumulate_per_conversation() {
        let (svc, channel) = service();
        svc.save_user(&InboundMessage::user("a"), "c1", &channel)
            .await
            .unwrap();
        svc.save_user(&InboundMessage::user("b"), "c1", &channel)
            .await
            .unwrap();
        svc.save_user(&InboundMessage::user("c"), "c2", &channel)
            .await
            .unwrap();
        assert_eq!(svc.message_count("c1"), 2);
        assert_eq!(svc.message_count("c2"), 1);
        assert_eq!(svc.message_count("ghost"), 0);
    }
}
