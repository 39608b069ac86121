//! Conversation and message records: the persisted data model, plus the
//! normalized ingress envelope that channel adapters and the scheduler
//! deliver to the kernel.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::citation::CitationSource;
use crate::llm::{Role, TurnUsage};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel tags
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Conversation routing tags. Metadata only; the kernel reads them to
/// pick a supervisor and never writes them.
pub mod channel_tag {
    pub const MISSION: &str = "mission";
    pub const PILLAR: &str = "pillar";
    pub const PILLAR_TODO: &str = "pillar-todo";
    pub const METRIC_COLLECTION: &str = "metric-collection";
    pub const WEB: &str = "web";

    /// Tags handled by the mission-lead supervisor rather than the default.
    pub fn is_mission_led(tag: &str) -> bool {
        matches!(tag, MISSION | PILLAR)
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Conversation
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    pub title: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deleted_at: Option<DateTime<Utc>>,
    /// Set once a user (or the model, via explicit rename) names the
    /// conversation; suppresses auto-naming.
    #[serde(default)]
    pub manually_named: bool,
    /// Routing tag, see [`channel_tag`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_tag: Option<String>,
    /// Well-known conversations have fixed ids reserved for scheduled and
    /// system activity. They cannot be renamed or deleted.
    #[serde(default)]
    pub well_known: bool,
}

impl Conversation {
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            title: title.into(),
            created_at: now,
            updated_at: now,
            deleted_at: None,
            manually_named: false,
            channel_tag: None,
            well_known: false,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stored messages
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Logical kind of a persisted message, carried in metadata. Rows whose
/// kind is not `Chat` are excluded from the model-visible history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    #[default]
    Chat,
    Delegation,
    TaskRun,
    ToolEvent,
    Error,
}

/// Delegation parameters recorded on a delegation event row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegationInfo {
    /// Assignment id, one per delegation, used for idempotent emission.
    pub task_id: String,
    pub agent_type: String,
    pub agent_id: String,
    pub mission: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rationale: Option<String>,
}

/// Metadata attached to every persisted message.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct MessageMeta {
    #[serde(default)]
    pub kind: MessageKind,
    /// The turn this row belongs to. Every assistant row and every event
    /// row carries it; user rows carry it when pre-allocated (task runs).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub citations: Vec<CitationSource>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<TurnUsage>,
    /// Attachment names only; payloads never enter the store.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delegation: Option<DelegationInfo>,
    /// Raw tool event payload for `ToolEvent` rows.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_event: Option<serde_json::Value>,
    /// Tool names permitted for this turn (task runs). Empty = unrestricted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub allowed_tools: Vec<String>,
}

/// An append-only persisted message row.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredMessage {
    pub id: String,
    pub conversation_id: String,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub meta: MessageMeta,
    pub created_at: DateTime<Utc>,
}

impl StoredMessage {
    pub fn new(
        conversation_id: impl Into<String>,
        role: Role,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            conversation_id: conversation_id.into(),
            role,
            content: content.into(),
            meta: MessageMeta::default(),
            created_at: Utc::now(),
        }
    }

    /// Whether this row is part of the model-visible history.
    ///
    /// Tool, delegation, task-run, and error rows are bookkeeping: tool
    /// output reaches the model inline as structured blocks, never as
    /// conversation turns.
    pub fn llm_visible(&self) -> bool {
        matches!(self.role, Role::User | Role::Assistant) && self.meta.kind == MessageKind::Chat
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Ingress envelope
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A command shortcut attached by a channel adapter (`/research …`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCommand {
    pub command: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub args: Option<String>,
}

/// The normalized envelope delivered to the kernel by a channel adapter or
/// by the scheduler. One envelope kicks off at most one turn.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    pub id: String,
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<String>,
    /// Pre-allocated turn id (scheduler). Interactive messages leave this
    /// unset and the message id becomes the turn id.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub turn_id: Option<String>,
    #[serde(default)]
    pub kind: MessageKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tools: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_command: Option<AgentCommand>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub attachments: Vec<String>,
}

impl InboundMessage {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            text: text.into(),
            conversation_id: None,
            turn_id: None,
            kind: MessageKind::Chat,
            allowed_tools: None,
            agent_command: None,
            attachments: Vec::new(),
        }
    }

    pub fn in_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    pub fn is_task_run(&self) -> bool {
        self.kind == MessageKind::TaskRun
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mission_led_tags() {
        assert!(channel_tag::is_mission_led(channel_tag::MISSION));
        assert!(channel_tag::is_mission_led(channel_tag::PILLAR));
        assert!(!channel_tag::is_mission_led(channel_tag::PILLAR_TODO));
        assert!(!channel_tag::is_mission_led(channel_tag::WEB));
        assert!(!channel_tag::is_mission_led("nonsense"));
    }

    #[test]
    fn chat_rows_are_llm_visible() {
        let msg = StoredMessage::new("c1", Role::User, "hi");
        assert!(msg.llm_visible());
    }

    #[test]
    fn tool_role_rows_are_hidden() {
        let mut msg = StoredMessage::new("c1", Role::Tool, "{}");
        msg.meta.kind = MessageKind::ToolEvent;
        assert!(!msg.llm_visible());
    }

    #[test]
    fn delegation_and_task_run_rows_are_hidden() {
        let mut msg = StoredMessage::new("c1", Role::Assistant, "delegating");
        msg.meta.kind = MessageKind::Delegation;
        assert!(!msg.llm_visible());

        let mut msg = StoredMessage::new("c1", Role::User, "run task");
        msg.meta.kind = MessageKind::TaskRun;
        assert!(!msg.llm_visible());
    }

    #[test]
    fn meta_round_trips_with_sparse_fields() {
        let meta = MessageMeta {
            kind: MessageKind::Delegation,
            turn_id: Some("t1".into()),
            ..Default::default()
        };
        let json = serde_json::to_string(&meta).unwrap();
        assert!(!json.contains("agent_emoji"));
        let back: MessageMeta = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, MessageKind::Delegation);
        assert_eq!(back.turn_id.as_deref(), Some("t1"));
    }
}
