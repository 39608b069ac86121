//! The repository interface the kernel persists through.
//!
//! One trait covers conversations, messages, turn todos, and the small
//! watermarked signal table; the kernel holds it as `Arc<dyn
//! ConversationStore>` and never assumes a backend.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use fm_domain::message::{Conversation, StoredMessage};
use fm_domain::todo::{TodoCounts, TodoStatus, TurnTodo};
use fm_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Query/patch records
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Pagination options for message queries.
///
/// `cursor` takes precedence over `offset`: it is the id of the last
/// message of the previous page, and the query resumes strictly after it
/// in `(created_at, id)` order.
#[derive(Debug, Clone, Default)]
pub struct ListOptions {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub cursor: Option<String>,
}

impl ListOptions {
    pub fn limit(n: usize) -> Self {
        Self {
            limit: Some(n),
            ..Default::default()
        }
    }
}

/// One page of messages plus the cursor for the next page (None = end).
#[derive(Debug, Clone)]
pub struct MessagePage {
    pub messages: Vec<StoredMessage>,
    pub next_cursor: Option<String>,
}

/// Partial update of a conversation. `updated_at` is always touched.
#[derive(Debug, Clone, Default)]
pub struct ConversationPatch {
    pub title: Option<String>,
    pub manually_named: Option<bool>,
    pub channel_tag: Option<String>,
}

impl ConversationPatch {
    /// A timestamp-only touch.
    pub fn touch() -> Self {
        Self::default()
    }

    pub fn rename(title: impl Into<String>) -> Self {
        Self {
            title: Some(title.into()),
            ..Default::default()
        }
    }
}

/// Partial update of a turn todo.
#[derive(Debug, Clone, Default)]
pub struct TodoPatch {
    pub status: Option<TodoStatus>,
    pub outcome: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TodoPatch {
    pub fn start() -> Self {
        Self {
            status: Some(TodoStatus::InProgress),
            started_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn complete(outcome: impl Into<String>) -> Self {
        Self {
            status: Some(TodoStatus::Completed),
            outcome: Some(outcome.into()),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }

    pub fn cancel() -> Self {
        Self {
            status: Some(TodoStatus::Cancelled),
            completed_at: Some(Utc::now()),
            ..Default::default()
        }
    }
}

/// A row in the watermarked append table for auxiliary signals.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Signal {
    /// Monotonic sequence number; the watermark.
    pub seq: u64,
    pub kind: String,
    pub payload: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Repository trait
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait ConversationStore: Send + Sync {
    // ── Conversations ─────────────────────────────────────────────

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation>;

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>>;

    /// Most recently updated, non-deleted, non-well-known conversation
    /// touched within `window`.
    async fn find_recent(&self, window: Duration) -> Result<Option<Conversation>>;

    /// Non-deleted conversations, newest-updated first.
    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>>;

    /// Apply a patch and touch `updated_at`. Renaming or un-tagging a
    /// well-known conversation is rejected.
    async fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> Result<Conversation>;

    /// Soft delete. Rejected for well-known conversations.
    async fn soft_delete_conversation(&self, id: &str) -> Result<()>;

    // ── Messages ──────────────────────────────────────────────────

    /// Append a message. Idempotent on id: inserting an id that already
    /// exists is a no-op returning the stored row.
    async fn create_message(&self, message: StoredMessage) -> Result<StoredMessage>;

    async fn find_message(&self, id: &str) -> Result<Option<StoredMessage>>;

    /// Messages of one conversation in `(created_at, id)` order.
    async fn find_by_conversation(
        &self,
        conversation_id: &str,
        opts: ListOptions,
    ) -> Result<Vec<StoredMessage>>;

    /// Cursor-paginated variant of [`find_by_conversation`].
    ///
    /// [`find_by_conversation`]: ConversationStore::find_by_conversation
    async fn find_by_conversation_paginated(
        &self,
        conversation_id: &str,
        opts: ListOptions,
    ) -> Result<MessagePage>;

    /// Case-insensitive substring search over message content.
    async fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<StoredMessage>>;

    /// Remove all messages of a conversation. Returns the removed count.
    async fn delete_by_conversation(&self, conversation_id: &str) -> Result<u64>;

    // ── Turn todos ────────────────────────────────────────────────

    async fn create_todo(&self, todo: TurnTodo) -> Result<TurnTodo>;

    async fn todos_for_turn(&self, turn_id: &str) -> Result<Vec<TurnTodo>>;

    async fn todo_counts(&self, turn_id: &str) -> Result<TodoCounts>;

    async fn update_todo(&self, id: &str, patch: TodoPatch) -> Result<TurnTodo>;

    // ── Watermarked signals ───────────────────────────────────────

    /// Append an auxiliary signal; returns its sequence number.
    async fn append_signal(&self, kind: &str, payload: serde_json::Value) -> Result<u64>;

    /// Signals strictly after the given watermark, oldest first.
    async fn signals_after(&self, watermark: u64, limit: usize) -> Result<Vec<Signal>>;
}
