//! In-memory reference implementation of [`ConversationStore`].
//!
//! Thread-safe behind `parking_lot` locks; ordering and idempotency
//! semantics match what a SQL-backed implementation would provide. The
//! single-writer-per-conversation invariant is the caller's obligation.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::RwLock;

use fm_domain::message::{Conversation, StoredMessage};
use fm_domain::todo::{TodoCounts, TodoStatus, TurnTodo};
use fm_domain::{Error, Result};

use crate::store::{
    ConversationPatch, ConversationStore, ListOptions, MessagePage, Signal, TodoPatch,
};

#[derive(Default)]
struct Inner {
    conversations: HashMap<String, Conversation>,
    /// Append-only; queried in `(created_at, id)` order.
    messages: Vec<StoredMessage>,
    todos: HashMap<String, TurnTodo>,
    signals: Vec<Signal>,
    signal_seq: u64,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a well-known conversation (fixed id, protected from rename and
    /// delete). Idempotent.
    pub fn seed_well_known(&self, id: &str, title: &str) {
        let mut inner = self.inner.write();
        inner.conversations.entry(id.to_string()).or_insert_with(|| {
            let mut conversation = Conversation::new(id, title);
            conversation.well_known = true;
            conversation
        });
    }

    fn sorted_for_conversation(inner: &Inner, conversation_id: &str) -> Vec<StoredMessage> {
        let mut rows: Vec<StoredMessage> = inner
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        rows
    }

    fn apply_window(rows: Vec<StoredMessage>, opts: &ListOptions) -> Vec<StoredMessage> {
        let start = match &opts.cursor {
            Some(cursor) => rows
                .iter()
                .position(|m| &m.id == cursor)
                .map(|i| i + 1)
                .unwrap_or(0),
            None => opts.offset.unwrap_or(0),
        };
        rows.into_iter()
            .skip(start)
            .take(opts.limit.unwrap_or(usize::MAX))
            .collect()
    }
}

#[async_trait]
impl ConversationStore for MemoryStore {
    // ── Conversations ─────────────────────────────────────────────

    async fn create_conversation(&self, conversation: Conversation) -> Result<Conversation> {
        let mut inner = self.inner.write();
        inner
            .conversations
            .insert(conversation.id.clone(), conversation.clone());
        Ok(conversation)
    }

    async fn find_conversation(&self, id: &str) -> Result<Option<Conversation>> {
        Ok(self.inner.read().conversations.get(id).cloned())
    }

    async fn find_recent(&self, window: Duration) -> Result<Option<Conversation>> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        let inner = self.inner.read();
        Ok(inner
            .conversations
            .values()
            .filter(|c| !c.is_deleted() && !c.well_known && c.updated_at >= cutoff)
            .max_by_key(|c| c.updated_at)
            .cloned())
    }

    async fn list_conversations(&self, limit: usize) -> Result<Vec<Conversation>> {
        let inner = self.inner.read();
        let mut all: Vec<Conversation> = inner
            .conversations
            .values()
            .filter(|c| !c.is_deleted())
            .cloned()
            .collect();
        all.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        all.truncate(limit);
        Ok(all)
    }

    async fn update_conversation(
        &self,
        id: &str,
        patch: ConversationPatch,
    ) -> Result<Conversation> {
        let mut inner = self.inner.write();
        let conversation = inner
            .conversations
            .get_mut(id)
            .ok_or_else(|| Error::Store(format!("conversation not found: {id}")))?;

        if conversation.well_known && patch.title.is_some() {
            return Err(Error::Store(format!(
                "well-known conversation cannot be renamed: {id}"
            )));
        }

        if let Some(title) = patch.title {
            conversation.title = title;
        }
        if let Some(manually_named) = patch.manually_named {
            conversation.manually_named = manually_named;
        }
        if let Some(tag) = patch.channel_tag {
            conversation.channel_tag = Some(tag);
        }
        conversation.updated_at = Utc::now();
        Ok(conversation.clone())
    }

    async fn soft_delete_conversation(&self, id: &str) -> Result<()> {
        let mut inner = self.inner.write();
        let conversation = inner
            .conversations
            .get_mut(id)
            .ok_or_else(|| Error::Store(format!("conversation not found: {id}")))?;
        if conversation.well_known {
            return Err(Error::Store(format!(
                "well-known conversation cannot be deleted: {id}"
            )));
        }
        conversation.deleted_at = Some(Utc::now());
        Ok(())
    }

    // ── Messages ──────────────────────────────────────────────────

    async fn create_message(&self, message: StoredMessage) -> Result<StoredMessage> {
        let mut inner = self.inner.write();
        if let Some(existing) = inner.messages.iter().find(|m| m.id == message.id) {
            return Ok(existing.clone());
        }
        inner.messages.push(message.clone());
        Ok(message)
    }

    async fn find_message(&self, id: &str) -> Result<Option<StoredMessage>> {
        Ok(self
            .inner
            .read()
            .messages
            .iter()
            .find(|m| m.id == id)
            .cloned())
    }

    async fn find_by_conversation(
        &self,
        conversation_id: &str,
        opts: ListOptions,
    ) -> Result<Vec<StoredMessage>> {
        let inner = self.inner.read();
        let rows = Self::sorted_for_conversation(&inner, conversation_id);
        Ok(Self::apply_window(rows, &opts))
    }

    async fn find_by_conversation_paginated(
        &self,
        conversation_id: &str,
        opts: ListOptions,
    ) -> Result<MessagePage> {
        let inner = self.inner.read();
        let all = Self::sorted_for_conversation(&inner, conversation_id);
        let tail_id = all.last().map(|m| m.id.clone());
        let page = Self::apply_window(all, &opts);

        // There is a next page iff the last returned row is not the last
        // row of the conversation.
        let next_cursor = match (page.last(), tail_id) {
            (Some(last), Some(tail)) if last.id != tail => Some(last.id.clone()),
            _ => None,
        };

        Ok(MessagePage {
            messages: page,
            next_cursor,
        })
    }

    async fn search_messages(&self, query: &str, limit: usize) -> Result<Vec<StoredMessage>> {
        let needle = query.to_lowercase();
        let inner = self.inner.read();
        Ok(inner
            .messages
            .iter()
            .filter(|m| m.content.to_lowercase().contains(&needle))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn delete_by_conversation(&self, conversation_id: &str) -> Result<u64> {
        let mut inner = self.inner.write();
        let before = inner.messages.len();
        inner.messages.retain(|m| m.conversation_id != conversation_id);
        Ok((before - inner.messages.len()) as u64)
    }

    // ── Turn todos ────────────────────────────────────────────────

    async fn create_todo(&self, todo: TurnTodo) -> Result<TurnTodo> {
        let mut inner = self.inner.write();
        inner.todos.insert(todo.id.clone(), todo.clone());
        Ok(todo)
    }

    async fn todos_for_turn(&self, turn_id: &str) -> Result<Vec<TurnTodo>> {
        let inner = self.inner.read();
        let mut todos: Vec<TurnTodo> = inner
            .todos
            .values()
            .filter(|t| t.turn_id == turn_id)
            .cloned()
            .collect();
        todos.sort_by(|a, b| (a.created_at, &a.id).cmp(&(b.created_at, &b.id)));
        Ok(todos)
    }

    async fn todo_counts(&self, turn_id: &str) -> Result<TodoCounts> {
        let inner = self.inner.read();
        let mut counts = TodoCounts::default();
        for todo in inner.todos.values().filter(|t| t.turn_id == turn_id) {
            match todo.status {
                TodoStatus::Pending => counts.pending += 1,
                TodoStatus::InProgress => counts.in_progress += 1,
                TodoStatus::Completed => counts.completed += 1,
                TodoStatus::Cancelled => counts.cancelled += 1,
            }
        }
        Ok(counts)
    }

    async fn update_todo(&self, id: &str, patch: TodoPatch) -> Result<TurnTodo> {
        let mut inner = self.inner.write();
        let todo = inner
            .todos
            .get_mut(id)
            .ok_or_else(|| Error::Store(format!("todo not found: {id}")))?;
        if let Some(status) = patch.status {
            todo.status = status;
        }
        if let Some(outcome) = patch.outcome {
            todo.outcome = Some(outcome);
        }
        if let Some(started_at) = patch.started_at {
            todo.started_at = Some(started_at);
        }
        if let Some(completed_at) = patch.completed_at {
            todo.completed_at = Some(completed_at);
        }
        Ok(todo.clone())
    }

    // ── Watermarked signals ───────────────────────────────────────

    async fn append_signal(&self, kind: &str, payload: serde_json::Value) -> Result<u64> {
        let mut inner = self.inner.write();
        inner.signal_seq += 1;
        let seq = inner.signal_seq;
        inner.signals.push(Signal {
            seq,
            kind: kind.to_string(),
            payload,
            created_at: Utc::now(),
        });
        Ok(seq)
    }

    async fn signals_after(&self, watermark: u64, limit: usize) -> Result<Vec<Signal>> {
        let inner = self.inner.read();
        Ok(inner
            .signals
            .iter()
            .filter(|s| s.seq > watermark)
            .take(limit)
            .cloned()
            .collect())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
