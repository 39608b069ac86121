//! Collaborator interfaces the kernel consumes.
//!
//! The kernel never implements a model provider, a tool backend, or a wire
//! protocol; it talks to them through these traits. Hosts inject
//! implementations at construction time; `crate::testing` provides
//! scripted fakes.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;

use fm_domain::citation::{CitationData, CitationSource};
use fm_domain::config::ToolPolicy;
use fm_domain::llm::{ChatRequest, EventStream, ToolDescriptor, TurnUsage};
use fm_domain::message::{Conversation, InboundMessage, StoredMessage};
use fm_domain::Result;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Turn context
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallPurpose {
    Chat,
    /// Background conversation auto-naming; uncounted in turn usage.
    Naming,
    /// Direct fallback answer after a failed delegation.
    Fallback,
}

/// Request-scoped correlation passed explicitly through every model and
/// tool call. Lives on the turn's stack so concurrent turns cannot leak
/// ids into each other.
#[derive(Debug, Clone)]
pub struct TurnContext {
    pub trace_id: String,
    pub span_id: String,
    pub conversation_id: String,
    pub turn_id: String,
    pub purpose: CallPurpose,
}

/// The `agentId:conversationId` tag that routes tool events to the
/// subscriber that actually issued the calls.
pub fn caller_id(agent_id: &str, conversation_id: &str) -> String {
    format!("{agent_id}:{conversation_id}")
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Model client
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Stream one generation with tools.
    async fn chat_stream(&self, request: ChatRequest, ctx: &TurnContext) -> Result<EventStream>;

    /// One-shot, non-streamed completion (auto-naming, fallback answers).
    async fn complete_text(&self, prompt: &str, ctx: &TurnContext) -> Result<String>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Channel sink
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Identity shown alongside a stream.
#[derive(Debug, Clone, Serialize)]
pub struct StreamMeta {
    pub agent_id: String,
    pub agent_name: String,
    pub agent_emoji: String,
    pub conversation_id: String,
}

/// Payload closing a stream.
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamClose {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub citations: Option<CitationData>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TurnUsage>,
}

/// Conversation lifecycle notifications fanned out to channel subscribers.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BroadcastEvent {
    ConversationCreated { conversation: Conversation },
    ConversationUpdated { conversation: Conversation },
    MessageCreated { message: StoredMessage },
}

pub type IngressHandler = Arc<dyn Fn(InboundMessage) + Send + Sync>;

#[async_trait]
pub trait ChannelSink: Send + Sync {
    async fn send_stream_start(&self, stream_id: &str, meta: StreamMeta) -> Result<()>;

    async fn send_stream_chunk(
        &self,
        stream_id: &str,
        text: &str,
        conversation_id: &str,
    ) -> Result<()>;

    async fn send_stream_end(&self, stream_id: &str, close: StreamClose) -> Result<()>;

    /// Sanitized error surface. Full details never travel through here.
    async fn send_error(&self, title: &str, details: &str, conversation_id: &str) -> Result<()>;

    async fn broadcast(&self, event: BroadcastEvent) -> Result<()>;

    /// Register the ingress handler. Called once by the router.
    fn on_message(&self, handler: IngressHandler);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Correlation metadata attached to every tool request.
#[derive(Debug, Clone, Default)]
pub struct RequestContext {
    pub trace_id: Option<String>,
    pub conversation_id: Option<String>,
    pub turn_id: Option<String>,
    pub agent_id: Option<String>,
}

impl RequestContext {
    pub fn from_turn(ctx: &TurnContext, agent_id: &str) -> Self {
        Self {
            trace_id: Some(ctx.trace_id.clone()),
            conversation_id: Some(ctx.conversation_id.clone()),
            turn_id: Some(ctx.turn_id.clone()),
            agent_id: Some(agent_id.to_string()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ToolRequest {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
    pub caller_id: String,
    pub context: RequestContext,
}

/// Result of one executed tool call.
#[derive(Debug, Clone)]
pub struct ToolOutcome {
    pub call_id: String,
    pub tool_name: String,
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
}

/// Result of one executed batch.
#[derive(Debug, Clone, Default)]
pub struct ToolBatch {
    pub results: Vec<ToolOutcome>,
    pub citations: Vec<CitationSource>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolEventKind {
    Started,
    Finished,
}

/// An execution event published by the tool runner. `caller_id` routes it
/// to the turn that issued the call when several turns share one runner.
#[derive(Debug, Clone, Serialize)]
pub struct ToolEvent {
    pub id: String,
    pub kind: ToolEventKind,
    pub caller_id: String,
    pub tool_name: String,
    pub payload: serde_json::Value,
}

pub type ToolEventListener = Arc<dyn Fn(&ToolEvent) + Send + Sync>;

/// Guard for a tool-event subscription; dropping it (or calling
/// [`unsubscribe`](Self::unsubscribe)) detaches the listener.
pub struct ToolEventSubscription {
    cancel: Option<Box<dyn FnOnce() + Send + Sync>>,
}

impl ToolEventSubscription {
    pub fn new(cancel: impl FnOnce() + Send + Sync + 'static) -> Self {
        Self {
            cancel: Some(Box::new(cancel)),
        }
    }

    pub fn unsubscribe(mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

impl Drop for ToolEventSubscription {
    fn drop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel();
        }
    }
}

#[async_trait]
pub trait ToolRunner: Send + Sync {
    fn create_request(
        &self,
        call_id: &str,
        tool_name: &str,
        arguments: serde_json::Value,
        caller_id: &str,
        context: RequestContext,
    ) -> ToolRequest {
        ToolRequest {
            call_id: call_id.to_string(),
            tool_name: tool_name.to_string(),
            arguments,
            caller_id: caller_id.to_string(),
            context,
        }
    }

    /// Execute a batch of requests; citations are collected across the
    /// whole batch.
    async fn execute_batch(&self, requests: Vec<ToolRequest>) -> Result<ToolBatch>;

    fn subscribe_tool_events(&self, listener: ToolEventListener) -> ToolEventSubscription;

    /// Descriptors for the tools this runner exposes, filtered by policy.
    fn tools_for_llm(&self, policy: Option<&ToolPolicy>) -> Vec<ToolDescriptor>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Trace recorder
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TraceStatus {
    Running,
    Ok,
    Error,
}

#[derive(Debug, Clone, Default)]
pub struct TraceMeta {
    pub name: String,
    pub agent_id: Option<String>,
    pub conversation_id: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct SpanMeta {
    pub trace_id: String,
    pub parent_span_id: Option<String>,
    pub name: String,
    pub agent_id: Option<String>,
    pub role: Option<String>,
}

#[derive(Debug, Clone)]
pub struct TraceRecord {
    pub id: String,
    pub meta: TraceMeta,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct SpanRecord {
    pub id: String,
    pub meta: SpanMeta,
    pub status: TraceStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub duration_ms: Option<u64>,
    pub error: Option<String>,
}

pub trait TraceRecorder: Send + Sync {
    fn start_trace(&self, meta: TraceMeta) -> String;
    fn start_span(&self, meta: SpanMeta) -> String;
    fn end_span(&self, span_id: &str, status: TraceStatus, error: Option<&str>);
    fn end_trace(&self, trace_id: &str, status: TraceStatus);
    fn span(&self, span_id: &str) -> Option<SpanRecord>;
    fn trace(&self, trace_id: &str) -> Option<TraceRecord>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};

    #[test]
    fn caller_id_format() {
        assert_eq!(caller_id("sup-1", "conv-9"), "sup-1:conv-9");
    }

    #[test]
    fn subscription_cancels_on_drop() {
        let fired = Arc::new(AtomicBool::new(false));
        let flag = fired.clone();
        {
            let _sub = ToolEventSubscription::new(move || flag.store(true, Ordering::SeqCst));
        }
        assert!(fired.load(Ordering::SeqCst));
    }

    #[test]
    fn subscription_unsubscribe_fires_once() {
        let count = Arc::new(std::sync::atomic::AtomicU32::new(0));
        let counter = count.clone();
        let sub = ToolEventSubscription::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        sub.unsubscribe();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }
}
