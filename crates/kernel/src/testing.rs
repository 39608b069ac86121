//! Scripted collaborator fakes for kernel tests.
//!
//! These implement the [`crate::ports`] traits with deterministic,
//! inspectable behaviour: a model that replays scripted turns, a channel
//! that records everything it is asked to send, and a tool runner with
//! canned outputs and caller-tagged events.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use fm_domain::citation::CitationSource;
use fm_domain::config::ToolPolicy;
use fm_domain::llm::{
    ChatRequest, EventStream, StreamEvent, ToolCall, ToolDescriptor, Usage,
};
use fm_domain::message::InboundMessage;
use fm_domain::{Error, Result};

use crate::ports::{
    BroadcastEvent, CallPurpose, ChannelSink, IngressHandler, ModelClient, StreamClose,
    StreamMeta, ToolBatch, ToolEvent, ToolEventKind, ToolEventListener, ToolEventSubscription,
    ToolOutcome, ToolRequest, ToolRunner, TurnContext,
};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted model
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// One scripted generation: optional text plus the tool calls the "model"
/// requests.
#[derive(Debug, Clone)]
pub struct ScriptedTurn {
    pub text: String,
    pub tool_calls: Vec<ToolCall>,
    pub usage: Usage,
    /// When set, this step fails the model call instead of streaming.
    pub fail: Option<String>,
}

impl ScriptedTurn {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            tool_calls: Vec::new(),
            usage: Usage {
                prompt_tokens: 20,
                completion_tokens: 10,
                total_tokens: 30,
            },
            fail: None,
        }
    }

    /// A step that errors out (scripting upstream failures mid-scenario).
    pub fn failure(message: impl Into<String>) -> Self {
        Self {
            fail: Some(message.into()),
            ..Self::text("")
        }
    }

    pub fn with_tools(text: impl Into<String>, tool_calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls,
            ..Self::text(text)
        }
    }

    /// Shorthand for a single tool call with generated call id.
    pub fn tool(name: &str, arguments: serde_json::Value) -> Self {
        Self::with_tools(
            "",
            vec![ToolCall {
                call_id: format!("call-{}", uuid::Uuid::new_v4()),
                tool_name: name.into(),
                arguments,
            }],
        )
    }
}

/// A model client that replays a queue of scripted turns. An exhausted
/// queue yields empty text, which cleanly ends any tool loop.
#[derive(Default)]
pub struct ScriptedModel {
    turns: Mutex<VecDeque<ScriptedTurn>>,
    completions: Mutex<VecDeque<String>>,
    fail_next: Mutex<Option<String>>,
    chat_requests: Mutex<Vec<(ChatRequest, TurnContext)>>,
    completion_calls: Mutex<Vec<(String, CallPurpose)>>,
}

impl ScriptedModel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, turn: ScriptedTurn) {
        self.turns.lock().push_back(turn);
    }

    pub fn push_completion(&self, text: impl Into<String>) {
        self.completions.lock().push_back(text.into());
    }

    /// The next `chat_stream` call fails with a model error.
    pub fn fail_next(&self, message: impl Into<String>) {
        *self.fail_next.lock() = Some(message.into());
    }

    pub fn chat_requests(&self) -> Vec<(ChatRequest, TurnContext)> {
        self.chat_requests.lock().clone()
    }

    pub fn completion_calls(&self) -> Vec<(String, CallPurpose)> {
        self.completion_calls.lock().clone()
    }
}

#[async_trait]
impl ModelClient for ScriptedModel {
    async fn chat_stream(&self, request: ChatRequest, ctx: &TurnContext) -> Result<EventStream> {
        self.chat_requests.lock().push((request, ctx.clone()));

        if let Some(message) = self.fail_next.lock().take() {
            return Err(Error::Model(message));
        }

        let turn = self
            .turns
            .lock()
            .pop_front()
            .unwrap_or_else(|| ScriptedTurn {
                text: String::new(),
                tool_calls: Vec::new(),
                usage: Usage::default(),
                fail: None,
            });

        if let Some(message) = turn.fail {
            return Err(Error::Model(message));
        }

        let mut events: Vec<Result<StreamEvent>> = Vec::new();
        if !turn.text.is_empty() {
            // Two chunks, so streaming accumulation is actually exercised.
            let mid = turn.text.len() / 2;
            let mid = (0..=mid)
                .rev()
                .find(|i| turn.text.is_char_boundary(*i))
                .unwrap_or(0);
            let (a, b) = turn.text.split_at(mid);
            for part in [a, b] {
                if !part.is_empty() {
                    events.push(Ok(StreamEvent::Token {
                        text: part.to_string(),
                    }));
                }
            }
        }
        for call in turn.tool_calls {
            events.push(Ok(StreamEvent::ToolCallFinished {
                call_id: call.call_id,
                tool_name: call.tool_name,
                arguments: call.arguments,
            }));
        }
        events.push(Ok(StreamEvent::Done {
            usage: Some(turn.usage),
            finish_reason: Some("end_turn".into()),
        }));

        Ok(Box::pin(futures_util::stream::iter(events)))
    }

    async fn complete_text(&self, prompt: &str, ctx: &TurnContext) -> Result<String> {
        self.completion_calls
            .lock()
            .push((prompt.to_string(), ctx.purpose));
        Ok(self
            .completions
            .lock()
            .pop_front()
            .unwrap_or_else(|| "scripted completion".into()))
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Recording channel
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub enum ChannelRecord {
    StreamStart {
        stream_id: String,
        meta: StreamMeta,
    },
    StreamChunk {
        stream_id: String,
        text: String,
        conversation_id: String,
    },
    StreamEnd {
        stream_id: String,
        close: StreamClose,
    },
    Error {
        title: String,
        details: String,
        conversation_id: String,
    },
    Broadcast(BroadcastEvent),
}

/// A channel sink that records every delivery for later assertions.
#[derive(Default)]
pub struct RecordingChannel {
    records: Mutex<Vec<ChannelRecord>>,
    handler: Mutex<Option<IngressHandler>>,
}

impl RecordingChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<ChannelRecord> {
        self.records.lock().clone()
    }

    pub fn stream_starts(&self) -> Vec<StreamMeta> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                ChannelRecord::StreamStart { meta, .. } => Some(meta),
                _ => None,
            })
            .collect()
    }

    pub fn stream_ends(&self) -> Vec<StreamClose> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                ChannelRecord::StreamEnd { close, .. } => Some(close),
                _ => None,
            })
            .collect()
    }

    /// All streamed text, concatenated.
    pub fn streamed_text(&self) -> String {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                ChannelRecord::StreamChunk { text, .. } => Some(text),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self) -> Vec<(String, String)> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                ChannelRecord::Error { title, details, .. } => Some((title, details)),
                _ => None,
            })
            .collect()
    }

    pub fn broadcasts(&self) -> Vec<BroadcastEvent> {
        self.records()
            .into_iter()
            .filter_map(|r| match r {
                ChannelRecord::Broadcast(event) => Some(event),
                _ => None,
            })
            .collect()
    }

    /// Deliver a message through the registered ingress handler.
    pub fn inject(&self, message: InboundMessage) {
        if let Some(handler) = self.handler.lock().clone() {
            handler(message);
        }
    }
}

#[async_trait]
impl ChannelSink for RecordingChannel {
    async fn send_stream_start(&self, stream_id: &str, meta: StreamMeta) -> Result<()> {
        self.records.lock().push(ChannelRecord::StreamStart {
            stream_id: stream_id.to_string(),
            meta,
        });
        Ok(())
    }

    async fn send_stream_chunk(
        &self,
        stream_id: &str,
        text: &str,
        conversation_id: &str,
    ) -> Result<()> {
        self.records.lock().push(ChannelRecord::StreamChunk {
            stream_id: stream_id.to_string(),
            text: text.to_string(),
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    async fn send_stream_end(&self, stream_id: &str, close: StreamClose) -> Result<()> {
        self.records.lock().push(ChannelRecord::StreamEnd {
            stream_id: stream_id.to_string(),
            close,
        });
        Ok(())
    }

    async fn send_error(&self, title: &str, details: &str, conversation_id: &str) -> Result<()> {
        self.records.lock().push(ChannelRecord::Error {
            title: title.to_string(),
            details: details.to_string(),
            conversation_id: conversation_id.to_string(),
        });
        Ok(())
    }

    async fn broadcast(&self, event: BroadcastEvent) -> Result<()> {
        self.records.lock().push(ChannelRecord::Broadcast(event));
        Ok(())
    }

    fn on_message(&self, handler: IngressHandler) {
        *self.handler.lock() = Some(handler);
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scripted tool runner
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A tool runner with canned per-tool outputs. Emits `started`/`finished`
/// events tagged with each request's caller id, like a real shared runner.
pub struct ScriptedToolRunner {
    /// tool name → (output, is_error).
    outputs: Mutex<HashMap<String, (String, bool)>>,
    citations: Mutex<HashMap<String, Vec<CitationSource>>>,
    descriptors: Mutex<Vec<ToolDescriptor>>,
    listeners: Arc<Mutex<HashMap<u64, ToolEventListener>>>,
    next_listener_id: Mutex<u64>,
    executed: Mutex<Vec<ToolRequest>>,
}

impl Default for ScriptedToolRunner {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedToolRunner {
    pub fn new() -> Self {
        let runner = Self {
            outputs: Mutex::new(HashMap::new()),
            citations: Mutex::new(HashMap::new()),
            descriptors: Mutex::new(Vec::new()),
            listeners: Arc::new(Mutex::new(HashMap::new())),
            next_listener_id: Mutex::new(0),
            executed: Mutex::new(Vec::new()),
        };
        runner.add_descriptor(ToolDescriptor {
            name: "web_search".into(),
            description: "Search the web.".into(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": { "query": { "type": "string" } },
                "required": ["query"]
            }),
        });
        runner
    }

    pub fn set_output(&self, tool: &str, output: impl Into<String>) {
        self.outputs
            .lock()
            .insert(tool.to_string(), (output.into(), false));
    }

    pub fn set_failure(&self, tool: &str, error: impl Into<String>) {
        self.outputs
            .lock()
            .insert(tool.to_string(), (error.into(), true));
    }

    pub fn add_citation(&self, tool: &str, source: CitationSource) {
        self.citations
            .lock()
            .entry(tool.to_string())
            .or_default()
            .push(source);
    }

    pub fn add_descriptor(&self, descriptor: ToolDescriptor) {
        self.descriptors.lock().push(descriptor);
    }

    pub fn executed(&self) -> Vec<ToolRequest> {
        self.executed.lock().clone()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().len()
    }

    fn emit(&self, event: ToolEvent) {
        for listener in self.listeners.lock().values() {
            listener(&event);
        }
    }
}

#[async_trait]
impl ToolRunner for ScriptedToolRunner {
    async fn execute_batch(&self, requests: Vec<ToolRequest>) -> Result<ToolBatch> {
        let mut batch = ToolBatch::default();
        for request in requests {
            self.emit(ToolEvent {
                id: request.call_id.clone(),
                kind: ToolEventKind::Started,
                caller_id: request.caller_id.clone(),
                tool_name: request.tool_name.clone(),
                payload: serde_json::json!({ "arguments": request.arguments }),
            });

            let (output, is_error) = self
                .outputs
                .lock()
                .get(&request.tool_name)
                .cloned()
                .unwrap_or_else(|| {
                    (
                        format!("no scripted output for '{}'", request.tool_name),
                        true,
                    )
                });

            self.emit(ToolEvent {
                id: request.call_id.clone(),
                kind: ToolEventKind::Finished,
                caller_id: request.caller_id.clone(),
                tool_name: request.tool_name.clone(),
                payload: serde_json::json!({ "output": output, "is_error": is_error }),
            });

            if let Some(sources) = self.citations.lock().get(&request.tool_name) {
                batch.citations.extend(sources.iter().cloned());
            }

            batch.results.push(ToolOutcome {
                call_id: request.call_id.clone(),
                tool_name: request.tool_name.clone(),
                success: !is_error,
                output: if is_error { String::new() } else { output.clone() },
                error: if is_error { Some(output) } else { None },
            });

            self.executed.lock().push(request);
        }
        Ok(batch)
    }

    fn subscribe_tool_events(&self, listener: ToolEventListener) -> ToolEventSubscription {
        let id = {
            let mut next = self.next_listener_id.lock();
            *next += 1;
            *next
        };
        self.listeners.lock().insert(id, listener);

        let listeners = Arc::clone(&self.listeners);
        ToolEventSubscription::new(move || {
            listeners.lock().remove(&id);
        })
    }

    fn tools_for_llm(&self, policy: Option<&ToolPolicy>) -> Vec<ToolDescriptor> {
        let descriptors = self.descriptors.lock().clone();
        match policy {
            Some(policy) => descriptors
                .into_iter()
                .filter(|d| policy.allows(&d.name))
                .collect(),
            None => descriptors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ports::RequestContext;
    use futures_util::StreamExt;

    fn ctx() -> TurnContext {
        TurnContext {
            trace_id: "trace".into(),
            span_id: "span".into(),
            conversation_id: "c1".into(),
            turn_id: "t1".into(),
            purpose: CallPurpose::Chat,
        }
    }

    #[tokio::test]
    async fn scripted_model_replays_turns_in_order() {
        let model = ScriptedModel::new();
        model.push(ScriptedTurn::text("first"));
        model.push(ScriptedTurn::text("second"));

        for expected in ["first", "second", ""] {
            let request = ChatRequest {
                system: String::new(),
                messages: Vec::new(),
                tools: Vec::new(),
                model: None,
            };
            let mut stream = model.chat_stream(request, &ctx()).await.unwrap();
            let mut text = String::new();
            while let Some(event) = stream.next().await {
                if let StreamEvent::Token { text: t } = event.unwrap() {
                    text.push_str(&t);
                }
            }
            assert_eq!(text, expected);
        }
        assert_eq!(model.chat_requests().len(), 3);
    }

    #[tokio::test]
    async fn runner_emits_caller_tagged_events() {
        let runner = ScriptedToolRunner::new();
        runner.set_output("web_search", "results");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let _subscription = runner.subscribe_tool_events(Arc::new(move |event: &ToolEvent| {
            sink.lock().push((event.caller_id.clone(), event.kind));
        }));
        assert_eq!(runner.listener_count(), 1);

        let request = runner.create_request(
            "call-1",
            "web_search",
            serde_json::json!({"query": "x"}),
            "agent:conv",
            RequestContext::default(),
        );
        let batch = runner.execute_batch(vec![request]).await.unwrap();
        assert!(batch.results[0].success);

        let events = seen.lock().clone();
        assert_eq!(
            events,
            vec![
                ("agent:conv".to_string(), ToolEventKind::Started),
                ("agent:conv".to_string(), ToolEventKind::Finished),
            ]
        );
    }

    #[tokio::test]
    async fn unsubscribe_detaches_listener() {
        let runner = ScriptedToolRunner::new();
        let subscription = runner.subscribe_tool_events(Arc::new(|_| {}));
        assert_eq!(runner.listener_count(), 1);
        subscription.unsubscribe();
        assert_eq!(runner.listener_count(), 0);
    }

    #[tokio::test]
    async fn unscripted_tool_fails() {
        let runner = ScriptedToolRunner::new();
        let request = runner.create_request(
            "c1",
            "mystery",
            serde_json::json!({}),
            "a:c",
            RequestContext::default(),
        );
        let batch = runner.execute_batch(vec![request]).await.unwrap();
        assert!(!batch.results[0].success);
        assert!(batch.results[0].error.as_ref().unwrap().contains("mystery"));
    }
}
