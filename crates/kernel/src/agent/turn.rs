//! The bounded streaming tool loop shared by supervisors and workers.
//!
//! One loop iteration = one model generation plus the tool work it
//! requested. The loop streams text into the channel as it arrives,
//! dispatches tool batches, executes kernel built-ins locally, and (for
//! supervisors) suspends around delegations. All per-turn state lives on
//! this stack frame; nothing leaks onto the agent instance.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use futures_util::StreamExt;
use tokio::sync::mpsc;

use fm_domain::citation::{self, CitationData, CitationSource};
use fm_domain::config::ToolPolicy;
use fm_domain::llm::{
    ChatMessage, ChatRequest, StreamEvent, ToolCall, ToolDescriptor, TurnUsage,
};
use fm_domain::message::StoredMessage;
use fm_domain::todo::{TodoStatus, TurnTodo};
use fm_domain::{Error, Result};
use fm_store::{ConversationStore, TodoPatch};

use super::builtin;
use super::AgentCore;
use crate::ports::{
    ChannelSink, RequestContext, SpanMeta, StreamClose, StreamMeta, ToolEvent,
    ToolEventSubscription, ToolOutcome, TraceStatus, TurnContext,
};
use crate::prompts;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Inputs & outputs
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Everything a turn needs, built once before the first model call.
#[derive(Clone)]
pub struct TurnSetup {
    pub ctx: TurnContext,
    /// Full system prompt for this turn (plan mode swaps it temporarily).
    pub system_prompt: String,
    pub history: Vec<ChatMessage>,
    pub user_text: String,
    /// Effective tool policy for this turn.
    pub policy: ToolPolicy,
    /// Collapsed workers run without channel streaming.
    pub stream_to_channel: bool,
}

/// What a finished loop hands back to its caller.
#[derive(Debug)]
pub struct TurnOutcome {
    pub text: String,
    pub citations: CitationData,
    pub usage: TurnUsage,
    pub iterations: u32,
    /// The persisted final assistant row, when `text` was non-empty.
    pub final_message: Option<StoredMessage>,
}

/// What a delegation hands back to the loop: the worker's final text plus
/// the sources it gathered, which fold into the parent's citation set.
#[derive(Debug, Clone)]
pub struct Delegated {
    pub text: String,
    pub citations: Vec<CitationSource>,
}

/// Delegation hooks. Only supervisors wire these in; workers run the loop
/// without them and cannot delegate further.
#[async_trait]
pub trait Delegator: Send + Sync {
    /// Handle a `delegate` call. The returned text is folded back into the
    /// recorded tool result so the model sees it on the next iteration.
    async fn handle_delegate(
        &self,
        arguments: &serde_json::Value,
        setup: &TurnSetup,
    ) -> Result<Delegated>;

    /// Handle a `delegate_todo` call for one resolved plan item.
    async fn handle_delegate_todo(&self, todo: &TurnTodo, setup: &TurnSetup)
        -> Result<Delegated>;
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Stream handle
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A channel stream in flight. Close is idempotent; delegation closes the
/// current stream and opens a fresh one afterwards.
struct StreamHandle {
    id: String,
    enabled: bool,
    open: bool,
}

impl StreamHandle {
    async fn open(
        core: &AgentCore,
        channel: &Arc<dyn ChannelSink>,
        ctx: &TurnContext,
        enabled: bool,
    ) -> Result<Self> {
        let id = uuid::Uuid::new_v4().to_string();
        if enabled {
            channel
                .send_stream_start(
                    &id,
                    StreamMeta {
                        agent_id: core.identity.id.clone(),
                        agent_name: core.identity.name.clone(),
                        agent_emoji: core.identity.emoji.clone(),
                        conversation_id: ctx.conversation_id.clone(),
                    },
                )
                .await?;
        }
        Ok(Self {
            id,
            enabled,
            open: true,
        })
    }

    async fn chunk(&self, channel: &Arc<dyn ChannelSink>, text: &str, conversation_id: &str) {
        if self.enabled && self.open {
            if let Err(e) = channel.send_stream_chunk(&self.id, text, conversation_id).await {
                tracing::warn!(error = %e, "stream chunk delivery failed");
            }
        }
    }

    async fn close(&mut self, channel: &Arc<dyn ChannelSink>, close: StreamClose) {
        if self.enabled && self.open {
            if let Err(e) = channel.send_stream_end(&self.id, close).await {
                tracing::warn!(error = %e, "stream end delivery failed");
            }
        }
        self.open = false;
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Entry point
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Run one turn's tool loop to completion.
///
/// On error the stream is closed (without citations) before the error
/// propagates; the caller owns error events and trace closure.
pub(crate) async fn run_tool_loop(
    core: &AgentCore,
    setup: &TurnSetup,
    delegator: Option<&dyn Delegator>,
) -> Result<TurnOutcome> {
    let channel = core.channel()?;
    let caller = core.caller_id(&setup.ctx.conversation_id);

    let stream = StreamHandle::open(core, &channel, &setup.ctx, setup.stream_to_channel).await?;
    let (subscription, event_rx) = subscribe(core);

    let mut messages = setup.history.clone();
    messages.push(ChatMessage::user(setup.user_text.clone()));

    let tool_defs = build_tool_defs(core, &setup.policy, delegator.is_some());

    let mut state = ToolLoop {
        core,
        setup,
        delegator,
        channel,
        caller,
        stream,
        event_rx,
        subscription: Some(subscription),
        messages,
        system_prompt: setup.system_prompt.clone(),
        tool_defs,
        full_response: String::new(),
        collected_sources: Vec::new(),
        usage: TurnUsage::default(),
        iterations: 0,
        started: Instant::now(),
    };

    match state.drive().await {
        Ok(outcome) => Ok(outcome),
        Err(e) => {
            // Failure path: close the stream with no citations; the caller
            // surfaces the sanitized error and marks the trace.
            state.drain_tool_events().await;
            state.stream.close(&state.channel, StreamClose::default()).await;
            Err(e)
        }
    }
}

fn build_tool_defs(
    core: &AgentCore,
    policy: &ToolPolicy,
    has_delegator: bool,
) -> Vec<ToolDescriptor> {
    let mut defs = core.deps.tools.tools_for_llm(Some(policy));
    let can_delegate = has_delegator && core.capabilities.can_spawn_agents;
    defs.extend(builtin::descriptors(policy, can_delegate));
    defs
}

/// Subscribe to the shared tool runner. Events are buffered and re-emitted
/// by the loop itself (after each batch), which keeps the persisted order
/// deterministic: user → events → final assistant.
fn subscribe(
    core: &AgentCore,
) -> (ToolEventSubscription, mpsc::UnboundedReceiver<ToolEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let subscription = core
        .deps
        .tools
        .subscribe_tool_events(Arc::new(move |event: &ToolEvent| {
            let _ = tx.send(event.clone());
        }));
    (subscription, rx)
}

fn failure_outcome(call: &ToolCall, message: &str) -> ToolOutcome {
    ToolOutcome {
        call_id: call.call_id.clone(),
        tool_name: call.tool_name.clone(),
        success: false,
        output: String::new(),
        error: Some(message.to_string()),
    }
}

fn result_text(outcome: &ToolOutcome) -> String {
    if outcome.success {
        outcome.output.clone()
    } else {
        outcome
            .error
            .clone()
            .unwrap_or_else(|| outcome.output.clone())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Loop state
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct ToolLoop<'a> {
    core: &'a AgentCore,
    setup: &'a TurnSetup,
    delegator: Option<&'a dyn Delegator>,
    channel: Arc<dyn ChannelSink>,
    caller: String,
    stream: StreamHandle,
    event_rx: mpsc::UnboundedReceiver<ToolEvent>,
    subscription: Option<ToolEventSubscription>,
    messages: Vec<ChatMessage>,
    system_prompt: String,
    tool_defs: Vec<ToolDescriptor>,
    full_response: String,
    collected_sources: Vec<CitationSource>,
    usage: TurnUsage,
    iterations: u32,
    started: Instant,
}

impl<'a> ToolLoop<'a> {
    fn store(&self) -> &Arc<dyn ConversationStore> {
        self.core.deps.events.store()
    }

    async fn drive(&mut self) -> Result<TurnOutcome> {
        loop {
            // Open plan items extend the cap so multi-step plans can run
            // to completion without unbounding plain tool loops.
            let counts = self.store().todo_counts(&self.setup.ctx.turn_id).await?;
            let cap = if counts.open() > 0 {
                self.core.deps.config.max_tool_iterations_with_plan
            } else {
                self.core.deps.config.max_tool_iterations
            };
            if self.iterations >= cap {
                tracing::warn!(
                    iterations = self.iterations,
                    turn_id = %self.setup.ctx.turn_id,
                    "tool loop cap reached"
                );
                break;
            }
            self.iterations += 1;

            let (text, calls) = self.generate().await?;
            self.full_response.push_str(&text);

            if calls.is_empty() {
                break;
            }

            self.messages
                .push(ChatMessage::assistant_with_tools(&text, &calls));

            let mut outcomes = self.dispatch(&calls).await?;
            self.drain_tool_events().await;
            self.post_dispatch(&calls, &mut outcomes).await?;

            self.messages.push(ChatMessage::tool_results(
                outcomes
                    .iter()
                    .map(|o| (o.call_id.clone(), result_text(o), !o.success)),
            ));
        }

        self.usage.latency_ms = self.started.elapsed().as_millis() as u64;
        let citations = citation::correlate(&self.collected_sources, &self.full_response);

        self.stream
            .close(
                &self.channel,
                StreamClose {
                    citations: Some(citations.clone()),
                    usage: Some(self.usage.clone()),
                },
            )
            .await;

        let final_message = if self.full_response.is_empty() {
            None
        } else {
            Some(
                self.core
                    .save_assistant_message_with_context(
                        &self.full_response,
                        &self.setup.ctx.conversation_id,
                        &self.setup.ctx.turn_id,
                        Some(&citations),
                        Some(&self.usage),
                    )
                    .await?,
            )
        };

        Ok(TurnOutcome {
            text: std::mem::take(&mut self.full_response),
            citations,
            usage: self.usage.clone(),
            iterations: self.iterations,
            final_message,
        })
    }

    // ── Model generation ──────────────────────────────────────────

    async fn generate(&mut self) -> Result<(String, Vec<ToolCall>)> {
        let span_id = self.core.deps.traces.start_span(SpanMeta {
            trace_id: self.setup.ctx.trace_id.clone(),
            parent_span_id: Some(self.setup.ctx.span_id.clone()),
            name: "model.generate".into(),
            agent_id: Some(self.core.identity.id.clone()),
            role: None,
        });

        let result = self.consume_model_stream().await;
        match &result {
            Ok(_) => self.core.deps.traces.end_span(&span_id, TraceStatus::Ok, None),
            Err(e) => self
                .core
                .deps
                .traces
                .end_span(&span_id, TraceStatus::Error, Some(&e.to_string())),
        }
        result
    }

    async fn consume_model_stream(&mut self) -> Result<(String, Vec<ToolCall>)> {
        let request = ChatRequest {
            system: self.system_prompt.clone(),
            messages: self.messages.clone(),
            tools: self.tool_defs.clone(),
            model: None,
        };
        let mut stream = self.core.deps.model.chat_stream(request, &self.setup.ctx).await?;

        let mut text_buf = String::new();
        let mut pending: Vec<ToolCall> = Vec::new();
        // call_id → (name, accumulated args json)
        let mut tc_bufs: HashMap<String, (String, String)> = HashMap::new();

        while let Some(event) = stream.next().await {
            match event? {
                StreamEvent::Token { text } => {
                    self.stream
                        .chunk(&self.channel, &text, &self.setup.ctx.conversation_id)
                        .await;
                    text_buf.push_str(&text);
                }
                StreamEvent::ToolCallStarted { call_id, tool_name } => {
                    tc_bufs.insert(call_id, (tool_name, String::new()));
                }
                StreamEvent::ToolCallDelta { call_id, delta } => {
                    if let Some((_, args)) = tc_bufs.get_mut(&call_id) {
                        args.push_str(&delta);
                    }
                }
                StreamEvent::ToolCallFinished {
                    call_id,
                    tool_name,
                    arguments,
                } => {
                    tc_bufs.remove(&call_id);
                    pending.push(ToolCall {
                        call_id,
                        tool_name,
                        arguments,
                    });
                }
                StreamEvent::Done { usage, .. } => {
                    if let Some(usage) = usage {
                        self.usage.add(&usage);
                    }
                }
                StreamEvent::Error { message } => {
                    return Err(Error::Model(message));
                }
            }
        }

        // Assemble calls that only came through start/delta (some
        // providers never send ToolCallFinished).
        for (call_id, (tool_name, args)) in tc_bufs.drain() {
            let arguments = if args.trim().is_empty() {
                serde_json::Value::Object(Default::default())
            } else {
                match serde_json::from_str(&args) {
                    Ok(value) => value,
                    Err(e) => {
                        tracing::warn!(
                            call_id = %call_id,
                            tool = %tool_name,
                            error = %e,
                            "tool call arguments are not valid JSON; defaulting to empty object"
                        );
                        serde_json::Value::Object(Default::default())
                    }
                }
            };
            pending.push(ToolCall {
                call_id,
                tool_name,
                arguments,
            });
        }

        Ok((text_buf, pending))
    }

    // ── Tool dispatch ─────────────────────────────────────────────

    /// Execute one batch: built-ins locally, everything else through the
    /// shared runner. Outcomes come back in request order.
    async fn dispatch(&mut self, calls: &[ToolCall]) -> Result<Vec<ToolOutcome>> {
        let requests: Vec<_> = calls
            .iter()
            .filter(|c| !builtin::is_builtin(&c.tool_name))
            .map(|c| {
                self.core.deps.tools.create_request(
                    &c.call_id,
                    &c.tool_name,
                    c.arguments.clone(),
                    &self.caller,
                    RequestContext::from_turn(&self.setup.ctx, &self.core.identity.id),
                )
            })
            .collect();

        let mut runner_results: HashMap<String, ToolOutcome> = if requests.is_empty() {
            HashMap::new()
        } else {
            let batch = self.core.deps.tools.execute_batch(requests).await?;
            self.collected_sources.extend(batch.citations);
            batch
                .results
                .into_iter()
                .map(|r| (r.call_id.clone(), r))
                .collect()
        };

        let can_delegate = self.delegator.is_some() && self.core.capabilities.can_spawn_agents;
        let mut outcomes = Vec::with_capacity(calls.len());
        for call in calls {
            let outcome = if builtin::is_plan_tool(&call.tool_name) {
                self.execute_plan_tool(call).await
            } else if call.tool_name == builtin::DELEGATE
                || call.tool_name == builtin::DELEGATE_TODO
            {
                if can_delegate {
                    // Placeholder; post_dispatch fills in the worker text.
                    ToolOutcome {
                        call_id: call.call_id.clone(),
                        tool_name: call.tool_name.clone(),
                        success: true,
                        output: String::new(),
                        error: None,
                    }
                } else {
                    failure_outcome(call, "delegation is not available to this agent")
                }
            } else {
                runner_results
                    .remove(&call.call_id)
                    .unwrap_or_else(|| failure_outcome(call, "tool runner returned no result"))
            };
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    // ── Plan tools (local) ────────────────────────────────────────

    async fn execute_plan_tool(&self, call: &ToolCall) -> ToolOutcome {
        let result = match call.tool_name.as_str() {
            builtin::CREATE_TODO => self.create_todos(&call.arguments).await,
            builtin::LIST_TODO => self.list_todos().await,
            builtin::CANCEL_TODO => self.cancel_todo(&call.arguments).await,
            other => Err(Error::Tool {
                tool: other.to_string(),
                message: "unknown plan tool".into(),
            }),
        };
        match result {
            Ok(output) => ToolOutcome {
                call_id: call.call_id.clone(),
                tool_name: call.tool_name.clone(),
                success: true,
                output,
                error: None,
            },
            Err(e) => failure_outcome(call, &e.to_string()),
        }
    }

    async fn create_todos(&self, arguments: &serde_json::Value) -> Result<String> {
        let items = arguments
            .get("items")
            .and_then(|v| v.as_array())
            .ok_or_else(|| Error::Tool {
                tool: builtin::CREATE_TODO.into(),
                message: "missing required argument: items".into(),
            })?;

        let mut ids = Vec::with_capacity(items.len());
        for item in items {
            let title = item
                .get("title")
                .and_then(|v| v.as_str())
                .ok_or_else(|| Error::Tool {
                    tool: builtin::CREATE_TODO.into(),
                    message: "plan item is missing a title".into(),
                })?;
            let agent_type = item
                .get("agent_type")
                .and_then(|v| v.as_str())
                .unwrap_or(builtin::DEFAULT_PLAN_AGENT);
            let todo = TurnTodo::new(&self.setup.ctx.turn_id, title, agent_type);
            ids.push(self.store().create_todo(todo).await?.id);
        }
        Ok(serde_json::json!({ "created": ids.len(), "ids": ids }).to_string())
    }

    async fn list_todos(&self) -> Result<String> {
        let todos = self.store().todos_for_turn(&self.setup.ctx.turn_id).await?;
        Ok(serde_json::to_string(&todos)?)
    }

    async fn cancel_todo(&self, arguments: &serde_json::Value) -> Result<String> {
        let todo_id = arguments
            .get("todo_id")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Tool {
                tool: builtin::CANCEL_TODO.into(),
                message: "missing required argument: todo_id".into(),
            })?;
        self.store().update_todo(todo_id, TodoPatch::cancel()).await?;
        Ok(serde_json::json!({ "cancelled": todo_id }).to_string())
    }

    // ── Delegation interleaving ───────────────────────────────────

    /// After a batch that contained `delegate`/`delegate_todo` calls:
    /// suspend the stream, run the worker, fold its text into the recorded
    /// tool result, then resume with a fresh stream.
    async fn post_dispatch(
        &mut self,
        calls: &[ToolCall],
        outcomes: &mut [ToolOutcome],
    ) -> Result<()> {
        let Some(delegator) = self.delegator else {
            return Ok(());
        };
        let setup = self.setup;

        for idx in 0..calls.len() {
            if !outcomes[idx].success {
                continue;
            }
            match calls[idx].tool_name.as_str() {
                builtin::DELEGATE => {
                    let arguments = calls[idx].arguments.clone();
                    self.pause_for_delegation().await?;
                    let delegated = delegator.handle_delegate(&arguments, setup).await;
                    self.resume_after_delegation().await?;
                    match delegated {
                        Ok(delegated) => {
                            self.collected_sources.extend(delegated.citations);
                            outcomes[idx].output = delegated.text;
                        }
                        // Surfaced to the model as a failed tool result;
                        // the loop goes on.
                        Err(e) => {
                            outcomes[idx].success = false;
                            outcomes[idx].error = Some(e.to_string());
                        }
                    }
                }
                builtin::DELEGATE_TODO => {
                    let todo = match self.resolve_todo(&calls[idx].arguments).await? {
                        Some(todo) => todo,
                        None => {
                            outcomes[idx].success = false;
                            outcomes[idx].error = Some("no pending plan item".into());
                            continue;
                        }
                    };
                    self.store().update_todo(&todo.id, TodoPatch::start()).await?;

                    self.pause_for_delegation().await?;
                    let delegated = delegator.handle_delegate_todo(&todo, setup).await;
                    self.resume_after_delegation().await?;

                    match delegated {
                        Ok(delegated) => {
                            self.store()
                                .update_todo(&todo.id, TodoPatch::complete(delegated.text.clone()))
                                .await?;
                            self.collected_sources.extend(delegated.citations);
                            outcomes[idx].output = delegated.text;
                        }
                        Err(e) => {
                            self.store()
                                .update_todo(
                                    &todo.id,
                                    TodoPatch::complete(format!("failed: {e}")),
                                )
                                .await?;
                            outcomes[idx].success = false;
                            outcomes[idx].error = Some(e.to_string());
                        }
                    }
                    self.rebuild_plan_context().await?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Flush the stream (persisting any streamed prefix) and detach from
    /// tool events. Sub-agents reuse the same runner, so staying
    /// subscribed would double-emit their activity; the caller-id filter
    /// alone cannot prevent that.
    async fn pause_for_delegation(&mut self) -> Result<()> {
        self.drain_tool_events().await;
        self.stream
            .close(
                &self.channel,
                StreamClose {
                    citations: None,
                    usage: Some(self.usage.clone()),
                },
            )
            .await;
        if !self.full_response.trim().is_empty() {
            self.core
                .save_assistant_message_with_context(
                    &self.full_response,
                    &self.setup.ctx.conversation_id,
                    &self.setup.ctx.turn_id,
                    None,
                    None,
                )
                .await?;
            self.full_response.clear();
        }
        self.subscription = None;
        Ok(())
    }

    async fn resume_after_delegation(&mut self) -> Result<()> {
        let (subscription, event_rx) = subscribe(self.core);
        self.subscription = Some(subscription);
        self.event_rx = event_rx;
        self.stream = StreamHandle::open(
            self.core,
            &self.channel,
            &self.setup.ctx,
            self.setup.stream_to_channel,
        )
        .await?;
        Ok(())
    }

    async fn resolve_todo(&self, arguments: &serde_json::Value) -> Result<Option<TurnTodo>> {
        let todos = self.store().todos_for_turn(&self.setup.ctx.turn_id).await?;
        if let Some(todo_id) = arguments.get("todo_id").and_then(|v| v.as_str()) {
            return Ok(todos.into_iter().find(|t| t.id == todo_id));
        }
        Ok(todos
            .into_iter()
            .find(|t| t.status == TodoStatus::Pending))
    }

    /// After a `delegate_todo` round: narrow to plan mode while items stay
    /// open, restore the full context once the plan is settled.
    async fn rebuild_plan_context(&mut self) -> Result<()> {
        let todos = self.store().todos_for_turn(&self.setup.ctx.turn_id).await?;
        let open = todos.iter().filter(|t| t.status.is_open()).count();
        if open > 0 {
            self.system_prompt = prompts::plan_mode(&todos);
            self.tool_defs = builtin::plan_mode_descriptors();
        } else {
            self.system_prompt = self.setup.system_prompt.clone();
            self.tool_defs = build_tool_defs(self.core, &self.setup.policy, true);
            self.messages
                .push(ChatMessage::assistant(prompts::plan_outcomes_note(&todos)));
        }
        Ok(())
    }

    // ── Tool event re-emission ────────────────────────────────────

    /// Re-emit buffered tool events through the funnel, tagged with this
    /// turn. Events from other callers are filtered out downstream.
    async fn drain_tool_events(&mut self) {
        while let Ok(event) = self.event_rx.try_recv() {
            if let Err(e) = self
                .core
                .deps
                .events
                .emit_tool_event(
                    &event,
                    &self.setup.ctx.conversation_id,
                    &self.core.identity,
                    &self.setup.ctx.turn_id,
                    &self.channel,
                )
                .await
            {
                tracing::warn!(error = %e, "tool event emission failed");
            }
        }
    }
}
