//! The supervisor agent: the top-level dispatcher.
//!
//! Owns the conversation lifecycle for its channel: dedups retried
//! ingress, selects or creates the conversation, loads the model-visible
//! history, opens the trace, and runs the streaming tool loop. Delegation
//! requests coming out of the loop (or command shortcuts that skip it)
//! spawn workers and await their synchronous task results.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::Instrument;

use fm_domain::llm::{ChatMessage, Role};
use fm_domain::message::{Conversation, DelegationInfo, InboundMessage};
use fm_domain::todo::TurnTodo;
use fm_domain::{Error, Result};
use fm_store::{ConversationPatch, ListOptions};

use super::turn::{run_tool_loop, Delegated, Delegator, TurnSetup};
use super::worker::{WorkerAgent, WorkerConfig};
use super::{AgentCore, AgentIdentity, Capabilities, KernelDeps};
use crate::dedup::DedupSet;
use crate::delegation::{DelegationTracker, WorkerStatus};
use crate::ports::{
    BroadcastEvent, CallPurpose, ChannelSink, ModelClient, SpanMeta, TraceMeta, TraceStatus,
    TurnContext,
};
use crate::prompts;
use crate::registry::AgentRegistry;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delegation request
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone)]
pub struct DelegationRequest {
    pub agent_type: String,
    pub mission: String,
    pub custom_name: Option<String>,
    pub custom_emoji: Option<String>,
    pub rationale: Option<String>,
}

impl DelegationRequest {
    fn from_tool_args(arguments: &serde_json::Value) -> Result<Self> {
        let agent_type = arguments
            .get("type")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Delegation("delegate call missing 'type'".into()))?;
        let mission = arguments
            .get("mission")
            .and_then(|v| v.as_str())
            .ok_or_else(|| Error::Delegation("delegate call missing 'mission'".into()))?;
        let get = |key: &str| {
            arguments
                .get(key)
                .and_then(|v| v.as_str())
                .map(String::from)
        };
        Ok(Self {
            agent_type: agent_type.to_string(),
            mission: mission.to_string(),
            custom_name: get("custom_name"),
            custom_emoji: get("custom_emoji"),
            rationale: get("rationale"),
        })
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Supervisor
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct SupervisorAgent {
    core: AgentCore,
    registry: Arc<AgentRegistry>,
    tracker: Arc<DelegationTracker>,
    /// Message ids with a turn in flight (or recently finished).
    processing: Arc<DedupSet>,
    /// Message ids that already spawned a worker via `delegate`.
    delegated: Arc<DedupSet>,
    /// Conversations whose auto-naming already fired.
    auto_named: Mutex<HashSet<String>>,
    /// Fast model for background titling; falls back to the main client.
    namer: Option<Arc<dyn ModelClient>>,
}

impl SupervisorAgent {
    pub fn new(
        name: &str,
        registry: Arc<AgentRegistry>,
        deps: KernelDeps,
        namer: Option<Arc<dyn ModelClient>>,
    ) -> Self {
        let window = deps.config.dedup_window();
        let core = AgentCore::new(
            AgentIdentity::supervisor(name),
            Capabilities::unrestricted(),
            prompts::SUPERVISOR_PROMPT,
            deps,
        );
        core.init();
        Self {
            core,
            registry,
            tracker: Arc::new(DelegationTracker::new()),
            processing: Arc::new(DedupSet::new(window)),
            delegated: Arc::new(DedupSet::new(window)),
            auto_named: Mutex::new(HashSet::new()),
            namer,
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.core.identity
    }

    pub fn register_channel(&self, channel: Arc<dyn ChannelSink>) {
        self.core.register_channel(channel);
    }

    pub fn delegation_tracker(&self) -> &Arc<DelegationTracker> {
        &self.tracker
    }

    /// Whether a `delegate` already ran for this message id.
    pub fn has_delegated(&self, message_id: &str) -> bool {
        self.delegated.contains(message_id)
    }

    /// Background eviction for both dedup sets.
    pub fn spawn_dedup_sweepers(&self) -> Vec<tokio::task::JoinHandle<()>> {
        let every = self.core.deps.config.dedup_window() / 2;
        vec![
            self.processing.spawn_sweeper(every),
            self.delegated.spawn_sweeper(every),
        ]
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Message lifecycle
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Handle one ingress message: at most one turn per message id within
    /// the dedup window.
    ///
    /// Loop failures are absorbed here (sanitized error event, trace marked
    /// error); only configuration failures that abort before any model call
    /// propagate to the caller.
    pub async fn handle_message(&self, message: InboundMessage) -> Result<()> {
        if !self.processing.insert_if_absent(&message.id) {
            tracing::debug!(message_id = %message.id, "duplicate ingress dropped");
            return Ok(());
        }

        let channel = self.core.channel()?;

        let conversation = self.select_conversation(&message, &channel).await?;

        // Task-run rows were already persisted by the scheduler funnel.
        if !message.is_task_run() {
            self.core
                .deps
                .events
                .save_user(&message, &conversation.id, &channel)
                .await?;
            self.maybe_auto_name(&conversation, &channel);
        }

        // Task runs start from a clean slate; chat turns see the filtered
        // conversation history.
        let history = if message.is_task_run() {
            Vec::new()
        } else {
            self.load_history(&conversation.id, &message.id).await?
        };

        let turn_id = message
            .turn_id
            .clone()
            .unwrap_or_else(|| message.id.clone());

        let trace_id = self.core.deps.traces.start_trace(TraceMeta {
            name: "turn".into(),
            agent_id: Some(self.core.identity.id.clone()),
            conversation_id: Some(conversation.id.clone()),
        });
        let span_id = self.core.deps.traces.start_span(SpanMeta {
            trace_id: trace_id.clone(),
            parent_span_id: None,
            name: "supervisor.turn".into(),
            agent_id: Some(self.core.identity.id.clone()),
            role: Some("supervisor".into()),
        });
        let ctx = TurnContext {
            trace_id,
            span_id,
            conversation_id: conversation.id.clone(),
            turn_id: turn_id.clone(),
            purpose: CallPurpose::Chat,
        };

        let span = tracing::info_span!(
            "turn",
            turn_id = %turn_id,
            conversation_id = %conversation.id,
            agent_id = %self.core.identity.id,
        );

        let result = self
            .run_turn(&message, ctx.clone(), history)
            .instrument(span)
            .await;

        // Finally path: trace closes and errors surface exactly once, on
        // every exit. Dedup eviction is TTL-driven.
        match result {
            Ok(()) => {
                self.core
                    .deps
                    .traces
                    .end_span(&ctx.span_id, TraceStatus::Ok, None);
                self.core.deps.traces.end_trace(&ctx.trace_id, TraceStatus::Ok);
                Ok(())
            }
            Err(e) => {
                self.core
                    .deps
                    .events
                    .emit_error_event(&e, &conversation.id, &turn_id, &channel)
                    .await;
                self.core
                    .deps
                    .traces
                    .end_span(&ctx.span_id, TraceStatus::Error, Some(&e.to_string()));
                self.core
                    .deps
                    .traces
                    .end_trace(&ctx.trace_id, TraceStatus::Error);
                Ok(())
            }
        }
    }

    // ── Conversation selection ────────────────────────────────────

    async fn select_conversation(
        &self,
        message: &InboundMessage,
        channel: &Arc<dyn ChannelSink>,
    ) -> Result<Conversation> {
        let store = self.core.deps.events.store();

        if let Some(conversation_id) = &message.conversation_id {
            if let Some(existing) = store.find_conversation(conversation_id).await? {
                if existing.well_known && !message.is_task_run() {
                    // User messages must not pollute shared wells: re-home
                    // into a fresh conversation.
                    tracing::info!(
                        well_known = %existing.id,
                        "redirecting user message out of well-known conversation"
                    );
                    return self.create_conversation(message, channel).await;
                }
                return store
                    .update_conversation(&existing.id, ConversationPatch::touch())
                    .await;
            }

            // Unknown explicit id: provision it (well-known ids keep their
            // reserved flag so later turns see them as such).
            let mut conversation = Conversation::new(
                conversation_id.clone(),
                derive_title(&message.text, self.core.deps.config.title_preview_chars),
            );
            conversation.well_known = self.core.deps.config.is_well_known(conversation_id);
            let created = store.create_conversation(conversation).await?;
            self.broadcast_created(&created, channel).await;
            return Ok(created);
        }

        self.ensure_conversation(message, channel).await
    }

    /// Reuse a recently touched conversation, or create a new one. The
    /// recent window never applies to well-known conversations.
    async fn ensure_conversation(
        &self,
        message: &InboundMessage,
        channel: &Arc<dyn ChannelSink>,
    ) -> Result<Conversation> {
        let store = self.core.deps.events.store();
        let window = self.core.deps.config.recent_conversation_window();

        if let Some(recent) = store.find_recent(window).await? {
            let updated = store
                .update_conversation(&recent.id, ConversationPatch::touch())
                .await?;
            if let Err(e) = channel
                .broadcast(BroadcastEvent::ConversationUpdated {
                    conversation: updated.clone(),
                })
                .await
            {
                tracing::warn!(error = %e, "conversation_updated broadcast failed");
            }
            return Ok(updated);
        }

        self.create_conversation(message, channel).await
    }

    async fn create_conversation(
        &self,
        message: &InboundMessage,
        channel: &Arc<dyn ChannelSink>,
    ) -> Result<Conversation> {
        let store = self.core.deps.events.store();
        let title = derive_title(&message.text, self.core.deps.config.title_preview_chars);
        let created = store
            .create_conversation(Conversation::new(
                uuid::Uuid::new_v4().to_string(),
                title,
            ))
            .await?;
        self.broadcast_created(&created, channel).await;
        Ok(created)
    }

    async fn broadcast_created(&self, conversation: &Conversation, channel: &Arc<dyn ChannelSink>) {
        if let Err(e) = channel
            .broadcast(BroadcastEvent::ConversationCreated {
                conversation: conversation.clone(),
            })
            .await
        {
            tracing::warn!(error = %e, "conversation_created broadcast failed");
        }
    }

    // ── History ───────────────────────────────────────────────────

    /// The model-visible history: user/assistant chat rows only. Tool,
    /// delegation, task-run, and error rows never appear as turns.
    async fn load_history(
        &self,
        conversation_id: &str,
        current_message_id: &str,
    ) -> Result<Vec<ChatMessage>> {
        let rows = self
            .core
            .deps
            .events
            .store()
            .find_by_conversation(conversation_id, ListOptions::default())
            .await?;

        Ok(rows
            .into_iter()
            .filter(|m| m.llm_visible() && m.id != current_message_id)
            .map(|m| match m.role {
                Role::Assistant => ChatMessage::assistant(m.content),
                _ => ChatMessage::user(m.content),
            })
            .collect())
    }

    // ── Auto-naming ───────────────────────────────────────────────

    /// Fire-and-forget title generation once a conversation crosses the
    /// message threshold. At most once per conversation; runs on the namer
    /// client and is not counted into any turn's usage.
    fn maybe_auto_name(&self, conversation: &Conversation, channel: &Arc<dyn ChannelSink>) {
        if conversation.well_known || conversation.manually_named {
            return;
        }
        let threshold = self.core.deps.config.auto_name_message_threshold;
        if self.core.deps.events.message_count(&conversation.id) < threshold {
            return;
        }
        if !self.auto_named.lock().insert(conversation.id.clone()) {
            return;
        }

        let store = self.core.deps.events.store().clone();
        let namer = self
            .namer
            .clone()
            .unwrap_or_else(|| self.core.deps.model.clone());
        let channel = channel.clone();
        let conversation_id = conversation.id.clone();
        let preview = self.core.deps.config.title_preview_chars;

        tokio::spawn(async move {
            let rows = match store
                .find_by_conversation(&conversation_id, ListOptions::limit(6))
                .await
            {
                Ok(rows) => rows,
                Err(e) => {
                    tracing::warn!(error = %e, "auto-naming history load failed");
                    return;
                }
            };
            let snippet: String = rows
                .iter()
                .filter(|m| m.llm_visible())
                .map(|m| m.content.as_str())
                .collect::<Vec<_>>()
                .join("\n");

            let ctx = TurnContext {
                trace_id: String::new(),
                span_id: String::new(),
                conversation_id: conversation_id.clone(),
                turn_id: String::new(),
                purpose: CallPurpose::Naming,
            };
            match namer.complete_text(&prompts::naming_prompt(&snippet), &ctx).await {
                Ok(title) => {
                    let title = derive_title(title.trim(), preview);
                    match store
                        .update_conversation(&conversation_id, ConversationPatch::rename(title))
                        .await
                    {
                        Ok(updated) => {
                            let _ = channel
                                .broadcast(BroadcastEvent::ConversationUpdated {
                                    conversation: updated,
                                })
                                .await;
                        }
                        Err(e) => tracing::warn!(error = %e, "auto-naming update failed"),
                    }
                }
                Err(e) => tracing::warn!(error = %e, "auto-naming model call failed"),
            }
        });
    }

    // ── Turn body ─────────────────────────────────────────────────

    async fn run_turn(
        &self,
        message: &InboundMessage,
        ctx: TurnContext,
        history: Vec<ChatMessage>,
    ) -> Result<()> {
        // Command shortcut: a registered trigger routes straight to
        // delegation, with no top-level model call.
        if let Some(command) = &message.agent_command {
            if let Some(agent_type) = self.registry.resolve_trigger(&command.command) {
                let request = DelegationRequest {
                    agent_type: agent_type.to_string(),
                    mission: command
                        .args
                        .clone()
                        .unwrap_or_else(|| message.text.clone()),
                    custom_name: None,
                    custom_emoji: None,
                    rationale: Some(format!("command trigger '{}'", command.command)),
                };
                self.handle_delegation_from_tool(request, message, &ctx, &history)
                    .await?;
                return Ok(());
            }
            tracing::warn!(command = %command.command, "unknown agent command, running turn normally");
        }

        let policy = self
            .core
            .capabilities
            .effective_policy(message.allowed_tools.as_ref());
        let setup = TurnSetup {
            ctx,
            system_prompt: self.core.system_prompt(&policy),
            history,
            user_text: message.text.clone(),
            policy,
            stream_to_channel: true,
        };

        let delegator = SupervisorDelegator {
            supervisor: self,
            message,
        };
        run_tool_loop(&self.core, &setup, Some(&delegator)).await?;
        Ok(())
    }

    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
    // Delegation
    // ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

    /// Guarded delegation entry: at most one worker per parent message.
    /// On failure the supervisor answers directly instead of surfacing the
    /// delegation error to the user.
    async fn handle_delegation_from_tool(
        &self,
        request: DelegationRequest,
        message: &InboundMessage,
        ctx: &TurnContext,
        history: &[ChatMessage],
    ) -> Result<Delegated> {
        if !self.delegated.insert_if_absent(&message.id) {
            tracing::warn!(message_id = %message.id, "duplicate delegate call ignored");
            return Ok(Delegated {
                text: "A specialist already handled a delegation for this message; \
                       no further worker was spawned."
                    .into(),
                citations: Vec::new(),
            });
        }

        let mission = request.mission.clone();
        match self.delegate_mission(request, message, ctx, history).await {
            Ok(delegated) => Ok(delegated),
            Err(e) => {
                tracing::warn!(error = %e, "delegation failed, synthesizing direct response");
                let fallback_ctx = TurnContext {
                    purpose: CallPurpose::Fallback,
                    ..ctx.clone()
                };
                let prompt = format!(
                    "A specialist hand-off did not work out, so answer this \
                     yourself, directly and completely.\n\n{mission}"
                );
                let text = self
                    .core
                    .deps
                    .model
                    .complete_text(&prompt, &fallback_ctx)
                    .await?;
                Ok(Delegated {
                    text,
                    citations: Vec::new(),
                })
            }
        }
    }

    /// Spawn a worker for one mission and await its synchronous result.
    async fn delegate_mission(
        &self,
        request: DelegationRequest,
        message: &InboundMessage,
        ctx: &TurnContext,
        history: &[ChatMessage],
    ) -> Result<Delegated> {
        let channel = self.core.channel()?;
        let template = self.registry.template_or_generic(&request.agent_type);
        let identity = self.registry.build_identity(
            &request.agent_type,
            request.custom_name.as_deref(),
            request.custom_emoji.as_deref(),
        );
        let agent_id = identity.id.clone();

        let assignment_id =
            self.tracker
                .create_assignment(&request.mission, &self.core.identity.id, &agent_id);
        let info = DelegationInfo {
            task_id: assignment_id.clone(),
            agent_type: request.agent_type.clone(),
            agent_id: agent_id.clone(),
            mission: request.mission.clone(),
            rationale: request.rationale.clone(),
        };
        self.core
            .deps
            .events
            .emit_delegation_event(&info, &ctx.conversation_id, &ctx.turn_id, &channel)
            .await?;

        let worker = WorkerAgent::new(
            WorkerConfig {
                identity: identity.clone(),
                tool_policy: template.tool_policy.clone(),
                system_prompt: template
                    .system_prompt
                    .clone()
                    .unwrap_or_else(|| prompts::WORKER_PROMPT.into()),
                collapse_by_default: template.collapse_by_default,
                workflow_id: template.workflow_id.clone(),
                max_concurrent_tasks: 1,
            },
            self.core.identity.clone(),
            assignment_id.clone(),
            self.tracker.clone(),
            self.core.deps.clone(),
        );
        self.registry.register_instance(identity);

        // A short history tail gives the worker conversational footing
        // without handing it the whole transcript.
        let snippet: Vec<ChatMessage> = history
            .iter()
            .rev()
            .take(4)
            .rev()
            .cloned()
            .collect();

        let outcome = worker
            .handle_delegated_task(message, &request.mission, channel, ctx, snippet)
            .await;
        self.registry.remove_instance(&agent_id);

        // The worker recorded its task_result before resolving; drain it.
        let drained = self.tracker.take_result(&agent_id).unwrap_or(outcome);
        match drained.status {
            WorkerStatus::Completed => Ok(Delegated {
                text: drained.result,
                citations: drained.citations,
            }),
            WorkerStatus::Failed => Err(Error::Delegation(drained.result)),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Delegator wiring
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct SupervisorDelegator<'s> {
    supervisor: &'s SupervisorAgent,
    message: &'s InboundMessage,
}

#[async_trait]
impl Delegator for SupervisorDelegator<'_> {
    async fn handle_delegate(
        &self,
        arguments: &serde_json::Value,
        setup: &TurnSetup,
    ) -> Result<Delegated> {
        let request = DelegationRequest::from_tool_args(arguments)?;
        self.supervisor
            .handle_delegation_from_tool(request, self.message, &setup.ctx, &setup.history)
            .await
    }

    async fn handle_delegate_todo(
        &self,
        todo: &TurnTodo,
        setup: &TurnSetup,
    ) -> Result<Delegated> {
        // Plan items bypass the per-message delegate guard: a plan spawns
        // one worker per item by design. Failures propagate to the loop,
        // which marks the item and moves on.
        let request = DelegationRequest {
            agent_type: todo.agent_type.clone(),
            mission: todo.title.clone(),
            custom_name: None,
            custom_emoji: None,
            rationale: Some("plan item".into()),
        };
        self.supervisor
            .delegate_mission(request, self.message, &setup.ctx, &setup.history)
            .await
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Helpers
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Derive a short title from message text, cutting on a char boundary.
pub(crate) fn derive_title(text: &str, max_chars: usize) -> String {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return "New conversation".into();
    }
    let first_line = trimmed.lines().next().unwrap_or(trimmed);
    if first_line.chars().count() <= max_chars {
        first_line.to_string()
    } else {
        let cut: String = first_line.chars().take(max_chars).collect();
        format!("{}…", cut.trim_end())
    }
}
