//! Worker agents: single-mission specialists spawned by a supervisor.
//!
//! A worker runs the same bounded tool loop as its parent, but with
//! `can_spawn_agents = false` and the template's tool policy: workers may
//! not delegate further. Its terminal state drives a synchronous
//! `task_result` into the delegation tracker before `handle_delegated_task`
//! returns; this is the contract the supervisor relies on to capture output.

use std::sync::Arc;

use parking_lot::Mutex;

use fm_domain::config::ToolPolicy;
use fm_domain::llm::ChatMessage;
use fm_domain::message::InboundMessage;

use super::turn::{run_tool_loop, TurnSetup};
use super::{AgentCore, AgentIdentity, Capabilities, KernelDeps};
use crate::delegation::{DelegationTracker, WorkerOutcome, WorkerStatus};
use crate::ports::{CallPurpose, ChannelSink, SpanMeta, TraceStatus, TurnContext};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Working,
    Failed,
}

/// Configuration derived from the specialist template at spawn time.
#[derive(Clone)]
pub struct WorkerConfig {
    pub identity: AgentIdentity,
    pub tool_policy: ToolPolicy,
    pub system_prompt: String,
    /// Collapsed workers report only to their parent; no channel stream.
    pub collapse_by_default: bool,
    /// Hint for well-known pipelines (deep-research, self-coding).
    pub workflow_id: Option<String>,
    pub max_concurrent_tasks: usize,
}

pub struct WorkerAgent {
    core: AgentCore,
    state: Mutex<WorkerState>,
    tracker: Arc<DelegationTracker>,
    parent: AgentIdentity,
    assignment_id: String,
    collapse_by_default: bool,
    workflow_id: Option<String>,
}

impl WorkerAgent {
    pub fn new(
        config: WorkerConfig,
        parent: AgentIdentity,
        assignment_id: String,
        tracker: Arc<DelegationTracker>,
        deps: KernelDeps,
    ) -> Self {
        let core = AgentCore::new(
            config.identity,
            Capabilities {
                can_spawn_agents: false,
                tool_policy: config.tool_policy,
            },
            config.system_prompt,
            deps,
        );
        core.init();
        Self {
            core,
            state: Mutex::new(WorkerState::Idle),
            tracker,
            parent,
            assignment_id,
            collapse_by_default: config.collapse_by_default,
            workflow_id: config.workflow_id,
        }
    }

    pub fn identity(&self) -> &AgentIdentity {
        &self.core.identity
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    /// Carry out one delegated mission to completion.
    ///
    /// Reports `started`, runs the tool loop, and records the
    /// `task_result` in the tracker *before* returning, so the parent's
    /// post-await read always observes it. Never panics the caller: a
    /// failed mission comes back as a `Failed` outcome.
    pub async fn handle_delegated_task(
        &self,
        original: &InboundMessage,
        mission: &str,
        channel: Arc<dyn ChannelSink>,
        parent_ctx: &TurnContext,
        history_snippet: Vec<ChatMessage>,
    ) -> WorkerOutcome {
        *self.state.lock() = WorkerState::Working;
        self.core.register_channel(channel);
        self.tracker.mark_started(&self.assignment_id);

        tracing::info!(
            agent_id = %self.core.identity.id,
            parent = %self.parent.id,
            message_id = %original.id,
            workflow_id = self.workflow_id.as_deref().unwrap_or("none"),
            "worker started"
        );

        let span_id = self.core.deps.traces.start_span(SpanMeta {
            trace_id: parent_ctx.trace_id.clone(),
            parent_span_id: Some(parent_ctx.span_id.clone()),
            name: format!("worker.{}", self.core.identity.agent_type),
            agent_id: Some(self.core.identity.id.clone()),
            role: Some("worker".into()),
        });

        let policy = self.core.capabilities.tool_policy.clone();
        let setup = TurnSetup {
            ctx: TurnContext {
                trace_id: parent_ctx.trace_id.clone(),
                span_id: span_id.clone(),
                conversation_id: parent_ctx.conversation_id.clone(),
                turn_id: parent_ctx.turn_id.clone(),
                purpose: CallPurpose::Chat,
            },
            system_prompt: self.core.system_prompt(&policy),
            history: history_snippet,
            user_text: mission.to_string(),
            policy,
            stream_to_channel: !self.collapse_by_default,
        };

        let outcome = match run_tool_loop(&self.core, &setup, None).await {
            Ok(turn) => {
                self.core
                    .deps
                    .traces
                    .end_span(&span_id, TraceStatus::Ok, None);
                *self.state.lock() = WorkerState::Idle;
                WorkerOutcome {
                    result: turn.text,
                    status: WorkerStatus::Completed,
                    citations: turn
                        .citations
                        .citations
                        .into_iter()
                        .map(|c| c.source)
                        .collect(),
                }
            }
            Err(e) => {
                tracing::warn!(
                    agent_id = %self.core.identity.id,
                    error = %e,
                    "worker mission failed"
                );
                self.core
                    .deps
                    .traces
                    .end_span(&span_id, TraceStatus::Error, Some(&e.to_string()));
                *self.state.lock() = WorkerState::Failed;
                WorkerOutcome::failed(e.to_string())
            }
        };

        // Synchronous task_result: recorded before this function resolves.
        self.tracker
            .complete(&self.assignment_id, &self.core.identity.id, outcome.clone());
        outcome
    }
}
