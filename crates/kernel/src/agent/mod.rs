//! Agents: the shared core plus the supervisor and worker built on it.

pub mod builtin;
pub mod supervisor;
pub mod turn;
pub mod worker;

use std::sync::Arc;

use parking_lot::RwLock;
use serde::Serialize;

use fm_domain::citation::CitationData;
use fm_domain::config::{KernelConfig, ToolPolicy};
use fm_domain::llm::TurnUsage;
use fm_domain::message::{MessageMeta, StoredMessage};
use fm_domain::{Error, Result};

use crate::events::MessageEventService;
use crate::ports::{caller_id, ChannelSink, ModelClient, ToolRunner, TraceRecorder};
use crate::prompts;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Identity & capabilities
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize)]
pub struct AgentIdentity {
    pub id: String,
    pub agent_type: String,
    pub name: String,
    pub emoji: String,
}

impl AgentIdentity {
    pub fn supervisor(name: &str) -> Self {
        Self {
            id: format!("supervisor-{name}"),
            agent_type: "supervisor".into(),
            name: name.into(),
            emoji: "🧭".into(),
        }
    }

    /// Stamp this identity into message metadata.
    pub fn stamp(&self, meta: &mut MessageMeta) {
        meta.agent_id = Some(self.id.clone());
        meta.agent_type = Some(self.agent_type.clone());
        meta.agent_name = Some(self.name.clone());
        meta.agent_emoji = Some(self.emoji.clone());
    }
}

#[derive(Debug, Clone)]
pub struct Capabilities {
    pub can_spawn_agents: bool,
    pub tool_policy: ToolPolicy,
}

impl Capabilities {
    pub fn unrestricted() -> Self {
        Self {
            can_spawn_agents: true,
            tool_policy: ToolPolicy::default(),
        }
    }

    /// The effective policy for one turn: this agent's policy, narrowed by
    /// the turn's allow list when the ingress carried one (task runs).
    pub fn effective_policy(&self, turn_allowed: Option<&Vec<String>>) -> ToolPolicy {
        match turn_allowed {
            Some(allowed) => self.tool_policy.restrict(allowed),
            None => self.tool_policy.clone(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Shared collaborators
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Process-wide collaborators injected into every agent by reference.
#[derive(Clone)]
pub struct KernelDeps {
    pub events: Arc<MessageEventService>,
    pub traces: Arc<dyn TraceRecorder>,
    pub model: Arc<dyn ModelClient>,
    pub tools: Arc<dyn ToolRunner>,
    pub config: Arc<KernelConfig>,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent core
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// State and behaviour shared by supervisors and workers: identity,
/// capabilities, prompt assembly, the bound channel, and the canonical
/// assistant write path.
pub struct AgentCore {
    pub identity: AgentIdentity,
    pub capabilities: Capabilities,
    /// Base system prompt before conditional sections.
    pub base_prompt: String,
    channel: RwLock<Option<Arc<dyn ChannelSink>>>,
    pub deps: KernelDeps,
}

impl AgentCore {
    pub fn new(
        identity: AgentIdentity,
        capabilities: Capabilities,
        base_prompt: impl Into<String>,
        deps: KernelDeps,
    ) -> Self {
        Self {
            identity,
            capabilities,
            base_prompt: base_prompt.into(),
            channel: RwLock::new(None),
            deps,
        }
    }

    pub fn init(&self) {
        tracing::info!(
            agent_id = %self.identity.id,
            agent_type = %self.identity.agent_type,
            can_spawn = self.capabilities.can_spawn_agents,
            "agent initialized"
        );
    }

    pub fn shutdown(&self) {
        *self.channel.write() = None;
        tracing::info!(agent_id = %self.identity.id, "agent shut down");
    }

    /// Bind the channel this agent speaks through.
    pub fn register_channel(&self, channel: Arc<dyn ChannelSink>) {
        *self.channel.write() = Some(channel);
    }

    /// The bound channel, or a configuration failure when none is bound;
    /// a turn must abort before any model call in that case.
    pub fn channel(&self) -> Result<Arc<dyn ChannelSink>> {
        self.channel
            .read()
            .clone()
            .ok_or_else(|| Error::Config(format!("no channel bound for {}", self.identity.id)))
    }

    /// System prompt for a given effective policy: the base prompt plus
    /// the sections that policy unlocks.
    pub fn system_prompt(&self, policy: &ToolPolicy) -> String {
        prompts::compose(&self.base_prompt, policy)
    }

    pub fn caller_id(&self, conversation_id: &str) -> String {
        caller_id(&self.identity.id, conversation_id)
    }

    /// Canonical write path for all streamed or final assistant output.
    pub async fn save_assistant_message_with_context(
        &self,
        content: &str,
        conversation_id: &str,
        turn_id: &str,
        citations: Option<&CitationData>,
        usage: Option<&TurnUsage>,
    ) -> Result<StoredMessage> {
        let channel = self.channel()?;
        self.deps
            .events
            .save_assistant(
                content,
                conversation_id,
                turn_id,
                &self.identity,
                citations,
                usage,
                &channel,
            )
            .await
    }

    /// Plain assistant send without citations or usage.
    pub async fn send_message(
        &self,
        content: &str,
        conversation_id: &str,
        turn_id: &str,
    ) -> Result<StoredMessage> {
        self.save_assistant_message_with_context(content, conversation_id, turn_id, None, None)
            .await
    }
}
