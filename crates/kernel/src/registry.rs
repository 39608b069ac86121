//! Agent template registry.
//!
//! Specialist types are data, not code: each is an [`AgentTemplate`]
//! (identity, tool policy, skills, command triggers, workflow hints)
//! loaded from config over a built-in set. The registry also tracks live
//! worker instances so hosts can inspect what is currently running.

use std::collections::HashMap;

use parking_lot::Mutex;

use fm_domain::config::{AgentTemplate, KernelConfig, ToolPolicy};

use crate::agent::AgentIdentity;
use crate::prompts;

pub struct AgentRegistry {
    templates: HashMap<String, AgentTemplate>,
    /// command → agent type.
    triggers: HashMap<String, String>,
    instances: Mutex<HashMap<String, AgentIdentity>>,
}

impl AgentRegistry {
    /// Built-in templates layered under whatever the config declares.
    fn builtin_templates() -> HashMap<String, AgentTemplate> {
        let mut templates = HashMap::new();

        templates.insert(
            "writer".to_string(),
            AgentTemplate {
                emoji: Some("✍️".into()),
                description: Some("long-form and creative writing".into()),
                system_prompt: Some(prompts::WRITER_PROMPT.into()),
                ..Default::default()
            },
        );

        templates.insert(
            "researcher".to_string(),
            AgentTemplate {
                emoji: Some("🔎".into()),
                description: Some("web research with citations".into()),
                system_prompt: Some(prompts::RESEARCHER_PROMPT.into()),
                tool_policy: ToolPolicy::only(&["web_search", "browser"]),
                command_triggers: vec!["research".into()],
                workflow_id: Some("deep-research".into()),
                ..Default::default()
            },
        );

        templates.insert(
            "coder".to_string(),
            AgentTemplate {
                emoji: Some("🛠️".into()),
                description: Some("code writing and refactoring".into()),
                system_prompt: Some(prompts::CODER_PROMPT.into()),
                workflow_id: Some("self-coding".into()),
                ..Default::default()
            },
        );

        templates
    }

    pub fn from_config(config: &KernelConfig) -> Self {
        let mut templates = Self::builtin_templates();
        for (agent_type, template) in &config.agents {
            templates.insert(agent_type.clone(), template.clone());
        }

        let mut triggers = HashMap::new();
        for (agent_type, template) in &templates {
            for command in &template.command_triggers {
                if let Some(previous) =
                    triggers.insert(command.to_lowercase(), agent_type.clone())
                {
                    tracing::warn!(
                        command,
                        previous = %previous,
                        winner = %agent_type,
                        "duplicate command trigger"
                    );
                }
            }
        }

        tracing::info!(
            types = templates.len(),
            triggers = triggers.len(),
            "agent registry loaded"
        );

        Self {
            templates,
            triggers,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn template(&self, agent_type: &str) -> Option<&AgentTemplate> {
        self.templates.get(agent_type)
    }

    /// Template for the given type, or an unrestricted generic worker for
    /// unknown types.
    pub fn template_or_generic(&self, agent_type: &str) -> AgentTemplate {
        self.templates
            .get(agent_type)
            .cloned()
            .unwrap_or_default()
    }

    /// Registered types, sorted.
    pub fn types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.templates.keys().cloned().collect();
        types.sort();
        types
    }

    /// Resolve a chat command to its specialist type.
    pub fn resolve_trigger(&self, command: &str) -> Option<&str> {
        self.triggers.get(&command.to_lowercase()).map(|s| s.as_str())
    }

    /// Build a worker identity from a template, with optional overrides.
    pub fn build_identity(
        &self,
        agent_type: &str,
        custom_name: Option<&str>,
        custom_emoji: Option<&str>,
    ) -> AgentIdentity {
        let template = self.template_or_generic(agent_type);
        let short: String = uuid::Uuid::new_v4().to_string().chars().take(8).collect();
        let name = custom_name
            .map(String::from)
            .or(template.name)
            .unwrap_or_else(|| capitalize(agent_type));
        let emoji = custom_emoji
            .map(String::from)
            .or(template.emoji)
            .unwrap_or_else(|| "🤖".into());
        AgentIdentity {
            id: format!("{agent_type}-{short}"),
            agent_type: agent_type.to_string(),
            name,
            emoji,
        }
    }

    // ── Live instances ────────────────────────────────────────────

    pub fn register_instance(&self, identity: AgentIdentity) {
        self.instances.lock().insert(identity.id.clone(), identity);
    }

    pub fn remove_instance(&self, agent_id: &str) {
        self.instances.lock().remove(agent_id);
    }

    pub fn instances(&self) -> Vec<AgentIdentity> {
        let instances = self.instances.lock();
        let mut all: Vec<AgentIdentity> = instances.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }
}

fn capitalize(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}
