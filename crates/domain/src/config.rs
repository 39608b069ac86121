//! Kernel configuration, loadable from TOML.
//!
//! Every tunable the orchestration loop depends on lives here so hosts can
//! override them without recompiling. All fields have serde defaults; an
//! empty TOML document yields a working configuration.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::task::Task;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tool policy
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Tool allow/deny policy with prefix-based matching.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ToolPolicy {
    /// Tool name prefixes this agent may use. `["*"]` or empty = unrestricted.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Tool name prefixes this agent is denied (evaluated before allow).
    #[serde(default)]
    pub deny: Vec<String>,
}

impl ToolPolicy {
    /// Policy allowing exactly the given tool names.
    pub fn only(names: &[&str]) -> Self {
        Self {
            allow: names.iter().map(|n| n.to_string()).collect(),
            deny: Vec::new(),
        }
    }

    /// Check whether the given tool name is permitted by this policy.
    ///
    /// Matching is case-insensitive; tool names are normalized to
    /// lowercase before comparison. Deny always wins over allow; a prefix
    /// entry covers the whole `prefix.*`/`prefix_*` subtree.
    pub fn allows(&self, tool_name: &str) -> bool {
        let name = tool_name.to_ascii_lowercase();

        for d in &self.deny {
            let d_lower = d.to_ascii_lowercase();
            if d_lower == "*" || name == d_lower || prefix_match(&name, &d_lower) {
                return false;
            }
        }
        if self.allow.is_empty() || self.allow.iter().any(|a| a == "*") {
            return true;
        }
        for a in &self.allow {
            let a_lower = a.to_ascii_lowercase();
            if name == a_lower || prefix_match(&name, &a_lower) {
                return true;
            }
        }
        false
    }

    /// Narrow this policy by a per-turn allow list (task runs). The result
    /// permits a tool only when both this policy and the list do; an empty
    /// list means no extra restriction.
    pub fn restrict(&self, allowed: &[String]) -> ToolPolicy {
        if allowed.is_empty() {
            return self.clone();
        }
        ToolPolicy {
            allow: allowed
                .iter()
                .filter(|name| self.allows(name))
                .cloned()
                .collect(),
            deny: self.deny.clone(),
        }
    }
}

fn prefix_match(name: &str, prefix: &str) -> bool {
    name.starts_with(&format!("{prefix}.")) || name.starts_with(&format!("{prefix}_"))
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Agent templates
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// Declarative definition of a specialist agent type. The registry layers
/// these (from `[agents.<type>]` tables) over its built-in set.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentTemplate {
    /// Display name; defaults to the capitalized agent type.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub emoji: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Specialist system prompt. Unset = the generic worker prompt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub system_prompt: Option<String>,
    #[serde(default)]
    pub tool_policy: ToolPolicy,
    /// Skill names this type may load.
    #[serde(default)]
    pub skills: Vec<String>,
    /// Chat commands that route straight to this type without a model call.
    #[serde(default)]
    pub command_triggers: Vec<String>,
    /// Hint for well-known multi-step pipelines (deep-research, self-coding).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_id: Option<String>,
    /// Collapsed types report only to their parent; their final text is not
    /// sent through the channel.
    #[serde(default)]
    pub collapse_by_default: bool,
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Kernel configuration
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    #[serde(default = "d_60")]
    pub tick_secs: u64,
    /// Conversation used when a task names none.
    #[serde(default = "d_feed")]
    pub default_conversation: String,
    #[serde(default)]
    pub tasks: Vec<Task>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_secs: d_60(),
            default_conversation: d_feed(),
            tasks: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KernelConfig {
    /// How long a message id stays in the dedup set; retries inside the
    /// window are dropped.
    #[serde(default = "d_300")]
    pub message_dedup_window_secs: u64,
    /// A message with no conversation id reuses a conversation updated
    /// within this window instead of creating a new one.
    #[serde(default = "d_600")]
    pub recent_conversation_window_secs: u64,
    /// Message count after which an unnamed conversation gets an
    /// auto-generated title.
    #[serde(default = "d_3")]
    pub auto_name_message_threshold: u64,
    #[serde(default = "d_10")]
    pub max_tool_iterations: u32,
    /// Cap while the turn has open plan items.
    #[serde(default = "d_30")]
    pub max_tool_iterations_with_plan: u32,
    /// Derived conversation titles are cut to this many characters.
    #[serde(default = "d_64")]
    pub title_preview_chars: usize,
    /// Fixed conversation ids reserved for scheduled/system activity.
    #[serde(default = "d_well_known")]
    pub well_known_conversations: Vec<String>,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Specialist templates layered over the registry's built-ins.
    #[serde(default)]
    pub agents: HashMap<String, AgentTemplate>,
}

impl Default for KernelConfig {
    fn default() -> Self {
        toml::from_str("").expect("empty config must deserialize")
    }
}

impl KernelConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }

    pub fn load(path: &std::path::Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_secs(self.message_dedup_window_secs)
    }

    pub fn recent_conversation_window(&self) -> Duration {
        Duration::from_secs(self.recent_conversation_window_secs)
    }

    pub fn is_well_known(&self, conversation_id: &str) -> bool {
        self.well_known_conversations
            .iter()
            .any(|id| id == conversation_id)
    }
}

// ── serde default helpers ───────────────────────────────────────────

fn d_3() -> u64 {
    3
}
fn d_10() -> u32 {
    10
}
fn d_30() -> u32 {
    30
}
fn d_60() -> u64 {
    60
}
fn d_64() -> usize {
    64
}
fn d_300() -> u64 {
    300
}
fn d_600() -> u64 {
    600
}
fn d_feed() -> String {
    "feed".into()
}
fn d_well_known() -> Vec<String> {
    vec!["feed".into()]
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Tests
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
