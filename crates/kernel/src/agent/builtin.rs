//! Kernel built-in tools.
//!
//! Delegation and plan tools are executed by the kernel itself, not by the
//! tool runner: they mutate orchestration state (workers, todos). Their
//! descriptors are appended to whatever the runner exposes, gated on the
//! agent's capabilities.

use fm_domain::config::ToolPolicy;
use fm_domain::llm::ToolDescriptor;

pub const DELEGATE: &str = "delegate";
pub const DELEGATE_TODO: &str = "delegate_todo";
pub const CREATE_TODO: &str = "create_todo";
pub const LIST_TODO: &str = "list_todo";
pub const CANCEL_TODO: &str = "cancel_todo";

/// Default specialist type for plan items that don't name one.
pub const DEFAULT_PLAN_AGENT: &str = "worker";

/// Tools the kernel executes itself.
pub fn is_builtin(name: &str) -> bool {
    matches!(
        name,
        DELEGATE | DELEGATE_TODO | CREATE_TODO | LIST_TODO | CANCEL_TODO
    )
}

/// Plan tools that run locally against the todo store (no worker spawn).
pub fn is_plan_tool(name: &str) -> bool {
    matches!(name, CREATE_TODO | LIST_TODO | CANCEL_TODO)
}

fn delegate_def() -> ToolDescriptor {
    ToolDescriptor {
        name: DELEGATE.into(),
        description: "Hand a self-contained mission to a specialist agent. \
                      Returns the specialist's final result."
            .into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "type": { "type": "string", "description": "Specialist type (e.g. 'writer', 'researcher')" },
                "mission": { "type": "string", "description": "The complete mission statement" },
                "custom_name": { "type": "string", "description": "Optional display name override" },
                "custom_emoji": { "type": "string", "description": "Optional emoji override" },
                "rationale": { "type": "string", "description": "Why this is being delegated" }
            },
            "required": ["type", "mission"]
        }),
    }
}

fn create_todo_def() -> ToolDescriptor {
    ToolDescriptor {
        name: CREATE_TODO.into(),
        description: "Add plan items for this turn. Use for multi-step requests.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "title": { "type": "string" },
                            "agent_type": { "type": "string", "description": "Specialist to carry the item out" }
                        },
                        "required": ["title"]
                    }
                }
            },
            "required": ["items"]
        }),
    }
}

fn list_todo_def() -> ToolDescriptor {
    ToolDescriptor {
        name: LIST_TODO.into(),
        description: "List this turn's plan items and their statuses.".into(),
        parameters: serde_json::json!({ "type": "object", "properties": {} }),
    }
}

fn cancel_todo_def() -> ToolDescriptor {
    ToolDescriptor {
        name: CANCEL_TODO.into(),
        description: "Cancel a plan item that is no longer needed.".into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "todo_id": { "type": "string" }
            },
            "required": ["todo_id"]
        }),
    }
}

fn delegate_todo_def() -> ToolDescriptor {
    ToolDescriptor {
        name: DELEGATE_TODO.into(),
        description: "Hand the next plan item to its specialist. \
                      Defaults to the first pending item."
            .into(),
        parameters: serde_json::json!({
            "type": "object",
            "properties": {
                "todo_id": { "type": "string", "description": "Item to run; omit for the next pending one" }
            }
        }),
    }
}

/// Built-in descriptors for a full-capability turn, filtered by policy.
/// `can_delegate` reflects both the agent's capabilities and whether a
/// delegation handler is actually wired in.
pub fn descriptors(policy: &ToolPolicy, can_delegate: bool) -> Vec<ToolDescriptor> {
    let mut defs = Vec::new();
    if can_delegate {
        if policy.allows(DELEGATE) {
            defs.push(delegate_def());
        }
        if policy.allows(DELEGATE_TODO) {
            defs.push(delegate_todo_def());
        }
    }
    if policy.allows(CREATE_TODO) {
        defs.push(create_todo_def());
    }
    if policy.allows(LIST_TODO) {
        defs.push(list_todo_def());
    }
    if policy.allows(CANCEL_TODO) {
        defs.push(cancel_todo_def());
    }
    defs
}

/// The narrowed descriptor set used in plan mode.
pub fn plan_mode_descriptors() -> Vec<ToolDescriptor> {
    vec![
        delegate_todo_def(),
        list_todo_def(),
        cancel_todo_def(),
        create_todo_def(),
    ]
}

/// The narrowed policy used in plan mode.
pub fn plan_mode_policy() -> ToolPolicy {
    ToolPolicy::only(&[DELEGATE_TODO, LIST_TODO, CANCEL_TODO, CREATE_TODO])
}
