//! System prompt assembly.
//!
//! Prompts compose from a base plus conditional sections gated on the
//! effective tool allow-list: an agent that cannot delegate never reads
//! delegation instructions. Plan mode swaps the whole prompt for a
//! deliberately narrow one.

use fm_domain::config::ToolPolicy;
use fm_domain::todo::{TodoStatus, TurnTodo};

use crate::agent::builtin;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Base prompts
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub const SUPERVISOR_PROMPT: &str = "\
You are the lead assistant. You answer the user directly when you can, \
use tools when they help, and hand focused missions to specialist agents \
when depth is needed. Be concise and concrete; never invent tool output.";

pub const WORKER_PROMPT: &str = "\
You are a specialist agent working on a single delegated mission. Stay on \
the mission, use your tools, and finish with a complete, self-contained \
result your lead can use verbatim.";

pub const WRITER_PROMPT: &str = "\
You are a writing specialist. Produce polished prose that matches the \
requested form and tone. Deliver the finished text, not a plan for it.";

pub const RESEARCHER_PROMPT: &str = "\
You are a research specialist. Search broadly, read critically, and \
report findings with sources. Prefer primary material; flag uncertainty.";

pub const CODER_PROMPT: &str = "\
You are a coding specialist. Write working, idiomatic code for the \
mission and explain only what the caller needs to run it.";

// ── Conditional sections ────────────────────────────────────────────

const DELEGATION_SECTION: &str = "\
## Delegation
Use the `delegate` tool to hand a self-contained mission to a specialist \
agent when the task benefits from focus (writing, research, coding). \
Delegate at most once per user message; fold the specialist's result into \
your answer.";

const BROWSER_SECTION: &str = "\
## Browsing
You can drive a browser via the `browser` tools for pages that need \
interaction. Prefer `web_search` for plain lookups.";

const PLANNING_SECTION: &str = "\
## Planning
For multi-step requests, lay out the steps first with `create_todo`, then \
work through them one at a time with `delegate_todo`. Inspect progress \
with `list_todo`; drop steps that became irrelevant with `cancel_todo`.";

/// Compose the system prompt for an agent: base text plus the sections its
/// effective tool policy actually unlocks.
pub fn compose(base: &str, policy: &ToolPolicy) -> String {
    let mut prompt = base.to_string();
    if policy.allows(builtin::DELEGATE) {
        prompt.push_str("\n\n");
        prompt.push_str(DELEGATION_SECTION);
    }
    if policy.allows("browser") {
        prompt.push_str("\n\n");
        prompt.push_str(BROWSER_SECTION);
    }
    if policy.allows(builtin::CREATE_TODO) {
        prompt.push_str("\n\n");
        prompt.push_str(PLANNING_SECTION);
    }
    prompt
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Plan mode
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

fn status_marker(status: TodoStatus) -> &'static str {
    match status {
        TodoStatus::Pending => "[ ]",
        TodoStatus::InProgress => "[~]",
        TodoStatus::Completed => "[x]",
        TodoStatus::Cancelled => "[-]",
    }
}

/// The narrowed prompt used between plan-item delegations: pick the next
/// pending item, nothing else.
pub fn plan_mode(todos: &[TurnTodo]) -> String {
    let mut prompt = String::from(
        "You are executing a plan. Pick the next pending item and hand it \
         off with `delegate_todo`. Do not answer the user yet.\n\nPlan:\n",
    );
    for todo in todos {
        prompt.push_str(&format!(
            "- {} {} ({})\n",
            status_marker(todo.status),
            todo.title,
            todo.agent_type
        ));
    }
    prompt
}

/// Assistant note appended once every plan item is settled, so the model
/// can synthesize a final answer from the outcomes.
pub fn plan_outcomes_note(todos: &[TurnTodo]) -> String {
    let mut note = String::from("All plan items are settled. Outcomes:\n");
    for todo in todos {
        let outcome = match (&todo.status, &todo.outcome) {
            (TodoStatus::Cancelled, _) => "cancelled".to_string(),
            (_, Some(outcome)) => outcome.clone(),
            (status, None) => format!("{status:?}").to_lowercase(),
        };
        note.push_str(&format!("- {}: {}\n", todo.title, outcome));
    }
    note.push_str("Synthesize the final answer for the user from these outcomes.");
    note
}

/// Render a short conversation title prompt for the auto-namer.
pub fn naming_prompt(first_messages: &str) -> String {
    format!(
        "Write a title of at most six words for a conversation that starts \
         like this. Reply with the title only.\n\n{first_messages}"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_policy_unlocks_all_sections() {
        let prompt = compose(SUPERVISOR_PROMPT, &ToolPolicy::default());
        assert!(prompt.contains("## Delegation"));
        assert!(prompt.contains("## Browsing"));
        assert!(prompt.contains("## Planning"));
    }

    #[test]
    fn narrow_policy_strips_sections() {
        let policy = ToolPolicy::only(&["web_search"]);
        let prompt = compose(SUPERVISOR_PROMPT, &policy);
        assert!(!prompt.contains("## Delegation"));
        assert!(!prompt.contains("## Browsing"));
        assert!(!prompt.contains("## Planning"));
        assert!(prompt.contains("lead assistant"));
    }

    #[test]
    fn denying_delegate_strips_delegation_only() {
        let policy = ToolPolicy {
            allow: vec![],
            deny: vec!["delegate".into()],
        };
        let prompt = compose(SUPERVISOR_PROMPT, &policy);
        assert!(!prompt.contains("## Delegation"));
        assert!(prompt.contains("## Planning"));
    }

    #[test]
    fn plan_mode_lists_statuses() {
        let mut a = TurnTodo::new("t1", "draft outline", "writer");
        a.status = TodoStatus::Completed;
        let b = TurnTodo::new("t1", "write intro", "writer");
        let prompt = plan_mode(&[a, b]);
        assert!(prompt.contains("[x] draft outline"));
        assert!(prompt.contains("[ ] write intro"));
        assert!(prompt.contains("delegate_todo"));
    }

    #[test]
    fn outcomes_note_prefers_recorded_outcomes() {
        let mut a = TurnTodo::new("t1", "step one", "writer");
        a.status = TodoStatus::Completed;
        a.outcome = Some("wrote 3 paragraphs".into());
        let mut b = TurnTodo::new("t1", "step two", "writer");
        b.status = TodoStatus::Cancelled;
        let note = plan_outcomes_note(&[a, b]);
        assert!(note.contains("step one: wrote 3 paragraphs"));
        assert!(note.contains("step two: cancelled"));
    }
}
