//! End-to-end kernel scenarios against scripted collaborators.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use fm_domain::citation::CitationSource;
use fm_domain::config::KernelConfig;
use fm_domain::llm::Role;
use fm_domain::message::{AgentCommand, Conversation, InboundMessage, MessageKind, StoredMessage};
use fm_domain::task::Task;
use fm_domain::todo::TodoStatus;
use fm_kernel::agent::KernelDeps;
use fm_kernel::delegation::AssignmentStatus;
use fm_kernel::events::MessageEventService;
use fm_kernel::ports::{CallPurpose, TraceStatus};
use fm_kernel::registry::AgentRegistry;
use fm_kernel::testing::{RecordingChannel, ScriptedModel, ScriptedToolRunner, ScriptedTurn};
use fm_kernel::trace::TraceLog;
use fm_kernel::{MessageRouter, Scheduler, SupervisorAgent};
use fm_store::{ConversationStore, ListOptions, MemoryStore};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Harness
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

struct Harness {
    store: Arc<MemoryStore>,
    events: Arc<MessageEventService>,
    traces: Arc<TraceLog>,
    model: Arc<ScriptedModel>,
    namer: Arc<ScriptedModel>,
    tools: Arc<ScriptedToolRunner>,
    channel: Arc<RecordingChannel>,
    config: Arc<KernelConfig>,
    supervisor: Arc<SupervisorAgent>,
}

fn harness() -> Harness {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();

    let store = Arc::new(MemoryStore::new());
    store.seed_well_known("feed", "Feed");

    let events = Arc::new(MessageEventService::new(store.clone()));
    let traces = Arc::new(TraceLog::new());
    let model = Arc::new(ScriptedModel::new());
    let namer = Arc::new(ScriptedModel::new());
    let tools = Arc::new(ScriptedToolRunner::new());
    let channel = Arc::new(RecordingChannel::new());
    let config = Arc::new(KernelConfig::default());

    let deps = KernelDeps {
        events: events.clone(),
        traces: traces.clone(),
        model: model.clone(),
        tools: tools.clone(),
        config: config.clone(),
    };
    let registry = Arc::new(AgentRegistry::from_config(&config));
    let supervisor = Arc::new(SupervisorAgent::new(
        "main",
        registry,
        deps,
        Some(namer.clone()),
    ));
    supervisor.register_channel(channel.clone());

    Harness {
        store,
        events,
        traces,
        model,
        namer,
        tools,
        channel,
        config,
        supervisor,
    }
}

async fn rows(h: &Harness, conversation_id: &str) -> Vec<StoredMessage> {
    h.store
        .find_by_conversation(conversation_id, ListOptions::default())
        .await
        .unwrap()
}

/// The single ad-hoc (non-well-known) conversation created by a test.
async fn sole_conversation(h: &Harness) -> Conversation {
    let all: Vec<Conversation> = h
        .store
        .list_conversations(50)
        .await
        .unwrap()
        .into_iter()
        .filter(|c| !c.well_known)
        .collect();
    assert_eq!(all.len(), 1, "expected exactly one ad-hoc conversation");
    all.into_iter().next().unwrap()
}

const POLL_ATTEMPTS: u32 = 300;
const POLL_INTERVAL: Duration = Duration::from_millis(10);

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 1: direct answer, no tools
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn direct_answer_without_tools() {
    let h = harness();
    h.model.push(ScriptedTurn::text("hello there"));

    let message = InboundMessage::user("hi");
    let message_id = message.id.clone();
    h.supervisor.handle_message(message).await.unwrap();

    let conversation = sole_conversation(&h).await;
    assert_eq!(conversation.title, "hi");

    let all = rows(&h, &conversation.id).await;
    assert_eq!(all.len(), 2);
    assert_eq!(all[0].role, Role::User);
    assert_eq!(all[0].meta.kind, MessageKind::Chat);
    assert_eq!(all[1].role, Role::Assistant);
    assert_eq!(all[1].content, "hello there");
    assert_eq!(all[1].meta.turn_id.as_deref(), Some(message_id.as_str()));
    assert!(all[1].meta.agent_id.is_some());

    // The response streamed through the channel.
    assert_eq!(h.channel.streamed_text(), "hello there");
    assert_eq!(h.channel.stream_starts().len(), 1);

    // One ok trace with ok spans.
    let traces = h.traces.traces();
    assert_eq!(traces.len(), 1);
    assert_eq!(traces[0].status, TraceStatus::Ok);
    let spans = h.traces.spans_for_trace(&traces[0].id);
    assert!(!spans.is_empty());
    assert!(spans.iter().all(|s| s.status == TraceStatus::Ok));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 2: single-tool loop
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn single_tool_loop_persists_ordered_events() {
    let h = harness();
    h.tools.set_output("web_search", "three results about X");
    h.tools.add_citation(
        "web_search",
        CitationSource {
            id: "s1".into(),
            url: "https://example.com/x".into(),
            title: "All about X".into(),
            snippet: None,
        },
    );
    h.model
        .push(ScriptedTurn::tool("web_search", serde_json::json!({"query": "X"})));
    h.model.push(ScriptedTurn::text("X is well documented [1]"));

    let message = InboundMessage::user("search for X");
    let message_id = message.id.clone();
    h.supervisor.handle_message(message).await.unwrap();

    let conversation = sole_conversation(&h).await;
    let all = rows(&h, &conversation.id).await;

    // user → tool events → final assistant, all sharing the turn id.
    assert_eq!(all[0].role, Role::User);
    let kinds: Vec<MessageKind> = all.iter().map(|m| m.meta.kind).collect();
    assert_eq!(
        kinds,
        vec![
            MessageKind::Chat,
            MessageKind::ToolEvent,
            MessageKind::ToolEvent,
            MessageKind::Chat,
        ]
    );
    for row in &all[1..] {
        assert_eq!(row.meta.turn_id.as_deref(), Some(message_id.as_str()));
    }

    let last = all.last().unwrap();
    assert_eq!(last.role, Role::Assistant);
    let usage = last.meta.usage.as_ref().unwrap();
    assert!(usage.total_tokens > 0);
    assert_eq!(last.meta.citations.len(), 1);
    assert_eq!(last.meta.citations[0].url, "https://example.com/x");
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 3: delegation via the delegate tool
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn delegate_tool_spawns_one_worker() {
    let h = harness();
    h.model.push(ScriptedTurn::tool(
        "delegate",
        serde_json::json!({
            "type": "writer",
            "mission": "Write a sonnet about queues",
            "rationale": "verse is specialist work"
        }),
    ));
    // Worker's generation, then the supervisor's continuation.
    h.model
        .push(ScriptedTurn::text("O queue divine, thy order is thy grace"));
    h.model
        .push(ScriptedTurn::text("Here is your sonnet."));

    let message = InboundMessage::user("Write a sonnet about queues");
    let message_id = message.id.clone();
    h.supervisor.handle_message(message).await.unwrap();

    let conversation = sole_conversation(&h).await;
    let all = rows(&h, &conversation.id).await;

    // Exactly one delegation event.
    let delegations: Vec<&StoredMessage> = all
        .iter()
        .filter(|m| m.meta.kind == MessageKind::Delegation)
        .collect();
    assert_eq!(delegations.len(), 1);
    let info = delegations[0].meta.delegation.as_ref().unwrap();
    assert_eq!(info.agent_type, "writer");

    // The worker's final message carries the writer identity.
    let worker_rows: Vec<&StoredMessage> = all
        .iter()
        .filter(|m| m.meta.agent_type.as_deref() == Some("writer") && m.llm_visible())
        .collect();
    assert_eq!(worker_rows.len(), 1);
    assert!(worker_rows[0].content.contains("O queue divine"));

    // Assignment completed, result drained, message marked delegated.
    let assignments = h.supervisor.delegation_tracker().assignments();
    assert_eq!(assignments.len(), 1);
    assert_eq!(assignments[0].status, AssignmentStatus::Completed);
    assert!(h
        .supervisor
        .delegation_tracker()
        .take_result(&assignments[0].agent_id)
        .is_none());
    assert!(h.supervisor.has_delegated(&message_id));
}

#[tokio::test]
async fn second_delegate_for_same_message_is_a_no_op() {
    let h = harness();
    h.model.push(ScriptedTurn::tool(
        "delegate",
        serde_json::json!({"type": "writer", "mission": "first"}),
    ));
    h.model.push(ScriptedTurn::text("worker output"));
    h.model.push(ScriptedTurn::tool(
        "delegate",
        serde_json::json!({"type": "writer", "mission": "second"}),
    ));
    h.model.push(ScriptedTurn::text("final answer"));

    h.supervisor
        .handle_message(InboundMessage::user("do the thing"))
        .await
        .unwrap();

    // Only the first delegate spawned a worker.
    assert_eq!(h.supervisor.delegation_tracker().assignments().len(), 1);
    let conversation = sole_conversation(&h).await;
    let delegation_rows = rows(&h, &conversation.id)
        .await
        .into_iter()
        .filter(|m| m.meta.kind == MessageKind::Delegation)
        .count();
    assert_eq!(delegation_rows, 1);
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 4: command-trigger shortcut
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn command_trigger_skips_the_top_level_model() {
    let h = harness();
    // The only scripted turn belongs to the worker.
    h.model.push(ScriptedTurn::text("Research findings: queues are fine."));

    let mut message = InboundMessage::user("state of queue research");
    message.agent_command = Some(AgentCommand {
        command: "research".into(),
        args: None,
    });
    h.supervisor.handle_message(message).await.unwrap();

    // Exactly one model call, and it came from the researcher worker.
    let requests = h.model.chat_requests();
    assert_eq!(requests.len(), 1);
    assert!(requests[0].0.system.contains("research specialist"));

    let conversation = sole_conversation(&h).await;
    let all = rows(&h, &conversation.id).await;
    let delegation = all
        .iter()
        .find(|m| m.meta.kind == MessageKind::Delegation)
        .unwrap();
    let info = delegation.meta.delegation.as_ref().unwrap();
    assert_eq!(info.agent_type, "researcher");
    assert!(info
        .rationale
        .as_ref()
        .unwrap()
        .contains("command trigger 'research'"));

    // The researcher's message reached the conversation.
    assert!(all
        .iter()
        .any(|m| m.meta.agent_type.as_deref() == Some("researcher") && m.llm_visible()));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 5: plan-driven multi-step
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn plan_driven_turn_walks_todos_in_order() {
    let h = harness();
    h.model.push(ScriptedTurn::tool(
        "create_todo",
        serde_json::json!({"items": [
            {"title": "Do A", "agent_type": "writer"},
            {"title": "Do B", "agent_type": "writer"},
        ]}),
    ));
    h.model
        .push(ScriptedTurn::tool("delegate_todo", serde_json::json!({})));
    h.model.push(ScriptedTurn::text("A is done")); // worker A
    h.model
        .push(ScriptedTurn::tool("delegate_todo", serde_json::json!({})));
    h.model.push(ScriptedTurn::text("B is done")); // worker B
    h.model.push(ScriptedTurn::text("Both steps are complete."));

    let message = InboundMessage::user("Do A, then B");
    let message_id = message.id.clone();
    h.supervisor.handle_message(message).await.unwrap();

    // Todos completed in order with recorded outcomes.
    let todos = h.store.todos_for_turn(&message_id).await.unwrap();
    assert_eq!(todos.len(), 2);
    assert!(todos.iter().all(|t| t.status == TodoStatus::Completed));
    assert_eq!(todos[0].outcome.as_deref(), Some("A is done"));
    assert_eq!(todos[1].outcome.as_deref(), Some("B is done"));
    assert!(todos[0].completed_at.unwrap() <= todos[1].completed_at.unwrap());

    // Simplified prompt between delegations; full prompt for synthesis.
    let requests = h.model.chat_requests();
    assert_eq!(requests.len(), 6);
    assert!(requests[3].0.system.contains("executing a plan"));
    let last = &requests[5].0;
    assert!(last.system.contains("lead assistant"));
    assert!(last.messages.iter().any(|m| {
        matches!(m.role, Role::Assistant) && m.content.all_text().contains("All plan items are settled")
    }));

    // Bounded: far below the plan cap.
    let supervisor_requests = requests
        .iter()
        .filter(|(_, ctx)| ctx.span_id == requests[0].1.span_id)
        .count();
    assert!(supervisor_requests as u32 <= h.config.max_tool_iterations_with_plan);

    // Final synthesis persisted.
    let conversation = sole_conversation(&h).await;
    let all = rows(&h, &conversation.id).await;
    assert!(all
        .iter()
        .any(|m| m.role == Role::Assistant && m.content == "Both steps are complete."));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Scenario 6: scheduled task
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn scheduled_task_runs_in_the_feed_conversation() {
    let h = harness();
    let router = Arc::new(MessageRouter::new(h.supervisor.clone(), None, h.store.clone()));
    let scheduler = Arc::new(Scheduler::new(
        router,
        h.events.clone(),
        h.channel.clone(),
        h.config.clone(),
    ));

    let mut task = Task::new("morning digest", "*/5 * * * *");
    task.config.description = "collect the feed".into();
    task.config.allowed_tools = vec!["web_search".into()];
    task.config.conversation_id = Some("feed".into());
    task.next_run_at = Some(Utc::now() - chrono::Duration::seconds(60));
    let task_id = task.id.clone();
    scheduler.tasks().insert(task);

    h.tools.set_output("web_search", "fresh items");
    h.model
        .push(ScriptedTurn::tool("web_search", serde_json::json!({"query": "feed"})));
    h.model.push(ScriptedTurn::text("Digest ready."));

    scheduler.tick(Utc::now()).await;

    // Delivery is spawned; wait for the turn to land.
    let mut completed = false;
    for _ in 0..POLL_ATTEMPTS {
        if rows(&h, "feed")
            .await
            .iter()
            .any(|m| m.role == Role::Assistant && m.meta.kind == MessageKind::Chat)
        {
            completed = true;
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    assert!(completed, "scheduled turn did not complete in time");

    let all = rows(&h, "feed").await;
    let task_run = all
        .iter()
        .find(|m| m.meta.kind == MessageKind::TaskRun)
        .unwrap();
    let turn_id = task_run.meta.turn_id.clone().unwrap();
    assert!(task_run.content.contains("morning digest"));

    // The final assistant message shares the pre-allocated turn id.
    let answer = all
        .iter()
        .find(|m| m.role == Role::Assistant && m.meta.kind == MessageKind::Chat)
        .unwrap();
    assert_eq!(answer.meta.turn_id.as_deref(), Some(turn_id.as_str()));

    // No redirect happened: the feed itself was used, nothing else created.
    let ad_hoc = h
        .store
        .list_conversations(50)
        .await
        .unwrap()
        .into_iter()
        .filter(|c| !c.well_known)
        .count();
    assert_eq!(ad_hoc, 0);

    // Task-run turns load no history and see only the allowed tool.
    let requests = h.model.chat_requests();
    assert_eq!(requests[0].0.messages.len(), 1);
    let tool_names: Vec<&str> = requests[0].0.tools.iter().map(|t| t.name.as_str()).collect();
    assert_eq!(tool_names, vec!["web_search"]);

    // The schedule advanced.
    let stored = scheduler.tasks().get(&task_id).unwrap();
    assert!(stored.last_run_at.is_some());
    assert!(stored.next_run_at.unwrap() > Utc::now() - chrono::Duration::seconds(1));
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Invariants & boundary behaviours
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[tokio::test]
async fn duplicate_ingress_runs_exactly_one_turn() {
    let h = harness();
    h.model.push(ScriptedTurn::text("answer one"));
    h.model.push(ScriptedTurn::text("answer two"));

    let message = InboundMessage::user("hello");
    h.supervisor.handle_message(message.clone()).await.unwrap();
    h.supervisor.handle_message(message).await.unwrap();

    assert_eq!(h.model.chat_requests().len(), 1);
    let conversation = sole_conversation(&h).await;
    let assistants = rows(&h, &conversation.id)
        .await
        .into_iter()
        .filter(|m| m.role == Role::Assistant)
        .count();
    assert_eq!(assistants, 1);
}

#[tokio::test]
async fn empty_response_persists_no_assistant_row() {
    let h = harness();
    // No scripted turn: the model yields empty text immediately.
    h.supervisor
        .handle_message(InboundMessage::user("say nothing"))
        .await
        .unwrap();

    let conversation = sole_conversation(&h).await;
    let all = rows(&h, &conversation.id).await;
    assert_eq!(all.len(), 1);
    assert_eq!(all[0].role, Role::User);
    // The stream still closed cleanly.
    assert_eq!(h.channel.stream_ends().len(), 1);
}

#[tokio::test]
async fn well_known_conversation_redirects_user_messages() {
    let h = harness();
    h.model.push(ScriptedTurn::text("redirected answer"));

    h.supervisor
        .handle_message(InboundMessage::user("hi feed").in_conversation("feed"))
        .await
        .unwrap();

    // Nothing landed in the well, everything in a fresh conversation.
    assert!(rows(&h, "feed").await.is_empty());
    let conversation = sole_conversation(&h).await;
    let all = rows(&h, &conversation.id).await;
    assert_eq!(all.len(), 2);
}

#[tokio::test]
async fn auto_naming_fires_at_most_once() {
    let h = harness();
    h.namer.push_completion("Queue Talk");
    for text in ["first", "second", "third"] {
        h.model.push(ScriptedTurn::text("reply"));
        h.supervisor
            .handle_message(InboundMessage::user(text))
            .await
            .unwrap();
    }

    let mut renamed = false;
    for _ in 0..POLL_ATTEMPTS {
        if sole_conversation(&h).await.title == "Queue Talk" {
            renamed = true;
            break;
        }
        tokio::time::sleep(POLL_INTERVAL).await;
    }
    assert!(renamed, "auto-naming did not land in time");

    let calls = h.namer.completion_calls();
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].1, CallPurpose::Naming);
    // The main model's usage was untouched by naming.
    assert!(h.model.completion_calls().is_empty());
}

#[tokio::test]
async fn tool_loop_is_bounded_without_a_plan() {
    let h = harness();
    h.tools.set_output("web_search", "more results");
    for _ in 0..12 {
        h.model
            .push(ScriptedTurn::tool("web_search", serde_json::json!({"query": "again"})));
    }

    h.supervisor
        .handle_message(InboundMessage::user("loop forever"))
        .await
        .unwrap();

    assert_eq!(
        h.model.chat_requests().len() as u32,
        h.config.max_tool_iterations
    );
    // The turn still ended cleanly.
    assert_eq!(h.traces.traces()[0].status, TraceStatus::Ok);
}

#[tokio::test]
async fn model_failure_surfaces_sanitized_error() {
    let h = harness();
    h.model.fail_next("401 unauthorized: key sk-secret");

    h.supervisor
        .handle_message(InboundMessage::user("hi"))
        .await
        .unwrap();

    let errors = h.channel.errors();
    assert_eq!(errors.len(), 1);
    assert!(!errors[0].1.contains("sk-secret"));

    let conversation = sole_conversation(&h).await;
    let all = rows(&h, &conversation.id).await;
    assert!(all.iter().any(|m| m.meta.kind == MessageKind::Error));
    assert!(!all.iter().any(|m| m.role == Role::Assistant));

    let traces = h.traces.traces();
    assert_eq!(traces[0].status, TraceStatus::Error);
}

#[tokio::test]
async fn delegation_failure_falls_back_to_direct_answer() {
    let h = harness();
    h.model.push(ScriptedTurn::tool(
        "delegate",
        serde_json::json!({"type": "writer", "mission": "impossible mission"}),
    ));
    // The worker's model call fails; the fallback completion then answers.
    h.model.push(ScriptedTurn::failure("worker upstream exploded"));
    h.model.push_completion("Direct answer instead.");
    h.model.push(ScriptedTurn::text("Final: direct answer delivered."));

    h.supervisor
        .handle_message(InboundMessage::user("try delegating"))
        .await
        .unwrap();

    // The fallback completion ran with the fallback purpose.
    let completions = h.model.completion_calls();
    assert_eq!(completions.len(), 1);
    assert_eq!(completions[0].1, CallPurpose::Fallback);
    assert!(completions[0].0.contains("impossible mission"));

    // The turn still produced a final assistant message.
    let conversation = sole_conversation(&h).await;
    let all = rows(&h, &conversation.id).await;
    assert!(all
        .iter()
        .any(|m| m.role == Role::Assistant && m.content.contains("direct answer")));
}
