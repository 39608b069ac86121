//! Provider-agnostic LLM wire types: chat messages, tool calls, streaming
//! events, and usage accounting. Every model adapter converts its native
//! format to/from these.

use serde::{Deserialize, Serialize};
use std::pin::Pin;

use crate::error::Result;

/// A boxed async stream, used for model streaming responses.
pub type BoxStream<'a, T> = Pin<Box<dyn futures_core::Stream<Item = T> + Send + 'a>>;

/// Stream of model events for one generation.
pub type EventStream = BoxStream<'static, Result<StreamEvent>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message in the model-visible conversation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: ChatContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ChatContent {
    Text(String),
    Blocks(Vec<ContentBlock>),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContentBlock {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "tool_use")]
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    #[serde(rename = "tool_result")]
    ToolResult {
        tool_use_id: String,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

/// A tool invocation requested by the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolCall {
    pub call_id: String,
    pub tool_name: String,
    pub arguments: serde_json::Value,
}

/// Tool definition exposed to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    /// JSON Schema for the tool's parameters.
    pub parameters: serde_json::Value,
}

/// Token usage for a single completion.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
}

/// Usage accumulated across all model calls of one turn.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnUsage {
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub total_tokens: u32,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

impl TurnUsage {
    pub fn add(&mut self, usage: &Usage) {
        self.prompt_tokens += usage.prompt_tokens;
        self.completion_tokens += usage.completion_tokens;
        self.total_tokens += usage.total_tokens;
    }

    pub fn is_zero(&self) -> bool {
        self.total_tokens == 0
    }
}

/// Request passed to a model client for one generation.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub system: String,
    pub messages: Vec<ChatMessage>,
    pub tools: Vec<ToolDescriptor>,
    /// Model override (None = client default).
    pub model: Option<String>,
}

/// Events emitted during model streaming (provider-agnostic).
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum StreamEvent {
    /// A text token chunk.
    #[serde(rename = "token")]
    Token { text: String },

    /// A tool call has started.
    #[serde(rename = "tool_call_started")]
    ToolCallStarted { call_id: String, tool_name: String },

    /// Incremental tool call argument data.
    #[serde(rename = "tool_call_delta")]
    ToolCallDelta { call_id: String, delta: String },

    /// A tool call is complete with full arguments.
    #[serde(rename = "tool_call_finished")]
    ToolCallFinished {
        call_id: String,
        tool_name: String,
        arguments: serde_json::Value,
    },

    /// Stream is finished.
    #[serde(rename = "done")]
    Done {
        usage: Option<Usage>,
        finish_reason: Option<String>,
    },

    /// An error occurred during streaming.
    #[serde(rename = "error")]
    Error { message: String },
}

// ── Convenience constructors ───────────────────────────────────────

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: ChatContent::Text(text.into()),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: ChatContent::Text(text.into()),
        }
    }

    /// Assistant message carrying the text prefix plus the tool_use blocks
    /// the model emitted, in request order.
    pub fn assistant_with_tools(text: &str, tool_calls: &[ToolCall]) -> Self {
        let mut blocks = Vec::new();
        if !text.is_empty() {
            blocks.push(ContentBlock::Text {
                text: text.to_string(),
            });
        }
        for tc in tool_calls {
            blocks.push(ContentBlock::ToolUse {
                id: tc.call_id.clone(),
                name: tc.tool_name.clone(),
                input: tc.arguments.clone(),
            });
        }
        Self {
            role: Role::Assistant,
            content: ChatContent::Blocks(blocks),
        }
    }

    /// User message carrying tool results as structured blocks. This is how
    /// tool output re-enters the model context, never as standalone tool
    /// rows in the conversation history.
    pub fn tool_results(results: impl IntoIterator<Item = (String, String, bool)>) -> Self {
        let blocks = results
            .into_iter()
            .map(|(tool_use_id, content, is_error)| ContentBlock::ToolResult {
                tool_use_id,
                content,
                is_error,
            })
            .collect();
        Self {
            role: Role::User,
            content: ChatContent::Blocks(blocks),
        }
    }
}

impl ChatContent {
    /// Extract the plain-text content (first text block, or the full text).
    pub fn text(&self) -> Option<&str> {
        match self {
            ChatContent::Text(t) => Some(t.as_str()),
            ChatContent::Blocks(blocks) => blocks.iter().find_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            }),
        }
    }

    /// Join all text blocks into one owned string; non-text blocks are
    /// skipped.
    pub fn all_text(&self) -> String {
        match self {
            ChatContent::Text(t) => t.clone(),
            ChatContent::Blocks(blocks) => blocks
                .iter()
                .filter_map(|b| match b {
                    ContentBlock::Text { text } => Some(text.as_str()),
                    _ => None,
                })
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn assistant_with_tools_orders_blocks() {
        let calls = vec![ToolCall {
            call_id: "tc_1".into(),
            tool_name: "web_search".into(),
            arguments: serde_json::json!({"query": "x"}),
        }];
        let msg = ChatMessage::assistant_with_tools("looking that up", &calls);
        match &msg.content {
            ChatContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                assert!(matches!(&blocks[0], ContentBlock::Text { .. }));
                assert!(matches!(&blocks[1], ContentBlock::ToolUse { .. }));
            }
            _ => panic!("expected Blocks content"),
        }
    }

    #[test]
    fn assistant_with_tools_empty_text_omitted() {
        let msg = ChatMessage::assistant_with_tools("", &[]);
        match &msg.content {
            ChatContent::Blocks(blocks) => assert!(blocks.is_empty()),
            _ => panic!("expected Blocks content"),
        }
    }

    #[test]
    fn tool_results_build_user_blocks() {
        let msg = ChatMessage::tool_results(vec![
            ("tc_1".to_string(), "ok".to_string(), false),
            ("tc_2".to_string(), "boom".to_string(), true),
        ]);
        assert_eq!(msg.role, Role::User);
        match &msg.content {
            ChatContent::Blocks(blocks) => {
                assert_eq!(blocks.len(), 2);
                match &blocks[1] {
                    ContentBlock::ToolResult { is_error, .. } => assert!(is_error),
                    _ => panic!("expected ToolResult block"),
                }
            }
            _ => panic!("expected Blocks content"),
        }
    }

    #[test]
    fn all_text_joins_with_newline() {
        let content = ChatContent::Blocks(vec![
            ContentBlock::Text {
                text: "line one".into(),
            },
            ContentBlock::ToolUse {
                id: "c1".into(),
                name: "x".into(),
                input: serde_json::json!({}),
            },
            ContentBlock::Text {
                text: "line two".into(),
            },
        ]);
        assert_eq!(content.all_text(), "line one\nline two");
    }

    #[test]
    fn turn_usage_accumulates() {
        let mut turn = TurnUsage::default();
        assert!(turn.is_zero());
        turn.add(&Usage {
            prompt_tokens: 10,
            completion_tokens: 5,
            total_tokens: 15,
        });
        turn.add(&Usage {
            prompt_tokens: 2,
            completion_tokens: 3,
            total_tokens: 5,
        });
        assert_eq!(turn.prompt_tokens, 12);
        assert_eq!(turn.completion_tokens, 8);
        assert_eq!(turn.total_tokens, 20);
        assert!(!turn.is_zero());
    }
}
