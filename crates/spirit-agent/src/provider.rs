use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Role of a [`Message`] sent to the model.
///
/// A stored `tool` message is rendered as a `User` message whose content is
/// a single [`ContentBlock::ToolResult`] — the model dialect has no separate
/// tool role, only user/assistant/system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    System,
}

/// One block of a [`Message`]'s content.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: serde_json::Value,
    },
    ToolResult {
        tool_use_id: String,
        content: String,
        is_error: bool,
    },
}

/// A single message in the conversation sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: Vec<ContentBlock>,
}

impl Message {
    pub fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: vec![ContentBlock::Text { text: text.into() }],
        }
    }
}

/// Tool definition sent to the model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    pub input_schema: serde_json::Value,
}

/// Why the model stopped generating.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    EndTurn,
    MaxTokens,
    ToolUse,
    #[serde(other)]
    Unknown,
}

/// Request to an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub model: String,
    pub system: String,
    pub messages: Vec<Message>,
    pub max_tokens: u32,
    pub tools: Vec<ToolDefinition>,
}

/// Response from an LLM provider.
#[derive(Debug, Clone)]
pub struct ChatResponse {
    pub content: Vec<ContentBlock>,
    pub model: String,
    pub tokens_in: u32,
    pub tokens_out: u32,
    pub stop_reason: StopReason,
}

impl ChatResponse {
    /// Concatenated text of every `Text` block, in order.
    pub fn text(&self) -> String {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::Text { text } => Some(text.as_str()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("")
    }

    /// Every `ToolUse` block, in order.
    pub fn tool_uses(&self) -> Vec<(&str, &str, &serde_json::Value)> {
        self.content
            .iter()
            .filter_map(|b| match b {
                ContentBlock::ToolUse { id, name, input } => {
                    Some((id.as_str(), name.as_str(), input))
                }
                _ => None,
            })
            .collect()
    }
}

/// Common interface for LLM providers. Concrete adapters (Anthropic, OpenAI,
/// local runtimes, …) live outside this crate and are wired in by the
/// composition root; this crate only needs the contract.
#[async_trait]
pub trait LlmProvider: Send + Sync {
    fn name(&self) -> &str;

    async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError>;
}

#[derive(Debug, thiserror::Error)]
pub enum ProviderError {
    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("parse error: {0}")]
    Parse(String),

    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited { retry_after_ms: u64 },

    #[error("provider unavailable: {0}")]
    Unavailable(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProviderError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::Api { .. } => "API_ERROR",
            Self::Parse(_) => "PARSE_ERROR",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Unavailable(_) => "UNAVAILABLE",
            Self::Cancelled => "CANCELLED",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_concatenates_only_text_blocks_in_order() {
        let resp = ChatResponse {
            content: vec![
                ContentBlock::Text { text: "Hello, ".to_string() },
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "noop".to_string(),
                    input: serde_json::json!({}),
                },
                ContentBlock::Text { text: "world".to_string() },
            ],
            model: "test-model".to_string(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: StopReason::EndTurn,
        };
        assert_eq!(resp.text(), "Hello, world");
    }

    #[test]
    fn tool_uses_extracts_in_order() {
        let resp = ChatResponse {
            content: vec![
                ContentBlock::ToolUse {
                    id: "t1".to_string(),
                    name: "memory_read".to_string(),
                    input: serde_json::json!({"query": "x"}),
                },
                ContentBlock::Text { text: "ignored".to_string() },
            ],
            model: "test-model".to_string(),
            tokens_in: 0,
            tokens_out: 0,
            stop_reason: StopReason::ToolUse,
        };
        let uses = resp.tool_uses();
        assert_eq!(uses.len(), 1);
        assert_eq!(uses[0].0, "t1");
        assert_eq!(uses[0].1, "memory_read");
    }

    #[test]
    fn unknown_stop_reason_deserializes_to_unknown_variant() {
        let reason: StopReason = serde_json::from_str("\"something_else\"").unwrap();
        assert_eq!(reason, StopReason::Unknown);
    }
}
