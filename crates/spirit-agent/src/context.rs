//! Per-round context construction: system prompt + message list handed to
//! the model. See spec §4.1 step "Context construction per round".

use spirit_memory::types::{ConversationMessage, MessageRole};
use spirit_memory::MemoryManager;

use crate::provider::{ContentBlock, Message, Role};

pub struct RoundContext {
    pub system: String,
    pub messages: Vec<Message>,
}

/// Builds the system prompt and ordered message list for one model call.
///
/// The system prompt concatenates every core-tier block; a
/// `[Working Memory Context]` pseudo-message is prepended when working-tier
/// blocks exist; every stored [`ConversationMessage`] is then rehydrated in
/// order, reconstructing assistant tool-use blocks from their stored ids so
/// the model dialect's tool-result pairing requirement holds.
pub fn build_round_context(
    memory: &MemoryManager,
    owner: &str,
    history: &[ConversationMessage],
) -> Result<RoundContext, spirit_memory::MemoryError> {
    let system = memory.build_system_prompt(owner)?;

    let mut messages = Vec::with_capacity(history.len() + 1);

    let working = memory.get_working_blocks(owner)?;
    if !working.is_empty() {
        let content = working
            .iter()
            .map(|b| b.content.as_str())
            .collect::<Vec<_>>()
            .join("\n\n");
        messages.push(Message::text(
            Role::User,
            format!("[Working Memory Context]\n{content}"),
        ));
    }

    for msg in history {
        messages.push(to_model_message(msg));
    }

    Ok(RoundContext { system, messages })
}

fn to_model_message(msg: &ConversationMessage) -> Message {
    match msg.role {
        MessageRole::User | MessageRole::System => Message::text(Role::User, msg.content.clone()),
        MessageRole::Assistant => match &msg.tool_calls {
            None => Message::text(Role::Assistant, msg.content.clone()),
            Some(calls) if calls.is_empty() => Message::text(Role::Assistant, msg.content.clone()),
            Some(calls) => {
                let mut content = Vec::with_capacity(calls.len() + 1);
                if !msg.content.is_empty() {
                    content.push(ContentBlock::Text {
                        text: msg.content.clone(),
                    });
                }
                for call in calls {
                    content.push(ContentBlock::ToolUse {
                        id: call.id.clone(),
                        name: call.name.clone(),
                        input: call.input.clone(),
                    });
                }
                Message {
                    role: Role::Assistant,
                    content,
                }
            }
        },
        MessageRole::Tool => {
            let tool_use_id = msg.tool_call_id.clone().unwrap_or_default();
            let is_error = msg.content.to_lowercase().contains("error");
            Message {
                role: Role::User,
                content: vec![ContentBlock::ToolResult {
                    tool_use_id,
                    content: msg.content.clone(),
                    is_error,
                }],
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spirit_memory::types::ToolUse;

    fn msg(role: MessageRole, content: &str) -> ConversationMessage {
        ConversationMessage {
            id: "m1".to_string(),
            conversation_id: "c1".to_string(),
            role,
            content: content.to_string(),
            tool_calls: None,
            tool_call_id: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn assistant_with_tool_calls_becomes_text_plus_tool_use_blocks() {
        let mut m = msg(MessageRole::Assistant, "checking");
        m.tool_calls = Some(vec![ToolUse {
            id: "t1".to_string(),
            name: "memory_read".to_string(),
            input: serde_json::json!({"query": "x"}),
        }]);
        let rendered = to_model_message(&m);
        assert_eq!(rendered.content.len(), 2);
        assert!(matches!(rendered.content[0], ContentBlock::Text { .. }));
        assert!(matches!(rendered.content[1], ContentBlock::ToolUse { .. }));
    }

    #[test]
    fn tool_message_becomes_single_tool_result_block_bound_to_call_id() {
        let mut m = msg(MessageRole::Tool, "Error: boom");
        m.tool_call_id = Some("t1".to_string());
        let rendered = to_model_message(&m);
        assert!(matches!(rendered.role, Role::User));
        match &rendered.content[0] {
            ContentBlock::ToolResult {
                tool_use_id,
                is_error,
                ..
            } => {
                assert_eq!(tool_use_id, "t1");
                assert!(*is_error);
            }
            _ => panic!("expected ToolResult"),
        }
    }

    #[test]
    fn plain_user_message_is_passed_through_as_text() {
        let m = msg(MessageRole::User, "hello");
        let rendered = to_model_message(&m);
        assert!(matches!(rendered.role, Role::User));
        assert!(matches!(rendered.content[0], ContentBlock::Text { .. }));
    }
}
