//! The bounded round loop: one model call, optional tool dispatch, repeat
//! until the model stops asking for tools or the round cap is hit. See
//! spec §4.1.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use spirit_core::config::AgentConfig;
use spirit_core::types::{AgentId, ConversationId};
use spirit_memory::types::{ConversationMessage, ExternalEvent, MessageRole, ToolUse};
use spirit_memory::{MemoryManager, MemoryStore};
use spirit_sandbox::{
    ExecutionContext, ExecutionRequest, SandboxExecutor, ToolDispatcher, ToolResult as SandboxToolResult,
};
use tracing::{info, warn};

use crate::compactor::{estimate_tokens, Compactor};
use crate::context;
use crate::provider::{ChatRequest, ProviderError, StopReason};
use crate::registry::{ToolRegistry, COMPACT_CONTEXT_TOOL, EXECUTE_CODE_TOOL};
use crate::runtime::AgentRuntime;

#[derive(Debug, thiserror::Error)]
pub enum AgentLoopError {
    #[error("persistence error: {0}")]
    Memory(#[from] spirit_memory::MemoryError),
    #[error("model error: {0}")]
    Provider(#[from] ProviderError),
}

/// Drives one conversation's round loop. Cheap to construct; the expensive
/// collaborators (memory store/manager, runtime, registry, sandbox,
/// compactor) are shared `Arc`s owned by the caller and reused across every
/// conversation for an agent.
pub struct AgentLoop {
    agent_id: AgentId,
    conversation_id: ConversationId,
    store: Arc<MemoryStore>,
    memory: Arc<MemoryManager>,
    runtime: Arc<AgentRuntime>,
    registry: Arc<ToolRegistry>,
    sandbox: Option<Arc<SandboxExecutor>>,
    compactor: Option<Arc<Compactor>>,
    config: AgentConfig,
    execution_context: Option<ExecutionContext>,
}

impl AgentLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        agent_id: AgentId,
        conversation_id: Option<ConversationId>,
        store: Arc<MemoryStore>,
        memory: Arc<MemoryManager>,
        runtime: Arc<AgentRuntime>,
        registry: Arc<ToolRegistry>,
        sandbox: Option<Arc<SandboxExecutor>>,
        compactor: Option<Arc<Compactor>>,
        config: AgentConfig,
    ) -> Self {
        Self {
            agent_id,
            conversation_id: conversation_id.unwrap_or_else(ConversationId::random),
            store,
            memory,
            runtime,
            registry,
            sandbox,
            compactor,
            config,
            execution_context: None,
        }
    }

    /// Attaches the execution context the composition root derived for this
    /// agent (e.g. per-conversation credential constants and dynamically
    /// allowed hosts), threaded into every `execute_code` call. See spec §4.1.
    pub fn with_execution_context(mut self, execution_context: ExecutionContext) -> Self {
        self.execution_context = Some(execution_context);
        self
    }

    pub fn conversation_id(&self) -> &ConversationId {
        &self.conversation_id
    }

    pub fn get_conversation_history(&self) -> Result<Vec<ConversationMessage>, AgentLoopError> {
        Ok(self.store.get_messages(self.conversation_id.as_str())?)
    }

    /// Formats `event` per spec §6 and feeds it through [`Self::process_message`].
    pub async fn process_event(&self, event: ExternalEvent) -> Result<String, AgentLoopError> {
        let text = crate::event_format::format_event(&event);
        self.process_message(&text).await
    }

    /// Persists `text` as a user message, runs the pre-round compression
    /// check, then drives rounds until the model stops or the round cap
    /// is hit.
    pub async fn process_message(&self, text: &str) -> Result<String, AgentLoopError> {
        self.store.insert_message(ConversationMessage {
            id: String::new(),
            conversation_id: self.conversation_id.to_string(),
            role: MessageRole::User,
            content: text.to_string(),
            tool_calls: None,
            tool_call_id: None,
            created_at: Utc::now().to_rfc3339(),
        })?;

        let mut history = self.store.get_messages(self.conversation_id.as_str())?;

        if let Some(compactor) = &self.compactor {
            let budget_tokens =
                (self.config.context_budget * self.config.model_max_tokens as f64) as usize;
            if estimate_tokens(&history) > budget_tokens {
                info!(
                    conversation_id = %self.conversation_id,
                    "context budget exceeded before round loop, triggering compaction"
                );
                let result = compactor
                    .compress(self.agent_id.as_str(), self.conversation_id.as_str(), history)
                    .await;
                history = result.history;
            }
        }

        self.run_rounds(history).await
    }

    async fn run_rounds(&self, mut history: Vec<ConversationMessage>) -> Result<String, AgentLoopError> {
        let dispatcher = RegistryDispatcher(self.registry.clone());
        let max_rounds = self.config.max_tool_rounds.max(1);
        let mut rounds = 0u32;

        loop {
            rounds += 1;

            let ctx = context::build_round_context(&self.memory, self.agent_id.as_str(), &history)?;
            let model = self.runtime.get_model().await;
            let request = ChatRequest {
                model,
                system: ctx.system,
                messages: ctx.messages,
                max_tokens: self.config.max_output_tokens,
                tools: self.registry.to_model_tools(),
            };
            let response = self.runtime.send(&request).await?;

            match response.stop_reason {
                StopReason::EndTurn | StopReason::MaxTokens => {
                    let text = response.text();
                    self.insert_assistant(&text, None)?;
                    return Ok(text);
                }
                StopReason::Unknown => {
                    warn!("model returned an unrecognized stop reason; ending round without a reply");
                    return Ok(String::new());
                }
                StopReason::ToolUse => {
                    let tool_calls: Vec<ToolUse> = response
                        .tool_uses()
                        .into_iter()
                        .map(|(id, name, input)| ToolUse {
                            id: id.to_string(),
                            name: name.to_string(),
                            input: input.clone(),
                        })
                        .collect();
                    let assistant_text = response.text();
                    let persisted_text = if assistant_text.is_empty() {
                        "[Tool calls]".to_string()
                    } else {
                        assistant_text
                    };
                    let assistant_msg = self.insert_assistant(&persisted_text, Some(tool_calls.clone()))?;
                    history.push(assistant_msg);

                    for tool_use in &tool_calls {
                        let (result_text, replacement_history) =
                            self.execute_one_tool(tool_use, &dispatcher, &history).await;
                        if let Some(replacement) = replacement_history {
                            history = replacement;
                        }
                        let tool_msg = self.insert_tool_result(&result_text, &tool_use.id)?;
                        history.push(tool_msg);
                    }

                    if rounds >= max_rounds {
                        let warning = format!(
                            "Reached the max tool rounds limit ({max_rounds}) while still requesting tool use; stopping here."
                        );
                        self.insert_assistant(&warning, None)?;
                        return Ok(warning);
                    }
                }
            }
        }
    }

    async fn execute_one_tool(
        &self,
        tool_use: &ToolUse,
        dispatcher: &RegistryDispatcher,
        history: &[ConversationMessage],
    ) -> (String, Option<Vec<ConversationMessage>>) {
        if tool_use.name == EXECUTE_CODE_TOOL {
            return self.execute_code(tool_use).await;
        }
        if tool_use.name == COMPACT_CONTEXT_TOOL {
            return self.execute_compact_context(history).await;
        }

        let result = self.registry.dispatch(&tool_use.name, tool_use.input.clone()).await;
        let text = if result.success {
            result.content
        } else {
            format!("Error executing tool {}: {}", tool_use.name, result.content)
        };
        (text, None)
    }

    async fn execute_code(&self, tool_use: &ToolUse) -> (String, Option<Vec<ConversationMessage>>) {
        let Some(sandbox) = &self.sandbox else {
            return ("Error: sandbox is not configured".to_string(), None);
        };
        let code = tool_use
            .input
            .get("code")
            .and_then(|v| v.as_str())
            .unwrap_or_default()
            .to_string();
        let request = ExecutionRequest {
            code,
            tool_stubs: self.registry.generate_stubs(),
            execution_context: self.execution_context.clone(),
        };
        let dispatcher = RegistryDispatcher(self.registry.clone());
        let result = sandbox.execute(request, &dispatcher).await;
        let text = if result.success {
            result.output
        } else {
            format!("Error: {}", result.error.unwrap_or_else(|| "sandbox execution failed".to_string()))
        };
        (text, None)
    }

    async fn execute_compact_context(
        &self,
        history: &[ConversationMessage],
    ) -> (String, Option<Vec<ConversationMessage>>) {
        let Some(compactor) = &self.compactor else {
            let payload = serde_json::json!({ "error": "compactor is not configured" });
            return (payload.to_string(), None);
        };
        let result = compactor
            .compress(self.agent_id.as_str(), self.conversation_id.as_str(), history.to_vec())
            .await;
        let stats = serde_json::json!({
            "messagesCompressed": result.messages_compressed,
            "batchesCreated": result.batches_created,
            "tokensEstimateBefore": result.tokens_estimate_before,
            "tokensEstimateAfter": result.tokens_estimate_after,
        });
        (stats.to_string(), Some(result.history))
    }

    fn insert_assistant(
        &self,
        content: &str,
        tool_calls: Option<Vec<ToolUse>>,
    ) -> Result<ConversationMessage, AgentLoopError> {
        Ok(self.store.insert_message(ConversationMessage {
            id: String::new(),
            conversation_id: self.conversation_id.to_string(),
            role: MessageRole::Assistant,
            content: content.to_string(),
            tool_calls,
            tool_call_id: None,
            created_at: Utc::now().to_rfc3339(),
        })?)
    }

    fn insert_tool_result(
        &self,
        content: &str,
        tool_call_id: &str,
    ) -> Result<ConversationMessage, AgentLoopError> {
        Ok(self.store.insert_message(ConversationMessage {
            id: String::new(),
            conversation_id: self.conversation_id.to_string(),
            role: MessageRole::Tool,
            content: content.to_string(),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.to_string()),
            created_at: Utc::now().to_rfc3339(),
        })?)
    }
}

/// Bridges [`ToolRegistry::dispatch`] to [`spirit_sandbox::ToolDispatcher`]
/// so the sandbox executor never has to depend on `spirit-agent`.
struct RegistryDispatcher(Arc<ToolRegistry>);

#[async_trait]
impl ToolDispatcher for RegistryDispatcher {
    async fn dispatch(&self, name: &str, params: serde_json::Value) -> SandboxToolResult {
        self.0.dispatch(name, params).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::{ChatResponse, ContentBlock, LlmProvider};
    use async_trait::async_trait;
    use rusqlite::Connection;
    use spirit_memory::embedding::EmbeddingProvider;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct StubEmbedder;

    #[async_trait]
    impl EmbeddingProvider for StubEmbedder {
        async fn embed(&self, text: &str) -> anyhow::Result<Vec<f32>> {
            Ok(vec![text.len() as f32])
        }
        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            let mut out = Vec::new();
            for t in texts {
                out.push(self.embed(t).await?);
            }
            Ok(out)
        }
    }

    /// Always ends the turn immediately with a fixed reply.
    struct EchoProvider;

    #[async_trait]
    impl LlmProvider for EchoProvider {
        fn name(&self) -> &str {
            "echo"
        }
        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            Ok(ChatResponse {
                content: vec![ContentBlock::Text {
                    text: format!("reply to {} message(s)", req.messages.len()),
                }],
                model: req.model.clone(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: StopReason::EndTurn,
            })
        }
    }

    /// Always requests `execute_code`, forever — used to exercise the
    /// round cap.
    struct AlwaysToolUseProvider {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl LlmProvider for AlwaysToolUseProvider {
        fn name(&self) -> &str {
            "always-tool-use"
        }
        async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ChatResponse {
                content: vec![ContentBlock::ToolUse {
                    id: format!("call-{n}"),
                    name: EXECUTE_CODE_TOOL.to_string(),
                    input: serde_json::json!({"code": "1+1"}),
                }],
                model: req.model.clone(),
                tokens_in: 0,
                tokens_out: 0,
                stop_reason: StopReason::ToolUse,
            })
        }
    }

    fn make_loop(
        provider: Box<dyn LlmProvider>,
        config: AgentConfig,
        sandbox: Option<Arc<SandboxExecutor>>,
    ) -> AgentLoop {
        let store = Arc::new(MemoryStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let memory = Arc::new(MemoryManager::new(store.clone(), Arc::new(StubEmbedder)));
        let runtime = Arc::new(AgentRuntime::new(provider, config.model.clone()));
        let registry = Arc::new(ToolRegistry::with_builtins());
        AgentLoop::new(
            AgentId::main(),
            Some(ConversationId::from("test-convo")),
            store,
            memory,
            runtime,
            registry,
            sandbox,
            None,
            config,
        )
    }

    fn default_config() -> AgentConfig {
        AgentConfig {
            model: "test-model".to_string(),
            max_tool_rounds: 3,
            context_budget: 0.8,
            model_max_tokens: 200_000,
            max_output_tokens: 512,
        }
    }

    #[tokio::test]
    async fn end_turn_persists_and_returns_the_reply() {
        let agent = make_loop(Box::new(EchoProvider), default_config(), None);
        let reply = agent.process_message("hello").await.unwrap();
        assert!(reply.starts_with("reply to"));
        let history = agent.get_conversation_history().unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].role, MessageRole::User);
        assert_eq!(history[1].role, MessageRole::Assistant);
    }

    #[tokio::test]
    async fn execute_code_without_sandbox_configured_reports_an_error() {
        let provider = Box::new(AlwaysToolUseProvider {
            calls: AtomicUsize::new(0),
        });
        let agent = make_loop(provider, default_config(), None);
        let reply = agent.process_message("run something").await.unwrap();
        assert!(reply.contains("max tool rounds"));
        let history = agent.get_conversation_history().unwrap();
        let tool_messages: Vec<_> = history.iter().filter(|m| m.role == MessageRole::Tool).collect();
        assert!(tool_messages.iter().all(|m| m.content.contains("sandbox is not configured")));
    }

    #[tokio::test]
    async fn round_cap_is_enforced_and_persists_a_warning() {
        let provider = Box::new(AlwaysToolUseProvider {
            calls: AtomicUsize::new(0),
        });
        let mut config = default_config();
        config.max_tool_rounds = 2;
        let agent = make_loop(provider, config, None);
        let reply = agent.process_message("loop forever").await.unwrap();
        assert!(reply.contains("max tool rounds limit (2)"));

        let history = agent.get_conversation_history().unwrap();
        let assistant_msgs: Vec<_> = history.iter().filter(|m| m.role == MessageRole::Assistant).collect();
        // one assistant message per round requesting tools (2 rounds) + the
        // final warning message
        assert_eq!(assistant_msgs.len(), 3);
        assert!(assistant_msgs.last().unwrap().content.contains("max tool rounds"));
    }

    #[tokio::test]
    async fn every_tool_message_has_a_preceding_assistant_message_with_matching_call_id() {
        let provider = Box::new(AlwaysToolUseProvider {
            calls: AtomicUsize::new(0),
        });
        let mut config = default_config();
        config.max_tool_rounds = 2;
        let agent = make_loop(provider, config, None);
        agent.process_message("go").await.unwrap();

        let history = agent.get_conversation_history().unwrap();
        for (i, msg) in history.iter().enumerate() {
            if msg.role == MessageRole::Tool {
                let call_id = msg.tool_call_id.as_ref().expect("tool message has a call id");
                let matched = history[..i].iter().any(|earlier| {
                    earlier.role == MessageRole::Assistant
                        && earlier
                            .tool_calls
                            .as_ref()
                            .is_some_and(|calls| calls.iter().any(|c| &c.id == call_id))
                });
                assert!(matched, "tool message {call_id} has no preceding matching assistant tool_use");
            }
        }
    }

    #[test]
    fn new_without_explicit_conversation_id_generates_one() {
        let store = Arc::new(MemoryStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let memory = Arc::new(MemoryManager::new(store.clone(), Arc::new(StubEmbedder)));
        let runtime = Arc::new(AgentRuntime::new(Box::new(EchoProvider), "test-model".to_string()));
        let registry = Arc::new(ToolRegistry::with_builtins());
        let agent = AgentLoop::new(
            AgentId::main(),
            None,
            store,
            memory,
            runtime,
            registry,
            None,
            None,
            default_config(),
        );
        assert!(!agent.conversation_id().as_str().is_empty());
    }
}
