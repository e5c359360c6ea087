use tokio::sync::RwLock;

use crate::provider::{ChatRequest, ChatResponse, LlmProvider, ProviderError};

/// Holds the LLM provider adapter and the current default model.
/// Shared across every conversation instance for an agent.
pub struct AgentRuntime {
    provider: Box<dyn LlmProvider>,
    default_model: RwLock<String>,
}

impl AgentRuntime {
    pub fn new(provider: Box<dyn LlmProvider>, default_model: String) -> Self {
        Self {
            provider,
            default_model: RwLock::new(default_model),
        }
    }

    pub async fn get_model(&self) -> String {
        self.default_model.read().await.clone()
    }

    /// Returns the previous model.
    pub async fn set_model(&self, model: String) -> String {
        let mut guard = self.default_model.write().await;
        std::mem::replace(&mut *guard, model)
    }

    pub fn provider(&self) -> &dyn LlmProvider {
        &*self.provider
    }

    pub async fn send(&self, req: &ChatRequest) -> Result<ChatResponse, ProviderError> {
        self.provider.send(req).await
    }
}
