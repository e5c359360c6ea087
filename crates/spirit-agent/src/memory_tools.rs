//! `memory_read` / `memory_write` tool handlers, wiring [`MemoryManager`]
//! into the [`ToolRegistry`]. See spec §4.2 and §4.4 (tool registry).

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use spirit_memory::types::Tier;
use spirit_memory::{MemoryManager, WriteOutcome};
use spirit_sandbox::ToolResult;

use crate::registry::{ParamType, Parameter, ToolDefinition, ToolHandler, ToolRegistry};

pub const MEMORY_READ_TOOL: &str = "memory_read";
pub const MEMORY_WRITE_TOOL: &str = "memory_write";

/// Registers `memory_read` and `memory_write`, bound to `owner`'s memory.
pub fn register_memory_tools(registry: &mut ToolRegistry, memory: Arc<MemoryManager>, owner: String) {
    registry
        .register(
            ToolDefinition {
                name: MEMORY_READ_TOOL.to_string(),
                description: "Semantically search persistent memory for relevant blocks."
                    .to_string(),
                parameters: vec![
                    Parameter {
                        name: "query".to_string(),
                        type_: ParamType::String,
                        description: "Text to search memory for.".to_string(),
                        required: true,
                        enum_values: None,
                    },
                    Parameter {
                        name: "limit".to_string(),
                        type_: ParamType::Number,
                        description: "Maximum number of results (default 5).".to_string(),
                        required: false,
                        enum_values: None,
                    },
                    Parameter {
                        name: "tier".to_string(),
                        type_: ParamType::String,
                        description: "Restrict the search to one memory tier.".to_string(),
                        required: false,
                        enum_values: Some(vec![
                            "core".to_string(),
                            "working".to_string(),
                            "archival".to_string(),
                        ]),
                    },
                ],
            },
            Box::new(MemoryReadHandler {
                memory: memory.clone(),
                owner: owner.clone(),
            }),
        )
        .expect("memory_read registers once per registry");

    registry
        .register(
            ToolDefinition {
                name: MEMORY_WRITE_TOOL.to_string(),
                description: "Write or propose a write to a labeled persistent memory block."
                    .to_string(),
                parameters: vec![
                    Parameter {
                        name: "label".to_string(),
                        type_: ParamType::String,
                        description: "Stable label identifying the block.".to_string(),
                        required: true,
                        enum_values: None,
                    },
                    Parameter {
                        name: "content".to_string(),
                        type_: ParamType::String,
                        description: "New content for the block.".to_string(),
                        required: true,
                        enum_values: None,
                    },
                    Parameter {
                        name: "tier".to_string(),
                        type_: ParamType::String,
                        description: "Tier to create the block in, if it doesn't exist yet."
                            .to_string(),
                        required: false,
                        enum_values: Some(vec![
                            "core".to_string(),
                            "working".to_string(),
                            "archival".to_string(),
                        ]),
                    },
                    Parameter {
                        name: "reason".to_string(),
                        type_: ParamType::String,
                        description: "Why this write is being proposed, recorded on a queued mutation."
                            .to_string(),
                        required: false,
                        enum_values: None,
                    },
                ],
            },
            Box::new(MemoryWriteHandler { memory, owner }),
        )
        .expect("memory_write registers once per registry");
}

struct MemoryReadHandler {
    memory: Arc<MemoryManager>,
    owner: String,
}

#[async_trait]
impl ToolHandler for MemoryReadHandler {
    async fn call(&self, params: Value) -> ToolResult {
        let query = params.get("query").and_then(|v| v.as_str()).unwrap_or_default();
        let limit = params.get("limit").and_then(|v| v.as_u64()).unwrap_or(5) as usize;
        let tier = params
            .get("tier")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Tier>().ok());

        match self.memory.read(&self.owner, query, limit, tier).await {
            Ok(hits) => {
                let rendered: Vec<Value> = hits
                    .into_iter()
                    .map(|h| {
                        serde_json::json!({
                            "label": h.block.label,
                            "tier": h.block.tier.to_string(),
                            "content": h.block.content,
                            "similarity": h.similarity,
                        })
                    })
                    .collect();
                ToolResult::success(serde_json::to_string(&rendered).unwrap_or_else(|_| "[]".to_string()))
            }
            Err(e) => ToolResult::error(format!("memory_read failed: {e}")),
        }
    }
}

struct MemoryWriteHandler {
    memory: Arc<MemoryManager>,
    owner: String,
}

#[async_trait]
impl ToolHandler for MemoryWriteHandler {
    async fn call(&self, params: Value) -> ToolResult {
        let label = params.get("label").and_then(|v| v.as_str()).unwrap_or_default();
        let content = params.get("content").and_then(|v| v.as_str()).unwrap_or_default();
        let tier = params
            .get("tier")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<Tier>().ok());
        let reason = params.get("reason").and_then(|v| v.as_str());

        match self.memory.write(&self.owner, label, content, tier, reason).await {
            Ok(WriteOutcome::Applied(block)) => {
                ToolResult::success(format!("applied: block \"{}\" updated", block.label))
            }
            Ok(WriteOutcome::Queued(mutation)) => ToolResult::success(format!(
                "queued pending mutation {} for approval",
                mutation.id
            )),
            Ok(WriteOutcome::Rejected(reason)) => ToolResult::error(reason),
            Err(e) => ToolResult::error(format!("memory_write failed: {e}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rusqlite::Connection;
    use spirit_memory::embedding::EmbeddingProvider;
    use spirit_memory::MemoryStore;

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

    fn registry_with_memory_tools() -> ToolRegistry {
        let store = Arc::new(MemoryStore::new(Connection::open_in_memory().unwrap()).unwrap());
        let memory = Arc::new(MemoryManager::new(store, Arc::new(StubEmbedder)));
        let mut registry = ToolRegistry::new();
        register_memory_tools(&mut registry, memory, "alice".to_string());
        registry
    }

    #[tokio::test]
    async fn memory_write_then_read_round_trips() {
        let registry = registry_with_memory_tools();
        let write_result = registry
            .dispatch(
                MEMORY_WRITE_TOOL,
                serde_json::json!({"label": "nickname", "content": "Al"}),
            )
            .await;
        assert!(write_result.success);

        let read_result = registry
            .dispatch(MEMORY_READ_TOOL, serde_json::json!({"query": "Al"}))
            .await;
        assert!(read_result.success);
        assert!(read_result.content.contains("nickname"));
    }

    #[tokio::test]
    async fn memory_read_missing_query_is_rejected_by_validation() {
        let registry = registry_with_memory_tools();
        let result = registry.dispatch(MEMORY_READ_TOOL, serde_json::json!({})).await;
        assert!(!result.success);
        assert!(result.content.contains("missing required parameter"));
    }
}
