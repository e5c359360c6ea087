use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// Per-execution context the script assembler turns into credential constants
/// and, sometimes, extra allowed hosts (e.g. a dynamically assigned PDS host
/// for an external-service token).
#[derive(Debug, Clone, Default)]
pub struct ExecutionContext {
    /// Identifier name -> JSON-encoded value, emitted as `const <name> = <value json>;`
    /// at the top of the assembled script.
    pub constants: BTreeMap<String, serde_json::Value>,
    pub extra_allowed_hosts: Vec<String>,
}

/// A request to run one snippet of guest code.
pub struct ExecutionRequest {
    pub code: String,
    pub tool_stubs: String,
    pub execution_context: Option<ExecutionContext>,
}

/// Outcome of [`crate::executor::SandboxExecutor::execute`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub tool_calls_made: u32,
    pub duration_ms: u64,
}

impl ExecutionResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.into()),
            tool_calls_made: 0,
            duration_ms: 0,
        }
    }
}

/// Result of a single tool dispatch, handed back over the IPC bridge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub success: bool,
    pub content: String,
}

impl ToolResult {
    pub fn success(content: impl Into<String>) -> Self {
        Self {
            success: true,
            content: content.into(),
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            success: false,
            content: content.into(),
        }
    }
}

/// Line-framed JSON message emitted by the subordinate process.
///
/// Parsed by hand in `ipc` rather than derived: `__debug__` messages may
/// carry arbitrary extra fields we only ever log.
#[derive(Debug, Clone)]
pub enum SubordinateMessage {
    Output { data: String },
    ToolCall {
        call_id: String,
        name: String,
        params: serde_json::Value,
    },
    Debug(serde_json::Value),
}

/// Line-framed JSON message the host sends back to the subordinate process.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
pub enum HostMessage {
    #[serde(rename = "__tool_result__")]
    ToolResult { call_id: String, result: ToolResult },
    #[serde(rename = "__tool_error__")]
    ToolError { call_id: String, error: String },
}

/// Dispatches a `__tool_call__` emitted by the guest code. Implemented by
/// the agent's tool registry; kept as a trait here so this crate never
/// depends on `spirit-agent`.
#[async_trait]
pub trait ToolDispatcher: Send + Sync {
    async fn dispatch(&self, name: &str, params: serde_json::Value) -> ToolResult;
}

impl HostMessage {
    /// A successful dispatch is reported via `__tool_result__`; a dispatch
    /// whose `ToolResult::error` is absent is also reported via
    /// `__tool_result__` — only an explicit error goes to `__tool_error__`.
    pub fn from_dispatch(call_id: String, result: ToolResult) -> Self {
        if result.success {
            Self::ToolResult { call_id, result }
        } else {
            Self::ToolError {
                call_id,
                error: result.content,
            }
        }
    }
}
