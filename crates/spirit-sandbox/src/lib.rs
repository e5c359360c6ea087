pub mod error;
pub mod executor;
pub mod ipc;
pub mod types;

pub use error::{Result, SandboxError};
pub use executor::SandboxExecutor;
pub use types::{
    ExecutionContext, ExecutionRequest, ExecutionResult, HostMessage, SubordinateMessage,
    ToolDispatcher, ToolResult,
};
