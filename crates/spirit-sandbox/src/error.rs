use thiserror::Error;

#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("code exceeds max_code_size ({len} > {max})")]
    CodeTooLarge { len: usize, max: usize },

    #[error("failed to read runtime bridge script at {path}: {source}")]
    BridgeUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to spawn sandbox runtime: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("sandbox execution timed out after {0}ms")]
    Timeout(u64),

    #[error("sandbox output exceeded max_output_size ({0} bytes)")]
    OutputOverflow(usize),

    #[error("sandbox made more than {0} tool calls")]
    ToolCallOverflow(u32),

    #[error("{0}")]
    Io(#[from] std::io::Error),
}

impl SandboxError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::CodeTooLarge { .. } => "CODE_TOO_LARGE",
            Self::BridgeUnreadable { .. } => "BRIDGE_UNREADABLE",
            Self::Spawn(_) => "SPAWN_ERROR",
            Self::Timeout(_) => "TIMEOUT",
            Self::OutputOverflow(_) => "OUTPUT_OVERFLOW",
            Self::ToolCallOverflow(_) => "TOOL_CALL_OVERFLOW",
            Self::Io(_) => "IO_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
