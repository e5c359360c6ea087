use thiserror::Error;

/// Errors that propagate across crate boundaries (agent loop / persistence /
/// configuration). Errors confined to a tool or mutation boundary are
/// translated to ordinary values before they reach this enum — see each
/// component's own error type for those.
#[derive(Debug, Error)]
pub enum SpiritError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("model error: {0}")]
    Model(String),

    #[error("persistence error: {0}")]
    Database(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl SpiritError {
    /// Short, stable error code for logs and any surface that needs to key on kind.
    pub fn code(&self) -> &'static str {
        match self {
            SpiritError::Config(_) => "CONFIG_ERROR",
            SpiritError::Model(_) => "MODEL_ERROR",
            SpiritError::Database(_) => "DATABASE_ERROR",
            SpiritError::Serialization(_) => "SERIALIZATION_ERROR",
            SpiritError::Io(_) => "IO_ERROR",
            SpiritError::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

pub type Result<T> = std::result::Result<T, SpiritError>;
