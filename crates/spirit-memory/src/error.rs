use thiserror::Error;

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("block not found: {0}")]
    BlockNotFound(String),

    #[error("mutation not found: {0}")]
    MutationNotFound(String),

    #[error("mutation {0} already resolved")]
    MutationAlreadyResolved(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

pub type Result<T> = std::result::Result<T, MemoryError>;
