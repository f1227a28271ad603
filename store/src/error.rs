use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("block not found: {0}")]
    NotFound(String),

    #[error("invalid block: {0}")]
    InvalidBlock(String),

    #[error("invalid transaction: {0}")]
    InvalidTransaction(String),

    #[error("failed to decode: {0}")]
    Decode(String),

    #[error("block at height {height} conflicts with the chain tip")]
    Conflict { height: i64 },

    #[error("storage backend error: {0}")]
    Backend(String),

    #[error("engine is shut down")]
    ShutDown,
}
