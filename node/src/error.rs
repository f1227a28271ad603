use thiserror::Error;

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("engine error: {0}")]
    Engine(#[from] strata_store::EngineError),

    #[error("consensus error: {0}")]
    Consensus(#[from] strata_consensus::ConsensusError),

    #[error("codec error: {0}")]
    Codec(#[from] strata_messages::CodecError),

    #[error("network error: {0}")]
    Network(#[from] strata_network::NetworkError),

    #[error("types error: {0}")]
    Types(#[from] strata_types::TypesError),

    #[error("crypto error: {0}")]
    Crypto(#[from] strata_crypto::CryptoError),

    /// Bad input from a client or a peer's transaction. Reported, never fatal.
    #[error("rejected: {0}")]
    UserMistake(String),

    /// Malformed or unverifiable message from a peer.
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// A broken internal invariant.
    #[error("programmer mistake: {0}")]
    ProgrammerMistake(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("block database queue is full")]
    DbQueueFull,

    #[error("block database is stopped")]
    DbStopped,

    #[error("block database job cancelled")]
    DbCancelled,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("shutdown timeout")]
    ShutdownTimeout,

    #[error("{0}")]
    Other(String),
}
