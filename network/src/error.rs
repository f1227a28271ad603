use thiserror::Error;

#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("peer {0} is already connected")]
    AlreadyConnected(String),

    #[error("peer {0} not found")]
    PeerNotFound(String),
}
