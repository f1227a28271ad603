use strata_types::TypesError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConsensusError {
    #[error("signature subject {0} is not a configured signer")]
    UnknownSigner(String),

    #[error("invalid signature from signer {subject}")]
    InvalidSignature { subject: String },

    #[error("witness incomplete: {have} < {need}")]
    WitnessIncomplete { have: usize, need: usize },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    #[error(transparent)]
    Types(#[from] TypesError),
}
