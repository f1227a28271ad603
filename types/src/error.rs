//! Errors for the shared type layer.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum TypesError {
    #[error("signer set must not be empty")]
    EmptySignerSet,

    #[error("duplicate signer at index {0}")]
    DuplicateSigner(usize),

    #[error("node index {index} out of range for {count} signers")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("serialization error: {0}")]
    Serialization(String),
}
