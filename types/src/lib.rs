//! Fundamental types for the Strata validator.
//!
//! This crate defines the core types shared across every other crate in the workspace:
//! content hashes, keys and signatures, per-node consensus status, block data and
//! witnesses, and the configured signer set with its quorum arithmetic.

pub mod block;
pub mod error;
pub mod hash;
pub mod keys;
pub mod signers;
pub mod status;

pub use block::{BlockData, BlockDataWithWitness, BlockHeader, Witness};
pub use error::TypesError;
pub use hash::{BlockRid, TxRid};
pub use keys::{KeyPair, PrivateKey, PublicKey, Signature};
pub use signers::SignerSet;
pub use status::{NodeState, NodeStatus};
