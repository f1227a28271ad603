//! Abstract block engine traits for the Strata validator.
//!
//! The consensus core never touches storage or transaction execution directly.
//! It drives a [`BlockchainEngine`] that can build a candidate block from the
//! transaction queue, validate and open a builder for a block received from a
//! peer, and append already-witnessed blocks. Every backend (a database-backed
//! engine, the in-memory engine used for testing) implements these traits.

pub mod engine;
pub mod error;
pub mod queries;
pub mod transaction;

pub use engine::{BlockBuildingStrategy, BlockchainEngine, ManagedBlockBuilder};
pub use error::EngineError;
pub use queries::BlockQueries;
pub use transaction::{Transaction, TransactionFactory, TransactionQueue};
