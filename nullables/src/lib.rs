//! Nullable infrastructure for deterministic testing.
//!
//! Everything the validator depends on from the outside (clock, block engine,
//! transactions, peer network) sits behind a trait. This crate provides
//! implementations that:
//! - Return deterministic values
//! - Can be controlled programmatically
//! - Never touch the filesystem or network
//!
//! [`NullEngine`] is also complete enough to run a local devnet: it keeps an
//! in-memory chain, validates received blocks and builds from its own queue.

pub mod clock;
pub mod engine;
pub mod network;
pub mod transaction;

pub use clock::{Clock, NullClock, SystemClock};
pub use engine::{BasicBlockBuildingStrategy, NullBlockStore, NullEngine, NullHeader};
pub use network::{NullCommunicationManager, Recipient};
pub use transaction::{
    NullTransaction, NullTransactionFactory, NullTransactionQueue, INVALID_TX_MARKER, MAX_REJECTIONS,
};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Lock `mutex`, taking the data even if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
