//! Strata validator node.
//!
//! Runs one validator of a fixed signer set on top of a pluggable block
//! engine and transport:
//! - [`BlockDatabase`] serializes all mutating engine work on its own thread
//! - [`BlockManager`] turns the status table into block database jobs
//! - [`ValidatorSyncManager`] is the round loop
//! - [`ValidatorWorker`] owns all of it and drives the loop on a tokio task

pub mod block_database;
pub mod block_manager;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod shutdown;
pub mod sync_manager;
pub mod worker;

pub use block_database::{BlockDatabase, DbReply};
pub use block_manager::BlockManager;
pub use config::{ConsensusParams, NodeConfig};
pub use error::NodeError;
pub use logging::{init_logging, LogFormat};
pub use metrics::NodeMetrics;
pub use shutdown::ShutdownController;
pub use sync_manager::ValidatorSyncManager;
pub use worker::{RestartHandler, ValidatorWorker};
