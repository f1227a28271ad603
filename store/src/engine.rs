//! The block engine and its block builders.

use std::sync::Arc;

use strata_types::{BlockData, BlockDataWithWitness, BlockHeader, Witness};

use crate::{BlockQueries, EngineError, TransactionFactory, TransactionQueue};

/// An open, uncommitted block.
///
/// Exactly one of [`commit`](Self::commit) or [`rollback`](Self::rollback)
/// ends its life; both consume the builder.
pub trait ManagedBlockBuilder: Send {
    fn block_data(&self) -> &BlockData;

    fn commit(self: Box<Self>, witness: Witness) -> Result<(), EngineError>;

    fn rollback(self: Box<Self>);
}

/// Decides when the primary should build the next block.
pub trait BlockBuildingStrategy: Send + Sync {
    fn should_build_block(&self) -> bool;
}

/// Storage + execution collaborator driven by the consensus core.
pub trait BlockchainEngine: Send + Sync {
    /// Build a candidate block from the pending transaction queue.
    fn build_block(&self) -> Result<Box<dyn ManagedBlockBuilder>, EngineError>;

    /// Validate a block received from a peer and open a builder for it.
    ///
    /// Checks the previous-block link, timestamp monotonicity and that every
    /// transaction decodes and is correct.
    fn load_unfinished_block(
        &self,
        block: &BlockData,
    ) -> Result<Box<dyn ManagedBlockBuilder>, EngineError>;

    /// Append an already-witnessed block (catch-up path).
    fn add_block(&self, block: &BlockDataWithWitness) -> Result<(), EngineError>;

    /// Decode an opaque header received from a peer.
    fn decode_block_header(&self, raw: &[u8]) -> Result<BlockHeader, EngineError>;

    fn block_queries(&self) -> Arc<dyn BlockQueries>;

    fn transaction_queue(&self) -> Arc<dyn TransactionQueue>;

    fn transaction_factory(&self) -> Arc<dyn TransactionFactory>;

    fn block_building_strategy(&self) -> Arc<dyn BlockBuildingStrategy>;

    /// Set when the engine wants the process manager to rebuild it, e.g.
    /// after a configuration change.
    fn is_restart_needed(&self) -> bool;

    fn shutdown(&self);
}
