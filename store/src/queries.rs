//! Read-only block queries.

use strata_types::{BlockDataWithWitness, BlockHeader, BlockRid, TxRid};

use crate::EngineError;

/// Read access to committed blocks.
///
/// Queries never need mutual exclusion against each other, so callers may use
/// them directly instead of going through the serialized block pipeline.
pub trait BlockQueries: Send + Sync {
    /// Height of the last committed block, or `-1` for an empty chain.
    fn best_height(&self) -> Result<i64, EngineError>;

    fn block_at_height(&self, height: i64) -> Result<Option<BlockDataWithWitness>, EngineError>;

    /// Header of a committed block, looked up by RID.
    fn block_header(&self, block_rid: &BlockRid) -> Result<Option<BlockHeader>, EngineError>;

    /// Transaction RIDs of the committed block at `height`, in block order.
    fn tx_rids_at_height(&self, height: i64) -> Result<Vec<TxRid>, EngineError>;

    fn transaction(&self, rid: &TxRid) -> Result<Option<Vec<u8>>, EngineError>;
}
