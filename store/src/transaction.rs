//! Transaction traits.

use std::sync::Arc;

use strata_types::TxRid;

use crate::EngineError;

/// A decoded transaction.
pub trait Transaction: Send + Sync {
    fn rid(&self) -> TxRid;

    fn raw_data(&self) -> &[u8];

    /// Structural validity check performed before a transaction is queued.
    fn is_correct(&self) -> bool;
}

/// Decodes raw bytes into transactions.
pub trait TransactionFactory: Send + Sync {
    fn decode_transaction(&self, data: &[u8]) -> Result<Arc<dyn Transaction>, EngineError>;
}

/// Pending transactions waiting to be included in a block.
///
/// Building a block reads from the queue without removing anything; the
/// transactions are removed once a block containing them is committed, so a
/// rolled-back build loses nothing.
pub trait TransactionQueue: Send + Sync {
    /// Add a transaction. Returns `false` if it was already queued.
    fn enqueue(&self, tx: Arc<dyn Transaction>) -> bool;

    /// Up to `max` queued transactions in admission order.
    fn transactions_for_block(&self, max: usize) -> Vec<Arc<dyn Transaction>>;

    /// Drop transactions that were included in a committed block.
    fn remove_all(&self, rids: &[TxRid]);

    fn len(&self) -> usize;

    /// Remember why `rid` was refused admission.
    fn reject(&self, rid: TxRid, reason: String);

    /// Why `rid` was refused, if it was and is still remembered.
    fn rejection_reason(&self, rid: &TxRid) -> Option<String>;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
