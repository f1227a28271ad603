//! Opaque byte transactions and an in-memory FIFO queue.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use strata_crypto::hash_transaction;
use strata_store::{EngineError, Transaction, TransactionFactory, TransactionQueue};
use strata_types::TxRid;

use crate::lock;

/// Transactions whose first byte is this value decode but are not correct.
pub const INVALID_TX_MARKER: u8 = 0xFF;

/// Rejection reasons kept before the oldest is forgotten.
pub const MAX_REJECTIONS: usize = 1_000;

/// A transaction whose content is its raw bytes.
pub struct NullTransaction {
    rid: TxRid,
    data: Vec<u8>,
}

impl NullTransaction {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            rid: hash_transaction(&data),
            data,
        }
    }
}

impl Transaction for NullTransaction {
    fn rid(&self) -> TxRid {
        self.rid
    }

    fn raw_data(&self) -> &[u8] {
        &self.data
    }

    fn is_correct(&self) -> bool {
        self.data.first() != Some(&INVALID_TX_MARKER)
    }
}

/// Decodes any non-empty byte string.
#[derive(Default)]
pub struct NullTransactionFactory;

impl TransactionFactory for NullTransactionFactory {
    fn decode_transaction(&self, data: &[u8]) -> Result<Arc<dyn Transaction>, EngineError> {
        if data.is_empty() {
            return Err(EngineError::Decode("empty transaction".into()));
        }
        Ok(Arc::new(NullTransaction::new(data.to_vec())))
    }
}

#[derive(Default)]
struct Rejections {
    reasons: HashMap<TxRid, String>,
    order: VecDeque<TxRid>,
}

/// Admission-ordered queue, deduplicated by RID.
#[derive(Default)]
pub struct NullTransactionQueue {
    pending: Mutex<Vec<Arc<dyn Transaction>>>,
    rejected: Mutex<Rejections>,
}

impl NullTransactionQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

impl TransactionQueue for NullTransactionQueue {
    fn enqueue(&self, tx: Arc<dyn Transaction>) -> bool {
        let mut pending = lock(&self.pending);
        let rid = tx.rid();
        if pending.iter().any(|t| t.rid() == rid) {
            return false;
        }
        pending.push(tx);
        true
    }

    fn transactions_for_block(&self, max: usize) -> Vec<Arc<dyn Transaction>> {
        lock(&self.pending).iter().take(max).cloned().collect()
    }

    fn remove_all(&self, rids: &[TxRid]) {
        lock(&self.pending).retain(|t| !rids.contains(&t.rid()));
    }

    fn len(&self) -> usize {
        lock(&self.pending).len()
    }

    fn reject(&self, rid: TxRid, reason: String) {
        let mut rejected = lock(&self.rejected);
        if rejected.reasons.insert(rid, reason).is_none() {
            rejected.order.push_back(rid);
        }
        while rejected.order.len() > MAX_REJECTIONS {
            if let Some(oldest) = rejected.order.pop_front() {
                rejected.reasons.remove(&oldest);
            }
        }
    }

    fn rejection_reason(&self, rid: &TxRid) -> Option<String> {
        lock(&self.rejected).reasons.get(rid).cloned()
    }
}
