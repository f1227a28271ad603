//! In-memory block engine.
//!
//! Headers are bincode-encoded [`NullHeader`]s and a block's RID is the
//! Blake2b-256 hash of those bytes. Transactions are opaque bytes decoded by
//! [`NullTransactionFactory`]. The chain lives in a [`NullBlockStore`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use strata_crypto::{blake2b_256_multi, hash_block_header};
use strata_store::{
    BlockBuildingStrategy, BlockQueries, BlockchainEngine, EngineError, ManagedBlockBuilder,
    Transaction, TransactionFactory, TransactionQueue,
};
use strata_types::{BlockData, BlockDataWithWitness, BlockHeader, BlockRid, TxRid, Witness};

use crate::{lock, Clock, NullTransactionFactory, NullTransactionQueue};

pub const DEFAULT_MAX_BLOCK_TRANSACTIONS: usize = 100;

/// The decoded form of a raw block header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullHeader {
    pub prev_block_rid: BlockRid,
    pub height: i64,
    pub timestamp_ms: u64,
    /// Hash over the block's transaction RIDs in order.
    pub tx_root: [u8; 32],
}

impl NullHeader {
    pub fn encode(&self) -> Result<Vec<u8>, EngineError> {
        bincode::serialize(self).map_err(|e| EngineError::Backend(e.to_string()))
    }

    pub fn decode(raw: &[u8]) -> Result<Self, EngineError> {
        bincode::deserialize(raw).map_err(|e| EngineError::Decode(e.to_string()))
    }

    pub fn tx_root(rids: &[TxRid]) -> [u8; 32] {
        let parts: Vec<&[u8]> = rids.iter().map(|r| r.as_bytes().as_slice()).collect();
        blake2b_256_multi(&parts)
    }
}

struct StoredBlock {
    block: BlockDataWithWitness,
    timestamp_ms: u64,
    tx_rids: Vec<TxRid>,
}

#[derive(Default)]
struct ChainState {
    blocks: Vec<StoredBlock>,
    by_rid: HashMap<BlockRid, usize>,
    transactions: HashMap<TxRid, Vec<u8>>,
}

/// Where the next block attaches.
#[derive(Clone, Copy, Debug)]
struct Tip {
    next_height: i64,
    prev_block_rid: BlockRid,
    prev_timestamp_ms: u64,
}

/// Committed blocks, indexed by height and RID.
#[derive(Default)]
pub struct NullBlockStore {
    state: Mutex<ChainState>,
}

impl NullBlockStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tip(&self) -> Tip {
        let state = lock(&self.state);
        match state.blocks.last() {
            Some(last) => Tip {
                next_height: state.blocks.len() as i64,
                prev_block_rid: last.block.block_rid(),
                prev_timestamp_ms: last.timestamp_ms,
            },
            None => Tip {
                next_height: 0,
                prev_block_rid: BlockRid::ZERO,
                prev_timestamp_ms: 0,
            },
        }
    }

    fn contains_transaction(&self, rid: &TxRid) -> bool {
        lock(&self.state).transactions.contains_key(rid)
    }

    fn append(
        &self,
        block: BlockDataWithWitness,
        header: &NullHeader,
        tx_rids: Vec<TxRid>,
    ) -> Result<(), EngineError> {
        let mut state = lock(&self.state);
        let next_height = state.blocks.len() as i64;
        let prev = state
            .blocks
            .last()
            .map(|b| b.block.block_rid())
            .unwrap_or(BlockRid::ZERO);
        if header.height != next_height || header.prev_block_rid != prev {
            return Err(EngineError::Conflict {
                height: header.height,
            });
        }
        for (rid, raw) in tx_rids.iter().zip(&block.transactions) {
            state.transactions.insert(*rid, raw.clone());
        }
        let index = state.blocks.len();
        state.by_rid.insert(block.block_rid(), index);
        state.blocks.push(StoredBlock {
            block,
            timestamp_ms: header.timestamp_ms,
            tx_rids,
        });
        Ok(())
    }
}

impl BlockQueries for NullBlockStore {
    fn best_height(&self) -> Result<i64, EngineError> {
        Ok(lock(&self.state).blocks.len() as i64 - 1)
    }

    fn block_at_height(&self, height: i64) -> Result<Option<BlockDataWithWitness>, EngineError> {
        let state = lock(&self.state);
        let Ok(index) = usize::try_from(height) else {
            return Ok(None);
        };
        Ok(state.blocks.get(index).map(|b| b.block.clone()))
    }

    fn block_header(&self, block_rid: &BlockRid) -> Result<Option<BlockHeader>, EngineError> {
        let state = lock(&self.state);
        Ok(state
            .by_rid
            .get(block_rid)
            .map(|&i| state.blocks[i].block.header.clone()))
    }

    fn tx_rids_at_height(&self, height: i64) -> Result<Vec<TxRid>, EngineError> {
        let state = lock(&self.state);
        let block = usize::try_from(height)
            .ok()
            .and_then(|i| state.blocks.get(i))
            .ok_or_else(|| EngineError::NotFound(format!("height {height}")))?;
        Ok(block.tx_rids.clone())
    }

    fn transaction(&self, rid: &TxRid) -> Result<Option<Vec<u8>>, EngineError> {
        Ok(lock(&self.state).transactions.get(rid).cloned())
    }
}

/// Build when transactions are waiting, or when `max_block_time_ms` has
/// passed since the last block.
pub struct BasicBlockBuildingStrategy {
    queue: Arc<NullTransactionQueue>,
    clock: Arc<dyn Clock>,
    max_block_time_ms: Option<u64>,
    last_block_ms: AtomicU64,
}

impl BasicBlockBuildingStrategy {
    pub fn new(
        queue: Arc<NullTransactionQueue>,
        clock: Arc<dyn Clock>,
        max_block_time_ms: Option<u64>,
    ) -> Self {
        let now = clock.now_ms();
        Self {
            queue,
            clock,
            max_block_time_ms,
            last_block_ms: AtomicU64::new(now),
        }
    }

    fn on_block_committed(&self) {
        self.last_block_ms
            .store(self.clock.now_ms(), Ordering::SeqCst);
    }
}

impl BlockBuildingStrategy for BasicBlockBuildingStrategy {
    fn should_build_block(&self) -> bool {
        if !self.queue.is_empty() {
            return true;
        }
        match self.max_block_time_ms {
            Some(max) => {
                let elapsed = self
                    .clock
                    .now_ms()
                    .saturating_sub(self.last_block_ms.load(Ordering::SeqCst));
                elapsed >= max
            }
            None => false,
        }
    }
}

struct NullBlockBuilder {
    data: BlockData,
    header: NullHeader,
    tx_rids: Vec<TxRid>,
    store: Arc<NullBlockStore>,
    queue: Arc<NullTransactionQueue>,
    strategy: Arc<BasicBlockBuildingStrategy>,
    open_builders: Arc<AtomicUsize>,
}

impl ManagedBlockBuilder for NullBlockBuilder {
    fn block_data(&self) -> &BlockData {
        &self.data
    }

    fn commit(self: Box<Self>, witness: Witness) -> Result<(), EngineError> {
        let this = *self;
        this.open_builders.fetch_sub(1, Ordering::SeqCst);
        let block = BlockDataWithWitness {
            header: this.data.header,
            transactions: this.data.transactions,
            witness,
        };
        this.store.append(block, &this.header, this.tx_rids.clone())?;
        this.queue.remove_all(&this.tx_rids);
        this.strategy.on_block_committed();
        tracing::debug!(height = this.header.height, "committed block");
        Ok(())
    }

    fn rollback(self: Box<Self>) {
        self.open_builders.fetch_sub(1, Ordering::SeqCst);
        tracing::trace!(height = self.header.height, "rolled back block builder");
    }
}

/// In-memory [`BlockchainEngine`].
pub struct NullEngine {
    store: Arc<NullBlockStore>,
    queue: Arc<NullTransactionQueue>,
    factory: Arc<NullTransactionFactory>,
    strategy: Arc<BasicBlockBuildingStrategy>,
    clock: Arc<dyn Clock>,
    max_block_transactions: usize,
    open_builders: Arc<AtomicUsize>,
    restart_needed: AtomicBool,
    shut_down: AtomicBool,
}

impl NullEngine {
    pub fn new(clock: Arc<dyn Clock>, max_block_time_ms: Option<u64>) -> Self {
        let queue = Arc::new(NullTransactionQueue::new());
        let strategy = Arc::new(BasicBlockBuildingStrategy::new(
            Arc::clone(&queue),
            Arc::clone(&clock),
            max_block_time_ms,
        ));
        Self {
            store: Arc::new(NullBlockStore::new()),
            queue,
            factory: Arc::new(NullTransactionFactory),
            strategy,
            clock,
            max_block_transactions: DEFAULT_MAX_BLOCK_TRANSACTIONS,
            open_builders: Arc::new(AtomicUsize::new(0)),
            restart_needed: AtomicBool::new(false),
            shut_down: AtomicBool::new(false),
        }
    }

    pub fn with_max_block_transactions(mut self, max: usize) -> Self {
        self.max_block_transactions = max;
        self
    }

    pub fn store(&self) -> &Arc<NullBlockStore> {
        &self.store
    }

    /// Builders handed out and not yet committed or rolled back.
    pub fn open_builders(&self) -> usize {
        self.open_builders.load(Ordering::SeqCst)
    }

    /// Ask the process manager to rebuild this engine.
    pub fn request_restart(&self) {
        self.restart_needed.store(true, Ordering::SeqCst);
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }

    fn ensure_running(&self) -> Result<(), EngineError> {
        if self.is_shut_down() {
            Err(EngineError::ShutDown)
        } else {
            Ok(())
        }
    }

    /// Check a block against the chain tip and decode its transactions.
    fn validate(
        &self,
        header: &BlockHeader,
        transactions: &[Vec<u8>],
    ) -> Result<(NullHeader, Vec<TxRid>), EngineError> {
        let decoded = NullHeader::decode(&header.raw_data)?;
        if hash_block_header(&header.raw_data) != header.block_rid {
            return Err(EngineError::InvalidBlock("rid does not match header".into()));
        }
        if decoded.prev_block_rid != header.prev_block_rid {
            return Err(EngineError::InvalidBlock("inconsistent previous block".into()));
        }

        let tip = self.store.tip();
        if decoded.height != tip.next_height {
            return Err(EngineError::Conflict {
                height: decoded.height,
            });
        }
        if decoded.prev_block_rid != tip.prev_block_rid {
            return Err(EngineError::InvalidBlock(format!(
                "previous block {} is not the chain tip {}",
                decoded.prev_block_rid.short(),
                tip.prev_block_rid.short()
            )));
        }
        if decoded.timestamp_ms <= tip.prev_timestamp_ms {
            return Err(EngineError::InvalidBlock(format!(
                "timestamp {} not after {}",
                decoded.timestamp_ms, tip.prev_timestamp_ms
            )));
        }

        let mut rids = Vec::with_capacity(transactions.len());
        for raw in transactions {
            let tx = self.factory.decode_transaction(raw)?;
            if !tx.is_correct() {
                return Err(EngineError::InvalidTransaction(tx.rid().to_string()));
            }
            rids.push(tx.rid());
        }
        if NullHeader::tx_root(&rids) != decoded.tx_root {
            return Err(EngineError::InvalidBlock("transaction root mismatch".into()));
        }
        Ok((decoded, rids))
    }

    fn builder(&self, data: BlockData, header: NullHeader, tx_rids: Vec<TxRid>) -> Box<dyn ManagedBlockBuilder> {
        self.open_builders.fetch_add(1, Ordering::SeqCst);
        Box::new(NullBlockBuilder {
            data,
            header,
            tx_rids,
            store: Arc::clone(&self.store),
            queue: Arc::clone(&self.queue),
            strategy: Arc::clone(&self.strategy),
            open_builders: Arc::clone(&self.open_builders),
        })
    }
}

impl BlockchainEngine for NullEngine {
    fn build_block(&self) -> Result<Box<dyn ManagedBlockBuilder>, EngineError> {
        self.ensure_running()?;
        let tip = self.store.tip();
        let txs: Vec<Arc<dyn Transaction>> = self
            .queue
            .transactions_for_block(usize::MAX)
            .into_iter()
            .filter(|tx| !self.store.contains_transaction(&tx.rid()))
            .take(self.max_block_transactions)
            .collect();
        let tx_rids: Vec<TxRid> = txs.iter().map(|t| t.rid()).collect();

        let header = NullHeader {
            prev_block_rid: tip.prev_block_rid,
            height: tip.next_height,
            timestamp_ms: self.clock.now_ms().max(tip.prev_timestamp_ms + 1),
            tx_root: NullHeader::tx_root(&tx_rids),
        };
        let raw_data = header.encode()?;
        let data = BlockData::new(
            BlockHeader {
                block_rid: hash_block_header(&raw_data),
                prev_block_rid: tip.prev_block_rid,
                raw_data,
            },
            txs.iter().map(|t| t.raw_data().to_vec()).collect(),
        );
        tracing::debug!(
            height = header.height,
            transactions = tx_rids.len(),
            "built block"
        );
        Ok(self.builder(data, header, tx_rids))
    }

    fn load_unfinished_block(
        &self,
        block: &BlockData,
    ) -> Result<Box<dyn ManagedBlockBuilder>, EngineError> {
        self.ensure_running()?;
        let (header, tx_rids) = self.validate(&block.header, &block.transactions)?;
        Ok(self.builder(block.clone(), header, tx_rids))
    }

    fn add_block(&self, block: &BlockDataWithWitness) -> Result<(), EngineError> {
        self.ensure_running()?;
        let (header, tx_rids) = self.validate(&block.header, &block.transactions)?;
        self.store.append(block.clone(), &header, tx_rids.clone())?;
        self.queue.remove_all(&tx_rids);
        self.strategy.on_block_committed();
        tracing::debug!(height = header.height, "added block");
        Ok(())
    }

    fn decode_block_header(&self, raw: &[u8]) -> Result<BlockHeader, EngineError> {
        let decoded = NullHeader::decode(raw)?;
        Ok(BlockHeader {
            block_rid: hash_block_header(raw),
            prev_block_rid: decoded.prev_block_rid,
            raw_data: raw.to_vec(),
        })
    }

    fn block_queries(&self) -> Arc<dyn BlockQueries> {
        self.store.clone()
    }

    fn transaction_queue(&self) -> Arc<dyn TransactionQueue> {
        self.queue.clone()
    }

    fn transaction_factory(&self) -> Arc<dyn TransactionFactory> {
        self.factory.clone()
    }

    fn block_building_strategy(&self) -> Arc<dyn BlockBuildingStrategy> {
        self.strategy.clone()
    }

    fn is_restart_needed(&self) -> bool {
        self.restart_needed.load(Ordering::SeqCst)
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{NullClock, NullTransaction, INVALID_TX_MARKER};

    fn engine() -> (Arc<NullClock>, NullEngine) {
        let clock = Arc::new(NullClock::new(1_000));
        let engine = NullEngine::new(clock.clone(), Some(500));
        (clock, engine)
    }

    fn enqueue(engine: &NullEngine, data: &[u8]) -> TxRid {
        let tx = Arc::new(NullTransaction::new(data.to_vec()));
        let rid = tx.rid();
        engine.transaction_queue().enqueue(tx);
        rid
    }

    fn commit(builder: Box<dyn ManagedBlockBuilder>) {
        builder.commit(Witness::default()).unwrap();
    }

    #[test]
    fn build_and_commit_extends_chain() {
        let (_, engine) = engine();
        let queries = engine.block_queries();
        assert_eq!(queries.best_height().unwrap(), -1);

        let a = enqueue(&engine, b"a");
        let b = enqueue(&engine, b"b");
        let builder = engine.build_block().unwrap();
        assert_eq!(builder.block_data().transactions.len(), 2);
        assert_eq!(builder.block_data().header.prev_block_rid, BlockRid::ZERO);
        let rid = builder.block_data().block_rid();
        commit(builder);

        assert_eq!(queries.best_height().unwrap(), 0);
        assert_eq!(queries.tx_rids_at_height(0).unwrap(), vec![a, b]);
        assert!(engine.transaction_queue().is_empty());
        assert!(queries.block_header(&rid).unwrap().is_some());
        assert_eq!(queries.transaction(&a).unwrap(), Some(b"a".to_vec()));
    }

    #[test]
    fn rolled_back_build_keeps_queue() {
        let (_, engine) = engine();
        enqueue(&engine, b"a");
        engine.build_block().unwrap().rollback();
        assert_eq!(engine.open_builders(), 0);
        assert_eq!(engine.transaction_queue().len(), 1);
        assert_eq!(engine.block_queries().best_height().unwrap(), -1);
    }

    #[test]
    fn peer_accepts_built_block() {
        let (_, primary) = engine();
        let (_, follower) = engine();
        enqueue(&primary, b"x");
        let built = primary.build_block().unwrap();
        let data = built.block_data().clone();

        let loaded = follower.load_unfinished_block(&data).unwrap();
        commit(loaded);
        commit(built);
        assert_eq!(
            follower.block_queries().tx_rids_at_height(0).unwrap(),
            primary.block_queries().tx_rids_at_height(0).unwrap()
        );
    }

    #[test]
    fn load_rejects_bad_blocks() {
        let (_, primary) = engine();
        let (_, follower) = engine();
        enqueue(&primary, b"x");
        let good = primary.build_block().unwrap().block_data().clone();

        let mut wrong_rid = good.clone();
        wrong_rid.header.block_rid = BlockRid::new([9; 32]);
        assert!(matches!(
            follower.load_unfinished_block(&wrong_rid),
            Err(EngineError::InvalidBlock(_))
        ));

        let mut extra_tx = good.clone();
        extra_tx.transactions.push(b"y".to_vec());
        assert!(matches!(
            follower.load_unfinished_block(&extra_tx),
            Err(EngineError::InvalidBlock(_))
        ));

        let mut bad_tx = good;
        bad_tx.transactions = vec![vec![INVALID_TX_MARKER]];
        assert!(matches!(
            follower.load_unfinished_block(&bad_tx),
            Err(EngineError::InvalidTransaction(_))
        ));
    }

    #[test]
    fn stale_height_conflicts() {
        let (_, engine) = engine();
        let first = engine.build_block().unwrap();
        let data = first.block_data().clone();
        commit(first);
        let block = BlockDataWithWitness {
            header: data.header,
            transactions: data.transactions,
            witness: Witness::default(),
        };
        assert!(matches!(
            engine.add_block(&block),
            Err(EngineError::Conflict { height: 0 })
        ));
    }

    #[test]
    fn timestamps_strictly_increase() {
        let (clock, engine) = engine();
        commit(engine.build_block().unwrap());
        clock.set(0);
        let next = engine.build_block().unwrap();
        let header = NullHeader::decode(&next.block_data().header.raw_data).unwrap();
        assert_eq!(header.timestamp_ms, 1_001);
    }

    #[test]
    fn strategy_builds_on_queue_or_timeout() {
        let (clock, engine) = engine();
        let strategy = engine.block_building_strategy();
        assert!(!strategy.should_build_block());
        clock.advance(500);
        assert!(strategy.should_build_block());

        commit(engine.build_block().unwrap());
        assert!(!strategy.should_build_block());
        enqueue(&engine, b"t");
        assert!(strategy.should_build_block());
    }

    #[test]
    fn shutdown_refuses_work() {
        let (_, engine) = engine();
        engine.shutdown();
        assert!(matches!(engine.build_block(), Err(EngineError::ShutDown)));
    }

    #[test]
    fn headers_indexed_by_rid_at_every_height() {
        let (_, engine) = engine();
        let queries = engine.block_queries();
        let mut rids = Vec::new();
        for data in [b"a", b"b", b"c"] {
            enqueue(&engine, data);
            let builder = engine.build_block().unwrap();
            rids.push(builder.block_data().block_rid());
            commit(builder);
        }
        for (height, rid) in rids.iter().enumerate() {
            let header = queries.block_header(rid).unwrap().unwrap();
            assert_eq!(header.block_rid, *rid);
            assert_eq!(
                queries.block_at_height(height as i64).unwrap().unwrap().block_rid(),
                *rid
            );
        }
    }

    #[test]
    fn header_decode_matches_rid() {
        let (_, engine) = engine();
        let built = engine.build_block().unwrap();
        let header = &built.block_data().header;
        assert_eq!(engine.decode_block_header(&header.raw_data).unwrap(), *header);
        assert!(engine.decode_block_header(&[1, 2]).is_err());
    }
}
