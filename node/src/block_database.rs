//! Serialized access to the block engine.
//!
//! All mutating engine work runs on one dedicated thread that consumes a
//! bounded job queue, so at most one block builder is ever open. Every job
//! answers through a oneshot channel; the round loop polls those without
//! blocking. Before a build, load or add, any builder left open by an earlier
//! job is rolled back. A failed job also rolls the builder back and the
//! worker carries on with the next job.
//!
//! Reads go straight to [`BlockQueries`] and never wait behind the queue.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{mpsc as std_mpsc, Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use strata_consensus::{verify_witness, WitnessBuilder};
use strata_crypto::SigMaker;
use strata_store::{BlockQueries, BlockchainEngine, ManagedBlockBuilder};
use strata_types::{BlockData, BlockDataWithWitness, BlockRid, Signature, SignerSet};
use tokio::sync::{mpsc, oneshot};

use crate::NodeError;

/// Pending result of a block database job.
pub type DbReply<T> = oneshot::Receiver<Result<T, NodeError>>;

type Responder<T> = oneshot::Sender<Result<T, NodeError>>;

enum DbJob {
    Build {
        reply: Responder<(BlockData, Signature)>,
    },
    Load {
        block: BlockData,
        reply: Responder<Signature>,
    },
    Add {
        block: BlockDataWithWitness,
        reply: Responder<()>,
    },
    Commit {
        signatures: Vec<Signature>,
        reply: Responder<()>,
    },
}

impl DbJob {
    fn kind(&self) -> &'static str {
        match self {
            DbJob::Build { .. } => "build",
            DbJob::Load { .. } => "load",
            DbJob::Add { .. } => "add",
            DbJob::Commit { .. } => "commit",
        }
    }

    fn reject(self, error: NodeError) {
        // The requester may have gone away; nothing to do then.
        match self {
            DbJob::Build { reply } => {
                let _ = reply.send(Err(error));
            }
            DbJob::Load { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            DbJob::Add { reply, .. } => {
                let _ = reply.send(Err(error));
            }
            DbJob::Commit { reply, .. } => {
                let _ = reply.send(Err(error));
            }
        }
    }
}

type SharedWitness = Arc<Mutex<Option<WitnessBuilder>>>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

pub struct BlockDatabase {
    jobs: Mutex<Option<mpsc::Sender<DbJob>>>,
    done: Mutex<Option<std_mpsc::Receiver<()>>>,
    cancelled: Arc<AtomicBool>,
    /// Witness for the open builder; written by the worker thread only.
    witness: SharedWitness,
    queries: Arc<dyn BlockQueries>,
    sig_maker: Arc<SigMaker>,
    stop_timeout: Duration,
}

impl BlockDatabase {
    /// Spawn the worker thread.
    pub fn new(
        engine: Arc<dyn BlockchainEngine>,
        sig_maker: Arc<SigMaker>,
        signers: Arc<SignerSet>,
        queue_capacity: usize,
        stop_timeout: Duration,
    ) -> Result<Self, NodeError> {
        let (jobs_tx, jobs_rx) = mpsc::channel(queue_capacity.max(1));
        let (done_tx, done_rx) = std_mpsc::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let witness: SharedWitness = Arc::new(Mutex::new(None));
        let queries = engine.block_queries();

        let worker = DbWorker {
            engine,
            sig_maker: Arc::clone(&sig_maker),
            signers,
            witness: Arc::clone(&witness),
            builder: None,
        };
        let worker_cancelled = Arc::clone(&cancelled);
        thread::Builder::new()
            .name("block-db".into())
            .spawn(move || worker.run(jobs_rx, worker_cancelled, done_tx))?;

        Ok(Self {
            jobs: Mutex::new(Some(jobs_tx)),
            done: Mutex::new(Some(done_rx)),
            cancelled,
            witness,
            queries,
            sig_maker,
            stop_timeout,
        })
    }

    fn submit<T>(&self, make: impl FnOnce(Responder<T>) -> DbJob) -> DbReply<T> {
        let (tx, rx) = oneshot::channel();
        let job = make(tx);
        let jobs = lock(&self.jobs);
        match jobs.as_ref() {
            None => job.reject(NodeError::DbStopped),
            Some(sender) => match sender.try_send(job) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(job)) => job.reject(NodeError::DbQueueFull),
                Err(mpsc::error::TrySendError::Closed(job)) => job.reject(NodeError::DbStopped),
            },
        }
        rx
    }

    /// Build a candidate block from the transaction queue and sign it.
    pub fn build_block(&self) -> DbReply<(BlockData, Signature)> {
        self.submit(|reply| DbJob::Build { reply })
    }

    /// Validate a peer's unfinished block, open a builder for it and sign it.
    pub fn load_unfinished_block(&self, block: BlockData) -> DbReply<Signature> {
        self.submit(|reply| DbJob::Load { block, reply })
    }

    /// Append a finalized block after checking its witness.
    pub fn add_block(&self, block: BlockDataWithWitness) -> DbReply<()> {
        self.submit(|reply| DbJob::Add { block, reply })
    }

    /// Commit the open builder with `signatures` as its witness.
    pub fn commit_block(&self, signatures: Vec<Signature>) -> DbReply<()> {
        self.submit(|reply| DbJob::Commit { signatures, reply })
    }

    /// Check a commit signature against the open block.
    ///
    /// Valid signatures are also recorded in the open witness. Returns false
    /// when no block is open.
    pub fn verify_block_signature(&self, signature: &Signature) -> bool {
        match lock(&self.witness).as_mut() {
            Some(witness) => witness.apply_signature(signature).is_ok(),
            None => false,
        }
    }

    /// Our signature over an already committed block.
    pub fn get_block_signature(&self, block_rid: &BlockRid) -> Result<Option<Signature>, NodeError> {
        let header = self.queries.block_header(block_rid)?;
        Ok(header.map(|h| self.sig_maker.sign(&h.raw_data)))
    }

    pub fn get_block_at_height(&self, height: i64) -> Result<Option<BlockDataWithWitness>, NodeError> {
        Ok(self.queries.block_at_height(height)?)
    }

    /// Cancel queued jobs, roll back any open builder and wait for the
    /// worker to exit. Blocks for at most the configured stop timeout.
    pub fn stop(&self) -> Result<(), NodeError> {
        self.cancelled.store(true, Ordering::SeqCst);
        lock(&self.jobs).take();
        let Some(done) = lock(&self.done).take() else {
            return Ok(());
        };
        match done.recv_timeout(self.stop_timeout) {
            Ok(()) | Err(std_mpsc::RecvTimeoutError::Disconnected) => {
                tracing::debug!("block database stopped");
                Ok(())
            }
            Err(std_mpsc::RecvTimeoutError::Timeout) => {
                tracing::warn!(timeout = ?self.stop_timeout, "block database did not stop in time");
                Err(NodeError::ShutdownTimeout)
            }
        }
    }
}

impl Drop for BlockDatabase {
    fn drop(&mut self) {
        self.cancelled.store(true, Ordering::SeqCst);
        lock(&self.jobs).take();
    }
}

/// State owned by the worker thread.
struct DbWorker {
    engine: Arc<dyn BlockchainEngine>,
    sig_maker: Arc<SigMaker>,
    signers: Arc<SignerSet>,
    witness: SharedWitness,
    builder: Option<Box<dyn ManagedBlockBuilder>>,
}

impl DbWorker {
    fn run(
        mut self,
        mut jobs: mpsc::Receiver<DbJob>,
        cancelled: Arc<AtomicBool>,
        done: std_mpsc::Sender<()>,
    ) {
        while let Some(job) = jobs.blocking_recv() {
            if cancelled.load(Ordering::SeqCst) {
                job.reject(NodeError::DbCancelled);
                continue;
            }
            let kind = job.kind();
            tracing::trace!(job = kind, "block database job started");
            let ok = self.execute(job);
            if !ok {
                self.maybe_rollback();
            }
            tracing::trace!(job = kind, ok, "block database job finished");
        }
        self.maybe_rollback();
        let _ = done.send(());
    }

    /// Run one job and answer it. Returns false when the open builder must
    /// be rolled back.
    fn execute(&mut self, job: DbJob) -> bool {
        match job {
            DbJob::Build { reply } => respond(reply, self.build()),
            DbJob::Load { block, reply } => respond(reply, self.load(block)),
            DbJob::Add { block, reply } => {
                // A block with a bad witness never touches the open builder.
                if let Err(e) = verify_witness(&self.signers, &block.header.raw_data, &block.witness) {
                    respond(reply, Err(NodeError::from(e)));
                    return true;
                }
                respond(reply, self.add(&block))
            }
            DbJob::Commit { signatures, reply } => respond(reply, self.commit(signatures)),
        }
    }

    fn maybe_rollback(&mut self) {
        if let Some(builder) = self.builder.take() {
            tracing::debug!(
                block_rid = %builder.block_data().block_rid().short(),
                "rolling back open block"
            );
            builder.rollback();
        }
        lock(&self.witness).take();
    }

    /// Sign and remember a freshly opened builder.
    fn open(&mut self, builder: Box<dyn ManagedBlockBuilder>) -> Result<Signature, NodeError> {
        let raw = builder.block_data().header.raw_data.clone();
        let signature = self.sig_maker.sign(&raw);
        let mut witness = WitnessBuilder::new(Arc::clone(&self.signers), raw);
        witness.apply_signature(&signature)?;
        *lock(&self.witness) = Some(witness);
        self.builder = Some(builder);
        Ok(signature)
    }

    fn build(&mut self) -> Result<(BlockData, Signature), NodeError> {
        self.maybe_rollback();
        let builder = self.engine.build_block()?;
        let data = builder.block_data().clone();
        let signature = self.open(builder)?;
        tracing::debug!(block_rid = %data.block_rid().short(), "built block");
        Ok((data, signature))
    }

    fn load(&mut self, block: BlockData) -> Result<Signature, NodeError> {
        self.maybe_rollback();
        let builder = self.engine.load_unfinished_block(&block)?;
        if builder.block_data().block_rid() != block.block_rid() {
            builder.rollback();
            return Err(NodeError::ProtocolViolation(format!(
                "loaded block does not match {}",
                block.block_rid().short()
            )));
        }
        self.open(builder)
    }

    /// Append a block whose witness was already checked.
    fn add(&mut self, block: &BlockDataWithWitness) -> Result<(), NodeError> {
        self.maybe_rollback();
        self.engine.add_block(block)?;
        Ok(())
    }

    fn commit(&mut self, signatures: Vec<Signature>) -> Result<(), NodeError> {
        let witness = {
            let mut guard = lock(&self.witness);
            let witness = guard
                .as_mut()
                .ok_or_else(|| NodeError::ProgrammerMistake("commit without an open block".into()))?;
            for signature in &signatures {
                if let Err(e) = witness.apply_signature(signature) {
                    tracing::debug!(error = %e, "ignoring signature in commit");
                }
            }
            witness.get_witness()?
        };
        let builder = self
            .builder
            .take()
            .ok_or_else(|| NodeError::ProgrammerMistake("open witness without a block".into()))?;
        let rid = builder.block_data().block_rid();
        builder.commit(witness)?;
        lock(&self.witness).take();
        tracing::debug!(block_rid = %rid.short(), "committed block");
        Ok(())
    }
}

fn respond<T>(reply: Responder<T>, result: Result<T, NodeError>) -> bool {
    let ok = result.is_ok();
    if let Err(e) = &result {
        tracing::debug!(error = %e, "block database job failed");
    }
    let _ = reply.send(result);
    ok
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_crypto::keypair_from_seed;
    use strata_nullables::{NullClock, NullEngine, NullTransaction};
    use strata_store::{BlockBuildingStrategy, EngineError, TransactionFactory, TransactionQueue};
    use strata_types::{BlockHeader, Witness};

    struct Fixture {
        engine: Arc<NullEngine>,
        db: BlockDatabase,
        makers: Vec<SigMaker>,
    }

    fn fixture(me: usize) -> Fixture {
        let makers: Vec<SigMaker> = (0..4u8)
            .map(|i| SigMaker::new(keypair_from_seed(&[i + 1; 32])))
            .collect();
        let signers = Arc::new(
            SignerSet::new(makers.iter().map(|m| m.public_key().clone()).collect()).unwrap(),
        );
        let engine = Arc::new(NullEngine::new(Arc::new(NullClock::new(1_000)), None));
        let db = BlockDatabase::new(
            engine.clone(),
            Arc::new(SigMaker::new(keypair_from_seed(&[me as u8 + 1; 32]))),
            signers,
            8,
            Duration::from_secs(1),
        )
        .unwrap();
        Fixture { engine, db, makers }
    }

    async fn settle<T>(reply: DbReply<T>) -> Result<T, NodeError> {
        reply.await.unwrap_or(Err(NodeError::DbStopped))
    }

    fn sign_all(makers: &[SigMaker], data: &BlockData, which: &[usize]) -> Vec<Signature> {
        which
            .iter()
            .map(|&i| makers[i].sign(&data.header.raw_data))
            .collect()
    }

    #[tokio::test]
    async fn build_then_commit_with_quorum() {
        let f = fixture(0);
        f.engine
            .transaction_queue()
            .enqueue(Arc::new(NullTransaction::new(b"tx".to_vec())));

        let (data, own) = settle(f.db.build_block()).await.unwrap();
        assert_eq!(own.subject_id, *f.makers[0].public_key());
        assert!(f.db.verify_block_signature(&f.makers[1].sign(&data.header.raw_data)));
        assert!(!f.db.verify_block_signature(&f.makers[2].sign(b"other")));

        let sigs = sign_all(&f.makers, &data, &[1, 2]);
        settle(f.db.commit_block(sigs)).await.unwrap();
        assert_eq!(f.engine.block_queries().best_height().unwrap(), 0);
        assert!(!f.db.verify_block_signature(&f.makers[3].sign(&data.header.raw_data)));

        let stored = f.db.get_block_at_height(0).unwrap().unwrap();
        assert_eq!(stored.block_rid(), data.block_rid());
        assert!(stored.witness.len() >= 3);
        let sig = f.db.get_block_signature(&data.block_rid()).unwrap().unwrap();
        assert!(strata_crypto::verify_signature(&data.header.raw_data, &sig));
    }

    #[tokio::test]
    async fn commit_without_quorum_fails_and_rolls_back() {
        let f = fixture(0);
        let (data, _) = settle(f.db.build_block()).await.unwrap();
        let result = settle(f.db.commit_block(sign_all(&f.makers, &data, &[1]))).await;
        assert!(matches!(result, Err(NodeError::Consensus(_))));

        let again = settle(f.db.commit_block(sign_all(&f.makers, &data, &[1, 2]))).await;
        assert!(matches!(again, Err(NodeError::ProgrammerMistake(_))));
        assert_eq!(f.engine.block_queries().best_height().unwrap(), -1);
    }

    #[tokio::test]
    async fn queued_jobs_run_in_order() {
        let primary = fixture(1);
        let (block, _) = settle(primary.db.build_block()).await.unwrap();

        let f = fixture(0);
        // Submitted back to back: the load must see the build rolled back.
        let build = f.db.build_block();
        let load = f.db.load_unfinished_block(block.clone());
        let commit = f.db.commit_block(sign_all(&f.makers, &block, &[1, 2, 3]));

        assert!(settle(build).await.is_ok());
        assert!(settle(load).await.is_ok());
        settle(commit).await.unwrap();
        assert_eq!(
            f.engine.block_queries().block_at_height(0).unwrap().unwrap().block_rid(),
            block.block_rid()
        );
    }

    #[tokio::test]
    async fn add_block_requires_complete_witness() {
        let primary = fixture(1);
        let (block, _) = settle(primary.db.build_block()).await.unwrap();
        let f = fixture(0);

        let weak = BlockDataWithWitness {
            header: block.header.clone(),
            transactions: block.transactions.clone(),
            witness: Witness::new(sign_all(&f.makers, &block, &[1, 2])),
        };
        assert!(matches!(
            settle(f.db.add_block(weak)).await,
            Err(NodeError::Consensus(_))
        ));

        let strong = BlockDataWithWitness {
            header: block.header.clone(),
            transactions: block.transactions.clone(),
            witness: Witness::new(sign_all(&f.makers, &block, &[0, 1, 2])),
        };
        settle(f.db.add_block(strong)).await.unwrap();
        assert_eq!(f.engine.block_queries().best_height().unwrap(), 0);
    }

    #[tokio::test]
    async fn bad_witness_keeps_open_block() {
        let primary = fixture(1);
        let (foreign, _) = settle(primary.db.build_block()).await.unwrap();
        let f = fixture(0);
        let (held, _) = settle(f.db.build_block()).await.unwrap();

        let junk = BlockDataWithWitness {
            header: foreign.header.clone(),
            transactions: foreign.transactions.clone(),
            witness: Witness::new(sign_all(&f.makers, &foreign, &[1])),
        };
        assert!(matches!(
            settle(f.db.add_block(junk)).await,
            Err(NodeError::Consensus(_))
        ));
        assert_eq!(f.engine.open_builders(), 1);
        assert!(f.db.verify_block_signature(&f.makers[2].sign(&held.header.raw_data)));

        settle(f.db.commit_block(sign_all(&f.makers, &held, &[1, 2]))).await.unwrap();
        assert_eq!(
            f.engine.block_queries().block_at_height(0).unwrap().unwrap().block_rid(),
            held.block_rid()
        );
    }

    #[tokio::test]
    async fn invalid_block_does_not_stop_worker() {
        let f = fixture(0);
        let (mut data, _) = settle(f.db.build_block()).await.unwrap();
        data.header.block_rid = BlockRid::new([7; 32]);
        assert!(matches!(
            settle(f.db.load_unfinished_block(data)).await,
            Err(NodeError::Engine(_))
        ));
        assert!(settle(f.db.build_block()).await.is_ok());
    }

    #[tokio::test]
    async fn stop_rejects_further_work() {
        let f = fixture(0);
        settle(f.db.build_block()).await.unwrap();
        let db = f.db;
        let db = tokio::task::spawn_blocking(move || {
            db.stop().unwrap();
            db.stop().unwrap();
            db
        })
        .await
        .unwrap();
        assert!(matches!(settle(db.build_block()).await, Err(NodeError::DbStopped)));
        let stray = Signature::new(strata_types::PublicKey([1; 32]), vec![0; 64]);
        assert!(!db.verify_block_signature(&stray));
    }

    /// Parks every build until the test lets it through.
    struct GatedEngine {
        inner: NullEngine,
        entered: Mutex<std_mpsc::Sender<()>>,
        release: Mutex<std_mpsc::Receiver<()>>,
    }

    impl BlockchainEngine for GatedEngine {
        fn build_block(&self) -> Result<Box<dyn ManagedBlockBuilder>, EngineError> {
            let _ = lock(&self.entered).send(());
            let _ = lock(&self.release).recv();
            self.inner.build_block()
        }

        fn load_unfinished_block(
            &self,
            block: &BlockData,
        ) -> Result<Box<dyn ManagedBlockBuilder>, EngineError> {
            self.inner.load_unfinished_block(block)
        }

        fn add_block(&self, block: &BlockDataWithWitness) -> Result<(), EngineError> {
            self.inner.add_block(block)
        }

        fn decode_block_header(&self, raw: &[u8]) -> Result<BlockHeader, EngineError> {
            self.inner.decode_block_header(raw)
        }

        fn block_queries(&self) -> Arc<dyn BlockQueries> {
            self.inner.block_queries()
        }

        fn transaction_queue(&self) -> Arc<dyn TransactionQueue> {
            self.inner.transaction_queue()
        }

        fn transaction_factory(&self) -> Arc<dyn TransactionFactory> {
            self.inner.transaction_factory()
        }

        fn block_building_strategy(&self) -> Arc<dyn BlockBuildingStrategy> {
            self.inner.block_building_strategy()
        }

        fn is_restart_needed(&self) -> bool {
            self.inner.is_restart_needed()
        }

        fn shutdown(&self) {
            self.inner.shutdown()
        }
    }

    #[tokio::test]
    async fn stop_cancels_queued_jobs_and_rolls_back() {
        let (entered_tx, entered_rx) = std_mpsc::channel();
        let (release_tx, release_rx) = std_mpsc::channel();
        let engine = Arc::new(GatedEngine {
            inner: NullEngine::new(Arc::new(NullClock::new(1_000)), None),
            entered: Mutex::new(entered_tx),
            release: Mutex::new(release_rx),
        });
        let maker = SigMaker::new(keypair_from_seed(&[1; 32]));
        let signers = Arc::new(SignerSet::new(vec![maker.public_key().clone()]).unwrap());
        let db = Arc::new(
            BlockDatabase::new(engine.clone(), Arc::new(maker), signers, 8, Duration::from_secs(2))
                .unwrap(),
        );

        let running = db.build_block();
        entered_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        let queued: Vec<_> = (0..3).map(|_| db.build_block()).collect();

        let stopper = {
            let db = Arc::clone(&db);
            tokio::task::spawn_blocking(move || db.stop())
        };
        while !db.cancelled.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        release_tx.send(()).unwrap();
        stopper.await.unwrap().unwrap();

        assert!(settle(running).await.is_ok());
        for reply in queued {
            assert!(matches!(
                settle(reply).await,
                Err(NodeError::DbCancelled | NodeError::DbStopped)
            ));
        }
        assert_eq!(engine.inner.open_builders(), 0);
        assert_eq!(
            entered_rx.try_recv(),
            Err(std_mpsc::TryRecvError::Empty),
            "no queued build reached the engine"
        );
    }
}
