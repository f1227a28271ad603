//! One validator: the round loop on a tokio task plus its block database.
//!
//! [`ValidatorWorker::start`] wires the pieces together from a
//! [`NodeConfig`], an engine and a transport, and spawns the loop.
//! [`ValidatorWorker::shutdown`] stops the loop, then the block database,
//! then the transport and engine, in that order.

use std::sync::Arc;
use std::time::Duration;

use strata_crypto::SigMaker;
use strata_messages::{EbftMessage, TransactionMsg};
use strata_network::CommunicationManager;
use strata_store::BlockchainEngine;
use strata_types::{NodeStatus, TxRid};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::block_database::BlockDatabase;
use crate::sync_manager::{decode_checked_transaction, ValidatorSyncManager};
use crate::{NodeConfig, NodeError, NodeMetrics, ShutdownController};

/// Called once when the engine asks to be rebuilt.
pub type RestartHandler = Box<dyn Fn() + Send + Sync>;

pub struct ValidatorWorker {
    config: NodeConfig,
    engine: Arc<dyn BlockchainEngine>,
    comm: Arc<dyn CommunicationManager>,
    db: Arc<BlockDatabase>,
    metrics: Arc<NodeMetrics>,
    shutdown: ShutdownController,
    status: watch::Receiver<NodeStatus>,
    round_loop: JoinHandle<()>,
}

impl ValidatorWorker {
    /// Validate `config` and spawn the round loop. Must run inside a tokio runtime.
    pub fn start(
        config: NodeConfig,
        engine: Arc<dyn BlockchainEngine>,
        comm: Arc<dyn CommunicationManager>,
        restart_handler: RestartHandler,
    ) -> Result<Self, NodeError> {
        config.validate()?;
        let signers = Arc::new(config.signer_set()?);
        let sig_maker = Arc::new(SigMaker::new(config.keypair()?));
        let params = config.consensus_params();
        let metrics = Arc::new(NodeMetrics::new());

        let db = Arc::new(BlockDatabase::new(
            Arc::clone(&engine),
            sig_maker,
            Arc::clone(&signers),
            config.db_queue_capacity,
            Duration::from_millis(config.db_stop_timeout_ms),
        )?);
        let sync = ValidatorSyncManager::new(
            params.clone(),
            signers,
            config.node_index,
            Arc::clone(&engine),
            Arc::clone(&db),
            Arc::clone(&comm),
            Arc::clone(&metrics),
        )?;

        let (status_tx, status) = watch::channel(sync.status().my_status().clone());
        let shutdown = ShutdownController::new();
        let round_loop = tokio::spawn(run_round_loop(
            sync,
            params.tick_interval,
            Arc::clone(&engine),
            restart_handler,
            status_tx,
            shutdown.subscribe(),
        ));
        tracing::info!(node = config.node_index, local = %comm.local_id(), "validator started");

        Ok(Self {
            config,
            engine,
            comm,
            db,
            metrics,
            shutdown,
            status,
            round_loop,
        })
    }

    /// Stop the round loop and release the engine and transport.
    pub async fn shutdown(self) -> Result<(), NodeError> {
        let node = self.config.node_index;
        self.shutdown.shutdown();
        if let Err(e) = self.round_loop.await {
            tracing::error!(node, error = %e, "round loop task failed");
        }

        let db = Arc::clone(&self.db);
        let stopped = tokio::task::spawn_blocking(move || db.stop())
            .await
            .map_err(|e| NodeError::Other(format!("block database stop task: {e}")))?;

        self.comm.shutdown();
        self.engine.shutdown();
        tracing::info!(node, "validator stopped");
        stopped
    }

    /// Our latest status, as of the last tick.
    pub fn status(&self) -> NodeStatus {
        self.status.borrow().clone()
    }

    /// Watch our status; updated whenever a tick changes it.
    pub fn status_receiver(&self) -> watch::Receiver<NodeStatus> {
        self.status.clone()
    }

    pub fn engine(&self) -> &Arc<dyn BlockchainEngine> {
        &self.engine
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<NodeMetrics> {
        &self.metrics
    }

    /// Check and enqueue a client transaction, then forward it to peers.
    ///
    /// Nothing is forwarded when the transaction was already queued.
    pub fn submit_transaction(&self, data: &[u8]) -> Result<TxRid, NodeError> {
        let tx = decode_checked_transaction(self.engine.as_ref(), data)?;
        let rid = tx.rid();
        if self.engine.transaction_queue().enqueue(tx) {
            self.comm
                .broadcast_packet(&EbftMessage::Transaction(TransactionMsg {
                    data: data.to_vec(),
                }));
        }
        Ok(rid)
    }
}

async fn run_round_loop(
    mut sync: ValidatorSyncManager,
    tick: Duration,
    engine: Arc<dyn BlockchainEngine>,
    restart_handler: RestartHandler,
    status_tx: watch::Sender<NodeStatus>,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    let mut interval = tokio::time::interval(tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut restart_signalled = false;

    loop {
        tokio::select! {
            _ = shutdown_rx.recv() => {
                tracing::debug!("round loop shutting down");
                break;
            }
            _ = interval.tick() => {
                sync.update();

                let my = sync.status().my_status();
                status_tx.send_if_modified(|current| {
                    if *current != *my {
                        *current = my.clone();
                        true
                    } else {
                        false
                    }
                });

                if !restart_signalled && engine.is_restart_needed() {
                    restart_signalled = true;
                    tracing::info!("engine requested a restart");
                    restart_handler();
                }
            }
        }
    }
}
