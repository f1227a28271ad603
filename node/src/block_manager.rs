//! Turns the status table into block database work.
//!
//! The block manager holds the candidate block we are working on and at most
//! one in-flight block database job. Each tick it first applies whatever that
//! job produced, then derives the next intent. While a job is in flight the
//! intent is `DoNothing`.

use std::sync::Arc;

use strata_consensus::{derive_intent, BlockIntent, StatusManager};
use strata_store::BlockBuildingStrategy;
use strata_types::{BlockData, BlockDataWithWitness, BlockRid, NodeState, Signature};
use tokio::sync::oneshot::error::TryRecvError;

use crate::block_database::{BlockDatabase, DbReply};
use crate::{NodeError, NodeMetrics};

enum PendingOp {
    Build {
        height: i64,
        round: i64,
        reply: DbReply<(BlockData, Signature)>,
    },
    Load {
        height: i64,
        round: i64,
        block: BlockData,
        reply: DbReply<Signature>,
    },
    /// Reopen the held block after a failed commit or add.
    Reopen {
        reply: DbReply<Signature>,
    },
    Add {
        height: i64,
        reply: DbReply<()>,
    },
    Commit {
        block_rid: BlockRid,
        reply: DbReply<()>,
    },
}

impl PendingOp {
    fn kind(&self) -> &'static str {
        match self {
            PendingOp::Build { .. } => "build",
            PendingOp::Load { .. } => "load",
            PendingOp::Reopen { .. } => "reopen",
            PendingOp::Add { .. } => "add",
            PendingOp::Commit { .. } => "commit",
        }
    }
}

/// Poll a reply without waiting. `None` while the job is still running.
fn poll<T>(reply: &mut DbReply<T>) -> Option<Result<T, NodeError>> {
    match reply.try_recv() {
        Ok(result) => Some(result),
        Err(TryRecvError::Empty) => None,
        Err(TryRecvError::Closed) => Some(Err(NodeError::DbStopped)),
    }
}

pub struct BlockManager {
    db: Arc<BlockDatabase>,
    strategy: Arc<dyn BlockBuildingStrategy>,
    metrics: Arc<NodeMetrics>,
    current_block: Option<BlockData>,
    pending: Option<PendingOp>,
    intent: BlockIntent,
}

impl BlockManager {
    pub fn new(
        db: Arc<BlockDatabase>,
        strategy: Arc<dyn BlockBuildingStrategy>,
        metrics: Arc<NodeMetrics>,
    ) -> Self {
        Self {
            db,
            strategy,
            metrics,
            current_block: None,
            pending: None,
            intent: BlockIntent::DoNothing,
        }
    }

    /// The candidate block we hold, if any.
    pub fn current_block(&self) -> Option<&BlockData> {
        self.current_block.as_ref()
    }

    pub fn has_pending_op(&self) -> bool {
        self.pending.is_some()
    }

    /// The intent derived on the last [`get_block_intent`](Self::get_block_intent) call.
    pub fn intent(&self) -> &BlockIntent {
        &self.intent
    }

    pub fn get_block_intent(&mut self, status: &mut StatusManager) -> BlockIntent {
        self.poll_pending(status);

        if let Some(block) = &self.current_block {
            if status.my_status().block_rid != Some(block.block_rid()) {
                self.current_block = None;
            }
        }

        self.intent = if let Some(op) = &self.pending {
            tracing::trace!(op = op.kind(), "block database job in flight");
            BlockIntent::DoNothing
        } else if status.my_status().state == NodeState::Prepared && self.current_block.is_some() {
            self.submit_commit(status);
            BlockIntent::DoNothing
        } else {
            derive_intent(status, self.strategy.should_build_block())
        };
        self.intent.clone()
    }

    /// Start building if that is what we intend to do.
    pub fn start_build(&mut self, status: &StatusManager) -> bool {
        if self.pending.is_some() || self.intent != BlockIntent::BuildBlock {
            return false;
        }
        let my = status.my_status();
        tracing::debug!(height = my.height, round = my.round, "building block");
        self.pending = Some(PendingOp::Build {
            height: my.height,
            round: my.round,
            reply: self.db.build_block(),
        });
        true
    }

    /// Load an unfinished block from a peer if it is the one we asked for.
    pub fn on_received_unfinished_block(&mut self, status: &StatusManager, block: BlockData) -> bool {
        let wanted = matches!(&self.intent, BlockIntent::FetchUnfinishedBlock(rid) if *rid == block.block_rid());
        if !wanted || self.pending.is_some() {
            return false;
        }
        let my = status.my_status();
        self.pending = Some(PendingOp::Load {
            height: my.height,
            round: my.round,
            reply: self.db.load_unfinished_block(block.clone()),
            block,
        });
        true
    }

    /// Append a finalized block if it is at the height we asked for.
    pub fn on_received_block_at_height(
        &mut self,
        block: BlockDataWithWitness,
        height: i64,
    ) -> bool {
        let wanted = matches!(self.intent, BlockIntent::FetchBlockAtHeight(h) if h == height);
        if !wanted || self.pending.is_some() {
            return false;
        }
        self.pending = Some(PendingOp::Add {
            height,
            reply: self.db.add_block(block),
        });
        true
    }

    fn submit_commit(&mut self, status: &StatusManager) {
        let Some(block_rid) = status.my_status().block_rid else {
            return;
        };
        let signatures: Vec<Signature> = status.commit_signatures().iter().flatten().cloned().collect();
        tracing::debug!(
            height = status.my_status().height,
            block_rid = %block_rid.short(),
            signatures = signatures.len(),
            "committing block"
        );
        self.pending = Some(PendingOp::Commit {
            block_rid,
            reply: self.db.commit_block(signatures),
        });
    }

    fn poll_pending(&mut self, status: &mut StatusManager) {
        let Some(op) = self.pending.take() else {
            return;
        };
        match op {
            PendingOp::Build {
                height,
                round,
                mut reply,
            } => match poll(&mut reply) {
                None => self.pending = Some(PendingOp::Build { height, round, reply }),
                Some(Ok((block, signature))) => {
                    let rid = block.block_rid();
                    if status.on_built_block(height, round, rid, signature) {
                        tracing::info!(height, round, block_rid = %rid.short(), "built block");
                        self.current_block = Some(block);
                    } else {
                        tracing::debug!(height, round, "discarding block built for a stale round");
                    }
                }
                Some(Err(e)) => self.on_failure("build", e),
            },
            PendingOp::Load {
                height,
                round,
                block,
                mut reply,
            } => match poll(&mut reply) {
                None => {
                    self.pending = Some(PendingOp::Load {
                        height,
                        round,
                        block,
                        reply,
                    })
                }
                Some(Ok(signature)) => {
                    let rid = block.block_rid();
                    if status.on_received_block(height, round, rid, signature) {
                        tracing::debug!(height, round, block_rid = %rid.short(), "loaded block");
                        self.current_block = Some(block);
                    } else {
                        tracing::debug!(height, round, "discarding block loaded for a stale round");
                    }
                }
                Some(Err(e)) => self.on_failure("load", e),
            },
            PendingOp::Reopen { mut reply } => match poll(&mut reply) {
                None => self.pending = Some(PendingOp::Reopen { reply }),
                Some(Ok(_)) => tracing::debug!("reopened held block"),
                Some(Err(e)) => {
                    self.on_failure("reopen", e);
                    self.current_block = None;
                }
            },
            PendingOp::Add { height, mut reply } => match poll(&mut reply) {
                None => self.pending = Some(PendingOp::Add { height, reply }),
                Some(Ok(())) => {
                    tracing::info!(height, "added block from peer");
                    self.metrics.blocks_added.inc();
                    status.on_height_advance(height + 1);
                }
                Some(Err(e)) => {
                    self.on_failure("add", e);
                    self.reopen_current_block();
                }
            },
            PendingOp::Commit {
                block_rid,
                mut reply,
            } => match poll(&mut reply) {
                None => self.pending = Some(PendingOp::Commit { block_rid, reply }),
                Some(Ok(())) => {
                    tracing::info!(
                        height = status.my_status().height,
                        block_rid = %block_rid.short(),
                        "committed block"
                    );
                    self.metrics.blocks_committed.inc();
                    status.on_committed_block(&block_rid);
                    self.current_block = None;
                }
                Some(Err(e)) => {
                    self.on_failure("commit", e);
                    self.reopen_current_block();
                }
            },
        }
    }

    /// A failed job may have rolled the held block's builder back. Open it
    /// again so its witness keeps collecting signatures.
    fn reopen_current_block(&mut self) {
        if let Some(block) = &self.current_block {
            tracing::debug!(block_rid = %block.block_rid().short(), "reopening held block");
            self.pending = Some(PendingOp::Reopen {
                reply: self.db.load_unfinished_block(block.clone()),
            });
        }
    }

    fn on_failure(&self, op: &'static str, error: NodeError) {
        tracing::warn!(op, error = %error, "block database operation failed");
        self.metrics.db_failures.inc();
    }
}
