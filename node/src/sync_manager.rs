//! The validator round loop.
//!
//! [`ValidatorSyncManager::update`] is one tick: drain peer messages, pursue
//! the current block intent, check for a stalled round, gossip our status,
//! and now and then dump the peer table to the log. A tick never fails; a
//! message that cannot be handled is logged and dropped on its own.

use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use strata_consensus::{BlockIntent, RevoltTracker, StatusManager, StatusSender};
use strata_messages::{
    BlockSignatureMsg, CompleteBlockMsg, EbftMessage, GetBlockAtHeightMsg, GetBlockSignatureMsg,
    GetUnfinishedBlockMsg, StatusMsg, UnfinishedBlockMsg,
};
use strata_network::{CommunicationManager, PeerId};
use strata_store::{BlockchainEngine, Transaction};
use strata_types::{BlockData, BlockDataWithWitness, BlockHeader, NodeStatus, SignerSet, Witness};

use crate::block_database::BlockDatabase;
use crate::block_manager::BlockManager;
use crate::{ConsensusParams, NodeError, NodeMetrics};

pub struct ValidatorSyncManager {
    params: ConsensusParams,
    status: StatusManager,
    blocks: BlockManager,
    db: Arc<BlockDatabase>,
    comm: Arc<dyn CommunicationManager>,
    engine: Arc<dyn BlockchainEngine>,
    signers: Arc<SignerSet>,
    /// Transport identity of every signer, by signer index.
    nodes: Vec<PeerId>,
    revolt: RevoltTracker,
    sender: StatusSender,
    metrics: Arc<NodeMetrics>,

    processing_intent: BlockIntent,
    intent_deadline: Instant,
    intent_timeout: Duration,
    last_status_log: Instant,
}

impl ValidatorSyncManager {
    /// Set up the loop at the height following the engine's best block.
    pub fn new(
        params: ConsensusParams,
        signers: Arc<SignerSet>,
        my_index: usize,
        engine: Arc<dyn BlockchainEngine>,
        db: Arc<BlockDatabase>,
        comm: Arc<dyn CommunicationManager>,
        metrics: Arc<NodeMetrics>,
    ) -> Result<Self, NodeError> {
        let height = engine.block_queries().best_height()? + 1;
        let status = StatusManager::new(Arc::clone(&signers), my_index, height)?;
        let now = Instant::now();
        let blocks = BlockManager::new(
            Arc::clone(&db),
            engine.block_building_strategy(),
            Arc::clone(&metrics),
        );
        let nodes = signers.keys().iter().map(PeerId::from).collect();
        tracing::info!(node = my_index, height, signers = signers.len(), "round loop ready");

        Ok(Self {
            revolt: RevoltTracker::new(params.revolt_timeout, &status, now),
            sender: StatusSender::new(params.max_status_interval),
            intent_timeout: params.intent_base_timeout,
            params,
            status,
            blocks,
            db,
            comm,
            engine,
            signers,
            nodes,
            metrics,
            processing_intent: BlockIntent::DoNothing,
            intent_deadline: now,
            last_status_log: now,
        })
    }

    pub fn status(&self) -> &StatusManager {
        &self.status
    }

    pub fn block_manager(&self) -> &BlockManager {
        &self.blocks
    }

    pub fn processing_intent(&self) -> &BlockIntent {
        &self.processing_intent
    }

    pub fn update(&mut self) {
        self.update_at(Instant::now());
    }

    pub fn update_at(&mut self, now: Instant) {
        self.dispatch_messages();
        self.process_intent(now);

        if self.revolt.update(&mut self.status, now) {
            let my = self.status.my_status();
            tracing::info!(height = my.height, round = my.round, "round stalled, revolting");
            self.metrics.revolts.inc();
        }

        if let Some(status) = self.sender.update(self.status.my_status(), now) {
            self.comm
                .broadcast_packet(&EbftMessage::Status(StatusMsg::from(&status)));
        }

        if now.duration_since(self.last_status_log) >= self.params.status_log_interval {
            self.last_status_log = now;
            self.log_status();
        }

        let my = self.status.my_status();
        self.metrics.height.set(my.height);
        self.metrics.round.set(my.round);
    }

    // ── Dispatch ────────────────────────────────────────────────────────

    fn dispatch_messages(&mut self) {
        for (peer, message) in self.comm.get_packets() {
            self.metrics.messages_received.inc();
            let kind = message.kind();
            if let Err(e) = self.handle_message(&peer, message) {
                self.metrics.messages_dropped.inc();
                match e {
                    NodeError::ProgrammerMistake(_) => {
                        tracing::error!(%peer, kind, error = %e, "failed to handle message")
                    }
                    NodeError::UserMistake(_) => {
                        tracing::info!(%peer, kind, error = %e, "rejected message")
                    }
                    _ => tracing::debug!(%peer, kind, error = %e, "dropped message"),
                }
            }
        }
    }

    fn handle_message(&mut self, peer: &PeerId, message: EbftMessage) -> Result<(), NodeError> {
        // Read-only; observers may ask too.
        if let EbftMessage::GetBlockAtHeight(request) = &message {
            return self.answer_block_at_height(peer, request.height);
        }
        let Some(index) = self.nodes.iter().position(|n| n == peer) else {
            tracing::trace!(%peer, kind = message.kind(), "ignoring message from non-signer");
            return Ok(());
        };
        self.handle_signer_message(peer, index, message)
    }

    fn handle_signer_message(
        &mut self,
        peer: &PeerId,
        index: usize,
        message: EbftMessage,
    ) -> Result<(), NodeError> {
        match message {
            EbftMessage::Status(msg) => {
                self.status.on_status_update(index, NodeStatus::from(msg));
            }
            EbftMessage::BlockSignature(msg) => {
                if self.signers.get(index) != Some(&msg.signature.subject_id) {
                    return Err(NodeError::ProtocolViolation(format!(
                        "signature subject {} is not the sender",
                        msg.signature.subject_id
                    )));
                }
                let my = self.status.my_status();
                if my.block_rid != Some(msg.block_rid) {
                    tracing::debug!(
                        %peer,
                        block_rid = %msg.block_rid.short(),
                        "signature for a block we do not hold"
                    );
                    return Ok(());
                }
                let db = &self.db;
                let recorded = self.status.on_commit_signature(
                    index,
                    &msg.block_rid,
                    msg.signature,
                    |signature| db.verify_block_signature(signature),
                );
                if !recorded {
                    tracing::debug!(%peer, block_rid = %msg.block_rid.short(), "commit signature not recorded");
                }
            }
            EbftMessage::CompleteBlock(msg) => {
                let header = self.decode_header(&msg.header)?;
                let witness = Witness::from_bytes(&msg.witness)
                    .map_err(|e| NodeError::ProtocolViolation(format!("witness: {e}")))?;
                let block = BlockDataWithWitness {
                    header,
                    transactions: msg.transactions,
                    witness,
                };
                if !self.blocks.on_received_block_at_height(block, msg.height) {
                    tracing::debug!(%peer, height = msg.height, "complete block not requested");
                }
            }
            EbftMessage::UnfinishedBlock(msg) => {
                let header = self.decode_header(&msg.header)?;
                let block = BlockData::new(header, msg.transactions);
                let rid = block.block_rid();
                if !self.blocks.on_received_unfinished_block(&self.status, block) {
                    tracing::debug!(%peer, block_rid = %rid.short(), "unfinished block not requested");
                }
            }
            EbftMessage::GetBlockAtHeight(_) => {
                return Err(NodeError::ProgrammerMistake(
                    "GetBlockAtHeight reached signer dispatch".into(),
                ));
            }
            EbftMessage::GetUnfinishedBlock(msg) => match self.blocks.current_block() {
                Some(block) if block.block_rid() == msg.block_rid => {
                    let reply = EbftMessage::UnfinishedBlock(UnfinishedBlockMsg {
                        header: block.header.raw_data.clone(),
                        transactions: block.transactions.clone(),
                    });
                    self.comm.send_packet(&reply, peer);
                }
                _ => tracing::debug!(%peer, block_rid = %msg.block_rid.short(), "unfinished block not held"),
            },
            EbftMessage::GetBlockSignature(msg) => {
                let signature = if self.status.my_status().block_rid == Some(msg.block_rid) {
                    self.status.get_commit_signature()
                } else {
                    self.db.get_block_signature(&msg.block_rid)?
                };
                match signature {
                    Some(signature) => {
                        let reply = EbftMessage::BlockSignature(BlockSignatureMsg {
                            block_rid: msg.block_rid,
                            signature,
                        });
                        self.comm.send_packet(&reply, peer);
                    }
                    None => tracing::trace!(%peer, block_rid = %msg.block_rid.short(), "signature not released"),
                }
            }
            EbftMessage::Transaction(msg) => {
                let tx = decode_checked_transaction(self.engine.as_ref(), &msg.data)?;
                let rid = tx.rid();
                if self.engine.transaction_queue().enqueue(tx) {
                    tracing::trace!(%peer, tx_rid = %rid, "queued peer transaction");
                }
            }
        }
        Ok(())
    }

    fn decode_header(&self, raw: &[u8]) -> Result<BlockHeader, NodeError> {
        self.engine
            .decode_block_header(raw)
            .map_err(|e| NodeError::ProtocolViolation(format!("block header: {e}")))
    }

    fn answer_block_at_height(&self, peer: &PeerId, height: i64) -> Result<(), NodeError> {
        let Some(block) = self.db.get_block_at_height(height)? else {
            tracing::trace!(%peer, height, "no block at requested height");
            return Ok(());
        };
        let reply = EbftMessage::CompleteBlock(CompleteBlockMsg {
            header: block.header.raw_data,
            transactions: block.transactions,
            height,
            witness: block.witness.to_bytes(),
        });
        self.comm.send_packet(&reply, peer);
        Ok(())
    }

    // ── Intent ──────────────────────────────────────────────────────────

    fn process_intent(&mut self, now: Instant) {
        let intent = self.blocks.get_block_intent(&mut self.status);
        if intent != self.processing_intent {
            tracing::debug!(from = %self.processing_intent, to = %intent, "intent changed");
            self.processing_intent = intent;
            self.intent_timeout = self.params.intent_base_timeout;
            self.execute_intent(now);
        } else if now >= self.intent_deadline {
            self.intent_timeout = self
                .intent_timeout
                .mul_f64(self.params.intent_backoff_factor);
            self.execute_intent(now);
        }
    }

    fn execute_intent(&mut self, now: Instant) {
        self.intent_deadline = now + self.intent_timeout;
        let my_height = self.status.my_status().height;

        match self.processing_intent.clone() {
            BlockIntent::DoNothing => {}
            BlockIntent::FetchBlockAtHeight(height) => {
                let request = EbftMessage::GetBlockAtHeight(GetBlockAtHeightMsg { height });
                self.send_to_random(&request, |s| s.height > height);
            }
            BlockIntent::FetchUnfinishedBlock(block_rid) => {
                let request = EbftMessage::GetUnfinishedBlock(GetUnfinishedBlockMsg { block_rid });
                self.send_to_random(&request, |s| s.holds_block(my_height, &block_rid));
            }
            BlockIntent::FetchCommitSignatures(block_rid, nodes) => {
                let request = EbftMessage::GetBlockSignature(GetBlockSignatureMsg { block_rid });
                for index in nodes {
                    if let Some(peer) = self.nodes.get(index) {
                        self.comm.send_packet(&request, peer);
                    }
                }
            }
            BlockIntent::BuildBlock => {
                self.blocks.start_build(&self.status);
            }
        }
    }

    fn send_to_random(&self, message: &EbftMessage, eligible: impl Fn(&NodeStatus) -> bool) {
        match self.select_random_node(eligible) {
            Some(index) => self.comm.send_packet(message, &self.nodes[index]),
            None => tracing::debug!(kind = message.kind(), "no eligible peer"),
        }
    }

    /// A random peer (never ourselves) whose last status passes `eligible`.
    fn select_random_node(&self, eligible: impl Fn(&NodeStatus) -> bool) -> Option<usize> {
        let my_index = self.status.my_index();
        let candidates: Vec<usize> = self
            .status
            .node_statuses()
            .iter()
            .enumerate()
            .filter(|(i, s)| *i != my_index && eligible(s))
            .map(|(i, _)| i)
            .collect();
        candidates.choose(&mut rand::thread_rng()).copied()
    }

    fn log_status(&self) {
        let my = self.status.my_status();
        tracing::info!(
            height = my.height,
            round = my.round,
            state = %my.state,
            locked = self.status.is_locked(),
            intent = %self.processing_intent,
            "status"
        );
        for (i, s) in self.status.node_statuses().iter().enumerate() {
            if i == self.status.my_index() {
                continue;
            }
            tracing::info!(
                node = i,
                height = s.height,
                round = s.round,
                state = %s.state,
                revolting = s.revolting,
                "peer status"
            );
        }
    }
}

/// Decode a raw transaction and check it. Any problem is the sender's mistake;
/// incorrect transactions leave their reason in the queue.
pub(crate) fn decode_checked_transaction(
    engine: &dyn BlockchainEngine,
    data: &[u8],
) -> Result<Arc<dyn Transaction>, NodeError> {
    let tx = engine
        .transaction_factory()
        .decode_transaction(data)
        .map_err(|e| NodeError::UserMistake(format!("undecodable transaction: {e}")))?;
    if !tx.is_correct() {
        let reason = format!("transaction {} is not correct", tx.rid());
        engine.transaction_queue().reject(tx.rid(), reason.clone());
        return Err(NodeError::UserMistake(reason));
    }
    Ok(tx)
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_crypto::{keypair_from_seed, SigMaker};
    use strata_messages::TransactionMsg;
    use strata_store::{ManagedBlockBuilder, TransactionQueue};
    use strata_nullables::{
        NullClock, NullCommunicationManager, NullEngine, NullTransaction, Recipient,
        INVALID_TX_MARKER,
    };
    use strata_types::{BlockRid, NodeState, PublicKey, Signature};

    struct Fixture {
        engine: Arc<NullEngine>,
        comm: Arc<NullCommunicationManager>,
        loop_: ValidatorSyncManager,
        makers: Vec<SigMaker>,
        peers: Vec<PeerId>,
    }

    fn params() -> ConsensusParams {
        ConsensusParams {
            tick_interval: Duration::from_millis(5),
            revolt_timeout: Duration::from_secs(60),
            max_status_interval: Duration::from_millis(100),
            status_log_interval: Duration::from_secs(60),
            intent_base_timeout: Duration::from_millis(100),
            intent_backoff_factor: 1.1,
        }
    }

    fn fixture(me: usize) -> Fixture {
        let makers: Vec<SigMaker> = (0..4u8)
            .map(|i| SigMaker::new(keypair_from_seed(&[i + 1; 32])))
            .collect();
        let signers = Arc::new(
            SignerSet::new(makers.iter().map(|m| m.public_key().clone()).collect()).unwrap(),
        );
        let peers: Vec<PeerId> = signers.keys().iter().map(PeerId::from).collect();
        let engine = Arc::new(NullEngine::new(Arc::new(NullClock::new(1_000)), None));
        let comm = Arc::new(NullCommunicationManager::new(
            peers[me].clone(),
            peers.iter().filter(|p| **p != peers[me]).cloned().collect(),
        ));
        let db = Arc::new(
            BlockDatabase::new(
                engine.clone(),
                Arc::new(SigMaker::new(keypair_from_seed(&[me as u8 + 1; 32]))),
                Arc::clone(&signers),
                8,
                Duration::from_secs(1),
            )
            .unwrap(),
        );
        let loop_ = ValidatorSyncManager::new(
            params(),
            signers,
            me,
            engine.clone(),
            db,
            comm.clone(),
            Arc::new(NodeMetrics::new()),
        )
        .unwrap();
        Fixture {
            engine,
            comm,
            loop_,
            makers,
            peers,
        }
    }

    fn status_msg(height: i64, rid: Option<BlockRid>, serial: i64) -> EbftMessage {
        EbftMessage::Status(StatusMsg {
            block_rid: rid,
            height,
            revolting: false,
            round: 0,
            serial,
            state: if rid.is_some() {
                NodeState::HaveBlock
            } else {
                NodeState::WaitingForBlock
            },
        })
    }

    #[test]
    fn first_tick_broadcasts_status() {
        let mut f = fixture(1);
        f.loop_.update();
        let sent = f.comm.take_sent();
        assert!(sent
            .iter()
            .any(|(to, m)| *to == Recipient::Broadcast && matches!(m, EbftMessage::Status(_))));
    }

    #[test]
    fn status_from_signer_is_applied() {
        let mut f = fixture(1);
        f.comm.deliver(f.peers[2].clone(), status_msg(0, None, 4));
        f.loop_.update();
        assert_eq!(f.loop_.status().node_statuses()[2].serial, 4);
    }

    #[test]
    fn non_signer_cannot_move_state() {
        let mut f = fixture(1);
        let stranger = PeerId::from(&PublicKey([0xee; 32]));
        f.comm.deliver(stranger, status_msg(7, None, 1));
        f.loop_.update();
        assert!(f.loop_.status().node_statuses().iter().all(|s| s.height == 0));
    }

    #[test]
    fn mismatched_signature_is_dropped() {
        let mut f = fixture(1);
        let signature = f.makers[2].sign(b"some header");
        f.comm.deliver(
            f.peers[2].clone(),
            EbftMessage::BlockSignature(BlockSignatureMsg {
                block_rid: BlockRid::new([9; 32]),
                signature,
            }),
        );
        f.loop_.update();
        assert_eq!(f.loop_.status().signature_count(), 0);
    }

    #[test]
    fn forged_signature_subject_is_dropped() {
        let mut f = fixture(1);
        let signature = Signature::new(f.makers[3].public_key().clone(), vec![0; 64]);
        f.comm.deliver(
            f.peers[2].clone(),
            EbftMessage::BlockSignature(BlockSignatureMsg {
                block_rid: BlockRid::new([9; 32]),
                signature,
            }),
        );
        f.loop_.update();
        assert_eq!(f.loop_.metrics.messages_dropped.get(), 1);
    }

    #[test]
    fn malformed_transaction_does_not_stall_dispatch() {
        let mut f = fixture(1);
        f.comm.deliver(
            f.peers[2].clone(),
            EbftMessage::Transaction(TransactionMsg {
                data: vec![INVALID_TX_MARKER, 1, 2],
            }),
        );
        f.comm.deliver(
            f.peers[2].clone(),
            EbftMessage::Transaction(TransactionMsg {
                data: b"good".to_vec(),
            }),
        );
        f.comm.deliver(f.peers[3].clone(), status_msg(0, None, 1));
        f.loop_.update();

        assert_eq!(f.engine.transaction_queue().len(), 1);
        assert_eq!(f.loop_.status().node_statuses()[3].serial, 1);
        assert_eq!(f.loop_.metrics.messages_dropped.get(), 1);

        let bad = NullTransaction::new(vec![INVALID_TX_MARKER, 1, 2]).rid();
        let reason = f.engine.transaction_queue().rejection_reason(&bad).unwrap();
        assert!(reason.contains("not correct"));
    }

    #[test]
    fn anyone_may_fetch_finalized_blocks() {
        let mut f = fixture(1);
        f.engine
            .build_block()
            .unwrap()
            .commit(Witness::default())
            .unwrap();
        let stranger = PeerId::from(&PublicKey([0xee; 32]));
        f.comm.deliver(
            stranger.clone(),
            EbftMessage::GetBlockAtHeight(GetBlockAtHeightMsg { height: 0 }),
        );
        f.comm.take_sent();
        f.loop_.update();

        let sent = f.comm.take_sent();
        assert!(sent.iter().any(|(to, m)| *to == Recipient::Peer(stranger.clone())
            && matches!(m, EbftMessage::CompleteBlock(b) if b.height == 0)));
    }

    #[test]
    fn catch_up_asks_a_peer_that_is_ahead() {
        let mut f = fixture(1);
        f.comm.deliver(f.peers[3].clone(), status_msg(5, None, 1));
        f.loop_.update();

        assert_eq!(f.loop_.processing_intent(), &BlockIntent::FetchBlockAtHeight(0));
        let sent = f.comm.take_sent();
        assert!(sent.iter().any(|(to, m)| *to == Recipient::Peer(f.peers[3].clone())
            && matches!(m, EbftMessage::GetBlockAtHeight(r) if r.height == 0)));
    }

    #[test]
    fn unchanged_intent_is_resent_with_backoff() {
        let mut f = fixture(1);
        f.comm.deliver(f.peers[3].clone(), status_msg(5, None, 1));
        let start = Instant::now();
        f.loop_.update_at(start);
        f.comm.take_sent();

        let count = |sent: Vec<(Recipient, EbftMessage)>| {
            sent.iter()
                .filter(|(_, m)| matches!(m, EbftMessage::GetBlockAtHeight(_)))
                .count()
        };
        f.loop_.update_at(start + Duration::from_millis(50));
        assert_eq!(count(f.comm.take_sent()), 0, "deadline not reached");
        f.loop_.update_at(start + Duration::from_millis(100));
        assert_eq!(count(f.comm.take_sent()), 1);
        // Timeout grew to 110ms.
        f.loop_.update_at(start + Duration::from_millis(205));
        assert_eq!(count(f.comm.take_sent()), 0);
        f.loop_.update_at(start + Duration::from_millis(211));
        assert_eq!(count(f.comm.take_sent()), 1);
    }

    #[test]
    fn stalled_round_starts_revolt() {
        let mut f = fixture(1);
        let start = Instant::now();
        f.loop_.update_at(start);
        f.loop_.update_at(start + Duration::from_secs(61));
        assert!(f.loop_.status().my_status().revolting);
        assert_eq!(f.loop_.metrics.revolts.get(), 1);
    }
}
