//! The node's view of where every validator is.
//!
//! `StatusManager` owns this node's own status and the last accepted status of
//! every peer, plus the commit signatures collected for the block this node
//! currently holds. Every change to our own status goes through here so that
//! `serial` is bumped exactly when the published tuple changes.
//!
//! ## Locking
//!
//! A node only hands out its own commit signature once a quorum of nodes at its
//! height (itself included) report holding the same block. From then on it is
//! locked on that block for the height: it will not revolt, will not follow a
//! higher round and will not take another block until the height advances.
//! Two quorums intersect in a correct node, so two different blocks can never
//! both gather a quorum of signatures at one height.

use std::sync::Arc;

use strata_types::{BlockRid, NodeState, NodeStatus, Signature, SignerSet};

use crate::ConsensusError;

pub struct StatusManager {
    signers: Arc<SignerSet>,
    my_index: usize,
    /// Position `my_index` holds our own status.
    node_statuses: Vec<NodeStatus>,
    commit_signatures: Vec<Option<Signature>>,
    /// Our signature over the held block, released once locked.
    my_signature: Option<Signature>,
    locked: bool,
}

impl StatusManager {
    /// Start at `height`, round 0, waiting for a block.
    pub fn new(signers: Arc<SignerSet>, my_index: usize, height: i64) -> Result<Self, ConsensusError> {
        signers.check_index(my_index)?;
        let count = signers.len();
        let mut node_statuses = vec![NodeStatus::unknown(); count];
        node_statuses[my_index] = NodeStatus {
            serial: 0,
            ..NodeStatus::at_height(height)
        };
        Ok(Self {
            signers,
            my_index,
            node_statuses,
            commit_signatures: vec![None; count],
            my_signature: None,
            locked: false,
        })
    }

    pub fn my_index(&self) -> usize {
        self.my_index
    }

    pub fn my_status(&self) -> &NodeStatus {
        &self.node_statuses[self.my_index]
    }

    pub fn node_statuses(&self) -> &[NodeStatus] {
        &self.node_statuses
    }

    pub fn node_count(&self) -> usize {
        self.node_statuses.len()
    }

    pub fn signers(&self) -> &Arc<SignerSet> {
        &self.signers
    }

    pub fn commit_signatures(&self) -> &[Option<Signature>] {
        &self.commit_signatures
    }

    pub fn signature_count(&self) -> usize {
        self.commit_signatures.iter().filter(|s| s.is_some()).count()
    }

    pub fn quorum(&self) -> usize {
        self.signers.quorum()
    }

    pub fn max_faulty(&self) -> usize {
        self.signers.max_faulty()
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }

    /// The node allowed to build at our current height and round.
    pub fn primary_index(&self) -> usize {
        let my = self.my_status();
        (my.height + my.round).rem_euclid(self.node_count() as i64) as usize
    }

    pub fn is_my_node_primary(&self) -> bool {
        self.primary_index() == self.my_index
    }

    /// Block the primary reports holding at our height and round, if any.
    pub fn primary_block_rid(&self) -> Option<BlockRid> {
        let my = self.my_status();
        let primary = &self.node_statuses[self.primary_index()];
        if primary.height != my.height || primary.round != my.round {
            return None;
        }
        match primary.state {
            NodeState::WaitingForBlock => None,
            NodeState::HaveBlock | NodeState::Prepared => primary.block_rid,
        }
    }

    /// Accept a peer's status if it is newer than the one we hold.
    pub fn on_status_update(&mut self, index: usize, status: NodeStatus) -> bool {
        if index == self.my_index || index >= self.node_count() {
            return false;
        }
        if status.serial <= self.node_statuses[index].serial {
            return false;
        }
        self.node_statuses[index] = status;
        self.recompute_status();
        true
    }

    /// Record a peer's commit signature over the block we hold.
    ///
    /// `verify` performs the cryptographic check and is only called once the
    /// cheap checks pass. Returns whether the signature was recorded.
    pub fn on_commit_signature(
        &mut self,
        index: usize,
        block_rid: &BlockRid,
        signature: Signature,
        verify: impl FnOnce(&Signature) -> bool,
    ) -> bool {
        let my = self.my_status();
        if index == self.my_index || index >= self.node_count() {
            return false;
        }
        if my.state == NodeState::WaitingForBlock || my.block_rid.as_ref() != Some(block_rid) {
            return false;
        }
        if self.commit_signatures[index].is_some() {
            return false;
        }
        if self.signers.get(index) != Some(&signature.subject_id) {
            return false;
        }
        if !verify(&signature) {
            return false;
        }
        self.commit_signatures[index] = Some(signature);
        self.recompute_status();
        true
    }

    /// We built `block_rid` for `(height, round)`.
    pub fn on_built_block(
        &mut self,
        height: i64,
        round: i64,
        block_rid: BlockRid,
        signature: Signature,
    ) -> bool {
        self.hold_block(height, round, block_rid, signature)
    }

    /// We loaded the unfinished block `block_rid` received for `(height, round)`.
    pub fn on_received_block(
        &mut self,
        height: i64,
        round: i64,
        block_rid: BlockRid,
        signature: Signature,
    ) -> bool {
        self.hold_block(height, round, block_rid, signature)
    }

    fn hold_block(&mut self, height: i64, round: i64, block_rid: BlockRid, signature: Signature) -> bool {
        let my = self.my_status();
        if my.height != height || my.round != round || my.state != NodeState::WaitingForBlock {
            return false;
        }
        let before = my.clone();
        let my = &mut self.node_statuses[self.my_index];
        my.block_rid = Some(block_rid);
        my.state = NodeState::HaveBlock;
        self.my_signature = Some(signature);
        for slot in self.commit_signatures.iter_mut() {
            *slot = None;
        }
        self.settle(before);
        true
    }

    /// The held block was committed locally; move to the next height.
    pub fn on_committed_block(&mut self, block_rid: &BlockRid) -> bool {
        let my = self.my_status();
        if my.state != NodeState::Prepared || my.block_rid.as_ref() != Some(block_rid) {
            return false;
        }
        let next = my.height + 1;
        self.on_height_advance(next)
    }

    /// Blocks up to `height - 1` are committed; start working on `height`.
    pub fn on_height_advance(&mut self, height: i64) -> bool {
        let my = self.my_status();
        if height <= my.height {
            return false;
        }
        let before = my.clone();
        let my = &mut self.node_statuses[self.my_index];
        my.height = height;
        my.round = 0;
        self.reset_round_state();
        self.locked = false;
        tracing::debug!(height, "advanced height");
        self.settle(before);
        true
    }

    /// Declare that we want the round to change.
    ///
    /// Ignored while locked. The round actually advances once a quorum at our
    /// height is revolting at our round or has already moved past it.
    pub fn on_start_revolting(&mut self) -> bool {
        if self.locked || self.my_status().revolting {
            return false;
        }
        let before = self.my_status().clone();
        self.node_statuses[self.my_index].revolting = true;
        tracing::debug!(
            height = before.height,
            round = before.round,
            "start revolting"
        );
        self.settle(before);
        true
    }

    /// Our signature over the held block, once we are locked on it.
    pub fn get_commit_signature(&self) -> Option<Signature> {
        if self.locked {
            self.my_signature.clone()
        } else {
            None
        }
    }

    /// Rebuild our status from the peer table and the collected signatures.
    pub fn recompute_status(&mut self) {
        let before = self.my_status().clone();
        self.settle(before);
    }

    /// Apply derived transitions until nothing changes, then bump `serial`
    /// once if the published tuple differs from `before`.
    fn settle(&mut self, before: NodeStatus) {
        while self.step() {}
        let mut after = self.my_status().clone();
        after.serial = before.serial;
        if after != before {
            self.node_statuses[self.my_index].serial = before.serial + 1;
        }
    }

    fn step(&mut self) -> bool {
        let my = self.my_status().clone();

        if !self.locked {
            if let Some(round) = self.round_jump_target() {
                tracing::debug!(height = my.height, from = my.round, to = round, "jumping to higher round");
                self.advance_round(round);
                return true;
            }
            if my.revolting && self.revolting_count() >= self.quorum() {
                tracing::info!(height = my.height, round = my.round + 1, "revolt succeeded");
                self.advance_round(my.round + 1);
                return true;
            }
        }

        let Some(rid) = my.block_rid else {
            return false;
        };
        if my.state == NodeState::WaitingForBlock {
            return false;
        }

        if !self.locked && self.holder_count(my.height, &rid) >= self.quorum() {
            self.locked = true;
            self.commit_signatures[self.my_index] = self.my_signature.clone();
            let me = &mut self.node_statuses[self.my_index];
            me.revolting = false;
            tracing::debug!(height = my.height, block_rid = %rid.short(), "locked on block");
            return true;
        }

        if my.state == NodeState::HaveBlock && self.signature_count() >= self.quorum() {
            // Every signer was itself locked, so the block is final here too.
            self.locked = true;
            let me = &mut self.node_statuses[self.my_index];
            me.state = NodeState::Prepared;
            me.revolting = false;
            return true;
        }
        false
    }

    fn advance_round(&mut self, round: i64) {
        self.node_statuses[self.my_index].round = round;
        self.reset_round_state();
    }

    fn reset_round_state(&mut self) {
        let my = &mut self.node_statuses[self.my_index];
        my.block_rid = None;
        my.state = NodeState::WaitingForBlock;
        my.revolting = false;
        self.my_signature = None;
        for slot in self.commit_signatures.iter_mut() {
            *slot = None;
        }
    }

    /// Round to jump to when more than `f` nodes at our height are ahead of
    /// us: the highest round that at least `f + 1` of them have reached.
    fn round_jump_target(&self) -> Option<i64> {
        let my = self.my_status();
        let mut ahead: Vec<i64> = self
            .node_statuses
            .iter()
            .filter(|s| s.height == my.height && s.round > my.round)
            .map(|s| s.round)
            .collect();
        let needed = self.max_faulty() + 1;
        if ahead.len() < needed {
            return None;
        }
        ahead.sort_unstable_by(|a, b| b.cmp(a));
        Some(ahead[needed - 1])
    }

    /// Votes to leave our round. A node at our height already past our round
    /// left it itself, so it counts as revolting here.
    fn revolting_count(&self) -> usize {
        let my = self.my_status();
        self.node_statuses
            .iter()
            .filter(|s| {
                s.height == my.height && (s.round > my.round || (s.round == my.round && s.revolting))
            })
            .count()
    }

    fn holder_count(&self, height: i64, rid: &BlockRid) -> usize {
        self.node_statuses
            .iter()
            .filter(|s| s.holds_block(height, rid))
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_types::PublicKey;

    fn signers(n: u8) -> Arc<SignerSet> {
        Arc::new(SignerSet::new((0..n).map(|i| PublicKey([i + 1; 32])).collect()).unwrap())
    }

    fn sig(signer: u8) -> Signature {
        Signature::new(PublicKey([signer + 1; 32]), vec![signer; 64])
    }

    fn rid(b: u8) -> BlockRid {
        BlockRid::new([b; 32])
    }

    fn peer(height: i64, round: i64, serial: i64) -> NodeStatus {
        NodeStatus {
            height,
            round,
            serial,
            ..NodeStatus::unknown()
        }
    }

    fn holding(height: i64, round: i64, block: BlockRid, serial: i64) -> NodeStatus {
        NodeStatus {
            block_rid: Some(block),
            state: NodeState::HaveBlock,
            ..peer(height, round, serial)
        }
    }

    fn manager() -> StatusManager {
        StatusManager::new(signers(4), 0, 5).unwrap()
    }

    #[test]
    fn initial_status() {
        let sm = manager();
        let my = sm.my_status();
        assert_eq!((my.height, my.round, my.serial), (5, 0, 0));
        assert_eq!(my.state, NodeState::WaitingForBlock);
        assert_eq!(sm.quorum(), 3);
        assert_eq!(sm.primary_index(), 1);
        assert!(StatusManager::new(signers(4), 4, 0).is_err());
    }

    #[test]
    fn stale_and_foreign_status_rejected() {
        let mut sm = manager();
        assert!(sm.on_status_update(1, peer(5, 0, 3)));
        assert!(!sm.on_status_update(1, peer(9, 0, 3)));
        assert!(!sm.on_status_update(1, peer(9, 0, 2)));
        assert_eq!(sm.node_statuses()[1].height, 5);
        assert!(!sm.on_status_update(0, peer(9, 0, 10)), "own index");
        assert!(!sm.on_status_update(4, peer(9, 0, 10)), "out of range");
    }

    #[test]
    fn holding_block_bumps_serial_once() {
        let mut sm = manager();
        assert!(sm.on_received_block(5, 0, rid(1), sig(0)));
        let my = sm.my_status();
        assert_eq!(my.state, NodeState::HaveBlock);
        assert_eq!(my.block_rid, Some(rid(1)));
        assert_eq!(my.serial, 1);
        assert!(!sm.on_received_block(5, 0, rid(2), sig(0)), "already holding");
        assert!(!sm.on_built_block(5, 1, rid(2), sig(0)), "wrong round");
    }

    #[test]
    fn signature_released_only_after_lock() {
        let mut sm = manager();
        sm.on_received_block(5, 0, rid(1), sig(0));
        assert!(sm.get_commit_signature().is_none());

        sm.on_status_update(1, holding(5, 0, rid(1), 1));
        assert!(!sm.is_locked());
        sm.on_status_update(2, holding(5, 0, rid(1), 1));
        assert!(sm.is_locked());
        assert_eq!(sm.get_commit_signature(), Some(sig(0)));
        assert_eq!(sm.signature_count(), 1);
    }

    #[test]
    fn quorum_of_signatures_prepares() {
        let mut sm = manager();
        sm.on_received_block(5, 0, rid(1), sig(0));
        sm.on_status_update(1, holding(5, 0, rid(1), 1));
        sm.on_status_update(2, holding(5, 0, rid(1), 1));

        assert!(sm.on_commit_signature(1, &rid(1), sig(1), |_| true));
        assert_eq!(sm.my_status().state, NodeState::HaveBlock);
        assert!(!sm.on_commit_signature(1, &rid(1), sig(1), |_| true), "duplicate");
        assert!(sm.on_commit_signature(2, &rid(1), sig(2), |_| true));
        assert_eq!(sm.my_status().state, NodeState::Prepared);

        assert!(sm.on_committed_block(&rid(1)));
        let my = sm.my_status();
        assert_eq!((my.height, my.round, my.state), (6, 0, NodeState::WaitingForBlock));
        assert!(!sm.is_locked());
        assert_eq!(sm.signature_count(), 0);
    }

    #[test]
    fn peer_signature_quorum_prepares_and_locks() {
        let mut sm = manager();
        sm.on_received_block(5, 0, rid(1), sig(0));
        for i in 1..4u8 {
            sm.on_commit_signature(i as usize, &rid(1), sig(i), |_| true);
        }
        assert_eq!(sm.my_status().state, NodeState::Prepared);
        assert!(sm.is_locked());
        assert!(!sm.on_start_revolting());
    }

    #[test]
    fn mismatched_or_unverified_signature_dropped() {
        let mut sm = manager();
        sm.on_received_block(5, 0, rid(1), sig(0));
        assert!(!sm.on_commit_signature(1, &rid(2), sig(1), |_| true), "other block");
        assert!(!sm.on_commit_signature(1, &rid(1), sig(2), |_| true), "wrong subject");
        assert!(!sm.on_commit_signature(1, &rid(1), sig(1), |_| false), "bad bytes");
        assert_eq!(sm.signature_count(), 0);
    }

    #[test]
    fn revolt_needs_quorum_at_same_round() {
        let mut sm = manager();
        assert!(sm.on_start_revolting());
        assert!(sm.my_status().revolting);

        let mut r1 = peer(5, 0, 1);
        r1.revolting = true;
        sm.on_status_update(1, r1);
        assert_eq!(sm.my_status().round, 0);

        let mut stale = peer(5, 0, 1);
        stale.round = 0;
        stale.height = 4;
        stale.revolting = true;
        sm.on_status_update(2, stale);
        assert_eq!(sm.my_status().round, 0, "other height does not count");

        let mut r2 = peer(5, 0, 2);
        r2.revolting = true;
        sm.on_status_update(2, r2);
        let my = sm.my_status();
        assert_eq!(my.round, 1);
        assert!(!my.revolting);
        assert_eq!(my.state, NodeState::WaitingForBlock);
    }

    #[test]
    fn revolt_follows_node_that_already_advanced() {
        let mut sm = manager();
        sm.on_start_revolting();
        let mut r1 = peer(5, 0, 1);
        r1.revolting = true;
        sm.on_status_update(1, r1);
        assert_eq!(sm.my_status().round, 0);

        // Node 2 saw the revolt quorum first and its status already shows round 1.
        sm.on_status_update(2, peer(5, 1, 1));
        let my = sm.my_status();
        assert_eq!(my.round, 1);
        assert!(!my.revolting);
    }

    #[test]
    fn node_ahead_alone_does_not_move_a_calm_node() {
        let mut sm = manager();
        sm.on_status_update(1, peer(5, 1, 1));
        sm.on_status_update(2, peer(5, 1, 1));
        assert_eq!(sm.my_status().round, 1, "f + 1 ahead is a round jump");

        let mut sm = manager();
        let mut r1 = peer(5, 0, 1);
        r1.revolting = true;
        sm.on_status_update(1, r1);
        sm.on_status_update(2, peer(5, 1, 1));
        assert_eq!(sm.my_status().round, 0, "we never revolted");
    }

    #[test]
    fn locked_node_ignores_revolt_and_round_jump() {
        let mut sm = manager();
        sm.on_received_block(5, 0, rid(1), sig(0));
        sm.on_status_update(1, holding(5, 0, rid(1), 1));
        sm.on_status_update(2, holding(5, 0, rid(1), 1));
        assert!(sm.is_locked());

        assert!(!sm.on_start_revolting());
        sm.on_status_update(3, peer(5, 7, 1));
        sm.on_status_update(2, peer(5, 7, 2));
        assert_eq!(sm.my_status().round, 0);
        assert_eq!(sm.my_status().block_rid, Some(rid(1)));
    }

    #[test]
    fn jumps_to_round_reached_by_f_plus_one() {
        let mut sm = manager();
        sm.on_status_update(1, peer(5, 9, 1));
        assert_eq!(sm.my_status().round, 0, "a single node is not enough");
        sm.on_status_update(2, peer(5, 4, 1));
        assert_eq!(sm.my_status().round, 4);
    }

    #[test]
    fn primary_block_requires_matching_round() {
        let mut sm = manager();
        sm.on_status_update(1, holding(5, 1, rid(3), 1));
        assert_eq!(sm.primary_block_rid(), None);
        sm.on_status_update(1, holding(5, 0, rid(3), 2));
        assert_eq!(sm.primary_block_rid(), Some(rid(3)));
    }

    #[test]
    fn height_advance_ignores_lower_heights() {
        let mut sm = manager();
        assert!(!sm.on_height_advance(5));
        assert!(sm.on_height_advance(8));
        assert_eq!(sm.my_status().height, 8);
        assert_eq!(sm.my_status().serial, 1);
    }
}
