//! Nullable network: record packets without sending them.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use strata_messages::EbftMessage;
use strata_network::{CommunicationManager, PeerId};

use crate::lock;

/// Where a recorded packet was addressed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Recipient {
    Peer(PeerId),
    Broadcast,
}

/// A communication manager that records packets instead of sending them.
pub struct NullCommunicationManager {
    local_id: PeerId,
    peers: Vec<PeerId>,
    /// Packets the node will see on its next `get_packets` call.
    inbox: Mutex<VecDeque<(PeerId, EbftMessage)>>,
    /// All packets "sent" by the node.
    sent: Mutex<Vec<(Recipient, EbftMessage)>>,
    shut_down: AtomicBool,
}

impl NullCommunicationManager {
    pub fn new(local_id: PeerId, peers: Vec<PeerId>) -> Self {
        Self {
            local_id,
            peers,
            inbox: Mutex::new(VecDeque::new()),
            sent: Mutex::new(Vec::new()),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Queue a packet as if `from` had sent it.
    pub fn deliver(&self, from: PeerId, message: EbftMessage) {
        lock(&self.inbox).push_back((from, message));
    }

    /// Everything sent so far (for assertions).
    pub fn sent(&self) -> Vec<(Recipient, EbftMessage)> {
        lock(&self.sent).clone()
    }

    /// Drain the sent log.
    pub fn take_sent(&self) -> Vec<(Recipient, EbftMessage)> {
        std::mem::take(&mut *lock(&self.sent))
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::SeqCst)
    }
}

impl CommunicationManager for NullCommunicationManager {
    fn local_id(&self) -> &PeerId {
        &self.local_id
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.clone()
    }

    fn get_packets(&self) -> Vec<(PeerId, EbftMessage)> {
        lock(&self.inbox).drain(..).collect()
    }

    fn send_packet(&self, message: &EbftMessage, to: &PeerId) {
        lock(&self.sent).push((Recipient::Peer(to.clone()), message.clone()));
    }

    fn broadcast_packet(&self, message: &EbftMessage) {
        lock(&self.sent).push((Recipient::Broadcast, message.clone()));
    }

    fn shutdown(&self) {
        self.shut_down.store(true, Ordering::SeqCst);
    }
}
