//! In-process transport.
//!
//! Each connected node owns a bounded inbox. Sending encodes the message,
//! looks up the recipient's inbox and pushes `(sender, frame)` with
//! `try_send`; a full or missing inbox drops the frame, as a lossy network
//! would. Taking a node offline drops everything to and from it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use strata_messages::EbftMessage;
use tokio::sync::mpsc;

use crate::{CommunicationManager, NetworkError, PeerId};

/// Default per-node inbox capacity, in frames.
pub const DEFAULT_INBOX_CAPACITY: usize = 4096;

type Frame = (PeerId, Vec<u8>);

struct Route {
    tx: mpsc::Sender<Frame>,
    online: bool,
}

struct HubInner {
    routes: Mutex<HashMap<PeerId, Route>>,
    capacity: usize,
    max_message_size: u64,
}

/// Shared switchboard connecting in-process nodes.
#[derive(Clone)]
pub struct LocalHub {
    inner: Arc<HubInner>,
}

impl LocalHub {
    pub fn new(capacity: usize, max_message_size: u64) -> Self {
        Self {
            inner: Arc::new(HubInner {
                routes: Mutex::new(HashMap::new()),
                capacity,
                max_message_size,
            }),
        }
    }

    pub fn with_default() -> Self {
        Self::new(
            DEFAULT_INBOX_CAPACITY,
            strata_messages::DEFAULT_MAX_MESSAGE_SIZE,
        )
    }

    fn routes(&self) -> MutexGuard<'_, HashMap<PeerId, Route>> {
        self.inner
            .routes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Register `id` on the hub. `peers` lists the nodes it will talk to.
    pub fn connect(&self, id: PeerId, peers: Vec<PeerId>) -> Result<LocalConnection, NetworkError> {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        {
            let mut routes = self.routes();
            if routes.contains_key(&id) {
                return Err(NetworkError::AlreadyConnected(id.to_string()));
            }
            routes.insert(id.clone(), Route { tx, online: true });
        }
        let peers = peers.into_iter().filter(|p| *p != id).collect();
        tracing::debug!(peer = %id, "connected to local hub");
        Ok(LocalConnection {
            id,
            peers,
            hub: self.clone(),
            inbox: Mutex::new(rx),
        })
    }

    /// Take a node off the network (or bring it back). Frames to and from an
    /// offline node are dropped.
    pub fn set_online(&self, id: &PeerId, online: bool) -> Result<(), NetworkError> {
        let mut routes = self.routes();
        let route = routes
            .get_mut(id)
            .ok_or_else(|| NetworkError::PeerNotFound(id.to_string()))?;
        route.online = online;
        tracing::info!(peer = %id, online, "local hub link state changed");
        Ok(())
    }

    pub fn is_online(&self, id: &PeerId) -> bool {
        self.routes().get(id).is_some_and(|r| r.online)
    }

    fn deliver(&self, from: &PeerId, to: &PeerId, frame: Vec<u8>) {
        let routes = self.routes();
        if !routes.get(from).is_some_and(|r| r.online) {
            return;
        }
        let Some(route) = routes.get(to).filter(|r| r.online) else {
            tracing::trace!(from = %from, to = %to, "dropping frame for unreachable peer");
            return;
        };
        if let Err(e) = route.tx.try_send((from.clone(), frame)) {
            tracing::debug!(from = %from, to = %to, error = %e, "dropping frame");
        }
    }

    fn disconnect(&self, id: &PeerId) {
        self.routes().remove(id);
    }
}

/// One node's endpoint on a [`LocalHub`].
pub struct LocalConnection {
    id: PeerId,
    peers: Vec<PeerId>,
    hub: LocalHub,
    inbox: Mutex<mpsc::Receiver<Frame>>,
}

impl LocalConnection {
    fn send_encoded(&self, frame: &[u8], to: &PeerId) {
        self.hub.deliver(&self.id, to, frame.to_vec());
    }
}

impl CommunicationManager for LocalConnection {
    fn local_id(&self) -> &PeerId {
        &self.id
    }

    fn peers(&self) -> Vec<PeerId> {
        self.peers.clone()
    }

    fn get_packets(&self) -> Vec<(PeerId, EbftMessage)> {
        let mut inbox = self.inbox.lock().unwrap_or_else(PoisonError::into_inner);
        let mut packets = Vec::new();
        while let Ok((from, frame)) = inbox.try_recv() {
            match EbftMessage::decode_with_limit(&frame, self.hub.inner.max_message_size) {
                Ok(message) => packets.push((from, message)),
                Err(e) => {
                    tracing::info!(peer = %from, error = %e, "dropping undecodable frame")
                }
            }
        }
        packets
    }

    fn send_packet(&self, message: &EbftMessage, to: &PeerId) {
        match message.encode() {
            Ok(frame) => self.send_encoded(&frame, to),
            Err(e) => tracing::warn!(kind = message.kind(), error = %e, "failed to encode message"),
        }
    }

    fn broadcast_packet(&self, message: &EbftMessage) {
        let frame = match message.encode() {
            Ok(frame) => frame,
            Err(e) => {
                tracing::warn!(kind = message.kind(), error = %e, "failed to encode message");
                return;
            }
        };
        for peer in &self.peers {
            self.send_encoded(&frame, peer);
        }
    }

    fn shutdown(&self) {
        self.hub.disconnect(&self.id);
        tracing::debug!(peer = %self.id, "disconnected from local hub");
    }
}
