//! The messaging seam consumed by the consensus loop.

use strata_messages::EbftMessage;

use crate::PeerId;

/// Non-blocking peer messaging.
///
/// Sends are fire-and-forget: failures are logged by the implementation and
/// never surfaced to the caller.
pub trait CommunicationManager: Send + Sync {
    /// Identity this node uses on the transport.
    fn local_id(&self) -> &PeerId;

    /// All configured peers except ourselves.
    fn peers(&self) -> Vec<PeerId>;

    /// Drain every packet received since the last call, in arrival order.
    fn get_packets(&self) -> Vec<(PeerId, EbftMessage)>;

    fn send_packet(&self, message: &EbftMessage, to: &PeerId);

    fn broadcast_packet(&self, message: &EbftMessage);

    fn shutdown(&self);
}
