//! Peer messaging for the Strata validator.
//!
//! The consensus loop talks to peers only through [`CommunicationManager`]:
//! it drains buffered inbound packets once per tick and fires outbound packets
//! without waiting. Connection handling and framing live behind the trait.
//! [`LocalHub`] is an in-process implementation that routes bincode-encoded
//! frames over bounded channels; it backs the devnet launcher and the
//! multi-node tests, and can take individual nodes offline.

pub mod comm;
pub mod error;
pub mod local_hub;
pub mod peer;

pub use comm::CommunicationManager;
pub use error::NetworkError;
pub use local_hub::{LocalConnection, LocalHub};
pub use peer::PeerId;
