//! Consensus core: block finalization by a fixed signer set.
//!
//! - A node's status (height, round, held block, revolting flag, state) is
//!   gossiped to every peer; [`StatusManager`] owns the table of them.
//! - Each height and round has a primary that builds the candidate block;
//!   the others fetch it from whoever holds it.
//! - A block is final once a quorum (`n - f` of `n` signers, `f = (n - 1) / 3`)
//!   has signed its header. [`WitnessBuilder`] accumulates those signatures.
//! - A round that stalls is abandoned by revolt ([`RevoltTracker`]).
//!
//! ## Module overview
//!
//! - [`status_manager`]: own status, peer statuses, commit signatures, locking.
//! - [`intent`]: the next action derived from the status table.
//! - [`witness`]: signature accumulation and witness verification.
//! - [`revolt_tracker`]: round timeout.
//! - [`status_sender`]: status gossip throttling.
//! - [`error`]: consensus error types.

pub mod error;
pub mod intent;
pub mod revolt_tracker;
pub mod status_manager;
pub mod status_sender;
pub mod witness;

pub use error::ConsensusError;
pub use intent::{derive_intent, BlockIntent};
pub use revolt_tracker::{RevoltTracker, DEFAULT_REVOLT_TIMEOUT};
pub use status_manager::StatusManager;
pub use status_sender::{StatusSender, DEFAULT_MAX_STATUS_INTERVAL};
pub use witness::{verify_witness, WitnessBuilder};
