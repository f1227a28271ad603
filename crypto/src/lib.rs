//! Cryptographic primitives for the Strata validator.
//!
//! - **Ed25519** for signing block headers and verifying commit signatures
//! - **Blake2b-256** for content hashes (block RIDs, transaction RIDs)
//! - [`SigMaker`] binds a node's key pair to the `Signature` type used on the wire

pub mod error;
pub mod hash;
pub mod keys;
pub mod sign;

pub use error::CryptoError;
pub use hash::{blake2b_256, blake2b_256_multi, hash_block_header, hash_transaction};
pub use keys::{
    generate_keypair, keypair_from_private, keypair_from_seed, private_key_from_hex,
    public_from_private, public_key_from_hex,
};
pub use sign::{sign_message, verify_signature, SigMaker};
