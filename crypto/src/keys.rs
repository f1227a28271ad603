//! Ed25519 key generation and parsing.

use ed25519_dalek::{SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use strata_types::{KeyPair, PrivateKey, PublicKey};

use crate::CryptoError;

/// Generate a new Ed25519 key pair from a secure random source.
pub fn generate_keypair() -> KeyPair {
    let signing_key = SigningKey::generate(&mut OsRng);
    KeyPair {
        public: PublicKey(signing_key.verifying_key().to_bytes()),
        private: PrivateKey(signing_key.to_bytes()),
    }
}

/// Derive the public key from a private key.
pub fn public_from_private(private: &PrivateKey) -> PublicKey {
    let signing_key = SigningKey::from_bytes(&private.0);
    PublicKey(signing_key.verifying_key().to_bytes())
}

/// Reconstruct a full key pair from a private key.
pub fn keypair_from_private(private: PrivateKey) -> KeyPair {
    let public = public_from_private(&private);
    KeyPair { public, private }
}

/// Derive a key pair from a 32-byte seed (deterministic).
pub fn keypair_from_seed(seed: &[u8; 32]) -> KeyPair {
    keypair_from_private(PrivateKey(*seed))
}

fn bytes32_from_hex(s: &str) -> Result<[u8; 32], CryptoError> {
    let bytes = hex::decode(s.trim()).map_err(|e| CryptoError::InvalidHex(e.to_string()))?;
    let len = bytes.len();
    bytes
        .try_into()
        .map_err(|_| CryptoError::InvalidKeyLength(len))
}

/// Parse a hex-encoded Ed25519 public key, rejecting points not on the curve.
pub fn public_key_from_hex(s: &str) -> Result<PublicKey, CryptoError> {
    let bytes = bytes32_from_hex(s)?;
    VerifyingKey::from_bytes(&bytes).map_err(|_| CryptoError::InvalidPublicKey)?;
    Ok(PublicKey(bytes))
}

/// Parse a hex-encoded Ed25519 private key seed.
pub fn private_key_from_hex(s: &str) -> Result<PrivateKey, CryptoError> {
    bytes32_from_hex(s).map(PrivateKey)
}
