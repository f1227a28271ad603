//! Ed25519 message signing and verification.

use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use strata_types::{KeyPair, PrivateKey, PublicKey, Signature};

const SIGNATURE_LENGTH: usize = 64;

/// Sign a message with a private key, returning the raw signature bytes.
pub fn sign_message(message: &[u8], private_key: &PrivateKey) -> [u8; 64] {
    let signing_key = SigningKey::from_bytes(&private_key.0);
    signing_key.sign(message).to_bytes()
}

/// Verify a detached signature against a message.
///
/// The signer is identified by `signature.subject_id`; callers that care which
/// signer produced it must check the subject themselves. Returns `false` for
/// malformed keys or signature bytes.
pub fn verify_signature(message: &[u8], signature: &Signature) -> bool {
    let Ok(verifying_key) = VerifyingKey::from_bytes(&signature.subject_id.0) else {
        return false;
    };
    let Ok(bytes) = <[u8; SIGNATURE_LENGTH]>::try_from(signature.data.as_slice()) else {
        return false;
    };
    let dalek_sig = ed25519_dalek::Signature::from_bytes(&bytes);
    verifying_key.verify(message, &dalek_sig).is_ok()
}

/// Produces this node's signatures.
pub struct SigMaker {
    keypair: KeyPair,
}

impl SigMaker {
    pub fn new(keypair: KeyPair) -> Self {
        Self { keypair }
    }

    pub fn public_key(&self) -> &PublicKey {
        &self.keypair.public
    }

    pub fn sign(&self, data: &[u8]) -> Signature {
        Signature::new(
            self.keypair.public.clone(),
            sign_message(data, &self.keypair.private).to_vec(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::{generate_keypair, keypair_from_seed};

    #[test]
    fn sign_and_verify() {
        let maker = SigMaker::new(generate_keypair());
        let sig = maker.sign(b"header bytes");
        assert_eq!(&sig.subject_id, maker.public_key());
        assert!(verify_signature(b"header bytes", &sig));
    }

    #[test]
    fn wrong_message_fails() {
        let maker = SigMaker::new(generate_keypair());
        let sig = maker.sign(b"correct");
        assert!(!verify_signature(b"wrong", &sig));
    }

    #[test]
    fn wrong_subject_fails() {
        let maker = SigMaker::new(keypair_from_seed(&[1; 32]));
        let mut sig = maker.sign(b"test");
        sig.subject_id = keypair_from_seed(&[2; 32]).public;
        assert!(!verify_signature(b"test", &sig));
    }

    #[test]
    fn truncated_signature_fails() {
        let maker = SigMaker::new(generate_keypair());
        let mut sig = maker.sign(b"test");
        sig.data.truncate(10);
        assert!(!verify_signature(b"test", &sig));
    }

    #[test]
    fn invalid_public_key() {
        let maker = SigMaker::new(generate_keypair());
        let mut sig = maker.sign(b"test");
        sig.subject_id = PublicKey([0xFF; 32]);
        assert!(!verify_signature(b"test", &sig));
    }

    #[test]
    fn signature_deterministic() {
        let maker = SigMaker::new(keypair_from_seed(&[99; 32]));
        assert_eq!(maker.sign(b"same"), maker.sign(b"same"));
    }
}
