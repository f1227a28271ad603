//! Witness accumulation for a single block header.
//!
//! Signatures are over the header's raw bytes. The builder keeps at most one
//! signature per configured signer and reports completeness once a quorum of
//! distinct signers has signed.

use std::sync::Arc;

use strata_crypto::verify_signature;
use strata_types::{Signature, SignerSet, Witness};

use crate::ConsensusError;

pub struct WitnessBuilder {
    signers: Arc<SignerSet>,
    header: Vec<u8>,
    /// Indexed by signer position.
    signatures: Vec<Option<Signature>>,
    count: usize,
}

impl WitnessBuilder {
    pub fn new(signers: Arc<SignerSet>, header: Vec<u8>) -> Self {
        let slots = signers.len();
        Self {
            signers,
            header,
            signatures: vec![None; slots],
            count: 0,
        }
    }

    /// Verify and record `signature`.
    ///
    /// Returns `Ok(true)` if it was added, `Ok(false)` if its signer had
    /// already signed. Unknown subjects and bad signature bytes are errors and
    /// leave the builder unchanged.
    pub fn apply_signature(&mut self, signature: &Signature) -> Result<bool, ConsensusError> {
        let index = self
            .signers
            .index_of(&signature.subject_id)
            .ok_or_else(|| ConsensusError::UnknownSigner(signature.subject_id.to_string()))?;
        if self.signatures[index].is_some() {
            return Ok(false);
        }
        if !verify_signature(&self.header, signature) {
            return Err(ConsensusError::InvalidSignature {
                subject: signature.subject_id.to_string(),
            });
        }
        self.signatures[index] = Some(signature.clone());
        self.count += 1;
        Ok(true)
    }

    pub fn is_complete(&self) -> bool {
        self.count >= self.signers.quorum()
    }

    pub fn signature_count(&self) -> usize {
        self.count
    }

    pub fn header(&self) -> &[u8] {
        &self.header
    }

    /// The collected signatures in signer order. Fails before quorum.
    pub fn get_witness(&self) -> Result<Witness, ConsensusError> {
        if !self.is_complete() {
            return Err(ConsensusError::WitnessIncomplete {
                have: self.count,
                need: self.signers.quorum(),
            });
        }
        Ok(Witness::new(self.signatures.iter().flatten().cloned().collect()))
    }
}

/// Check that `witness` proves `header` was accepted by a quorum of `signers`.
///
/// Any signature that fails verification rejects the whole witness.
pub fn verify_witness(
    signers: &Arc<SignerSet>,
    header: &[u8],
    witness: &Witness,
) -> Result<(), ConsensusError> {
    let mut builder = WitnessBuilder::new(Arc::clone(signers), header.to_vec());
    for signature in &witness.signatures {
        builder.apply_signature(signature)?;
    }
    builder.get_witness().map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_crypto::{keypair_from_seed, SigMaker};

    fn makers(n: u8) -> (Vec<SigMaker>, Arc<SignerSet>) {
        let makers: Vec<SigMaker> = (0..n)
            .map(|i| SigMaker::new(keypair_from_seed(&[i + 1; 32])))
            .collect();
        let set = SignerSet::new(makers.iter().map(|m| m.public_key().clone()).collect()).unwrap();
        (makers, Arc::new(set))
    }

    #[test]
    fn complete_after_quorum_of_distinct_signers() {
        let (makers, set) = makers(4);
        let header = b"header-1".to_vec();
        let mut builder = WitnessBuilder::new(set, header.clone());

        assert!(builder.apply_signature(&makers[0].sign(&header)).unwrap());
        assert!(!builder.apply_signature(&makers[0].sign(&header)).unwrap());
        assert!(builder.apply_signature(&makers[2].sign(&header)).unwrap());
        assert!(!builder.is_complete());
        assert!(matches!(
            builder.get_witness(),
            Err(ConsensusError::WitnessIncomplete { have: 2, need: 3 })
        ));

        builder.apply_signature(&makers[3].sign(&header)).unwrap();
        assert!(builder.is_complete());
        let witness = builder.get_witness().unwrap();
        assert_eq!(witness.len(), 3);
        assert_eq!(witness.signatures[0].subject_id, *makers[0].public_key());
    }

    #[test]
    fn outsider_and_forged_signatures_never_count() {
        let (makers, set) = makers(4);
        let outsider = SigMaker::new(keypair_from_seed(&[99; 32]));
        let header = b"header-2".to_vec();
        let mut builder = WitnessBuilder::new(set, header.clone());

        assert!(matches!(
            builder.apply_signature(&outsider.sign(&header)),
            Err(ConsensusError::UnknownSigner(_))
        ));
        // Signed by signer 1 but over different bytes.
        assert!(matches!(
            builder.apply_signature(&makers[1].sign(b"other header")),
            Err(ConsensusError::InvalidSignature { .. })
        ));
        let mut truncated = makers[1].sign(&header);
        truncated.data.truncate(10);
        assert!(builder.apply_signature(&truncated).is_err());
        assert_eq!(builder.signature_count(), 0);
    }

    #[test]
    fn verify_witness_checks_quorum_and_validity() {
        let (makers, set) = makers(4);
        let header = b"header-3".to_vec();
        let sigs: Vec<Signature> = makers.iter().map(|m| m.sign(&header)).collect();

        assert!(verify_witness(&set, &header, &Witness::new(sigs[..3].to_vec())).is_ok());
        assert!(verify_witness(&set, &header, &Witness::new(sigs[..2].to_vec())).is_err());

        let mut bad = sigs[..3].to_vec();
        bad[1] = makers[1].sign(b"nope");
        assert!(verify_witness(&set, &header, &Witness::new(bad)).is_err());
    }
}
