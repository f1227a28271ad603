//! The configured signer set and its BFT quorum arithmetic.
//!
//! With `n` signers the network tolerates `f = (n - 1) / 3` faulty nodes.
//! The quorum is `n - f`, which equals `2f + 1` whenever `n = 3f + 1`, and keeps
//! any two quorums intersecting in a correct node for every other `n` as well.

use crate::{PublicKey, TypesError};

/// Ordered, fixed-at-configuration list of signer public keys.
///
/// A node's position in this list is its consensus identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SignerSet {
    keys: Vec<PublicKey>,
}

impl SignerSet {
    pub fn new(keys: Vec<PublicKey>) -> Result<Self, TypesError> {
        if keys.is_empty() {
            return Err(TypesError::EmptySignerSet);
        }
        for (i, key) in keys.iter().enumerate() {
            if keys[..i].contains(key) {
                return Err(TypesError::DuplicateSigner(i));
            }
        }
        Ok(Self { keys })
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&PublicKey> {
        self.keys.get(index)
    }

    pub fn keys(&self) -> &[PublicKey] {
        &self.keys
    }

    pub fn index_of(&self, key: &PublicKey) -> Option<usize> {
        self.keys.iter().position(|k| k == key)
    }

    pub fn check_index(&self, index: usize) -> Result<(), TypesError> {
        if index < self.keys.len() {
            Ok(())
        } else {
            Err(TypesError::IndexOutOfRange {
                index,
                count: self.keys.len(),
            })
        }
    }

    /// Maximum number of faulty signers tolerated.
    pub fn max_faulty(&self) -> usize {
        max_faulty(self.keys.len())
    }

    /// Number of distinct signers needed for a quorum.
    pub fn quorum(&self) -> usize {
        quorum(self.keys.len())
    }
}

/// `f = floor((n - 1) / 3)`.
pub fn max_faulty(n: usize) -> usize {
    n.saturating_sub(1) / 3
}

/// `n - f`; equal to `2f + 1` for `n = 3f + 1`.
pub fn quorum(n: usize) -> usize {
    n - max_faulty(n)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(b: u8) -> PublicKey {
        PublicKey([b; 32])
    }

    #[test]
    fn quorum_table() {
        assert_eq!((max_faulty(1), quorum(1)), (0, 1));
        assert_eq!((max_faulty(3), quorum(3)), (0, 3));
        assert_eq!((max_faulty(4), quorum(4)), (1, 3));
        assert_eq!((max_faulty(7), quorum(7)), (2, 5));
        assert_eq!((max_faulty(10), quorum(10)), (3, 7));
    }

    #[test]
    fn uneven_sets_keep_quorums_overlapping() {
        // With n = 6 a 2f + 1 = 3 threshold would let {0,1,2} and {3,4,5}
        // both complete.
        assert_eq!((max_faulty(6), quorum(6)), (1, 5));
        assert_eq!((max_faulty(5), quorum(5)), (1, 4));
        for n in 1..50 {
            assert!(2 * quorum(n) >= n + max_faulty(n) + 1, "n = {n}");
        }
    }

    #[test]
    fn empty_and_duplicate_sets_rejected() {
        assert!(matches!(SignerSet::new(vec![]), Err(TypesError::EmptySignerSet)));
        assert!(matches!(
            SignerSet::new(vec![key(1), key(2), key(1)]),
            Err(TypesError::DuplicateSigner(2))
        ));
    }

    #[test]
    fn index_lookup() {
        let set = SignerSet::new(vec![key(1), key(2), key(3), key(4)]).unwrap();
        assert_eq!(set.index_of(&key(3)), Some(2));
        assert_eq!(set.index_of(&key(9)), None);
        assert!(set.check_index(3).is_ok());
        assert!(set.check_index(4).is_err());
        assert_eq!(set.quorum(), 3);
    }
}
