//! Blake2b hashing for block headers and transactions.

use blake2::digest::consts::U32;
use blake2::{Blake2b, Digest};
use strata_types::{BlockRid, TxRid};

type Blake2b256 = Blake2b<U32>;

/// Compute a 256-bit Blake2b hash of arbitrary data.
pub fn blake2b_256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// Hash multiple byte slices in sequence (avoids concatenation allocation).
pub fn blake2b_256_multi(parts: &[&[u8]]) -> [u8; 32] {
    let mut hasher = Blake2b256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().into()
}

/// Content hash of a raw block header.
pub fn hash_block_header(raw_header: &[u8]) -> BlockRid {
    BlockRid::new(blake2b_256(raw_header))
}

/// Content hash of a raw transaction.
pub fn hash_transaction(tx_bytes: &[u8]) -> TxRid {
    TxRid::new(blake2b_256(tx_bytes))
}
