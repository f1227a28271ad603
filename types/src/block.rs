//! Block data as seen by the consensus layer.
//!
//! Headers, transactions and witnesses are opaque byte strings here; only the
//! block engine knows how to interpret a raw header. The consensus layer needs
//! just the header's raw bytes (what gets signed), its content hash, and the
//! link to the previous block.

use crate::{BlockRid, Signature, TypesError};
use serde::{Deserialize, Serialize};

/// A decoded block header.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub block_rid: BlockRid,
    pub prev_block_rid: BlockRid,
    pub raw_data: Vec<u8>,
}

/// A block without its witness (an unfinished, not yet signed block).
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockData {
    pub header: BlockHeader,
    pub transactions: Vec<Vec<u8>>,
}

impl BlockData {
    pub fn new(header: BlockHeader, transactions: Vec<Vec<u8>>) -> Self {
        Self {
            header,
            transactions,
        }
    }

    pub fn block_rid(&self) -> BlockRid {
        self.header.block_rid
    }
}

/// A complete block together with the witness that finalized it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BlockDataWithWitness {
    pub header: BlockHeader,
    pub transactions: Vec<Vec<u8>>,
    pub witness: Witness,
}

impl BlockDataWithWitness {
    pub fn block_rid(&self) -> BlockRid {
        self.header.block_rid
    }

    /// Drop the witness, keeping header and transactions.
    pub fn into_block_data(self) -> BlockData {
        BlockData::new(self.header, self.transactions)
    }
}

/// Aggregate of signatures over a single block header.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Witness {
    pub signatures: Vec<Signature>,
}

impl Witness {
    pub fn new(signatures: Vec<Signature>) -> Self {
        Self { signatures }
    }

    /// Raw witness bytes as carried on the wire and stored with the block.
    pub fn to_bytes(&self) -> Vec<u8> {
        // Serializing a Vec of plain structs into memory cannot fail.
        bincode::serialize(self).unwrap_or_default()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, TypesError> {
        bincode::deserialize(bytes).map_err(|e| TypesError::Serialization(e.to_string()))
    }

    pub fn len(&self) -> usize {
        self.signatures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signatures.is_empty()
    }
}
