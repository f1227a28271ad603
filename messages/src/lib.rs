//! Peer messages exchanged by validators.
//!
//! Every message between validators is one variant of [`EbftMessage`]. All are
//! unicast except [`EbftMessage::Status`], which is broadcast to every peer.
//! Headers, transactions and witnesses travel as opaque bytes; the receiving
//! node decodes them with its block engine.

use bincode::Options;
use serde::{Deserialize, Serialize};
use strata_types::{BlockRid, NodeState, NodeStatus, Signature};
use thiserror::Error;

/// Upper bound on an encoded message, enforced on decode.
pub const DEFAULT_MAX_MESSAGE_SIZE: u64 = 32 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("failed to encode message: {0}")]
    Encode(String),

    #[error("failed to decode message: {0}")]
    Decode(String),
}

/// Top-level consensus message.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum EbftMessage {
    /// A node's current consensus status (broadcast).
    Status(StatusMsg),
    /// A commit signature over a block header.
    BlockSignature(BlockSignatureMsg),
    /// A finalized block with its witness, answering `GetBlockAtHeight`.
    CompleteBlock(CompleteBlockMsg),
    /// A candidate block, answering `GetUnfinishedBlock`.
    UnfinishedBlock(UnfinishedBlockMsg),
    /// Request for the finalized block at a height.
    GetBlockAtHeight(GetBlockAtHeightMsg),
    /// Request for the candidate block with the given RID.
    GetUnfinishedBlock(GetUnfinishedBlockMsg),
    /// Request for the sender's commit signature over a block.
    GetBlockSignature(GetBlockSignatureMsg),
    /// A raw transaction forwarded by a peer.
    Transaction(TransactionMsg),
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusMsg {
    pub block_rid: Option<BlockRid>,
    pub height: i64,
    pub revolting: bool,
    pub round: i64,
    pub serial: i64,
    pub state: NodeState,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSignatureMsg {
    pub block_rid: BlockRid,
    pub signature: Signature,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CompleteBlockMsg {
    pub header: Vec<u8>,
    pub transactions: Vec<Vec<u8>>,
    pub height: i64,
    pub witness: Vec<u8>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnfinishedBlockMsg {
    pub header: Vec<u8>,
    pub transactions: Vec<Vec<u8>>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockAtHeightMsg {
    pub height: i64,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetUnfinishedBlockMsg {
    pub block_rid: BlockRid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetBlockSignatureMsg {
    pub block_rid: BlockRid,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionMsg {
    pub data: Vec<u8>,
}

impl From<&NodeStatus> for StatusMsg {
    fn from(status: &NodeStatus) -> Self {
        Self {
            block_rid: status.block_rid,
            height: status.height,
            revolting: status.revolting,
            round: status.round,
            serial: status.serial,
            state: status.state,
        }
    }
}

impl From<StatusMsg> for NodeStatus {
    fn from(msg: StatusMsg) -> Self {
        Self {
            height: msg.height,
            round: msg.round,
            block_rid: msg.block_rid,
            revolting: msg.revolting,
            serial: msg.serial,
            state: msg.state,
        }
    }
}

impl EbftMessage {
    /// Variant name, for logs and metrics labels.
    pub fn kind(&self) -> &'static str {
        match self {
            EbftMessage::Status(_) => "Status",
            EbftMessage::BlockSignature(_) => "BlockSignature",
            EbftMessage::CompleteBlock(_) => "CompleteBlock",
            EbftMessage::UnfinishedBlock(_) => "UnfinishedBlock",
            EbftMessage::GetBlockAtHeight(_) => "GetBlockAtHeight",
            EbftMessage::GetUnfinishedBlock(_) => "GetUnfinishedBlock",
            EbftMessage::GetBlockSignature(_) => "GetBlockSignature",
            EbftMessage::Transaction(_) => "Transaction",
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>, CodecError> {
        codec(DEFAULT_MAX_MESSAGE_SIZE)
            .serialize(self)
            .map_err(|e| CodecError::Encode(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        Self::decode_with_limit(bytes, DEFAULT_MAX_MESSAGE_SIZE)
    }

    /// Decode, refusing frames longer than `limit` bytes.
    ///
    /// bincode drops its byte limit when reading from a slice, so the frame
    /// length is checked here.
    pub fn decode_with_limit(bytes: &[u8], limit: u64) -> Result<Self, CodecError> {
        if bytes.len() as u64 > limit {
            return Err(CodecError::Decode(format!(
                "frame of {} bytes exceeds limit {limit}",
                bytes.len()
            )));
        }
        codec(limit)
            .deserialize(bytes)
            .map_err(|e| CodecError::Decode(e.to_string()))
    }
}

fn codec(limit: u64) -> impl Options {
    bincode::DefaultOptions::new().with_limit(limit)
}
