//! Per-node consensus status, gossiped between validators.

use crate::BlockRid;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Where a node is within the current height and round.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeState {
    /// No candidate block built or received yet.
    WaitingForBlock,
    /// A candidate block is held but not yet signed by a quorum.
    HaveBlock,
    /// A quorum of commit signatures has been collected for the held block.
    Prepared,
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NodeState::WaitingForBlock => "WaitingForBlock",
            NodeState::HaveBlock => "HaveBlock",
            NodeState::Prepared => "Prepared",
        };
        f.write_str(name)
    }
}

/// The last known status of one validator (including ourselves).
///
/// `height` is the height of the block currently being worked on, i.e. the
/// number of committed blocks. `serial` strictly increases every time the node
/// publishes a changed status; receivers discard anything not newer than what
/// they already hold.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeStatus {
    pub height: i64,
    pub round: i64,
    pub block_rid: Option<BlockRid>,
    pub revolting: bool,
    pub serial: i64,
    pub state: NodeState,
}

impl NodeStatus {
    /// Status of a node we know nothing about yet.
    pub fn unknown() -> Self {
        Self {
            height: 0,
            round: 0,
            block_rid: None,
            revolting: false,
            serial: -1,
            state: NodeState::WaitingForBlock,
        }
    }

    /// Fresh status at the start of `height`.
    pub fn at_height(height: i64) -> Self {
        Self {
            height,
            ..Self::unknown()
        }
    }

    /// True if the node reports holding `rid` as a candidate at `height`.
    pub fn holds_block(&self, height: i64, rid: &BlockRid) -> bool {
        self.height == height
            && self.block_rid.as_ref() == Some(rid)
            && matches!(self.state, NodeState::HaveBlock | NodeState::Prepared)
    }
}

impl Default for NodeStatus {
    fn default() -> Self {
        Self::unknown()
    }
}
