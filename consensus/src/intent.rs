//! Block intent derivation.
//!
//! The intent is the single next action the node pursues. It is recomputed
//! from scratch on every tick; nothing here holds state. Picking which peer to
//! ask is left to the caller.

use std::fmt;

use strata_types::{BlockRid, NodeState};

use crate::StatusManager;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum BlockIntent {
    DoNothing,
    /// Fetch the finalized block at this height from a peer that is ahead.
    FetchBlockAtHeight(i64),
    /// Fetch the primary's candidate block.
    FetchUnfinishedBlock(BlockRid),
    /// Ask these signers for their signature over the block we hold.
    FetchCommitSignatures(BlockRid, Vec<usize>),
    BuildBlock,
}

impl BlockIntent {
    pub fn kind(&self) -> &'static str {
        match self {
            BlockIntent::DoNothing => "DoNothing",
            BlockIntent::FetchBlockAtHeight(_) => "FetchBlockAtHeight",
            BlockIntent::FetchUnfinishedBlock(_) => "FetchUnfinishedBlock",
            BlockIntent::FetchCommitSignatures(..) => "FetchCommitSignatures",
            BlockIntent::BuildBlock => "BuildBlock",
        }
    }
}

impl fmt::Display for BlockIntent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockIntent::FetchBlockAtHeight(h) => write!(f, "FetchBlockAtHeight({h})"),
            BlockIntent::FetchUnfinishedBlock(rid) => {
                write!(f, "FetchUnfinishedBlock({})", rid.short())
            }
            BlockIntent::FetchCommitSignatures(rid, nodes) => {
                write!(f, "FetchCommitSignatures({}, {nodes:?})", rid.short())
            }
            other => f.write_str(other.kind()),
        }
    }
}

/// Derive the intent from the current status table.
///
/// In priority order:
/// 1. locked on a held block and some peer holding it has not signed: fetch signatures
/// 2. a peer is at a greater height: fetch the block at our height
/// 3. waiting and the primary offers a block: fetch it
/// 4. waiting, we are primary and `ready_to_build`: build
/// 5. otherwise nothing
pub fn derive_intent(status: &StatusManager, ready_to_build: bool) -> BlockIntent {
    let my = status.my_status();

    if my.state == NodeState::HaveBlock && status.is_locked() {
        if let Some(rid) = my.block_rid {
            let missing = missing_signers(status, &rid);
            if !missing.is_empty() {
                return BlockIntent::FetchCommitSignatures(rid, missing);
            }
        }
    }

    if status.node_statuses().iter().any(|s| s.height > my.height) {
        return BlockIntent::FetchBlockAtHeight(my.height);
    }

    if my.state == NodeState::WaitingForBlock {
        if let Some(rid) = status.primary_block_rid() {
            return BlockIntent::FetchUnfinishedBlock(rid);
        }
        if status.is_my_node_primary() && !status.is_locked() && ready_to_build {
            return BlockIntent::BuildBlock;
        }
    }

    BlockIntent::DoNothing
}

/// Peers at our height holding `rid` whose signature we still lack.
fn missing_signers(status: &StatusManager, rid: &BlockRid) -> Vec<usize> {
    let height = status.my_status().height;
    let signatures = status.commit_signatures();
    status
        .node_statuses()
        .iter()
        .enumerate()
        .filter(|(i, s)| {
            *i != status.my_index() && signatures[*i].is_none() && s.holds_block(height, rid)
        })
        .map(|(i, _)| i)
        .collect()
}
