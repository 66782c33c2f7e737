//! Replicated metadata commands and their wire encoding.
//!
//! These are the only payloads that ever appear in the consensus log. The
//! encoding is self-describing JSON tagged by `op`; unknown fields are
//! tolerated so that nodes can decode entries written by newer versions,
//! while an unknown `op` fails the decode (and, on apply, the node —
//! divergence between replicas is worse than a crash).

use crate::error::Result;
use crate::types::{GroupId, ServerAddr, SlotId, SlotState};
use serde::{Deserialize, Serialize};

/// A mutation of the cluster metadata. Each case carries exactly the
/// fields relevant to its operation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClusterCommand {
    /// Create (or overwrite) a group.
    AddGroup {
        group_id: GroupId,
        servers: Vec<ServerAddr>,
    },
    /// Delete a group, offlining every slot it owns.
    DelGroup { group_id: GroupId },
    /// Bring slots `[start_slot_id, stop_slot_id]` online under a group.
    AssignSlots {
        group_id: GroupId,
        start_slot_id: SlotId,
        stop_slot_id: SlotId,
    },
    /// Drive one slot through a migration transition.
    ChangeSlotState {
        group_id: GroupId,
        slot_id: SlotId,
        slot_state: SlotState,
    },
}

impl ClusterCommand {
    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Outcome of applying a command. A rejected command has still consumed
/// its log entry on every node; only the result differs from success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum CommandResult {
    Applied,
    Rejected { message: String },
}

impl CommandResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, CommandResult::Applied)
    }
}

impl From<Result<()>> for CommandResult {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => CommandResult::Applied,
            Err(e) => CommandResult::Rejected {
                message: e.to_string(),
            },
        }
    }
}
