//! Cluster metadata management.
//!
//! The whole key space is split into [`SLOT_COUNT`] slots; each slot is
//! owned by exactly one replica group at a time. This module holds the
//! authoritative map of groups and slots, replicated across the metadata
//! cluster by the consensus log:
//!
//! - [`Slot`]: per-slot state machine with the migration barrier
//! - [`Group`]: the non-owning handle slots keep to replica groups
//! - [`ClusterCommand`]: the only mutators that appear in the log
//! - [`ClusterStore`]: the replicated state machine (apply/snapshot/restore)
//! - [`Coordinator`]: the public API, including migration orchestration
//!   and key routing

mod command;
mod coordinator;
mod group;
mod slot;
mod store;

pub use command::{ClusterCommand, CommandResult};
pub use coordinator::Coordinator;
pub use group::{Group, NewGroup};
pub use slot::Slot;
pub use store::{ClusterStore, GroupView, SlotView};

use crate::error::{KeyplaneError, Result};
use crate::types::SlotId;

/// Number of slots the key space is divided into.
pub const SLOT_COUNT: usize = 1024;

/// The routing function: a key's slot is a pure function of its bytes.
pub fn slot_id_for_key(key: &str) -> SlotId {
    crc32fast::hash(key.as_bytes()) as SlotId % SLOT_COUNT
}

/// Validate an externally supplied slot id.
pub fn validate_slot_id(id: i64) -> Result<SlotId> {
    if id < 0 || id >= SLOT_COUNT as i64 {
        return Err(KeyplaneError::SlotIdOutOfRange {
            id,
            max: SLOT_COUNT,
        });
    }
    Ok(id as SlotId)
}
