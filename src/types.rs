//! Core type definitions for the keyplane coordination core.
//!
//! # Type Aliases
//!
//! Common identifiers are defined as type aliases for clarity:
//!
//! - [`NodeId`] = `u64`: metadata cluster node identifier
//! - [`Term`] = `u64`: raft term number
//! - [`LogIndex`] = `u64`: raft log position
//! - [`GroupId`] = `u64`: replica group identifier
//! - [`SlotId`] = `usize`: logical shard identifier in `[0, SLOT_COUNT)`

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Unique identifier for a node in the metadata cluster.
pub type NodeId = u64;

/// Raft term number.
pub type Term = u64;

/// Raft log index.
pub type LogIndex = u64;

/// Unique identifier for a replica group.
pub type GroupId = u64;

/// Identifier of a logical shard (slot).
pub type SlotId = usize;

/// Network address of one replica leaf storage server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerAddr(String);

impl ServerAddr {
    pub fn new(addr: impl Into<String>) -> Self {
        Self(addr.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerAddr {
    fn from(addr: &str) -> Self {
        Self(addr.to_string())
    }
}

impl From<String> for ServerAddr {
    fn from(addr: String) -> Self {
        Self(addr)
    }
}

impl std::fmt::Display for ServerAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The lifecycle state of a slot.
///
/// Transitions between states are driven exclusively by committed log
/// entries; see `cluster::slot` for the transition table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SlotState {
    /// Not assigned to any group; unroutable.
    Offline,
    /// Owned by exactly one group.
    Online,
    /// Migration announced; routing readers are held at the barrier.
    PreMigration,
    /// Migration in progress; both source and destination are visible.
    InMigration,
}

impl std::fmt::Display for SlotState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotState::Offline => write!(f, "offline"),
            SlotState::Online => write!(f, "online"),
            SlotState::PreMigration => write!(f, "pre-migration"),
            SlotState::InMigration => write!(f, "in-migration"),
        }
    }
}

/// One element of a stored set: a member plus its write metadata.
///
/// The TTL encodes volatility:
/// - positive: the member expires `ttl` after `timestamp`
/// - zero: the member is persistent
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Element {
    pub member: String,
    /// Write timestamp in nanoseconds since the epoch.
    pub timestamp: i64,
    pub ttl: Duration,
}

impl Element {
    /// Whether the element is expired when observed at `now` (nanoseconds).
    pub fn expired_at(&self, now: i64) -> bool {
        !self.ttl.is_zero() && self.timestamp.saturating_add(self.ttl.as_nanos() as i64) <= now
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_state_display_matches_wire_names() {
        assert_eq!(SlotState::Offline.to_string(), "offline");
        assert_eq!(SlotState::Online.to_string(), "online");
        assert_eq!(SlotState::PreMigration.to_string(), "pre-migration");
        assert_eq!(SlotState::InMigration.to_string(), "in-migration");
    }

    #[test]
    fn slot_state_serializes_kebab_case() {
        let json = serde_json::to_string(&SlotState::PreMigration).unwrap();
        assert_eq!(json, "\"pre-migration\"");
        let back: SlotState = serde_json::from_str("\"in-migration\"").unwrap();
        assert_eq!(back, SlotState::InMigration);
    }

    #[test]
    fn element_expiry() {
        let e = Element {
            member: "m".into(),
            timestamp: 100,
            ttl: Duration::from_nanos(50),
        };
        assert!(!e.expired_at(100));
        assert!(e.expired_at(150));

        let persistent = Element {
            member: "m".into(),
            timestamp: 100,
            ttl: Duration::ZERO,
        };
        assert!(!persistent.expired_at(i64::MAX));
    }
}
