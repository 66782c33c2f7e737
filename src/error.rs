//! Error types for the keyplane coordination core.
//!
//! This module provides a unified error type [`KeyplaneError`] for all
//! operations, along with a convenient [`Result`] type alias.
//!
//! Every error maps to one of the coarse [`ErrorCategory`] tags surfaced to
//! the transport layer:
//!
//! - **NotLeader**: mutation attempted on a non-leader; retry at the leader
//! - **InvalidArg**: out-of-range slot id, unknown state, bad input
//! - **StateTransitionDenied**: illegal slot state transition
//! - **GroupNotFound**: command references an unknown group id
//! - **NoQuorum**: a group write fell short of its write quorum
//! - **SlotNotRoutable**: routing hit an offline slot
//! - **Internal**: consensus, storage, or serialization failure
//!
//! # Example
//!
//! ```rust
//! use keyplane::error::{ErrorCategory, KeyplaneError};
//!
//! let err = KeyplaneError::NotLeader { leader: Some(2) };
//! assert_eq!(err.category(), ErrorCategory::NotLeader);
//! assert!(err.is_retryable());
//! ```

use crate::types::{GroupId, NodeId, SlotId, SlotState};
use serde::{Deserialize, Serialize};
use std::io;
use thiserror::Error;

/// Main error type for keyplane operations.
#[derive(Error, Debug)]
pub enum KeyplaneError {
    // Consensus errors
    #[error("not leader (current leader: {leader:?})")]
    NotLeader { leader: Option<NodeId> },

    #[error("raft log error: {0}")]
    RaftLog(String),

    #[error("consensus error: {0}")]
    Consensus(String),

    // Slot errors
    #[error("slot is offline")]
    SlotUnroutable,

    #[error("slot {0} is offline")]
    SlotOffline(SlotId),

    #[error("slot {0} is in migration")]
    SlotInMigration(SlotId),

    #[error("cannot change {from} slot to {to}")]
    SlotTransition { from: SlotState, to: SlotState },

    #[error("slot id {id} is not in [0, {max})")]
    SlotIdOutOfRange { id: i64, max: usize },

    // Group errors
    #[error("group {0} not found")]
    GroupNotFound(GroupId),

    #[error("no quorum ({0})")]
    NoQuorum(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A replicated command was applied but rejected by the state machine.
    /// The log entry is still consumed on every node.
    #[error("{0}")]
    CommandRejected(String),

    // Configuration errors
    #[error("invalid configuration: {field}: {reason}")]
    InvalidConfig { field: String, reason: String },

    // Infrastructure errors
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("network error: {0}")]
    Network(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("io error: {0}")]
    Io(#[from] io::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classification exposed over the transport layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCategory {
    NotLeader,
    InvalidArg,
    StateTransitionDenied,
    GroupNotFound,
    NoQuorum,
    SlotNotRoutable,
    Internal,
}

impl KeyplaneError {
    /// The category tag surfaced alongside the message.
    pub fn category(&self) -> ErrorCategory {
        match self {
            KeyplaneError::NotLeader { .. } => ErrorCategory::NotLeader,
            KeyplaneError::SlotIdOutOfRange { .. }
            | KeyplaneError::InvalidArgument(_)
            | KeyplaneError::InvalidConfig { .. } => ErrorCategory::InvalidArg,
            KeyplaneError::SlotTransition { .. } => ErrorCategory::StateTransitionDenied,
            KeyplaneError::GroupNotFound(_) => ErrorCategory::GroupNotFound,
            KeyplaneError::NoQuorum(_) => ErrorCategory::NoQuorum,
            KeyplaneError::SlotUnroutable => ErrorCategory::SlotNotRoutable,
            _ => ErrorCategory::Internal,
        }
    }

    /// Whether the caller may retry the operation as-is.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            KeyplaneError::NotLeader { .. }
                | KeyplaneError::Timeout(_)
                | KeyplaneError::Network(_)
        )
    }
}

impl From<rocksdb::Error> for KeyplaneError {
    fn from(e: rocksdb::Error) -> Self {
        KeyplaneError::Storage(e.to_string())
    }
}

impl From<bincode::Error> for KeyplaneError {
    fn from(e: bincode::Error) -> Self {
        KeyplaneError::Serialization(e.to_string())
    }
}

impl From<serde_json::Error> for KeyplaneError {
    fn from(e: serde_json::Error) -> Self {
        KeyplaneError::Serialization(e.to_string())
    }
}

/// Result type alias for keyplane operations.
pub type Result<T> = std::result::Result<T, KeyplaneError>;
