//! Raft consensus for the keyplane metadata cluster.
//!
//! This module provides the replicated log that drives the cluster metadata
//! state machine: leader election, log replication, persistence, snapshot
//! installation, and leader-driven voter addition. On top of the classic
//! algorithm it exposes two primitives the coordinator depends on:
//!
//! - proposals resolve with the state machine's apply result once the entry
//!   is committed and applied on the leader;
//! - a cluster-wide apply barrier that resolves once a given log index has
//!   been applied on every voter.

// Deny unsafe code patterns in this critical consensus module.
// Panics here can break consensus.
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]

mod log;
mod node;
pub mod rpc;
mod state;
mod storage;

pub use log::{EntryKind, LogEntry, RaftLog};
pub use node::{RaftCommand, RaftConfig, RaftNode, RaftStatus};
pub use rpc::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    RaftMessage, RaftRpc, RequestVoteRequest, RequestVoteResponse,
};
pub use state::{NodeState, PersistentState, RaftState};
pub use storage::RaftStorage;

/// Trait for state machines driven by the replicated log.
///
/// `apply` runs on exactly the committed entries, in log order, single
/// threaded. It must be deterministic: every node applies the same bytes
/// and must reach the same state.
pub trait StateMachine: Send + Sync {
    /// The result type for applied commands.
    type Result: Send + Clone;

    /// Apply a committed command to the state machine.
    fn apply(&mut self, command: &[u8]) -> Self::Result;

    /// Serialize the current state.
    fn snapshot(&self) -> crate::Result<Vec<u8>>;

    /// Replace the current state with a previously serialized one.
    fn restore(&mut self, snapshot: &[u8]) -> crate::Result<()>;
}
