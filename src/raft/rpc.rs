//! Raft RPC message definitions and the transport trait.

use super::LogEntry;
use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};

/// Raft RPC messages, used by channel-based transports and tests.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftMessage {
    RequestVote(RequestVoteRequest),
    RequestVoteResponse(RequestVoteResponse),
    AppendEntries(AppendEntriesRequest),
    AppendEntriesResponse(AppendEntriesResponse),
    InstallSnapshot(InstallSnapshotRequest),
    InstallSnapshotResponse(InstallSnapshotResponse),
}

/// RequestVote RPC arguments.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteRequest {
    /// Candidate's term.
    pub term: Term,
    /// Candidate requesting the vote.
    pub candidate_id: NodeId,
    /// Index of the candidate's last log entry.
    pub last_log_index: LogIndex,
    /// Term of the candidate's last log entry.
    pub last_log_term: Term,
}

/// RequestVote RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RequestVoteResponse {
    /// Current term, for the candidate to update itself.
    pub term: Term,
    /// True if the candidate received the vote.
    pub vote_granted: bool,
}

/// AppendEntries RPC arguments (heartbeat when `entries` is empty).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's id, so followers can redirect clients.
    pub leader_id: NodeId,
    /// Index of the log entry immediately preceding the new ones.
    pub prev_log_index: LogIndex,
    /// Term of the entry at `prev_log_index`.
    pub prev_log_term: Term,
    /// Entries to store.
    pub entries: Vec<LogEntry>,
    /// Leader's commit index.
    pub leader_commit: LogIndex,
}

/// AppendEntries RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendEntriesResponse {
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// Whether the consistency check at `prev_log_index` passed.
    pub success: bool,
    /// Index of the last entry replicated on this follower.
    pub match_index: LogIndex,
    /// Index of the last entry this follower has applied to its state
    /// machine. Drives the cluster-wide apply barrier.
    pub applied_index: LogIndex,
    /// Backtracking hint after a failed consistency check.
    pub conflict_index: Option<LogIndex>,
}

/// InstallSnapshot RPC arguments. The snapshot ships in one message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotRequest {
    /// Leader's term.
    pub term: Term,
    /// Leader's id.
    pub leader_id: NodeId,
    /// The snapshot replaces all entries up to and including this index.
    pub last_included_index: LogIndex,
    /// Term of the entry at `last_included_index`.
    pub last_included_term: Term,
    /// Serialized state machine.
    pub data: Vec<u8>,
}

/// InstallSnapshot RPC response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallSnapshotResponse {
    /// Current term, for the leader to update itself.
    pub term: Term,
    /// Whether the snapshot was persisted and applied.
    pub success: bool,
}

/// Transport used by a raft node to reach its peers.
#[async_trait::async_trait]
pub trait RaftRpc: Send + Sync {
    async fn request_vote(
        &self,
        target: NodeId,
        request: RequestVoteRequest,
    ) -> crate::Result<RequestVoteResponse>;

    async fn append_entries(
        &self,
        target: NodeId,
        request: AppendEntriesRequest,
    ) -> crate::Result<AppendEntriesResponse>;

    async fn install_snapshot(
        &self,
        target: NodeId,
        request: InstallSnapshotRequest,
    ) -> crate::Result<InstallSnapshotResponse>;
}

/// In-memory RPC implementation for unit tests.
#[cfg(test)]
pub mod mock {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Arc;
    use tokio::sync::Mutex;

    type ResponseHandler = Box<dyn Fn(RaftMessage) -> RaftMessage + Send + Sync>;

    #[derive(Default)]
    pub struct MockRpc {
        handlers: Arc<Mutex<HashMap<NodeId, ResponseHandler>>>,
    }

    impl MockRpc {
        pub fn new() -> Self {
            Self::default()
        }

        pub async fn register_handler<F>(&self, node_id: NodeId, handler: F)
        where
            F: Fn(RaftMessage) -> RaftMessage + Send + Sync + 'static,
        {
            self.handlers.lock().await.insert(node_id, Box::new(handler));
        }
    }

    #[async_trait::async_trait]
    impl RaftRpc for MockRpc {
        async fn request_vote(
            &self,
            target: NodeId,
            request: RequestVoteRequest,
        ) -> crate::Result<RequestVoteResponse> {
            let handlers = self.handlers.lock().await;
            let handler = handlers
                .get(&target)
                .ok_or(crate::KeyplaneError::Network(format!("no peer {}", target)))?;

            match handler(RaftMessage::RequestVote(request)) {
                RaftMessage::RequestVoteResponse(resp) => Ok(resp),
                _ => Err(crate::KeyplaneError::Internal("unexpected response".into())),
            }
        }

        async fn append_entries(
            &self,
            target: NodeId,
            request: AppendEntriesRequest,
        ) -> crate::Result<AppendEntriesResponse> {
            let handlers = self.handlers.lock().await;
            let handler = handlers
                .get(&target)
                .ok_or(crate::KeyplaneError::Network(format!("no peer {}", target)))?;

            match handler(RaftMessage::AppendEntries(request)) {
                RaftMessage::AppendEntriesResponse(resp) => Ok(resp),
                _ => Err(crate::KeyplaneError::Internal("unexpected response".into())),
            }
        }

        async fn install_snapshot(
            &self,
            target: NodeId,
            request: InstallSnapshotRequest,
        ) -> crate::Result<InstallSnapshotResponse> {
            let handlers = self.handlers.lock().await;
            let handler = handlers
                .get(&target)
                .ok_or(crate::KeyplaneError::Network(format!("no peer {}", target)))?;

            match handler(RaftMessage::InstallSnapshot(request)) {
                RaftMessage::InstallSnapshotResponse(resp) => Ok(resp),
                _ => Err(crate::KeyplaneError::Internal("unexpected response".into())),
            }
        }
    }
}
