//! Raft node state management.

use crate::types::{LogIndex, NodeId, Term};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// The role of a raft node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Passive; responds to RPCs.
    Follower,
    /// Seeking election.
    Candidate,
    /// Handling proposals and replication.
    Leader,
}

impl NodeState {
    pub fn is_leader(&self) -> bool {
        matches!(self, NodeState::Leader)
    }

    pub fn is_candidate(&self) -> bool {
        matches!(self, NodeState::Candidate)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NodeState::Follower => write!(f, "follower"),
            NodeState::Candidate => write!(f, "candidate"),
            NodeState::Leader => write!(f, "leader"),
        }
    }
}

/// State that must survive restarts.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    /// Latest term this node has seen.
    pub current_term: Term,
    /// Candidate that received this node's vote in the current term.
    pub voted_for: Option<NodeId>,
}

/// Volatile state common to all roles.
#[derive(Debug, Clone, Default)]
pub struct VolatileState {
    /// Highest log index known to be committed.
    pub commit_index: LogIndex,
    /// Highest log index applied to the state machine.
    pub last_applied: LogIndex,
}

/// Per-follower replication bookkeeping, leaders only.
#[derive(Debug, Clone)]
pub struct LeaderState {
    /// Next log index to send to each follower.
    pub next_index: HashMap<NodeId, LogIndex>,
    /// Highest log index known replicated on each follower.
    pub match_index: HashMap<NodeId, LogIndex>,
    /// Highest log index each follower has reported applied.
    /// Feeds the cluster-wide apply barrier.
    pub applied_index: HashMap<NodeId, LogIndex>,
}

impl LeaderState {
    pub fn new(peers: &[NodeId], last_log_index: LogIndex) -> Self {
        let mut next_index = HashMap::new();
        let mut match_index = HashMap::new();
        let mut applied_index = HashMap::new();
        for &peer in peers {
            next_index.insert(peer, last_log_index + 1);
            match_index.insert(peer, 0);
            applied_index.insert(peer, 0);
        }
        Self {
            next_index,
            match_index,
            applied_index,
        }
    }

    /// Record a successful replication response.
    pub fn update_peer(&mut self, peer: NodeId, match_index: LogIndex, applied_index: LogIndex) {
        self.match_index.insert(peer, match_index);
        self.next_index.insert(peer, match_index + 1);
        self.applied_index.insert(peer, applied_index);
    }

    /// Walk back after a failed consistency check.
    pub fn decrement_next(&mut self, peer: NodeId) {
        if let Some(next) = self.next_index.get_mut(&peer) {
            *next = next.saturating_sub(1).max(1);
        }
    }

    /// Start tracking a newly added voter.
    pub fn add_peer(&mut self, peer: NodeId, last_log_index: LogIndex) {
        self.next_index.entry(peer).or_insert(last_log_index + 1);
        self.match_index.entry(peer).or_insert(0);
        self.applied_index.entry(peer).or_insert(0);
    }

    /// Stop tracking peers that are no longer voters.
    pub fn retain_peers(&mut self, peers: &[NodeId]) {
        self.next_index.retain(|id, _| peers.contains(id));
        self.match_index.retain(|id, _| peers.contains(id));
        self.applied_index.retain(|id, _| peers.contains(id));
    }
}

/// Complete raft state for a node.
#[derive(Debug)]
pub struct RaftState {
    /// This node's id.
    pub node_id: NodeId,
    /// Current role.
    pub state: NodeState,
    /// Last known leader.
    pub leader_id: Option<NodeId>,
    /// Durable term/vote state.
    pub persistent: PersistentState,
    /// Commit/apply progress.
    pub volatile: VolatileState,
    /// Replication bookkeeping, only while leader.
    pub leader: Option<LeaderState>,
    /// Voter ids, excluding this node. Updated by membership entries.
    pub peers: Vec<NodeId>,
}

impl RaftState {
    pub fn new(node_id: NodeId, peers: Vec<NodeId>) -> Self {
        Self {
            node_id,
            state: NodeState::Follower,
            leader_id: None,
            persistent: PersistentState::default(),
            volatile: VolatileState::default(),
            leader: None,
            peers,
        }
    }

    pub fn become_follower(&mut self, term: Term, leader_id: Option<NodeId>) {
        if term > self.persistent.current_term {
            self.persistent.voted_for = None;
        }
        self.state = NodeState::Follower;
        self.persistent.current_term = term;
        self.leader_id = leader_id;
        self.leader = None;

        tracing::info!(node_id = self.node_id, term, leader = ?leader_id, "became follower");
    }

    pub fn become_candidate(&mut self) {
        self.state = NodeState::Candidate;
        self.persistent.current_term += 1;
        self.persistent.voted_for = Some(self.node_id);
        self.leader_id = None;
        self.leader = None;

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "became candidate"
        );
    }

    pub fn become_leader(&mut self, last_log_index: LogIndex) {
        self.state = NodeState::Leader;
        self.leader_id = Some(self.node_id);
        self.leader = Some(LeaderState::new(&self.peers, last_log_index));

        tracing::info!(
            node_id = self.node_id,
            term = self.persistent.current_term,
            "became leader"
        );
    }

    pub fn is_leader(&self) -> bool {
        self.state.is_leader()
    }

    pub fn current_term(&self) -> Term {
        self.persistent.current_term
    }

    /// Majority size over all voters (peers plus this node).
    pub fn quorum_size(&self) -> usize {
        (self.peers.len() + 1) / 2 + 1
    }

    /// Replace the voter set after a membership entry is applied.
    pub fn set_peers(&mut self, peers: Vec<NodeId>) {
        if let Some(leader) = self.leader.as_mut() {
            let last = self.volatile.commit_index;
            for &peer in &peers {
                leader.add_peer(peer, last);
            }
            leader.retain_peers(&peers);
        }
        self.peers = peers;
    }

    /// The highest index replicated on a majority, given the leader's own
    /// last log index.
    pub fn calculate_commit_index(&self, last_log_index: LogIndex) -> LogIndex {
        let leader = match (&self.leader, self.is_leader()) {
            (Some(l), true) => l,
            _ => return self.volatile.commit_index,
        };

        let mut indices: Vec<LogIndex> = leader.match_index.values().copied().collect();
        indices.push(last_log_index);
        indices.sort_unstable();
        indices.reverse();

        // indices[quorum - 1] is the highest index present on at least
        // quorum voters.
        let quorum_idx = self.quorum_size() - 1;
        if quorum_idx < indices.len() {
            indices[quorum_idx].max(self.volatile.commit_index)
        } else {
            self.volatile.commit_index
        }
    }

    /// The lowest applied index across all voters, for the apply barrier.
    pub fn min_applied_index(&self) -> LogIndex {
        let own = self.volatile.last_applied;
        match &self.leader {
            Some(leader) => self
                .peers
                .iter()
                .map(|peer| leader.applied_index.get(peer).copied().unwrap_or(0))
                .chain(std::iter::once(own))
                .min()
                .unwrap_or(own),
            None => own,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initial_state() {
        let state = RaftState::new(1, vec![2, 3]);
        assert_eq!(state.state, NodeState::Follower);
        assert_eq!(state.current_term(), 0);
        assert!(state.leader_id.is_none());
    }

    #[test]
    fn candidate_votes_for_itself() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();
        assert!(state.state.is_candidate());
        assert_eq!(state.current_term(), 1);
        assert_eq!(state.persistent.voted_for, Some(1));
    }

    #[test]
    fn quorum_sizes() {
        assert_eq!(RaftState::new(1, vec![]).quorum_size(), 1);
        assert_eq!(RaftState::new(1, vec![2, 3]).quorum_size(), 2);
        assert_eq!(RaftState::new(1, vec![2, 3, 4, 5]).quorum_size(), 3);
    }

    #[test]
    fn commit_index_follows_majority() {
        let mut state = RaftState::new(1, vec![2, 3, 4, 5]);
        state.become_candidate();
        state.become_leader(10);

        let leader = state.leader.as_mut().unwrap();
        leader.match_index.insert(2, 8);
        leader.match_index.insert(3, 7);
        leader.match_index.insert(4, 9);
        leader.match_index.insert(5, 6);

        // Indices [10, 9, 8, 7, 6], quorum 3 -> third highest is 8.
        assert_eq!(state.calculate_commit_index(10), 8);
    }

    #[test]
    fn min_applied_spans_all_voters() {
        let mut state = RaftState::new(1, vec![2, 3]);
        state.become_candidate();
        state.become_leader(5);
        state.volatile.last_applied = 5;

        let leader = state.leader.as_mut().unwrap();
        leader.applied_index.insert(2, 4);
        leader.applied_index.insert(3, 5);

        assert_eq!(state.min_applied_index(), 4);
    }

    #[test]
    fn membership_change_updates_quorum() {
        let mut state = RaftState::new(1, vec![]);
        state.become_candidate();
        state.become_leader(0);
        assert_eq!(state.quorum_size(), 1);

        state.set_peers(vec![2]);
        assert_eq!(state.quorum_size(), 2);
        let leader = state.leader.as_ref().unwrap();
        assert!(leader.next_index.contains_key(&2));
    }
}
