//! Raft node implementation.

use super::rpc::*;
use super::state::*;
use super::{EntryKind, LogEntry, RaftLog, RaftStorage, StateMachine};
use crate::error::{KeyplaneError, Result};
use crate::types::{LogIndex, NodeId, Term};
use futures::FutureExt;
use parking_lot::{Mutex, RwLock};
use rand::Rng;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, timeout, Instant};
use tracing::{debug, error, info, warn};

/// Per-RPC timeout for AppendEntries.
const APPEND_RPC_TIMEOUT: Duration = Duration::from_millis(50);

/// Per-RPC timeout for RequestVote.
const VOTE_RPC_TIMEOUT: Duration = Duration::from_millis(100);

/// Per-RPC timeout for a full snapshot install. Metadata snapshots are
/// small (slot and group tables), so one message suffices.
const SNAPSHOT_RPC_TIMEOUT: Duration = Duration::from_secs(2);

/// Raft configuration.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    /// This node's id.
    pub node_id: NodeId,
    /// Address peers use to reach this node. Recorded in membership
    /// entries when voters are added.
    pub advertise_addr: String,
    /// Initially known peers (`node id -> address`), excluding this node.
    pub peers: HashMap<NodeId, String>,
    /// Whether this node may bootstrap a single-voter cluster. A
    /// non-bootstrap node with no known peers never campaigns; it waits to
    /// be adopted by a leader.
    pub bootstrap: bool,
    /// Minimum election timeout.
    pub election_timeout_min: Duration,
    /// Maximum election timeout.
    pub election_timeout_max: Duration,
    /// Heartbeat interval.
    pub heartbeat_interval: Duration,
    /// Maximum entries per AppendEntries RPC.
    pub max_entries_per_append: usize,
    /// Applied entries between snapshots.
    pub snapshot_threshold: usize,
}

impl Default for RaftConfig {
    fn default() -> Self {
        Self {
            node_id: 1,
            advertise_addr: "127.0.0.1:9100".to_string(),
            peers: HashMap::new(),
            bootstrap: false,
            election_timeout_min: Duration::from_millis(150),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(50),
            max_entries_per_append: 100,
            snapshot_threshold: 10_000,
        }
    }
}

/// Point-in-time view of a node's consensus state.
#[derive(Debug, Clone)]
pub struct RaftStatus {
    pub is_leader: bool,
    pub leader_id: Option<NodeId>,
    pub term: Term,
    pub last_applied: LogIndex,
}

/// Commands accepted by a running raft node.
pub enum RaftCommand<R> {
    /// Replicate a state machine command. Resolves with the entry's index
    /// and the apply result once committed and applied on the leader.
    Propose {
        data: Vec<u8>,
        response: oneshot::Sender<Result<(LogIndex, R)>>,
    },
    /// Resolve once every voter has applied at least `index`.
    Barrier {
        index: LogIndex,
        response: oneshot::Sender<Result<()>>,
    },
    /// Add a voter to the cluster (leader only).
    AddVoter {
        node_id: NodeId,
        address: String,
        response: oneshot::Sender<Result<()>>,
    },
    /// Handle an incoming RequestVote RPC.
    RequestVote {
        request: RequestVoteRequest,
        response: oneshot::Sender<RequestVoteResponse>,
    },
    /// Handle an incoming AppendEntries RPC.
    AppendEntries {
        request: AppendEntriesRequest,
        response: oneshot::Sender<AppendEntriesResponse>,
    },
    /// Handle an incoming InstallSnapshot RPC.
    InstallSnapshot {
        request: InstallSnapshotRequest,
        response: oneshot::Sender<InstallSnapshotResponse>,
    },
    /// Check whether this node currently leads.
    IsLeader { response: oneshot::Sender<bool> },
    /// Read the node's consensus status.
    Status { response: oneshot::Sender<RaftStatus> },
    /// Stop the node.
    Shutdown,
}

/// Callers waiting on log progress.
struct Pending<R> {
    /// Proposals waiting for commit + leader-local apply, keyed by index.
    /// The recorded term detects overwritten entries after leader changes.
    proposals: BTreeMap<LogIndex, (Term, oneshot::Sender<Result<(LogIndex, R)>>)>,
    /// Voter additions waiting for their membership entry to apply.
    voters: BTreeMap<LogIndex, (Term, oneshot::Sender<Result<()>>)>,
    /// Apply barriers waiting for all voters to reach an index.
    barriers: Vec<(LogIndex, oneshot::Sender<Result<()>>)>,
}

impl<R> Default for Pending<R> {
    fn default() -> Self {
        Self {
            proposals: BTreeMap::new(),
            voters: BTreeMap::new(),
            barriers: Vec::new(),
        }
    }
}

impl<R> Pending<R> {
    fn is_empty(&self) -> bool {
        self.proposals.is_empty() && self.voters.is_empty() && self.barriers.is_empty()
    }

    fn fail_all(&mut self, leader: Option<NodeId>) {
        for (_, (_, tx)) in std::mem::take(&mut self.proposals) {
            let _ = tx.send(Err(KeyplaneError::NotLeader { leader }));
        }
        for (_, (_, tx)) in std::mem::take(&mut self.voters) {
            let _ = tx.send(Err(KeyplaneError::NotLeader { leader }));
        }
        for (_, tx) in std::mem::take(&mut self.barriers) {
            let _ = tx.send(Err(KeyplaneError::NotLeader { leader }));
        }
    }
}

/// The raft node, managing consensus for a replicated state machine.
pub struct RaftNode<S: StateMachine> {
    config: RaftConfig,
    state: Arc<RwLock<RaftState>>,
    log: Arc<RwLock<RaftLog>>,
    storage: Arc<RaftStorage>,
    state_machine: Arc<RwLock<S>>,
    rpc: Arc<dyn RaftRpc>,
    /// Voter addresses, excluding this node. Shared with the transport so
    /// membership changes take effect without restarting either.
    peers: Arc<RwLock<HashMap<NodeId, String>>>,
    command_tx: mpsc::Sender<RaftCommand<S::Result>>,
    pending: Mutex<Pending<S::Result>>,
}

impl<S: StateMachine + 'static> RaftNode<S> {
    /// Create a new raft node. Recovers term/vote state, the voter map,
    /// the snapshot, and the log suffix from storage.
    pub fn new<P: AsRef<Path>>(
        config: RaftConfig,
        storage_path: P,
        state_machine: Arc<RwLock<S>>,
        rpc: Arc<dyn RaftRpc>,
        peers: Arc<RwLock<HashMap<NodeId, String>>>,
    ) -> Result<(Self, mpsc::Receiver<RaftCommand<S::Result>>)> {
        let storage = Arc::new(RaftStorage::open(storage_path)?);

        // Seed the voter map: config first, then any persisted membership.
        {
            let mut peers = peers.write();
            peers.extend(config.peers.clone());
            if let Some(mut voters) = storage.load_voters()? {
                voters.remove(&config.node_id);
                *peers = voters;
            }
        }

        let peer_ids: Vec<NodeId> = peers.read().keys().copied().collect();
        let mut raft_state = RaftState::new(config.node_id, peer_ids);
        if let Some(persistent) = storage.load_persistent_state()? {
            raft_state.persistent = persistent;
        }

        let mut log = RaftLog::new();
        if let Some((snapshot_data, meta)) = storage.load_snapshot()? {
            state_machine.write().restore(&snapshot_data)?;
            log.compact(meta.last_index, meta.last_term);
            raft_state.volatile.commit_index = meta.last_index;
            raft_state.volatile.last_applied = meta.last_index;
        }
        for entry in storage.load_log_entries_from(log.first_index())? {
            log.append(entry)?;
        }

        let (command_tx, command_rx) = mpsc::channel(1024);

        let node = Self {
            config,
            state: Arc::new(RwLock::new(raft_state)),
            log: Arc::new(RwLock::new(log)),
            storage,
            state_machine,
            rpc,
            peers,
            command_tx,
            pending: Mutex::new(Pending::default()),
        };

        Ok((node, command_rx))
    }

    /// A sender for issuing commands to this node.
    pub fn command_sender(&self) -> mpsc::Sender<RaftCommand<S::Result>> {
        self.command_tx.clone()
    }

    /// Run the node's event loop until shutdown.
    pub async fn run(self, mut command_rx: mpsc::Receiver<RaftCommand<S::Result>>) {
        let mut election_deadline = self.reset_election_deadline();
        let mut heartbeat = interval(self.config.heartbeat_interval);

        loop {
            let is_leader = self.state.read().is_leader();

            tokio::select! {
                Some(cmd) = command_rx.recv() => {
                    match cmd {
                        RaftCommand::Shutdown => {
                            info!(node_id = self.config.node_id, "raft node shutting down");
                            self.pending.lock().fail_all(None);
                            break;
                        }
                        RaftCommand::Propose { data, response } => {
                            match self.append_as_leader(EntryKind::Command, data) {
                                Ok((index, term)) => {
                                    self.pending.lock().proposals.insert(index, (term, response));
                                    self.replicate_to_all().await;
                                }
                                Err(e) => {
                                    let _ = response.send(Err(e));
                                }
                            }
                        }
                        RaftCommand::Barrier { index, response } => {
                            let state = self.state.read();
                            if state.is_leader() {
                                drop(state);
                                self.pending.lock().barriers.push((index, response));
                            } else {
                                let leader = state.leader_id;
                                let _ = response.send(Err(KeyplaneError::NotLeader { leader }));
                            }
                        }
                        RaftCommand::AddVoter { node_id, address, response } => {
                            match self.propose_add_voter(node_id, address) {
                                Ok((index, term)) => {
                                    self.pending.lock().voters.insert(index, (term, response));
                                    self.replicate_to_all().await;
                                }
                                Err(e) => {
                                    let _ = response.send(Err(e));
                                }
                            }
                        }
                        RaftCommand::RequestVote { request, response } => {
                            let _ = response.send(self.handle_request_vote(request));
                        }
                        RaftCommand::AppendEntries { request, response } => {
                            let result = self.handle_append_entries(request);
                            if result.success {
                                election_deadline = self.reset_election_deadline();
                            }
                            let _ = response.send(result);
                        }
                        RaftCommand::InstallSnapshot { request, response } => {
                            let result = self.handle_install_snapshot(request);
                            election_deadline = self.reset_election_deadline();
                            let _ = response.send(result);
                        }
                        RaftCommand::IsLeader { response } => {
                            let _ = response.send(is_leader);
                        }
                        RaftCommand::Status { response } => {
                            let state = self.state.read();
                            let _ = response.send(RaftStatus {
                                is_leader: state.is_leader(),
                                leader_id: state.leader_id,
                                term: state.current_term(),
                                last_applied: state.volatile.last_applied,
                            });
                        }
                    }
                }

                _ = heartbeat.tick(), if is_leader => {
                    self.replicate_to_all().await;
                }

                _ = tokio::time::sleep_until(election_deadline), if !is_leader => {
                    self.start_election().await;
                    election_deadline = self.reset_election_deadline();
                }
            }

            self.apply_committed_entries();
            self.maybe_snapshot();
            self.settle_waiters();
        }
    }

    /// Append an entry locally as leader, persist it, and return its slot
    /// in the log. Replication is the caller's next step.
    fn append_as_leader(&self, kind: EntryKind, data: Vec<u8>) -> Result<(LogIndex, Term)> {
        let term = {
            let state = self.state.read();
            if !state.is_leader() {
                return Err(KeyplaneError::NotLeader {
                    leader: state.leader_id,
                });
            }
            state.current_term()
        };

        let mut log = self.log.write();
        let index = log.last_index() + 1;
        let entry = match kind {
            EntryKind::Command => LogEntry::command(term, index, data),
            EntryKind::Membership => LogEntry::membership(term, index, data),
        };
        log.append(entry.clone())?;
        self.storage.append_log_entries(&[entry])?;
        Ok((index, term))
    }

    /// Validate and append a membership entry carrying the complete new
    /// voter map.
    fn propose_add_voter(&self, node_id: NodeId, address: String) -> Result<(LogIndex, Term)> {
        if node_id == self.config.node_id || self.peers.read().contains_key(&node_id) {
            return Err(KeyplaneError::InvalidArgument(format!(
                "node {} is already a voter",
                node_id
            )));
        }

        let mut voters: HashMap<NodeId, String> = self.peers.read().clone();
        voters.insert(self.config.node_id, self.config.advertise_addr.clone());
        voters.insert(node_id, address);

        let data = bincode::serialize(&voters)?;
        let appended = self.append_as_leader(EntryKind::Membership, data)?;
        info!(
            node_id = self.config.node_id,
            new_voter = node_id,
            "proposed voter addition"
        );
        Ok(appended)
    }

    /// Handle a RequestVote RPC.
    fn handle_request_vote(&self, request: RequestVoteRequest) -> RequestVoteResponse {
        let mut state = self.state.write();
        let log = self.log.read();

        if request.term > state.current_term() {
            state.become_follower(request.term, None);
            self.persist_state(&state);
        }

        let vote_granted = if request.term < state.current_term() {
            false
        } else if state.persistent.voted_for.is_some()
            && state.persistent.voted_for != Some(request.candidate_id)
        {
            false
        } else if !log.is_up_to_date(request.last_log_index, request.last_log_term) {
            false
        } else {
            state.persistent.voted_for = Some(request.candidate_id);
            self.persist_state(&state);
            true
        };

        debug!(
            node_id = state.node_id,
            candidate = request.candidate_id,
            term = request.term,
            vote_granted,
            "handled RequestVote"
        );

        RequestVoteResponse {
            term: state.current_term(),
            vote_granted,
        }
    }

    /// Handle an AppendEntries RPC.
    fn handle_append_entries(&self, request: AppendEntriesRequest) -> AppendEntriesResponse {
        let mut state = self.state.write();
        let mut log = self.log.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }

        let applied_index = state.volatile.last_applied;

        if request.term < state.current_term() {
            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                applied_index,
                conflict_index: None,
            };
        }

        state.leader_id = Some(request.leader_id);

        if !log.matches(request.prev_log_index, request.prev_log_term) {
            // Backtracking hint: the first index of the conflicting term,
            // or just past our log if we are short.
            let conflict_index = match log.term_at(request.prev_log_index) {
                Some(conflict_term) => {
                    let mut idx = request.prev_log_index;
                    while idx > log.first_index() && log.term_at(idx - 1) == Some(conflict_term) {
                        idx -= 1;
                    }
                    idx
                }
                None => log.last_index() + 1,
            };

            return AppendEntriesResponse {
                term: state.current_term(),
                success: false,
                match_index: 0,
                applied_index,
                conflict_index: Some(conflict_index),
            };
        }

        // Skip entries we already hold; truncate on term conflicts.
        let mut new_entries = Vec::new();
        for entry in request.entries {
            match log.get(entry.index) {
                Some(existing) if existing.term == entry.term => continue,
                Some(_) => {
                    log.truncate_from(entry.index);
                    if let Err(e) = self.storage.truncate_log_from(entry.index) {
                        error!(error = %e, index = entry.index, "failed to truncate stored log");
                    }
                    new_entries.push(entry);
                }
                None => new_entries.push(entry),
            }
        }

        if !new_entries.is_empty() {
            if let Err(e) = self.storage.append_log_entries(&new_entries) {
                // Returning failure makes the leader retry.
                error!(error = %e, "failed to persist log entries");
                return AppendEntriesResponse {
                    term: state.current_term(),
                    success: false,
                    match_index: log.last_index(),
                    applied_index,
                    conflict_index: None,
                };
            }
            for entry in new_entries {
                if let Err(e) = log.append(entry) {
                    error!(error = %e, "failed to append entry to in-memory log");
                }
            }
        }

        if request.leader_commit > state.volatile.commit_index {
            state.volatile.commit_index = request.leader_commit.min(log.last_index());
        }

        AppendEntriesResponse {
            term: state.current_term(),
            success: true,
            match_index: log.last_index(),
            applied_index,
            conflict_index: None,
        }
    }

    /// Handle a single-shot InstallSnapshot RPC.
    fn handle_install_snapshot(&self, request: InstallSnapshotRequest) -> InstallSnapshotResponse {
        let mut state = self.state.write();

        if request.term > state.current_term() {
            state.become_follower(request.term, Some(request.leader_id));
            self.persist_state(&state);
        }

        if request.term < state.current_term() {
            return InstallSnapshotResponse {
                term: state.current_term(),
                success: false,
            };
        }

        state.leader_id = Some(request.leader_id);

        // Stale snapshot: we have already applied past it.
        if request.last_included_index <= state.volatile.last_applied {
            return InstallSnapshotResponse {
                term: state.current_term(),
                success: true,
            };
        }

        if let Err(e) = self.storage.save_snapshot(
            &request.data,
            request.last_included_index,
            request.last_included_term,
        ) {
            error!(error = %e, "failed to persist installed snapshot");
            return InstallSnapshotResponse {
                term: state.current_term(),
                success: false,
            };
        }

        if let Err(e) = self.state_machine.write().restore(&request.data) {
            error!(error = %e, "failed to restore state machine from snapshot");
            return InstallSnapshotResponse {
                term: state.current_term(),
                success: false,
            };
        }

        {
            let mut log = self.log.write();
            log.compact(request.last_included_index, request.last_included_term);
        }
        if let Err(e) = self.storage.compact_log(request.last_included_index) {
            error!(error = %e, "failed to compact stored log after snapshot install");
        }

        state.volatile.commit_index = state
            .volatile
            .commit_index
            .max(request.last_included_index);
        state.volatile.last_applied = request.last_included_index;

        info!(
            node_id = self.config.node_id,
            last_included_index = request.last_included_index,
            "installed snapshot"
        );

        InstallSnapshotResponse {
            term: state.current_term(),
            success: true,
        }
    }

    /// Start an election.
    async fn start_election(&self) {
        // A node that knows no peers only campaigns when bootstrapping;
        // otherwise it waits to be adopted via voter addition.
        {
            let state = self.state.read();
            if state.peers.is_empty() && !self.config.bootstrap {
                return;
            }
        }

        let (term, last_log_index, last_log_term, quorum) = {
            let mut state = self.state.write();
            let log = self.log.read();
            state.become_candidate();
            self.persist_state(&state);
            (
                state.current_term(),
                log.last_index(),
                log.last_term(),
                state.quorum_size(),
            )
        };

        info!(node_id = self.config.node_id, term, "starting election");

        let mut votes_received = 1; // self-vote
        if votes_received >= quorum {
            // Single-voter cluster.
            let last_index = self.log.read().last_index();
            self.state.write().become_leader(last_index);
            self.replicate_to_all().await;
            return;
        }

        let request = RequestVoteRequest {
            term,
            candidate_id: self.config.node_id,
            last_log_index,
            last_log_term,
        };

        let peer_ids: Vec<NodeId> = self.peers.read().keys().copied().collect();
        let vote_futures = peer_ids.into_iter().map(|peer_id| {
            let rpc = Arc::clone(&self.rpc);
            let req = request.clone();
            async move {
                match timeout(VOTE_RPC_TIMEOUT, rpc.request_vote(peer_id, req)).await {
                    Ok(Ok(response)) => Some((peer_id, response)),
                    _ => None,
                }
            }
        });

        let results = futures::future::join_all(vote_futures).await;

        for (peer_id, response) in results.into_iter().flatten() {
            let should_become_leader = {
                let mut state = self.state.write();
                if !state.state.is_candidate() || state.current_term() != term {
                    return;
                }
                if response.term > state.current_term() {
                    state.become_follower(response.term, None);
                    self.persist_state(&state);
                    return;
                }

                if response.vote_granted {
                    votes_received += 1;
                    debug!(
                        node_id = self.config.node_id,
                        voter = peer_id,
                        votes = votes_received,
                        "received vote"
                    );
                    if votes_received >= quorum {
                        let last_index = self.log.read().last_index();
                        state.become_leader(last_index);
                        true
                    } else {
                        false
                    }
                } else {
                    false
                }
            };

            if should_become_leader {
                self.replicate_to_all().await;
                return;
            }
        }
    }

    /// Replicate log entries (or a snapshot) to every follower, then
    /// advance the commit index.
    async fn replicate_to_all(&self) {
        let (term, commit_index, leader_state) = {
            let state = self.state.read();
            if !state.is_leader() {
                return;
            }
            (
                state.current_term(),
                state.volatile.commit_index,
                state.leader.clone(),
            )
        };

        let leader_state = match leader_state {
            Some(l) => l,
            None => return,
        };

        enum PeerReply {
            Append(AppendEntriesResponse),
            Snapshot(InstallSnapshotResponse, LogIndex),
        }

        let first_index = self.log.read().first_index();
        // Loaded lazily: only when some follower is behind the compaction
        // horizon.
        let mut snapshot: Option<(Vec<u8>, LogIndex, Term)> = None;

        let peer_ids: Vec<NodeId> = self.peers.read().keys().copied().collect();
        let mut replication_futures = Vec::new();

        for peer_id in peer_ids {
            let rpc = Arc::clone(&self.rpc);
            let next_index = *leader_state.next_index.get(&peer_id).unwrap_or(&1);

            if next_index < first_index {
                if snapshot.is_none() {
                    snapshot = match self.storage.load_snapshot() {
                        Ok(Some((data, meta))) => Some((data, meta.last_index, meta.last_term)),
                        Ok(None) => None,
                        Err(e) => {
                            error!(error = %e, "failed to load snapshot for follower catch-up");
                            None
                        }
                    };
                }
                let Some((data, last_index, last_term)) = snapshot.clone() else {
                    warn!(peer = peer_id, "follower behind compaction horizon but no snapshot");
                    continue;
                };

                let request = InstallSnapshotRequest {
                    term,
                    leader_id: self.config.node_id,
                    last_included_index: last_index,
                    last_included_term: last_term,
                    data,
                };
                replication_futures.push(
                    async move {
                        match timeout(SNAPSHOT_RPC_TIMEOUT, rpc.install_snapshot(peer_id, request))
                            .await
                        {
                            Ok(Ok(response)) => {
                                Some((peer_id, PeerReply::Snapshot(response, last_index)))
                            }
                            _ => None,
                        }
                    }
                    .boxed(),
                );
                continue;
            }

            let (prev_log_index, prev_log_term, entries) = {
                let log = self.log.read();
                let prev_log_index = next_index.saturating_sub(1);
                let prev_log_term = log.term_at(prev_log_index).unwrap_or(0);
                let entries =
                    log.entries_from_limit(next_index, self.config.max_entries_per_append);
                (prev_log_index, prev_log_term, entries)
            };

            let request = AppendEntriesRequest {
                term,
                leader_id: self.config.node_id,
                prev_log_index,
                prev_log_term,
                entries,
                leader_commit: commit_index,
            };

            replication_futures.push(
                async move {
                    match timeout(APPEND_RPC_TIMEOUT, rpc.append_entries(peer_id, request)).await {
                        Ok(Ok(response)) => Some((peer_id, PeerReply::Append(response))),
                        _ => None,
                    }
                }
                .boxed(),
            );
        }

        let results = futures::future::join_all(replication_futures).await;

        let mut state = self.state.write();
        if !state.is_leader() {
            return;
        }

        for (peer_id, reply) in results.into_iter().flatten() {
            let reply_term = match &reply {
                PeerReply::Append(r) => r.term,
                PeerReply::Snapshot(r, _) => r.term,
            };
            if reply_term > state.current_term() {
                state.become_follower(reply_term, None);
                self.persist_state(&state);
                return;
            }

            let Some(leader) = state.leader.as_mut() else {
                return;
            };
            match reply {
                PeerReply::Append(response) => {
                    if response.success {
                        leader.update_peer(peer_id, response.match_index, response.applied_index);
                    } else if let Some(conflict_index) = response.conflict_index {
                        leader.next_index.insert(peer_id, conflict_index.max(1));
                    } else {
                        leader.decrement_next(peer_id);
                    }
                }
                PeerReply::Snapshot(response, last_included) => {
                    if response.success {
                        leader.update_peer(peer_id, last_included, last_included);
                    }
                }
            }
        }

        let last_log_index = self.log.read().last_index();
        let new_commit = state.calculate_commit_index(last_log_index);
        if new_commit > state.volatile.commit_index {
            state.volatile.commit_index = new_commit;
            debug!(
                node_id = state.node_id,
                commit_index = new_commit,
                "advanced commit index"
            );
        }
    }

    /// Apply committed entries to the state machine, resolving pending
    /// proposals and voter additions along the way.
    fn apply_committed_entries(&self) {
        let (commit_index, last_applied) = {
            let state = self.state.read();
            (state.volatile.commit_index, state.volatile.last_applied)
        };
        if commit_index <= last_applied {
            return;
        }

        let entries = {
            let log = self.log.read();
            log.entries_range(last_applied + 1, commit_index)
        };

        for entry in entries {
            match entry.kind {
                EntryKind::Command => {
                    let result = self.state_machine.write().apply(entry.data_bytes());
                    self.state.write().volatile.last_applied = entry.index;
                    self.resolve_proposal(entry.index, entry.term, result);
                }
                EntryKind::Membership => {
                    self.apply_membership(&entry);
                    self.state.write().volatile.last_applied = entry.index;
                    self.resolve_voter_addition(entry.index, entry.term);
                }
            }
        }
    }

    /// Apply a membership entry: adopt and persist the new voter map.
    fn apply_membership(&self, entry: &LogEntry) {
        let voters: HashMap<NodeId, String> = match bincode::deserialize(entry.data_bytes()) {
            Ok(v) => v,
            Err(e) => {
                // Same stance as an undecodable command: divergence between
                // voters is worse than a crash.
                panic!("failed to decode membership entry {}: {}", entry.index, e);
            }
        };

        if let Err(e) = self.storage.save_voters(&voters) {
            error!(error = %e, "failed to persist voter map");
        }

        let mut without_self = voters;
        without_self.remove(&self.config.node_id);
        let peer_ids: Vec<NodeId> = without_self.keys().copied().collect();
        *self.peers.write() = without_self;
        self.state.write().set_peers(peer_ids.clone());

        info!(
            node_id = self.config.node_id,
            voters = ?peer_ids,
            "adopted voter map"
        );
    }

    fn resolve_proposal(&self, index: LogIndex, term: Term, result: S::Result) {
        if let Some((expected_term, tx)) = self.pending.lock().proposals.remove(&index) {
            if expected_term == term {
                let _ = tx.send(Ok((index, result)));
            } else {
                let leader = self.state.read().leader_id;
                let _ = tx.send(Err(KeyplaneError::NotLeader { leader }));
            }
        }
    }

    fn resolve_voter_addition(&self, index: LogIndex, term: Term) {
        if let Some((expected_term, tx)) = self.pending.lock().voters.remove(&index) {
            if expected_term == term {
                let _ = tx.send(Ok(()));
            } else {
                let leader = self.state.read().leader_id;
                let _ = tx.send(Err(KeyplaneError::NotLeader { leader }));
            }
        }
    }

    /// Resolve satisfied barriers; fail every waiter if leadership was
    /// lost.
    fn settle_waiters(&self) {
        let mut pending = self.pending.lock();
        if pending.is_empty() {
            return;
        }

        let state = self.state.read();
        if !state.is_leader() {
            let leader = state.leader_id;
            pending.fail_all(leader);
            return;
        }

        let min_applied = state.min_applied_index();
        drop(state);

        let mut still_waiting = Vec::new();
        for (index, tx) in std::mem::take(&mut pending.barriers) {
            if index <= min_applied {
                let _ = tx.send(Ok(()));
            } else {
                still_waiting.push((index, tx));
            }
        }
        pending.barriers = still_waiting;
    }

    /// Snapshot the state machine and compact the log once enough entries
    /// have been applied since the last snapshot.
    fn maybe_snapshot(&self) {
        let (last_applied, last_snapshot_index) = {
            let state = self.state.read();
            let log = self.log.read();
            (
                state.volatile.last_applied,
                log.first_index().saturating_sub(1),
            )
        };

        if (last_applied - last_snapshot_index) < self.config.snapshot_threshold as u64 {
            return;
        }

        let snapshot_data = match self.state_machine.read().snapshot() {
            Ok(data) => data,
            Err(e) => {
                error!(error = %e, "failed to serialize state machine snapshot");
                return;
            }
        };
        let snapshot_term = self.log.read().term_at(last_applied).unwrap_or(0);

        if let Err(e) = self
            .storage
            .save_snapshot(&snapshot_data, last_applied, snapshot_term)
        {
            error!(error = %e, "failed to save snapshot");
            return;
        }

        self.log.write().compact(last_applied, snapshot_term);
        if let Err(e) = self.storage.compact_log(last_applied) {
            error!(error = %e, "failed to compact log");
        }

        info!(node_id = self.config.node_id, last_applied, "created snapshot");
    }

    fn persist_state(&self, state: &RaftState) {
        if let Err(e) = self.storage.save_persistent_state(&state.persistent) {
            error!(error = %e, "failed to persist term/vote state");
        }
    }

    fn reset_election_deadline(&self) -> Instant {
        let timeout = rand::thread_rng().gen_range(
            self.config.election_timeout_min..=self.config.election_timeout_max,
        );
        Instant::now() + timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Records applied commands; apply result is the running count.
    #[derive(Default)]
    struct RegisterMachine {
        applied: Vec<Vec<u8>>,
    }

    impl StateMachine for RegisterMachine {
        type Result = usize;

        fn apply(&mut self, command: &[u8]) -> usize {
            self.applied.push(command.to_vec());
            self.applied.len()
        }

        fn snapshot(&self) -> Result<Vec<u8>> {
            Ok(bincode::serialize(&self.applied)?)
        }

        fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
            self.applied = bincode::deserialize(snapshot)?;
            Ok(())
        }
    }

    fn bootstrap_config() -> RaftConfig {
        RaftConfig {
            node_id: 1,
            bootstrap: true,
            election_timeout_min: Duration::from_millis(20),
            election_timeout_max: Duration::from_millis(40),
            heartbeat_interval: Duration::from_millis(10),
            ..Default::default()
        }
    }

    async fn wait_for_leadership(tx: &mpsc::Sender<RaftCommand<usize>>) {
        for _ in 0..200 {
            let (reply_tx, reply_rx) = oneshot::channel();
            tx.send(RaftCommand::IsLeader { response: reply_tx })
                .await
                .unwrap();
            if reply_rx.await.unwrap() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("node never became leader");
    }

    #[tokio::test]
    async fn new_node_starts_as_follower() {
        let dir = tempfile::tempdir().unwrap();
        let machine = Arc::new(RwLock::new(RegisterMachine::default()));
        let rpc = Arc::new(super::super::rpc::mock::MockRpc::new());
        let peers = Arc::new(RwLock::new(HashMap::new()));

        let (node, _rx) =
            RaftNode::new(RaftConfig::default(), dir.path(), machine, rpc, peers).unwrap();
        assert!(!node.state.read().is_leader());
    }

    #[tokio::test]
    async fn single_voter_bootstrap_elects_itself_and_applies() {
        let dir = tempfile::tempdir().unwrap();
        let machine = Arc::new(RwLock::new(RegisterMachine::default()));
        let rpc = Arc::new(super::super::rpc::mock::MockRpc::new());
        let peers = Arc::new(RwLock::new(HashMap::new()));

        let (node, rx) = RaftNode::new(
            bootstrap_config(),
            dir.path(),
            Arc::clone(&machine),
            rpc,
            peers,
        )
        .unwrap();
        let tx = node.command_sender();
        let handle = tokio::spawn(node.run(rx));

        wait_for_leadership(&tx).await;

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(RaftCommand::Propose {
            data: b"hello".to_vec(),
            response: reply_tx,
        })
        .await
        .unwrap();
        let (index, count) = reply_rx.await.unwrap().unwrap();
        assert_eq!(count, 1);
        assert_eq!(machine.read().applied[0], b"hello");

        // The apply barrier on a single-voter cluster resolves promptly.
        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(RaftCommand::Barrier {
            index,
            response: reply_tx,
        })
        .await
        .unwrap();
        tokio::time::timeout(Duration::from_secs(1), reply_rx)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        tx.send(RaftCommand::Shutdown).await.unwrap();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn propose_on_follower_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let machine = Arc::new(RwLock::new(RegisterMachine::default()));
        let rpc = Arc::new(super::super::rpc::mock::MockRpc::new());
        let peers = Arc::new(RwLock::new(HashMap::from([(
            2,
            "127.0.0.1:1".to_string(),
        )])));

        // Not bootstrapping and peer 2 is unreachable: stays follower.
        let config = RaftConfig {
            node_id: 1,
            bootstrap: false,
            ..Default::default()
        };
        let (node, rx) = RaftNode::new(config, dir.path(), machine, rpc, peers).unwrap();
        let tx = node.command_sender();
        let handle = tokio::spawn(node.run(rx));

        let (reply_tx, reply_rx) = oneshot::channel();
        tx.send(RaftCommand::Propose {
            data: b"x".to_vec(),
            response: reply_tx,
        })
        .await
        .unwrap();
        let err = reply_rx.await.unwrap().unwrap_err();
        assert!(matches!(err, KeyplaneError::NotLeader { .. }));

        tx.send(RaftCommand::Shutdown).await.unwrap();
        handle.await.unwrap();
    }
}
