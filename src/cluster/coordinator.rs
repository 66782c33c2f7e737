//! The cluster coordinator: public API of the metadata core.
//!
//! The coordinator owns the shared [`ClusterStore`], feeds mutations
//! through the consensus log, and drives the slot migration protocol. All
//! mutations are leader-only; reads are served from the local store and
//! may trail the leader by replication latency.

use super::command::{ClusterCommand, CommandResult};
use super::group::{Group, NewGroup};
use super::store::{ClusterStore, GroupView, SlotView};
use super::{slot_id_for_key, SLOT_COUNT};
use crate::config::RaftSettings;
use crate::error::{KeyplaneError, Result};
use crate::raft::{RaftCommand, RaftConfig, RaftNode, RaftRpc, RaftStatus};
use crate::types::{GroupId, NodeId, ServerAddr, SlotId, SlotState};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::timeout;
use tracing::info;

/// Commands flowing to this node's raft core.
pub(crate) type RaftHandle = mpsc::Sender<RaftCommand<CommandResult>>;

/// Cluster metadata coordinator.
pub struct Coordinator {
    node_id: NodeId,
    store: Arc<RwLock<ClusterStore>>,
    command_tx: RaftHandle,
    propose_timeout: Duration,
}

impl Coordinator {
    /// Open the coordinator: recover consensus state from `data_dir`,
    /// start the raft node, and expose the metadata API.
    ///
    /// With `enable_single` set and no existing peers, this node
    /// bootstraps a fresh single-voter cluster and becomes its leader;
    /// otherwise it waits to be adopted via [`Coordinator::join`] issued
    /// on the current leader. `local_id` is this node's identity within
    /// the metadata cluster.
    pub fn open(
        enable_single: bool,
        local_id: NodeId,
        settings: &RaftSettings,
        data_dir: &Path,
        new_group: NewGroup,
        rpc: Arc<dyn RaftRpc>,
        peer_addrs: Arc<RwLock<HashMap<NodeId, String>>>,
    ) -> Result<Self> {
        let store = Arc::new(RwLock::new(ClusterStore::new(new_group)));

        let raft_config = RaftConfig {
            node_id: local_id,
            advertise_addr: settings.bind_addr.to_string(),
            peers: settings.peers.clone(),
            bootstrap: enable_single,
            election_timeout_min: settings.election_timeout_min,
            election_timeout_max: settings.election_timeout_max,
            heartbeat_interval: settings.heartbeat_interval,
            snapshot_threshold: settings.snapshot_threshold,
            ..RaftConfig::default()
        };

        let (node, command_rx) =
            RaftNode::new(raft_config, data_dir, Arc::clone(&store), rpc, peer_addrs)?;
        let command_tx = node.command_sender();
        tokio::spawn(node.run(command_rx));

        Ok(Self {
            node_id: local_id,
            store,
            command_tx,
            propose_timeout: settings.propose_timeout,
        })
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    /// The raft command channel, for the transport layer's RPC handlers.
    pub fn raft_handle(&self) -> RaftHandle {
        self.command_tx.clone()
    }

    /// Create (or overwrite) a replica group. Does not wait for follower
    /// apply.
    pub async fn add_group(&self, group_id: GroupId, servers: Vec<ServerAddr>) -> Result<()> {
        if servers.is_empty() {
            return Err(KeyplaneError::InvalidArgument(
                "a group needs at least one server".to_string(),
            ));
        }
        self.submit(ClusterCommand::AddGroup { group_id, servers }, false)
            .await
    }

    /// Delete a group, offlining every slot it owns. Does not wait for
    /// follower apply.
    pub async fn del_group(&self, group_id: GroupId) -> Result<()> {
        self.submit(ClusterCommand::DelGroup { group_id }, false)
            .await
    }

    /// Bring slots `[start_slot_id, stop_slot_id]` online under a group.
    /// Does not wait for follower apply.
    pub async fn assign_slots(
        &self,
        to_group_id: GroupId,
        start_slot_id: SlotId,
        stop_slot_id: SlotId,
    ) -> Result<()> {
        self.check_slot_range(start_slot_id, stop_slot_id)?;
        self.submit(
            ClusterCommand::AssignSlots {
                group_id: to_group_id,
                start_slot_id,
                stop_slot_id,
            },
            false,
        )
        .await
    }

    /// Migrate slots `[start_slot_id, stop_slot_id]` to a group, one slot
    /// at a time, without losing availability.
    ///
    /// Per slot the orchestration is:
    ///
    /// 1. `PreMigration` is replicated and waited on cluster-wide: from
    ///    here, every routing reader of the slot blocks at the barrier.
    /// 2. `InMigration` is replicated and waited on cluster-wide: blocked
    ///    readers wake seeing destination and source, pulling their keys
    ///    on demand.
    /// 3. The source group bulk-copies the slot to the destination.
    /// 4. `Online` seals the move.
    ///
    /// Blocking; returns after every requested slot has moved. Errors
    /// propagate immediately without internal retries.
    pub async fn migrate_slots(
        &self,
        to_group_id: GroupId,
        start_slot_id: SlotId,
        stop_slot_id: SlotId,
    ) -> Result<()> {
        self.check_slot_range(start_slot_id, stop_slot_id)?;

        for slot_id in start_slot_id..=stop_slot_id {
            let slot = { self.store.read().slot(slot_id) }.ok_or_else(|| {
                KeyplaneError::Internal(format!("slot {} missing from store", slot_id))
            })?;

            match slot.state() {
                SlotState::Offline => return Err(KeyplaneError::SlotOffline(slot_id)),
                SlotState::PreMigration | SlotState::InMigration => {
                    return Err(KeyplaneError::SlotInMigration(slot_id))
                }
                SlotState::Online => {}
            }

            if slot.group().map(|g| g.id()) == Some(to_group_id) {
                // Already owned by the destination; nothing to replicate.
                continue;
            }

            self.change_slot_state(to_group_id, slot_id, SlotState::PreMigration)
                .await?;
            self.change_slot_state(to_group_id, slot_id, SlotState::InMigration)
                .await?;

            // The applies above updated the local slot.
            let to = slot.group().ok_or_else(|| {
                KeyplaneError::Internal(format!("migrating slot {} has no destination", slot_id))
            })?;
            let from = slot.from_group().ok_or_else(|| {
                KeyplaneError::Internal(format!("migrating slot {} has no source", slot_id))
            })?;

            info!(
                slot_id,
                from_group = from.id(),
                to_group = to.id(),
                "bulk-copying slot"
            );
            from.migrate_slot(to.as_ref(), slot_id).await?;

            self.change_slot_state(to_group_id, slot_id, SlotState::Online)
                .await?;
        }

        Ok(())
    }

    /// Find the group that manages the slot `key` belongs to.
    ///
    /// May block briefly while the slot sits in `PreMigration`. If the
    /// slot is migrating, the key is pulled from the source group first,
    /// so the caller's subsequent operation against the returned group
    /// sees up-to-date data.
    pub async fn get_group_by_key(&self, key: &str) -> Result<Arc<dyn Group>> {
        let slot_id = slot_id_for_key(key);
        let slot = { self.store.read().slot(slot_id) }.ok_or_else(|| {
            KeyplaneError::Internal(format!("slot {} missing from store", slot_id))
        })?;

        let (group, from) = slot.working_groups().await?;

        if let Some(from) = from {
            let keys = [key.to_string()];
            from.migrate_keys(group.as_ref(), slot_id, &keys).await?;
        }

        Ok(group)
    }

    /// Local snapshot views of the given slots (all when `ids` is empty).
    pub fn slots(&self, ids: &[SlotId]) -> Vec<SlotView> {
        self.store.read().slots_view(ids)
    }

    /// Local snapshot views of the given groups (all when `ids` is empty).
    pub fn groups(&self, ids: &[GroupId]) -> Vec<GroupView> {
        self.store.read().groups_view(ids)
    }

    /// Add a node as a voter of the metadata cluster. Leader-only; the
    /// node must be reachable at `addr` for raft RPCs.
    pub async fn join(&self, node_id: NodeId, addr: impl Into<String>) -> Result<()> {
        let address = addr.into();
        info!(node_id, address = %address, "received request to join the metadata cluster");

        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::AddVoter {
                node_id,
                address,
                response: tx,
            })
            .await
            .map_err(|_| KeyplaneError::Consensus("raft node unavailable".into()))?;

        timeout(self.propose_timeout, rx)
            .await
            .map_err(|_| KeyplaneError::Timeout(self.propose_timeout))?
            .map_err(|_| KeyplaneError::Consensus("raft node dropped the request".into()))?
    }

    pub async fn is_leader(&self) -> bool {
        let (tx, rx) = oneshot::channel();
        if self
            .command_tx
            .send(RaftCommand::IsLeader { response: tx })
            .await
            .is_err()
        {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// This node's consensus status.
    pub async fn status(&self) -> Result<RaftStatus> {
        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Status { response: tx })
            .await
            .map_err(|_| KeyplaneError::Consensus("raft node unavailable".into()))?;
        rx.await
            .map_err(|_| KeyplaneError::Consensus("raft node unavailable".into()))
    }

    /// Stop the underlying raft node.
    pub async fn close(&self) {
        let _ = self.command_tx.send(RaftCommand::Shutdown).await;
    }

    async fn change_slot_state(
        &self,
        group_id: GroupId,
        slot_id: SlotId,
        slot_state: SlotState,
    ) -> Result<()> {
        self.submit(
            ClusterCommand::ChangeSlotState {
                group_id,
                slot_id,
                slot_state,
            },
            true,
        )
        .await
    }

    /// Replicate a command. Always waits for leader-local commit+apply and
    /// surfaces a state machine rejection; with `wait` it additionally
    /// waits until the entry is applied on every voter.
    async fn submit(&self, command: ClusterCommand, wait: bool) -> Result<()> {
        let data = command.encode()?;

        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Propose { data, response: tx })
            .await
            .map_err(|_| KeyplaneError::Consensus("raft node unavailable".into()))?;

        let (index, result) = timeout(self.propose_timeout, rx)
            .await
            .map_err(|_| KeyplaneError::Timeout(self.propose_timeout))?
            .map_err(|_| KeyplaneError::Consensus("raft node dropped the proposal".into()))??;

        if let CommandResult::Rejected { message } = result {
            return Err(KeyplaneError::CommandRejected(message));
        }

        if !wait {
            return Ok(());
        }

        let (tx, rx) = oneshot::channel();
        self.command_tx
            .send(RaftCommand::Barrier {
                index,
                response: tx,
            })
            .await
            .map_err(|_| KeyplaneError::Consensus("raft node unavailable".into()))?;

        timeout(self.propose_timeout, rx)
            .await
            .map_err(|_| KeyplaneError::Timeout(self.propose_timeout))?
            .map_err(|_| KeyplaneError::Consensus("raft node dropped the barrier".into()))?
    }

    fn check_slot_range(&self, start_slot_id: SlotId, stop_slot_id: SlotId) -> Result<()> {
        for id in [start_slot_id, stop_slot_id] {
            if id >= SLOT_COUNT {
                return Err(KeyplaneError::SlotIdOutOfRange {
                    id: id as i64,
                    max: SLOT_COUNT,
                });
            }
        }
        Ok(())
    }
}
