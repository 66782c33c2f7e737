//! The replicated metadata store.
//!
//! `ClusterStore` is the state machine driven by the consensus log. Every
//! node applies the same committed [`ClusterCommand`]s in the same order,
//! so the groups map and the slot array converge on every replica. Reads
//! are served from the local copy without consulting the log.

use super::command::{ClusterCommand, CommandResult};
use super::group::{Group, NewGroup};
use super::slot::Slot;
use super::SLOT_COUNT;
use crate::error::{KeyplaneError, Result};
use crate::raft::StateMachine;
use crate::types::{GroupId, ServerAddr, SlotId, SlotState};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use tracing::debug;

/// Snapshot view of one slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SlotView {
    pub id: SlotId,
    pub state: SlotState,
    pub group_id: Option<GroupId>,
    pub from_group_id: Option<GroupId>,
}

/// Snapshot view of one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupView {
    pub id: GroupId,
    pub servers: Vec<ServerAddr>,
}

/// Persisted form of one slot.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SlotRecord {
    state: SlotState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    group_id: Option<GroupId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    from_group_id: Option<GroupId>,
}

/// Persisted form of one group.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct GroupRecord {
    servers: Vec<ServerAddr>,
}

/// Persisted form of the whole store. `BTreeMap` keeps the serialized
/// form deterministic across nodes.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct ClusterSnapshot {
    slots: BTreeMap<SlotId, SlotRecord>,
    groups: BTreeMap<GroupId, GroupRecord>,
}

/// The cluster metadata state machine.
pub struct ClusterStore {
    /// The fixed slot array. Allocated once; `restore` rewrites the slots
    /// in place so barrier waiters survive snapshot installation.
    slots: Vec<Arc<Slot>>,
    groups: HashMap<GroupId, Arc<dyn Group>>,
    new_group: NewGroup,
}

impl ClusterStore {
    pub fn new(new_group: NewGroup) -> Self {
        Self {
            slots: (0..SLOT_COUNT).map(|id| Arc::new(Slot::offline(id))).collect(),
            groups: HashMap::new(),
            new_group,
        }
    }

    pub fn slot(&self, id: SlotId) -> Option<Arc<Slot>> {
        self.slots.get(id).cloned()
    }

    pub fn group(&self, id: GroupId) -> Option<Arc<dyn Group>> {
        self.groups.get(&id).cloned()
    }

    /// Views of the given slots; all slots when `ids` is empty.
    pub fn slots_view(&self, ids: &[SlotId]) -> Vec<SlotView> {
        let view = |slot: &Arc<Slot>| {
            let (state, group_id, from_group_id) = slot.snapshot_ids();
            SlotView {
                id: slot.id(),
                state,
                group_id,
                from_group_id,
            }
        };
        if ids.is_empty() {
            self.slots.iter().map(view).collect()
        } else {
            ids.iter()
                .filter_map(|&id| self.slots.get(id))
                .map(view)
                .collect()
        }
    }

    /// Views of the given groups; all groups (ordered by id) when `ids`
    /// is empty.
    pub fn groups_view(&self, ids: &[GroupId]) -> Vec<GroupView> {
        let view = |group: &Arc<dyn Group>| GroupView {
            id: group.id(),
            servers: group.servers(),
        };
        if ids.is_empty() {
            let mut views: Vec<_> = self.groups.values().map(view).collect();
            views.sort_by_key(|g| g.id);
            views
        } else {
            ids.iter()
                .filter_map(|id| self.groups.get(id))
                .map(view)
                .collect()
        }
    }

    /// Apply one committed command.
    pub fn apply_command(&mut self, command: &ClusterCommand) -> Result<()> {
        debug!(?command, "applying cluster command");
        match command {
            ClusterCommand::AddGroup { group_id, servers } => {
                self.apply_add_group(*group_id, servers.clone())
            }
            ClusterCommand::DelGroup { group_id } => self.apply_del_group(*group_id),
            ClusterCommand::AssignSlots {
                group_id,
                start_slot_id,
                stop_slot_id,
            } => self.apply_assign_slots(*group_id, *start_slot_id, *stop_slot_id),
            ClusterCommand::ChangeSlotState {
                group_id,
                slot_id,
                slot_state,
            } => self.apply_change_slot_state(*group_id, *slot_id, *slot_state),
        }
    }

    fn get_group(&self, group_id: GroupId) -> Result<Arc<dyn Group>> {
        self.groups
            .get(&group_id)
            .cloned()
            .ok_or(KeyplaneError::GroupNotFound(group_id))
    }

    /// Insert a freshly constructed group. Overwriting an existing id is
    /// accepted; the leader's retries make this idempotent.
    fn apply_add_group(&mut self, group_id: GroupId, servers: Vec<ServerAddr>) -> Result<()> {
        let group = (self.new_group)(group_id, servers);
        self.groups.insert(group_id, group);
        Ok(())
    }

    /// Remove a group, offlining every slot it owns first so no slot is
    /// left referencing it.
    fn apply_del_group(&mut self, group_id: GroupId) -> Result<()> {
        self.get_group(group_id)?;

        for slot in &self.slots {
            if slot.group().map(|g| g.id()) == Some(group_id) {
                slot.mark_offline()?;
            }
        }

        self.groups.remove(&group_id);
        Ok(())
    }

    fn apply_assign_slots(
        &mut self,
        group_id: GroupId,
        start_slot_id: SlotId,
        stop_slot_id: SlotId,
    ) -> Result<()> {
        if start_slot_id >= SLOT_COUNT || stop_slot_id >= SLOT_COUNT {
            return Err(KeyplaneError::InvalidArgument(format!(
                "slot range [{}, {}] exceeds [0, {})",
                start_slot_id, stop_slot_id, SLOT_COUNT
            )));
        }

        let group = self.get_group(group_id)?;
        for slot_id in start_slot_id..=stop_slot_id {
            self.slots[slot_id].mark_online(Arc::clone(&group))?;
        }
        Ok(())
    }

    fn apply_change_slot_state(
        &mut self,
        group_id: GroupId,
        slot_id: SlotId,
        slot_state: SlotState,
    ) -> Result<()> {
        let group = self.get_group(group_id)?;
        let slot = self
            .slots
            .get(slot_id)
            .ok_or(KeyplaneError::InvalidArgument(format!(
                "slot id {} is not in [0, {})",
                slot_id, SLOT_COUNT
            )))?;

        match slot_state {
            SlotState::PreMigration => slot.mark_pre_migration(group),
            SlotState::InMigration => slot.mark_in_migration(),
            SlotState::Online => slot.mark_online(group),
            SlotState::Offline => Err(KeyplaneError::InvalidArgument(
                "cannot change slot state to offline directly".to_string(),
            )),
        }
    }
}

impl StateMachine for ClusterStore {
    type Result = CommandResult;

    fn apply(&mut self, command: &[u8]) -> CommandResult {
        let command = match ClusterCommand::decode(command) {
            Ok(command) => command,
            // An entry this node cannot decode would silently diverge its
            // state from the rest of the cluster; crash instead.
            Err(e) => panic!("undecodable committed cluster command: {}", e),
        };
        self.apply_command(&command).into()
    }

    fn snapshot(&self) -> Result<Vec<u8>> {
        let mut snapshot = ClusterSnapshot::default();

        for slot in &self.slots {
            let (state, group_id, from_group_id) = slot.snapshot_ids();
            snapshot.slots.insert(
                slot.id(),
                SlotRecord {
                    state,
                    group_id,
                    from_group_id,
                },
            );
        }

        for (&id, group) in &self.groups {
            snapshot.groups.insert(
                id,
                GroupRecord {
                    servers: group.servers(),
                },
            );
        }

        Ok(serde_json::to_vec(&snapshot)?)
    }

    fn restore(&mut self, snapshot: &[u8]) -> Result<()> {
        let snapshot: ClusterSnapshot = serde_json::from_slice(snapshot)?;

        // Groups first: slot records are resolved against the restored map.
        let mut groups: HashMap<GroupId, Arc<dyn Group>> = HashMap::new();
        for (id, record) in snapshot.groups {
            groups.insert(id, (self.new_group)(id, record.servers));
        }

        let resolve = |id: Option<GroupId>| -> Result<Option<Arc<dyn Group>>> {
            match id {
                None => Ok(None),
                Some(id) => groups
                    .get(&id)
                    .cloned()
                    .map(Some)
                    .ok_or(KeyplaneError::Internal(format!(
                        "snapshot references unknown group {}",
                        id
                    ))),
            }
        };

        for slot in &self.slots {
            match snapshot.slots.get(&slot.id()) {
                Some(record) => slot.restore(
                    record.state,
                    resolve(record.group_id)?,
                    resolve(record.from_group_id)?,
                ),
                None => slot.restore(SlotState::Offline, None, None),
            }
        }

        self.groups = groups;
        Ok(())
    }
}
