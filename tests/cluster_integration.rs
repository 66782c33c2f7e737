//! End-to-end scenarios on in-process multi-node clusters: metadata
//! convergence, slot assignment and migration, and key routing.

#[allow(dead_code)]
mod common;

use common::{wait_until, TestCluster};
use keyplane::cluster::{slot_id_for_key, SLOT_COUNT};
use keyplane::error::ErrorCategory;
use keyplane::types::{ServerAddr, SlotId, SlotState};
use std::ops::RangeInclusive;
use std::time::Duration;

fn addrs(servers: &[&str]) -> Vec<ServerAddr> {
    servers.iter().map(|s| ServerAddr::from(*s)).collect()
}

/// Find `count` keys routed into the given slot range.
fn keys_in_slots(range: RangeInclusive<SlotId>, count: usize) -> Vec<(String, SlotId)> {
    let mut found = Vec::new();
    for i in 0u64.. {
        let key = format!("key-{}", i);
        let slot_id = slot_id_for_key(&key);
        if range.contains(&slot_id) {
            found.push((key, slot_id));
            if found.len() == count {
                break;
            }
        }
    }
    found
}

#[tokio::test]
async fn empty_cluster_has_no_groups_and_all_slots_offline() {
    let cluster = TestCluster::start(1).await;
    let leader = cluster.wait_for_leader().await;

    assert!(leader.groups(&[]).is_empty());

    let slots = leader.slots(&[]);
    assert_eq!(slots.len(), SLOT_COUNT);
    assert!(slots.iter().all(|s| {
        s.state == SlotState::Offline && s.group_id.is_none() && s.from_group_id.is_none()
    }));
}

#[tokio::test]
async fn add_group_propagates_to_followers() {
    let cluster = TestCluster::start(2).await;
    let leader = cluster.wait_for_leader().await;
    let follower = cluster.node(2);

    leader
        .add_group(1, addrs(&["server1", "server2"]))
        .await
        .unwrap();

    assert!(
        wait_until(Duration::from_millis(500), || {
            let groups = follower.groups(&[]);
            groups.len() == 1
                && groups[0].id == 1
                && groups[0].servers == addrs(&["server1", "server2"])
        })
        .await,
        "follower never observed the new group"
    );
}

#[tokio::test]
async fn assigned_slots_converge_on_every_node() {
    let cluster = TestCluster::start(2).await;
    let leader = cluster.wait_for_leader().await;

    leader.add_group(1, addrs(&["server1"])).await.unwrap();
    leader.assign_slots(1, 0, SLOT_COUNT - 1).await.unwrap();

    for node in &cluster.nodes {
        let coordinator = &node.coordinator;
        assert!(
            wait_until(Duration::from_millis(500), || {
                coordinator
                    .slots(&[])
                    .iter()
                    .all(|s| s.state == SlotState::Online && s.group_id == Some(1))
            })
            .await,
            "node {} never observed the assignment",
            node.id
        );
    }
}

#[tokio::test]
async fn migrating_a_subset_moves_ownership_and_data() {
    let cluster = TestCluster::start(2).await;
    let leader = cluster.wait_for_leader().await;

    leader
        .add_group(1, addrs(&["server1", "server2"]))
        .await
        .unwrap();
    leader.assign_slots(1, 0, SLOT_COUNT - 1).await.unwrap();

    // Seed data into slots that are about to move.
    let seeded = keys_in_slots(0..=10, 3);
    for (key, slot_id) in &seeded {
        let group = leader.get_group_by_key(key).await.unwrap();
        assert_eq!(group.id(), 1);
        group
            .insert(*slot_id, key, "member", 1, Duration::ZERO)
            .await
            .unwrap();
    }

    leader
        .add_group(2, addrs(&["server3", "server4"]))
        .await
        .unwrap();
    leader.migrate_slots(2, 0, 10).await.unwrap();

    // migrate_slots waits on the cluster-wide apply barrier for every
    // transition, so both nodes have converged by the time it returns.
    for node in &cluster.nodes {
        for slot in node.coordinator.slots(&[]) {
            if slot.id <= 10 {
                assert_eq!(
                    (slot.state, slot.group_id, slot.from_group_id),
                    (SlotState::Online, Some(2), None),
                    "slot {} on node {}",
                    slot.id,
                    node.id
                );
            } else {
                assert_eq!(
                    (slot.state, slot.group_id),
                    (SlotState::Online, Some(1)),
                    "slot {} on node {}",
                    slot.id,
                    node.id
                );
            }
        }
    }

    // The bulk copy moved the seeded keys: routing now lands on group 2
    // and the data is there.
    for (key, slot_id) in &seeded {
        let group = leader.get_group_by_key(key).await.unwrap();
        assert_eq!(group.id(), 2);
        let elements = group.select(*slot_id, key, 2).await.unwrap();
        assert_eq!(elements.len(), 1);
        assert_eq!(elements[0].member, "member");
    }
}

#[tokio::test]
async fn routing_matches_the_split_assignment_on_every_node() {
    let cluster = TestCluster::start(2).await;
    let leader = cluster.wait_for_leader().await;

    leader
        .add_group(1, addrs(&["server1", "server2"]))
        .await
        .unwrap();
    leader
        .add_group(2, addrs(&["server3", "server4"]))
        .await
        .unwrap();
    leader.assign_slots(1, 0, SLOT_COUNT / 2 - 1).await.unwrap();
    leader
        .assign_slots(2, SLOT_COUNT / 2, SLOT_COUNT - 1)
        .await
        .unwrap();

    // "foo" hashes into the lower half, "barx" into the upper half.
    assert!(slot_id_for_key("foo") < SLOT_COUNT / 2);
    assert!(slot_id_for_key("barx") >= SLOT_COUNT / 2);

    for node in &cluster.nodes {
        let coordinator = &node.coordinator;
        assert!(
            wait_until(Duration::from_millis(500), || {
                coordinator
                    .slots(&[])
                    .iter()
                    .all(|s| s.state == SlotState::Online)
            })
            .await
        );

        assert_eq!(coordinator.get_group_by_key("foo").await.unwrap().id(), 1);
        assert_eq!(coordinator.get_group_by_key("barx").await.unwrap().id(), 2);
        // Routing is a pure function of the current metadata.
        assert_eq!(coordinator.get_group_by_key("foo").await.unwrap().id(), 1);
    }
}

#[tokio::test]
async fn nodes_hold_identical_state_after_a_command_series() {
    let cluster = TestCluster::start(3).await;
    let leader = cluster.wait_for_leader().await;

    leader.add_group(1, addrs(&["server1"])).await.unwrap();
    leader.add_group(2, addrs(&["server2"])).await.unwrap();
    leader.add_group(3, addrs(&["server3"])).await.unwrap();
    leader.assign_slots(1, 0, 99).await.unwrap();
    leader.assign_slots(2, 100, 199).await.unwrap();
    leader.del_group(3).await.unwrap();
    leader.migrate_slots(2, 0, 9).await.unwrap();

    let reference_slots = leader.slots(&[]);
    let reference_groups = leader.groups(&[]);
    assert_eq!(reference_groups.len(), 2);

    for node in &cluster.nodes {
        let coordinator = &node.coordinator;
        assert!(
            wait_until(Duration::from_millis(500), || {
                coordinator.slots(&[]) == reference_slots
                    && coordinator.groups(&[]) == reference_groups
            })
            .await,
            "node {} diverged",
            node.id
        );
    }
}

#[tokio::test]
async fn deleting_a_group_offlines_its_slots_everywhere() {
    let cluster = TestCluster::start(2).await;
    let leader = cluster.wait_for_leader().await;

    leader.add_group(1, addrs(&["server1"])).await.unwrap();
    leader.add_group(2, addrs(&["server2"])).await.unwrap();
    leader.assign_slots(1, 0, 10).await.unwrap();
    leader.del_group(1).await.unwrap();

    for node in &cluster.nodes {
        let coordinator = &node.coordinator;
        assert!(
            wait_until(Duration::from_millis(500), || {
                let groups = coordinator.groups(&[]);
                groups.len() == 1 && groups[0].id == 2
            })
            .await
        );
        for slot in coordinator.slots(&[]) {
            assert_ne!(slot.group_id, Some(1));
            assert_ne!(slot.from_group_id, Some(1));
            assert_eq!(slot.state, SlotState::Offline);
        }
    }
}

#[tokio::test]
async fn migrating_to_the_owning_group_emits_no_log_entries() {
    let cluster = TestCluster::start(1).await;
    let leader = cluster.wait_for_leader().await;

    leader.add_group(1, addrs(&["server1"])).await.unwrap();
    leader.assign_slots(1, 0, SLOT_COUNT - 1).await.unwrap();

    let before = leader.status().await.unwrap().last_applied;
    leader.migrate_slots(1, 0, 10).await.unwrap();
    let after = leader.status().await.unwrap().last_applied;

    assert_eq!(before, after, "no-op migration must not replicate entries");
    assert!(leader
        .slots(&[])
        .iter()
        .all(|s| s.state == SlotState::Online && s.group_id == Some(1)));
}

#[tokio::test]
async fn migrating_an_offline_slot_fails() {
    let cluster = TestCluster::start(1).await;
    let leader = cluster.wait_for_leader().await;

    leader.add_group(1, addrs(&["server1"])).await.unwrap();

    let err = leader.migrate_slots(1, 0, 0).await.unwrap_err();
    assert_eq!(err.to_string(), "slot 0 is offline");
}

#[tokio::test]
async fn routing_an_offline_slot_fails_as_unroutable() {
    let cluster = TestCluster::start(1).await;
    let leader = cluster.wait_for_leader().await;

    let err = leader.get_group_by_key("foo").await.unwrap_err();
    assert_eq!(err.to_string(), "slot is offline");
    assert_eq!(err.category(), ErrorCategory::SlotNotRoutable);
}

#[tokio::test]
async fn mutations_on_a_follower_are_rejected() {
    let cluster = TestCluster::start(2).await;
    let _leader = cluster.wait_for_leader().await;
    let follower = cluster.node(2);

    let err = follower
        .add_group(1, addrs(&["server1"]))
        .await
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::NotLeader);
}

#[tokio::test]
async fn joining_an_existing_voter_is_rejected() {
    let cluster = TestCluster::start(2).await;
    let leader = cluster.wait_for_leader().await;

    let err = leader.join(2, "mesh://2").await.unwrap_err();
    assert_eq!(err.category(), ErrorCategory::InvalidArg);
}

#[tokio::test]
async fn a_late_joiner_catches_up_with_history() {
    let mut cluster = TestCluster::start(2).await;
    let leader = cluster.wait_for_leader().await;

    leader
        .add_group(1, addrs(&["server1", "server2"]))
        .await
        .unwrap();
    leader.assign_slots(1, 0, SLOT_COUNT - 1).await.unwrap();

    let joined = cluster.grow().await;
    let reference_slots = leader.slots(&[]);
    let reference_groups = leader.groups(&[]);

    let newcomer = cluster.node(joined);
    assert!(
        wait_until(Duration::from_secs(2), || {
            newcomer.slots(&[]) == reference_slots && newcomer.groups(&[]) == reference_groups
        })
        .await,
        "late joiner never caught up"
    );
}
