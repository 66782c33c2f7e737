//! Per-slot state machine with the migration barrier.
//!
//! A slot moves through four states:
//!
//! ```text
//!             mark_online                mark_pre_migration
//!   Offline --------------> Online -------------------------> PreMigration
//!      ^                      ^  |                                  |
//!      |     mark_offline     |  +----------------------------+    | mark_in_migration
//!      +----------------------+                               |    v
//!                                        mark_online       InMigration
//! ```
//!
//! The barrier is the correctness device for live migration: routing
//! readers calling [`Slot::working_groups`] are suspended while the slot is
//! in `PreMigration` and wake atomically on the transition to
//! `InMigration`, at which point they observe both the destination and the
//! source group and can force a per-key migration before proceeding.

use super::group::Group;
use crate::error::{KeyplaneError, Result};
use crate::types::{GroupId, SlotId, SlotState};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::Notify;

/// One logical shard.
pub struct Slot {
    id: SlotId,
    inner: RwLock<SlotInner>,
    /// Signalled on the PreMigration -> InMigration transition.
    migration_started: Notify,
}

struct SlotInner {
    state: SlotState,
    /// The owning group, or the destination while migrating.
    group: Option<Arc<dyn Group>>,
    /// The source group while migrating; `None` otherwise.
    from_group: Option<Arc<dyn Group>>,
}

impl Slot {
    pub fn new(
        id: SlotId,
        state: SlotState,
        group: Option<Arc<dyn Group>>,
        from_group: Option<Arc<dyn Group>>,
    ) -> Self {
        Self {
            id,
            inner: RwLock::new(SlotInner {
                state,
                group,
                from_group,
            }),
            migration_started: Notify::new(),
        }
    }

    pub fn offline(id: SlotId) -> Self {
        Self::new(id, SlotState::Offline, None, None)
    }

    pub fn id(&self) -> SlotId {
        self.id
    }

    pub fn state(&self) -> SlotState {
        self.inner.read().state
    }

    pub fn group(&self) -> Option<Arc<dyn Group>> {
        self.inner.read().group.clone()
    }

    pub fn from_group(&self) -> Option<Arc<dyn Group>> {
        self.inner.read().from_group.clone()
    }

    /// `(state, group id, source group id)` in one consistent read.
    pub fn snapshot_ids(&self) -> (SlotState, Option<GroupId>, Option<GroupId>) {
        let inner = self.inner.read();
        (
            inner.state,
            inner.group.as_ref().map(|g| g.id()),
            inner.from_group.as_ref().map(|g| g.id()),
        )
    }

    /// Take the slot offline. Only an online slot can go offline.
    pub fn mark_offline(&self) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.state != SlotState::Online {
            return Err(KeyplaneError::SlotTransition {
                from: inner.state,
                to: SlotState::Offline,
            });
        }
        inner.state = SlotState::Offline;
        inner.group = None;
        inner.from_group = None;
        Ok(())
    }

    /// Bring the slot online under `group`. Legal from `Offline`
    /// (assignment) and from `InMigration` (migration completion).
    pub fn mark_online(&self, group: Arc<dyn Group>) -> Result<()> {
        let mut inner = self.inner.write();
        match inner.state {
            SlotState::Offline | SlotState::InMigration => {
                inner.state = SlotState::Online;
                inner.group = Some(group);
                inner.from_group = None;
                Ok(())
            }
            from => Err(KeyplaneError::SlotTransition {
                from,
                to: SlotState::Online,
            }),
        }
    }

    /// Announce a migration to `group`. The current owner becomes the
    /// source; routing readers start blocking at the barrier.
    pub fn mark_pre_migration(&self, group: Arc<dyn Group>) -> Result<()> {
        let mut inner = self.inner.write();
        if inner.state != SlotState::Online {
            return Err(KeyplaneError::SlotTransition {
                from: inner.state,
                to: SlotState::PreMigration,
            });
        }
        inner.state = SlotState::PreMigration;
        inner.from_group = inner.group.take();
        inner.group = Some(group);
        Ok(())
    }

    /// Start the migration and release every reader blocked at the
    /// barrier.
    pub fn mark_in_migration(&self) -> Result<()> {
        {
            let mut inner = self.inner.write();
            if inner.state != SlotState::PreMigration {
                return Err(KeyplaneError::SlotTransition {
                    from: inner.state,
                    to: SlotState::InMigration,
                });
            }
            inner.state = SlotState::InMigration;
        }
        self.migration_started.notify_waiters();
        Ok(())
    }

    /// The group(s) a routing reader must work with right now.
    ///
    /// - `Offline`: fails with "slot is offline".
    /// - `Online`: `(owner, None)`.
    /// - `PreMigration`: suspends until the slot enters `InMigration`,
    ///   then behaves like that case.
    /// - `InMigration`: `(destination, Some(source))` — the caller is
    ///   expected to pull its key from the source before operating on the
    ///   destination.
    pub async fn working_groups(&self) -> Result<(Arc<dyn Group>, Option<Arc<dyn Group>>)> {
        loop {
            // Created before the state check: a wake between the check and
            // the await below still completes this future.
            let migration_started = self.migration_started.notified();
            {
                let inner = self.inner.read();
                match inner.state {
                    SlotState::Offline => return Err(KeyplaneError::SlotUnroutable),
                    SlotState::Online | SlotState::InMigration => {
                        let group = inner.group.clone().ok_or_else(|| {
                            KeyplaneError::Internal(format!(
                                "{} slot {} has no group",
                                inner.state, self.id
                            ))
                        })?;
                        return Ok((group, inner.from_group.clone()));
                    }
                    SlotState::PreMigration => {}
                }
            }
            migration_started.await;
        }
    }

    /// Overwrite the slot from a snapshot record, in place so that the
    /// slot object (and any barrier waiter) survives restoration. Waiters
    /// are woken to re-evaluate against the restored state.
    pub(crate) fn restore(
        &self,
        state: SlotState,
        group: Option<Arc<dyn Group>>,
        from_group: Option<Arc<dyn Group>>,
    ) {
        {
            let mut inner = self.inner.write();
            inner.state = state;
            inner.group = group;
            inner.from_group = from_group;
        }
        self.migration_started.notify_waiters();
    }
}

impl std::fmt::Debug for Slot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let (state, group, from_group) = self.snapshot_ids();
        f.debug_struct("Slot")
            .field("id", &self.id)
            .field("state", &state)
            .field("group", &group)
            .field("from_group", &from_group)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::super::testutil::StubGroup;
    use super::*;
    use std::time::Duration;

    fn group(id: GroupId) -> Arc<dyn Group> {
        Arc::new(StubGroup::new(id, &["server"]))
    }

    /// A slot in each of the four states, with invariant-consistent
    /// references: group 2 is the destination, group 1 the source.
    fn slot_in(state: SlotState) -> Slot {
        match state {
            SlotState::Offline => Slot::new(0, state, None, None),
            SlotState::Online => Slot::new(0, state, Some(group(1)), None),
            SlotState::PreMigration | SlotState::InMigration => {
                Slot::new(0, state, Some(group(2)), Some(group(1)))
            }
        }
    }

    const ALL_STATES: [SlotState; 4] = [
        SlotState::Offline,
        SlotState::Online,
        SlotState::PreMigration,
        SlotState::InMigration,
    ];

    #[test]
    fn mark_offline_transitions() {
        for from in ALL_STATES {
            let slot = slot_in(from);
            let before = slot.snapshot_ids();
            let result = slot.mark_offline();

            if from == SlotState::Online {
                result.unwrap();
                assert_eq!(slot.snapshot_ids(), (SlotState::Offline, None, None));
            } else {
                let err = result.unwrap_err();
                assert_eq!(
                    err.to_string(),
                    format!("cannot change {} slot to offline", from)
                );
                // A denied transition must not mutate the slot.
                assert_eq!(slot.snapshot_ids(), before);
            }
        }
    }

    #[test]
    fn mark_online_transitions() {
        for from in ALL_STATES {
            let slot = slot_in(from);
            let before = slot.snapshot_ids();
            let result = slot.mark_online(group(2));

            match from {
                SlotState::Offline | SlotState::InMigration => {
                    result.unwrap();
                    assert_eq!(slot.snapshot_ids(), (SlotState::Online, Some(2), None));
                }
                _ => {
                    let err = result.unwrap_err();
                    assert_eq!(
                        err.to_string(),
                        format!("cannot change {} slot to online", from)
                    );
                    assert_eq!(slot.snapshot_ids(), before);
                }
            }
        }
    }

    #[test]
    fn mark_pre_migration_transitions() {
        for from in ALL_STATES {
            let slot = slot_in(from);
            let before = slot.snapshot_ids();
            let result = slot.mark_pre_migration(group(2));

            if from == SlotState::Online {
                result.unwrap();
                // The old owner became the source.
                assert_eq!(
                    slot.snapshot_ids(),
                    (SlotState::PreMigration, Some(2), Some(1))
                );
            } else {
                let err = result.unwrap_err();
                assert_eq!(
                    err.to_string(),
                    format!("cannot change {} slot to pre-migration", from)
                );
                assert_eq!(slot.snapshot_ids(), before);
            }
        }
    }

    #[test]
    fn mark_in_migration_transitions() {
        for from in ALL_STATES {
            let slot = slot_in(from);
            let before = slot.snapshot_ids();
            let result = slot.mark_in_migration();

            if from == SlotState::PreMigration {
                result.unwrap();
                assert_eq!(
                    slot.snapshot_ids(),
                    (SlotState::InMigration, Some(2), Some(1))
                );
            } else {
                let err = result.unwrap_err();
                assert_eq!(
                    err.to_string(),
                    format!("cannot change {} slot to in-migration", from)
                );
                assert_eq!(slot.snapshot_ids(), before);
            }
        }
    }

    #[tokio::test]
    async fn working_groups_offline_fails() {
        let slot = slot_in(SlotState::Offline);
        let err = slot.working_groups().await.unwrap_err();
        assert_eq!(err.to_string(), "slot is offline");
    }

    #[tokio::test]
    async fn working_groups_online_returns_owner_immediately() {
        let slot = slot_in(SlotState::Online);
        let start = tokio::time::Instant::now();
        let (g, from) = slot.working_groups().await.unwrap();
        assert!(start.elapsed() < Duration::from_millis(10));
        assert_eq!(g.id(), 1);
        assert!(from.is_none());
    }

    #[tokio::test]
    async fn working_groups_in_migration_returns_both_immediately() {
        let slot = slot_in(SlotState::InMigration);
        let (g, from) = slot.working_groups().await.unwrap();
        assert_eq!(g.id(), 2);
        assert_eq!(from.unwrap().id(), 1);
    }

    #[tokio::test]
    async fn working_groups_blocks_until_in_migration() {
        let slot = Arc::new(slot_in(SlotState::PreMigration));

        let marker = Arc::clone(&slot);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            marker.mark_in_migration().unwrap();
        });

        let start = tokio::time::Instant::now();
        let (g, from) = slot.working_groups().await.unwrap();
        // The call must have been held at the barrier until the
        // transition, then released promptly.
        assert!(start.elapsed() >= Duration::from_millis(20));
        assert!(start.elapsed() < Duration::from_secs(1));
        assert_eq!(g.id(), 2);
        assert_eq!(from.unwrap().id(), 1);
    }

    #[tokio::test]
    async fn barrier_releases_every_waiter() {
        let slot = Arc::new(slot_in(SlotState::PreMigration));

        let mut readers = Vec::new();
        for _ in 0..8 {
            let slot = Arc::clone(&slot);
            readers.push(tokio::spawn(
                async move { slot.working_groups().await },
            ));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        slot.mark_in_migration().unwrap();

        for reader in readers {
            let (g, from) = reader.await.unwrap().unwrap();
            assert_eq!(g.id(), 2);
            assert_eq!(from.unwrap().id(), 1);
        }
    }
}
