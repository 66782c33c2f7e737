//! The contract between cluster metadata and replica groups.

use crate::error::Result;
use crate::types::{Element, GroupId, ServerAddr, SlotId};
use std::sync::Arc;
use std::time::Duration;

/// A replica group: the unit of slot ownership and of write quorum.
///
/// Slots hold non-owning `Arc<dyn Group>` handles to groups; identity is
/// the group id. The storage operations fan out to the group's replica
/// servers (see `crate::group::ReplicaGroup` for the stock
/// implementation); the migration operations move data between groups and
/// are idempotent on success.
#[async_trait::async_trait]
pub trait Group: Send + Sync {
    fn id(&self) -> GroupId;

    /// The replica server addresses, in configuration order.
    fn servers(&self) -> Vec<ServerAddr>;

    /// Quorum write of `(key, member)` with its write metadata.
    /// Returns whether an existing element was updated.
    async fn insert(
        &self,
        slot_id: SlotId,
        key: &str,
        member: &str,
        timestamp: i64,
        ttl: Duration,
    ) -> Result<bool>;

    /// Quorum delete of `(key, member)`. Returns whether an element was
    /// removed.
    async fn delete(&self, slot_id: SlotId, key: &str, member: &str, timestamp: i64)
        -> Result<bool>;

    /// Read the live elements of `key`, observed at `timestamp`.
    async fn select(&self, slot_id: SlotId, key: &str, timestamp: i64) -> Result<Vec<Element>>;

    /// Copy the given keys of `slot_id` from this group to `to`.
    /// Idempotent on success; the first fatal error surfaces.
    async fn migrate_keys(&self, to: &dyn Group, slot_id: SlotId, keys: &[String]) -> Result<()>;

    /// Copy every key of `slot_id` from this group to `to`.
    /// Idempotent on success; the first fatal error surfaces.
    async fn migrate_slot(&self, to: &dyn Group, slot_id: SlotId) -> Result<()>;
}

/// Constructor capability for groups.
///
/// The replicated store must rebuild `Group` objects when applying
/// `AddGroup` and when restoring from a snapshot, without depending on any
/// concrete implementation (which would pull networking into the state
/// machine). The coordinator is handed this constructor at startup.
pub type NewGroup = Arc<dyn Fn(GroupId, Vec<ServerAddr>) -> Arc<dyn Group> + Send + Sync>;
