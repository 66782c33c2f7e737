//! Replica groups: quorum writes, single-server reads, and data
//! migration between groups.
//!
//! A group turns a set of replica leaf storage servers into one logical
//! unit with early-return quorum semantics. The leaf servers themselves
//! are external collaborators reached through the [`StorageServer`]
//! contract; [`HttpServerClient`] is the stock network client and
//! [`MemoryServer`] the in-process implementation used by tests and
//! single-binary demos.

mod memory;
mod quorum;
mod remote;

pub use memory::MemoryServer;
pub use quorum::{ReadStrategy, ReplicaGroup};
pub use remote::HttpServerClient;

use crate::error::Result;
use crate::types::{Element, ServerAddr, SlotId};
use std::time::Duration;
use tokio::sync::mpsc;

/// Operations a replica group invokes on one leaf storage server.
///
/// Elements are `(member, timestamp, ttl)` tuples keyed by
/// `(slot_id, key)`; see [`Element`] for the TTL contract.
#[async_trait::async_trait]
pub trait StorageServer: Send + Sync {
    /// The server's network address.
    fn addr(&self) -> &ServerAddr;

    /// Store `(key, member)`; returns whether an existing element was
    /// updated.
    async fn insert(
        &self,
        slot_id: SlotId,
        key: &str,
        member: &str,
        timestamp: i64,
        ttl: Duration,
    ) -> Result<bool>;

    /// Remove `(key, member)`; returns whether an element was removed.
    async fn delete(&self, slot_id: SlotId, key: &str, member: &str, timestamp: i64)
        -> Result<bool>;

    /// The live elements of `key`, observed at `timestamp`.
    async fn select(&self, slot_id: SlotId, key: &str, timestamp: i64) -> Result<Vec<Element>>;

    /// Stream every key of a slot, in batches of at most `batch_size`.
    /// Used by bulk slot migration.
    async fn keys(&self, slot_id: SlotId, batch_size: usize)
        -> Result<mpsc::Receiver<Vec<String>>>;
}
