//! The stock replica group: scatter/gather writes with early quorum
//! return, reads from one server, and the bulk-copy migration protocol.

use super::StorageServer;
use crate::cluster::Group;
use crate::error::{KeyplaneError, Result};
use crate::types::{Element, GroupId, ServerAddr, SlotId};
use futures::future::BoxFuture;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::debug;

/// Keys per batch during bulk slot migration.
const MIGRATION_BATCH_SIZE: usize = 256;

/// How a group serves reads.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReadStrategy {
    /// Read from the first configured server.
    #[default]
    First,
}

/// A replica group over a set of leaf storage servers.
pub struct ReplicaGroup {
    id: GroupId,
    servers: Vec<Arc<dyn StorageServer>>,
    write_quorum: usize,
    read_strategy: ReadStrategy,
}

impl ReplicaGroup {
    pub fn new(id: GroupId, servers: Vec<Arc<dyn StorageServer>>, write_quorum: usize) -> Self {
        Self {
            id,
            servers,
            write_quorum,
            read_strategy: ReadStrategy::default(),
        }
    }

    /// Fire `op` at every replica concurrently and gather replies.
    ///
    /// Returns as soon as `(received - errors) >= write_quorum`, carrying
    /// the status of the most recent successful reply. In-flight requests
    /// are not cancelled; their late replies drain in detached tasks and
    /// are ignored. If every reply arrives short of quorum, the joined
    /// per-replica errors surface for operator visibility.
    async fn write<F>(&self, op: F) -> Result<bool>
    where
        F: Fn(Arc<dyn StorageServer>) -> BoxFuture<'static, Result<bool>>,
    {
        let total = self.servers.len();
        let (tx, mut rx) = mpsc::channel(total.max(1));

        // Scatter
        for server in &self.servers {
            let tx = tx.clone();
            let fut = op(Arc::clone(server));
            tokio::spawn(async move {
                let _ = tx.send(fut.await).await;
            });
        }
        drop(tx);

        // Gather
        let mut status = false;
        let mut received = 0usize;
        let mut errors = Vec::new();
        while let Some(result) = rx.recv().await {
            received += 1;
            match result {
                Ok(s) => status = s,
                Err(e) => errors.push(e.to_string()),
            }
            if received - errors.len() >= self.write_quorum {
                return Ok(status);
            }
        }

        // Report
        Err(KeyplaneError::NoQuorum(errors.join("; ")))
    }

    fn read_server(&self) -> Result<&Arc<dyn StorageServer>> {
        match self.read_strategy {
            ReadStrategy::First => self.servers.first().ok_or_else(|| {
                KeyplaneError::Internal(format!("group {} has no servers", self.id))
            }),
        }
    }
}

#[async_trait::async_trait]
impl Group for ReplicaGroup {
    fn id(&self) -> GroupId {
        self.id
    }

    fn servers(&self) -> Vec<ServerAddr> {
        self.servers.iter().map(|s| s.addr().clone()).collect()
    }

    async fn insert(
        &self,
        slot_id: SlotId,
        key: &str,
        member: &str,
        timestamp: i64,
        ttl: Duration,
    ) -> Result<bool> {
        let key = key.to_string();
        let member = member.to_string();
        self.write(move |server| {
            let key = key.clone();
            let member = member.clone();
            async move { server.insert(slot_id, &key, &member, timestamp, ttl).await }.boxed()
        })
        .await
    }

    async fn delete(
        &self,
        slot_id: SlotId,
        key: &str,
        member: &str,
        timestamp: i64,
    ) -> Result<bool> {
        let key = key.to_string();
        let member = member.to_string();
        self.write(move |server| {
            let key = key.clone();
            let member = member.clone();
            async move { server.delete(slot_id, &key, &member, timestamp).await }.boxed()
        })
        .await
    }

    async fn select(&self, slot_id: SlotId, key: &str, timestamp: i64) -> Result<Vec<Element>> {
        // TODO: honor read_strategy once there is more than one.
        self.read_server()?.select(slot_id, key, timestamp).await
    }

    async fn migrate_keys(&self, to: &dyn Group, slot_id: SlotId, keys: &[String]) -> Result<()> {
        let source = self.read_server()?;
        for key in keys {
            // Timestamp 0 disables expiry filtering: everything the source
            // holds is copied, original write metadata intact. Re-running
            // rewrites identical elements, so the copy is idempotent.
            let elements = source.select(slot_id, key, 0).await?;
            for element in elements {
                to.insert(slot_id, key, &element.member, element.timestamp, element.ttl)
                    .await?;
            }
        }
        Ok(())
    }

    async fn migrate_slot(&self, to: &dyn Group, slot_id: SlotId) -> Result<()> {
        debug!(
            slot_id,
            from_group = self.id,
            to_group = to.id(),
            "starting bulk slot copy"
        );
        let mut batches = self
            .read_server()?
            .keys(slot_id, MIGRATION_BATCH_SIZE)
            .await?;
        while let Some(batch) = batches.recv().await {
            self.migrate_keys(to, slot_id, &batch).await?;
        }
        Ok(())
    }
}
