//! In-process leaf storage server.
//!
//! Keeps the full `(slot, key, member) -> (timestamp, ttl)` relation in
//! memory. Volatile members (positive TTL) are expired lazily when a
//! `select` observes them past their deadline.

use super::StorageServer;
use crate::error::Result;
use crate::types::{Element, ServerAddr, SlotId};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy)]
struct Stored {
    timestamp: i64,
    ttl: Duration,
}

/// `key -> member -> element` for one slot.
type SlotData = BTreeMap<String, BTreeMap<String, Stored>>;

/// An in-memory [`StorageServer`].
pub struct MemoryServer {
    addr: ServerAddr,
    slots: RwLock<HashMap<SlotId, SlotData>>,
}

impl MemoryServer {
    pub fn new(addr: impl Into<ServerAddr>) -> Self {
        Self {
            addr: addr.into(),
            slots: RwLock::new(HashMap::new()),
        }
    }
}

#[async_trait::async_trait]
impl StorageServer for MemoryServer {
    fn addr(&self) -> &ServerAddr {
        &self.addr
    }

    async fn insert(
        &self,
        slot_id: SlotId,
        key: &str,
        member: &str,
        timestamp: i64,
        ttl: Duration,
    ) -> Result<bool> {
        let mut slots = self.slots.write();
        let previous = slots
            .entry(slot_id)
            .or_default()
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string(), Stored { timestamp, ttl });
        Ok(previous.is_some())
    }

    async fn delete(
        &self,
        slot_id: SlotId,
        key: &str,
        member: &str,
        _timestamp: i64,
    ) -> Result<bool> {
        let mut slots = self.slots.write();
        let Some(slot) = slots.get_mut(&slot_id) else {
            return Ok(false);
        };
        let Some(members) = slot.get_mut(key) else {
            return Ok(false);
        };
        let removed = members.remove(member).is_some();
        if members.is_empty() {
            slot.remove(key);
        }
        Ok(removed)
    }

    async fn select(&self, slot_id: SlotId, key: &str, timestamp: i64) -> Result<Vec<Element>> {
        let mut slots = self.slots.write();
        let Some(members) = slots.get_mut(&slot_id).and_then(|slot| slot.get_mut(key)) else {
            return Ok(Vec::new());
        };

        let mut alive = Vec::new();
        members.retain(|member, stored| {
            let element = Element {
                member: member.clone(),
                timestamp: stored.timestamp,
                ttl: stored.ttl,
            };
            if element.expired_at(timestamp) {
                false
            } else {
                alive.push(element);
                true
            }
        });

        Ok(alive)
    }

    async fn keys(
        &self,
        slot_id: SlotId,
        batch_size: usize,
    ) -> Result<mpsc::Receiver<Vec<String>>> {
        let keys: Vec<String> = {
            let slots = self.slots.read();
            slots
                .get(&slot_id)
                .map(|slot| slot.keys().cloned().collect())
                .unwrap_or_default()
        };

        let batches: Vec<Vec<String>> = keys
            .chunks(batch_size.max(1))
            .map(|chunk| chunk.to_vec())
            .collect();

        let (tx, rx) = mpsc::channel(batches.len().max(1));
        for batch in batches {
            // Capacity covers every batch; the send cannot fail.
            let _ = tx.try_send(batch);
        }
        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn insert_reports_update() {
        let server = MemoryServer::new("server1");
        assert!(!server.insert(0, "k", "m", 1, Duration::ZERO).await.unwrap());
        assert!(server.insert(0, "k", "m", 2, Duration::ZERO).await.unwrap());
    }

    #[tokio::test]
    async fn delete_removes_single_member() {
        let server = MemoryServer::new("server1");
        server.insert(0, "k", "a", 1, Duration::ZERO).await.unwrap();
        server.insert(0, "k", "b", 1, Duration::ZERO).await.unwrap();

        assert!(server.delete(0, "k", "a", 2).await.unwrap());
        assert!(!server.delete(0, "k", "a", 2).await.unwrap());

        let members = server.select(0, "k", 2).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].member, "b");
    }

    #[tokio::test]
    async fn select_expires_volatile_members() {
        let server = MemoryServer::new("server1");
        server
            .insert(0, "k", "volatile", 100, Duration::from_nanos(50))
            .await
            .unwrap();
        server
            .insert(0, "k", "persistent", 100, Duration::ZERO)
            .await
            .unwrap();

        // Before the deadline both are visible.
        assert_eq!(server.select(0, "k", 120).await.unwrap().len(), 2);

        // Past the deadline the volatile member is gone for good.
        let members = server.select(0, "k", 200).await.unwrap();
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].member, "persistent");
        assert_eq!(server.select(0, "k", 0).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn keys_streams_in_batches() {
        let server = MemoryServer::new("server1");
        for i in 0..25 {
            server
                .insert(3, &format!("key{:02}", i), "m", 1, Duration::ZERO)
                .await
                .unwrap();
        }

        let mut rx = server.keys(3, 10).await.unwrap();
        let mut batches = Vec::new();
        while let Some(batch) = rx.recv().await {
            batches.push(batch);
        }
        assert_eq!(batches.len(), 3);
        assert_eq!(batches[0].len(), 10);
        assert_eq!(batches[2].len(), 5);

        let mut rx = server.keys(9, 10).await.unwrap();
        assert!(rx.recv().await.is_none());
    }
}
