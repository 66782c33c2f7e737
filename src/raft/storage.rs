//! Durable storage for raft state, backed by RocksDB.

use super::{LogEntry, PersistentState};
use crate::error::Result;
use crate::types::{LogIndex, NodeId, Term};
use rocksdb::{Options, DB};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;

const PERSISTENT_STATE_KEY: &[u8] = b"raft_persistent_state";
const VOTERS_KEY: &[u8] = b"raft_voters";
const LOG_PREFIX: &[u8] = b"raft_log_";
const SNAPSHOT_KEY: &[u8] = b"raft_snapshot";
const SNAPSHOT_META_KEY: &[u8] = b"raft_snapshot_meta";

/// Snapshot metadata persisted alongside the snapshot bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotMeta {
    pub last_index: LogIndex,
    pub last_term: Term,
}

/// Durable raft storage: term/vote state, the voter map, log entries, and
/// the latest state machine snapshot.
pub struct RaftStorage {
    db: DB,
}

impl RaftStorage {
    /// Open or create storage at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_compression_type(rocksdb::DBCompressionType::Lz4);

        let db = DB::open(&opts, path)?;
        Ok(Self { db })
    }

    pub fn load_persistent_state(&self) -> Result<Option<PersistentState>> {
        match self.db.get(PERSISTENT_STATE_KEY)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    pub fn save_persistent_state(&self, state: &PersistentState) -> Result<()> {
        let data = bincode::serialize(state)?;
        self.db.put(PERSISTENT_STATE_KEY, data)?;
        self.db.flush()?;
        Ok(())
    }

    /// Load the persisted voter-address map, if any.
    pub fn load_voters(&self) -> Result<Option<HashMap<NodeId, String>>> {
        match self.db.get(VOTERS_KEY)? {
            Some(data) => Ok(Some(bincode::deserialize(&data)?)),
            None => Ok(None),
        }
    }

    /// Persist the voter-address map after a membership entry is applied.
    pub fn save_voters(&self, voters: &HashMap<NodeId, String>) -> Result<()> {
        let data = bincode::serialize(voters)?;
        self.db.put(VOTERS_KEY, data)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn append_log_entries(&self, entries: &[LogEntry]) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        for entry in entries {
            batch.put(log_key(entry.index), bincode::serialize(entry)?);
        }
        self.db.write(batch)?;
        Ok(())
    }

    /// Load all log entries from `start_index` onwards.
    pub fn load_log_entries_from(&self, start_index: LogIndex) -> Result<Vec<LogEntry>> {
        let mut entries = Vec::new();
        let start_key = log_key(start_index);

        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            &start_key,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, value) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            entries.push(bincode::deserialize(&value)?);
        }

        Ok(entries)
    }

    /// Delete log entries from `from_index` onwards.
    pub fn truncate_log_from(&self, from_index: LogIndex) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let start_key = log_key(from_index);

        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            &start_key,
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, _) = item?;
            if !key.starts_with(LOG_PREFIX) {
                break;
            }
            batch.delete(&key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    /// Delete log entries up to `up_to_index` inclusive after a snapshot.
    pub fn compact_log(&self, up_to_index: LogIndex) -> Result<()> {
        let mut batch = rocksdb::WriteBatch::default();
        let end_key = log_key(up_to_index + 1);

        let iter = self.db.iterator(rocksdb::IteratorMode::From(
            &log_key(1),
            rocksdb::Direction::Forward,
        ));

        for item in iter {
            let (key, _) = item?;
            if key.as_ref() >= end_key.as_slice() || !key.starts_with(LOG_PREFIX) {
                break;
            }
            batch.delete(&key);
        }

        self.db.write(batch)?;
        Ok(())
    }

    pub fn save_snapshot(&self, data: &[u8], last_index: LogIndex, last_term: Term) -> Result<()> {
        let meta = bincode::serialize(&SnapshotMeta {
            last_index,
            last_term,
        })?;

        let mut batch = rocksdb::WriteBatch::default();
        batch.put(SNAPSHOT_KEY, data);
        batch.put(SNAPSHOT_META_KEY, meta);
        self.db.write(batch)?;
        self.db.flush()?;
        Ok(())
    }

    pub fn load_snapshot(&self) -> Result<Option<(Vec<u8>, SnapshotMeta)>> {
        let meta = match self.db.get(SNAPSHOT_META_KEY)? {
            Some(d) => d,
            None => return Ok(None),
        };
        let data = match self.db.get(SNAPSHOT_KEY)? {
            Some(d) => d,
            None => return Ok(None),
        };
        Ok(Some((data.to_vec(), bincode::deserialize(&meta)?)))
    }
}

// Big-endian indices so keys sort in log order.
fn log_key(index: LogIndex) -> Vec<u8> {
    let mut key = LOG_PREFIX.to_vec();
    key.extend_from_slice(&index.to_be_bytes());
    key
}
