//! In-memory raft log.

use crate::error::{KeyplaneError, Result};
use crate::types::{LogIndex, Term};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::Arc;

/// What a log entry carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    /// An opaque command for the state machine.
    Command,
    /// A full voter-address map, applied by the raft layer itself.
    Membership,
}

/// A single entry in the raft log.
///
/// The payload is `Arc`-wrapped so replication can clone entries without
/// copying the command bytes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    /// The term in which the entry was created.
    pub term: Term,
    /// The position of this entry in the log.
    pub index: LogIndex,
    /// Payload interpretation.
    pub kind: EntryKind,
    /// The payload bytes.
    #[serde(with = "arc_bytes")]
    pub data: Arc<Vec<u8>>,
}

impl LogEntry {
    /// Create a command entry.
    pub fn command(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Command,
            data: Arc::new(data),
        }
    }

    /// Create a membership entry.
    pub fn membership(term: Term, index: LogIndex, data: Vec<u8>) -> Self {
        Self {
            term,
            index,
            kind: EntryKind::Membership,
            data: Arc::new(data),
        }
    }

    #[inline]
    pub fn data_bytes(&self) -> &[u8] {
        &self.data
    }
}

/// Serde helper for `Arc<Vec<u8>>`: serialized as raw bytes.
mod arc_bytes {
    use serde::{Deserializer, Serializer};
    use std::sync::Arc;

    pub fn serialize<S>(data: &Arc<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serde_bytes::serialize(data.as_slice(), serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Arc<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let bytes: Vec<u8> = serde_bytes::deserialize(deserializer)?;
        Ok(Arc::new(bytes))
    }
}

/// The raft log. Entries are kept in memory; durability comes from
/// `RaftStorage`.
#[derive(Debug, Default)]
pub struct RaftLog {
    entries: VecDeque<LogEntry>,
    /// Index of the first retained entry (after compaction).
    first_index: LogIndex,
    /// Term of the entry at `first_index - 1`, for consistency checks
    /// across the compaction boundary.
    snapshot_term: Term,
}

impl RaftLog {
    pub fn new() -> Self {
        Self {
            entries: VecDeque::new(),
            first_index: 1,
            snapshot_term: 0,
        }
    }

    pub fn first_index(&self) -> LogIndex {
        self.first_index
    }

    pub fn last_index(&self) -> LogIndex {
        if self.entries.is_empty() {
            self.first_index.saturating_sub(1)
        } else {
            self.first_index + self.entries.len() as u64 - 1
        }
    }

    pub fn last_term(&self) -> Term {
        self.entries
            .back()
            .map(|e| e.term)
            .unwrap_or(self.snapshot_term)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Append an entry; its index must directly follow the current tail.
    pub fn append(&mut self, entry: LogEntry) -> Result<()> {
        let expected = self.last_index() + 1;
        if entry.index != expected {
            return Err(KeyplaneError::RaftLog(format!(
                "expected index {}, got {}",
                expected, entry.index
            )));
        }
        self.entries.push_back(entry);
        Ok(())
    }

    pub fn get(&self, index: LogIndex) -> Option<&LogEntry> {
        if index < self.first_index || index > self.last_index() {
            return None;
        }
        self.entries.get((index - self.first_index) as usize)
    }

    /// The term at `index`, if known. Index 0 and the compaction boundary
    /// are answered without an entry.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == 0 {
            return Some(0);
        }
        if index == self.first_index - 1 {
            return Some(self.snapshot_term);
        }
        self.get(index).map(|e| e.term)
    }

    /// Entries in `[start, ..]`, at most `limit` of them.
    pub fn entries_from_limit(&self, start: LogIndex, limit: usize) -> Vec<LogEntry> {
        if start > self.last_index() {
            return Vec::new();
        }
        let start = start.max(self.first_index);
        let offset = (start - self.first_index) as usize;
        self.entries.iter().skip(offset).take(limit).cloned().collect()
    }

    /// Entries in `[start, end]` inclusive.
    pub fn entries_range(&self, start: LogIndex, end: LogIndex) -> Vec<LogEntry> {
        self.entries_from_limit(start, usize::MAX)
            .into_iter()
            .take_while(|e| e.index <= end)
            .collect()
    }

    /// Drop entries from `index` (inclusive) onwards. Used when the leader
    /// overwrites a conflicting suffix.
    pub fn truncate_from(&mut self, index: LogIndex) {
        if index < self.first_index {
            self.entries.clear();
            return;
        }
        self.entries.truncate((index - self.first_index) as usize);
    }

    /// AppendEntries consistency check against the leader's previous entry.
    pub fn matches(&self, prev_log_index: LogIndex, prev_log_term: Term) -> bool {
        if prev_log_index == 0 {
            return true;
        }
        self.term_at(prev_log_index) == Some(prev_log_term)
    }

    /// Drop entries up to `up_to_index` inclusive after a snapshot.
    pub fn compact(&mut self, up_to_index: LogIndex, snapshot_term: Term) {
        if up_to_index < self.first_index {
            return;
        }
        let drop = ((up_to_index - self.first_index + 1) as usize).min(self.entries.len());
        for _ in 0..drop {
            self.entries.pop_front();
        }
        self.first_index = up_to_index + 1;
        self.snapshot_term = snapshot_term;
    }

    /// Election rule: is a candidate with this last entry at least as
    /// up-to-date as we are?
    pub fn is_up_to_date(&self, last_log_index: LogIndex, last_log_term: Term) -> bool {
        if last_log_term != self.last_term() {
            last_log_term > self.last_term()
        } else {
            last_log_index >= self.last_index()
        }
    }
}
