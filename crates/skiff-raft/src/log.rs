//! The replicated log.
//!
//! An in-memory, append-only sequence of `(term, (key, value))` entries,
//! 1-indexed; index 0 is the empty prefix. A leader only ever appends; a
//! follower may truncate a conflicting suffix before appending the leader's
//! entries. Durability is majority replication, not disk.

use crate::message::ConsistencyPoint;
use crate::types::{LogEntry, LogIndex, Term};

/// Append-only log with suffix truncation.
///
/// Invariants:
/// - entry terms are non-decreasing;
/// - if two replicas' logs agree at an index, they agree at every lower index.
#[derive(Debug, Clone, Default)]
pub struct ReplicaLog {
    entries: Vec<LogEntry>,
}

impl ReplicaLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// The last index, which is also the number of entries.
    pub fn len(&self) -> LogIndex {
        LogIndex(self.entries.len() as u64)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Term of the last entry; `Term::ZERO` for an empty log.
    pub fn last_term(&self) -> Term {
        self.entries.last().map(|e| e.term).unwrap_or(Term::ZERO)
    }

    /// Term at a 1-based index. Index 0 reports the empty-prefix term 0.
    pub fn term_at(&self, index: LogIndex) -> Option<Term> {
        if index == LogIndex::ZERO {
            return Some(Term::ZERO);
        }
        self.entries.get(index.as_usize() - 1).map(|e| e.term)
    }

    /// Append one entry; returns its index.
    pub fn append(&mut self, entry: LogEntry) -> LogIndex {
        self.entries.push(entry);
        self.len()
    }

    /// Append a batch in order.
    pub fn extend(&mut self, entries: Vec<LogEntry>) {
        self.entries.extend(entries);
    }

    /// Keep the first `prefix` entries, dropping everything after.
    pub fn truncate_to(&mut self, prefix: LogIndex) {
        self.entries.truncate(prefix.as_usize());
    }

    /// Whether this log satisfies an append's consistency point.
    ///
    /// Index 0 always matches; otherwise the log must be long enough and hold
    /// the claimed term at the claimed index.
    pub fn matches(&self, point: ConsistencyPoint) -> bool {
        match point {
            ConsistencyPoint::Heartbeat => true,
            ConsistencyPoint::At {
                prev_index,
                prev_term,
            } => self.term_at(prev_index) == Some(prev_term),
        }
    }

    /// Up to `limit` entries starting after the first `from` entries.
    ///
    /// This is the batch a leader ships to a follower believed to hold `from`
    /// entries.
    pub fn batch_from(&self, from: LogIndex, limit: usize) -> Vec<LogEntry> {
        let start = from.as_usize().min(self.entries.len());
        let end = (start + limit).min(self.entries.len());
        self.entries[start..end].to_vec()
    }

    /// The most recent value for `key` among entries with index strictly below
    /// `end`.
    pub fn latest_value_below(&self, end: LogIndex, key: &str) -> Option<&str> {
        let end = end.as_usize().saturating_sub(1).min(self.entries.len());
        self.entries[..end]
            .iter()
            .rev()
            .find(|e| e.key == key)
            .map(|e| e.value.as_str())
    }

    /// All entries, oldest first.
    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }
}
