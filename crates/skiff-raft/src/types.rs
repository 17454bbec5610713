//! Core protocol types: terms, log indices, replica identity, log entries.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Election term (monotonically non-decreasing).
///
/// Terms partition time into periods with at most one leader each. A replica's
/// term only moves forward: when it starts a candidacy, or when it observes a
/// strictly greater term in an inbound message.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Term(pub u64);

impl Term {
    pub const ZERO: Term = Term(0);

    pub fn next(self) -> Term {
        Term(self.0 + 1)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Term {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "T{}", self.0)
    }
}

/// Log position (1-indexed; 0 is the empty-prefix sentinel).
///
/// Doubles as a length: a log of `n` entries has last index `n`, and a
/// follower believed to hold `n` entries has next-index `n`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct LogIndex(pub u64);

impl LogIndex {
    pub const ZERO: LogIndex = LogIndex(0);

    pub fn next(self) -> LogIndex {
        LogIndex(self.0 + 1)
    }

    /// One step back, floored at the empty-prefix sentinel.
    pub fn step_back(self) -> LogIndex {
        LogIndex(self.0.saturating_sub(1))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for LogIndex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "I{}", self.0)
    }
}

/// Replica identifier (stable string id, as assigned by the harness).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        ReplicaId(id.into())
    }

    /// The reserved id meaning "no specific destination / no known leader".
    pub fn broadcast() -> Self {
        ReplicaId(crate::message::BROADCAST.to_string())
    }

    pub fn is_broadcast(&self) -> bool {
        self.0 == crate::message::BROADCAST
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A replicated log entry: the term it was created in and the write it carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub term: Term,
    pub key: String,
    pub value: String,
}

impl LogEntry {
    pub fn new(term: Term, key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            term,
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Replica role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Follower,
    Candidate,
    Leader,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Follower => write!(f, "Follower"),
            Role::Candidate => write!(f, "Candidate"),
            Role::Leader => write!(f, "Leader"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn term_ordering_and_next() {
        assert!(Term(2) > Term(1));
        assert_eq!(Term(5).next(), Term(6));
        assert_eq!(Term::ZERO.as_u64(), 0);
    }

    #[test]
    fn log_index_step_back_floors_at_zero() {
        assert_eq!(LogIndex(5).step_back(), LogIndex(4));
        assert_eq!(LogIndex(0).step_back(), LogIndex(0));
        assert_eq!(LogIndex(3).next(), LogIndex(4));
    }

    #[test]
    fn broadcast_id() {
        assert!(ReplicaId::broadcast().is_broadcast());
        assert!(!ReplicaId::new("0000").is_broadcast());
        assert_eq!(ReplicaId::broadcast().as_str(), "FFFF");
    }
}
