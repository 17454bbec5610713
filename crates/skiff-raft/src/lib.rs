//! skiff-raft: the consensus engine behind the skiff replicated key-value store.
//!
//! Each replica is a single-threaded, datagram-driven state machine in the Raft
//! family:
//! - Leader election with randomized timeouts
//! - Append-only log replication with a walking consistency check
//! - Quorum accounting for client writes (a put is acknowledged only once a
//!   majority of replicas hold it)
//! - Role-dependent client dispatch (redirects from followers, deferral during
//!   candidacy, answers from the leader's committed prefix)
//!
//! The engine itself ([`replica::Replica`]) performs no I/O: it consumes wire
//! envelopes and timer expirations and produces wire envelopes. The event loop
//! in [`server`] drives it over a [`transport::Transport`].

pub mod config;
pub mod error;
pub mod log;
pub mod message;
pub mod replica;
pub mod server;
pub mod timer;
pub mod transport;
pub mod types;

pub use config::ReplicaConfig;
pub use error::{ReplicaError, Result};
pub use message::{Body, Envelope, BROADCAST};
pub use replica::Replica;
pub use types::{LogEntry, LogIndex, ReplicaId, Role, Term};
