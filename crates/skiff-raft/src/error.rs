//! Replica error types.

use thiserror::Error;

/// Errors surfaced by the consensus engine and its transports.
#[derive(Error, Debug)]
pub enum ReplicaError {
    /// Wire codec failure (malformed JSON, unknown type, bad field shapes).
    #[error("Codec error: {source}")]
    Codec {
        #[from]
        source: serde_json::Error,
    },

    /// Socket-level I/O failure.
    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    /// Transport failure (peer unreachable, channel closed, oversized datagram).
    #[error("Transport error: {reason}")]
    Transport { reason: String },
}

/// Engine result type.
pub type Result<T> = std::result::Result<T, ReplicaError>;
