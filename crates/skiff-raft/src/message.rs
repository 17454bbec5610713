//! Wire format for replica-to-replica and client-to-replica messages.
//!
//! Every datagram carries exactly one JSON object with the common fields
//! `src`, `dst`, `leader`, and a `type` discriminator selecting the payload.
//! The discriminator strings, the `FFFF` broadcast id, and the array encodings
//! of the two `entry` fields are a cluster-wide contract: all replicas (and
//! the test harness) must agree on them byte for byte.

use crate::types::{LogEntry, LogIndex, ReplicaId, Term};
use serde::{Deserialize, Serialize};

/// Reserved id: "no specific destination / no known leader".
pub const BROADCAST: &str = "FFFF";

/// Wire discriminator strings, exactly as they appear in the `type` field.
pub mod wire {
    pub const HELLO: &str = "hello";
    pub const PUT: &str = "put";
    pub const GET: &str = "get";
    pub const OK: &str = "ok";
    pub const REDIRECT: &str = "redirect";
    pub const REQ_VOTE: &str = "ReqVote";
    pub const ACK_VOTE: &str = "AckVote";
    pub const APPEND_RPC: &str = "AppendRPC";
    pub const SUCCESS: &str = "success";
    pub const BLUNDER: &str = "blunder";
}

/// A single protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub src: ReplicaId,
    pub dst: ReplicaId,
    /// The sender's current believed leader (`FFFF` when unknown).
    pub leader: ReplicaId,
    #[serde(flatten)]
    pub body: Body,
}

impl Envelope {
    pub fn new(src: ReplicaId, dst: ReplicaId, leader: ReplicaId, body: Body) -> Self {
        Self {
            src,
            dst,
            leader,
            body,
        }
    }

    /// Encode as a single JSON datagram payload.
    pub fn encode(&self) -> crate::error::Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode a datagram payload.
    pub fn decode(bytes: &[u8]) -> crate::error::Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

/// Per-type payload. The serde tag carries the exact wire strings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Body {
    /// Startup announcement, broadcast once on construction.
    #[serde(rename = "hello")]
    Hello,

    /// Client write request.
    #[serde(rename = "put")]
    Put {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
        value: String,
    },

    /// Client read request.
    #[serde(rename = "get")]
    Get {
        #[serde(rename = "MID")]
        mid: String,
        key: String,
    },

    /// Positive client reply. Carries `key`/`value` only for gets.
    #[serde(rename = "ok")]
    Ok {
        #[serde(rename = "MID")]
        mid: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        key: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<String>,
    },

    /// Negative client reply: retry at the envelope's `leader`.
    #[serde(rename = "redirect")]
    Redirect {
        #[serde(rename = "MID")]
        mid: String,
    },

    /// Candidate's vote solicitation. `entry` is `[log_length, last_log_term]`.
    #[serde(rename = "ReqVote")]
    RequestVote {
        term: Term,
        entry: (LogIndex, Term),
    },

    /// A granted vote. Destination-specific; no term is echoed.
    #[serde(rename = "AckVote")]
    GrantVote,

    /// Leader append / heartbeat. `entry` is the consistency point
    /// (`[prev_index, prev_term]`, or `[]` for a heartbeat).
    #[serde(rename = "AppendRPC")]
    Append {
        term: Term,
        entry: ConsistencyPoint,
        logs: Vec<LogEntry>,
    },

    /// Follower acknowledgment of an accepted append; `next_idx` is the
    /// follower's new log length.
    #[serde(rename = "success")]
    AppendAck { next_idx: LogIndex },

    /// Follower rejection of an append whose consistency point did not match.
    #[serde(rename = "blunder")]
    AppendNak,
}

impl Body {
    /// True for the two client request types.
    pub fn is_client_request(&self) -> bool {
        matches!(self, Body::Put { .. } | Body::Get { .. })
    }
}

/// The log position an `AppendRPC` claims the follower already holds.
///
/// On the wire this is a JSON array: `[]` for a heartbeat, `[prev_index,
/// prev_term]` otherwise. `prev_index` 0 is the empty prefix and matches any
/// log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "Vec<u64>", into = "Vec<u64>")]
pub enum ConsistencyPoint {
    /// No claim; the message only reasserts leadership.
    Heartbeat,
    /// The follower's log must hold `prev_term` at `prev_index`.
    At {
        prev_index: LogIndex,
        prev_term: Term,
    },
}

impl TryFrom<Vec<u64>> for ConsistencyPoint {
    type Error = String;

    fn try_from(raw: Vec<u64>) -> Result<Self, Self::Error> {
        match raw.as_slice() {
            [] => Ok(ConsistencyPoint::Heartbeat),
            [index, term] => Ok(ConsistencyPoint::At {
                prev_index: LogIndex(*index),
                prev_term: Term(*term),
            }),
            other => Err(format!(
                "consistency point must have 0 or 2 elements, got {}",
                other.len()
            )),
        }
    }
}

impl From<ConsistencyPoint> for Vec<u64> {
    fn from(point: ConsistencyPoint) -> Vec<u64> {
        match point {
            ConsistencyPoint::Heartbeat => Vec::new(),
            ConsistencyPoint::At {
                prev_index,
                prev_term,
            } => vec![prev_index.as_u64(), prev_term.as_u64()],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn envelope(body: Body) -> Envelope {
        Envelope::new(
            ReplicaId::new("0000"),
            ReplicaId::new("0001"),
            ReplicaId::broadcast(),
            body,
        )
    }

    #[test]
    fn put_wire_shape() {
        let env = envelope(Body::Put {
            mid: "m1".to_string(),
            key: "x".to_string(),
            value: "1".to_string(),
        });
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], wire::PUT);
        assert_eq!(json["MID"], "m1");
        assert_eq!(json["src"], "0000");
        assert_eq!(json["dst"], "0001");
        assert_eq!(json["leader"], "FFFF");
        assert_eq!(json["key"], "x");
        assert_eq!(json["value"], "1");
    }

    #[test]
    fn ok_omits_absent_key_and_value() {
        let env = envelope(Body::Ok {
            mid: "m2".to_string(),
            key: None,
            value: None,
        });
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], "ok");
        assert!(json.get("key").is_none());
        assert!(json.get("value").is_none());
    }

    #[test]
    fn request_vote_entry_is_an_array() {
        let env = envelope(Body::RequestVote {
            term: Term(3),
            entry: (LogIndex(7), Term(2)),
        });
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], wire::REQ_VOTE);
        assert_eq!(json["term"], 3);
        assert_eq!(json["entry"], serde_json::json!([7, 2]));
    }

    #[test]
    fn heartbeat_entry_is_an_empty_array() {
        let env = envelope(Body::Append {
            term: Term(1),
            entry: ConsistencyPoint::Heartbeat,
            logs: Vec::new(),
        });
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], wire::APPEND_RPC);
        assert_eq!(json["entry"], serde_json::json!([]));
        assert_eq!(json["logs"], serde_json::json!([]));
    }

    #[test]
    fn append_entry_roundtrip() {
        let env = envelope(Body::Append {
            term: Term(2),
            entry: ConsistencyPoint::At {
                prev_index: LogIndex(4),
                prev_term: Term(1),
            },
            logs: vec![LogEntry::new(Term(2), "k", "v")],
        });
        let decoded = Envelope::decode(&env.encode().unwrap()).unwrap();
        assert_eq!(decoded, env);

        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["entry"], serde_json::json!([4, 1]));
    }

    #[test]
    fn success_carries_next_idx() {
        let env = envelope(Body::AppendAck {
            next_idx: LogIndex(9),
        });
        let json: serde_json::Value = serde_json::from_slice(&env.encode().unwrap()).unwrap();
        assert_eq!(json["type"], wire::SUCCESS);
        assert_eq!(json["next_idx"], 9);
    }

    #[test]
    fn decode_rejects_unknown_type() {
        let raw = br#"{"src":"0000","dst":"0001","leader":"FFFF","type":"gossip"}"#;
        assert!(Envelope::decode(raw).is_err());
    }

    #[test]
    fn decode_rejects_malformed_consistency_point() {
        let raw = br#"{"src":"0000","dst":"0001","leader":"FFFF","type":"AppendRPC","term":1,"entry":[3],"logs":[]}"#;
        assert!(Envelope::decode(raw).is_err());
    }

    #[test]
    fn all_bodies_roundtrip() {
        let bodies = vec![
            Body::Hello,
            Body::Get {
                mid: "m".into(),
                key: "k".into(),
            },
            Body::Redirect { mid: "m".into() },
            Body::GrantVote,
            Body::AppendNak,
            Body::Ok {
                mid: "m".into(),
                key: Some("k".into()),
                value: Some("".into()),
            },
            Body::Ok {
                mid: "m".into(),
                key: None,
                value: None,
            },
        ];
        for body in bodies {
            let env = envelope(body);
            assert_eq!(Envelope::decode(&env.encode().unwrap()).unwrap(), env);
        }
    }
}
