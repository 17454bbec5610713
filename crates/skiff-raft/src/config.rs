//! Replica configuration (timeouts, batch cap).
//!
//! The defaults are part of the cluster-wide protocol contract and must match
//! on every replica: election timeouts in [200ms, 300ms), heartbeats every
//! 170ms, at most 114 entries per append.

use std::time::Duration;

/// Tuning parameters for a single replica.
#[derive(Debug, Clone)]
pub struct ReplicaConfig {
    /// Lower bound of the randomized election timeout (inclusive).
    ///
    /// Default: 200ms
    pub election_timeout_min: Duration,

    /// Upper bound of the randomized election timeout (exclusive).
    ///
    /// Default: 300ms
    pub election_timeout_max: Duration,

    /// Fixed heartbeat interval (leader → followers).
    ///
    /// Must be strictly less than `election_timeout_min`, so a healthy leader
    /// always refreshes followers before they time out.
    ///
    /// Default: 170ms
    pub heartbeat_interval: Duration,

    /// Maximum number of log entries carried by one `AppendRPC`.
    ///
    /// Bounds datagram size; a lagging follower catches up over several
    /// batches.
    ///
    /// Default: 114 entries
    pub append_batch_limit: usize,
}

impl Default for ReplicaConfig {
    fn default() -> Self {
        Self {
            election_timeout_min: Duration::from_millis(200),
            election_timeout_max: Duration::from_millis(300),
            heartbeat_interval: Duration::from_millis(170),
            append_batch_limit: 114,
        }
    }
}

impl ReplicaConfig {
    /// Validate the configuration invariants.
    pub fn validate(&self) -> Result<(), String> {
        if self.heartbeat_interval >= self.election_timeout_min {
            return Err(format!(
                "heartbeat_interval ({:?}) must be < election_timeout_min ({:?})",
                self.heartbeat_interval, self.election_timeout_min
            ));
        }

        if self.election_timeout_min >= self.election_timeout_max {
            return Err(format!(
                "election_timeout_min ({:?}) must be < election_timeout_max ({:?})",
                self.election_timeout_min, self.election_timeout_max
            ));
        }

        if self.append_batch_limit == 0 {
            return Err("append_batch_limit must be > 0".to_string());
        }

        Ok(())
    }

    /// Draw a fresh election timeout, uniform over `[min, max)`.
    ///
    /// Every reset gets a new draw; the jitter is what breaks symmetric
    /// candidacies.
    pub fn random_election_timeout(&self) -> Duration {
        use rand::Rng;
        let min_ms = self.election_timeout_min.as_millis() as u64;
        let max_ms = self.election_timeout_max.as_millis() as u64;
        let jittered = rand::thread_rng().gen_range(min_ms..max_ms);
        Duration::from_millis(jittered)
    }
}
