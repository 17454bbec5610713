//! The per-replica consensus engine.
//!
//! A [`Replica`] is a synchronous state machine: it consumes inbound envelopes
//! and timer expirations, and produces outbound envelopes. All I/O lives in
//! the event loop ([`crate::server`]) that drives it.
//!
//! Role transitions:
//! - Follower → Candidate on election timeout (new term, self-vote, `ReqVote`
//!   broadcast).
//! - Candidate → Leader on a vote quorum (next-index table initialized to the
//!   log length, immediate heartbeat).
//! - Candidate → Follower on an `AppendRPC` at or above its term, or a
//!   `ReqVote` above it.
//! - Leader → Follower on any message carrying a strictly greater term; every
//!   unacknowledged put is failed back to its client as a `redirect`.
//!
//! Leader-only state (the next-index table and the unacked-put queue) and the
//! candidate vote tally live inside the role enum, so they cannot be touched
//! from the wrong role.

use crate::config::ReplicaConfig;
use crate::log::ReplicaLog;
use crate::message::{Body, ConsistencyPoint, Envelope};
use crate::timer::{Stopwatch, Timer};
use crate::types::{LogEntry, LogIndex, ReplicaId, Role, Term};
use std::collections::{HashMap, VecDeque};
use std::time::Instant;

/// A client write appended to the leader's log but not yet known to be on a
/// majority of replicas.
#[derive(Debug, Clone)]
struct PendingPut {
    index: LogIndex,
    client: ReplicaId,
    mid: String,
}

/// Role plus the state that only exists in that role.
#[derive(Debug)]
enum RoleState {
    Follower,
    Candidate {
        votes: usize,
        campaign: Stopwatch,
    },
    Leader {
        /// For each peer, the index at which the next append will start.
        next_index: HashMap<ReplicaId, LogIndex>,
        /// Pending client writes, in log order.
        unacked_puts: VecDeque<PendingPut>,
    },
}

/// A single replica of the key-value store.
pub struct Replica {
    id: ReplicaId,
    peers: Vec<ReplicaId>,
    config: ReplicaConfig,

    term: Term,
    voted_this_term: bool,
    log: ReplicaLog,

    /// Current believed leader; `FFFF` when unknown.
    leader: ReplicaId,
    role: RoleState,

    /// Client requests received while campaigning, drained once the role
    /// settles.
    deferred: VecDeque<Envelope>,

    timer: Timer,
}

impl Replica {
    /// Create a replica in the follower role with a fresh election timeout.
    pub fn new(id: ReplicaId, peers: Vec<ReplicaId>, config: ReplicaConfig, now: Instant) -> Self {
        let timeout = config.random_election_timeout();
        Self {
            id,
            peers,
            config,
            term: Term::ZERO,
            voted_this_term: false,
            log: ReplicaLog::new(),
            leader: ReplicaId::broadcast(),
            role: RoleState::Follower,
            deferred: VecDeque::new(),
            timer: Timer::new(now, timeout),
        }
    }

    /// The startup announcement, broadcast once after construction.
    pub fn hello(&self) -> Envelope {
        Envelope::new(
            self.id.clone(),
            ReplicaId::broadcast(),
            self.leader.clone(),
            Body::Hello,
        )
    }

    pub fn id(&self) -> &ReplicaId {
        &self.id
    }

    pub fn role(&self) -> Role {
        match self.role {
            RoleState::Follower => Role::Follower,
            RoleState::Candidate { .. } => Role::Candidate,
            RoleState::Leader { .. } => Role::Leader,
        }
    }

    pub fn current_term(&self) -> Term {
        self.term
    }

    pub fn known_leader(&self) -> &ReplicaId {
        &self.leader
    }

    pub fn log(&self) -> &ReplicaLog {
        &self.log
    }

    /// When the active timer expires; the event loop sleeps until this.
    pub fn timer_deadline(&self) -> Instant {
        self.timer.deadline()
    }

    /// Check the timer; on expiry, start (or restart) a candidacy, or emit the
    /// leader heartbeat. Called at the top of every loop iteration.
    pub fn poll_timer(&mut self, now: Instant) -> Vec<Envelope> {
        if !self.timer.expired(now) {
            return Vec::new();
        }
        match self.role() {
            Role::Follower | Role::Candidate => self.start_candidacy(now),
            Role::Leader => {
                assert_eq!(self.leader, self.id, "leader must believe in itself");
                self.timer.reset(now, self.config.heartbeat_interval);
                vec![self.heartbeat()]
            }
        }
    }

    /// Process one inbound envelope.
    pub fn handle(&mut self, env: Envelope, now: Instant) -> Vec<Envelope> {
        if env.body.is_client_request() {
            return self.handle_client(env, now);
        }
        let Envelope { src, body, .. } = env;
        match body {
            Body::RequestVote { term, entry } => self.handle_request_vote(src, term, entry, now),
            Body::GrantVote => self.handle_vote(src, now),
            Body::Append { term, entry, logs } => self.handle_append(src, term, entry, logs, now),
            Body::AppendAck { next_idx } => self.handle_append_ack(src, next_idx),
            Body::AppendNak => self.handle_append_nak(src),
            // Peer announcements and stray client replies carry no state.
            Body::Hello | Body::Ok { .. } | Body::Redirect { .. } => Vec::new(),
            Body::Put { .. } | Body::Get { .. } => unreachable!("client requests handled above"),
        }
    }

    /// Pop a deferred client request, once the candidacy has settled.
    pub fn take_deferred(&mut self) -> Option<Envelope> {
        if matches!(self.role, RoleState::Candidate { .. }) {
            return None;
        }
        self.deferred.pop_front()
    }

    // ------------------------------------------------------------------
    // Elections
    // ------------------------------------------------------------------

    fn start_candidacy(&mut self, now: Instant) -> Vec<Envelope> {
        self.term = self.term.next();
        // The cleared vote immediately goes to ourselves.
        self.voted_this_term = true;
        self.leader = ReplicaId::broadcast();
        self.role = RoleState::Candidate {
            votes: 1,
            campaign: Stopwatch::start(now),
        };
        self.timer.reset(now, self.config.random_election_timeout());
        tracing::info!(term = %self.term, "election timeout, starting candidacy");

        let mut out = vec![Envelope::new(
            self.id.clone(),
            ReplicaId::broadcast(),
            self.leader.clone(),
            Body::RequestVote {
                term: self.term,
                entry: (self.log.len(), self.log.last_term()),
            },
        )];
        // A cluster of one wins on the self-vote alone.
        out.extend(self.try_win_election(now));
        out
    }

    fn votes_needed(&self) -> usize {
        self.peers.len() / 2 + 1
    }

    fn acks_needed(&self) -> usize {
        self.peers.len() / 2
    }

    fn handle_vote(&mut self, src: ReplicaId, now: Instant) -> Vec<Envelope> {
        // A vote that arrives after the election settled is stale.
        let RoleState::Candidate { votes, .. } = &mut self.role else {
            return Vec::new();
        };
        *votes += 1;
        let tally = *votes;
        tracing::debug!(term = %self.term, votes = tally, from = %src, "vote received");
        self.try_win_election(now)
    }

    fn try_win_election(&mut self, now: Instant) -> Vec<Envelope> {
        let RoleState::Candidate { votes, campaign } = &self.role else {
            return Vec::new();
        };
        if *votes < self.votes_needed() {
            return Vec::new();
        }

        tracing::info!(
            term = %self.term,
            votes = *votes,
            elapsed_ms = campaign.elapsed(now).as_millis() as u64,
            "won election"
        );
        let next_index = self
            .peers
            .iter()
            .map(|peer| (peer.clone(), self.log.len()))
            .collect();
        self.role = RoleState::Leader {
            next_index,
            unacked_puts: VecDeque::new(),
        };
        self.leader = self.id.clone();
        self.timer.reset(now, self.config.heartbeat_interval);
        // Assert the new term immediately rather than waiting a full interval.
        vec![self.heartbeat()]
    }

    fn heartbeat(&self) -> Envelope {
        Envelope::new(
            self.id.clone(),
            ReplicaId::broadcast(),
            self.leader.clone(),
            Body::Append {
                term: self.term,
                entry: ConsistencyPoint::Heartbeat,
                logs: Vec::new(),
            },
        )
    }

    // ------------------------------------------------------------------
    // Voting
    // ------------------------------------------------------------------

    fn handle_request_vote(
        &mut self,
        src: ReplicaId,
        term: Term,
        entry: (LogIndex, Term),
        now: Instant,
    ) -> Vec<Envelope> {
        let mut out = Vec::new();

        if term > self.term {
            let orphaned = self.abandon_leadership();
            self.term = term;
            self.voted_this_term = false;
            self.leader = ReplicaId::broadcast();
            self.timer.reset(now, self.config.random_election_timeout());
            out.extend(self.redirect_all(orphaned));
        }

        if term < self.term {
            // Stale candidacy: refuse silently.
            return out;
        }
        if !matches!(self.role, RoleState::Follower) || self.voted_this_term {
            return out;
        }

        let (candidate_len, candidate_last_term) = entry;
        let candidate_behind = !self.log.is_empty()
            && (candidate_len < self.log.len() || candidate_last_term < self.log.last_term());
        if candidate_behind {
            tracing::debug!(term = %term, candidate = %src, "refusing vote, candidate log is behind");
            return out;
        }

        self.voted_this_term = true;
        tracing::debug!(term = %self.term, candidate = %src, "granting vote");
        out.push(Envelope::new(
            self.id.clone(),
            src,
            self.leader.clone(),
            Body::GrantVote,
        ));
        out
    }

    // ------------------------------------------------------------------
    // Replication, follower side
    // ------------------------------------------------------------------

    fn handle_append(
        &mut self,
        src: ReplicaId,
        term: Term,
        point: ConsistencyPoint,
        logs: Vec<LogEntry>,
        now: Instant,
    ) -> Vec<Envelope> {
        if matches!(self.role, RoleState::Leader { .. }) && term <= self.term {
            // A leader never yields to an equal or lower term.
            return Vec::new();
        }
        if term < self.term {
            return vec![self.reply(src, Body::AppendNak)];
        }

        // The sender is the live leader for this term (or a newer one).
        let orphaned = self.abandon_leadership();
        if term > self.term {
            self.term = term;
        }
        // A live leader in this term obviates any candidacy of ours.
        self.voted_this_term = true;
        if self.leader != src {
            tracing::info!(term = %self.term, leader = %src, "following leader");
        }
        self.leader = src.clone();
        self.timer.reset(now, self.config.random_election_timeout());

        let mut out = self.redirect_all(orphaned);

        if logs.is_empty() {
            // Heartbeat: election suppressed, log untouched, no reply.
            return out;
        }
        let ConsistencyPoint::At { prev_index, .. } = point else {
            // Entries without a consistency point are not actionable.
            return out;
        };
        if self.log.matches(point) {
            self.log.truncate_to(prev_index);
            self.log.extend(logs);
            out.push(self.reply(
                src,
                Body::AppendAck {
                    next_idx: self.log.len(),
                },
            ));
        } else {
            tracing::debug!(term = %self.term, prev_index = %prev_index, "append consistency check failed");
            out.push(self.reply(src, Body::AppendNak));
        }
        out
    }

    // ------------------------------------------------------------------
    // Replication, leader side
    // ------------------------------------------------------------------

    fn handle_append_ack(&mut self, src: ReplicaId, next_idx: LogIndex) -> Vec<Envelope> {
        let log_len = self.log.len();
        let needs_more = {
            let RoleState::Leader { next_index, .. } = &mut self.role else {
                return Vec::new();
            };
            let Some(slot) = next_index.get_mut(&src) else {
                return Vec::new();
            };
            if next_idx > *slot {
                *slot = next_idx;
            }
            *slot < log_len
        };

        let mut out = Vec::new();
        if needs_more {
            out.extend(self.append_for(&src));
        }
        out.extend(self.acknowledge_committed());
        out
    }

    fn handle_append_nak(&mut self, src: ReplicaId) -> Vec<Envelope> {
        {
            let RoleState::Leader { next_index, .. } = &mut self.role else {
                return Vec::new();
            };
            let Some(slot) = next_index.get_mut(&src) else {
                return Vec::new();
            };
            // Walk back one consistency point; index 0 always matches, so the
            // walk terminates.
            *slot = slot.step_back();
            tracing::debug!(peer = %src, next_index = %slot, "append rejected, walking back");
        }
        self.append_for(&src).into_iter().collect()
    }

    /// Build the next append batch for a peer, from its next-index.
    fn append_for(&self, peer: &ReplicaId) -> Option<Envelope> {
        let RoleState::Leader { next_index, .. } = &self.role else {
            return None;
        };
        let from = (*next_index.get(peer)?).min(self.log.len());
        let prev_term = self.log.term_at(from).unwrap_or(Term::ZERO);
        Some(Envelope::new(
            self.id.clone(),
            peer.clone(),
            self.leader.clone(),
            Body::Append {
                term: self.term,
                entry: ConsistencyPoint::At {
                    prev_index: from,
                    prev_term,
                },
                logs: self.log.batch_from(from, self.config.append_batch_limit),
            },
        ))
    }

    /// Acknowledge every pending put whose entry has reached a majority.
    ///
    /// The leader counts implicitly; a peer counts once its next-index has
    /// reached the entry's index (a follower holding `n` entries has
    /// next-index `n`).
    fn acknowledge_committed(&mut self) -> Vec<Envelope> {
        let id = self.id.clone();
        let acks_needed = self.acks_needed();
        let RoleState::Leader {
            next_index,
            unacked_puts,
        } = &mut self.role
        else {
            return Vec::new();
        };

        let mut out = Vec::new();
        while let Some(head) = unacked_puts.front() {
            let replicated = next_index.values().filter(|idx| **idx >= head.index).count();
            if replicated < acks_needed {
                break;
            }
            let put = unacked_puts.pop_front().expect("front checked above");
            tracing::debug!(index = %put.index, mid = %put.mid, "put reached quorum");
            out.push(Envelope::new(
                id.clone(),
                put.client,
                id.clone(),
                Body::Ok {
                    mid: put.mid,
                    key: None,
                    value: None,
                },
            ));
        }
        out
    }

    // ------------------------------------------------------------------
    // Client dispatch
    // ------------------------------------------------------------------

    fn handle_client(&mut self, env: Envelope, _now: Instant) -> Vec<Envelope> {
        match self.role() {
            Role::Candidate => {
                // No authority yet either way; answer once the dust settles.
                self.deferred.push_back(env);
                Vec::new()
            }
            Role::Follower => {
                let mid = match &env.body {
                    Body::Put { mid, .. } | Body::Get { mid, .. } => mid.clone(),
                    _ => return Vec::new(),
                };
                vec![self.reply(env.src, Body::Redirect { mid })]
            }
            Role::Leader => match env.body {
                Body::Put { mid, key, value } => self.leader_put(env.src, mid, key, value),
                Body::Get { mid, key } => self.leader_get(env.src, mid, key),
                _ => Vec::new(),
            },
        }
    }

    fn leader_put(
        &mut self,
        client: ReplicaId,
        mid: String,
        key: String,
        value: String,
    ) -> Vec<Envelope> {
        let index = self.log.append(LogEntry::new(self.term, key, value));
        if let RoleState::Leader { unacked_puts, .. } = &mut self.role {
            unacked_puts.push_back(PendingPut { index, client, mid });
        }

        let peers = self.peers.clone();
        let mut out: Vec<Envelope> = peers
            .iter()
            .filter_map(|peer| self.append_for(peer))
            .collect();
        // With no peers the write is already on "a majority".
        out.extend(self.acknowledge_committed());
        out
    }

    fn leader_get(&mut self, client: ReplicaId, mid: String, key: String) -> Vec<Envelope> {
        let RoleState::Leader { unacked_puts, .. } = &self.role else {
            return Vec::new();
        };
        // The committed prefix ends where the pending writes begin.
        let committed_end = unacked_puts
            .front()
            .map(|put| put.index)
            .unwrap_or_else(|| self.log.len().next());
        let value = self
            .log
            .latest_value_below(committed_end, &key)
            .unwrap_or("")
            .to_string();
        vec![self.reply(
            client,
            Body::Ok {
                mid,
                key: Some(key),
                value: Some(value),
            },
        )]
    }

    // ------------------------------------------------------------------
    // Shared transition plumbing
    // ------------------------------------------------------------------

    /// Leave the leader (or candidate) role, surrendering any pending writes.
    ///
    /// Returns the clients still waiting on a put; the caller redirects them
    /// after the new leader (if any) is recorded.
    fn abandon_leadership(&mut self) -> Vec<(ReplicaId, String)> {
        let orphaned = match &mut self.role {
            RoleState::Leader { unacked_puts, .. } => {
                if !unacked_puts.is_empty() {
                    tracing::info!(
                        term = %self.term,
                        pending = unacked_puts.len(),
                        "stepping down with unacknowledged puts"
                    );
                }
                unacked_puts
                    .drain(..)
                    .map(|put| (put.client, put.mid))
                    .collect()
            }
            _ => Vec::new(),
        };
        self.role = RoleState::Follower;
        orphaned
    }

    fn redirect_all(&self, orphaned: Vec<(ReplicaId, String)>) -> Vec<Envelope> {
        orphaned
            .into_iter()
            .map(|(client, mid)| self.reply(client, Body::Redirect { mid }))
            .collect()
    }

    fn reply(&self, dst: ReplicaId, body: Body) -> Envelope {
        Envelope::new(self.id.clone(), dst, self.leader.clone(), body)
    }
}
