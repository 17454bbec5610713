//! The replica event loop.
//!
//! One loop per replica, structured around three rules:
//! 1. The timer is checked at the top of every iteration, so an expired timer
//!    always wins over a pending message.
//! 2. Client requests deferred during a candidacy are preferred over the
//!    socket once the role settles.
//! 3. The loop otherwise blocks on the transport, bounded by the timer
//!    deadline.
//!
//! The loop is the only place that performs I/O; the [`Replica`] it drives is
//! a pure state machine.

use crate::message::Envelope;
use crate::replica::Replica;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::Instant;

/// Drive a replica over a transport until the transport fails.
///
/// Emits the `hello` announcement, then loops forever: timer first, deferred
/// client requests next, then the socket.
pub async fn run<T: Transport>(mut replica: Replica, transport: Arc<T>) -> crate::error::Result<()> {
    send_all(&*transport, vec![replica.hello()]).await;
    tracing::info!(id = %replica.id(), "replica started");

    loop {
        let out = replica.poll_timer(Instant::now());
        send_all(&*transport, out).await;

        if let Some(env) = replica.take_deferred() {
            let out = replica.handle(env, Instant::now());
            send_all(&*transport, out).await;
            continue;
        }

        let deadline = tokio::time::Instant::from_std(replica.timer_deadline());
        tokio::select! {
            received = transport.recv() => {
                let env = received?;
                if !addressed_to(&replica, &env) {
                    continue;
                }
                let out = replica.handle(env, Instant::now());
                send_all(&*transport, out).await;
            }
            _ = tokio::time::sleep_until(deadline) => {
                // Fall through; the next iteration observes the expiry.
            }
        }
    }
}

fn addressed_to(replica: &Replica, env: &Envelope) -> bool {
    &env.dst == replica.id() || env.dst.is_broadcast()
}

async fn send_all<T: Transport + ?Sized>(transport: &T, envelopes: Vec<Envelope>) {
    for env in envelopes {
        if let Err(err) = transport.send(env).await {
            // Losing an outbound datagram is within the protocol's failure
            // model; the loop keeps running.
            tracing::warn!(error = %err, "failed to send message");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReplicaConfig;
    use crate::message::{Body, BROADCAST};
    use crate::transport::InMemoryTransport;
    use crate::types::ReplicaId;
    use std::time::Duration;

    #[tokio::test]
    async fn emits_hello_on_startup() {
        let id = ReplicaId::new("0000");
        let replica = Replica::new(
            id.clone(),
            vec![ReplicaId::new("0001")],
            ReplicaConfig::default(),
            Instant::now(),
        );

        let transport = Arc::new(InMemoryTransport::new(id));
        let observer = InMemoryTransport::new(ReplicaId::new("obs"));
        transport.add_peer(ReplicaId::new("obs"), observer.sender());

        tokio::spawn(run(replica, transport));

        let first = tokio::time::timeout(Duration::from_millis(500), observer.recv())
            .await
            .expect("no startup message")
            .unwrap();
        assert_eq!(first.body, Body::Hello);
        assert_eq!(first.dst.as_str(), BROADCAST);
        assert_eq!(first.leader.as_str(), BROADCAST);
    }

    #[tokio::test]
    async fn lone_replica_campaigns_after_timeout() {
        let id = ReplicaId::new("0000");
        let replica = Replica::new(
            id.clone(),
            vec![ReplicaId::new("0001")],
            ReplicaConfig::default(),
            Instant::now(),
        );

        let transport = Arc::new(InMemoryTransport::new(id));
        let observer = InMemoryTransport::new(ReplicaId::new("obs"));
        transport.add_peer(ReplicaId::new("obs"), observer.sender());

        tokio::spawn(run(replica, transport));

        // hello, then a ReqVote once the election timeout fires.
        let _hello = observer.recv().await.unwrap();
        let vote = tokio::time::timeout(Duration::from_millis(800), observer.recv())
            .await
            .expect("no candidacy within election bounds")
            .unwrap();
        assert!(matches!(vote.body, Body::RequestVote { .. }));
    }
}
