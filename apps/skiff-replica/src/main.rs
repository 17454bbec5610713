//! The `replica` process: one node of the skiff key-value cluster.
//!
//! Usage: `replica <port> <id> <other_id>...`
//!
//! `<port>` is the shared simulator port all datagrams are sent to; `<id>` is
//! this replica's id; the remaining arguments are the other replicas. There
//! are no flags, no environment variables, and no persisted state.

use skiff_raft::transport::UdpTransport;
use skiff_raft::{Replica, ReplicaConfig, ReplicaId};
use std::sync::Arc;
use std::time::Instant;

const USAGE: &str = "usage: replica <port> <id> <other_id>...";

struct Args {
    port: u16,
    id: ReplicaId,
    others: Vec<ReplicaId>,
}

fn parse_args() -> Result<Args, String> {
    let mut args = std::env::args().skip(1);
    let port = args
        .next()
        .ok_or(USAGE)?
        .parse::<u16>()
        .map_err(|err| format!("invalid port: {err}"))?;
    let id = ReplicaId::new(args.next().ok_or(USAGE)?);
    let others: Vec<ReplicaId> = args.map(ReplicaId::new).collect();
    if others.is_empty() {
        return Err(USAGE.to_string());
    }
    Ok(Args { port, id, others })
}

// The replica is single-threaded by design; one worker thread is the runtime.
#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Logs go to stderr; stdout stays clean for the harness.
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .with_writer(std::io::stderr)
        .init();

    let args = parse_args()?;

    let config = ReplicaConfig::default();
    config.validate()?;

    let transport = Arc::new(UdpTransport::bind(args.port).await?);
    tracing::info!(
        id = %args.id,
        simulator_port = args.port,
        local = %transport.local_addr()?,
        "replica binding"
    );

    let replica = Replica::new(args.id, args.others, config, Instant::now());
    skiff_raft::server::run(replica, transport).await?;
    Ok(())
}
