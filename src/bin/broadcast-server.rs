//! Minimal runnable server node. Reads raw positional arguments the
//! same way the teacher's own `src/main.rs` does — configuration
//! loading and CLI wrapping are explicit non-goals (spec §1) so this
//! is plumbing, not a CLI surface.
//!
//! Usage: `broadcast-server <bind-addr> <shared-key> [peer-addr ...]`

use std::time::Duration;

use broadcast_relay::{envelope::SharedKey, server::ServerEngine, settings::ServerSettings};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let bind_addr = args
        .next()
        .expect("usage: broadcast-server <bind-addr> <shared-key> [peer-addr ...]")
        .parse()
        .expect("bind-addr must be an IP:port");
    let shared_key = args.next().expect("missing <shared-key>");
    let peers = args
        .map(|peer| peer.parse().expect("peer-addr must be an IP:port"))
        .collect();

    let settings = ServerSettings {
        network_binding: bind_addr,
        socket_buffer_size: 1 << 20,
        peers,
        shared_key: SharedKey::new(shared_key.into_bytes()),
        message_ttl: Duration::from_secs(5),
        bk_task_interval: Duration::from_millis(200),
        cluster_keepalive_interval: Duration::from_secs(1),
        server_ttl: Duration::from_secs(5),
        client_ttl: Duration::from_secs(10),
    };

    let server = ServerEngine::new(settings);
    server.start().await.expect("failed to start server");
    tracing::info!(master = server.is_master(), "server running, ctrl-c to stop");

    tokio::signal::ctrl_c().await.expect("failed to listen for ctrl-c");
    server.close().await;
}
