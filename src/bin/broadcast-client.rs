//! Minimal runnable client node: registers with every given server,
//! prints every delivered broadcast to stdout, and sends one broadcast
//! per line read from stdin.
//!
//! Usage: `broadcast-client <bind-addr> <shared-key> <group> <server-addr> [server-addr ...]`

use std::time::Duration;

use broadcast_relay::{
    client::ClientEngine,
    envelope::SharedKey,
    settings::{ClientSettings, ServerAddr},
};
use tokio::io::AsyncBufReadExt;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let mut args = std::env::args().skip(1);
    let usage = "usage: broadcast-client <bind-addr> <shared-key> <group> <server-addr> [server-addr ...]";
    let bind_addr = args.next().expect(usage).parse().expect("bind-addr must be an IP:port");
    let shared_key = args.next().expect(usage);
    let group: u32 = args.next().expect(usage).parse().expect("group must be an integer");
    let servers: Vec<ServerAddr> = args
        .map(|server| ServerAddr::Literal(server.parse().expect("server-addr must be an IP:port")))
        .collect();
    if servers.is_empty() {
        panic!("{usage}");
    }

    let settings = ClientSettings {
        network_binding: bind_addr,
        socket_buffer_size: 1 << 20,
        servers,
        shared_key: SharedKey::new(shared_key.into_bytes()),
        message_ttl: Duration::from_secs(5),
        bk_task_interval: Duration::from_millis(200),
        keepalive_interval: Duration::from_secs(2),
        server_resolve_interval: Duration::from_secs(30),
        broadcast_group: group,
    };

    let client = ClientEngine::new(settings);
    client.on_packet_received(|(source, payload)| {
        println!("{source}: {}", String::from_utf8_lossy(&payload));
    });
    client.start().await.expect("failed to start client");
    tracing::info!("client running, type a line to broadcast it, ctrl-d to stop");

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let mut lines = stdin.lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => client.broadcast(line.into_bytes()).await,
                    _ => break,
                }
            }
            _ = tokio::signal::ctrl_c() => break,
        }
    }

    client.close().await;
}
