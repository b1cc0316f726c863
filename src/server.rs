//! Accept client registrations, relay broadcasts while master, gossip
//! keep-alives, purge stale peers (C6).

use std::{
    collections::HashSet,
    sync::{
        atomic::{AtomicBool, AtomicI64, Ordering},
        Arc, Mutex,
    },
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    clock::{self, Clock, SystemClock, Timestamp},
    diagnostics::{Diagnostics, DiagnosticsSnapshot},
    election,
    envelope::{self, Envelope, EnvelopeType},
    error::StartError,
    membership::{ClientEntry, ClientTable, Endpoint, ServerEntry, ServerTable},
    settings::ServerSettings,
    transport::Transport,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Created,
    Opening,
    Open,
    Closing,
    Closed,
}

#[derive(Default)]
struct Tables {
    servers: ServerTable,
    clients: ClientTable,
}

struct Tasks {
    receive: JoinHandle<()>,
    tick: JoinHandle<()>,
}

struct Inner {
    settings: ServerSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
    transport: Mutex<Option<Arc<Transport>>>,
    self_endpoint: Mutex<Option<Endpoint>>,
    tables: Mutex<Tables>,
    tasks: Mutex<Option<Tasks>>,
    last_keepalive_ticks: AtomicI64,
    cached_is_master: AtomicBool,
    diagnostics: Diagnostics,
}

/// One server node. Owns its transport, tables, and tick task
/// exclusively (spec §3 "Ownership"); cloning shares the same instance
/// (an `Arc` underneath), it does not create a second server.
#[derive(Clone)]
pub struct ServerEngine(Arc<Inner>);

impl ServerEngine {
    pub fn new(settings: ServerSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: ServerSettings, clock: Arc<dyn Clock>) -> Self {
        Self(Arc::new(Inner {
            settings,
            clock,
            state: Mutex::new(EngineState::Created),
            transport: Mutex::new(None),
            self_endpoint: Mutex::new(None),
            tables: Mutex::new(Tables::default()),
            tasks: Mutex::new(None),
            last_keepalive_ticks: AtomicI64::new(i64::MIN),
            cached_is_master: AtomicBool::new(false),
            diagnostics: Diagnostics::default(),
        }))
    }

    /// Binds the transport, installs the self `ServerEntry`, and starts
    /// the receive loop and tick task. Idempotent: a second call while
    /// already `Open` is a no-op (spec §5).
    pub async fn start(&self) -> Result<(), StartError> {
        {
            let mut state = self.0.state.lock().unwrap();
            if *state == EngineState::Open {
                return Ok(());
            }
            *state = EngineState::Opening;
        }

        if let Err(err) = self.0.settings.validate() {
            tracing::error!(%err, "server failed to start: invalid configuration");
            self.fail_to_closed();
            return Err(err.into());
        }

        let transport = match Transport::bind(self.0.settings.network_binding, self.0.settings.socket_buffer_size) {
            Ok(transport) => transport,
            Err(source) => {
                tracing::error!(endpoint = %self.0.settings.network_binding, %source, "server failed to bind");
                self.fail_to_closed();
                return Err(StartError::Bind {
                    endpoint: self.0.settings.network_binding,
                    source,
                });
            }
        };
        let self_endpoint = match transport.local_endpoint() {
            Ok(endpoint) => endpoint,
            Err(source) => {
                tracing::error!(endpoint = %self.0.settings.network_binding, %source, "server failed to read bound local address");
                self.fail_to_closed();
                return Err(StartError::Bind {
                    endpoint: self.0.settings.network_binding,
                    source,
                });
            }
        };
        let transport = Arc::new(transport);

        *self.0.transport.lock().unwrap() = Some(transport.clone());
        *self.0.self_endpoint.lock().unwrap() = Some(self_endpoint);

        let now = self.0.clock.now();
        {
            let mut tables = self.0.tables.lock().unwrap();
            tables.servers.upsert(self_endpoint, now, now);
        }

        let receive = tokio::spawn(Self::receive_loop(self.0.clone(), transport.clone()));
        let tick = tokio::spawn(Self::tick_loop(self.0.clone()));
        *self.0.tasks.lock().unwrap() = Some(Tasks { receive, tick });

        *self.0.state.lock().unwrap() = EngineState::Open;
        info!(%self_endpoint, "server started");
        Ok(())
    }

    /// Drives a failed `start()` straight to `Closed` via `Closing`
    /// (spec §4.5: "Faults transition directly to Closed via Closing"),
    /// so a fault never leaves the engine stuck in `Opening`.
    fn fail_to_closed(&self) {
        let mut state = self.0.state.lock().unwrap();
        *state = EngineState::Closing;
        *state = EngineState::Closed;
    }

    /// Sends `SERVER_UNREGISTER` to every known peer once, stops the
    /// background tasks, and closes the transport. Idempotent.
    pub async fn close(&self) {
        {
            let mut state = self.0.state.lock().unwrap();
            if *state == EngineState::Closed || *state == EngineState::Created {
                *state = EngineState::Closed;
                return;
            }
            *state = EngineState::Closing;
        }

        let self_endpoint = *self.0.self_endpoint.lock().unwrap();
        let transport = self.0.transport.lock().unwrap().clone();
        if let (Some(self_endpoint), Some(transport)) = (self_endpoint, transport) {
            let peers: Vec<Endpoint> = {
                let tables = self.0.tables.lock().unwrap();
                tables
                    .servers
                    .snapshot()
                    .into_iter()
                    .map(|entry| entry.endpoint)
                    .filter(|&endpoint| endpoint != self_endpoint)
                    .collect()
            };
            let envelope = Envelope {
                envelope_type: EnvelopeType::ServerUnregister,
                timestamp_utc: self.0.clock.now(),
                broadcast_group: 0,
                source_address: self_endpoint.ip(),
                payload: Vec::new(),
            };
            let bytes = envelope::serialize(&envelope, &self.0.settings.shared_key);
            for peer in peers {
                send_logged(&transport, &self.0.diagnostics, &bytes, peer).await;
            }
        }

        if let Some(tasks) = self.0.tasks.lock().unwrap().take() {
            tasks.receive.abort();
            tasks.tick.abort();
        }
        *self.0.transport.lock().unwrap() = None;
        *self.0.state.lock().unwrap() = EngineState::Closed;
        info!("server closed");
    }

    /// Cached result of the last tick's election recomputation (spec
    /// §4.5 tick step 3). The receive path re-derives a fresh verdict
    /// for the actual fan-out decision — see `handle_broadcast`.
    pub fn is_master(&self) -> bool {
        self.0.cached_is_master.load(Ordering::SeqCst)
    }

    pub fn get_servers(&self) -> Vec<ServerEntry> {
        self.0.tables.lock().unwrap().servers.snapshot()
    }

    pub fn get_clients(&self) -> Vec<ClientEntry> {
        self.0.tables.lock().unwrap().clients.snapshot()
    }

    pub fn get_diagnostics(&self) -> DiagnosticsSnapshot {
        self.0.diagnostics.snapshot()
    }

    pub fn self_endpoint(&self) -> Option<Endpoint> {
        *self.0.self_endpoint.lock().unwrap()
    }

    /// Test/ops hook onto the transport's fault-injection switch
    /// (spec §4.2, §8 scenario 3).
    pub fn set_pause_network(&self, paused: bool) {
        if let Some(transport) = self.0.transport.lock().unwrap().as_ref() {
            transport.set_pause_network(paused);
        }
    }

    async fn receive_loop(inner: Arc<Inner>, transport: Arc<Transport>) {
        loop {
            match transport.receive().await {
                Ok((datagram, source)) => handle_datagram(&inner, datagram, source).await,
                Err(err) => {
                    warn!(%err, "receive failed, continuing");
                }
            }
        }
    }

    async fn tick_loop(inner: Arc<Inner>) {
        let mut interval = tokio::time::interval(inner.settings.bk_task_interval);
        loop {
            interval.tick().await;
            tick(&inner).await;
        }
    }
}

async fn tick(inner: &Arc<Inner>) {
    let now = inner.clock.now();
    {
        let mut tables = inner.tables.lock().unwrap();
        tables.servers.sweep_expired(now, inner.settings.server_ttl);
        tables.clients.sweep_expired(now, inner.settings.client_ttl);
    }

    let last_keepalive = inner.last_keepalive_ticks.load(Ordering::SeqCst);
    let due = last_keepalive == i64::MIN
        || clock::duration_since(now, last_keepalive) >= inner.settings.cluster_keepalive_interval;
    if due {
        gossip(inner, now).await;
        inner.last_keepalive_ticks.store(now, Ordering::SeqCst);
    }

    if let Some(self_endpoint) = *inner.self_endpoint.lock().unwrap() {
        let mut tables = inner.tables.lock().unwrap();
        let master = election::is_master(self_endpoint, &mut tables.servers, now, inner.settings.server_ttl);
        inner.cached_is_master.store(master, Ordering::SeqCst);
    }
}

/// Sends `SERVER_REGISTER` to every configured peer, plus self, so the
/// self entry's liveness refreshes through the same receive-path code
/// as any other peer (spec §4.5 tick step 2: "including self, to
/// refresh own liveness").
async fn gossip(inner: &Arc<Inner>, now: Timestamp) {
    let Some(self_endpoint) = *inner.self_endpoint.lock().unwrap() else {
        return;
    };
    let Some(transport) = inner.transport.lock().unwrap().clone() else {
        return;
    };

    let mut targets: HashSet<Endpoint> = inner.settings.peers.iter().copied().collect();
    targets.insert(self_endpoint);

    let envelope = Envelope {
        envelope_type: EnvelopeType::ServerRegister,
        timestamp_utc: now,
        broadcast_group: 0,
        source_address: self_endpoint.ip(),
        payload: Vec::new(),
    };
    let bytes = envelope::serialize(&envelope, &inner.settings.shared_key);
    for target in targets {
        send_logged(&transport, &inner.diagnostics, &bytes, target).await;
    }
}

async fn handle_datagram(inner: &Arc<Inner>, datagram: Vec<u8>, source: Endpoint) {
    let now = inner.clock.now();
    let envelope = match envelope::parse(&datagram, &inner.settings.shared_key, now, inner.settings.message_ttl)
    {
        Ok(envelope) => envelope,
        Err(err) => {
            inner.diagnostics.record_parse_failure();
            debug!(%source, %err, "discarding unparseable datagram");
            return;
        }
    };

    match envelope.envelope_type {
        EnvelopeType::ServerRegister => {
            let mut tables = inner.tables.lock().unwrap();
            tables.servers.upsert(source, now, envelope.timestamp_utc);
        }
        EnvelopeType::ServerUnregister => {
            let mut tables = inner.tables.lock().unwrap();
            tables.servers.remove(&source);
        }
        EnvelopeType::ClientRegister => {
            let mut tables = inner.tables.lock().unwrap();
            tables.clients.upsert(source, envelope.broadcast_group, now);
        }
        EnvelopeType::ClientUnregister => {
            let mut tables = inner.tables.lock().unwrap();
            tables.clients.remove(&source);
        }
        EnvelopeType::Broadcast => handle_broadcast(inner, envelope, now).await,
    }
}

/// Fans a `BROADCAST` out to every registered client in the same
/// group, but only while this server is master right now (spec §4.5:
/// "Non-masters silently drop broadcasts; this is the single-master
/// property that guarantees at-most-one delivery per client").
async fn handle_broadcast(inner: &Arc<Inner>, incoming: Envelope, now: Timestamp) {
    let Some(self_endpoint) = *inner.self_endpoint.lock().unwrap() else {
        return;
    };

    let is_master = {
        let mut tables = inner.tables.lock().unwrap();
        election::is_master(self_endpoint, &mut tables.servers, now, inner.settings.server_ttl)
    };
    if !is_master {
        return;
    }

    let targets: Vec<Endpoint> = {
        let tables = inner.tables.lock().unwrap();
        tables
            .clients
            .in_group(incoming.broadcast_group)
            .map(|entry| entry.endpoint)
            .collect()
    };
    if targets.is_empty() {
        return;
    }

    let Some(transport) = inner.transport.lock().unwrap().clone() else {
        return;
    };
    let outgoing = Envelope {
        envelope_type: EnvelopeType::Broadcast,
        timestamp_utc: now,
        broadcast_group: incoming.broadcast_group,
        source_address: incoming.source_address,
        payload: incoming.payload,
    };
    let bytes = envelope::serialize(&outgoing, &inner.settings.shared_key);
    for target in targets {
        send_logged(&transport, &inner.diagnostics, &bytes, target).await;
    }
}

async fn send_logged(transport: &Transport, diagnostics: &Diagnostics, bytes: &[u8], destination: Endpoint) {
    if let Err(err) = transport.send(bytes, destination).await {
        diagnostics.record_send_failure();
        warn!(%destination, %err, "send failed, continuing");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::SharedKey;
    use std::time::Duration;

    fn settings() -> ServerSettings {
        ServerSettings {
            network_binding: "127.0.0.1:0".parse().unwrap(),
            socket_buffer_size: 1 << 16,
            peers: Vec::new(),
            shared_key: SharedKey::new(*b"shared-secret"),
            message_ttl: Duration::from_secs(5),
            bk_task_interval: Duration::from_millis(20),
            cluster_keepalive_interval: Duration::from_millis(100),
            server_ttl: Duration::from_secs(5),
            client_ttl: Duration::from_secs(10),
        }
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let server = ServerEngine::new(settings());
        server.start().await.unwrap();
        server.start().await.unwrap();
        server.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let server = ServerEngine::new(settings());
        server.start().await.unwrap();
        server.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn close_before_start_is_a_noop() {
        let server = ServerEngine::new(settings());
        server.close().await;
        server.close().await;
    }

    #[tokio::test]
    async fn invalid_settings_fails_start_and_leaves_engine_closed() {
        let mut cfg = settings();
        cfg.message_ttl = Duration::ZERO; // ConfigFail
        let server = ServerEngine::new(cfg);
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, StartError::Config(_)));
        assert_eq!(*server.0.state.lock().unwrap(), EngineState::Closed);
        // A fault-closed engine can still be closed again without panicking.
        server.close().await;
    }

    #[tokio::test]
    async fn bind_failure_fails_start_and_leaves_engine_closed() {
        // Occupy a port, then point a second engine's network_binding
        // at the exact same address so `Transport::bind` hits EADDRINUSE.
        let held = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let taken = held.local_addr().unwrap();

        let mut cfg = settings();
        cfg.network_binding = taken;
        let server = ServerEngine::new(cfg);
        let err = server.start().await.unwrap_err();
        assert!(matches!(err, StartError::Bind { .. }));
        assert_eq!(*server.0.state.lock().unwrap(), EngineState::Closed);
        drop(held);
    }

    #[tokio::test]
    async fn started_server_is_master_in_isolation() {
        let server = ServerEngine::new(settings());
        server.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(server.is_master());
        server.close().await;
    }
}
