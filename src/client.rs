//! Resolve server endpoints, send periodic registrations, send
//! broadcasts, deliver received datagrams to the upper layer (C7).

use std::{
    net::IpAddr,
    sync::{
        atomic::{AtomicI64, Ordering},
        Arc, Mutex,
    },
};

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{
    clock::{self, Clock, SystemClock, Timestamp},
    diagnostics::{Diagnostics, DiagnosticsSnapshot},
    envelope::{self, Envelope, EnvelopeType},
    error::StartError,
    membership::Endpoint,
    server::EngineState,
    settings::{ClientSettings, ServerAddr},
    transport::Transport,
};

/// One datagram delivered to the upper layer: the original sender's
/// address and the opaque payload (spec §4.6 `on_packet_received`).
pub type Received = (IpAddr, Vec<u8>);

/// A registered sink for delivered broadcasts, modeled on the
/// `OnResult`/boxed-consumer pattern (`src/client.rs`'s `BoxedConsume`
/// in the teacher) rather than a bare `fn` pointer, so closures that
/// capture state can be registered.
pub trait OnPacketReceived {
    fn apply(&self, received: Received);
}

impl<F: Fn(Received) + Send + Sync> OnPacketReceived for F {
    fn apply(&self, received: Received) {
        self(received)
    }
}

type BoxedHandler = Box<dyn OnPacketReceived + Send + Sync>;

struct Inner {
    settings: ClientSettings,
    clock: Arc<dyn Clock>,
    state: Mutex<EngineState>,
    transport: Mutex<Option<Arc<Transport>>>,
    self_endpoint: Mutex<Option<Endpoint>>,
    /// Literal endpoints resolved from `settings.servers` as of the
    /// last DNS refresh (spec §4.6: "the current resolved list is the
    /// active server set used by the send path").
    resolved_servers: Mutex<Vec<Endpoint>>,
    tasks: Mutex<Option<Tasks>>,
    last_registration_ticks: AtomicI64,
    last_resolve_ticks: AtomicI64,
    handler: Mutex<Option<BoxedHandler>>,
    diagnostics: Diagnostics,
}

struct Tasks {
    receive: JoinHandle<()>,
    tick: JoinHandle<()>,
}

/// One client node. Owns its transport, resolved-server list, and tick
/// task exclusively (spec §3 "Ownership").
#[derive(Clone)]
pub struct ClientEngine(Arc<Inner>);

impl ClientEngine {
    pub fn new(settings: ClientSettings) -> Self {
        Self::with_clock(settings, Arc::new(SystemClock))
    }

    pub fn with_clock(settings: ClientSettings, clock: Arc<dyn Clock>) -> Self {
        Self(Arc::new(Inner {
            settings,
            clock,
            state: Mutex::new(EngineState::Created),
            transport: Mutex::new(None),
            self_endpoint: Mutex::new(None),
            resolved_servers: Mutex::new(Vec::new()),
            tasks: Mutex::new(None),
            last_registration_ticks: AtomicI64::new(i64::MIN),
            last_resolve_ticks: AtomicI64::new(i64::MIN),
            handler: Mutex::new(None),
            diagnostics: Diagnostics::default(),
        }))
    }

    /// Registers a sink invoked once per successfully-parsed
    /// `BROADCAST` envelope whose `broadcast_group` matches this
    /// client's own (spec §4.6). Replaces any previously registered
    /// handler.
    pub fn on_packet_received<F>(&self, handler: F)
    where
        F: OnPacketReceived + Send + Sync + 'static,
    {
        *self.0.handler.lock().unwrap() = Some(Box::new(handler));
    }

    /// Binds the transport, performs an initial best-effort DNS
    /// resolution of configured servers, and starts the receive loop
    /// and tick task. Idempotent (spec §5).
    pub async fn start(&self) -> Result<(), StartError> {
        {
            let mut state = self.0.state.lock().unwrap();
            if *state == EngineState::Open {
                return Ok(());
            }
            *state = EngineState::Opening;
        }

        if let Err(err) = self.0.settings.validate() {
            tracing::error!(%err, "client failed to start: invalid configuration");
            self.fail_to_closed();
            return Err(err.into());
        }

        let transport = match Transport::bind(self.0.settings.network_binding, self.0.settings.socket_buffer_size) {
            Ok(transport) => transport,
            Err(source) => {
                tracing::error!(endpoint = %self.0.settings.network_binding, %source, "client failed to bind");
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
                tracing::error!(endpoint = %self.0.settings.network_binding, %source, "client failed to read bound local address");
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

        // Not required to succeed at start-up (spec §4.6: "the client
        // may start before DNS is ready"); unresolved names simply
        // drop out of the active set until the first tick resolves them.
        resolve_servers(&self.0).await;

        let receive = tokio::spawn(Self::receive_loop(self.0.clone(), transport.clone()));
        let tick = tokio::spawn(Self::tick_loop(self.0.clone()));
        *self.0.tasks.lock().unwrap() = Some(Tasks { receive, tick });

        *self.0.state.lock().unwrap() = EngineState::Open;
        info!(%self_endpoint, "client started");
        Ok(())
    }

    /// Drives a failed `start()` straight to `Closed` via `Closing`
    /// (spec §4.5/§4.6: "Faults transition directly to Closed via
    /// Closing"), so a fault never leaves the engine stuck in `Opening`.
    fn fail_to_closed(&self) {
        let mut state = self.0.state.lock().unwrap();
        *state = EngineState::Closing;
        *state = EngineState::Closed;
    }

    /// Sends `CLIENT_UNREGISTER` once to every currently-resolved
    /// server, stops the background tasks, and closes the transport.
    /// Idempotent.
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
            let targets = self.0.resolved_servers.lock().unwrap().clone();
            let envelope = Envelope {
                envelope_type: EnvelopeType::ClientUnregister,
                timestamp_utc: self.0.clock.now(),
                broadcast_group: self.0.settings.broadcast_group,
                source_address: self_endpoint.ip(),
                payload: Vec::new(),
            };
            let bytes = envelope::serialize(&envelope, &self.0.settings.shared_key);
            for target in targets {
                send_logged(&transport, &self.0.diagnostics, &bytes, target).await;
            }
        }

        if let Some(tasks) = self.0.tasks.lock().unwrap().take() {
            tasks.receive.abort();
            tasks.tick.abort();
        }
        *self.0.transport.lock().unwrap() = None;
        *self.0.state.lock().unwrap() = EngineState::Closed;
        info!("client closed");
    }

    /// Sends one `BROADCAST` envelope to every currently-resolved
    /// server. Any one server receiving it is sufficient, since
    /// exactly one (the master) will fan out; sending to all makes
    /// delivery robust to partial connectivity (spec §4.6 rationale).
    /// A no-op, never an error, when no servers are resolved yet.
    pub async fn broadcast(&self, payload: Vec<u8>) {
        let Some(self_endpoint) = *self.0.self_endpoint.lock().unwrap() else {
            return;
        };
        let Some(transport) = self.0.transport.lock().unwrap().clone() else {
            return;
        };
        let targets = self.0.resolved_servers.lock().unwrap().clone();
        if targets.is_empty() {
            debug!("broadcast() with no resolved servers, dropping silently");
            return;
        }

        let envelope = Envelope {
            envelope_type: EnvelopeType::Broadcast,
            timestamp_utc: self.0.clock.now(),
            broadcast_group: self.0.settings.broadcast_group,
            source_address: self_endpoint.ip(),
            payload,
        };
        let bytes = envelope::serialize(&envelope, &self.0.settings.shared_key);
        for target in targets {
            send_logged(&transport, &self.0.diagnostics, &bytes, target).await;
        }
    }

    pub fn resolved_servers(&self) -> Vec<Endpoint> {
        self.0.resolved_servers.lock().unwrap().clone()
    }

    pub fn get_diagnostics(&self) -> DiagnosticsSnapshot {
        self.0.diagnostics.snapshot()
    }

    pub fn self_endpoint(&self) -> Option<Endpoint> {
        *self.0.self_endpoint.lock().unwrap()
    }

    /// Test/ops hook onto the transport's fault-injection switch
    /// (spec §4.2).
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

    let last_registration = inner.last_registration_ticks.load(Ordering::SeqCst);
    let registration_due = last_registration == i64::MIN
        || clock::duration_since(now, last_registration) >= inner.settings.keepalive_interval;
    if registration_due {
        register(inner, now).await;
        inner.last_registration_ticks.store(now, Ordering::SeqCst);
    }

    let last_resolve = inner.last_resolve_ticks.load(Ordering::SeqCst);
    let resolve_due = last_resolve == i64::MIN
        || clock::duration_since(now, last_resolve) >= inner.settings.server_resolve_interval;
    if resolve_due {
        resolve_servers(inner).await;
        inner.last_resolve_ticks.store(now, Ordering::SeqCst);
    }
}

async fn register(inner: &Arc<Inner>, now: Timestamp) {
    let Some(self_endpoint) = *inner.self_endpoint.lock().unwrap() else {
        return;
    };
    let Some(transport) = inner.transport.lock().unwrap().clone() else {
        return;
    };
    let targets = inner.resolved_servers.lock().unwrap().clone();

    let envelope = Envelope {
        envelope_type: EnvelopeType::ClientRegister,
        timestamp_utc: now,
        broadcast_group: inner.settings.broadcast_group,
        source_address: self_endpoint.ip(),
        payload: Vec::new(),
    };
    let bytes = envelope::serialize(&envelope, &inner.settings.shared_key);
    for target in targets {
        send_logged(&transport, &inner.diagnostics, &bytes, target).await;
    }
}

/// Re-resolves every configured server (spec §4.6). Literal endpoints
/// pass through unchanged; named endpoints are looked up fresh each
/// call through `tokio::net::lookup_host`, the standard tokio idiom for
/// DNS resolution. A name that fails to resolve this round simply
/// drops out of the active set rather than failing the whole refresh.
async fn resolve_servers(inner: &Arc<Inner>) {
    let mut resolved = Vec::with_capacity(inner.settings.servers.len());
    for server in &inner.settings.servers {
        match server {
            ServerAddr::Literal(endpoint) => resolved.push(*endpoint),
            ServerAddr::Named { host, port } => {
                match tokio::net::lookup_host((host.as_str(), *port)).await {
                    Ok(addrs) => resolved.extend(addrs),
                    Err(err) => {
                        warn!(%host, %port, %err, "DNS resolution failed, dropping from active set");
                    }
                }
            }
        }
    }
    *inner.resolved_servers.lock().unwrap() = resolved;
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

    if envelope.envelope_type != EnvelopeType::Broadcast {
        return;
    }
    if envelope.broadcast_group != inner.settings.broadcast_group {
        return;
    }

    invoke_handler(inner, (envelope.source_address, envelope.payload));
}

fn invoke_handler(inner: &Arc<Inner>, received: Received) {
    let guard = inner.handler.lock().unwrap();
    let Some(handler) = guard.as_ref() else {
        return;
    };
    let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| handler.apply(received)));
    if let Err(panic) = result {
        warn!("on_packet_received handler panicked, discarding");
        drop(panic);
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
    use std::{sync::atomic::AtomicUsize, time::Duration};

    fn settings(servers: Vec<ServerAddr>) -> ClientSettings {
        ClientSettings {
            network_binding: "127.0.0.1:0".parse().unwrap(),
            socket_buffer_size: 1 << 16,
            servers,
            shared_key: SharedKey::new(*b"shared-secret"),
            message_ttl: Duration::from_secs(5),
            bk_task_interval: Duration::from_millis(20),
            keepalive_interval: Duration::from_millis(50),
            server_resolve_interval: Duration::from_millis(50),
            broadcast_group: 0,
        }
    }

    #[tokio::test]
    async fn broadcast_with_no_resolved_servers_is_silent_noop() {
        let client = ClientEngine::new(settings(vec![ServerAddr::Literal(
            "127.0.0.1:1".parse().unwrap(),
        )]));
        // Never started: resolved_servers stays empty, self_endpoint stays None.
        client.broadcast(b"x".to_vec()).await;
    }

    #[tokio::test]
    async fn start_is_idempotent() {
        let client = ClientEngine::new(settings(vec![ServerAddr::Literal(
            "127.0.0.1:1".parse().unwrap(),
        )]));
        client.start().await.unwrap();
        client.start().await.unwrap();
        client.close().await;
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let client = ClientEngine::new(settings(vec![ServerAddr::Literal(
            "127.0.0.1:1".parse().unwrap(),
        )]));
        client.start().await.unwrap();
        client.close().await;
        client.close().await;
    }

    #[tokio::test]
    async fn delivers_broadcast_matching_group_to_handler() {
        let server_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();

        let client = ClientEngine::new(settings(vec![ServerAddr::Literal(server_addr)]));
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        client.on_packet_received(move |(_, payload)| {
            if payload == b"hello" {
                received_clone.fetch_add(1, Ordering::SeqCst);
            }
        });
        client.start().await.unwrap();

        let key = SharedKey::new(*b"shared-secret");
        let envelope = Envelope {
            envelope_type: EnvelopeType::Broadcast,
            timestamp_utc: clock::now(),
            broadcast_group: 0,
            source_address: server_addr.ip(),
            payload: b"hello".to_vec(),
        };
        let bytes = envelope::serialize(&envelope, &key);
        let client_addr = client.self_endpoint().unwrap();
        server_socket.send_to(&bytes, client_addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 1);
        client.close().await;
    }

    #[tokio::test]
    async fn discards_broadcast_from_mismatched_group() {
        let server_socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server_socket.local_addr().unwrap();

        let mut cfg = settings(vec![ServerAddr::Literal(server_addr)]);
        cfg.broadcast_group = 0;
        let client = ClientEngine::new(cfg);
        let received = Arc::new(AtomicUsize::new(0));
        let received_clone = received.clone();
        client.on_packet_received(move |_| {
            received_clone.fetch_add(1, Ordering::SeqCst);
        });
        client.start().await.unwrap();

        let key = SharedKey::new(*b"shared-secret");
        let envelope = Envelope {
            envelope_type: EnvelopeType::Broadcast,
            timestamp_utc: clock::now(),
            broadcast_group: 100,
            source_address: server_addr.ip(),
            payload: b"other-group".to_vec(),
        };
        let bytes = envelope::serialize(&envelope, &key);
        let client_addr = client.self_endpoint().unwrap();
        server_socket.send_to(&bytes, client_addr).await.unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(received.load(Ordering::SeqCst), 0);
        client.close().await;
    }

    #[tokio::test]
    async fn named_server_resolves_to_loopback() {
        let mut cfg = settings(vec![ServerAddr::Named {
            host: "localhost".to_string(),
            port: 9999,
        }]);
        cfg.server_resolve_interval = Duration::from_secs(60);
        let client = ClientEngine::new(cfg);
        client.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let servers = client.resolved_servers();
        assert!(servers.iter().any(|s| s.ip().is_loopback()));
        client.close().await;
    }
}
