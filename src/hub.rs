//! The per-node connection hub.
//!
//! One [`ConnectionHub`] per node owns everything about remote peers:
//!
//! ```text
//!  ┌────────────────────────────────────────────────────────────────┐
//!  │                        ConnectionHub                           │
//!  │                                                                │
//!  │  ┌──────────────┐   snapshots   ┌─────────────────────────┐   │
//!  │  │  MdnsBroker  │──────────────▶│ dial scheduler (backoff) │   │
//!  │  └──────────────┘               └────────────┬────────────┘   │
//!  │                                              │ wss dial        │
//!  │  ┌──────────────┐  TLS accept   ┌────────────▼────────────┐   │
//!  │  │  ws server   │──────────────▶│  dedup per remote SKI   │   │
//!  │  └──────────────┘               └────────────┬────────────┘   │
//!  │                                              │                 │
//!  │                      ┌───────────────────────▼──────────────┐ │
//!  │                      │ ShipConnection (one per remote SKI)  │ │
//!  │                      └──────────────────────────────────────┘ │
//!  └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Inbound and outbound attempts for the same remote SKI are deduplicated
//! (SHIP 12.2.2, adapted: the connection initiated by the higher SKI is
//! kept), retries run with bounded randomized backoff, and the pairing
//! registry tracks trust per SKI for the lifetime of the process.

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use anyhow::{anyhow, Context as _, Result};
use futures_util::SinkExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::{HeaderValue, StatusCode};
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::api::{
    ConnectionState, ConnectionStateDetail, HubObserver, MdnsObserver, MdnsRecord, ShipError,
    SpineReader, SpineWriter, SHIP_WEBSOCKET_SUBPROTOCOL,
};
use crate::cert::{self, DeviceCertificate};
use crate::config::Config;
use crate::mdns::provider::MdnsSdProvider;
use crate::mdns::MdnsBroker;
use crate::ship::model::{Role, ShipState, SmeState};
use crate::ship::{ShipConnection, ShipContext};
use crate::ws::{websocket_config, WireConnection};

/// Delay buckets in seconds, indexed by the per-SKI attempt counter; the
/// last bucket repeats for all further attempts. Randomizing inside a
/// bucket limits simultaneous dials from both sides.
const CONNECTION_RETRY_BUCKETS: [(u64, u64); 3] = [(0, 3), (3, 10), (10, 20)];

/// How long a dropped double connection may drain before the socket dies.
const DOUBLE_CONNECTION_DRAIN: Duration = Duration::from_millis(100);

/// Timeout for each step of an outgoing dial (TCP, TLS, websocket).
const DIAL_STEP_TIMEOUT: Duration = Duration::from_secs(5);

/// Close code for a user-initiated disconnect.
const CLOSE_CODE_USER: u16 = 4500;
const CLOSE_REASON_USER: &str = "User close";

// ────────────────────────────────────────────────────────────────────────────
// Peer registry
// ────────────────────────────────────────────────────────────────────────────

/// Everything the hub remembers about one remote SKI. Created lazily on
/// first mention, lives for the process lifetime.
struct PeerService {
    ski: String,
    state: Mutex<PeerState>,
}

#[derive(Default)]
struct PeerState {
    ship_id: String,
    pinned_ipv4: Option<Ipv4Addr>,
    trusted: bool,
    detail: ConnectionStateDetail,
}

// ────────────────────────────────────────────────────────────────────────────
// Hub
// ────────────────────────────────────────────────────────────────────────────

/// Handle for the embedding application; all state lives behind a shared
/// inner, so clones refer to the same hub.
#[derive(Clone)]
pub struct ConnectionHub {
    inner: Arc<HubInner>,
}

struct HubInner {
    config: Config,
    certificate: DeviceCertificate,
    local_ski: String,
    local_ship_id: String,
    observer: Arc<dyn HubObserver>,
    mdns: Arc<MdnsBroker>,

    // Shared maps; lock scopes never nest so ordering cannot deadlock.
    connections: Mutex<HashMap<String, Arc<ShipConnection>>>,
    attempt_counter: Mutex<HashMap<String, usize>>,
    attempt_running: Mutex<HashMap<String, bool>>,
    services: Mutex<HashMap<String, Arc<PeerService>>>,

    cancel: CancellationToken,
    me: Weak<HubInner>,
}

impl ConnectionHub {
    /// Build a hub for the local identity in `config`, authenticated with
    /// `certificate`. Call [`start`](ConnectionHub::start) afterwards.
    pub fn new(
        config: Config,
        certificate: DeviceCertificate,
        observer: Arc<dyn HubObserver>,
    ) -> Result<Self> {
        let local_ski = certificate
            .ski()
            .context("local certificate has no usable SKI")?;
        let mdns = Arc::new(MdnsBroker::new(
            &config,
            &local_ski,
            vec![MdnsSdProvider::new()],
        ));

        let local_ship_id = config.identifier.clone();
        let inner = Arc::new_cyclic(|me| HubInner {
            config,
            certificate,
            local_ski,
            local_ship_id,
            observer,
            mdns,
            connections: Mutex::new(HashMap::new()),
            attempt_counter: Mutex::new(HashMap::new()),
            attempt_running: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            cancel: CancellationToken::new(),
            me: me.clone(),
        });

        Ok(Self { inner })
    }

    /// The SKI this node presents to peers.
    pub fn local_ski(&self) -> &str {
        &self.inner.local_ski
    }

    /// Start the websocket server and the mDNS announcement.
    pub async fn start(&self) -> Result<()> {
        let server_config = cert::server_tls_config(&self.inner.certificate)?;
        let listener = TcpListener::bind(("0.0.0.0", self.inner.config.port))
            .await
            .with_context(|| format!("binding websocket server to port {}", self.inner.config.port))?;
        log::debug!("starting websocket server on port {}", self.inner.config.port);

        let acceptor = TlsAcceptor::from(Arc::new(server_config));
        tokio::spawn(run_server(self.inner.clone(), listener, acceptor));

        self.inner.mdns.setup().context("setting up mDNS")?;
        self.inner.check_restart_mdns_search();
        Ok(())
    }

    /// Close every connection (unsafe close) and stop mDNS.
    pub fn shutdown(&self) {
        self.inner.cancel.cancel();
        self.inner.mdns.shutdown();
        let connections: Vec<_> = self.inner.connections.lock().values().cloned().collect();
        for connection in connections {
            connection.close_connection(false, 0, "");
        }
    }

    /// Mark a remote SKI as trusted or drop its trust. Dropping trust also
    /// closes a live connection with `4500 "User close"`.
    pub fn register_remote_ski(&self, ski: &str, trusted: bool) {
        self.inner.register_remote_ski(ski, trusted);
    }

    /// Start the pairing process for a SKI: approve a pending request when
    /// a connection exists, otherwise queue an immediate dial.
    pub fn initiate_pairing(&self, ski: &str) {
        self.inner.initiate_pairing(ski);
    }

    /// Cancel pairing: abort a pending handshake, reset retry state and
    /// clear trust.
    pub fn cancel_pairing(&self, ski: &str) {
        self.inner.cancel_pairing(ski);
    }

    /// Safe-close the connection to a SKI (e.g. after heartbeat failures in
    /// the upper layer).
    pub fn disconnect(&self, ski: &str, reason: &str) {
        let Some(connection) = self.inner.connection_for_ski(ski) else {
            return;
        };
        connection.close_connection(true, 0, reason);
    }

    pub fn is_paired(&self, ski: &str) -> bool {
        self.inner.is_ski_paired(ski)
    }

    /// Current pairing state; live connections report their handshake
    /// state, everything else the stored registry detail.
    pub fn pairing_detail(&self, ski: &str) -> ConnectionStateDetail {
        if let Some(connection) = self.inner.connection_for_ski(ski) {
            let (state, error) = connection.handshake_state();
            return ConnectionStateDetail::new(map_sme_state(state), error);
        }
        self.inner.service_for_ski(ski).state.lock().detail.clone()
    }

    /// Pin an IPv4 address for a SKI; it replaces the mDNS address list on
    /// the next dial.
    pub fn set_pinned_ipv4(&self, ski: &str, address: Ipv4Addr) {
        let service = self.inner.service_for_ski(ski);
        service.state.lock().pinned_ipv4 = Some(address);
    }

    /// Browse for SHIP services and surface them via
    /// [`HubObserver::visible_mdns_records_updated`].
    pub fn start_browse_mdns(&self) {
        if let Some(inner) = self.inner.me.upgrade() {
            self.inner.mdns.subscribe(inner as Arc<dyn MdnsObserver>);
        }
    }

    /// Stop browsing for SHIP services.
    pub fn stop_browse_mdns(&self) {
        self.inner.mdns.unsubscribe();
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Inner: registry and trust lifecycle
// ────────────────────────────────────────────────────────────────────────────

impl HubInner {
    fn service_for_ski(&self, ski: &str) -> Arc<PeerService> {
        let mut services = self.services.lock();
        services
            .entry(ski.to_string())
            .or_insert_with(|| {
                Arc::new(PeerService {
                    ski: ski.to_string(),
                    state: Mutex::new(PeerState::default()),
                })
            })
            .clone()
    }

    fn is_ski_paired(&self, ski: &str) -> bool {
        self.service_for_ski(ski).state.lock().trusted
    }

    fn pairing_state(&self, ski: &str) -> ConnectionState {
        self.service_for_ski(ski).state.lock().detail.state
    }

    fn set_detail(&self, ski: &str, detail: ConnectionStateDetail) {
        let service = self.service_for_ski(ski);
        service.state.lock().detail = detail.clone();
        self.observer.service_pairing_detail_update(ski, detail);
    }

    fn register_remote_ski(&self, ski: &str, trusted: bool) {
        let service = self.service_for_ski(ski);
        log::debug!("remote SKI {} trusted={trusted}", service.ski);
        service.state.lock().trusted = trusted;

        if trusted {
            self.check_restart_mdns_search();
            return;
        }

        self.remove_attempt_counter(ski);
        self.set_detail(ski, ConnectionStateDetail::default());
        if let Some(connection) = self.connection_for_ski(ski) {
            connection.close_connection(true, CLOSE_CODE_USER, CLOSE_REASON_USER);
        }
    }

    fn initiate_pairing(&self, ski: &str) {
        // remotely initiated: a connection is already waiting for approval
        if let Some(connection) = self.connection_for_ski(ski) {
            connection.approve_pending_handshake();
            return;
        }

        // locally initiated: queue and make sure discovery runs
        self.set_detail(
            ski,
            ConnectionStateDetail::new(ConnectionState::Queued, None),
        );
        if let Some(this) = self.me.upgrade() {
            self.mdns.subscribe(this as Arc<dyn MdnsObserver>);
        }
    }

    fn cancel_pairing(&self, ski: &str) {
        self.remove_attempt_counter(ski);

        if let Some(connection) = self.connection_for_ski(ski) {
            connection.abort_pending_handshake();
        }

        let service = self.service_for_ski(ski);
        service.state.lock().trusted = false;
        self.set_detail(ski, ConnectionStateDetail::default());
    }

    fn connection_for_ski(&self, ski: &str) -> Option<Arc<ShipConnection>> {
        self.connections.lock().get(ski).cloned()
    }

    fn is_ski_connected(&self, ski: &str) -> bool {
        self.connections.lock().contains_key(ski)
    }

    fn register_connection(&self, connection: Arc<ShipConnection>) {
        self.connections
            .lock()
            .insert(connection.remote_ski().to_string(), connection);
    }

    /// Restart discovery while trusted services are not all connected.
    fn check_restart_mdns_search(&self) {
        let paired = {
            let services = self.services.lock();
            services
                .values()
                .filter(|service| service.state.lock().trusted)
                .count()
        };
        let connected = self.connections.lock().len();

        if paired > connected {
            let _ = self.mdns.announce();
            if let Some(this) = self.me.upgrade() {
                self.mdns.subscribe(this as Arc<dyn MdnsObserver>);
            }
        }
    }

    // ── Retry coordination ───────────────────────────────────────────────

    fn is_attempt_running(&self, ski: &str) -> bool {
        self.attempt_running.lock().get(ski).copied().unwrap_or(false)
    }

    fn set_attempt_running(&self, ski: &str, running: bool) {
        self.attempt_running.lock().insert(ski.to_string(), running);
    }

    fn current_attempt_counter(&self, ski: &str) -> Option<usize> {
        self.attempt_counter.lock().get(ski).copied()
    }

    fn remove_attempt_counter(&self, ski: &str) {
        self.attempt_counter.lock().remove(ski);
    }

    /// Advance the attempt counter, saturating at the last bucket.
    fn bump_attempt_counter(&self, ski: &str) -> usize {
        let mut counters = self.attempt_counter.lock();
        let next = counters
            .get(ski)
            .map_or(0, |counter| (counter + 1).min(CONNECTION_RETRY_BUCKETS.len() - 1));
        counters.insert(ski.to_string(), next);
        next
    }

    /// Current attempt counter plus a uniformly random delay from its
    /// bucket, in milliseconds resolution.
    fn connection_initiation_delay(&self, ski: &str) -> (usize, Duration) {
        let counter = self.bump_attempt_counter(ski);
        let (min_s, max_s) = CONNECTION_RETRY_BUCKETS[counter];
        let millis = rand::thread_rng().gen_range(min_s * 1000..max_s * 1000);
        (counter, Duration::from_millis(millis))
    }

    fn coordinate_connection_attempt(self: &Arc<Self>, ski: &str, record: MdnsRecord) {
        if self.is_attempt_running(ski) {
            return;
        }
        self.set_attempt_running(ski, true);

        let (counter, delay) = self.connection_initiation_delay(ski);
        let queued = self.pairing_state(ski) == ConnectionState::Queued;

        let this = self.clone();
        let ski = ski.to_string();
        let cancel = self.cancel.clone();
        tokio::spawn(async move {
            if !queued {
                log::debug!(
                    "delaying connection to {ski} by {delay:?} to minimize double connection probability"
                );
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
            this.prepare_connection_attempt(&ski, counter, record).await;
        });
    }

    async fn prepare_connection_attempt(self: &Arc<Self>, ski: &str, counter: usize, record: MdnsRecord) {
        self.set_attempt_running(ski, false);

        // the counter moved (pairing was cancelled or reset): this attempt
        // is no longer relevant
        if self.current_attempt_counter(ski) != Some(counter) {
            return;
        }
        if !self.is_ski_paired(ski) && self.pairing_state(ski) != ConnectionState::Queued {
            return;
        }
        if self.is_ski_connected(ski) {
            return;
        }

        if !self.initiate_connection(ski, &record).await {
            self.check_restart_mdns_search();
        }
    }

    /// Try every announced address in order, then the hostname.
    async fn initiate_connection(self: &Arc<Self>, ski: &str, record: &MdnsRecord) -> bool {
        for address in &record.addresses {
            if !self.is_ski_paired(ski) && self.pairing_state(ski) != ConnectionState::Queued {
                return false;
            }

            let host = address.to_string();
            log::debug!("trying to connect to {ski} at {host}:{}", record.port);
            match self.dial(ski, &host, record.port, &record.path).await {
                Ok(()) => return true,
                Err(err) => log::debug!("connection to {ski} at {host} failed: {err}"),
            }
        }

        if !record.host.is_empty() {
            log::debug!("trying to connect to {ski} at {}:{}", record.host, record.port);
            match self.dial(ski, &record.host, record.port, &record.path).await {
                Ok(()) => return true,
                Err(err) => log::debug!("connection to {ski} at {} failed: {err}", record.host),
            }
        }

        false
    }

    // ── Outgoing connections ─────────────────────────────────────────────

    /// Dial `wss://host:port<path>`, falling back to the root path, verify
    /// the peer's SKI and hand the stream to a client-role handshake.
    async fn dial(self: &Arc<Self>, ski: &str, host: &str, port: u16, path: &str) -> Result<()> {
        if self.is_ski_connected(ski) {
            return Ok(());
        }

        match self.dial_once(ski, host, port, path).await {
            Ok(()) => Ok(()),
            Err(err) if path != "/" => {
                log::debug!("dial on {path} failed ({err}), retrying on /");
                self.dial_once(ski, host, port, "/").await
            }
            Err(err) => Err(err),
        }
    }

    async fn dial_once(self: &Arc<Self>, ski: &str, host: &str, port: u16, path: &str) -> Result<()> {
        let tls_config = Arc::new(cert::client_tls_config(&self.certificate)?);
        let connector = TlsConnector::from(tls_config);

        let tcp = timeout(DIAL_STEP_TIMEOUT, TcpStream::connect((host, port)))
            .await
            .context("tcp connect timed out")?
            .with_context(|| format!("tcp connect to {host}:{port}"))?;
        tcp.set_nodelay(true)?;

        let server_name = cert::server_name_for_host(host)?;
        let tls = timeout(DIAL_STEP_TIMEOUT, connector.connect(server_name, tcp))
            .await
            .context("tls handshake timed out")?
            .context("tls handshake")?;

        // SHIP 12.1: the peer is self-signed, identity is its SKI
        let remote_ski = {
            let (_, tls_state) = tls.get_ref();
            let certs = tls_state
                .peer_certificates()
                .ok_or_else(|| anyhow!("peer presented no certificate"))?;
            cert::ski_from_certificate(&certs[0])
                .map_err(|_| anyhow!("could not get remote SKI from certificate"))?
        };
        if remote_ski != ski {
            return Err(anyhow!("remote SKI {remote_ski} does not match expected {ski}"));
        }

        let url = format!("wss://{}:{}{}", host_for_url(host), port, path);
        let mut request = url
            .clone()
            .into_client_request()
            .with_context(|| format!("building websocket request for {url}"))?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static(SHIP_WEBSOCKET_SUBPROTOCOL),
        );

        let (ws, _response) = timeout(
            DIAL_STEP_TIMEOUT,
            tokio_tungstenite::client_async_with_config(request, tls, Some(websocket_config())),
        )
        .await
        .context("websocket handshake timed out")?
        .context("websocket handshake")?;

        if !self.keep_new_connection(ski, false) {
            reject_double_connection(ws).await;
            return Err(anyhow!("ignoring this connection, keeping the existing one"));
        }

        let remote_ship_id = self.service_for_ski(ski).state.lock().ship_id.clone();
        self.attach_connection(ws, Role::Client, ski, &remote_ship_id);
        Ok(())
    }

    // ── Incoming connections ─────────────────────────────────────────────

    async fn handle_incoming(self: Arc<Self>, tcp: TcpStream, acceptor: TlsAcceptor) {
        let tls = match acceptor.accept(tcp).await {
            Ok(tls) => tls,
            Err(err) => {
                log::debug!("tls accept failed: {err}");
                return;
            }
        };

        let ski = {
            let (_, tls_state) = tls.get_ref();
            let Some(certs) = tls_state.peer_certificates() else {
                log::debug!("client does not provide a certificate");
                return;
            };
            match cert::ski_from_certificate(&certs[0]) {
                Ok(ski) => ski,
                Err(err) => {
                    log::debug!("client certificate rejected: {err}");
                    return;
                }
            }
        };
        log::debug!("incoming connection request from {ski}");

        let ws = match tokio_tungstenite::accept_hdr_async_with_config(
            tls,
            require_ship_subprotocol,
            Some(websocket_config()),
        )
        .await
        {
            Ok(ws) => ws,
            Err(err) => {
                log::debug!("websocket upgrade failed: {err}");
                return;
            }
        };

        // an inbound connection for a queued SKI is the pairing request we
        // were waiting for
        {
            let service = self.service_for_ski(&ski);
            let flipped = {
                let mut state = service.state.lock();
                if state.detail.state == ConnectionState::Queued {
                    state.detail = ConnectionStateDetail::new(
                        ConnectionState::ReceivedPairingRequest,
                        None,
                    );
                    Some(state.detail.clone())
                } else {
                    None
                }
            };
            if let Some(detail) = flipped {
                self.observer.service_pairing_detail_update(&ski, detail);
            }
        }

        if !self.keep_new_connection(&ski, true) {
            reject_double_connection(ws).await;
            return;
        }

        let remote_ship_id = self.service_for_ski(&ski).state.lock().ship_id.clone();
        self.attach_connection(ws, Role::Server, &ski, &remote_ship_id);
    }

    fn attach_connection<S>(
        self: &Arc<Self>,
        ws: WebSocketStream<S>,
        role: Role,
        ski: &str,
        remote_ship_id: &str,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let context: Weak<dyn ShipContext> = {
            let strong: Arc<dyn ShipContext> = self.clone();
            Arc::downgrade(&strong)
        };

        let wire = WireConnection::new(ski);
        let connection = ShipConnection::new(
            context,
            wire.clone(),
            role,
            &self.local_ship_id,
            ski,
            remote_ship_id,
        );
        connection.start();
        wire.attach(ws, connection.clone());
        self.register_connection(connection);
    }

    /// SHIP 12.2.2 double-connection rule. Returns whether the *new*
    /// connection should be kept; a kept new connection evicts the
    /// registered one asynchronously.
    fn keep_new_connection(&self, ski: &str, incoming: bool) -> bool {
        let Some(existing) = self.connection_for_ski(ski) else {
            return true;
        };

        let keep = keep_most_recent(&self.local_ski, ski, incoming);
        if keep {
            log::debug!("closing existing double connection to {ski}");
            tokio::spawn(async move {
                existing.close_connection(false, 0, "");
            });
        } else {
            let direction = if incoming { "incoming" } else { "outgoing" };
            log::debug!("closing {direction} double connection to {ski}, keeping the existing one");
        }
        keep
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ShipContext: callbacks from the handshake machines
// ────────────────────────────────────────────────────────────────────────────

impl ShipContext for HubInner {
    fn is_ski_trusted(&self, ski: &str) -> bool {
        self.is_ski_paired(ski)
    }

    fn allow_waiting_for_trust(&self, ski: &str) -> bool {
        if self.is_ski_paired(ski) {
            return true;
        }
        self.observer.allow_waiting_for_trust(ski)
    }

    fn handshake_state_changed(&self, ski: &str, ship_state: ShipState) {
        // mutual HELLO success makes the pairing stick
        if ship_state.state == SmeState::HelloOk {
            self.register_remote_ski(ski, true);
        }

        let mut mapped = map_sme_state(ship_state.state);
        let mut error = ship_state.error;
        match &error {
            Some(ShipError::ConnectionNotFound) => error = None,
            Some(_) => mapped = ConnectionState::Error,
            None => {}
        }
        let detail = ConnectionStateDetail::new(mapped, error);

        let service = self.service_for_ski(ski);
        let changed = {
            let mut state = service.state.lock();
            if state.detail != detail {
                state.detail = detail.clone();
                true
            } else {
                false
            }
        };
        if changed {
            self.observer.service_pairing_detail_update(ski, detail);
        }
    }

    fn ship_id_confirmed(&self, ski: &str, ship_id: &str) {
        let service = self.service_for_ski(ski);
        service.state.lock().ship_id = ship_id.to_string();

        self.observer.remote_ski_connected(ski);
        self.observer.service_ship_id_update(ski, ship_id);
    }

    fn connection_closed(&self, ski: &str, conn_id: u64, handshake_completed: bool) {
        // only remove this connection when it is the registered one; a
        // deduplicated double connection must not evict its replacement
        let removed = {
            let mut connections = self.connections.lock();
            match connections.get(ski) {
                Some(existing) if existing.conn_id() == conn_id => {
                    connections.remove(ski);
                    true
                }
                _ => false,
            }
        };
        if removed && handshake_completed {
            self.remove_attempt_counter(ski);
        }

        self.observer.remote_ski_disconnected(ski);

        // failed handshakes to unpaired peers do not reconnect
        let trusted = self.service_for_ski(ski).state.lock().trusted;
        if !handshake_completed && !trusted {
            return;
        }
        // a peer that denied trust stays in the registry but is not redialed
        // until the user registers it again
        if self.pairing_state(ski) == ConnectionState::RemoteDeniedTrust {
            return;
        }
        self.check_restart_mdns_search();
    }

    fn setup_remote_device(&self, ski: &str, writer: Arc<dyn SpineWriter>) -> Arc<dyn SpineReader> {
        self.observer.setup_remote_device(ski, writer)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// MdnsObserver: discovery snapshots drive the dial scheduler
// ────────────────────────────────────────────────────────────────────────────

impl MdnsObserver for HubInner {
    fn report_mdns_records(&self, records: HashMap<String, MdnsRecord>) {
        let Some(this) = self.me.upgrade() else { return };

        let mut visible: Vec<MdnsRecord> = Vec::new();
        for (ski, record) in records {
            visible.push(record.clone());

            if this.is_ski_connected(&ski) {
                continue;
            }
            let service = this.service_for_ski(&ski);
            let (trusted, state, pinned) = {
                let state = service.state.lock();
                (state.trusted, state.detail.state, state.pinned_ipv4)
            };
            if !trusted && state != ConnectionState::Queued {
                continue;
            }

            let mut record = record;
            if let Some(pinned) = pinned {
                record.addresses = vec![IpAddr::V4(pinned)];
            }
            this.coordinate_connection_attempt(&ski, record);
        }

        visible.sort_by_key(|record| {
            format!("{}{}{}", record.brand, record.model, record.ski).to_lowercase()
        });
        this.observer.visible_mdns_records_updated(visible);
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Free helpers
// ────────────────────────────────────────────────────────────────────────────

async fn run_server(inner: Arc<HubInner>, listener: TcpListener, acceptor: TlsAcceptor) {
    loop {
        tokio::select! {
            _ = inner.cancel.cancelled() => return,
            accepted = listener.accept() => match accepted {
                Ok((tcp, peer)) => {
                    log::debug!("accepted tcp connection from {peer}");
                    tokio::spawn(inner.clone().handle_incoming(tcp, acceptor.clone()));
                }
                Err(err) => log::warn!("websocket server accept error: {err}"),
            }
        }
    }
}

/// Upgrade callback: SHIP 10.2 requires the `ship` subprotocol.
fn require_ship_subprotocol(
    request: &Request,
    mut response: Response,
) -> std::result::Result<Response, ErrorResponse> {
    let offered = request
        .headers()
        .get("Sec-WebSocket-Protocol")
        .and_then(|value| value.to_str().ok())
        .unwrap_or("");
    let supported = offered
        .split(',')
        .map(str::trim)
        .any(|protocol| protocol == SHIP_WEBSOCKET_SUBPROTOCOL);

    if !supported {
        log::debug!("client does not support the ship subprotocol");
        let reject = tokio_tungstenite::tungstenite::http::Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(Some("ship subprotocol required".to_string()))
            .expect("static response is valid");
        return Err(reject);
    }

    response.headers_mut().insert(
        "Sec-WebSocket-Protocol",
        HeaderValue::from_static(SHIP_WEBSOCKET_SUBPROTOCOL),
    );
    Ok(response)
}

/// Send a normal-closure frame with reason `"double connection"`, give the
/// peer a short drain window, then drop the socket.
async fn reject_double_connection<S>(mut ws: WebSocketStream<S>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "double connection".into(),
    };
    let _ = ws.send(Message::Close(Some(frame))).await;
    tokio::time::sleep(DOUBLE_CONNECTION_DRAIN).await;
    let _ = ws.close(None).await;
}

/// SHIP 12.2.2, adapted: keep the connection initiated by the higher SKI.
/// `incoming` says whether the *new* connection was accepted or dialed.
fn keep_most_recent(local_ski: &str, remote_ski: &str, incoming: bool) -> bool {
    if incoming {
        remote_ski > local_ski
    } else {
        local_ski > remote_ski
    }
}

fn host_for_url(host: &str) -> String {
    if host.parse::<std::net::Ipv6Addr>().is_ok() {
        format!("[{host}]")
    } else {
        host.to_string()
    }
}

/// Total projection of the internal machine states onto the public
/// [`ConnectionState`] set.
fn map_sme_state(state: SmeState) -> ConnectionState {
    match state {
        SmeState::CmiInitStart => ConnectionState::Queued,
        SmeState::CmiClientSend
        | SmeState::CmiClientWait
        | SmeState::CmiClientEvaluate
        | SmeState::CmiServerWait
        | SmeState::CmiServerEvaluate => ConnectionState::Initiated,
        SmeState::HelloReadyInit | SmeState::HelloReadyListen | SmeState::HelloReadyTimeout => {
            ConnectionState::InProgress
        }
        SmeState::HelloPendingInit
        | SmeState::HelloPendingListen
        | SmeState::HelloPendingTimeout => ConnectionState::ReceivedPairingRequest,
        SmeState::HelloOk => ConnectionState::Trusted,
        SmeState::HelloAbort | SmeState::HelloAbortDone => ConnectionState::None,
        SmeState::HelloRemoteAbortDone | SmeState::HelloRejected => {
            ConnectionState::RemoteDeniedTrust
        }
        SmeState::PinCheckInit
        | SmeState::PinCheckListen
        | SmeState::PinCheckOk
        | SmeState::PinCheckError
        | SmeState::PinCheckBusyInit
        | SmeState::PinCheckBusyWait
        | SmeState::PinAskInit
        | SmeState::PinAskProcess
        | SmeState::PinAskRestricted
        | SmeState::PinAskOk => ConnectionState::Pin,
        SmeState::Complete => ConnectionState::Completed,
        SmeState::Error => ConnectionState::Error,
        // Hello entry, protocol handshake, access methods, approval
        _ => ConnectionState::InProgress,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testcert::{TEST_CERT_PEM, TEST_CERT_SKI, TEST_KEY_PEM};
    use parking_lot::Mutex;

    #[derive(Default)]
    struct RecordingObserver {
        details: Mutex<Vec<(String, ConnectionStateDetail)>>,
        records: Mutex<Vec<Vec<MdnsRecord>>>,
    }

    impl HubObserver for RecordingObserver {
        fn remote_ski_connected(&self, _ski: &str) {}
        fn remote_ski_disconnected(&self, _ski: &str) {}
        fn service_ship_id_update(&self, _ski: &str, _ship_id: &str) {}
        fn service_pairing_detail_update(&self, ski: &str, detail: ConnectionStateDetail) {
            self.details.lock().push((ski.to_string(), detail));
        }
        fn visible_mdns_records_updated(&self, records: Vec<MdnsRecord>) {
            self.records.lock().push(records);
        }
        fn setup_remote_device(
            &self,
            _ski: &str,
            _writer: Arc<dyn SpineWriter>,
        ) -> Arc<dyn SpineReader> {
            struct Sink;
            impl SpineReader for Sink {
                fn handle_incoming_spine_message(&self, _payload: &[u8]) {}
            }
            Arc::new(Sink)
        }
        fn allow_waiting_for_trust(&self, _ski: &str) -> bool {
            false
        }
    }

    fn test_hub() -> (ConnectionHub, Arc<RecordingObserver>) {
        let certificate = DeviceCertificate::from_pem(TEST_CERT_PEM, TEST_KEY_PEM).unwrap();
        let observer = Arc::new(RecordingObserver::default());
        let config = Config {
            identifier: "Test-Hub".into(),
            ..Config::default()
        };
        let hub = ConnectionHub::new(config, certificate, observer.clone()).unwrap();
        (hub, observer)
    }

    #[tokio::test]
    async fn local_ski_comes_from_the_certificate() {
        let (hub, _observer) = test_hub();
        assert_eq!(hub.local_ski(), TEST_CERT_SKI);
    }

    #[tokio::test]
    async fn retry_delays_follow_the_buckets() {
        let (hub, _observer) = test_hub();
        let inner = &hub.inner;

        let expectations = [(0u64, 3u64), (3, 10), (10, 20), (10, 20), (10, 20)];
        for (attempt, (min_s, max_s)) in expectations.iter().enumerate() {
            let (counter, delay) = inner.connection_initiation_delay("peer");
            assert_eq!(counter, attempt.min(CONNECTION_RETRY_BUCKETS.len() - 1));
            assert!(delay >= Duration::from_secs(*min_s), "attempt {attempt}: {delay:?}");
            assert!(delay < Duration::from_secs(*max_s), "attempt {attempt}: {delay:?}");
        }
    }

    #[tokio::test]
    async fn cancel_pairing_resets_the_backoff() {
        let (hub, _observer) = test_hub();
        let inner = &hub.inner;

        for _ in 0..4 {
            inner.connection_initiation_delay("peer");
        }
        hub.cancel_pairing("peer");

        let (counter, delay) = inner.connection_initiation_delay("peer");
        assert_eq!(counter, 0);
        assert!(delay < Duration::from_secs(3));
    }

    #[test]
    fn dedup_keeps_the_higher_ski_initiator() {
        // new inbound connection: kept iff the remote SKI is higher
        assert!(keep_most_recent("aaaa", "bbbb", true));
        assert!(!keep_most_recent("bbbb", "aaaa", true));
        // new outbound connection: kept iff the local SKI is higher
        assert!(keep_most_recent("bbbb", "aaaa", false));
        assert!(!keep_most_recent("aaaa", "bbbb", false));
    }

    #[test]
    fn state_projection_covers_the_machine() {
        assert_eq!(map_sme_state(SmeState::CmiInitStart), ConnectionState::Queued);
        assert_eq!(map_sme_state(SmeState::CmiClientWait), ConnectionState::Initiated);
        assert_eq!(map_sme_state(SmeState::Hello), ConnectionState::InProgress);
        assert_eq!(
            map_sme_state(SmeState::HelloPendingListen),
            ConnectionState::ReceivedPairingRequest
        );
        assert_eq!(map_sme_state(SmeState::HelloOk), ConnectionState::Trusted);
        assert_eq!(map_sme_state(SmeState::HelloAbortDone), ConnectionState::None);
        assert_eq!(
            map_sme_state(SmeState::HelloRejected),
            ConnectionState::RemoteDeniedTrust
        );
        assert_eq!(map_sme_state(SmeState::PinCheckListen), ConnectionState::Pin);
        assert_eq!(
            map_sme_state(SmeState::ProtServerListenProposal),
            ConnectionState::InProgress
        );
        assert_eq!(map_sme_state(SmeState::Approved), ConnectionState::InProgress);
        assert_eq!(map_sme_state(SmeState::Complete), ConnectionState::Completed);
        assert_eq!(map_sme_state(SmeState::Error), ConnectionState::Error);
    }

    fn make_record(ski: &str, brand: &str) -> MdnsRecord {
        MdnsRecord {
            ski: ski.to_string(),
            identifier: format!("{brand}-Service"),
            path: crate::api::SHIP_WEBSOCKET_PATH.to_string(),
            name: brand.to_lowercase(),
            host: format!("{}.local.", brand.to_lowercase()),
            port: 4711,
            addresses: vec!["192.168.1.23".parse().unwrap()],
            brand: brand.to_string(),
            model: "Model".to_string(),
            device_type: "EVSE".to_string(),
            register: false,
        }
    }

    #[tokio::test]
    async fn mdns_snapshots_publish_sorted_records() {
        let (hub, observer) = test_hub();

        let records = HashMap::from([
            ("cccc".to_string(), make_record("cccc", "Zeta")),
            ("bbbb".to_string(), make_record("bbbb", "Alpha")),
        ]);
        hub.inner.report_mdns_records(records);

        let published = observer.records.lock();
        let brands: Vec<String> = published[0].iter().map(|r| r.brand.clone()).collect();
        assert_eq!(brands, vec!["Alpha", "Zeta"]);
        // untrusted, unqueued peers are not dialed
        assert!(!hub.inner.is_attempt_running("bbbb"));
        assert!(!hub.inner.is_attempt_running("cccc"));
    }

    #[tokio::test]
    async fn queued_peers_are_dialed_without_delay() {
        let (hub, _observer) = test_hub();
        hub.inner.set_detail(
            "bbbb",
            ConnectionStateDetail::new(ConnectionState::Queued, None),
        );

        let records = HashMap::from([("bbbb".to_string(), make_record("bbbb", "Alpha"))]);
        hub.inner.report_mdns_records(records);

        // an attempt was scheduled with the queued fast path
        assert_eq!(hub.inner.current_attempt_counter("bbbb"), Some(0));
    }

    #[tokio::test]
    async fn initiate_pairing_queues_unknown_peers() {
        let (hub, observer) = test_hub();

        hub.initiate_pairing("bbbb");

        assert!(!hub.is_paired("bbbb"));
        assert_eq!(hub.pairing_detail("bbbb").state, ConnectionState::Queued);
        let details = observer.details.lock();
        assert_eq!(details.last().unwrap().1.state, ConnectionState::Queued);
    }

    #[tokio::test]
    async fn register_and_unregister_trust() {
        let (hub, observer) = test_hub();

        hub.register_remote_ski("bbbb", true);
        assert!(hub.is_paired("bbbb"));

        hub.register_remote_ski("bbbb", false);
        assert!(!hub.is_paired("bbbb"));
        assert_eq!(hub.pairing_detail("bbbb").state, ConnectionState::None);
        assert!(!observer.details.lock().is_empty());
    }

    #[tokio::test]
    async fn hello_ok_marks_the_peer_trusted() {
        let (hub, _observer) = test_hub();

        hub.inner.handshake_state_changed(
            "bbbb",
            ShipState {
                state: SmeState::HelloOk,
                error: None,
            },
        );

        assert!(hub.is_paired("bbbb"));
        assert_eq!(hub.pairing_detail("bbbb").state, ConnectionState::Trusted);
    }

    #[tokio::test]
    async fn unchanged_details_are_not_republished() {
        let (hub, observer) = test_hub();

        let update = ShipState {
            state: SmeState::CmiClientWait,
            error: None,
        };
        hub.inner.handshake_state_changed("bbbb", update.clone());
        hub.inner.handshake_state_changed("bbbb", update);

        assert_eq!(observer.details.lock().len(), 1);
    }

    #[tokio::test]
    async fn connection_not_found_errors_are_suppressed() {
        let (hub, _observer) = test_hub();

        hub.inner.handshake_state_changed(
            "bbbb",
            ShipState {
                state: SmeState::CmiClientWait,
                error: Some(ShipError::ConnectionNotFound),
            },
        );

        let detail = hub.pairing_detail("bbbb");
        assert_eq!(detail.state, ConnectionState::Initiated);
        assert!(detail.error.is_none());
    }

    #[tokio::test]
    async fn other_errors_override_the_mapped_state() {
        let (hub, _observer) = test_hub();

        hub.inner.handshake_state_changed(
            "bbbb",
            ShipState {
                state: SmeState::CmiClientWait,
                error: Some(ShipError::Timeout),
            },
        );

        let detail = hub.pairing_detail("bbbb");
        assert_eq!(detail.state, ConnectionState::Error);
        assert_eq!(detail.error, Some(ShipError::Timeout));
    }
}
