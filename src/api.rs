//! Public surface of the SHIP node core.
//!
//! Everything the embedding application touches lives here: the observable
//! pairing states, the mDNS record type, the error taxonomy, and the
//! capability traits through which the node talks back to the application
//! (hub events, SPINE payload transfer, mDNS snapshots).

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

/// WebSocket subprotocol required by SHIP 10.2.
pub const SHIP_WEBSOCKET_SUBPROTOCOL: &str = "ship";

/// Well-known websocket path announced over mDNS (SHIP 7.3.2).
pub const SHIP_WEBSOCKET_PATH: &str = "/ship/";

// ────────────────────────────────────────────────────────────────────────────
// Errors
// ────────────────────────────────────────────────────────────────────────────

/// Error taxonomy of the node core.
///
/// Wire errors tear down the session, protocol violations abort the SHIP
/// handshake, policy decisions are silent no-ops at the hub level.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
pub enum ShipError {
    #[error("connection is closed")]
    ConnectionClosed,
    #[error("invalid ship message length")]
    InvalidMessageLength,
    #[error("message is not a binary message")]
    NotBinaryMessage,
    #[error("no connection found for this SKI")]
    ConnectionNotFound,
    #[error("no subject key identifier in certificate")]
    MissingSki,
    #[error("handshake timed out")]
    Timeout,
    #[error("protocol violation: {0}")]
    Protocol(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("no mDNS provider available")]
    NoMdnsProvider,
}

// ────────────────────────────────────────────────────────────────────────────
// Pairing states
// ────────────────────────────────────────────────────────────────────────────

/// Connection/pairing state of a remote SKI as exposed to the application.
///
/// This is the public projection of the internal SHIP message-exchange
/// states; the full machine is never visible outside the crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ConnectionState {
    /// No active pairing or connection process.
    None,
    /// Pairing was requested locally, waiting for the peer to show up.
    Queued,
    /// A connection attempt is being made.
    Initiated,
    /// SHIP handshake is running.
    InProgress,
    /// The peer asked for pairing and waits for local approval.
    ReceivedPairingRequest,
    /// PIN verification is in progress.
    Pin,
    /// Both sides trust each other, handshake not yet completed.
    Trusted,
    /// The remote side denied trust.
    RemoteDeniedTrust,
    /// The connection process failed.
    Error,
    /// Handshake completed, data exchange is possible.
    Completed,
}

/// A [`ConnectionState`] plus the error that caused it, if any.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionStateDetail {
    pub state: ConnectionState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ShipError>,
}

impl ConnectionStateDetail {
    pub fn new(state: ConnectionState, error: Option<ShipError>) -> Self {
        Self { state, error }
    }
}

impl Default for ConnectionStateDetail {
    fn default() -> Self {
        Self::new(ConnectionState::None, None)
    }
}

// ────────────────────────────────────────────────────────────────────────────
// mDNS records
// ────────────────────────────────────────────────────────────────────────────

/// A remote SHIP service discovered via mDNS.
///
/// Built from the mandatory TXT keys `txtvers`, `id`, `path`, `ski`,
/// `register` plus the optional `brand`, `model` and `type`. Address
/// updates for the same SKI are merged into `addresses` (union, first-seen
/// order preserved).
#[derive(Debug, Clone, Serialize)]
pub struct MdnsRecord {
    pub ski: String,
    /// The SHIP identifier announced in the `id` TXT key.
    pub identifier: String,
    pub path: String,
    /// mDNS instance name.
    pub name: String,
    pub host: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub brand: String,
    pub model: String,
    pub device_type: String,
    /// Whether the remote service auto-accepts registrations.
    pub register: bool,
}

// ────────────────────────────────────────────────────────────────────────────
// Application-facing traits
// ────────────────────────────────────────────────────────────────────────────

/// Consumer of SPINE payloads received from a remote device.
///
/// Payloads are delivered in receive order; anything that arrived before
/// the handshake completed is drained first.
pub trait SpineReader: Send + Sync {
    fn handle_incoming_spine_message(&self, payload: &[u8]);
}

/// Writer half handed to the application when a handshake completes; used
/// to push SPINE payloads to the remote device.
pub trait SpineWriter: Send + Sync {
    fn write_spine_message(&self, payload: &[u8]);
}

/// Callback set the hub invokes on the embedding application.
///
/// All callbacks are invoked outside of any hub lock; implementations may
/// call back into the hub.
pub trait HubObserver: Send + Sync {
    /// A SHIP handshake with this SKI completed.
    fn remote_ski_connected(&self, ski: &str);

    /// The connection to this SKI was closed.
    fn remote_ski_disconnected(&self, ski: &str);

    /// The remote service reported its SHIP ID during the handshake.
    fn service_ship_id_update(&self, ski: &str, ship_id: &str);

    /// The pairing state of a remote SKI changed.
    fn service_pairing_detail_update(&self, ski: &str, detail: ConnectionStateDetail);

    /// The set of currently visible mDNS services changed.
    fn visible_mdns_records_updated(&self, records: Vec<MdnsRecord>);

    /// A handshake completed; wire up the SPINE layer for this SKI and
    /// return the reader that should receive its payloads.
    fn setup_remote_device(&self, ski: &str, writer: Arc<dyn SpineWriter>) -> Arc<dyn SpineReader>;

    /// Whether the user can still decide about trusting this SKI. Gates
    /// HELLO prolongation handling.
    fn allow_waiting_for_trust(&self, ski: &str) -> bool;
}

/// Subscriber for mDNS record snapshots.
///
/// Each delivery is a full copy of the current record table, not a delta;
/// consumers must treat every snapshot as the latest truth.
pub trait MdnsObserver: Send + Sync {
    fn report_mdns_records(&self, records: HashMap<String, MdnsRecord>);
}
