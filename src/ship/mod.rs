//! Per-connection SHIP protocol driver.
//!
//! A [`ShipConnection`] runs the SHIP message-exchange state machine over
//! one wire connection and, once the handshake completed, multiplexes SPINE
//! datagrams over the same socket.
//!
//! ## Event model
//!
//! Five event sources feed a single in-box per connection: inbound wire
//! frames, wire errors, timer expiries, and application approve/abort
//! calls. One task drains the in-box, so the machine processes events
//! strictly in arrival order and every handler runs single-threaded. The
//! internal mutexes only protect the state/timer tuple against concurrent
//! *reads* (the hub asks for the pairing state from other tasks).
//!
//! The phase handlers live in sibling modules: [`hello`], [`prot`],
//! [`pin`], [`access`].

pub(crate) mod access;
pub(crate) mod codec;
pub(crate) mod hello;
pub(crate) mod model;
pub(crate) mod pin;
pub(crate) mod prot;
#[cfg(test)]
pub(crate) mod testutil;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Once, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::api::{ShipError, SpineReader, SpineWriter};
use crate::ship::model::{
    ConnectionClose, ConnectionClosePhase, Role, ShipState, SmeState, TimerKind, MSG_TYPE_END,
    SHIP_INIT_FRAME, T_HANDSHAKE_TIMEOUT,
};
use crate::ws::{WireReader, WireTransport};

/// Generic close code for failed or aborted connections.
pub(crate) const CLOSE_CODE_GENERIC: u16 = 4001;
/// The local application rejected the pairing request.
pub(crate) const CLOSE_CODE_REJECTED: u16 = 4452;
pub(crate) const CLOSE_REASON_REJECTED: &str = "Node rejected by application";

/// Cap for SPINE messages buffered before the upper layer is wired in.
const MAX_SPINE_BUFFER: usize = 100;

static CONNECTION_IDS: AtomicU64 = AtomicU64::new(1);

// ────────────────────────────────────────────────────────────────────────────
// Hub-facing contract
// ────────────────────────────────────────────────────────────────────────────

/// What the handshake machine needs from its hub. The hub owns the machine;
/// the machine only holds this non-owning back-reference.
pub(crate) trait ShipContext: Send + Sync {
    /// Whether the remote SKI is trusted/paired; gates the HELLO phase.
    fn is_ski_trusted(&self, ski: &str) -> bool;

    /// Whether the user can still decide about trusting this SKI.
    fn allow_waiting_for_trust(&self, ski: &str) -> bool;

    /// A state transition happened.
    fn handshake_state_changed(&self, ski: &str, state: ShipState);

    /// The handshake completed and the remote SHIP ID is confirmed.
    fn ship_id_confirmed(&self, ski: &str, ship_id: &str);

    /// The connection was torn down. `conn_id` identifies which machine
    /// instance closed, so a deduplicated double connection cannot evict
    /// its replacement from the registry.
    fn connection_closed(&self, ski: &str, conn_id: u64, handshake_completed: bool);

    /// Wire up the SPINE layer for a completed handshake.
    fn setup_remote_device(&self, ski: &str, writer: Arc<dyn SpineWriter>) -> Arc<dyn SpineReader>;
}

// ────────────────────────────────────────────────────────────────────────────
// Connection state
// ────────────────────────────────────────────────────────────────────────────

enum ShipEvent {
    Kickoff,
    WireMessage(Vec<u8>),
    WireError(ShipError),
    TimerFired { kind: TimerKind, generation: u64 },
    Approve,
    Abort,
}

struct SmeStatus {
    state: SmeState,
    error: Option<ShipError>,
}

struct HandshakeTimer {
    kind: Option<TimerKind>,
    generation: u64,
    running: bool,
    handle: Option<JoinHandle<()>>,
}

struct SpineLink {
    reader: Option<Arc<dyn SpineReader>>,
    buffer: Vec<Vec<u8>>,
}

pub(crate) struct ShipConnection {
    role: Role,
    conn_id: u64,
    local_ship_id: String,
    remote_ski: String,
    remote_ship_id: Mutex<String>,
    context: Weak<dyn ShipContext>,
    wire: Arc<dyn WireTransport>,
    me: Weak<ShipConnection>,
    sme: Mutex<SmeStatus>,
    timer: Mutex<HandshakeTimer>,
    /// Last `waiting` value announced by the peer; drives the prolongation
    /// request timing.
    last_received_waiting: Mutex<Option<Duration>>,
    spine: Mutex<SpineLink>,
    inbox: mpsc::UnboundedSender<ShipEvent>,
    inbox_rx: Mutex<Option<mpsc::UnboundedReceiver<ShipEvent>>>,
    shutdown: Once,
}

impl ShipConnection {
    /// Create a machine bound to a wire connection. Call [`start`] to spawn
    /// the event loop; tests drive the handlers directly instead.
    ///
    /// [`start`]: ShipConnection::start
    pub(crate) fn new(
        context: Weak<dyn ShipContext>,
        wire: Arc<dyn WireTransport>,
        role: Role,
        local_ship_id: &str,
        remote_ski: &str,
        remote_ship_id: &str,
    ) -> Arc<Self> {
        let (inbox, inbox_rx) = mpsc::unbounded_channel();
        Arc::new_cyclic(|me| Self {
            role,
            conn_id: CONNECTION_IDS.fetch_add(1, Ordering::Relaxed),
            local_ship_id: local_ship_id.to_string(),
            remote_ski: remote_ski.to_string(),
            remote_ship_id: Mutex::new(remote_ship_id.to_string()),
            context,
            wire,
            me: me.clone(),
            sme: Mutex::new(SmeStatus {
                state: SmeState::CmiInitStart,
                error: None,
            }),
            timer: Mutex::new(HandshakeTimer {
                kind: None,
                generation: 0,
                running: false,
                handle: None,
            }),
            last_received_waiting: Mutex::new(None),
            spine: Mutex::new(SpineLink {
                reader: None,
                buffer: Vec::new(),
            }),
            inbox,
            inbox_rx: Mutex::new(Some(inbox_rx)),
            shutdown: Once::new(),
        })
    }

    /// Spawn the event loop and kick the CMI phase off.
    pub(crate) fn start(self: &Arc<Self>) {
        let mut rx = self
            .inbox_rx
            .lock()
            .take()
            .expect("ship connection started twice");
        let this = self.clone();
        let _ = self.inbox.send(ShipEvent::Kickoff);
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                this.process_event(event);
            }
        });
    }

    pub(crate) fn remote_ski(&self) -> &str {
        &self.remote_ski
    }

    pub(crate) fn conn_id(&self) -> u64 {
        self.conn_id
    }

    /// Current state and error value, readable from any task.
    pub(crate) fn handshake_state(&self) -> (SmeState, Option<ShipError>) {
        let sme = self.sme.lock();
        (sme.state, sme.error.clone())
    }

    /// Approve a pending pairing request (application decision).
    pub(crate) fn approve_pending_handshake(&self) {
        let _ = self.inbox.send(ShipEvent::Approve);
    }

    /// Deny a pending pairing request (application decision).
    pub(crate) fn abort_pending_handshake(&self) {
        let _ = self.inbox.send(ShipEvent::Abort);
    }

    // ── Event processing ─────────────────────────────────────────────────

    fn process_event(&self, event: ShipEvent) {
        match event {
            ShipEvent::Kickoff => self.handle_ship_message(false, None),
            ShipEvent::WireMessage(message) => {
                if codec::has_spine_datagram(&message) {
                    self.handle_spine_frame(&message);
                } else {
                    self.handle_ship_message(false, Some(&message));
                }
            }
            ShipEvent::WireError(error) => self.handle_wire_error(error),
            ShipEvent::TimerFired { kind, generation } => {
                self.handle_timer_fired(kind, generation)
            }
            ShipEvent::Approve => self.approve_pending(),
            ShipEvent::Abort => self.abort_pending(),
        }
    }

    /// Wire-event entry point: dispatch, then resolve terminal states into
    /// the matching teardown.
    pub(crate) fn handle_ship_message(&self, timeout: bool, message: Option<&[u8]>) {
        self.handle_state(timeout, message);

        let (state, _) = self.handshake_state();
        match state {
            SmeState::Error => self.close_connection(false, 0, ""),
            SmeState::HelloAbortDone => {
                self.close_connection(false, CLOSE_CODE_REJECTED, CLOSE_REASON_REJECTED)
            }
            // The remote side aborted; it closes the socket, our wire-error
            // path finishes the teardown.
            _ => {}
        }
    }

    /// The state dispatcher. Transient states fall through to their phase
    /// handler; terminal states ignore further input.
    pub(crate) fn handle_state(&self, timeout: bool, message: Option<&[u8]>) {
        let (state, _) = self.handshake_state();
        match state {
            SmeState::CmiInitStart => match self.role {
                Role::Client => self.cmi_client_start(),
                Role::Server => self.cmi_server_start(),
            },
            SmeState::CmiClientWait => {
                if timeout {
                    self.set_state(SmeState::Error, Some(ShipError::Timeout));
                } else {
                    self.cmi_client_evaluate(message);
                }
            }
            SmeState::CmiServerWait => {
                if timeout {
                    self.set_state(SmeState::Error, Some(ShipError::Timeout));
                } else {
                    self.cmi_server_evaluate(message);
                }
            }
            SmeState::Hello => self.hello_init(),
            SmeState::HelloReadyListen => self.hello_ready_listen(timeout, message),
            SmeState::HelloPendingListen => self.hello_pending_listen(timeout, message),
            SmeState::HelloOk => match self.role {
                Role::Server => self.prot_server_init(),
                Role::Client => self.prot_client_init(),
            },
            SmeState::ProtServerListenProposal => self.prot_server_listen_proposal(timeout, message),
            SmeState::ProtServerListenConfirm => self.prot_server_listen_confirm(timeout, message),
            SmeState::ProtClientListenChoice => self.prot_client_listen_choice(timeout, message),
            SmeState::PinCheckListen => self.pin_check_listen(timeout, message),
            SmeState::PinCheckOk => self.access_request_init(),
            SmeState::AccessMethodsRequest => self.access_methods_request(timeout, message),
            SmeState::Complete => self.handle_post_complete(message),
            _ => {}
        }
    }

    // ── CMI phase (SHIP 13.4.3) ──────────────────────────────────────────

    fn cmi_client_start(&self) {
        self.set_state(SmeState::CmiClientSend, None);
        if let Err(error) = self.wire.send_frame(SHIP_INIT_FRAME.to_vec()) {
            self.set_state(SmeState::Error, Some(error));
            return;
        }
        self.start_handshake_timer(TimerKind::WaitForReady, T_HANDSHAKE_TIMEOUT);
        self.set_state(SmeState::CmiClientWait, None);
    }

    fn cmi_client_evaluate(&self, message: Option<&[u8]>) {
        self.stop_handshake_timer();
        self.set_state(SmeState::CmiClientEvaluate, None);
        if message != Some(&SHIP_INIT_FRAME[..]) {
            self.set_state(
                SmeState::Error,
                Some(ShipError::Protocol("invalid CMI init response".into())),
            );
            return;
        }
        self.set_and_handle(SmeState::Hello);
    }

    fn cmi_server_start(&self) {
        self.start_handshake_timer(TimerKind::WaitForReady, T_HANDSHAKE_TIMEOUT);
        self.set_state(SmeState::CmiServerWait, None);
    }

    fn cmi_server_evaluate(&self, message: Option<&[u8]>) {
        self.stop_handshake_timer();
        self.set_state(SmeState::CmiServerEvaluate, None);
        if message != Some(&SHIP_INIT_FRAME[..]) {
            self.set_state(
                SmeState::Error,
                Some(ShipError::Protocol("invalid CMI init message".into())),
            );
            return;
        }
        if let Err(error) = self.wire.send_frame(SHIP_INIT_FRAME.to_vec()) {
            self.set_state(SmeState::Error, Some(error));
            return;
        }
        self.set_and_handle(SmeState::Hello);
    }

    // ── Post-complete control plane ──────────────────────────────────────

    fn handle_post_complete(&self, message: Option<&[u8]>) {
        let Some(message) = message else { return };
        if message.first() != Some(&MSG_TYPE_END) {
            return;
        }
        let Some(close) = codec::decode_model::<ConnectionClose>(message) else {
            return;
        };
        if close.close.phase == ConnectionClosePhase::Announce {
            let _ = self.send_model(MSG_TYPE_END, &ConnectionClose::confirm());
            self.close_connection(false, 0, "");
        }
    }

    // ── State handling ───────────────────────────────────────────────────

    pub(crate) fn set_state(&self, state: SmeState, error: Option<ShipError>) {
        {
            let mut sme = self.sme.lock();
            sme.state = state;
            sme.error = error.clone();
        }
        if let Some(context) = self.context.upgrade() {
            context.handshake_state_changed(&self.remote_ski, ShipState { state, error });
        }
    }

    pub(crate) fn set_and_handle(&self, state: SmeState) {
        self.set_state(state, None);
        self.handle_state(false, None);
    }

    // ── Handshake timer ──────────────────────────────────────────────────

    pub(crate) fn start_handshake_timer(&self, kind: TimerKind, duration: Duration) {
        let mut timer = self.timer.lock();
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        timer.kind = Some(kind);
        timer.running = true;

        let generation = timer.generation;
        let inbox = self.inbox.clone();
        timer.handle = Some(tokio::spawn(async move {
            tokio::time::sleep(duration).await;
            let _ = inbox.send(ShipEvent::TimerFired { kind, generation });
        }));
    }

    pub(crate) fn stop_handshake_timer(&self) {
        let mut timer = self.timer.lock();
        timer.generation += 1;
        if let Some(handle) = timer.handle.take() {
            handle.abort();
        }
        timer.kind = None;
        timer.running = false;
    }

    pub(crate) fn handshake_timer_running(&self) -> bool {
        self.timer.lock().running
    }

    /// The kind of the active (or last fired) timer.
    pub(crate) fn handshake_timer_kind(&self) -> Option<TimerKind> {
        self.timer.lock().kind
    }

    fn handle_timer_fired(&self, kind: TimerKind, generation: u64) {
        {
            let mut timer = self.timer.lock();
            if timer.generation != generation || !timer.running {
                return;
            }
            timer.running = false;
            timer.kind = Some(kind);
        }
        self.handle_ship_message(true, None);
    }

    // ── Outgoing messages ────────────────────────────────────────────────

    /// Serialize and send a SHIP model; a closed wire tears the session
    /// down instead.
    pub(crate) fn send_model<T: Serialize>(&self, msg_type: u8, model: &T) -> Result<(), ShipError> {
        let (closed, error) = self.wire.close_state();
        if closed {
            self.close_connection(false, 0, "");
            return Err(error.unwrap_or(ShipError::ConnectionClosed));
        }
        let frame = codec::encode_model(msg_type, model)?;
        self.wire.send_frame(frame)
    }

    // ── SPINE data plane ─────────────────────────────────────────────────

    fn handle_spine_frame(&self, message: &[u8]) {
        let payload = match codec::decode_spine_payload(message) {
            Ok(payload) => payload,
            Err(error) => {
                log::debug!("[{}] dropping invalid data frame: {}", self.remote_ski, error);
                return;
            }
        };

        let reader = {
            let mut spine = self.spine.lock();
            match spine.reader.clone() {
                Some(reader) => Some(reader),
                None => {
                    if spine.buffer.len() < MAX_SPINE_BUFFER {
                        spine.buffer.push(payload.clone());
                    } else {
                        log::warn!(
                            "[{}] spine buffer full, dropping early message",
                            self.remote_ski
                        );
                    }
                    None
                }
            }
        };

        if let Some(reader) = reader {
            reader.handle_incoming_spine_message(&payload);
        }
    }

    /// Install the upper-layer reader and drain everything that arrived
    /// before the handshake completed, in order.
    pub(crate) fn install_spine_reader(&self, reader: Arc<dyn SpineReader>) {
        let buffered = {
            let mut spine = self.spine.lock();
            spine.reader = Some(reader.clone());
            std::mem::take(&mut spine.buffer)
        };
        for payload in buffered {
            reader.handle_incoming_spine_message(&payload);
        }
    }

    pub(crate) fn spine_writer(&self) -> Option<Arc<dyn SpineWriter>> {
        self.me.upgrade().map(|me| me as Arc<dyn SpineWriter>)
    }

    // ── Wire error handling ──────────────────────────────────────────────

    /// The transport failed or was closed by the peer. Which terminal state
    /// that maps to depends on where the handshake stood: a close while we
    /// announced READY is a rejection (the peer sends `4452` after its
    /// pending phase), a close after an abort exchange is expected.
    fn handle_wire_error(&self, error: ShipError) {
        let (state, _) = self.handshake_state();
        match state {
            SmeState::HelloReadyListen => {
                self.set_state(SmeState::HelloRejected, None);
                self.close_connection(false, 0, "");
            }
            SmeState::HelloRemoteAbortDone => {
                self.close_connection(false, 0, "");
            }
            SmeState::HelloAbort | SmeState::HelloAbortDone => {
                self.close_connection(false, CLOSE_CODE_REJECTED, CLOSE_REASON_REJECTED);
            }
            _ => {
                self.set_state(SmeState::Error, Some(error));
                self.close_connection(false, 0, "");
            }
        }
    }

    // ── Teardown ─────────────────────────────────────────────────────────

    /// Close this connection exactly once.
    ///
    /// A safe close from `Complete` announces the termination over SHIP
    /// before the websocket goes down; everything else is a direct
    /// websocket close with `code` (default 4001).
    pub(crate) fn close_connection(&self, safe: bool, code: u16, reason: &str) {
        self.shutdown.call_once(|| {
            self.stop_handshake_timer();

            let (state, _) = self.handshake_state();
            let handshake_end = matches!(
                state,
                SmeState::Complete
                    | SmeState::HelloAbortDone
                    | SmeState::HelloRemoteAbortDone
                    | SmeState::HelloRejected
            );

            if safe && state == SmeState::Complete {
                // SHIP 13.4.7: announce the termination, then drop the wire.
                // Writes the frame directly: send_model would re-enter this
                // shutdown on an already-closed wire.
                let announce = ConnectionClose::announce(reason);
                if let Ok(frame) = codec::encode_model(MSG_TYPE_END, &announce) {
                    let _ = self.wire.send_frame(frame);
                }
                self.wire.close_with(1000, "");
            } else {
                let close_code = if code != 0 { code } else { CLOSE_CODE_GENERIC };
                self.wire.close_with(close_code, reason);
            }

            if let Some(context) = self.context.upgrade() {
                context.connection_closed(&self.remote_ski, self.conn_id, handshake_end);
            }
        });
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Trait plumbing
// ────────────────────────────────────────────────────────────────────────────

impl WireReader for ShipConnection {
    fn handle_wire_message(&self, message: Vec<u8>) {
        let _ = self.inbox.send(ShipEvent::WireMessage(message));
    }

    fn report_wire_error(&self, error: ShipError) {
        let _ = self.inbox.send(ShipEvent::WireError(error));
    }
}

impl SpineWriter for ShipConnection {
    fn write_spine_message(&self, payload: &[u8]) {
        let frame = match codec::encode_spine_payload(payload) {
            Ok(frame) => frame,
            Err(error) => {
                log::debug!("[{}] error encoding spine message: {}", self.remote_ski, error);
                return;
            }
        };

        let (closed, _) = self.wire.close_state();
        if closed {
            self.close_connection(false, 0, "");
            return;
        }

        if let Err(error) = self.wire.send_frame(frame) {
            log::debug!("[{}] error sending spine message: {}", self.remote_ski, error);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::model::*;
    use super::testutil::*;
    use super::*;
    use crate::ship::codec::encode_spine_payload;

    #[tokio::test]
    async fn cmi_client_sends_init_and_waits() {
        let (conn, wire, ctx) = test_connection(Role::Client);

        conn.handle_ship_message(false, None);

        assert_eq!(wire.last_frame(), Some(SHIP_INIT_FRAME.to_vec()));
        assert!(conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::CmiClientWait);
        // every transition is reported to the hub
        let updates = ctx.state_updates.lock();
        assert_eq!(updates.last().unwrap().state, SmeState::CmiClientWait);
    }

    #[tokio::test]
    async fn cmi_server_replies_with_init() {
        let (conn, wire, ctx) = test_connection(Role::Server);
        ctx.set_trusted(true);

        conn.handle_ship_message(false, None);
        assert_eq!(conn.handshake_state().0, SmeState::CmiServerWait);
        assert!(wire.last_frame().is_none());

        conn.handle_ship_message(false, Some(&SHIP_INIT_FRAME));
        assert_eq!(wire.frames.lock()[0], SHIP_INIT_FRAME.to_vec());
        // trusted peer continues into the HELLO ready path
        assert_eq!(conn.handshake_state().0, SmeState::HelloReadyListen);
    }

    #[tokio::test]
    async fn cmi_rejects_garbage_init() {
        let (conn, _wire, _ctx) = test_connection(Role::Server);

        conn.handle_ship_message(false, None);
        conn.handle_ship_message(false, Some(&[0x01, 0x00]));

        let (state, error) = conn.handshake_state();
        assert_eq!(state, SmeState::Error);
        assert!(matches!(error, Some(ShipError::Protocol(_))));
    }

    #[tokio::test]
    async fn early_spine_messages_drain_in_order() {
        let (conn, _wire, _ctx) = test_connection(Role::Server);

        let first = encode_spine_payload(br#"{"datagram":{"seq":1}}"#).unwrap();
        let second = encode_spine_payload(br#"{"datagram":{"seq":2}}"#).unwrap();
        conn.process_event(ShipEvent::WireMessage(first));
        conn.process_event(ShipEvent::WireMessage(second));

        let recorder = Arc::new(RecordingSpineReader::default());
        conn.install_spine_reader(recorder.clone());

        let third = encode_spine_payload(br#"{"datagram":{"seq":3}}"#).unwrap();
        conn.process_event(ShipEvent::WireMessage(third));

        let received = recorder.payloads.lock().clone();
        assert_eq!(
            received,
            vec![
                br#"{"datagram":{"seq":1}}"#.to_vec(),
                br#"{"datagram":{"seq":2}}"#.to_vec(),
                br#"{"datagram":{"seq":3}}"#.to_vec(),
            ]
        );
    }

    #[tokio::test]
    async fn safe_close_announces_before_the_wire_goes_down() {
        let (conn, wire, ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::Complete, None);

        conn.close_connection(true, 0, "shutdown");

        let frames = wire.frames.lock().clone();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0][0], MSG_TYPE_END);
        let order = wire.events.lock().clone();
        assert_eq!(order, vec!["frame".to_string(), "close:1000".to_string()]);
        assert_eq!(ctx.closed_flags(), vec![true]);
    }

    #[tokio::test]
    async fn unsafe_close_skips_the_announce() {
        let (conn, wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::HelloPendingListen, None);

        conn.close_connection(false, 0, "");

        assert!(wire.frames.lock().is_empty());
        assert_eq!(wire.closed.lock().clone(), Some((CLOSE_CODE_GENERIC, String::new())));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let (conn, wire, ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::Complete, None);

        conn.close_connection(true, 0, "first");
        conn.close_connection(false, 4500, "second");

        assert_eq!(wire.frames.lock().len(), 1);
        assert_eq!(ctx.closed_flags().len(), 1);
    }

    #[tokio::test]
    async fn wire_error_in_ready_listen_is_a_rejection() {
        let (conn, _wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::HelloReadyListen, None);

        conn.process_event(ShipEvent::WireError(ShipError::ConnectionClosed));

        assert_eq!(conn.handshake_state().0, SmeState::HelloRejected);
    }

    #[tokio::test]
    async fn wire_error_elsewhere_is_an_error() {
        let (conn, _wire, ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::ProtClientListenChoice, None);

        conn.process_event(ShipEvent::WireError(ShipError::ConnectionClosed));

        let (state, error) = conn.handshake_state();
        assert_eq!(state, SmeState::Error);
        assert_eq!(error, Some(ShipError::ConnectionClosed));
        assert_eq!(ctx.closed_flags(), vec![false]);
    }

    #[tokio::test]
    async fn remote_close_announce_is_confirmed() {
        let (conn, wire, _ctx) = test_connection(Role::Server);
        conn.set_state(SmeState::Complete, None);

        let announce =
            codec::encode_model(MSG_TYPE_END, &ConnectionClose::announce("done")).unwrap();
        conn.handle_ship_message(false, Some(&announce));

        let frames = wire.frames.lock().clone();
        assert_eq!(frames.len(), 1);
        let confirm: ConnectionClose = codec::decode_model(&frames[0]).unwrap();
        assert_eq!(confirm.close.phase, ConnectionClosePhase::Confirm);
        assert!(wire.closed.lock().is_some());
    }

    #[tokio::test]
    async fn stale_timer_events_are_ignored() {
        let (conn, _wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::HelloReadyListen, None);
        conn.start_handshake_timer(TimerKind::WaitForReady, Duration::from_secs(600));
        let stale_generation = conn.timer.lock().generation;
        conn.stop_handshake_timer();

        conn.process_event(ShipEvent::TimerFired {
            kind: TimerKind::WaitForReady,
            generation: stale_generation,
        });

        // a stale expiry must not abort the handshake
        assert_eq!(conn.handshake_state().0, SmeState::HelloReadyListen);
    }
}
