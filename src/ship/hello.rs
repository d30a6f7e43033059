//! HELLO phase: trust negotiation and prolongation (SHIP 13.4.4).
//!
//! The side that already trusts the peer announces `ready` and waits; a
//! side without established trust announces `pending` and keeps the window
//! open with prolongation requests for as long as the application permits.
//! `HelloOk` is only reached once both sides announced `ready`.

use crate::api::ShipError;
use crate::ship::model::{
    ConnectionHello, ConnectionHelloPhase, SmeState, TimerKind, MSG_TYPE_CONTROL, T_HELLO_INIT,
    T_HELLO_PROLONG_MIN, T_HELLO_PROLONG_WAITING_GAP,
};
use crate::ship::{codec, ShipConnection, CLOSE_CODE_REJECTED, CLOSE_REASON_REJECTED};

use std::time::Duration;

impl ShipConnection {
    /// Entry dispatcher after CMI: pick the READY or PENDING path.
    pub(crate) fn hello_init(&self) {
        let trusted = self
            .context
            .upgrade()
            .map(|context| context.is_ski_trusted(&self.remote_ski))
            .unwrap_or(false);

        if trusted {
            self.set_state(SmeState::HelloReadyInit, None);
            self.hello_ready_init();
        } else {
            self.set_state(SmeState::HelloPendingInit, None);
            self.hello_pending_init();
        }
    }

    fn allow_waiting(&self) -> bool {
        self.context
            .upgrade()
            .map(|context| context.allow_waiting_for_trust(&self.remote_ski))
            .unwrap_or(false)
    }

    // ── READY path ───────────────────────────────────────────────────────

    pub(crate) fn hello_ready_init(&self) {
        let ready = ConnectionHello::with_waiting(ConnectionHelloPhase::Ready, T_HELLO_INIT);
        if self.send_model(MSG_TYPE_CONTROL, &ready).is_err() {
            self.set_state(SmeState::Error, Some(ShipError::ConnectionClosed));
            return;
        }
        self.start_handshake_timer(TimerKind::WaitForReady, T_HELLO_INIT);
        self.set_state(SmeState::HelloReadyListen, None);
    }

    pub(crate) fn hello_ready_listen(&self, timeout: bool, message: Option<&[u8]>) {
        if timeout {
            self.set_state(SmeState::HelloReadyTimeout, None);
            self.hello_abort();
            return;
        }

        let Some(hello) = message.and_then(codec::decode_model::<ConnectionHello>) else {
            return;
        };

        match hello.hello.phase {
            ConnectionHelloPhase::Ready => {
                self.stop_handshake_timer();
                self.set_and_handle(SmeState::HelloOk);
            }
            ConnectionHelloPhase::Pending => {
                // Peer is still waiting for its user; honoring the
                // prolongation keeps our patience window open as well.
                if hello.hello.prolongation_request == Some(true) && self.allow_waiting() {
                    let update =
                        ConnectionHello::with_waiting(ConnectionHelloPhase::Ready, T_HELLO_INIT);
                    let _ = self.send_model(MSG_TYPE_CONTROL, &update);
                    self.start_handshake_timer(TimerKind::WaitForReady, T_HELLO_INIT);
                }
            }
            ConnectionHelloPhase::Aborted => {
                self.stop_handshake_timer();
                self.set_state(SmeState::HelloRemoteAbortDone, None);
            }
        }
    }

    // ── PENDING path ─────────────────────────────────────────────────────

    pub(crate) fn hello_pending_init(&self) {
        if !self.allow_waiting() {
            self.hello_abort();
            return;
        }

        let pending = ConnectionHello::with_waiting(ConnectionHelloPhase::Pending, T_HELLO_INIT);
        if self.send_model(MSG_TYPE_CONTROL, &pending).is_err() {
            self.set_state(SmeState::Error, Some(ShipError::ConnectionClosed));
            return;
        }
        self.start_handshake_timer(TimerKind::WaitForReady, T_HELLO_INIT);
        self.set_state(SmeState::HelloPendingListen, None);
    }

    pub(crate) fn hello_pending_listen(&self, timeout: bool, message: Option<&[u8]>) {
        if timeout {
            self.hello_pending_timeout();
            return;
        }

        let Some(hello) = message.and_then(codec::decode_model::<ConnectionHello>) else {
            return;
        };

        match hello.hello.phase {
            ConnectionHelloPhase::Ready => match hello.hello.waiting {
                Some(waiting_ms) => self.note_peer_waiting(waiting_ms),
                // A ready without a waiting window gives us no time to ask
                // the user; treat it as a failed negotiation.
                None => self.hello_abort(),
            },
            ConnectionHelloPhase::Pending => {
                if hello.hello.prolongation_request == Some(true) {
                    if self.allow_waiting() {
                        let reply = ConnectionHello::with_waiting(
                            ConnectionHelloPhase::Pending,
                            T_HELLO_INIT,
                        );
                        let _ = self.send_model(MSG_TYPE_CONTROL, &reply);
                        self.start_handshake_timer(TimerKind::WaitForReady, T_HELLO_INIT);
                    } else {
                        self.hello_abort();
                    }
                } else if let Some(waiting_ms) = hello.hello.waiting {
                    self.note_peer_waiting(waiting_ms);
                }
            }
            ConnectionHelloPhase::Aborted => {
                self.stop_handshake_timer();
                self.set_state(SmeState::HelloRemoteAbortDone, None);
            }
        }
    }

    /// The peer announced how long it keeps waiting; schedule our
    /// prolongation request ahead of that window's end.
    fn note_peer_waiting(&self, waiting_ms: u64) {
        let waiting = Duration::from_millis(waiting_ms);
        *self.last_received_waiting.lock() = Some(waiting);

        let trigger = waiting
            .saturating_sub(T_HELLO_PROLONG_WAITING_GAP)
            .max(T_HELLO_PROLONG_MIN);
        self.start_handshake_timer(TimerKind::SendProlongationRequest, trigger);
    }

    fn hello_pending_timeout(&self) {
        match self
            .handshake_timer_kind()
            .unwrap_or(TimerKind::WaitForReady)
        {
            TimerKind::WaitForReady => {
                if self.allow_waiting() {
                    // auto-prolong the own window once per expiry
                    let pending =
                        ConnectionHello::with_waiting(ConnectionHelloPhase::Pending, T_HELLO_INIT);
                    let _ = self.send_model(MSG_TYPE_CONTROL, &pending);
                    self.start_handshake_timer(TimerKind::WaitForReady, T_HELLO_INIT);
                } else {
                    self.set_state(SmeState::HelloPendingTimeout, None);
                    self.hello_abort();
                }
            }
            TimerKind::SendProlongationRequest => {
                if self.allow_waiting() {
                    let request = ConnectionHello::prolongation_request();
                    let _ = self.send_model(MSG_TYPE_CONTROL, &request);
                    self.start_handshake_timer(
                        TimerKind::ProlongationRequestReply,
                        T_HELLO_PROLONG_WAITING_GAP,
                    );
                } else {
                    self.hello_abort();
                }
            }
            // the peer never answered our prolongation request
            TimerKind::ProlongationRequestReply => self.hello_abort(),
        }
    }

    // ── Local abort / approval ───────────────────────────────────────────

    /// Abort the HELLO phase locally: best-effort `aborted` announcement,
    /// then the terminal abort state.
    pub(crate) fn hello_abort(&self) {
        self.stop_handshake_timer();
        self.set_state(SmeState::HelloAbort, None);
        let aborted = ConnectionHello::phase(ConnectionHelloPhase::Aborted);
        let _ = self.send_model(MSG_TYPE_CONTROL, &aborted);
        self.set_state(SmeState::HelloAbortDone, None);
    }

    /// The application approved the pending pairing request.
    pub(crate) fn approve_pending(&self) {
        let (state, _) = self.handshake_state();
        if state != SmeState::HelloPendingListen {
            return;
        }

        self.stop_handshake_timer();
        self.set_state(SmeState::HelloReadyInit, None);
        self.hello_ready_init();
        if self.handshake_state().0 != SmeState::HelloReadyListen {
            return;
        }
        self.set_and_handle(SmeState::HelloOk);
    }

    /// The application denied the pending pairing request.
    pub(crate) fn abort_pending(&self) {
        let (state, _) = self.handshake_state();
        if !matches!(
            state,
            SmeState::HelloPendingListen | SmeState::HelloReadyListen
        ) {
            return;
        }

        self.hello_abort();
        self.close_connection(false, CLOSE_CODE_REJECTED, CLOSE_REASON_REJECTED);
    }
}
