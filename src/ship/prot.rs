//! PROTOCOL handshake phase: format negotiation (SHIP 13.4.5).
//!
//! The client announces its maximum version and formats, the server picks,
//! the client confirms the pick. This node only speaks SHIP 1.0 with
//! JSON-UTF8; anything else ends the handshake with a
//! `messageProtocolHandshakeError`.

use crate::api::ShipError;
use crate::ship::codec;
use crate::ship::model::{
    MessageProtocolHandshake, MessageProtocolHandshakeError, ProtocolHandshakeType, SmeState,
    TimerKind, MSG_TYPE_CONTROL, PROTOCOL_FORMAT_UTF8, PROT_ERROR_SELECTION_MISMATCH,
    PROT_ERROR_TIMEOUT, PROT_ERROR_UNEXPECTED_MESSAGE, T_HANDSHAKE_TIMEOUT,
};
use crate::ship::ShipConnection;

impl ShipConnection {
    // ── Server side ──────────────────────────────────────────────────────

    pub(crate) fn prot_server_init(&self) {
        self.set_state(SmeState::ProtServerListenProposal, None);
        self.start_handshake_timer(TimerKind::WaitForReady, T_HANDSHAKE_TIMEOUT);
    }

    pub(crate) fn prot_server_listen_proposal(&self, timeout: bool, message: Option<&[u8]>) {
        if timeout {
            self.abort_protocol_handshake(PROT_ERROR_TIMEOUT);
            return;
        }

        let Some(proposal) = message.and_then(codec::decode_model::<MessageProtocolHandshake>)
        else {
            self.abort_protocol_handshake(PROT_ERROR_UNEXPECTED_MESSAGE);
            return;
        };

        if proposal.handshake.handshake_type != ProtocolHandshakeType::AnnounceMax {
            self.abort_protocol_handshake(PROT_ERROR_UNEXPECTED_MESSAGE);
            return;
        }
        if proposal.handshake.version.major != 1 || !supports_utf8(&proposal) {
            self.abort_protocol_handshake(PROT_ERROR_SELECTION_MISMATCH);
            return;
        }

        let select = MessageProtocolHandshake::utf8(ProtocolHandshakeType::Select);
        if self.send_model(MSG_TYPE_CONTROL, &select).is_err() {
            self.set_state(SmeState::Error, Some(ShipError::ConnectionClosed));
            return;
        }
        self.start_handshake_timer(TimerKind::WaitForReady, T_HANDSHAKE_TIMEOUT);
        self.set_state(SmeState::ProtServerListenConfirm, None);
    }

    pub(crate) fn prot_server_listen_confirm(&self, timeout: bool, message: Option<&[u8]>) {
        if timeout {
            self.abort_protocol_handshake(PROT_ERROR_TIMEOUT);
            return;
        }

        let Some(confirm) = message.and_then(codec::decode_model::<MessageProtocolHandshake>)
        else {
            self.abort_protocol_handshake(PROT_ERROR_UNEXPECTED_MESSAGE);
            return;
        };

        if confirm.handshake.handshake_type != ProtocolHandshakeType::Select
            || confirm.handshake.version.major != 1
            || !supports_utf8(&confirm)
        {
            self.abort_protocol_handshake(PROT_ERROR_UNEXPECTED_MESSAGE);
            return;
        }

        self.stop_handshake_timer();
        self.set_state(SmeState::ProtServerOk, None);
        self.pin_check_init();
    }

    // ── Client side ──────────────────────────────────────────────────────

    pub(crate) fn prot_client_init(&self) {
        self.set_state(SmeState::ProtClientInit, None);
        let announce = MessageProtocolHandshake::utf8(ProtocolHandshakeType::AnnounceMax);
        if self.send_model(MSG_TYPE_CONTROL, &announce).is_err() {
            self.set_state(SmeState::Error, Some(ShipError::ConnectionClosed));
            return;
        }
        self.start_handshake_timer(TimerKind::WaitForReady, T_HANDSHAKE_TIMEOUT);
        self.set_state(SmeState::ProtClientListenChoice, None);
    }

    pub(crate) fn prot_client_listen_choice(&self, timeout: bool, message: Option<&[u8]>) {
        if timeout {
            self.abort_protocol_handshake(PROT_ERROR_TIMEOUT);
            return;
        }

        let Some(choice) = message.and_then(codec::decode_model::<MessageProtocolHandshake>)
        else {
            self.abort_protocol_handshake(PROT_ERROR_UNEXPECTED_MESSAGE);
            return;
        };

        if choice.handshake.handshake_type != ProtocolHandshakeType::Select {
            self.abort_protocol_handshake(PROT_ERROR_UNEXPECTED_MESSAGE);
            return;
        }
        if choice.handshake.version.major != 1 || !supports_utf8(&choice) {
            self.abort_protocol_handshake(PROT_ERROR_SELECTION_MISMATCH);
            return;
        }

        self.stop_handshake_timer();

        // confirm the selection by echoing it
        let confirm = MessageProtocolHandshake::utf8(ProtocolHandshakeType::Select);
        if self.send_model(MSG_TYPE_CONTROL, &confirm).is_err() {
            self.set_state(SmeState::Error, Some(ShipError::ConnectionClosed));
            return;
        }

        self.set_state(SmeState::ProtClientOk, None);
        self.pin_check_init();
    }

    // ── Failure ──────────────────────────────────────────────────────────

    pub(crate) fn abort_protocol_handshake(&self, reason: u8) {
        self.stop_handshake_timer();
        let error = MessageProtocolHandshakeError::reason(reason);
        let _ = self.send_model(MSG_TYPE_CONTROL, &error);
        self.set_state(
            SmeState::Error,
            Some(ShipError::Protocol(format!(
                "protocol handshake failed with reason {reason}"
            ))),
        );
    }
}

fn supports_utf8(handshake: &MessageProtocolHandshake) -> bool {
    handshake
        .handshake
        .formats
        .format
        .iter()
        .any(|format| format == PROTOCOL_FORMAT_UTF8)
}

#[cfg(test)]
mod tests {
    use crate::ship::codec;
    use crate::ship::model::*;
    use crate::ship::testutil::*;

    fn prot_frame(msg: &MessageProtocolHandshake) -> Vec<u8> {
        codec::encode_model(MSG_TYPE_CONTROL, msg).unwrap()
    }

    #[tokio::test]
    async fn server_waits_for_the_proposal() {
        let (conn, wire, _ctx) = test_connection(Role::Server);

        conn.set_state(SmeState::HelloOk, None);
        conn.handle_state(false, None);

        assert!(conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::ProtServerListenProposal);
        assert!(wire.last_frame().is_none());
    }

    #[tokio::test]
    async fn server_selects_utf8() {
        let (conn, wire, _ctx) = test_connection(Role::Server);
        conn.set_state(SmeState::ProtServerListenProposal, None);

        let announce = MessageProtocolHandshake::utf8(ProtocolHandshakeType::AnnounceMax);
        conn.handle_state(false, Some(&prot_frame(&announce)));

        assert!(conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::ProtServerListenConfirm);
        let select: MessageProtocolHandshake =
            codec::decode_model(&wire.last_frame().unwrap()).unwrap();
        assert_eq!(select.handshake.handshake_type, ProtocolHandshakeType::Select);
    }

    #[tokio::test]
    async fn server_rejects_an_unexpected_select() {
        let (conn, _wire, _ctx) = test_connection(Role::Server);
        conn.set_state(SmeState::ProtServerListenProposal, None);

        let select = MessageProtocolHandshake::utf8(ProtocolHandshakeType::Select);
        conn.handle_state(false, Some(&prot_frame(&select)));

        assert!(!conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::Error);
    }

    #[tokio::test]
    async fn server_confirm_continues_into_pin() {
        let (conn, wire, _ctx) = test_connection(Role::Server);
        conn.set_state(SmeState::ProtServerListenConfirm, None);

        let confirm = MessageProtocolHandshake::utf8(ProtocolHandshakeType::Select);
        conn.handle_state(false, Some(&prot_frame(&confirm)));

        assert!(conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::PinCheckListen);
        let pin: ConnectionPinState = codec::decode_model(&wire.last_frame().unwrap()).unwrap();
        assert_eq!(pin.pin_state.pin_state, PinState::None);
    }

    #[tokio::test]
    async fn server_confirm_rejects_announce_max() {
        let (conn, wire, _ctx) = test_connection(Role::Server);
        conn.set_state(SmeState::ProtServerListenConfirm, None);

        let wrong = MessageProtocolHandshake::utf8(ProtocolHandshakeType::AnnounceMax);
        conn.handle_state(false, Some(&prot_frame(&wrong)));

        assert!(!conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::Error);
        let error: MessageProtocolHandshakeError =
            codec::decode_model(&wire.last_frame().unwrap()).unwrap();
        assert_eq!(error.error.error, PROT_ERROR_UNEXPECTED_MESSAGE);
    }

    #[tokio::test]
    async fn client_announces_after_hello() {
        let (conn, wire, _ctx) = test_connection(Role::Client);

        conn.set_state(SmeState::HelloOk, None);
        conn.handle_state(false, None);

        assert_eq!(conn.handshake_state().0, SmeState::ProtClientListenChoice);
        let announce: MessageProtocolHandshake =
            codec::decode_model(&wire.last_frame().unwrap()).unwrap();
        assert_eq!(
            announce.handshake.handshake_type,
            ProtocolHandshakeType::AnnounceMax
        );
        assert_eq!(announce.handshake.formats.format, vec!["JSON-UTF8"]);
    }

    #[tokio::test]
    async fn client_confirms_the_selection() {
        let (conn, wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::ProtClientListenChoice, None);

        let select = MessageProtocolHandshake::utf8(ProtocolHandshakeType::Select);
        conn.handle_state(false, Some(&prot_frame(&select)));

        // the pin check announcement is the last frame out
        assert_eq!(conn.handshake_state().0, SmeState::PinCheckListen);
        let frames = wire.frames.lock().clone();
        assert_eq!(frames.len(), 2);
        let echo: MessageProtocolHandshake = codec::decode_model(&frames[0]).unwrap();
        assert_eq!(echo.handshake.handshake_type, ProtocolHandshakeType::Select);
        let pin: ConnectionPinState = codec::decode_model(&frames[1]).unwrap();
        assert_eq!(pin.pin_state.pin_state, PinState::None);
    }

    #[tokio::test]
    async fn client_rejects_a_format_mismatch() {
        let (conn, wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::ProtClientListenChoice, None);

        let mut wrong = MessageProtocolHandshake::utf8(ProtocolHandshakeType::Select);
        wrong.handshake.formats.format = vec!["JSON-UTF16".to_string()];
        conn.handle_state(false, Some(&prot_frame(&wrong)));

        assert!(!conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::Error);
        let error: MessageProtocolHandshakeError =
            codec::decode_model(&wire.last_frame().unwrap()).unwrap();
        assert_eq!(error.error.error, PROT_ERROR_SELECTION_MISMATCH);
    }

    #[tokio::test]
    async fn client_rejects_missing_formats() {
        let (conn, _wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::ProtClientListenChoice, None);

        let mut wrong = MessageProtocolHandshake::utf8(ProtocolHandshakeType::Select);
        wrong.handshake.formats.format.clear();
        conn.handle_state(false, Some(&prot_frame(&wrong)));

        assert_eq!(conn.handshake_state().0, SmeState::Error);
    }

    #[tokio::test]
    async fn protocol_abort_stops_the_timer() {
        let (conn, wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::ProtClientListenChoice, None);
        conn.start_handshake_timer(TimerKind::WaitForReady, T_HANDSHAKE_TIMEOUT);

        conn.abort_protocol_handshake(PROT_ERROR_TIMEOUT);

        assert!(!conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::Error);
        let error: MessageProtocolHandshakeError =
            codec::decode_model(&wire.last_frame().unwrap()).unwrap();
        assert_eq!(error.error.error, PROT_ERROR_TIMEOUT);
    }
}
