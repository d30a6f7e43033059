//! ACCESS methods phase and handshake completion (SHIP 13.4.6.2).
//!
//! Both sides request the peer's access methods; the reply carries the
//! peer's SHIP ID, which must match what mDNS announced earlier (when it
//! did). On success the machine flips to `Complete`, wires up the SPINE
//! layer and drains any buffered early datagrams.

use crate::api::ShipError;
use crate::ship::codec;
use crate::ship::model::{
    AccessMethods, AccessMethodsRequest, SmeState, TimerKind, MSG_TYPE_CONTROL,
    T_HANDSHAKE_TIMEOUT,
};
use crate::ship::ShipConnection;

impl ShipConnection {
    pub(crate) fn access_request_init(&self) {
        let request = AccessMethodsRequest::default();
        if self.send_model(MSG_TYPE_CONTROL, &request).is_err() {
            self.set_state(SmeState::Error, Some(ShipError::ConnectionClosed));
            return;
        }
        self.start_handshake_timer(TimerKind::WaitForReady, T_HANDSHAKE_TIMEOUT);
        self.set_state(SmeState::AccessMethodsRequest, None);
    }

    pub(crate) fn access_methods_request(&self, timeout: bool, message: Option<&[u8]>) {
        if timeout {
            self.set_state(SmeState::Error, Some(ShipError::Timeout));
            return;
        }

        let Some((_, value)) = message.and_then(codec::decode_frame) else {
            self.stop_handshake_timer();
            self.set_state(
                SmeState::Error,
                Some(ShipError::Protocol("invalid access methods message".into())),
            );
            return;
        };

        let Some(object) = value.as_object() else {
            self.stop_handshake_timer();
            self.set_state(
                SmeState::Error,
                Some(ShipError::Protocol("invalid access methods message".into())),
            );
            return;
        };

        // the peer requests our methods: answer and keep waiting for its own
        if object.contains_key("accessMethodsRequest") {
            let methods = AccessMethods::with_id(&self.local_ship_id);
            let _ = self.send_model(MSG_TYPE_CONTROL, &methods);
            return;
        }

        let methods = object
            .contains_key("accessMethods")
            .then(|| serde_json::from_value::<AccessMethods>(value.clone()).ok())
            .flatten();
        let Some(methods) = methods else {
            self.stop_handshake_timer();
            self.set_state(
                SmeState::Error,
                Some(ShipError::Protocol("unexpected access methods message".into())),
            );
            return;
        };

        self.stop_handshake_timer();

        let Some(remote_id) = methods.methods.id else {
            self.set_state(
                SmeState::Error,
                Some(ShipError::Protocol("access methods carry no SHIP id".into())),
            );
            return;
        };

        let mismatch = {
            let mut cached = self.remote_ship_id.lock();
            if !cached.is_empty() && *cached != remote_id {
                Some(cached.clone())
            } else {
                *cached = remote_id.clone();
                None
            }
        };
        if let Some(expected) = mismatch {
            self.set_state(
                SmeState::Error,
                Some(ShipError::Protocol(format!(
                    "SHIP id mismatch, expected {expected}, got {remote_id}"
                ))),
            );
            return;
        }

        self.set_state(SmeState::Approved, None);
        self.complete_handshake();
    }

    /// Report the confirmed SHIP ID, wire in the SPINE layer, flush early
    /// datagrams and flip to `Complete`.
    fn complete_handshake(&self) {
        let remote_ship_id = self.remote_ship_id.lock().clone();

        if let Some(context) = self.context.upgrade() {
            context.ship_id_confirmed(&self.remote_ski, &remote_ship_id);
            if let Some(writer) = self.spine_writer() {
                let reader = context.setup_remote_device(&self.remote_ski, writer);
                self.install_spine_reader(reader);
            }
        }

        self.set_state(SmeState::Complete, None);
    }
}

#[cfg(test)]
mod tests {
    use crate::ship::codec;
    use crate::ship::model::*;
    use crate::ship::testutil::*;

    #[tokio::test]
    async fn pin_ok_requests_access_methods() {
        let (conn, wire, _ctx) = test_connection(Role::Client);

        conn.set_state(SmeState::PinCheckOk, None);
        conn.handle_state(false, None);

        assert!(conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::AccessMethodsRequest);
        assert!(wire.last_frame().is_some());
    }

    #[tokio::test]
    async fn incoming_request_is_answered_in_place() {
        let (conn, wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::AccessMethodsRequest, None);

        let request =
            codec::encode_model(MSG_TYPE_CONTROL, &AccessMethodsRequest::default()).unwrap();
        conn.handle_state(false, Some(&request));

        assert_eq!(conn.handshake_state().0, SmeState::AccessMethodsRequest);
        let reply: AccessMethods = codec::decode_model(&wire.last_frame().unwrap()).unwrap();
        assert_eq!(reply.methods.id.as_deref(), Some("LocalShipId"));
    }

    #[tokio::test]
    async fn matching_ship_id_completes_the_handshake() {
        let (conn, _wire, ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::AccessMethodsRequest, None);

        let methods =
            codec::encode_model(MSG_TYPE_CONTROL, &AccessMethods::with_id("RemoteShipId")).unwrap();
        conn.handle_state(false, Some(&methods));

        assert!(!conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::Complete);
        assert_eq!(ctx.confirmed_ship_ids(), vec!["RemoteShipId".to_string()]);
    }

    #[tokio::test]
    async fn unknown_ship_id_is_adopted() {
        let (conn, _wire, ctx) = test_connection_with_remote_id(Role::Client, "");
        conn.set_state(SmeState::AccessMethodsRequest, None);

        let methods =
            codec::encode_model(MSG_TYPE_CONTROL, &AccessMethods::with_id("FreshShipId")).unwrap();
        conn.handle_state(false, Some(&methods));

        assert_eq!(conn.handshake_state().0, SmeState::Complete);
        assert_eq!(ctx.confirmed_ship_ids(), vec!["FreshShipId".to_string()]);
    }

    #[tokio::test]
    async fn mismatched_ship_id_fails() {
        let (conn, wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::AccessMethodsRequest, None);
        wire.frames.lock().clear();

        let methods =
            codec::encode_model(MSG_TYPE_CONTROL, &AccessMethods::with_id("WrongShipId")).unwrap();
        conn.handle_state(false, Some(&methods));

        assert!(!conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::Error);
        assert!(wire.last_frame().is_none());
    }

    #[tokio::test]
    async fn missing_ship_id_fails() {
        let (conn, wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::AccessMethodsRequest, None);
        wire.frames.lock().clear();

        let methods = AccessMethods {
            methods: AccessMethodsType { id: None },
        };
        let msg = codec::encode_model(MSG_TYPE_CONTROL, &methods).unwrap();
        conn.handle_state(false, Some(&msg));

        assert_eq!(conn.handshake_state().0, SmeState::Error);
        assert!(wire.last_frame().is_none());
    }

    #[tokio::test]
    async fn unexpected_message_fails() {
        let (conn, _wire, _ctx) = test_connection(Role::Client);
        conn.set_state(SmeState::AccessMethodsRequest, None);

        let wrong = MessageProtocolHandshake::utf8(ProtocolHandshakeType::Select);
        let msg = codec::encode_model(MSG_TYPE_CONTROL, &wrong).unwrap();
        conn.handle_state(false, Some(&msg));

        assert!(!conn.handshake_timer_running());
        assert_eq!(conn.handshake_state().0, SmeState::Error);
    }
}
