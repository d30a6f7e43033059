//! PIN phase (SHIP 13.4.6).
//!
//! Only the `none` PIN method is offered. Both sides announce their PIN
//! state; any peer that insists on PIN verification ends the handshake,
//! since pin-based pairing is not part of this node.

use crate::api::ShipError;
use crate::ship::codec;
use crate::ship::model::{
    ConnectionPinState, PinState, SmeState, TimerKind, MSG_TYPE_CONTROL, T_HANDSHAKE_TIMEOUT,
};
use crate::ship::ShipConnection;

impl ShipConnection {
    pub(crate) fn pin_check_init(&self) {
        self.set_state(SmeState::PinCheckInit, None);
        let none = ConnectionPinState::none();
        if self.send_model(MSG_TYPE_CONTROL, &none).is_err() {
            self.set_state(SmeState::Error, Some(ShipError::ConnectionClosed));
            return;
        }
        self.start_handshake_timer(TimerKind::WaitForReady, T_HANDSHAKE_TIMEOUT);
        self.set_state(SmeState::PinCheckListen, None);
    }

    pub(crate) fn pin_check_listen(&self, timeout: bool, message: Option<&[u8]>) {
        if timeout {
            self.set_state(SmeState::Error, Some(ShipError::Timeout));
            return;
        }

        let Some(pin) = message.and_then(codec::decode_model::<ConnectionPinState>) else {
            self.set_state(
                SmeState::Error,
                Some(ShipError::Protocol("invalid pin state message".into())),
            );
            return;
        };

        match pin.pin_state.pin_state {
            PinState::None => {
                self.stop_handshake_timer();
                self.set_state(SmeState::PinCheckOk, None);
                self.access_request_init();
            }
            other => {
                self.stop_handshake_timer();
                self.set_state(
                    SmeState::Error,
                    Some(ShipError::Protocol(format!(
                        "pin method {other:?} is not supported"
                    ))),
                );
            }
        }
    }
}
