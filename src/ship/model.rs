//! SHIP wire models and the internal handshake state set.
//!
//! The serde shapes here serialize to plain JSON; [`super::codec`] turns
//! that into the EEBUS-JSON array form before a frame hits the wire.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::api::ShipError;

// ────────────────────────────────────────────────────────────────────────────
// Frame types (SHIP 13.4.2)
// ────────────────────────────────────────────────────────────────────────────

pub(crate) const MSG_TYPE_INIT: u8 = 0x00;
pub(crate) const MSG_TYPE_CONTROL: u8 = 0x01;
pub(crate) const MSG_TYPE_DATA: u8 = 0x02;
pub(crate) const MSG_TYPE_END: u8 = 0x03;

/// The CMI init message: type byte plus one zero byte.
pub(crate) const SHIP_INIT_FRAME: [u8; 2] = [MSG_TYPE_INIT, 0x00];

// ────────────────────────────────────────────────────────────────────────────
// Timings
// ────────────────────────────────────────────────────────────────────────────

/// Wait-for-ready window of the HELLO phase (SHIP 13.4.4.1.3).
pub(crate) const T_HELLO_INIT: Duration = Duration::from_secs(60);

/// How far ahead of the peer's announced waiting window a prolongation
/// request must go out.
pub(crate) const T_HELLO_PROLONG_WAITING_GAP: Duration = Duration::from_secs(15);

/// Floor for the prolongation trigger.
pub(crate) const T_HELLO_PROLONG_MIN: Duration = Duration::from_secs(1);

/// Generic reply timeout for the CMI, PROTOCOL, PIN and ACCESS waits.
pub(crate) const T_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

// ────────────────────────────────────────────────────────────────────────────
// Connection roles and states
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Role {
    Client,
    Server,
}

/// The SHIP message-exchange states (SHIP 13.4).
///
/// `Hello` is the entry dispatcher that picks the READY or PENDING path.
/// The PIN busy/ask states are never entered by this implementation (only
/// the `none` PIN method is offered) but stay part of the set so the public
/// state projection is total.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SmeState {
    CmiInitStart,
    CmiClientSend,
    CmiClientWait,
    CmiClientEvaluate,
    CmiServerWait,
    CmiServerEvaluate,
    Hello,
    HelloReadyInit,
    HelloReadyListen,
    HelloReadyTimeout,
    HelloPendingInit,
    HelloPendingListen,
    HelloPendingTimeout,
    HelloOk,
    HelloAbort,
    HelloAbortDone,
    HelloRemoteAbortDone,
    HelloRejected,
    ProtServerListenProposal,
    ProtServerListenConfirm,
    ProtServerOk,
    ProtClientInit,
    ProtClientListenChoice,
    ProtClientOk,
    PinCheckInit,
    PinCheckListen,
    PinCheckOk,
    PinCheckError,
    PinCheckBusyInit,
    PinCheckBusyWait,
    PinAskInit,
    PinAskProcess,
    PinAskRestricted,
    PinAskOk,
    AccessMethodsRequest,
    Approved,
    Complete,
    Error,
}

/// State-plus-error tuple reported to the hub on every transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ShipState {
    pub state: SmeState,
    pub error: Option<ShipError>,
}

/// The single handshake timer; starting a new one stops the previous.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TimerKind {
    WaitForReady,
    SendProlongationRequest,
    ProlongationRequestReply,
}

// ────────────────────────────────────────────────────────────────────────────
// HELLO (SHIP 13.4.4)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum ConnectionHelloPhase {
    Pending,
    Ready,
    Aborted,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConnectionHello {
    #[serde(rename = "connectionHello")]
    pub hello: ConnectionHelloType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConnectionHelloType {
    pub phase: ConnectionHelloPhase,
    /// Remaining wait window in milliseconds.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub waiting: Option<u64>,
    #[serde(rename = "prolongationRequest", skip_serializing_if = "Option::is_none")]
    pub prolongation_request: Option<bool>,
}

impl ConnectionHello {
    pub fn phase(phase: ConnectionHelloPhase) -> Self {
        Self {
            hello: ConnectionHelloType {
                phase,
                waiting: None,
                prolongation_request: None,
            },
        }
    }

    pub fn with_waiting(phase: ConnectionHelloPhase, waiting: Duration) -> Self {
        Self {
            hello: ConnectionHelloType {
                phase,
                waiting: Some(waiting.as_millis() as u64),
                prolongation_request: None,
            },
        }
    }

    pub fn prolongation_request() -> Self {
        Self {
            hello: ConnectionHelloType {
                phase: ConnectionHelloPhase::Pending,
                waiting: None,
                prolongation_request: Some(true),
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PROTOCOL handshake (SHIP 13.4.5)
// ────────────────────────────────────────────────────────────────────────────

pub(crate) const PROTOCOL_FORMAT_UTF8: &str = "JSON-UTF8";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum ProtocolHandshakeType {
    AnnounceMax,
    Select,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub(crate) struct Version {
    pub major: u16,
    pub minor: u16,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct MessageProtocolFormats {
    #[serde(default)]
    pub format: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessageProtocolHandshake {
    #[serde(rename = "messageProtocolHandshake")]
    pub handshake: MessageProtocolHandshakeType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessageProtocolHandshakeType {
    #[serde(rename = "handshakeType")]
    pub handshake_type: ProtocolHandshakeType,
    pub version: Version,
    #[serde(default)]
    pub formats: MessageProtocolFormats,
}

impl MessageProtocolHandshake {
    pub fn utf8(handshake_type: ProtocolHandshakeType) -> Self {
        Self {
            handshake: MessageProtocolHandshakeType {
                handshake_type,
                version: Version { major: 1, minor: 0 },
                formats: MessageProtocolFormats {
                    format: vec![PROTOCOL_FORMAT_UTF8.to_string()],
                },
            },
        }
    }
}

/// Error reasons of `MessageProtocolHandshakeError` (SHIP 13.4.5.2).
pub(crate) const PROT_ERROR_TIMEOUT: u8 = 1;
pub(crate) const PROT_ERROR_UNEXPECTED_MESSAGE: u8 = 2;
pub(crate) const PROT_ERROR_SELECTION_MISMATCH: u8 = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessageProtocolHandshakeError {
    #[serde(rename = "messageProtocolHandshakeError")]
    pub error: MessageProtocolHandshakeErrorType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct MessageProtocolHandshakeErrorType {
    pub error: u8,
}

impl MessageProtocolHandshakeError {
    pub fn reason(error: u8) -> Self {
        Self {
            error: MessageProtocolHandshakeErrorType { error },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// PIN (SHIP 13.4.6)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum PinState {
    Required,
    Optional,
    PinOk,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConnectionPinState {
    #[serde(rename = "connectionPinState")]
    pub pin_state: ConnectionPinStateType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConnectionPinStateType {
    #[serde(rename = "pinState")]
    pub pin_state: PinState,
    #[serde(rename = "inputPermission", skip_serializing_if = "Option::is_none")]
    pub input_permission: Option<String>,
}

impl ConnectionPinState {
    pub fn none() -> Self {
        Self {
            pin_state: ConnectionPinStateType {
                pin_state: PinState::None,
                input_permission: None,
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// ACCESS methods (SHIP 13.4.6.2)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct AccessMethodsRequest {
    #[serde(rename = "accessMethodsRequest")]
    pub request: AccessMethodsRequestType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct AccessMethodsRequestType {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct AccessMethods {
    #[serde(rename = "accessMethods")]
    pub methods: AccessMethodsType,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub(crate) struct AccessMethodsType {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
}

impl AccessMethods {
    pub fn with_id(id: &str) -> Self {
        Self {
            methods: AccessMethodsType {
                id: Some(id.to_string()),
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Connection termination (SHIP 13.4.7)
// ────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) enum ConnectionClosePhase {
    Announce,
    Confirm,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConnectionClose {
    #[serde(rename = "connectionClose")]
    pub close: ConnectionCloseType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ConnectionCloseType {
    pub phase: ConnectionClosePhase,
    #[serde(rename = "maxTime", skip_serializing_if = "Option::is_none")]
    pub max_time: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl ConnectionClose {
    pub fn announce(reason: &str) -> Self {
        Self {
            close: ConnectionCloseType {
                phase: ConnectionClosePhase::Announce,
                max_time: None,
                reason: if reason.is_empty() {
                    None
                } else {
                    Some(reason.to_string())
                },
            },
        }
    }

    pub fn confirm() -> Self {
        Self {
            close: ConnectionCloseType {
                phase: ConnectionClosePhase::Confirm,
                max_time: None,
                reason: None,
            },
        }
    }
}

// ────────────────────────────────────────────────────────────────────────────
// Data frames (SHIP 13.4.8)
// ────────────────────────────────────────────────────────────────────────────

pub(crate) const SHIP_PROTOCOL_ID: &str = "ee1.0";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ShipData {
    pub data: ShipDataType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ShipDataType {
    pub header: ShipDataHeader,
    pub payload: serde_json::Value,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ShipDataHeader {
    #[serde(rename = "protocolId")]
    pub protocol_id: String,
}
