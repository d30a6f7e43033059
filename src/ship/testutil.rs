//! Shared fixtures for the handshake tests: a recording wire and a
//! scriptable hub context.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::api::{ShipError, SpineReader, SpineWriter};
use crate::ship::model::{Role, ShipState};
use crate::ship::{ShipConnection, ShipContext};
use crate::ws::WireTransport;

/// Wire stub that records frames and the close call instead of touching a
/// socket.
#[derive(Default)]
pub(crate) struct MockWire {
    pub frames: Mutex<Vec<Vec<u8>>>,
    pub closed: Mutex<Option<(u16, String)>>,
    /// Interleaved event log ("frame", "close:<code>") for ordering checks.
    pub events: Mutex<Vec<String>>,
}

impl MockWire {
    pub fn last_frame(&self) -> Option<Vec<u8>> {
        self.frames.lock().last().cloned()
    }
}

impl WireTransport for MockWire {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), ShipError> {
        if self.closed.lock().is_some() {
            return Err(ShipError::ConnectionClosed);
        }
        self.frames.lock().push(frame);
        self.events.lock().push("frame".to_string());
        Ok(())
    }

    fn close_with(&self, code: u16, reason: &str) {
        let mut closed = self.closed.lock();
        if closed.is_some() {
            return;
        }
        *closed = Some((code, reason.to_string()));
        self.events.lock().push(format!("close:{code}"));
    }

    fn close_state(&self) -> (bool, Option<ShipError>) {
        (self.closed.lock().is_some(), None)
    }
}

#[derive(Default)]
pub(crate) struct RecordingSpineReader {
    pub payloads: Mutex<Vec<Vec<u8>>>,
}

impl SpineReader for RecordingSpineReader {
    fn handle_incoming_spine_message(&self, payload: &[u8]) {
        self.payloads.lock().push(payload.to_vec());
    }
}

/// Scriptable [`ShipContext`] with recorded observations.
pub(crate) struct MockContext {
    trusted: AtomicBool,
    allow_waiting: AtomicBool,
    pub state_updates: Mutex<Vec<ShipState>>,
    ship_ids: Mutex<Vec<String>>,
    closed: Mutex<Vec<bool>>,
    pub spine_reader: Arc<RecordingSpineReader>,
}

impl Default for MockContext {
    fn default() -> Self {
        Self {
            trusted: AtomicBool::new(false),
            allow_waiting: AtomicBool::new(false),
            state_updates: Mutex::new(Vec::new()),
            ship_ids: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            spine_reader: Arc::new(RecordingSpineReader::default()),
        }
    }
}

impl MockContext {
    pub fn set_trusted(&self, trusted: bool) {
        self.trusted.store(trusted, Ordering::SeqCst);
    }

    pub fn set_allow_waiting(&self, allow: bool) {
        self.allow_waiting.store(allow, Ordering::SeqCst);
    }

    pub fn confirmed_ship_ids(&self) -> Vec<String> {
        self.ship_ids.lock().clone()
    }

    pub fn closed_flags(&self) -> Vec<bool> {
        self.closed.lock().clone()
    }
}

impl ShipContext for MockContext {
    fn is_ski_trusted(&self, _ski: &str) -> bool {
        self.trusted.load(Ordering::SeqCst)
    }

    fn allow_waiting_for_trust(&self, _ski: &str) -> bool {
        self.allow_waiting.load(Ordering::SeqCst)
    }

    fn handshake_state_changed(&self, _ski: &str, state: ShipState) {
        self.state_updates.lock().push(state);
    }

    fn ship_id_confirmed(&self, _ski: &str, ship_id: &str) {
        self.ship_ids.lock().push(ship_id.to_string());
    }

    fn connection_closed(&self, _ski: &str, _conn_id: u64, handshake_completed: bool) {
        self.closed.lock().push(handshake_completed);
    }

    fn setup_remote_device(
        &self,
        _ski: &str,
        _writer: Arc<dyn SpineWriter>,
    ) -> Arc<dyn SpineReader> {
        self.spine_reader.clone()
    }
}

/// A machine wired to mocks, with a cached remote SHIP id of
/// `"RemoteShipId"` like a previously paired peer would have.
pub(crate) fn test_connection(
    role: Role,
) -> (Arc<ShipConnection>, Arc<MockWire>, Arc<MockContext>) {
    test_connection_with_remote_id(role, "RemoteShipId")
}

pub(crate) fn test_connection_with_remote_id(
    role: Role,
    remote_ship_id: &str,
) -> (Arc<ShipConnection>, Arc<MockWire>, Arc<MockContext>) {
    let wire = Arc::new(MockWire::default());
    let context = Arc::new(MockContext::default());
    let weak_context: std::sync::Weak<MockContext> = Arc::downgrade(&context);
    let conn = ShipConnection::new(
        weak_context,
        wire.clone(),
        role,
        "LocalShipId",
        "remote-test-ski",
        remote_ship_id,
    );
    (conn, wire, context)
}
