//! Framed websocket transport for a single SHIP connection.
//!
//! A [`WireConnection`] owns the reader and writer tasks of one TLS
//! websocket. All outgoing frames funnel through a single channel so writes
//! are serialized; liveness is enforced with periodic pings and a read
//! deadline that every inbound message (notably pongs) resets. Inbound
//! binary frames and transport errors are handed to an injected
//! [`WireReader`]; errors are reported exactly once.

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

use crate::api::ShipError;
use crate::ship::model::SHIP_INIT_FRAME;

/// Maximum SHIP message size for both read and write buffers (SHIP 10.2).
pub(crate) const MAX_MESSAGE_SIZE: usize = 64 * 1024;

/// Time allowed for a single websocket write.
const WRITE_WAIT: Duration = Duration::from_secs(10);

/// Read deadline; a missed pong within this window kills the connection.
const PONG_WAIT: Duration = Duration::from_secs(60);

/// Ping cadence; must undercut [`PONG_WAIT`].
const PING_PERIOD: Duration = Duration::from_secs(54);

/// Websocket configuration shared by the accept and dial paths.
pub(crate) fn websocket_config() -> WebSocketConfig {
    WebSocketConfig::default()
        .max_message_size(Some(MAX_MESSAGE_SIZE))
        .max_frame_size(Some(MAX_MESSAGE_SIZE))
}

// ────────────────────────────────────────────────────────────────────────────
// Traits
// ────────────────────────────────────────────────────────────────────────────

/// Receives inbound frames and the (single) transport error report.
pub(crate) trait WireReader: Send + Sync {
    fn handle_wire_message(&self, message: Vec<u8>);
    fn report_wire_error(&self, error: ShipError);
}

/// Write half of a SHIP transport as seen by the handshake machine.
pub(crate) trait WireTransport: Send + Sync {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), ShipError>;
    fn close_with(&self, code: u16, reason: &str);
    /// Whether the transport is closed, and the error that closed it.
    fn close_state(&self) -> (bool, Option<ShipError>);
}

// ────────────────────────────────────────────────────────────────────────────
// WireConnection
// ────────────────────────────────────────────────────────────────────────────

enum WriteCommand {
    Frame(Vec<u8>),
    Close { code: u16, reason: String },
}

#[derive(Default)]
struct ClosedState {
    closed: bool,
    error: Option<ShipError>,
    reported: bool,
}

pub(crate) struct WireConnection {
    remote_ski: String,
    write_tx: mpsc::UnboundedSender<WriteCommand>,
    write_rx: Mutex<Option<mpsc::UnboundedReceiver<WriteCommand>>>,
    closed: Mutex<ClosedState>,
}

impl WireConnection {
    /// Create the connection shell. Frames sent before [`attach`] runs are
    /// buffered in the write channel.
    ///
    /// [`attach`]: WireConnection::attach
    pub(crate) fn new(remote_ski: &str) -> Arc<Self> {
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            remote_ski: remote_ski.to_string(),
            write_tx,
            write_rx: Mutex::new(Some(write_rx)),
            closed: Mutex::new(ClosedState::default()),
        })
    }

    /// Take over a completed websocket stream and start the reader and
    /// writer tasks, delivering inbound traffic to `reader`.
    pub(crate) fn attach<S>(self: &Arc<Self>, stream: WebSocketStream<S>, reader: Arc<dyn WireReader>)
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let rx = self
            .write_rx
            .lock()
            .take()
            .expect("wire connection attached twice");
        let (sink, source) = stream.split();

        tokio::spawn(Self::write_pump(self.clone(), reader.clone(), sink, rx));
        tokio::spawn(Self::read_pump(self.clone(), reader, source));
    }

    fn is_closed(&self) -> bool {
        self.closed.lock().closed
    }

    /// Record the terminal error and return whether this call was the first
    /// to report it.
    fn fail(&self, error: ShipError) -> bool {
        let mut state = self.closed.lock();
        state.closed = true;
        if state.error.is_none() {
            state.error = Some(error);
        }
        if state.reported {
            return false;
        }
        state.reported = true;
        true
    }

    async fn write_pump<S>(
        this: Arc<Self>,
        reader: Arc<dyn WireReader>,
        mut sink: futures_util::stream::SplitSink<WebSocketStream<S>, Message>,
        mut rx: mpsc::UnboundedReceiver<WriteCommand>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let start = tokio::time::Instant::now() + PING_PERIOD;
        let mut ping = tokio::time::interval_at(start, PING_PERIOD);

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    None => {
                        let _ = sink.close().await;
                        return;
                    }
                    Some(WriteCommand::Frame(frame)) => {
                        log_frame("Send", &this.remote_ski, &frame);
                        let sent = timeout(WRITE_WAIT, sink.send(Message::Binary(frame.into()))).await;
                        match sent {
                            Ok(Ok(())) => {}
                            Ok(Err(err)) => {
                                if !this.is_closed() && this.fail(ShipError::Transport(err.to_string())) {
                                    reader.report_wire_error(ShipError::Transport(err.to_string()));
                                }
                                return;
                            }
                            Err(_) => {
                                if this.fail(ShipError::Transport("write deadline exceeded".into())) {
                                    reader.report_wire_error(ShipError::Transport(
                                        "write deadline exceeded".into(),
                                    ));
                                }
                                return;
                            }
                        }
                    }
                    Some(WriteCommand::Close { code, reason }) => {
                        let frame = CloseFrame {
                            code: CloseCode::from(code),
                            reason: reason.into(),
                        };
                        let _ = timeout(WRITE_WAIT, sink.send(Message::Close(Some(frame)))).await;
                        let _ = sink.close().await;
                        return;
                    }
                },
                _ = ping.tick() => {
                    if this.is_closed() {
                        return;
                    }
                    let sent = timeout(WRITE_WAIT, sink.send(Message::Ping(Vec::new().into()))).await;
                    if !matches!(sent, Ok(Ok(()))) {
                        if this.fail(ShipError::Transport("ping write failed".into())) {
                            reader.report_wire_error(ShipError::Transport("ping write failed".into()));
                        }
                        return;
                    }
                }
            }
        }
    }

    async fn read_pump<S>(
        this: Arc<Self>,
        reader: Arc<dyn WireReader>,
        mut source: futures_util::stream::SplitStream<WebSocketStream<S>>,
    ) where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        loop {
            if this.is_closed() {
                return;
            }

            let next = timeout(PONG_WAIT, source.next()).await;

            // Errors on an already-closed connection are expected noise.
            if this.is_closed() {
                return;
            }

            let error = match next {
                Err(_) => Some(ShipError::Transport("read deadline exceeded".into())),
                Ok(None) => Some(ShipError::ConnectionClosed),
                Ok(Some(Err(err))) => Some(ShipError::Transport(err.to_string())),
                Ok(Some(Ok(message))) => match message {
                    Message::Binary(data) if data.len() >= 2 => {
                        let frame = data.to_vec();
                        log_frame("Recv", &this.remote_ski, &frame);
                        reader.handle_wire_message(frame);
                        None
                    }
                    Message::Binary(_) => Some(ShipError::InvalidMessageLength),
                    Message::Text(_) => Some(ShipError::NotBinaryMessage),
                    Message::Close(_) => Some(ShipError::ConnectionClosed),
                    // Ping replies are produced by the stream itself; pongs
                    // only serve to reset the read deadline above.
                    _ => None,
                },
            };

            if let Some(error) = error {
                log::debug!("[{}] websocket read error: {}", this.remote_ski, error);
                if this.fail(error.clone()) {
                    reader.report_wire_error(error);
                }
                return;
            }
        }
    }
}

impl WireTransport for WireConnection {
    fn send_frame(&self, frame: Vec<u8>) -> Result<(), ShipError> {
        if self.is_closed() {
            return Err(ShipError::ConnectionClosed);
        }
        self.write_tx
            .send(WriteCommand::Frame(frame))
            .map_err(|_| ShipError::ConnectionClosed)
    }

    fn close_with(&self, code: u16, reason: &str) {
        {
            let mut state = self.closed.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        let _ = self.write_tx.send(WriteCommand::Close {
            code,
            reason: reason.to_string(),
        });
    }

    fn close_state(&self) -> (bool, Option<ShipError>) {
        let state = self.closed.lock();
        if state.closed && state.error.is_none() {
            return (true, Some(ShipError::ConnectionClosed));
        }
        (state.closed, state.error.clone())
    }
}

fn log_frame(direction: &str, ski: &str, frame: &[u8]) {
    if frame.len() > 2 {
        log::trace!("{} [{}]: {}", direction, ski, String::from_utf8_lossy(&frame[1..]));
    } else if frame == &SHIP_INIT_FRAME[..] {
        log::trace!("{} [{}]: ship init", direction, ski);
    } else {
        log::trace!("{} [{}]: unknown single byte", direction, ski);
    }
}
