//! SHIP v1.0 node core for EEBUS devices.
//!
//! This crate implements the session layer energy devices use to find each
//! other and exchange application data: mDNS discovery, mutually
//! authenticated TLS websockets, the SHIP handshake state machine
//! (CMI → HELLO/trust → PROTOCOL → PIN → ACCESS), and the SPINE data plane
//! that runs over a completed handshake.
//!
//! The embedding application talks to a single [`ConnectionHub`]:
//!
//! ```no_run
//! use std::sync::Arc;
//! use ship_node::{Config, ConnectionHub, DeviceCertificate};
//!
//! # async fn run(observer: Arc<dyn ship_node::HubObserver>) -> anyhow::Result<()> {
//! let config = Config::load("ship.toml")?;
//! let certificate = DeviceCertificate::from_pem(
//!     &std::fs::read("cert.pem")?,
//!     &std::fs::read("key.pem")?,
//! )?;
//!
//! let hub = ConnectionHub::new(config, certificate, observer)?;
//! hub.start().await?;
//!
//! // pair against a peer discovered via mDNS
//! hub.initiate_pairing("0123456789abcdef0123456789abcdef01234567");
//! # Ok(())
//! # }
//! ```
//!
//! SPINE payloads are opaque here: the hub hands the application a
//! writer/reader pair per completed handshake and forwards datagrams in
//! both directions without interpreting them.
//!
//! Logging goes through the [`log`] facade; without an installed logger the
//! crate stays silent.

pub mod api;
pub mod cert;
pub mod config;
mod hub;
mod mdns;
mod ship;
#[cfg(test)]
mod testcert;
mod ws;

pub use api::{
    ConnectionState, ConnectionStateDetail, HubObserver, MdnsObserver, MdnsRecord, ShipError,
    SpineReader, SpineWriter, SHIP_WEBSOCKET_PATH, SHIP_WEBSOCKET_SUBPROTOCOL,
};
pub use cert::{ski_from_certificate, DeviceCertificate};
pub use config::Config;
pub use hub::ConnectionHub;
