//! Pluggable mDNS backends.
//!
//! The broker only sees [`MdnsProvider`]; the default backend wraps the
//! pure-Rust `mdns-sd` daemon. Providers are probed in priority order at
//! setup time and the first available one wins.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Arc;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::ShipError;

/// Service type browsed and announced on the network.
pub(crate) const SHIP_SERVICE_TYPE: &str = "_ship._tcp.local.";

/// What a provider announces for the local node.
#[derive(Debug, Clone)]
pub(crate) struct ServiceAnnouncement {
    pub instance_name: String,
    pub port: u16,
    pub txt: HashMap<String, String>,
}

/// A raw discovery event, normalized across providers.
///
/// Removal events re-use the TXT data cached from the last resolution so
/// the broker can always key on the SKI.
#[derive(Debug, Clone)]
pub(crate) struct ServiceUpdate {
    pub txt: HashMap<String, String>,
    pub name: String,
    pub host: String,
    pub port: u16,
    pub addresses: Vec<IpAddr>,
    pub remove: bool,
}

pub(crate) trait MdnsProvider: Send + Sync {
    /// Probe whether this backend works on the current host.
    fn is_available(&self) -> bool;

    fn announce(&self, service: ServiceAnnouncement) -> Result<(), ShipError>;

    fn unannounce(&self);

    /// Start pushing resolution events into `events` until `cancel` fires.
    fn start_resolve(
        &self,
        events: mpsc::UnboundedSender<ServiceUpdate>,
        cancel: CancellationToken,
    ) -> Result<(), ShipError>;

    fn shutdown(&self);
}

// ────────────────────────────────────────────────────────────────────────────
// mdns-sd backed provider
// ────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
pub(crate) struct MdnsSdProvider {
    daemon: Mutex<Option<ServiceDaemon>>,
    registered: Mutex<Option<String>>,
}

impl MdnsSdProvider {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn daemon(&self) -> Option<ServiceDaemon> {
        let mut slot = self.daemon.lock();
        if slot.is_none() {
            match ServiceDaemon::new() {
                Ok(daemon) => *slot = Some(daemon),
                Err(err) => {
                    log::debug!("mdns: daemon unavailable: {err}");
                    return None;
                }
            }
        }
        slot.clone()
    }
}

impl MdnsProvider for MdnsSdProvider {
    fn is_available(&self) -> bool {
        self.daemon().is_some()
    }

    fn announce(&self, service: ServiceAnnouncement) -> Result<(), ShipError> {
        let daemon = self.daemon().ok_or(ShipError::NoMdnsProvider)?;

        let host_name = format!("{}.local.", sanitize_host(&service.instance_name));
        let info = ServiceInfo::new(
            SHIP_SERVICE_TYPE,
            &service.instance_name,
            &host_name,
            "",
            service.port,
            service.txt,
        )
        .map_err(|err| ShipError::Transport(format!("mdns announce: {err}")))?
        .enable_addr_auto();

        *self.registered.lock() = Some(info.get_fullname().to_string());
        daemon
            .register(info)
            .map_err(|err| ShipError::Transport(format!("mdns announce: {err}")))
    }

    fn unannounce(&self) {
        let Some(daemon) = self.daemon.lock().clone() else {
            return;
        };
        if let Some(fullname) = self.registered.lock().take() {
            let _ = daemon.unregister(&fullname);
        }
    }

    fn start_resolve(
        &self,
        events: mpsc::UnboundedSender<ServiceUpdate>,
        cancel: CancellationToken,
    ) -> Result<(), ShipError> {
        let daemon = self.daemon().ok_or(ShipError::NoMdnsProvider)?;
        let browser = daemon
            .browse(SHIP_SERVICE_TYPE)
            .map_err(|err| ShipError::Transport(format!("mdns browse: {err}")))?;

        tokio::spawn(async move {
            // removals only carry the instance name, so remember what each
            // instance resolved to
            let mut seen: HashMap<String, ServiceUpdate> = HashMap::new();

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => {
                        let _ = daemon.stop_browse(SHIP_SERVICE_TYPE);
                        return;
                    }
                    event = browser.recv_async() => {
                        let Ok(event) = event else { return };
                        match event {
                            ServiceEvent::ServiceResolved(info) => {
                                let update = update_from_info(&info);
                                seen.insert(info.get_fullname().to_string(), update.clone());
                                if events.send(update).is_err() {
                                    return;
                                }
                            }
                            ServiceEvent::ServiceRemoved(_, fullname) => {
                                if let Some(mut update) = seen.remove(&fullname) {
                                    update.remove = true;
                                    update.addresses.clear();
                                    if events.send(update).is_err() {
                                        return;
                                    }
                                }
                            }
                            _ => {}
                        }
                    }
                }
            }
        });

        Ok(())
    }

    fn shutdown(&self) {
        self.unannounce();
        if let Some(daemon) = self.daemon.lock().take() {
            let _ = daemon.shutdown();
        }
    }
}

fn update_from_info(info: &ServiceInfo) -> ServiceUpdate {
    let txt = info
        .get_properties()
        .iter()
        .map(|property| (property.key().to_string(), property.val_str().to_string()))
        .collect();

    let name = info
        .get_fullname()
        .strip_suffix(&format!(".{SHIP_SERVICE_TYPE}"))
        .unwrap_or(info.get_fullname())
        .to_string();

    let mut addresses: Vec<IpAddr> = info.get_addresses().iter().copied().collect();
    addresses.sort();

    ServiceUpdate {
        txt,
        name,
        host: info.get_hostname().to_string(),
        port: info.get_port(),
        addresses,
        remove: false,
    }
}

fn sanitize_host(instance: &str) -> String {
    instance
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect()
}
