//! mDNS announcement and peer discovery.
//!
//! The [`MdnsBroker`] announces the local `_ship._tcp` service and runs a
//! single resolver over the active provider's event stream. Discovered
//! services are validated against the mandatory SHIP TXT keys, merged per
//! SKI (addresses are a union in first-seen order), and every change is
//! published to the subscriber as a deep copy of the whole record table on
//! a separate task, so a slow consumer never stalls resolution.

pub(crate) mod provider;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api::{MdnsObserver, MdnsRecord, ShipError, SHIP_WEBSOCKET_PATH};
use crate::config::Config;
use provider::{MdnsProvider, ServiceAnnouncement, ServiceUpdate};

/// Identity data announced for the local node.
#[derive(Debug, Clone)]
struct LocalService {
    ski: String,
    identifier: String,
    instance_name: String,
    brand: String,
    model: String,
    device_type: String,
    port: u16,
    register: bool,
}

pub(crate) struct MdnsBroker {
    local: LocalService,
    providers: Vec<Arc<dyn MdnsProvider>>,
    active: Mutex<Option<Arc<dyn MdnsProvider>>>,
    records: Mutex<HashMap<String, MdnsRecord>>,
    observer: Mutex<Option<Arc<dyn MdnsObserver>>>,
    announced: Mutex<bool>,
    searching: Mutex<bool>,
    resolve_cancel: Mutex<Option<CancellationToken>>,
}

impl MdnsBroker {
    /// Build a broker for the local service described by `config`.
    /// `providers` are probed in order on [`setup`](MdnsBroker::setup).
    pub(crate) fn new(config: &Config, ski: &str, providers: Vec<Arc<dyn MdnsProvider>>) -> Self {
        Self {
            local: LocalService {
                ski: ski.to_string(),
                identifier: config.identifier.clone(),
                instance_name: config.instance_name().to_string(),
                brand: config.brand.clone(),
                model: config.model.clone(),
                device_type: config.device_type.clone(),
                port: config.port,
                register: config.register,
            },
            providers,
            active: Mutex::new(None),
            records: Mutex::new(HashMap::new()),
            observer: Mutex::new(None),
            announced: Mutex::new(false),
            searching: Mutex::new(false),
            resolve_cancel: Mutex::new(None),
        }
    }

    /// Pick the first available provider and announce the local service.
    pub(crate) fn setup(&self) -> Result<(), ShipError> {
        let mut active = self.active.lock();
        if active.is_none() {
            for candidate in &self.providers {
                if candidate.is_available() {
                    *active = Some(candidate.clone());
                    break;
                }
                candidate.shutdown();
            }
        }
        if active.is_none() {
            return Err(ShipError::NoMdnsProvider);
        }
        drop(active);

        self.announce()
    }

    fn active_provider(&self) -> Option<Arc<dyn MdnsProvider>> {
        self.active.lock().clone()
    }

    /// Announce the local service (SHIP 7.3.2 TXT set). Idempotent.
    pub(crate) fn announce(&self) -> Result<(), ShipError> {
        let mut announced = self.announced.lock();
        if *announced {
            return Ok(());
        }
        let provider = self.active_provider().ok_or(ShipError::NoMdnsProvider)?;

        let txt = HashMap::from([
            ("txtvers".to_string(), "1".to_string()),
            ("path".to_string(), SHIP_WEBSOCKET_PATH.to_string()),
            ("id".to_string(), self.local.identifier.clone()),
            ("ski".to_string(), self.local.ski.clone()),
            ("brand".to_string(), self.local.brand.clone()),
            ("model".to_string(), self.local.model.clone()),
            ("type".to_string(), self.local.device_type.clone()),
            ("register".to_string(), self.local.register.to_string()),
        ]);

        log::debug!("mdns: announce");
        provider.announce(ServiceAnnouncement {
            instance_name: self.local.instance_name.clone(),
            port: self.local.port,
            txt,
        })?;

        *announced = true;
        Ok(())
    }

    /// Withdraw the local announcement. Idempotent.
    pub(crate) fn unannounce(&self) {
        let mut announced = self.announced.lock();
        if !*announced {
            return;
        }
        if let Some(provider) = self.active_provider() {
            provider.unannounce();
        }
        log::debug!("mdns: stop announcement");
        *announced = false;
    }

    /// Register the snapshot consumer and make sure resolution runs. When
    /// records are already known, the subscriber immediately gets the
    /// current table.
    pub(crate) fn subscribe(self: &Arc<Self>, observer: Arc<dyn MdnsObserver>) {
        *self.observer.lock() = Some(observer.clone());

        {
            let mut searching = self.searching.lock();
            if !*searching {
                *searching = true;
                drop(searching);
                self.start_resolver();
                return;
            }
        }

        let snapshot = self.records.lock().clone();
        if !snapshot.is_empty() {
            tokio::spawn(async move {
                observer.report_mdns_records(snapshot);
            });
        }
    }

    /// Drop the consumer and stop the resolver.
    pub(crate) fn unsubscribe(&self) {
        *self.observer.lock() = None;
        self.stop_resolver();
    }

    pub(crate) fn shutdown(&self) {
        self.unannounce();
        self.stop_resolver();
        if let Some(provider) = self.active.lock().take() {
            provider.shutdown();
        }
    }

    // ── Resolution ───────────────────────────────────────────────────────

    fn start_resolver(self: &Arc<Self>) {
        let Some(provider) = self.active_provider() else {
            *self.searching.lock() = false;
            return;
        };

        let cancel = CancellationToken::new();
        *self.resolve_cancel.lock() = Some(cancel.clone());

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        if let Err(err) = provider.start_resolve(events_tx, cancel.clone()) {
            log::debug!("mdns: failed to start resolution: {err}");
            *self.searching.lock() = false;
            return;
        }

        log::debug!("mdns: start search");
        let broker = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut events_rx = events_rx;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => return,
                    event = events_rx.recv() => {
                        let Some(event) = event else { return };
                        let Some(broker) = broker.upgrade() else { return };
                        broker.process_service_update(event);
                    }
                }
            }
        });
    }

    fn stop_resolver(&self) {
        if let Some(cancel) = self.resolve_cancel.lock().take() {
            log::debug!("mdns: stop search");
            cancel.cancel();
        }
        *self.searching.lock() = false;
    }

    /// Validate, merge and publish one provider event.
    pub(crate) fn process_service_update(&self, update: ServiceUpdate) {
        for key in ["txtvers", "id", "path", "ski", "register"] {
            if !update.txt.contains_key(key) {
                return;
            }
        }
        // SHIP 7.3.2: only txtvers=1 responses may be interpreted
        if update.txt["txtvers"] != "1" {
            return;
        }
        let ski = update.txt["ski"].clone();
        if ski == self.local.ski {
            return;
        }
        let register = update.txt["register"].as_str();
        if register != "true" && register != "false" {
            return;
        }

        let snapshot = {
            let mut records = self.records.lock();
            let mut updated = true;

            match (records.contains_key(&ski), update.remove) {
                (true, true) => {
                    records.remove(&ski);
                }
                (true, false) => {
                    updated = false;
                    let record = records.get_mut(&ski).expect("checked above");
                    for address in &update.addresses {
                        let known = record
                            .addresses
                            .iter()
                            .any(|existing| existing.to_string() == address.to_string());
                        if !known {
                            record.addresses.push(*address);
                            updated = true;
                        }
                    }
                }
                (false, false) => {
                    let record = MdnsRecord {
                        ski: ski.clone(),
                        identifier: update.txt["id"].clone(),
                        path: update.txt["path"].clone(),
                        name: update.name.clone(),
                        host: update.host.clone(),
                        port: update.port,
                        addresses: update.addresses.clone(),
                        brand: update.txt.get("brand").cloned().unwrap_or_default(),
                        model: update.txt.get("model").cloned().unwrap_or_default(),
                        device_type: update.txt.get("type").cloned().unwrap_or_default(),
                        register: register == "true",
                    };
                    log::debug!(
                        "mdns: discovered ski {} ({} {} {}) at {}:{}",
                        record.ski,
                        record.brand,
                        record.model,
                        record.device_type,
                        record.host,
                        record.port
                    );
                    records.insert(ski, record);
                }
                (false, true) => return,
            }

            if !updated {
                return;
            }
            records.clone()
        };

        if let Some(observer) = self.observer.lock().clone() {
            tokio::spawn(async move {
                observer.report_mdns_records(snapshot);
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;
    use std::time::Duration;

    use tokio::sync::mpsc;

    use super::provider::*;
    use super::*;

    struct StubProvider;

    impl MdnsProvider for StubProvider {
        fn is_available(&self) -> bool {
            true
        }
        fn announce(&self, _service: ServiceAnnouncement) -> Result<(), ShipError> {
            Ok(())
        }
        fn unannounce(&self) {}
        fn start_resolve(
            &self,
            _events: mpsc::UnboundedSender<ServiceUpdate>,
            _cancel: CancellationToken,
        ) -> Result<(), ShipError> {
            Ok(())
        }
        fn shutdown(&self) {}
    }

    struct SnapshotObserver {
        tx: mpsc::UnboundedSender<HashMap<String, MdnsRecord>>,
    }

    impl MdnsObserver for SnapshotObserver {
        fn report_mdns_records(&self, records: HashMap<String, MdnsRecord>) {
            let _ = self.tx.send(records);
        }
    }

    fn broker() -> Arc<MdnsBroker> {
        let config = Config {
            identifier: "Local-Service".into(),
            ..Config::default()
        };
        let broker = Arc::new(MdnsBroker::new(
            &config,
            "00aa00aa",
            vec![Arc::new(StubProvider)],
        ));
        broker.setup().unwrap();
        broker
    }

    fn update(ski: &str, addresses: &[&str], remove: bool) -> ServiceUpdate {
        let txt = HashMap::from([
            ("txtvers".to_string(), "1".to_string()),
            ("id".to_string(), "Remote-Service".to_string()),
            ("path".to_string(), SHIP_WEBSOCKET_PATH.to_string()),
            ("ski".to_string(), ski.to_string()),
            ("register".to_string(), "false".to_string()),
        ]);
        ServiceUpdate {
            txt,
            name: "remote".to_string(),
            host: "remote.local.".to_string(),
            port: 4711,
            addresses: addresses
                .iter()
                .map(|raw| raw.parse::<IpAddr>().unwrap())
                .collect(),
            remove,
        }
    }

    async fn next_snapshot(
        rx: &mut mpsc::UnboundedReceiver<HashMap<String, MdnsRecord>>,
    ) -> HashMap<String, MdnsRecord> {
        tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .expect("expected an mdns snapshot")
            .expect("observer channel closed")
    }

    #[tokio::test]
    async fn address_updates_merge_without_duplicates() {
        let broker = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(Arc::new(SnapshotObserver { tx }));

        broker.process_service_update(update("bb11", &["192.168.1.10"], false));
        broker.process_service_update(update("bb11", &["fe80::1"], false));
        // a repeated address must not trigger a publication
        broker.process_service_update(update("bb11", &["192.168.1.10"], false));

        let first = next_snapshot(&mut rx).await;
        assert_eq!(first["bb11"].addresses.len(), 1);

        let second = next_snapshot(&mut rx).await;
        let addresses: Vec<String> = second["bb11"]
            .addresses
            .iter()
            .map(|a| a.to_string())
            .collect();
        assert_eq!(addresses, vec!["192.168.1.10", "fe80::1"]);

        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err(),
            "third event must not publish a snapshot"
        );
    }

    #[tokio::test]
    async fn removal_drops_the_record() {
        let broker = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(Arc::new(SnapshotObserver { tx }));

        broker.process_service_update(update("bb11", &["192.168.1.10"], false));
        let _ = next_snapshot(&mut rx).await;

        broker.process_service_update(update("bb11", &[], true));
        let snapshot = next_snapshot(&mut rx).await;
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn invalid_records_are_ignored() {
        let broker = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(Arc::new(SnapshotObserver { tx }));

        // missing mandatory keys
        let mut incomplete = update("bb11", &["192.168.1.10"], false);
        incomplete.txt.remove("id");
        broker.process_service_update(incomplete);

        // wrong txtvers
        let mut wrong_version = update("bb22", &["192.168.1.11"], false);
        wrong_version
            .txt
            .insert("txtvers".to_string(), "2".to_string());
        broker.process_service_update(wrong_version);

        // register must be a boolean
        let mut bad_register = update("bb33", &["192.168.1.12"], false);
        bad_register
            .txt
            .insert("register".to_string(), "maybe".to_string());
        broker.process_service_update(bad_register);

        // our own announcement
        broker.process_service_update(update("00aa00aa", &["192.168.1.13"], false));

        assert!(
            tokio::time::timeout(Duration::from_millis(200), rx.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn late_subscriber_gets_the_current_table() {
        let broker = broker();
        let (tx, mut rx) = mpsc::unbounded_channel();
        broker.subscribe(Arc::new(SnapshotObserver { tx }));
        broker.process_service_update(update("bb11", &["192.168.1.10"], false));
        let _ = next_snapshot(&mut rx).await;

        let (late_tx, mut late_rx) = mpsc::unbounded_channel();
        broker.subscribe(Arc::new(SnapshotObserver { tx: late_tx }));

        let snapshot = next_snapshot(&mut late_rx).await;
        assert!(snapshot.contains_key("bb11"));
    }
}
