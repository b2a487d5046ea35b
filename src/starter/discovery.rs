// PortDiscoverer: yields the wireless debugging port through a single-slot
// channel. The waiting bound belongs to the caller.
use super::error::{StarterError, StarterResult};
use super::platform::Platform;
use mdns_sd::{ServiceDaemon, ServiceEvent};
use std::net::IpAddr;
use std::sync::Arc;
use tokio::sync::watch;

/// Write end of the port slot. Values outside 1..=65535 never reach it.
#[derive(Debug, Clone)]
pub struct PortPublisher {
    tx: watch::Sender<Option<u16>>,
}

impl PortPublisher {
    pub fn publish(&self, raw: i64) -> bool {
        match u16::try_from(raw) {
            Ok(port) if port >= 1 => {
                log::debug!("📡 Port {port} published");
                // Overwrites a value nobody consumed yet
                self.tx.send_replace(Some(port));
                true
            }
            _ => {
                log::debug!("📡 Ignoring invalid port value {raw}");
                false
            }
        }
    }
}

/// A source of port advertisements.
pub trait DiscoveryBackend: Send {
    fn name(&self) -> &'static str;
    /// Starts producing ports. Called from within the lifecycle's runtime.
    fn begin(&mut self, publisher: PortPublisher) -> StarterResult<()>;
    fn end(&mut self);
}

pub type DiscoveryFactory = Box<dyn Fn() -> Box<dyn DiscoveryBackend> + Send>;

pub struct PortDiscoverer {
    backend: Box<dyn DiscoveryBackend>,
    tx: watch::Sender<Option<u16>>,
    started: bool,
}

impl PortDiscoverer {
    pub fn new(backend: Box<dyn DiscoveryBackend>) -> Self {
        let (tx, _) = watch::channel(None);
        Self {
            backend,
            tx,
            started: false,
        }
    }

    /// Read end of the slot; only values published after this call are seen
    /// as changes.
    pub fn receiver(&self) -> watch::Receiver<Option<u16>> {
        self.tx.subscribe()
    }

    pub fn start(&mut self) -> StarterResult<()> {
        if self.started {
            return Ok(());
        }
        log::info!("🔎 Starting {} port discovery", self.backend.name());
        self.started = true;
        self.backend.begin(PortPublisher {
            tx: self.tx.clone(),
        })
    }

    /// Idempotent, and a no-op when never started.
    pub fn stop(&mut self) {
        if !self.started {
            return;
        }
        self.started = false;
        self.backend.end();
        log::debug!("🔎 {} port discovery stopped", self.backend.name());
    }

    pub fn is_started(&self) -> bool {
        self.started
    }
}

impl Drop for PortDiscoverer {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Browses mDNS for the wireless debugging TLS service. Only instances
/// advertised from one of this device's own addresses are published, since
/// the connection always goes to the configured host.
pub struct MdnsDiscovery {
    service_type: String,
    host: Option<IpAddr>,
    platform: Arc<dyn Platform>,
    daemon: Option<ServiceDaemon>,
    browser: Option<tokio::task::JoinHandle<()>>,
}

impl MdnsDiscovery {
    pub fn new(service_type: impl Into<String>, host: &str, platform: Arc<dyn Platform>) -> Self {
        Self {
            service_type: service_type.into(),
            host: host.parse().ok(),
            platform,
            daemon: None,
            browser: None,
        }
    }
}

impl DiscoveryBackend for MdnsDiscovery {
    fn name(&self) -> &'static str {
        "mDNS"
    }

    fn begin(&mut self, publisher: PortPublisher) -> StarterResult<()> {
        let daemon = ServiceDaemon::new().map_err(|e| StarterError::platform("mdns daemon", e))?;
        let receiver = daemon
            .browse(&self.service_type)
            .map_err(|e| StarterError::platform("mdns browse", e))?;
        let service_type = self.service_type.clone();
        let platform = Arc::clone(&self.platform);
        let host = self.host;

        self.browser = Some(tokio::spawn(async move {
            let mut local = match tokio::task::spawn_blocking(move || platform.local_addresses()).await {
                Ok(Ok(addresses)) => addresses,
                Ok(Err(e)) => {
                    log::warn!("⚠️  Could not list local addresses: {e}");
                    Vec::new()
                }
                Err(e) => {
                    log::warn!("⚠️  Local address lookup failed: {e}");
                    Vec::new()
                }
            };
            local.extend(host);
            log::debug!("🔎 Browsing {service_type}, local addresses {local:?}");

            loop {
                match receiver.recv_async().await {
                    Ok(ServiceEvent::ServiceResolved(info)) => {
                        let addresses = info.get_addresses().iter().copied().collect::<Vec<IpAddr>>();
                        if !is_local_instance(&addresses, &local) {
                            log::debug!(
                                "📡 Skipping {} advertised from {addresses:?}",
                                info.get_fullname()
                            );
                            continue;
                        }
                        log::info!(
                            "📡 Resolved {} on port {}",
                            info.get_fullname(),
                            info.get_port()
                        );
                        publisher.publish(i64::from(info.get_port()));
                    }
                    Ok(ServiceEvent::ServiceRemoved(_, fullname)) => {
                        log::debug!("📡 Service removed: {fullname}");
                    }
                    Ok(_) => {}
                    Err(e) => {
                        log::debug!("🔎 mDNS browse channel closed: {e}");
                        break;
                    }
                }
            }
        }));
        self.daemon = Some(daemon);
        Ok(())
    }

    fn end(&mut self) {
        if let Some(daemon) = self.daemon.take() {
            let _ = daemon.stop_browse(&self.service_type);
            if let Err(e) = daemon.shutdown() {
                log::warn!("⚠️  mDNS daemon shutdown failed: {e}");
            }
        }
        if let Some(browser) = self.browser.take() {
            browser.abort();
        }
    }
}

/// True when an instance advertised from `addresses` belongs to this device.
pub fn is_local_instance(addresses: &[IpAddr], local: &[IpAddr]) -> bool {
    addresses
        .iter()
        .any(|addr| addr.is_loopback() || local.contains(addr))
}

/// Reads the legacy static port property once, for devices without the mDNS
/// advertisement.
pub struct StaticPortDiscovery {
    platform: Arc<dyn Platform>,
    property: String,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl StaticPortDiscovery {
    pub fn new(platform: Arc<dyn Platform>, property: impl Into<String>) -> Self {
        Self {
            platform,
            property: property.into(),
            reader: None,
        }
    }
}

impl DiscoveryBackend for StaticPortDiscovery {
    fn name(&self) -> &'static str {
        "static property"
    }

    fn begin(&mut self, publisher: PortPublisher) -> StarterResult<()> {
        let platform = Arc::clone(&self.platform);
        let property = self.property.clone();
        self.reader = Some(tokio::task::spawn_blocking(move || {
            match platform.system_property(&property) {
                Ok(raw) => match raw.as_deref().and_then(parse_port_property) {
                    Some(port) => {
                        publisher.publish(port);
                    }
                    None => log::warn!("⚠️  Property {property} holds no port ({raw:?})"),
                },
                Err(e) => log::warn!("⚠️  Could not read {property}: {e}"),
            }
        }));
        Ok(())
    }

    fn end(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}

/// Publishes a port known up front.
pub struct FixedPortDiscovery {
    port: u16,
}

impl FixedPortDiscovery {
    pub fn new(port: u16) -> Self {
        Self { port }
    }
}

impl DiscoveryBackend for FixedPortDiscovery {
    fn name(&self) -> &'static str {
        "fixed"
    }

    fn begin(&mut self, publisher: PortPublisher) -> StarterResult<()> {
        publisher.publish(i64::from(self.port));
        Ok(())
    }

    fn end(&mut self) {}
}

pub fn parse_port_property(raw: &str) -> Option<i64> {
    raw.trim().parse().ok()
}
