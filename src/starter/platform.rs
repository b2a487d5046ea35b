// The device-side collaborators of the bootstrap: settings, network state,
// payload preparation and notices.
use super::error::{StarterError, StarterResult};
use super::types::{AttemptId, LifecycleCommand, Notice, PayloadVariant};
use crate::config::StarterConfig;
use std::net::IpAddr;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

const ACCESSIBILITY_SERVICES: &str = "enabled_accessibility_services";
const ACCESSIBILITY_ENABLED: &str = "accessibility_enabled";
const ADB_WIFI_ENABLED: &str = "adb_wifi_enabled";

/// Secure settings as they were before the attempt touched them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SecureSettingsSnapshot {
    pub enabled_accessibility_services: Option<String>,
    pub accessibility_enabled: Option<String>,
}

/// Handed to the platform's network watch. Sending only enqueues; every
/// reaction happens on the lifecycle worker.
#[derive(Debug, Clone)]
pub struct NetworkNotifier {
    tx: mpsc::UnboundedSender<LifecycleCommand>,
    attempt: AttemptId,
}

impl NetworkNotifier {
    pub(crate) fn new(tx: mpsc::UnboundedSender<LifecycleCommand>, attempt: AttemptId) -> Self {
        Self { tx, attempt }
    }

    /// Returns false once the lifecycle is gone.
    pub fn network_available(&self) -> bool {
        self.tx
            .send(LifecycleCommand::NetworkAvailable {
                attempt: self.attempt,
            })
            .is_ok()
    }
}

pub trait Platform: Send + Sync + 'static {
    fn has_secure_settings_permission(&self) -> bool;

    /// Starts reporting wireless network availability to `notifier`.
    fn watch_network(&self, notifier: NetworkNotifier) -> StarterResult<()>;
    fn unwatch_network(&self);

    fn capture_secure_settings(&self) -> StarterResult<SecureSettingsSnapshot>;
    fn restore_secure_settings(&self, snapshot: &SecureSettingsSnapshot) -> StarterResult<()>;

    /// Toggles wireless debugging.
    fn set_debug_transport_enabled(&self, enabled: bool) -> StarterResult<()>;

    fn install_pairing_support(&self, snapshot: &SecureSettingsSnapshot) -> StarterResult<()>;
    fn remove_pairing_support(&self) -> StarterResult<()>;

    fn system_property(&self, name: &str) -> StarterResult<Option<String>>;

    /// Addresses assigned to this device's interfaces.
    fn local_addresses(&self) -> StarterResult<Vec<IpAddr>> {
        Ok(Vec::new())
    }

    fn prepare_payload(&self, variant: PayloadVariant) -> StarterResult<()>;
    fn command(&self, variant: PayloadVariant) -> String;

    fn is_service_running(&self) -> bool {
        false
    }

    fn notify(&self, notice: &Notice);
}

/// Implements the platform with the device's own shell tools. Meant to run
/// on the device as root or the shell user.
pub struct AndroidShellPlatform {
    config: StarterConfig,
    watcher: Mutex<Option<Arc<AtomicBool>>>,
}

impl AndroidShellPlatform {
    pub fn new(config: StarterConfig) -> Self {
        Self {
            config,
            watcher: Mutex::new(None),
        }
    }

    fn run(operation: &'static str, program: &str, args: &[&str]) -> StarterResult<String> {
        let output = Command::new(program)
            .args(args)
            .output()
            .map_err(|e| StarterError::platform(operation, format!("{program}: {e}")))?;
        if !output.status.success() {
            return Err(StarterError::platform(
                operation,
                format!(
                    "{program} exited with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr).trim()
                ),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    fn get_setting(table: &str, key: &str) -> StarterResult<Option<String>> {
        let value = Self::run("settings get", "settings", &["get", table, key])?;
        Ok(match value.as_str() {
            "" | "null" => None,
            _ => Some(value),
        })
    }

    fn put_setting(table: &str, key: &str, value: Option<&str>) -> StarterResult<()> {
        let result = match value {
            Some(value) => Self::run("settings put", "settings", &["put", table, key, value]),
            None => Self::run("settings delete", "settings", &["delete", table, key]),
        };
        result.map(|_| ())
    }

    fn wireless_up(interface: &str) -> bool {
        Self::run("ip addr", "ip", &["-4", "-o", "addr", "show", interface])
            .map(|out| out.contains(" inet "))
            .unwrap_or(false)
    }
}

impl Platform for AndroidShellPlatform {
    fn has_secure_settings_permission(&self) -> bool {
        // root, system and shell may all write secure settings
        match Self::run("id", "id", &["-u"]) {
            Ok(uid) => matches!(uid.as_str(), "0" | "1000" | "2000"),
            Err(e) => {
                log::warn!("⚠️  Could not determine uid: {e}");
                false
            }
        }
    }

    fn watch_network(&self, notifier: NetworkNotifier) -> StarterResult<()> {
        self.unwatch_network();
        let stop = Arc::new(AtomicBool::new(false));
        let interface = self.config.network_interface.clone();
        let interval = self.config.network_poll_interval();
        let thread_stop = Arc::clone(&stop);

        std::thread::Builder::new()
            .name("network-watch".to_string())
            .spawn(move || {
                let mut was_up = false;
                while !thread_stop.load(Ordering::SeqCst) {
                    let up = Self::wireless_up(&interface);
                    if up && !was_up {
                        log::info!("📶 {interface} has an IPv4 address");
                        if !notifier.network_available() {
                            break;
                        }
                    }
                    was_up = up;
                    std::thread::sleep(interval);
                }
            })
            .map_err(|e| StarterError::platform("network watch", e))?;

        *self.watcher.lock().unwrap_or_else(|e| e.into_inner()) = Some(stop);
        Ok(())
    }

    fn unwatch_network(&self) {
        if let Some(stop) = self.watcher.lock().unwrap_or_else(|e| e.into_inner()).take() {
            stop.store(true, Ordering::SeqCst);
        }
    }

    fn capture_secure_settings(&self) -> StarterResult<SecureSettingsSnapshot> {
        Ok(SecureSettingsSnapshot {
            enabled_accessibility_services: Self::get_setting("secure", ACCESSIBILITY_SERVICES)?,
            accessibility_enabled: Self::get_setting("secure", ACCESSIBILITY_ENABLED)?,
        })
    }

    fn restore_secure_settings(&self, snapshot: &SecureSettingsSnapshot) -> StarterResult<()> {
        Self::put_setting(
            "secure",
            ACCESSIBILITY_SERVICES,
            snapshot.enabled_accessibility_services.as_deref(),
        )?;
        Self::put_setting(
            "secure",
            ACCESSIBILITY_ENABLED,
            snapshot.accessibility_enabled.as_deref(),
        )
    }

    fn set_debug_transport_enabled(&self, enabled: bool) -> StarterResult<()> {
        Self::put_setting("global", ADB_WIFI_ENABLED, Some(if enabled { "1" } else { "0" }))
    }

    fn install_pairing_support(&self, snapshot: &SecureSettingsSnapshot) -> StarterResult<()> {
        let services = with_component(
            snapshot.enabled_accessibility_services.as_deref(),
            &self.config.pairing_component(),
        );
        Self::put_setting("secure", ACCESSIBILITY_SERVICES, Some(&services))?;
        Self::put_setting("secure", ACCESSIBILITY_ENABLED, Some("1"))
    }

    fn remove_pairing_support(&self) -> StarterResult<()> {
        let current = Self::get_setting("secure", ACCESSIBILITY_SERVICES)?;
        let remaining = without_component(current.as_deref(), &self.config.pairing_component());
        Self::put_setting("secure", ACCESSIBILITY_SERVICES, remaining.as_deref())
    }

    fn system_property(&self, name: &str) -> StarterResult<Option<String>> {
        let value = Self::run("getprop", "getprop", &[name])?;
        Ok((!value.is_empty()).then_some(value))
    }

    fn local_addresses(&self) -> StarterResult<Vec<IpAddr>> {
        Self::run("ip addr", "ip", &["-o", "addr", "show"]).map(|out| parse_interface_addresses(&out))
    }

    fn prepare_payload(&self, variant: PayloadVariant) -> StarterResult<()> {
        let snippet = match variant {
            PayloadVariant::Primary => self.config.primary.prepare.as_deref(),
            PayloadVariant::Secondary => self.config.secondary.prepare.as_deref(),
        };
        match snippet {
            Some(snippet) => {
                log::debug!("📦 Preparing {variant:?} payload");
                Self::run("prepare payload", "sh", &["-c", snippet]).map(|_| ())
            }
            None => Ok(()),
        }
    }

    fn command(&self, variant: PayloadVariant) -> String {
        match variant {
            PayloadVariant::Primary => self.config.primary_command(),
            PayloadVariant::Secondary => self.config.secondary_command(),
        }
    }

    fn is_service_running(&self) -> bool {
        let Some(check) = self.config.service_check.as_deref() else {
            return false;
        };
        Command::new("sh")
            .args(["-c", check])
            .status()
            .map(|status| status.success())
            .unwrap_or(false)
    }

    fn notify(&self, notice: &Notice) {
        match notice.error {
            None => log::info!("🔔 {:?}: {}", notice.state, notice.message),
            Some(kind) => log::warn!("🔔 {:?} ({kind:?}): {}", notice.state, notice.message),
        }
        eprintln!("{}", notice.message);
    }
}

/// Pulls the `inet`/`inet6` addresses out of `ip -o addr show` output.
pub fn parse_interface_addresses(output: &str) -> Vec<IpAddr> {
    output
        .lines()
        .filter_map(|line| {
            let mut tokens = line.split_whitespace();
            tokens.find(|t| *t == "inet" || *t == "inet6")?;
            let cidr = tokens.next()?;
            cidr.split('/').next()?.parse().ok()
        })
        .collect()
}

/// `component` in front of the existing colon-separated service list.
pub fn with_component(services: Option<&str>, component: &str) -> String {
    match services {
        Some(existing) if !existing.is_empty() => format!("{component}:{existing}"),
        _ => component.to_string(),
    }
}

/// The service list with every `component` entry dropped; `None` when empty.
pub fn without_component(services: Option<&str>, component: &str) -> Option<String> {
    let remaining = services?
        .split(':')
        .filter(|entry| !entry.is_empty() && *entry != component)
        .collect::<Vec<_>>()
        .join(":");
    (!remaining.is_empty()).then_some(remaining)
}
