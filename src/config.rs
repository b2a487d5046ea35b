// Starter configuration, read from an optional JSON file
use crate::adb::{AdbResult, FileKeyStore};
use crate::starter::error::{StarterError, StarterResult};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_PACKAGE: &str = "moe.shizuku.privileged.api";
pub const DEFAULT_MDNS_SERVICE: &str = "_adb-tls-connect._tcp.local.";
pub const DEFAULT_PORT_PROPERTY: &str = "service.adb.tcp.port";
const DEFAULT_KEY_FILE: &str = "starter_adbkey";

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_mdns_service() -> String {
    DEFAULT_MDNS_SERVICE.to_string()
}

fn default_port_property() -> String {
    DEFAULT_PORT_PROPERTY.to_string()
}

fn default_key_label() -> String {
    "starter".to_string()
}

fn default_package() -> String {
    DEFAULT_PACKAGE.to_string()
}

fn default_interface() -> String {
    "wlan0".to_string()
}

fn default_poll_interval() -> u64 {
    2
}

/// How the debugging port is found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub enum DiscoveryMode {
    /// Browse mDNS for the TLS connect service (Android 11 and later).
    #[default]
    Mdns,
    /// Read the legacy static port property once.
    StaticProperty,
}

/// A command variant plus the shell snippet that lays down its payload.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PayloadConfig {
    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub prepare: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StarterConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default)]
    pub discovery: DiscoveryMode,
    #[serde(default = "default_mdns_service")]
    pub mdns_service_type: String,
    #[serde(default = "default_port_property")]
    pub static_port_property: String,
    /// Skips discovery entirely when set.
    #[serde(default)]
    pub fixed_port: Option<u16>,
    #[serde(default)]
    pub port_wait_timeout_secs: Option<u64>,
    #[serde(default)]
    pub io_timeout_secs: Option<u64>,
    #[serde(default)]
    pub key_path: Option<PathBuf>,
    #[serde(default = "default_key_label")]
    pub key_label: String,
    #[serde(default = "default_package")]
    pub package_name: String,
    #[serde(default)]
    pub primary: PayloadConfig,
    #[serde(default)]
    pub secondary: PayloadConfig,
    #[serde(default = "default_interface")]
    pub network_interface: String,
    #[serde(default = "default_poll_interval")]
    pub network_poll_interval_secs: u64,
    /// Component prepended to the enabled accessibility services while the
    /// attempt runs. Defaults to the package's ADB helper service.
    #[serde(default)]
    pub pairing_component: Option<String>,
    /// Shell command whose zero exit status means the service already runs.
    #[serde(default)]
    pub service_check: Option<String>,
}

impl Default for StarterConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            discovery: DiscoveryMode::default(),
            mdns_service_type: default_mdns_service(),
            static_port_property: default_port_property(),
            fixed_port: None,
            port_wait_timeout_secs: None,
            io_timeout_secs: None,
            key_path: None,
            key_label: default_key_label(),
            package_name: default_package(),
            primary: PayloadConfig::default(),
            secondary: PayloadConfig::default(),
            network_interface: default_interface(),
            network_poll_interval_secs: default_poll_interval(),
            pairing_component: None,
            service_check: None,
        }
    }
}

impl StarterConfig {
    pub fn load(path: &Path) -> StarterResult<Self> {
        let config_error = |description: String| StarterError::Config {
            path: path.to_path_buf(),
            description,
        };
        let text = std::fs::read_to_string(path).map_err(|e| config_error(e.to_string()))?;
        let config: Self = serde_json::from_str(&text).map_err(|e| config_error(e.to_string()))?;
        if config.package_name.trim().is_empty() {
            return Err(config_error("packageName must not be empty".to_string()));
        }
        log::debug!("📄 Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn primary_command(&self) -> String {
        self.primary
            .command
            .clone()
            .unwrap_or_else(|| format!("sh /sdcard/Android/data/{}/start.sh", self.package_name))
    }

    pub fn secondary_command(&self) -> String {
        self.secondary
            .command
            .clone()
            .unwrap_or_else(|| format!("sh /data/user_de/0/{}/start.sh", self.package_name))
    }

    /// Text the shell prints when adbd may not read the primary payload.
    pub fn fallback_marker(&self) -> String {
        format!("/Android/data/{}/start.sh: Permission denied", self.package_name)
    }

    pub fn pairing_component(&self) -> String {
        self.pairing_component
            .clone()
            .unwrap_or_else(|| format!("{}/moe.shizuku.manager.adb.AdbAccessibilityService", self.package_name))
    }

    /// The configured key file, or `~/.android/starter_adbkey`.
    pub fn key_store(&self) -> AdbResult<FileKeyStore> {
        match &self.key_path {
            Some(path) => Ok(FileKeyStore::new(path.clone())),
            None => FileKeyStore::in_android_home(DEFAULT_KEY_FILE),
        }
    }

    pub fn port_wait_timeout(&self) -> Option<Duration> {
        self.port_wait_timeout_secs.map(Duration::from_secs)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_secs.map(Duration::from_secs)
    }

    pub fn network_poll_interval(&self) -> Duration {
        Duration::from_secs(self.network_poll_interval_secs.max(1))
    }
}
