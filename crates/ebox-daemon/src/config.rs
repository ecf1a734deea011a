//! Configuration management.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use ebox_access::AccessConfig;

/// Main configuration structure.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Directory for runtime state (settings, accumulators, alert flags)
    #[serde(default = "default_state_dir")]
    pub state_dir: String,

    /// Scheduler timing
    #[serde(default)]
    pub scheduler: SchedulerConfig,

    /// Privileged access configuration
    #[serde(default)]
    pub access: AccessSection,

    /// Battery module configuration
    #[serde(default)]
    pub battery: BatteryConfig,

    /// Storage module configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Network and data usage configuration
    #[serde(default)]
    pub network: NetworkConfig,

    /// Speed test configuration
    #[serde(default)]
    pub speedtest: SpeedTestConfig,

    /// D-Bus configuration
    #[serde(default)]
    pub dbus: DbusConfig,

    /// Web API configuration
    #[serde(default)]
    pub web: WebConfig,
}

/// Scheduler wake-up bounds.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Shortest sleep between cycles in milliseconds
    #[serde(default = "default_floor")]
    pub floor_ms: u64,

    /// Longest sleep between cycles in milliseconds
    #[serde(default = "default_ceiling")]
    pub ceiling_ms: u64,

    /// Sleep when no module is running
    #[serde(default = "default_idle")]
    pub idle_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            floor_ms: default_floor(),
            ceiling_ms: default_ceiling(),
            idle_ms: default_idle(),
        }
    }
}

/// Privileged access configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccessSection {
    /// Command line of the privileged shell
    #[serde(default = "default_shell")]
    pub shell: Vec<String>,

    /// Read cache TTL in milliseconds
    #[serde(default = "default_cache_ttl")]
    pub cache_ttl_ms: u64,

    /// Per-command timeout in milliseconds
    #[serde(default = "default_command_timeout")]
    pub command_timeout_ms: u64,

    /// Bound on closing the shell at shutdown
    #[serde(default = "default_close_timeout")]
    pub close_timeout_ms: u64,

    /// Optional secondary privileged channel
    #[serde(default)]
    pub secondary: Option<SecondaryConfig>,
}

impl Default for AccessSection {
    fn default() -> Self {
        Self {
            shell: default_shell(),
            cache_ttl_ms: default_cache_ttl(),
            command_timeout_ms: default_command_timeout(),
            close_timeout_ms: default_close_timeout(),
            secondary: None,
        }
    }
}

impl AccessSection {
    /// Converts to the access library configuration.
    pub fn to_access_config(&self) -> AccessConfig {
        AccessConfig {
            shell: self.shell.clone(),
            cache_ttl: Duration::from_millis(self.cache_ttl_ms),
            command_timeout: Duration::from_millis(self.command_timeout_ms),
            close_timeout: Duration::from_millis(self.close_timeout_ms),
        }
    }
}

/// Secondary channel command lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecondaryConfig {
    /// Prefix the command is appended to (e.g. ["rish", "-c"])
    pub command: Vec<String>,

    /// Authorization check; must exit 0 when the channel is usable
    pub ping: Vec<String>,
}

/// Battery module configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatteryConfig {
    /// Power supply directory or "auto" for auto-detection
    #[serde(default = "default_power_supply")]
    pub power_supply: String,
}

impl Default for BatteryConfig {
    fn default() -> Self {
        Self {
            power_supply: default_power_supply(),
        }
    }
}

/// Storage module configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Mount point to report
    #[serde(default = "default_storage_path")]
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: default_storage_path(),
        }
    }
}

/// Interface classification for data usage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    /// Interface name prefixes counted as Wi-Fi
    #[serde(default = "default_wifi_prefixes")]
    pub wifi_prefixes: Vec<String>,

    /// Interface name prefixes counted as mobile data
    #[serde(default = "default_mobile_prefixes")]
    pub mobile_prefixes: Vec<String>,

    /// Interface name prefixes of VPN tunnels
    #[serde(default = "default_vpn_prefixes")]
    pub vpn_prefixes: Vec<String>,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            wifi_prefixes: default_wifi_prefixes(),
            mobile_prefixes: default_mobile_prefixes(),
            vpn_prefixes: default_vpn_prefixes(),
        }
    }
}

/// Speed test endpoints.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpeedTestConfig {
    /// Download URLs tried in order
    #[serde(default = "default_download_urls")]
    pub download_urls: Vec<String>,

    /// Upload endpoint
    #[serde(default = "default_upload_url")]
    pub upload_url: String,

    /// Host:port used for the TCP connect ping
    #[serde(default = "default_ping_host")]
    pub ping_host: String,
}

impl Default for SpeedTestConfig {
    fn default() -> Self {
        Self {
            download_urls: default_download_urls(),
            upload_url: default_upload_url(),
            ping_host: default_ping_host(),
        }
    }
}

/// D-Bus bus type selection.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbusBusType {
    /// Session bus (user session).
    Session,
    /// System bus (system-wide).
    System,
    /// Try session first, fall back to system.
    #[default]
    Auto,
}

/// D-Bus configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbusConfig {
    /// Whether to register the D-Bus service
    #[serde(default = "default_true")]
    pub enable: bool,

    /// Which bus to connect to
    #[serde(default)]
    pub bus: DbusBusType,
}

impl Default for DbusConfig {
    fn default() -> Self {
        Self {
            enable: true,
            bus: DbusBusType::default(),
        }
    }
}

/// Web API configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebConfig {
    /// Whether to serve the JSON API
    #[serde(default)]
    pub enable: bool,

    /// Listen address (e.g., "127.0.0.1:8687")
    #[serde(default = "default_listen")]
    pub listen: String,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            enable: false,
            listen: default_listen(),
        }
    }
}

// Default value functions
fn default_state_dir() -> String {
    "/var/lib/eboxd".to_string()
}

fn default_floor() -> u64 {
    1000
}

fn default_ceiling() -> u64 {
    60000
}

fn default_idle() -> u64 {
    5000
}

fn default_shell() -> Vec<String> {
    vec!["su".to_string()]
}

fn default_cache_ttl() -> u64 {
    1000
}

fn default_command_timeout() -> u64 {
    5000
}

fn default_close_timeout() -> u64 {
    2000
}

fn default_power_supply() -> String {
    "auto".to_string()
}

fn default_storage_path() -> String {
    "/".to_string()
}

fn default_wifi_prefixes() -> Vec<String> {
    vec!["wlan".to_string(), "wl".to_string()]
}

fn default_vpn_prefixes() -> Vec<String> {
    vec!["tun".to_string(), "wg".to_string(), "tap".to_string()]
}

fn default_mobile_prefixes() -> Vec<String> {
    vec![
        "rmnet".to_string(),
        "ccmni".to_string(),
        "wwan".to_string(),
        "pdp".to_string(),
    ]
}

fn default_download_urls() -> Vec<String> {
    vec![
        "https://speed.cloudflare.com/__down?bytes=5000000".to_string(),
        "https://proof.ovh.net/files/1Mb.dat".to_string(),
        "https://ash-speed.hetzner.com/1MB.bin".to_string(),
    ]
}

fn default_upload_url() -> String {
    "https://speed.cloudflare.com/__up".to_string()
}

fn default_ping_host() -> String {
    "1.1.1.1:443".to_string()
}

fn default_listen() -> String {
    "127.0.0.1:8687".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Loads configuration from a TOML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content =
            std::fs::read_to_string(path.as_ref()).context("Failed to read configuration file")?;
        let config: Config = toml::from_str(&content).context("Failed to parse configuration")?;
        Ok(config)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            state_dir: default_state_dir(),
            scheduler: SchedulerConfig::default(),
            access: AccessSection::default(),
            battery: BatteryConfig::default(),
            storage: StorageConfig::default(),
            network: NetworkConfig::default(),
            speedtest: SpeedTestConfig::default(),
            dbus: DbusConfig::default(),
            web: WebConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_uses_defaults() {
        let config: Config = toml::from_str("").unwrap();
        assert_eq!(config.scheduler.floor_ms, 1000);
        assert_eq!(config.scheduler.ceiling_ms, 60000);
        assert_eq!(config.access.shell, vec!["su".to_string()]);
        assert!(config.access.secondary.is_none());
        assert!(config.dbus.enable);
        assert!(!config.web.enable);
    }

    #[test]
    fn test_partial_sections() {
        let config: Config = toml::from_str(
            r#"
            state_dir = "/tmp/ebox"

            [scheduler]
            floor_ms = 500

            [access]
            shell = ["sudo", "-n", "sh"]

            [access.secondary]
            command = ["rish", "-c"]
            ping = ["rish", "-c", "true"]

            [dbus]
            bus = "system"
            "#,
        )
        .unwrap();
        assert_eq!(config.state_dir, "/tmp/ebox");
        assert_eq!(config.scheduler.floor_ms, 500);
        assert_eq!(config.scheduler.ceiling_ms, 60000);
        assert_eq!(config.access.shell.len(), 3);
        assert_eq!(config.access.cache_ttl_ms, 1000);
        let secondary = config.access.secondary.unwrap();
        assert_eq!(secondary.command, vec!["rish", "-c"]);
        assert!(matches!(config.dbus.bus, DbusBusType::System));
    }

    #[test]
    fn test_access_config_conversion() {
        let access = AccessSection::default().to_access_config();
        assert_eq!(access.cache_ttl, Duration::from_millis(1000));
        assert_eq!(access.command_timeout, Duration::from_secs(5));
    }

    #[test]
    fn test_shipped_config_matches_defaults() {
        let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../config/default.toml");
        let config = Config::load(path).unwrap();
        let defaults = Config::default();
        assert_eq!(config.state_dir, defaults.state_dir);
        assert_eq!(config.scheduler.idle_ms, defaults.scheduler.idle_ms);
        assert_eq!(config.network.mobile_prefixes, defaults.network.mobile_prefixes);
        assert_eq!(config.network.vpn_prefixes, defaults.network.vpn_prefixes);
        assert_eq!(config.speedtest.download_urls, defaults.speedtest.download_urls);
        assert_eq!(config.web.listen, defaults.web.listen);
    }
}
