//! Telemetry modules.
//!
//! Each module collects one family of readouts on its own cadence. The engine
//! drives them through the [`Module`] lifecycle and publishes their readouts.

mod battery;
mod connection;
mod cpu_ram;
mod data_usage;
mod network;
mod sleep;
mod speedtest;
mod storage;
mod uptime;

pub use battery::BatteryModule;
pub use connection::ConnectionModule;
pub use cpu_ram::CpuRamModule;
pub use data_usage::DataUsageModule;
pub use network::NetworkModule;
pub use sleep::SleepModule;
pub use speedtest::SpeedTestModule;
pub use storage::StorageModule;
pub use uptime::UptimeModule;

pub(crate) use uptime::boot_epoch_ms;

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use ebox_access::SystemAccess;

use crate::alert::AlertSink;
use crate::config::Config;
use crate::settings::SettingsStore;
use crate::snapshot::Readouts;

/// Stable identifier of every known module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ModuleKey {
    Battery,
    CpuRam,
    Sleep,
    Network,
    Data,
    SpeedTest,
    Storage,
    Connection,
    Uptime,
}

impl ModuleKey {
    pub const ALL: [ModuleKey; 9] = [
        ModuleKey::Battery,
        ModuleKey::CpuRam,
        ModuleKey::Sleep,
        ModuleKey::Network,
        ModuleKey::Data,
        ModuleKey::SpeedTest,
        ModuleKey::Storage,
        ModuleKey::Connection,
        ModuleKey::Uptime,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleKey::Battery => "battery",
            ModuleKey::CpuRam => "cpu_ram",
            ModuleKey::Sleep => "sleep",
            ModuleKey::Network => "network",
            ModuleKey::Data => "data",
            ModuleKey::SpeedTest => "speedtest",
            ModuleKey::Storage => "storage",
            ModuleKey::Connection => "connection",
            ModuleKey::Uptime => "uptime",
        }
    }

    /// Display name.
    pub fn name(&self) -> &'static str {
        match self {
            ModuleKey::Battery => "Battery",
            ModuleKey::CpuRam => "CPU & RAM",
            ModuleKey::Sleep => "Deep Sleep",
            ModuleKey::Network => "Network Speed",
            ModuleKey::Data => "Data Usage",
            ModuleKey::SpeedTest => "Speed Test",
            ModuleKey::Storage => "Storage",
            ModuleKey::Connection => "Connection Info",
            ModuleKey::Uptime => "Uptime",
        }
    }

    /// Sort order; lower comes first.
    pub fn priority(&self) -> i32 {
        match self {
            ModuleKey::Battery => 10,
            ModuleKey::CpuRam => 15,
            ModuleKey::Sleep => 30,
            ModuleKey::Network => 40,
            ModuleKey::Data => 50,
            ModuleKey::SpeedTest => 80,
            ModuleKey::Storage => 85,
            ModuleKey::Connection => 90,
            ModuleKey::Uptime => 95,
        }
    }

    pub fn default_enabled(&self) -> bool {
        matches!(
            self,
            ModuleKey::Battery
                | ModuleKey::CpuRam
                | ModuleKey::Sleep
                | ModuleKey::Network
                | ModuleKey::Data
        )
    }

    /// Settings key holding the tick interval, and its default in ms.
    pub fn interval_setting(&self) -> (&'static str, i64) {
        match self {
            ModuleKey::Battery => ("bat_interval", 10_000),
            ModuleKey::CpuRam => ("cpu_interval", 5_000),
            ModuleKey::Sleep => ("slp_interval", 30_000),
            ModuleKey::Network => ("net_interval", 3_000),
            ModuleKey::Data => ("dat_interval", 60_000),
            ModuleKey::SpeedTest => ("spd_interval", 30_000),
            ModuleKey::Storage => ("sto_interval", 300_000),
            ModuleKey::Connection => ("con_interval", 10_000),
            ModuleKey::Uptime => ("upt_interval", 60_000),
        }
    }

    /// Tick interval from live settings, never below one second.
    pub fn interval_ms(&self, settings: &SettingsStore) -> u64 {
        let (key, default) = self.interval_setting();
        settings.get_i64(key, default).max(1000) as u64
    }
}

impl fmt::Display for ModuleKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModuleKey {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        ModuleKey::ALL
            .into_iter()
            .find(|k| k.as_str() == s)
            .ok_or_else(|| format!("Unknown module: {}", s))
    }
}

/// Shared handles a module receives on start.
#[derive(Clone)]
pub struct ModuleContext {
    pub access: Arc<SystemAccess>,
    pub settings: Arc<SettingsStore>,
    pub alerts: AlertSink,
    pub config: Arc<Config>,
}

/// Contract every telemetry module implements.
///
/// `start` and `stop` are no-ops when the module is already in the target
/// state. `stop` must not block.
#[async_trait]
pub trait Module: Send {
    fn key(&self) -> ModuleKey;

    fn name(&self) -> &'static str {
        self.key().name()
    }

    fn priority(&self) -> i32 {
        self.key().priority()
    }

    fn default_enabled(&self) -> bool {
        self.key().default_enabled()
    }

    /// Current tick interval; may change between calls.
    fn tick_interval_ms(&self) -> u64;

    async fn start(&mut self, ctx: ModuleContext) -> Result<()>;

    fn stop(&mut self);

    async fn tick(&mut self);

    /// Evaluates alert thresholds against the state of the last tick.
    fn check_alerts(&mut self) {}

    /// Short single-line summary.
    fn compact(&self) -> String;

    /// Multi-line summary.
    fn detail(&self) -> String;

    /// Ordered readouts for consumers.
    fn data_points(&self) -> Readouts;

    fn alive(&self) -> bool;
}

/// Modules keyed by their identifier.
#[derive(Default)]
pub struct ModuleRegistry {
    modules: BTreeMap<ModuleKey, Box<dyn Module>>,
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in module.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register(Box::new(BatteryModule::new()));
        registry.register(Box::new(CpuRamModule::new()));
        registry.register(Box::new(SleepModule::new()));
        registry.register(Box::new(NetworkModule::new()));
        registry.register(Box::new(DataUsageModule::new()));
        registry.register(Box::new(SpeedTestModule::new()));
        registry.register(Box::new(StorageModule::new()));
        registry.register(Box::new(ConnectionModule::new()));
        registry.register(Box::new(UptimeModule::new()));
        registry
    }

    /// Adds a module, replacing any module with the same key.
    pub fn register(&mut self, module: Box<dyn Module>) {
        self.modules.insert(module.key(), module);
    }

    pub fn get(&self, key: ModuleKey) -> Option<&dyn Module> {
        self.modules.get(&key).map(|m| m.as_ref())
    }

    pub fn get_mut(&mut self, key: ModuleKey) -> Option<&mut (dyn Module + 'static)> {
        self.modules.get_mut(&key).map(|m| m.as_mut())
    }

    /// Keys sorted by priority.
    pub fn keys(&self) -> Vec<ModuleKey> {
        let mut keys: Vec<_> = self.modules.keys().copied().collect();
        keys.sort_by_key(|k| (self.modules[k].priority(), *k));
        keys
    }

    /// Running modules sorted by priority.
    pub fn alive(&self) -> Vec<ModuleKey> {
        self.keys()
            .into_iter()
            .filter(|k| self.modules[k].alive())
            .collect()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// Context over an unprivileged facade and in-memory settings.
    pub(crate) fn test_context() -> ModuleContext {
        let config = ebox_access::AccessConfig {
            shell: vec!["/nonexistent/ebox-su".to_string()],
            ..ebox_access::AccessConfig::default()
        };
        ModuleContext {
            access: Arc::new(SystemAccess::new(&config, None)),
            settings: Arc::new(SettingsStore::in_memory()),
            alerts: AlertSink::new(),
            config: Arc::new(Config::default()),
        }
    }

    /// Editable in-memory file source.
    #[derive(Default)]
    pub(crate) struct MapFiles(parking_lot::Mutex<std::collections::HashMap<String, String>>);

    impl MapFiles {
        pub(crate) fn insert(&self, path: &str, content: &str) {
            self.0.lock().insert(path.to_string(), content.to_string());
        }

        pub(crate) fn remove(&self, path: &str) {
            self.0.lock().remove(path);
        }

        pub(crate) fn clear(&self) {
            self.0.lock().clear();
        }
    }

    #[async_trait]
    impl ebox_access::FileSource for MapFiles {
        async fn read(&self, path: &std::path::Path) -> Option<String> {
            self.0.lock().get(path.to_string_lossy().as_ref()).cloned()
        }
    }

    /// Context whose unprivileged reads come from `files`, uncached.
    pub(crate) fn context_with_files(files: Arc<MapFiles>) -> ModuleContext {
        let config = ebox_access::AccessConfig {
            shell: vec!["/nonexistent/ebox-su".to_string()],
            cache_ttl: std::time::Duration::ZERO,
            ..ebox_access::AccessConfig::default()
        };
        ModuleContext {
            access: Arc::new(SystemAccess::with_file_source(&config, files, None)),
            ..test_context()
        }
    }

    #[test]
    fn test_key_round_trip() {
        for key in ModuleKey::ALL {
            assert_eq!(key.as_str().parse::<ModuleKey>(), Ok(key));
        }
        assert!("fap_counter".parse::<ModuleKey>().is_err());
    }

    #[test]
    fn test_interval_reads_settings() {
        let settings = SettingsStore::in_memory();
        assert_eq!(ModuleKey::Network.interval_ms(&settings), 3000);
        settings.set_i64("net_interval", 2000);
        assert_eq!(ModuleKey::Network.interval_ms(&settings), 2000);
        settings.set_i64("net_interval", 10);
        assert_eq!(ModuleKey::Network.interval_ms(&settings), 1000);
    }

    #[test]
    fn test_builtin_registry_order() {
        let registry = ModuleRegistry::builtin();
        assert_eq!(registry.keys().len(), 9);
        assert_eq!(registry.keys(), ModuleKey::ALL.to_vec());
        assert!(registry.alive().is_empty());
        assert_eq!(
            registry.get(ModuleKey::Storage).map(|m| m.default_enabled()),
            Some(false)
        );
    }
}
