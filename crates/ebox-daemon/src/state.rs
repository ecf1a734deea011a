//! Application state shared by the publication surfaces.

use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::{broadcast, watch, Notify};
use tracing::{debug, info};

use ebox_access::SystemAccess;

use crate::alert::{AlertEvent, AlertSink};
use crate::modules::ModuleKey;
use crate::settings::{SettingValue, SettingsStore};
use crate::snapshot::{ModuleSnapshot, SnapshotStore};

/// Comma-separated module keys in the order consumers should show them.
const CARD_ORDER_KEY: &str = "dash_card_order";

/// Errors surfaced to D-Bus and HTTP callers.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("Unknown module: {0}")]
    UnknownModule(String),
}

/// Module listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleInfo {
    pub key: &'static str,
    pub name: &'static str,
    pub priority: i32,
    pub enabled: bool,
    /// Whether readouts have been published since the module started
    pub active: bool,
}

/// Privilege level as shown to consumers.
#[derive(Debug, Clone, Serialize)]
pub struct AccessInfo {
    pub tier: String,
    pub enhanced: bool,
}

/// Read-mostly view over the engine's published state.
pub struct AppState {
    snapshot: Arc<SnapshotStore>,
    settings: Arc<SettingsStore>,
    access: Arc<SystemAccess>,
    alerts: AlertSink,
    waker: Arc<Notify>,
}

impl AppState {
    pub fn new(
        snapshot: Arc<SnapshotStore>,
        settings: Arc<SettingsStore>,
        access: Arc<SystemAccess>,
        alerts: AlertSink,
        waker: Arc<Notify>,
    ) -> Self {
        Self {
            snapshot,
            settings,
            access,
            alerts,
            waker,
        }
    }

    fn parse_key(key: &str) -> Result<ModuleKey, StateError> {
        key.parse()
            .map_err(|_| StateError::UnknownModule(key.to_string()))
    }

    /// Published snapshots in display order.
    pub fn snapshot(&self) -> Vec<ModuleSnapshot> {
        self.snapshot.ordered(&self.settings.get_list(CARD_ORDER_KEY))
    }

    /// Latest snapshot of one module; `None` while it has not published.
    pub fn module(&self, key: &str) -> Result<Option<ModuleSnapshot>, StateError> {
        Ok(self.snapshot.get(Self::parse_key(key)?))
    }

    pub fn modules(&self) -> Vec<ModuleInfo> {
        ModuleKey::ALL
            .into_iter()
            .map(|key| ModuleInfo {
                key: key.as_str(),
                name: key.name(),
                priority: key.priority(),
                enabled: self
                    .settings
                    .is_module_enabled(key.as_str(), key.default_enabled()),
                active: self.snapshot.get(key).is_some(),
            })
            .collect()
    }

    /// Persists the enabled flag and wakes the engine to reconcile.
    pub fn set_module_enabled(&self, key: &str, enabled: bool) -> Result<(), StateError> {
        let key = Self::parse_key(key)?;
        self.settings.set_module_enabled(key.as_str(), enabled);
        self.waker.notify_one();
        info!("Module {} {}", key, if enabled { "enabled" } else { "disabled" });
        Ok(())
    }

    pub fn settings(&self) -> BTreeMap<String, SettingValue> {
        self.settings.all()
    }

    /// Stores a runtime setting and wakes the engine so new intervals and
    /// flags apply on the next cycle.
    pub fn set_setting(&self, key: &str, value: SettingValue) {
        debug!("Setting {} = {:?}", key, value);
        self.settings.set(key, value);
        self.waker.notify_one();
    }

    pub async fn access_info(&self) -> AccessInfo {
        AccessInfo {
            tier: self.access.tier_label().await,
            enhanced: self.access.is_enhanced().await,
        }
    }

    /// Re-probes privileged access and returns the new tier label.
    pub async fn reprobe(&self) -> String {
        let label = self.access.reprobe().await.label();
        self.waker.notify_one();
        label
    }

    /// Counter bumped on every publish.
    pub fn snapshot_version(&self) -> u64 {
        self.snapshot.version()
    }

    pub fn subscribe_snapshot(&self) -> watch::Receiver<u64> {
        self.snapshot.subscribe()
    }

    pub fn subscribe_alerts(&self) -> broadcast::Receiver<AlertEvent> {
        self.alerts.subscribe()
    }
}
