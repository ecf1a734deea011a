//! Shared readout snapshot.
//!
//! The engine publishes each module's readouts after it ticks; consumers
//! (D-Bus, web) read copies and subscribe to the version counter.

use parking_lot::RwLock;
use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use std::collections::HashMap;
use tokio::sync::watch;

use crate::modules::ModuleKey;

/// Placeholder shown for unavailable values.
pub const UNAVAILABLE: &str = "—";

/// Ordered name/value pairs, serialized as a JSON object.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Readouts(Vec<(String, String)>);

impl Readouts {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts or replaces a readout, keeping the first insertion position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();
        match self.0.iter_mut().find(|(n, _)| *n == name) {
            Some(entry) => entry.1 = value,
            None => self.0.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.0
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }
}

impl Serialize for Readouts {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.0.len()))?;
        for (name, value) in &self.0 {
            map.serialize_entry(name, value)?;
        }
        map.end()
    }
}

/// Everything a consumer needs to show one module.
#[derive(Debug, Clone, Serialize)]
pub struct ModuleSnapshot {
    pub key: String,
    pub name: String,
    pub priority: i32,
    pub compact: String,
    pub detail: String,
    pub readouts: Readouts,
    /// Engine clock of the last tick, in milliseconds since boot
    pub updated_ms: u64,
}

/// Latest snapshot of every running module.
pub struct SnapshotStore {
    modules: RwLock<HashMap<ModuleKey, ModuleSnapshot>>,
    version: watch::Sender<u64>,
}

impl Default for SnapshotStore {
    fn default() -> Self {
        Self::new()
    }
}

impl SnapshotStore {
    pub fn new() -> Self {
        let (version, _) = watch::channel(0);
        Self {
            modules: RwLock::new(HashMap::new()),
            version,
        }
    }

    /// Replaces a module's snapshot. Consumers are told on `notify`.
    pub fn publish(&self, key: ModuleKey, snapshot: ModuleSnapshot) {
        self.modules.write().insert(key, snapshot);
    }

    pub fn remove(&self, key: ModuleKey) -> bool {
        self.modules.write().remove(&key).is_some()
    }

    pub fn clear(&self) {
        self.modules.write().clear();
    }

    /// Bumps the version so subscribers refresh.
    pub fn notify(&self) {
        self.version.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn version(&self) -> u64 {
        *self.version.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.version.subscribe()
    }

    pub fn get(&self, key: ModuleKey) -> Option<ModuleSnapshot> {
        self.modules.read().get(&key).cloned()
    }

    /// All snapshots sorted by priority.
    pub fn all(&self) -> Vec<ModuleSnapshot> {
        let mut all: Vec<_> = self.modules.read().values().cloned().collect();
        all.sort_by(|a, b| a.priority.cmp(&b.priority).then(a.key.cmp(&b.key)));
        all
    }

    /// Snapshots in a user-chosen order; keys not listed follow by priority.
    pub fn ordered(&self, order: &[String]) -> Vec<ModuleSnapshot> {
        let mut all = self.all();
        all.sort_by_key(|s| {
            order
                .iter()
                .position(|k| *k == s.key)
                .unwrap_or(usize::MAX)
        });
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn snap(key: ModuleKey) -> ModuleSnapshot {
        let mut readouts = Readouts::new();
        readouts.insert("x", "1");
        ModuleSnapshot {
            key: key.as_str().to_string(),
            name: key.name().to_string(),
            priority: key.priority(),
            compact: String::new(),
            detail: String::new(),
            readouts,
            updated_ms: 0,
        }
    }

    #[test]
    fn test_readouts_keep_order() {
        let mut r = Readouts::new();
        r.insert("battery.level", "80%");
        r.insert("battery.temp", "31.0°C");
        r.insert("battery.level", "79%");
        let names: Vec<_> = r.iter().map(|(n, _)| n).collect();
        assert_eq!(names, vec!["battery.level", "battery.temp"]);
        assert_eq!(r.get("battery.level"), Some("79%"));
        assert_eq!(
            serde_json::to_string(&r).unwrap(),
            r#"{"battery.level":"79%","battery.temp":"31.0°C"}"#
        );
    }

    #[test]
    fn test_priority_and_custom_order() {
        let store = SnapshotStore::new();
        store.publish(ModuleKey::Uptime, snap(ModuleKey::Uptime));
        store.publish(ModuleKey::Battery, snap(ModuleKey::Battery));
        store.publish(ModuleKey::Network, snap(ModuleKey::Network));

        let keys: Vec<_> = store.all().into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["battery", "network", "uptime"]);

        let order = vec!["uptime".to_string(), "network".to_string()];
        let keys: Vec<_> = store.ordered(&order).into_iter().map(|s| s.key).collect();
        assert_eq!(keys, vec!["uptime", "network", "battery"]);
    }

    #[test]
    fn test_notify_bumps_version() {
        let store = SnapshotStore::new();
        let rx = store.subscribe();
        store.publish(ModuleKey::Battery, snap(ModuleKey::Battery));
        assert_eq!(store.version(), 0);
        store.notify();
        assert_eq!(*rx.borrow(), 1);
        assert!(store.remove(ModuleKey::Battery));
        assert!(store.get(ModuleKey::Battery).is_none());
    }
}
