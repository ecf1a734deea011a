//! Persistent key-value settings.
//!
//! Holds user toggles, thresholds, accumulators and alert flags. Every
//! mutation that changes a value is written through to `settings.toml` in the
//! state directory. Writes go to a temporary file that replaces the old one.

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::warn;

const SETTINGS_FILE: &str = "settings.toml";
const CORRUPT_SUFFIX: &str = "bad";

/// A stored setting value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Int(i64),
    Text(String),
}

impl SettingValue {
    /// Interprets untyped text: booleans, then integers, else text.
    pub fn parse(s: &str) -> Self {
        match s.trim() {
            "true" => SettingValue::Bool(true),
            "false" => SettingValue::Bool(false),
            t => t
                .parse()
                .map(SettingValue::Int)
                .unwrap_or_else(|_| SettingValue::Text(s.to_string())),
        }
    }
}

/// Synchronous settings store with write-through persistence.
pub struct SettingsStore {
    path: Option<PathBuf>,
    values: RwLock<BTreeMap<String, SettingValue>>,
}

/// Batched mutation handle; the store is saved once when the batch ends,
/// and only if some value changed.
pub struct SettingsBatch<'a> {
    values: &'a mut BTreeMap<String, SettingValue>,
    dirty: bool,
}

impl SettingsBatch<'_> {
    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.values.get(key) {
            Some(SettingValue::Int(v)) => *v,
            _ => default,
        }
    }

    pub fn set_i64(&mut self, key: &str, value: i64) {
        self.put(key, SettingValue::Int(value));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.put(key, SettingValue::Bool(value));
    }

    fn put(&mut self, key: &str, value: SettingValue) {
        if self.values.get(key) != Some(&value) {
            self.values.insert(key.to_string(), value);
            self.dirty = true;
        }
    }

    /// Adds `delta` to an integer setting and returns the new value.
    pub fn add_i64(&mut self, key: &str, delta: i64) -> i64 {
        let value = self.get_i64(key, 0).saturating_add(delta);
        self.set_i64(key, value);
        value
    }
}

impl SettingsStore {
    /// Loads settings from `<state_dir>/settings.toml`.
    ///
    /// A missing file yields an empty store. A file that does not parse is
    /// moved aside to `settings.toml.bad` before starting empty.
    pub fn load(state_dir: &Path) -> Self {
        if let Err(e) = std::fs::create_dir_all(state_dir) {
            warn!("Failed to create state directory {:?}: {}", state_dir, e);
        }
        let path = state_dir.join(SETTINGS_FILE);
        let values = match std::fs::read_to_string(&path) {
            Ok(content) => toml::from_str(&content).unwrap_or_else(|e| {
                let backup = path.with_extension(format!("toml.{}", CORRUPT_SUFFIX));
                warn!(
                    "Unreadable settings file {:?} ({}), moving it to {:?}",
                    path, e, backup
                );
                if let Err(e) = std::fs::rename(&path, &backup) {
                    warn!("Failed to move settings file aside: {}", e);
                }
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: Some(path),
            values: RwLock::new(values),
        }
    }

    /// Creates a store that is never persisted.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            values: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn get_bool(&self, key: &str, default: bool) -> bool {
        match self.values.read().get(key) {
            Some(SettingValue::Bool(v)) => *v,
            _ => default,
        }
    }

    pub fn get_i64(&self, key: &str, default: i64) -> i64 {
        match self.values.read().get(key) {
            Some(SettingValue::Int(v)) => *v,
            _ => default,
        }
    }

    pub fn get_string(&self, key: &str, default: &str) -> String {
        match self.values.read().get(key) {
            Some(SettingValue::Text(v)) => v.clone(),
            _ => default.to_string(),
        }
    }

    pub fn set_bool(&self, key: &str, value: bool) {
        self.set(key, SettingValue::Bool(value));
    }

    pub fn set_i64(&self, key: &str, value: i64) {
        self.set(key, SettingValue::Int(value));
    }

    /// Stores `value`, skipping the save when nothing changed.
    pub fn set(&self, key: &str, value: SettingValue) {
        let mut values = self.values.write();
        if values.get(key) == Some(&value) {
            return;
        }
        values.insert(key.to_string(), value);
        self.save(&values);
    }

    /// Copy of every stored value.
    pub fn all(&self) -> BTreeMap<String, SettingValue> {
        self.values.read().clone()
    }

    /// Applies several mutations under one lock and at most one save.
    pub fn batch<R>(&self, f: impl FnOnce(&mut SettingsBatch<'_>) -> R) -> R {
        let mut values = self.values.write();
        let mut batch = SettingsBatch {
            values: &mut values,
            dirty: false,
        };
        let result = f(&mut batch);
        if batch.dirty {
            self.save(&values);
        }
        result
    }

    /// Whether the module with `key` is enabled.
    pub fn is_module_enabled(&self, key: &str, default: bool) -> bool {
        self.get_bool(&module_enabled_key(key), default)
    }

    pub fn set_module_enabled(&self, key: &str, enabled: bool) {
        self.set_bool(&module_enabled_key(key), enabled);
    }

    /// Comma-separated list setting split into trimmed entries.
    pub fn get_list(&self, key: &str) -> Vec<String> {
        self.get_string(key, "")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect()
    }

    fn save(&self, values: &BTreeMap<String, SettingValue>) {
        let Some(path) = &self.path else {
            return;
        };
        if let Err(e) = write_atomic(path, values) {
            warn!("Failed to save settings: {}", e);
        }
    }
}

/// Serializes `values` into a sibling temporary file and renames it over
/// `path`, so readers see either the old or the new file.
fn write_atomic(path: &Path, values: &BTreeMap<String, SettingValue>) -> anyhow::Result<()> {
    let content = toml::to_string_pretty(values)?;
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut file = tempfile::NamedTempFile::new_in(dir)?;
    file.write_all(content.as_bytes())?;
    file.as_file().sync_all()?;
    file.persist(path)?;
    Ok(())
}

fn module_enabled_key(key: &str) -> String {
    format!("m_{}_enabled", key)
}
