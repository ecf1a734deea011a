//! Threshold alerts with hysteresis.
//!
//! An alert fires once when its value crosses the threshold and re-arms only
//! after the value recovers past the hysteresis band. The fired flag lives in
//! the settings store so restarts do not re-fire.

use serde::Serialize;
use tokio::sync::broadcast;
use tracing::warn;

use crate::settings::SettingsStore;

/// Which side of the threshold triggers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Fires at or above the threshold.
    Above,
    /// Fires at or below the threshold.
    Below,
}

/// Fire-once latch for a single threshold.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlertLatch {
    pub direction: Direction,
    pub threshold: f64,
    /// Recovery band; `None` latches until reset externally
    pub hysteresis: Option<f64>,
}

impl AlertLatch {
    /// Advances the latch. Returns `(fire_now, fired_after)`.
    ///
    /// `suppressed` blocks firing but not recovery.
    pub fn step(&self, fired: bool, value: f64, suppressed: bool) -> (bool, bool) {
        if fired {
            let recovered = match (self.direction, self.hysteresis) {
                (_, None) => false,
                (Direction::Above, Some(h)) => value < self.threshold - h,
                (Direction::Below, Some(h)) => value > self.threshold + h,
            };
            return (false, !recovered);
        }
        let crossed = match self.direction {
            Direction::Above => value >= self.threshold,
            Direction::Below => value <= self.threshold,
        };
        let fire = crossed && !suppressed;
        (fire, fire)
    }
}

/// A user-configurable alert backed by settings keys.
#[derive(Debug, Clone, Copy)]
pub struct AlertRule {
    pub id: &'static str,
    pub enabled_key: &'static str,
    pub default_enabled: bool,
    pub threshold_key: &'static str,
    pub default_threshold: i64,
    pub fired_key: &'static str,
    pub direction: Direction,
    pub hysteresis: Option<f64>,
}

impl AlertRule {
    /// Current threshold from settings.
    pub fn threshold(&self, settings: &SettingsStore) -> i64 {
        settings.get_i64(self.threshold_key, self.default_threshold)
    }

    /// Evaluates the rule and persists the fired flag. Returns true when the
    /// alert should be raised now.
    pub fn evaluate(&self, settings: &SettingsStore, value: f64, suppressed: bool) -> bool {
        let fired = settings.get_bool(self.fired_key, false);
        let enabled = settings.get_bool(self.enabled_key, self.default_enabled);
        let latch = AlertLatch {
            direction: self.direction,
            threshold: self.threshold(settings) as f64,
            hysteresis: self.hysteresis,
        };
        let (fire, fired_after) = latch.step(fired, value, suppressed || !enabled);
        if fired_after != fired {
            settings.set_bool(self.fired_key, fired_after);
        }
        fire
    }
}

/// An alert raised by a module.
#[derive(Debug, Clone, Serialize)]
pub struct AlertEvent {
    pub module: String,
    pub id: String,
    pub title: String,
    pub body: String,
}

/// Fan-out for raised alerts. Logs every alert even without subscribers.
#[derive(Clone)]
pub struct AlertSink {
    tx: broadcast::Sender<AlertEvent>,
}

impl Default for AlertSink {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertSink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(32);
        Self { tx }
    }

    pub fn raise(&self, module: &str, id: &str, title: String, body: String) {
        warn!("Alert [{}/{}]: {} - {}", module, id, title, body);
        let _ = self.tx.send(AlertEvent {
            module: module.to_string(),
            id: id.to_string(),
            title,
            body,
        });
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.tx.subscribe()
    }
}
