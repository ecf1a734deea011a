//! Battery module.

use anyhow::Result;
use async_trait::async_trait;
use std::fs;
use tracing::{debug, info};

use super::{Module, ModuleContext, ModuleKey};
use crate::alert::{AlertRule, Direction};
use crate::format;
use crate::rollover::{self, RESET_ON_FULL_CHARGE_KEY};
use crate::snapshot::{Readouts, UNAVAILABLE};

const POWER_SUPPLY_ROOT: &str = "/sys/class/power_supply";
const FALLBACK_SUPPLY: &str = "/sys/class/power_supply/battery";
const DEFAULT_DESIGN_CAP_MAH: i64 = 4000;

/// Below this current the time-left estimate is meaningless.
const MIN_ESTIMATE_MA: i64 = 5;

const LOW_ALERT: AlertRule = AlertRule {
    id: "low",
    enabled_key: "bat_low_alert",
    default_enabled: true,
    threshold_key: "bat_low_thresh",
    default_threshold: 15,
    fired_key: "bat_low_fired",
    direction: Direction::Below,
    hysteresis: Some(5.0),
};

const TEMP_ALERT: AlertRule = AlertRule {
    id: "temp",
    enabled_key: "bat_temp_alert",
    default_enabled: true,
    threshold_key: "bat_temp_thresh",
    default_threshold: 42,
    fired_key: "bat_temp_fired",
    direction: Direction::Above,
    hysteresis: Some(3.0),
};

#[derive(Debug, Default, Clone)]
struct BatteryState {
    level: Option<i64>,
    temp_c: Option<f64>,
    voltage_mv: Option<i64>,
    current_ma: Option<i64>,
    status: Option<String>,
    health: Option<String>,
    design_cap: Option<i64>,
    actual_cap: Option<i64>,
    cycle_count: Option<i64>,
    real_health_pct: Option<i64>,
    technology: Option<String>,
}

impl BatteryState {
    fn is_charging(&self) -> bool {
        self.status.as_deref() == Some("Charging")
    }

    fn is_full(&self) -> bool {
        self.status.as_deref() == Some("Full")
    }

    fn abs_current(&self) -> Option<i64> {
        self.current_ma.map(i64::abs)
    }

    fn power_w(&self) -> Option<f64> {
        Some(self.abs_current()? as f64 * self.voltage_mv? as f64 / 1_000_000.0)
    }

    fn time_left(&self) -> String {
        let (Some(ma), Some(level)) = (self.abs_current(), self.level) else {
            return UNAVAILABLE.to_string();
        };
        if ma < MIN_ESTIMATE_MA {
            return UNAVAILABLE.to_string();
        }
        let cap = self
            .actual_cap
            .or(self.design_cap)
            .unwrap_or(DEFAULT_DESIGN_CAP_MAH) as f64;
        if self.is_charging() {
            let needed = (100 - level) as f64 / 100.0 * cap;
            format!("Full in {}", format::hours(needed / ma as f64))
        } else {
            let remaining = level as f64 / 100.0 * cap;
            format!("{} left", format::hours(remaining / ma as f64))
        }
    }

    fn charge_type(&self) -> &'static str {
        match self.abs_current().unwrap_or(0) {
            ma if ma > 3000 => "Rapid",
            ma if ma > 1500 => "Fast",
            ma if ma > 500 => "Normal",
            _ => "Slow",
        }
    }
}

/// Reports charge level, current, power, temperature and health.
pub struct BatteryModule {
    ctx: Option<ModuleContext>,
    supply: String,
    state: BatteryState,
    was_full: bool,
    running: bool,
}

impl Default for BatteryModule {
    fn default() -> Self {
        Self::new()
    }
}

impl BatteryModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            supply: FALLBACK_SUPPLY.to_string(),
            state: BatteryState::default(),
            was_full: false,
            running: false,
        }
    }

    /// Finds the first power supply whose type is "Battery".
    fn detect_supply() -> String {
        if let Ok(entries) = fs::read_dir(POWER_SUPPLY_ROOT) {
            let mut candidates: Vec<_> = entries.flatten().map(|e| e.path()).collect();
            candidates.sort();
            for path in candidates {
                let kind = fs::read_to_string(path.join("type")).unwrap_or_default();
                if kind.trim() == "Battery" {
                    return path.to_string_lossy().to_string();
                }
            }
        }
        FALLBACK_SUPPLY.to_string()
    }

    async fn refresh(&mut self) {
        let Some(ctx) = &self.ctx else {
            return;
        };
        let access = &ctx.access;
        let supply = self.supply.as_str();
        let path = |name: &str| format!("{}/{}", supply, name);

        let state = BatteryState {
            level: access.read_i64(&path("capacity")).await,
            temp_c: access
                .read_i64(&path("temp"))
                .await
                .map(|tenths| tenths as f64 / 10.0),
            voltage_mv: access.read_battery_voltage_mv(supply).await,
            current_ma: access.read_battery_current_ma(supply).await,
            status: access.read_path(&path("status")).await,
            health: access.read_path(&path("health")).await,
            design_cap: access.read_design_capacity(supply).await,
            actual_cap: access.read_actual_capacity(supply).await,
            cycle_count: access.read_cycle_count(supply).await,
            real_health_pct: access.read_real_health_pct(supply).await,
            technology: access.read_battery_technology(supply).await,
        };

        let full = state.is_full();
        if full && !self.was_full && ctx.settings.get_bool(RESET_ON_FULL_CHARGE_KEY, false) {
            rollover::reset_daily(&ctx.settings);
            info!("Battery full: daily counters reset");
        }
        self.was_full = full;
        self.state = state;
    }
}

#[async_trait]
impl Module for BatteryModule {
    fn key(&self) -> ModuleKey {
        ModuleKey::Battery
    }

    fn tick_interval_ms(&self) -> u64 {
        match &self.ctx {
            Some(ctx) => self.key().interval_ms(&ctx.settings),
            None => self.key().interval_setting().1 as u64,
        }
    }

    async fn start(&mut self, ctx: ModuleContext) -> Result<()> {
        if self.running {
            return Ok(());
        }
        let configured = &ctx.config.battery.power_supply;
        self.supply = if configured == "auto" {
            Self::detect_supply()
        } else {
            configured.clone()
        };
        debug!("Battery module using {}", self.supply);
        self.ctx = Some(ctx);
        // A battery already full at start is not a transition.
        self.was_full = true;
        self.refresh().await;
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    async fn tick(&mut self) {
        self.refresh().await;
    }

    fn check_alerts(&mut self) {
        let Some(ctx) = &self.ctx else {
            return;
        };
        let state = &self.state;

        if let Some(level) = state.level {
            if LOW_ALERT.evaluate(&ctx.settings, level as f64, state.is_charging()) {
                ctx.alerts.raise(
                    self.key().as_str(),
                    LOW_ALERT.id,
                    "Battery Low".to_string(),
                    format!("Battery at {}%", level),
                );
            }
        }

        if let Some(temp) = state.temp_c {
            if TEMP_ALERT.evaluate(&ctx.settings, temp, false) {
                ctx.alerts.raise(
                    self.key().as_str(),
                    TEMP_ALERT.id,
                    "High Temperature".to_string(),
                    format!("Battery at {}", format::temp(Some(temp))),
                );
            }
        }
    }

    fn compact(&self) -> String {
        format!(
            "{} {}",
            format::or_unavailable(self.state.level, |l| format!("{}%", l)),
            self.state.time_left()
        )
    }

    fn detail(&self) -> String {
        let s = &self.state;
        let mut lines = vec![format!(
            "{} • {} ({}) • {}",
            format::or_unavailable(s.level, |l| format!("{}%", l)),
            format::or_unavailable(s.abs_current(), |ma| format!("{}mA", ma)),
            format::or_unavailable(s.power_w(), |w| format!("{:.1}W", w)),
            format::temp(s.temp_c),
        )];
        match (s.real_health_pct, s.cycle_count) {
            (Some(health), Some(cycles)) => lines.push(format!(
                "Health: {}% ({}/{} mAh) • {} cycles",
                health,
                format::or_unavailable(s.actual_cap, |c| c.to_string()),
                format::or_unavailable(s.design_cap, |c| c.to_string()),
                cycles
            )),
            _ => lines.push(format!(
                "Health: {} • {} • {}",
                s.health.as_deref().unwrap_or(UNAVAILABLE),
                format::or_unavailable(s.voltage_mv, |mv| format!("{:.2}V", mv as f64 / 1000.0)),
                s.status.as_deref().unwrap_or(UNAVAILABLE),
            )),
        }
        let mut last = s.time_left();
        if s.is_charging() {
            last.push_str(" • ");
            last.push_str(s.charge_type());
        }
        lines.push(last);
        lines.join("\n")
    }

    fn data_points(&self) -> Readouts {
        let s = &self.state;
        let mut d = Readouts::new();
        d.insert(
            "battery.level",
            format::or_unavailable(s.level, |l| format!("{}%", l)),
        );
        d.insert(
            "battery.current",
            format::or_unavailable(s.abs_current(), |ma| format!("{} mA", ma)),
        );
        d.insert(
            "battery.power",
            format::or_unavailable(s.power_w(), |w| format!("{:.1} W", w)),
        );
        d.insert("battery.temp", format::temp(s.temp_c));
        d.insert(
            "battery.voltage",
            format::or_unavailable(s.voltage_mv, |mv| format!("{:.2}V", mv as f64 / 1000.0)),
        );
        d.insert(
            "battery.health",
            s.health.clone().unwrap_or_else(|| UNAVAILABLE.to_string()),
        );
        d.insert(
            "battery.status",
            s.status.clone().unwrap_or_else(|| UNAVAILABLE.to_string()),
        );
        d.insert("battery.time_left", s.time_left());
        d.insert(
            "battery.charge_type",
            if s.is_charging() {
                s.charge_type()
            } else {
                UNAVAILABLE
            },
        );
        d.insert(
            "battery.design_cap",
            format::or_unavailable(s.design_cap, |c| format!("{} mAh", c)),
        );
        d.insert(
            "battery.technology",
            s.technology.clone().unwrap_or_else(|| UNAVAILABLE.to_string()),
        );
        d.insert(
            "battery.cycle_count",
            format::or_unavailable(s.cycle_count, |c| c.to_string()),
        );
        d.insert(
            "battery.real_health_pct",
            format::or_unavailable(s.real_health_pct, |p| format!("{}%", p)),
        );
        d.insert(
            "battery.actual_cap",
            format::or_unavailable(s.actual_cap, |c| format!("{} mAh", c)),
        );
        d
    }

    fn alive(&self) -> bool {
        self.running
    }
}
