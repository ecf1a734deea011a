//! Uptime module.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Local, TimeZone};

use super::{Module, ModuleContext, ModuleKey};
use crate::format;
use crate::rollover::REBOOT_COUNT_KEY;
use crate::snapshot::{Readouts, UNAVAILABLE};

pub(crate) const PROC_UPTIME: &str = "/proc/uptime";

/// Milliseconds since boot from the first field of `/proc/uptime`.
pub(crate) fn parse_uptime_ms(content: &str) -> Option<u64> {
    let secs: f64 = content.split_whitespace().next()?.parse().ok()?;
    (secs >= 0.0).then(|| (secs * 1000.0).round() as u64)
}

/// Wall-clock boot time in epoch milliseconds.
pub(crate) fn boot_epoch_ms(now: DateTime<Local>, uptime_ms: u64) -> i64 {
    now.timestamp_millis() - uptime_ms as i64
}

/// Reports time since boot, boot time and the number of boots seen.
pub struct UptimeModule {
    ctx: Option<ModuleContext>,
    uptime_ms: Option<u64>,
    boot_ms: Option<i64>,
    running: bool,
}

impl Default for UptimeModule {
    fn default() -> Self {
        Self::new()
    }
}

impl UptimeModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            uptime_ms: None,
            boot_ms: None,
            running: false,
        }
    }

    fn reboots(&self) -> i64 {
        self.ctx
            .as_ref()
            .map(|ctx| ctx.settings.get_i64(REBOOT_COUNT_KEY, 0))
            .unwrap_or(0)
    }

    fn boot_time(&self) -> String {
        self.boot_ms
            .and_then(|ms| Local.timestamp_millis_opt(ms).single())
            .map(|t| t.format("%b %d, %H:%M").to_string())
            .unwrap_or_else(|| UNAVAILABLE.to_string())
    }

    fn duration(&self) -> String {
        format::or_unavailable(self.uptime_ms, format::duration)
    }
}

#[async_trait]
impl Module for UptimeModule {
    fn key(&self) -> ModuleKey {
        ModuleKey::Uptime
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
        self.ctx = Some(ctx);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    async fn tick(&mut self) {
        let Some(ctx) = &self.ctx else {
            return;
        };
        self.uptime_ms = ctx
            .access
            .read_path(PROC_UPTIME)
            .await
            .as_deref()
            .and_then(parse_uptime_ms);
        self.boot_ms = self.uptime_ms.map(|ms| boot_epoch_ms(Local::now(), ms));
    }

    fn compact(&self) -> String {
        self.duration()
    }

    fn detail(&self) -> String {
        format!(
            "Uptime: {}\nLast boot: {}\nReboots tracked: {}",
            self.duration(),
            self.boot_time(),
            self.reboots()
        )
    }

    fn data_points(&self) -> Readouts {
        let mut d = Readouts::new();
        d.insert("uptime.duration", self.duration());
        d.insert("uptime.boot_time", self.boot_time());
        d.insert("uptime.reboots", self.reboots().to_string());
        d
    }

    fn alive(&self) -> bool {
        self.running
    }
}
