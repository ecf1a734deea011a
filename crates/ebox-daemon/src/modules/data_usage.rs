//! Daily and monthly data usage module.
//!
//! Counters are accumulated in the settings store; the rollover coordinator
//! owns their reset.

use anyhow::Result;
use async_trait::async_trait;

use super::network::{has_prefix, parse_net_dev, NET_DEV};
use super::{Module, ModuleContext, ModuleKey};
use crate::alert::{AlertRule, Direction};
use crate::format;
use crate::snapshot::Readouts;

const PLAN_LIMIT_KEY: &str = "dat_plan_limit";

/// Re-armed by the month rollover only.
const PLAN_ALERT: AlertRule = AlertRule {
    id: "plan",
    enabled_key: "dat_plan_alert",
    default_enabled: true,
    threshold_key: "dat_plan_alert_pct",
    default_threshold: 90,
    fired_key: "dat_plan_alert_fired",
    direction: Direction::Above,
    hysteresis: None,
};

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Usage {
    daily_total: i64,
    daily_wifi: i64,
    daily_mobile: i64,
    month_total: i64,
    yesterday_total: i64,
}

/// Tracks bytes transferred per day and month, split by Wi-Fi and mobile.
pub struct DataUsageModule {
    ctx: Option<ModuleContext>,
    prev: Option<(u64, u64)>,
    usage: Usage,
    running: bool,
}

impl Default for DataUsageModule {
    fn default() -> Self {
        Self::new()
    }
}

impl DataUsageModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            prev: None,
            usage: Usage::default(),
            running: false,
        }
    }

    /// Total and mobile byte counters (rx + tx) across interfaces.
    async fn read_counters(ctx: &ModuleContext) -> Option<(u64, u64)> {
        let content = ctx.access.read_path(NET_DEV).await?;
        let mobile_prefixes = &ctx.config.network.mobile_prefixes;
        let counters = parse_net_dev(&content);
        if counters.is_empty() {
            return None;
        }
        Some(counters.iter().fold((0, 0), |(total, mobile), c| {
            let bytes = c.rx + c.tx;
            if has_prefix(&c.name, mobile_prefixes) {
                (total + bytes, mobile + bytes)
            } else {
                (total + bytes, mobile)
            }
        }))
    }

    fn load_usage(ctx: &ModuleContext) -> Usage {
        let s = &ctx.settings;
        Usage {
            daily_total: s.get_i64("dat_daily_total", 0),
            daily_wifi: s.get_i64("dat_daily_wifi", 0),
            daily_mobile: s.get_i64("dat_daily_mobile", 0),
            month_total: s.get_i64("dat_month_total", 0),
            yesterday_total: s.get_i64("dat_yesterday_total", 0),
        }
    }

    /// Adds the delta since the previous sample to the accumulators.
    fn accumulate(ctx: &ModuleContext, prev: (u64, u64), current: (u64, u64)) {
        let (prev_total, prev_mobile) = prev;
        let (total, mobile) = current;
        if total < prev_total {
            return;
        }
        let dt = (total - prev_total) as i64;
        let dm = (mobile.saturating_sub(prev_mobile) as i64).min(dt);
        let dw = dt - dm;
        if dt == 0 {
            return;
        }
        ctx.settings.batch(|b| {
            b.add_i64("dat_daily_total", dt);
            b.add_i64("dat_daily_wifi", dw);
            b.add_i64("dat_daily_mobile", dm);
            b.add_i64("dat_month_total", dt);
            b.add_i64("dat_month_wifi", dw);
            b.add_i64("dat_month_mobile", dm);
        });
    }

    fn plan_bytes(&self) -> Option<i64> {
        let ctx = self.ctx.as_ref()?;
        let mb = ctx.settings.get_i64(PLAN_LIMIT_KEY, 0);
        (mb > 0).then(|| mb * 1024 * 1024)
    }

    fn plan_pct(&self) -> Option<f64> {
        Some(self.usage.month_total as f64 * 100.0 / self.plan_bytes()? as f64)
    }
}

#[async_trait]
impl Module for DataUsageModule {
    fn key(&self) -> ModuleKey {
        ModuleKey::Data
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
        self.prev = Self::read_counters(&ctx).await;
        self.usage = Self::load_usage(&ctx);
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
        if let Some(current) = Self::read_counters(ctx).await {
            if let Some(prev) = self.prev {
                Self::accumulate(ctx, prev, current);
            }
            self.prev = Some(current);
        }
        // Reloaded every tick so resets by the rollover coordinator show up.
        self.usage = Self::load_usage(ctx);
    }

    fn check_alerts(&mut self) {
        let (Some(ctx), Some(pct), Some(plan)) = (&self.ctx, self.plan_pct(), self.plan_bytes())
        else {
            return;
        };
        if PLAN_ALERT.evaluate(&ctx.settings, pct, false) {
            ctx.alerts.raise(
                self.key().as_str(),
                PLAN_ALERT.id,
                "Data Plan Warning".to_string(),
                format!("Used {:.0}% of {} plan", pct, format::bytes(plan)),
            );
        }
    }

    fn compact(&self) -> String {
        format!("Today:{}", format::bytes(self.usage.daily_total))
    }

    fn detail(&self) -> String {
        let u = &self.usage;
        let mut detail = format!(
            "Today: {} (W:{} M:{})\nMonth: {}",
            format::bytes(u.daily_total),
            format::bytes(u.daily_wifi),
            format::bytes(u.daily_mobile),
            format::bytes(u.month_total)
        );
        if let (Some(plan), Some(pct)) = (self.plan_bytes(), self.plan_pct()) {
            detail.push_str(&format!(" / {} ({:.1}%)", format::bytes(plan), pct));
        }
        detail
    }

    fn data_points(&self) -> Readouts {
        let u = &self.usage;
        let mut d = Readouts::new();
        d.insert("data.today_total", format::bytes(u.daily_total));
        d.insert("data.today_wifi", format::bytes(u.daily_wifi));
        d.insert("data.today_mobile", format::bytes(u.daily_mobile));
        d.insert("data.month_total", format::bytes(u.month_total));
        d.insert("data.yesterday_total", format::bytes(u.yesterday_total));
        d.insert("data.plan_used", format::pct(self.plan_pct()));
        d
    }

    fn alive(&self) -> bool {
        self.running
    }
}
