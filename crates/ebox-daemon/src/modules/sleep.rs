//! Deep sleep module.
//!
//! Compares the boot clock, which keeps counting while suspended, with the
//! monotonic clock, which does not, since the module started.

use anyhow::Result;
use async_trait::async_trait;

use super::{Module, ModuleContext, ModuleKey};
use crate::engine::{awake_time_ms, boot_time_ms};
use crate::format;
use crate::snapshot::Readouts;

/// `(boot, awake)` clock readings in milliseconds.
type ClockSample = (u64, u64);

fn read_clocks() -> ClockSample {
    (boot_time_ms(), awake_time_ms())
}

/// Time elapsed and time spent awake between two samples.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SleepSplit {
    elapsed_ms: u64,
    awake_ms: u64,
}

impl SleepSplit {
    fn between(start: ClockSample, now: ClockSample) -> Self {
        let elapsed_ms = now.0.saturating_sub(start.0);
        Self {
            elapsed_ms,
            awake_ms: now.1.saturating_sub(start.1).min(elapsed_ms),
        }
    }

    fn deep_ms(&self) -> u64 {
        self.elapsed_ms - self.awake_ms
    }

    fn deep_pct(&self) -> f64 {
        if self.elapsed_ms == 0 {
            return 0.0;
        }
        self.deep_ms() as f64 * 100.0 / self.elapsed_ms as f64
    }
}

/// Reports how much of the time since start the device spent suspended.
pub struct SleepModule {
    ctx: Option<ModuleContext>,
    start: Option<ClockSample>,
    split: SleepSplit,
    running: bool,
}

impl Default for SleepModule {
    fn default() -> Self {
        Self::new()
    }
}

impl SleepModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            start: None,
            split: SleepSplit::default(),
            running: false,
        }
    }

    fn sample(&mut self, now: ClockSample) {
        if let Some(start) = self.start {
            self.split = SleepSplit::between(start, now);
        }
    }
}

#[async_trait]
impl Module for SleepModule {
    fn key(&self) -> ModuleKey {
        ModuleKey::Sleep
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
        self.start = Some(read_clocks());
        self.split = SleepSplit::default();
        self.ctx = Some(ctx);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    async fn tick(&mut self) {
        self.sample(read_clocks());
    }

    fn compact(&self) -> String {
        format!("Sleep:{}%", self.split.deep_pct() as u64)
    }

    fn detail(&self) -> String {
        let pct = self.split.deep_pct();
        format!(
            "Deep Sleep: {} ({})\nAwake: {} ({})",
            format::duration(self.split.deep_ms()),
            format::pct(Some(pct)),
            format::duration(self.split.awake_ms),
            format::pct(Some(100.0 - pct))
        )
    }

    fn data_points(&self) -> Readouts {
        let pct = self.split.deep_pct();
        let mut d = Readouts::new();
        d.insert("sleep.deep_time", format::duration(self.split.deep_ms()));
        d.insert("sleep.deep_pct", format::pct(Some(pct)));
        d.insert("sleep.awake_time", format::duration(self.split.awake_ms));
        d.insert("sleep.awake_pct", format::pct(Some(100.0 - pct)));
        d
    }

    fn alive(&self) -> bool {
        self.running
    }
}
