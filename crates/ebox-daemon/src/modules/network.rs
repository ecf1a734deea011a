//! Network throughput module.

use anyhow::Result;
use async_trait::async_trait;
use tokio::time::Instant;

use super::{Module, ModuleContext, ModuleKey};
use crate::format;
use crate::snapshot::Readouts;

pub(crate) const NET_DEV: &str = "/proc/net/dev";
pub(crate) const NET_ROUTE: &str = "/proc/net/route";

/// Byte counters of one interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct InterfaceCounters {
    pub name: String,
    pub rx: u64,
    pub tx: u64,
}

/// Parses `/proc/net/dev`, skipping the loopback interface.
pub(crate) fn parse_net_dev(content: &str) -> Vec<InterfaceCounters> {
    content
        .lines()
        .filter_map(|line| {
            let (name, stats) = line.split_once(':')?;
            let name = name.trim();
            if name == "lo" {
                return None;
            }
            let fields: Vec<u64> = stats
                .split_whitespace()
                .map(|s| s.parse().ok())
                .collect::<Option<_>>()?;
            if fields.len() < 9 {
                return None;
            }
            Some(InterfaceCounters {
                name: name.to_string(),
                rx: fields[0],
                tx: fields[8],
            })
        })
        .collect()
}

/// Interfaces carrying a default route, in `/proc/net/route` order.
pub(crate) fn default_route_interfaces(content: &str) -> Vec<String> {
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let fields: Vec<&str> = line.split_whitespace().collect();
            match fields.as_slice() {
                [iface, "00000000", ..] => Some(iface.to_string()),
                _ => None,
            }
        })
        .collect()
}

/// Interface carrying the first default route.
pub(crate) fn default_route_interface(content: &str) -> Option<String> {
    default_route_interfaces(content).into_iter().next()
}

pub(crate) fn has_prefix(name: &str, prefixes: &[String]) -> bool {
    prefixes.iter().any(|p| name.starts_with(p.as_str()))
}

/// Exponential smoothing of a throughput sample.
fn smooth(raw: f64, previous: f64) -> f64 {
    raw * 0.6 + previous * 0.4
}

/// Reports download and upload speed across all interfaces.
pub struct NetworkModule {
    ctx: Option<ModuleContext>,
    last: Option<(u64, u64, Instant)>,
    download: f64,
    upload: f64,
    running: bool,
}

impl Default for NetworkModule {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            last: None,
            download: 0.0,
            upload: 0.0,
            running: false,
        }
    }

    async fn read_totals(ctx: &ModuleContext) -> Option<(u64, u64)> {
        let content = ctx.access.read_path(NET_DEV).await?;
        let counters = parse_net_dev(&content);
        if counters.is_empty() {
            return None;
        }
        Some(
            counters
                .iter()
                .fold((0, 0), |(rx, tx), c| (rx + c.rx, tx + c.tx)),
        )
    }

    fn update(&mut self, rx: u64, tx: u64, now: Instant) {
        if let Some((prev_rx, prev_tx, prev_time)) = self.last {
            let elapsed = now.duration_since(prev_time).as_secs_f64();
            if elapsed > 0.0 {
                let raw_dl = rx.saturating_sub(prev_rx) as f64 / elapsed;
                let raw_ul = tx.saturating_sub(prev_tx) as f64 / elapsed;
                self.download = smooth(raw_dl, self.download);
                self.upload = smooth(raw_ul, self.upload);
            }
        }
        self.last = Some((rx, tx, now));
    }
}

#[async_trait]
impl Module for NetworkModule {
    fn key(&self) -> ModuleKey {
        ModuleKey::Network
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
        self.download = 0.0;
        self.upload = 0.0;
        self.last = Self::read_totals(&ctx)
            .await
            .map(|(rx, tx)| (rx, tx, Instant::now()));
        self.ctx = Some(ctx);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
        self.download = 0.0;
        self.upload = 0.0;
    }

    async fn tick(&mut self) {
        let Some(ctx) = &self.ctx else {
            return;
        };
        match Self::read_totals(ctx).await {
            Some((rx, tx)) => self.update(rx, tx, Instant::now()),
            None => {
                self.download = 0.0;
                self.upload = 0.0;
            }
        }
    }

    fn compact(&self) -> String {
        format!(
            "↓{} ↑{}",
            format::speed(self.download),
            format::speed(self.upload)
        )
    }

    fn detail(&self) -> String {
        format!(
            "Download: {}\nUpload: {}",
            format::speed(self.download),
            format::speed(self.upload)
        )
    }

    fn data_points(&self) -> Readouts {
        let mut d = Readouts::new();
        d.insert("net.download", format::speed(self.download));
        d.insert("net.upload", format::speed(self.upload));
        d
    }

    fn alive(&self) -> bool {
        self.running
    }
}
