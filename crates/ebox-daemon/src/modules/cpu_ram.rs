//! CPU usage, temperature and memory module.

use anyhow::Result;
use async_trait::async_trait;
use tracing::debug;

use super::{Module, ModuleContext, ModuleKey};
use crate::alert::{AlertRule, Direction};
use crate::format;
use crate::snapshot::{Readouts, UNAVAILABLE};

const RAM_ALERT: AlertRule = AlertRule {
    id: "ram_high",
    enabled_key: "cpu_ram_alert",
    default_enabled: false,
    threshold_key: "cpu_ram_thresh",
    default_threshold: 90,
    fired_key: "cpu_ram_alert_fired",
    direction: Direction::Above,
    hysteresis: Some(5.0),
};

/// Parses the aggregate `cpu` line of `/proc/stat` (at most 7 fields).
fn parse_cpu_times(stat: &str) -> Option<Vec<u64>> {
    let line = stat.lines().next()?;
    let rest = line.strip_prefix("cpu ")?;
    let times: Vec<u64> = rest
        .split_whitespace()
        .take(7)
        .map(|s| s.parse().ok())
        .collect::<Option<_>>()?;
    Some(times)
}

/// Busy percentage between two samples; idle counts idle + iowait.
fn cpu_usage(prev: &[u64], curr: &[u64]) -> Option<f64> {
    if prev.len() < 5 || curr.len() < 5 {
        return None;
    }
    let prev_idle = prev[3] + prev[4];
    let curr_idle = curr[3] + curr[4];
    let prev_total: u64 = prev.iter().sum();
    let curr_total: u64 = curr.iter().sum();

    let total = curr_total.checked_sub(prev_total)?;
    if total == 0 {
        return None;
    }
    let idle = curr_idle.saturating_sub(prev_idle).min(total);
    Some(((total - idle) as f64 * 100.0 / total as f64).clamp(0.0, 100.0))
}

/// The number directly in front of the first '%' in `s`.
fn percent_value(s: &str) -> Option<f64> {
    let end = s.find('%')?;
    let head = s[..end].trim_end();
    let start = head
        .rfind(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|i| i + 1)
        .unwrap_or(0);
    head[start..].parse().ok()
}

/// Extracts CPU usage from one line of `top -b -n 1` output.
///
/// Understands the toybox summary (`800%cpu 12%user ... 778%idle`), the
/// legacy comma form (`User 5%, System 3%, IOW 0%, IRQ 0%`) and the procps
/// form (`%Cpu(s): 5.9 us, 2.0 sy, ... 91.2 id, ...`).
fn parse_top_line(line: &str) -> Option<f64> {
    let l = line.to_lowercase();

    if l.contains("%cpu(s)") || l.starts_with("cpu(s)") {
        let idle = l.split(',').find_map(|part| {
            let words: Vec<&str> = part.split_whitespace().collect();
            let pos = words.iter().position(|w| *w == "id")?;
            words.get(pos.checked_sub(1)?)?.parse::<f64>().ok()
        })?;
        return Some((100.0 - idle).clamp(0.0, 100.0));
    }

    if !(l.contains("user") && l.contains("sys")) {
        return None;
    }

    if l.contains(',') {
        let total: f64 = l
            .split(',')
            .filter(|p| ["user", "sys", "nice", "irq"].iter().any(|k| p.contains(k)))
            .filter_map(percent_value)
            .sum();
        if total > 0.0 {
            return Some(total.min(100.0));
        }
    }

    let mut idle = None;
    let mut capacity = None;
    for word in l.split_whitespace() {
        if word.contains("idle") {
            idle = percent_value(word);
        } else if word.contains("cpu") {
            capacity = percent_value(word);
        }
    }
    match (capacity, idle) {
        (Some(total), Some(idle)) if total > 0.0 => {
            Some(((total - idle) * 100.0 / total).clamp(0.0, 100.0))
        }
        _ => None,
    }
}

/// Reads `MemTotal` and `MemAvailable` from `/proc/meminfo`, in bytes.
fn parse_meminfo(content: &str) -> Option<(u64, u64)> {
    let field = |name: &str| -> Option<u64> {
        content
            .lines()
            .find(|l| l.starts_with(name))?
            .split_whitespace()
            .nth(1)?
            .parse::<u64>()
            .ok()
            .map(|kb| kb * 1024)
    };
    let total = field("MemTotal:")?;
    let available = field("MemAvailable:").or_else(|| field("MemFree:"))?;
    Some((total, available.min(total)))
}

/// Samples CPU load and temperature plus memory usage.
pub struct CpuRamModule {
    ctx: Option<ModuleContext>,
    prev_times: Option<Vec<u64>>,
    usage: Option<f64>,
    temp: Option<f64>,
    ram_total: u64,
    ram_available: u64,
    running: bool,
}

impl Default for CpuRamModule {
    fn default() -> Self {
        Self::new()
    }
}

impl CpuRamModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            prev_times: None,
            usage: None,
            temp: None,
            ram_total: 0,
            ram_available: 0,
            running: false,
        }
    }

    fn ram_used(&self) -> u64 {
        self.ram_total.saturating_sub(self.ram_available)
    }

    fn ram_pct(&self) -> f64 {
        if self.ram_total == 0 {
            return 0.0;
        }
        self.ram_used() as f64 * 100.0 / self.ram_total as f64
    }

    async fn usage_from_top(ctx: &ModuleContext) -> Option<f64> {
        let output = ctx.access.run_command("top -b -n 1").await?;
        output.lines().find_map(parse_top_line)
    }
}

#[async_trait]
impl Module for CpuRamModule {
    fn key(&self) -> ModuleKey {
        ModuleKey::CpuRam
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
        // The first tick primes the /proc/stat baseline.
        self.prev_times = None;
        self.usage = None;
        self.ctx = Some(ctx);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    async fn tick(&mut self) {
        let Some(ctx) = self.ctx.clone() else {
            return;
        };

        let current = ctx
            .access
            .read_path("/proc/stat")
            .await
            .as_deref()
            .and_then(parse_cpu_times);
        let delta = match (&self.prev_times, &current) {
            (Some(prev), Some(curr)) => cpu_usage(prev, curr),
            _ => None,
        };
        self.usage = match delta {
            Some(usage) => Some(usage),
            None => {
                debug!("CPU usage from /proc/stat unavailable, trying top");
                Self::usage_from_top(&ctx).await
            }
        };
        if current.is_some() {
            self.prev_times = current;
        }

        // Failed reads clear the value so stale samples are never republished.
        self.temp = ctx.access.read_cpu_temp().await.map(f64::from);

        let (total, available) = ctx
            .access
            .read_path("/proc/meminfo")
            .await
            .as_deref()
            .and_then(parse_meminfo)
            .unwrap_or((0, 0));
        self.ram_total = total;
        self.ram_available = available;
    }

    fn check_alerts(&mut self) {
        let Some(ctx) = &self.ctx else {
            return;
        };
        if self.ram_total == 0 {
            return;
        }
        let pct = self.ram_pct();
        if RAM_ALERT.evaluate(&ctx.settings, pct, false) {
            ctx.alerts.raise(
                self.key().as_str(),
                RAM_ALERT.id,
                "High RAM Usage".to_string(),
                format!("RAM at {}%", pct as u64),
            );
        }
    }

    fn compact(&self) -> String {
        let cpu = format::or_unavailable(self.usage, |u| format!("{}%", u as u64));
        let temp = self
            .temp
            .map(|t| format!(" {}", format::temp(Some(t))))
            .unwrap_or_default();
        let ram = format::or_unavailable((self.ram_total > 0).then(|| self.ram_pct()), |p| {
            format!("{}%", p as u64)
        });
        format!("CPU:{}{} RAM:{}", cpu, temp, ram)
    }

    fn detail(&self) -> String {
        let mut first = format!("CPU: {}", format::pct(self.usage));
        if self.temp.is_some() {
            first.push_str(&format!(" • {}", format::temp(self.temp)));
        }
        format!(
            "{}\nRAM: {} / {} ({}%)\nAvailable: {}",
            first,
            format::bytes(self.ram_used() as i64),
            format::bytes(self.ram_total as i64),
            self.ram_pct() as u64,
            format::bytes(self.ram_available as i64)
        )
    }

    fn data_points(&self) -> Readouts {
        let mut d = Readouts::new();
        d.insert(
            "cpu.usage",
            self.usage
                .map(|u| format!("{:.1}%", u))
                .unwrap_or_else(|| "N/A".to_string()),
        );
        d.insert("cpu.temp", format::temp(self.temp));
        if self.ram_total > 0 {
            d.insert("ram.used", format::bytes(self.ram_used() as i64));
            d.insert("ram.total", format::bytes(self.ram_total as i64));
            d.insert("ram.available", format::bytes(self.ram_available as i64));
            d.insert("ram.pct", format!("{}%", self.ram_pct() as u64));
        } else {
            for name in ["ram.used", "ram.total", "ram.available", "ram.pct"] {
                d.insert(name, UNAVAILABLE);
            }
        }
        d
    }

    fn alive(&self) -> bool {
        self.running
    }
}
