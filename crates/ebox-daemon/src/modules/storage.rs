//! Storage usage module.

use anyhow::{bail, Result};
use async_trait::async_trait;
use std::ffi::CString;
use tracing::debug;

use super::{Module, ModuleContext, ModuleKey};
use crate::alert::{AlertRule, Direction};
use crate::format;
use crate::snapshot::{Readouts, UNAVAILABLE};

const MIB: u64 = 1024 * 1024;

const LOW_ALERT: AlertRule = AlertRule {
    id: "low",
    enabled_key: "sto_low_alert",
    default_enabled: true,
    threshold_key: "sto_low_thresh_mb",
    default_threshold: 1000,
    fired_key: "sto_low_alert_fired",
    direction: Direction::Below,
    hysteresis: Some(500.0),
};

/// Filesystem capacity in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FsUsage {
    total: u64,
    free: u64,
}

impl FsUsage {
    fn used(&self) -> u64 {
        self.total.saturating_sub(self.free)
    }

    fn pct(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        self.used() as f64 * 100.0 / self.total as f64
    }
}

fn statvfs(path: &str) -> Option<FsUsage> {
    let c_path = CString::new(path).ok()?;
    // SAFETY: statvfs only writes into the zeroed struct we own, and c_path
    // is a valid NUL-terminated string for the duration of the call.
    let stat = unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) != 0 {
            return None;
        }
        stat
    };
    let block = stat.f_frsize as u64;
    Some(FsUsage {
        total: stat.f_blocks as u64 * block,
        free: stat.f_bavail as u64 * block,
    })
}

/// Reports used and free space of one mount point.
pub struct StorageModule {
    ctx: Option<ModuleContext>,
    path: String,
    usage: Option<FsUsage>,
    running: bool,
}

impl Default for StorageModule {
    fn default() -> Self {
        Self::new()
    }
}

impl StorageModule {
    pub fn new() -> Self {
        Self {
            ctx: None,
            path: "/".to_string(),
            usage: None,
            running: false,
        }
    }
}

#[async_trait]
impl Module for StorageModule {
    fn key(&self) -> ModuleKey {
        ModuleKey::Storage
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
        let path = ctx.config.storage.path.clone();
        if CString::new(path.as_str()).is_err() {
            bail!("Invalid storage path: {:?}", path);
        }
        self.path = path;
        self.ctx = Some(ctx);
        self.running = true;
        Ok(())
    }

    fn stop(&mut self) {
        self.running = false;
    }

    async fn tick(&mut self) {
        let usage = statvfs(&self.path);
        if usage.is_none() {
            debug!("statvfs failed for {}", self.path);
        }
        self.usage = usage;
    }

    fn check_alerts(&mut self) {
        let (Some(ctx), Some(usage)) = (&self.ctx, self.usage) else {
            return;
        };
        let free_mb = usage.free as f64 / MIB as f64;
        if LOW_ALERT.evaluate(&ctx.settings, free_mb, usage.free == 0) {
            ctx.alerts.raise(
                self.key().as_str(),
                LOW_ALERT.id,
                "Low Storage".to_string(),
                format!("Only {} remaining", format::bytes(usage.free as i64)),
            );
        }
    }

    fn compact(&self) -> String {
        match self.usage {
            Some(u) => format!(
                "{}/{}",
                format::bytes(u.used() as i64),
                format::bytes(u.total as i64)
            ),
            None => UNAVAILABLE.to_string(),
        }
    }

    fn detail(&self) -> String {
        match self.usage {
            Some(u) => format!(
                "{}: {} / {} ({:.1}%)\nFree: {}",
                self.path,
                format::bytes(u.used() as i64),
                format::bytes(u.total as i64),
                u.pct(),
                format::bytes(u.free as i64)
            ),
            None => format!("{}: {}", self.path, UNAVAILABLE),
        }
    }

    fn data_points(&self) -> Readouts {
        let u = self.usage;
        let mut d = Readouts::new();
        d.insert(
            "storage.used",
            format::or_unavailable(u, |u| format::bytes(u.used() as i64)),
        );
        d.insert(
            "storage.free",
            format::or_unavailable(u, |u| format::bytes(u.free as i64)),
        );
        d.insert(
            "storage.total",
            format::or_unavailable(u, |u| format::bytes(u.total as i64)),
        );
        d.insert("storage.pct", format::pct(u.map(|u| u.pct())));
        d
    }

    fn alive(&self) -> bool {
        self.running
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::tests::test_context;
    use std::sync::Arc;

    #[test]
    fn test_statvfs_root() {
        let usage = statvfs("/").unwrap();
        assert!(usage.total > 0);
        assert!(usage.free <= usage.total);
        assert_eq!(statvfs("/nonexistent/ebox"), None);
    }

    #[tokio::test]
    async fn test_tick_and_readouts() {
        let mut module = StorageModule::new();
        module.start(test_context()).await.unwrap();
        assert_eq!(module.data_points().get("storage.total"), Some(UNAVAILABLE));
        module.tick().await;
        assert_ne!(module.data_points().get("storage.total"), Some(UNAVAILABLE));
        assert_eq!(module.data_points().iter().count(), 4);
    }

    #[tokio::test]
    async fn test_invalid_path_fails_start() {
        let mut ctx = test_context();
        let mut config = (*ctx.config).clone();
        config.storage.path = "bad\0path".to_string();
        ctx.config = Arc::new(config);

        let mut module = StorageModule::new();
        assert!(module.start(ctx).await.is_err());
        assert!(!module.alive());
    }

    #[test]
    fn test_low_storage_hysteresis() {
        let ctx = test_context();
        let mut alerts = ctx.alerts.subscribe();
        let mut module = StorageModule::new();
        module.ctx = Some(ctx);

        module.usage = Some(FsUsage {
            total: 64_000 * MIB,
            free: 800 * MIB,
        });
        module.check_alerts();
        assert_eq!(alerts.try_recv().unwrap().id, "low");

        module.usage = Some(FsUsage {
            total: 64_000 * MIB,
            free: 1200 * MIB,
        });
        module.check_alerts();
        module.usage = Some(FsUsage {
            total: 64_000 * MIB,
            free: 900 * MIB,
        });
        module.check_alerts();
        assert!(alerts.try_recv().is_err());
    }
}
