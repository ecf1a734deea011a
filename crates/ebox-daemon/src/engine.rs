//! Tick engine.
//!
//! One loop owns every module. Each cycle runs the rollover check, reconciles
//! the running set against settings, ticks the modules that are due and
//! publishes their readouts, then sleeps until the nearest deadline.

use chrono::Local;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::modules::{boot_epoch_ms, ModuleContext, ModuleKey, ModuleRegistry};
use crate::rollover::RolloverCoordinator;
use crate::snapshot::{ModuleSnapshot, SnapshotStore};

fn clock_ms(clock: libc::clockid_t) -> Option<u64> {
    // SAFETY: clock_gettime only writes into the timespec we own.
    let ts = unsafe {
        let mut ts: libc::timespec = std::mem::zeroed();
        (libc::clock_gettime(clock, &mut ts) == 0).then_some(ts)
    }?;
    Some(ts.tv_sec as u64 * 1000 + ts.tv_nsec as u64 / 1_000_000)
}

/// Milliseconds since boot, including time spent suspended.
pub fn boot_time_ms() -> u64 {
    clock_ms(libc::CLOCK_BOOTTIME)
        .or_else(|| clock_ms(libc::CLOCK_MONOTONIC))
        .unwrap_or(0)
}

/// Milliseconds since boot, excluding time spent suspended.
pub fn awake_time_ms() -> u64 {
    clock_ms(libc::CLOCK_MONOTONIC).unwrap_or(0)
}

/// Sleep until the nearest deadline, clamped to the scheduler bounds.
///
/// `entries` holds `(last_tick, interval)` of every running module.
pub fn compute_delay(now: u64, entries: &[(u64, u64)], cfg: &SchedulerConfig) -> u64 {
    let ceiling = cfg.ceiling_ms.max(cfg.floor_ms);
    match entries
        .iter()
        .map(|&(last, interval)| (last + interval).saturating_sub(now))
        .min()
    {
        Some(nearest) => nearest.max(cfg.floor_ms).min(ceiling),
        None => cfg.idle_ms.min(ceiling),
    }
}

/// Scheduler state: the modules, their last tick and the published snapshot.
pub struct Engine {
    registry: ModuleRegistry,
    schedule: HashMap<ModuleKey, u64>,
    failed: HashSet<ModuleKey>,
    ctx: ModuleContext,
    rollover: RolloverCoordinator,
    snapshot: Arc<SnapshotStore>,
    scheduler: SchedulerConfig,
}

impl Engine {
    pub fn new(registry: ModuleRegistry, ctx: ModuleContext, snapshot: Arc<SnapshotStore>) -> Self {
        Self {
            registry,
            schedule: HashMap::new(),
            failed: HashSet::new(),
            rollover: RolloverCoordinator::new(ctx.settings.clone()),
            scheduler: ctx.config.scheduler,
            ctx,
            snapshot,
        }
    }

    /// Records the current boot with the rollover coordinator.
    pub fn record_boot(&self, now: u64) {
        self.rollover.record_boot(boot_epoch_ms(Local::now(), now));
    }

    /// Runs one cycle at engine time `now`. Returns the number of modules
    /// that ticked.
    pub async fn run_cycle(&mut self, now: u64) -> usize {
        self.rollover.check();
        let removed = self.reconcile().await;

        let mut ticked = 0;
        for key in self.registry.alive() {
            let Some(module) = self.registry.get_mut(key) else {
                continue;
            };
            let last = *self.schedule.entry(key).or_insert(0);
            if now.saturating_sub(last) < module.tick_interval_ms() {
                continue;
            }
            module.tick().await;
            module.check_alerts();
            self.schedule.insert(key, now);
            self.snapshot.publish(
                key,
                ModuleSnapshot {
                    key: key.as_str().to_string(),
                    name: module.name().to_string(),
                    priority: module.priority(),
                    compact: module.compact(),
                    detail: module.detail(),
                    readouts: module.data_points(),
                    updated_ms: now,
                },
            );
            ticked += 1;
        }

        if ticked > 0 || removed {
            self.snapshot.notify();
        }
        ticked
    }

    /// Starts and stops modules to match their enabled settings. Returns true
    /// when a published snapshot was removed.
    async fn reconcile(&mut self) -> bool {
        let mut removed = false;
        for key in self.registry.keys() {
            let Some(module) = self.registry.get_mut(key) else {
                continue;
            };
            let wanted = self
                .ctx
                .settings
                .is_module_enabled(key.as_str(), module.default_enabled());

            if wanted && !module.alive() {
                match module.start(self.ctx.clone()).await {
                    Ok(()) => {
                        info!("Started module {}", key);
                        self.failed.remove(&key);
                        self.schedule.insert(key, 0);
                    }
                    Err(e) => {
                        if self.failed.insert(key) {
                            warn!("Failed to start module {}: {:#}", key, e);
                        } else {
                            debug!("Module {} still failing to start: {:#}", key, e);
                        }
                        module.stop();
                    }
                }
            } else if !wanted && module.alive() {
                module.stop();
                info!("Stopped module {}", key);
                self.schedule.remove(&key);
                removed |= self.snapshot.remove(key);
            } else if !wanted {
                self.failed.remove(&key);
            }
        }
        removed
    }

    /// Delay before the next cycle should run.
    pub fn next_delay(&self, now: u64) -> u64 {
        let entries: Vec<(u64, u64)> = self
            .registry
            .alive()
            .into_iter()
            .filter_map(|key| {
                let module = self.registry.get(key)?;
                let last = self.schedule.get(&key).copied().unwrap_or(0);
                Some((last, module.tick_interval_ms()))
            })
            .collect();
        compute_delay(now, &entries, &self.scheduler)
    }

    /// Stops every module, empties the snapshot and closes privileged access.
    pub async fn shutdown(&mut self) {
        for key in self.registry.alive() {
            if let Some(module) = self.registry.get_mut(key) {
                module.stop();
            }
        }
        self.schedule.clear();
        self.snapshot.clear();
        self.snapshot.notify();
        self.ctx.access.shutdown().await;
        info!("Engine stopped");
    }
}

/// Handle to the engine task.
pub struct EngineHandle {
    cancel: CancellationToken,
    waker: Arc<Notify>,
    task: JoinHandle<()>,
}

impl EngineHandle {
    /// Wakes the loop early, e.g. after a settings change.
    pub fn waker(&self) -> Arc<Notify> {
        self.waker.clone()
    }

    /// Cancels the loop and waits for module and shell shutdown.
    pub async fn stop(self) {
        self.cancel.cancel();
        if let Err(e) = self.task.await {
            warn!("Engine task ended abnormally: {}", e);
        }
    }
}

/// Spawns the engine loop.
pub fn start_engine(engine: Engine) -> EngineHandle {
    let cancel = CancellationToken::new();
    let waker = Arc::new(Notify::new());
    let task = tokio::spawn(run_loop(engine, cancel.clone(), waker.clone()));
    info!("Engine started");
    EngineHandle {
        cancel,
        waker,
        task,
    }
}

async fn run_loop(mut engine: Engine, cancel: CancellationToken, waker: Arc<Notify>) {
    engine.record_boot(boot_time_ms());
    loop {
        engine.run_cycle(boot_time_ms()).await;
        let delay = engine.next_delay(boot_time_ms());
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = waker.notified() => debug!("Engine woken early"),
            _ = tokio::time::sleep(Duration::from_millis(delay)) => {}
        }
    }
    engine.shutdown().await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modules::tests::test_context;
    use crate::modules::Module;
    use crate::snapshot::Readouts;
    use anyhow::{bail, Result};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct FakeModule {
        key: ModuleKey,
        interval: u64,
        ticks: Arc<AtomicUsize>,
        fail_start: bool,
        running: bool,
    }

    impl FakeModule {
        fn new(key: ModuleKey, interval: u64) -> (Self, Arc<AtomicUsize>) {
            let ticks = Arc::new(AtomicUsize::new(0));
            let module = Self {
                key,
                interval,
                ticks: ticks.clone(),
                fail_start: false,
                running: false,
            };
            (module, ticks)
        }
    }

    #[async_trait]
    impl Module for FakeModule {
        fn key(&self) -> ModuleKey {
            self.key
        }

        fn tick_interval_ms(&self) -> u64 {
            self.interval
        }

        async fn start(&mut self, _ctx: ModuleContext) -> Result<()> {
            if self.fail_start {
                bail!("listener registration failed");
            }
            self.running = true;
            Ok(())
        }

        fn stop(&mut self) {
            self.running = false;
        }

        async fn tick(&mut self) {
            self.ticks.fetch_add(1, Ordering::SeqCst);
        }

        fn compact(&self) -> String {
            self.ticks.load(Ordering::SeqCst).to_string()
        }

        fn detail(&self) -> String {
            self.compact()
        }

        fn data_points(&self) -> Readouts {
            let mut d = Readouts::new();
            d.insert("fake.ticks", self.compact());
            d
        }

        fn alive(&self) -> bool {
            self.running
        }
    }

    fn engine_with(modules: Vec<FakeModule>) -> (Engine, Arc<SnapshotStore>) {
        let ctx = test_context();
        let mut registry = ModuleRegistry::new();
        for module in modules {
            ctx.settings.set_module_enabled(module.key.as_str(), true);
            registry.register(Box::new(module));
        }
        let snapshot = Arc::new(SnapshotStore::new());
        (Engine::new(registry, ctx, snapshot.clone()), snapshot)
    }

    async fn advance_to(engine: &mut Engine, now: &mut u64, target: u64) {
        while *now < target {
            *now += engine.next_delay(*now);
            engine.run_cycle(*now).await;
        }
    }

    #[test]
    fn test_delay_is_floor_clamped() {
        let cfg = SchedulerConfig::default();
        // 1000 ms module due now, 5000 ms module due in 3000 ms.
        let entries = [(9_000, 1_000), (8_000, 5_000)];
        assert_eq!(compute_delay(10_000, &entries, &cfg), cfg.floor_ms);
    }

    #[test]
    fn test_delay_bounds() {
        let cfg = SchedulerConfig::default();
        assert_eq!(compute_delay(0, &[(0, 3_000)], &cfg), 3_000);
        assert_eq!(compute_delay(0, &[(0, 600_000)], &cfg), cfg.ceiling_ms);
        assert_eq!(compute_delay(0, &[], &cfg), cfg.idle_ms);
    }

    #[tokio::test]
    async fn test_modules_tick_on_their_own_cadence() {
        let (a, a_ticks) = FakeModule::new(ModuleKey::Battery, 1_000);
        let (b, b_ticks) = FakeModule::new(ModuleKey::Uptime, 10_000);
        let (mut engine, snapshot) = engine_with(vec![a, b]);

        let mut now = 0;
        assert_eq!(engine.run_cycle(now).await, 0);

        advance_to(&mut engine, &mut now, 1_000).await;
        assert_eq!(a_ticks.load(Ordering::SeqCst), 1);
        assert_eq!(b_ticks.load(Ordering::SeqCst), 0);
        assert!(snapshot.get(ModuleKey::Uptime).is_none());

        advance_to(&mut engine, &mut now, 10_000).await;
        assert_eq!(now, 10_000);
        assert_eq!(a_ticks.load(Ordering::SeqCst), 10);
        assert_eq!(b_ticks.load(Ordering::SeqCst), 1);

        let a_snap = snapshot.get(ModuleKey::Battery).unwrap();
        assert_eq!(a_snap.readouts.get("fake.ticks"), Some("10"));
        assert_eq!(a_snap.updated_ms, 10_000);
        let b_snap = snapshot.get(ModuleKey::Uptime).unwrap();
        assert_eq!(b_snap.readouts.get("fake.ticks"), Some("1"));
    }

    #[tokio::test]
    async fn test_disabling_removes_snapshot() {
        let (a, _) = FakeModule::new(ModuleKey::Battery, 1_000);
        let (mut engine, snapshot) = engine_with(vec![a]);
        engine.run_cycle(0).await;
        engine.run_cycle(1_000).await;
        assert!(snapshot.get(ModuleKey::Battery).is_some());
        let version = snapshot.version();

        engine.ctx.settings.set_module_enabled("battery", false);
        assert_eq!(engine.run_cycle(1_500).await, 0);
        assert!(snapshot.get(ModuleKey::Battery).is_none());
        assert!(snapshot.version() > version);
        assert!(engine.registry.alive().is_empty());
        assert_eq!(engine.next_delay(1_500), engine.scheduler.idle_ms);
    }

    #[tokio::test]
    async fn test_start_failure_leaves_module_stopped() {
        let (mut bad, bad_ticks) = FakeModule::new(ModuleKey::Storage, 1_000);
        bad.fail_start = true;
        let (good, good_ticks) = FakeModule::new(ModuleKey::Battery, 1_000);
        let (mut engine, snapshot) = engine_with(vec![bad, good]);

        engine.run_cycle(0).await;
        engine.run_cycle(1_000).await;
        engine.run_cycle(2_000).await;
        assert_eq!(bad_ticks.load(Ordering::SeqCst), 0);
        assert_eq!(good_ticks.load(Ordering::SeqCst), 2);
        assert!(snapshot.get(ModuleKey::Storage).is_none());
        assert_eq!(engine.registry.alive(), vec![ModuleKey::Battery]);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (a, _) = FakeModule::new(ModuleKey::Battery, 1_000);
        let (mut engine, snapshot) = engine_with(vec![a]);
        engine.run_cycle(0).await;
        engine.run_cycle(1_000).await;

        engine.shutdown().await;
        assert!(engine.registry.alive().is_empty());
        assert!(snapshot.all().is_empty());
    }

    #[tokio::test]
    async fn test_engine_handle_stop() {
        let (a, a_ticks) = FakeModule::new(ModuleKey::Battery, 1_000);
        let (engine, snapshot) = engine_with(vec![a]);
        let mut updates = snapshot.subscribe();
        let handle = start_engine(engine);

        // The boot clock is far past zero, so the first cycle ticks at once.
        tokio::time::timeout(Duration::from_secs(5), updates.changed())
            .await
            .unwrap()
            .unwrap();
        assert!(a_ticks.load(Ordering::SeqCst) >= 1);

        handle.stop().await;
        assert!(snapshot.all().is_empty());
    }

    #[test]
    fn test_boot_clock_advances() {
        let first = boot_time_ms();
        assert!(first > 0);
        assert!(boot_time_ms() >= first);
        assert!(awake_time_ms() <= boot_time_ms());
    }
}
