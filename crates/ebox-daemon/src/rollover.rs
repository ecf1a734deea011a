//! Day, month and boot rollover of accumulated counters.
//!
//! All resets happen here so that modules never race each other over the
//! same accumulator.

use chrono::{Datelike, Local, NaiveDate};
use std::sync::Arc;
use tracing::info;

use crate::settings::{SettingsBatch, SettingsStore};

/// A live accumulator and the key its value is copied to before reset.
struct Accumulator {
    live: &'static str,
    previous: Option<&'static str>,
}

const DAILY: &[Accumulator] = &[
    Accumulator {
        live: "dat_daily_total",
        previous: Some("dat_yesterday_total"),
    },
    Accumulator {
        live: "dat_daily_wifi",
        previous: Some("dat_yesterday_wifi"),
    },
    Accumulator {
        live: "dat_daily_mobile",
        previous: Some("dat_yesterday_mobile"),
    },
];

/// Per-day quotas. Only a calendar day change clears these; charge and boot
/// resets leave them alone.
const DAILY_QUOTAS: &[&str] = &["spd_tests_today"];

const MONTHLY: &[Accumulator] = &[
    Accumulator {
        live: "dat_month_total",
        previous: Some("dat_last_month_total"),
    },
    Accumulator {
        live: "dat_month_wifi",
        previous: Some("dat_last_month_wifi"),
    },
    Accumulator {
        live: "dat_month_mobile",
        previous: Some("dat_last_month_mobile"),
    },
];

/// Alert flags re-armed when a new month starts.
const MONTHLY_FLAGS: &[&str] = &["dat_plan_alert_fired"];

const DAY_KEY: &str = "rollover_day";
const MONTH_KEY: &str = "rollover_month";
const YEAR_KEY: &str = "rollover_year";

const LAST_BOOT_KEY: &str = "upt_last_boot";
pub const REBOOT_COUNT_KEY: &str = "upt_reboot_count";
pub const RESET_ON_BOOT_KEY: &str = "reset_on_boot";
pub const RESET_ON_FULL_CHARGE_KEY: &str = "reset_on_full_charge";

/// Boot timestamps closer than this are the same boot.
const BOOT_TOLERANCE_MS: i64 = 60_000;

/// Which periods rolled over in one check.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Rollover {
    pub day: bool,
    pub month: bool,
}

/// Zeroes the daily accumulators without keeping a previous-day copy.
pub fn reset_daily(settings: &SettingsStore) {
    settings.batch(|b| {
        for acc in DAILY {
            b.set_i64(acc.live, 0);
        }
    });
}

fn roll(b: &mut SettingsBatch<'_>, accumulators: &[Accumulator]) {
    for acc in accumulators {
        if let Some(previous) = acc.previous {
            let value = b.get_i64(acc.live, 0);
            b.set_i64(previous, value);
        }
        b.set_i64(acc.live, 0);
    }
}

/// Detects date and boot changes and resets accumulators.
pub struct RolloverCoordinator {
    settings: Arc<SettingsStore>,
}

impl RolloverCoordinator {
    pub fn new(settings: Arc<SettingsStore>) -> Self {
        Self { settings }
    }

    /// Checks against the local calendar date.
    pub fn check(&self) -> Rollover {
        self.check_at(Local::now().date_naive())
    }

    /// Checks against `today`. The first call only records the date.
    pub fn check_at(&self, today: NaiveDate) -> Rollover {
        let day = today.ordinal() as i64;
        let month = today.month() as i64;
        let year = today.year() as i64;

        self.settings.batch(|b| {
            let last_day = b.get_i64(DAY_KEY, -1);
            let last_month = b.get_i64(MONTH_KEY, -1);
            let last_year = b.get_i64(YEAR_KEY, -1);

            let mut result = Rollover::default();
            if last_day < 0 {
                b.set_i64(DAY_KEY, day);
                b.set_i64(MONTH_KEY, month);
                b.set_i64(YEAR_KEY, year);
                return result;
            }

            if day != last_day || year != last_year {
                roll(b, DAILY);
                for quota in DAILY_QUOTAS {
                    b.set_i64(quota, 0);
                }
                b.set_i64(DAY_KEY, day);
                result.day = true;
            }
            if month != last_month || year != last_year {
                roll(b, MONTHLY);
                for flag in MONTHLY_FLAGS {
                    b.set_bool(flag, false);
                }
                b.set_i64(MONTH_KEY, month);
                result.month = true;
            }
            b.set_i64(YEAR_KEY, year);

            if result.day {
                info!("Day rollover: daily counters reset");
            }
            if result.month {
                info!("Month rollover: monthly counters reset");
            }
            result
        })
    }

    /// Records the boot timestamp (epoch milliseconds). Returns true when it
    /// belongs to a boot not seen before.
    pub fn record_boot(&self, boot_epoch_ms: i64) -> bool {
        let last = self.settings.get_i64(LAST_BOOT_KEY, 0);
        if (boot_epoch_ms - last).abs() <= BOOT_TOLERANCE_MS {
            return false;
        }
        self.settings.batch(|b| {
            b.add_i64(REBOOT_COUNT_KEY, 1);
            b.set_i64(LAST_BOOT_KEY, boot_epoch_ms);
        });
        info!("New boot detected");
        if self.settings.get_bool(RESET_ON_BOOT_KEY, false) {
            reset_daily(&self.settings);
            info!("Daily counters reset on boot");
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn coordinator() -> (Arc<SettingsStore>, RolloverCoordinator) {
        let settings = Arc::new(SettingsStore::in_memory());
        (settings.clone(), RolloverCoordinator::new(settings))
    }

    #[test]
    fn test_first_check_only_seeds() {
        let (settings, rollover) = coordinator();
        settings.set_i64("dat_daily_total", 500);
        assert_eq!(rollover.check_at(date(2026, 3, 10)), Rollover::default());
        assert_eq!(settings.get_i64("dat_daily_total", 0), 500);
    }

    #[test]
    fn test_day_rollover_snapshots_yesterday() {
        let (settings, rollover) = coordinator();
        rollover.check_at(date(2026, 3, 10));
        settings.set_i64("dat_daily_total", 500);
        settings.set_i64("dat_daily_mobile", 200);
        settings.set_i64("spd_tests_today", 4);
        settings.set_i64("dat_month_total", 9000);

        let result = rollover.check_at(date(2026, 3, 11));
        assert_eq!(
            result,
            Rollover {
                day: true,
                month: false
            }
        );
        assert_eq!(settings.get_i64("dat_yesterday_total", 0), 500);
        assert_eq!(settings.get_i64("dat_yesterday_mobile", 0), 200);
        assert_eq!(settings.get_i64("dat_daily_total", -1), 0);
        assert_eq!(settings.get_i64("spd_tests_today", -1), 0);
        assert_eq!(settings.get_i64("dat_month_total", 0), 9000);
    }

    #[test]
    fn test_rollover_is_idempotent_within_day() {
        let (settings, rollover) = coordinator();
        rollover.check_at(date(2026, 3, 10));
        settings.set_i64("dat_daily_total", 500);
        rollover.check_at(date(2026, 3, 11));
        settings.set_i64("dat_daily_total", 70);
        assert_eq!(rollover.check_at(date(2026, 3, 11)), Rollover::default());
        assert_eq!(settings.get_i64("dat_daily_total", 0), 70);
        assert_eq!(settings.get_i64("dat_yesterday_total", 0), 500);
    }

    #[test]
    fn test_month_and_year_rollover() {
        let (settings, rollover) = coordinator();
        rollover.check_at(date(2025, 12, 31));
        settings.set_i64("dat_month_total", 9000);
        settings.set_bool("dat_plan_alert_fired", true);

        let result = rollover.check_at(date(2026, 1, 1));
        assert_eq!(
            result,
            Rollover {
                day: true,
                month: true
            }
        );
        assert_eq!(settings.get_i64("dat_last_month_total", 0), 9000);
        assert_eq!(settings.get_i64("dat_month_total", -1), 0);
        assert!(!settings.get_bool("dat_plan_alert_fired", true));
    }

    #[test]
    fn test_same_ordinal_next_year_rolls() {
        let (_, rollover) = coordinator();
        rollover.check_at(date(2025, 3, 10));
        assert!(rollover.check_at(date(2026, 3, 10)).day);
    }

    #[test]
    fn test_boot_detection() {
        let (settings, rollover) = coordinator();
        settings.set_bool(RESET_ON_BOOT_KEY, true);
        settings.set_i64("dat_daily_total", 300);

        assert!(rollover.record_boot(1_700_000_000_000));
        assert_eq!(settings.get_i64("dat_daily_total", -1), 0);
        assert_eq!(settings.get_i64(REBOOT_COUNT_KEY, 0), 1);

        settings.set_i64("dat_daily_total", 40);
        // Jitter in the derived boot time is not a new boot.
        assert!(!rollover.record_boot(1_700_000_030_000));
        assert_eq!(settings.get_i64("dat_daily_total", 0), 40);

        assert!(rollover.record_boot(1_700_000_500_000));
        assert_eq!(settings.get_i64(REBOOT_COUNT_KEY, 0), 2);
    }

    #[test]
    fn test_reset_daily_keeps_yesterday() {
        let (settings, _) = coordinator();
        settings.set_i64("dat_yesterday_total", 11);
        settings.set_i64("dat_daily_wifi", 22);
        reset_daily(&settings);
        assert_eq!(settings.get_i64("dat_daily_wifi", -1), 0);
        assert_eq!(settings.get_i64("dat_yesterday_total", 0), 11);
    }

    #[test]
    fn test_charge_and_boot_resets_keep_speed_test_quota() {
        let (settings, rollover) = coordinator();
        settings.set_bool(RESET_ON_BOOT_KEY, true);
        settings.set_i64("spd_tests_today", 3);
        settings.set_i64("dat_daily_total", 300);

        reset_daily(&settings);
        assert_eq!(settings.get_i64("spd_tests_today", 0), 3);

        settings.set_i64("dat_daily_total", 300);
        assert!(rollover.record_boot(1_700_000_000_000));
        assert_eq!(settings.get_i64("dat_daily_total", -1), 0);
        assert_eq!(settings.get_i64("spd_tests_today", 0), 3);
    }

    #[test]
    fn test_quiet_check_does_not_rewrite_settings() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("settings.toml");
        let settings = Arc::new(SettingsStore::load(dir.path()));
        let rollover = RolloverCoordinator::new(settings);

        rollover.check_at(date(2026, 3, 10));
        assert!(path.exists());
        std::fs::remove_file(&path).unwrap();

        assert_eq!(rollover.check_at(date(2026, 3, 10)), Rollover::default());
        assert!(!path.exists());

        assert!(rollover.check_at(date(2026, 3, 11)).day);
        assert!(path.exists());
    }
}
