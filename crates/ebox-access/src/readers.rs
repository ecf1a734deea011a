//! Domain readers layered on `read_path`.
//!
//! Raw counters are scaled and range-checked; out-of-range values are treated
//! as unavailable rather than passed through.

use std::ops::RangeInclusive;

use crate::facade::SystemAccess;

/// Thermal zone files tried in order for the CPU temperature.
pub const THERMAL_ZONES: [&str; 5] = [
    "/sys/devices/virtual/thermal/thermal_zone0/temp",
    "/sys/class/thermal/thermal_zone0/temp",
    "/sys/devices/virtual/thermal/thermal_zone1/temp",
    "/sys/class/thermal/thermal_zone1/temp",
    "/sys/devices/virtual/thermal/thermal_zone2/temp",
];

/// Plausible battery capacity in mAh.
pub const CAPACITY_RANGE_MAH: RangeInclusive<i64> = 1..=99_999;

/// Plausible temperature in degrees Celsius.
pub const TEMP_RANGE_C: RangeInclusive<f32> = 0.1..=149.9;

/// Plausible real-health percentage (actual over design capacity).
pub const HEALTH_RANGE_PCT: RangeInclusive<i64> = 1..=200;

/// Parses the first line of `raw` as an integer.
pub fn parse_i64(raw: &str) -> Option<i64> {
    raw.lines().next()?.trim().parse().ok()
}

/// Divides a raw micro-unit counter by 1000 and validates the result.
pub fn scale_milli(raw: &str, range: &RangeInclusive<i64>) -> Option<i64> {
    let value = parse_i64(raw)? / 1000;
    range.contains(&value).then_some(value)
}

/// Converts a thermal reading (degrees or milli-degrees) to degrees.
pub fn normalize_temp(raw: &str) -> Option<f32> {
    let mut value: f32 = raw.lines().next()?.trim().parse().ok()?;
    if value > 1000.0 {
        value /= 1000.0;
    }
    TEMP_RANGE_C.contains(&value).then_some(value)
}

impl SystemAccess {
    /// Reads an integer file.
    pub async fn read_i64(&self, path: &str) -> Option<i64> {
        parse_i64(&self.read_path(path).await?)
    }

    /// Reads a micro-unit counter, scaled to milli-units and range-checked.
    pub async fn read_milli(&self, path: &str, range: &RangeInclusive<i64>) -> Option<i64> {
        scale_milli(&self.read_path(path).await?, range)
    }

    /// Battery current in mA (signed, negative while discharging on most
    /// devices).
    pub async fn read_battery_current_ma(&self, supply: &str) -> Option<i64> {
        let raw = self.read_i64(&format!("{}/current_now", supply)).await?;
        Some(raw / 1000)
    }

    /// Battery voltage in mV.
    pub async fn read_battery_voltage_mv(&self, supply: &str) -> Option<i64> {
        self.read_milli(&format!("{}/voltage_now", supply), &(1..=100_000))
            .await
    }

    /// Design capacity in mAh.
    pub async fn read_design_capacity(&self, supply: &str) -> Option<i64> {
        self.read_milli(&format!("{}/charge_full_design", supply), &CAPACITY_RANGE_MAH)
            .await
    }

    /// Last full-charge capacity in mAh.
    pub async fn read_actual_capacity(&self, supply: &str) -> Option<i64> {
        self.read_milli(&format!("{}/charge_full", supply), &CAPACITY_RANGE_MAH)
            .await
    }

    /// Charge cycle count.
    pub async fn read_cycle_count(&self, supply: &str) -> Option<i64> {
        let cycles = self.read_i64(&format!("{}/cycle_count", supply)).await?;
        (cycles >= 0).then_some(cycles)
    }

    /// Battery chemistry, e.g. "Li-ion".
    pub async fn read_battery_technology(&self, supply: &str) -> Option<String> {
        self.read_path(&format!("{}/technology", supply)).await
    }

    /// Real health as actual over design capacity, in percent.
    pub async fn read_real_health_pct(&self, supply: &str) -> Option<i64> {
        let actual = self.read_actual_capacity(supply).await?;
        let design = self.read_design_capacity(supply).await?;
        let pct = actual * 100 / design;
        HEALTH_RANGE_PCT.contains(&pct).then_some(pct)
    }

    /// CPU temperature from the first thermal zone with a plausible value.
    pub async fn read_cpu_temp(&self) -> Option<f32> {
        for path in THERMAL_ZONES {
            if let Some(temp) = self
                .read_path(path)
                .await
                .as_deref()
                .and_then(normalize_temp)
            {
                return Some(temp);
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::facade::tests::{unprivileged_config, SpySource};

    #[test]
    fn test_scale_milli() {
        assert_eq!(scale_milli("4100000", &CAPACITY_RANGE_MAH), Some(4100));
        assert_eq!(scale_milli("0", &CAPACITY_RANGE_MAH), None);
        assert_eq!(scale_milli("123456789000", &CAPACITY_RANGE_MAH), None);
        assert_eq!(scale_milli("garbage", &CAPACITY_RANGE_MAH), None);
    }

    #[test]
    fn test_normalize_temp() {
        assert_eq!(normalize_temp("45000"), Some(45.0));
        assert_eq!(normalize_temp("38.5"), Some(38.5));
        assert_eq!(normalize_temp("0"), None);
        assert_eq!(normalize_temp("200000"), None);
        assert_eq!(normalize_temp("-"), None);
    }

    #[tokio::test]
    async fn test_battery_readers() {
        let supply = "/sys/class/power_supply/battery";
        let spy = SpySource::with(&[
            ("/sys/class/power_supply/battery/current_now", "-1250000"),
            ("/sys/class/power_supply/battery/charge_full_design", "5000000"),
            ("/sys/class/power_supply/battery/charge_full", "4500000"),
            ("/sys/class/power_supply/battery/cycle_count", "312"),
            ("/sys/class/power_supply/battery/technology", "Li-poly"),
        ]);
        let access = SystemAccess::with_file_source(&unprivileged_config(), spy, None);

        assert_eq!(access.read_battery_current_ma(supply).await, Some(-1250));
        assert_eq!(access.read_design_capacity(supply).await, Some(5000));
        assert_eq!(access.read_actual_capacity(supply).await, Some(4500));
        assert_eq!(access.read_real_health_pct(supply).await, Some(90));
        assert_eq!(access.read_cycle_count(supply).await, Some(312));
        assert_eq!(
            access.read_battery_technology(supply).await.as_deref(),
            Some("Li-poly")
        );
    }

    #[tokio::test]
    async fn test_corrupt_capacity_is_unavailable() {
        let supply = "/bat";
        let spy = SpySource::with(&[
            ("/bat/charge_full_design", "999999999999"),
            ("/bat/charge_full", "4500000"),
            ("/bat/cycle_count", "-1"),
        ]);
        let access = SystemAccess::with_file_source(&unprivileged_config(), spy, None);
        assert_eq!(access.read_design_capacity(supply).await, None);
        assert_eq!(access.read_real_health_pct(supply).await, None);
        assert_eq!(access.read_cycle_count(supply).await, None);
    }

    #[tokio::test]
    async fn test_cpu_temp_skips_implausible_zone() {
        let spy = SpySource::with(&[
            (THERMAL_ZONES[0], "0"),
            (THERMAL_ZONES[1], "52300"),
        ]);
        let access = SystemAccess::with_file_source(&unprivileged_config(), spy, None);
        assert_eq!(access.read_cpu_temp().await, Some(52.3));
    }
}
