//! Human-readable formatting of readout values.

use crate::snapshot::UNAVAILABLE;

/// Formats a duration in milliseconds (e.g., "2d 3h", "4m 10s").
pub fn duration(ms: u64) -> String {
    let s = ms / 1000;
    let m = s / 60;
    let h = m / 60;
    let d = h / 24;
    if d > 0 {
        format!("{}d {}h", d, h % 24)
    } else if h > 0 {
        format!("{}h {}m", h, m % 60)
    } else if m > 0 {
        format!("{}m {}s", m, s % 60)
    } else {
        format!("{}s", s)
    }
}

/// Formats a fractional hour count (e.g., "3h 20m").
pub fn hours(hrs: f64) -> String {
    let hrs = hrs.max(0.0);
    let d = (hrs / 24.0) as u64;
    let h = (hrs % 24.0) as u64;
    let m = ((hrs * 60.0) % 60.0) as u64;
    if d > 0 {
        format!("{}d {}h", d, h)
    } else if h > 0 {
        format!("{}h {}m", h, m)
    } else {
        format!("{}m", m)
    }
}

/// Formats a byte count with binary units.
pub fn bytes(b: i64) -> String {
    let b = b.max(0) as f64;
    if b < 1024.0 {
        format!("{} B", b as u64)
    } else if b < 1024.0 * 1024.0 {
        format!("{:.1} KB", b / 1024.0)
    } else if b < 1024.0 * 1024.0 * 1024.0 {
        format!("{:.1} MB", b / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", b / (1024.0 * 1024.0 * 1024.0))
    }
}

/// Formats a byte rate.
pub fn speed(bytes_per_sec: f64) -> String {
    let bps = bytes_per_sec.max(0.0);
    if bps < 1024.0 {
        format!("{} B/s", bps as u64)
    } else if bps < 1024.0 * 1024.0 {
        format!("{:.1} KB/s", bps / 1024.0)
    } else {
        format!("{:.1} MB/s", bps / (1024.0 * 1024.0))
    }
}

pub fn pct(p: Option<f64>) -> String {
    match p {
        Some(p) if p.is_finite() => format!("{:.1}%", p),
        _ => UNAVAILABLE.to_string(),
    }
}

pub fn temp(celsius: Option<f64>) -> String {
    match celsius {
        Some(c) if c.is_finite() => format!("{:.1}°C", c),
        _ => UNAVAILABLE.to_string(),
    }
}

/// Formats an optional value, or the placeholder.
pub fn or_unavailable<T>(value: Option<T>, f: impl FnOnce(T) -> String) -> String {
    value.map(f).unwrap_or_else(|| UNAVAILABLE.to_string())
}
