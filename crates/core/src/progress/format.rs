//! Human-readable formatting for progress messages.

/// Formats a byte count with binary units, e.g. `1.5 GB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

/// Formats a rate in bytes per second, e.g. `12.3 MB/s`.
pub fn format_rate(bytes_per_sec: f64) -> String {
    format!("{}/s", format_bytes(bytes_per_sec.max(0.0) as u64))
}

/// Formats a remaining duration as `45s`, `2m 30s` or `1h 5m`.
pub fn format_eta(secs: u64) -> String {
    if secs < 60 {
        format!("{}s", secs)
    } else if secs < 3600 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else {
        format!("{}h {}m", secs / 3600, (secs % 3600) / 60)
    }
}

/// Seconds left at the given rate, if it can be estimated.
pub fn eta_secs(bytes_done: u64, bytes_total: u64, rate: Option<f64>) -> Option<u64> {
    let rate = rate.filter(|r| *r > 0.0)?;
    let remaining = bytes_total.checked_sub(bytes_done)?;
    Some((remaining as f64 / rate).ceil() as u64)
}
