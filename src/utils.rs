//! Shared helpers: the identity and clock primitives used across the
//! engine, plus host probes recorded in reports.

use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

/// Generate a unique transport address
///
/// Creates a UUID v4 string used to name messenger endpoints, so
/// concurrently started processes never collide.
pub fn generate_address() -> String {
    Uuid::new_v4().to_string()
}

/// Current time as milliseconds since the Unix epoch
///
/// Transaction timestamps and round windows all use this clock. If the
/// system time is before the epoch, returns 0 rather than panicking.
pub fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Total system memory in gigabytes, for report metadata
///
/// Reads `/proc/meminfo` where available and returns 0.0 when the total
/// cannot be determined.
pub fn detect_memory_gb() -> f64 {
    detect_memory_kb().map_or(0.0, |kb| kb as f64 / (1024.0 * 1024.0))
}

fn detect_memory_kb() -> Option<u64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let line = meminfo.lines().find(|line| line.starts_with("MemTotal:"))?;
    line.split_whitespace().nth(1)?.parse().ok()
}
