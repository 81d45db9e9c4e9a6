//! Clock conversion helpers.

use std::time::{Instant, SystemTime};

/// Converts a `SystemTime` (e.g. a file mtime) into an `Instant` on the
/// monotonic clock, so recency rebuilt from disk can be compared against
/// timestamps taken at runtime.
///
/// Returns `None` when the time lies further in the past than the
/// monotonic clock can represent. Timestamps in the future (clock skew,
/// copied files) clamp to now.
pub fn system_time_to_instant(time: SystemTime) -> Option<Instant> {
    let now_system = SystemTime::now();
    let now_instant = Instant::now();
    match now_system.duration_since(time) {
        Ok(elapsed) => now_instant.checked_sub(elapsed),
        Err(_) => Some(now_instant),
    }
}
