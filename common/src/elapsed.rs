//! Compact human formatting for elapsed wall-clock time.

use std::time::Duration;

/// Format a duration as `850ms`, `4.2s`, or `1m32s`.
pub fn format_duration(duration: Duration) -> String {
    format_seconds(duration.as_secs_f64())
}

/// Format fractional seconds the same way as [`format_duration`].
pub fn format_seconds(seconds: f64) -> String {
    if seconds < 1.0 {
        format!("{:.0}ms", seconds * 1000.0)
    } else if seconds < 60.0 {
        format!("{seconds:.1}s")
    } else {
        let whole = seconds as u64;
        format!("{}m{:02}s", whole / 60, whole % 60)
    }
}
