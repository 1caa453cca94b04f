//! Time utility functions
//!
//! The store keeps all timestamps as milliseconds since the Unix epoch.
//! Retry metadata carries durations as compact strings (`100ms`, `1s`,
//! `5m`, `1h`); this module owns that grammar.

use std::time::Duration;

use chrono::{DateTime, Utc};

/// Current time as milliseconds since the Unix epoch
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Convert milliseconds since Unix epoch to DateTime<Utc>
pub fn ms_to_datetime(ms: i64) -> DateTime<Utc> {
    DateTime::from_timestamp_millis(ms).unwrap_or_else(|| {
        tracing::warn!(ms, "Invalid timestamp, using epoch");
        DateTime::UNIX_EPOCH
    })
}

/// Parse an RFC 3339 timestamp into epoch milliseconds
pub fn parse_rfc3339_ms(ts: &str) -> Option<i64> {
    DateTime::parse_from_rfc3339(ts)
        .ok()
        .map(|dt| dt.with_timezone(&Utc).timestamp_millis())
}

/// Parse a duration string: integer value followed by `ms`, `s`, `m`, or `h`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    let split = s.find(|c: char| !c.is_ascii_digit())?;
    let (value, unit) = s.split_at(split);
    let value: u64 = value.parse().ok()?;
    match unit {
        "ms" => Some(Duration::from_millis(value)),
        "s" => Some(Duration::from_secs(value)),
        "m" => Some(Duration::from_secs(value * 60)),
        "h" => Some(Duration::from_secs(value * 3600)),
        _ => None,
    }
}

/// Format a duration in the same grammar `parse_duration` accepts
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 3_600_000 == 0 && ms > 0 {
        format!("{}h", ms / 3_600_000)
    } else if ms % 60_000 == 0 && ms > 0 {
        format!("{}m", ms / 60_000)
    } else if ms % 1000 == 0 {
        format!("{}s", ms / 1000)
    } else {
        format!("{}ms", ms)
    }
}
