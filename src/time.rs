//! Time helpers with minute precision.
//!
//! Page creation and access times are tracked as whole minutes since the
//! Unix epoch, which keeps the persisted statistics compact (a `u32` holds
//! values until well past year 9000) and matches the granularity the
//! frequency-of-use statistic is computed at.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as whole minutes since the Unix epoch.
pub fn current_time_minutes() -> u32 {
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis())
        .unwrap_or(0);
    millis_to_minutes(millis as u64)
}

/// Current time as milliseconds since the Unix epoch.
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Convert milliseconds since the Unix epoch to whole minutes.
pub fn millis_to_minutes(millis: u64) -> u32 {
    (millis / 1000 / 60) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn millis_to_minutes_truncates() {
        assert_eq!(millis_to_minutes(0), 0);
        assert_eq!(millis_to_minutes(59_999), 0);
        assert_eq!(millis_to_minutes(60_000), 1);
        assert_eq!(millis_to_minutes(61_000), 1);
        assert_eq!(millis_to_minutes(120_000), 2);
    }

    #[test]
    fn current_time_minutes_is_recent() {
        // Sanity check: sometime after 2020-01-01 (26_297_280 minutes).
        let now = current_time_minutes();
        assert!(now > 26_297_280);
    }
}
