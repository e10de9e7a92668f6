//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Reconnection timing and timestamp helpers."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use chrono::{DateTime, SecondsFormat, Utc};

/// True when no attempt has been made yet or `delay` has elapsed since the last one.
pub fn is_due(last: Option<Instant>, now: Instant, delay: Duration) -> bool {
    match last {
        None => true,
        Some(last) => now.saturating_duration_since(last) >= delay,
    }
}

/// Convert a duration into milliseconds, saturating at `u64::MAX`.
pub fn duration_to_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Canonical timestamp rendering used in persisted files.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn first_attempt_is_always_due() {
        let now = Instant::now();
        assert!(is_due(None, now, Duration::from_secs(60)));
        assert!(!is_due(Some(now), now, Duration::from_secs(5)));
        assert!(is_due(
            Some(now),
            now + Duration::from_secs(5),
            Duration::from_secs(5)
        ));
    }

    #[test]
    fn timestamps_render_with_millis() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).unwrap();
        assert_eq!(format_timestamp(&ts), "2024-03-01T12:30:00.000Z");
    }
}
