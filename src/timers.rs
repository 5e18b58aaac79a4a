use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SleepCountdown {
    pub remaining_seconds: i64,
    pub expiring: bool,
    pub expired: bool,
    pub display: String,
}

pub fn elapsed_seconds(start: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - start).num_seconds().max(0)
}

/// Countdown for a sleep that started at `sleep_time` with a cap of `max_minutes`.
pub fn sleep_countdown(
    sleep_time: DateTime<Utc>,
    now: DateTime<Utc>,
    max_minutes: i64,
    warn_seconds: i64,
) -> SleepCountdown {
    let remaining = (max_minutes * 60 - elapsed_seconds(sleep_time, now)).max(0);
    SleepCountdown {
        remaining_seconds: remaining,
        expiring: remaining > 0 && remaining <= warn_seconds,
        expired: remaining == 0,
        display: format_mm_ss(remaining),
    }
}

pub fn sleep_expired(sleep_time: DateTime<Utc>, now: DateTime<Utc>, max_minutes: i64) -> bool {
    elapsed_seconds(sleep_time, now) >= max_minutes * 60
}

/// Remaining hour-pass time for a checked-in session.
pub fn usage_remaining_seconds(
    session_start: DateTime<Utc>,
    now: DateTime<Utc>,
    allotted_minutes: i64,
) -> i64 {
    (allotted_minutes * 60 - elapsed_seconds(session_start, now)).max(0)
}

pub fn format_mm_ss(total_seconds: i64) -> String {
    let s = total_seconds.max(0);
    format!("{:02}:{:02}", s / 60, s % 60)
}

pub fn format_hh_mm_ss(total_seconds: i64) -> String {
    let s = total_seconds.max(0);
    format!("{:02}:{:02}:{:02}", s / 3600, (s % 3600) / 60, s % 60)
}

/// Which overlay a seat shows. Sleep wins when both records are open.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeatIndicator {
    Idle,
    Sleeping,
    Outing,
}

impl SeatIndicator {
    pub fn pick(sleeping: bool, outing: bool) -> Self {
        if sleeping {
            Self::Sleeping
        } else if outing {
            Self::Outing
        } else {
            Self::Idle
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::Sleeping => "sleeping",
            Self::Outing => "outing",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn at(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    #[test]
    fn countdown_flags_last_thirty_seconds() {
        let start = at("2026-03-02T10:00:00Z");
        let c = sleep_countdown(start, start + Duration::seconds(14 * 60 + 29), 15, 30);
        assert_eq!(c.remaining_seconds, 31);
        assert!(!c.expiring);
        assert_eq!(c.display, "00:31");

        let c = sleep_countdown(start, start + Duration::seconds(14 * 60 + 30), 15, 30);
        assert!(c.expiring);
        assert!(!c.expired);

        let c = sleep_countdown(start, start + Duration::minutes(20), 15, 30);
        assert_eq!(c.remaining_seconds, 0);
        assert!(c.expired);
        assert!(!c.expiring);
        assert_eq!(c.display, "00:00");
    }

    #[test]
    fn clock_skew_never_goes_negative() {
        let start = at("2026-03-02T10:00:00Z");
        assert_eq!(elapsed_seconds(start, start - Duration::seconds(5)), 0);
        assert_eq!(usage_remaining_seconds(start, start - Duration::seconds(5), 60), 3600);
    }

    #[test]
    fn formats_pad_to_two_digits() {
        assert_eq!(format_mm_ss(905), "15:05");
        assert_eq!(format_hh_mm_ss(3725), "01:02:05");
        assert_eq!(format_hh_mm_ss(-4), "00:00:00");
    }

    #[test]
    fn sleep_indicator_beats_outing() {
        assert_eq!(SeatIndicator::pick(true, true), SeatIndicator::Sleeping);
        assert_eq!(SeatIndicator::pick(false, true), SeatIndicator::Outing);
        assert_eq!(SeatIndicator::pick(false, false).as_str(), "idle");
    }

    #[test]
    fn expiry_is_reached_at_the_cap() {
        let start = at("2026-03-02T10:00:00Z");
        assert!(!sleep_expired(start, start + Duration::seconds(899), 15));
        assert!(sleep_expired(start, start + Duration::seconds(900), 15));
    }
}
