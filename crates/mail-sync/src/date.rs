//! Millisecond timestamps and the day arithmetic used by sync windows
//!
//! Every date in the engine is milliseconds since the UNIX epoch (UTC).
//! Sync windows are quantized to whole UTC days because servers only search
//! with day granularity.

use chrono::{DateTime, NaiveTime, Utc};

pub const HOUR_MILLIS: i64 = 60 * 60 * 1000;
pub const DAY_MILLIS: i64 = 24 * HOUR_MILLIS;

/// 1990-01-01T00:00:00Z. Nothing older than this is ever synced; reaching it
/// means the folder has been backfilled completely.
pub const OLDEST_SYNC_DATE: i64 = 631_152_000_000;

/// Current time in milliseconds
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Truncate a timestamp to midnight UTC of its day
pub fn quantize_date(ts: i64) -> i64 {
    match DateTime::<Utc>::from_timestamp_millis(ts) {
        Some(dt) => dt
            .date_naive()
            .and_time(NaiveTime::MIN)
            .and_utc()
            .timestamp_millis(),
        None => ts - ts.rem_euclid(DAY_MILLIS),
    }
}

/// Quantized midnight `days` days before `ts`
pub fn make_days_before(ts: i64, days: i64) -> i64 {
    quantize_date(ts - days * DAY_MILLIS)
}

/// Quantized midnight `days` days before `now`
pub fn make_days_ago(now: i64, days: i64) -> i64 {
    make_days_before(now, days)
}

/// Start of tomorrow (UTC), the effective end of an open-ended window
pub fn tomorrow(now: i64) -> i64 {
    quantize_date(now + DAY_MILLIS)
}

/// Whole days between two timestamps, rounded to the nearest day
pub fn days_between(start: i64, end: i64) -> i64 {
    ((end - start) as f64 / DAY_MILLIS as f64).round() as i64
}

/// A sync window `[start, end)`. A missing bound leaves that side open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DateWindow {
    pub start: Option<i64>,
    pub end: Option<i64>,
}

impl DateWindow {
    pub fn new(start: Option<i64>, end: Option<i64>) -> Self {
        Self { start, end }
    }

    /// `[start, end)` with both bounds set
    pub fn between(start: i64, end: i64) -> Self {
        Self::new(Some(start), Some(end))
    }

    /// Everything from `start` up to now
    pub fn since(start: i64) -> Self {
        Self::new(Some(start), None)
    }

    /// Start bound, with an open start meaning the oldest syncable date
    pub fn effective_start(&self) -> i64 {
        self.start.unwrap_or(OLDEST_SYNC_DATE)
    }

    /// End bound, with an open end meaning the start of tomorrow
    pub fn effective_end(&self, now: i64) -> i64 {
        self.end.unwrap_or_else(|| tomorrow(now))
    }

    pub fn contains(&self, ts: i64) -> bool {
        self.start.is_none_or(|start| ts >= start) && self.end.is_none_or(|end| ts < end)
    }

    /// Whole days the window spans, rounded
    pub fn days(&self, now: i64) -> i64 {
        days_between(self.effective_start(), self.effective_end(now))
    }
}

impl std::fmt::Display for DateWindow {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let fmt_bound = |ts: Option<i64>| match ts.and_then(DateTime::<Utc>::from_timestamp_millis) {
            Some(dt) => dt.format("%Y-%m-%d").to_string(),
            None => "open".to_string(),
        };
        write!(f, "[{}, {})", fmt_bound(self.start), fmt_bound(self.end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_oldest_sync_date_is_1990() {
        let expected = Utc.with_ymd_and_hms(1990, 1, 1, 0, 0, 0).unwrap();
        assert_eq!(OLDEST_SYNC_DATE, expected.timestamp_millis());
    }

    #[test]
    fn test_quantize_date_truncates_to_midnight() {
        let noon = Utc.with_ymd_and_hms(2024, 3, 9, 12, 34, 56).unwrap();
        let midnight = Utc.with_ymd_and_hms(2024, 3, 9, 0, 0, 0).unwrap();
        assert_eq!(
            quantize_date(noon.timestamp_millis()),
            midnight.timestamp_millis()
        );
        assert_eq!(
            quantize_date(midnight.timestamp_millis()),
            midnight.timestamp_millis()
        );
    }

    #[test]
    fn test_make_days_before() {
        let ts = Utc.with_ymd_and_hms(2024, 3, 9, 18, 0, 0).unwrap();
        let expected = Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap();
        assert_eq!(
            make_days_before(ts.timestamp_millis(), 3),
            expected.timestamp_millis()
        );
    }

    #[test]
    fn test_days_between_rounds() {
        assert_eq!(days_between(0, DAY_MILLIS * 2), 2);
        assert_eq!(days_between(0, DAY_MILLIS * 2 + HOUR_MILLIS), 2);
        assert_eq!(days_between(0, DAY_MILLIS * 2 + 13 * HOUR_MILLIS), 3);
    }

    #[test]
    fn test_tomorrow_is_after_now() {
        let now = now_ms();
        let t = tomorrow(now);
        assert!(t > now);
        assert!(t - now <= DAY_MILLIS);
    }

    #[test]
    fn test_date_window_bounds() {
        let now = Utc.with_ymd_and_hms(2024, 3, 9, 18, 0, 0).unwrap().timestamp_millis();
        let open = DateWindow::default();
        assert_eq!(open.effective_start(), OLDEST_SYNC_DATE);
        assert_eq!(open.effective_end(now), tomorrow(now));

        let window = DateWindow::between(1_000, 2_000);
        assert!(window.contains(1_000));
        assert!(!window.contains(2_000));
        assert!(DateWindow::since(5).contains(i64::MAX));
    }

    #[test]
    fn test_date_window_display() {
        let start = Utc.with_ymd_and_hms(2024, 3, 6, 0, 0, 0).unwrap().timestamp_millis();
        assert_eq!(DateWindow::since(start).to_string(), "[2024-03-06, open)");
    }
}
