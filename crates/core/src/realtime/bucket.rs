//! Timeframe bucketing of capture times.

use chrono::{DateTime, FixedOffset, NaiveDateTime, Offset, Timelike, Utc};

/// Supported timeframes in minutes, largest first.
pub const TIMEFRAMES: [u32; 7] = [240, 120, 60, 30, 15, 5, 1];

/// Largest timeframe that evenly divides `minutes_since_midnight`.
pub fn timeframe_bucket(minutes_since_midnight: u32) -> u32 {
    TIMEFRAMES
        .iter()
        .copied()
        .find(|tf| minutes_since_midnight % tf == 0)
        .unwrap_or(1)
}

/// `now` in the market's clock, floored to the minute.
pub fn capture_time(now: DateTime<Utc>, utc_offset_minutes: i32) -> NaiveDateTime {
    let offset = FixedOffset::east_opt(utc_offset_minutes * 60).unwrap_or_else(|| Utc.fix());
    let local = now.with_timezone(&offset).naive_local();
    local
        .date()
        .and_hms_opt(local.hour(), local.minute(), 0)
        .unwrap_or(local)
}

/// Minutes since local midnight of a capture time.
pub fn minutes_since_midnight(captured_at: NaiveDateTime) -> u32 {
    captured_at.hour() * 60 + captured_at.minute()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timeframe_bucket() {
        assert_eq!(timeframe_bucket(0), 240);
        assert_eq!(timeframe_bucket(15), 15);
        assert_eq!(timeframe_bucket(17), 1);
        assert_eq!(timeframe_bucket(60), 60);
        assert_eq!(timeframe_bucket(120), 120);
        assert_eq!(timeframe_bucket(480), 240);
        assert_eq!(timeframe_bucket(540), 60);
        assert_eq!(timeframe_bucket(545), 5);
        assert_eq!(timeframe_bucket(570), 30);
    }

    #[test]
    fn test_capture_time_floors_and_shifts() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 1, 17, 42).unwrap();
        let captured = capture_time(now, 8 * 60);
        assert_eq!(captured.to_string(), "2024-03-01 09:17:00");
        assert_eq!(minutes_since_midnight(captured), 557);
    }

    #[test]
    fn test_capture_time_crosses_midnight() {
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 20, 0, 5).unwrap();
        let captured = capture_time(now, 8 * 60);
        assert_eq!(captured.to_string(), "2024-03-02 04:00:00");
        assert_eq!(timeframe_bucket(minutes_since_midnight(captured)), 240);
    }
}
