//! Trailing export-window computation.
//!
//! The request cycle always asks the recorder for the most recent
//! fully-recorded 10-minute window. Windows are aligned to a fixed
//! 10-minute grid so that repeated invocations with scheduling jitter
//! still produce the same sequence of non-overlapping windows.

use chrono::{DateTime, FixedOffset, Utc};

/// Width of one export window, in seconds.
pub const WINDOW_SECS: i64 = 600;

/// How far behind real time the requested window trails, in seconds.
///
/// The recorder needs a couple of minutes before all segments covering a
/// time range are flushed to disk; trailing by 12 minutes keeps the
/// grid-aligned window at least 2 minutes in the past.
const SAFETY_DELAY_SECS: i64 = 720;

/// Half-open `[start, end)` range in epoch seconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: i64,
    pub end: i64,
}

impl TimeWindow {
    /// Window width in seconds.
    pub fn duration_secs(&self) -> i64 {
        self.end - self.start
    }
}

/// Computes the trailing export window on a fixed 10-minute grid.
#[derive(Debug, Clone)]
pub struct TimeWindower {
    zone: FixedOffset,
}

impl TimeWindower {
    /// `zone` is the fixed-offset zone the recorder operates in; the
    /// 10-minute grid is aligned to that zone's wall clock.
    pub fn new(zone: FixedOffset) -> Self {
        Self { zone }
    }

    /// The most recent grid-aligned window that closed at least two
    /// minutes before `now`.
    ///
    /// Subtracts the safety delay, truncates down to the nearest
    /// 10-minute boundary of the zone's wall clock, and returns the
    /// 10-minute window starting there.
    pub fn compute_window(&self, now: DateTime<Utc>) -> TimeWindow {
        let offset = i64::from(self.zone.local_minus_utc());
        let local = now.timestamp() - SAFETY_DELAY_SECS + offset;
        let start = local - local.rem_euclid(WINDOW_SECS) - offset;

        TimeWindow {
            start,
            end: start + WINDOW_SECS,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn ist() -> FixedOffset {
        FixedOffset::east_opt(330 * 60).unwrap()
    }

    #[test]
    fn test_window_is_ten_minutes_wide() {
        let windower = TimeWindower::new(ist());
        let now = Utc.with_ymd_and_hms(2025, 10, 11, 16, 7, 33).unwrap();

        let window = windower.compute_window(now);
        assert_eq!(window.duration_secs(), 600);
    }

    #[test]
    fn test_window_is_grid_aligned() {
        let windower = TimeWindower::new(ist());

        for second in [0, 17, 59, 119, 599] {
            let now = Utc.with_ymd_and_hms(2025, 10, 11, 16, 0, 0).unwrap()
                + chrono::Duration::seconds(second);
            let window = windower.compute_window(now);

            let start_local = Utc
                .timestamp_opt(window.start, 0)
                .unwrap()
                .with_timezone(&ist());
            assert_eq!(start_local.minute() % 10, 0, "minute grid at +{second}s");
            assert_eq!(start_local.second(), 0);
        }
    }

    #[test]
    fn test_window_trails_now_by_at_least_two_minutes() {
        let windower = TimeWindower::new(ist());

        for minute in 0..60 {
            let now = Utc.with_ymd_and_hms(2025, 10, 11, 8, minute, 42).unwrap();
            let window = windower.compute_window(now);
            assert!(
                window.end <= now.timestamp() - 120,
                "window must close >=2min before now at minute {minute}"
            );
        }
    }

    #[test]
    fn test_jittered_invocations_agree_on_the_window() {
        let windower = TimeWindower::new(ist());
        let slot = Utc.with_ymd_and_hms(2025, 10, 11, 16, 2, 0).unwrap();

        let on_time = windower.compute_window(slot);
        let late = windower.compute_window(slot + chrono::Duration::seconds(95));
        assert_eq!(on_time, late);
    }

    #[test]
    fn test_consecutive_slots_produce_adjacent_windows() {
        let windower = TimeWindower::new(ist());
        let first = windower.compute_window(Utc.with_ymd_and_hms(2025, 10, 11, 16, 2, 0).unwrap());
        let second = windower.compute_window(Utc.with_ymd_and_hms(2025, 10, 11, 16, 12, 0).unwrap());

        assert_eq!(first.end, second.start);
    }
}
