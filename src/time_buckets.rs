//! Time bucketing: DST-aware minutes-to-start and the canonical pre-start
//! ladder that aligns time-series rows across runners.
//!
//! All arithmetic happens on timezone-aware instants; the racing zone
//! (typically Pacific/Auckland) only enters when resolving calendar days.
//! There is exactly one minutes-to-start implementation in this crate.

use crate::types::domain::IntervalType;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use once_cell::sync::Lazy;

/// Canonical pre-start minute markers: five-minute steps down to 5, then
/// every minute to 0. Post-start markers continue at -1, -2, ...
pub static BUCKET_LADDER: Lazy<Vec<i32>> = Lazy::new(|| {
    let mut ladder: Vec<i32> = (1..=12).rev().map(|n| n * 5).collect(); // 60..5
    ladder.extend([4, 3, 2, 1, 0, -1]);
    ladder
});

/// Fractional minutes until the race starts. Negative once the race is off.
pub fn minutes_to_start(start_time: DateTime<Utc>, now: DateTime<Utc>) -> f64 {
    (start_time - now).num_milliseconds() as f64 / 60_000.0
}

/// Snap a minutes-to-start figure onto the ladder.
///
/// Pre-start values round up to the marker that has not yet passed: 7.2 → 10,
/// 4.2 → 5, 0.5 → 1. Beyond 60 the five-minute steps continue (65, 70, ...).
/// Post-start values floor to negative minute markers: -0.5 → -1.
pub fn snap_to_bucket(minutes: f64) -> i32 {
    if minutes > 5.0 {
        ((minutes / 5.0).ceil() * 5.0) as i32
    } else if minutes > 0.0 {
        minutes.ceil() as i32
    } else if minutes == 0.0 {
        0
    } else {
        minutes.floor() as i32
    }
}

/// The ladder marker immediately above a bucket; where the previous cycle's
/// observation for the same runner lives.
pub fn previous_bucket(bucket: i32) -> i32 {
    if bucket < 5 {
        bucket + 1
    } else {
        bucket + 5
    }
}

/// `pre` while the race has not started, `post` afterwards.
pub fn interval_type_for(minutes: f64) -> IntervalType {
    if minutes > 0.0 {
        IntervalType::Pre
    } else {
        IntervalType::Post
    }
}

/// The racing-zone calendar day an instant falls on.
pub fn racing_day(now: DateTime<Utc>, zone: Tz) -> NaiveDate {
    now.with_timezone(&zone).date_naive()
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn ladder_runs_sixty_down_through_zero() {
        assert_eq!(BUCKET_LADDER.first(), Some(&60));
        assert!(BUCKET_LADDER.windows(2).all(|w| w[0] > w[1]));
        assert!(BUCKET_LADDER.contains(&5));
        assert!(BUCKET_LADDER.contains(&1));
        assert!(BUCKET_LADDER.contains(&0));
        assert_eq!(BUCKET_LADDER.last(), Some(&-1));
    }

    #[test]
    fn buckets_snap_upward_pre_start() {
        assert_eq!(snap_to_bucket(7.2), 10);
        assert_eq!(snap_to_bucket(5.0), 5);
        assert_eq!(snap_to_bucket(5.01), 10);
        assert_eq!(snap_to_bucket(4.2), 5);
        assert_eq!(snap_to_bucket(0.5), 1);
        assert_eq!(snap_to_bucket(55.0), 55);
        assert_eq!(snap_to_bucket(62.0), 65);
    }

    #[test]
    fn buckets_floor_post_start() {
        assert_eq!(snap_to_bucket(0.0), 0);
        assert_eq!(snap_to_bucket(-0.5), -1);
        assert_eq!(snap_to_bucket(-1.0), -1);
        assert_eq!(snap_to_bucket(-1.5), -2);
    }

    #[test]
    fn previous_bucket_walks_up_the_ladder() {
        assert_eq!(previous_bucket(0), 1);
        assert_eq!(previous_bucket(4), 5);
        assert_eq!(previous_bucket(5), 10);
        assert_eq!(previous_bucket(55), 60);
        assert_eq!(previous_bucket(-1), 0);
        assert_eq!(previous_bucket(-2), -1);
    }

    #[test]
    fn minutes_to_start_is_exact_across_the_dst_gap() {
        // NZ clocks jump 02:00 -> 03:00 on 2025-09-28. A race at 03:30 local
        // observed at 01:45 local is 45 real minutes away, not 105.
        let zone = chrono_tz::Pacific::Auckland;
        let now = zone
            .with_ymd_and_hms(2025, 9, 28, 1, 45, 0)
            .unwrap()
            .with_timezone(&Utc);
        let start = zone
            .with_ymd_and_hms(2025, 9, 28, 3, 30, 0)
            .unwrap()
            .with_timezone(&Utc);
        assert!((minutes_to_start(start, now) - 45.0).abs() < 1e-9);
    }

    #[test]
    fn interval_type_flips_at_the_start_line() {
        assert_eq!(interval_type_for(0.1), IntervalType::Pre);
        assert_eq!(interval_type_for(0.0), IntervalType::Post);
        assert_eq!(interval_type_for(-3.0), IntervalType::Post);
    }
}
