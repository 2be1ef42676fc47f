//! Integration tests for the polling interval ladder
//!
//! Tests cover:
//! - Cold-start interval assignment for a mixed card
//! - Threshold crossings and interval monotonicity
//! - Exact boundary behavior at 5 and 65 minutes
//! - Failure backoff growth and cap

use raceday_ingest::scheduler::{backoff_delay, polling_interval};
use raceday_ingest::types::domain::RaceStatus;
use std::time::Duration;

/// Cold start with three upcoming races at +20m, +10m, +3m creates timers
/// at 150s, 60s and 30s.
#[test]
fn test_cold_start_interval_assignment() {
    let offsets_and_expected = [
        (20.0, 150_000u64),
        (10.0, 60_000),
        (3.0, 30_000),
    ];
    for (minutes, expected_ms) in offsets_and_expected {
        let interval = polling_interval(RaceStatus::Open, minutes, false)
            .expect("upcoming race must be scheduled");
        assert_eq!(
            interval.as_millis() as u64,
            expected_ms,
            "race at +{}m should poll every {}ms",
            minutes,
            expected_ms
        );
    }
}

/// A race observed at +6m polls at 60s; observed again at +4.9m it must have
/// tightened to 30s.
#[test]
fn test_threshold_cross_tightens_interval() {
    let before = polling_interval(RaceStatus::Open, 6.0, false).unwrap();
    let after = polling_interval(RaceStatus::Open, 4.9, false).unwrap();
    assert_eq!(before, Duration::from_secs(60));
    assert_eq!(after, Duration::from_secs(30));
    assert!(after < before, "crossing the 5-minute threshold must tighten");
}

/// Exact boundary pins: 5.00 is critical, 65.00 is active, 65.01 is baseline.
#[test]
fn test_exact_boundaries() {
    assert_eq!(
        polling_interval(RaceStatus::Open, 5.00, false),
        Some(Duration::from_secs(30))
    );
    assert_eq!(
        polling_interval(RaceStatus::Open, 65.00, false),
        Some(Duration::from_secs(150))
    );
    assert_eq!(
        polling_interval(RaceStatus::Open, 65.01, false),
        Some(Duration::from_secs(1800))
    );
}

/// For any race approaching its start, the next interval is never longer
/// than the previous one (or the race is removed).
#[test]
fn test_interval_monotonicity_down_the_ladder() {
    let minutes_sequence = [
        300.0, 120.0, 66.0, 65.0, 64.9, 40.0, 11.0, 10.0, 9.9, 6.0, 5.0, 4.9, 2.0, 0.5, 0.0, -0.5,
    ];
    let mut previous = Duration::MAX;
    for minutes in minutes_sequence {
        let interval =
            polling_interval(RaceStatus::Open, minutes, false).expect("race still active");
        assert!(
            interval <= previous,
            "interval must not grow while approaching start (at {} min: {:?} > {:?})",
            minutes,
            interval,
            previous
        );
        previous = interval;
    }
}

/// A status transition to a terminal value removes the race from the
/// schedule regardless of proximity.
#[test]
fn test_terminal_transition_cancels_scheduling() {
    assert!(polling_interval(RaceStatus::Closed, 0.0, false).is_some());
    assert_eq!(polling_interval(RaceStatus::Final, 0.0, false), None);
    assert_eq!(polling_interval(RaceStatus::Abandoned, 12.0, false), None);
}

/// Critical lifecycle statuses poll at 30s even when the start time is far
/// away (late scratchings, delayed starts).
#[test]
fn test_critical_status_overrides_proximity() {
    for status in [RaceStatus::Closed, RaceStatus::Interim] {
        assert_eq!(
            polling_interval(status, 500.0, false),
            Some(Duration::from_secs(30))
        );
    }
}

/// The doubleFrequency flag halves every band.
#[test]
fn test_double_frequency_halves_all_bands() {
    let bands = [(120.0, 900), (20.0, 75), (10.0, 30), (3.0, 15)];
    for (minutes, expected_secs) in bands {
        assert_eq!(
            polling_interval(RaceStatus::Open, minutes, true),
            Some(Duration::from_secs(expected_secs))
        );
    }
}

/// Backoff after consecutive failures: min(5s * 2^n, 2min), reset handled by
/// the timer loop.
#[test]
fn test_failure_backoff_growth_and_cap() {
    assert_eq!(backoff_delay(1), Duration::from_secs(5));
    assert_eq!(backoff_delay(2), Duration::from_secs(10));
    assert_eq!(backoff_delay(4), Duration::from_secs(40));
    assert_eq!(backoff_delay(6), Duration::from_secs(120));
    // far past the cap, still capped
    assert_eq!(backoff_delay(30), Duration::from_secs(120));
}
