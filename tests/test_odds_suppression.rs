//! Integration tests for odds change suppression
//!
//! Tests cover:
//! - Identical consecutive ticks insert exactly once
//! - The minimum-change threshold against the last accepted value
//! - Candidate generation from a transformed entrant set

use chrono::{TimeZone, Utc};
use itertools::Itertools;
use raceday_ingest::odds_detector::{candidates_from_entrants, OddsChangeDetector};
use raceday_ingest::transform::{transform_race, TransformContext};
use raceday_ingest::types::domain::OddsType;
use raceday_ingest::types::upstream::RaceEventPayload;
use serde_json::json;
use std::collections::HashMap;

fn tick_payload(fixed_win: f64) -> RaceEventPayload {
    serde_json::from_value(json!({
        "race": {
            "id": "R1",
            "name": "Twilight Trot",
            "start_time": "2025-10-12T01:30:00Z",
            "status": "open"
        },
        "meeting": "M1",
        "entrants": [
            {"id": "E1", "name": "Fast Horse", "runner_number": 1,
             "odds": {"fixed_win": fixed_win, "fixed_place": 1.6}}
        ]
    }))
    .unwrap()
}

fn context() -> TransformContext {
    TransformContext {
        now: Utc.with_ymd_and_hms(2025, 10, 12, 1, 10, 0).unwrap(),
        zone: chrono_tz::Pacific::Auckland,
        previous_buckets: HashMap::new(),
    }
}

/// Two consecutive ticks both delivering fixed_win = 3.50 for the same
/// entrant append exactly one odds_history row.
#[test]
fn test_identical_ticks_insert_once() {
    let detector = OddsChangeDetector::new(0.01);
    let ctx = context();

    let mut inserted_per_tick = Vec::new();
    for _ in 0..2 {
        let transformed = transform_race(&tick_payload(3.50), &ctx).unwrap();
        let candidates = candidates_from_entrants(&transformed.entrants, ctx.now);
        let accepted = detector.filter_records(candidates);
        inserted_per_tick.push(
            accepted
                .iter()
                .filter(|r| r.odds_type == OddsType::FixedWin)
                .count(),
        );
    }
    assert_eq!(inserted_per_tick, vec![1, 0]);
}

/// A full unchanged-payload pass produces zero new odds rows across every
/// flavour, not just fixed win.
#[test]
fn test_unchanged_payload_produces_zero_odds_rows() {
    let detector = OddsChangeDetector::new(0.01);
    let ctx = context();

    let transformed = transform_race(&tick_payload(3.50), &ctx).unwrap();
    let first = detector.filter_records(candidates_from_entrants(&transformed.entrants, ctx.now));
    assert_eq!(first.len(), 2); // fixed_win + fixed_place

    let again = transform_race(&tick_payload(3.50), &ctx).unwrap();
    let second = detector.filter_records(candidates_from_entrants(&again.entrants, ctx.now));
    assert!(second.is_empty());
}

/// A move larger than the minimum change breaks through; the accepted value
/// becomes the new reference.
#[test]
fn test_threshold_uses_last_accepted_value() {
    let detector = OddsChangeDetector::new(0.01);
    let ctx = context();

    let movements = [3.50, 3.50, 3.55, 3.555, 3.60];
    let accepted: Vec<f64> = movements
        .iter()
        .filter_map(|odds| {
            let transformed = transform_race(&tick_payload(*odds), &ctx).unwrap();
            let records =
                detector.filter_records(candidates_from_entrants(&transformed.entrants, ctx.now));
            records
                .iter()
                .find(|r| r.odds_type == OddsType::FixedWin)
                .map(|r| r.odds)
        })
        .collect();

    assert_eq!(accepted, vec![3.50, 3.55, 3.60]);
}

/// Candidate keys are distinct per entrant and flavour across a card.
#[test]
fn test_candidate_keys_are_unique_per_entrant_flavour() {
    let payload: RaceEventPayload = serde_json::from_value(json!({
        "race": {
            "id": "R1",
            "name": "Feature Mile",
            "start_time": "2025-10-12T01:30:00Z",
            "status": "open"
        },
        "meeting": "M1",
        "entrants": [
            {"id": "E1", "name": "One", "runner_number": 1,
             "odds": {"fixed_win": 2.0, "fixed_place": 1.2, "pool_win": 2.1, "pool_place": 1.3}},
            {"id": "E2", "name": "Two", "runner_number": 2,
             "odds": {"fixed_win": 5.0, "fixed_place": 1.9, "pool_win": 5.2, "pool_place": 2.0}}
        ]
    }))
    .unwrap();

    let transformed = transform_race(&payload, &context()).unwrap();
    let candidates = candidates_from_entrants(&transformed.entrants, Utc::now());
    assert_eq!(candidates.len(), 8);

    let unique_keys = candidates.iter().map(|c| c.cache_key()).unique().count();
    assert_eq!(unique_keys, 8);
}
