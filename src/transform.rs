//! Transform Engine: per-race money-flow and pool derivation.
//!
//! Takes one validated upstream payload plus the current wall-clock and
//! produces the normalized entities and time-series records the writers
//! persist. All derivation is deterministic: the same snapshot always yields
//! the same cents, so unchanged upstream data produces zero changed rows
//! downstream.

use crate::database::race_local_fields;
use crate::time_buckets::{interval_type_for, minutes_to_start, snap_to_bucket};
use crate::time_series::PreviousBucket;
use crate::types::conversions::{dollars_to_cents, parse_barrier, percentage_of_cents};
use crate::types::domain::{Entrant, Meeting, MoneyFlowRecord, Race, RacePools, RaceStatus};
use crate::types::upstream::{Dividend, RaceEventPayload, TotePool};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Soft per-race budget. Exceeding it logs a warning, never fails the cycle.
const TRANSFORM_BUDGET: Duration = Duration::from_secs(1);

const FALLBACK_PENALTY: i16 = 10;
const UNKNOWN_PRODUCT_PENALTY: i16 = 5;
const MISSING_CORE_POOL_PENALTY: i16 = 30;

#[derive(Debug, Clone)]
pub struct TransformContext {
    pub now: DateTime<Utc>,
    pub zone: Tz,
    /// Latest persisted amounts at the previous bucket marker, keyed by
    /// entrant id. Entrants absent here are first observations (baseline).
    pub previous_buckets: HashMap<String, PreviousBucket>,
}

#[derive(Debug, Clone)]
pub struct TransformedRace {
    pub meeting: Option<Meeting>,
    pub race: Race,
    pub entrants: Vec<Entrant>,
    pub money_flow_records: Vec<MoneyFlowRecord>,
    pub race_pools: Option<RacePools>,
    pub metrics: TransformMetrics,
}

#[derive(Debug, Clone, Default)]
pub struct TransformMetrics {
    pub duration: Duration,
    pub entrant_count: usize,
    pub money_flow_count: usize,
    /// Entrants skipped by the hold/total gate this cycle.
    pub money_flow_skipped: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum PoolProduct {
    Win,
    Place,
    Quinella,
    Trifecta,
    Exacta,
    First4,
}

fn normalize_product(raw: &str) -> Option<PoolProduct> {
    let folded = raw
        .to_ascii_lowercase()
        .replace("pool", " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    match folded.as_str() {
        "win" => Some(PoolProduct::Win),
        "place" => Some(PoolProduct::Place),
        "quinella" => Some(PoolProduct::Quinella),
        "trifecta" => Some(PoolProduct::Trifecta),
        "exacta" => Some(PoolProduct::Exacta),
        "first 4" | "first4" | "first four" => Some(PoolProduct::First4),
        _ => None,
    }
}

#[derive(Debug, Clone)]
struct ExtractedPools {
    totals_cents: HashMap<PoolProduct, i64>,
    data_quality_score: i16,
    raw: serde_json::Value,
}

impl ExtractedPools {
    fn total_cents(&self, product: PoolProduct) -> i64 {
        self.totals_cents.get(&product).copied().unwrap_or(0)
    }

    fn total_race_pool(&self) -> i64 {
        self.totals_cents.values().sum()
    }
}

/// Pool extraction policy: prefer `tote_pools` (Open/Interim races); fall
/// back to `dividends` per-product maxima for finalized races. The quality
/// score starts at 100 and decays: −10 for the dividends fallback, −5 per
/// unknown product, −30 for each of Win/Place missing.
fn extract_pools(
    tote_pools: Option<&[TotePool]>,
    dividends: Option<&[Dividend]>,
) -> Result<Option<ExtractedPools>> {
    let mut totals_cents: HashMap<PoolProduct, i64> = HashMap::new();
    let mut score: i16 = 100;
    let raw: serde_json::Value;

    if let Some(pools) = tote_pools.filter(|p| !p.is_empty()) {
        for pool in pools {
            match normalize_product(&pool.product_type) {
                Some(product) => {
                    let dollars = pool.amount_dollars().unwrap_or(0.0);
                    totals_cents.insert(product, dollars_to_cents(dollars)?);
                }
                None => {
                    log::debug!("Unknown tote pool product: {}", pool.product_type);
                    score -= UNKNOWN_PRODUCT_PENALTY;
                }
            }
        }
        raw = serde_json::to_value(pools).context("serializing tote_pools")?;
    } else if let Some(divs) = dividends.filter(|d| !d.is_empty()) {
        score -= FALLBACK_PENALTY;
        for dividend in divs {
            let Some(name) = dividend.product_name.as_deref() else {
                continue;
            };
            match normalize_product(name) {
                Some(product) => {
                    let cents = dollars_to_cents(dividend.pool_size.unwrap_or(0.0))?;
                    // Several dividend lines per product; the maximum observed
                    // pool size is the authoritative total.
                    let entry = totals_cents.entry(product).or_insert(0);
                    *entry = (*entry).max(cents);
                }
                None => {
                    log::debug!("Unknown dividend product: {}", name);
                    score -= UNKNOWN_PRODUCT_PENALTY;
                }
            }
        }
        raw = serde_json::to_value(divs).context("serializing dividends")?;
    } else {
        return Ok(None);
    }

    if !totals_cents.contains_key(&PoolProduct::Win) {
        score -= MISSING_CORE_POOL_PENALTY;
    }
    if !totals_cents.contains_key(&PoolProduct::Place) {
        score -= MISSING_CORE_POOL_PENALTY;
    }

    Ok(Some(ExtractedPools {
        totals_cents,
        data_quality_score: score.max(0),
        raw,
    }))
}

fn parse_meeting_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| DateTime::parse_from_rfc3339(raw).ok().map(|dt| dt.date_naive()))
}

/// Transform one race payload into its persistable form.
pub fn transform_race(payload: &RaceEventPayload, ctx: &TransformContext) -> Result<TransformedRace> {
    let started = Instant::now();

    let status = RaceStatus::from_upstream(&payload.race.status)
        .with_context(|| format!("unmapped race status: {}", payload.race.status))?;

    let meeting_id = payload
        .meeting
        .as_ref()
        .map(|m| m.id().to_string())
        .unwrap_or_default();

    let (race_date_nz, start_time_nz) = race_local_fields(payload.race.start_time, ctx.zone);
    let race = Race {
        race_id: payload.race.id.clone(),
        meeting_id: meeting_id.clone(),
        name: payload.race.name.clone(),
        race_number: payload.race.race_number,
        start_time: payload.race.start_time,
        status,
        race_date_nz,
        start_time_nz,
    };

    let meeting = payload
        .meeting
        .as_ref()
        .and_then(|m| m.expanded())
        .and_then(|detail| {
            let date = parse_meeting_date(&detail.date)?;
            Some(Meeting {
                meeting_id: detail.id.clone(),
                name: detail.name.clone(),
                country: detail.country.clone(),
                race_type: detail.category_name.clone(),
                date,
                track_condition: detail.track_condition.clone(),
                tote_status: detail.tote_status.clone(),
                status: detail.status.clone().unwrap_or_else(|| "open".to_string()),
            })
        });

    // money_tracker may carry several snapshots per entrant; fold left so the
    // last entry is the current observation.
    let mut tracker: HashMap<&str, (Option<f64>, Option<f64>)> = HashMap::new();
    if let Some(money) = &payload.money_tracker {
        for entry in &money.entrants {
            tracker.insert(
                entry.entrant_id.as_str(),
                (entry.hold_percentage, entry.bet_percentage),
            );
        }
    }

    let pools = extract_pools(
        payload.tote_pools.as_deref(),
        payload.dividends.as_deref(),
    )?;
    let win_total_cents = pools
        .as_ref()
        .map(|p| p.total_cents(PoolProduct::Win))
        .unwrap_or(0);
    let place_total_cents = pools
        .as_ref()
        .map(|p| p.total_cents(PoolProduct::Place))
        .unwrap_or(0);
    let total_race_pool = pools.as_ref().map(|p| p.total_race_pool()).unwrap_or(0);

    let tts = minutes_to_start(payload.race.start_time, ctx.now);
    let bucket = snap_to_bucket(tts);
    let interval_type = interval_type_for(tts);

    let mut entrants = Vec::with_capacity(payload.entrants.len());
    let mut money_flow_records = Vec::new();
    let mut skipped = 0usize;

    for raw in &payload.entrants {
        let (hold, bet) = tracker.get(raw.id.as_str()).copied().unwrap_or((None, None));
        let odds = raw.odds.clone().unwrap_or_default();

        let gate_open = hold.map_or(false, |h| h > 0.0) && total_race_pool > 0;

        let (win_amount, place_amount, win_pct, place_pct) = if gate_open {
            let hold_pct = hold.unwrap_or(0.0);
            let win_amount = percentage_of_cents(hold_pct, win_total_cents)?;
            let place_amount = percentage_of_cents(hold_pct, place_total_cents)?;
            let win_pct = if win_total_cents > 0 {
                Some(100.0 * win_amount as f64 / win_total_cents as f64)
            } else {
                None
            };
            let place_pct = if place_total_cents > 0 {
                Some(100.0 * place_amount as f64 / place_total_cents as f64)
            } else {
                None
            };
            (Some(win_amount), Some(place_amount), win_pct, place_pct)
        } else {
            (None, None, None, None)
        };

        entrants.push(Entrant {
            entrant_id: raw.id.clone(),
            race_id: race.race_id.clone(),
            runner_number: raw.runner_number,
            name: raw.name.clone(),
            barrier: raw.barrier.as_ref().and_then(parse_barrier),
            is_scratched: raw.is_scratched.unwrap_or(false),
            is_late_scratched: raw.is_late_scratched,
            fixed_win_odds: odds.fixed_win,
            fixed_place_odds: odds.fixed_place,
            pool_win_odds: odds.pool_win,
            pool_place_odds: odds.pool_place,
            hold_percentage: hold,
            bet_percentage: bet,
            win_pool_percentage: win_pct,
            place_pool_percentage: place_pct,
            win_pool_amount: win_amount,
            place_pool_amount: place_amount,
            jockey: raw.jockey.clone(),
            trainer_name: raw.trainer_name.clone(),
            silk_colours: raw.silk_colours.clone(),
            favourite: raw.favourite,
            mover: raw.mover,
        });

        if !gate_open {
            skipped += 1;
            continue;
        }

        let win_amount = win_amount.unwrap_or(0);
        let place_amount = place_amount.unwrap_or(0);

        // Incremental against the previous bucket; first observation is its
        // own baseline.
        let (incremental_win, incremental_place) = match ctx.previous_buckets.get(&raw.id) {
            Some(prev) => (
                win_amount - prev.win_pool_amount,
                place_amount - prev.place_pool_amount,
            ),
            None => (win_amount, place_amount),
        };

        money_flow_records.push(MoneyFlowRecord {
            entrant_id: raw.id.clone(),
            race_id: race.race_id.clone(),
            time_to_start: tts,
            time_interval: bucket,
            interval_type,
            event_timestamp: ctx.now,
            polling_timestamp: ctx.now,
            hold_percentage: hold,
            bet_percentage: bet,
            win_pool_percentage: win_pct,
            place_pool_percentage: place_pct,
            win_pool_amount: win_amount,
            place_pool_amount: place_amount,
            total_pool_amount: total_race_pool,
            incremental_win_amount: incremental_win,
            incremental_place_amount: incremental_place,
            fixed_win_odds: odds.fixed_win,
            fixed_place_odds: odds.fixed_place,
            pool_win_odds: odds.pool_win,
            pool_place_odds: odds.pool_place,
        });
    }

    let race_pools = pools.map(|p| RacePools {
        race_id: race.race_id.clone(),
        win_pool_total: p.total_cents(PoolProduct::Win),
        place_pool_total: p.total_cents(PoolProduct::Place),
        quinella_pool_total: p.total_cents(PoolProduct::Quinella),
        trifecta_pool_total: p.total_cents(PoolProduct::Trifecta),
        exacta_pool_total: p.total_cents(PoolProduct::Exacta),
        first4_pool_total: p.total_cents(PoolProduct::First4),
        total_race_pool: p.total_race_pool(),
        currency: "NZD".to_string(),
        data_quality_score: p.data_quality_score,
        extracted_pools: p.raw,
        last_updated: ctx.now,
    });

    let metrics = TransformMetrics {
        duration: started.elapsed(),
        entrant_count: entrants.len(),
        money_flow_count: money_flow_records.len(),
        money_flow_skipped: skipped,
    };
    if metrics.duration >= TRANSFORM_BUDGET {
        log::warn!(
            "⚠️ Transform of race {} took {:?} ({} entrants)",
            race.race_id,
            metrics.duration,
            metrics.entrant_count
        );
    }

    Ok(TransformedRace {
        meeting,
        race,
        entrants,
        money_flow_records,
        race_pools,
        metrics,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use serde_json::json;

    fn context() -> TransformContext {
        TransformContext {
            now: Utc.with_ymd_and_hms(2025, 10, 12, 1, 10, 0).unwrap(),
            zone: chrono_tz::Pacific::Auckland,
            previous_buckets: HashMap::new(),
        }
    }

    fn payload(extra: serde_json::Value) -> RaceEventPayload {
        let mut base = json!({
            "race": {
                "id": "R1",
                "name": "Premier Sprint",
                "race_number": 4,
                "start_time": "2025-10-12T01:30:00Z",
                "status": "open"
            },
            "meeting": {
                "id": "M1",
                "name": "Ellerslie",
                "country": "NZL",
                "category_name": "Thoroughbred Horse Racing",
                "date": "2025-10-12"
            },
            "entrants": [
                {"id": "E1", "name": "Fast Horse", "runner_number": 1, "barrier": "Fr3",
                 "odds": {"fixed_win": 3.5, "fixed_place": 1.6}}
            ],
            "money_tracker": {"entrants": [
                {"entrant_id": "E1", "hold_percentage": 10.0, "bet_percentage": 9.0}
            ]}
        });
        base.as_object_mut()
            .unwrap()
            .extend(extra.as_object().cloned().unwrap_or_default());
        serde_json::from_value(base).unwrap()
    }

    #[test]
    fn pool_amounts_follow_the_cent_invariant() {
        let payload = payload(json!({
            "tote_pools": [
                {"product_type": "win", "total": 10000.0},
                {"product_type": "place", "total": 5000.0}
            ]
        }));
        let out = transform_race(&payload, &context()).unwrap();

        let entrant = &out.entrants[0];
        // 10% of $10,000.00 = $1,000.00
        assert_eq!(entrant.win_pool_amount, Some(100_000));
        assert_eq!(entrant.place_pool_amount, Some(50_000));
        assert!((entrant.win_pool_percentage.unwrap() - 10.0).abs() < 1e-9);

        let record = &out.money_flow_records[0];
        assert_eq!(record.win_pool_amount, 100_000);
        assert_eq!(record.total_pool_amount, 1_500_000);
        // 20 minutes out snaps to the 20 bucket
        assert_eq!(record.time_interval, 20);
        assert_eq!(record.interval_type, crate::types::domain::IntervalType::Pre);
    }

    #[test]
    fn first_observation_is_its_own_baseline() {
        let payload = payload(json!({
            "tote_pools": [
                {"product_type": "win", "total": 10000.0},
                {"product_type": "place", "total": 5000.0}
            ]
        }));
        let out = transform_race(&payload, &context()).unwrap();
        let record = &out.money_flow_records[0];
        assert_eq!(record.incremental_win_amount, record.win_pool_amount);
        assert_eq!(record.incremental_place_amount, record.place_pool_amount);
    }

    #[test]
    fn incremental_subtracts_the_previous_bucket() {
        let payload = payload(json!({
            "tote_pools": [
                {"product_type": "win", "total": 10000.0},
                {"product_type": "place", "total": 5000.0}
            ]
        }));
        let mut ctx = context();
        ctx.previous_buckets.insert(
            "E1".to_string(),
            PreviousBucket {
                win_pool_amount: 90_000,
                place_pool_amount: 48_000,
            },
        );
        let out = transform_race(&payload, &ctx).unwrap();
        let record = &out.money_flow_records[0];
        assert_eq!(record.incremental_win_amount, 10_000);
        assert_eq!(record.incremental_place_amount, 2_000);
    }

    #[test]
    fn dividends_fallback_takes_maxima_and_scores_ninety() {
        let payload = payload(json!({
            "dividends": [
                {"product_name": "Pool Win", "pool_size": 12345.0},
                {"product_name": "Pool Place", "pool_size": 6789.0}
            ]
        }));
        let out = transform_race(&payload, &context()).unwrap();
        let pools = out.race_pools.unwrap();
        assert_eq!(pools.win_pool_total, 1_234_500);
        assert_eq!(pools.place_pool_total, 678_900);
        assert_eq!(pools.data_quality_score, 90);
    }

    #[test]
    fn dividends_keep_the_maximum_observed_pool_size() {
        let payload = payload(json!({
            "dividends": [
                {"product_name": "Win", "pool_size": 100.0},
                {"product_name": "Win", "pool_size": 250.0},
                {"product_name": "Win", "pool_size": 200.0},
                {"product_name": "Place", "pool_size": 80.0}
            ]
        }));
        let out = transform_race(&payload, &context()).unwrap();
        assert_eq!(out.race_pools.unwrap().win_pool_total, 25_000);
    }

    #[test]
    fn unknown_products_and_missing_core_pools_decay_the_score() {
        let payload = payload(json!({
            "tote_pools": [
                {"product_type": "win", "total": 100.0},
                {"product_type": "mystery", "total": 50.0}
            ]
        }));
        let out = transform_race(&payload, &context()).unwrap();
        // -5 unknown, -30 missing place
        assert_eq!(out.race_pools.unwrap().data_quality_score, 65);
    }

    #[test]
    fn entrants_without_positive_hold_skip_money_flow() {
        let mut payload = payload(json!({
            "tote_pools": [
                {"product_type": "win", "total": 10000.0},
                {"product_type": "place", "total": 5000.0}
            ]
        }));
        payload.money_tracker = None;
        let out = transform_race(&payload, &context()).unwrap();
        assert!(out.money_flow_records.is_empty());
        assert_eq!(out.metrics.money_flow_skipped, 1);
        // the entrant row itself still persists
        assert_eq!(out.entrants.len(), 1);
        assert_eq!(out.entrants[0].win_pool_amount, None);
    }

    #[test]
    fn last_money_tracker_snapshot_wins() {
        let payload = payload(json!({
            "tote_pools": [
                {"product_type": "win", "total": 10000.0},
                {"product_type": "place", "total": 5000.0}
            ],
            "money_tracker": {"entrants": [
                {"entrant_id": "E1", "hold_percentage": 4.0},
                {"entrant_id": "E1", "hold_percentage": 12.0}
            ]}
        }));
        let out = transform_race(&payload, &context()).unwrap();
        assert_eq!(out.entrants[0].hold_percentage, Some(12.0));
        assert_eq!(out.money_flow_records[0].win_pool_amount, 120_000);
    }

    #[test]
    fn barrier_and_meeting_carry_through() {
        let payload = payload(json!({}));
        let out = transform_race(&payload, &context()).unwrap();
        assert_eq!(out.entrants[0].barrier, Some(3));
        let meeting = out.meeting.unwrap();
        assert_eq!(meeting.race_type, "Thoroughbred Horse Racing");
        assert_eq!(out.race.meeting_id, "M1");
        // race day resolves in the racing zone: 01:30 UTC is 14:30 NZDT
        assert_eq!(
            out.race.race_date_nz,
            NaiveDate::from_ymd_opt(2025, 10, 12).unwrap()
        );
    }

    #[test]
    fn string_meeting_ref_produces_no_meeting_row() {
        let mut raw = json!({
            "race": {
                "id": "R2",
                "name": "Late Double",
                "start_time": "2025-10-12T02:00:00Z",
                "status": "open"
            },
            "meeting": "M9",
            "entrants": []
        });
        let payload: RaceEventPayload = serde_json::from_value(raw.take()).unwrap();
        let out = transform_race(&payload, &context()).unwrap();
        assert!(out.meeting.is_none());
        assert_eq!(out.race.meeting_id, "M9");
    }
}
