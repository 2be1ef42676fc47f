//! Odds Change Detector: suppresses no-op appends to `odds_history`.
//!
//! Keyed by `entrant_id:odds_type`, the cache holds the last accepted value
//! per key. A candidate passes when there is no prior snapshot or the move
//! exceeds the configured minimum change. An optional warm-up seeds the
//! cache from today's partition so a restart does not replay the last tick
//! of every race.

use crate::database::DbPool;
use crate::time_series;
use crate::types::domain::{Entrant, OddsRecord, OddsType};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;

pub struct OddsChangeDetector {
    last_accepted: DashMap<String, f64>,
    minimum_change: f64,
}

impl OddsChangeDetector {
    pub fn new(minimum_change: f64) -> Self {
        Self {
            last_accepted: DashMap::new(),
            minimum_change,
        }
    }

    /// Whether the record should be appended; accepted records become the
    /// new "last observed" for their key.
    pub fn check_and_update(&self, record: &OddsRecord) -> bool {
        let key = record.cache_key();
        match self.last_accepted.get(&key).map(|entry| *entry) {
            None => {
                self.last_accepted.insert(key, record.odds);
                true
            }
            Some(previous) => {
                if (record.odds - previous).abs() > self.minimum_change {
                    self.last_accepted.insert(key, record.odds);
                    true
                } else {
                    log::debug!(
                        "Suppressed odds append for {}: {} -> {} within minimum change {}",
                        key,
                        previous,
                        record.odds,
                        self.minimum_change
                    );
                    false
                }
            }
        }
    }

    /// Filter a candidate batch down to the records worth appending.
    pub fn filter_records(&self, candidates: Vec<OddsRecord>) -> Vec<OddsRecord> {
        candidates
            .into_iter()
            .filter(|record| self.check_and_update(record))
            .collect()
    }

    /// Seed the cache from the most recent record per key in today's
    /// partition. Makes restarts idempotent.
    pub async fn warm_up(&self, pool: &DbPool, race_date: NaiveDate, zone: Tz) -> Result<usize> {
        let latest = time_series::load_latest_odds(pool, race_date, zone).await?;
        let count = latest.len();
        for (entrant_id, odds_type, odds) in latest {
            self.last_accepted
                .insert(format!("{}:{}", entrant_id, odds_type), odds);
        }
        log::info!("✅ Odds detector warmed up with {} cached keys", count);
        Ok(count)
    }

    pub fn cached_keys(&self) -> usize {
        self.last_accepted.len()
    }
}

/// Candidate odds records for one transformed entrant set: one record per
/// present odds flavour.
pub fn candidates_from_entrants(
    entrants: &[Entrant],
    event_timestamp: DateTime<Utc>,
) -> Vec<OddsRecord> {
    let mut candidates = Vec::new();
    for entrant in entrants {
        let flavours = [
            (OddsType::FixedWin, entrant.fixed_win_odds),
            (OddsType::FixedPlace, entrant.fixed_place_odds),
            (OddsType::PoolWin, entrant.pool_win_odds),
            (OddsType::PoolPlace, entrant.pool_place_odds),
        ];
        for (odds_type, value) in flavours {
            if let Some(odds) = value {
                candidates.push(OddsRecord {
                    entrant_id: entrant.entrant_id.clone(),
                    race_id: entrant.race_id.clone(),
                    odds,
                    odds_type,
                    event_timestamp,
                });
            }
        }
    }
    candidates
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(entrant: &str, odds_type: OddsType, odds: f64) -> OddsRecord {
        OddsRecord {
            entrant_id: entrant.to_string(),
            race_id: "R1".to_string(),
            odds,
            odds_type,
            event_timestamp: Utc::now(),
        }
    }

    #[test]
    fn first_observation_always_inserts() {
        let detector = OddsChangeDetector::new(0.01);
        assert!(detector.check_and_update(&record("E1", OddsType::FixedWin, 3.5)));
    }

    #[test]
    fn identical_consecutive_values_are_suppressed() {
        let detector = OddsChangeDetector::new(0.01);
        assert!(detector.check_and_update(&record("E1", OddsType::FixedWin, 3.5)));
        assert!(!detector.check_and_update(&record("E1", OddsType::FixedWin, 3.5)));
    }

    #[test]
    fn moves_within_minimum_change_are_suppressed() {
        let detector = OddsChangeDetector::new(0.01);
        assert!(detector.check_and_update(&record("E1", OddsType::FixedWin, 3.50)));
        assert!(!detector.check_and_update(&record("E1", OddsType::FixedWin, 3.505)));
        assert!(detector.check_and_update(&record("E1", OddsType::FixedWin, 3.52)));
    }

    #[test]
    fn keys_separate_entrants_and_flavours() {
        let detector = OddsChangeDetector::new(0.01);
        assert!(detector.check_and_update(&record("E1", OddsType::FixedWin, 3.5)));
        assert!(detector.check_and_update(&record("E1", OddsType::FixedPlace, 3.5)));
        assert!(detector.check_and_update(&record("E2", OddsType::FixedWin, 3.5)));
        assert_eq!(detector.cached_keys(), 3);
    }

    #[test]
    fn suppression_tracks_the_last_accepted_value() {
        // A slow drift below the threshold never inserts until the cumulative
        // move from the last ACCEPTED value exceeds it.
        let detector = OddsChangeDetector::new(0.10);
        assert!(detector.check_and_update(&record("E1", OddsType::PoolWin, 2.00)));
        assert!(!detector.check_and_update(&record("E1", OddsType::PoolWin, 2.08)));
        assert!(detector.check_and_update(&record("E1", OddsType::PoolWin, 2.11)));
    }

    #[test]
    fn candidates_cover_only_present_flavours() {
        let entrant = Entrant {
            entrant_id: "E1".to_string(),
            race_id: "R1".to_string(),
            runner_number: 1,
            name: "Fast Horse".to_string(),
            barrier: None,
            is_scratched: false,
            is_late_scratched: None,
            fixed_win_odds: Some(3.5),
            fixed_place_odds: None,
            pool_win_odds: Some(3.2),
            pool_place_odds: None,
            hold_percentage: None,
            bet_percentage: None,
            win_pool_percentage: None,
            place_pool_percentage: None,
            win_pool_amount: None,
            place_pool_amount: None,
            jockey: None,
            trainer_name: None,
            silk_colours: None,
            favourite: None,
            mover: None,
        };
        let candidates = candidates_from_entrants(&[entrant], Utc::now());
        assert_eq!(candidates.len(), 2);
        assert!(candidates.iter().any(|c| c.odds_type == OddsType::FixedWin));
        assert!(candidates.iter().any(|c| c.odds_type == OddsType::PoolWin));
    }
}
