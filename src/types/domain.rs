use chrono::{DateTime, NaiveDate, NaiveTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of a race as persisted in the store.
///
/// Upstream reports a wider vocabulary (`running`, `finalized`, `cancelled`,
/// `official`); `from_upstream` folds those synonyms into this closed set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RaceStatus {
    Open,
    Closed,
    Interim,
    Final,
    Abandoned,
}

impl RaceStatus {
    /// Lenient parse of an upstream status string.
    ///
    /// Synonym folding: `running` → Closed (betting is off while the field is
    /// on the track), `finalized`/`official` → Final, `cancelled` → Abandoned.
    pub fn from_upstream(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "open" => Some(RaceStatus::Open),
            "closed" | "running" => Some(RaceStatus::Closed),
            "interim" => Some(RaceStatus::Interim),
            "final" | "finalized" | "official" => Some(RaceStatus::Final),
            "abandoned" | "cancelled" => Some(RaceStatus::Abandoned),
            _ => None,
        }
    }

    /// Terminal races are never scheduled again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RaceStatus::Final | RaceStatus::Abandoned)
    }

    /// Critical races poll at the tightest interval regardless of start time.
    pub fn is_critical(&self) -> bool {
        matches!(self, RaceStatus::Closed | RaceStatus::Interim)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RaceStatus::Open => "open",
            RaceStatus::Closed => "closed",
            RaceStatus::Interim => "interim",
            RaceStatus::Final => "final",
            RaceStatus::Abandoned => "abandoned",
        }
    }
}

/// Time-series row alignment marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalType {
    Pre,
    Post,
    Legacy,
    PointSample,
    BucketedAggregation,
}

impl IntervalType {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalType::Pre => "pre",
            IntervalType::Post => "post",
            IntervalType::Legacy => "legacy",
            IntervalType::PointSample => "point_sample",
            IntervalType::BucketedAggregation => "bucketed_aggregation",
        }
    }
}

/// Odds flavour tracked in `odds_history`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OddsType {
    FixedWin,
    FixedPlace,
    PoolWin,
    PoolPlace,
}

impl OddsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OddsType::FixedWin => "fixed_win",
            OddsType::FixedPlace => "fixed_place",
            OddsType::PoolWin => "pool_win",
            OddsType::PoolPlace => "pool_place",
        }
    }
}

/// A race meeting (one venue, one day). 8 persisted fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Meeting {
    pub meeting_id: String,
    pub name: String,
    pub country: String,
    pub race_type: String,
    pub date: NaiveDate,
    pub track_condition: Option<String>,
    pub tote_status: Option<String>,
    pub status: String,
}

/// A single race. 8 persisted fields.
///
/// `race_date_nz` / `start_time_nz` are the race's local calendar day and
/// wall-clock start in the racing zone; they are written by the bulk writer
/// and relied on for partition naming and daily filtering, never derived at
/// read time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Race {
    pub race_id: String,
    pub meeting_id: String,
    pub name: String,
    pub race_number: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub status: RaceStatus,
    pub race_date_nz: NaiveDate,
    pub start_time_nz: NaiveTime,
}

/// A runner in a race. 22 persisted fields; pool amounts in integer cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entrant {
    pub entrant_id: String,
    pub race_id: String,
    pub runner_number: i32,
    pub name: String,
    pub barrier: Option<i32>,
    pub is_scratched: bool,
    pub is_late_scratched: Option<bool>,
    pub fixed_win_odds: Option<f64>,
    pub fixed_place_odds: Option<f64>,
    pub pool_win_odds: Option<f64>,
    pub pool_place_odds: Option<f64>,
    pub hold_percentage: Option<f64>,
    pub bet_percentage: Option<f64>,
    pub win_pool_percentage: Option<f64>,
    pub place_pool_percentage: Option<f64>,
    pub win_pool_amount: Option<i64>,
    pub place_pool_amount: Option<i64>,
    pub jockey: Option<String>,
    pub trainer_name: Option<String>,
    pub silk_colours: Option<String>,
    pub favourite: Option<bool>,
    pub mover: Option<bool>,
}

/// Per-race pool totals, all in integer cents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RacePools {
    pub race_id: String,
    pub win_pool_total: i64,
    pub place_pool_total: i64,
    pub quinella_pool_total: i64,
    pub trifecta_pool_total: i64,
    pub exacta_pool_total: i64,
    pub first4_pool_total: i64,
    pub total_race_pool: i64,
    pub currency: String,
    pub data_quality_score: i16,
    pub extracted_pools: serde_json::Value,
    pub last_updated: DateTime<Utc>,
}

/// One money-flow observation, appended to the daily
/// `money_flow_history_YYYY_MM_DD` partition. Never updated or deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MoneyFlowRecord {
    pub entrant_id: String,
    pub race_id: String,
    pub time_to_start: f64,
    pub time_interval: i32,
    pub interval_type: IntervalType,
    pub event_timestamp: DateTime<Utc>,
    pub polling_timestamp: DateTime<Utc>,
    pub hold_percentage: Option<f64>,
    pub bet_percentage: Option<f64>,
    pub win_pool_percentage: Option<f64>,
    pub place_pool_percentage: Option<f64>,
    pub win_pool_amount: i64,
    pub place_pool_amount: i64,
    pub total_pool_amount: i64,
    pub incremental_win_amount: i64,
    pub incremental_place_amount: i64,
    pub fixed_win_odds: Option<f64>,
    pub fixed_place_odds: Option<f64>,
    pub pool_win_odds: Option<f64>,
    pub pool_place_odds: Option<f64>,
}

/// One odds observation, appended to the daily `odds_history_YYYY_MM_DD`
/// partition once it passes the change detector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OddsRecord {
    pub entrant_id: String,
    pub race_id: String,
    pub odds: f64,
    pub odds_type: OddsType,
    pub event_timestamp: DateTime<Utc>,
}

impl OddsRecord {
    /// Cache key for the change detector: `entrant_id:odds_type`.
    pub fn cache_key(&self) -> String {
        format!("{}:{}", self.entrant_id, self.odds_type.as_str())
    }
}

/// Row count + elapsed time returned by every bulk write.
#[derive(Debug, Clone, Copy, Default)]
pub struct WriteOutcome {
    pub row_count: u64,
    pub duration: std::time::Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_synonyms_fold_into_closed_set() {
        assert_eq!(RaceStatus::from_upstream("Open"), Some(RaceStatus::Open));
        assert_eq!(
            RaceStatus::from_upstream("running"),
            Some(RaceStatus::Closed)
        );
        assert_eq!(
            RaceStatus::from_upstream("Finalized"),
            Some(RaceStatus::Final)
        );
        assert_eq!(
            RaceStatus::from_upstream("official"),
            Some(RaceStatus::Final)
        );
        assert_eq!(
            RaceStatus::from_upstream("cancelled"),
            Some(RaceStatus::Abandoned)
        );
        assert_eq!(RaceStatus::from_upstream("weird"), None);
    }

    #[test]
    fn terminal_races_are_not_critical() {
        assert!(RaceStatus::Final.is_terminal());
        assert!(RaceStatus::Abandoned.is_terminal());
        assert!(!RaceStatus::Final.is_critical());
        assert!(RaceStatus::Closed.is_critical());
        assert!(RaceStatus::Interim.is_critical());
        assert!(!RaceStatus::Open.is_critical());
    }

    #[test]
    fn odds_cache_key_is_entrant_and_type() {
        let record = OddsRecord {
            entrant_id: "E1".to_string(),
            race_id: "R1".to_string(),
            odds: 3.5,
            odds_type: OddsType::FixedWin,
            event_timestamp: Utc::now(),
        };
        assert_eq!(record.cache_key(), "E1:fixed_win");
    }
}
