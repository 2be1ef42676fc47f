// Raw payloads from the affiliate racing API.
//
// Unknown fields pass through untouched (no deny_unknown_fields) so upstream
// additions never break a deploy. Validation of required keys and enum
// domains happens in `validation.rs` against the raw JSON value before these
// types are deserialized.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Response of `GET /affiliates/v1/racing/list?date_from&date_to`.
#[derive(Debug, Clone, Deserialize)]
pub struct RaceListResponse {
    pub data: RaceListData,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RaceListData {
    #[serde(default)]
    pub meetings: Vec<MeetingSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeetingSummary {
    /// Upstream meeting id.
    pub meeting: String,
    pub name: String,
    pub country: String,
    pub category_name: String,
    pub date: String,
    #[serde(default)]
    pub track_condition: Option<String>,
    #[serde(default)]
    pub tote_status: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub races: Vec<RaceSummary>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RaceSummary {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub race_number: Option<i32>,
    pub start_time: DateTime<Utc>,
    #[serde(default)]
    pub distance: Option<i32>,
    #[serde(default)]
    pub track_condition: Option<String>,
    #[serde(default)]
    pub weather: Option<String>,
    pub status: String,
}

/// Response of `GET /affiliates/v1/racing/event/{race_id}`.
#[derive(Debug, Clone, Deserialize)]
pub struct RaceEventPayload {
    pub race: RaceDetail,
    /// Historically either a bare meeting id or an expanded meeting object.
    #[serde(default)]
    pub meeting: Option<MeetingRef>,
    #[serde(default)]
    pub entrants: Vec<EntrantPayload>,
    #[serde(default)]
    pub money_tracker: Option<MoneyTracker>,
    #[serde(default)]
    pub tote_pools: Option<Vec<TotePool>>,
    #[serde(default)]
    pub dividends: Option<Vec<Dividend>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RaceDetail {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub race_number: Option<i32>,
    pub start_time: DateTime<Utc>,
    pub status: String,
    #[serde(default)]
    pub track_condition: Option<String>,
}

/// The `meeting` field of an event response comes in two historical shapes.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MeetingRef {
    Expanded(MeetingDetail),
    Id(String),
}

impl MeetingRef {
    pub fn id(&self) -> &str {
        match self {
            MeetingRef::Id(id) => id,
            MeetingRef::Expanded(detail) => &detail.id,
        }
    }

    pub fn expanded(&self) -> Option<&MeetingDetail> {
        match self {
            MeetingRef::Expanded(detail) => Some(detail),
            MeetingRef::Id(_) => None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct MeetingDetail {
    pub id: String,
    pub name: String,
    pub country: String,
    pub category_name: String,
    pub date: String,
    #[serde(default)]
    pub track_condition: Option<String>,
    #[serde(default)]
    pub tote_status: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EntrantPayload {
    #[serde(alias = "entrant_id")]
    pub id: String,
    pub name: String,
    pub runner_number: i32,
    /// Numeric or a string like `"Fr1"`; parsed by `conversions::parse_barrier`.
    #[serde(default)]
    pub barrier: Option<serde_json::Value>,
    #[serde(default)]
    pub is_scratched: Option<bool>,
    #[serde(default)]
    pub is_late_scratched: Option<bool>,
    #[serde(default)]
    pub jockey: Option<String>,
    #[serde(default)]
    pub trainer_name: Option<String>,
    #[serde(default)]
    pub silk_colours: Option<String>,
    #[serde(default)]
    pub favourite: Option<bool>,
    #[serde(default)]
    pub mover: Option<bool>,
    #[serde(default)]
    pub odds: Option<EntrantOdds>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct EntrantOdds {
    #[serde(default)]
    pub fixed_win: Option<f64>,
    #[serde(default)]
    pub fixed_place: Option<f64>,
    #[serde(default)]
    pub pool_win: Option<f64>,
    #[serde(default)]
    pub pool_place: Option<f64>,
}

/// Per-entrant money-flow snapshots. May contain multiple entries per
/// entrant within one payload; the last one is the current observation.
#[derive(Debug, Clone, Deserialize)]
pub struct MoneyTracker {
    #[serde(default)]
    pub entrants: Vec<MoneyTrackerEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct MoneyTrackerEntry {
    pub entrant_id: String,
    #[serde(default)]
    pub hold_percentage: Option<f64>,
    #[serde(default)]
    pub bet_percentage: Option<f64>,
}

/// One tote pool total, present while a race is Open/Interim.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TotePool {
    pub product_type: String,
    /// Upstream flips between `total` and `amount` for the dollar figure.
    #[serde(default)]
    pub total: Option<f64>,
    #[serde(default)]
    pub amount: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
}

impl TotePool {
    pub fn amount_dollars(&self) -> Option<f64> {
        self.total.or(self.amount)
    }
}

/// One dividend line, present once a race is Final.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dividend {
    #[serde(default)]
    pub product_name: Option<String>,
    #[serde(default)]
    pub pool_size: Option<f64>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub dividend: Option<f64>,
}
