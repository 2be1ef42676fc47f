use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::{Decimal, RoundingStrategy};

// Money amounts are stored as integer cents; all rounding happens once, here,
// so every cycle derives the same cents from the same upstream snapshot.

/// Convert a dollar figure to integer cents.
pub fn dollars_to_cents(dollars: f64) -> Result<i64, ConversionError> {
    let value = Decimal::from_f64_retain(dollars)
        .ok_or_else(|| ConversionError::InvalidAmount(dollars.to_string()))?;
    let cents = (value * Decimal::from(100))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    cents
        .to_i64()
        .ok_or_else(|| ConversionError::Overflow(dollars.to_string()))
}

/// `round(percentage/100 · total_cents)` — an entrant's share of a pool.
pub fn percentage_of_cents(percentage: f64, total_cents: i64) -> Result<i64, ConversionError> {
    let pct = Decimal::from_f64_retain(percentage)
        .ok_or_else(|| ConversionError::InvalidAmount(percentage.to_string()))?;
    let share = (pct / Decimal::from(100) * Decimal::from(total_cents))
        .round_dp_with_strategy(0, RoundingStrategy::MidpointAwayFromZero);
    share
        .to_i64()
        .ok_or_else(|| ConversionError::Overflow(percentage.to_string()))
}

/// Parse a barrier draw that upstream sends as a number or a string like
/// `"Fr1"` / `"Fr12a"`: the first contiguous digit group wins, anything
/// without digits is null.
pub fn parse_barrier(raw: &serde_json::Value) -> Option<i32> {
    match raw {
        serde_json::Value::Number(n) => n.as_i64().and_then(|v| i32::try_from(v).ok()),
        serde_json::Value::String(s) => {
            let digits: String = s
                .chars()
                .skip_while(|c| !c.is_ascii_digit())
                .take_while(|c| c.is_ascii_digit())
                .collect();
            digits.parse::<i32>().ok()
        }
        _ => None,
    }
}

/// Format a timestamp for downstream consumers: ISO-8601 with milliseconds
/// and the explicit racing-zone offset. `Z` must never appear.
pub fn format_racing_timestamp(instant: DateTime<Utc>, zone: Tz) -> String {
    instant
        .with_timezone(&zone)
        .format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        .to_string()
}

#[derive(Debug, thiserror::Error)]
pub enum ConversionError {
    #[error("Invalid amount: {0}")]
    InvalidAmount(String),
    #[error("Overflow converting: {0}")]
    Overflow(String),
}
