//! Time-Series Writer: append-only inserts into the daily-partitioned
//! `money_flow_history` / `odds_history` tables.
//!
//! Records are bucketed by the partition their `event_timestamp` lands in
//! (named in the partition zone). Before inserting, the target partition's
//! existence is verified through the system catalog under the active
//! transaction; a missing partition rolls the whole call back and surfaces
//! `PartitionNotFoundError` so the processor can classify it. No
//! `ON CONFLICT` clause ever appears on these inserts.

use crate::database::{DbPool, SCHEMA};
use crate::types::domain::{MoneyFlowRecord, OddsRecord, WriteOutcome};
use anyhow::Result;
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use chrono_tz::Tz;
use sqlx::Row;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

const WRITE_BUDGET: Duration = Duration::from_millis(300);

const MONEY_FLOW_COLS: usize = 20;
const ODDS_COLS: usize = 5;

#[derive(Debug, thiserror::Error)]
#[error("Partition {partition} does not exist for {parent}")]
pub struct PartitionNotFoundError {
    pub parent: String,
    pub partition: String,
}

/// Child table name for a timestamp: `{parent}_YYYY_MM_DD` in the zone.
pub fn partition_name(parent: &str, event_timestamp: DateTime<Utc>, zone: Tz) -> String {
    format!(
        "{}_{}",
        parent,
        event_timestamp.with_timezone(&zone).format("%Y_%m_%d")
    )
}

/// UTC day bounds `[start, end)` of a calendar date in the zone.
pub fn day_bounds(date: NaiveDate, zone: Tz) -> (DateTime<Utc>, DateTime<Utc>) {
    let start = zone
        .from_local_datetime(&date.and_hms_opt(0, 0, 0).unwrap_or_default())
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    let next = date.succ_opt().unwrap_or(date);
    let end = zone
        .from_local_datetime(&next.and_hms_opt(0, 0, 0).unwrap_or_default())
        .earliest()
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(Utc::now);
    (start, end)
}

async fn ensure_partition_exists(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    parent: &str,
    partition: &str,
) -> Result<()> {
    let qualified = format!("{}.{}", SCHEMA, partition);
    let found: Option<String> = sqlx::query("SELECT to_regclass($1)::text AS reg")
        .bind(&qualified)
        .fetch_one(tx.as_mut())
        .await?
        .try_get("reg")?;
    if found.is_none() {
        return Err(PartitionNotFoundError {
            parent: parent.to_string(),
            partition: partition.to_string(),
        }
        .into());
    }
    Ok(())
}

fn value_tuples(rows: usize, cols: usize) -> String {
    (0..rows)
        .map(|r| {
            let params: Vec<String> = (1..=cols).map(|c| format!("${}", r * cols + c)).collect();
            format!("({})", params.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Append money-flow records. A single call may straddle midnight and span
/// two partitions; all inserts share one transaction, so a missing partition
/// rejects the whole batch.
pub async fn insert_money_flow(
    pool: &DbPool,
    records: &[MoneyFlowRecord],
    zone: Tz,
) -> Result<WriteOutcome> {
    if records.is_empty() {
        return Ok(WriteOutcome::default());
    }
    let mut tx = pool.begin().await?;
    let outcome = insert_money_flow_tx(&mut tx, records, zone).await?;
    tx.commit().await?;
    crate::metrics::record_time_series_write("money_flow_history", &outcome);
    Ok(outcome)
}

async fn insert_money_flow_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    records: &[MoneyFlowRecord],
    zone: Tz,
) -> Result<WriteOutcome> {
    let start = Instant::now();

    let mut buckets: BTreeMap<String, Vec<&MoneyFlowRecord>> = BTreeMap::new();
    for record in records {
        buckets
            .entry(partition_name("money_flow_history", record.event_timestamp, zone))
            .or_default()
            .push(record);
    }

    let mut inserted = 0u64;
    for (partition, bucket) in &buckets {
        ensure_partition_exists(tx, "money_flow_history", partition).await?;

        let sql = format!(
            "INSERT INTO {}.money_flow_history
                 (entrant_id, race_id, time_to_start, time_interval, interval_type,
                  event_timestamp, polling_timestamp, hold_percentage, bet_percentage,
                  win_pool_percentage, place_pool_percentage, win_pool_amount,
                  place_pool_amount, total_pool_amount, incremental_win_amount,
                  incremental_place_amount, fixed_win_odds, fixed_place_odds,
                  pool_win_odds, pool_place_odds)
             VALUES {}",
            SCHEMA,
            value_tuples(bucket.len(), MONEY_FLOW_COLS)
        );
        let mut query = sqlx::query(&sql);
        for r in bucket {
            query = query
                .bind(&r.entrant_id)
                .bind(&r.race_id)
                .bind(r.time_to_start)
                .bind(r.time_interval)
                .bind(r.interval_type.as_str())
                .bind(r.event_timestamp)
                .bind(r.polling_timestamp)
                .bind(r.hold_percentage)
                .bind(r.bet_percentage)
                .bind(r.win_pool_percentage)
                .bind(r.place_pool_percentage)
                .bind(r.win_pool_amount)
                .bind(r.place_pool_amount)
                .bind(r.total_pool_amount)
                .bind(r.incremental_win_amount)
                .bind(r.incremental_place_amount)
                .bind(r.fixed_win_odds)
                .bind(r.fixed_place_odds)
                .bind(r.pool_win_odds)
                .bind(r.pool_place_odds);
        }
        inserted += query.execute(tx.as_mut()).await?.rows_affected();
    }

    let outcome = WriteOutcome {
        row_count: inserted,
        duration: start.elapsed(),
    };
    if outcome.duration >= WRITE_BUDGET {
        log::warn!(
            "⚠️ money_flow_history insert took {:?} for {} rows across {} partitions",
            outcome.duration,
            outcome.row_count,
            buckets.len()
        );
    }
    Ok(outcome)
}

/// Append odds records that already passed the change detector.
pub async fn insert_odds(pool: &DbPool, records: &[OddsRecord], zone: Tz) -> Result<WriteOutcome> {
    if records.is_empty() {
        return Ok(WriteOutcome::default());
    }
    let mut tx = pool.begin().await?;
    let outcome = insert_odds_tx(&mut tx, records, zone).await?;
    tx.commit().await?;
    crate::metrics::record_time_series_write("odds_history", &outcome);
    Ok(outcome)
}

async fn insert_odds_tx(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    records: &[OddsRecord],
    zone: Tz,
) -> Result<WriteOutcome> {
    let start = Instant::now();

    let mut buckets: BTreeMap<String, Vec<&OddsRecord>> = BTreeMap::new();
    for record in records {
        buckets
            .entry(partition_name("odds_history", record.event_timestamp, zone))
            .or_default()
            .push(record);
    }

    let mut inserted = 0u64;
    for (partition, bucket) in &buckets {
        ensure_partition_exists(tx, "odds_history", partition).await?;

        let sql = format!(
            "INSERT INTO {}.odds_history (entrant_id, race_id, odds, type, event_timestamp)
             VALUES {}",
            SCHEMA,
            value_tuples(bucket.len(), ODDS_COLS)
        );
        let mut query = sqlx::query(&sql);
        for r in bucket {
            query = query
                .bind(&r.entrant_id)
                .bind(&r.race_id)
                .bind(r.odds)
                .bind(r.odds_type.as_str())
                .bind(r.event_timestamp);
        }
        inserted += query.execute(tx.as_mut()).await?.rows_affected();
    }

    let outcome = WriteOutcome {
        row_count: inserted,
        duration: start.elapsed(),
    };
    if outcome.duration >= WRITE_BUDGET {
        log::warn!(
            "⚠️ odds_history insert took {:?} for {} rows across {} partitions",
            outcome.duration,
            outcome.row_count,
            buckets.len()
        );
    }
    Ok(outcome)
}

/// One cycle's time-series writes under a single transaction, separate from
/// the entity UPSERTs: a missing partition rolls back both inserts and loses
/// only this cycle's records, never the entity rows.
pub async fn insert_cycle(
    pool: &DbPool,
    money_flow: &[MoneyFlowRecord],
    odds: &[OddsRecord],
    zone: Tz,
) -> Result<(WriteOutcome, WriteOutcome)> {
    if money_flow.is_empty() && odds.is_empty() {
        return Ok((WriteOutcome::default(), WriteOutcome::default()));
    }
    let mut tx = pool.begin().await?;
    let money_outcome = if money_flow.is_empty() {
        WriteOutcome::default()
    } else {
        insert_money_flow_tx(&mut tx, money_flow, zone).await?
    };
    let odds_outcome = if odds.is_empty() {
        WriteOutcome::default()
    } else {
        insert_odds_tx(&mut tx, odds, zone).await?
    };
    tx.commit().await?;
    crate::metrics::record_time_series_write("money_flow_history", &money_outcome);
    crate::metrics::record_time_series_write("odds_history", &odds_outcome);
    Ok((money_outcome, odds_outcome))
}

/// The most recent amounts persisted for a bucket, used for incrementals.
#[derive(Debug, Clone, Copy)]
pub struct PreviousBucket {
    pub win_pool_amount: i64,
    pub place_pool_amount: i64,
}

/// Latest money-flow amounts per entrant for one race at the previous bucket
/// marker, read from the current day's partition. Entrants with no prior
/// bucket are simply absent; the transform treats them as baseline.
pub async fn fetch_previous_buckets(
    pool: &DbPool,
    race_id: &str,
    previous_interval: i32,
    race_date: NaiveDate,
    zone: Tz,
) -> Result<std::collections::HashMap<String, PreviousBucket>> {
    let (day_start, day_end) = day_bounds(race_date, zone);
    let rows = sqlx::query(&format!(
        "SELECT DISTINCT ON (entrant_id) entrant_id, win_pool_amount, place_pool_amount
             FROM {}.money_flow_history
             WHERE race_id = $1 AND time_interval = $2
               AND event_timestamp >= $3 AND event_timestamp < $4
             ORDER BY entrant_id, polling_timestamp DESC",
        SCHEMA
    ))
    .bind(race_id)
    .bind(previous_interval)
    .bind(day_start)
    .bind(day_end)
    .fetch_all(pool)
    .await?;

    let mut buckets = std::collections::HashMap::with_capacity(rows.len());
    for row in rows {
        buckets.insert(
            row.try_get::<String, _>("entrant_id")?,
            PreviousBucket {
                win_pool_amount: row.try_get("win_pool_amount")?,
                place_pool_amount: row.try_get("place_pool_amount")?,
            },
        );
    }
    Ok(buckets)
}

/// Most recent odds per `(entrant_id, type)` in today's partition. Seeds the
/// change detector after a restart so replayed values stay suppressed.
pub async fn load_latest_odds(
    pool: &DbPool,
    race_date: NaiveDate,
    zone: Tz,
) -> Result<Vec<(String, String, f64)>> {
    let (day_start, day_end) = day_bounds(race_date, zone);
    let rows = sqlx::query(&format!(
        "SELECT DISTINCT ON (entrant_id, type) entrant_id, type, odds
             FROM {}.odds_history
             WHERE event_timestamp >= $1 AND event_timestamp < $2
             ORDER BY entrant_id, type, event_timestamp DESC",
        SCHEMA
    ))
    .bind(day_start)
    .bind(day_end)
    .fetch_all(pool)
    .await?;

    let mut latest = Vec::with_capacity(rows.len());
    for row in rows {
        latest.push((
            row.try_get("entrant_id")?,
            row.try_get("type")?,
            row.try_get("odds")?,
        ));
    }
    Ok(latest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn partition_names_follow_the_zone_not_utc() {
        // 13:00 UTC on Oct 12 is already Oct 13 in Auckland during NZDT
        let instant = Utc.with_ymd_and_hms(2025, 10, 12, 13, 0, 0).unwrap();
        assert_eq!(
            partition_name("money_flow_history", instant, chrono_tz::Pacific::Auckland),
            "money_flow_history_2025_10_13"
        );
        assert_eq!(
            partition_name("odds_history", instant, chrono_tz::Tz::UTC),
            "odds_history_2025_10_12"
        );
    }

    #[test]
    fn day_bounds_cover_exactly_one_local_day() {
        let date = NaiveDate::from_ymd_opt(2025, 10, 13).unwrap();
        let (start, end) = day_bounds(date, chrono_tz::Pacific::Auckland);
        assert_eq!(start, Utc.with_ymd_and_hms(2025, 10, 12, 11, 0, 0).unwrap());
        assert_eq!(end, Utc.with_ymd_and_hms(2025, 10, 13, 11, 0, 0).unwrap());
    }

    #[test]
    fn records_straddling_midnight_split_into_two_buckets() {
        let zone = chrono_tz::Pacific::Auckland;
        let before = Utc.with_ymd_and_hms(2025, 10, 12, 10, 59, 0).unwrap();
        let after = Utc.with_ymd_and_hms(2025, 10, 12, 11, 1, 0).unwrap();
        assert_eq!(
            partition_name("odds_history", before, zone),
            "odds_history_2025_10_12"
        );
        assert_eq!(
            partition_name("odds_history", after, zone),
            "odds_history_2025_10_13"
        );
    }
}
