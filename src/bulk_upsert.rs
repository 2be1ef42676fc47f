//! Bulk Writer: transactional multi-row UPSERTs for meetings, races, entrants.
//!
//! Each call borrows one connection, wraps the statement in a transaction and
//! emits a single multi-row parameterized INSERT with an
//! `ON CONFLICT ... DO UPDATE ... WHERE <field> IS DISTINCT FROM
//! EXCLUDED.<field> OR ...` clause. The WHERE clause is the change-detection
//! mechanism: rows whose fields all match the incoming values are not
//! touched, so an identical second call reports zero rows.

use crate::database::{DbPool, SCHEMA};
use crate::types::domain::{Entrant, Meeting, Race, WriteOutcome};
use anyhow::Result;
use std::time::{Duration, Instant};

/// Per-call performance budget. Exceeding it logs a warning, never fails.
const WRITE_BUDGET: Duration = Duration::from_millis(300);

const MEETING_FIELDS: [&str; 8] = [
    "meeting_id",
    "name",
    "country",
    "race_type",
    "date",
    "track_condition",
    "tote_status",
    "status",
];

const RACE_FIELDS: [&str; 8] = [
    "race_id",
    "meeting_id",
    "name",
    "race_number",
    "start_time",
    "status",
    "race_date_nz",
    "start_time_nz",
];

const ENTRANT_FIELDS: [&str; 22] = [
    "entrant_id",
    "race_id",
    "runner_number",
    "name",
    "barrier",
    "is_scratched",
    "is_late_scratched",
    "fixed_win_odds",
    "fixed_place_odds",
    "pool_win_odds",
    "pool_place_odds",
    "hold_percentage",
    "bet_percentage",
    "win_pool_percentage",
    "place_pool_percentage",
    "win_pool_amount",
    "place_pool_amount",
    "jockey",
    "trainer_name",
    "silk_colours",
    "favourite",
    "mover",
];

/// `($1, $2, ...), ($n+1, ...)` tuples for `rows` rows of `cols` columns.
fn value_tuples(rows: usize, cols: usize) -> String {
    (0..rows)
        .map(|r| {
            let params: Vec<String> = (1..=cols).map(|c| format!("${}", r * cols + c)).collect();
            format!("({})", params.join(", "))
        })
        .collect::<Vec<_>>()
        .join(", ")
}

/// Builds the full change-detecting UPSERT statement for one entity table.
///
/// Every non-key field appears both in the `DO UPDATE SET` list and in the
/// `IS DISTINCT FROM` predicate list.
fn upsert_statement(table: &str, pk: &str, fields: &[&str], rows: usize) -> String {
    let non_key: Vec<&&str> = fields.iter().filter(|f| **f != pk).collect();
    let set_list: Vec<String> = non_key
        .iter()
        .map(|f| format!("{} = EXCLUDED.{}", f, f))
        .collect();
    let changed_list: Vec<String> = non_key
        .iter()
        .map(|f| format!("{}.{}.{} IS DISTINCT FROM EXCLUDED.{}", SCHEMA, table, f, f))
        .collect();
    format!(
        "INSERT INTO {schema}.{table} ({columns}) VALUES {tuples}
         ON CONFLICT ({pk}) DO UPDATE SET {sets}, updated_at = NOW()
         WHERE {changed}",
        schema = SCHEMA,
        table = table,
        columns = fields.join(", "),
        tuples = value_tuples(rows, fields.len()),
        pk = pk,
        sets = set_list.join(", "),
        changed = changed_list.join(" OR "),
    )
}

fn warn_if_over_budget(table: &str, outcome: &WriteOutcome) {
    if outcome.duration >= WRITE_BUDGET {
        log::warn!(
            "⚠️ Bulk upsert of {} took {:?} for {} rows (budget {:?})",
            table,
            outcome.duration,
            outcome.row_count,
            WRITE_BUDGET
        );
    }
}

pub async fn upsert_meetings(pool: &DbPool, meetings: &[Meeting]) -> Result<WriteOutcome> {
    if meetings.is_empty() {
        return Ok(WriteOutcome::default());
    }
    let start = Instant::now();
    let sql = upsert_statement("meetings", "meeting_id", &MEETING_FIELDS, meetings.len());

    let mut tx = pool.begin().await?;
    let mut query = sqlx::query(&sql);
    for m in meetings {
        query = query
            .bind(&m.meeting_id)
            .bind(&m.name)
            .bind(&m.country)
            .bind(&m.race_type)
            .bind(m.date)
            .bind(&m.track_condition)
            .bind(&m.tote_status)
            .bind(&m.status);
    }
    let result = query.execute(tx.as_mut()).await?;
    tx.commit().await?;

    let outcome = WriteOutcome {
        row_count: result.rows_affected(),
        duration: start.elapsed(),
    };
    warn_if_over_budget("meetings", &outcome);
    crate::metrics::record_bulk_write("meetings", &outcome);
    Ok(outcome)
}

pub async fn upsert_races(pool: &DbPool, races: &[Race]) -> Result<WriteOutcome> {
    if races.is_empty() {
        return Ok(WriteOutcome::default());
    }
    let start = Instant::now();
    let sql = upsert_statement("races", "race_id", &RACE_FIELDS, races.len());

    let mut tx = pool.begin().await?;
    let mut query = sqlx::query(&sql);
    for r in races {
        query = query
            .bind(&r.race_id)
            .bind(&r.meeting_id)
            .bind(&r.name)
            .bind(r.race_number)
            .bind(r.start_time)
            .bind(r.status.as_str())
            .bind(r.race_date_nz)
            .bind(r.start_time_nz);
    }
    let result = query.execute(tx.as_mut()).await?;
    tx.commit().await?;

    let outcome = WriteOutcome {
        row_count: result.rows_affected(),
        duration: start.elapsed(),
    };
    warn_if_over_budget("races", &outcome);
    crate::metrics::record_bulk_write("races", &outcome);
    Ok(outcome)
}

pub async fn upsert_entrants(pool: &DbPool, entrants: &[Entrant]) -> Result<WriteOutcome> {
    if entrants.is_empty() {
        return Ok(WriteOutcome::default());
    }
    let start = Instant::now();
    let sql = upsert_statement("entrants", "entrant_id", &ENTRANT_FIELDS, entrants.len());

    let mut tx = pool.begin().await?;
    let mut query = sqlx::query(&sql);
    for e in entrants {
        query = query
            .bind(&e.entrant_id)
            .bind(&e.race_id)
            .bind(e.runner_number)
            .bind(&e.name)
            .bind(e.barrier)
            .bind(e.is_scratched)
            .bind(e.is_late_scratched)
            .bind(e.fixed_win_odds)
            .bind(e.fixed_place_odds)
            .bind(e.pool_win_odds)
            .bind(e.pool_place_odds)
            .bind(e.hold_percentage)
            .bind(e.bet_percentage)
            .bind(e.win_pool_percentage)
            .bind(e.place_pool_percentage)
            .bind(e.win_pool_amount)
            .bind(e.place_pool_amount)
            .bind(&e.jockey)
            .bind(&e.trainer_name)
            .bind(&e.silk_colours)
            .bind(e.favourite)
            .bind(e.mover);
    }
    let result = query.execute(tx.as_mut()).await?;
    tx.commit().await?;

    let outcome = WriteOutcome {
        row_count: result.rows_affected(),
        duration: start.elapsed(),
    };
    warn_if_over_budget("entrants", &outcome);
    crate::metrics::record_bulk_write("entrants", &outcome);
    Ok(outcome)
}

/// Upsert the per-race pool totals (single row; change detection included).
pub async fn upsert_race_pools(
    pool: &DbPool,
    pools: &crate::types::domain::RacePools,
) -> Result<WriteOutcome> {
    let start = Instant::now();
    let sql = format!(
        "INSERT INTO {schema}.race_pools
             (race_id, win_pool_total, place_pool_total, quinella_pool_total,
              trifecta_pool_total, exacta_pool_total, first4_pool_total,
              total_race_pool, currency, data_quality_score, extracted_pools, last_updated)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
         ON CONFLICT (race_id) DO UPDATE SET
             win_pool_total = EXCLUDED.win_pool_total,
             place_pool_total = EXCLUDED.place_pool_total,
             quinella_pool_total = EXCLUDED.quinella_pool_total,
             trifecta_pool_total = EXCLUDED.trifecta_pool_total,
             exacta_pool_total = EXCLUDED.exacta_pool_total,
             first4_pool_total = EXCLUDED.first4_pool_total,
             total_race_pool = EXCLUDED.total_race_pool,
             currency = EXCLUDED.currency,
             data_quality_score = EXCLUDED.data_quality_score,
             extracted_pools = EXCLUDED.extracted_pools,
             last_updated = EXCLUDED.last_updated
         WHERE {schema}.race_pools.total_race_pool IS DISTINCT FROM EXCLUDED.total_race_pool
            OR {schema}.race_pools.win_pool_total IS DISTINCT FROM EXCLUDED.win_pool_total
            OR {schema}.race_pools.place_pool_total IS DISTINCT FROM EXCLUDED.place_pool_total
            OR {schema}.race_pools.data_quality_score IS DISTINCT FROM EXCLUDED.data_quality_score",
        schema = SCHEMA
    );

    let mut tx = pool.begin().await?;
    let result = sqlx::query(&sql)
        .bind(&pools.race_id)
        .bind(pools.win_pool_total)
        .bind(pools.place_pool_total)
        .bind(pools.quinella_pool_total)
        .bind(pools.trifecta_pool_total)
        .bind(pools.exacta_pool_total)
        .bind(pools.first4_pool_total)
        .bind(pools.total_race_pool)
        .bind(&pools.currency)
        .bind(pools.data_quality_score)
        .bind(&pools.extracted_pools)
        .bind(pools.last_updated)
        .execute(tx.as_mut())
        .await?;
    tx.commit().await?;

    let outcome = WriteOutcome {
        row_count: result.rows_affected(),
        duration: start.elapsed(),
    };
    warn_if_over_budget("race_pools", &outcome);
    Ok(outcome)
}
