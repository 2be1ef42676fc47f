use crate::settings::Settings;
use crate::types::domain::{Race, RaceStatus};
use anyhow::Result;
use chrono::{NaiveDate, NaiveTime};
use sqlx::{postgres::PgPoolOptions, Connection, Pool, Postgres, Row};
use std::time::Duration;

/// PostgreSQL connection pool type alias.
pub type DbPool = Pool<Postgres>;

/// Database schema name.
pub const SCHEMA: &str = "raceday";

/// Partitioned time-series parents owned by the provisioner.
pub const PARTITIONED_PARENTS: [&str; 2] = ["money_flow_history", "odds_history"];

pub async fn connect(settings: &Settings) -> Result<DbPool> {
    let database_url = settings.database.url();

    // Add retries with exponential backoff to survive DNS/startup races in Compose
    let mut last_err: Option<anyhow::Error> = None;
    let max_attempts: u32 = 10;
    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(settings.database.pool_max)
            .acquire_timeout(Duration::from_secs(5))
            .connect(&database_url)
            .await
        {
            Ok(pool) => {
                log::info!(
                    "✅ Connected to database (attempt {}/{}).",
                    attempt,
                    max_attempts
                );
                if let Err(e) = initialize_database(&pool).await {
                    last_err = Some(e);
                } else {
                    return Ok(pool);
                }
            }
            Err(e) => {
                last_err = Some(e.into());
            }
        }
        // Backoff with cap
        let delay_ms = (1u64 << attempt.min(6)) * 200; // 200ms, 400ms, ... capped at ~12.8s
        log::warn!(
            "DB connect/init attempt {}/{} failed. Retrying in {} ms...",
            attempt,
            max_attempts,
            delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }
    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("Unknown DB connection error")))
}

pub async fn initialize_database(pool: &DbPool) -> Result<()> {
    const MIGRATION_LOCK_ID: i64 = 0x5241434544415921; // "RACEDAY!"

    let mut conn = pool.acquire().await?;
    let mut tx = conn.begin().await?;

    log::info!("Acquiring database migration lock...");
    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    let tables_exist = sqlx::query(&format!(
        "SELECT COUNT(*) as count FROM information_schema.tables
             WHERE table_schema = '{}'
             AND table_name IN ('meetings', 'races', 'entrants', 'race_pools')",
        SCHEMA
    ))
    .fetch_one(tx.as_mut())
    .await?
    .try_get::<i64, _>("count")?
        >= 4;

    if tables_exist {
        log::info!("✅ Database schema already exists. Ensuring it is up to date.");
        create_tables(&mut tx).await?;
    } else {
        log::info!("📝 Creating database schema for the first time...");
        sqlx::query(&format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA))
            .execute(tx.as_mut())
            .await?;
        create_tables(&mut tx).await?;
        log::info!("✅ Database schema created successfully!");
    }

    tx.commit().await?;
    log::info!("Database initialization complete, transaction committed.");
    Ok(())
}

async fn create_tables(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> Result<()> {
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.meetings (
            meeting_id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            country TEXT NOT NULL,
            race_type TEXT NOT NULL,
            date DATE NOT NULL,
            track_condition TEXT,
            tote_status TEXT,
            status TEXT NOT NULL,
            updated_at TIMESTAMPTZ DEFAULT NOW()
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.races (
            race_id TEXT PRIMARY KEY,
            meeting_id TEXT NOT NULL REFERENCES {}.meetings(meeting_id),
            name TEXT NOT NULL,
            race_number INTEGER,
            start_time TIMESTAMPTZ NOT NULL,
            status TEXT NOT NULL,
            race_date_nz DATE NOT NULL,
            start_time_nz TIME NOT NULL,
            last_poll_time TIMESTAMPTZ,
            updated_at TIMESTAMPTZ DEFAULT NOW()
        )",
        SCHEMA, SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_races_date_status ON {}.races (race_date_nz, status)",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.entrants (
            entrant_id TEXT PRIMARY KEY,
            race_id TEXT NOT NULL REFERENCES {}.races(race_id),
            runner_number INTEGER NOT NULL CHECK (runner_number >= 0),
            name TEXT NOT NULL,
            barrier INTEGER,
            is_scratched BOOLEAN NOT NULL DEFAULT FALSE,
            is_late_scratched BOOLEAN,
            fixed_win_odds DOUBLE PRECISION,
            fixed_place_odds DOUBLE PRECISION,
            pool_win_odds DOUBLE PRECISION,
            pool_place_odds DOUBLE PRECISION,
            hold_percentage DOUBLE PRECISION,
            bet_percentage DOUBLE PRECISION,
            win_pool_percentage DOUBLE PRECISION,
            place_pool_percentage DOUBLE PRECISION,
            win_pool_amount BIGINT,
            place_pool_amount BIGINT,
            jockey TEXT,
            trainer_name TEXT,
            silk_colours TEXT,
            favourite BOOLEAN,
            mover BOOLEAN,
            updated_at TIMESTAMPTZ DEFAULT NOW()
        )",
        SCHEMA, SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_entrants_race ON {}.entrants (race_id)",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.race_pools (
            race_id TEXT PRIMARY KEY REFERENCES {}.races(race_id),
            win_pool_total BIGINT NOT NULL DEFAULT 0,
            place_pool_total BIGINT NOT NULL DEFAULT 0,
            quinella_pool_total BIGINT NOT NULL DEFAULT 0,
            trifecta_pool_total BIGINT NOT NULL DEFAULT 0,
            exacta_pool_total BIGINT NOT NULL DEFAULT 0,
            first4_pool_total BIGINT NOT NULL DEFAULT 0,
            total_race_pool BIGINT NOT NULL DEFAULT 0,
            currency TEXT NOT NULL DEFAULT 'NZD',
            data_quality_score SMALLINT NOT NULL DEFAULT 100,
            extracted_pools JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            last_updated TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
        SCHEMA, SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.race_results (
            race_id TEXT PRIMARY KEY REFERENCES {}.races(race_id),
            results_data JSONB,
            dividends_data JSONB,
            fixed_odds_data JSONB,
            captured_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )",
        SCHEMA, SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.user_alert_configs (
            id BIGSERIAL PRIMARY KEY,
            user_id TEXT NOT NULL,
            display_order INTEGER NOT NULL,
            config JSONB NOT NULL DEFAULT '{{}}'::jsonb,
            created_at TIMESTAMPTZ DEFAULT NOW()
        )",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE UNIQUE INDEX IF NOT EXISTS idx_user_alert_configs_order
             ON {}.user_alert_configs (user_id, display_order)",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    // Partitioned parents. Children are owned by the partition provisioner.
    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.money_flow_history (
            id BIGSERIAL,
            entrant_id TEXT NOT NULL,
            race_id TEXT NOT NULL,
            time_to_start DOUBLE PRECISION NOT NULL,
            time_interval INTEGER NOT NULL,
            interval_type TEXT NOT NULL,
            event_timestamp TIMESTAMPTZ NOT NULL,
            polling_timestamp TIMESTAMPTZ NOT NULL,
            hold_percentage DOUBLE PRECISION,
            bet_percentage DOUBLE PRECISION,
            win_pool_percentage DOUBLE PRECISION,
            place_pool_percentage DOUBLE PRECISION,
            win_pool_amount BIGINT NOT NULL,
            place_pool_amount BIGINT NOT NULL,
            total_pool_amount BIGINT NOT NULL,
            incremental_win_amount BIGINT NOT NULL,
            incremental_place_amount BIGINT NOT NULL,
            fixed_win_odds DOUBLE PRECISION,
            fixed_place_odds DOUBLE PRECISION,
            pool_win_odds DOUBLE PRECISION,
            pool_place_odds DOUBLE PRECISION
        ) PARTITION BY RANGE (event_timestamp)",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_money_flow_entrant_interval
             ON {}.money_flow_history (entrant_id, race_id, time_interval)",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE TABLE IF NOT EXISTS {}.odds_history (
            id BIGSERIAL,
            entrant_id TEXT NOT NULL,
            race_id TEXT NOT NULL,
            odds DOUBLE PRECISION NOT NULL,
            type TEXT NOT NULL,
            event_timestamp TIMESTAMPTZ NOT NULL
        ) PARTITION BY RANGE (event_timestamp)",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "CREATE INDEX IF NOT EXISTS idx_odds_history_entrant
             ON {}.odds_history (entrant_id, type, event_timestamp)",
        SCHEMA
    ))
    .execute(tx.as_mut())
    .await?;

    Ok(())
}

/// Row shape the scheduler works from.
#[derive(Debug, Clone)]
pub struct ActiveRace {
    pub race_id: String,
    pub start_time: chrono::DateTime<chrono::Utc>,
    pub status: RaceStatus,
}

/// Today's non-terminal races in the racing zone, ordered by start time.
pub async fn load_active_races(pool: &DbPool, race_date: NaiveDate) -> Result<Vec<ActiveRace>> {
    let rows = sqlx::query(&format!(
        "SELECT race_id, start_time, status FROM {}.races
             WHERE race_date_nz = $1 AND status NOT IN ('final', 'abandoned')
             ORDER BY start_time ASC",
        SCHEMA
    ))
    .bind(race_date)
    .fetch_all(pool)
    .await?;

    let mut races = Vec::with_capacity(rows.len());
    for row in rows {
        let raw_status: String = row.try_get("status")?;
        let Some(status) = RaceStatus::from_upstream(&raw_status) else {
            log::warn!("⚠️ Skipping race with unknown stored status: {}", raw_status);
            continue;
        };
        races.push(ActiveRace {
            race_id: row.try_get("race_id")?,
            start_time: row.try_get("start_time")?,
            status,
        });
    }
    Ok(races)
}

/// Record a successful poll on the race row.
pub async fn touch_last_poll_time(pool: &DbPool, race_id: &str) -> Result<()> {
    sqlx::query(&format!(
        "UPDATE {}.races SET last_poll_time = NOW() WHERE race_id = $1",
        SCHEMA
    ))
    .bind(race_id)
    .execute(pool)
    .await?;
    Ok(())
}

/// Liveness probe for the health surface.
pub async fn ping(pool: &DbPool) -> Result<()> {
    sqlx::query("SELECT 1").execute(pool).await?;
    Ok(())
}

/// The local-zone pieces the bulk writer persists on every race row.
pub fn race_local_fields(
    start_time: chrono::DateTime<chrono::Utc>,
    zone: chrono_tz::Tz,
) -> (NaiveDate, NaiveTime) {
    let local = start_time.with_timezone(&zone);
    (local.date_naive(), local.time())
}

/// Upsert the final results payloads for a race that has gone terminal.
pub async fn upsert_race_results(
    pool: &DbPool,
    race: &Race,
    results_data: serde_json::Value,
    dividends_data: serde_json::Value,
    fixed_odds_data: serde_json::Value,
) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO {}.race_results (race_id, results_data, dividends_data, fixed_odds_data, captured_at)
             VALUES ($1, $2, $3, $4, NOW())
             ON CONFLICT (race_id) DO UPDATE SET
                results_data = EXCLUDED.results_data,
                dividends_data = EXCLUDED.dividends_data,
                fixed_odds_data = EXCLUDED.fixed_odds_data,
                captured_at = EXCLUDED.captured_at",
        SCHEMA
    ))
    .bind(&race.race_id)
    .bind(results_data)
    .bind(dividends_data)
    .bind(fixed_odds_data)
    .execute(pool)
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn race_local_fields_resolve_in_racing_zone() {
        // 2025-10-11 23:30 UTC is 2025-10-12 12:30 NZDT: the race day rolls over
        let start = chrono::Utc.with_ymd_and_hms(2025, 10, 11, 23, 30, 0).unwrap();
        let (date, time) = race_local_fields(start, chrono_tz::Pacific::Auckland);
        assert_eq!(date, NaiveDate::from_ymd_opt(2025, 10, 12).unwrap());
        assert_eq!(time, NaiveTime::from_hms_opt(12, 30, 0).unwrap());
    }
}
