//! Partition Provisioner: idempotent creation of the next day's partitions.
//!
//! Daily children of `money_flow_history` / `odds_history` must exist before
//! the time-series writer targets them. "Tomorrow" is resolved in the
//! partitioning zone, so the roll happens at local midnight, not UTC.

use crate::database::{DbPool, PARTITIONED_PARENTS, SCHEMA};
use crate::time_series::{day_bounds, partition_name};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio::time::{sleep, Duration};

/// Postgres duplicate_table; raced CREATEs land here and are not failures.
const DUPLICATE_TABLE: &str = "42P07";

pub struct PartitionProvisioner {
    pool: DbPool,
    zone: Tz,
}

impl PartitionProvisioner {
    pub fn new(pool: DbPool, zone: Tz) -> Self {
        Self { pool, zone }
    }

    /// Create partitions for one calendar date across every parent.
    ///
    /// Non-duplicate failures propagate after the loop finishes, so one bad
    /// parent never blocks the rest.
    pub async fn create_partitions_for(&self, date: NaiveDate) -> Result<Vec<String>> {
        let (from, to) = day_bounds(date, self.zone);
        let mut created = Vec::with_capacity(PARTITIONED_PARENTS.len());
        let mut last_err: Option<anyhow::Error> = None;

        for parent in PARTITIONED_PARENTS {
            let name = partition_name(parent, from, self.zone);
            let sql = format!(
                "CREATE TABLE IF NOT EXISTS {schema}.{name} PARTITION OF {schema}.{parent}
                     FOR VALUES FROM ('{from}') TO ('{to}')",
                schema = SCHEMA,
                name = name,
                parent = parent,
                from = from.to_rfc3339(),
                to = to.to_rfc3339(),
            );
            match sqlx::query(&sql).execute(&self.pool).await {
                Ok(_) => {
                    log::debug!("✅ Partition ready: {}", name);
                    created.push(name);
                }
                Err(e) => {
                    if is_duplicate_table(&e) {
                        // Lost a narrow creation race; the table exists, which
                        // is the outcome we wanted.
                        log::info!("Partition {} already created concurrently", name);
                        created.push(name);
                    } else {
                        log::error!("❌ Failed to create partition {}: {}", name, e);
                        last_err = Some(e.into());
                    }
                }
            }
        }

        match last_err {
            Some(e) => Err(e),
            None => Ok(created),
        }
    }

    /// Tomorrow's partitions in the partitioning zone. Idempotent: a second
    /// call returns the same name set and changes nothing.
    pub async fn create_tomorrow_partitions(&self) -> Result<Vec<String>> {
        let today = Utc::now().with_timezone(&self.zone).date_naive();
        let tomorrow = today
            .succ_opt()
            .ok_or_else(|| anyhow::anyhow!("calendar overflow computing tomorrow"))?;
        self.create_partitions_for(tomorrow).await
    }

    /// Startup provisioning: today first (so the very first cycle can write),
    /// then tomorrow.
    pub async fn run_startup_provisioning(&self) -> Result<Vec<String>> {
        let today = Utc::now().with_timezone(&self.zone).date_naive();
        let mut names = self.create_partitions_for(today).await?;
        names.extend(self.create_tomorrow_partitions().await?);
        log::info!("✅ Startup partitions provisioned: {:?}", names);
        Ok(names)
    }

    /// Daily provisioning loop. Wakes shortly after local midnight in the
    /// partitioning zone (DST-aware), creates tomorrow's partitions, sleeps
    /// again.
    pub async fn start(self: Arc<Self>) {
        log::info!(
            "🚀 Starting partition provisioner (zone: {})",
            self.zone.name()
        );
        loop {
            let wait = self.until_next_run();
            log::debug!("Partition provisioner sleeping {:?}", wait);
            sleep(wait).await;

            match self.create_tomorrow_partitions().await {
                Ok(names) => log::info!("✅ Daily partitions provisioned: {:?}", names),
                Err(e) => log::error!("❌ Daily partition provisioning failed: {}", e),
            }
        }
    }

    /// Time until 00:10 local tomorrow. The ten-minute offset keeps the roll
    /// clear of midnight-boundary writes.
    fn until_next_run(&self) -> Duration {
        let now = Utc::now();
        let today = now.with_timezone(&self.zone).date_naive();
        let tomorrow = match today.succ_opt() {
            Some(d) => d,
            None => return Duration::from_secs(86_400),
        };
        let (midnight, _) = day_bounds(tomorrow, self.zone);
        let target = midnight + ChronoDuration::minutes(10);
        match (target - now).to_std() {
            Ok(wait) => wait,
            Err(_) => Duration::from_secs(60),
        }
    }
}

fn is_duplicate_table(error: &sqlx::Error) -> bool {
    match error {
        sqlx::Error::Database(db) => db.code().as_deref() == Some(DUPLICATE_TABLE),
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partition_bounds_are_one_local_day_apart() {
        let zone = chrono_tz::Pacific::Auckland;
        let date = NaiveDate::from_ymd_opt(2025, 10, 13).unwrap();
        let (from, to) = day_bounds(date, zone);
        assert_eq!(to - from, ChronoDuration::hours(24));
    }

    #[test]
    fn dst_transition_day_is_shorter() {
        // NZ springs forward on 2025-09-28: the local day is 23 hours long
        let zone = chrono_tz::Pacific::Auckland;
        let date = NaiveDate::from_ymd_opt(2025, 9, 28).unwrap();
        let (from, to) = day_bounds(date, zone);
        assert_eq!(to - from, ChronoDuration::hours(23));
    }
}
