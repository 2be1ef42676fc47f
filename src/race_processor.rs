//! Race Processor: fetch → transform → write for one race.
//!
//! Each cycle runs the three stages with individual timings, classifies any
//! failure into the error taxonomy, and reports a `ProcessResult` that never
//! aborts the caller. Entity UPSERTs commit in their own transactions; the
//! cycle's time-series rows share one separate transaction (see
//! `time_series::insert_cycle`), so a missing partition loses only the
//! time-series rows for this cycle.

use crate::bulk_upsert;
use crate::database::{self, DbPool};
use crate::odds_detector::{candidates_from_entrants, OddsChangeDetector};
use crate::time_buckets::{minutes_to_start, previous_bucket, racing_day, snap_to_bucket};
use crate::time_series::{self, PartitionNotFoundError};
use crate::transform::{transform_race, TransformContext, TransformedRace};
use crate::upstream_client::{UpstreamClient, UpstreamError};
use chrono::Utc;
use chrono_tz::Tz;
use futures::stream::{self, StreamExt};
use std::sync::Arc;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessStatus {
    Success,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    PartitionMissing,
    Validation,
    Transport,
    DatabaseWrite,
    ConcurrentExecution,
}

impl ErrorCategory {
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ErrorCategory::Transport | ErrorCategory::DatabaseWrite
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::PartitionMissing => "partition_missing",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Transport => "network_timeout",
            ErrorCategory::DatabaseWrite => "database_write",
            ErrorCategory::ConcurrentExecution => "concurrent_execution",
        }
    }
}

/// Walk an error chain into the taxonomy.
pub fn classify_error(error: &anyhow::Error) -> ErrorCategory {
    if error.downcast_ref::<PartitionNotFoundError>().is_some() {
        return ErrorCategory::PartitionMissing;
    }
    if let Some(upstream) = error.downcast_ref::<UpstreamError>() {
        return match upstream {
            UpstreamError::Validation(_) => ErrorCategory::Validation,
            _ => ErrorCategory::Transport,
        };
    }
    if let Some(sqlx::Error::Database(db)) = error.downcast_ref::<sqlx::Error>() {
        // unique_violation under a narrow race is an idempotent no-op
        if db.code().as_deref() == Some("23505") {
            return ErrorCategory::ConcurrentExecution;
        }
    }
    ErrorCategory::DatabaseWrite
}

#[derive(Debug, Clone, Copy, Default)]
pub struct StageTimings {
    pub fetch_ms: u64,
    pub transform_ms: u64,
    pub write_ms: u64,
    pub total_ms: u64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct RowCounts {
    pub meetings: u64,
    pub races: u64,
    pub entrants: u64,
    pub money_flow: u64,
    pub odds: u64,
}

#[derive(Debug, Clone)]
pub struct ProcessResult {
    pub race_id: String,
    pub status: ProcessStatus,
    pub success: bool,
    pub timings: StageTimings,
    pub row_counts: RowCounts,
    pub error: Option<String>,
    pub category: Option<ErrorCategory>,
    /// The upstream payload reported a terminal status; the scheduler drops
    /// the race immediately.
    pub race_finished: bool,
}

impl ProcessResult {
    fn failed(race_id: &str, error: String, category: ErrorCategory, timings: StageTimings) -> Self {
        Self {
            race_id: race_id.to_string(),
            status: ProcessStatus::Failed,
            success: false,
            timings,
            row_counts: RowCounts::default(),
            error: Some(error),
            category: Some(category),
            race_finished: false,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct BatchMetrics {
    pub total_ms: u64,
    pub max_duration_ms: u64,
    pub success_count: usize,
    pub failed_count: usize,
}

#[derive(Debug, Default)]
pub struct BatchOutcome {
    pub results: Vec<ProcessResult>,
    pub errors: Vec<String>,
    pub metrics: BatchMetrics,
}

pub struct RaceProcessor {
    client: Arc<UpstreamClient>,
    pool: DbPool,
    detector: Arc<OddsChangeDetector>,
    zone: Tz,
    provisioner: Option<Arc<crate::partitions::PartitionProvisioner>>,
}

impl RaceProcessor {
    pub fn new(
        client: Arc<UpstreamClient>,
        pool: DbPool,
        detector: Arc<OddsChangeDetector>,
        zone: Tz,
    ) -> Self {
        Self {
            client,
            pool,
            detector,
            zone,
            provisioner: None,
        }
    }

    /// Sets the partition provisioner so a partition-missing failure can
    /// request provisioning out of band instead of waiting for the daily
    /// timer.
    ///
    /// # Returns
    ///
    /// Self for method chaining.
    pub fn with_provisioner(
        mut self,
        provisioner: Arc<crate::partitions::PartitionProvisioner>,
    ) -> Self {
        self.provisioner = Some(provisioner);
        self
    }

    /// One full cycle for one race. Errors never propagate; they are folded
    /// into the returned result with a category the scheduler can act on.
    pub async fn process_race(&self, race_id: &str) -> ProcessResult {
        let cycle_started = Instant::now();
        let mut timings = StageTimings::default();

        // (a) fetch
        let fetch_started = Instant::now();
        let payload = match self.client.fetch_race(race_id).await {
            Ok(payload) => payload,
            Err(e) => {
                timings.fetch_ms = fetch_started.elapsed().as_millis() as u64;
                timings.total_ms = cycle_started.elapsed().as_millis() as u64;
                let category = match &e {
                    UpstreamError::Validation(_) => ErrorCategory::Validation,
                    _ => ErrorCategory::Transport,
                };
                log::error!(
                    "❌ Fetch failed for race {}: {} ({})",
                    race_id,
                    e,
                    category.as_str()
                );
                return ProcessResult::failed(race_id, e.to_string(), category, timings);
            }
        };
        timings.fetch_ms = fetch_started.elapsed().as_millis() as u64;

        // (b) transform
        let transform_started = Instant::now();
        let now = Utc::now();
        let tts = minutes_to_start(payload.race.start_time, now);
        let prev_interval = previous_bucket(snap_to_bucket(tts));
        // "current partition": the racing-zone day the poll lands in
        let race_date = racing_day(now, self.zone);

        let previous_buckets = match time_series::fetch_previous_buckets(
            &self.pool,
            race_id,
            prev_interval,
            race_date,
            self.zone,
        )
        .await
        {
            Ok(map) => map,
            Err(e) => {
                timings.transform_ms = transform_started.elapsed().as_millis() as u64;
                timings.total_ms = cycle_started.elapsed().as_millis() as u64;
                let category = classify_error(&e);
                log::error!(
                    "❌ Previous-bucket lookup failed for race {}: {:#}",
                    race_id,
                    e
                );
                return ProcessResult::failed(race_id, format!("{:#}", e), category, timings);
            }
        };

        let ctx = TransformContext {
            now,
            zone: self.zone,
            previous_buckets,
        };
        let transformed = match transform_race(&payload, &ctx) {
            Ok(t) => t,
            Err(e) => {
                timings.transform_ms = transform_started.elapsed().as_millis() as u64;
                timings.total_ms = cycle_started.elapsed().as_millis() as u64;
                log::error!("❌ Transform failed for race {}: {:#}", race_id, e);
                return ProcessResult::failed(
                    race_id,
                    format!("{:#}", e),
                    ErrorCategory::Validation,
                    timings,
                );
            }
        };
        timings.transform_ms = transform_started.elapsed().as_millis() as u64;

        // (c) write
        let write_started = Instant::now();
        let outcome = self.write_cycle(&payload, &transformed, now).await;
        timings.write_ms = write_started.elapsed().as_millis() as u64;
        timings.total_ms = cycle_started.elapsed().as_millis() as u64;

        match outcome {
            Ok(row_counts) => {
                if let Err(e) = database::touch_last_poll_time(&self.pool, race_id).await {
                    log::warn!("⚠️ Could not record last_poll_time for {}: {:#}", race_id, e);
                }
                crate::metrics::record_cycle(&timings, true);
                ProcessResult {
                    race_id: race_id.to_string(),
                    status: ProcessStatus::Success,
                    success: true,
                    timings,
                    row_counts,
                    error: None,
                    category: None,
                    race_finished: transformed.race.status.is_terminal(),
                }
            }
            Err(e) => {
                let category = classify_error(&e);
                crate::metrics::record_cycle(&timings, false);
                match category {
                    ErrorCategory::ConcurrentExecution => {
                        // Another writer got there first; the rows exist.
                        log::info!(
                            "Concurrent write detected for race {}, treating as no-op",
                            race_id
                        );
                        ProcessResult {
                            race_id: race_id.to_string(),
                            status: ProcessStatus::Skipped,
                            success: true,
                            timings,
                            row_counts: RowCounts::default(),
                            error: None,
                            category: Some(category),
                            race_finished: transformed.race.status.is_terminal(),
                        }
                    }
                    _ => {
                        log::error!(
                            "❌ Write failed for race {} ({}): {:#}",
                            race_id,
                            category.as_str(),
                            e
                        );
                        if category == ErrorCategory::PartitionMissing {
                            // This cycle's time-series rows are lost (the next
                            // cycle re-captures); make sure the partitions
                            // exist before it runs.
                            if let Some(provisioner) = &self.provisioner {
                                let provisioner = provisioner.clone();
                                tokio::spawn(async move {
                                    if let Err(e) =
                                        provisioner.run_startup_provisioning().await
                                    {
                                        log::error!(
                                            "❌ On-demand partition provisioning failed: {:#}",
                                            e
                                        );
                                    }
                                });
                            }
                        }
                        let mut result = ProcessResult::failed(
                            race_id,
                            format!("{:#}", e),
                            category,
                            timings,
                        );
                        // Even a failed write cycle can observe a finished race
                        result.race_finished = transformed.race.status.is_terminal();
                        result
                    }
                }
            }
        }
    }

    async fn write_cycle(
        &self,
        payload: &crate::types::upstream::RaceEventPayload,
        transformed: &TransformedRace,
        now: chrono::DateTime<Utc>,
    ) -> anyhow::Result<RowCounts> {
        let mut counts = RowCounts::default();

        // Entity UPSERTs, each in its own transaction, FK order first.
        if let Some(meeting) = &transformed.meeting {
            counts.meetings = bulk_upsert::upsert_meetings(&self.pool, std::slice::from_ref(meeting))
                .await?
                .row_count;
        }
        counts.races = bulk_upsert::upsert_races(&self.pool, std::slice::from_ref(&transformed.race))
            .await?
            .row_count;
        counts.entrants = bulk_upsert::upsert_entrants(&self.pool, &transformed.entrants)
            .await?
            .row_count;

        if let Some(pools) = &transformed.race_pools {
            bulk_upsert::upsert_race_pools(&self.pool, pools).await?;
        }

        // Results payloads once the race is terminal.
        if transformed.race.status.is_terminal() {
            if let Some(dividends) = &payload.dividends {
                database::upsert_race_results(
                    &self.pool,
                    &transformed.race,
                    serde_json::to_value(&transformed.entrants)?,
                    serde_json::to_value(dividends)?,
                    serde_json::json!({
                        "entrants": transformed
                            .entrants
                            .iter()
                            .map(|e| serde_json::json!({
                                "entrant_id": e.entrant_id,
                                "fixed_win_odds": e.fixed_win_odds,
                                "fixed_place_odds": e.fixed_place_odds,
                            }))
                            .collect::<Vec<_>>()
                    }),
                )
                .await?;
            }
        }

        // Time-series rows share one separate transaction.
        let odds_candidates = candidates_from_entrants(&transformed.entrants, now);
        let accepted_odds = self.detector.filter_records(odds_candidates);
        let (money_outcome, odds_outcome) = time_series::insert_cycle(
            &self.pool,
            &transformed.money_flow_records,
            &accepted_odds,
            self.zone,
        )
        .await?;
        counts.money_flow = money_outcome.row_count;
        counts.odds = odds_outcome.row_count;

        Ok(counts)
    }

    async fn timed_process_race(&self, race_id: &str) -> (ProcessResult, u64) {
        let started = Instant::now();
        let result = self.process_race(race_id).await;
        (result, started.elapsed().as_millis() as u64)
    }

    /// Batch mode: run up to `concurrency` races in parallel, each
    /// independently. One race failing never touches its neighbours.
    pub async fn process_races(&self, race_ids: &[String], concurrency: usize) -> BatchOutcome {
        if race_ids.is_empty() {
            return BatchOutcome::default();
        }
        let batch_started = Instant::now();

        let futures: Vec<_> = race_ids
            .iter()
            .map(|race_id| {
                Box::pin(self.timed_process_race(race_id))
                    as std::pin::Pin<Box<dyn std::future::Future<Output = (ProcessResult, u64)> + Send + '_>>
            })
            .collect();
        let results: Vec<(ProcessResult, u64)> = stream::iter(futures)
            .buffer_unordered(concurrency.max(1))
            .collect()
            .await;

        let mut outcome = BatchOutcome::default();
        for (result, duration_ms) in results {
            outcome.metrics.max_duration_ms = outcome.metrics.max_duration_ms.max(duration_ms);
            if result.success {
                outcome.metrics.success_count += 1;
            } else {
                outcome.metrics.failed_count += 1;
                if let Some(error) = &result.error {
                    outcome.errors.push(format!("{}: {}", result.race_id, error));
                }
            }
            outcome.results.push(result);
        }
        outcome.metrics.total_ms = batch_started.elapsed().as_millis() as u64;
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::validation::ValidationFailure;

    #[test]
    fn upstream_validation_maps_to_validation_category() {
        let error = anyhow::Error::new(UpstreamError::Validation(ValidationFailure {
            errors: vec![],
        }));
        assert_eq!(classify_error(&error), ErrorCategory::Validation);
        assert!(!ErrorCategory::Validation.is_retryable());
    }

    #[test]
    fn transport_failures_are_retryable() {
        let error = anyhow::Error::new(UpstreamError::Network("reset".to_string()));
        assert_eq!(classify_error(&error), ErrorCategory::Transport);
        assert!(ErrorCategory::Transport.is_retryable());
    }

    #[test]
    fn missing_partition_is_terminal_for_the_cycle() {
        let error = anyhow::Error::new(PartitionNotFoundError {
            parent: "money_flow_history".to_string(),
            partition: "money_flow_history_2025_10_13".to_string(),
        });
        assert_eq!(classify_error(&error), ErrorCategory::PartitionMissing);
        assert!(!ErrorCategory::PartitionMissing.is_retryable());
    }

    #[test]
    fn unknown_database_errors_default_to_database_write() {
        let error = anyhow::anyhow!("connection pool exhausted");
        assert_eq!(classify_error(&error), ErrorCategory::DatabaseWrite);
        assert!(ErrorCategory::DatabaseWrite.is_retryable());
    }
}
