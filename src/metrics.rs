// src/metrics.rs
//
// Observability is optional: with the `observability` feature disabled every
// helper below compiles to a no-op, so call sites never carry cfg noise.

use crate::race_processor::StageTimings;
use crate::types::domain::WriteOutcome;

/// Initializes the descriptions for all the metrics in the application.
/// This should be called once at startup.
#[cfg(feature = "observability")]
pub fn describe_metrics() {
    use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};

    describe_gauge!("ingest_up", "Pipeline process liveness (1=up).");
    describe_gauge!(
        "ingest_scheduler_active",
        "Scheduler state (1=active, 0=dormant)."
    );
    describe_gauge!(
        "ingest_scheduler_timers",
        "Number of per-race timers currently running."
    );
    describe_histogram!(
        "ingest_cycle_total_ms",
        Unit::Milliseconds,
        "End-to-end race cycle latency (fetch + transform + write)."
    );
    describe_histogram!(
        "ingest_cycle_fetch_ms",
        Unit::Milliseconds,
        "Upstream fetch component latency per cycle."
    );
    describe_histogram!(
        "ingest_cycle_write_ms",
        Unit::Milliseconds,
        "Database write component latency per cycle."
    );
    describe_counter!(
        "ingest_cycles_total",
        Unit::Count,
        "Race cycles processed, labeled by outcome."
    );
    describe_histogram!(
        "ingest_bulk_write_ms",
        Unit::Milliseconds,
        "Bulk UPSERT latency, labeled by table (budget: 300ms)."
    );
    describe_counter!(
        "ingest_rows_written_total",
        Unit::Count,
        "Rows changed by bulk and time-series writes, labeled by table."
    );
}

#[cfg(not(feature = "observability"))]
pub fn describe_metrics() {}

#[cfg(feature = "observability")]
pub fn record_bulk_write(table: &'static str, outcome: &WriteOutcome) {
    metrics::histogram!(
        "ingest_bulk_write_ms",
        outcome.duration.as_millis() as f64,
        "table" => table
    );
    metrics::counter!(
        "ingest_rows_written_total",
        outcome.row_count,
        "table" => table
    );
}

#[cfg(not(feature = "observability"))]
pub fn record_bulk_write(_table: &'static str, _outcome: &WriteOutcome) {}

#[cfg(feature = "observability")]
pub fn record_time_series_write(table: &'static str, outcome: &WriteOutcome) {
    metrics::histogram!(
        "ingest_bulk_write_ms",
        outcome.duration.as_millis() as f64,
        "table" => table
    );
    metrics::counter!(
        "ingest_rows_written_total",
        outcome.row_count,
        "table" => table
    );
}

#[cfg(not(feature = "observability"))]
pub fn record_time_series_write(_table: &'static str, _outcome: &WriteOutcome) {}

#[cfg(feature = "observability")]
pub fn record_cycle(timings: &StageTimings, success: bool) {
    metrics::histogram!("ingest_cycle_total_ms", timings.total_ms as f64);
    metrics::histogram!("ingest_cycle_fetch_ms", timings.fetch_ms as f64);
    metrics::histogram!("ingest_cycle_write_ms", timings.write_ms as f64);
    metrics::increment_counter!(
        "ingest_cycles_total",
        "outcome" => if success { "success" } else { "failed" }
    );
}

#[cfg(not(feature = "observability"))]
pub fn record_cycle(_timings: &StageTimings, _success: bool) {}

#[cfg(feature = "observability")]
pub fn record_scheduler_state(active: bool, timer_count: usize) {
    metrics::gauge!("ingest_scheduler_active", if active { 1.0 } else { 0.0 });
    metrics::gauge!("ingest_scheduler_timers", timer_count as f64);
}

#[cfg(not(feature = "observability"))]
pub fn record_scheduler_state(_active: bool, _timer_count: usize) {}

#[cfg(feature = "observability")]
pub fn heartbeat() {
    metrics::gauge!("ingest_up", 1.0);
}

#[cfg(not(feature = "observability"))]
pub fn heartbeat() {}
