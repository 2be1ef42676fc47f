//! # Raceday Ingest
//!
//! A soft-real-time race ingestion pipeline: a dynamic per-race polling
//! scheduler fans out fetches against an upstream affiliate racing API, a
//! transform stage recomputes per-entrant pool amounts and money-flow
//! deltas, and a storage stage performs change-detecting bulk UPSERTs plus
//! append-only inserts into daily-partitioned time-series tables on
//! PostgreSQL.
//!
//! ## Overview
//!
//! The pipeline separates the ingestion layer (fetch, validate, transform)
//! from the storage layer (bulk upserts, partitioned time series). It
//! focuses on:
//!
//! - **Scheduling**: one timer per active race, retuned by proximity to start
//! - **Derivation**: stable per-entrant pool amounts and incremental deltas
//! - **Persistence**: change-detected UPSERTs and append-only history rows
//! - **Partitioning**: daily children provisioned ahead of the writes
//!
//! ## Architecture
//!
//! ### Ingestion Layer
//! Polls the affiliate API per race, validates payloads field by field, and
//! derives normalized entities plus time-series records.
//!
//! ### Storage Layer
//! Writes entities through multi-row change-detecting UPSERTs and appends
//! history rows into `money_flow_history` / `odds_history` partitions.
//!
//! ### Scheduling Layer
//! A discovery loop assigns and retunes per-race polling intervals and fans
//! processor invocations out onto the runtime.

// Core Types
/// Domain entities, raw upstream payloads, field conversions
pub mod types;

// Ingestion Layer
/// Per-race fetch → transform → write orchestration
pub mod race_processor;
/// Money-flow and pool derivation from raw snapshots
pub mod transform;
/// HTTP client for the affiliate racing API
pub mod upstream_client;
/// Payload schema validation with per-field errors
pub mod validation;

// Scheduling Layer
/// Dynamic per-race polling scheduler
pub mod scheduler;
/// DST-aware time bucketing and the canonical ladder
pub mod time_buckets;

// Storage Layer
/// Change-detecting multi-row UPSERTs
pub mod bulk_upsert;
/// Connection pool, schema bootstrap, race queries
pub mod database;
/// In-memory odds change suppression
pub mod odds_detector;
/// Daily partition provisioning
pub mod partitions;
/// Append-only partitioned time-series writes
pub mod time_series;

// Infrastructure
/// Metrics and observability (feature-gated)
pub mod metrics;
/// Configuration management
pub mod settings;

// Re-exports for convenience
pub use odds_detector::OddsChangeDetector;
pub use partitions::PartitionProvisioner;
pub use race_processor::RaceProcessor;
pub use scheduler::PollingScheduler;
pub use settings::Settings;
pub use upstream_client::UpstreamClient;
