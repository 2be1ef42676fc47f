//! # Race Poller Service
//!
//! Continuous service that runs the race ingestion pipeline: daily partition
//! provisioning, the polling scheduler, and the odds change detector warm-up.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin race_poller
//! ```
//!
//! Press Ctrl+C to stop gracefully.

use anyhow::Result;
use clap::Parser;
use raceday_ingest::{
    database, scheduler::SchedulerConfig, time_buckets::racing_day, OddsChangeDetector,
    PartitionProvisioner, PollingScheduler, RaceProcessor, Settings, UpstreamClient,
};
use std::sync::Arc;
use tokio::signal;

#[derive(Parser, Debug)]
#[command(name = "race_poller", about = "Raceday ingestion daemon")]
struct Args {
    /// Run startup partition provisioning and exit.
    #[arg(long)]
    provision_only: bool,

    /// Skip the scheduler (partitions and warm-up only).
    #[arg(long)]
    no_scheduler: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    env_logger::init();
    #[cfg(feature = "observability")]
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    println!("🚀 Starting Race Poller Service");
    println!("═══════════════════════════════════════════════════════════════════\n");

    // 1. Load settings
    let settings = Settings::new()?;
    let zone = settings
        .racing_zone()
        .ok_or_else(|| anyhow::anyhow!("partitions.zone failed to parse after validation"))?;
    println!("✅ Settings loaded (zone: {})", zone.name());

    // 2. Connect to database (schema bootstraps inside)
    let pool = database::connect(&settings).await?;
    println!("✅ Database connected");

    #[cfg(feature = "observability")]
    {
        use metrics_exporter_prometheus::PrometheusBuilder;
        PrometheusBuilder::new().install()?;
        println!("✅ Prometheus exporter started");
    }
    raceday_ingest::metrics::describe_metrics();

    // Health heartbeat: database liveness + process-up gauge
    {
        let health_pool = pool.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(60));
            loop {
                ticker.tick().await;
                raceday_ingest::metrics::heartbeat();
                if let Err(e) = database::ping(&health_pool).await {
                    log::error!("🚨 Database liveness check failed: {:#}", e);
                }
            }
        });
    }

    // 3. Provision partitions before anything writes
    let provisioner = Arc::new(PartitionProvisioner::new(pool.clone(), zone));
    if settings.partitions.run_on_startup || args.provision_only {
        let names = provisioner.run_startup_provisioning().await?;
        println!("✅ Partitions provisioned: {}", names.join(", "));
    }
    if args.provision_only {
        return Ok(());
    }

    // 4. Upstream client + odds detector
    let client = Arc::new(UpstreamClient::new(&settings)?);
    println!("✅ Upstream client ready ({})", settings.upstream.base_url);

    let detector = Arc::new(OddsChangeDetector::new(settings.odds_detector.minimum_change));
    if settings.odds_detector.warm_up_on_start {
        let today = racing_day(chrono::Utc::now(), zone);
        match detector.warm_up(&pool, today, zone).await {
            Ok(count) => println!("✅ Odds detector warmed up ({} keys)", count),
            Err(e) => log::warn!("⚠️ Odds detector warm-up failed: {:#}. Continuing cold.", e),
        }
    }

    // 5. Processor + scheduler
    let processor = Arc::new(
        RaceProcessor::new(client.clone(), pool.clone(), detector.clone(), zone)
            .with_provisioner(provisioner.clone()),
    );

    // Daily partition roll runs regardless of the scheduler
    tokio::spawn(provisioner.clone().start());
    println!("✅ Partition provisioner started");

    if args.no_scheduler || !settings.scheduler.enabled {
        println!("⏸️ Scheduler disabled; running maintenance only. Ctrl+C to stop.");
        signal::ctrl_c().await?;
        return Ok(());
    }

    let scheduler = Arc::new(PollingScheduler::new(
        pool.clone(),
        processor,
        client,
        SchedulerConfig::from_settings(&settings),
        zone,
    ));
    tokio::spawn(scheduler.clone().start());
    println!("✅ Polling scheduler started");
    println!("\nPress Ctrl+C to stop gracefully.\n");

    signal::ctrl_c().await?;
    println!("\n🛑 Ctrl+C received, shutting down...");
    scheduler.shutdown().await;
    pool.close().await;
    println!("✅ Shutdown complete");
    Ok(())
}
