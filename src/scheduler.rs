//! Polling Scheduler: one logical timer per active race.
//!
//! A discovery loop re-evaluates the day's races every
//! `reevaluation_interval_ms`, imports the day's meetings and races from the
//! upstream list endpoint, and keeps a timer per eligible race whose period
//! follows the proximity ladder. Timers are retuned in place through a watch
//! channel, ticks are serialized per race by construction plus an in-flight
//! guard, and failures back off exponentially without ever stopping the
//! scheduler itself.

use crate::bulk_upsert;
use crate::database::{self, ActiveRace, DbPool};
use crate::race_processor::RaceProcessor;
use crate::time_buckets::{minutes_to_start, racing_day};
use crate::types::domain::{Meeting, Race, RaceStatus};
use crate::upstream_client::UpstreamClient;
use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use chrono_tz::Tz;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{interval, sleep, timeout};
use tracing::{debug, error, info, warn};

/// Ladder intervals, tightest first.
const CRITICAL_INTERVAL: Duration = Duration::from_secs(30);
const CLOSING_INTERVAL: Duration = Duration::from_secs(60);
const ACTIVE_INTERVAL: Duration = Duration::from_secs(150);
const BASELINE_INTERVAL: Duration = Duration::from_secs(1800);

/// Failure backoff: `min(5s * 2^failures, 2min)`.
const BACKOFF_BASE: Duration = Duration::from_secs(5);
const BACKOFF_CAP: Duration = Duration::from_secs(120);

/// Bounded wait for in-flight ticks at shutdown.
const DRAIN_BUDGET: Duration = Duration::from_secs(10);

/// Target polling interval for a race, or `None` when the race leaves the
/// schedule. Evaluated in order: terminal, critical status, then proximity.
pub fn polling_interval(
    status: RaceStatus,
    minutes_to_start: f64,
    double_frequency: bool,
) -> Option<Duration> {
    if status.is_terminal() {
        return None;
    }
    let base = if status.is_critical() {
        CRITICAL_INTERVAL
    } else if minutes_to_start <= 5.0 {
        CRITICAL_INTERVAL
    } else if minutes_to_start <= 10.0 {
        CLOSING_INTERVAL
    } else if minutes_to_start <= 65.0 {
        ACTIVE_INTERVAL
    } else {
        BASELINE_INTERVAL
    };
    Some(if double_frequency { base / 2 } else { base })
}

pub fn backoff_delay(consecutive_failures: u32) -> Duration {
    let shift = consecutive_failures.min(16);
    let delay = BACKOFF_BASE * 2u32.saturating_pow(shift.saturating_sub(1));
    delay.min(BACKOFF_CAP)
}

#[derive(Debug, Clone)]
enum TimerCommand {
    Run(Duration),
    Stop,
}

struct RaceTimer {
    current_interval: Duration,
    control: watch::Sender<TimerCommand>,
}

enum TickOutcome {
    Success,
    Failure,
    Skipped,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Dormant,
    Active,
}

pub struct SchedulerConfig {
    pub reevaluation_interval: Duration,
    pub batch_size: usize,
    pub double_frequency: bool,
    pub minimum_schedule_delay: Duration,
    pub countries: Vec<String>,
    pub categories: Vec<String>,
    pub batch_delay: Duration,
}

impl SchedulerConfig {
    pub fn from_settings(settings: &crate::settings::Settings) -> Self {
        Self {
            reevaluation_interval: Duration::from_millis(
                settings.scheduler.reevaluation_interval_ms,
            ),
            batch_size: settings.scheduler.batch_size,
            double_frequency: settings.scheduler.double_frequency,
            minimum_schedule_delay: Duration::from_millis(
                settings.scheduler.minimum_schedule_delay_ms,
            ),
            countries: settings.import.countries.clone(),
            categories: settings.import.categories.clone(),
            batch_delay: Duration::from_millis(settings.upstream.batch_delay_ms),
        }
    }
}

pub struct PollingScheduler {
    pool: DbPool,
    processor: Arc<RaceProcessor>,
    client: Arc<UpstreamClient>,
    config: SchedulerConfig,
    zone: Tz,
    timers: DashMap<String, RaceTimer>,
    in_flight: DashMap<String, ()>,
    active: AtomicBool,
    shutting_down: AtomicBool,
}

impl PollingScheduler {
    pub fn new(
        pool: DbPool,
        processor: Arc<RaceProcessor>,
        client: Arc<UpstreamClient>,
        config: SchedulerConfig,
        zone: Tz,
    ) -> Self {
        Self {
            pool,
            processor,
            client,
            config,
            zone,
            timers: DashMap::new(),
            in_flight: DashMap::new(),
            active: AtomicBool::new(false),
            shutting_down: AtomicBool::new(false),
        }
    }

    pub fn state(&self) -> SchedulerState {
        if self.active.load(Ordering::Relaxed) {
            SchedulerState::Active
        } else {
            SchedulerState::Dormant
        }
    }

    pub fn timer_count(&self) -> usize {
        self.timers.len()
    }

    /// Discovery loop. Runs until `shutdown` flips the flag.
    pub fn start(self: Arc<Self>) -> std::pin::Pin<Box<dyn std::future::Future<Output = ()> + Send>> {
        Box::pin(async move {
            info!("🚀 Starting polling scheduler");
            info!("   Reevaluation interval: {:?}", self.config.reevaluation_interval);
            info!("   Batch size: {}", self.config.batch_size);
            if self.config.double_frequency {
                info!("   ⚡ doubleFrequency enabled: all intervals halved");
            }

            let mut ticker = interval(self.config.reevaluation_interval);
            let mut iteration = 0u64;

            loop {
                ticker.tick().await;
                if self.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                iteration += 1;

                match self.clone().reevaluate().await {
                    Ok(state) => {
                        debug!(
                            "✅ [Discovery #{}] state={:?} timers={}",
                            iteration,
                            state,
                            self.timers.len()
                        );
                        crate::metrics::record_scheduler_state(
                            state == SchedulerState::Active,
                            self.timers.len(),
                        );
                    }
                    Err(e) => {
                        error!("❌ [Discovery #{}] reevaluation failed: {:#}", iteration, e);
                    }
                }
            }
            info!("Polling scheduler discovery loop stopped");
        })
    }

    /// One discovery pass: import the day, recompute every target interval,
    /// create/retune/cancel timers, and batch-poll newly eligible races.
    pub fn reevaluate(
        self: Arc<Self>,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<SchedulerState>> + Send>> {
        Box::pin(self.reevaluate_inner())
    }

    async fn reevaluate_inner(self: Arc<Self>) -> Result<SchedulerState> {
        let now = Utc::now();
        let today = racing_day(now, self.zone);

        // Keep the day's meetings and races fresh; an import hiccup must not
        // stall scheduling of what is already stored.
        if let Err(e) = self.import_day(today).await {
            warn!("⚠️ Daily import failed, scheduling from stored races: {:#}", e);
        }

        let races = database::load_active_races(&self.pool, today).await?;

        let dormant = races.is_empty()
            || races
                .iter()
                .map(|r| r.start_time)
                .min()
                .map_or(true, |first| now < first - ChronoDuration::hours(1));

        if dormant {
            if self.active.swap(false, Ordering::Relaxed) {
                info!("💤 Scheduler entering dormant state");
            }
            self.cancel_all_timers();
            return Ok(SchedulerState::Dormant);
        }

        if !self.active.swap(true, Ordering::Relaxed) {
            info!("⏱️ Scheduler entering active state ({} races)", races.len());
        }

        let mut eligible: std::collections::HashSet<String> = std::collections::HashSet::new();
        let mut newly_scheduled: Vec<String> = Vec::new();

        for race in &races {
            let minutes = minutes_to_start(race.start_time, now);
            let Some(target) =
                polling_interval(race.status, minutes, self.config.double_frequency)
            else {
                self.remove_timer(&race.race_id, "terminal status");
                continue;
            };
            eligible.insert(race.race_id.clone());

            match self.timers.get_mut(&race.race_id) {
                Some(mut timer) => {
                    if timer.current_interval != target {
                        info!(
                            event = "scheduler_interval_changed",
                            race_id = %race.race_id,
                            previous_ms = timer.current_interval.as_millis() as u64,
                            next_ms = target.as_millis() as u64,
                            minutes_to_start = minutes,
                            "Retuning race timer"
                        );
                        timer.current_interval = target;
                        let _ = timer.control.send(TimerCommand::Run(target));
                    }
                }
                None => {
                    self.spawn_timer(race, target);
                    newly_scheduled.push(race.race_id.clone());
                }
            }
        }

        // Cancel timers whose race left the eligible set
        let stale: Vec<String> = self
            .timers
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|race_id| !eligible.contains(race_id))
            .collect();
        for race_id in stale {
            self.remove_timer(&race_id, "left eligible set");
        }

        // Newly scheduled races get an immediate first poll, coalesced into
        // batches so a cold start with a full card does not stampede.
        if !newly_scheduled.is_empty() {
            info!(
                "📥 Batch-polling {} newly scheduled races",
                newly_scheduled.len()
            );
            for chunk in newly_scheduled.chunks(self.config.batch_size.max(1)) {
                let claimed = self.claim_in_flight(chunk);
                if claimed.is_empty() {
                    continue;
                }
                let outcome = self
                    .processor
                    .process_races(&claimed, self.config.batch_size.max(1))
                    .await;
                for race_id in &claimed {
                    self.in_flight.remove(race_id);
                }
                debug!(
                    "Batch poll done: {} ok, {} failed, slowest {} ms",
                    outcome.metrics.success_count,
                    outcome.metrics.failed_count,
                    outcome.metrics.max_duration_ms
                );
                for result in &outcome.results {
                    if result.race_finished {
                        self.remove_timer(&result.race_id, "terminal status observed");
                    }
                }
                if chunk.len() == self.config.batch_size.max(1) {
                    sleep(self.config.batch_delay).await;
                }
            }
        }

        Ok(SchedulerState::Active)
    }

    fn spawn_timer(self: &Arc<Self>, race: &ActiveRace, initial: Duration) {
        let (control, mut commands) = watch::channel(TimerCommand::Run(initial));
        let race_id = race.race_id.clone();
        let scheduler = Arc::clone(self);

        info!(
            "➕ Scheduling race {} every {:?} (starts {})",
            race_id, initial, race.start_time
        );

        tokio::spawn(async move {
            let mut current = initial;
            let mut failures: u32 = 0;
            loop {
                let delay = if failures > 0 {
                    backoff_delay(failures)
                } else {
                    current
                };
                tokio::select! {
                    _ = sleep(delay) => {
                        match scheduler.tick(&race_id, current).await {
                            TickOutcome::Success => failures = 0,
                            TickOutcome::Failure => {
                                failures += 1;
                                debug!(
                                    "Race {} failure #{}, backing off {:?}",
                                    race_id,
                                    failures,
                                    backoff_delay(failures)
                                );
                            }
                            TickOutcome::Skipped => {}
                            TickOutcome::Finished => break,
                        }
                    }
                    changed = commands.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let command = commands.borrow().clone();
                        match command {
                            TimerCommand::Run(next) => current = next,
                            TimerCommand::Stop => break,
                        }
                    }
                }
            }
            scheduler.timers.remove(&race_id);
            debug!("Timer for race {} stopped", race_id);
        });

        self.timers.insert(
            race.race_id.clone(),
            RaceTimer {
                current_interval: initial,
                control,
            },
        );
    }

    /// Mark races as in flight, returning the subset that was not already.
    fn claim_in_flight(&self, race_ids: &[String]) -> Vec<String> {
        use dashmap::mapref::entry::Entry;
        race_ids
            .iter()
            .filter(|race_id| match self.in_flight.entry((*race_id).clone()) {
                Entry::Occupied(_) => false,
                Entry::Vacant(vacant) => {
                    vacant.insert(());
                    true
                }
            })
            .cloned()
            .collect()
    }

    /// One timer tick: in-flight guard, bounded processor call, terminal
    /// detection.
    async fn tick(&self, race_id: &str, current_interval: Duration) -> TickOutcome {
        if self.shutting_down.load(Ordering::Relaxed) {
            return TickOutcome::Finished;
        }

        // A previous tick for the same race that has not completed skips this one
        {
            use dashmap::mapref::entry::Entry;
            match self.in_flight.entry(race_id.to_string()) {
                Entry::Occupied(_) => {
                    debug!("Race {} tick skipped: previous tick still in flight", race_id);
                    return TickOutcome::Skipped;
                }
                Entry::Vacant(vacant) => {
                    vacant.insert(());
                }
            }
        }

        let deadline = current_interval
            .saturating_sub(self.config.minimum_schedule_delay)
            .max(Duration::from_secs(1));

        let outcome = match timeout(deadline, self.processor.process_race(race_id)).await {
            Ok(result) => {
                if result.race_finished {
                    info!("🏁 Race {} reached terminal status, dropping timer", race_id);
                    TickOutcome::Finished
                } else if result.success {
                    TickOutcome::Success
                } else {
                    TickOutcome::Failure
                }
            }
            Err(_) => {
                warn!(
                    "⚠️ Race {} tick exceeded deadline {:?}, aborting cycle",
                    race_id, deadline
                );
                TickOutcome::Failure
            }
        };

        self.in_flight.remove(race_id);
        outcome
    }

    fn remove_timer(&self, race_id: &str, reason: &str) {
        if let Some((_, timer)) = self.timers.remove(race_id) {
            info!("➖ Removing timer for race {} ({})", race_id, reason);
            let _ = timer.control.send(TimerCommand::Stop);
        }
    }

    fn cancel_all_timers(&self) {
        let race_ids: Vec<String> = self.timers.iter().map(|e| e.key().clone()).collect();
        for race_id in race_ids {
            self.remove_timer(&race_id, "scheduler dormant");
        }
    }

    /// Upsert the day's meetings and races from the upstream list endpoint,
    /// applying the country and category filters.
    async fn import_day(&self, today: NaiveDate) -> Result<(usize, usize)> {
        let response = self.client.list_races_between(today, today).await?;

        let mut meetings: Vec<Meeting> = Vec::new();
        let mut races: Vec<Race> = Vec::new();

        for summary in &response.data.meetings {
            if !self.config.countries.iter().any(|c| c == &summary.country) {
                continue;
            }
            if !self
                .config
                .categories
                .iter()
                .any(|c| c == &summary.category_name)
            {
                continue;
            }
            let Some(date) = parse_list_date(&summary.date) else {
                warn!("⚠️ Meeting {} has unparseable date {}", summary.meeting, summary.date);
                continue;
            };

            meetings.push(Meeting {
                meeting_id: summary.meeting.clone(),
                name: summary.name.clone(),
                country: summary.country.clone(),
                race_type: summary.category_name.clone(),
                date,
                track_condition: summary.track_condition.clone(),
                tote_status: summary.tote_status.clone(),
                status: summary.state.clone().unwrap_or_else(|| "open".to_string()),
            });

            for race in &summary.races {
                let Some(status) = RaceStatus::from_upstream(&race.status) else {
                    warn!("⚠️ Race {} has unknown status {}", race.id, race.status);
                    continue;
                };
                let (race_date_nz, start_time_nz) =
                    database::race_local_fields(race.start_time, self.zone);
                races.push(Race {
                    race_id: race.id.clone(),
                    meeting_id: summary.meeting.clone(),
                    name: race.name.clone(),
                    race_number: race.race_number,
                    start_time: race.start_time,
                    status,
                    race_date_nz,
                    start_time_nz,
                });
            }
        }

        let meeting_outcome = bulk_upsert::upsert_meetings(&self.pool, &meetings).await?;
        let race_outcome = bulk_upsert::upsert_races(&self.pool, &races).await?;
        if meeting_outcome.row_count > 0 || race_outcome.row_count > 0 {
            info!(
                "📅 Daily import: {} meeting rows, {} race rows changed",
                meeting_outcome.row_count, race_outcome.row_count
            );
        }
        Ok((meetings.len(), races.len()))
    }

    /// Stop discovery, cancel all timers and drain in-flight ticks (bounded).
    pub async fn shutdown(&self) {
        info!("🛑 Scheduler shutting down...");
        self.shutting_down.store(true, Ordering::Relaxed);
        self.cancel_all_timers();

        let drain_started = std::time::Instant::now();
        while !self.in_flight.is_empty() {
            if drain_started.elapsed() > DRAIN_BUDGET {
                warn!(
                    "⚠️ Shutdown drain budget exceeded with {} ticks in flight",
                    self.in_flight.len()
                );
                break;
            }
            sleep(Duration::from_millis(100)).await;
        }
        self.active.store(false, Ordering::Relaxed);
        info!("✅ Scheduler shutdown complete");
    }
}

fn parse_list_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .ok()
        .or_else(|| {
            chrono::DateTime::parse_from_rfc3339(raw)
                .ok()
                .map(|dt| dt.date_naive())
        })
}
