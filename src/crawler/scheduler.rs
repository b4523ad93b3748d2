//! Periodic and manual triggering of crawl runs
//!
//! This module handles:
//! - Computing the next wall-clock fire time for a schedule
//! - Mutual exclusion between runs (an overlapping trigger is skipped)
//! - Enable/disable and manual "run now" triggers
//! - Graceful shutdown that drains the in-flight run

use crate::config::{parse_time_of_day, Frequency, ScheduleConfig};
use crate::crawler::coordinator::{Orchestrator, RunReport};
use crate::ConfigError;
use chrono::{
    DateTime, Datelike, Duration, Local, LocalResult, NaiveDateTime, NaiveTime, TimeZone, Timelike,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;

/// When scheduled runs fire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleSpec {
    pub frequency: Frequency,
    /// Wall-clock time; only the minute is used for hourly schedules
    pub time: NaiveTime,
}

impl ScheduleSpec {
    pub fn new(frequency: Frequency, time: NaiveTime) -> Self {
        Self { frequency, time }
    }

    pub fn from_config(config: &ScheduleConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(config.frequency, parse_time_of_day(&config.time)?))
    }

    /// First fire time strictly after `now`, in `now`'s time zone
    ///
    /// Weekly schedules fire on Mondays. A fire time that falls into a
    /// daylight-saving gap moves forward to the first valid local time.
    pub fn next_run_after<Tz: TimeZone>(&self, now: &DateTime<Tz>) -> DateTime<Tz> {
        let local = now.naive_local();
        let at_time = local.date().and_time(self.time);

        let (first, step) = match self.frequency {
            Frequency::Hourly => {
                let shift = local.hour() as i64 - self.time.hour() as i64;
                (at_time + Duration::hours(shift), Duration::hours(1))
            }
            Frequency::Daily => (at_time, Duration::days(1)),
            Frequency::Weekly => {
                let until_monday = (7 - local.weekday().num_days_from_monday() as i64) % 7;
                (at_time + Duration::days(until_monday), Duration::weeks(1))
            }
        };

        let candidate = if first > local { first } else { first + step };
        resolve_local(&now.timezone(), candidate)
    }
}

fn resolve_local<Tz: TimeZone>(tz: &Tz, mut naive: NaiveDateTime) -> DateTime<Tz> {
    loop {
        match tz.from_local_datetime(&naive) {
            LocalResult::Single(at) => return at,
            LocalResult::Ambiguous(earliest, _) => return earliest,
            LocalResult::None => naive += Duration::minutes(30),
        }
    }
}

/// Result of asking the scheduler to run
#[derive(Debug)]
pub enum TriggerOutcome {
    Completed(RunReport),
    /// Another run was still in progress
    Skipped,
    /// Scheduled triggers are switched off
    Disabled,
    Failed(String),
}

/// Serializes crawl runs and fires them on a schedule
pub struct Scheduler {
    orchestrator: Arc<Orchestrator>,
    run_lock: Mutex<()>,
    enabled: AtomicBool,
}

impl Scheduler {
    pub fn new(orchestrator: Arc<Orchestrator>, enabled: bool) -> Self {
        Self {
            orchestrator,
            run_lock: Mutex::new(()),
            enabled: AtomicBool::new(enabled),
        }
    }

    /// Scheduler whose triggers start enabled per `schedule.enabled`
    pub fn from_config(orchestrator: Arc<Orchestrator>, config: &ScheduleConfig) -> Self {
        Self::new(orchestrator, config.enabled)
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    pub fn enable(&self) {
        self.enabled.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// Whether a run currently holds the run lock
    pub fn is_running(&self) -> bool {
        self.run_lock.try_lock().is_err()
    }

    /// Manual trigger; works whether or not scheduling is enabled
    pub async fn run_now(&self) -> TriggerOutcome {
        self.execute().await
    }

    /// Scheduled trigger; does nothing while disabled
    pub async fn trigger(&self) -> TriggerOutcome {
        if !self.is_enabled() {
            tracing::debug!("Scheduling disabled, ignoring trigger");
            return TriggerOutcome::Disabled;
        }
        self.execute().await
    }

    async fn execute(&self) -> TriggerOutcome {
        let Ok(_guard) = self.run_lock.try_lock() else {
            tracing::info!("Previous run still in progress, skipping this trigger");
            return TriggerOutcome::Skipped;
        };

        match self.orchestrator.run_once().await {
            Ok(report) => TriggerOutcome::Completed(report),
            Err(e) => {
                tracing::error!("Run failed: {}", e);
                TriggerOutcome::Failed(e.to_string())
            }
        }
    }

    /// Fires runs per `spec` until `shutdown` becomes true
    ///
    /// Each tick runs on its own task, so a long run never delays the next
    /// tick; an overlapping tick is skipped by the run lock. On shutdown no
    /// new URLs are started and the call returns once the in-flight run has
    /// drained, including a manual run started through [`Scheduler::run_now`].
    /// The orchestrator's stop flag is cleared again before returning, so
    /// the same scheduler can serve later runs.
    pub async fn run_scheduled(
        self: Arc<Self>,
        spec: ScheduleSpec,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut runs: JoinSet<TriggerOutcome> = JoinSet::new();

        loop {
            if *shutdown.borrow() {
                break;
            }

            let now = Local::now();
            let next = spec.next_run_after(&now);
            let wait = next.signed_duration_since(now).to_std().unwrap_or_default();
            tracing::info!(
                "Next {} run at {}",
                spec.frequency.as_str(),
                next.format("%Y-%m-%d %H:%M %Z")
            );

            tokio::select! {
                _ = tokio::time::sleep(wait) => {
                    let scheduler = Arc::clone(&self);
                    runs.spawn(async move { scheduler.trigger().await });
                }
                Some(finished) = runs.join_next(), if !runs.is_empty() => {
                    log_outcome(finished);
                }
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
        }

        tracing::info!("Scheduler shutting down, draining in-flight run");
        self.orchestrator.request_stop();
        while let Some(finished) = runs.join_next().await {
            log_outcome(finished);
        }
        drop(self.run_lock.lock().await);
        self.orchestrator.reset_stop();
        tracing::info!("Scheduler stopped");
    }
}

fn log_outcome(finished: Result<TriggerOutcome, tokio::task::JoinError>) {
    match finished {
        Ok(TriggerOutcome::Completed(report)) => match report.run_id {
            Some(id) => tracing::info!(
                "Scheduled run {} finished: {} successful, {} changed, {} failed",
                id,
                report.counts.successful,
                report.counts.changed,
                report.counts.failed + report.counts.blocked + report.counts.rate_limited
            ),
            None => tracing::debug!("Scheduled run found nothing due"),
        },
        Ok(TriggerOutcome::Skipped) | Ok(TriggerOutcome::Disabled) => {}
        Ok(TriggerOutcome::Failed(e)) => tracing::warn!("Scheduled run failed: {}", e),
        Err(e) => tracing::error!("Scheduled run task panicked: {}", e),
    }
}
