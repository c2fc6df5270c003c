//! Periodic task scheduler.
//!
//! Every component of the tracker (the three collectors, the listing poller,
//! the classifier, the compactor and the summary calculator) runs as an
//! independent [`PeriodicTask`] on its own [`Scheduler`]. There is no shared
//! event loop between them: each scheduler owns a tokio interval and calls its
//! task once per tick.
//!
//! # Tick behaviour
//!
//! - A run that takes longer than the interval delays the next run; missed
//!   ticks are skipped rather than replayed in a burst.
//! - `TaskError::Failed` is logged and the next tick runs normally.
//! - `TaskError::Fatal` stops this scheduler only. Other tasks keep running.
//! - Cancellation is observed between ticks and passed into the task, which
//!   is expected to finish its current item and return early.

use async_trait::async_trait;
use log::{error, info, warn};
use parking_lot::RwLock;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::{interval_at, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::error::TaskError;
use crate::types::now_ms;

/// Configuration for one scheduler.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Interval between runs
    pub interval: Duration,
    /// Whether the scheduler is enabled
    pub enabled: bool,
    /// Run immediately instead of waiting one interval
    pub run_on_start: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(10 * 60),
            enabled: true,
            run_on_start: true,
        }
    }
}

impl SchedulerConfig {
    pub fn every(interval: Duration) -> Self {
        Self {
            interval,
            ..Default::default()
        }
    }
}

/// Counts reported by one run, logged as the run's summary line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunStats {
    pub processed: usize,
    pub succeeded: usize,
    pub no_data: usize,
    pub failed: usize,
    /// Task-specific detail appended to the summary line
    pub note: Option<String>,
}

/// A unit of periodic work.
#[async_trait]
pub trait PeriodicTask: Send + Sync {
    /// Name used in log lines.
    fn name(&self) -> &str;

    /// Runs once. Implementations check `cancel` between items.
    async fn run(&self, cancel: &CancellationToken) -> Result<RunStats, TaskError>;
}

/// Runs store-bound synchronous work on tokio's blocking pool so long sweeps
/// do not stall the async workers. A panic in `work` becomes a failed run.
pub async fn run_blocking<T, F>(work: F) -> Result<T, TaskError>
where
    F: FnOnce() -> Result<T, TaskError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(work)
        .await
        .map_err(|e| TaskError::Failed(format!("blocking run did not complete: {}", e)))?
}

/// Drives one [`PeriodicTask`] on a fixed interval.
pub struct Scheduler {
    task: Arc<dyn PeriodicTask>,
    config: SchedulerConfig,
    /// Timestamp of the last successful run
    last_run_at: Arc<RwLock<Option<u64>>>,
}

impl Scheduler {
    pub fn new(task: Arc<dyn PeriodicTask>, config: SchedulerConfig) -> Self {
        Self {
            task,
            config,
            last_run_at: Arc::new(RwLock::new(None)),
        }
    }

    /// Milliseconds since UNIX epoch of the last successful run.
    pub fn last_run(&self) -> Option<u64> {
        *self.last_run_at.read()
    }

    pub fn task_name(&self) -> &str {
        self.task.name()
    }

    /// Runs until cancelled or until the task reports a fatal error.
    ///
    /// Returns immediately when the scheduler is disabled.
    pub async fn start(self: Arc<Self>, cancel: CancellationToken) {
        let name = self.task.name().to_string();
        if !self.config.enabled {
            info!("Scheduler '{}' is disabled, skipping", name);
            return;
        }

        let period = self.config.interval.max(Duration::from_millis(1));
        info!(
            "Starting scheduler '{}' with {}-second interval",
            name,
            period.as_secs()
        );

        let first = if self.config.run_on_start {
            tokio::time::Instant::now()
        } else {
            tokio::time::Instant::now() + period
        };
        let mut ticker = interval_at(first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }

            if let Err(TaskError::Fatal(reason)) = self.run_once(&cancel).await {
                error!("Scheduler '{}' stopping after fatal error: {}", name, reason);
                break;
            }
            if cancel.is_cancelled() {
                break;
            }
        }

        info!("Scheduler '{}' stopped", name);
    }

    /// Executes one run and logs its summary line.
    pub async fn run_once(&self, cancel: &CancellationToken) -> Result<RunStats, TaskError> {
        let run_id = Uuid::new_v4();
        let start = Instant::now();
        let result = self.task.run(cancel).await;
        let duration_ms = start.elapsed().as_millis();

        match &result {
            Ok(stats) => {
                info!(
                    "{} run {} completed in {}ms: processed={} succeeded={} no_data={} failed={}{}",
                    self.task.name(),
                    run_id,
                    duration_ms,
                    stats.processed,
                    stats.succeeded,
                    stats.no_data,
                    stats.failed,
                    stats
                        .note
                        .as_ref()
                        .map(|n| format!(" ({})", n))
                        .unwrap_or_default()
                );
                *self.last_run_at.write() = Some(now_ms());
            }
            Err(TaskError::Failed(reason)) => {
                warn!(
                    "{} run {} failed after {}ms: {}",
                    self.task.name(),
                    run_id,
                    duration_ms,
                    reason
                );
            }
            Err(TaskError::Fatal(reason)) => {
                error!(
                    "{} run {} failed fatally after {}ms: {}",
                    self.task.name(),
                    run_id,
                    duration_ms,
                    reason
                );
            }
        }
        result
    }
}
