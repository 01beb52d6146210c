//! Fixed-interval, throttled, non-overlapping driver for one tracker instance.

use crate::config::TrackerConfig;
use crate::cycle::{run_cycle, CycleOutcome};
use crate::history::HistoryStore;
use crate::models::TrackerInstance;
use crate::notify::{CycleReport, Notifier};
use crate::{Error, Result};
use futures::FutureExt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Gate deciding whether a tick may start a cycle.
///
/// Attempts are spaced by start time, whatever their outcome: a cycle that
/// found no change still consumes the window. The tracker's start counts as
/// the first attempt.
#[derive(Debug)]
struct Throttle {
    min_interval: Duration,
    in_flight: bool,
    last_attempt: Instant,
}

impl Throttle {
    fn new(min_interval: Duration, started: Instant) -> Self {
        Self {
            min_interval,
            in_flight: false,
            last_attempt: started,
        }
    }

    /// Claim the next attempt. Both fields are updated before the cycle starts.
    fn try_begin(&mut self, now: Instant) -> bool {
        if self.in_flight {
            return false;
        }
        if now.saturating_duration_since(self.last_attempt) < self.min_interval {
            return false;
        }
        self.in_flight = true;
        self.last_attempt = now;
        true
    }

    fn finish(&mut self) {
        self.in_flight = false;
    }
}

/// Handle to a running tracker. Dropping it stops the tracker.
#[must_use = "dropping a TrackerHandle stops the tracker"]
#[derive(Debug)]
pub struct TrackerHandle {
    name: String,
    cancel: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl TrackerHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stop scheduling new cycles. A cycle already running is left to finish.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Stop and wait until any in-flight cycle has completed and been reported.
    #[tracing::instrument(level = "info", skip_all, fields(tracker = %self.name))]
    pub async fn shutdown(mut self) -> Result<()> {
        self.cancel.cancel();
        if let Some(task) = self.task.take() {
            task.await
                .map_err(|e| Error::Internal(format!("tracker scheduler task failed: {e}")))?;
        }
        Ok(())
    }
}

impl Drop for TrackerHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Validate `instance` and start ticking it on the current tokio runtime.
///
/// Configuration errors (missing inputs, unknown dependencies, invalid config)
/// are returned here, before any tick, and nothing is ever reported to
/// `notifier` for them.
#[tracing::instrument(level = "info", skip_all, fields(tracker = %instance.name()))]
pub fn start_tracker(
    instance: TrackerInstance,
    history: Arc<dyn HistoryStore>,
    notifier: Arc<dyn Notifier>,
    config: TrackerConfig,
) -> Result<TrackerHandle> {
    config.validate()?;
    instance.validate()?;

    let name = instance.name().to_string();
    let cancel = CancellationToken::new();
    let scheduler = TrackerScheduler {
        throttle: Throttle::new(instance.image().min_time_to_update(), Instant::now()),
        instance: Arc::new(instance),
        history,
        notifier,
        config,
    };
    let span = tracing::info_span!("tracker.scheduler", tracker = %name);
    let task = tokio::spawn(scheduler.run(cancel.clone()).instrument(span));
    tracing::info!("tracker started");

    Ok(TrackerHandle {
        name,
        cancel,
        task: Some(task),
    })
}

/// Per-instance scheduler state, owned by the scheduling task alone.
struct TrackerScheduler {
    instance: Arc<TrackerInstance>,
    history: Arc<dyn HistoryStore>,
    notifier: Arc<dyn Notifier>,
    config: TrackerConfig,
    throttle: Throttle,
}

type CycleTask = JoinHandle<Result<CycleOutcome>>;

impl TrackerScheduler {
    async fn run(mut self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut in_flight: Option<CycleTask> = None;

        loop {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => break,
                joined = wait_for(&mut in_flight), if in_flight.is_some() => {
                    in_flight = None;
                    self.finish_cycle(joined).await;
                }
                _ = ticker.tick() => {
                    if !self.throttle.try_begin(Instant::now()) {
                        tracing::trace!("tick skipped");
                        continue;
                    }
                    in_flight = Some(self.spawn_cycle());
                }
            }
        }

        // Cooperative drain: the running cycle is never aborted.
        if let Some(task) = in_flight.take() {
            let joined = task.await;
            self.finish_cycle(joined).await;
        }
        tracing::info!("tracker stopped");
    }

    fn spawn_cycle(&self) -> CycleTask {
        let instance = self.instance.clone();
        let history = self.history.clone();
        let notifier = self.notifier.clone();
        let producer_timeout = self.config.producer_timeout;
        tokio::spawn(
            async move {
                run_cycle(
                    &instance,
                    history.as_ref(),
                    notifier.as_ref(),
                    producer_timeout,
                )
                .await
            }
            .in_current_span(),
        )
    }

    async fn finish_cycle(&mut self, joined: std::result::Result<Result<CycleOutcome>, JoinError>) {
        self.throttle.finish();
        let err = match joined {
            Ok(Ok(outcome)) => {
                tracing::debug!(%outcome, "update cycle finished");
                return;
            }
            Ok(Err(e)) => e,
            Err(e) => Error::Internal(format!("update cycle aborted: {e}")),
        };
        tracing::error!(error = %err, "update cycle failed");
        let report = CycleReport::Fatal(err);
        let notified = AssertUnwindSafe(self.notifier.notify(&report, self.history.as_ref()))
            .catch_unwind()
            .await;
        if notified.is_err() {
            tracing::error!("notifier panicked while reporting a failed cycle");
        }
    }
}

async fn wait_for(task: &mut Option<CycleTask>) -> std::result::Result<Result<CycleOutcome>, JoinError> {
    match task {
        Some(task) => task.await,
        None => std::future::pending().await,
    }
}
