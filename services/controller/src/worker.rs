//! Controller background worker.
//!
//! Keeps one pending run per schedule and executes whichever is due next.
//! A successful cycle is requeued at the schedule's next slot (capped at
//! the resync interval); a failed one is retried with exponential backoff.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use cadence_reconcile::{CronController, ObjectKey, ReconcileError, ReconcileOutcome};
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Upper bound between two cycles of the same schedule.
    pub resync_interval: Duration,
    /// First retry delay after a failed cycle.
    pub retry_base: Duration,
    /// Cap on the retry delay.
    pub retry_max: Duration,
    /// Deadline for a single cycle.
    pub cycle_timeout: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            resync_interval: cadence_reconcile::DEFAULT_RESYNC_INTERVAL,
            retry_base: Duration::from_secs(5),
            retry_max: Duration::from_secs(300),
            cycle_timeout: Duration::from_secs(30),
        }
    }
}

/// Delay before retry number `failures` (1-based).
pub fn backoff(base: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(16);
    base.saturating_mul(1u32 << exponent).min(max)
}

/// Pending runs keyed by schedule, plus consecutive failure counts.
#[derive(Debug, Default)]
pub struct WorkQueue {
    pending: BTreeMap<ObjectKey, Instant>,
    failures: HashMap<ObjectKey, u32>,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the next run of `key`, replacing any earlier one.
    pub fn schedule(&mut self, key: ObjectKey, at: Instant) {
        self.pending.insert(key, at);
    }

    /// Earliest pending run time.
    pub fn next_at(&self) -> Option<Instant> {
        self.pending.values().min().copied()
    }

    /// Removes and returns the earliest key due at or before `now`.
    pub fn pop_due(&mut self, now: Instant) -> Option<ObjectKey> {
        let key = self
            .pending
            .iter()
            .filter(|(_, at)| **at <= now)
            .min_by_key(|(_, at)| **at)
            .map(|(key, _)| key.clone())?;
        self.pending.remove(&key);
        Some(key)
    }

    /// Stops tracking `key`.
    pub fn forget(&mut self, key: &ObjectKey) {
        self.pending.remove(key);
        self.failures.remove(key);
    }

    /// Records a failed cycle; returns the consecutive failure count.
    pub fn record_failure(&mut self, key: &ObjectKey) -> u32 {
        let count = self.failures.entry(key.clone()).or_default();
        *count += 1;
        *count
    }

    pub fn record_success(&mut self, key: &ObjectKey) {
        self.failures.remove(key);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }
}

/// Worker that drives [`CronController`] cycles.
pub struct ControllerWorker {
    controller: Arc<CronController>,
    keys: Vec<ObjectKey>,
    config: WorkerConfig,
}

impl ControllerWorker {
    pub fn new(
        controller: Arc<CronController>,
        keys: Vec<ObjectKey>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            controller,
            keys,
            config,
        }
    }

    /// Run the worker until shutdown is signaled.
    #[instrument(skip(self, shutdown))]
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            schedules = self.keys.len(),
            resync_secs = self.config.resync_interval.as_secs(),
            "Starting controller worker"
        );

        let mut queue = WorkQueue::new();
        let start = Instant::now();
        for key in &self.keys {
            queue.schedule(key.clone(), start);
        }

        loop {
            let Some(wake_at) = queue.next_at() else {
                info!("No schedules left to reconcile");
                while shutdown.changed().await.is_ok() {
                    if *shutdown.borrow() {
                        break;
                    }
                }
                break;
            };

            tokio::select! {
                _ = tokio::time::sleep_until(wake_at) => {
                    while let Some(key) = queue.pop_due(Instant::now()) {
                        self.process(&mut queue, key).await;
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Controller worker shutting down");
    }

    /// Runs one cycle for `key` and requeues it.
    async fn process(&self, queue: &mut WorkQueue, key: ObjectKey) {
        let timeout = self.config.cycle_timeout;
        let result = match tokio::time::timeout(timeout, self.controller.reconcile(&key)).await {
            Ok(result) => result,
            Err(_) => Err(ReconcileError::Timeout(timeout)),
        };

        match result {
            Ok(outcome) if outcome.phase.is_gone() => {
                info!(schedule = %key, "Schedule deleted, no longer tracking it");
                queue.forget(&key);
            }
            Ok(outcome) => {
                queue.record_success(&key);
                let delay = self.requeue_delay(&outcome);
                debug!(
                    schedule = %key,
                    phase = %outcome.phase,
                    delay_secs = delay.as_secs(),
                    "Cycle complete"
                );
                queue.schedule(key, Instant::now() + delay);
            }
            Err(e) if e.is_retryable() => {
                let failures = queue.record_failure(&key);
                let delay = backoff(self.config.retry_base, self.config.retry_max, failures);
                warn!(
                    schedule = %key,
                    error = %e,
                    failures,
                    retry_in_secs = delay.as_secs(),
                    "Cycle failed, retrying"
                );
                queue.schedule(key, Instant::now() + delay);
            }
            Err(e) => {
                error!(
                    schedule = %key,
                    error = %e,
                    "Cycle failed and will not be retried until resync"
                );
                queue.record_success(&key);
                queue.schedule(key, Instant::now() + self.config.resync_interval);
            }
        }
    }

    fn requeue_delay(&self, outcome: &ReconcileOutcome) -> Duration {
        outcome
            .requeue_after
            .map_or(self.config.resync_interval, |d| d.min(self.config.resync_interval))
    }
}
