//! Recovery sweeper: stuck-job reset, dead-lettering, retention pruning.
//!
//! Every step is safe to run from several processes at once: resets are
//! compare-and-set on the observed `started_at`, and the bulk updates are
//! idempotent.

use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{error, info, warn};

use docqueue_core::JobState;
use docqueue_events::StatusEvent;

use super::notify::Notifier;
use super::store::JobStore;
use super::types::{BackoffPolicy, Job, StuckResolution, to_chrono};

#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often `run_once` is scheduled.
    pub interval: Duration,
    /// A `processing` job older than this is considered orphaned.
    pub stuck_threshold: Duration,
    /// Grace period before a `failed` job becomes `dead`.
    pub dead_letter_after: Duration,
    /// Terminal jobs older than this are deleted.
    pub retention: Duration,
    /// Minimum time between two pruning passes.
    pub prune_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl Default for SweeperConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5 * 60),
            stuck_threshold: Duration::from_secs(5 * 60),
            dead_letter_after: Duration::from_secs(60 * 60),
            retention: Duration::from_secs(7 * 24 * 60 * 60),
            prune_interval: Duration::from_secs(24 * 60 * 60),
            backoff: BackoffPolicy::default(),
        }
    }
}

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SweepReport {
    pub requeued: u64,
    pub failed: u64,
    pub dead_lettered: u64,
    /// `None` when pruning was not due this sweep.
    pub pruned: Option<u64>,
}

pub struct RecoverySweeper<S> {
    store: S,
    notifier: Notifier,
    config: SweeperConfig,
    last_prune: Mutex<Option<DateTime<Utc>>>,
}

impl<S: JobStore> RecoverySweeper<S> {
    pub fn new(store: S, notifier: Notifier, config: SweeperConfig) -> Self {
        Self {
            store,
            notifier,
            config,
            last_prune: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SweeperConfig {
        &self.config
    }

    /// One full sweep. A failing step is logged and does not stop the others.
    pub async fn run_once(&self, now: DateTime<Utc>) -> SweepReport {
        let mut report = SweepReport::default();

        self.reset_stuck(now, &mut report).await;

        match self
            .store
            .dead_letter_failed(now - to_chrono(self.config.dead_letter_after))
            .await
        {
            Ok(moved) => {
                report.dead_lettered = moved.len() as u64;
                for job in &moved {
                    self.announce_dead(job).await;
                }
            }
            Err(e) => error!(error = %e, "dead-lettering failed"),
        }

        if self.prune_due(now) {
            match self
                .store
                .prune_terminal(now - to_chrono(self.config.retention))
                .await
            {
                Ok(count) => {
                    report.pruned = Some(count);
                    if let Ok(mut last) = self.last_prune.lock() {
                        *last = Some(now);
                    }
                }
                Err(e) => error!(error = %e, "retention pruning failed"),
            }
        }

        match self.store.stats().await {
            Ok(stats) => info!(
                queued = stats.queued,
                processing = stats.processing,
                completed = stats.completed,
                failed = stats.failed,
                dead = stats.dead,
                requeued = report.requeued,
                stuck_failed = report.failed,
                dead_lettered = report.dead_lettered,
                pruned = report.pruned.unwrap_or(0),
                "sweep finished"
            ),
            Err(e) => warn!(error = %e, "job stats unavailable"),
        }

        report
    }

    fn prune_due(&self, now: DateTime<Utc>) -> bool {
        let last = self.last_prune.lock().map(|l| *l).unwrap_or(None);
        match last {
            None => true,
            Some(at) => now - at >= to_chrono(self.config.prune_interval),
        }
    }

    async fn reset_stuck(&self, now: DateTime<Utc>, report: &mut SweepReport) {
        let cutoff = now - to_chrono(self.config.stuck_threshold);
        let stuck = match self.store.find_stuck(cutoff).await {
            Ok(stuck) => stuck,
            Err(e) => {
                error!(error = %e, "stuck job lookup failed");
                return;
            }
        };

        for job in stuck {
            let Some(observed) = job.started_at else {
                continue;
            };
            let resolution = self.resolve(&job, now);

            match self.store.reset_stuck(job.id, observed, resolution, now).await {
                Ok(Some(updated)) => {
                    self.announce(&updated).await;
                    if updated.state == JobState::Queued {
                        report.requeued += 1;
                    } else {
                        report.failed += 1;
                    }
                }
                // Finished or reset elsewhere since the lookup.
                Ok(None) => {}
                Err(e) => error!(job_id = %job.id, error = %e, "stuck job reset failed"),
            }
        }
    }

    /// The lost run is charged as one more attempt; the decision uses the charged count.
    fn resolve(&self, job: &Job, now: DateTime<Utc>) -> StuckResolution {
        let attempts = job.attempts_after_stuck_reset();
        if attempts >= job.max_attempts {
            StuckResolution::Fail
        } else {
            StuckResolution::Requeue {
                next_run_at: now + to_chrono(self.config.backoff.delay_for_attempt(attempts)),
            }
        }
    }

    async fn announce(&self, job: &Job) {
        warn!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            state = %job.state,
            "stuck job recovered"
        );

        let Some(subject_id) = job.subject_id.clone() else {
            return;
        };
        let error = job.error.clone().unwrap_or_default();
        let event = if job.state == JobState::Queued {
            StatusEvent::retrying(subject_id, job.id, error)
        } else {
            StatusEvent::failed(subject_id, job.id, error)
        };
        self.notifier.publish(event).await;
    }

    async fn announce_dead(&self, job: &Job) {
        info!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempts = job.attempts,
            "failed job dead-lettered"
        );

        if let Some(subject_id) = job.subject_id.clone() {
            let error = job.error.clone().unwrap_or_default();
            self.notifier
                .publish(StatusEvent::dead_lettered(subject_id, job.id, error))
                .await;
        }
    }
}
