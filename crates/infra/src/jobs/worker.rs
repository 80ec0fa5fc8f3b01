//! Worker loop: claim, execute, finalize.

use std::any::Any;
use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use docqueue_core::JobState;
use docqueue_events::StatusEvent;

use super::handler::{HandlerError, HandlerRegistry, JobContext};
use super::notify::{METRIC_DURATION_MS, METRIC_QUEUE_LATENCY_MS, Notifier};
use super::store::{JobStore, JobStoreError};
use super::types::{BackoffPolicy, Job, JobType, Outcome};

/// Worker configuration.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Name for logging.
    pub name: String,
    /// Sleep between claims when nothing is eligible (also after a store error).
    pub poll_interval: Duration,
    pub backoff: BackoffPolicy,
    /// Handler timeout for types without an override.
    pub default_timeout: Duration,
    pub timeouts: HashMap<JobType, Duration>,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            name: "job-worker".to_string(),
            poll_interval: Duration::from_secs(2),
            backoff: BackoffPolicy::default(),
            default_timeout: Duration::from_secs(30),
            timeouts: HashMap::new(),
        }
    }
}

impl WorkerConfig {
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_timeout(mut self, job_type: JobType, timeout: Duration) -> Self {
        self.timeouts.insert(job_type, timeout);
        self
    }

    pub fn timeout_for(&self, job_type: JobType) -> Duration {
        self.timeouts
            .get(&job_type)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Longest timeout any job type can run under.
    pub fn max_timeout(&self) -> Duration {
        JobType::ALL
            .into_iter()
            .map(|t| self.timeout_for(t))
            .max()
            .unwrap_or(self.default_timeout)
    }
}

/// Single cooperative worker. Run more processes to scale out.
pub struct JobWorker<S> {
    store: S,
    handlers: HandlerRegistry,
    notifier: Notifier,
    config: WorkerConfig,
}

impl<S: JobStore> JobWorker<S> {
    pub fn new(store: S, handlers: HandlerRegistry, notifier: Notifier, config: WorkerConfig) -> Self {
        Self {
            store,
            handlers,
            notifier,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Drain the queue until `shutdown` fires. A job in flight is always finalized first.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(worker = %self.config.name, "job worker started");

        while !shutdown.is_cancelled() {
            let idle = match self.tick().await {
                Ok(claimed) => !claimed,
                Err(e) => {
                    error!(worker = %self.config.name, error = %e, "job store unavailable, backing off");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }

        info!(worker = %self.config.name, "job worker stopped");
    }

    /// Claim and process at most one job. Returns whether a job was claimed.
    pub async fn tick(&self) -> Result<bool, JobStoreError> {
        match self.store.claim_next(Utc::now()).await? {
            Some(job) => {
                self.process(job).await?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Execute a claimed job and write its outcome.
    ///
    /// Returns the finalized job, or `None` if the claim was superseded (the job was
    /// reset by the sweeper and picked up again elsewhere).
    pub async fn process(&self, job: Job) -> Result<Option<Job>, JobStoreError> {
        let started = Utc::now();
        let metric_subject = job.metric_subject();

        if let Some(claimed_at) = job.started_at {
            let latency = (claimed_at - job.created_at).num_milliseconds().max(0);
            self.notifier
                .record(METRIC_QUEUE_LATENCY_MS, metric_subject.clone(), latency as f64);
        }

        debug!(
            worker = %self.config.name,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "claimed job"
        );

        if let Some(subject_id) = &job.subject_id {
            self.notifier
                .publish(StatusEvent::progress(
                    subject_id.clone(),
                    job.id,
                    JobState::Processing,
                    0,
                ))
                .await;
        }

        let outcome = match self.execute(&job).await {
            Ok(()) => Outcome::Completed,
            Err(HandlerError::Permanent(error)) => Outcome::failed(error),
            Err(HandlerError::Transient(error)) if job.attempts_exhausted() => {
                Outcome::failed(error)
            }
            Err(HandlerError::Transient(error)) => {
                Outcome::retry_after(self.config.backoff.delay_for_attempt(job.attempts), error)
            }
        };

        let finished = Utc::now();
        self.notifier.record(
            METRIC_DURATION_MS,
            metric_subject,
            (finished - started).num_milliseconds().max(0) as f64,
        );

        let finalized = match self
            .store
            .finalize(job.id, job.attempts, outcome, finished)
            .await
        {
            Ok(job) => job,
            Err(JobStoreError::Conflict(reason)) => {
                warn!(
                    worker = %self.config.name,
                    job_id = %job.id,
                    attempt = job.attempts,
                    reason = %reason,
                    "claim superseded, outcome discarded"
                );
                return Ok(None);
            }
            Err(e) => {
                error!(worker = %self.config.name, job_id = %job.id, error = %e, "finalize failed");
                return Err(e);
            }
        };

        self.announce(&finalized).await;
        Ok(Some(finalized))
    }

    /// Run the handler under its timeout. Panics and timeouts become transient errors.
    async fn execute(&self, job: &Job) -> Result<(), HandlerError> {
        let Some(handler) = self.handlers.get(job.job_type) else {
            warn!(job_id = %job.id, job_type = %job.job_type, "no handler for job type");
            return Err(HandlerError::permanent(format!(
                "no handler registered for job type {}",
                job.job_type
            )));
        };

        let ctx = JobContext::new(job, self.notifier.clone());
        let payload = job.payload.clone();
        let timeout = self.config.timeout_for(job.job_type);

        let mut task = tokio::spawn(async move { handler.handle(&ctx, &payload).await });

        match tokio::time::timeout(timeout, &mut task).await {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) if join_error.is_panic() => {
                let message = panic_message(join_error.into_panic());
                error!(job_id = %job.id, job_type = %job.job_type, panic = %message, "handler panicked");
                Err(HandlerError::transient(format!("handler panicked: {message}")))
            }
            Ok(Err(_)) => Err(HandlerError::transient("handler task cancelled")),
            Err(_) => {
                task.abort();
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    timeout_ms = timeout.as_millis() as u64,
                    "handler timed out"
                );
                Err(HandlerError::transient(format!(
                    "handler timed out after {}ms",
                    timeout.as_millis()
                )))
            }
        }
    }

    async fn announce(&self, job: &Job) {
        match job.state {
            JobState::Completed => {
                info!(job_id = %job.id, job_type = %job.job_type, attempts = job.attempts, "job completed");
            }
            JobState::Queued => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    next_run_at = %job.next_run_at,
                    error = job.error.as_deref().unwrap_or_default(),
                    "job scheduled for retry"
                );
            }
            _ => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    attempts = job.attempts,
                    error = job.error.as_deref().unwrap_or_default(),
                    "job failed"
                );
            }
        }

        let Some(subject_id) = job.subject_id.clone() else {
            return;
        };
        let error = job.error.clone().unwrap_or_default();
        let event = match job.state {
            JobState::Completed => StatusEvent::completed(subject_id, job.id),
            JobState::Queued => StatusEvent::retrying(subject_id, job.id, error),
            _ => StatusEvent::failed(subject_id, job.id, error),
        };
        self.notifier.publish(event).await;
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use serde_json::{Value, json};

    use docqueue_events::{InMemoryStatusChannel, StatusChannel, StatusEventKind};
    use docqueue_observability::InMemoryMetricSink;

    use super::*;
    use crate::jobs::enqueue::{EnqueueRequest, Enqueuer};
    use crate::jobs::handler::JobHandler;
    use crate::jobs::store::InMemoryJobStore;
    use crate::jobs::types::{Priority, StuckResolution};

    struct Succeed;

    #[async_trait]
    impl JobHandler for Succeed {
        async fn handle(&self, ctx: &JobContext, _payload: &Value) -> Result<(), HandlerError> {
            ctx.progress(50).await;
            Ok(())
        }
    }

    struct Fail(HandlerError);

    #[async_trait]
    impl JobHandler for Fail {
        async fn handle(&self, _ctx: &JobContext, _payload: &Value) -> Result<(), HandlerError> {
            Err(self.0.clone())
        }
    }

    struct Hang;

    #[async_trait]
    impl JobHandler for Hang {
        async fn handle(&self, _ctx: &JobContext, _payload: &Value) -> Result<(), HandlerError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(())
        }
    }

    struct Panic;

    #[async_trait]
    impl JobHandler for Panic {
        async fn handle(&self, _ctx: &JobContext, _payload: &Value) -> Result<(), HandlerError> {
            panic!("corrupt page table");
        }
    }

    /// Simulates the sweeper resetting the job and another worker reclaiming it mid-run.
    struct Superseded(Arc<InMemoryJobStore>);

    #[async_trait]
    impl JobHandler for Superseded {
        async fn handle(&self, ctx: &JobContext, _payload: &Value) -> Result<(), HandlerError> {
            let job = self.0.get(ctx.job_id).await.unwrap().unwrap();
            let now = Utc::now();
            self.0
                .reset_stuck(
                    job.id,
                    job.started_at.unwrap(),
                    StuckResolution::Requeue { next_run_at: now },
                    now,
                )
                .await
                .unwrap();
            self.0.claim_next(now).await.unwrap();
            Ok(())
        }
    }

    struct Harness {
        store: Arc<InMemoryJobStore>,
        channel: Arc<InMemoryStatusChannel>,
        metrics: Arc<InMemoryMetricSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                store: InMemoryJobStore::arc(),
                channel: Arc::new(InMemoryStatusChannel::new()),
                metrics: Arc::new(InMemoryMetricSink::new()),
            }
        }

        fn worker(&self, handlers: HandlerRegistry) -> JobWorker<Arc<InMemoryJobStore>> {
            let notifier = Notifier::new(self.channel.clone(), self.metrics.clone());
            let config = WorkerConfig::default().with_timeout(JobType::ExtractPage, Duration::from_millis(50));
            JobWorker::new(self.store.clone(), handlers, notifier, config)
        }

        async fn enqueue(&self, max_attempts: u32) -> docqueue_core::JobId {
            Enqueuer::new(self.store.clone())
                .enqueue(
                    EnqueueRequest::new(
                        JobType::ExtractPage,
                        "extract:doc1:1",
                        json!({"document_id": "doc1", "page": 1}),
                        Priority::IMMEDIATE,
                    )
                    .with_max_attempts(max_attempts),
                )
                .await
                .unwrap()
                .job_id
        }

        async fn job(&self, id: docqueue_core::JobId) -> Job {
            self.store.get(id).await.unwrap().unwrap()
        }
    }

    fn registry<H: JobHandler + 'static>(handler: H) -> HandlerRegistry {
        HandlerRegistry::new().with(JobType::ExtractPage, handler)
    }

    #[tokio::test]
    async fn successful_job_completes_and_notifies() {
        let h = Harness::new();
        let mut events = h.channel.subscribe(&docqueue_core::SubjectId::parse("doc1").unwrap());
        let id = h.enqueue(3).await;

        assert!(h.worker(registry(Succeed)).tick().await.unwrap());

        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 1);

        let kinds: Vec<_> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|e| (e.kind, e.percentage))
            .collect();
        assert_eq!(
            kinds,
            vec![
                (StatusEventKind::Progress, Some(0)),
                (StatusEventKind::Progress, Some(50)),
                (StatusEventKind::Completed, Some(100)),
            ]
        );

        assert_eq!(h.metrics.named(METRIC_QUEUE_LATENCY_MS).len(), 1);
        assert_eq!(h.metrics.named(METRIC_DURATION_MS).len(), 1);
    }

    #[tokio::test]
    async fn transient_failure_is_retried_with_backoff() {
        let h = Harness::new();
        let id = h.enqueue(3).await;
        let before = Utc::now();

        h.worker(registry(Fail(HandlerError::transient("upstream 503"))))
            .tick()
            .await
            .unwrap();

        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.error.as_deref(), Some("upstream 503"));
        assert!(job.started_at.is_none());
        // First failure: 1s * 2^1.
        assert!(job.next_run_at >= before + chrono::Duration::seconds(2));
        assert!(job.next_run_at <= Utc::now() + chrono::Duration::seconds(2));
    }

    #[tokio::test]
    async fn exhausted_attempts_fail_the_job() {
        let h = Harness::new();
        let id = h.enqueue(3).await;
        let worker = h.worker(registry(Fail(HandlerError::transient("boom"))));

        for _ in 0..3 {
            let job = h.store.claim_next(Utc::now() + chrono::Duration::hours(1)).await.unwrap().unwrap();
            worker.process(job).await.unwrap();
        }

        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 3);
        assert_eq!(job.error.as_deref(), Some("boom"));
        assert!(job.completed_at.is_some());
    }

    #[tokio::test]
    async fn permanent_error_fails_immediately() {
        let h = Harness::new();
        let id = h.enqueue(3).await;

        h.worker(registry(Fail(HandlerError::permanent("page out of range"))))
            .tick()
            .await
            .unwrap();

        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn missing_handler_fails_permanently() {
        let h = Harness::new();
        let id = h.enqueue(3).await;

        h.worker(HandlerRegistry::new()).tick().await.unwrap();

        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Failed);
        assert!(job.error.unwrap().contains("no handler"));
    }

    #[tokio::test]
    async fn timeout_is_retried() {
        let h = Harness::new();
        let id = h.enqueue(3).await;

        h.worker(registry(Hang)).tick().await.unwrap();

        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Queued);
        assert!(job.error.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn panic_is_caught_and_retried() {
        let h = Harness::new();
        let id = h.enqueue(3).await;

        h.worker(registry(Panic)).tick().await.unwrap();

        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Queued);
        assert!(job.error.unwrap().contains("corrupt page table"));
    }

    #[tokio::test]
    async fn superseded_claim_discards_outcome() {
        let h = Harness::new();
        let id = h.enqueue(3).await;
        let worker = h.worker(registry(Superseded(h.store.clone())));

        let claimed = h.store.claim_next(Utc::now()).await.unwrap().unwrap();
        assert!(worker.process(claimed).await.unwrap().is_none());

        let job = h.job(id).await;
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 3);
    }

    #[tokio::test]
    async fn empty_queue_reports_idle() {
        let h = Harness::new();
        assert!(!h.worker(registry(Succeed)).tick().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn run_stops_on_shutdown() {
        let h = Harness::new();
        let worker = Arc::new(h.worker(registry(Succeed)));
        let token = CancellationToken::new();

        let task = tokio::spawn({
            let worker = worker.clone();
            let token = token.clone();
            async move { worker.run(token).await }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        token.cancel();

        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[test]
    fn max_timeout_considers_overrides() {
        let config = WorkerConfig::default().with_timeout(JobType::ExtractAndAi, Duration::from_secs(90));
        assert_eq!(config.max_timeout(), Duration::from_secs(90));
        assert_eq!(config.timeout_for(JobType::ExtractPage), Duration::from_secs(30));
    }
}
