//! Job handler abstraction and registry.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

use docqueue_core::{JobId, JobState, SubjectId};
use docqueue_events::StatusEvent;

use super::notify::{METRIC_SIDE_EFFECT_FAILED, Notifier};
use super::types::{Job, JobType};

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Worth retrying (network error, timeout, upstream 5xx).
    #[error("{0}")]
    Transient(String),
    /// Retrying cannot help (bad payload, missing input).
    #[error("{0}")]
    Permanent(String),
}

impl HandlerError {
    pub fn transient(msg: impl Into<String>) -> Self {
        Self::Transient(msg.into())
    }

    pub fn permanent(msg: impl Into<String>) -> Self {
        Self::Permanent(msg.into())
    }

    pub fn is_permanent(&self) -> bool {
        matches!(self, HandlerError::Permanent(_))
    }
}

/// Per-execution view handed to a handler.
#[derive(Debug, Clone)]
pub struct JobContext {
    pub job_id: JobId,
    pub job_type: JobType,
    pub subject_id: Option<SubjectId>,
    /// 1-based number of this attempt.
    pub attempt: u32,
    notifier: Notifier,
}

impl JobContext {
    pub fn new(job: &Job, notifier: Notifier) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            subject_id: job.subject_id.clone(),
            attempt: job.attempts,
            notifier,
        }
    }

    /// Publish a progress milestone. No-op for jobs without a subject.
    pub async fn progress(&self, percentage: u8) {
        if let Some(subject_id) = &self.subject_id {
            self.notifier
                .publish(StatusEvent::progress(
                    subject_id.clone(),
                    self.job_id,
                    JobState::Processing,
                    percentage,
                ))
                .await;
        }
    }

    /// Report a non-essential effect that failed; the job itself carries on.
    pub fn side_effect_failed(&self, effect: &str, error: &dyn std::fmt::Display) {
        warn!(
            job_id = %self.job_id,
            job_type = %self.job_type,
            effect,
            error = %error,
            "side effect failed"
        );
        let subject = self
            .subject_id
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.job_id.to_string());
        self.notifier.record(METRIC_SIDE_EFFECT_FAILED, subject, 1.0);
    }
}

/// Executes one job type.
///
/// Handlers must be idempotent at the effect level: a job may run more than once
/// (retry, stuck reset), so writes are upserts.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), HandlerError>;
}

#[async_trait]
impl<H> JobHandler for Arc<H>
where
    H: JobHandler + ?Sized,
{
    async fn handle(&self, ctx: &JobContext, payload: &serde_json::Value) -> Result<(), HandlerError> {
        (**self).handle(ctx, payload).await
    }
}

/// Job type → handler.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<JobType, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("job_types", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register (or replace) the handler for `job_type`.
    pub fn register<H>(&mut self, job_type: JobType, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers.insert(job_type, Arc::new(handler));
        self
    }

    pub fn with<H>(mut self, job_type: JobType, handler: H) -> Self
    where
        H: JobHandler + 'static,
    {
        self.register(job_type, handler);
        self
    }

    pub fn get(&self, job_type: JobType) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(&job_type).cloned()
    }
}
