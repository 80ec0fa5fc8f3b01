//! Validated job submission.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use docqueue_core::{DomainError, JobId, SubjectId};

use super::store::{JobStore, JobStoreError};
use super::types::{EnqueueResult, Job, JobType, Priority};

pub const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
pub const MAX_ATTEMPTS_LIMIT: u32 = 25;
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Payload field used as the subject when the request does not name one.
pub const SUBJECT_PAYLOAD_FIELD: &str = "document_id";

/// Unvalidated enqueue request, as received on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnqueueRequest {
    #[serde(rename = "type")]
    pub job_type: String,
    pub idempotency_key: String,
    pub payload: serde_json::Value,
    #[serde(default = "default_priority")]
    pub priority: u8,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subject_id: Option<String>,
}

fn default_priority() -> u8 {
    Priority::BACKGROUND.value()
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_ATTEMPTS
}

impl EnqueueRequest {
    pub fn new(
        job_type: JobType,
        idempotency_key: impl Into<String>,
        payload: serde_json::Value,
        priority: Priority,
    ) -> Self {
        Self {
            job_type: job_type.as_str().to_string(),
            idempotency_key: idempotency_key.into(),
            payload,
            priority: priority.value(),
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            subject_id: None,
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_subject(mut self, subject_id: impl Into<String>) -> Self {
        self.subject_id = Some(subject_id.into());
        self
    }

    /// Check every field and build a fresh `queued` job.
    pub fn validate(self) -> Result<Job, DomainError> {
        let job_type = self.job_type.parse::<JobType>()?;

        if self.idempotency_key.trim().is_empty() {
            return Err(DomainError::validation("idempotency_key must not be empty"));
        }
        if self.idempotency_key.len() > MAX_IDEMPOTENCY_KEY_LEN {
            return Err(DomainError::validation(format!(
                "idempotency_key exceeds {MAX_IDEMPOTENCY_KEY_LEN} bytes"
            )));
        }
        if !self.payload.is_object() {
            return Err(DomainError::validation("payload must be a JSON object"));
        }
        let priority = Priority::new(self.priority)?;
        if !(1..=MAX_ATTEMPTS_LIMIT).contains(&self.max_attempts) {
            return Err(DomainError::validation(format!(
                "max_attempts must be between 1 and {MAX_ATTEMPTS_LIMIT} (got {})",
                self.max_attempts
            )));
        }

        let subject_id = match self.subject_id {
            Some(raw) => Some(SubjectId::parse(raw)?),
            None => self
                .payload
                .get(SUBJECT_PAYLOAD_FIELD)
                .and_then(|v| v.as_str())
                .and_then(|s| SubjectId::parse(s).ok()),
        };

        Ok(Job::queued(
            job_type,
            self.idempotency_key,
            subject_id,
            self.payload,
            priority,
            self.max_attempts,
            Utc::now(),
        ))
    }
}

#[derive(Debug, Error)]
pub enum EnqueueError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Front door of the queue: validates requests and hands them to the store.
#[derive(Debug, Clone)]
pub struct Enqueuer<S> {
    store: S,
}

impl<S: JobStore> Enqueuer<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub async fn enqueue(&self, request: EnqueueRequest) -> Result<EnqueueResult, EnqueueError> {
        let job = request.validate()?;
        let job_type = job.job_type;
        let result = self.store.enqueue(job).await?;

        if result.created {
            info!(job_id = %result.job_id, job_type = %job_type, "job enqueued");
        } else {
            info!(job_id = %result.job_id, job_type = %job_type, "job deduplicated");
        }
        Ok(result)
    }

    /// Enqueue a fresh copy of a terminal job (manual recovery of `failed`/`dead` work).
    pub async fn requeue(&self, job_id: JobId) -> Result<EnqueueResult, EnqueueError> {
        let job = self
            .store
            .get(job_id)
            .await?
            .ok_or(JobStoreError::NotFound(job_id))?;

        if job.state.is_active() {
            return Err(DomainError::conflict(format!("job {job_id} is still {}", job.state)).into());
        }

        let copy = Job::queued(
            job.job_type,
            job.idempotency_key,
            job.subject_id,
            job.payload,
            job.priority,
            job.max_attempts,
            Utc::now(),
        );
        let result = self.store.enqueue(copy).await?;
        info!(original = %job_id, job_id = %result.job_id, created = result.created, "job requeued");
        Ok(result)
    }
}
