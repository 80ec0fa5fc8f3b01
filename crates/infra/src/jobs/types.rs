//! Core job types and policies.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docqueue_core::{DomainError, DomainResult, JobId, JobState, SubjectId};
use docqueue_events::JobStatusView;

/// Handler selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    /// Extract the text content of one document page.
    ExtractPage,
    /// Generate AI enrichment from an already extracted page.
    GenerateAi,
    /// Extraction followed by AI enrichment in one job.
    ExtractAndAi,
}

impl JobType {
    pub const ALL: [JobType; 3] = [JobType::ExtractPage, JobType::GenerateAi, JobType::ExtractAndAi];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobType::ExtractPage => "extract_page",
            JobType::GenerateAi => "generate_ai",
            JobType::ExtractAndAi => "extract_and_ai",
        }
    }
}

impl core::fmt::Display for JobType {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobType {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| DomainError::validation(format!("unknown job type: {s}")))
    }
}

/// Scheduling tier. Lower values are always claimed first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Priority(u8);

impl Priority {
    /// User is waiting on the result.
    pub const IMMEDIATE: Priority = Priority(1);
    /// Likely needed soon (e.g. the next pages).
    pub const PREFETCH: Priority = Priority(2);
    pub const BACKGROUND: Priority = Priority(3);

    pub fn new(value: u8) -> DomainResult<Self> {
        match value {
            1..=3 => Ok(Self(value)),
            other => Err(DomainError::validation(format!(
                "priority must be 1, 2 or 3 (got {other})"
            ))),
        }
    }

    pub fn value(&self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Priority {
    type Error = DomainError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Priority::new(value)
    }
}

impl From<Priority> for u8 {
    fn from(value: Priority) -> Self {
        value.0
    }
}

/// Exponential retry delay, capped.
///
/// `delay = min(base_delay * 2^attempts, max_delay)` where `attempts` is the number of
/// claims the job has already consumed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Delay before the next attempt of a job that has used `attempts` claims.
    pub fn delay_for_attempt(&self, attempts: u32) -> Duration {
        let base_ms = self.base_delay.as_millis().min(u64::MAX as u128) as u64;
        let cap_ms = self.max_delay.as_millis().min(u64::MAX as u128) as u64;

        let factor = 1u64.checked_shl(attempts).unwrap_or(u64::MAX);
        Duration::from_millis(base_ms.saturating_mul(factor).min(cap_ms))
    }
}

/// Result of one execution attempt, as written by `JobStore::finalize`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed,
    /// Back to `queued`, claimable again after `delay`.
    RetryAfter { delay: Duration, error: String },
    /// No more attempts.
    Failed { error: String },
}

impl Outcome {
    pub fn retry_after(delay: Duration, error: impl Into<String>) -> Self {
        Self::RetryAfter {
            delay,
            error: error.into(),
        }
    }

    pub fn failed(error: impl Into<String>) -> Self {
        Self::Failed {
            error: error.into(),
        }
    }
}

/// How the sweeper resolves one stuck job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StuckResolution {
    Requeue { next_run_at: DateTime<Utc> },
    Fail,
}

pub const STUCK_RESET_ERROR: &str = "reset from stuck state";
pub const STUCK_EXHAUSTED_ERROR: &str = "max attempts exceeded (stuck)";

/// A job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    #[serde(rename = "type")]
    pub job_type: JobType,
    pub idempotency_key: String,
    pub subject_id: Option<SubjectId>,
    pub payload: serde_json::Value,
    pub priority: Priority,
    pub state: JobState,
    /// Incremented on every claim.
    pub attempts: u32,
    pub max_attempts: u32,
    /// Earliest time the job may be claimed.
    pub next_run_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    /// A fresh `queued` job, eligible immediately.
    pub fn queued(
        job_type: JobType,
        idempotency_key: String,
        subject_id: Option<SubjectId>,
        payload: serde_json::Value,
        priority: Priority,
        max_attempts: u32,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_type,
            idempotency_key,
            subject_id,
            payload,
            priority,
            state: JobState::Queued,
            attempts: 0,
            max_attempts,
            next_run_at: now,
            created_at: now,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Queued && self.next_run_at <= now
    }

    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }

    /// `attempts` once a stuck reset has charged the lost run, capped at `max_attempts`.
    pub fn attempts_after_stuck_reset(&self) -> u32 {
        self.attempts
            .saturating_add(1)
            .min(self.max_attempts.max(self.attempts))
    }

    /// Label used when tagging metrics: the subject, or the job id when there is none.
    pub fn metric_subject(&self) -> String {
        self.subject_id
            .as_ref()
            .map(|s| s.to_string())
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn status_view(&self) -> JobStatusView {
        JobStatusView {
            job_id: self.id,
            state: self.state,
            attempts: self.attempts,
            max_attempts: self.max_attempts,
            error: self.error.clone(),
            completed_at: self.completed_at,
        }
    }

    /// `queued → processing`.
    pub fn mark_claimed(&mut self, now: DateTime<Utc>) {
        self.state = JobState::Processing;
        self.started_at = Some(now);
        self.attempts += 1;
    }

    /// Apply a finalize outcome to a `processing` job.
    pub fn apply_outcome(&mut self, outcome: &Outcome, now: DateTime<Utc>) {
        match outcome {
            Outcome::Completed => {
                self.state = JobState::Completed;
                self.completed_at = Some(now);
                self.error = None;
            }
            Outcome::RetryAfter { delay, error } => {
                self.state = JobState::Queued;
                self.next_run_at = now + to_chrono(*delay);
                self.started_at = None;
                self.error = Some(error.clone());
            }
            Outcome::Failed { error } => {
                self.state = JobState::Failed;
                self.completed_at = Some(now);
                self.error = Some(error.clone());
            }
        }
    }

    /// Apply a sweeper decision to a stuck `processing` job.
    pub fn apply_stuck_resolution(&mut self, resolution: StuckResolution, now: DateTime<Utc>) {
        self.attempts = self.attempts_after_stuck_reset();
        match resolution {
            StuckResolution::Requeue { next_run_at } => {
                self.state = JobState::Queued;
                self.next_run_at = next_run_at;
                self.started_at = None;
                self.error = Some(STUCK_RESET_ERROR.to_string());
            }
            StuckResolution::Fail => {
                self.state = JobState::Failed;
                self.completed_at = Some(now);
                self.error = Some(STUCK_EXHAUSTED_ERROR.to_string());
            }
        }
    }
}

/// Job counts per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    pub queued: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub dead: u64,
}

impl JobStats {
    pub fn add(&mut self, state: JobState, count: u64) {
        match state {
            JobState::Queued => self.queued += count,
            JobState::Processing => self.processing += count,
            JobState::Completed => self.completed += count,
            JobState::Failed => self.failed += count,
            JobState::Dead => self.dead += count,
        }
    }

    pub fn total(&self) -> u64 {
        self.queued + self.processing + self.completed + self.failed + self.dead
    }
}

/// Result of an enqueue call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnqueueResult {
    pub job_id: JobId,
    /// `false` when an active job with the same idempotency key already existed.
    pub created: bool,
}

pub(crate) fn to_chrono(delay: Duration) -> chrono::Duration {
    chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn job() -> Job {
        Job::queued(
            JobType::ExtractPage,
            "extract:doc1:1".to_string(),
            Some(SubjectId::parse("doc1").unwrap()),
            serde_json::json!({"document_id": "doc1", "page": 1}),
            Priority::IMMEDIATE,
            3,
            Utc::now(),
        )
    }

    #[test]
    fn backoff_schedule_doubles_then_caps() {
        let policy = BackoffPolicy::new(Duration::from_millis(1000), Duration::from_millis(30000));

        let delays: Vec<u128> = (1..=6)
            .map(|attempt| policy.delay_for_attempt(attempt).as_millis())
            .collect();

        assert_eq!(delays, vec![2000, 4000, 8000, 16000, 30000, 30000]);
    }

    #[test]
    fn backoff_saturates_for_huge_attempt_counts() {
        let policy = BackoffPolicy::default();
        assert_eq!(policy.delay_for_attempt(200), Duration::from_secs(30));
    }

    #[test]
    fn priority_rejects_out_of_range() {
        assert!(Priority::new(0).is_err());
        assert!(Priority::new(4).is_err());
        assert_eq!(Priority::new(2).unwrap(), Priority::PREFETCH);
        assert!(serde_json::from_str::<Priority>("7").is_err());
    }

    #[test]
    fn job_type_wire_names() {
        assert_eq!(serde_json::to_string(&JobType::ExtractAndAi).unwrap(), "\"extract_and_ai\"");
        assert_eq!("generate_ai".parse::<JobType>().unwrap(), JobType::GenerateAi);
    }

    #[test]
    fn job_lifecycle_retry_then_complete() {
        let mut job = job();
        let now = Utc::now();

        job.mark_claimed(now);
        assert_eq!(job.state, JobState::Processing);
        assert_eq!(job.attempts, 1);

        job.apply_outcome(&Outcome::retry_after(Duration::from_secs(2), "timeout"), now);
        assert_eq!(job.state, JobState::Queued);
        assert!(!job.is_claimable(now));
        assert!(job.is_claimable(now + chrono::Duration::seconds(2)));
        assert!(job.started_at.is_none());

        job.mark_claimed(now);
        job.apply_outcome(&Outcome::Completed, now);
        assert_eq!(job.state, JobState::Completed);
        assert_eq!(job.attempts, 2);
        assert!(job.error.is_none());
        assert_eq!(job.completed_at, Some(now));
    }

    #[test]
    fn failed_outcome_keeps_error() {
        let mut job = job();
        job.mark_claimed(Utc::now());
        job.apply_outcome(&Outcome::failed("page does not exist"), Utc::now());
        assert_eq!(job.state, JobState::Failed);
        assert_eq!(job.error.as_deref(), Some("page does not exist"));
    }

    #[test]
    fn stuck_resolution_sets_recovery_errors() {
        let now = Utc::now();
        let mut requeued = job();
        requeued.mark_claimed(now);
        requeued.apply_stuck_resolution(StuckResolution::Requeue { next_run_at: now }, now);
        assert_eq!(requeued.error.as_deref(), Some(STUCK_RESET_ERROR));
        assert_eq!(requeued.attempts, 2);
        assert!(requeued.started_at.is_none());

        let mut failed = job();
        failed.mark_claimed(now);
        failed.apply_stuck_resolution(StuckResolution::Fail, now);
        assert_eq!(failed.state, JobState::Failed);
        assert_eq!(failed.error.as_deref(), Some(STUCK_EXHAUSTED_ERROR));
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 256,
            ..ProptestConfig::default()
        })]

        /// Property: delays never decrease with more attempts and never exceed the cap.
        #[test]
        fn backoff_is_monotonic_and_capped(
            base_ms in 1u64..5_000,
            cap_ms in 1u64..120_000,
            attempts in 0u32..80,
        ) {
            let policy = BackoffPolicy::new(
                Duration::from_millis(base_ms),
                Duration::from_millis(cap_ms),
            );
            let current = policy.delay_for_attempt(attempts);
            let next = policy.delay_for_attempt(attempts + 1);

            prop_assert!(current <= next);
            prop_assert!(next <= Duration::from_millis(cap_ms));
        }
    }
}
