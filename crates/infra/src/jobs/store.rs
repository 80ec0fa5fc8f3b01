//! Job storage.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use docqueue_core::{JobId, JobState, SubjectId};

use super::types::{EnqueueResult, Job, JobStats, Outcome, StuckResolution};

/// Durable job storage.
///
/// All mutating operations are atomic with respect to each other: no two callers can
/// both claim the same job, and at most one active job exists per idempotency key.
/// Operations take `now` explicitly so the time base is the caller's.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert `job`, unless an active (`queued`/`processing`) job with the same
    /// idempotency key exists, in which case that job's id is returned with
    /// `created = false`.
    async fn enqueue(&self, job: Job) -> Result<EnqueueResult, JobStoreError>;

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Jobs for a subject, newest first.
    async fn list_by_subject(
        &self,
        subject_id: &SubjectId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError>;

    /// Atomically claim the best eligible job: `queued`, `next_run_at <= now`, lowest
    /// priority value, then oldest. The returned job is already `processing` with
    /// `attempts` incremented and `started_at = now`.
    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError>;

    /// Write the outcome of the attempt numbered `attempt`.
    ///
    /// Fails with [`JobStoreError::Conflict`] if the job is no longer `processing` under
    /// that attempt (e.g. the sweeper reset it and another worker reclaimed it).
    async fn finalize(
        &self,
        job_id: JobId,
        attempt: u32,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// `processing` jobs whose `started_at` is older than `started_before`.
    async fn find_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Resolve a stuck job if it is still `processing` with the observed `started_at`.
    ///
    /// Returns the updated job, or `None` if it moved on in the meantime.
    async fn reset_stuck(
        &self,
        job_id: JobId,
        observed_started_at: DateTime<Utc>,
        resolution: StuckResolution,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError>;

    /// Move `failed` jobs completed before `before` to `dead`. Returns the moved jobs.
    async fn dead_letter_failed(&self, before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError>;

    /// Delete terminal jobs completed before `before`. Returns the count.
    async fn prune_terminal(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError>;

    async fn stats(&self) -> Result<JobStats, JobStoreError>;
}

#[async_trait]
impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    async fn enqueue(&self, job: Job) -> Result<EnqueueResult, JobStoreError> {
        (**self).enqueue(job).await
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id).await
    }

    async fn list_by_subject(
        &self,
        subject_id: &SubjectId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        (**self).list_by_subject(subject_id, limit).await
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        (**self).claim_next(now).await
    }

    async fn finalize(
        &self,
        job_id: JobId,
        attempt: u32,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).finalize(job_id, attempt, outcome, now).await
    }

    async fn find_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_stuck(started_before).await
    }

    async fn reset_stuck(
        &self,
        job_id: JobId,
        observed_started_at: DateTime<Utc>,
        resolution: StuckResolution,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        (**self)
            .reset_stuck(job_id, observed_started_at, resolution, now)
            .await
    }

    async fn dead_letter_failed(&self, before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        (**self).dead_letter_failed(before).await
    }

    async fn prune_terminal(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        (**self).prune_terminal(before).await
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        (**self).stats().await
    }
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// A compare-and-set lost against a concurrent transition.
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("storage error: {0}")]
    Storage(String),
}

#[derive(Debug, Default)]
struct Inner {
    jobs: HashMap<JobId, Job>,
    /// Insertion order; tie-breaker for equal `created_at`.
    seq: HashMap<JobId, u64>,
    next_seq: u64,
    /// Idempotency key → active job.
    active_keys: HashMap<String, JobId>,
}

impl Inner {
    fn release_key_if_terminal(&mut self, job: &Job) {
        if !job.state.is_active() && self.active_keys.get(&job.idempotency_key) == Some(&job.id) {
            self.active_keys.remove(&job.idempotency_key);
        }
    }
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    inner: RwLock<Inner>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Inner>, JobStoreError> {
        self.inner
            .read()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Inner>, JobStoreError> {
        self.inner
            .write()
            .map_err(|_| JobStoreError::Storage("job store lock poisoned".to_string()))
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: Job) -> Result<EnqueueResult, JobStoreError> {
        let mut inner = self.write()?;

        if let Some(existing) = inner.active_keys.get(&job.idempotency_key) {
            return Ok(EnqueueResult {
                job_id: *existing,
                created: false,
            });
        }

        let id = job.id;
        let seq = inner.next_seq;
        inner.next_seq += 1;
        inner.seq.insert(id, seq);
        if job.state.is_active() {
            inner.active_keys.insert(job.idempotency_key.clone(), id);
        }
        inner.jobs.insert(id, job);

        Ok(EnqueueResult {
            job_id: id,
            created: true,
        })
    }

    async fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    async fn list_by_subject(
        &self,
        subject_id: &SubjectId,
        limit: usize,
    ) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut result: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| j.subject_id.as_ref() == Some(subject_id))
            .cloned()
            .collect();

        result.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| inner.seq.get(&b.id).cmp(&inner.seq.get(&a.id)))
        });
        result.truncate(limit);
        Ok(result)
    }

    async fn claim_next(&self, now: DateTime<Utc>) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;

        let next = inner
            .jobs
            .values()
            .filter(|j| j.is_claimable(now))
            .min_by_key(|j| (j.priority, j.created_at, inner.seq.get(&j.id).copied()))
            .map(|j| j.id);

        let Some(job_id) = next else {
            return Ok(None);
        };

        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        job.mark_claimed(now);
        Ok(Some(job.clone()))
    }

    async fn finalize(
        &self,
        job_id: JobId,
        attempt: u32,
        outcome: Outcome,
        now: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut inner = self.write()?;

        let job = inner
            .jobs
            .get_mut(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;

        if job.state != JobState::Processing || job.attempts != attempt {
            return Err(JobStoreError::Conflict(format!(
                "job {job_id} is {} at attempt {}, expected processing at attempt {attempt}",
                job.state, job.attempts
            )));
        }

        job.apply_outcome(&outcome, now);
        let job = job.clone();
        inner.release_key_if_terminal(&job);
        Ok(job)
    }

    async fn find_stuck(&self, started_before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let inner = self.read()?;
        let mut stuck: Vec<_> = inner
            .jobs
            .values()
            .filter(|j| {
                j.state == JobState::Processing
                    && j.started_at.is_some_and(|started| started < started_before)
            })
            .cloned()
            .collect();
        stuck.sort_by_key(|j| j.started_at);
        Ok(stuck)
    }

    async fn reset_stuck(
        &self,
        job_id: JobId,
        observed_started_at: DateTime<Utc>,
        resolution: StuckResolution,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>, JobStoreError> {
        let mut inner = self.write()?;

        let Some(job) = inner.jobs.get_mut(&job_id) else {
            return Ok(None);
        };
        if job.state != JobState::Processing || job.started_at != Some(observed_started_at) {
            return Ok(None);
        }

        job.apply_stuck_resolution(resolution, now);
        let job = job.clone();
        inner.release_key_if_terminal(&job);
        Ok(Some(job))
    }

    async fn dead_letter_failed(&self, before: DateTime<Utc>) -> Result<Vec<Job>, JobStoreError> {
        let mut inner = self.write()?;
        let mut moved = Vec::new();
        for job in inner.jobs.values_mut() {
            if job.state == JobState::Failed && job.completed_at.is_some_and(|at| at < before) {
                job.state = JobState::Dead;
                moved.push(job.clone());
            }
        }
        Ok(moved)
    }

    async fn prune_terminal(&self, before: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut inner = self.write()?;

        let expired: Vec<JobId> = inner
            .jobs
            .values()
            .filter(|j| j.state.is_terminal() && j.completed_at.is_some_and(|at| at < before))
            .map(|j| j.id)
            .collect();

        for id in &expired {
            inner.jobs.remove(id);
            inner.seq.remove(id);
        }
        Ok(expired.len() as u64)
    }

    async fn stats(&self) -> Result<JobStats, JobStoreError> {
        let inner = self.read()?;
        let mut stats = JobStats::default();
        for job in inner.jobs.values() {
            stats.add(job.state, 1);
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::Duration as ChronoDuration;

    use proptest::prelude::*;

    use super::*;
    use crate::jobs::types::{JobType, Priority};

    fn subject(s: &str) -> SubjectId {
        SubjectId::parse(s).unwrap()
    }

    fn job(key: &str, priority: Priority, created_at: DateTime<Utc>) -> Job {
        Job::queued(
            JobType::ExtractPage,
            key.to_string(),
            Some(subject("doc1")),
            serde_json::json!({"document_id": "doc1", "page": 1}),
            priority,
            3,
            created_at,
        )
    }

    #[tokio::test]
    async fn enqueue_deduplicates_active_keys() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let first = store.enqueue(job("k", Priority::IMMEDIATE, now)).await.unwrap();
        let second = store.enqueue(job("k", Priority::IMMEDIATE, now)).await.unwrap();

        assert!(first.created);
        assert!(!second.created);
        assert_eq!(first.job_id, second.job_id);
        assert_eq!(store.stats().await.unwrap().total(), 1);
    }

    #[tokio::test]
    async fn key_is_reusable_after_terminal_state() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let first = store.enqueue(job("k", Priority::IMMEDIATE, now)).await.unwrap();
        let claimed = store.claim_next(now).await.unwrap().unwrap();
        store
            .finalize(claimed.id, claimed.attempts, Outcome::Completed, now)
            .await
            .unwrap();

        let again = store.enqueue(job("k", Priority::IMMEDIATE, now)).await.unwrap();
        assert!(again.created);
        assert_ne!(again.job_id, first.job_id);
    }

    #[tokio::test]
    async fn claim_orders_by_priority_then_age_then_insertion() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();

        let old_background = store
            .enqueue(job("a", Priority::BACKGROUND, t0))
            .await
            .unwrap()
            .job_id;
        let prefetch_1 = store
            .enqueue(job("b", Priority::PREFETCH, t0 + ChronoDuration::seconds(1)))
            .await
            .unwrap()
            .job_id;
        let prefetch_2 = store
            .enqueue(job("c", Priority::PREFETCH, t0 + ChronoDuration::seconds(1)))
            .await
            .unwrap()
            .job_id;
        let immediate = store
            .enqueue(job("d", Priority::IMMEDIATE, t0 + ChronoDuration::seconds(5)))
            .await
            .unwrap()
            .job_id;

        let now = t0 + ChronoDuration::seconds(10);
        let mut order = Vec::new();
        while let Some(job) = store.claim_next(now).await.unwrap() {
            order.push(job.id);
        }

        assert_eq!(order, vec![immediate, prefetch_1, prefetch_2, old_background]);
    }

    #[tokio::test]
    async fn claim_respects_next_run_at() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(job("k", Priority::IMMEDIATE, now)).await.unwrap();

        let claimed = store.claim_next(now).await.unwrap().unwrap();
        store
            .finalize(
                claimed.id,
                1,
                Outcome::retry_after(Duration::from_secs(2), "timeout"),
                now,
            )
            .await
            .unwrap();

        assert!(store.claim_next(now + ChronoDuration::seconds(1)).await.unwrap().is_none());
        let reclaimed = store
            .claim_next(now + ChronoDuration::seconds(2))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(reclaimed.attempts, 2);
    }

    #[tokio::test]
    async fn finalize_with_stale_attempt_conflicts() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(job("k", Priority::IMMEDIATE, now)).await.unwrap();
        let claimed = store.claim_next(now).await.unwrap().unwrap();

        store
            .reset_stuck(
                claimed.id,
                now,
                StuckResolution::Requeue { next_run_at: now },
                now,
            )
            .await
            .unwrap()
            .unwrap();
        store.claim_next(now).await.unwrap().unwrap();

        let err = store
            .finalize(claimed.id, claimed.attempts, Outcome::Completed, now)
            .await
            .unwrap_err();
        assert!(matches!(err, JobStoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn reset_stuck_requires_observed_started_at() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        store.enqueue(job("k", Priority::IMMEDIATE, now)).await.unwrap();
        let claimed = store.claim_next(now).await.unwrap().unwrap();

        let stale = now - ChronoDuration::seconds(1);
        let result = store
            .reset_stuck(claimed.id, stale, StuckResolution::Fail, now)
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(
            store.get(claimed.id).await.unwrap().unwrap().state,
            JobState::Processing
        );
    }

    #[tokio::test]
    async fn dead_letter_and_prune_use_completed_at() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        store.enqueue(job("k", Priority::IMMEDIATE, t0)).await.unwrap();
        let claimed = store.claim_next(t0).await.unwrap().unwrap();
        store
            .finalize(claimed.id, 1, Outcome::failed("boom"), t0)
            .await
            .unwrap();

        assert!(store.dead_letter_failed(t0).await.unwrap().is_empty());
        let moved = store
            .dead_letter_failed(t0 + ChronoDuration::seconds(1))
            .await
            .unwrap();
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].id, claimed.id);
        assert_eq!(moved[0].state, JobState::Dead);
        assert_eq!(store.stats().await.unwrap().dead, 1);

        assert_eq!(store.prune_terminal(t0).await.unwrap(), 0);
        assert_eq!(
            store
                .prune_terminal(t0 + ChronoDuration::seconds(1))
                .await
                .unwrap(),
            1
        );
        assert!(store.get(claimed.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn list_by_subject_is_newest_first() {
        let store = InMemoryJobStore::new();
        let t0 = Utc::now();
        let older = store.enqueue(job("a", Priority::IMMEDIATE, t0)).await.unwrap();
        let newer = store
            .enqueue(job("b", Priority::IMMEDIATE, t0 + ChronoDuration::seconds(1)))
            .await
            .unwrap();

        let jobs = store.list_by_subject(&subject("doc1"), 10).await.unwrap();
        let ids: Vec<_> = jobs.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![newer.job_id, older.job_id]);

        assert!(store.list_by_subject(&subject("other"), 10).await.unwrap().is_empty());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            ..ProptestConfig::default()
        })]

        /// Property: claims come out sorted by (priority, created_at, insertion order).
        #[test]
        fn claims_follow_priority_then_age(
            specs in prop::collection::vec((1u8..=3, 0i64..5), 1..20)
        ) {
            let rt = tokio::runtime::Builder::new_current_thread().build().unwrap();
            rt.block_on(async {
                let store = InMemoryJobStore::new();
                let t0 = Utc::now();

                let mut expected = Vec::new();
                for (i, (priority, offset)) in specs.iter().enumerate() {
                    let created_at = t0 + ChronoDuration::seconds(*offset);
                    let priority = Priority::new(*priority).unwrap();
                    let id = store
                        .enqueue(job(&format!("k{i}"), priority, created_at))
                        .await
                        .unwrap()
                        .job_id;
                    expected.push((priority, created_at, i, id));
                }
                expected.sort_by_key(|(p, c, i, _)| (*p, *c, *i));

                let now = t0 + ChronoDuration::seconds(10);
                let mut claimed = Vec::new();
                while let Some(job) = store.claim_next(now).await.unwrap() {
                    claimed.push(job.id);
                }

                let expected: Vec<_> = expected.into_iter().map(|(_, _, _, id)| id).collect();
                assert_eq!(claimed, expected);
            });
        }
    }
}
