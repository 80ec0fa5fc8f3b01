use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docqueue_core::{JobId, JobState, SubjectId};

/// Kind of status notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusEventKind {
    /// A transition that is not final (claimed, retry scheduled) or a progress milestone.
    Progress,
    Completed,
    Failed,
}

/// Immutable notification published on the status channel.
///
/// Events are facts: they are derived from a job-state transition or a progress
/// milestone and are never mutated after construction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusEvent {
    #[serde(rename = "type")]
    pub kind: StatusEventKind,
    pub subject_id: SubjectId,
    pub job_id: JobId,
    /// Job state after the transition.
    pub state: JobState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub percentage: Option<u8>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl StatusEvent {
    /// Progress milestone; `percentage` is clamped to 100.
    pub fn progress(subject_id: SubjectId, job_id: JobId, state: JobState, percentage: u8) -> Self {
        Self {
            kind: StatusEventKind::Progress,
            subject_id,
            job_id,
            state,
            percentage: Some(percentage.min(100)),
            error: None,
            timestamp: Utc::now(),
        }
    }

    /// A failed attempt that has been scheduled for another try.
    pub fn retrying(subject_id: SubjectId, job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            kind: StatusEventKind::Progress,
            subject_id,
            job_id,
            state: JobState::Queued,
            percentage: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn completed(subject_id: SubjectId, job_id: JobId) -> Self {
        Self {
            kind: StatusEventKind::Completed,
            subject_id,
            job_id,
            state: JobState::Completed,
            percentage: Some(100),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(subject_id: SubjectId, job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            kind: StatusEventKind::Failed,
            subject_id,
            job_id,
            state: JobState::Failed,
            percentage: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    /// A `failed` job moved to `dead` after its grace period.
    pub fn dead_lettered(subject_id: SubjectId, job_id: JobId, error: impl Into<String>) -> Self {
        Self {
            kind: StatusEventKind::Failed,
            subject_id,
            job_id,
            state: JobState::Dead,
            percentage: None,
            error: Some(error.into()),
            timestamp: Utc::now(),
        }
    }

    pub fn is_final(&self) -> bool {
        self.state.is_terminal()
    }
}
