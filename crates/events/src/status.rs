//! Client-facing status query shapes.
//!
//! These are what a late subscriber (or the adaptive poller) reads instead of
//! replaying missed events.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use docqueue_core::{JobId, JobState, SubjectId};

/// Status of a single job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub state: JobState,
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Status of every retained job for a subject, newest first.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubjectStatus {
    pub subject_id: SubjectId,
    pub jobs: Vec<JobStatusView>,
}

impl SubjectStatus {
    /// True once no job of the subject can change state on its own.
    ///
    /// An empty subject is not settled: its jobs may not have been enqueued yet.
    pub fn is_settled(&self) -> bool {
        !self.jobs.is_empty() && self.jobs.iter().all(|j| j.state.is_terminal())
    }
}
