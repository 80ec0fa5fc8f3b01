use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use docqueue_core::SubjectId;
use docqueue_events::SubjectStatus;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SourceError {
    #[error("network error: {0}")]
    Network(String),

    #[error("status endpoint returned {0}: {1}")]
    Api(u16, String),

    #[error("malformed status response: {0}")]
    Decode(String),
}

/// Where the poller reads a subject's status from.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn fetch(&self, subject_id: &SubjectId) -> Result<SubjectStatus, SourceError>;
}

#[async_trait]
impl<S> StatusSource for Arc<S>
where
    S: StatusSource + ?Sized,
{
    async fn fetch(&self, subject_id: &SubjectId) -> Result<SubjectStatus, SourceError> {
        (**self).fetch(subject_id).await
    }
}

/// Reads `GET {base_url}/subjects/{id}/status` from the API.
#[derive(Debug, Clone)]
pub struct HttpStatusSource {
    client: reqwest::Client,
    base_url: String,
}

impl HttpStatusSource {
    pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

    pub fn new(base_url: impl Into<String>) -> Result<Self, SourceError> {
        Self::with_timeout(base_url, Self::DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(base_url: impl Into<String>, timeout: Duration) -> Result<Self, SourceError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| SourceError::Network(e.to_string()))?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn status_url(&self, subject_id: &SubjectId) -> String {
        format!("{}/subjects/{}/status", self.base_url, subject_id)
    }
}

#[async_trait]
impl StatusSource for HttpStatusSource {
    async fn fetch(&self, subject_id: &SubjectId) -> Result<SubjectStatus, SourceError> {
        let resp = self
            .client
            .get(self.status_url(subject_id))
            .send()
            .await
            .map_err(|e| SourceError::Network(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(SourceError::Api(status.as_u16(), body));
        }

        resp.json::<SubjectStatus>()
            .await
            .map_err(|e| SourceError::Decode(e.to_string()))
    }
}
