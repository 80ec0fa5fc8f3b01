//! Service seams of the document handlers and the page payload they share.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

use docqueue_infra::jobs::HandlerError;

/// One page of one document; also the payload shape of every document job.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PageRef {
    pub document_id: String,
    pub page: u32,
}

impl PageRef {
    pub fn new(document_id: impl Into<String>, page: u32) -> Self {
        Self {
            document_id: document_id.into(),
            page,
        }
    }

    /// Parse a job payload. Anything that is not `{document_id, page >= 1}` is permanent.
    pub fn from_payload(payload: &JsonValue) -> Result<Self, HandlerError> {
        let page: PageRef = serde_json::from_value(payload.clone())
            .map_err(|e| HandlerError::permanent(format!("invalid page payload: {e}")))?;

        if page.document_id.trim().is_empty() {
            return Err(HandlerError::permanent("document_id must not be empty"));
        }
        if page.page == 0 {
            return Err(HandlerError::permanent("page numbers start at 1"));
        }
        Ok(page)
    }
}

impl std::fmt::Display for PageRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}#{}", self.document_id, self.page)
    }
}

/// How far a page has been processed, as recorded in the denormalized cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageStage {
    Extracted,
    Generated,
}

impl PageStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageStage::Extracted => "extracted",
            PageStage::Generated => "generated",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ServiceError {
    /// The service refused the input; retrying will not help.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Something the step depends on does not exist yet; another job may still produce it.
    #[error("missing input: {0}")]
    MissingInput(String),

    /// Network failure, timeout or upstream 5xx.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    #[error("storage error: {0}")]
    Storage(String),
}

impl From<ServiceError> for HandlerError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::InvalidInput(_) => HandlerError::permanent(err.to_string()),
            ServiceError::MissingInput(_) | ServiceError::Unavailable(_) | ServiceError::Storage(_) => {
                HandlerError::transient(err.to_string())
            }
        }
    }
}

/// Extracts the text of one page.
#[async_trait]
pub trait PageExtractor: Send + Sync {
    async fn extract(&self, page: &PageRef) -> Result<String, ServiceError>;
}

/// Produces AI content from a page's extracted text. The content is opaque JSON.
#[async_trait]
pub trait ContentGenerator: Send + Sync {
    async fn generate(&self, page: &PageRef, text: &str) -> Result<JsonValue, ServiceError>;
}

/// Where processed content is persisted. Every write is an upsert.
#[async_trait]
pub trait ContentSink: Send + Sync {
    async fn store_extraction(&self, page: &PageRef, text: &str) -> Result<(), ServiceError>;

    async fn load_extraction(&self, page: &PageRef) -> Result<Option<String>, ServiceError>;

    async fn store_generation(&self, page: &PageRef, content: &JsonValue) -> Result<(), ServiceError>;

    /// Denormalized per-page progress row. Non-essential.
    async fn update_cache(&self, page: &PageRef, stage: PageStage) -> Result<(), ServiceError>;
}
