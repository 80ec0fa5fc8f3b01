//! HTTP clients for the extraction and generation services.
//!
//! | Service | Request | Response |
//! |---------|---------|----------|
//! | extractor | `POST {base}/extract` `{document_id, page}` | `{text}` |
//! | generator | `POST {base}/generate` `{document_id, page, text}` | any JSON |
//!
//! Timeouts, connection failures, 408, 429 and 5xx are `Unavailable` (retried); any
//! other non-success status is `InvalidInput`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::services::{ContentGenerator, PageExtractor, PageRef, ServiceError};

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

fn build_client(timeout: Duration) -> Result<reqwest::Client, ServiceError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| ServiceError::Unavailable(format!("failed to build http client: {e}")))
}

fn endpoint(base_url: &str, path: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), path)
}

fn classify(status: StatusCode, body: String) -> ServiceError {
    let msg = format!("{status}: {body}");
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        ServiceError::Unavailable(msg)
    } else {
        ServiceError::InvalidInput(msg)
    }
}

async fn post_json<B, R>(client: &reqwest::Client, url: &str, body: &B) -> Result<R, ServiceError>
where
    B: Serialize + ?Sized,
    R: for<'de> Deserialize<'de>,
{
    let resp = client
        .post(url)
        .json(body)
        .send()
        .await
        .map_err(|e| ServiceError::Unavailable(e.to_string()))?;

    let status = resp.status();
    if !status.is_success() {
        let body = resp.text().await.unwrap_or_default();
        return Err(classify(status, body));
    }

    resp.json::<R>()
        .await
        .map_err(|e| ServiceError::Unavailable(format!("malformed response from {url}: {e}")))
}

#[derive(Debug, Clone)]
pub struct HttpPageExtractor {
    client: reqwest::Client,
    url: String,
}

impl HttpPageExtractor {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: endpoint(base_url, "extract"),
        })
    }
}

#[derive(Deserialize)]
struct ExtractResponse {
    text: String,
}

#[async_trait]
impl PageExtractor for HttpPageExtractor {
    async fn extract(&self, page: &PageRef) -> Result<String, ServiceError> {
        debug!(page = %page, url = %self.url, "extracting page");
        let resp: ExtractResponse = post_json(&self.client, &self.url, page).await?;
        Ok(resp.text)
    }
}

#[derive(Debug, Clone)]
pub struct HttpContentGenerator {
    client: reqwest::Client,
    url: String,
}

impl HttpContentGenerator {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, ServiceError> {
        Ok(Self {
            client: build_client(timeout)?,
            url: endpoint(base_url, "generate"),
        })
    }
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    document_id: &'a str,
    page: u32,
    text: &'a str,
}

#[async_trait]
impl ContentGenerator for HttpContentGenerator {
    async fn generate(&self, page: &PageRef, text: &str) -> Result<JsonValue, ServiceError> {
        debug!(page = %page, url = %self.url, "generating content");
        let request = GenerateRequest {
            document_id: &page.document_id,
            page: page.page,
            text,
        };
        post_json(&self.client, &self.url, &request).await
    }
}
