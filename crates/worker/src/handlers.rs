//! Job handlers for the document pipeline.
//!
//! Storing the extraction or generation is the job's primary effect. The page cache
//! row is denormalized: when writing it fails the job still succeeds and the failure
//! is reported through `JobContext::side_effect_failed`.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value as JsonValue;
use tracing::debug;

use docqueue_infra::jobs::{HandlerError, HandlerRegistry, JobContext, JobHandler, JobType};

use crate::services::{
    ContentGenerator, ContentSink, PageExtractor, PageRef, PageStage, ServiceError,
};

/// Progress published between the extraction and generation steps.
pub const EXTRACTED_PROGRESS: u8 = 50;

/// The services every document handler works against.
#[derive(Clone)]
pub struct DocumentServices {
    pub extractor: Arc<dyn PageExtractor>,
    pub generator: Arc<dyn ContentGenerator>,
    pub sink: Arc<dyn ContentSink>,
}

impl std::fmt::Debug for DocumentServices {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DocumentServices").finish_non_exhaustive()
    }
}

impl DocumentServices {
    pub fn new(
        extractor: Arc<dyn PageExtractor>,
        generator: Arc<dyn ContentGenerator>,
        sink: Arc<dyn ContentSink>,
    ) -> Self {
        Self {
            extractor,
            generator,
            sink,
        }
    }

    async fn extract(&self, ctx: &JobContext, page: &PageRef) -> Result<String, HandlerError> {
        let text = self.extractor.extract(page).await?;
        self.sink.store_extraction(page, &text).await?;
        debug!(job_id = %ctx.job_id, page = %page, chars = text.len(), "page extracted");

        self.touch_cache(ctx, page, PageStage::Extracted).await;
        Ok(text)
    }

    async fn generate(&self, ctx: &JobContext, page: &PageRef, text: &str) -> Result<(), HandlerError> {
        let content = self.generator.generate(page, text).await?;
        self.sink.store_generation(page, &content).await?;
        debug!(job_id = %ctx.job_id, page = %page, "content generated");

        self.touch_cache(ctx, page, PageStage::Generated).await;
        Ok(())
    }

    async fn touch_cache(&self, ctx: &JobContext, page: &PageRef, stage: PageStage) {
        if let Err(e) = self.sink.update_cache(page, stage).await {
            ctx.side_effect_failed("update_cache", &e);
        }
    }
}

/// `extract_page`: extract and store one page's text.
#[derive(Debug, Clone)]
pub struct ExtractPageHandler {
    services: DocumentServices,
}

impl ExtractPageHandler {
    pub fn new(services: DocumentServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for ExtractPageHandler {
    async fn handle(&self, ctx: &JobContext, payload: &JsonValue) -> Result<(), HandlerError> {
        let page = PageRef::from_payload(payload)?;
        self.services.extract(ctx, &page).await.map(|_| ())
    }
}

/// `generate_ai`: generate content from a previously stored extraction.
#[derive(Debug, Clone)]
pub struct GenerateAiHandler {
    services: DocumentServices,
}

impl GenerateAiHandler {
    pub fn new(services: DocumentServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for GenerateAiHandler {
    async fn handle(&self, ctx: &JobContext, payload: &JsonValue) -> Result<(), HandlerError> {
        let page = PageRef::from_payload(payload)?;
        let text = self
            .services
            .sink
            .load_extraction(&page)
            .await?
            .ok_or_else(|| ServiceError::MissingInput(format!("no stored extraction for page {page}")))?;

        self.services.generate(ctx, &page, &text).await
    }
}

/// `extract_and_ai`: both steps in one job.
#[derive(Debug, Clone)]
pub struct ExtractAndAiHandler {
    services: DocumentServices,
}

impl ExtractAndAiHandler {
    pub fn new(services: DocumentServices) -> Self {
        Self { services }
    }
}

#[async_trait]
impl JobHandler for ExtractAndAiHandler {
    async fn handle(&self, ctx: &JobContext, payload: &JsonValue) -> Result<(), HandlerError> {
        let page = PageRef::from_payload(payload)?;
        let text = self.services.extract(ctx, &page).await?;
        ctx.progress(EXTRACTED_PROGRESS).await;
        self.services.generate(ctx, &page, &text).await
    }
}

/// Registry with a handler for every document job type.
pub fn registry(services: DocumentServices) -> HandlerRegistry {
    HandlerRegistry::new()
        .with(JobType::ExtractPage, ExtractPageHandler::new(services.clone()))
        .with(JobType::GenerateAi, GenerateAiHandler::new(services.clone()))
        .with(JobType::ExtractAndAi, ExtractAndAiHandler::new(services))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use chrono::Utc;
    use docqueue_core::{JobState, SubjectId};
    use docqueue_events::{InMemoryStatusChannel, StatusChannel, StatusEventKind};
    use docqueue_infra::jobs::notify::METRIC_SIDE_EFFECT_FAILED;
    use docqueue_infra::jobs::{Job, Notifier, Priority};
    use docqueue_observability::InMemoryMetricSink;
    use serde_json::json;

    use super::*;
    use crate::services::ServiceError;
    use crate::sink::InMemoryContentSink;

    struct FakeExtractor {
        calls: Mutex<u32>,
        fail_with: Option<ServiceError>,
    }

    impl FakeExtractor {
        fn ok() -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(0),
                fail_with: None,
            })
        }

        fn failing(err: ServiceError) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(0),
                fail_with: Some(err),
            })
        }
    }

    #[async_trait]
    impl PageExtractor for FakeExtractor {
        async fn extract(&self, page: &PageRef) -> Result<String, ServiceError> {
            *self.calls.lock().unwrap() += 1;
            match &self.fail_with {
                Some(err) => Err(err.clone()),
                None => Ok(format!("text of {page}")),
            }
        }
    }

    struct EchoGenerator;

    #[async_trait]
    impl ContentGenerator for EchoGenerator {
        async fn generate(&self, _page: &PageRef, text: &str) -> Result<JsonValue, ServiceError> {
            Ok(json!({ "summary": text.to_uppercase() }))
        }
    }

    /// Delegates to an in-memory sink but cannot write the cache.
    struct BrokenCacheSink(InMemoryContentSink);

    #[async_trait]
    impl ContentSink for BrokenCacheSink {
        async fn store_extraction(&self, page: &PageRef, text: &str) -> Result<(), ServiceError> {
            self.0.store_extraction(page, text).await
        }

        async fn load_extraction(&self, page: &PageRef) -> Result<Option<String>, ServiceError> {
            self.0.load_extraction(page).await
        }

        async fn store_generation(&self, page: &PageRef, content: &JsonValue) -> Result<(), ServiceError> {
            self.0.store_generation(page, content).await
        }

        async fn update_cache(&self, _page: &PageRef, _stage: PageStage) -> Result<(), ServiceError> {
            Err(ServiceError::Storage("cache table unavailable".to_string()))
        }
    }

    struct Harness {
        channel: Arc<InMemoryStatusChannel>,
        metrics: Arc<InMemoryMetricSink>,
    }

    impl Harness {
        fn new() -> Self {
            Self {
                channel: Arc::new(InMemoryStatusChannel::new()),
                metrics: Arc::new(InMemoryMetricSink::new()),
            }
        }

        fn context(&self, job_type: JobType, payload: &JsonValue) -> JobContext {
            let mut job = Job::queued(
                job_type,
                "full:doc1:1".to_string(),
                Some(SubjectId::parse("doc1").unwrap()),
                payload.clone(),
                Priority::IMMEDIATE,
                3,
                Utc::now(),
            );
            job.mark_claimed(Utc::now());
            JobContext::new(
                &job,
                Notifier::new(self.channel.clone(), self.metrics.clone()),
            )
        }
    }

    fn services(extractor: Arc<FakeExtractor>, sink: Arc<dyn ContentSink>) -> DocumentServices {
        DocumentServices::new(extractor, Arc::new(EchoGenerator), sink)
    }

    fn payload() -> JsonValue {
        json!({ "document_id": "doc1", "page": 1 })
    }

    #[tokio::test]
    async fn extract_page_stores_text_and_cache_row() {
        let h = Harness::new();
        let sink = Arc::new(InMemoryContentSink::new());
        let handler = ExtractPageHandler::new(services(FakeExtractor::ok(), sink.clone()));

        let ctx = h.context(JobType::ExtractPage, &payload());
        handler.handle(&ctx, &payload()).await.unwrap();

        let page = PageRef::new("doc1", 1);
        assert_eq!(sink.extraction(&page).as_deref(), Some("text of doc1#1"));
        assert_eq!(sink.cache_stage(&page), Some(PageStage::Extracted));
        assert!(sink.generation(&page).is_none());
    }

    #[tokio::test]
    async fn extract_and_ai_runs_both_steps_with_midpoint_progress() {
        let h = Harness::new();
        let mut events = h.channel.subscribe(&SubjectId::parse("doc1").unwrap());
        let sink = Arc::new(InMemoryContentSink::new());
        let handler = ExtractAndAiHandler::new(services(FakeExtractor::ok(), sink.clone()));

        let ctx = h.context(JobType::ExtractAndAi, &payload());
        handler.handle(&ctx, &payload()).await.unwrap();

        let page = PageRef::new("doc1", 1);
        assert_eq!(
            sink.generation(&page),
            Some(json!({ "summary": "TEXT OF DOC1#1" }))
        );
        assert_eq!(sink.cache_stage(&page), Some(PageStage::Generated));

        let event = events.try_recv().unwrap();
        assert_eq!(event.kind, StatusEventKind::Progress);
        assert_eq!(event.state, JobState::Processing);
        assert_eq!(event.percentage, Some(EXTRACTED_PROGRESS));
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn generate_ai_retries_until_the_extraction_is_stored() {
        let h = Harness::new();
        let sink = Arc::new(InMemoryContentSink::new());
        let handler = GenerateAiHandler::new(services(FakeExtractor::ok(), sink.clone()));
        let ctx = h.context(JobType::GenerateAi, &payload());

        // The extract_page job for this page may still be running on another worker.
        let err = handler.handle(&ctx, &payload()).await.unwrap_err();
        assert!(!err.is_permanent());

        sink.store_extraction(&PageRef::new("doc1", 1), "hello").await.unwrap();
        handler.handle(&ctx, &payload()).await.unwrap();
        assert_eq!(
            sink.generation(&PageRef::new("doc1", 1)),
            Some(json!({ "summary": "HELLO" }))
        );
    }

    #[tokio::test]
    async fn cache_failure_does_not_fail_the_job_and_is_metered() {
        let h = Harness::new();
        let inner = InMemoryContentSink::new();
        let sink = Arc::new(BrokenCacheSink(inner));
        let handler = ExtractPageHandler::new(services(FakeExtractor::ok(), sink.clone()));

        let ctx = h.context(JobType::ExtractPage, &payload());
        handler.handle(&ctx, &payload()).await.unwrap();

        assert_eq!(
            sink.0.extraction(&PageRef::new("doc1", 1)).as_deref(),
            Some("text of doc1#1")
        );
        let failures = h.metrics.named(METRIC_SIDE_EFFECT_FAILED);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].subject, "doc1");
    }

    #[tokio::test]
    async fn upstream_outage_is_transient_and_rejection_is_permanent() {
        let h = Harness::new();
        let ctx = h.context(JobType::ExtractPage, &payload());

        let outage = ExtractPageHandler::new(services(
            FakeExtractor::failing(ServiceError::Unavailable("503".into())),
            Arc::new(InMemoryContentSink::new()),
        ));
        assert!(!outage.handle(&ctx, &payload()).await.unwrap_err().is_permanent());

        let rejected = ExtractPageHandler::new(services(
            FakeExtractor::failing(ServiceError::InvalidInput("no such page".into())),
            Arc::new(InMemoryContentSink::new()),
        ));
        assert!(rejected.handle(&ctx, &payload()).await.unwrap_err().is_permanent());
    }

    #[tokio::test]
    async fn bad_payload_never_reaches_the_extractor() {
        let h = Harness::new();
        let extractor = FakeExtractor::ok();
        let handler =
            ExtractPageHandler::new(services(extractor.clone(), Arc::new(InMemoryContentSink::new())));

        let bad = json!({ "document_id": "doc1", "page": 0 });
        let ctx = h.context(JobType::ExtractPage, &bad);
        assert!(handler.handle(&ctx, &bad).await.unwrap_err().is_permanent());
        assert_eq!(*extractor.calls.lock().unwrap(), 0);
    }

    #[test]
    fn registry_covers_every_job_type() {
        let registry = registry(services(FakeExtractor::ok(), Arc::new(InMemoryContentSink::new())));
        for job_type in JobType::ALL {
            assert!(registry.get(job_type).is_some(), "no handler for {job_type}");
        }
    }
}
