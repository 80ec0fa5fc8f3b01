//! Document-processing handlers and the worker/sweeper processes.
//!
//! - `services`: narrow traits over the extraction/AI services and content storage
//! - `http`: HTTP clients for the extractor and generator services
//! - `sink`: content storage (Postgres, in-memory)
//! - `handlers`: the `extract_page`, `generate_ai` and `extract_and_ai` job handlers

pub mod handlers;
pub mod http;
pub mod services;
pub mod sink;

pub use handlers::{
    DocumentServices, ExtractAndAiHandler, ExtractPageHandler, GenerateAiHandler, registry,
};
pub use http::{HttpContentGenerator, HttpPageExtractor};
pub use services::{ContentGenerator, ContentSink, PageExtractor, PageRef, PageStage, ServiceError};
pub use sink::{InMemoryContentSink, PostgresContentSink};
