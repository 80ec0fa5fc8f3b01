//! HTTP API: job submission, status queries and status streaming.

pub mod app;
