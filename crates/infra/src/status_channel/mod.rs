//! Infrastructure-backed status channels.
//!
//! The channel abstraction and the in-process implementation live in
//! `docqueue-events`. This module provides the cross-process transport.

#[cfg(feature = "redis")]
pub mod redis_pubsub;

#[cfg(feature = "redis")]
pub use redis_pubsub::RedisStatusChannel;
