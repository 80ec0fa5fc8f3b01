//! Durable job queue with retry, backoff and recovery.
//!
//! ## Design
//!
//! - Jobs are typed, prioritized and deduplicated by idempotency key
//! - Claims are atomic; all later writes are compare-and-set against the claim
//! - Retries use capped exponential backoff
//! - Orphaned claims are recovered by the sweeper, never by the worker itself
//!
//! ## Components
//!
//! - `Enqueuer`: validation + idempotent submission
//! - `JobStore`: persistence (in-memory or Postgres)
//! - `JobWorker`: claim/execute/finalize loop
//! - `RecoverySweeper`: stuck reset, dead-lettering, retention pruning

pub mod enqueue;
pub mod handler;
pub mod notify;
pub mod postgres;
pub mod store;
pub mod sweeper;
pub mod types;
pub mod worker;

pub use enqueue::{EnqueueError, EnqueueRequest, Enqueuer};
pub use handler::{HandlerError, HandlerRegistry, JobContext, JobHandler};
pub use notify::Notifier;
pub use postgres::PostgresJobStore;
pub use store::{InMemoryJobStore, JobStore, JobStoreError};
pub use sweeper::{RecoverySweeper, SweepReport, SweeperConfig};
pub use types::{
    BackoffPolicy, EnqueueResult, Job, JobStats, JobType, Outcome, Priority, StuckResolution,
};
pub use worker::{JobWorker, WorkerConfig};
