//! Infrastructure layer: job store, worker, sweeper, scheduling, transports, config.

pub mod bootstrap;
pub mod config;
pub mod jobs;
pub mod scheduler;
pub mod shutdown;
pub mod status_channel;

pub use config::{ConfigError, PipelineConfig};
pub use scheduler::TaskScheduler;
