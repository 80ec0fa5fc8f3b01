//! Client-side status following.
//!
//! Push events arrive over the status channel; while that transport is down the
//! `AdaptivePoller` queries subject status instead, backing off on errors and going
//! dormant while push is connected or the host view is hidden.

pub mod poller;
pub mod source;

pub use poller::{AdaptivePoller, Jitter, PollerConfig, PollerConfigError, PollerExit};
pub use source::{HttpStatusSource, SourceError, StatusSource};
