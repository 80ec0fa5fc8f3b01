//! `docqueue-core`: identifiers, job states and validation errors shared by every crate.
//!
//! This crate contains **pure** types only (no IO, no async). Storage, workers and
//! transports live in `docqueue-infra` and `docqueue-events`.

pub mod error;
pub mod id;
pub mod state;

pub use error::{DomainError, DomainResult};
pub use id::{JobId, SubjectId, WorkerId};
pub use state::JobState;
