//! Validation error model.

use thiserror::Error;

/// Result type used for request validation.
pub type DomainResult<T> = Result<T, DomainError>;

/// Deterministic, caller-facing failure.
///
/// Infrastructure failures (database outages, transport errors) never use this
/// type; they have their own error enums in the crates that own the IO.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A request failed validation (e.g. malformed payload or priority).
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The requested job does not exist.
    #[error("not found")]
    NotFound,

    /// The request conflicts with the current job state.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn not_found() -> Self {
        Self::NotFound
    }
}
