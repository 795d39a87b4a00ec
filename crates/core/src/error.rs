//! Domain error model.

use thiserror::Error;

/// Deterministic business failure raised while an aggregate decides on a command.
///
/// Infrastructure failures (event log, bus, cache, locks) have their own error
/// types in `eventline-infra`; this enum only carries what the domain itself rejects.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// A command payload failed validation.
    #[error("validation failed: {0}")]
    Validation(String),

    /// An identifier could not be parsed.
    #[error("invalid identifier: {0}")]
    InvalidId(String),

    /// The command targets something the aggregate does not know about.
    #[error("not found")]
    NotFound,

    /// The command conflicts with the current aggregate state (e.g. create twice).
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
