//! Crate error type
//!
//! Configuration problems are returned synchronously from `configure`.
//! Everything else travels through a transition's error channel.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification used by policy code when deciding whether to retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    Configuration,
    InvariantViolation,
    OperationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// Missing or invalid configuration property, or the item is busy
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Programming error, e.g. activating an unconfigured item
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// An external async operation failed
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// A stream acquisition was refused on purpose (e.g. profile switch)
    #[error("acquisition refused: {0}")]
    AcquisitionRefused(String),

    /// The transition's subject went away while it was in flight
    #[error("operation cancelled")]
    Cancelled,

    /// `advance` was called on a transition that already completed
    #[error("transition already completed")]
    AlreadyCompleted,
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Configuration(msg.into())
    }

    pub fn invariant(msg: impl Into<String>) -> Self {
        Error::Invariant(msg.into())
    }

    pub fn failed(msg: impl Into<String>) -> Self {
        Error::OperationFailed(msg.into())
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Error::Configuration(_) => ErrorCategory::Configuration,
            Error::Invariant(_) | Error::AlreadyCompleted => ErrorCategory::InvariantViolation,
            Error::OperationFailed(_) | Error::AcquisitionRefused(_) | Error::Cancelled => {
                ErrorCategory::OperationFailed
            }
        }
    }

    /// Refusals abort a link just like failures do; this is the only way
    /// to tell them apart.
    pub fn is_acquisition_refusal(&self) -> bool {
        matches!(self, Error::AcquisitionRefused(_))
    }
}
