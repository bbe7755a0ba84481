//! Common error types for Outbox.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Top-level error type for Outbox operations.
#[derive(Debug, Error)]
pub enum Error {
    /// Local persistence failed; durability cannot be promised.
    #[error("Storage error: {0}")]
    Storage(String),

    /// Local persistence ran out of space.
    #[error("Storage full: {0}")]
    StorageFull(String),

    /// I/O operation failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failed.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Invalid input provided.
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Resource not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Resource already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Status transition not allowed from the current state.
    #[error("Invalid transition: {0}")]
    InvalidTransition(String),

    /// Network operation failed.
    #[error("Network error: {0}")]
    Network(String),

    /// The sync worker is not running.
    #[error("Shutdown: {0}")]
    Shutdown(String),
}

impl Error {
    /// Whether this error means no durability could be promised for a write.
    pub fn is_storage_fatal(&self) -> bool {
        matches!(self, Error::Storage(_) | Error::StorageFull(_) | Error::Io(_))
    }
}

/// Result type alias using the common Error.
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a failed sync attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Transport failure, timeout or 5xx. Retried with backoff.
    Retryable,
    /// Remote reported a state mismatch. Handed to the conflict resolver.
    Conflict,
    /// Remote permanently rejected the operation.
    Terminal,
    /// An earlier operation on the same resource failed.
    DependencyFailed,
    /// The configured attempt budget ran out.
    RetriesExhausted,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Retryable => "retryable",
            ErrorClass::Conflict => "conflict",
            ErrorClass::Terminal => "terminal",
            ErrorClass::DependencyFailed => "dependency_failed",
            ErrorClass::RetriesExhausted => "retries_exhausted",
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified sync error as recorded on an operation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncError {
    pub class: ErrorClass,
    pub message: String,
}

impl SyncError {
    pub fn new(class: ErrorClass, message: impl Into<String>) -> Self {
        Self {
            class,
            message: message.into(),
        }
    }

    pub fn retryable(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Retryable, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Conflict, message)
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::new(ErrorClass::Terminal, message)
    }
}

impl fmt::Display for SyncError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.class, self.message)
    }
}
