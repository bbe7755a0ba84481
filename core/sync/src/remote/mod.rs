//! Remote endpoint abstraction.
//!
//! The remote side must be idempotent under the same idempotency key: a
//! duplicate submission has the same effect as a single one.

pub mod http;
pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use outbox_common::{ErrorClass, Operation, OperationId, ResourceKey, SyncError};

use crate::conflict::ConflictInfo;

pub use http::HttpEndpoint;
pub use memory::{Fault, MemoryEndpoint};

/// One operation as sent to the remote endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    /// The operation id; the remote deduplicates on it.
    pub idempotency_key: OperationId,
    pub resource_key: ResourceKey,
    pub kind: String,
    pub payload: Value,
}

impl SubmitRequest {
    pub fn from_operation(op: &Operation) -> Self {
        Self {
            idempotency_key: op.id,
            resource_key: op.resource_key.clone(),
            kind: op.kind.clone(),
            payload: op.payload.clone(),
        }
    }
}

/// A response the remote actually produced.
#[derive(Debug, Clone, PartialEq)]
pub enum RemoteResponse {
    /// Accepted, optionally with the resource's updated state.
    Applied { snapshot: Option<Value> },
    /// Remote state does not match the operation's preconditions.
    Conflict(ConflictInfo),
    /// Permanently rejected (validation error).
    Rejected { reason: String },
}

/// The request did not produce a usable response.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum TransportError {
    /// Remote could not be reached.
    #[error("Remote unreachable: {0}")]
    Unreachable(String),

    /// No response within the send timeout.
    #[error("Request timed out")]
    Timeout,

    /// Unexpected HTTP status.
    #[error("HTTP {code}: {body}")]
    Status { code: u16, body: String },

    /// Response could not be decoded.
    #[error("Undecodable response: {0}")]
    Decode(String),
}

impl TransportError {
    /// Classify this failure.
    pub fn class(&self) -> ErrorClass {
        match self {
            TransportError::Unreachable(_) | TransportError::Timeout => ErrorClass::Retryable,
            TransportError::Status { code, .. } => classify_status(*code),
            TransportError::Decode(_) => ErrorClass::Terminal,
        }
    }

    /// Convert to the error recorded on the operation.
    pub fn to_sync_error(&self) -> SyncError {
        SyncError::new(self.class(), self.to_string())
    }
}

/// Classify an HTTP status that is not a success.
pub fn classify_status(code: u16) -> ErrorClass {
    match code {
        408 | 425 | 429 | 500..=599 => ErrorClass::Retryable,
        409 | 412 => ErrorClass::Conflict,
        _ => ErrorClass::Terminal,
    }
}

/// Remote authority that operations are replayed against.
#[async_trait]
pub trait RemoteEndpoint: Send + Sync {
    /// Get the endpoint name (e.g., "http", "memory").
    fn name(&self) -> &str;

    /// Submit one operation.
    ///
    /// # Errors
    /// - `TransportError` when no usable response was produced
    async fn submit(&self, request: &SubmitRequest) -> Result<RemoteResponse, TransportError>;
}
