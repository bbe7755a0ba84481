//! The queued operation and its status lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::{Error, OperationId, ResourceKey, Result, SyncError};

/// Status of a queued operation.
///
/// Moves strictly forward: `Pending -> InFlight -> {Committed | Pending | Failed}`.
/// `Committed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    /// Waiting to be sent.
    Pending,
    /// Submitted to the remote endpoint, no answer yet.
    InFlight,
    /// Accepted by the remote endpoint.
    Committed,
    /// Permanently failed; kept until the caller discards it.
    Failed,
}

impl OperationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationStatus::Pending => "pending",
            OperationStatus::InFlight => "in_flight",
            OperationStatus::Committed => "committed",
            OperationStatus::Failed => "failed",
        }
    }

    /// Check if no further transition is possible.
    pub fn is_terminal(&self) -> bool {
        matches!(self, OperationStatus::Committed | OperationStatus::Failed)
    }

    /// Check whether moving to `next` respects the forward-only lifecycle.
    ///
    /// `Pending -> Failed` covers operations quarantined behind a failed
    /// predecessor, which are never sent.
    pub fn can_transition_to(&self, next: OperationStatus) -> bool {
        use OperationStatus::*;
        matches!(
            (self, next),
            (Pending, InFlight)
                | (Pending, Failed)
                | (InFlight, Committed)
                | (InFlight, Pending)
                | (InFlight, Failed)
        )
    }
}

impl fmt::Display for OperationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OperationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(OperationStatus::Pending),
            "in_flight" => Ok(OperationStatus::InFlight),
            "committed" => Ok(OperationStatus::Committed),
            "failed" => Ok(OperationStatus::Failed),
            other => Err(Error::Serialization(format!(
                "Unknown operation status: {}",
                other
            ))),
        }
    }
}

/// The unit of work: one user mutation waiting to reach the remote store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Operation {
    /// Unique id, also the idempotency key.
    pub id: OperationId,
    /// Entity this operation targets.
    pub resource_key: ResourceKey,
    /// Mutation variant tag.
    pub kind: String,
    /// Data needed to perform the mutation.
    pub payload: serde_json::Value,
    /// Current lifecycle status.
    pub status: OperationStatus,
    /// Monotonic per-queue sequence number; the ordering key.
    pub seq: u64,
    /// Wall-clock enqueue time.
    pub created_at: DateTime<Utc>,
    /// Number of sends started.
    pub attempt: u32,
    /// Last classified error, if any.
    pub last_error: Option<SyncError>,
}

impl Operation {
    /// Create a new pending operation.
    pub fn new(
        seq: u64,
        resource_key: ResourceKey,
        kind: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            id: OperationId::generate(),
            resource_key,
            kind: kind.into(),
            payload,
            status: OperationStatus::Pending,
            seq,
            created_at: Utc::now(),
            attempt: 0,
            last_error: None,
        }
    }

    /// Check if the operation reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Check if the operation still contributes to the optimistic view.
    pub fn is_active(&self) -> bool {
        !self.is_terminal()
    }

    /// Validate and apply a status change in memory.
    ///
    /// # Errors
    /// - `InvalidTransition` if the lifecycle forbids the move
    pub fn transition(&mut self, next: OperationStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition(format!(
                "{} cannot move from {} to {}",
                self.id, self.status, next
            )));
        }
        self.status = next;
        Ok(())
    }
}
