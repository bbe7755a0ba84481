//! Durable store trait definition.

use serde::{Deserialize, Serialize};

use outbox_common::{Operation, OperationId, OperationStatus, ResourceKey, Result, SyncError};

/// Fields written by a status transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub status: OperationStatus,
    pub attempt: u32,
    pub last_error: Option<SyncError>,
}

impl StatusUpdate {
    /// Capture the mutable status fields of an operation.
    pub fn from_operation(op: &Operation) -> Self {
        Self {
            status: op.status,
            attempt: op.attempt,
            last_error: op.last_error.clone(),
        }
    }
}

/// Crash-safe persistence for queued operations and committed snapshots.
///
/// Pure storage, no policy. Every method is synchronous: an enqueue must be
/// durable before it returns, and callers never wait on the network.
/// Implementations must survive process restart (except test backends).
pub trait DurableStore: Send + Sync {
    /// Get the backend name (e.g., "memory", "sqlite").
    fn name(&self) -> &str;

    /// Insert or replace an operation.
    ///
    /// # Postconditions
    /// - The operation is durable when this returns `Ok`
    ///
    /// # Errors
    /// - `StorageFull` when the backend is out of space
    /// - `Storage` for any other persistence failure
    fn put(&self, op: &Operation) -> Result<()>;

    /// Load every stored operation, ordered by `seq`.
    fn get_all(&self) -> Result<Vec<Operation>>;

    /// Compare-and-set the status fields of one operation.
    ///
    /// # Returns
    /// - `Ok(true)` if the record existed with status `expected` and was updated
    /// - `Ok(false)` if the record is missing or its status differed
    fn update_status(
        &self,
        id: &OperationId,
        expected: OperationStatus,
        update: &StatusUpdate,
    ) -> Result<bool>;

    /// Compare-and-set several operations in one write.
    ///
    /// Each entry is `(id, expected, update)`.
    ///
    /// # Returns
    /// - `Ok(true)` if every record existed with its expected status and all
    ///   were updated
    /// - `Ok(false)` if any check failed; nothing is written
    fn update_statuses(
        &self,
        updates: &[(OperationId, OperationStatus, StatusUpdate)],
    ) -> Result<bool>;

    /// Delete an operation. Returns whether a record was removed.
    fn delete(&self, id: &OperationId) -> Result<bool>;

    /// Store the last committed server snapshot for a resource.
    fn put_snapshot(&self, key: &ResourceKey, snapshot: &serde_json::Value) -> Result<()>;

    /// Load every committed snapshot.
    fn snapshots(&self) -> Result<Vec<(ResourceKey, serde_json::Value)>>;

    /// Atomically record a commit: write the new baseline snapshot (if any)
    /// and purge the committed operation.
    fn commit(
        &self,
        id: &OperationId,
        key: &ResourceKey,
        snapshot: Option<&serde_json::Value>,
    ) -> Result<()>;
}
