//! Durable operation queue.
//!
//! The queue owns the in-memory index of every stored operation and is the
//! only path through which the durable store is written. Every status change
//! is a compare-and-set against the store; the in-memory copy is updated only
//! after the store accepted the write.

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::{watch, Notify};
use tracing::{debug, info, warn};

use outbox_common::{
    Error, ErrorClass, Operation, OperationId, OperationStatus, ResourceKey, Result, SyncError,
};
use outbox_storage::{DurableStore, StatusUpdate};

use crate::optimistic::{OptimisticState, View};

/// A typed mutation the application enqueues.
///
/// `kind` names the variant; the value itself is stored as the payload.
pub trait Mutation: Serialize + DeserializeOwned {
    fn kind(&self) -> &'static str;
}

/// Decode an operation's payload back into its typed form.
pub fn decode_payload<M: DeserializeOwned>(op: &Operation) -> Result<M> {
    serde_json::from_value(op.payload.clone()).map_err(|e| {
        Error::Serialization(format!("Failed to decode {} payload: {}", op.kind, e))
    })
}

/// Final outcome of an operation.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Committed,
    Failed(SyncError),
}

/// Caller-side view of one enqueued operation.
#[derive(Debug, Clone)]
pub struct OperationHandle {
    id: OperationId,
    rx: watch::Receiver<Operation>,
}

impl OperationHandle {
    pub fn id(&self) -> OperationId {
        self.id
    }

    /// Latest known status.
    pub fn status(&self) -> OperationStatus {
        self.rx.borrow().status
    }

    /// Latest known state of the operation.
    pub fn snapshot(&self) -> Operation {
        self.rx.borrow().clone()
    }

    /// Receive every status change.
    pub fn subscribe(&self) -> watch::Receiver<Operation> {
        self.rx.clone()
    }

    /// Wait until the operation commits or fails.
    ///
    /// # Errors
    /// - `Shutdown` if the queue was dropped before the operation settled
    pub async fn wait(&self) -> Result<Outcome> {
        let mut rx = self.rx.clone();
        let op = rx
            .wait_for(Operation::is_terminal)
            .await
            .map_err(|_| Error::Shutdown(format!("queue closed before {} settled", self.id)))?;
        Ok(outcome_of(&op))
    }
}

fn outcome_of(op: &Operation) -> Outcome {
    match op.status {
        OperationStatus::Failed => Outcome::Failed(
            op.last_error
                .clone()
                .unwrap_or_else(|| SyncError::terminal("failed")),
        ),
        _ => Outcome::Committed,
    }
}

#[derive(Default)]
struct QueueInner {
    /// Every stored operation by `seq`. Committed operations are purged.
    ops: BTreeMap<u64, Operation>,
    ids: HashMap<OperationId, u64>,
    /// Status channels for operations that have not settled.
    watchers: HashMap<OperationId, watch::Sender<Operation>>,
    next_seq: u64,
    /// Keys that received work since the worker last looked.
    dirty: BTreeSet<ResourceKey>,
}

impl QueueInner {
    fn lookup(&self, id: &OperationId) -> Option<&Operation> {
        self.ids.get(id).and_then(|seq| self.ops.get(seq))
    }

    fn active_count(&self) -> usize {
        self.ops.values().filter(|op| op.is_active()).count()
    }

    fn head(&self, key: &ResourceKey) -> Option<&Operation> {
        self.ops
            .values()
            .find(|op| op.is_active() && &op.resource_key == key)
    }

    /// Later active operations on `failed`'s key, each moved to `Failed`
    /// with a dependency error, paired with the status they had.
    fn quarantine_batch(&self, failed: &Operation) -> Result<Vec<(OperationStatus, Operation)>> {
        let cause = failed
            .last_error
            .as_ref()
            .map_or_else(|| failed.status.to_string(), |e| e.to_string());
        let error = SyncError::new(
            ErrorClass::DependencyFailed,
            format!("depends on failed operation {} ({})", failed.id, cause),
        );

        let mut batch = Vec::new();
        for op in self
            .ops
            .range(failed.seq + 1..)
            .map(|(_, op)| op)
            .filter(|op| op.is_active() && op.resource_key == failed.resource_key)
        {
            let mut next = op.clone();
            next.transition(OperationStatus::Failed)?;
            next.last_error = Some(error.clone());
            batch.push((op.status, next));
        }
        Ok(batch)
    }

    /// Record a new state for an operation and tell its watchers.
    fn store(&mut self, op: Operation) {
        if let Some(tx) = self.watchers.get(&op.id) {
            tx.send_replace(op.clone());
        }
        if op.is_terminal() {
            self.watchers.remove(&op.id);
        }
        if op.status == OperationStatus::Committed {
            self.ids.remove(&op.id);
            self.ops.remove(&op.seq);
        } else {
            self.ops.insert(op.seq, op);
        }
    }
}

/// Durable FIFO of operations, ordered per resource key.
pub struct OperationQueue {
    store: Arc<dyn DurableStore>,
    optimistic: Arc<OptimisticState>,
    inner: Mutex<QueueInner>,
    work: Notify,
    active_tx: watch::Sender<usize>,
}

impl OperationQueue {
    /// Open a queue over `store`, rebuilding the optimistic view from the
    /// stored operations and snapshots.
    ///
    /// # Postconditions
    /// - Operations left `InFlight` by an interrupted run are `Pending` again
    /// - Every key with pending work is reported by the next `take_dirty`
    ///
    /// # Errors
    /// - `Storage` if the store cannot be read or the reset cannot be written
    pub fn open(store: Arc<dyn DurableStore>, optimistic: Arc<OptimisticState>) -> Result<Self> {
        let mut ops = store.get_all()?;

        let mut reset = 0;
        for op in ops.iter_mut().filter(|op| op.status == OperationStatus::InFlight) {
            op.transition(OperationStatus::Pending)?;
            store.update_status(
                &op.id,
                OperationStatus::InFlight,
                &StatusUpdate::from_operation(op),
            )?;
            reset += 1;
        }
        if reset > 0 {
            info!("Reset {} interrupted operations to pending", reset);
        }

        let baseline: View = store
            .snapshots()?
            .into_iter()
            .filter(|(_, snapshot)| !snapshot.is_null())
            .collect();
        optimistic.restore(baseline, ops.iter().cloned());

        let mut inner = QueueInner {
            next_seq: ops.iter().map(|op| op.seq).max().map_or(1, |max| max + 1),
            ..QueueInner::default()
        };
        for op in ops {
            if op.is_active() {
                inner.dirty.insert(op.resource_key.clone());
                let (tx, _rx) = watch::channel(op.clone());
                inner.watchers.insert(op.id, tx);
            }
            inner.ids.insert(op.id, op.seq);
            inner.ops.insert(op.seq, op);
        }

        let (active_tx, _rx) = watch::channel(inner.active_count());
        debug!(
            "Opened queue on {} store with {} operations",
            store.name(),
            inner.ops.len()
        );

        Ok(Self {
            store,
            optimistic,
            inner: Mutex::new(inner),
            work: Notify::new(),
            active_tx,
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish_active(&self, inner: &QueueInner) {
        let count = inner.active_count();
        self.active_tx.send_if_modified(|current| {
            let changed = *current != count;
            *current = count;
            changed
        });
    }

    /// The optimistic state this queue feeds.
    pub fn optimistic(&self) -> &Arc<OptimisticState> {
        &self.optimistic
    }

    /// Durably enqueue an operation.
    ///
    /// # Postconditions
    /// - The operation is durable and visible in the optimistic view
    ///
    /// # Errors
    /// - `StorageFull` / `Storage` if the store did not accept the write;
    ///   nothing changes in that case
    pub fn enqueue(
        &self,
        kind: impl Into<String>,
        payload: Value,
        resource_key: ResourceKey,
    ) -> Result<OperationHandle> {
        let mut inner = self.lock();
        let op = Operation::new(inner.next_seq, resource_key, kind, payload);
        if inner.ids.contains_key(&op.id) {
            return Err(Error::Storage(format!("Duplicate operation id {}", op.id)));
        }

        self.store.put(&op)?;
        inner.next_seq += 1;
        self.optimistic.track(&op);

        debug!("Enqueued {} {} for {} (seq {})", op.kind, op.id, op.resource_key, op.seq);
        let (tx, rx) = watch::channel(op.clone());
        let handle = OperationHandle { id: op.id, rx };
        inner.watchers.insert(op.id, tx);
        inner.dirty.insert(op.resource_key.clone());
        inner.ids.insert(op.id, op.seq);
        inner.ops.insert(op.seq, op);
        self.publish_active(&inner);
        drop(inner);

        self.work.notify_one();
        Ok(handle)
    }

    /// Enqueue a typed mutation.
    pub fn enqueue_mutation<M: Mutation>(
        &self,
        resource_key: ResourceKey,
        mutation: &M,
    ) -> Result<OperationHandle> {
        let payload = serde_json::to_value(mutation).map_err(|e| {
            Error::Serialization(format!("Failed to encode {}: {}", mutation.kind(), e))
        })?;
        self.enqueue(mutation.kind(), payload, resource_key)
    }

    /// The next operation to send for `key`.
    ///
    /// `None` when the key has no work or its head is already in flight.
    pub fn peek_next(&self, key: &ResourceKey) -> Option<Operation> {
        self.lock()
            .head(key)
            .filter(|op| op.status == OperationStatus::Pending)
            .cloned()
    }

    /// Apply a status transition to a non-terminal operation.
    ///
    /// Unknown and terminal operations are left alone and `Ok(false)` is
    /// returned, as is a compare-and-set the store refused.
    fn transition<F>(&self, id: &OperationId, next: OperationStatus, edit: F) -> Result<bool>
    where
        F: FnOnce(&mut Operation),
    {
        let mut inner = self.lock();
        let Some(current) = inner.lookup(id) else {
            debug!("Ignoring {} for unknown operation {}", next, id);
            return Ok(false);
        };
        if current.is_terminal() {
            debug!("Ignoring {} for {} operation {}", next, current.status, id);
            return Ok(false);
        }

        let expected = current.status;
        let mut op = current.clone();
        op.transition(next)?;
        edit(&mut op);

        if !self
            .store
            .update_status(id, expected, &StatusUpdate::from_operation(&op))?
        {
            warn!("Store refused {} -> {} for {}", expected, next, id);
            return Ok(false);
        }

        if next == OperationStatus::Failed {
            self.optimistic.forget(id);
        }
        inner.store(op);
        self.publish_active(&inner);
        Ok(true)
    }

    /// Start a send. Increments the attempt count.
    ///
    /// # Errors
    /// - `InvalidTransition` if the operation is not the head of its key
    pub fn mark_in_flight(&self, id: &OperationId) -> Result<bool> {
        {
            let inner = self.lock();
            if let Some(op) = inner.lookup(id) {
                if op.is_active() && inner.head(&op.resource_key).map(|h| h.id) != Some(*id) {
                    return Err(Error::InvalidTransition(format!(
                        "{} is not the head of {}",
                        id, op.resource_key
                    )));
                }
            }
        }
        self.transition(id, OperationStatus::InFlight, |op| op.attempt += 1)
    }

    /// A send failed but may be retried.
    pub fn mark_retry(&self, id: &OperationId, error: SyncError) -> Result<bool> {
        self.transition(id, OperationStatus::Pending, |op| op.last_error = Some(error))
    }

    /// The operation failed permanently. Its effect leaves the view.
    pub fn mark_failed(&self, id: &OperationId, error: SyncError) -> Result<bool> {
        let failed = self.transition(id, OperationStatus::Failed, |op| {
            op.last_error = Some(error)
        })?;
        if failed {
            info!("Operation {} failed", id);
        }
        Ok(failed)
    }

    /// The remote applied the operation.
    ///
    /// `snapshot` becomes the resource's committed baseline. Without one the
    /// operation's effect is folded into the current baseline. The snapshot
    /// write and the purge are a single store transaction.
    pub fn mark_committed(&self, id: &OperationId, snapshot: Option<Value>) -> Result<bool> {
        let mut inner = self.lock();
        let Some(current) = inner.lookup(id) else {
            debug!("Ignoring commit for unknown operation {}", id);
            return Ok(false);
        };
        if current.is_terminal() {
            debug!("Ignoring commit for {} operation {}", current.status, id);
            return Ok(false);
        }

        let mut op = current.clone();
        op.transition(OperationStatus::Committed)?;
        let baseline = snapshot.unwrap_or_else(|| self.optimistic.folded_baseline(&op));

        self.store.commit(id, &op.resource_key, Some(&baseline))?;
        self.optimistic.settle(&op, baseline);

        debug!("Committed {} for {} after {} attempts", id, op.resource_key, op.attempt);
        inner.store(op);
        self.publish_active(&inner);
        Ok(true)
    }

    /// The conflict resolver rewrote the payload: persist it and return the
    /// operation to `Pending` for an immediate resend.
    pub fn rebase(&self, id: &OperationId, payload: Value, error: SyncError) -> Result<bool> {
        let mut inner = self.lock();
        let Some(current) = inner.lookup(id) else {
            return Ok(false);
        };
        if current.status != OperationStatus::InFlight {
            debug!("Ignoring rebase for {} operation {}", current.status, id);
            return Ok(false);
        }

        let mut op = current.clone();
        op.transition(OperationStatus::Pending)?;
        op.payload = payload;
        op.last_error = Some(error);

        self.store.put(&op)?;
        self.optimistic.track(&op);
        debug!("Rebased {} for {}", id, op.resource_key);
        inner.store(op);
        Ok(true)
    }

    /// Fail every later non-terminal operation on the failed operation's
    /// key, without sending them.
    ///
    /// Returns the ids that were failed.
    pub fn quarantine_successors(&self, id: &OperationId) -> Result<Vec<OperationId>> {
        let mut inner = self.lock();
        let Some(failed) = inner.lookup(id).cloned() else {
            return Ok(Vec::new());
        };
        let batch = inner.quarantine_batch(&failed)?;
        let ids: Vec<OperationId> = batch.iter().map(|(_, op)| op.id).collect();
        if !self.write_failures(&mut inner, batch)? {
            return Ok(Vec::new());
        }
        if !ids.is_empty() {
            warn!("Quarantined {} operations behind failed {}", ids.len(), id);
        }
        Ok(ids)
    }

    /// Fail an operation and quarantine its successors in one store write,
    /// so a restart never finds the successors still sendable.
    ///
    /// Returns `None` when the operation is unknown, already terminal, or the
    /// store refused the write; otherwise the quarantined ids.
    pub fn fail_with_successors(
        &self,
        id: &OperationId,
        error: SyncError,
    ) -> Result<Option<Vec<OperationId>>> {
        let mut inner = self.lock();
        let Some(current) = inner.lookup(id) else {
            debug!("Ignoring failure of unknown operation {}", id);
            return Ok(None);
        };
        if current.is_terminal() {
            debug!("Ignoring failure of {} operation {}", current.status, id);
            return Ok(None);
        }

        let expected = current.status;
        let mut failed = current.clone();
        failed.transition(OperationStatus::Failed)?;
        failed.last_error = Some(error);

        let successors = inner.quarantine_batch(&failed)?;
        let ids: Vec<OperationId> = successors.iter().map(|(_, op)| op.id).collect();
        let mut batch = vec![(expected, failed)];
        batch.extend(successors);
        if !self.write_failures(&mut inner, batch)? {
            return Ok(None);
        }

        info!("Operation {} failed", id);
        if !ids.is_empty() {
            warn!("Quarantined {} operations behind failed {}", ids.len(), id);
        }
        Ok(Some(ids))
    }

    /// Persist a batch of `(expected, failed)` operations, then roll their
    /// effects out of the view.
    fn write_failures(
        &self,
        inner: &mut QueueInner,
        batch: Vec<(OperationStatus, Operation)>,
    ) -> Result<bool> {
        if batch.is_empty() {
            return Ok(true);
        }
        let updates: Vec<_> = batch
            .iter()
            .map(|(expected, op)| (op.id, *expected, StatusUpdate::from_operation(op)))
            .collect();
        if !self.store.update_statuses(&updates)? {
            warn!("Store refused failing {} operations", updates.len());
            return Ok(false);
        }

        for (_, op) in batch {
            self.optimistic.forget(&op.id);
            inner.store(op);
        }
        self.publish_active(inner);
        Ok(true)
    }

    /// Return every `InFlight` operation to `Pending`.
    ///
    /// Used when the worker stops with sends outstanding; they are resent
    /// with the same idempotency key.
    pub fn release_in_flight(&self) -> Result<usize> {
        let in_flight: Vec<(OperationId, ResourceKey)> = self
            .lock()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::InFlight)
            .map(|op| (op.id, op.resource_key.clone()))
            .collect();

        let mut released = 0;
        for (id, key) in in_flight {
            if self.transition(&id, OperationStatus::Pending, |_| {})? {
                self.lock().dirty.insert(key);
                released += 1;
            }
        }
        if released > 0 {
            info!("Released {} abandoned sends", released);
        }
        Ok(released)
    }

    /// Persist authoritative server data for `key` and rebuild its view.
    pub fn reconcile(&self, key: &ResourceKey, snapshot: Value) -> Result<()> {
        self.store.put_snapshot(key, &snapshot)?;
        self.optimistic.reconcile(key, snapshot);
        Ok(())
    }

    pub fn get(&self, id: &OperationId) -> Option<Operation> {
        self.lock().lookup(id).cloned()
    }

    /// Every stored operation in `seq` order.
    pub fn operations(&self) -> Vec<Operation> {
        self.lock().ops.values().cloned().collect()
    }

    /// Operations awaiting user action.
    pub fn failed(&self) -> Vec<Operation> {
        self.lock()
            .ops
            .values()
            .filter(|op| op.status == OperationStatus::Failed)
            .cloned()
            .collect()
    }

    /// Keys that still have work to send.
    pub fn pending_keys(&self) -> BTreeSet<ResourceKey> {
        self.lock()
            .ops
            .values()
            .filter(|op| op.is_active())
            .map(|op| op.resource_key.clone())
            .collect()
    }

    /// Number of stored operations, failed ones included.
    pub fn len(&self) -> usize {
        self.lock().ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Delete a failed operation.
    ///
    /// # Errors
    /// - `NotFound` if no such operation is stored
    /// - `InvalidInput` if the operation has not failed
    pub fn discard(&self, id: &OperationId) -> Result<()> {
        let mut inner = self.lock();
        let Some(op) = inner.lookup(id) else {
            return Err(Error::NotFound(format!("Operation {}", id)));
        };
        if op.status != OperationStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "Only failed operations can be discarded; {} is {}",
                id, op.status
            )));
        }

        let seq = op.seq;
        self.store.delete(id)?;
        inner.ids.remove(id);
        inner.ops.remove(&seq);
        info!("Discarded operation {}", id);
        Ok(())
    }

    /// Enqueue a fresh copy of a failed operation and discard the original.
    ///
    /// The copy gets a new id and goes to the back of its key.
    pub fn resubmit(&self, id: &OperationId) -> Result<OperationHandle> {
        let op = self
            .get(id)
            .ok_or_else(|| Error::NotFound(format!("Operation {}", id)))?;
        if op.status != OperationStatus::Failed {
            return Err(Error::InvalidInput(format!(
                "Only failed operations can be resubmitted; {} is {}",
                id, op.status
            )));
        }

        let handle = self.enqueue(op.kind, op.payload, op.resource_key)?;
        self.discard(id)?;
        info!("Resubmitted {} as {}", id, handle.id());
        Ok(handle)
    }

    /// Handle for a stored operation.
    pub fn handle(&self, id: &OperationId) -> Option<OperationHandle> {
        let inner = self.lock();
        if let Some(tx) = inner.watchers.get(id) {
            return Some(OperationHandle {
                id: *id,
                rx: tx.subscribe(),
            });
        }
        // Settled: the receiver keeps the final state.
        let op = inner.lookup(id)?.clone();
        let (_tx, rx) = watch::channel(op);
        Some(OperationHandle { id: *id, rx })
    }

    /// Keys that received work since the last call.
    pub fn take_dirty(&self) -> BTreeSet<ResourceKey> {
        std::mem::take(&mut self.lock().dirty)
    }

    /// Wait until an enqueue happens.
    pub async fn wait_for_work(&self) {
        self.work.notified().await
    }

    /// Number of operations not yet committed or failed.
    pub fn subscribe_active(&self) -> watch::Receiver<usize> {
        self.active_tx.subscribe()
    }
}
