//! In-memory durable store for testing.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use outbox_common::{Error, Operation, OperationId, OperationStatus, ResourceKey, Result};

use crate::store::{DurableStore, StatusUpdate};

#[derive(Debug, Default)]
struct Tables {
    operations: HashMap<OperationId, Operation>,
    snapshots: BTreeMap<ResourceKey, serde_json::Value>,
}

/// In-memory store.
///
/// Useful for testing and development. Clones share the same tables, so a
/// clone handed to a fresh queue simulates a process restart. An optional
/// capacity makes `put` fail with `StorageFull` once reached.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    tables: Arc<RwLock<Tables>>,
    capacity: Option<usize>,
}

impl MemoryStore {
    /// Create a new empty memory store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a store that holds at most `capacity` operations.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            tables: Arc::default(),
            capacity: Some(capacity),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Tables>> {
        self.tables
            .read()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Tables>> {
        self.tables
            .write()
            .map_err(|_| Error::Storage("memory store lock poisoned".to_string()))
    }
}

impl DurableStore for MemoryStore {
    fn name(&self) -> &str {
        "memory"
    }

    fn put(&self, op: &Operation) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(capacity) = self.capacity {
            if !tables.operations.contains_key(&op.id) && tables.operations.len() >= capacity {
                return Err(Error::StorageFull(format!(
                    "memory store holds {} operations",
                    capacity
                )));
            }
        }
        tables.operations.insert(op.id, op.clone());
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<Operation>> {
        let tables = self.read()?;
        let mut ops: Vec<Operation> = tables.operations.values().cloned().collect();
        ops.sort_by_key(|op| op.seq);
        Ok(ops)
    }

    fn update_status(
        &self,
        id: &OperationId,
        expected: OperationStatus,
        update: &StatusUpdate,
    ) -> Result<bool> {
        let mut tables = self.write()?;
        match tables.operations.get_mut(id) {
            Some(op) if op.status == expected => {
                op.status = update.status;
                op.attempt = update.attempt;
                op.last_error = update.last_error.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    fn update_statuses(
        &self,
        updates: &[(OperationId, OperationStatus, StatusUpdate)],
    ) -> Result<bool> {
        let mut tables = self.write()?;
        let all_match = updates.iter().all(|(id, expected, _)| {
            tables
                .operations
                .get(id)
                .is_some_and(|op| op.status == *expected)
        });
        if !all_match {
            return Ok(false);
        }

        for (id, _, update) in updates {
            if let Some(op) = tables.operations.get_mut(id) {
                op.status = update.status;
                op.attempt = update.attempt;
                op.last_error = update.last_error.clone();
            }
        }
        Ok(true)
    }

    fn delete(&self, id: &OperationId) -> Result<bool> {
        Ok(self.write()?.operations.remove(id).is_some())
    }

    fn put_snapshot(&self, key: &ResourceKey, snapshot: &serde_json::Value) -> Result<()> {
        self.write()?.snapshots.insert(key.clone(), snapshot.clone());
        Ok(())
    }

    fn snapshots(&self) -> Result<Vec<(ResourceKey, serde_json::Value)>> {
        let tables = self.read()?;
        Ok(tables
            .snapshots
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }

    fn commit(
        &self,
        id: &OperationId,
        key: &ResourceKey,
        snapshot: Option<&serde_json::Value>,
    ) -> Result<()> {
        let mut tables = self.write()?;
        if let Some(snapshot) = snapshot {
            tables.snapshots.insert(key.clone(), snapshot.clone());
        }
        tables.operations.remove(id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use outbox_common::SyncError;
    use serde_json::json;

    fn op(seq: u64) -> Operation {
        Operation::new(seq, ResourceKey::new("s1").unwrap(), "log_set", json!({"reps": seq}))
    }

    #[test]
    fn test_put_and_get_all_ordered() {
        let store = MemoryStore::new();
        store.put(&op(3)).unwrap();
        store.put(&op(1)).unwrap();
        store.put(&op(2)).unwrap();

        let seqs: Vec<u64> = store.get_all().unwrap().iter().map(|o| o.seq).collect();
        assert_eq!(seqs, vec![1, 2, 3]);
    }

    #[test]
    fn test_update_status_compare_and_set() {
        let store = MemoryStore::new();
        let op = op(1);
        store.put(&op).unwrap();

        let update = StatusUpdate {
            status: OperationStatus::InFlight,
            attempt: 1,
            last_error: None,
        };
        assert!(store.update_status(&op.id, OperationStatus::Pending, &update).unwrap());
        // Second CAS with the stale expectation is rejected
        assert!(!store.update_status(&op.id, OperationStatus::Pending, &update).unwrap());

        let stored = &store.get_all().unwrap()[0];
        assert_eq!(stored.status, OperationStatus::InFlight);
        assert_eq!(stored.attempt, 1);
    }

    #[test]
    fn test_update_status_missing_record() {
        let store = MemoryStore::new();
        let update = StatusUpdate {
            status: OperationStatus::Failed,
            attempt: 0,
            last_error: Some(SyncError::terminal("nope")),
        };
        assert!(!store
            .update_status(&OperationId::generate(), OperationStatus::Pending, &update)
            .unwrap());
    }

    #[test]
    fn test_update_statuses_all_or_nothing() {
        let store = MemoryStore::new();
        let (a, b) = (op(1), op(2));
        store.put(&a).unwrap();
        store.put(&b).unwrap();

        let failed = StatusUpdate {
            status: OperationStatus::Failed,
            attempt: 0,
            last_error: Some(SyncError::terminal("invalid")),
        };
        let stale = [
            (a.id, OperationStatus::Pending, failed.clone()),
            (b.id, OperationStatus::InFlight, failed.clone()),
        ];
        assert!(!store.update_statuses(&stale).unwrap());
        assert!(store
            .get_all()
            .unwrap()
            .iter()
            .all(|op| op.status == OperationStatus::Pending));

        let batch = [
            (a.id, OperationStatus::Pending, failed.clone()),
            (b.id, OperationStatus::Pending, failed),
        ];
        assert!(store.update_statuses(&batch).unwrap());
        assert!(store
            .get_all()
            .unwrap()
            .iter()
            .all(|op| op.status == OperationStatus::Failed));
    }

    #[test]
    fn test_capacity_exhaustion() {
        let store = MemoryStore::with_capacity(1);
        let first = op(1);
        store.put(&first).unwrap();
        // Replacing an existing record does not count against capacity
        store.put(&first).unwrap();

        let err = store.put(&op(2)).unwrap_err();
        assert!(matches!(err, Error::StorageFull(_)));
    }

    #[test]
    fn test_commit_writes_snapshot_and_purges() {
        let store = MemoryStore::new();
        let op = op(1);
        store.put(&op).unwrap();

        store
            .commit(&op.id, &op.resource_key, Some(&json!({"total": 5})))
            .unwrap();

        assert!(store.get_all().unwrap().is_empty());
        let snapshots = store.snapshots().unwrap();
        assert_eq!(snapshots, vec![(op.resource_key.clone(), json!({"total": 5}))]);
    }

    #[test]
    fn test_clones_share_tables() {
        let store = MemoryStore::new();
        let reopened = store.clone();
        store.put(&op(1)).unwrap();
        assert_eq!(reopened.get_all().unwrap().len(), 1);
    }
}
