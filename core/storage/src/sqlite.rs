//! SQLite-backed durable store.
//!
//! Persists queued operations and committed snapshots in a single database
//! file so that a restarted process can rebuild its queue and view.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, ErrorCode};
use std::path::Path;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, info};

use outbox_common::{Error, Operation, OperationId, OperationStatus, ResourceKey, Result, SyncError};

use crate::store::{DurableStore, StatusUpdate};

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS operations (
        id TEXT PRIMARY KEY,
        resource_key TEXT NOT NULL,
        kind TEXT NOT NULL,
        payload TEXT NOT NULL,
        status TEXT NOT NULL,
        seq INTEGER NOT NULL,
        created_at TEXT NOT NULL,
        attempt INTEGER NOT NULL,
        last_error TEXT
    );

    CREATE TABLE IF NOT EXISTS snapshots (
        resource_key TEXT PRIMARY KEY,
        value TEXT NOT NULL
    );

    CREATE INDEX IF NOT EXISTS idx_operations_seq ON operations(seq);
"#;

/// Durable store using SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Create or open a store database.
    ///
    /// # Errors
    /// - Database creation or migration failure
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(db_path.as_ref()).map_err(map_sqlite)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")
            .map_err(map_sqlite)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite)?;

        info!("Durable store opened at {}", db_path.as_ref().display());
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().map_err(map_sqlite)?;
        conn.execute_batch(SCHEMA).map_err(map_sqlite)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| Error::Storage("sqlite connection lock poisoned".to_string()))
    }
}

impl DurableStore for SqliteStore {
    fn name(&self) -> &str {
        "sqlite"
    }

    fn put(&self, op: &Operation) -> Result<()> {
        debug!("Persisting operation {} ({})", op.id, op.kind);
        let payload = to_json(&op.payload)?;
        let last_error = op.last_error.as_ref().map(to_json).transpose()?;

        self.conn()?
            .execute(
                r#"
                INSERT OR REPLACE INTO operations
                (id, resource_key, kind, payload, status, seq, created_at, attempt, last_error)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                "#,
                params![
                    op.id.to_string(),
                    op.resource_key.as_str(),
                    op.kind,
                    payload,
                    op.status.as_str(),
                    op.seq as i64,
                    op.created_at.to_rfc3339(),
                    op.attempt,
                    last_error,
                ],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn get_all(&self) -> Result<Vec<Operation>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare(
                r#"
                SELECT id, resource_key, kind, payload, status, seq, created_at, attempt, last_error
                FROM operations ORDER BY seq ASC
                "#,
            )
            .map_err(map_sqlite)?;

        let rows = stmt
            .query_map([], |row| {
                Ok(RawOperation {
                    id: row.get(0)?,
                    resource_key: row.get(1)?,
                    kind: row.get(2)?,
                    payload: row.get(3)?,
                    status: row.get(4)?,
                    seq: row.get(5)?,
                    created_at: row.get(6)?,
                    attempt: row.get(7)?,
                    last_error: row.get(8)?,
                })
            })
            .map_err(map_sqlite)?;

        let mut ops = Vec::new();
        for row in rows {
            ops.push(row.map_err(map_sqlite)?.decode()?);
        }
        Ok(ops)
    }

    fn update_status(
        &self,
        id: &OperationId,
        expected: OperationStatus,
        update: &StatusUpdate,
    ) -> Result<bool> {
        let last_error = update.last_error.as_ref().map(to_json).transpose()?;
        let changed = self
            .conn()?
            .execute(
                r#"
                UPDATE operations SET status = ?1, attempt = ?2, last_error = ?3
                WHERE id = ?4 AND status = ?5
                "#,
                params![
                    update.status.as_str(),
                    update.attempt,
                    last_error,
                    id.to_string(),
                    expected.as_str(),
                ],
            )
            .map_err(map_sqlite)?;
        Ok(changed == 1)
    }

    fn update_statuses(
        &self,
        updates: &[(OperationId, OperationStatus, StatusUpdate)],
    ) -> Result<bool> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(map_sqlite)?;
        for (id, expected, update) in updates {
            let last_error = update.last_error.as_ref().map(to_json).transpose()?;
            let changed = tx
                .execute(
                    r#"
                    UPDATE operations SET status = ?1, attempt = ?2, last_error = ?3
                    WHERE id = ?4 AND status = ?5
                    "#,
                    params![
                        update.status.as_str(),
                        update.attempt,
                        last_error,
                        id.to_string(),
                        expected.as_str(),
                    ],
                )
                .map_err(map_sqlite)?;
            if changed != 1 {
                // Dropping the transaction rolls back the earlier rows
                return Ok(false);
            }
        }
        tx.commit().map_err(map_sqlite)?;
        Ok(true)
    }

    fn delete(&self, id: &OperationId) -> Result<bool> {
        let removed = self
            .conn()?
            .execute("DELETE FROM operations WHERE id = ?1", [id.to_string()])
            .map_err(map_sqlite)?;
        Ok(removed > 0)
    }

    fn put_snapshot(&self, key: &ResourceKey, snapshot: &serde_json::Value) -> Result<()> {
        self.conn()?
            .execute(
                "INSERT OR REPLACE INTO snapshots (resource_key, value) VALUES (?1, ?2)",
                params![key.as_str(), to_json(snapshot)?],
            )
            .map_err(map_sqlite)?;
        Ok(())
    }

    fn snapshots(&self) -> Result<Vec<(ResourceKey, serde_json::Value)>> {
        let conn = self.conn()?;
        let mut stmt = conn
            .prepare("SELECT resource_key, value FROM snapshots ORDER BY resource_key")
            .map_err(map_sqlite)?;
        let rows = stmt
            .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?)))
            .map_err(map_sqlite)?;

        let mut snapshots = Vec::new();
        for row in rows {
            let (key, value) = row.map_err(map_sqlite)?;
            snapshots.push((ResourceKey::new(key)?, from_json(&value)?));
        }
        Ok(snapshots)
    }

    fn commit(
        &self,
        id: &OperationId,
        key: &ResourceKey,
        snapshot: Option<&serde_json::Value>,
    ) -> Result<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(map_sqlite)?;
        if let Some(snapshot) = snapshot {
            tx.execute(
                "INSERT OR REPLACE INTO snapshots (resource_key, value) VALUES (?1, ?2)",
                params![key.as_str(), to_json(snapshot)?],
            )
            .map_err(map_sqlite)?;
        }
        tx.execute("DELETE FROM operations WHERE id = ?1", [id.to_string()])
            .map_err(map_sqlite)?;
        tx.commit().map_err(map_sqlite)
    }
}

/// Row as stored, before decoding.
struct RawOperation {
    id: String,
    resource_key: String,
    kind: String,
    payload: String,
    status: String,
    seq: i64,
    created_at: String,
    attempt: u32,
    last_error: Option<String>,
}

impl RawOperation {
    fn decode(self) -> Result<Operation> {
        let created_at = DateTime::parse_from_rfc3339(&self.created_at)
            .map_err(|e| Error::Serialization(format!("Invalid created_at: {}", e)))?
            .with_timezone(&Utc);
        let last_error = self
            .last_error
            .as_deref()
            .map(from_json::<SyncError>)
            .transpose()?;

        Ok(Operation {
            id: self.id.parse()?,
            resource_key: ResourceKey::new(self.resource_key)?,
            kind: self.kind,
            payload: from_json(&self.payload)?,
            status: self.status.parse()?,
            seq: self.seq as u64,
            created_at,
            attempt: self.attempt,
            last_error,
        })
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::Serialization(e.to_string()))
}

fn from_json<T: serde::de::DeserializeOwned>(raw: &str) -> Result<T> {
    serde_json::from_str(raw).map_err(|e| Error::Serialization(e.to_string()))
}

fn map_sqlite(err: rusqlite::Error) -> Error {
    match err.sqlite_error_code() {
        Some(ErrorCode::DiskFull) => Error::StorageFull(err.to_string()),
        _ => Error::Storage(err.to_string()),
    }
}
