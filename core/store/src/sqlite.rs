//! SQLite implementation of the durable local store.
//!
//! A single connection serialized behind an async mutex. Single-record
//! operations are atomic by SQLite's own guarantees; multi-record
//! operations (local mutation + enqueue, confirmation, bulk restore) run
//! in explicit transactions so the store is left in either the pre- or
//! post-operation state on failure.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;
use tracing::{debug, info};

use fieldsync_common::{
    Collection, Error, OperationKind, PendingOperation, Record, RecordId, Result, Session,
    SyncStatus,
};

use crate::snapshot::StoreSnapshot;

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS records (
    collection    TEXT NOT NULL,
    id_key        TEXT NOT NULL,
    payload       TEXT NOT NULL,
    sync_status   TEXT NOT NULL,
    last_modified INTEGER NOT NULL,
    PRIMARY KEY (collection, id_key)
);

CREATE INDEX IF NOT EXISTS idx_records_modified
    ON records(collection, last_modified DESC);

CREATE TABLE IF NOT EXISTS pending_ops (
    seq         INTEGER PRIMARY KEY AUTOINCREMENT,
    collection  TEXT NOT NULL,
    kind        TEXT NOT NULL,
    record_key  TEXT NOT NULL,
    payload     TEXT,
    user        TEXT NOT NULL,
    enqueued_at INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_pending_collection
    ON pending_ops(collection, seq);

CREATE TABLE IF NOT EXISTS session (
    slot INTEGER PRIMARY KEY CHECK (slot = 0),
    data TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS backups (
    id       INTEGER PRIMARY KEY,
    metadata TEXT NOT NULL,
    data     BLOB NOT NULL
);
"#;

/// Durable local store backed by SQLite.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(SCHEMA)?;
        info!(path = %path.as_ref().display(), "local store opened");
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (useful for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // ---- records ----------------------------------------------------

    /// Get a record by id.
    pub async fn get(&self, collection: Collection, id: &RecordId) -> Result<Option<Record>> {
        let conn = self.conn.lock().await;
        let row: Option<(String, String, String, i64)> = conn
            .query_row(
                "SELECT id_key, payload, sync_status, last_modified
                 FROM records WHERE collection = ?1 AND id_key = ?2",
                params![collection.as_str(), id.to_key()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )
            .optional()?;
        row.map(record_from_parts).transpose()
    }

    /// Get every record in a collection, most recently modified first.
    pub async fn get_all(&self, collection: Collection) -> Result<Vec<Record>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id_key, payload, sync_status, last_modified
             FROM records WHERE collection = ?1
             ORDER BY last_modified DESC, id_key ASC",
        )?;
        let rows = stmt
            .query_map(params![collection.as_str()], |row| {
                Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
            })?
            .collect::<rusqlite::Result<Vec<(String, String, String, i64)>>>()?;
        rows.into_iter().map(record_from_parts).collect()
    }

    /// Insert or replace a record.
    ///
    /// Always stamps `last_modified` with the current local time. The
    /// caller's `sync_status` is written as-is; marking a record `Synced`
    /// is an explicit act of whoever confirmed it.
    pub async fn put(&self, collection: Collection, mut record: Record) -> Result<Record> {
        record.last_modified = now_millis();
        let conn = self.conn.lock().await;
        upsert_record(&conn, collection, &record)?;
        Ok(record)
    }

    /// Delete a record. Deleting an absent record is a no-op.
    pub async fn delete(&self, collection: Collection, id: &RecordId) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM records WHERE collection = ?1 AND id_key = ?2",
            params![collection.as_str(), id.to_key()],
        )?;
        Ok(())
    }

    /// Look up records by a scalar payload field, e.g. screenings by
    /// `childId`.
    pub async fn get_by_index(
        &self,
        collection: Collection,
        field: &str,
        value: &serde_json::Value,
    ) -> Result<Vec<Record>> {
        let bound = scalar_to_sql(value)?;
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id_key, payload, sync_status, last_modified
             FROM records
             WHERE collection = ?1 AND json_extract(payload, ?2) = ?3
             ORDER BY last_modified DESC, id_key ASC",
        )?;
        let rows = stmt
            .query_map(
                params![collection.as_str(), format!("$.{field}"), bound],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
            )?
            .collect::<rusqlite::Result<Vec<(String, String, String, i64)>>>()?;
        rows.into_iter().map(record_from_parts).collect()
    }

    /// Set a record's sync status in place without touching its payload
    /// or `last_modified`.
    pub async fn set_sync_status(
        &self,
        collection: Collection,
        id: &RecordId,
        status: SyncStatus,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let rows = conn.execute(
            "UPDATE records SET sync_status = ?1 WHERE collection = ?2 AND id_key = ?3",
            params![status.as_str(), collection.as_str(), id.to_key()],
        )?;
        if rows == 0 {
            return Err(Error::NotFound(format!(
                "{collection}/{id} not in local store"
            )));
        }
        Ok(())
    }

    // ---- pending-operation queue -------------------------------------

    /// Write a pending record and enqueue the operation representing it,
    /// atomically.
    pub async fn apply_local_upsert(
        &self,
        collection: Collection,
        mut record: Record,
        kind: OperationKind,
        user: &str,
    ) -> Result<(Record, PendingOperation)> {
        record.last_modified = now_millis();
        let enqueued_at = now_millis();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        upsert_record(&tx, collection, &record)?;
        tx.execute(
            "INSERT INTO pending_ops (collection, kind, record_key, payload, user, enqueued_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                collection.as_str(),
                kind.as_str(),
                record.id.to_key(),
                serde_json::to_string(&record.payload)?,
                user,
                enqueued_at.timestamp_millis(),
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;

        debug!(%collection, seq, kind = kind.as_str(), "local mutation queued");
        let op = PendingOperation {
            seq,
            kind,
            collection,
            record_id: record.id.clone(),
            payload: Some(record.payload.clone()),
            user: user.to_string(),
            enqueued_at,
        };
        Ok((record, op))
    }

    /// Remove a record locally and enqueue the delete, atomically.
    pub async fn apply_local_delete(
        &self,
        collection: Collection,
        id: &RecordId,
        user: &str,
    ) -> Result<PendingOperation> {
        let enqueued_at = now_millis();

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id_key = ?2",
            params![collection.as_str(), id.to_key()],
        )?;
        tx.execute(
            "INSERT INTO pending_ops (collection, kind, record_key, payload, user, enqueued_at)
             VALUES (?1, ?2, ?3, NULL, ?4, ?5)",
            params![
                collection.as_str(),
                OperationKind::Delete.as_str(),
                id.to_key(),
                user,
                enqueued_at.timestamp_millis(),
            ],
        )?;
        let seq = tx.last_insert_rowid();
        tx.commit()?;

        debug!(%collection, seq, "local delete queued");
        Ok(PendingOperation {
            seq,
            kind: OperationKind::Delete,
            collection,
            record_id: id.clone(),
            payload: None,
            user: user.to_string(),
            enqueued_at,
        })
    }

    /// Queued operations for one collection, in enqueue order.
    pub async fn queued_operations(&self, collection: Collection) -> Result<Vec<PendingOperation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT seq, collection, kind, record_key, payload, user, enqueued_at
             FROM pending_ops WHERE collection = ?1 ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map(params![collection.as_str()], op_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(op_from_parts).collect()
    }

    /// One queued operation by sequence number, reflecting any
    /// re-targeting applied since it was listed.
    pub async fn queued_operation(&self, seq: i64) -> Result<Option<PendingOperation>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT seq, collection, kind, record_key, payload, user, enqueued_at
                 FROM pending_ops WHERE seq = ?1",
                params![seq],
                op_row,
            )
            .optional()?;
        row.map(op_from_parts).transpose()
    }

    /// Every queued operation across collections, in enqueue order.
    pub async fn all_queued(&self) -> Result<Vec<PendingOperation>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT seq, collection, kind, record_key, payload, user, enqueued_at
             FROM pending_ops ORDER BY seq ASC",
        )?;
        let rows = stmt
            .query_map([], op_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows.into_iter().map(op_from_parts).collect()
    }

    /// Number of queued operations.
    pub async fn queue_len(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM pending_ops", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    /// Confirm a replayed operation: remove its queue entry and apply the
    /// authoritative result, in one transaction.
    ///
    /// For creates the local placeholder record is replaced by the
    /// server-id record and any later queued operations that still point
    /// at the placeholder are re-targeted, so a queued update to a record
    /// created offline replays against the real server id.
    pub async fn confirm_operation(
        &self,
        seq: i64,
        collection: Collection,
        old_id: &RecordId,
        replacement: Option<&Record>,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM pending_ops WHERE seq = ?1", params![seq])?;
        tx.execute(
            "DELETE FROM records WHERE collection = ?1 AND id_key = ?2",
            params![collection.as_str(), old_id.to_key()],
        )?;
        if let Some(record) = replacement {
            upsert_record(&tx, collection, record)?;
            if record.id != *old_id {
                tx.execute(
                    "UPDATE pending_ops SET record_key = ?1
                     WHERE collection = ?2 AND record_key = ?3",
                    params![
                        record.id.to_key(),
                        collection.as_str(),
                        old_id.to_key()
                    ],
                )?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    // ---- session ------------------------------------------------------

    /// Store the session, replacing any previous one.
    pub async fn put_session(&self, session: &Session) -> Result<()> {
        let data = serde_json::to_string(session)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO session (slot, data) VALUES (0, ?1)",
            params![data],
        )?;
        Ok(())
    }

    /// The current session, if any.
    pub async fn session(&self) -> Result<Option<Session>> {
        let conn = self.conn.lock().await;
        let data: Option<String> = conn
            .query_row("SELECT data FROM session WHERE slot = 0", [], |r| r.get(0))
            .optional()?;
        data.map(|d| serde_json::from_str(&d).map_err(Error::from))
            .transpose()
    }

    /// Clear the session.
    pub async fn clear_session(&self) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM session", [])?;
        Ok(())
    }

    // ---- backup artifacts ----------------------------------------------

    /// Persist a backup artifact keyed by its creation timestamp.
    pub async fn put_backup(&self, id: i64, metadata: &str, data: &[u8]) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO backups (id, metadata, data) VALUES (?1, ?2, ?3)",
            params![id, metadata, data],
        )?;
        Ok(())
    }

    /// Load a backup artifact: `(metadata json, compressed bytes)`.
    pub async fn backup(&self, id: i64) -> Result<Option<(String, Vec<u8>)>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            "SELECT metadata, data FROM backups WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()
        .map_err(Error::from)
    }

    /// Backup metadata entries, newest first.
    pub async fn list_backups(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT id, metadata FROM backups ORDER BY id DESC")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Delete one backup artifact.
    pub async fn delete_backup(&self, id: i64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM backups WHERE id = ?1", params![id])?;
        Ok(())
    }

    // ---- snapshot / restore ---------------------------------------------

    /// Take a canonical snapshot of the whole store (collections, queue,
    /// session; backup artifacts excluded).
    pub async fn snapshot(&self) -> Result<StoreSnapshot> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        let mut collections: BTreeMap<String, Vec<Record>> = BTreeMap::new();
        {
            let mut stmt = tx.prepare(
                "SELECT collection, id_key, payload, sync_status, last_modified
                 FROM records ORDER BY collection ASC, id_key ASC",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        (row.get(1)?, row.get(2)?, row.get(3)?, row.get(4)?),
                    ))
                })?
                .collect::<rusqlite::Result<Vec<(String, (String, String, String, i64))>>>()?;
            for (collection, parts) in rows {
                collections
                    .entry(collection)
                    .or_default()
                    .push(record_from_parts(parts)?);
            }
        }
        // Empty collections still appear in the snapshot.
        for collection in Collection::ALL {
            collections.entry(collection.as_str().to_string()).or_default();
        }

        let pending_operations = {
            let mut stmt = tx.prepare(
                "SELECT seq, collection, kind, record_key, payload, user, enqueued_at
                 FROM pending_ops ORDER BY seq ASC",
            )?;
            let rows = stmt
                .query_map([], op_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter()
                .map(op_from_parts)
                .collect::<Result<Vec<_>>>()?
        };

        let session = {
            let data: Option<String> = tx
                .query_row("SELECT data FROM session WHERE slot = 0", [], |r| r.get(0))
                .optional()?;
            data.map(|d| serde_json::from_str(&d)).transpose()?
        };

        tx.commit()?;
        Ok(StoreSnapshot {
            collections,
            pending_operations,
            session,
        })
    }

    /// Replace the entire store contents with a snapshot, atomically.
    ///
    /// Backup artifacts are left in place so a restore never destroys the
    /// backup catalog it was served from. On failure the transaction rolls
    /// back and the store is unchanged.
    pub async fn replace_all(&self, snapshot: &StoreSnapshot) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;

        tx.execute("DELETE FROM records", [])?;
        tx.execute("DELETE FROM pending_ops", [])?;
        tx.execute("DELETE FROM session", [])?;

        for (collection, records) in &snapshot.collections {
            for record in records {
                tx.execute(
                    "INSERT INTO records (collection, id_key, payload, sync_status, last_modified)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        collection,
                        record.id.to_key(),
                        serde_json::to_string(&record.payload)?,
                        record.sync_status.as_str(),
                        record.last_modified.timestamp_millis(),
                    ],
                )?;
            }
        }
        for op in &snapshot.pending_operations {
            tx.execute(
                "INSERT INTO pending_ops (seq, collection, kind, record_key, payload, user, enqueued_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    op.seq,
                    op.collection.as_str(),
                    op.kind.as_str(),
                    op.record_id.to_key(),
                    op.payload
                        .as_ref()
                        .map(serde_json::to_string)
                        .transpose()?,
                    op.user,
                    op.enqueued_at.timestamp_millis(),
                ],
            )?;
        }
        if let Some(session) = &snapshot.session {
            tx.execute(
                "INSERT INTO session (slot, data) VALUES (0, ?1)",
                params![serde_json::to_string(session)?],
            )?;
        }

        tx.commit()?;
        info!(
            records = snapshot.record_count(),
            queued = snapshot.pending_operations.len(),
            "store contents replaced from snapshot"
        );
        Ok(())
    }
}

fn upsert_record(
    conn: &Connection,
    collection: Collection,
    record: &Record,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO records (collection, id_key, payload, sync_status, last_modified)
         VALUES (?1, ?2, ?3, ?4, ?5)",
        params![
            collection.as_str(),
            record.id.to_key(),
            record.payload.to_string(),
            record.sync_status.as_str(),
            record.last_modified.timestamp_millis(),
        ],
    )?;
    Ok(())
}

type OpRow = (i64, String, String, String, Option<String>, String, i64);

fn op_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OpRow> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
    ))
}

fn op_from_parts(parts: OpRow) -> Result<PendingOperation> {
    let (seq, collection, kind, record_key, payload, user, enqueued_at) = parts;
    Ok(PendingOperation {
        seq,
        kind: kind.parse()?,
        collection: collection.parse()?,
        record_id: RecordId::parse_key(&record_key)?,
        payload: payload.map(|p| serde_json::from_str(&p)).transpose()?,
        user,
        enqueued_at: millis_to_datetime(enqueued_at)?,
    })
}

fn record_from_parts(parts: (String, String, String, i64)) -> Result<Record> {
    let (id_key, payload, sync_status, last_modified) = parts;
    Ok(Record {
        id: RecordId::parse_key(&id_key)?,
        payload: serde_json::from_str(&payload)?,
        sync_status: sync_status.parse()?,
        last_modified: millis_to_datetime(last_modified)?,
    })
}

/// Current time truncated to the millisecond precision the store
/// persists, so a returned record equals what a later read observes.
fn now_millis() -> DateTime<Utc> {
    let now = Utc::now();
    now - chrono::Duration::nanoseconds(i64::from(now.timestamp_subsec_nanos() % 1_000_000))
}

fn millis_to_datetime(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| Error::Store(format!("invalid timestamp in store: {millis}")))
}

fn scalar_to_sql(value: &serde_json::Value) -> Result<rusqlite::types::Value> {
    use rusqlite::types::Value as Sql;
    match value {
        serde_json::Value::Null => Ok(Sql::Null),
        serde_json::Value::Bool(b) => Ok(Sql::Integer(i64::from(*b))),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Ok(Sql::Integer(i))
            } else if let Some(f) = n.as_f64() {
                Ok(Sql::Real(f))
            } else {
                Err(Error::InvalidInput(format!("unsupported number: {n}")))
            }
        }
        serde_json::Value::String(s) => Ok(Sql::Text(s.clone())),
        other => Err(Error::InvalidInput(format!(
            "index value must be a scalar, got: {other}"
        ))),
    }
}
