//! Durable key change stream.
//!
//! Positions come from an `AUTOINCREMENT` key, so they are strictly
//! increasing and never reused even after rows are pruned. Readers page
//! through the log with a position cursor.

use crate::error::{StorageError, StorageResult};
use crate::open_connection;
use keyserver_types::{ChangeType, DeviceId, KeyChangeRecord, PendingChange, UserId};
use rusqlite::{params, Connection};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};

/// Append-only log of key change records backed by SQLite.
#[derive(Clone)]
pub struct KeyChangeLog {
    conn: Arc<Mutex<Connection>>,
}

impl KeyChangeLog {
    /// Opens (or creates) a change log at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = open_connection(Some(path.as_ref()))?;
        let log = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        log.init_schema()?;
        Ok(log)
    }

    /// Opens an in-memory change log (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = open_connection(None)?;
        let log = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        log.init_schema()?;
        Ok(log)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS key_changes (
                position INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                change_type TEXT NOT NULL,
                source_seq INTEGER NOT NULL
            );

            CREATE INDEX IF NOT EXISTS key_changes_user ON key_changes (user_id, position);
            ",
        )?;
        Ok(())
    }

    /// Appends a batch in one transaction, in the given order.
    ///
    /// Either every record gets a position or none does.
    pub fn append(&self, batch: &[PendingChange]) -> StorageResult<Vec<KeyChangeRecord>> {
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        let mut records = Vec::with_capacity(batch.len());
        {
            let mut insert = tx.prepare(
                "INSERT INTO key_changes (user_id, device_id, change_type, source_seq)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for change in batch {
                insert.execute(params![
                    change.user_id.as_str(),
                    change.device_id.as_str(),
                    change.change_type.as_str(),
                    change.seq,
                ])?;
                records.push(KeyChangeRecord {
                    position: tx.last_insert_rowid(),
                    user_id: change.user_id.clone(),
                    device_id: change.device_id.clone(),
                    change_type: change.change_type,
                });
            }
        }
        tx.commit()?;
        Ok(records)
    }

    /// Reads up to `limit` records with a position strictly greater than `from`.
    pub fn read_after(&self, from: i64, limit: usize) -> StorageResult<Vec<KeyChangeRecord>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT position, user_id, device_id, change_type FROM key_changes
             WHERE position > ?1 ORDER BY position LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![from, limit as i64], |row| {
            let position: i64 = row.get(0)?;
            let uid: String = row.get(1)?;
            let did: String = row.get(2)?;
            let kind: String = row.get(3)?;
            Ok((position, uid, did, kind))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (position, uid, did, kind) = row?;
            result.push(KeyChangeRecord {
                position,
                user_id: UserId::parse(&uid)?,
                device_id: DeviceId::new(did)?,
                change_type: kind.parse::<ChangeType>()?,
            });
        }
        Ok(result)
    }

    /// Highest position ever assigned, or 0 for an empty log.
    pub fn latest_position(&self) -> StorageResult<i64> {
        let conn = self.lock()?;
        let latest: i64 = conn.query_row(
            "SELECT COALESCE(MAX(position), 0) FROM key_changes",
            [],
            |row| row.get(0),
        )?;
        Ok(latest)
    }

    /// Distinct users with changes in `(from, to]`, ordered by user ID.
    ///
    /// `to = None` means up to the latest position.
    pub fn changed_users(&self, from: i64, to: Option<i64>) -> StorageResult<Vec<UserId>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT DISTINCT user_id FROM key_changes
             WHERE position > ?1 AND position <= ?2 ORDER BY user_id",
        )?;
        let rows = stmt.query_map(params![from, to.unwrap_or(i64::MAX)], |row| {
            row.get::<_, String>(0)
        })?;

        let mut result = Vec::new();
        for row in rows {
            result.push(UserId::parse(&row?)?);
        }
        Ok(result)
    }
}
