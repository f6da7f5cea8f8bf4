//! Persistent device list state.
//!
//! The store is the source of truth for every remote user's device list.
//! All writes for one user go through a single SQLite transaction that checks
//! the caller's view of the stream id, so concurrent or replayed commits for
//! the same user are rejected rather than interleaved.

use crate::error::{StorageError, StorageResult};
use crate::open_connection;
use chrono::{DateTime, Utc};
use keyserver_types::{
    ChangeType, DeviceChange, DeviceId, DeviceKeys, DeviceListState, PendingChange, ServerName,
    UserId,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Persistent store for device lists backed by SQLite.
#[derive(Clone)]
pub struct DeviceListStore {
    conn: Arc<Mutex<Connection>>,
}

impl DeviceListStore {
    /// Opens (or creates) a device list store at the given path.
    pub fn open(path: impl AsRef<Path>) -> StorageResult<Self> {
        let conn = open_connection(Some(path.as_ref()))?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Opens an in-memory device list store (for testing).
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = open_connection(None)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    fn init_schema(&self) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS device_lists (
                user_id TEXT PRIMARY KEY,
                server_name TEXT NOT NULL,
                stream_id INTEGER NOT NULL DEFAULT 0,
                remote_stream_id INTEGER NOT NULL DEFAULT 0,
                is_stale INTEGER NOT NULL DEFAULT 0,
                updated_at INTEGER
            );

            CREATE INDEX IF NOT EXISTS device_lists_stale
                ON device_lists (is_stale) WHERE is_stale = 1;

            CREATE TABLE IF NOT EXISTS device_keys (
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                key_json TEXT NOT NULL,
                PRIMARY KEY (user_id, device_id)
            );

            CREATE TABLE IF NOT EXISTS pending_changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                device_id TEXT NOT NULL,
                change_type TEXT NOT NULL,
                stream_id INTEGER NOT NULL
            );
            ",
        )?;

        // Databases created before the remote stream id was tracked.
        let has_remote: bool = conn.query_row(
            "SELECT COUNT(*) > 0 FROM pragma_table_info('device_lists') WHERE name = 'remote_stream_id'",
            [],
            |row| row.get(0),
        )?;
        if !has_remote {
            conn.execute_batch(
                "ALTER TABLE device_lists ADD COLUMN remote_stream_id INTEGER NOT NULL DEFAULT 0",
            )?;
        }
        Ok(())
    }

    // ── Reads ────────────────────────────────────────────────────

    /// Loads the device list for a user, if one has ever been recorded.
    pub fn get_device_list_state(&self, user_id: &UserId) -> StorageResult<Option<DeviceListState>> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT server_name, stream_id, remote_stream_id, is_stale, updated_at
                 FROM device_lists WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| {
                    let server: String = row.get(0)?;
                    let stream_id: i64 = row.get(1)?;
                    let remote_stream_id: i64 = row.get(2)?;
                    let is_stale: bool = row.get(3)?;
                    let updated_at: Option<i64> = row.get(4)?;
                    Ok((server, stream_id, remote_stream_id, is_stale, updated_at))
                },
            )
            .optional()?;

        let Some((server, stream_id, remote_stream_id, is_stale, updated_at)) = row else {
            return Ok(None);
        };

        let mut stmt =
            conn.prepare("SELECT key_json FROM device_keys WHERE user_id = ?1 ORDER BY device_id")?;
        let rows = stmt.query_map(params![user_id.as_str()], |row| row.get::<_, String>(0))?;

        let mut devices = BTreeMap::new();
        for row in rows {
            let keys: DeviceKeys = serde_json::from_str(&row?)?;
            devices.insert(keys.device_id.clone(), keys);
        }

        Ok(Some(DeviceListState {
            user_id: user_id.clone(),
            server_name: ServerName::parse(&server)?,
            stream_id,
            remote_stream_id,
            is_stale,
            devices,
            updated_at: updated_at.and_then(DateTime::<Utc>::from_timestamp_millis),
        }))
    }

    /// Returns every user whose device list is flagged stale, ordered by user ID.
    pub fn list_stale_users(&self) -> StorageResult<Vec<(UserId, ServerName)>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT user_id, server_name FROM device_lists WHERE is_stale = 1 ORDER BY user_id",
        )?;
        let rows = stmt.query_map([], |row| {
            let uid: String = row.get(0)?;
            let server: String = row.get(1)?;
            Ok((uid, server))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (uid, server) = row?;
            result.push((UserId::parse(&uid)?, ServerName::parse(&server)?));
        }
        Ok(result)
    }

    // ── Staleness ────────────────────────────────────────────────

    /// Flags a user's device list as stale, creating the record if absent.
    ///
    /// Idempotent. Returns `true` if the record was not already stale.
    pub fn mark_stale(&self, user_id: &UserId, server_name: &ServerName) -> StorageResult<bool> {
        let conn = self.lock()?;
        let was_stale: Option<bool> = conn
            .query_row(
                "SELECT is_stale FROM device_lists WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        conn.execute(
            "INSERT INTO device_lists (user_id, server_name, stream_id, is_stale, updated_at)
             VALUES (?1, ?2, 0, 1, ?3)
             ON CONFLICT(user_id) DO UPDATE SET is_stale = 1, server_name = excluded.server_name",
            params![user_id.as_str(), server_name.as_str(), now_millis()],
        )?;
        Ok(was_stale != Some(true))
    }

    /// Clears staleness for a user whose remote list matched local state.
    ///
    /// `remote_stream_id` is what the remote reported. Both the local and
    /// the remote stream id are only ever raised, never lowered. Creates the
    /// record if the user was never seen before.
    pub fn resolve_unchanged(
        &self,
        user_id: &UserId,
        server_name: &ServerName,
        remote_stream_id: i64,
    ) -> StorageResult<()> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO device_lists
                (user_id, server_name, stream_id, remote_stream_id, is_stale, updated_at)
             VALUES (?1, ?2, ?3, ?3, 0, ?4)
             ON CONFLICT(user_id) DO UPDATE SET
                is_stale = 0,
                updated_at = excluded.updated_at,
                stream_id = MAX(device_lists.stream_id, excluded.stream_id),
                remote_stream_id = MAX(device_lists.remote_stream_id, excluded.remote_stream_id)",
            params![
                user_id.as_str(),
                server_name.as_str(),
                remote_stream_id,
                now_millis()
            ],
        )?;
        Ok(())
    }

    // ── Commits ──────────────────────────────────────────────────

    /// Atomically replaces a user's device list and records the changes in
    /// the publication outbox.
    ///
    /// `expected_stream_id` is the stream id the caller loaded; the commit is
    /// rejected with [`StorageError::Conflict`] if the stored value moved in
    /// the meantime, and with [`StorageError::StreamRegression`] if
    /// `new_state.stream_id` does not strictly exceed it.
    pub fn commit_device_list_update(
        &self,
        expected_stream_id: i64,
        new_state: &DeviceListState,
        changes: &[DeviceChange],
    ) -> StorageResult<Vec<PendingChange>> {
        let user_id = &new_state.user_id;
        let mut conn = self.lock()?;
        let tx = conn.transaction()?;

        let current: i64 = tx
            .query_row(
                "SELECT stream_id FROM device_lists WHERE user_id = ?1",
                params![user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);

        if current != expected_stream_id {
            return Err(StorageError::Conflict {
                user_id: user_id.clone(),
                expected: expected_stream_id,
                found: current,
            });
        }
        if new_state.stream_id <= current {
            return Err(StorageError::StreamRegression {
                user_id: user_id.clone(),
                current,
                attempted: new_state.stream_id,
            });
        }

        tx.execute(
            "INSERT INTO device_lists
                (user_id, server_name, stream_id, remote_stream_id, is_stale, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(user_id) DO UPDATE SET
                server_name = excluded.server_name,
                stream_id = excluded.stream_id,
                remote_stream_id = MAX(device_lists.remote_stream_id, excluded.remote_stream_id),
                is_stale = excluded.is_stale,
                updated_at = excluded.updated_at",
            params![
                user_id.as_str(),
                new_state.server_name.as_str(),
                new_state.stream_id,
                new_state.remote_stream_id,
                new_state.is_stale,
                now_millis(),
            ],
        )?;

        tx.execute(
            "DELETE FROM device_keys WHERE user_id = ?1",
            params![user_id.as_str()],
        )?;
        {
            let mut insert = tx.prepare(
                "INSERT INTO device_keys (user_id, device_id, key_json) VALUES (?1, ?2, ?3)",
            )?;
            for (device_id, keys) in &new_state.devices {
                insert.execute(params![
                    user_id.as_str(),
                    device_id.as_str(),
                    serde_json::to_string(keys)?,
                ])?;
            }
        }

        let mut pending = Vec::with_capacity(changes.len());
        {
            let mut insert = tx.prepare(
                "INSERT INTO pending_changes (user_id, device_id, change_type, stream_id)
                 VALUES (?1, ?2, ?3, ?4)",
            )?;
            for change in changes {
                insert.execute(params![
                    user_id.as_str(),
                    change.device_id.as_str(),
                    change.change_type.as_str(),
                    new_state.stream_id,
                ])?;
                pending.push(PendingChange {
                    seq: tx.last_insert_rowid(),
                    user_id: user_id.clone(),
                    device_id: change.device_id.clone(),
                    change_type: change.change_type,
                    stream_id: new_state.stream_id,
                });
            }
        }

        tx.commit()?;
        debug!(
            user_id = %user_id,
            stream_id = new_state.stream_id,
            changes = pending.len(),
            "committed device list update"
        );
        Ok(pending)
    }

    // ── Outbox ───────────────────────────────────────────────────

    /// Returns committed changes not yet acknowledged as published, in commit order.
    pub fn pending_changes(&self) -> StorageResult<Vec<PendingChange>> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT seq, user_id, device_id, change_type, stream_id
             FROM pending_changes ORDER BY seq",
        )?;
        let rows = stmt.query_map([], |row| {
            let seq: i64 = row.get(0)?;
            let uid: String = row.get(1)?;
            let did: String = row.get(2)?;
            let kind: String = row.get(3)?;
            let stream_id: i64 = row.get(4)?;
            Ok((seq, uid, did, kind, stream_id))
        })?;

        let mut result = Vec::new();
        for row in rows {
            let (seq, uid, did, kind, stream_id) = row?;
            result.push(PendingChange {
                seq,
                user_id: UserId::parse(&uid)?,
                device_id: DeviceId::new(did)?,
                change_type: kind.parse::<ChangeType>()?,
                stream_id,
            });
        }
        Ok(result)
    }

    /// Drops outbox rows up to and including `up_to_seq`. Returns rows removed.
    pub fn ack_changes(&self, up_to_seq: i64) -> StorageResult<usize> {
        let conn = self.lock()?;
        let removed = conn.execute(
            "DELETE FROM pending_changes WHERE seq <= ?1",
            params![up_to_seq],
        )?;
        Ok(removed)
    }
}

fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}
