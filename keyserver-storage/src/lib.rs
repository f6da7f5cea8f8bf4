//! SQLite storage layer for the keyserver.
//!
//! Two stores, each on its own connection:
//!
//! - [`DeviceListStore`] owns per-user device lists, per-device key material,
//!   per-user stream positions and the publication outbox. Every device list
//!   commit writes its outbox rows in the same transaction.
//! - [`KeyChangeLog`] is the durable, append-only key change stream that
//!   downstream consumers read from a position cursor.

mod change_log;
mod device_store;
mod error;

pub use change_log::KeyChangeLog;
pub use device_store::DeviceListStore;
pub use error::{StorageError, StorageResult};

use rusqlite::Connection;
use std::path::Path;

/// Opens a SQLite connection with the pragmas both stores rely on.
pub(crate) fn open_connection(path: Option<&Path>) -> StorageResult<Connection> {
    let conn = match path {
        Some(path) => Connection::open(path)?,
        None => Connection::open_in_memory()?,
    };
    conn.busy_timeout(std::time::Duration::from_secs(5))?;
    if path.is_some() {
        let _mode: String =
            conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| row.get(0))?;
    }
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    Ok(conn)
}
