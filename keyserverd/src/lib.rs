//! Configuration and wiring for the key server daemon.

use anyhow::{Context, Result};
use keyserver_storage::{DeviceListStore, KeyChangeLog};
use keyserver_sync::{FederationClient, FederationConfig, KeyServer, UpdaterConfig};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Device list database file name inside the data directory.
pub const DEVICES_DB: &str = "devices.db";
/// Key change log file name inside the data directory.
pub const KEY_CHANGES_DB: &str = "key_changes.db";

/// Everything the daemon reads from its JSON config file.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Directory holding both databases. Overridden by `--data-dir`.
    pub data_dir: Option<PathBuf>,
    pub updater: UpdaterConfig,
    pub federation: FederationConfig,
}

impl DaemonConfig {
    /// Loads a config file, or the defaults when no path is given.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config {}", path.display()))?;
        serde_json::from_str(&raw)
            .with_context(|| format!("failed to parse config {}", path.display()))
    }

    /// Resolves the data directory: explicit flag, then config, then `./data`.
    pub fn data_dir(&self, flag: Option<&Path>) -> PathBuf {
        flag.map(Path::to_path_buf)
            .or_else(|| self.data_dir.clone())
            .unwrap_or_else(|| PathBuf::from("data"))
    }
}

/// The two stores, opened from a data directory.
pub struct Stores {
    pub devices: DeviceListStore,
    pub changes: KeyChangeLog,
}

impl Stores {
    /// Opens (creating if needed) both databases under `data_dir`.
    pub fn open(data_dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        let devices = DeviceListStore::open(data_dir.join(DEVICES_DB))
            .context("failed to open device list store")?;
        let changes = KeyChangeLog::open(data_dir.join(KEY_CHANGES_DB))
            .context("failed to open key change log")?;
        Ok(Self { devices, changes })
    }
}

/// Builds a key server over `stores` that talks federation over HTTP.
pub fn build_key_server(stores: Stores, config: &DaemonConfig) -> Result<KeyServer> {
    let client = FederationClient::new(config.federation.clone())
        .context("failed to build federation client")?;
    let server = KeyServer::new(
        stores.devices,
        stores.changes,
        Arc::new(client),
        config.updater.clone(),
    )
    .context("invalid key server configuration")?;
    Ok(server)
}
