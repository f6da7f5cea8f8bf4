//! Sync engine: resync of a single remote user.
//!
//! The engine owns no scheduling. It validates signals, fetches one user's
//! list, diffs it against the store, commits and publishes. The updater
//! decides when to call it and what to do with its errors.

use crate::diff::diff_device_lists;
use crate::error::{SyncError, SyncResult};
use crate::publisher::{coalesce_pending, ChangePublisher};
use crate::remote::{RemoteDeviceList, RemoteDirectoryClient};
use keyserver_storage::{DeviceListStore, StorageResult};
use keyserver_types::{DeviceChange, DeviceListState, ServerName, UserId};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Result of one successful resync.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncSummary {
    pub user_id: UserId,
    /// Stream id stored after the resync.
    pub stream_id: i64,
    /// Changes committed, in emission order. Empty when nothing changed.
    pub changes: Vec<DeviceChange>,
    /// Whether the changes reached the change log during this resync.
    /// When `false` they wait in the outbox for the next flush.
    pub published: bool,
}

/// The sync engine.
pub struct SyncEngine {
    store: DeviceListStore,
    client: Arc<dyn RemoteDirectoryClient>,
    publisher: Arc<dyn ChangePublisher>,
    local_server: ServerName,
    request_timeout: Duration,
    /// Serializes outbox flushes so the log follows commit order.
    publish_lock: Mutex<()>,
}

impl SyncEngine {
    pub fn new(
        store: DeviceListStore,
        client: Arc<dyn RemoteDirectoryClient>,
        publisher: Arc<dyn ChangePublisher>,
        local_server: ServerName,
        request_timeout: Duration,
    ) -> Self {
        Self {
            store,
            client,
            publisher,
            local_server,
            request_timeout,
            publish_lock: Mutex::new(()),
        }
    }

    /// Returns our own server name.
    pub fn local_server(&self) -> &ServerName {
        &self.local_server
    }

    /// Returns the store.
    pub fn store(&self) -> &DeviceListStore {
        &self.store
    }

    async fn with_store<T, F>(&self, f: F) -> SyncResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceListStore) -> StorageResult<T> + Send + 'static,
    {
        let store = self.store.clone();
        Ok(tokio::task::spawn_blocking(move || f(&store)).await??)
    }

    // ── Signals ──────────────────────────────────────────────────

    /// Checks that a staleness signal names a resolvable remote user.
    ///
    /// Returns the server to resync from.
    pub fn validate_signal(
        &self,
        user_id: &UserId,
        server_name: Option<&ServerName>,
    ) -> SyncResult<ServerName> {
        let server = server_name.ok_or_else(|| {
            SyncError::InvalidSignal(format!("no known server for {user_id}"))
        })?;
        if *server == self.local_server {
            return Err(SyncError::InvalidSignal(format!(
                "{user_id} is a local user"
            )));
        }
        if user_id.server_name() != *server {
            return Err(SyncError::InvalidSignal(format!(
                "{user_id} does not belong to {server}"
            )));
        }
        Ok(server.clone())
    }

    /// Whether a signal carrying the remote's stream id needs a resync.
    ///
    /// A current record whose last reported remote stream id is already at
    /// or past `remote_stream_id` does not. The local stream id is not
    /// consulted: local commits advance it independently of the remote.
    pub async fn needs_resync(&self, user_id: &UserId, remote_stream_id: Option<i64>) -> SyncResult<bool> {
        let Some(remote_stream_id) = remote_stream_id else {
            return Ok(true);
        };
        let state = self.device_list_state(user_id).await?;
        Ok(match state {
            Some(state) => state.is_stale || state.remote_stream_id < remote_stream_id,
            None => true,
        })
    }

    /// Users whose device list is flagged stale in the store.
    pub async fn stale_users(&self) -> SyncResult<Vec<(UserId, ServerName)>> {
        self.with_store(|s| s.list_stale_users()).await
    }

    /// Loads a user's stored device list.
    pub async fn device_list_state(&self, user_id: &UserId) -> SyncResult<Option<DeviceListState>> {
        let uid = user_id.clone();
        self.with_store(move |s| s.get_device_list_state(&uid)).await
    }

    /// Durably flags a user stale so a restart picks the resync back up.
    pub async fn mark_stale(&self, user_id: &UserId, server_name: &ServerName) -> SyncResult<bool> {
        let (uid, server) = (user_id.clone(), server_name.clone());
        self.with_store(move |s| s.mark_stale(&uid, &server)).await
    }

    // ── Resync ───────────────────────────────────────────────────

    /// Fetches, diffs, commits and publishes one user's device list.
    ///
    /// `shutdown` is checked while fetching and again before the commit; once
    /// the commit starts the resync runs to completion.
    pub async fn resync_user(
        &self,
        user_id: &UserId,
        server_name: &ServerName,
        shutdown: &watch::Receiver<bool>,
    ) -> SyncResult<ResyncSummary> {
        let current = self.load_state(user_id, server_name).await?;

        let mut shutdown = shutdown.clone();
        if *shutdown.borrow_and_update() {
            return Err(SyncError::Cancelled);
        }
        let fetch = tokio::time::timeout(
            self.request_timeout,
            self.client.fetch_device_list(server_name, user_id),
        );
        let remote = tokio::select! {
            result = fetch => result.map_err(|_| SyncError::Timeout)??,
            _ = wait_for_shutdown(&mut shutdown) => return Err(SyncError::Cancelled),
        };

        if *shutdown.borrow() {
            return Err(SyncError::Cancelled);
        }
        self.apply_remote(current, remote).await
    }

    /// Records a permanent remote failure as an empty, non-stale list.
    ///
    /// Devices previously known for the user are published as removed.
    pub async fn resolve_as_empty(
        &self,
        user_id: &UserId,
        server_name: &ServerName,
    ) -> SyncResult<ResyncSummary> {
        let current = self.load_state(user_id, server_name).await?;
        self.apply_remote(current, RemoteDeviceList::default()).await
    }

    async fn load_state(&self, user_id: &UserId, server_name: &ServerName) -> SyncResult<DeviceListState> {
        let state = self.device_list_state(user_id).await?;
        Ok(state.unwrap_or_else(|| DeviceListState::empty(user_id.clone(), server_name.clone())))
    }

    async fn apply_remote(
        &self,
        current: DeviceListState,
        remote: RemoteDeviceList,
    ) -> SyncResult<ResyncSummary> {
        let remote_stream_id = remote.stream_id;
        let remote_devices = remote.into_device_map()?;
        let changes = diff_device_lists(&current.devices, &remote_devices)?;
        let user_id = current.user_id.clone();

        if changes.is_empty() {
            let (uid, server) = (user_id.clone(), current.server_name.clone());
            self.with_store(move |s| s.resolve_unchanged(&uid, &server, remote_stream_id))
                .await?;
            debug!(user_id = %user_id, "device list unchanged");
            return Ok(ResyncSummary {
                user_id,
                stream_id: current.stream_id.max(remote_stream_id),
                changes,
                published: true,
            });
        }

        let expected = current.stream_id;
        let new_state = DeviceListState {
            stream_id: (expected + 1).max(remote_stream_id),
            remote_stream_id: current.remote_stream_id.max(remote_stream_id),
            is_stale: false,
            devices: remote_devices,
            updated_at: Some(chrono::Utc::now()),
            ..current
        };
        let stream_id = new_state.stream_id;
        let committed = changes.clone();
        self.with_store(move |s| s.commit_device_list_update(expected, &new_state, &committed))
            .await?;

        info!(
            user_id = %user_id,
            stream_id,
            changes = changes.len(),
            "device list updated"
        );

        // The commit is durable; a failed flush leaves rows in the outbox.
        let published = match self.flush_outbox().await {
            Ok(_) => true,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "publish failed, changes left in outbox");
                false
            }
        };

        Ok(ResyncSummary {
            user_id,
            stream_id,
            changes,
            published,
        })
    }

    // ── Publication ──────────────────────────────────────────────

    /// Publishes everything in the outbox, in commit order.
    ///
    /// Returns the number of records appended. Safe to call at any time;
    /// rows published but not yet acknowledged are published again.
    pub async fn flush_outbox(&self) -> SyncResult<usize> {
        let _guard = self.publish_lock.lock().await;

        let pending = self.with_store(|s| s.pending_changes()).await?;
        let Some(max_seq) = pending.last().map(|c| c.seq) else {
            return Ok(0);
        };
        let batch = coalesce_pending(pending);
        let records = self.publisher.publish(&batch).await?;
        self.with_store(move |s| s.ack_changes(max_seq)).await?;
        Ok(records.len())
    }
}

/// Resolves once `rx` carries `true`.
pub(crate) async fn wait_for_shutdown(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone: nobody can request shutdown any more.
            std::future::pending::<()>().await;
        }
    }
}
