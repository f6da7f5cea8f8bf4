//! The key server facade.
//!
//! Ties the store, the engine, the worker pool and the change log together
//! behind the operations the rest of the homeserver uses.

use crate::config::UpdaterConfig;
use crate::engine::SyncEngine;
use crate::error::{SyncError, SyncResult};
use crate::publisher::{ChangePublisher, KeyChangeStream, LogPublisher};
use crate::queue::{EnqueueOutcome, ResyncReason, ResyncTask};
use crate::remote::RemoteDirectoryClient;
use crate::updater::{DeviceListUpdater, ResyncReport};
use keyserver_storage::{DeviceListStore, KeyChangeLog};
use keyserver_types::{DeviceListState, ServerName, UserId};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::time::Instant;
use tracing::{debug, info};

/// What a staleness signal led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalOutcome {
    /// A resync was queued.
    Queued,
    /// A resync for the user was already queued.
    Coalesced,
    /// The user is being resynced; one more resync runs afterwards.
    FollowUp,
    /// The stored list is already at or past the signalled stream id.
    AlreadyApplied,
}

impl From<EnqueueOutcome> for SignalOutcome {
    fn from(outcome: EnqueueOutcome) -> Self {
        match outcome {
            EnqueueOutcome::Queued => SignalOutcome::Queued,
            EnqueueOutcome::Coalesced => SignalOutcome::Coalesced,
            EnqueueOutcome::FollowUp => SignalOutcome::FollowUp,
        }
    }
}

/// Federated device list cache with an ordered key change stream.
pub struct KeyServer {
    engine: Arc<SyncEngine>,
    updater: DeviceListUpdater,
    log: Arc<LogPublisher>,
    config: UpdaterConfig,
}

impl KeyServer {
    /// Creates a key server that publishes straight to `log`.
    pub fn new(
        store: DeviceListStore,
        log: KeyChangeLog,
        client: Arc<dyn RemoteDirectoryClient>,
        config: UpdaterConfig,
    ) -> SyncResult<Self> {
        let log = Arc::new(LogPublisher::new(log)?);
        let publisher: Arc<dyn ChangePublisher> = log.clone();
        Self::with_publisher(store, log, publisher, client, config)
    }

    /// Creates a key server whose commits go through `publisher`.
    ///
    /// Subscriptions and change queries still read from `log`, so
    /// `publisher` is expected to end up appending there.
    pub fn with_publisher(
        store: DeviceListStore,
        log: Arc<LogPublisher>,
        publisher: Arc<dyn ChangePublisher>,
        client: Arc<dyn RemoteDirectoryClient>,
        config: UpdaterConfig,
    ) -> SyncResult<Self> {
        let local_server = ServerName::parse(&config.local_server)
            .map_err(|e| SyncError::Config(format!("local_server: {e}")))?;
        if config.worker_count == 0 {
            return Err(SyncError::Config("worker_count must be at least 1".to_string()));
        }

        let engine = Arc::new(SyncEngine::new(
            store,
            client,
            publisher,
            local_server,
            config.request_timeout(),
        ));
        let updater = DeviceListUpdater::new(engine.clone(), config.clone());
        Ok(Self {
            engine,
            updater,
            log,
            config,
        })
    }

    /// Our own server name.
    pub fn local_server(&self) -> &ServerName {
        self.engine.local_server()
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn updater(&self) -> &DeviceListUpdater {
        &self.updater
    }

    // ── Lifecycle ────────────────────────────────────────────────

    /// Runs startup recovery and launches the workers.
    ///
    /// Returns the number of stale users re-queued.
    pub async fn start(&self) -> SyncResult<usize> {
        let requeued = self.updater.start().await?;
        info!(local_server = %self.local_server(), requeued, "key server started");
        Ok(requeued)
    }

    /// Stops accepting signals and waits for the workers to exit.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.updater.shutdown().await
    }

    /// Resync reports as workers finish attempts.
    pub fn reports(&self) -> broadcast::Receiver<ResyncReport> {
        self.updater.reports()
    }

    // ── Signals ──────────────────────────────────────────────────

    /// Records that a remote user's device list changed.
    pub async fn mark_user_stale(
        &self,
        user_id: &UserId,
        server_name: Option<&ServerName>,
    ) -> SyncResult<SignalOutcome> {
        self.signal(user_id, server_name, None).await
    }

    /// Like [`KeyServer::mark_user_stale`], with the remote's stream id for
    /// the change. Signals already reflected locally are dropped.
    pub async fn mark_user_stale_at(
        &self,
        user_id: &UserId,
        server_name: Option<&ServerName>,
        stream_id: i64,
    ) -> SyncResult<SignalOutcome> {
        self.signal(user_id, server_name, Some(stream_id)).await
    }

    async fn signal(
        &self,
        user_id: &UserId,
        server_name: Option<&ServerName>,
        stream_id: Option<i64>,
    ) -> SyncResult<SignalOutcome> {
        let server = self.engine.validate_signal(user_id, server_name)?;
        if !self.engine.needs_resync(user_id, stream_id).await? {
            debug!(user_id = %user_id, ?stream_id, "signal already applied");
            return Ok(SignalOutcome::AlreadyApplied);
        }
        if self.updater.queue().is_closed() {
            return Err(SyncError::ShuttingDown);
        }

        self.engine.mark_stale(user_id, &server).await?;
        let task = ResyncTask::new(user_id.clone(), server, ResyncReason::Signal);
        Ok(self.updater.enqueue(task)?.into())
    }

    // ── Queries ──────────────────────────────────────────────────

    /// Returns a user's device list.
    ///
    /// Local users are answered from the store. For a remote user with no
    /// record or a stale one, a resync is triggered and awaited for up to
    /// the configured query timeout; the latest stored state is returned
    /// either way. A user never seen is returned as an empty, stale list.
    pub async fn query_device_list_state(&self, user_id: &UserId) -> SyncResult<DeviceListState> {
        let server = user_id.server_name();
        let current = self.engine.device_list_state(user_id).await?;

        if server == *self.local_server() {
            return Ok(current.unwrap_or_else(|| DeviceListState::empty(user_id.clone(), server)));
        }
        if let Some(state) = &current {
            if !state.is_stale {
                return Ok(state.clone());
            }
        }

        let mut reports = self.updater.reports();
        let requested_at = Instant::now();
        self.engine.mark_stale(user_id, &server).await?;
        let task = ResyncTask::new(user_id.clone(), server.clone(), ResyncReason::QueryMiss);
        match self.updater.enqueue(task) {
            Ok(_) => {
                let wait = self.wait_for_resync(user_id, requested_at, &mut reports);
                if tokio::time::timeout(self.config.query_timeout(), wait).await.is_err() {
                    debug!(user_id = %user_id, "query timed out waiting for resync");
                }
            }
            Err(SyncError::ShuttingDown) => {}
            Err(e) => return Err(e),
        }

        let latest = self.engine.device_list_state(user_id).await?;
        Ok(latest.unwrap_or_else(|| DeviceListState {
            is_stale: true,
            ..DeviceListState::empty(user_id.clone(), server)
        }))
    }

    /// Waits for a resync of `user_id` that started at or after
    /// `requested_at`. An attempt already in flight when the query arrived
    /// may have fetched before the change the query is after, so it does
    /// not count.
    async fn wait_for_resync(
        &self,
        user_id: &UserId,
        requested_at: Instant,
        reports: &mut broadcast::Receiver<ResyncReport>,
    ) {
        loop {
            match reports.recv().await {
                Ok(report)
                    if report.user_id == *user_id
                        && report.started_at >= requested_at
                        && report.outcome.is_terminal() =>
                {
                    return;
                }
                Ok(_) => {}
                Err(RecvError::Lagged(_)) => {
                    // Missed reports; fall back to the store.
                    if let Ok(Some(state)) = self.engine.device_list_state(user_id).await {
                        if !state.is_stale {
                            return;
                        }
                    }
                }
                Err(RecvError::Closed) => return,
            }
        }
    }

    // ── Change stream ────────────────────────────────────────────

    /// Streams key change records after position `from`, then live ones.
    pub fn subscribe_key_changes(&self, from: i64) -> KeyChangeStream {
        self.log.subscribe(from)
    }

    /// Distinct users with key changes in `(from, to]`, and the position the
    /// answer is valid up to.
    pub async fn query_key_changes(&self, from: i64, to: Option<i64>) -> SyncResult<(Vec<UserId>, i64)> {
        self.log.changed_users(from, to).await
    }

    /// Highest published change position.
    pub fn latest_position(&self) -> i64 {
        self.log.latest_position()
    }
}
