//! Device list updater.
//!
//! A fixed pool of workers pulls tasks from the [`StalenessQueue`] and runs
//! them through the [`SyncEngine`]. Each finished attempt is classified into
//! a [`ResyncOutcome`] and broadcast as a [`ResyncReport`].

use crate::config::UpdaterConfig;
use crate::engine::{wait_for_shutdown, SyncEngine};
use crate::error::{SyncError, SyncResult};
use crate::queue::{EnqueueOutcome, ResyncReason, ResyncTask, StalenessQueue};
use crate::retry::{FailureClass, RetryPolicy};
use keyserver_types::UserId;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// How one resync attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResyncOutcome {
    /// Changes were committed.
    Synced {
        stream_id: i64,
        changes: usize,
        /// `false` if the changes are still waiting in the outbox.
        published: bool,
    },
    /// Remote matched local state; staleness cleared.
    Unchanged { stream_id: i64 },
    /// Transient failure; the task was re-queued.
    Retrying { attempt: u32, delay: Duration },
    /// Transient failures used up the attempt budget. The record stays stale.
    GaveUp { attempts: u32, error: String },
    /// Permanent failure; the list was resolved as empty.
    Resolved { stream_id: i64, removed: usize, error: String },
    /// A store invariant was violated. The record stays stale.
    Failed { error: String },
    /// Abandoned at a shutdown checkpoint. The record stays stale.
    Cancelled,
}

impl ResyncOutcome {
    /// Whether no further attempt is scheduled for this task.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ResyncOutcome::Retrying { .. })
    }

    /// Whether the stored list is current after this outcome.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self,
            ResyncOutcome::Synced { .. }
                | ResyncOutcome::Unchanged { .. }
                | ResyncOutcome::Resolved { .. }
        )
    }
}

/// Broadcast after every resync attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncReport {
    pub task_id: Uuid,
    pub user_id: UserId,
    pub reason: ResyncReason,
    /// When the worker picked the attempt up. An attempt only reflects
    /// signals that arrived before this instant.
    pub started_at: Instant,
    pub outcome: ResyncOutcome,
}

/// State shared by every worker.
#[derive(Clone)]
struct WorkerContext {
    engine: Arc<SyncEngine>,
    queue: Arc<StalenessQueue>,
    policy: RetryPolicy,
    reports: broadcast::Sender<ResyncReport>,
    shutdown: watch::Receiver<bool>,
}

/// The resync worker pool.
pub struct DeviceListUpdater {
    engine: Arc<SyncEngine>,
    queue: Arc<StalenessQueue>,
    config: UpdaterConfig,
    reports: broadcast::Sender<ResyncReport>,
    shutdown: watch::Sender<bool>,
    handles: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl DeviceListUpdater {
    pub fn new(engine: Arc<SyncEngine>, config: UpdaterConfig) -> Self {
        let (reports, _) = broadcast::channel(config.report_capacity.max(1));
        let (shutdown, _) = watch::channel(false);
        Self {
            engine,
            queue: Arc::new(StalenessQueue::new()),
            config,
            reports,
            shutdown,
            handles: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub fn queue(&self) -> &Arc<StalenessQueue> {
        &self.queue
    }

    /// Subscribes to resync reports. Only reports sent after this call are seen.
    pub fn reports(&self) -> broadcast::Receiver<ResyncReport> {
        self.reports.subscribe()
    }

    /// Queues a resync. The user must already be validated.
    pub fn enqueue(&self, task: ResyncTask) -> SyncResult<EnqueueOutcome> {
        let user_id = task.user_id.clone();
        let reason = task.reason;
        let outcome = self.queue.enqueue(task)?;
        debug!(user_id = %user_id, %reason, ?outcome, "resync enqueued");
        Ok(outcome)
    }

    /// Recovers from the previous run and launches the workers.
    ///
    /// Publishes anything left in the outbox, re-queues every user still
    /// flagged stale, then spawns `worker_count` workers. A store that cannot
    /// be read fails startup. Returns the number of users re-queued.
    pub async fn start(&self) -> SyncResult<usize> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(SyncError::Config("updater already started".to_string()));
        }

        match self.engine.flush_outbox().await {
            Ok(0) => {}
            Ok(n) => info!(records = n, "published changes left from previous run"),
            Err(e @ SyncError::Storage(_)) => return Err(e),
            Err(e) => warn!(error = %e, "outbox flush failed at startup"),
        }

        let stale = self.engine.stale_users().await?;
        let mut requeued = 0;
        for (user_id, server_name) in stale {
            let task = ResyncTask::new(user_id, server_name, ResyncReason::Periodic);
            if self.queue.enqueue(task)? == EnqueueOutcome::Queued {
                requeued += 1;
            }
        }

        let ctx = WorkerContext {
            engine: self.engine.clone(),
            queue: self.queue.clone(),
            policy: self.config.retry_policy(),
            reports: self.reports.clone(),
            shutdown: self.shutdown.subscribe(),
        };

        let worker_count = self.config.worker_count.max(1);
        let mut handles = self.handles.lock().unwrap_or_else(|e| e.into_inner());
        for worker in 0..worker_count {
            handles.push(tokio::spawn(run_worker(worker, ctx.clone())));
        }
        if let Some(interval) = self.config.rescan_interval() {
            handles.push(tokio::spawn(run_maintenance(
                self.engine.clone(),
                self.queue.clone(),
                interval,
                self.shutdown.subscribe(),
            )));
        }

        info!(workers = worker_count, requeued, "device list updater started");
        Ok(requeued)
    }

    /// Stops the pool.
    ///
    /// The queue stops accepting work and in-flight resyncs stop at their
    /// next checkpoint before commit. Users with a dropped follow-up are
    /// flagged stale again, and committed changes still in the outbox get a
    /// last publish attempt.
    pub async fn shutdown(&self) -> SyncResult<()> {
        self.shutdown.send_replace(true);
        let dropped = self.queue.close();

        let handles: Vec<_> = self
            .handles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain(..)
            .collect();
        for handle in handles {
            if let Err(e) = handle.await {
                warn!(error = %e, "worker did not exit cleanly");
            }
        }

        for (user_id, server_name) in &dropped {
            self.engine.mark_stale(user_id, server_name).await?;
        }

        match self.engine.flush_outbox().await {
            Ok(_) => {}
            Err(e @ SyncError::Storage(_)) => return Err(e),
            Err(e) => warn!(error = %e, "outbox flush failed at shutdown, left for next start"),
        }
        info!(dropped_follow_ups = dropped.len(), "device list updater stopped");
        Ok(())
    }
}

// ── Workers ──────────────────────────────────────────────────

async fn run_worker(worker: usize, ctx: WorkerContext) {
    debug!(worker, "resync worker started");
    while let Some(task) = ctx.queue.next().await {
        let started_at = Instant::now();
        let outcome = process_task(&ctx, &task).await;

        match &outcome {
            ResyncOutcome::Retrying { delay, .. } => ctx.queue.retry(task.clone(), *delay),
            _ => {
                if ctx.queue.complete(&task.user_id) {
                    debug!(user_id = %task.user_id, "follow-up resync queued");
                }
            }
        }

        // No subscribers is fine.
        let _ = ctx.reports.send(ResyncReport {
            task_id: task.id,
            user_id: task.user_id,
            reason: task.reason,
            started_at,
            outcome,
        });
    }
    debug!(worker, "resync worker stopped");
}

async fn process_task(ctx: &WorkerContext, task: &ResyncTask) -> ResyncOutcome {
    let result = ctx
        .engine
        .resync_user(&task.user_id, &task.server_name, &ctx.shutdown)
        .await;

    let err = match result {
        Ok(summary) if summary.changes.is_empty() => {
            return ResyncOutcome::Unchanged {
                stream_id: summary.stream_id,
            };
        }
        Ok(summary) => {
            return ResyncOutcome::Synced {
                stream_id: summary.stream_id,
                changes: summary.changes.len(),
                published: summary.published,
            };
        }
        Err(e) => e,
    };

    match err.class() {
        FailureClass::Transient => {
            let failures = task.attempt + 1;
            if ctx.policy.exhausted(failures) {
                warn!(
                    task_id = %task.id,
                    user_id = %task.user_id,
                    server = %task.server_name,
                    attempt = failures,
                    error = %err,
                    "giving up on device list resync"
                );
                return ResyncOutcome::GaveUp {
                    attempts: failures,
                    error: err.to_string(),
                };
            }
            let delay = ctx.policy.delay_for(failures);
            debug!(
                task_id = %task.id,
                user_id = %task.user_id,
                attempt = failures,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "resync failed, retrying"
            );
            ResyncOutcome::Retrying {
                attempt: failures,
                delay,
            }
        }
        FailureClass::Permanent => {
            info!(
                task_id = %task.id,
                user_id = %task.user_id,
                server = %task.server_name,
                error = %err,
                "remote refused device list, resolving as empty"
            );
            match ctx.engine.resolve_as_empty(&task.user_id, &task.server_name).await {
                Ok(summary) => ResyncOutcome::Resolved {
                    stream_id: summary.stream_id,
                    removed: summary.changes.len(),
                    error: err.to_string(),
                },
                Err(e) => {
                    error!(task_id = %task.id, user_id = %task.user_id, error = %e, "failed to resolve device list");
                    ResyncOutcome::Failed {
                        error: e.to_string(),
                    }
                }
            }
        }
        FailureClass::Invariant => {
            error!(
                task_id = %task.id,
                user_id = %task.user_id,
                server = %task.server_name,
                attempt = task.attempt,
                error = %err,
                "device list invariant violated"
            );
            ResyncOutcome::Failed {
                error: err.to_string(),
            }
        }
        FailureClass::Cancelled => {
            debug!(task_id = %task.id, user_id = %task.user_id, "resync cancelled");
            ResyncOutcome::Cancelled
        }
    }
}

/// Periodically publishes stranded outbox rows and re-queues stale users.
async fn run_maintenance(
    engine: Arc<SyncEngine>,
    queue: Arc<StalenessQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick completes immediately; startup already did this work.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = wait_for_shutdown(&mut shutdown) => break,
        }

        if let Err(e) = engine.flush_outbox().await {
            warn!(error = %e, "periodic outbox flush failed");
        }

        let stale = match engine.stale_users().await {
            Ok(stale) => stale,
            Err(e) => {
                warn!(error = %e, "periodic stale scan failed");
                continue;
            }
        };
        let mut queued = 0;
        for (user_id, server_name) in stale {
            if queue.is_in_flight(&user_id) || queue.is_pending(&user_id) {
                continue;
            }
            let task = ResyncTask::new(user_id, server_name, ResyncReason::Periodic);
            match queue.enqueue(task) {
                Ok(EnqueueOutcome::Queued) => queued += 1,
                Ok(_) => {}
                Err(_) => return,
            }
        }
        if queued > 0 {
            debug!(queued, "periodic rescan queued stale users");
        }
    }
}
