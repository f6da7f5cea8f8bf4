//! Staleness queue.
//!
//! Holds at most one task per user. A user is either queued, in flight, or
//! neither. Signals that arrive while a user is in flight are parked and
//! turned into exactly one follow-up task when the in-flight one completes,
//! so a user's resyncs never overlap and never multiply.

use crate::error::{SyncError, SyncResult};
use chrono::{DateTime, Utc};
use keyserver_types::{ServerName, UserId};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

/// Why a resync was scheduled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResyncReason {
    /// A federation notification said the list changed.
    Signal,
    /// A query found no record, or a stale one.
    QueryMiss,
    /// Startup recovery or periodic rescan of stale records.
    Periodic,
}

impl fmt::Display for ResyncReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResyncReason::Signal => "signal",
            ResyncReason::QueryMiss => "query_miss",
            ResyncReason::Periodic => "periodic",
        };
        f.write_str(s)
    }
}

/// A unit of resync work for one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResyncTask {
    /// Correlation ID for logs and reports.
    pub id: Uuid,
    pub user_id: UserId,
    pub server_name: ServerName,
    pub reason: ResyncReason,
    pub enqueued_at: DateTime<Utc>,
    /// Failed attempts so far.
    pub attempt: u32,
}

impl ResyncTask {
    /// Creates a fresh task with no failed attempts.
    pub fn new(user_id: UserId, server_name: ServerName, reason: ResyncReason) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            server_name,
            reason,
            enqueued_at: Utc::now(),
            attempt: 0,
        }
    }
}

/// What happened to an enqueued task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new task was queued.
    Queued,
    /// A task for the user was already queued; nothing added.
    Coalesced,
    /// The user is in flight; one follow-up will run after it completes.
    FollowUp,
}

struct Entry {
    task: ResyncTask,
    ready_at: Instant,
}

#[derive(Default)]
struct QueueState {
    order: VecDeque<UserId>,
    queued: HashMap<UserId, Entry>,
    in_flight: HashSet<UserId>,
    follow_ups: HashMap<UserId, ResyncTask>,
    closed: bool,
}

impl QueueState {
    fn push(&mut self, task: ResyncTask, ready_at: Instant) {
        self.order.push_back(task.user_id.clone());
        self.queued
            .insert(task.user_id.clone(), Entry { task, ready_at });
    }

    /// Takes the first ready task, or reports when the earliest one will be.
    fn take_ready(&mut self, now: Instant) -> Result<ResyncTask, Option<Instant>> {
        let mut earliest: Option<Instant> = None;
        let mut found = None;
        for (idx, user_id) in self.order.iter().enumerate() {
            let Some(entry) = self.queued.get(user_id) else {
                continue;
            };
            if entry.ready_at <= now {
                found = Some(idx);
                break;
            }
            earliest = Some(earliest.map_or(entry.ready_at, |e| e.min(entry.ready_at)));
        }

        let Some(idx) = found else {
            return Err(earliest);
        };
        let user_id = self.order.remove(idx).ok_or(earliest)?;
        let entry = self.queued.remove(&user_id).ok_or(earliest)?;
        self.in_flight.insert(user_id);
        Ok(entry.task)
    }

    fn has_ready(&self, now: Instant) -> bool {
        self.queued.values().any(|e| e.ready_at <= now)
    }
}

/// Coalescing task queue with a per-user in-flight set.
#[derive(Default)]
pub struct StalenessQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl StalenessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Adds a task, coalescing with any task already queued or in flight
    /// for the same user.
    pub fn enqueue(&self, task: ResyncTask) -> SyncResult<EnqueueOutcome> {
        let mut state = self.lock();
        if state.closed {
            return Err(SyncError::ShuttingDown);
        }
        if state.in_flight.contains(&task.user_id) {
            state.follow_ups.entry(task.user_id.clone()).or_insert(task);
            return Ok(EnqueueOutcome::FollowUp);
        }
        if state.queued.contains_key(&task.user_id) {
            return Ok(EnqueueOutcome::Coalesced);
        }
        state.push(task, Instant::now());
        drop(state);
        self.notify.notify_one();
        Ok(EnqueueOutcome::Queued)
    }

    /// Waits for the next ready task and marks its user in flight.
    ///
    /// Returns `None` once the queue is closed.
    pub async fn next(&self) -> Option<ResyncTask> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let wait_until = {
                let mut state = self.lock();
                if state.closed {
                    return None;
                }
                let now = Instant::now();
                let taken = state.take_ready(now);
                match taken {
                    Ok(task) => {
                        let more = state.has_ready(now);
                        drop(state);
                        if more {
                            self.notify.notify_one();
                        }
                        return Some(task);
                    }
                    Err(earliest) => earliest,
                }
            };

            match wait_until {
                Some(deadline) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(deadline) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Marks a user's task finished. Returns `true` if a follow-up was queued.
    pub fn complete(&self, user_id: &UserId) -> bool {
        let mut state = self.lock();
        state.in_flight.remove(user_id);
        let Some(mut follow_up) = state.follow_ups.remove(user_id) else {
            return false;
        };
        if state.closed {
            return false;
        }
        follow_up.attempt = 0;
        state.push(follow_up, Instant::now());
        drop(state);
        self.notify.notify_one();
        true
    }

    /// Puts a failed task back with one more attempt counted, ready after `delay`.
    ///
    /// A follow-up parked while the task was in flight is folded into the retry.
    pub fn retry(&self, mut task: ResyncTask, delay: Duration) {
        let mut state = self.lock();
        state.in_flight.remove(&task.user_id);
        state.follow_ups.remove(&task.user_id);
        if state.closed {
            return;
        }
        task.attempt += 1;
        state.push(task, Instant::now() + delay);
        drop(state);
        self.notify.notify_one();
    }

    /// Stops accepting work and wakes every waiting worker.
    ///
    /// Queued tasks are dropped; their users remain stale in the store.
    /// Returns the users whose parked follow-ups were dropped: the in-flight
    /// resync may clear their stale flag, so the caller must set it again.
    pub fn close(&self) -> Vec<(UserId, ServerName)> {
        let mut state = self.lock();
        state.closed = true;
        state.order.clear();
        state.queued.clear();
        let dropped = state
            .follow_ups
            .drain()
            .map(|(user_id, task)| (user_id, task.server_name))
            .collect();
        drop(state);
        self.notify.notify_waiters();
        dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Number of queued (not in-flight) tasks.
    pub fn len(&self) -> usize {
        self.lock().queued.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_in_flight(&self, user_id: &UserId) -> bool {
        self.lock().in_flight.contains(user_id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.lock().in_flight.len()
    }

    /// Whether the user has a queued task or a parked follow-up.
    pub fn is_pending(&self, user_id: &UserId) -> bool {
        let state = self.lock();
        state.queued.contains_key(user_id) || state.follow_ups.contains_key(user_id)
    }
}
