//! Change publication.
//!
//! The store's outbox is the source of truth; publishing appends outbox rows
//! to the durable [`KeyChangeLog`] and then the engine acknowledges them. A
//! crash between the two replays the rows on the next flush, which is why
//! delivery is at-least-once.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use keyserver_storage::KeyChangeLog;
use keyserver_types::{DeviceId, KeyChangeRecord, PendingChange, UserId};
use std::collections::{HashMap, VecDeque};
use tokio::sync::watch;
use tracing::debug;

/// Records read from the log per page while streaming.
const PAGE_SIZE: usize = 256;

/// Appends committed changes to the key change stream.
#[async_trait]
pub trait ChangePublisher: Send + Sync {
    /// Publishes a batch atomically, in order. Returns the positioned records.
    async fn publish(&self, batch: &[PendingChange]) -> SyncResult<Vec<KeyChangeRecord>>;
}

/// Collapses a drained outbox so each (user, device) appears once.
///
/// The surviving entry is the latest change for that device and keeps that
/// change's place in commit order.
pub fn coalesce_pending(pending: Vec<PendingChange>) -> Vec<PendingChange> {
    let mut latest: HashMap<(UserId, DeviceId), i64> = HashMap::with_capacity(pending.len());
    for change in &pending {
        latest.insert((change.user_id.clone(), change.device_id.clone()), change.seq);
    }
    let mut result: Vec<PendingChange> = pending
        .into_iter()
        .filter(|c| latest.get(&(c.user_id.clone(), c.device_id.clone())) == Some(&c.seq))
        .collect();
    result.sort_by_key(|c| c.seq);
    result
}

/// [`ChangePublisher`] backed by a [`KeyChangeLog`], with live notification
/// for subscribers.
pub struct LogPublisher {
    log: KeyChangeLog,
    latest: watch::Sender<i64>,
}

impl LogPublisher {
    /// Wraps a log, seeding the notification channel with its latest position.
    pub fn new(log: KeyChangeLog) -> SyncResult<Self> {
        let latest = log.latest_position()?;
        let (tx, _rx) = watch::channel(latest);
        Ok(Self { log, latest: tx })
    }

    /// The underlying log.
    pub fn log(&self) -> &KeyChangeLog {
        &self.log
    }

    /// Highest published position.
    pub fn latest_position(&self) -> i64 {
        *self.latest.borrow()
    }

    /// Distinct users with changes in `(from, to]`, plus the latest position.
    pub async fn changed_users(&self, from: i64, to: Option<i64>) -> SyncResult<(Vec<UserId>, i64)> {
        let log = self.log.clone();
        let users = tokio::task::spawn_blocking(move || log.changed_users(from, to)).await??;
        let latest = to.unwrap_or_else(|| self.latest_position());
        Ok((users, latest))
    }

    /// Streams every record after `from`, then waits for new ones.
    ///
    /// The stream ends if the publisher is dropped or a read fails (the
    /// error is yielded first). Resuming from the last seen position never
    /// skips records.
    pub fn subscribe(&self, from: i64) -> KeyChangeStream {
        let state = SubscriptionState {
            log: self.log.clone(),
            rx: self.latest.subscribe(),
            cursor: from,
            buffer: VecDeque::new(),
            failed: false,
        };
        stream::unfold(state, |mut state| async move {
            if state.failed {
                return None;
            }
            loop {
                if let Some(record) = state.buffer.pop_front() {
                    state.cursor = record.position;
                    return Some((Ok(record), state));
                }

                // Mark the current value seen before reading so a publish
                // landing after the read still wakes us.
                state.rx.borrow_and_update();
                let log = state.log.clone();
                let cursor = state.cursor;
                let page = tokio::task::spawn_blocking(move || log.read_after(cursor, PAGE_SIZE))
                    .await
                    .map_err(SyncError::from)
                    .and_then(|r| r.map_err(SyncError::from));

                match page {
                    Ok(records) if !records.is_empty() => state.buffer.extend(records),
                    Ok(_) => {
                        if state.rx.changed().await.is_err() {
                            return None;
                        }
                    }
                    Err(e) => {
                        state.failed = true;
                        return Some((Err(e), state));
                    }
                }
            }
        })
        .boxed()
    }
}

/// Lazy, ordered, restartable stream of key change records.
pub type KeyChangeStream = BoxStream<'static, SyncResult<KeyChangeRecord>>;

struct SubscriptionState {
    log: KeyChangeLog,
    rx: watch::Receiver<i64>,
    cursor: i64,
    buffer: VecDeque<KeyChangeRecord>,
    failed: bool,
}

#[async_trait]
impl ChangePublisher for LogPublisher {
    async fn publish(&self, batch: &[PendingChange]) -> SyncResult<Vec<KeyChangeRecord>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }
        let log = self.log.clone();
        let owned = batch.to_vec();
        let records = tokio::task::spawn_blocking(move || log.append(&owned)).await??;
        if let Some(last) = records.last() {
            self.latest.send_replace(last.position);
        }
        debug!(count = records.len(), "published key changes");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keyserver_types::ChangeType;

    fn pending(seq: i64, user: &str, device: &str, change_type: ChangeType) -> PendingChange {
        PendingChange {
            seq,
            user_id: UserId::parse(user).unwrap(),
            device_id: DeviceId::new(device).unwrap(),
            change_type,
            stream_id: seq,
        }
    }

    #[test]
    fn coalesce_keeps_latest_per_device() {
        let drained = vec![
            pending(1, "@a:x.org", "D1", ChangeType::Added),
            pending(2, "@a:x.org", "D2", ChangeType::Added),
            pending(3, "@b:x.org", "D1", ChangeType::Added),
            pending(4, "@a:x.org", "D1", ChangeType::Removed),
        ];
        let kept = coalesce_pending(drained);
        let seqs: Vec<i64> = kept.iter().map(|c| c.seq).collect();
        assert_eq!(seqs, vec![2, 3, 4]);
        assert_eq!(kept[2].change_type, ChangeType::Removed);
    }

    #[test]
    fn coalesce_passes_through_distinct_devices() {
        let drained = vec![
            pending(5, "@a:x.org", "D1", ChangeType::Removed),
            pending(6, "@a:x.org", "D2", ChangeType::Updated),
            pending(7, "@a:x.org", "D3", ChangeType::Added),
        ];
        assert_eq!(coalesce_pending(drained.clone()), drained);
    }

    #[tokio::test]
    async fn publish_notifies_latest_position() {
        let publisher = LogPublisher::new(KeyChangeLog::open_in_memory().unwrap()).unwrap();
        assert_eq!(publisher.latest_position(), 0);

        let records = publisher
            .publish(&[pending(1, "@a:x.org", "D1", ChangeType::Added)])
            .await
            .unwrap();
        assert_eq!(publisher.latest_position(), records[0].position);
    }
}
