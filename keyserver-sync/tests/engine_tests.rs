//! Tests for the sync engine: resync, diff ordering, stream ids and outbox.

use async_trait::async_trait;
use keyserver_storage::{DeviceListStore, KeyChangeLog};
use keyserver_sync::remote::mock::{MockDirectory, MockFailure};
use keyserver_sync::{
    ChangePublisher, LogPublisher, SyncEngine, SyncError, SyncResult,
};
use keyserver_types::{
    ChangeType, DeviceId, DeviceKeys, KeyChangeRecord, PendingChange, ServerName, UserId,
};
use pretty_assertions::assert_eq;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

fn user(s: &str) -> UserId {
    UserId::parse(s).unwrap()
}

fn server(s: &str) -> ServerName {
    ServerName::parse(s).unwrap()
}

fn device(id: &str, key: &str) -> DeviceKeys {
    DeviceKeys::new(DeviceId::new(id).unwrap())
        .with_algorithm("m.olm.v1.curve25519-aes-sha2")
        .with_key(format!("curve25519:{id}"), key)
}

fn no_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}

fn changes(records: &[KeyChangeRecord]) -> Vec<(String, ChangeType)> {
    records
        .iter()
        .map(|r| (r.device_id.to_string(), r.change_type))
        .collect()
}

/// Publisher that fails a configured number of times before delegating.
struct FlakyPublisher {
    inner: Arc<LogPublisher>,
    failures_left: AtomicUsize,
}

#[async_trait]
impl ChangePublisher for FlakyPublisher {
    async fn publish(&self, batch: &[PendingChange]) -> SyncResult<Vec<KeyChangeRecord>> {
        if self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(SyncError::Publish("log unavailable".to_string()));
        }
        self.inner.publish(batch).await
    }
}

struct Harness {
    engine: SyncEngine,
    directory: MockDirectory,
    log: Arc<LogPublisher>,
    store: DeviceListStore,
}

impl Harness {
    fn new() -> Self {
        Self::with_publish_failures(0)
    }

    fn with_publish_failures(failures: usize) -> Self {
        let store = DeviceListStore::open_in_memory().unwrap();
        let log = Arc::new(LogPublisher::new(KeyChangeLog::open_in_memory().unwrap()).unwrap());
        let publisher: Arc<dyn ChangePublisher> = if failures == 0 {
            log.clone()
        } else {
            Arc::new(FlakyPublisher {
                inner: log.clone(),
                failures_left: AtomicUsize::new(failures),
            })
        };
        let directory = MockDirectory::new();
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(directory.clone()),
            publisher,
            server("local.org"),
            Duration::from_millis(200),
        );
        Self {
            engine,
            directory,
            log,
            store,
        }
    }

    fn records(&self) -> Vec<KeyChangeRecord> {
        self.log.log().read_after(0, 1000).unwrap()
    }
}

// ── Resync ───────────────────────────────────────────────────────

#[tokio::test]
async fn first_resync_adds_every_device() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory
        .set_devices(&alice, 3, vec![device("B", "b1"), device("A", "a1")]);

    let summary = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    assert_eq!(summary.stream_id, 3);
    assert!(summary.published);
    assert_eq!(
        changes(&h.records()),
        vec![("A".to_string(), ChangeType::Added), ("B".to_string(), ChangeType::Added)]
    );

    let state = h.store.get_device_list_state(&alice).unwrap().unwrap();
    assert!(!state.is_stale);
    assert_eq!(state.stream_id, 3);
    assert_eq!(state.device_count(), 2);
}

#[tokio::test]
async fn repeat_resync_is_idempotent() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory.set_devices(&alice, 2, vec![device("A", "a1")]);

    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();
    let before = h.store.get_device_list_state(&alice).unwrap().unwrap();

    let again = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    assert!(again.changes.is_empty());
    assert_eq!(h.records().len(), 1);
    let after = h.store.get_device_list_state(&alice).unwrap().unwrap();
    assert_eq!(after.stream_id, before.stream_id);
    assert_eq!(after.devices, before.devices);
}

#[tokio::test]
async fn rotated_key_is_one_update() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory.set_devices(&alice, 1, vec![device("A", "old")]);
    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    h.directory.set_devices(&alice, 2, vec![device("A", "new")]);
    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    let records = h.records();
    assert_eq!(changes(&records[1..]), vec![("A".to_string(), ChangeType::Updated)]);
}

#[tokio::test]
async fn mixed_diff_publishes_removals_updates_additions() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory
        .set_devices(&alice, 1, vec![device("B", "b1"), device("C", "c1")]);
    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    h.directory
        .set_devices(&alice, 2, vec![device("A", "a1"), device("B", "b2")]);
    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    let records = h.records();
    assert_eq!(
        changes(&records[2..]),
        vec![
            ("C".to_string(), ChangeType::Removed),
            ("B".to_string(), ChangeType::Updated),
            ("A".to_string(), ChangeType::Added),
        ]
    );
    for pair in records.windows(2) {
        assert!(pair[0].position < pair[1].position);
    }
}

// ── Stream ids ───────────────────────────────────────────────────

#[tokio::test]
async fn stream_id_advances_without_remote_position() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");

    h.directory.set_devices(&alice, 0, vec![device("A", "a1")]);
    let first = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();
    assert_eq!(first.stream_id, 1);

    h.directory
        .set_devices(&alice, 0, vec![device("A", "a1"), device("B", "b1")]);
    let second = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();
    assert_eq!(second.stream_id, 2);
}

#[tokio::test]
async fn lower_remote_stream_id_never_lowers_local() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory.set_devices(&alice, 5, vec![device("A", "a1")]);
    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    // Unchanged list at an older position.
    h.directory.set_devices(&alice, 2, vec![device("A", "a1")]);
    let unchanged = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();
    assert_eq!(unchanged.stream_id, 5);

    // Changed list at an older position.
    h.directory
        .set_devices(&alice, 2, vec![device("A", "a1"), device("B", "b1")]);
    let changed = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();
    assert_eq!(changed.stream_id, 6);
    assert_eq!(
        h.store.get_device_list_state(&alice).unwrap().unwrap().stream_id,
        6
    );
}

#[tokio::test]
async fn unchanged_resync_raises_stream_id_to_remote() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory.set_devices(&alice, 3, vec![device("A", "a1")]);
    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    h.directory.set_devices(&alice, 9, vec![device("A", "a1")]);
    let summary = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();
    assert!(summary.changes.is_empty());
    assert_eq!(summary.stream_id, 9);
    assert_eq!(h.records().len(), 1);
}

// ── Failures ─────────────────────────────────────────────────────

#[tokio::test]
async fn remote_failure_leaves_store_untouched() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory.set_devices(&alice, 1, vec![device("A", "a1")]);
    h.directory.fail_next(&alice, &[MockFailure::Unavailable]);

    let err = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap_err();

    assert!(err.is_transient());
    assert!(h.store.get_device_list_state(&alice).unwrap().is_none());
    assert!(h.records().is_empty());
}

#[tokio::test]
async fn duplicate_device_ids_are_malformed() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory
        .set_devices(&alice, 1, vec![device("A", "a1"), device("A", "a2")]);

    let err = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Malformed(_)));
}

#[tokio::test(start_paused = true)]
async fn slow_remote_times_out() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory.set_devices(&alice, 1, vec![device("A", "a1")]);
    h.directory.set_delay(Duration::from_secs(30));

    let err = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap_err();
    assert!(matches!(err, SyncError::Timeout));
}

#[tokio::test]
async fn resolve_as_empty_publishes_removals() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory
        .set_devices(&alice, 1, vec![device("A", "a1"), device("B", "b1")]);
    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();
    h.store.mark_stale(&alice, &server("remote.org")).unwrap();

    let summary = h
        .engine
        .resolve_as_empty(&alice, &server("remote.org"))
        .await
        .unwrap();

    assert_eq!(summary.changes.len(), 2);
    let state = h.store.get_device_list_state(&alice).unwrap().unwrap();
    assert!(!state.is_stale);
    assert!(state.devices.is_empty());
    assert_eq!(
        changes(&h.records()[2..]),
        vec![("A".to_string(), ChangeType::Removed), ("B".to_string(), ChangeType::Removed)]
    );
}

#[tokio::test]
async fn resolve_unknown_user_as_empty_creates_fresh_record() {
    let h = Harness::new();
    let ghost = user("@ghost:remote.org");
    h.store.mark_stale(&ghost, &server("remote.org")).unwrap();

    let summary = h
        .engine
        .resolve_as_empty(&ghost, &server("remote.org"))
        .await
        .unwrap();

    assert!(summary.changes.is_empty());
    let state = h.store.get_device_list_state(&ghost).unwrap().unwrap();
    assert!(!state.is_stale);
    assert!(h.records().is_empty());
}

// ── Shutdown checkpoints ─────────────────────────────────────────

#[tokio::test]
async fn shutdown_during_fetch_cancels_before_commit() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory.set_devices(&alice, 1, vec![device("A", "a1")]);
    h.directory.hold();

    let (tx, rx) = watch::channel(false);
    let remote = server("remote.org");
    let resync = h.engine.resync_user(&alice, &remote, &rx);
    let stop = async {
        while h.directory.fetch_count(&alice) == 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send_replace(true);
    };
    let (result, ()) = tokio::join!(resync, stop);

    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert!(h.store.get_device_list_state(&alice).unwrap().is_none());
    assert!(h.records().is_empty());
}

#[tokio::test]
async fn shutdown_before_start_does_not_fetch() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory.set_devices(&alice, 1, vec![device("A", "a1")]);
    let (tx, rx) = watch::channel(false);
    tx.send_replace(true);

    let result = h.engine.resync_user(&alice, &server("remote.org"), &rx).await;
    assert!(matches!(result, Err(SyncError::Cancelled)));
    assert_eq!(h.directory.fetch_count(&alice), 0);
}

// ── Outbox ───────────────────────────────────────────────────────

#[tokio::test]
async fn failed_publish_is_recovered_by_flush() {
    let h = Harness::with_publish_failures(1);
    let alice = user("@alice:remote.org");
    h.directory
        .set_devices(&alice, 1, vec![device("A", "a1"), device("B", "b1")]);

    let summary = h
        .engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    // Committed, but not yet on the log.
    assert!(!summary.published);
    assert!(h.records().is_empty());
    assert_eq!(h.store.pending_changes().unwrap().len(), 2);
    assert_eq!(
        h.store.get_device_list_state(&alice).unwrap().unwrap().device_count(),
        2
    );

    assert_eq!(h.engine.flush_outbox().await.unwrap(), 2);
    assert_eq!(
        changes(&h.records()),
        vec![("A".to_string(), ChangeType::Added), ("B".to_string(), ChangeType::Added)]
    );
    assert!(h.store.pending_changes().unwrap().is_empty());
}

#[tokio::test]
async fn stranded_changes_publish_in_commit_order() {
    let h = Harness::with_publish_failures(2);
    let alice = user("@alice:remote.org");
    let bob = user("@bob:remote.org");
    h.directory.set_devices(&alice, 1, vec![device("A", "a1")]);
    h.directory.set_devices(&bob, 1, vec![device("B", "b1")]);

    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();
    h.engine
        .resync_user(&bob, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();
    assert!(h.records().is_empty());

    h.engine.flush_outbox().await.unwrap();
    let users: Vec<String> = h.records().iter().map(|r| r.user_id.to_string()).collect();
    assert_eq!(users, vec!["@alice:remote.org", "@bob:remote.org"]);
}

#[tokio::test]
async fn flush_with_empty_outbox_is_a_no_op() {
    let h = Harness::new();
    assert_eq!(h.engine.flush_outbox().await.unwrap(), 0);
}

// ── Signals ──────────────────────────────────────────────────────

#[test]
fn signal_validation() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");

    assert_eq!(
        h.engine
            .validate_signal(&alice, Some(&server("remote.org")))
            .unwrap(),
        server("remote.org")
    );
    assert!(matches!(
        h.engine.validate_signal(&alice, None),
        Err(SyncError::InvalidSignal(_))
    ));
    assert!(matches!(
        h.engine.validate_signal(&alice, Some(&server("elsewhere.org"))),
        Err(SyncError::InvalidSignal(_))
    ));
    assert!(matches!(
        h.engine
            .validate_signal(&user("@me:local.org"), Some(&server("local.org"))),
        Err(SyncError::InvalidSignal(_))
    ));
}

#[tokio::test]
async fn signal_at_applied_stream_id_needs_no_resync() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory.set_devices(&alice, 4, vec![device("A", "a1")]);
    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    assert!(!h.engine.needs_resync(&alice, Some(4)).await.unwrap());
    assert!(!h.engine.needs_resync(&alice, Some(3)).await.unwrap());
    assert!(h.engine.needs_resync(&alice, Some(5)).await.unwrap());
    assert!(h.engine.needs_resync(&alice, None).await.unwrap());

    h.store.mark_stale(&alice, &server("remote.org")).unwrap();
    assert!(h.engine.needs_resync(&alice, Some(4)).await.unwrap());
}

#[tokio::test]
async fn local_stream_bump_does_not_mask_next_remote_change() {
    let h = Harness::new();
    let alice = user("@alice:remote.org");
    h.directory.set_devices(&alice, 10, vec![device("A", "a1")]);
    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();

    // A permanent failure empties the list and bumps only the local stream id.
    h.engine
        .resolve_as_empty(&alice, &server("remote.org"))
        .await
        .unwrap();
    let state = h.store.get_device_list_state(&alice).unwrap().unwrap();
    assert_eq!(state.stream_id, 11);
    assert_eq!(state.remote_stream_id, 10);

    h.directory.set_devices(&alice, 11, vec![device("B", "b1")]);
    assert!(!h.engine.needs_resync(&alice, Some(10)).await.unwrap());
    assert!(h.engine.needs_resync(&alice, Some(11)).await.unwrap());

    h.engine
        .resync_user(&alice, &server("remote.org"), &no_shutdown())
        .await
        .unwrap();
    let state = h.store.get_device_list_state(&alice).unwrap().unwrap();
    assert_eq!(state.stream_id, 12);
    assert_eq!(state.remote_stream_id, 11);
    assert!(state.device(&DeviceId::new("B").unwrap()).is_some());
    assert!(!h.engine.needs_resync(&alice, Some(11)).await.unwrap());
}
