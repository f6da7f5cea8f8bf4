//! Shared fixtures for the key server integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use keyserver_storage::{DeviceListStore, KeyChangeLog};
use keyserver_sync::remote::mock::MockDirectory;
use keyserver_sync::{
    ChangePublisher, KeyServer, LogPublisher, ResyncOutcome, ResyncReport, SyncError, SyncResult,
    UpdaterConfig,
};
use keyserver_types::{DeviceId, DeviceKeys, KeyChangeRecord, PendingChange, ServerName, UserId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

pub fn user(s: &str) -> UserId {
    UserId::parse(s).unwrap()
}

pub fn server(s: &str) -> ServerName {
    ServerName::parse(s).unwrap()
}

pub fn device(id: &str, key: &str) -> DeviceKeys {
    DeviceKeys::new(DeviceId::new(id).unwrap())
        .with_algorithm("m.olm.v1.curve25519-aes-sha2")
        .with_key(format!("curve25519:{id}"), key)
}

/// Fast, deterministic settings for tests.
pub fn config() -> UpdaterConfig {
    UpdaterConfig {
        local_server: "local.org".to_string(),
        worker_count: 4,
        max_attempts: 5,
        base_backoff_ms: 10,
        max_backoff_ms: 50,
        backoff_jitter: false,
        request_timeout_ms: 2_000,
        query_timeout_ms: 2_000,
        rescan_interval_ms: 0,
        report_capacity: 256,
    }
}

pub struct TestServer {
    pub server: KeyServer,
    pub directory: MockDirectory,
    pub store: DeviceListStore,
}

pub fn in_memory(config: UpdaterConfig) -> TestServer {
    let store = DeviceListStore::open_in_memory().unwrap();
    let directory = MockDirectory::new();
    let server = KeyServer::new(
        store.clone(),
        KeyChangeLog::open_in_memory().unwrap(),
        Arc::new(directory.clone()),
        config,
    )
    .unwrap();
    TestServer {
        server,
        directory,
        store,
    }
}

/// Waits for the next report for `user_id` that ends its task.
pub async fn next_terminal(
    rx: &mut broadcast::Receiver<ResyncReport>,
    user_id: &UserId,
) -> ResyncReport {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let report = rx.recv().await.unwrap();
            if report.user_id == *user_id && report.outcome.is_terminal() {
                return report;
            }
        }
    })
    .await
    .expect("no terminal report within 5s")
}

/// Collects every outcome for `user_id` up to and including the terminal one.
pub async fn outcomes_until_terminal(
    rx: &mut broadcast::Receiver<ResyncReport>,
    user_id: &UserId,
) -> Vec<ResyncOutcome> {
    tokio::time::timeout(Duration::from_secs(5), async {
        let mut outcomes = Vec::new();
        loop {
            let report = rx.recv().await.unwrap();
            if report.user_id != *user_id {
                continue;
            }
            let terminal = report.outcome.is_terminal();
            outcomes.push(report.outcome);
            if terminal {
                return outcomes;
            }
        }
    })
    .await
    .expect("no terminal report within 5s")
}

/// Polls until `check` holds, failing after 5s.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !check() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached within 5s")
}

/// Publisher that fails a configured number of times before delegating.
pub struct FlakyPublisher {
    pub inner: Arc<LogPublisher>,
    pub failures_left: AtomicUsize,
}

impl FlakyPublisher {
    pub fn new(inner: Arc<LogPublisher>, failures: usize) -> Self {
        Self {
            inner,
            failures_left: AtomicUsize::new(failures),
        }
    }
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
