//! Remote directory abstraction.
//!
//! The engine never talks to the network directly; it asks a
//! [`RemoteDirectoryClient`] for a user's current device list and classifies
//! whatever error comes back.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use keyserver_types::{DeviceId, DeviceKeys, ServerName, UserId};
use std::collections::{BTreeMap, HashSet};

/// A device list as reported by the user's own server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemoteDeviceList {
    /// The remote server's device list stream position for the user, if known.
    pub stream_id: i64,
    /// All devices the remote currently lists.
    pub devices: Vec<DeviceKeys>,
}

impl RemoteDeviceList {
    pub fn new(stream_id: i64, devices: Vec<DeviceKeys>) -> Self {
        Self { stream_id, devices }
    }

    /// Validates the response and indexes it by device ID.
    ///
    /// Duplicate device IDs or a negative stream id make the whole response
    /// malformed.
    pub fn into_device_map(self) -> SyncResult<BTreeMap<DeviceId, DeviceKeys>> {
        if self.stream_id < 0 {
            return Err(SyncError::Malformed(format!(
                "negative stream id {}",
                self.stream_id
            )));
        }
        let mut seen = HashSet::with_capacity(self.devices.len());
        let mut map = BTreeMap::new();
        for keys in self.devices {
            if !seen.insert(keys.device_id.clone()) {
                return Err(SyncError::Malformed(format!(
                    "duplicate device id {}",
                    keys.device_id
                )));
            }
            map.insert(keys.device_id.clone(), keys);
        }
        Ok(map)
    }
}

/// Fetches authoritative device lists from remote servers.
#[async_trait]
pub trait RemoteDirectoryClient: Send + Sync {
    /// Fetches the current device list of `user_id` from `server_name`.
    async fn fetch_device_list(
        &self,
        server_name: &ServerName,
        user_id: &UserId,
    ) -> SyncResult<RemoteDeviceList>;
}

/// A scriptable directory for testing.
pub mod mock {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// A failure the mock can be told to return.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum MockFailure {
        Timeout,
        Network,
        Unavailable,
        NotFound,
        Rejected,
        Malformed,
    }

    impl MockFailure {
        fn to_error(self, user_id: &UserId) -> SyncError {
            match self {
                MockFailure::Timeout => SyncError::Timeout,
                MockFailure::Network => SyncError::Network("connection reset".to_string()),
                MockFailure::Unavailable => SyncError::RemoteUnavailable {
                    status: 503,
                    message: "try later".to_string(),
                },
                MockFailure::NotFound => SyncError::UserNotFound(user_id.to_string()),
                MockFailure::Rejected => SyncError::RemoteRejected {
                    status: 403,
                    message: "forbidden".to_string(),
                },
                MockFailure::Malformed => SyncError::Malformed("garbage".to_string()),
            }
        }
    }

    #[derive(Default)]
    struct Inner {
        lists: HashMap<UserId, RemoteDeviceList>,
        failures: HashMap<UserId, VecDeque<MockFailure>>,
        fetches: HashMap<UserId, usize>,
    }

    /// In-memory [`RemoteDirectoryClient`] with scripted failures and an
    /// optional gate that holds fetches until released.
    #[derive(Clone, Default)]
    pub struct MockDirectory {
        inner: Arc<Mutex<Inner>>,
        gate: Arc<Mutex<Option<Arc<Semaphore>>>>,
        delay: Arc<Mutex<Option<Duration>>>,
    }

    impl MockDirectory {
        pub fn new() -> Self {
            Self::default()
        }

        fn inner(&self) -> std::sync::MutexGuard<'_, Inner> {
            self.inner.lock().unwrap_or_else(|e| e.into_inner())
        }

        /// Sets what the remote currently reports for a user.
        pub fn set_devices(&self, user_id: &UserId, stream_id: i64, devices: Vec<DeviceKeys>) {
            self.inner()
                .lists
                .insert(user_id.clone(), RemoteDeviceList::new(stream_id, devices));
        }

        /// Queues failures returned by the next fetches for a user, in order.
        pub fn fail_next(&self, user_id: &UserId, failures: &[MockFailure]) {
            self.inner()
                .failures
                .entry(user_id.clone())
                .or_default()
                .extend(failures.iter().copied());
        }

        /// Number of fetches made for a user so far.
        pub fn fetch_count(&self, user_id: &UserId) -> usize {
            self.inner().fetches.get(user_id).copied().unwrap_or(0)
        }

        /// Total fetches across all users.
        pub fn total_fetches(&self) -> usize {
            self.inner().fetches.values().sum()
        }

        /// Holds every subsequent fetch until [`MockDirectory::release`] is called.
        pub fn hold(&self) {
            *self.gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(Semaphore::new(0)));
        }

        /// Lets `n` held fetches proceed.
        pub fn release(&self, n: usize) {
            if let Some(gate) = self.gate.lock().unwrap_or_else(|e| e.into_inner()).as_ref() {
                gate.add_permits(n);
            }
        }

        /// Removes the gate; held and future fetches proceed freely.
        pub fn open(&self) {
            if let Some(gate) = self.gate.lock().unwrap_or_else(|e| e.into_inner()).take() {
                gate.add_permits(Semaphore::MAX_PERMITS / 2);
            }
        }

        /// Adds an artificial delay to every fetch.
        pub fn set_delay(&self, delay: Duration) {
            *self.delay.lock().unwrap_or_else(|e| e.into_inner()) = Some(delay);
        }
    }

    #[async_trait]
    impl RemoteDirectoryClient for MockDirectory {
        async fn fetch_device_list(
            &self,
            _server_name: &ServerName,
            user_id: &UserId,
        ) -> SyncResult<RemoteDeviceList> {
            *self.inner().fetches.entry(user_id.clone()).or_default() += 1;

            let gate = self.gate.lock().unwrap_or_else(|e| e.into_inner()).clone();
            if let Some(gate) = gate {
                let permit = gate
                    .acquire()
                    .await
                    .map_err(|_| SyncError::Network("gate closed".to_string()))?;
                permit.forget();
            }
            let delay = *self.delay.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }

            let mut inner = self.inner();
            if let Some(failure) = inner.failures.get_mut(user_id).and_then(VecDeque::pop_front) {
                return Err(failure.to_error(user_id));
            }
            inner
                .lists
                .get(user_id)
                .cloned()
                .ok_or_else(|| SyncError::UserNotFound(user_id.to_string()))
        }
    }
}
