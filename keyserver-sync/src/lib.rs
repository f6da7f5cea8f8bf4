//! Federated device list synchronization engine.
//!
//! Keeps local copies of remote users' device lists consistent with the
//! servers that own them, and turns every observed difference into an
//! ordered key change stream for local consumers.
//!
//! # Architecture
//!
//! ## Components
//!
//! - **Remote**: the injected [`RemoteDirectoryClient`] that fetches a remote
//!   user's device list ([`FederationClient`] is the HTTP implementation)
//! - **Queue**: coalescing staleness queue with a per-user in-flight set
//! - **Engine**: fetch, diff, commit and publish for one user
//! - **Updater**: fixed-size worker pool with retry and backoff
//! - **Publisher**: drains the store outbox onto the durable change log
//! - **KeyServer**: the facade callers use to signal, query and subscribe
//!
//! ## Resync Process
//!
//! 1. **Signal**: a federation notification or a query miss marks a user stale
//! 2. **Schedule**: the queue coalesces duplicate signals into one task
//! 3. **Fetch**: a worker asks the user's server for the current list
//! 4. **Diff**: removals, updates and additions against the stored list
//! 5. **Commit**: one store transaction writes the list and outbox rows
//! 6. **Publish**: outbox rows are appended to the change log in commit order
//!
//! # Example
//!
//! ```no_run
//! use keyserver_storage::{DeviceListStore, KeyChangeLog};
//! use keyserver_sync::{FederationClient, FederationConfig, KeyServer, UpdaterConfig};
//! use std::sync::Arc;
//!
//! # async fn run() -> keyserver_sync::SyncResult<()> {
//! let store = DeviceListStore::open("devices.db")?;
//! let log = KeyChangeLog::open("key_changes.db")?;
//! let client = Arc::new(FederationClient::new(FederationConfig::default())?);
//!
//! let config = UpdaterConfig {
//!     local_server: "example.org".to_string(),
//!     ..Default::default()
//! };
//! let server = KeyServer::new(store, log, client, config)?;
//! server.start().await?;
//! # Ok(())
//! # }
//! ```

mod config;
mod diff;
mod engine;
mod error;
pub mod federation;
mod keyserver;
pub mod publisher;
pub mod queue;
pub mod remote;
pub mod retry;
mod updater;

pub use config::UpdaterConfig;
pub use diff::diff_device_lists;
pub use engine::{ResyncSummary, SyncEngine};
pub use error::{SyncError, SyncResult};
pub use federation::{FederationClient, FederationConfig};
pub use keyserver::{KeyServer, SignalOutcome};
pub use publisher::{coalesce_pending, ChangePublisher, KeyChangeStream, LogPublisher};
pub use queue::{EnqueueOutcome, ResyncReason, ResyncTask, StalenessQueue};
pub use remote::{RemoteDeviceList, RemoteDirectoryClient};
pub use retry::{FailureClass, RetryPolicy};
pub use updater::{DeviceListUpdater, ResyncOutcome, ResyncReport};
