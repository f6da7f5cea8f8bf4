//! HTTP federation client.
//!
//! Implements [`RemoteDirectoryClient`] against the server-server
//! `GET /_matrix/federation/v1/user/devices/{userId}` endpoint. Requests are
//! unsigned; server discovery is a plain `{scheme}://{server_name}` unless a
//! base URL override is configured.

use crate::error::{SyncError, SyncResult};
use crate::remote::{RemoteDeviceList, RemoteDirectoryClient};
use async_trait::async_trait;
use keyserver_types::{DeviceId, DeviceKeys, ServerName, UserId};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;
use tracing::debug;

/// Federation client configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FederationConfig {
    /// Send every request here instead of to the user's server.
    pub base_url_override: Option<String>,
    /// URL scheme used when deriving a server's base URL.
    pub scheme: String,
    /// Per-request timeout (ms).
    pub timeout_ms: u64,
    /// `User-Agent` header.
    pub user_agent: String,
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self {
            base_url_override: None,
            scheme: "https".to_string(),
            timeout_ms: 30_000,
            user_agent: concat!("keyserver/", env!("CARGO_PKG_VERSION")).to_string(),
        }
    }
}

/// Federation API response structures.
#[derive(Debug, Deserialize)]
struct UserDevicesResponse {
    user_id: String,
    #[serde(default)]
    stream_id: i64,
    #[serde(default)]
    devices: Vec<UserDevice>,
}

#[derive(Debug, Deserialize)]
struct UserDevice {
    device_id: String,
    keys: Option<WireDeviceKeys>,
    device_display_name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireDeviceKeys {
    device_id: String,
    #[serde(default)]
    algorithms: BTreeSet<String>,
    #[serde(default)]
    keys: BTreeMap<String, String>,
    #[serde(default)]
    signatures: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    errcode: Option<String>,
    error: Option<String>,
}

/// [`RemoteDirectoryClient`] speaking the federation HTTP API.
pub struct FederationClient {
    config: FederationConfig,
    client: Client,
}

impl FederationClient {
    pub fn new(config: FederationConfig) -> SyncResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_millis(config.timeout_ms))
            .user_agent(config.user_agent.clone())
            .build()
            .map_err(|e| SyncError::Config(format!("http client: {e}")))?;
        Ok(Self { config, client })
    }

    fn devices_url(&self, server_name: &ServerName, user_id: &UserId) -> String {
        let base = match &self.config.base_url_override {
            Some(base) => base.trim_end_matches('/').to_string(),
            None => format!("{}://{}", self.config.scheme, server_name),
        };
        format!(
            "{base}/_matrix/federation/v1/user/devices/{}",
            urlencoding::encode(user_id.as_str())
        )
    }
}

#[async_trait]
impl RemoteDirectoryClient for FederationClient {
    async fn fetch_device_list(
        &self,
        server_name: &ServerName,
        user_id: &UserId,
    ) -> SyncResult<RemoteDeviceList> {
        let url = self.devices_url(server_name, user_id);
        debug!(server = %server_name, user_id = %user_id, "fetching remote device list");

        let resp = self.client.get(&url).send().await.map_err(map_transport_error)?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(map_status(status, &body, user_id));
        }

        let body = resp.bytes().await.map_err(map_transport_error)?;
        let parsed: UserDevicesResponse = serde_json::from_slice(&body)
            .map_err(|e| SyncError::Malformed(format!("device list body: {e}")))?;
        parse_device_list(user_id, parsed)
    }
}

fn map_transport_error(e: reqwest::Error) -> SyncError {
    if e.is_timeout() {
        SyncError::Timeout
    } else {
        SyncError::Network(e.to_string())
    }
}

fn map_status(status: StatusCode, body: &str, user_id: &UserId) -> SyncError {
    let message = serde_json::from_str::<ErrorBody>(body)
        .ok()
        .map(|b| match (b.errcode, b.error) {
            (Some(code), Some(msg)) => format!("{code}: {msg}"),
            (Some(code), None) => code,
            (None, Some(msg)) => msg,
            (None, None) => String::new(),
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::NOT_FOUND => SyncError::UserNotFound(user_id.to_string()),
        StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT => {
            SyncError::RemoteUnavailable {
                status: status.as_u16(),
                message,
            }
        }
        s if s.is_server_error() => SyncError::RemoteUnavailable {
            status: s.as_u16(),
            message,
        },
        s => SyncError::RemoteRejected {
            status: s.as_u16(),
            message,
        },
    }
}

fn parse_device_list(user_id: &UserId, resp: UserDevicesResponse) -> SyncResult<RemoteDeviceList> {
    if resp.user_id != user_id.as_str() {
        return Err(SyncError::Malformed(format!(
            "asked for {user_id}, got {}",
            resp.user_id
        )));
    }

    let mut devices = Vec::with_capacity(resp.devices.len());
    for device in resp.devices {
        let device_id = DeviceId::new(device.device_id)
            .map_err(|e| SyncError::Malformed(e.to_string()))?;
        let mut keys = DeviceKeys::new(device_id.clone());
        if let Some(wire) = device.keys {
            if wire.device_id != device_id.as_str() {
                return Err(SyncError::Malformed(format!(
                    "keys for {} listed under {device_id}",
                    wire.device_id
                )));
            }
            keys.algorithms = wire.algorithms;
            keys.keys = wire.keys;
            keys.signatures = wire.signatures;
        }
        keys.display_name = device.device_display_name;
        devices.push(keys);
    }
    Ok(RemoteDeviceList::new(resp.stream_id, devices))
}
