//! Device key material and per-user device list state.
//!
//! A published `DeviceKeys` value is never mutated in place. Any change to
//! its algorithms, keys or signatures is a new logical version, detected by
//! comparing fingerprints.

use crate::{DeviceId, Result, ServerName, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};

/// Public key material for a single device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceKeys {
    /// The device these keys belong to.
    pub device_id: DeviceId,
    /// Encryption algorithms supported by the device.
    #[serde(default)]
    pub algorithms: BTreeSet<String>,
    /// Key identifier (`<algorithm>:<device_id>`) to base64 key material.
    #[serde(default)]
    pub keys: BTreeMap<String, String>,
    /// Signer (user ID) to key identifier to base64 signature.
    #[serde(default)]
    pub signatures: BTreeMap<String, BTreeMap<String, String>>,
    /// Human readable name, not part of the key fingerprint.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
}

#[derive(Serialize)]
struct FingerprintView<'a> {
    device_id: &'a DeviceId,
    algorithms: &'a BTreeSet<String>,
    keys: &'a BTreeMap<String, String>,
    signatures: &'a BTreeMap<String, BTreeMap<String, String>>,
}

impl DeviceKeys {
    /// Creates an empty key set for a device.
    #[must_use]
    pub fn new(device_id: DeviceId) -> Self {
        Self {
            device_id,
            algorithms: BTreeSet::new(),
            keys: BTreeMap::new(),
            signatures: BTreeMap::new(),
            display_name: None,
        }
    }

    /// Adds a supported algorithm.
    #[must_use]
    pub fn with_algorithm(mut self, algorithm: impl Into<String>) -> Self {
        self.algorithms.insert(algorithm.into());
        self
    }

    /// Adds a key.
    #[must_use]
    pub fn with_key(mut self, key_id: impl Into<String>, key: impl Into<String>) -> Self {
        self.keys.insert(key_id.into(), key.into());
        self
    }

    /// Adds a signature made by `signer` with `key_id`.
    #[must_use]
    pub fn with_signature(
        mut self,
        signer: impl Into<String>,
        key_id: impl Into<String>,
        signature: impl Into<String>,
    ) -> Self {
        self.signatures
            .entry(signer.into())
            .or_default()
            .insert(key_id.into(), signature.into());
        self
    }

    /// Sets the display name.
    #[must_use]
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }

    /// Hex SHA-256 over the canonical JSON form of the key material.
    ///
    /// Display name is excluded: renaming a device does not rotate its keys.
    pub fn fingerprint(&self) -> Result<String> {
        let view = FingerprintView {
            device_id: &self.device_id,
            algorithms: &self.algorithms,
            keys: &self.keys,
            signatures: &self.signatures,
        };
        // BTree collections serialize in key order, so the encoding is canonical.
        let bytes = serde_json::to_vec(&view)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    /// Returns true if the key material differs from `other`.
    pub fn key_material_differs(&self, other: &DeviceKeys) -> Result<bool> {
        Ok(self.fingerprint()? != other.fingerprint()?)
    }
}

/// Local knowledge of one user's device list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceListState {
    /// The user the list belongs to.
    pub user_id: UserId,
    /// Server that is authoritative for the user.
    pub server_name: ServerName,
    /// Local position of the last applied state. Strictly increases on every
    /// commit and never decreases.
    pub stream_id: i64,
    /// Highest device-list stream id the owning server has reported for the
    /// user. Signals are compared against this, never against `stream_id`.
    #[serde(default)]
    pub remote_stream_id: i64,
    /// Whether the cached list may not reflect the remote's current truth.
    pub is_stale: bool,
    /// Devices keyed by ID.
    pub devices: BTreeMap<DeviceId, DeviceKeys>,
    /// When the record was last written.
    pub updated_at: Option<DateTime<Utc>>,
}

impl DeviceListState {
    /// An empty, never-synced record for `user_id`.
    #[must_use]
    pub fn empty(user_id: UserId, server_name: ServerName) -> Self {
        Self {
            user_id,
            server_name,
            stream_id: 0,
            remote_stream_id: 0,
            is_stale: false,
            devices: BTreeMap::new(),
            updated_at: None,
        }
    }

    /// Number of known devices.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Looks up a device.
    pub fn device(&self, device_id: &DeviceId) -> Option<&DeviceKeys> {
        self.devices.get(device_id)
    }
}
