//! Device list diffing.

use crate::error::SyncResult;
use keyserver_types::{ChangeType, DeviceChange, DeviceId, DeviceKeys};
use std::collections::BTreeMap;

/// Computes the changes that turn `local` into `remote`.
///
/// A device present on both sides with different key material is
/// `Updated`, never a removal plus an addition. The result is ordered
/// removals, updates, additions, each by device ID.
pub fn diff_device_lists(
    local: &BTreeMap<DeviceId, DeviceKeys>,
    remote: &BTreeMap<DeviceId, DeviceKeys>,
) -> SyncResult<Vec<DeviceChange>> {
    let mut changes = Vec::new();

    for (device_id, local_keys) in local {
        match remote.get(device_id) {
            None => changes.push(DeviceChange::new(device_id.clone(), ChangeType::Removed)),
            Some(remote_keys) => {
                if remote_keys.key_material_differs(local_keys)? {
                    changes.push(DeviceChange::new(device_id.clone(), ChangeType::Updated));
                }
            }
        }
    }
    for device_id in remote.keys() {
        if !local.contains_key(device_id) {
            changes.push(DeviceChange::new(device_id.clone(), ChangeType::Added));
        }
    }

    changes.sort();
    Ok(changes)
}
