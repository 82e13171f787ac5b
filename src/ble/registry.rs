//! Device registry
//!
//! One [`BleDevice`] per peer for the lifetime of the central manager. Devices
//! are created lazily on first sighting or retrieval; insertion is idempotent
//! under concurrent discovery of the same peer.

use std::collections::HashMap;

use parking_lot::RwLock;

use super::adapter::PeerId;
use super::device::BleDevice;

/// Peer -> device map
#[derive(Default)]
pub struct DeviceRegistry {
    devices: RwLock<HashMap<PeerId, BleDevice>>,
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &PeerId) -> Option<BleDevice> {
        self.devices.read().get(id).cloned()
    }

    /// Return the device for `id`, creating it with `create` if there is none.
    ///
    /// `create` runs under the write lock, so concurrent callers for the same
    /// peer always end up with the same device. Returning `None` from `create`
    /// leaves the registry untouched.
    pub fn get_or_insert_with(
        &self,
        id: &PeerId,
        create: impl FnOnce() -> Option<BleDevice>,
    ) -> Option<BleDevice> {
        if let Some(device) = self.get(id) {
            return Some(device);
        }

        let mut devices = self.devices.write();
        if let Some(device) = devices.get(id) {
            return Some(device.clone());
        }
        let device = create()?;
        tracing::debug!("📇 Registered device {}", id);
        devices.insert(id.clone(), device.clone());
        Some(device)
    }

    /// All known devices, in no particular order
    pub fn all(&self) -> Vec<BleDevice> {
        self.devices.read().values().cloned().collect()
    }

    /// Devices currently reporting `Connected`
    pub fn connected(&self) -> Vec<BleDevice> {
        self.devices
            .read()
            .values()
            .filter(|device| device.is_connected())
            .cloned()
            .collect()
    }

    pub fn remove(&self, id: &PeerId) -> Option<BleDevice> {
        self.devices.write().remove(id)
    }

    pub fn len(&self) -> usize {
        self.devices.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
