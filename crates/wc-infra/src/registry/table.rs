use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use wc_core::device::{Device, DiscoveredPeer};
use wc_core::ids::DeviceId;
use wc_core::ports::DeviceRegistryError;

/// In-memory rows plus the rules every mutation follows.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeviceTable {
    devices: BTreeMap<DeviceId, Device>,
}

impl DeviceTable {
    pub fn from_devices(devices: Vec<Device>) -> Self {
        Self {
            devices: devices.into_iter().map(|d| (d.id.clone(), d)).collect(),
        }
    }

    pub fn get(&self, id: &DeviceId) -> Option<Device> {
        self.devices.get(id).cloned()
    }

    pub fn list(&self) -> Vec<Device> {
        self.devices.values().cloned().collect()
    }

    pub fn insert(&mut self, device: Device) -> Result<(), DeviceRegistryError> {
        if self.devices.contains_key(&device.id) {
            return Err(DeviceRegistryError::InvalidState(format!(
                "device {} already exists",
                device.id
            )));
        }
        ensure_consistent(&device)?;
        self.devices.insert(device.id.clone(), device);
        Ok(())
    }

    pub fn update(&mut self, device: Device) -> Result<(), DeviceRegistryError> {
        ensure_consistent(&device)?;
        let row = self.row_mut(&device.id)?;
        *row = device;
        Ok(())
    }

    pub fn delete(&mut self, id: &DeviceId) -> Result<(), DeviceRegistryError> {
        self.devices
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| DeviceRegistryError::NotFound(id.clone()))
    }

    pub fn upsert_discovered(&mut self, peer: &DiscoveredPeer, now: DateTime<Utc>) -> Device {
        let existing = peer
            .device_id
            .as_ref()
            .filter(|id| self.devices.contains_key(*id))
            .cloned()
            .or_else(|| {
                self.devices
                    .values()
                    .find(|d| d.matches_discovered(peer))
                    .map(|d| d.id.clone())
            });

        match existing.and_then(|id| self.devices.get_mut(&id)) {
            Some(device) => {
                device.refresh_from(peer, now);
                device.clone()
            }
            None => {
                let device = Device::from_discovered(peer, now);
                self.devices.insert(device.id.clone(), device.clone());
                device
            }
        }
    }

    pub fn mark_paired(
        &mut self,
        id: &DeviceId,
        public_key: Vec<u8>,
    ) -> Result<Device, DeviceRegistryError> {
        if public_key.is_empty() {
            return Err(DeviceRegistryError::InvalidState(
                "cannot pair with an empty public key".into(),
            ));
        }
        let row = self.row_mut(id)?;
        row.mark_paired(public_key);
        Ok(row.clone())
    }

    pub fn mark_unpaired(&mut self, id: &DeviceId) -> Result<Device, DeviceRegistryError> {
        let row = self.row_mut(id)?;
        row.mark_unpaired();
        Ok(row.clone())
    }

    pub fn touch_last_connected(
        &mut self,
        id: &DeviceId,
        now: DateTime<Utc>,
    ) -> Result<(), DeviceRegistryError> {
        let row = self.row_mut(id)?;
        row.last_connected = Some(now);
        row.last_seen = now;
        Ok(())
    }

    fn row_mut(&mut self, id: &DeviceId) -> Result<&mut Device, DeviceRegistryError> {
        self.devices
            .get_mut(id)
            .ok_or_else(|| DeviceRegistryError::NotFound(id.clone()))
    }
}

fn ensure_consistent(device: &Device) -> Result<(), DeviceRegistryError> {
    if device.is_consistent() {
        Ok(())
    } else {
        Err(DeviceRegistryError::InvalidState(format!(
            "device {}: public key must be present exactly when paired",
            device.id
        )))
    }
}
