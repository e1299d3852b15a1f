use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::RwLock;
use wc_core::device::{Device, DiscoveredPeer};
use wc_core::ids::DeviceId;
use wc_core::ports::{DeviceRegistryError, DeviceRegistryPort};

use super::table::DeviceTable;

/// Registry kept only in memory. Used in tests and when no data dir is set.
#[derive(Default)]
pub struct InMemoryDeviceRegistry {
    table: RwLock<DeviceTable>,
}

impl InMemoryDeviceRegistry {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeviceRegistryPort for InMemoryDeviceRegistry {
    async fn get(&self, id: &DeviceId) -> Result<Option<Device>, DeviceRegistryError> {
        Ok(self.table.read().await.get(id))
    }

    async fn list(&self) -> Result<Vec<Device>, DeviceRegistryError> {
        Ok(self.table.read().await.list())
    }

    async fn insert(&self, device: Device) -> Result<(), DeviceRegistryError> {
        self.table.write().await.insert(device)
    }

    async fn update(&self, device: Device) -> Result<(), DeviceRegistryError> {
        self.table.write().await.update(device)
    }

    async fn delete(&self, id: &DeviceId) -> Result<(), DeviceRegistryError> {
        self.table.write().await.delete(id)
    }

    async fn upsert_discovered(
        &self,
        peer: &DiscoveredPeer,
    ) -> Result<Device, DeviceRegistryError> {
        Ok(self.table.write().await.upsert_discovered(peer, Utc::now()))
    }

    async fn mark_paired(
        &self,
        id: &DeviceId,
        public_key: Vec<u8>,
    ) -> Result<Device, DeviceRegistryError> {
        self.table.write().await.mark_paired(id, public_key)
    }

    async fn mark_unpaired(&self, id: &DeviceId) -> Result<Device, DeviceRegistryError> {
        self.table.write().await.mark_unpaired(id)
    }

    async fn touch_last_connected(&self, id: &DeviceId) -> Result<(), DeviceRegistryError> {
        self.table.write().await.touch_last_connected(id, Utc::now())
    }
}
