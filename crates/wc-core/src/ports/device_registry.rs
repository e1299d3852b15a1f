use async_trait::async_trait;

use super::errors::DeviceRegistryError;
use crate::device::{Device, DiscoveredPeer};
use crate::ids::DeviceId;

/// Persistent store of known devices.
///
/// Every mutating call is atomic per row: a crash mid-call leaves either the
/// old or the new row, never a mix.
#[async_trait]
pub trait DeviceRegistryPort: Send + Sync {
    async fn get(&self, id: &DeviceId) -> Result<Option<Device>, DeviceRegistryError>;

    async fn list(&self) -> Result<Vec<Device>, DeviceRegistryError>;

    async fn list_paired(&self) -> Result<Vec<Device>, DeviceRegistryError> {
        Ok(self
            .list()
            .await?
            .into_iter()
            .filter(|d| d.is_paired)
            .collect())
    }

    /// Fails with `InvalidState` when the id already exists.
    async fn insert(&self, device: Device) -> Result<(), DeviceRegistryError>;

    /// Fails with `NotFound` when the id is unknown.
    async fn update(&self, device: Device) -> Result<(), DeviceRegistryError>;

    async fn delete(&self, id: &DeviceId) -> Result<(), DeviceRegistryError>;

    /// Match by hostname or address and refresh it, else insert a new
    /// unpaired device. Returns the stored row.
    async fn upsert_discovered(&self, peer: &DiscoveredPeer)
        -> Result<Device, DeviceRegistryError>;

    async fn mark_paired(
        &self,
        id: &DeviceId,
        public_key: Vec<u8>,
    ) -> Result<Device, DeviceRegistryError>;

    async fn mark_unpaired(&self, id: &DeviceId) -> Result<Device, DeviceRegistryError>;

    async fn touch_last_connected(&self, id: &DeviceId) -> Result<(), DeviceRegistryError>;
}
