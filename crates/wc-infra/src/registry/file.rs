use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use wc_core::device::{Device, DiscoveredPeer};
use wc_core::ids::DeviceId;
use wc_core::ports::{DeviceRegistryError, DeviceRegistryPort};

use super::table::DeviceTable;
use crate::device_identity::tmp_path_for;

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct DeviceDocument {
    version: u32,
    devices: Vec<Device>,
}

/// Registry persisted as one JSON document (`devices.json`).
///
/// Writers are serialized by a single lock. Each mutation is applied to a
/// copy, written to a temp file and renamed into place; only then does the
/// in-memory table change. A failed write leaves both file and memory at the
/// previous state.
pub struct FileDeviceRegistry {
    path: PathBuf,
    table: Mutex<DeviceTable>,
}

impl FileDeviceRegistry {
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, DeviceRegistryError> {
        let path = path.into();
        let table = match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let document: DeviceDocument = serde_json::from_slice(&bytes).map_err(|e| {
                    DeviceRegistryError::Storage(format!("parse {}: {e}", path.display()))
                })?;
                if document.version != FORMAT_VERSION {
                    return Err(DeviceRegistryError::Storage(format!(
                        "unsupported registry version {}",
                        document.version
                    )));
                }
                DeviceTable::from_devices(document.devices)
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => DeviceTable::default(),
            Err(err) => {
                return Err(DeviceRegistryError::Storage(format!(
                    "read {}: {err}",
                    path.display()
                )))
            }
        };
        tracing::debug!(path = %path.display(), devices = table.list().len(), "opened device registry");
        Ok(Self {
            path,
            table: Mutex::new(table),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Apply `f` to a copy of the table, persist it, then commit.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut DeviceTable) -> Result<T, DeviceRegistryError>,
    ) -> Result<T, DeviceRegistryError> {
        let mut guard = self.table.lock().await;
        let mut next = guard.clone();
        let out = f(&mut next)?;
        self.persist(&next).await?;
        *guard = next;
        Ok(out)
    }

    async fn persist(&self, table: &DeviceTable) -> Result<(), DeviceRegistryError> {
        let document = DeviceDocument {
            version: FORMAT_VERSION,
            devices: table.list(),
        };
        let json = serde_json::to_vec_pretty(&document)
            .map_err(|e| DeviceRegistryError::Storage(format!("serialize: {e}")))?;

        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| DeviceRegistryError::Storage(format!("create dir: {e}")))?;
        }
        let tmp = tmp_path_for(&self.path);
        tokio::fs::write(&tmp, &json)
            .await
            .map_err(|e| DeviceRegistryError::Storage(format!("write {}: {e}", tmp.display())))?;
        if let Err(err) = tokio::fs::rename(&tmp, &self.path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(DeviceRegistryError::Storage(format!(
                "rename into {}: {err}",
                self.path.display()
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceRegistryPort for FileDeviceRegistry {
    async fn get(&self, id: &DeviceId) -> Result<Option<Device>, DeviceRegistryError> {
        Ok(self.table.lock().await.get(id))
    }

    async fn list(&self) -> Result<Vec<Device>, DeviceRegistryError> {
        Ok(self.table.lock().await.list())
    }

    async fn insert(&self, device: Device) -> Result<(), DeviceRegistryError> {
        self.mutate(|t| t.insert(device)).await
    }

    async fn update(&self, device: Device) -> Result<(), DeviceRegistryError> {
        self.mutate(|t| t.update(device)).await
    }

    async fn delete(&self, id: &DeviceId) -> Result<(), DeviceRegistryError> {
        self.mutate(|t| t.delete(id)).await
    }

    async fn upsert_discovered(
        &self,
        peer: &DiscoveredPeer,
    ) -> Result<Device, DeviceRegistryError> {
        let now = Utc::now();
        self.mutate(|t| Ok(t.upsert_discovered(peer, now))).await
    }

    async fn mark_paired(
        &self,
        id: &DeviceId,
        public_key: Vec<u8>,
    ) -> Result<Device, DeviceRegistryError> {
        let device = self.mutate(|t| t.mark_paired(id, public_key)).await?;
        tracing::info!(device_id = %id, "device marked paired");
        Ok(device)
    }

    async fn mark_unpaired(&self, id: &DeviceId) -> Result<Device, DeviceRegistryError> {
        let device = self.mutate(|t| t.mark_unpaired(id)).await?;
        tracing::info!(device_id = %id, "device marked unpaired");
        Ok(device)
    }

    async fn touch_last_connected(&self, id: &DeviceId) -> Result<(), DeviceRegistryError> {
        let now = Utc::now();
        self.mutate(|t| t.touch_last_connected(id, now)).await
    }
}
