//! Local device identity.
//!
//! The device id is generated once, stored as a plain-text UUID in the data
//! directory and never changes for the lifetime of the installation. Peers
//! key their registry rows on it.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use wc_core::ids::DeviceId;

const DEVICE_ID_FILE: &str = "device_id";

pub struct LocalDeviceIdentity {
    device_id: DeviceId,
}

impl LocalDeviceIdentity {
    /// Load the stored id or generate and persist a new one.
    ///
    /// Fails fast on I/O errors: the daemon must not start without an id.
    pub fn load_or_create(data_dir: &Path) -> Result<Self> {
        if let Some(device_id) = load_from_disk(data_dir)? {
            return Ok(Self { device_id });
        }
        let device_id = DeviceId::new();
        save_to_disk(data_dir, &device_id)?;
        tracing::info!(device_id = %device_id, "generated local device id");
        Ok(Self { device_id })
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }
}

fn load_from_disk(data_dir: &Path) -> Result<Option<DeviceId>> {
    let path = data_dir.join(DEVICE_ID_FILE);
    if !path.exists() {
        return Ok(None);
    }

    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("read device_id file failed: {}", path.display()))?;
    let id_str = content.trim();
    if id_str.is_empty() {
        return Ok(None);
    }

    uuid::Uuid::parse_str(id_str)
        .with_context(|| format!("invalid device_id UUID in file: {}", path.display()))?;

    Ok(Some(DeviceId::from(id_str)))
}

fn save_to_disk(data_dir: &Path, id: &DeviceId) -> Result<()> {
    std::fs::create_dir_all(data_dir)
        .with_context(|| format!("create data dir failed: {}", data_dir.display()))?;
    write_atomic(&data_dir.join(DEVICE_ID_FILE), id.as_str().as_bytes())
}

/// Write via a sibling temp file and rename, so readers see old or new content.
pub(crate) fn write_atomic(path: &Path, contents: &[u8]) -> Result<()> {
    let tmp_path = tmp_path_for(path);
    std::fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file failed: {}", tmp_path.display()))?;
    if let Err(err) = std::fs::rename(&tmp_path, path) {
        let _ = std::fs::remove_file(&tmp_path);
        return Err(err).with_context(|| format!("rename into place failed: {}", path.display()));
    }
    Ok(())
}

pub(crate) fn tmp_path_for(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}
