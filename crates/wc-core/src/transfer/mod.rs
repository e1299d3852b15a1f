//! File-transfer records.
//!
//! A [`FileTransfer`] tracks one file moving over its own TCP connection.
//! Records become immutable once they reach a terminal state.

use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransferError;
use crate::ids::{DeviceId, TransferId};

/// Size of each chunk written to or read from the transfer socket.
pub const DEFAULT_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferDirection {
    Incoming,
    Outgoing,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferState {
    Pending,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileTransfer {
    pub id: TransferId,
    pub device_id: DeviceId,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    pub direction: TransferDirection,
    pub state: TransferState,
    /// Percent complete, 0-100.
    pub progress: u8,
    pub bytes_transferred: u64,
    pub local_path: Option<PathBuf>,
    /// Set only when `state` is `Failed`.
    pub error_message: Option<String>,
    /// SHA-256 hex of the whole file, when known.
    pub checksum: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl FileTransfer {
    pub fn outgoing(
        device_id: DeviceId,
        file_name: impl Into<String>,
        file_size: u64,
        mime_type: impl Into<String>,
        local_path: PathBuf,
    ) -> Self {
        Self {
            id: TransferId::new(),
            device_id,
            file_name: file_name.into(),
            file_size,
            mime_type: mime_type.into(),
            direction: TransferDirection::Outgoing,
            state: TransferState::Pending,
            progress: 0,
            bytes_transferred: 0,
            local_path: Some(local_path),
            error_message: None,
            checksum: None,
            created_at: Utc::now(),
        }
    }

    pub fn incoming(
        id: TransferId,
        device_id: DeviceId,
        file_name: impl Into<String>,
        file_size: u64,
        mime_type: impl Into<String>,
        checksum: Option<String>,
    ) -> Self {
        Self {
            id,
            device_id,
            file_name: file_name.into(),
            file_size,
            mime_type: mime_type.into(),
            direction: TransferDirection::Incoming,
            state: TransferState::Pending,
            progress: 0,
            bytes_transferred: 0,
            local_path: None,
            error_message: None,
            checksum,
            created_at: Utc::now(),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.state.is_terminal()
    }

    fn ensure_active(&self) -> Result<(), TransferError> {
        if self.is_finished() {
            return Err(TransferError::AlreadyFinished(self.id.clone()));
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), TransferError> {
        self.ensure_active()?;
        self.state = TransferState::InProgress;
        Ok(())
    }

    /// Record the running byte count after a chunk.
    pub fn record_progress(&mut self, bytes_transferred: u64) -> Result<(), TransferError> {
        self.ensure_active()?;
        self.state = TransferState::InProgress;
        self.bytes_transferred = bytes_transferred;
        self.progress = percent(bytes_transferred, self.file_size);
        Ok(())
    }

    pub fn complete(&mut self) -> Result<(), TransferError> {
        self.ensure_active()?;
        self.state = TransferState::Completed;
        self.bytes_transferred = self.file_size;
        self.progress = 100;
        Ok(())
    }

    pub fn fail(&mut self, reason: impl Into<String>) -> Result<(), TransferError> {
        self.ensure_active()?;
        self.state = TransferState::Failed;
        self.error_message = Some(reason.into());
        Ok(())
    }

    pub fn cancel(&mut self) -> Result<(), TransferError> {
        self.ensure_active()?;
        self.state = TransferState::Cancelled;
        Ok(())
    }
}

/// MIME type guessed from the file extension, `application/octet-stream` otherwise.
pub fn mime_from_path(path: &Path) -> String {
    mime_guess::from_path(path)
        .first_or_octet_stream()
        .essence_str()
        .to_string()
}

fn percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.min(total) as u128 * 100) / total as u128) as u8
}

/// Human-readable size, e.g. `1.5 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    if bytes < 1024 {
        return format!("{bytes} B");
    }
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(size: u64) -> FileTransfer {
        FileTransfer::outgoing(
            DeviceId::from("d"),
            "a.bin",
            size,
            "application/octet-stream",
            PathBuf::from("/tmp/a.bin"),
        )
    }

    #[test]
    fn progress_tracks_bytes() {
        let mut t = transfer(200);
        t.record_progress(50).unwrap();
        assert_eq!(t.state, TransferState::InProgress);
        assert_eq!(t.progress, 25);
        t.complete().unwrap();
        assert_eq!((t.progress, t.bytes_transferred), (100, 200));
    }

    #[test]
    fn terminal_records_reject_mutation() {
        let mut t = transfer(10);
        t.fail("boom").unwrap();
        assert_eq!(t.error_message.as_deref(), Some("boom"));
        assert!(matches!(
            t.record_progress(5),
            Err(TransferError::AlreadyFinished(_))
        ));
        assert!(t.cancel().is_err());
        assert_eq!(t.state, TransferState::Failed);
    }

    #[test]
    fn empty_file_is_fully_done() {
        let mut t = transfer(0);
        t.record_progress(0).unwrap();
        assert_eq!(t.progress, 100);
    }

    #[test]
    fn mime_is_guessed_from_extension() {
        assert_eq!(mime_from_path(Path::new("photo.JPG")), "image/jpeg");
        assert_eq!(
            mime_from_path(Path::new("blob.unknownext")),
            "application/octet-stream"
        );
    }

    #[test]
    fn sizes_format_with_units() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(4 * 1024 * 1024), "4.0 MB");
    }
}
