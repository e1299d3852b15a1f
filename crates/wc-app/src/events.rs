//! Observable application events.

use wc_core::network::{DisconnectReason, WinuxMessage};
use wc_core::pairing::PairingState;
use wc_core::{DeviceId, FileTransfer};

/// One inbound control message tagged with the device it came from.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    pub device_id: DeviceId,
    pub message: WinuxMessage,
    /// Sealed with the paired key, or a handshake line on a session whose
    /// peer already proved that key.
    pub authenticated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        device_id: DeviceId,
    },
    Disconnected {
        device_id: DeviceId,
        reason: DisconnectReason,
    },
    /// A frame failed authentication after the key had been proven on the
    /// same session; the device was marked unpaired.
    PairingRevoked {
        device_id: DeviceId,
    },
}

/// 配对过程中向上层 (UI / CLI) 推送的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingUpdate {
    StateChanged(PairingState),
    /// Display this PIN (and QR of `uri`) to the local user.
    ShowPin { pin: String, uri: String },
    /// Ask the local user for the PIN shown on `peer_name`.
    PinRequested { peer_name: String },
    Finished {
        device_id: Option<DeviceId>,
        success: bool,
        error: Option<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferUpdate {
    /// An incoming transfer waits for `accept_transfer` / `reject_transfer`.
    Offered(FileTransfer),
    Changed(FileTransfer),
}

impl TransferUpdate {
    pub fn transfer(&self) -> &FileTransfer {
        match self {
            TransferUpdate::Offered(t) | TransferUpdate::Changed(t) => t,
        }
    }
}
