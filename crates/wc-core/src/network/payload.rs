//! Typed payloads for control messages.
//!
//! Keys are camelCase on the wire. Each payload knows which
//! [`MessageType`] it belongs to, so `into_message` can build the envelope.

use serde::{Deserialize, Serialize};

use super::message::{MessageType, WinuxMessage};
use crate::device::DeviceType;
use crate::error::ProtocolError;
use crate::ids::{DeviceId, TransferId};

/// Protocol revision advertised in `hello`.
pub const PROTOCOL_VERSION: u32 = 7;

/// Payloads that map onto exactly one message type.
pub trait MessagePayload: Serialize {
    const MESSAGE_TYPE: MessageType;

    fn into_message(&self) -> Result<WinuxMessage, ProtocolError>
    where
        Self: Sized,
    {
        WinuxMessage::with_payload(Self::MESSAGE_TYPE, self)
    }
}

macro_rules! bind_payload {
    ($($payload:ty => $variant:ident),* $(,)?) => {
        $(
            impl MessagePayload for $payload {
                const MESSAGE_TYPE: MessageType = MessageType::$variant;
            }
        )*
    };
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HelloPayload {
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: DeviceType,
    pub protocol_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairRequestPayload {
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: DeviceType,
    /// Base64 of the sender's 32-byte public key.
    pub public_key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairResponsePayload {
    pub accepted: bool,
    pub device_id: DeviceId,
    pub device_name: String,
    pub device_type: DeviceType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// One step of the bitwise PIN check (a commitment or the nonce opening it,
/// for `round`) or the verdict.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PairConfirmPayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub round: Option<u8>,
    /// Hex SHA-256 commitment to this round's PIN bit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commitment: Option<String>,
    /// Hex nonce opening the sender's commitment for this round.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accepted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPayload {
    pub id: String,
    pub app_name: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    #[serde(default = "default_true")]
    pub is_clearable: bool,
    /// Post time in epoch milliseconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub time: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub actions: Vec<String>,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationActionPayload {
    pub id: String,
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationDismissPayload {
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClipboardContentPayload {
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferRequestPayload {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
    /// SHA-256 hex of the file contents.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferAcceptPayload {
    pub transfer_id: TransferId,
    pub address: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferRejectPayload {
    pub transfer_id: TransferId,
    #[serde(default)]
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferProgressPayload {
    pub transfer_id: TransferId,
    pub bytes_transferred: u64,
    pub progress: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferCompletePayload {
    pub transfer_id: TransferId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileTransferErrorPayload {
    pub transfer_id: TransferId,
    pub error: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MediaAction {
    Play,
    Pause,
    PlayPause,
    Stop,
    Next,
    Previous,
    /// `value` is the target position in milliseconds.
    Seek,
    /// `value` is the target volume, 0-100.
    SetVolume,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaControlPayload {
    pub action: MediaAction,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<i64>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MediaStatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub player: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub album: Option<String>,
    #[serde(default)]
    pub is_playing: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub position_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatteryStatusPayload {
    /// Charge level, 0-100.
    pub level: u8,
    pub is_charging: bool,
    /// Set when the level crossed the low-battery threshold.
    #[serde(default)]
    pub threshold_event: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapabilitiesPayload {
    pub incoming: Vec<String>,
    pub outgoing: Vec<String>,
}

impl CapabilitiesPayload {
    /// Everything this build can both receive and send.
    pub fn full() -> Self {
        let all: Vec<String> = MessageType::all_known()
            .iter()
            .map(|t| t.as_str().to_string())
            .collect();
        Self {
            incoming: all.clone(),
            outgoing: all,
        }
    }

    pub fn accepts(&self, message_type: &MessageType) -> bool {
        self.incoming.iter().any(|t| t == message_type.as_str())
    }
}

bind_payload! {
    HelloPayload => Hello,
    PairRequestPayload => PairRequest,
    PairResponsePayload => PairResponse,
    PairConfirmPayload => PairConfirm,
    NotificationPayload => Notification,
    NotificationActionPayload => NotificationAction,
    NotificationDismissPayload => NotificationDismiss,
    ClipboardContentPayload => ClipboardContent,
    FileTransferRequestPayload => FileTransferRequest,
    FileTransferAcceptPayload => FileTransferAccept,
    FileTransferRejectPayload => FileTransferReject,
    FileTransferProgressPayload => FileTransferProgress,
    FileTransferCompletePayload => FileTransferComplete,
    FileTransferErrorPayload => FileTransferError,
    MediaControlPayload => MediaControl,
    MediaStatePayload => MediaState,
    BatteryStatusPayload => BatteryStatus,
    CapabilitiesPayload => Capabilities,
}
