//! Control-channel message envelope.
//!
//! Every line on the control channel carries one [`WinuxMessage`]:
//! `{ "id", "type", "timestamp", "payload" }`. The `type` set is closed;
//! anything outside it decodes to [`MessageType::Unknown`] so newer peers
//! do not break older ones.

use std::fmt;

use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::ids::MessageId;

macro_rules! message_types {
    ($($variant:ident => $wire:literal),* $(,)?) => {
        /// Closed set of control message kinds.
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum MessageType {
            $($variant,)*
            /// A type string this build does not know. Ignored on receipt.
            Unknown(String),
        }

        impl MessageType {
            /// Every known type, in wire order.
            pub fn all_known() -> Vec<MessageType> {
                vec![$(MessageType::$variant,)*]
            }

            pub fn as_str(&self) -> &str {
                match self {
                    $(MessageType::$variant => $wire,)*
                    MessageType::Unknown(raw) => raw.as_str(),
                }
            }

            pub fn parse(raw: &str) -> Self {
                match raw {
                    $($wire => MessageType::$variant,)*
                    other => MessageType::Unknown(other.to_string()),
                }
            }
        }
    };
}

message_types! {
    Hello => "hello",
    PairRequest => "pair_request",
    PairResponse => "pair_response",
    PairConfirm => "pair_confirm",
    Disconnect => "disconnect",
    Ping => "ping",
    Pong => "pong",
    Notification => "notification",
    NotificationAction => "notification_action",
    NotificationDismiss => "notification_dismiss",
    ClipboardContent => "clipboard_content",
    ClipboardRequest => "clipboard_request",
    FileTransferRequest => "file_transfer_request",
    FileTransferAccept => "file_transfer_accept",
    FileTransferReject => "file_transfer_reject",
    FileTransferProgress => "file_transfer_progress",
    FileTransferComplete => "file_transfer_complete",
    FileTransferError => "file_transfer_error",
    MediaControl => "media_control",
    MediaState => "media_state",
    CommandRing => "command_ring",
    CommandFindPhone => "command_find_phone",
    CommandLock => "command_lock",
    CommandScreenshot => "command_screenshot",
    BatteryStatus => "battery_status",
    BatteryRequest => "battery_request",
    Capabilities => "capabilities",
}

impl MessageType {
    /// Messages exchanged before a session key exists; always sent as plain JSON.
    pub fn is_handshake(&self) -> bool {
        matches!(
            self,
            MessageType::Hello
                | MessageType::PairRequest
                | MessageType::PairResponse
                | MessageType::PairConfirm
        )
    }

    pub fn is_pairing(&self) -> bool {
        matches!(
            self,
            MessageType::PairRequest | MessageType::PairResponse | MessageType::PairConfirm
        )
    }

    pub fn is_file_transfer(&self) -> bool {
        matches!(
            self,
            MessageType::FileTransferRequest
                | MessageType::FileTransferAccept
                | MessageType::FileTransferReject
                | MessageType::FileTransferProgress
                | MessageType::FileTransferComplete
                | MessageType::FileTransferError
        )
    }

    pub fn is_command(&self) -> bool {
        matches!(
            self,
            MessageType::CommandRing
                | MessageType::CommandFindPhone
                | MessageType::CommandLock
                | MessageType::CommandScreenshot
        )
    }

    pub fn is_unknown(&self) -> bool {
        matches!(self, MessageType::Unknown(_))
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for MessageType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for MessageType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(MessageType::parse(&raw))
    }
}

/// One control-channel message. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WinuxMessage {
    id: MessageId,
    #[serde(rename = "type")]
    message_type: MessageType,
    /// Milliseconds since the Unix epoch.
    timestamp: i64,
    #[serde(default)]
    payload: Map<String, Value>,
}

impl WinuxMessage {
    pub fn new(message_type: MessageType, payload: Map<String, Value>) -> Self {
        Self {
            id: MessageId::new(),
            message_type,
            timestamp: Utc::now().timestamp_millis(),
            payload,
        }
    }

    /// Build a message whose payload is the serialized form of `payload`.
    pub fn with_payload<T: Serialize>(
        message_type: MessageType,
        payload: &T,
    ) -> Result<Self, ProtocolError> {
        let value = serde_json::to_value(payload).map_err(|err| ProtocolError::InvalidPayload {
            message_type: message_type.to_string(),
            reason: err.to_string(),
        })?;
        let payload = match value {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(ProtocolError::InvalidPayload {
                    message_type: message_type.to_string(),
                    reason: format!("payload must be an object, got {other}"),
                })
            }
        };
        Ok(Self::new(message_type, payload))
    }

    pub fn empty(message_type: MessageType) -> Self {
        Self::new(message_type, Map::new())
    }

    pub fn ping() -> Self {
        Self::empty(MessageType::Ping)
    }

    pub fn pong() -> Self {
        Self::empty(MessageType::Pong)
    }

    pub fn disconnect() -> Self {
        Self::empty(MessageType::Disconnect)
    }

    pub fn clipboard_request() -> Self {
        Self::empty(MessageType::ClipboardRequest)
    }

    pub fn battery_request() -> Self {
        Self::empty(MessageType::BatteryRequest)
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    pub fn message_type(&self) -> &MessageType {
        &self.message_type
    }

    pub fn timestamp(&self) -> i64 {
        self.timestamp
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.payload.get(key).and_then(Value::as_str)
    }

    /// Deserialize the payload into its typed form.
    pub fn payload_as<T: DeserializeOwned>(&self) -> Result<T, ProtocolError> {
        serde_json::from_value(Value::Object(self.payload.clone())).map_err(|err| {
            ProtocolError::InvalidPayload {
                message_type: self.message_type.to_string(),
                reason: err.to_string(),
            }
        })
    }

    pub fn to_json(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(|err| ProtocolError::MalformedJson(err.to_string()))
    }

    /// Decode one JSON message. Pure: the same input always yields the same result.
    pub fn from_json(raw: &str) -> Result<Self, ProtocolError> {
        let value: Value =
            serde_json::from_str(raw).map_err(|err| ProtocolError::MalformedJson(err.to_string()))?;
        let object = value
            .as_object()
            .ok_or_else(|| ProtocolError::MalformedJson("message must be an object".into()))?;

        let id = object
            .get("id")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("id"))?;
        let message_type = object
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingField("type"))?;
        let timestamp = object
            .get("timestamp")
            .and_then(Value::as_i64)
            .ok_or(ProtocolError::MissingField("timestamp"))?;
        let payload = match object.get("payload") {
            None | Some(Value::Null) => Map::new(),
            Some(Value::Object(map)) => map.clone(),
            Some(_) => {
                return Err(ProtocolError::InvalidPayload {
                    message_type: message_type.to_string(),
                    reason: "payload must be an object".into(),
                })
            }
        };

        Ok(Self {
            id: MessageId::from(id),
            message_type: MessageType::parse(message_type),
            timestamp,
            payload,
        })
    }
}
