use serde::{Deserialize, Serialize};

use crate::device::{DeviceType, DiscoveredPeer};
use crate::ids::DeviceId;

/// Events produced by a running discovery session.
///
/// Duplicates are not suppressed here; consumers coalesce them through the
/// device registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DiscoveryEvent {
    PeerFound(DiscoveredPeer),
    /// Full service instance name of the peer that went away.
    PeerLost { name: String },
    /// Terminal. Emitted once when discovery stops.
    Stopped,
    Error(String),
}

impl DiscoveryEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DiscoveryEvent::Stopped)
    }
}

/// Why a control session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DisconnectReason {
    /// Local `disconnect()` call.
    Local,
    /// Peer sent `disconnect`.
    Remote,
    /// Peer closed the socket.
    Eof,
    /// No inbound traffic within the read timeout.
    HeartbeatTimeout,
    /// Too many consecutive malformed frames.
    ProtocolViolation,
    /// A frame failed authentication.
    CryptoFailure,
    Io,
}

/// Out-of-band notifications from a transport, next to the message stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    Connected {
        device_id: DeviceId,
    },
    /// Peer identified itself with `hello`.
    PeerHello {
        device_id: DeviceId,
        device_name: String,
        device_type: DeviceType,
    },
    Disconnected {
        device_id: DeviceId,
        reason: DisconnectReason,
    },
    /// First frame opened with the session key: the peer holds the key.
    Authenticated {
        device_id: DeviceId,
    },
    /// A frame could not be decrypted. `authenticated` tells whether this
    /// session had already opened a frame with the same key.
    CryptoFailure {
        device_id: DeviceId,
        error: String,
        authenticated: bool,
    },
}
