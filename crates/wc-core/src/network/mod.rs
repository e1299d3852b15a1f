//! Control-channel protocol types.

pub mod events;
pub mod message;
pub mod payload;
pub mod state;

pub use events::{DisconnectReason, DiscoveryEvent, TransportEvent};
pub use message::{MessageType, WinuxMessage};
pub use payload::*;
pub use state::ConnectionState;

/// Default TCP port of the control channel.
pub const DEFAULT_CONTROL_PORT: u16 = 51820;

/// Default TCP port of the file-transfer channel.
pub const DEFAULT_TRANSFER_PORT: u16 = 51821;

/// DNS-SD service type advertised and browsed for.
pub const SERVICE_TYPE: &str = "_winux-connect._tcp.local.";
