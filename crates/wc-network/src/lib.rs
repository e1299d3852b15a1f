//! # wc-network
//!
//! Wire-level I/O for Winux Connect.
//!
//! - [`framing`]: newline-delimited JSON, Base64 AEAD frames once paired
//! - [`transport`]: one control session per device (read, write and heartbeat loops)
//! - [`discovery`]: DNS-SD advertise and browse over mDNS
//! - [`transfer`]: file-transfer preamble and byte streaming

pub mod discovery;
pub mod framing;
pub mod transfer;
pub mod transport;

pub use discovery::{DiscoveryService, DiscoveryStream};
pub use transfer::{TransferListener, TransferPreamble};
pub use transport::{read_peer_hello, ControlListener, ReceivedMessage, Transport, TransportConfig};
