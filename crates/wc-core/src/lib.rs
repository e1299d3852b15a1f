//! # wc-core
//!
//! Core domain models and protocol logic for Winux Connect.
//!
//! This crate contains pure logic without any I/O: message and payload types,
//! the pairing state machine, transfer records, clipboard history,
//! configuration DTOs and the port traits implemented by the outer crates.

pub mod clipboard;
pub mod config;
pub mod device;
pub mod error;
pub mod ids;
pub mod network;
pub mod pairing;
pub mod ports;
pub mod transfer;

// Re-export commonly used types at the crate root
pub use config::AppConfig;
pub use device::{Device, DeviceType, DiscoveredPeer, LocalDevice};
pub use error::{ConnectError, CryptoError, NetworkError, PairingError, ProtocolError, TransferError};
pub use ids::{DeviceId, MessageId, TransferId};
pub use network::{ConnectionState, MessageType, WinuxMessage};
pub use pairing::{PairingState, PairingStateMachine};
pub use transfer::{FileTransfer, TransferDirection, TransferState};
