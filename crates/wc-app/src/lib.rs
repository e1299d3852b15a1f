//! # wc-app
//!
//! Orchestration layer of Winux Connect. Drives `wc-network` sessions and the
//! pure pairing machine from `wc-core`, and reaches platform collaborators
//! only through the `wc-core` ports.

pub mod app;
pub mod connection;
pub mod discovery;
pub mod events;
pub mod file_transfer;
pub mod pairing;
pub mod router;

pub use app::{AppDeps, ConnectApp};
pub use connection::ConnectionManager;
pub use discovery::DiscoveryRegistrar;
pub use events::{ConnectionEvent, InboundMessage, PairingUpdate, TransferUpdate};
pub use file_transfer::{FileTransferService, TransferSettings};
pub use pairing::PairingOrchestrator;
pub use router::{Collaborators, FeatureSettings, MessageRouter};
