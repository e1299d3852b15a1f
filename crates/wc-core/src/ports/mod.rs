//! Port interfaces for the application layer
//!
//! Ports define the contract between the orchestration code in `wc-app` and
//! the infrastructure/platform implementations. Collaborators outside the
//! protocol (notification daemon, clipboard, media player, command executor,
//! battery source) are reached only through these traits.

pub mod collaborators;
pub mod device_registry;
pub mod errors;
pub mod security;

pub use collaborators::{
    BatteryPort, ClipboardPort, MediaControlPort, NotificationPort, RemoteCommand,
    RemoteCommandPort,
};
pub use device_registry::DeviceRegistryPort;
pub use errors::DeviceRegistryError;
pub use security::{KeyAgreementPort, SessionCipher};
