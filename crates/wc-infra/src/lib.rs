//! # wc-infra
//!
//! Infrastructure implementations of the `wc-core` ports: X25519 key
//! agreement with AES-256-GCM session ciphers, the local identity key store
//! and the device registry stores.

pub mod device_identity;
pub mod registry;
pub mod security;

pub use device_identity::LocalDeviceIdentity;
pub use registry::{FileDeviceRegistry, InMemoryDeviceRegistry};
pub use security::{FileKeyStore, IdentityKeyPair, SessionKey, X25519KeyAgreement};
