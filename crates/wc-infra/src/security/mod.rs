pub mod encryption;
pub mod key_store;

pub use encryption::{IdentityKeyPair, SessionKey, X25519KeyAgreement};
pub use key_store::FileKeyStore;
