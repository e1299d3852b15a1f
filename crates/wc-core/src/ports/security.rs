use std::sync::Arc;

use crate::error::CryptoError;
use crate::ids::DeviceId;

/// Symmetric AEAD bound to one paired device.
///
/// Ciphertext layout is `nonce(12) ‖ ciphertext ‖ tag(16)`.
pub trait SessionCipher: Send + Sync {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError>;

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError>;
}

/// Local static key pair plus the per-device session key cache.
pub trait KeyAgreementPort: Send + Sync {
    /// Raw 32-byte local public key.
    fn public_key(&self) -> Result<Vec<u8>, CryptoError>;

    /// Agree with `peer_public_key` and hash the shared secret into a
    /// session key. Does not cache.
    fn derive_session_key(
        &self,
        peer_public_key: &[u8],
    ) -> Result<Arc<dyn SessionCipher>, CryptoError>;

    fn cache_session(&self, device_id: &DeviceId, cipher: Arc<dyn SessionCipher>);

    fn session_for(&self, device_id: &DeviceId) -> Option<Arc<dyn SessionCipher>>;

    fn forget(&self, device_id: &DeviceId);
}
