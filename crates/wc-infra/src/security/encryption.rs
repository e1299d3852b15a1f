//! X25519 key agreement and AES-256-GCM session ciphers.
//!
//! Session key = SHA-256(label ‖ X25519(local_secret, peer_public)). The raw
//! Diffie-Hellman output is never used as a key.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng},
    Aes256Gcm, Key, Nonce,
};
use sha2::{Digest, Sha256};
use wc_core::error::CryptoError;
use wc_core::ids::DeviceId;
use wc_core::ports::{KeyAgreementPort, SessionCipher};
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroizing;

/// Domain-separation label hashed in front of the shared secret.
const SESSION_KEY_LABEL: &[u8] = b"winux-connect/session-key/v1";

pub const NONCE_LEN: usize = 12;
pub const PUBLIC_KEY_LEN: usize = 32;

/// Local static X25519 key pair. The secret is zeroized on drop.
#[derive(Clone)]
pub struct IdentityKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl IdentityKeyPair {
    pub fn generate() -> Self {
        Self::from_secret(StaticSecret::random())
    }

    pub fn from_secret_bytes(bytes: [u8; 32]) -> Self {
        Self::from_secret(StaticSecret::from(bytes))
    }

    fn from_secret(secret: StaticSecret) -> Self {
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    pub fn public_key(&self) -> [u8; PUBLIC_KEY_LEN] {
        self.public.to_bytes()
    }

    pub(crate) fn secret_bytes(&self) -> Zeroizing<[u8; 32]> {
        Zeroizing::new(self.secret.to_bytes())
    }

    /// Agree with `peer_public_key` and derive the 32-byte session key.
    pub fn agree(&self, peer_public_key: &[u8]) -> Result<SessionKey, CryptoError> {
        let peer: [u8; PUBLIC_KEY_LEN] = peer_public_key.try_into().map_err(|_| {
            CryptoError::InvalidPublicKey(format!(
                "expected {PUBLIC_KEY_LEN} bytes, got {}",
                peer_public_key.len()
            ))
        })?;
        let shared = self.secret.diffie_hellman(&PublicKey::from(peer));
        if !shared.was_contributory() {
            return Err(CryptoError::WeakSharedSecret);
        }

        let mut hasher = Sha256::new();
        hasher.update(SESSION_KEY_LABEL);
        hasher.update(shared.as_bytes());
        let mut key = Zeroizing::new([0u8; 32]);
        key.copy_from_slice(&hasher.finalize());
        Ok(SessionKey::from_bytes(&key))
    }
}

impl std::fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public", &self.public.as_bytes())
            .field("secret", &"[redacted]")
            .finish()
    }
}

/// AES-256-GCM cipher for one paired device.
pub struct SessionKey {
    cipher: Aes256Gcm,
    /// First bytes of SHA-256(key), for log correlation only.
    fingerprint: [u8; 4],
}

impl SessionKey {
    pub fn from_bytes(key: &[u8; 32]) -> Self {
        let digest = Sha256::digest(key);
        let mut fingerprint = [0u8; 4];
        fingerprint.copy_from_slice(&digest[..4]);
        Self {
            cipher: Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(key)),
            fingerprint,
        }
    }

    pub fn fingerprint(&self) -> String {
        self.fingerprint.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl SessionCipher for SessionKey {
    fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);
        let ciphertext = self
            .cipher
            .encrypt(&nonce, plaintext)
            .map_err(|_| CryptoError::Encryption)?;
        Ok([nonce.as_slice(), &ciphertext].concat())
    }

    fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if data.len() < NONCE_LEN {
            return Err(CryptoError::CiphertextTooShort(data.len()));
        }
        let (nonce, ciphertext) = data.split_at(NONCE_LEN);
        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::Decryption)
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionKey")
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}

/// [`KeyAgreementPort`] backed by a static X25519 identity and an in-memory
/// per-device session cache.
#[derive(Default)]
pub struct X25519KeyAgreement {
    identity: RwLock<Option<IdentityKeyPair>>,
    sessions: RwLock<HashMap<DeviceId, Arc<dyn SessionCipher>>>,
}

impl X25519KeyAgreement {
    pub fn new(identity: IdentityKeyPair) -> Self {
        Self {
            identity: RwLock::new(Some(identity)),
            sessions: RwLock::new(HashMap::new()),
        }
    }

    /// Replace the local key pair with a fresh one and return its public key.
    ///
    /// Cached session keys belong to the old identity and are dropped.
    pub fn generate_keypair(&self) -> Result<Vec<u8>, CryptoError> {
        let pair = IdentityKeyPair::generate();
        let public = pair.public_key().to_vec();
        *self
            .identity
            .write()
            .map_err(|_| CryptoError::KeyGeneration("identity lock poisoned".into()))? = Some(pair);
        self.sessions_mut().clear();
        Ok(public)
    }

    fn with_identity<T>(
        &self,
        f: impl FnOnce(&IdentityKeyPair) -> Result<T, CryptoError>,
    ) -> Result<T, CryptoError> {
        let guard = self
            .identity
            .read()
            .map_err(|_| CryptoError::KeyStore("identity lock poisoned".into()))?;
        match guard.as_ref() {
            Some(pair) => f(pair),
            None => Err(CryptoError::NoKeyPair),
        }
    }

    fn sessions_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<DeviceId, Arc<dyn SessionCipher>>> {
        self.sessions.write().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyAgreementPort for X25519KeyAgreement {
    fn public_key(&self) -> Result<Vec<u8>, CryptoError> {
        self.with_identity(|pair| Ok(pair.public_key().to_vec()))
    }

    fn derive_session_key(
        &self,
        peer_public_key: &[u8],
    ) -> Result<Arc<dyn SessionCipher>, CryptoError> {
        let key = self.with_identity(|pair| pair.agree(peer_public_key))?;
        tracing::debug!(fingerprint = %key.fingerprint(), "derived session key");
        Ok(Arc::new(key))
    }

    fn cache_session(&self, device_id: &DeviceId, cipher: Arc<dyn SessionCipher>) {
        self.sessions_mut().insert(device_id.clone(), cipher);
    }

    fn session_for(&self, device_id: &DeviceId) -> Option<Arc<dyn SessionCipher>> {
        self.sessions
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(device_id)
            .cloned()
    }

    fn forget(&self, device_id: &DeviceId) {
        if self.sessions_mut().remove(device_id).is_some() {
            tracing::debug!(device_id = %device_id, "dropped cached session key");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair_of_agreements() -> (X25519KeyAgreement, X25519KeyAgreement) {
        (
            X25519KeyAgreement::new(IdentityKeyPair::generate()),
            X25519KeyAgreement::new(IdentityKeyPair::generate()),
        )
    }

    #[test]
    fn both_sides_derive_the_same_key() {
        let (alice, bob) = pair_of_agreements();
        let a = alice
            .derive_session_key(&bob.public_key().unwrap())
            .unwrap();
        let b = bob
            .derive_session_key(&alice.public_key().unwrap())
            .unwrap();

        let sealed = a.encrypt(b"hello from alice").unwrap();
        assert_eq!(b.decrypt(&sealed).unwrap(), b"hello from alice");
    }

    #[test]
    fn session_key_is_hashed_not_raw_dh() {
        let alice = IdentityKeyPair::generate();
        let bob = IdentityKeyPair::generate();
        let raw = alice
            .secret
            .diffie_hellman(&PublicKey::from(bob.public_key()));

        // A cipher keyed with the raw DH output must not open our frames.
        let raw_key = SessionKey::from_bytes(raw.as_bytes());
        let derived = alice.agree(&bob.public_key()).unwrap();
        let sealed = derived.encrypt(b"x").unwrap();
        assert_eq!(raw_key.decrypt(&sealed), Err(CryptoError::Decryption));
    }

    #[test]
    fn round_trip_and_layout() {
        let key = SessionKey::from_bytes(&[7u8; 32]);
        for plaintext in [&b""[..], b"a", &[0u8; 4096][..]] {
            let sealed = key.encrypt(plaintext).unwrap();
            assert_eq!(sealed.len(), NONCE_LEN + plaintext.len() + 16);
            assert_eq!(key.decrypt(&sealed).unwrap(), plaintext);
        }
    }

    #[test]
    fn nonces_are_fresh() {
        let key = SessionKey::from_bytes(&[7u8; 32]);
        let a = key.encrypt(b"same").unwrap();
        let b = key.encrypt(b"same").unwrap();
        assert_ne!(a[..NONCE_LEN], b[..NONCE_LEN]);
    }

    #[test]
    fn wrong_key_and_tampering_fail_with_crypto_error() {
        let key = SessionKey::from_bytes(&[1u8; 32]);
        let other = SessionKey::from_bytes(&[2u8; 32]);
        let mut sealed = key.encrypt(b"secret").unwrap();
        assert_eq!(other.decrypt(&sealed), Err(CryptoError::Decryption));

        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert_eq!(key.decrypt(&sealed), Err(CryptoError::Decryption));
        assert_eq!(
            key.decrypt(&[0u8; 5]),
            Err(CryptoError::CiphertextTooShort(5))
        );
    }

    #[test]
    fn malformed_and_low_order_peer_keys_are_rejected() {
        let pair = IdentityKeyPair::generate();
        assert!(matches!(
            pair.agree(&[9u8; 31]),
            Err(CryptoError::InvalidPublicKey(_))
        ));
        assert_eq!(
            pair.agree(&[0u8; 32]).unwrap_err(),
            CryptoError::WeakSharedSecret
        );
    }

    #[test]
    fn public_key_without_identity_is_no_key_pair() {
        let agreement = X25519KeyAgreement::default();
        assert_eq!(agreement.public_key(), Err(CryptoError::NoKeyPair));
        let public = agreement.generate_keypair().unwrap();
        assert_eq!(agreement.public_key().unwrap(), public);
    }

    #[test]
    fn cache_forget_round() {
        let (alice, bob) = pair_of_agreements();
        let id = DeviceId::from("bob");
        let cipher = alice
            .derive_session_key(&bob.public_key().unwrap())
            .unwrap();
        alice.cache_session(&id, cipher);
        assert!(alice.session_for(&id).is_some());
        alice.forget(&id);
        assert!(alice.session_for(&id).is_none());
    }

    #[test]
    fn debug_output_redacts_secrets() {
        let pair = IdentityKeyPair::from_secret_bytes([0xAB; 32]);
        let rendered = format!("{pair:?}");
        assert!(rendered.contains("[redacted]"));
        assert!(!rendered.contains("171, 171"));
    }
}
