//! File-backed storage of the local identity secret.
//!
//! `identity.key` holds the Base64 of the 32-byte X25519 secret. Paired
//! devices store only our peer's public key, so losing this file forces every
//! device to re-pair.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine as _};
use wc_core::error::CryptoError;
use zeroize::Zeroizing;

use super::encryption::IdentityKeyPair;
use crate::device_identity::write_atomic;

pub struct FileKeyStore {
    path: PathBuf,
}

impl FileKeyStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Option<IdentityKeyPair>, CryptoError> {
        if !self.path.exists() {
            return Ok(None);
        }
        let encoded = Zeroizing::new(
            std::fs::read_to_string(&self.path)
                .map_err(|e| CryptoError::KeyStore(format!("read {}: {e}", self.path.display())))?,
        );
        let decoded = Zeroizing::new(
            STANDARD
                .decode(encoded.trim())
                .map_err(|e| CryptoError::KeyStore(format!("invalid key encoding: {e}")))?,
        );
        let bytes: [u8; 32] = decoded.as_slice().try_into().map_err(|_| {
            CryptoError::KeyStore(format!("identity key must be 32 bytes, got {}", decoded.len()))
        })?;
        let pair = IdentityKeyPair::from_secret_bytes(bytes);
        Ok(Some(pair))
    }

    pub fn save(&self, pair: &IdentityKeyPair) -> Result<(), CryptoError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| CryptoError::KeyStore(format!("create {}: {e}", parent.display())))?;
        }
        let encoded = Zeroizing::new(STANDARD.encode(pair.secret_bytes().as_slice()));
        write_atomic(&self.path, encoded.as_bytes())
            .map_err(|e| CryptoError::KeyStore(format!("{e:#}")))?;
        restrict_permissions(&self.path);
        Ok(())
    }

    /// Load the stored identity, generating and saving one on first run.
    pub fn load_or_create(&self) -> Result<IdentityKeyPair, CryptoError> {
        if let Some(pair) = self.load()? {
            return Ok(pair);
        }
        let pair = IdentityKeyPair::generate();
        self.save(&pair)?;
        tracing::info!(path = %self.path.display(), "generated new identity key");
        Ok(pair)
    }
}

#[cfg(unix)]
fn restrict_permissions(path: &Path) {
    use std::os::unix::fs::PermissionsExt;
    if let Err(err) = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600)) {
        tracing::warn!(error = %err, path = %path.display(), "could not restrict identity key permissions");
    }
}

#[cfg(not(unix))]
fn restrict_permissions(_path: &Path) {}
