//! Error taxonomy for the companion protocol.
//!
//! Every failure surfaced to callers falls into one of five families:
//! network, crypto, protocol, pairing or transfer. Remote input never
//! panics; it maps onto one of these.

use thiserror::Error;

use crate::ids::{DeviceId, TransferId};

/// Socket-level failures.
#[derive(Debug, Error)]
pub enum NetworkError {
    #[error("not connected")]
    NotConnected,

    #[error("connection to {address} failed: {reason}")]
    ConnectFailed { address: String, reason: String },

    #[error("connection timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("connection closed by peer")]
    Closed,

    #[error("bind on {address} failed: {reason}")]
    BindFailed { address: String, reason: String },

    #[error("discovery error: {0}")]
    Discovery(String),

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Key generation, agreement and AEAD failures.
///
/// Kept distinct from [`ProtocolError`] so callers can tell a tampered or
/// mis-keyed frame apart from a merely malformed one.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("no local key pair")]
    NoKeyPair,

    #[error("invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("key agreement produced a non-contributory secret")]
    WeakSharedSecret,

    #[error("no session key for device {0}")]
    NoSessionKey(DeviceId),

    #[error("encryption failed")]
    Encryption,

    #[error("decryption failed: authentication tag mismatch")]
    Decryption,

    #[error("ciphertext too short: {0} bytes")]
    CiphertextTooShort(usize),

    #[error("key storage error: {0}")]
    KeyStore(String),
}

/// Malformed or unexpected wire content.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("malformed json: {0}")]
    MalformedJson(String),

    #[error("missing field: {0}")]
    MissingField(&'static str),

    #[error("invalid payload for {message_type}: {reason}")]
    InvalidPayload {
        message_type: String,
        reason: String,
    },

    #[error("invalid base64 frame: {0}")]
    InvalidBase64(String),

    #[error("frame exceeds max: {len} > {max}")]
    FrameTooLarge { len: usize, max: usize },

    #[error("plaintext {0} received on an encrypted session")]
    UnexpectedPlaintext(String),

    #[error("unexpected message: {0}")]
    Unexpected(String),

    #[error("invalid pairing uri: {0}")]
    InvalidPairingUri(String),
}

/// Pairing-attempt failures surfaced to callers.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PairingError {
    #[error("a pairing attempt is already in progress")]
    Busy,

    #[error("no pairing attempt in progress")]
    NotInProgress,

    #[error("invalid pin: {0}")]
    InvalidPin(String),

    #[error("pairing failed: {0}")]
    Failed(String),

    #[error(transparent)]
    Crypto(#[from] CryptoError),
}

/// File-transfer failures.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("transfer {0} not found")]
    NotFound(TransferId),

    #[error("transfer {0} already finished")]
    AlreadyFinished(TransferId),

    #[error("transfer rejected: {0}")]
    Rejected(String),

    #[error("transfer cancelled")]
    Cancelled,

    #[error("stream closed after {received} of {expected} bytes")]
    Truncated { received: u64, expected: u64 },

    #[error("no data for {idle:?} after {received} bytes")]
    Stalled {
        received: u64,
        idle: std::time::Duration,
    },

    #[error("checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    #[error("invalid preamble: {0}")]
    InvalidPreamble(String),

    #[error("timed out waiting for peer response")]
    ResponseTimeout,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
}

/// Umbrella error spanning the whole taxonomy.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error(transparent)]
    Network(#[from] NetworkError),

    #[error(transparent)]
    Crypto(#[from] CryptoError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Pairing(#[from] PairingError),

    #[error(transparent)]
    Transfer(#[from] TransferError),
}
