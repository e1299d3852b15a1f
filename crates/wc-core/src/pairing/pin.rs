//! Pairing PIN generation and the bitwise PIN check.
//!
//! The PIN never crosses the wire. Both sides prove they know it one bit per
//! round: each commits to `SHA-256(label, role, round, keys, nonce, bit)`, and
//! a nonce is only revealed once the peer's commitment for that round is in.
//! A man in the middle has to commit to every bit before seeing it, so a
//! captured exchange gives nothing to brute-force offline.

use rand::Rng;
use sha2::{Digest, Sha256};
use subtle::ConstantTimeEq;

use crate::error::PairingError;
use crate::pairing::state_machine::PairingRole;

/// Number of digits in a pairing PIN.
pub const PIN_LENGTH: usize = 6;

/// One round per PIN bit; 10^6 < 2^20.
pub const PIN_ROUNDS: u8 = 20;

pub const NONCE_LEN: usize = 32;

const COMMIT_LABEL: &[u8] = b"winux-connect/pin-commit/v2";

/// Generate a uniformly random numeric PIN.
pub fn generate_pin() -> String {
    let mut rng = rand::rng();
    (0..PIN_LENGTH)
        .map(|_| char::from(b'0' + rng.random_range(0..10u8)))
        .collect()
}

/// Check that a user-entered PIN has the expected shape.
pub fn validate_pin(pin: &str) -> Result<(), PairingError> {
    if pin.len() != PIN_LENGTH {
        return Err(PairingError::InvalidPin(format!(
            "expected {PIN_LENGTH} digits, got {}",
            pin.len()
        )));
    }
    if !pin.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PairingError::InvalidPin("pin must be numeric".to_string()));
    }
    Ok(())
}

/// Bit `round` of the PIN read as a number. `None` for malformed PINs or
/// rounds past [`PIN_ROUNDS`].
pub fn pin_bit(pin: &str, round: u8) -> Option<bool> {
    if round >= PIN_ROUNDS || validate_pin(pin).is_err() {
        return None;
    }
    let value: u32 = pin.parse().ok()?;
    Some((value >> round) & 1 == 1)
}

pub fn generate_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill(&mut nonce[..]);
    nonce
}

/// Commitment of `role` to one PIN bit, bound to both public keys.
pub fn bit_commitment(
    role: PairingRole,
    round: u8,
    initiator_key: &[u8],
    responder_key: &[u8],
    nonce: &[u8],
    bit: bool,
) -> [u8; 32] {
    let role_tag: u8 = match role {
        PairingRole::Initiator => b'I',
        PairingRole::Responder => b'R',
    };
    let mut hasher = Sha256::new();
    hasher.update(COMMIT_LABEL);
    hasher.update([role_tag, round]);
    hasher.update((initiator_key.len() as u32).to_be_bytes());
    hasher.update(initiator_key);
    hasher.update((responder_key.len() as u32).to_be_bytes());
    hasher.update(responder_key);
    hasher.update(nonce);
    hasher.update([u8::from(bit)]);
    hasher.finalize().into()
}

/// Constant-time check that the revealed `nonce_hex` opens `commitment` for
/// the locally known bit.
pub fn verify_bit_commitment(
    commitment: &[u8; 32],
    role: PairingRole,
    round: u8,
    initiator_key: &[u8],
    responder_key: &[u8],
    nonce_hex: &str,
    bit: bool,
) -> bool {
    let Some(nonce) = decode_32(nonce_hex) else {
        return false;
    };
    let expected = bit_commitment(role, round, initiator_key, responder_key, &nonce, bit);
    bool::from(commitment[..].ct_eq(&expected[..]))
}

/// Hex-decode a commitment or nonce; anything but 32 bytes is rejected.
pub fn decode_32(encoded: &str) -> Option<[u8; 32]> {
    hex::decode(encoded).ok()?.try_into().ok()
}
