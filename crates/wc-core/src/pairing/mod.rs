//! Device pairing: PIN handling, pairing URI and the pairing state machine.

pub mod pin;
pub mod state_machine;
pub mod uri;

pub use pin::{generate_pin, validate_pin, PIN_LENGTH, PIN_ROUNDS};
pub use state_machine::{
    peer_reason, FailureReason, PairingAction, PairingEvent, PairingPeer, PairingPolicy,
    PairingRole, PairingState, PairingStateMachine, SessionId, PAIRING_TIMEOUT_SECS,
};
pub use uri::{PairingUri, PAIRING_URI_SCHEME};
