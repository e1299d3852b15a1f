//! Pairing protocol state machine
//!
//! 这个模块实现了设备配对的显式状态机。状态转换是纯函数
//! `(state, event) -> (new_state, actions[])`,所有副作用(发送消息、定时器、
//! 持久化)都以 [`PairingAction`] 的形式交给 orchestrator 执行。
//!
//! # Flow / 流程
//!
//! ```text
//! Initiator                                   Responder
//! Idle                                        Idle / WaitingForConnection
//!  │ StartPairing ── pair_request(key) ──────▶ RecvRequest (shows PIN)
//! SendingRequest                              WaitingForConfirmation
//!  │ ◀──────────── pair_response(key) ────────┘
//! WaitingForConfirmation (user enters PIN)
//!  │ SubmitPin ── pair_confirm(0, commitment) ─▶ RecvConfirm
//! VerifyingPin ◀─ pair_confirm(0, commitment) ── VerifyingPin
//!  │ ─────────── pair_confirm(0, nonce) ───────▶ checks bit 0
//!  │ ◀────────── pair_confirm(0, nonce) ────────┘
//!  │   ... one round per PIN bit ...
//!  │ ─────────── pair_confirm(19, nonce) ──────▶ checks bit 19 ── Persist
//!  │ ◀─ pair_confirm(19, nonce, accepted) ───── PersistOk ── Paired
//!  │ checks bit 19 ── Persist ── PersistOk
//! Paired
//! ```
//!
//! Neither side opens a round before the peer has committed to it, see
//! [`crate::pairing::pin`].
//!
//! Any waiting state may end in `Failed(reason)` (timeout, rejection, PIN
//! mismatch, crypto or persistence error). `Cancel` is legal everywhere and
//! returns to `Idle`.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::device::LocalDevice;
use crate::ids::DeviceId;
use crate::network::message::WinuxMessage;
use crate::network::payload::{
    MessagePayload, PairConfirmPayload, PairRequestPayload, PairResponsePayload,
};
use crate::pairing::pin::{
    bit_commitment, decode_32, generate_nonce, pin_bit, verify_bit_commitment, PIN_ROUNDS,
};
use crate::pairing::uri::PairingUri;

/// 配对会话的唯一标识符
pub type SessionId = String;

/// Default time allowed for each waiting state.
pub const PAIRING_TIMEOUT_SECS: i64 = 30;

/// Reason strings carried in negative `pair_response` / `pair_confirm`.
pub mod peer_reason {
    pub const BUSY: &str = "busy";
    pub const REJECTED: &str = "rejected";
    pub const CANCELLED: &str = "cancelled";
    pub const PIN_MISMATCH: &str = "pin_mismatch";
    pub const KEY_MISMATCH: &str = "key_mismatch";
    pub const TIMEOUT: &str = "timeout";
    pub const PERSISTENCE: &str = "persistence";
    pub const INVALID_KEY: &str = "invalid_key";
}

/// 配对中的角色
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingRole {
    /// 发起方
    Initiator,
    /// 响应方
    Responder,
}

impl PairingRole {
    pub fn peer(self) -> Self {
        match self {
            PairingRole::Initiator => PairingRole::Responder,
            PairingRole::Responder => PairingRole::Initiator,
        }
    }
}

/// 配对状态
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PairingState {
    Idle,
    /// Responder advertising itself (QR shown), waiting for a request.
    WaitingForConnection,
    /// Initiator sent `pair_request`, waiting for the peer key.
    SendingRequest,
    /// Keys exchanged; waiting for the PIN (initiator) or the proof (responder).
    WaitingForConfirmation,
    /// PIN check rounds running; persistence happens here.
    VerifyingPin,
    /// 配对成功 (终态)
    Paired,
    /// 配对失败 (终态)
    Failed(FailureReason),
}

impl PairingState {
    /// An attempt is running and holds key material.
    pub fn is_in_flight(&self) -> bool {
        matches!(
            self,
            PairingState::SendingRequest
                | PairingState::WaitingForConfirmation
                | PairingState::VerifyingPin
        )
    }

    /// A new attempt may start from here.
    pub fn accepts_new_attempt(&self) -> bool {
        !self.is_in_flight()
    }
}

/// 失败原因 (可审计)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FailureReason {
    Timeout,
    /// Rejected by the local user or the peer.
    Rejected(String),
    PinMismatch,
    /// Key received differs from the one in the scanned pairing URI.
    KeyMismatch,
    PeerBusy,
    CancelledByPeer,
    Crypto(String),
    Persistence(String),
    Transport(String),
    UnexpectedMessage(String),
}

impl FailureReason {
    /// Map a negative verdict received from the peer.
    pub fn from_peer_reason(reason: Option<&str>) -> Self {
        match reason.unwrap_or(peer_reason::REJECTED) {
            peer_reason::BUSY => FailureReason::PeerBusy,
            peer_reason::PIN_MISMATCH => FailureReason::PinMismatch,
            peer_reason::KEY_MISMATCH => FailureReason::KeyMismatch,
            peer_reason::CANCELLED => FailureReason::CancelledByPeer,
            peer_reason::TIMEOUT => FailureReason::Timeout,
            peer_reason::PERSISTENCE => FailureReason::Persistence("peer".to_string()),
            peer_reason::INVALID_KEY => FailureReason::Crypto("peer rejected our key".to_string()),
            other => FailureReason::Rejected(other.to_string()),
        }
    }
}

impl std::fmt::Display for FailureReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureReason::Timeout => write!(f, "timed out"),
            FailureReason::Rejected(by) => write!(f, "rejected ({by})"),
            FailureReason::PinMismatch => write!(f, "pin mismatch"),
            FailureReason::KeyMismatch => write!(f, "public key mismatch"),
            FailureReason::PeerBusy => write!(f, "peer busy"),
            FailureReason::CancelledByPeer => write!(f, "cancelled by peer"),
            FailureReason::Crypto(e) => write!(f, "crypto error: {e}"),
            FailureReason::Persistence(e) => write!(f, "persistence error: {e}"),
            FailureReason::Transport(e) => write!(f, "transport error: {e}"),
            FailureReason::UnexpectedMessage(e) => write!(f, "unexpected message: {e}"),
        }
    }
}

/// Target of an initiator attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingPeer {
    pub device_id: DeviceId,
    pub device_name: String,
}

/// 触发状态转换的事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PairingEvent {
    /// Responder: start advertising a PIN (e.g. QR code) and wait.
    AwaitConnection { pin: String },
    /// Initiator: begin pairing with `peer`. `preset` comes from a scanned URI.
    StartPairing {
        peer: PairingPeer,
        preset: Option<PairingUri>,
    },
    /// Responder: unsolicited request. `pin` is used unless one is already shown.
    RecvRequest {
        request: PairRequestPayload,
        pin: String,
    },
    RecvResponse(PairResponsePayload),
    RecvConfirm(PairConfirmPayload),
    /// Initiator: PIN typed by the user.
    SubmitPin(String),
    UserReject,
    Cancel,
    Timeout { session_id: SessionId },
    TransportError(String),
    PersistOk,
    PersistErr(String),
}

/// 状态转换产生的动作
#[derive(Debug, Clone, PartialEq)]
pub enum PairingAction {
    /// Send a message to the attempt's peer.
    Send(WinuxMessage),
    StartTimer {
        session_id: SessionId,
        deadline: DateTime<Utc>,
    },
    CancelTimer {
        session_id: SessionId,
    },
    /// Responder: display the PIN and the pairing URI.
    ShowPin { pin: String, uri: String },
    /// Initiator: ask the user for the PIN shown on the peer.
    RequestPin { peer_name: String },
    /// Derive the session key and write the paired device in one step.
    Persist {
        device_id: DeviceId,
        peer_public_key: Vec<u8>,
    },
    /// Drop any derived but unpersisted key material.
    DiscardKeyMaterial,
    /// 记录状态转换日志 (用于审计)
    LogTransition {
        session_id: SessionId,
        old_state: String,
        event: String,
        new_state: String,
    },
    EmitResult {
        session_id: SessionId,
        device_id: Option<DeviceId>,
        success: bool,
        error: Option<String>,
    },
}

/// 配对策略配置
#[derive(Debug, Clone)]
pub struct PairingPolicy {
    pub step_timeout_secs: i64,
}

impl Default for PairingPolicy {
    fn default() -> Self {
        Self {
            step_timeout_secs: PAIRING_TIMEOUT_SECS,
        }
    }
}

/// 配对流程的上下文信息
#[derive(Debug, Clone, Default)]
struct PairingContext {
    session_id: Option<SessionId>,
    role: Option<PairingRole>,
    peer_device_id: Option<DeviceId>,
    peer_name: Option<String>,
    peer_public_key: Option<Vec<u8>>,
    /// Responder: PIN shown to the user. Initiator: PIN preset from a URI.
    pin: Option<String>,
    /// Initiator: key expected from a scanned URI.
    expected_peer_key: Option<Vec<u8>>,
    /// PIN check round in progress.
    round: u8,
    /// Our nonce for `round`, opened once the peer has committed.
    round_nonce: Option<[u8; 32]>,
    peer_commitment: Option<[u8; 32]>,
}

/// 配对状态机
#[derive(Debug, Clone)]
pub struct PairingStateMachine {
    state: PairingState,
    context: PairingContext,
    local: LocalDevice,
    local_public_key: Vec<u8>,
    policy: PairingPolicy,
}

type Transition = (PairingState, Vec<PairingAction>);

impl PairingStateMachine {
    pub fn new(local: LocalDevice, local_public_key: Vec<u8>) -> Self {
        Self::with_policy(local, local_public_key, PairingPolicy::default())
    }

    pub fn with_policy(local: LocalDevice, local_public_key: Vec<u8>, policy: PairingPolicy) -> Self {
        Self {
            state: PairingState::Idle,
            context: PairingContext::default(),
            local,
            local_public_key,
            policy,
        }
    }

    pub fn state(&self) -> &PairingState {
        &self.state
    }

    pub fn role(&self) -> Option<PairingRole> {
        self.context.role
    }

    pub fn session_id(&self) -> Option<&str> {
        self.context.session_id.as_deref()
    }

    pub fn peer_device_id(&self) -> Option<&DeviceId> {
        self.context.peer_device_id.as_ref()
    }

    /// 处理事件并返回新状态和动作列表
    pub fn handle_event(&mut self, event: PairingEvent, now: DateTime<Utc>) -> Transition {
        let old_state = self.state.clone();
        let event_debug = describe_event(&event);

        let (new_state, actions) = self.transition(event, now);

        #[cfg(feature = "tracing")]
        tracing::debug!(
            session_id = self.context.session_id.as_deref().unwrap_or(""),
            old_state = ?old_state,
            event = %event_debug,
            new_state = ?new_state,
            "pairing transition"
        );

        let mut all_actions = vec![PairingAction::LogTransition {
            session_id: self.context.session_id.clone().unwrap_or_default(),
            old_state: format!("{:?}", old_state),
            event: event_debug,
            new_state: format!("{:?}", new_state),
        }];
        all_actions.extend(actions);

        if !new_state.is_in_flight() && new_state != PairingState::WaitingForConnection {
            // Key material never outlives the attempt.
            self.context.peer_public_key = None;
            self.context.pin = None;
            self.context.expected_peer_key = None;
            self.context.round_nonce = None;
            self.context.peer_commitment = None;
        }
        self.state = new_state.clone();
        (new_state, all_actions)
    }

    fn transition(&mut self, event: PairingEvent, now: DateTime<Utc>) -> Transition {
        match (self.state.clone(), event) {
            (_, PairingEvent::Cancel) => self.cancel(),

            (state, PairingEvent::AwaitConnection { pin }) if state.accepts_new_attempt() => {
                self.reset(PairingRole::Responder);
                self.context.pin = Some(pin.clone());
                let session_id = self.current_session();
                let uri = self.pairing_uri(&pin);
                (
                    PairingState::WaitingForConnection,
                    vec![
                        PairingAction::ShowPin { pin, uri },
                        self.start_timer(&session_id, now),
                    ],
                )
            }

            (state, PairingEvent::StartPairing { peer, preset }) if state.accepts_new_attempt() => {
                self.reset(PairingRole::Initiator);
                self.context.peer_device_id = Some(peer.device_id);
                self.context.peer_name = Some(peer.device_name);
                if let Some(preset) = preset {
                    self.context.pin = Some(preset.pin);
                    self.context.expected_peer_key = Some(preset.public_key);
                }
                let session_id = self.current_session();
                let request = PairRequestPayload {
                    device_id: self.local.id.clone(),
                    device_name: self.local.name.clone(),
                    device_type: self.local.device_type,
                    public_key: STANDARD.encode(&self.local_public_key),
                };
                match request.into_message() {
                    Ok(message) => (
                        PairingState::SendingRequest,
                        vec![
                            PairingAction::Send(message),
                            self.start_timer(&session_id, now),
                        ],
                    ),
                    Err(err) => self.fail(FailureReason::UnexpectedMessage(err.to_string()), None),
                }
            }

            (state, PairingEvent::RecvRequest { request, pin })
                if state.accepts_new_attempt() =>
            {
                let preset_pin = match state {
                    PairingState::WaitingForConnection => self.context.pin.clone(),
                    _ => None,
                };
                let old_session = self.context.session_id.clone();
                self.reset(PairingRole::Responder);
                self.context.peer_device_id = Some(request.device_id.clone());
                self.context.peer_name = Some(request.device_name.clone());

                let peer_key = match decode_key(&request.public_key) {
                    Ok(key) => key,
                    Err(reason) => {
                        return self.fail(
                            FailureReason::Crypto(reason),
                            Some(peer_reason::INVALID_KEY),
                        )
                    }
                };
                self.context.peer_public_key = Some(peer_key);
                let pin = preset_pin.unwrap_or(pin);
                self.context.pin = Some(pin.clone());

                let session_id = self.current_session();
                let response = PairResponsePayload {
                    accepted: true,
                    device_id: self.local.id.clone(),
                    device_name: self.local.name.clone(),
                    device_type: self.local.device_type,
                    public_key: Some(STANDARD.encode(&self.local_public_key)),
                    reason: None,
                };
                let message = match response.into_message() {
                    Ok(message) => message,
                    Err(err) => {
                        return self.fail(FailureReason::UnexpectedMessage(err.to_string()), None)
                    }
                };
                let mut actions = Vec::new();
                if let Some(old) = old_session {
                    actions.push(PairingAction::CancelTimer { session_id: old });
                }
                let uri = self.pairing_uri(&pin);
                actions.push(PairingAction::Send(message));
                actions.push(PairingAction::ShowPin { pin, uri });
                actions.push(self.start_timer(&session_id, now));
                (PairingState::WaitingForConfirmation, actions)
            }

            (PairingState::SendingRequest, PairingEvent::RecvResponse(response)) => {
                if !response.accepted {
                    return self.fail(
                        FailureReason::from_peer_reason(response.reason.as_deref()),
                        None,
                    );
                }
                let peer_key = match response.public_key.as_deref().map(decode_key) {
                    Some(Ok(key)) => key,
                    Some(Err(reason)) => {
                        return self.fail(
                            FailureReason::Crypto(reason),
                            Some(peer_reason::INVALID_KEY),
                        )
                    }
                    None => {
                        return self.fail(
                            FailureReason::UnexpectedMessage("response without key".into()),
                            Some(peer_reason::INVALID_KEY),
                        )
                    }
                };
                if let Some(expected) = &self.context.expected_peer_key {
                    if expected != &peer_key {
                        return self.fail(FailureReason::KeyMismatch, Some(peer_reason::KEY_MISMATCH));
                    }
                }
                self.context.peer_public_key = Some(peer_key);
                if !response.device_name.is_empty() {
                    self.context.peer_name = Some(response.device_name);
                }

                let session_id = self.current_session();
                match self.context.pin.clone() {
                    Some(pin) => self.begin_pin_check(pin, now),
                    None => (
                        PairingState::WaitingForConfirmation,
                        vec![
                            PairingAction::RequestPin {
                                peer_name: self.context.peer_name.clone().unwrap_or_default(),
                            },
                            self.start_timer(&session_id, now),
                        ],
                    ),
                }
            }

            (PairingState::WaitingForConfirmation, PairingEvent::SubmitPin(pin))
                if self.context.role == Some(PairingRole::Initiator) =>
            {
                self.begin_pin_check(pin, now)
            }

            (state, PairingEvent::RecvConfirm(confirm))
                if state.is_in_flight() && confirm.accepted == Some(false) =>
            {
                self.fail(FailureReason::from_peer_reason(confirm.reason.as_deref()), None)
            }

            (PairingState::WaitingForConfirmation, PairingEvent::RecvConfirm(confirm))
                if self.context.role == Some(PairingRole::Responder) =>
            {
                self.responder_step(confirm, now)
            }

            (PairingState::VerifyingPin, PairingEvent::RecvConfirm(confirm)) => {
                match self.context.role {
                    Some(PairingRole::Responder) => self.responder_step(confirm, now),
                    Some(PairingRole::Initiator) => self.initiator_step(confirm, now),
                    None => self.out_of_order("no role"),
                }
            }

            (PairingState::VerifyingPin, PairingEvent::PersistOk) => {
                let session_id = self.current_session();
                let mut actions = vec![PairingAction::CancelTimer {
                    session_id: session_id.clone(),
                }];
                if self.context.role == Some(PairingRole::Responder) {
                    // Our last reveal travels with the verdict.
                    let verdict = PairConfirmPayload {
                        accepted: Some(true),
                        ..self.reveal()
                    };
                    match verdict.into_message() {
                        Ok(message) => actions.push(PairingAction::Send(message)),
                        Err(err) => {
                            return self
                                .fail(FailureReason::UnexpectedMessage(err.to_string()), None)
                        }
                    }
                }
                actions.push(PairingAction::EmitResult {
                    session_id,
                    device_id: self.context.peer_device_id.clone(),
                    success: true,
                    error: None,
                });
                (PairingState::Paired, actions)
            }

            (PairingState::VerifyingPin, PairingEvent::PersistErr(error)) => {
                self.fail(FailureReason::Persistence(error), Some(peer_reason::PERSISTENCE))
            }

            (state, PairingEvent::Timeout { session_id })
                if (state.is_in_flight() || state == PairingState::WaitingForConnection)
                    && self.context.session_id.as_deref() == Some(session_id.as_str()) =>
            {
                self.fail(FailureReason::Timeout, Some(peer_reason::TIMEOUT))
            }

            // Timer from an earlier attempt.
            (state, PairingEvent::Timeout { .. }) => (state, vec![]),

            (state, PairingEvent::UserReject)
                if state.is_in_flight() || state == PairingState::WaitingForConnection =>
            {
                self.fail(
                    FailureReason::Rejected("local".to_string()),
                    Some(peer_reason::REJECTED),
                )
            }

            (state, PairingEvent::TransportError(error)) if state.is_in_flight() => {
                self.fail(FailureReason::Transport(error), None)
            }

            (state, event) if state.is_in_flight() => self.fail(
                FailureReason::UnexpectedMessage(describe_event(&event)),
                Some(peer_reason::REJECTED),
            ),

            // Stale timers and stray messages outside an attempt are ignored.
            (state, _) => (state, vec![]),
        }
    }

    fn reset(&mut self, role: PairingRole) {
        self.context = PairingContext {
            session_id: Some(uuid::Uuid::new_v4().to_string()),
            role: Some(role),
            ..PairingContext::default()
        };
    }

    fn current_session(&self) -> SessionId {
        self.context.session_id.clone().unwrap_or_default()
    }

    fn start_timer(&self, session_id: &str, now: DateTime<Utc>) -> PairingAction {
        PairingAction::StartTimer {
            session_id: session_id.to_string(),
            deadline: now + Duration::seconds(self.policy.step_timeout_secs),
        }
    }

    fn pairing_uri(&self, pin: &str) -> String {
        PairingUri {
            pin: pin.to_string(),
            public_key: self.local_public_key.clone(),
            device_name: self.local.name.clone(),
            device_type: self.local.device_type,
        }
        .to_uri()
    }

    /// Initiator: keep the PIN and commit to its first bit.
    fn begin_pin_check(&mut self, pin: String, now: DateTime<Utc>) -> Transition {
        if self.context.peer_public_key.is_none() {
            return self.fail(
                FailureReason::UnexpectedMessage("pin submitted before key exchange".into()),
                None,
            );
        }
        self.context.pin = Some(pin);
        self.context.round = 0;
        self.commit_round(now)
    }

    fn commit_round(&mut self, now: DateTime<Utc>) -> Transition {
        let Some(commitment) = self.local_commitment() else {
            return self.missing_context();
        };
        self.send_step(
            PairConfirmPayload {
                round: Some(self.context.round),
                commitment: Some(hex::encode(commitment)),
                ..PairConfirmPayload::default()
            },
            now,
        )
    }

    fn responder_step(&mut self, confirm: PairConfirmPayload, now: DateTime<Utc>) -> Transition {
        if confirm.round != Some(self.context.round) {
            return self.out_of_order("wrong round");
        }
        match (confirm.commitment, confirm.nonce) {
            (Some(commitment), None) if self.context.peer_commitment.is_none() => {
                let Some(commitment) = decode_32(&commitment) else {
                    return self.out_of_order("malformed commitment");
                };
                self.context.peer_commitment = Some(commitment);
                self.commit_round(now)
            }
            (None, Some(nonce))
                if self.context.peer_commitment.is_some() && self.context.round_nonce.is_some() =>
            {
                if !self.peer_opens(&nonce) {
                    return self.fail(FailureReason::PinMismatch, Some(peer_reason::PIN_MISMATCH));
                }
                if self.context.round + 1 < PIN_ROUNDS {
                    let reveal = self.reveal();
                    self.next_round();
                    self.send_step(reveal, now)
                } else {
                    (PairingState::VerifyingPin, self.persist_actions())
                }
            }
            _ => self.out_of_order("unexpected step"),
        }
    }

    fn initiator_step(&mut self, confirm: PairConfirmPayload, now: DateTime<Utc>) -> Transition {
        if confirm.round != Some(self.context.round) {
            return self.out_of_order("wrong round");
        }
        let accepted = confirm.accepted;
        match (confirm.commitment, confirm.nonce) {
            (Some(commitment), None)
                if self.context.peer_commitment.is_none() && self.context.round_nonce.is_some() =>
            {
                let Some(commitment) = decode_32(&commitment) else {
                    return self.out_of_order("malformed commitment");
                };
                self.context.peer_commitment = Some(commitment);
                let reveal = self.reveal();
                self.send_step(reveal, now)
            }
            (None, Some(nonce)) if self.context.peer_commitment.is_some() => {
                if !self.peer_opens(&nonce) {
                    return self.fail(FailureReason::PinMismatch, Some(peer_reason::PIN_MISMATCH));
                }
                if self.context.round + 1 < PIN_ROUNDS {
                    self.next_round();
                    self.commit_round(now)
                } else if accepted == Some(true) {
                    (PairingState::VerifyingPin, self.persist_actions())
                } else {
                    self.out_of_order("last round without verdict")
                }
            }
            _ => self.out_of_order("unexpected step"),
        }
    }

    /// Draw this round's nonce and commit to our PIN bit with it.
    fn local_commitment(&mut self) -> Option<[u8; 32]> {
        let role = self.context.role?;
        let bit = pin_bit(self.context.pin.as_deref()?, self.context.round)?;
        let (initiator_key, responder_key) = self.keys_in_order()?;
        let nonce = generate_nonce();
        self.context.round_nonce = Some(nonce);
        Some(bit_commitment(
            role,
            self.context.round,
            &initiator_key,
            &responder_key,
            &nonce,
            bit,
        ))
    }

    /// Does `nonce_hex` open the peer's commitment for the bit we hold?
    fn peer_opens(&self, nonce_hex: &str) -> bool {
        let (Some(role), Some(commitment), Some(pin), Some((initiator_key, responder_key))) = (
            self.context.role,
            self.context.peer_commitment.as_ref(),
            self.context.pin.as_deref(),
            self.keys_in_order(),
        ) else {
            return false;
        };
        let Some(bit) = pin_bit(pin, self.context.round) else {
            return false;
        };
        verify_bit_commitment(
            commitment,
            role.peer(),
            self.context.round,
            &initiator_key,
            &responder_key,
            nonce_hex,
            bit,
        )
    }

    /// `(initiator_key, responder_key)` from our point of view.
    fn keys_in_order(&self) -> Option<(Vec<u8>, Vec<u8>)> {
        let peer = self.context.peer_public_key.clone()?;
        match self.context.role? {
            PairingRole::Initiator => Some((self.local_public_key.clone(), peer)),
            PairingRole::Responder => Some((peer, self.local_public_key.clone())),
        }
    }

    fn reveal(&self) -> PairConfirmPayload {
        PairConfirmPayload {
            round: Some(self.context.round),
            nonce: self.context.round_nonce.map(hex::encode),
            ..PairConfirmPayload::default()
        }
    }

    fn next_round(&mut self) {
        self.context.round += 1;
        self.context.round_nonce = None;
        self.context.peer_commitment = None;
    }

    fn send_step(&self, step: PairConfirmPayload, now: DateTime<Utc>) -> Transition {
        let session_id = self.current_session();
        match step.into_message() {
            Ok(message) => (
                PairingState::VerifyingPin,
                vec![
                    PairingAction::Send(message),
                    self.start_timer(&session_id, now),
                ],
            ),
            Err(err) => self.fail(FailureReason::UnexpectedMessage(err.to_string()), None),
        }
    }

    fn out_of_order(&self, what: &str) -> Transition {
        self.fail(
            FailureReason::UnexpectedMessage(format!("pin check out of order: {what}")),
            Some(peer_reason::REJECTED),
        )
    }

    fn missing_context(&self) -> Transition {
        self.fail(
            FailureReason::UnexpectedMessage("missing pairing context".into()),
            Some(peer_reason::REJECTED),
        )
    }

    fn persist_actions(&self) -> Vec<PairingAction> {
        match (
            self.context.peer_device_id.clone(),
            self.context.peer_public_key.clone(),
        ) {
            (Some(device_id), Some(peer_public_key)) => vec![PairingAction::Persist {
                device_id,
                peer_public_key,
            }],
            _ => vec![],
        }
    }

    fn cancel(&mut self) -> Transition {
        let mut actions = Vec::new();
        if let Some(session_id) = self.context.session_id.clone() {
            actions.push(PairingAction::CancelTimer {
                session_id: session_id.clone(),
            });
            if self.state.is_in_flight() && self.context.peer_device_id.is_some() {
                if let Some(message) = verdict_message(peer_reason::CANCELLED) {
                    actions.push(PairingAction::Send(message));
                }
            }
            if self.state.is_in_flight() || self.state == PairingState::WaitingForConnection {
                actions.push(PairingAction::DiscardKeyMaterial);
                actions.push(PairingAction::EmitResult {
                    session_id,
                    device_id: self.context.peer_device_id.clone(),
                    success: false,
                    error: Some("cancelled".to_string()),
                });
            }
        }
        self.context = PairingContext::default();
        (PairingState::Idle, actions)
    }

    /// Move to `Failed`, optionally telling the peer why.
    fn fail(&self, reason: FailureReason, notify_peer: Option<&str>) -> Transition {
        let session_id = self.current_session();
        let mut actions = vec![
            PairingAction::CancelTimer {
                session_id: session_id.clone(),
            },
            PairingAction::DiscardKeyMaterial,
        ];
        if let Some(peer_reason) = notify_peer {
            if self.context.peer_device_id.is_some() {
                if let Some(message) = verdict_message(peer_reason) {
                    actions.push(PairingAction::Send(message));
                }
            }
        }
        actions.push(PairingAction::EmitResult {
            session_id,
            device_id: self.context.peer_device_id.clone(),
            success: false,
            error: Some(reason.to_string()),
        });
        (PairingState::Failed(reason), actions)
    }
}

fn verdict_message(reason: &str) -> Option<WinuxMessage> {
    PairConfirmPayload {
        accepted: Some(false),
        reason: Some(reason.to_string()),
        ..PairConfirmPayload::default()
    }
    .into_message()
    .ok()
}

fn decode_key(encoded: &str) -> Result<Vec<u8>, String> {
    let key = STANDARD
        .decode(encoded)
        .map_err(|err| format!("invalid base64 key: {err}"))?;
    if key.len() != 32 {
        return Err(format!("public key must be 32 bytes, got {}", key.len()));
    }
    Ok(key)
}

/// Event description for the audit log; never includes PINs.
fn describe_event(event: &PairingEvent) -> String {
    match event {
        PairingEvent::AwaitConnection { .. } => "AwaitConnection".to_string(),
        PairingEvent::StartPairing { peer, preset } => format!(
            "StartPairing(peer={}, preset={})",
            peer.device_id,
            preset.is_some()
        ),
        PairingEvent::RecvRequest { request, .. } => {
            format!("RecvRequest(from={})", request.device_id)
        }
        PairingEvent::RecvResponse(response) => {
            format!("RecvResponse(accepted={})", response.accepted)
        }
        PairingEvent::RecvConfirm(confirm) => format!(
            "RecvConfirm(round={:?}, commitment={}, nonce={}, accepted={:?})",
            confirm.round,
            confirm.commitment.is_some(),
            confirm.nonce.is_some(),
            confirm.accepted
        ),
        PairingEvent::SubmitPin(_) => "SubmitPin".to_string(),
        PairingEvent::UserReject => "UserReject".to_string(),
        PairingEvent::Cancel => "Cancel".to_string(),
        PairingEvent::Timeout { .. } => "Timeout".to_string(),
        PairingEvent::TransportError(e) => format!("TransportError({e})"),
        PairingEvent::PersistOk => "PersistOk".to_string(),
        PairingEvent::PersistErr(e) => format!("PersistErr({e})"),
    }
}
