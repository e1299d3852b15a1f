//! Pairing protocol orchestrator
//!
//! 这个模块负责编排配对状态机,将网络消息、用户输入和定时器事件转换为状态机事件,
//! 并执行状态机返回的动作。
//!
//! # Architecture / 架构
//!
//! ```text
//! pair_* messages / user input / timers
//!   ↓
//! PairingOrchestrator (converts events, one attempt at a time)
//!   ↓
//! PairingStateMachine (pure state transitions)
//!   ↓
//! PairingActions (send, timers, persist, UI updates)
//! ```
//!
//! Persisting is a single registry write (`mark_paired`). The derived session
//! key is cached and installed on the transport only after that write
//! succeeded. The initiator persists last, so it sends the first sealed frame
//! (its `capabilities`); the responder answers in kind from the router.

use std::collections::VecDeque;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::AbortHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use wc_core::error::PairingError;
use wc_core::network::{
    MessagePayload, MessageType, PairConfirmPayload, PairRequestPayload, PairResponsePayload,
    WinuxMessage,
};
use wc_core::pairing::{
    generate_pin, peer_reason, validate_pin, PairingAction, PairingEvent, PairingPeer,
    PairingPolicy, PairingRole, PairingState, PairingStateMachine, PairingUri, SessionId,
};
use wc_core::ports::{DeviceRegistryPort, KeyAgreementPort};
use wc_core::DeviceId;

use crate::connection::ConnectionManager;
use crate::events::PairingUpdate;

/// 配对编排器
///
/// Cheap to clone; all clones drive the same attempt.
#[derive(Clone)]
pub struct PairingOrchestrator {
    inner: Arc<Inner>,
}

struct Inner {
    machine: Mutex<PairingStateMachine>,
    connections: Arc<ConnectionManager>,
    registry: Arc<dyn DeviceRegistryPort>,
    keys: Arc<dyn KeyAgreementPort>,
    /// 当前会话的定时器句柄
    timer: std::sync::Mutex<Option<(SessionId, AbortHandle)>>,
    state_tx: watch::Sender<PairingState>,
    updates_tx: broadcast::Sender<PairingUpdate>,
}

impl PairingOrchestrator {
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<dyn DeviceRegistryPort>,
        keys: Arc<dyn KeyAgreementPort>,
        policy: PairingPolicy,
    ) -> Result<Self> {
        let public_key = keys.public_key().context("local public key")?;
        let machine =
            PairingStateMachine::with_policy(connections.local().clone(), public_key, policy);
        let (state_tx, _) = watch::channel(PairingState::Idle);
        let (updates_tx, _) = broadcast::channel(32);
        Ok(Self {
            inner: Arc::new(Inner {
                machine: Mutex::new(machine),
                connections,
                registry,
                keys,
                timer: std::sync::Mutex::new(None),
                state_tx,
                updates_tx,
            }),
        })
    }

    pub fn state(&self) -> PairingState {
        self.inner.state_tx.borrow().clone()
    }

    pub fn watch_state(&self) -> watch::Receiver<PairingState> {
        self.inner.state_tx.subscribe()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PairingUpdate> {
        self.inner.updates_tx.subscribe()
    }

    /// Responder: show a fresh PIN and wait for a peer to request pairing.
    /// Returns the PIN; the URI arrives with [`PairingUpdate::ShowPin`].
    pub async fn await_connection(&self) -> Result<String, PairingError> {
        self.ensure_idle()?;
        let pin = generate_pin();
        self.inner
            .clone()
            .dispatch(PairingEvent::AwaitConnection { pin: pin.clone() })
            .await;
        Ok(pin)
    }

    /// Initiator: pair with a known device, connecting first when needed.
    pub async fn start_pairing(&self, device_id: &DeviceId) -> Result<()> {
        self.start(device_id, None).await
    }

    /// Initiator: pair using a scanned `winux://pair` URI. The PIN is
    /// submitted automatically once the peer key arrives and matches.
    pub async fn start_pairing_from_uri(&self, device_id: &DeviceId, uri: &str) -> Result<()> {
        let preset = PairingUri::parse(uri)?;
        self.start(device_id, Some(preset)).await
    }

    /// Initiator: PIN typed by the user.
    pub async fn submit_pin(&self, pin: &str) -> Result<(), PairingError> {
        validate_pin(pin)?;
        if !self.state().is_in_flight() {
            return Err(PairingError::NotInProgress);
        }
        self.inner
            .clone()
            .dispatch(PairingEvent::SubmitPin(pin.to_string()))
            .await;
        Ok(())
    }

    pub async fn reject(&self) {
        self.inner.clone().dispatch(PairingEvent::UserReject).await;
    }

    /// Always legal. Notifies the peer when one is known.
    pub async fn cancel(&self) {
        self.inner.clone().dispatch(PairingEvent::Cancel).await;
    }

    /// Feed one `pair_*` message received from `from`.
    pub async fn handle_message(&self, from: &DeviceId, message: &WinuxMessage) -> Result<()> {
        let event = match message.message_type() {
            MessageType::PairRequest => {
                let request: PairRequestPayload = message.payload_as()?;
                if request.device_id != *from {
                    warn!(from = %from, claimed = %request.device_id, "pair_request device id differs from session");
                }
                if self.busy_with_other(from).await {
                    self.reply_busy(from).await;
                    return Ok(());
                }
                PairingEvent::RecvRequest {
                    request,
                    pin: generate_pin(),
                }
            }
            MessageType::PairResponse => {
                if !self.is_current_peer(from).await {
                    debug!(from = %from, "ignoring pair_response from unrelated device");
                    return Ok(());
                }
                PairingEvent::RecvResponse(message.payload_as::<PairResponsePayload>()?)
            }
            MessageType::PairConfirm => {
                if !self.is_current_peer(from).await {
                    debug!(from = %from, "ignoring pair_confirm from unrelated device");
                    return Ok(());
                }
                PairingEvent::RecvConfirm(message.payload_as::<PairConfirmPayload>()?)
            }
            other => anyhow::bail!("not a pairing message: {other}"),
        };
        self.inner.clone().dispatch(event).await;
        Ok(())
    }

    /// The control session to `device_id` ended.
    pub async fn handle_disconnect(&self, device_id: &DeviceId) {
        if self.state().is_in_flight() && self.is_current_peer(device_id).await {
            self.inner
                .clone()
                .dispatch(PairingEvent::TransportError("connection lost".to_string()))
                .await;
        }
    }

    async fn start(&self, device_id: &DeviceId, preset: Option<PairingUri>) -> Result<()> {
        self.ensure_idle()?;
        let device = self
            .inner
            .registry
            .get(device_id)
            .await?
            .with_context(|| format!("unknown device {device_id}"))?;
        if !self.inner.connections.is_connected(device_id).await {
            self.inner.connections.connect(device_id).await?;
        }
        self.inner
            .clone()
            .dispatch(PairingEvent::StartPairing {
                peer: PairingPeer {
                    device_id: device.id,
                    device_name: device.name,
                },
                preset,
            })
            .await;
        Ok(())
    }

    fn ensure_idle(&self) -> Result<(), PairingError> {
        if self.state().is_in_flight() {
            return Err(PairingError::Busy);
        }
        Ok(())
    }

    async fn is_current_peer(&self, device_id: &DeviceId) -> bool {
        self.inner.machine.lock().await.peer_device_id() == Some(device_id)
    }

    async fn busy_with_other(&self, from: &DeviceId) -> bool {
        let machine = self.inner.machine.lock().await;
        machine.state().is_in_flight() && machine.peer_device_id() != Some(from)
    }

    /// Answer a second requester without touching the running attempt.
    async fn reply_busy(&self, to: &DeviceId) {
        let local = self.inner.connections.local();
        let response = PairResponsePayload {
            accepted: false,
            device_id: local.id.clone(),
            device_name: local.name.clone(),
            device_type: local.device_type,
            public_key: None,
            reason: Some(peer_reason::BUSY.to_string()),
        };
        info!(to = %to, "pairing busy, rejecting second request");
        match response.into_message() {
            Ok(message) => {
                if let Err(err) = self.inner.connections.send_to(to, message).await {
                    warn!(to = %to, error = %err, "failed to send busy response");
                }
            }
            Err(err) => warn!(error = %err, "failed to build busy response"),
        }
    }
}

impl Inner {
    /// Run one event through the machine and execute the resulting actions.
    ///
    /// The machine lock is held for the whole batch, so events are applied
    /// strictly one after another.
    fn dispatch(self: Arc<Self>, event: PairingEvent) -> BoxFuture<'static, ()> {
        async move {
            let mut machine = self.machine.lock().await;
            // Cancel clears the context before its farewell is sent.
            let previous_peer = machine.peer_device_id().cloned();
            let (_, actions) = machine.handle_event(event, Utc::now());
            let mut queue = VecDeque::from(actions);

            while let Some(action) = queue.pop_front() {
                match action {
                    PairingAction::Send(message) => {
                        let target = machine.peer_device_id().cloned().or_else(|| previous_peer.clone());
                        let Some(peer) = target else {
                            warn!(message_type = %message.message_type(), "pairing message without peer");
                            continue;
                        };
                        if let Err(err) = self.connections.send_to(&peer, message).await {
                            warn!(device_id = %peer, error = %err, "failed to send pairing message");
                        }
                    }
                    PairingAction::StartTimer {
                        session_id,
                        deadline,
                    } => self.start_timer(session_id, deadline),
                    PairingAction::CancelTimer { session_id } => self.cancel_timer(&session_id),
                    PairingAction::ShowPin { pin, uri } => {
                        let _ = self.updates_tx.send(PairingUpdate::ShowPin { pin, uri });
                    }
                    PairingAction::RequestPin { peer_name } => {
                        let _ = self
                            .updates_tx
                            .send(PairingUpdate::PinRequested { peer_name });
                    }
                    PairingAction::Persist {
                        device_id,
                        peer_public_key,
                    } => {
                        let announce = machine.role() == Some(PairingRole::Initiator);
                        let follow_up = match self.persist(&device_id, peer_public_key, announce).await {
                            Ok(()) => PairingEvent::PersistOk,
                            Err(err) => {
                                warn!(device_id = %device_id, error = %err, "pairing persist failed");
                                PairingEvent::PersistErr(err.to_string())
                            }
                        };
                        let (_, more) = machine.handle_event(follow_up, Utc::now());
                        queue.extend(more);
                    }
                    PairingAction::DiscardKeyMaterial => {
                        debug!("pairing key material discarded");
                    }
                    PairingAction::LogTransition {
                        session_id,
                        old_state,
                        event,
                        new_state,
                    } => {
                        info!(
                            session = %session_id,
                            old_state = %old_state,
                            event = %event,
                            new_state = %new_state,
                            "pairing transition"
                        );
                    }
                    PairingAction::EmitResult {
                        session_id,
                        device_id,
                        success,
                        error,
                    } => {
                        info!(
                            session = %session_id,
                            device_id = ?device_id,
                            success,
                            error = ?error,
                            "pairing finished"
                        );
                        let _ = self.updates_tx.send(PairingUpdate::Finished {
                            device_id,
                            success,
                            error,
                        });
                    }
                }
            }

            let final_state = machine.state().clone();
            drop(machine);
            self.publish_state(final_state);
        }
        .instrument(info_span!("pairing.dispatch"))
        .boxed()
    }

    /// Derive → single registry write → cache and install.
    async fn persist(&self, device_id: &DeviceId, peer_public_key: Vec<u8>, announce: bool) -> Result<()> {
        let cipher = self
            .keys
            .derive_session_key(&peer_public_key)
            .context("derive session key")?;
        self.registry
            .mark_paired(device_id, peer_public_key)
            .await
            .context("mark device paired")?;
        self.keys.cache_session(device_id, cipher.clone());
        self.connections.install_cipher(device_id, Some(cipher)).await;
        info!(device_id = %device_id, "device paired, session key installed");
        if announce {
            self.connections.announce_capabilities(device_id).await;
        }
        Ok(())
    }

    fn start_timer(self: &Arc<Self>, session_id: SessionId, deadline: chrono::DateTime<Utc>) {
        let sleep_for = deadline
            .signed_duration_since(Utc::now())
            .to_std()
            .unwrap_or_default();
        let inner = self.clone();
        let timer_session = session_id.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(sleep_for).await;
            debug!(session = %timer_session, "pairing step timed out");
            inner
                .dispatch(PairingEvent::Timeout {
                    session_id: timer_session,
                })
                .await;
        });

        let previous = self
            .timer
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .replace((session_id, handle.abort_handle()));
        if let Some((_, previous)) = previous {
            previous.abort();
        }
    }

    fn cancel_timer(&self, session_id: &str) {
        let mut timer = self.timer.lock().unwrap_or_else(|e| e.into_inner());
        if timer.as_ref().is_some_and(|(id, _)| id == session_id) {
            if let Some((_, handle)) = timer.take() {
                handle.abort();
            }
        }
    }

    fn publish_state(&self, state: PairingState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            *current = state.clone();
            true
        });
        let _ = self.updates_tx.send(PairingUpdate::StateChanged(state));
    }
}
