//! Control session for one device.
//!
//! A live session runs three loops over one framed stream:
//!
//! - **read loop**: lines → decrypt → JSON; answers `ping`, ends on
//!   `disconnect`/EOF/read timeout, publishes everything else tagged with
//!   whether it came from a peer that proved the session key
//! - **write loop**: drains the outbound queue, then a short drain phase on
//!   shutdown so a final `disconnect` still reaches the peer
//! - **heartbeat loop**: queues a `ping` every interval
//!
//! A supervisor task joins all three and publishes the final state.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::codec::LinesCodecError;
use tracing::{debug, info, info_span, warn, Instrument};
use wc_core::error::{ConnectError, NetworkError, ProtocolError};
use wc_core::ids::DeviceId;
use wc_core::network::{
    ConnectionState, DisconnectReason, MessageType, TransportEvent, WinuxMessage,
};
use wc_core::network::payload::{HelloPayload, MessagePayload};
use wc_core::ports::SessionCipher;

use crate::framing::{control_framed, decode_line, encode_line, ControlFramed, MAX_LINE_BYTES};

/// Consecutive undecodable lines tolerated before the session is torn down.
pub const MAX_CONSECUTIVE_PROTOCOL_ERRORS: u32 = 8;

const DRAIN_TIMEOUT: Duration = Duration::from_millis(250);

#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub heartbeat_interval: Duration,
    /// No inbound traffic for this long ends the session.
    pub read_timeout: Duration,
    pub connect_timeout: Duration,
    /// Bound on waiting for the peer `hello` on an accepted connection.
    pub handshake_timeout: Duration,
    pub outbound_queue_depth: usize,
    pub broadcast_capacity: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(15),
            read_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            outbound_queue_depth: 64,
            broadcast_capacity: 256,
        }
    }
}

/// One inbound application message.
#[derive(Debug, Clone)]
pub struct ReceivedMessage {
    pub message: WinuxMessage,
    /// Opened with the session key, or a plain handshake line on a session
    /// whose peer already proved the key.
    pub authenticated: bool,
}

/// State shared between the transport handle and its loops.
struct Shared {
    device_id: DeviceId,
    cipher: RwLock<Option<Arc<dyn SessionCipher>>>,
    /// Set once a frame of the current session opened with the current key.
    authenticated: AtomicBool,
    inbound_tx: broadcast::Sender<ReceivedMessage>,
    events_tx: broadcast::Sender<TransportEvent>,
    state_tx: watch::Sender<ConnectionState>,
    config: TransportConfig,
}

impl Shared {
    fn cipher(&self) -> Option<Arc<dyn SessionCipher>> {
        self.cipher
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn encode(&self, message: &WinuxMessage) -> Result<String, ConnectError> {
        encode_line(message, self.cipher().as_deref())
    }

    fn set_state(&self, state: ConnectionState) {
        self.state_tx.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            debug!(device_id = %self.device_id, from = %current, to = %state, "connection state");
            *current = state;
            true
        });
    }

    fn publish_event(&self, event: TransportEvent) {
        // No subscribers is fine.
        let _ = self.events_tx.send(event);
    }
}

struct SessionHandle {
    write_tx: mpsc::Sender<String>,
    shutdown_tx: watch::Sender<bool>,
    supervisor: JoinHandle<()>,
}

/// Control-channel transport for one device.
pub struct Transport {
    shared: Arc<Shared>,
    session: AsyncMutex<Option<SessionHandle>>,
}

impl Transport {
    pub fn new(device_id: DeviceId, config: TransportConfig) -> Self {
        let (inbound_tx, _) = broadcast::channel(config.broadcast_capacity);
        let (events_tx, _) = broadcast::channel(config.broadcast_capacity);
        let (state_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                device_id,
                cipher: RwLock::new(None),
                authenticated: AtomicBool::new(false),
                inbound_tx,
                events_tx,
                state_tx,
                config,
            }),
            session: AsyncMutex::new(None),
        }
    }

    pub fn device_id(&self) -> &DeviceId {
        &self.shared.device_id
    }

    pub fn state(&self) -> ConnectionState {
        *self.shared.state_tx.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.state_tx.subscribe()
    }

    /// Inbound application messages (everything but ping/pong/disconnect/unknown).
    pub fn subscribe(&self) -> broadcast::Receiver<ReceivedMessage> {
        self.shared.inbound_tx.subscribe()
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.shared.events_tx.subscribe()
    }

    /// Install or clear the session cipher. Takes effect for the next frame
    /// in both directions; the peer has to prove the new key again.
    pub fn set_session_cipher(&self, cipher: Option<Arc<dyn SessionCipher>>) {
        let encrypted = cipher.is_some();
        *self
            .shared
            .cipher
            .write()
            .unwrap_or_else(|e| e.into_inner()) = cipher;
        self.shared.authenticated.store(false, Ordering::SeqCst);
        debug!(device_id = %self.shared.device_id, encrypted, "session cipher updated");
    }

    pub fn is_encrypted(&self) -> bool {
        self.shared.cipher().is_some()
    }

    /// A frame from the peer opened with the session key during this session.
    pub fn is_authenticated(&self) -> bool {
        self.shared.authenticated.load(Ordering::SeqCst)
    }

    /// Dial `address`, send the plain `hello` and start the session.
    pub async fn connect(&self, address: &str, hello: &HelloPayload) -> Result<(), ConnectError> {
        self.disconnect().await;
        self.shared.set_state(ConnectionState::Connecting);

        let connect_timeout = self.shared.config.connect_timeout;
        let stream = match timeout(connect_timeout, TcpStream::connect(address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.shared.set_state(ConnectionState::Error);
                warn!(device_id = %self.shared.device_id, address, error = %err, "connect failed");
                return Err(NetworkError::ConnectFailed {
                    address: address.to_string(),
                    reason: err.to_string(),
                }
                .into());
            }
            Err(_) => {
                self.shared.set_state(ConnectionState::Error);
                warn!(device_id = %self.shared.device_id, address, "connect timed out");
                return Err(NetworkError::Timeout(connect_timeout).into());
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "set_nodelay failed");
        }

        // The peer identifies us from this line before it knows any key.
        let hello = match encode_line(&hello.into_message()?, None) {
            Ok(line) => line,
            Err(err) => {
                self.shared.set_state(ConnectionState::Error);
                return Err(err);
            }
        };
        self.start_encoded(control_framed(stream), vec![hello]).await
    }

    /// Run a session over an already framed stream. `initial` messages are
    /// written before anything else (e.g. our `hello`).
    pub async fn start<S>(
        &self,
        framed: ControlFramed<S>,
        initial: Vec<WinuxMessage>,
    ) -> Result<(), ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut lines = Vec::with_capacity(initial.len());
        for message in &initial {
            match self.shared.encode(message) {
                Ok(line) => lines.push(line),
                Err(err) => {
                    self.shared.set_state(ConnectionState::Error);
                    return Err(err);
                }
            }
        }
        self.start_encoded(framed, lines).await
    }

    async fn start_encoded<S>(
        &self,
        framed: ControlFramed<S>,
        initial: Vec<String>,
    ) -> Result<(), ConnectError>
    where
        S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
    {
        let mut session = self.session.lock().await;
        if let Some(old) = session.take() {
            shutdown_session(old).await;
        }

        self.shared.authenticated.store(false, Ordering::SeqCst);
        let (write_tx, write_rx) = mpsc::channel(self.shared.config.outbound_queue_depth);
        for line in initial {
            write_tx
                .try_send(line)
                .map_err(|_| NetworkError::NotConnected)?;
        }
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        // Connected must be visible before the loops can publish a final state.
        self.shared.set_state(ConnectionState::Connected);
        self.shared.publish_event(TransportEvent::Connected {
            device_id: self.shared.device_id.clone(),
        });

        let span = info_span!("transport.session", device_id = %self.shared.device_id);
        let supervisor = tokio::spawn(
            supervise(
                self.shared.clone(),
                framed,
                write_tx.clone(),
                write_rx,
                shutdown_tx.clone(),
                shutdown_rx,
            )
            .instrument(span),
        );

        *session = Some(SessionHandle {
            write_tx,
            shutdown_tx,
            supervisor,
        });
        info!(device_id = %self.shared.device_id, "control session started");
        Ok(())
    }

    /// Queue one message. Fails with `NotConnected` unless the session is live.
    /// Never retries.
    pub async fn send(&self, message: WinuxMessage) -> Result<(), ConnectError> {
        if self.state() != ConnectionState::Connected {
            return Err(NetworkError::NotConnected.into());
        }
        let write_tx = {
            let session = self.session.lock().await;
            match session.as_ref() {
                Some(handle) => handle.write_tx.clone(),
                None => return Err(NetworkError::NotConnected.into()),
            }
        };
        let line = self.shared.encode(&message)?;
        write_tx
            .send(line)
            .await
            .map_err(|_| NetworkError::NotConnected)?;
        debug!(
            device_id = %self.shared.device_id,
            message_type = %message.message_type(),
            message_id = %message.id(),
            "queued message"
        );
        Ok(())
    }

    /// Best-effort `disconnect` to the peer, then tear down and join the loops.
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let handle = self.session.lock().await.take();
        let Some(handle) = handle else {
            return;
        };
        if self.state() == ConnectionState::Connected {
            if let Ok(line) = self.shared.encode(&WinuxMessage::disconnect()) {
                let _ = handle.write_tx.try_send(line);
            }
        }
        shutdown_session(handle).await;
        self.shared.set_state(ConnectionState::Disconnected);
        info!(device_id = %self.shared.device_id, "control session closed locally");
    }
}

impl Drop for Transport {
    fn drop(&mut self) {
        if let Some(handle) = self.session.get_mut().take() {
            let _ = handle.shutdown_tx.send(true);
            handle.supervisor.abort();
        }
    }
}

async fn shutdown_session(handle: SessionHandle) {
    send_shutdown_signal(&handle.shutdown_tx);
    if let Err(err) = handle.supervisor.await {
        if !err.is_cancelled() {
            warn!(error = %err, "session supervisor join failed");
        }
    }
}

fn send_shutdown_signal(shutdown_tx: &watch::Sender<bool>) {
    // Receivers gone means the loops already exited.
    let _ = shutdown_tx.send(true);
}

async fn supervise<S>(
    shared: Arc<Shared>,
    framed: ControlFramed<S>,
    write_tx: mpsc::Sender<String>,
    write_rx: mpsc::Receiver<String>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
) where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sink, stream) = framed.split();

    let mut read_task = tokio::spawn(
        read_loop(shared.clone(), stream, write_tx.clone(), shutdown_rx.clone()).in_current_span(),
    );
    let mut write_task =
        tokio::spawn(write_loop(shared.clone(), sink, write_rx, shutdown_rx.clone()).in_current_span());
    let mut heartbeat_task =
        tokio::spawn(heartbeat_loop(shared.clone(), write_tx, shutdown_rx).in_current_span());

    enum Completed {
        Read,
        Write,
        Heartbeat,
    }

    let (reason, completed) = tokio::select! {
        r = &mut read_task => (r.unwrap_or(DisconnectReason::Io), Completed::Read),
        r = &mut write_task => (r.unwrap_or(DisconnectReason::Io), Completed::Write),
        r = &mut heartbeat_task => (r.unwrap_or(DisconnectReason::Io), Completed::Heartbeat),
    };

    send_shutdown_signal(&shutdown_tx);
    match completed {
        Completed::Read => {
            let _ = write_task.await;
            heartbeat_task.abort();
            let _ = heartbeat_task.await;
        }
        Completed::Write => {
            read_task.abort();
            heartbeat_task.abort();
            let _ = read_task.await;
            let _ = heartbeat_task.await;
        }
        Completed::Heartbeat => {
            let _ = write_task.await;
            read_task.abort();
            let _ = read_task.await;
        }
    }

    let final_state = match reason {
        DisconnectReason::Local
        | DisconnectReason::Remote
        | DisconnectReason::Eof
        | DisconnectReason::HeartbeatTimeout => ConnectionState::Disconnected,
        DisconnectReason::ProtocolViolation
        | DisconnectReason::CryptoFailure
        | DisconnectReason::Io => ConnectionState::Error,
    };
    match final_state {
        ConnectionState::Error => {
            warn!(device_id = %shared.device_id, reason = ?reason, "control session failed")
        }
        _ => info!(device_id = %shared.device_id, reason = ?reason, "control session ended"),
    }
    shared.set_state(final_state);
    shared.publish_event(TransportEvent::Disconnected {
        device_id: shared.device_id.clone(),
        reason,
    });
}

async fn read_loop<R>(
    shared: Arc<Shared>,
    mut stream: R,
    write_tx: mpsc::Sender<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> DisconnectReason
where
    R: futures::Stream<Item = Result<String, LinesCodecError>> + Unpin + Send,
{
    let read_timeout = shared.config.read_timeout;
    let mut protocol_errors = 0u32;

    loop {
        let next = tokio::select! {
            _ = shutdown_rx.changed() => return DisconnectReason::Local,
            next = timeout(read_timeout, stream.next()) => next,
        };

        let line = match next {
            Err(_) => {
                warn!(device_id = %shared.device_id, timeout = ?read_timeout, "no traffic, peer presumed dead");
                return DisconnectReason::HeartbeatTimeout;
            }
            Ok(None) => return DisconnectReason::Eof,
            Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
                warn!(device_id = %shared.device_id, stage = "read_line", "line exceeds max length");
                protocol_errors += 1;
                if protocol_errors >= MAX_CONSECUTIVE_PROTOCOL_ERRORS {
                    return DisconnectReason::ProtocolViolation;
                }
                continue;
            }
            Ok(Some(Err(LinesCodecError::Io(err)))) => {
                warn!(device_id = %shared.device_id, stage = "read_line", error = %err, "read failed");
                return DisconnectReason::Io;
            }
            Ok(Some(Ok(line))) => line,
        };

        let cipher = shared.cipher();
        let message = match decode_line(&line, cipher.as_deref()) {
            Ok(message) => {
                protocol_errors = 0;
                message
            }
            Err(ConnectError::Crypto(err)) => {
                let authenticated = shared.authenticated.load(Ordering::SeqCst);
                warn!(device_id = %shared.device_id, error = %err, authenticated, "frame failed authentication");
                shared.publish_event(TransportEvent::CryptoFailure {
                    device_id: shared.device_id.clone(),
                    error: err.to_string(),
                    authenticated,
                });
                return DisconnectReason::CryptoFailure;
            }
            Err(err) => {
                protocol_errors += 1;
                warn!(
                    device_id = %shared.device_id,
                    error = %err,
                    consecutive = protocol_errors,
                    "dropping undecodable frame"
                );
                if protocol_errors >= MAX_CONSECUTIVE_PROTOCOL_ERRORS {
                    return DisconnectReason::ProtocolViolation;
                }
                continue;
            }
        };

        let message_type = message.message_type().clone();
        // Non-handshake frames only decode under a cipher when sealed.
        let sealed = cipher.is_some() && !message_type.is_handshake();
        if sealed && !shared.authenticated.swap(true, Ordering::SeqCst) {
            debug!(device_id = %shared.device_id, "peer proved the session key");
            shared.publish_event(TransportEvent::Authenticated {
                device_id: shared.device_id.clone(),
            });
        }
        let authenticated = sealed || shared.authenticated.load(Ordering::SeqCst);

        match message_type {
            // Never block reads on a full write queue; the peer pings again.
            MessageType::Ping => match shared.encode(&WinuxMessage::pong()) {
                Ok(line) => match write_tx.try_send(line) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(device_id = %shared.device_id, "write queue full, pong dropped")
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => return DisconnectReason::Io,
                },
                Err(err) => warn!(error = %err, "failed to encode pong"),
            },
            MessageType::Pong => {}
            MessageType::Disconnect => {
                info!(device_id = %shared.device_id, "peer requested disconnect");
                return DisconnectReason::Remote;
            }
            MessageType::Unknown(raw) => {
                debug!(device_id = %shared.device_id, message_type = %raw, "ignoring unknown message type");
            }
            MessageType::Hello => {
                match message.payload_as::<HelloPayload>() {
                    Ok(hello) => shared.publish_event(TransportEvent::PeerHello {
                        device_id: hello.device_id,
                        device_name: hello.device_name,
                        device_type: hello.device_type,
                    }),
                    Err(err) => warn!(error = %err, "malformed hello"),
                }
                let _ = shared.inbound_tx.send(ReceivedMessage {
                    message,
                    authenticated,
                });
            }
            _ => {
                let _ = shared.inbound_tx.send(ReceivedMessage {
                    message,
                    authenticated,
                });
            }
        }
    }
}

async fn write_loop<W>(
    shared: Arc<Shared>,
    mut sink: W,
    mut write_rx: mpsc::Receiver<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> DisconnectReason
where
    W: futures::Sink<String, Error = LinesCodecError> + Unpin + Send,
{
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            line = write_rx.recv() => {
                let Some(line) = line else { break };
                if let Err(err) = sink.send(line).await {
                    warn!(device_id = %shared.device_id, stage = "write_line", error = %err, "write failed");
                    return DisconnectReason::Io;
                }
            }
        }
    }

    // Drain phase
    let drain_start = tokio::time::Instant::now();
    loop {
        let remaining = DRAIN_TIMEOUT.saturating_sub(drain_start.elapsed());
        if remaining.is_zero() {
            break;
        }
        match timeout(remaining, write_rx.recv()).await {
            Ok(Some(line)) => {
                if sink.send(line).await.is_err() {
                    break;
                }
            }
            Ok(None) | Err(_) => break,
        }
    }
    let _ = sink.close().await;
    DisconnectReason::Local
}

async fn heartbeat_loop(
    shared: Arc<Shared>,
    write_tx: mpsc::Sender<String>,
    mut shutdown_rx: watch::Receiver<bool>,
) -> DisconnectReason {
    let period = shared.config.heartbeat_interval;
    let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => return DisconnectReason::Local,
            _ = ticker.tick() => {
                let line = match shared.encode(&WinuxMessage::ping()) {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(error = %err, "failed to encode ping");
                        continue;
                    }
                };
                // A full queue already proves liveness; skip this beat.
                match write_tx.try_send(line) {
                    Ok(()) => debug!(device_id = %shared.device_id, "heartbeat ping"),
                    Err(mpsc::error::TrySendError::Full(_)) => {}
                    Err(mpsc::error::TrySendError::Closed(_)) => return DisconnectReason::Io,
                }
            }
        }
    }
}

/// Read the peer's plain `hello` from a freshly accepted stream.
pub async fn read_peer_hello<S>(
    framed: &mut ControlFramed<S>,
    handshake_timeout: Duration,
) -> Result<HelloPayload, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let line = match timeout(handshake_timeout, framed.next()).await {
        Err(_) => return Err(NetworkError::Timeout(handshake_timeout).into()),
        Ok(None) => return Err(NetworkError::Closed.into()),
        Ok(Some(Err(LinesCodecError::Io(err)))) => return Err(NetworkError::Io(err).into()),
        Ok(Some(Err(LinesCodecError::MaxLineLengthExceeded))) => {
            return Err(ProtocolError::FrameTooLarge {
                len: MAX_LINE_BYTES + 1,
                max: MAX_LINE_BYTES,
            }
            .into())
        }
        Ok(Some(Ok(line))) => line,
    };
    let message = decode_line(&line, None)?;
    if message.message_type() != &MessageType::Hello {
        return Err(ProtocolError::Unexpected(format!(
            "expected hello, got {}",
            message.message_type()
        ))
        .into());
    }
    Ok(message.payload_as::<HelloPayload>()?)
}
