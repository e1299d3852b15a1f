//! Connection manager.
//!
//! Keeps at most one [`Transport`] per device and fans every transport's
//! inbound messages into one [`InboundMessage`] channel consumed by the
//! router.
//!
//! ## Responsibilities / 职责
//!
//! - ✅ Dial and accept control connections / 建立和接受控制连接
//! - ✅ Install the session cipher of paired devices / 为已配对设备安装会话密钥
//! - ✅ Hold back paired sessions until the peer proves the key / 已配对设备须先证明密钥
//! - ✅ React to crypto failures by revoking pairing / 解密失败时撤销配对
//!
//! ## Prohibited / 禁止事项
//!
//! ❌ No message semantics (that is the router) / 不解析业务消息

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use wc_core::device::{Device, LocalDevice};
use wc_core::error::{ConnectError, NetworkError};
use wc_core::network::{
    CapabilitiesPayload, ConnectionState, HelloPayload, MessagePayload, TransportEvent,
    WinuxMessage, DEFAULT_CONTROL_PORT,
};
use wc_core::ports::{DeviceRegistryPort, KeyAgreementPort, SessionCipher};
use wc_core::DeviceId;
use wc_network::framing::ControlFramed;
use wc_network::transfer::format_endpoint;
use wc_network::{read_peer_hello, ControlListener, ReceivedMessage, Transport, TransportConfig};

use crate::events::{ConnectionEvent, InboundMessage};

const INBOUND_CHANNEL_CAPACITY: usize = 256;
const FORWARDER_JOIN_TIMEOUT: Duration = Duration::from_millis(250);

struct Connection {
    transport: Arc<Transport>,
    forwarder: JoinHandle<()>,
    /// Our capabilities went out under the current key.
    announced: AtomicBool,
}

pub struct ConnectionManager {
    local: LocalDevice,
    registry: Arc<dyn DeviceRegistryPort>,
    keys: Arc<dyn KeyAgreementPort>,
    config: TransportConfig,
    connections: Mutex<HashMap<DeviceId, Connection>>,
    /// Serializes connect/accept per device.
    device_locks: std::sync::Mutex<HashMap<DeviceId, Arc<Mutex<()>>>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    events_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionManager {
    pub fn new(
        local: LocalDevice,
        registry: Arc<dyn DeviceRegistryPort>,
        keys: Arc<dyn KeyAgreementPort>,
        config: TransportConfig,
    ) -> (Self, mpsc::Receiver<InboundMessage>) {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);
        let (events_tx, _) = broadcast::channel(64);
        (
            Self {
                local,
                registry,
                keys,
                config,
                connections: Mutex::new(HashMap::new()),
                device_locks: std::sync::Mutex::new(HashMap::new()),
                inbound_tx,
                events_tx,
            },
            inbound_rx,
        )
    }

    pub fn local(&self) -> &LocalDevice {
        &self.local
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events_tx.subscribe()
    }

    pub async fn state(&self, device_id: &DeviceId) -> ConnectionState {
        self.connections
            .lock()
            .await
            .get(device_id)
            .map(|c| c.transport.state())
            .unwrap_or(ConnectionState::Disconnected)
    }

    pub async fn is_connected(&self, device_id: &DeviceId) -> bool {
        self.state(device_id).await.is_connected()
    }

    pub async fn connected_devices(&self) -> Vec<DeviceId> {
        self.connections
            .lock()
            .await
            .iter()
            .filter(|(_, c)| c.transport.state().is_connected())
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Dial a known device. Any live session to it is closed first.
    pub async fn connect(&self, device_id: &DeviceId) -> Result<()> {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;

        let device = self
            .registry
            .get(device_id)
            .await?
            .with_context(|| format!("unknown device {device_id}"))?;
        self.close(device_id).await;

        let transport = Arc::new(Transport::new(device_id.clone(), self.config.clone()));
        self.install_known_cipher(&transport, &device)?;
        let forwarder =
            self.spawn_forwarder(&transport, transport.subscribe(), transport.subscribe_events());
        let address = format_endpoint(&device.ip_address, device.port);

        // Registered before the session starts so replies to the first
        // inbound messages find it.
        self.register(device_id, transport.clone(), forwarder).await;
        if let Err(err) = transport.connect(&address, &self.local.hello()).await {
            self.close(device_id).await;
            return Err(err).with_context(|| format!("connect to {} ({address})", device.name));
        }
        self.after_connect(device_id).await;
        info!(device_id = %device_id, address = %address, "connected");
        Ok(())
    }

    /// Take over an inbound control connection: read the peer `hello`, resolve
    /// or create its registry row, answer with our own `hello`.
    ///
    /// A `hello` naming a paired device is only a claim. The registry row and
    /// any live session stay untouched until the newcomer's first sealed frame
    /// opens with the paired key.
    pub async fn accept<S>(&self, mut framed: ControlFramed<S>, peer_addr: SocketAddr) -> Result<DeviceId>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let hello = read_peer_hello(&mut framed, self.config.handshake_timeout)
            .await
            .context("read peer hello")?;
        let device_id = hello.device_id.clone();
        if device_id == self.local.id {
            anyhow::bail!("refusing connection from our own device id");
        }

        if let Some(device) = self.registry.get(&device_id).await? {
            if device.is_paired {
                return self.accept_paired(framed, peer_addr, hello, device).await;
            }
        }

        let lock = self.device_lock(&device_id);
        let _guard = lock.lock().await;

        let device = match self.registry.get(&device_id).await? {
            Some(mut device) => {
                apply_hello(&mut device, &hello, peer_addr);
                self.registry.update(device.clone()).await?;
                device
            }
            None => {
                let mut device = Device::new(
                    hello.device_name.clone(),
                    hello.hostname.clone().unwrap_or_default(),
                    peer_addr.ip().to_string(),
                    DEFAULT_CONTROL_PORT,
                    hello.device_type,
                    Utc::now(),
                );
                device.id = device_id.clone();
                self.registry.insert(device.clone()).await?;
                info!(device_id = %device_id, name = %device.name, "new device connected");
                device
            }
        };

        self.close(&device_id).await;
        let transport = Arc::new(Transport::new(device_id.clone(), self.config.clone()));
        self.install_known_cipher(&transport, &device)?;
        let forwarder =
            self.spawn_forwarder(&transport, transport.subscribe(), transport.subscribe_events());
        let our_hello = self.local.hello().into_message()?;
        self.register(&device_id, transport.clone(), forwarder).await;
        if let Err(err) = transport.start(framed, vec![our_hello]).await {
            self.close(&device_id).await;
            return Err(err).context("start accepted session");
        }
        self.after_connect(&device_id).await;
        info!(device_id = %device_id, peer = %peer_addr, "accepted");
        Ok(device_id)
    }

    /// 已配对设备: run the session on the side until it proves the key, then
    /// swap it in.
    async fn accept_paired<S>(
        &self,
        framed: ControlFramed<S>,
        peer_addr: SocketAddr,
        hello: HelloPayload,
        device: Device,
    ) -> Result<DeviceId>
    where
        S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
    {
        let device_id = device.id.clone();
        let transport = Arc::new(Transport::new(device_id.clone(), self.config.clone()));
        self.install_known_cipher(&transport, &device)?;
        // Subscribed before start so nothing the peer sends first is missed.
        let messages = transport.subscribe();
        let events = transport.subscribe_events();
        let mut proof = transport.subscribe_events();

        transport
            .start(framed, vec![self.local.hello().into_message()?])
            .await
            .context("start accepted session")?;
        if let Err(err) = self.await_key_proof(&transport, &mut proof).await {
            transport.disconnect().await;
            warn!(device_id = %device_id, peer = %peer_addr, error = %err, "peer did not prove the paired key");
            return Err(err).with_context(|| format!("unverified session claiming {device_id}"));
        }
        drop(proof);

        let lock = self.device_lock(&device_id);
        let _guard = lock.lock().await;
        match self.registry.get(&device_id).await? {
            Some(mut device) => {
                apply_hello(&mut device, &hello, peer_addr);
                self.registry.update(device).await?;
            }
            None => {
                transport.disconnect().await;
                anyhow::bail!("device {device_id} was forgotten while connecting");
            }
        }

        let forwarder = self.spawn_forwarder(&transport, messages, events);
        self.register(&device_id, transport, forwarder).await;
        self.after_connect(&device_id).await;
        info!(device_id = %device_id, peer = %peer_addr, "accepted paired device");
        Ok(device_id)
    }

    /// Wait for the first frame that opened with the session key.
    async fn await_key_proof(
        &self,
        transport: &Transport,
        events: &mut broadcast::Receiver<TransportEvent>,
    ) -> Result<()> {
        let wait = async {
            loop {
                match events.recv().await {
                    Ok(TransportEvent::Authenticated { .. }) => return Ok(()),
                    Ok(TransportEvent::CryptoFailure { error, .. }) => {
                        anyhow::bail!("frame failed authentication: {error}")
                    }
                    Ok(TransportEvent::Disconnected { reason, .. }) => {
                        anyhow::bail!("session ended before the key was proven: {reason:?}")
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {
                        if transport.is_authenticated() {
                            return Ok(());
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => anyhow::bail!("session closed"),
                }
            }
        };
        match tokio::time::timeout(self.config.handshake_timeout, wait).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!(
                "no sealed frame within {:?}",
                self.config.handshake_timeout
            ),
        }
    }

    /// Send one message to a connected device. Never retries.
    pub async fn send_to(&self, device_id: &DeviceId, message: WinuxMessage) -> Result<(), ConnectError> {
        let transport = {
            let connections = self.connections.lock().await;
            match connections.get(device_id) {
                Some(c) => c.transport.clone(),
                None => return Err(NetworkError::NotConnected.into()),
            }
        };
        transport.send(message).await
    }

    /// Install (or clear) the cipher on the live session of `device_id`.
    pub async fn install_cipher(&self, device_id: &DeviceId, cipher: Option<Arc<dyn SessionCipher>>) {
        if let Some(c) = self.connections.lock().await.get(device_id) {
            c.transport.set_session_cipher(cipher);
            c.announced.store(false, Ordering::SeqCst);
        }
    }

    /// Send our `capabilities` once per key, and only sealed. Returns whether
    /// a message went out.
    pub async fn announce_capabilities(&self, device_id: &DeviceId) -> bool {
        let transport = {
            let connections = self.connections.lock().await;
            let Some(c) = connections.get(device_id) else {
                return false;
            };
            if !c.transport.is_encrypted() || c.announced.swap(true, Ordering::SeqCst) {
                return false;
            }
            c.transport.clone()
        };
        let message = match CapabilitiesPayload::full().into_message() {
            Ok(message) => message,
            Err(err) => {
                warn!(error = %err, "failed to build capabilities");
                return false;
            }
        };
        match transport.send(message).await {
            Ok(()) => true,
            Err(err) => {
                warn!(device_id = %device_id, error = %err, "failed to send capabilities");
                false
            }
        }
    }

    /// The live session of `device_id` has seen a frame sealed with its key.
    pub async fn is_authenticated(&self, device_id: &DeviceId) -> bool {
        self.connections
            .lock()
            .await
            .get(device_id)
            .is_some_and(|c| c.transport.is_authenticated())
    }

    pub async fn disconnect(&self, device_id: &DeviceId) {
        let lock = self.device_lock(device_id);
        let _guard = lock.lock().await;
        self.close(device_id).await;
    }

    pub async fn disconnect_all(&self) {
        let ids: Vec<DeviceId> = self.connections.lock().await.keys().cloned().collect();
        for id in ids {
            self.disconnect(&id).await;
        }
    }

    /// Disconnect, drop the cached key and unpair. The row stays.
    pub async fn unpair(&self, device_id: &DeviceId) -> Result<()> {
        self.disconnect(device_id).await;
        self.keys.forget(device_id);
        self.registry.mark_unpaired(device_id).await?;
        info!(device_id = %device_id, "device unpaired");
        Ok(())
    }

    /// Disconnect, drop the cached key and delete the registry row.
    pub async fn forget(&self, device_id: &DeviceId) -> Result<()> {
        self.disconnect(device_id).await;
        self.keys.forget(device_id);
        self.registry.delete(device_id).await?;
        self.device_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(device_id);
        info!(device_id = %device_id, "device forgotten");
        Ok(())
    }

    /// Accept inbound control connections until `shutdown` flips.
    pub async fn serve(self: Arc<Self>, listener: ControlListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };
            let (framed, peer_addr) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "accept failed");
                    continue;
                }
            };
            let manager = self.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = manager.accept::<TcpStream>(framed, peer_addr).await {
                        warn!(peer = %peer_addr, error = %err, "inbound connection rejected");
                    }
                }
                .instrument(info_span!("control.accept", peer = %peer_addr)),
            );
        }
        debug!("control listener stopped");
    }

    fn device_lock(&self, device_id: &DeviceId) -> Arc<Mutex<()>> {
        self.device_locks
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .entry(device_id.clone())
            .or_default()
            .clone()
    }

    fn install_known_cipher(&self, transport: &Transport, device: &Device) -> Result<()> {
        if !device.is_paired {
            return Ok(());
        }
        let cipher = match self.keys.session_for(&device.id) {
            Some(cipher) => cipher,
            None => {
                let public_key = device
                    .public_key
                    .as_deref()
                    .with_context(|| format!("paired device {} has no public key", device.id))?;
                let cipher = self.keys.derive_session_key(public_key)?;
                self.keys.cache_session(&device.id, cipher.clone());
                cipher
            }
        };
        transport.set_session_cipher(Some(cipher));
        Ok(())
    }

    async fn register(&self, device_id: &DeviceId, transport: Arc<Transport>, forwarder: JoinHandle<()>) {
        let previous = self.connections.lock().await.insert(
            device_id.clone(),
            Connection {
                transport,
                forwarder,
                announced: AtomicBool::new(false),
            },
        );
        if let Some(previous) = previous {
            shutdown_connection(previous).await;
        }
    }

    async fn close(&self, device_id: &DeviceId) {
        let previous = self.connections.lock().await.remove(device_id);
        if let Some(previous) = previous {
            shutdown_connection(previous).await;
        }
    }

    async fn after_connect(&self, device_id: &DeviceId) {
        if let Err(err) = self.registry.touch_last_connected(device_id).await {
            warn!(device_id = %device_id, error = %err, "touch_last_connected failed");
        }
        // Unpaired sessions exchange nothing but handshakes.
        self.announce_capabilities(device_id).await;
    }

    /// Forward one transport's messages and react to its events. Ends when the
    /// session ends.
    fn spawn_forwarder(
        &self,
        transport: &Transport,
        mut messages: broadcast::Receiver<ReceivedMessage>,
        mut events: broadcast::Receiver<TransportEvent>,
    ) -> JoinHandle<()> {
        let device_id = transport.device_id().clone();
        let inbound_tx = self.inbound_tx.clone();
        let events_tx = self.events_tx.clone();
        let registry = self.registry.clone();
        let keys = self.keys.clone();
        let span = info_span!("connection.forwarder", device_id = %device_id);

        tokio::spawn(
            async move {
                loop {
                    tokio::select! {
                        message = messages.recv() => match message {
                            Ok(received) => {
                                if inbound_tx.send(inbound(&device_id, received)).await.is_err() {
                                    break;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "inbound consumer lagging, messages dropped");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                        event = events.recv() => match event {
                            Ok(TransportEvent::Connected { device_id }) => {
                                let _ = events_tx.send(ConnectionEvent::Connected { device_id });
                            }
                            Ok(TransportEvent::PeerHello { .. }) => {}
                            Ok(TransportEvent::Authenticated { .. }) => {
                                debug!("peer proved the session key");
                            }
                            // Anyone can send garbage under a claimed id.
                            Ok(TransportEvent::CryptoFailure { error, authenticated: false, .. }) => {
                                warn!(error = %error, "unproven peer failed authentication, pairing kept");
                            }
                            Ok(TransportEvent::CryptoFailure { device_id, error, authenticated: true }) => {
                                warn!(error = %error, "session key rejected, forcing re-pairing");
                                keys.forget(&device_id);
                                if let Err(err) = registry.mark_unpaired(&device_id).await {
                                    warn!(error = %err, "mark_unpaired after crypto failure failed");
                                }
                                let _ = events_tx.send(ConnectionEvent::PairingRevoked { device_id });
                            }
                            Ok(TransportEvent::Disconnected { device_id, reason }) => {
                                let _ = events_tx.send(ConnectionEvent::Disconnected { device_id, reason });
                                break;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(skipped = n, "transport events lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        },
                    }
                }
                // Drain anything published before the session ended.
                while let Ok(received) = messages.try_recv() {
                    if inbound_tx.send(inbound(&device_id, received)).await.is_err() {
                        break;
                    }
                }
            }
            .instrument(span),
        )
    }
}

fn inbound(device_id: &DeviceId, received: ReceivedMessage) -> InboundMessage {
    InboundMessage {
        device_id: device_id.clone(),
        message: received.message,
        authenticated: received.authenticated,
    }
}

fn apply_hello(device: &mut Device, hello: &HelloPayload, peer_addr: SocketAddr) {
    device.name = hello.device_name.clone();
    device.ip_address = peer_addr.ip().to_string();
    device.device_type = hello.device_type;
    if let Some(hostname) = &hello.hostname {
        device.hostname = hostname.clone();
    }
    device.last_seen = Utc::now();
}

async fn shutdown_connection(connection: Connection) {
    connection.transport.disconnect().await;
    let mut forwarder = connection.forwarder;
    if tokio::time::timeout(FORWARDER_JOIN_TIMEOUT, &mut forwarder)
        .await
        .is_err()
    {
        forwarder.abort();
    }
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("local", &self.local.id)
            .finish_non_exhaustive()
    }
}
