//! Application facade.
//!
//! Owns the connection manager, pairing orchestrator, file-transfer service
//! and router, and exposes the operations a front end needs.
//!
//! ## Responsibilities / 职责
//!
//! - ✅ Build and connect the orchestration services / 组装编排服务
//! - ✅ Outbound features (clipboard, media, commands, battery) / 出站功能
//! - ✅ Device lifecycle: connect, unpair, forget / 设备生命周期
//!
//! ## Prohibited / 禁止事项
//!
//! ❌ No config file or platform directory access (bootstrap does that)

use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, Instrument};
use wc_core::clipboard::{ClipboardEntry, ClipboardSource};
use wc_core::device::{Device, LocalDevice};
use wc_core::network::{
    BatteryStatusPayload, CapabilitiesPayload, ClipboardContentPayload, MediaAction,
    MediaControlPayload, MediaStatePayload, MessagePayload, MessageType,
    NotificationDismissPayload, NotificationPayload, WinuxMessage,
};
use wc_core::pairing::PairingPolicy;
use wc_core::ports::{DeviceRegistryPort, KeyAgreementPort, RemoteCommand};
use wc_core::{DeviceId, FileTransfer};
use wc_network::{ControlListener, TransferListener, TransportConfig};

use crate::connection::ConnectionManager;
use crate::events::ConnectionEvent;
use crate::file_transfer::{FileTransferService, TransferSettings};
use crate::pairing::PairingOrchestrator;
use crate::router::{Collaborators, FeatureSettings, MessageRouter};

/// Everything the facade needs, built by bootstrap.
pub struct AppDeps {
    pub local: LocalDevice,
    pub registry: Arc<dyn DeviceRegistryPort>,
    pub keys: Arc<dyn KeyAgreementPort>,
    pub ports: Collaborators,
    pub transport: TransportConfig,
    pub pairing: PairingPolicy,
    pub transfers: TransferSettings,
    pub features: FeatureSettings,
}

pub struct ConnectApp {
    registry: Arc<dyn DeviceRegistryPort>,
    connections: Arc<ConnectionManager>,
    pairing: PairingOrchestrator,
    transfers: Arc<FileTransferService>,
    router: Arc<MessageRouter>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ConnectApp {
    /// Build the services and start routing. Must run inside a tokio runtime.
    pub fn start(deps: AppDeps) -> Result<Self> {
        let AppDeps {
            local,
            registry,
            keys,
            ports,
            transport,
            pairing,
            transfers,
            features,
        } = deps;

        let (connections, inbound_rx) =
            ConnectionManager::new(local, registry.clone(), keys.clone(), transport);
        let connections = Arc::new(connections);
        let pairing = PairingOrchestrator::new(connections.clone(), registry.clone(), keys, pairing)
            .context("create pairing orchestrator")?;
        let transfers = Arc::new(FileTransferService::new(connections.clone(), transfers));
        let router = Arc::new(MessageRouter::new(
            connections.clone(),
            registry.clone(),
            pairing.clone(),
            transfers.clone(),
            ports,
            features,
        ));

        let routing = tokio::spawn(router.clone().run(inbound_rx));
        let watcher = spawn_connection_watcher(connections.subscribe(), pairing.clone());

        Ok(Self {
            registry,
            connections,
            pairing,
            transfers,
            router,
            tasks: Mutex::new(vec![routing, watcher]),
        })
    }

    pub fn local(&self) -> &LocalDevice {
        self.connections.local()
    }

    pub fn connections(&self) -> &Arc<ConnectionManager> {
        &self.connections
    }

    pub fn pairing(&self) -> &PairingOrchestrator {
        &self.pairing
    }

    pub fn transfers(&self) -> &Arc<FileTransferService> {
        &self.transfers
    }

    pub fn subscribe_connections(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.connections.subscribe()
    }

    /// Serve inbound control connections in the background.
    pub async fn serve_control(&self, listener: ControlListener, shutdown: watch::Receiver<bool>) {
        let task = tokio::spawn(self.connections.clone().serve(listener, shutdown));
        self.tasks.lock().await.push(task);
    }

    /// Serve inbound file-transfer connections in the background.
    pub async fn serve_transfers(&self, listener: TransferListener, shutdown: watch::Receiver<bool>) {
        let task = tokio::spawn(self.transfers.clone().serve(listener, shutdown));
        self.tasks.lock().await.push(task);
    }

    pub async fn devices(&self) -> Result<Vec<Device>> {
        Ok(self.registry.list().await?)
    }

    pub async fn paired_devices(&self) -> Result<Vec<Device>> {
        Ok(self.registry.list_paired().await?)
    }

    pub async fn connect(&self, device_id: &DeviceId) -> Result<()> {
        self.connections.connect(device_id).await
    }

    pub async fn disconnect(&self, device_id: &DeviceId) {
        self.connections.disconnect(device_id).await;
    }

    /// Connect to every paired device; failures are logged and skipped.
    pub async fn connect_paired(&self) -> Result<usize> {
        let mut connected = 0;
        for device in self.registry.list_paired().await? {
            match self.connections.connect(&device.id).await {
                Ok(()) => connected += 1,
                Err(err) => debug!(device_id = %device.id, error = %err, "paired device unreachable"),
            }
        }
        Ok(connected)
    }

    pub async fn unpair(&self, device_id: &DeviceId) -> Result<()> {
        self.transfers.cancel_for_device(device_id);
        self.connections.unpair(device_id).await
    }

    /// Disconnect, cancel its transfers, drop its key and delete the row.
    pub async fn forget_device(&self, device_id: &DeviceId) -> Result<()> {
        let cancelled = self.transfers.cancel_for_device(device_id);
        if cancelled > 0 {
            info!(device_id = %device_id, cancelled, "transfers cancelled for forgotten device");
        }
        self.connections.forget(device_id).await?;
        self.router.forget_peer(device_id);
        Ok(())
    }

    pub async fn send_file(&self, device_id: &DeviceId, path: &Path) -> Result<FileTransfer> {
        self.transfers.send_file(device_id, path).await
    }

    /// Fails without sending when clipboard sync is off or the text looks
    /// sensitive.
    pub async fn send_clipboard(&self, device_id: &DeviceId, content: impl Into<String>) -> Result<()> {
        let content = content.into();
        self.router.admit_outbound_clipboard(&content)?;
        let payload = ClipboardContentPayload {
            content: content.clone(),
        };
        self.send(device_id, payload.into_message()?).await?;
        self.router.remember_clipboard(&content, ClipboardSource::Local);
        Ok(())
    }

    pub fn clipboard_history(&self) -> Vec<ClipboardEntry> {
        self.router.clipboard_history()
    }

    pub async fn request_clipboard(&self, device_id: &DeviceId) -> Result<()> {
        self.send(device_id, WinuxMessage::clipboard_request()).await
    }

    pub async fn request_battery(&self, device_id: &DeviceId) -> Result<()> {
        self.send(device_id, WinuxMessage::battery_request()).await
    }

    /// Last battery status the peer reported.
    pub fn battery(&self, device_id: &DeviceId) -> Option<BatteryStatusPayload> {
        self.router.battery(device_id)
    }

    pub fn capabilities(&self, device_id: &DeviceId) -> Option<CapabilitiesPayload> {
        self.router.capabilities(device_id)
    }

    pub async fn send_media_control(
        &self,
        device_id: &DeviceId,
        action: MediaAction,
        value: Option<i64>,
    ) -> Result<()> {
        let payload = MediaControlPayload { action, value };
        self.send(device_id, payload.into_message()?).await
    }

    pub async fn send_media_state(&self, device_id: &DeviceId, state: &MediaStatePayload) -> Result<()> {
        self.send(device_id, state.into_message()?).await
    }

    pub async fn send_command(&self, device_id: &DeviceId, command: RemoteCommand) -> Result<()> {
        self.send(device_id, WinuxMessage::empty(command_type(command)))
            .await
    }

    pub async fn forward_notification(
        &self,
        device_id: &DeviceId,
        notification: &NotificationPayload,
    ) -> Result<()> {
        self.send(device_id, notification.into_message()?).await
    }

    pub async fn dismiss_notification(&self, device_id: &DeviceId, notification_id: &str) -> Result<()> {
        let payload = NotificationDismissPayload {
            id: notification_id.to_string(),
        };
        self.send(device_id, payload.into_message()?).await
    }

    /// Close every session and stop background work.
    pub async fn shutdown(&self) {
        self.pairing.cancel().await;
        self.transfers.shutdown();
        self.connections.disconnect_all().await;
        for task in self.tasks.lock().await.drain(..) {
            task.abort();
        }
        info!("application stopped");
    }

    /// Send to a peer unless it told us it does not accept the type.
    async fn send(&self, device_id: &DeviceId, message: WinuxMessage) -> Result<()> {
        if let Some(caps) = self.router.capabilities(device_id) {
            if !caps.accepts(message.message_type()) {
                anyhow::bail!(
                    "device {device_id} does not accept {}",
                    message.message_type()
                );
            }
        }
        let message_type = message.message_type().clone();
        self.connections
            .send_to(device_id, message)
            .await
            .with_context(|| format!("send {message_type} to {device_id}"))
    }
}

fn command_type(command: RemoteCommand) -> MessageType {
    match command {
        RemoteCommand::Ring => MessageType::CommandRing,
        RemoteCommand::FindPhone => MessageType::CommandFindPhone,
        RemoteCommand::Lock => MessageType::CommandLock,
        RemoteCommand::Screenshot => MessageType::CommandScreenshot,
    }
}

/// Tell the orchestrator when its peer drops so the attempt fails fast.
fn spawn_connection_watcher(
    mut events: broadcast::Receiver<ConnectionEvent>,
    pairing: PairingOrchestrator,
) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            loop {
                match events.recv().await {
                    Ok(ConnectionEvent::Disconnected { device_id, reason }) => {
                        debug!(device_id = %device_id, reason = ?reason, "session ended");
                        pairing.handle_disconnect(&device_id).await;
                    }
                    Ok(ConnectionEvent::PairingRevoked { device_id }) => {
                        info!(device_id = %device_id, "pairing revoked, re-pairing required");
                    }
                    Ok(ConnectionEvent::Connected { .. }) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        debug!(skipped = n, "connection events lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        }
        .instrument(info_span!("connection.watcher")),
    )
}
