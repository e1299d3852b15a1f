//! Inbound message router.
//!
//! Consumes the merged inbound stream of every transport and dispatches each
//! message by type: collaborator ports for notifications, clipboard, media,
//! commands and battery; the pairing orchestrator for `pair_*`; the
//! file-transfer service for `file_transfer_*`.
//!
//! Messages are handled one at a time, in arrival order. Only handshakes
//! (`hello`, `pair_*`) are accepted from a session that has not proven the
//! paired key; everything else is dropped with a warning.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::mpsc;
use tracing::{debug, info, info_span, warn, Instrument};
use wc_core::network::{
    BatteryStatusPayload, CapabilitiesPayload, ClipboardContentPayload, HelloPayload,
    MediaControlPayload, MediaStatePayload, MessagePayload, MessageType,
    NotificationActionPayload, NotificationDismissPayload, NotificationPayload, WinuxMessage,
};
use wc_core::ports::{
    BatteryPort, ClipboardPort, DeviceRegistryPort, MediaControlPort, NotificationPort,
    RemoteCommand, RemoteCommandPort,
};
use wc_core::clipboard::{looks_sensitive, ClipboardEntry, ClipboardHistory, ClipboardSource};
use wc_core::DeviceId;

use crate::connection::ConnectionManager;
use crate::events::InboundMessage;
use crate::file_transfer::FileTransferService;
use crate::pairing::PairingOrchestrator;

/// Platform collaborators reached by inbound messages.
#[derive(Clone)]
pub struct Collaborators {
    pub notifications: Arc<dyn NotificationPort>,
    pub clipboard: Arc<dyn ClipboardPort>,
    pub media: Arc<dyn MediaControlPort>,
    pub commands: Arc<dyn RemoteCommandPort>,
    pub battery: Arc<dyn BatteryPort>,
}

/// Clipboard and media switches, from the `[clipboard]` and `[media]`
/// config sections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeatureSettings {
    pub clipboard_sync: bool,
    pub filter_sensitive: bool,
    pub clipboard_history: usize,
    pub allow_remote_media_control: bool,
}

impl Default for FeatureSettings {
    fn default() -> Self {
        Self {
            clipboard_sync: true,
            filter_sensitive: true,
            clipboard_history: 100,
            allow_remote_media_control: true,
        }
    }
}

/// What peers told us about themselves.
#[derive(Default)]
struct PeerState {
    capabilities: HashMap<DeviceId, CapabilitiesPayload>,
    battery: HashMap<DeviceId, BatteryStatusPayload>,
}

pub struct MessageRouter {
    connections: Arc<ConnectionManager>,
    registry: Arc<dyn DeviceRegistryPort>,
    pairing: PairingOrchestrator,
    transfers: Arc<FileTransferService>,
    ports: Collaborators,
    settings: FeatureSettings,
    peers: RwLock<PeerState>,
    history: Mutex<ClipboardHistory>,
}

impl MessageRouter {
    pub fn new(
        connections: Arc<ConnectionManager>,
        registry: Arc<dyn DeviceRegistryPort>,
        pairing: PairingOrchestrator,
        transfers: Arc<FileTransferService>,
        ports: Collaborators,
        settings: FeatureSettings,
    ) -> Self {
        let history = ClipboardHistory::new(settings.clipboard_history);
        Self {
            connections,
            registry,
            pairing,
            transfers,
            ports,
            settings,
            peers: RwLock::new(PeerState::default()),
            history: Mutex::new(history),
        }
    }

    /// Route until every sender of `inbound` is gone.
    pub async fn run(self: Arc<Self>, mut inbound: mpsc::Receiver<InboundMessage>) {
        async move {
            while let Some(InboundMessage {
                device_id,
                message,
                authenticated,
            }) = inbound.recv().await
            {
                if let Err(err) = self.route(&device_id, &message, authenticated).await {
                    warn!(
                        device_id = %device_id,
                        message_type = %message.message_type(),
                        error = %err,
                        "failed to handle message"
                    );
                }
            }
            debug!("inbound stream closed");
        }
        .instrument(info_span!("router"))
        .await
    }

    /// Last `capabilities` received from `device_id`.
    pub fn capabilities(&self, device_id: &DeviceId) -> Option<CapabilitiesPayload> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .capabilities
            .get(device_id)
            .cloned()
    }

    /// Last `battery_status` received from `device_id`.
    pub fn battery(&self, device_id: &DeviceId) -> Option<BatteryStatusPayload> {
        self.peers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .battery
            .get(device_id)
            .copied()
    }

    /// Clipboard texts sent or written, newest first.
    pub fn clipboard_history(&self) -> Vec<ClipboardEntry> {
        self.history.lock().unwrap_or_else(|e| e.into_inner()).entries()
    }

    /// Refuse clipboard text that must not leave this device.
    pub fn admit_outbound_clipboard(&self, content: &str) -> Result<()> {
        if !self.settings.clipboard_sync {
            anyhow::bail!("clipboard sync is disabled");
        }
        if self.settings.filter_sensitive && looks_sensitive(content) {
            anyhow::bail!("clipboard text looks sensitive, not sent");
        }
        Ok(())
    }

    pub fn remember_clipboard(&self, content: &str, source: ClipboardSource) {
        self.history
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(content, source, Utc::now());
    }

    /// Forget everything stored for `device_id`.
    pub fn forget_peer(&self, device_id: &DeviceId) {
        let mut peers = self.peers.write().unwrap_or_else(|e| e.into_inner());
        peers.capabilities.remove(device_id);
        peers.battery.remove(device_id);
    }

    pub async fn route(&self, from: &DeviceId, message: &WinuxMessage, authenticated: bool) -> Result<()> {
        let message_type = message.message_type();
        if !authenticated && !message_type.is_handshake() {
            warn!(
                device_id = %from,
                message_type = %message_type,
                "dropping message from unauthenticated session"
            );
            return Ok(());
        }
        if message_type.is_pairing() {
            return self.pairing.handle_message(from, message).await;
        }
        if message_type.is_file_transfer() {
            return self.transfers.handle_message(from, message).await;
        }

        match message_type {
            MessageType::Hello if authenticated => self.refresh_name(from, message.payload_as()?).await,
            MessageType::Hello => {
                debug!(device_id = %from, "hello before key proof, name kept");
                Ok(())
            }
            MessageType::Capabilities => {
                let caps: CapabilitiesPayload = message.payload_as()?;
                debug!(device_id = %from, incoming = caps.incoming.len(), "peer capabilities");
                self.peers
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .capabilities
                    .insert(from.clone(), caps);
                // Right after pairing only the initiator has announced.
                self.connections.announce_capabilities(from).await;
                Ok(())
            }

            MessageType::Notification => {
                let notification: NotificationPayload = message.payload_as()?;
                self.ports.notifications.show(from, notification).await
            }
            MessageType::NotificationAction => {
                let action: NotificationActionPayload = message.payload_as()?;
                self.ports
                    .notifications
                    .invoke_action(from, &action.id, &action.action)
                    .await
            }
            MessageType::NotificationDismiss => {
                let dismiss: NotificationDismissPayload = message.payload_as()?;
                self.ports.notifications.dismiss(from, &dismiss.id).await
            }

            MessageType::ClipboardContent => {
                let clipboard: ClipboardContentPayload = message.payload_as()?;
                if !self.settings.clipboard_sync {
                    debug!(device_id = %from, "clipboard sync disabled, content ignored");
                    return Ok(());
                }
                if self.settings.filter_sensitive && looks_sensitive(&clipboard.content) {
                    info!(device_id = %from, len = clipboard.content.len(), "sensitive clipboard text not written");
                    return Ok(());
                }
                self.ports.clipboard.write_text(&clipboard.content).await?;
                self.remember_clipboard(&clipboard.content, ClipboardSource::Remote(from.clone()));
                Ok(())
            }
            MessageType::ClipboardRequest => {
                if !self.settings.clipboard_sync {
                    debug!(device_id = %from, "clipboard sync disabled, request not answered");
                    return Ok(());
                }
                match self.ports.clipboard.read_text().await? {
                    Some(content) if self.admit_outbound_clipboard(&content).is_ok() => {
                        self.reply(from, &ClipboardContentPayload { content: content.clone() })
                            .await?;
                        self.remember_clipboard(&content, ClipboardSource::Local);
                        Ok(())
                    }
                    Some(_) => {
                        info!(device_id = %from, "local clipboard looks sensitive, request not answered");
                        Ok(())
                    }
                    None => {
                        debug!(device_id = %from, "clipboard empty, request not answered");
                        Ok(())
                    }
                }
            }

            MessageType::MediaControl => {
                if !self.settings.allow_remote_media_control {
                    warn!(device_id = %from, "remote media control disabled, command ignored");
                    return Ok(());
                }
                let control: MediaControlPayload = message.payload_as()?;
                self.ports.media.apply(from, control).await?;
                if let Some(state) = self.ports.media.current_state().await? {
                    self.reply(from, &state).await?;
                }
                Ok(())
            }
            MessageType::MediaState => {
                let state: MediaStatePayload = message.payload_as()?;
                self.ports.media.remote_state_changed(from, state).await
            }

            MessageType::CommandRing => self.command(from, RemoteCommand::Ring).await,
            MessageType::CommandFindPhone => self.command(from, RemoteCommand::FindPhone).await,
            MessageType::CommandLock => self.command(from, RemoteCommand::Lock).await,
            MessageType::CommandScreenshot => self.command(from, RemoteCommand::Screenshot).await,

            MessageType::BatteryStatus => {
                let status: BatteryStatusPayload = message.payload_as()?;
                if status.threshold_event {
                    info!(device_id = %from, level = status.level, "peer battery crossed threshold");
                }
                self.peers
                    .write()
                    .unwrap_or_else(|e| e.into_inner())
                    .battery
                    .insert(from.clone(), status);
                Ok(())
            }
            MessageType::BatteryRequest => match self.ports.battery.local_status().await? {
                Some(status) => self.reply(from, &status).await,
                None => {
                    debug!(device_id = %from, "no local battery, request not answered");
                    Ok(())
                }
            },

            // Consumed by the transport; nothing to do if one slips through.
            MessageType::Ping | MessageType::Pong | MessageType::Disconnect => Ok(()),
            other => {
                debug!(device_id = %from, message_type = %other, "unhandled message ignored");
                Ok(())
            }
        }
    }

    async fn command(&self, from: &DeviceId, command: RemoteCommand) -> Result<()> {
        info!(device_id = %from, command = ?command, "remote command");
        self.ports.commands.execute(from, command).await
    }

    /// A `hello` after connect may carry a new display name.
    async fn refresh_name(&self, from: &DeviceId, hello: HelloPayload) -> Result<()> {
        let Some(mut device) = self.registry.get(from).await? else {
            return Ok(());
        };
        let same_host = hello.hostname.as_deref().map_or(true, |h| h == device.hostname);
        if device.name == hello.device_name && same_host {
            return Ok(());
        }
        device.name = hello.device_name;
        if let Some(hostname) = hello.hostname {
            device.hostname = hostname;
        }
        self.registry
            .update(device)
            .await
            .context("refresh device name")?;
        Ok(())
    }

    async fn reply<P: MessagePayload>(&self, to: &DeviceId, payload: &P) -> Result<()> {
        self.connections
            .send_to(to, payload.into_message()?)
            .await
            .with_context(|| format!("reply to {to}"))
    }
}
