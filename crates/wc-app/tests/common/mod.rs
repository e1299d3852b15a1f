//! Two-node harness: each node is a full `ConnectApp` on localhost with an
//! in-memory registry and recording collaborator ports.

#![allow(dead_code)]

use std::future::Future;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::watch;
use wc_app::{AppDeps, Collaborators, ConnectApp, FeatureSettings, PairingUpdate, TransferSettings};
use wc_core::device::{Device, DeviceType, LocalDevice};
use wc_core::network::{
    BatteryStatusPayload, MediaControlPayload, MediaStatePayload, NotificationPayload,
};
use wc_core::pairing::{PairingPolicy, PairingState};
use wc_core::ports::{
    BatteryPort, ClipboardPort, DeviceRegistryPort, MediaControlPort, NotificationPort,
    RemoteCommand, RemoteCommandPort,
};
use wc_core::DeviceId;
use wc_infra::{IdentityKeyPair, InMemoryDeviceRegistry, X25519KeyAgreement};
use tokio::net::TcpStream;
use wc_core::network::{MessagePayload, WinuxMessage};
use wc_network::framing::{control_framed, encode_line, ControlFramed};
use wc_network::{ControlListener, TransferListener, TransportConfig};

pub const WAIT: Duration = Duration::from_secs(10);

/// Records what peers asked this host to do.
#[derive(Default)]
pub struct RecordingPorts {
    pub clipboard: Mutex<Option<String>>,
    pub notifications: Mutex<Vec<NotificationPayload>>,
    pub commands: Mutex<Vec<RemoteCommand>>,
    pub media: Mutex<Vec<MediaControlPayload>>,
    pub battery: Option<BatteryStatusPayload>,
}

#[async_trait]
impl NotificationPort for RecordingPorts {
    async fn show(&self, _from: &DeviceId, notification: NotificationPayload) -> anyhow::Result<()> {
        self.notifications.lock().unwrap().push(notification);
        Ok(())
    }

    async fn dismiss(&self, _from: &DeviceId, id: &str) -> anyhow::Result<()> {
        self.notifications.lock().unwrap().retain(|n| n.id != id);
        Ok(())
    }

    async fn invoke_action(&self, _from: &DeviceId, _id: &str, _action: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn active(&self) -> anyhow::Result<Vec<NotificationPayload>> {
        Ok(self.notifications.lock().unwrap().clone())
    }
}

#[async_trait]
impl ClipboardPort for RecordingPorts {
    async fn read_text(&self) -> anyhow::Result<Option<String>> {
        Ok(self.clipboard.lock().unwrap().clone())
    }

    async fn write_text(&self, text: &str) -> anyhow::Result<()> {
        *self.clipboard.lock().unwrap() = Some(text.to_string());
        Ok(())
    }
}

#[async_trait]
impl MediaControlPort for RecordingPorts {
    async fn apply(&self, _from: &DeviceId, control: MediaControlPayload) -> anyhow::Result<()> {
        self.media.lock().unwrap().push(control);
        Ok(())
    }

    async fn current_state(&self) -> anyhow::Result<Option<MediaStatePayload>> {
        Ok(None)
    }

    async fn remote_state_changed(&self, _from: &DeviceId, _state: MediaStatePayload) -> anyhow::Result<()> {
        Ok(())
    }
}

#[async_trait]
impl RemoteCommandPort for RecordingPorts {
    async fn execute(&self, _from: &DeviceId, command: RemoteCommand) -> anyhow::Result<()> {
        self.commands.lock().unwrap().push(command);
        Ok(())
    }
}

#[async_trait]
impl BatteryPort for RecordingPorts {
    async fn local_status(&self) -> anyhow::Result<Option<BatteryStatusPayload>> {
        Ok(self.battery)
    }
}

pub struct Node {
    pub app: ConnectApp,
    pub registry: Arc<InMemoryDeviceRegistry>,
    pub keys: Arc<X25519KeyAgreement>,
    pub ports: Arc<RecordingPorts>,
    pub control_port: u16,
    pub transfer_port: u16,
    pub download_dir: tempfile::TempDir,
    _shutdown: watch::Sender<bool>,
}

pub struct NodeOptions {
    pub name: &'static str,
    pub device_type: DeviceType,
    pub auto_accept: bool,
    pub battery: Option<BatteryStatusPayload>,
    pub features: FeatureSettings,
    /// Port put in `file_transfer_accept` instead of the real listener.
    pub advertised_transfer_port: Option<u16>,
}

impl NodeOptions {
    pub fn desktop() -> Self {
        Self {
            name: "Desktop",
            device_type: DeviceType::Desktop,
            auto_accept: false,
            battery: None,
            features: FeatureSettings::default(),
            advertised_transfer_port: None,
        }
    }

    pub fn phone() -> Self {
        Self {
            name: "Phone",
            device_type: DeviceType::Phone,
            auto_accept: false,
            battery: None,
            features: FeatureSettings::default(),
            advertised_transfer_port: None,
        }
    }
}

impl Node {
    pub async fn start(options: NodeOptions) -> Node {
        let local = LocalDevice {
            id: DeviceId::new(),
            name: options.name.to_string(),
            hostname: format!("{}-host", options.name.to_lowercase()),
            device_type: options.device_type,
        };
        let registry = Arc::new(InMemoryDeviceRegistry::new());
        let keys = Arc::new(X25519KeyAgreement::new(IdentityKeyPair::generate()));
        let ports = Arc::new(RecordingPorts {
            battery: options.battery,
            ..RecordingPorts::default()
        });
        let download_dir = tempfile::tempdir().unwrap();

        let control = ControlListener::bind("127.0.0.1:0").await.unwrap();
        let control_port = control.local_addr().unwrap().port();
        let transfers = TransferListener::bind("127.0.0.1:0").await.unwrap();
        let transfer_port = transfers.local_addr().unwrap().port();

        let app = ConnectApp::start(AppDeps {
            local,
            registry: registry.clone(),
            keys: keys.clone(),
            ports: Collaborators {
                notifications: ports.clone(),
                clipboard: ports.clone(),
                media: ports.clone(),
                commands: ports.clone(),
                battery: ports.clone(),
            },
            transport: TransportConfig::default(),
            pairing: PairingPolicy::default(),
            transfers: TransferSettings {
                download_dir: download_dir.path().to_path_buf(),
                chunk_size: 64 * 1024,
                auto_accept: options.auto_accept,
                response_timeout: Duration::from_secs(5),
                connect_timeout: Duration::from_secs(5),
                idle_timeout: Duration::from_secs(5),
                advertised_address: "127.0.0.1".to_string(),
                advertised_port: options.advertised_transfer_port.unwrap_or(transfer_port),
            },
            features: options.features,
        })
        .unwrap();

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        app.serve_control(control, shutdown_rx.clone()).await;
        app.serve_transfers(transfers, shutdown_rx).await;

        Node {
            app,
            registry,
            keys,
            ports,
            control_port,
            transfer_port,
            download_dir,
            _shutdown: shutdown_tx,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.app.local().id.clone()
    }

    pub fn download_path(&self, name: &str) -> PathBuf {
        self.download_dir.path().join(name)
    }

    /// Make `other` known to this node, as discovery would.
    pub async fn learn(&self, other: &Node) {
        let local = other.app.local();
        let mut device = Device::new(
            local.name.clone(),
            local.hostname.clone(),
            "127.0.0.1",
            other.control_port,
            local.device_type,
            Utc::now(),
        );
        device.id = local.id.clone();
        self.registry.insert(device).await.unwrap();
    }

    /// Connect to `other` and wait until both ends see the session.
    pub async fn connect_to(&self, other: &Node) {
        self.learn(other).await;
        self.app.connect(&other.id()).await.unwrap();
        let me = self.id();
        eventually(|| async { other.app.connections().is_connected(&me).await }).await;
    }

    /// Connect, pair with the PIN `other` shows, and wait until both
    /// sessions carry sealed traffic.
    pub async fn pair_with(&self, other: &Node) {
        self.connect_to(other).await;
        let mut updates = other.app.pairing().subscribe();
        self.app.pairing().start_pairing(&other.id()).await.unwrap();
        let pin = tokio::time::timeout(WAIT, async {
            loop {
                if let PairingUpdate::ShowPin { pin, .. } = updates.recv().await.unwrap() {
                    return pin;
                }
            }
        })
        .await
        .expect("peer never showed a pin");
        self.wait_for_pairing(|s| *s == PairingState::WaitingForConfirmation)
            .await;
        self.app.pairing().submit_pin(&pin).await.unwrap();
        assert_eq!(
            self.wait_for_pairing(|s| !s.is_in_flight()).await,
            PairingState::Paired
        );
        assert_eq!(
            other.wait_for_pairing(|s| !s.is_in_flight()).await,
            PairingState::Paired
        );

        let (me, peer) = (self.id(), other.id());
        eventually(|| async {
            self.app.connections().is_authenticated(&peer).await
                && other.app.connections().is_authenticated(&me).await
        })
        .await;
    }

    pub async fn wait_for_pairing(&self, done: impl Fn(&PairingState) -> bool) -> PairingState {
        let mut rx = self.app.pairing().watch_state();
        let state = tokio::time::timeout(WAIT, rx.wait_for(|s| done(s)))
            .await
            .expect("pairing state timeout")
            .expect("pairing state channel closed")
            .clone();
        state
    }
}

/// A bare TCP client on `node`'s control port that speaks the wire format
/// by hand. Sends a plain `hello` claiming `claimed_id`.
pub async fn raw_peer(node: &Node, claimed_id: DeviceId, name: &str) -> ControlFramed<TcpStream> {
    use futures::SinkExt;

    let stream = TcpStream::connect(("127.0.0.1", node.control_port)).await.unwrap();
    let mut framed = control_framed(stream);
    let hello = LocalDevice {
        id: claimed_id,
        name: name.to_string(),
        hostname: "intruder-host".to_string(),
        device_type: DeviceType::Tablet,
    }
    .hello();
    let line = encode_line(&hello.into_message().unwrap(), None).unwrap();
    framed.send(line).await.unwrap();
    framed
}

/// Write one plain JSON line.
pub async fn send_plain(framed: &mut ControlFramed<TcpStream>, message: WinuxMessage) {
    use futures::SinkExt;
    framed.send(encode_line(&message, None).unwrap()).await.unwrap();
}

/// Collect message types until the peer closes or goes quiet for `quiet`.
pub async fn drain_types(framed: &mut ControlFramed<TcpStream>, quiet: Duration) -> Vec<String> {
    use futures::StreamExt;

    let mut seen = Vec::new();
    while let Ok(Some(Ok(line))) = tokio::time::timeout(quiet, framed.next()).await {
        match WinuxMessage::from_json(&line) {
            Ok(message) => seen.push(message.message_type().to_string()),
            Err(_) => seen.push("<sealed>".to_string()),
        }
    }
    seen
}

/// Poll `check` until it holds or [`WAIT`] elapses.
pub async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    tokio::time::timeout(WAIT, async {
        while !check().await {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}
