//! DNS-SD discovery over mDNS.
//!
//! One [`DiscoveryService`] advertises this host under [`SERVICE_TYPE`] and
//! browses for peers. Results flow through a [`DiscoveryStream`] that always
//! ends with exactly one [`DiscoveryEvent::Stopped`].

use std::collections::HashMap;
use std::net::IpAddr;

use mdns_sd::{ServiceDaemon, ServiceEvent, ServiceInfo};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use wc_core::device::{DeviceType, DiscoveredPeer, LocalDevice};
use wc_core::error::NetworkError;
use wc_core::ids::DeviceId;
use wc_core::network::{DiscoveryEvent, PROTOCOL_VERSION, SERVICE_TYPE};

const TXT_ID: &str = "id";
const TXT_NAME: &str = "name";
const TXT_TYPE: &str = "type";
const TXT_VERSION: &str = "version";

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Receiving half of a discovery session.
pub struct DiscoveryStream {
    rx: mpsc::Receiver<DiscoveryEvent>,
}

impl DiscoveryStream {
    /// Next event, or `None` once `Stopped` has been delivered.
    pub async fn recv(&mut self) -> Option<DiscoveryEvent> {
        self.rx.recv().await
    }
}

struct Running {
    daemon: ServiceDaemon,
    fullname: String,
    stop_tx: watch::Sender<bool>,
    pump: JoinHandle<()>,
}

pub struct DiscoveryService {
    local: LocalDevice,
    port: u16,
    running: Mutex<Option<Running>>,
}

impl DiscoveryService {
    pub fn new(local: LocalDevice, port: u16) -> Self {
        Self {
            local,
            port,
            running: Mutex::new(None),
        }
    }

    /// Advertise and browse. Calling `start` while running restarts the
    /// session; the previous stream receives `Stopped`.
    pub async fn start(&self) -> Result<DiscoveryStream, NetworkError> {
        let mut running = self.running.lock().await;
        if let Some(previous) = running.take() {
            stop_running(previous).await;
        }

        let daemon = ServiceDaemon::new().map_err(discovery_err)?;
        let info = self.service_info()?;
        let fullname = info.get_fullname().to_string();
        daemon.register(info).map_err(discovery_err)?;
        let browse_rx = match daemon.browse(SERVICE_TYPE) {
            Ok(rx) => rx,
            Err(err) => {
                let _ = daemon.shutdown();
                return Err(discovery_err(err));
            }
        };

        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let own_id = self.local.id.clone();
        let own_fullname = fullname.clone();
        let span = info_span!("discovery.pump", service = SERVICE_TYPE);
        let pump = tokio::spawn(
            async move {
                pump_events(browse_rx, tx, stop_rx, own_id, own_fullname).await;
            }
            .instrument(span),
        );

        info!(instance = %fullname, port = self.port, "discovery started");
        *running = Some(Running {
            daemon,
            fullname,
            stop_tx,
            pump,
        });
        Ok(DiscoveryStream { rx })
    }

    /// Unregister, stop browsing and shut the daemon down. Idempotent.
    pub async fn stop(&self) {
        let running = self.running.lock().await.take();
        if let Some(running) = running {
            stop_running(running).await;
            info!("discovery stopped");
        }
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    fn service_info(&self) -> Result<ServiceInfo, NetworkError> {
        let instance = instance_name(&self.local);
        let host = format!("{}.local.", host_label(&self.local.hostname));
        let ip = local_ip_address::local_ip()
            .map(|ip| ip.to_string())
            .unwrap_or_default();

        let mut properties = HashMap::new();
        properties.insert(TXT_ID.to_string(), self.local.id.to_string());
        properties.insert(TXT_NAME.to_string(), self.local.name.clone());
        properties.insert(
            TXT_TYPE.to_string(),
            self.local.device_type.as_str().to_string(),
        );
        properties.insert(TXT_VERSION.to_string(), PROTOCOL_VERSION.to_string());

        ServiceInfo::new(SERVICE_TYPE, &instance, &host, ip, self.port, properties)
            .map(ServiceInfo::enable_addr_auto)
            .map_err(discovery_err)
    }
}

async fn stop_running(running: Running) {
    let Running {
        daemon,
        fullname,
        stop_tx,
        pump,
    } = running;

    let _ = stop_tx.send(true);
    if let Err(err) = pump.await {
        warn!(error = %err, "discovery pump join failed");
    }

    if let Err(err) = daemon.unregister(&fullname) {
        debug!(error = %err, "unregister failed");
    }
    if let Err(err) = daemon.stop_browse(SERVICE_TYPE) {
        debug!(error = %err, "stop_browse failed");
    }
    if let Err(err) = daemon.shutdown() {
        debug!(error = %err, "daemon shutdown failed");
    }
}

async fn pump_events(
    browse_rx: mdns_sd::Receiver<ServiceEvent>,
    tx: mpsc::Sender<DiscoveryEvent>,
    mut stop_rx: watch::Receiver<bool>,
    own_id: DeviceId,
    own_fullname: String,
) {
    loop {
        let event = tokio::select! {
            _ = stop_rx.changed() => break,
            event = browse_rx.recv_async() => match event {
                Ok(event) => event,
                Err(err) => {
                    warn!(error = %err, "browse channel closed unexpectedly");
                    let _ = tx.send(DiscoveryEvent::Error(err.to_string())).await;
                    break;
                }
            },
        };

        let mapped = match event {
            ServiceEvent::ServiceResolved(info) => {
                if info.get_fullname() == own_fullname {
                    continue;
                }
                let peer = peer_from_service(&info);
                if peer.device_id.as_ref() == Some(&own_id) {
                    continue;
                }
                debug!(name = %peer.name, address = %peer.address, port = peer.port, "peer resolved");
                DiscoveryEvent::PeerFound(peer)
            }
            ServiceEvent::ServiceRemoved(_, fullname) => {
                if fullname == own_fullname {
                    continue;
                }
                DiscoveryEvent::PeerLost { name: fullname }
            }
            ServiceEvent::SearchStopped(_) => break,
            _ => continue,
        };

        if tx.send(mapped).await.is_err() {
            // Consumer dropped the stream.
            return;
        }
    }
    let _ = tx.send(DiscoveryEvent::Stopped).await;
}

/// Map a resolved DNS-SD record onto a discovery result.
pub(crate) fn peer_from_service(info: &ServiceInfo) -> DiscoveredPeer {
    let fullname = info.get_fullname();
    let name = info
        .get_property_val_str(TXT_NAME)
        .map(str::to_string)
        .unwrap_or_else(|| {
            fullname
                .strip_suffix(SERVICE_TYPE)
                .unwrap_or(fullname)
                .trim_end_matches('.')
                .to_string()
        });

    DiscoveredPeer {
        device_id: info
            .get_property_val_str(TXT_ID)
            .filter(|id| !id.is_empty())
            .map(DeviceId::from),
        name,
        hostname: info.get_hostname().trim_end_matches('.').to_string(),
        address: preferred_address(info.get_addresses().iter().copied()),
        port: info.get_port(),
        device_type: info
            .get_property_val_str(TXT_TYPE)
            .and_then(|raw| raw.parse::<DeviceType>().ok()),
    }
}

/// IPv4 first, then anything else; empty when the record has no address.
fn preferred_address(addresses: impl Iterator<Item = IpAddr>) -> String {
    let mut addresses: Vec<IpAddr> = addresses.collect();
    addresses.sort_by_key(|ip| (!ip.is_ipv4(), *ip));
    addresses
        .first()
        .map(IpAddr::to_string)
        .unwrap_or_default()
}

fn instance_name(local: &LocalDevice) -> String {
    let name = if local.name.is_empty() {
        local.hostname.as_str()
    } else {
        local.name.as_str()
    };
    // Instance labels must not contain dots.
    name.replace('.', "-")
}

fn host_label(hostname: &str) -> String {
    let label: String = hostname
        .trim_end_matches(".local.")
        .trim_end_matches(".local")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '-' })
        .collect();
    if label.is_empty() {
        "winux-connect".to_string()
    } else {
        label
    }
}

fn discovery_err(err: mdns_sd::Error) -> NetworkError {
    NetworkError::Discovery(err.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(properties: &[(&str, &str)]) -> ServiceInfo {
        ServiceInfo::new(
            SERVICE_TYPE,
            "Pixel 8",
            "pixel-8.local.",
            "192.168.1.42",
            51820,
            properties,
        )
        .unwrap()
    }

    #[test]
    fn resolved_record_maps_txt_fields() {
        let info = record(&[
            ("id", "3b0c6f3e-0000-4000-8000-000000000001"),
            ("name", "Pixel 8"),
            ("type", "phone"),
            ("version", "7"),
        ]);
        let peer = peer_from_service(&info);
        assert_eq!(
            peer.device_id,
            Some(DeviceId::from("3b0c6f3e-0000-4000-8000-000000000001"))
        );
        assert_eq!(peer.name, "Pixel 8");
        assert_eq!(peer.hostname, "pixel-8.local");
        assert_eq!(peer.address, "192.168.1.42");
        assert_eq!(peer.port, 51820);
        assert_eq!(peer.device_type, Some(DeviceType::Phone));
    }

    #[test]
    fn missing_txt_falls_back_to_instance_name() {
        let info = record(&[]);
        let peer = peer_from_service(&info);
        assert_eq!(peer.device_id, None);
        assert_eq!(peer.name, "Pixel 8");
        assert_eq!(peer.device_type, None);
    }

    #[test]
    fn ipv4_is_preferred() {
        let v6: IpAddr = "fe80::1".parse().unwrap();
        let v4: IpAddr = "10.0.0.7".parse().unwrap();
        assert_eq!(preferred_address([v6, v4].into_iter()), "10.0.0.7");
        assert_eq!(preferred_address(std::iter::empty()), "");
    }

    #[test]
    fn host_and_instance_labels_are_sanitized() {
        assert_eq!(host_label("my desk.local."), "my-desk");
        assert_eq!(host_label(""), "winux-connect");
        let local = LocalDevice {
            id: DeviceId::new(),
            name: "v1.2 box".into(),
            hostname: "box".into(),
            device_type: DeviceType::Desktop,
        };
        assert_eq!(instance_name(&local), "v1-2 box");
    }

    #[tokio::test]
    async fn stop_before_start_is_a_no_op() {
        let service = DiscoveryService::new(
            LocalDevice {
                id: DeviceId::new(),
                name: "desk".into(),
                hostname: "desk".into(),
                device_type: DeviceType::Desktop,
            },
            51820,
        );
        service.stop().await;
        service.stop().await;
        assert!(!service.is_running().await);
    }
}
