//! Discovery registrar: folds mDNS results into the device registry.
//!
//! Discovery repeats itself freely; `upsert_discovered` coalesces the
//! repeats into one row per device.

use std::sync::Arc;

use tracing::{debug, info, info_span, warn, Instrument};
use wc_core::network::DiscoveryEvent;
use wc_core::ports::DeviceRegistryPort;
use wc_network::DiscoveryStream;

pub struct DiscoveryRegistrar {
    registry: Arc<dyn DeviceRegistryPort>,
}

impl DiscoveryRegistrar {
    pub fn new(registry: Arc<dyn DeviceRegistryPort>) -> Self {
        Self { registry }
    }

    /// Consume `stream` until it reports `Stopped` or closes.
    pub async fn run(self, mut stream: DiscoveryStream) {
        async move {
            while let Some(event) = stream.recv().await {
                if !self.handle(event).await {
                    break;
                }
            }
            debug!("discovery stream finished");
        }
        .instrument(info_span!("discovery.registrar"))
        .await
    }

    /// Returns `false` once the stream is over.
    pub async fn handle(&self, event: DiscoveryEvent) -> bool {
        match event {
            DiscoveryEvent::PeerFound(peer) => match self.registry.upsert_discovered(&peer).await {
                Ok(device) => {
                    debug!(
                        device_id = %device.id,
                        name = %device.name,
                        address = %device.ip_address,
                        port = device.port,
                        paired = device.is_paired,
                        "peer registered"
                    );
                }
                Err(err) => warn!(name = %peer.name, error = %err, "failed to register discovered peer"),
            },
            DiscoveryEvent::PeerLost { name } => info!(name = %name, "peer left the network"),
            DiscoveryEvent::Error(reason) => warn!(reason = %reason, "discovery error"),
            DiscoveryEvent::Stopped => return false,
        }
        true
    }
}
