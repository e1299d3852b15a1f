//! Daemon run loop: listeners, discovery and shutdown.

use anyhow::Context;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};
use wc_app::{
    ConnectApp, ConnectionEvent, DiscoveryRegistrar, PairingUpdate, TransferUpdate,
};
use wc_core::config::AppConfig;
use wc_core::TransferState;
use wc_network::{ControlListener, DiscoveryService, TransferListener};

use super::wiring::wire_app;

/// Run the daemon until Ctrl-C.
pub async fn run_app(config: AppConfig) -> anyhow::Result<()> {
    let wired = wire_app(&config).await?;
    let local = wired.deps.local.clone();
    let registry = wired.deps.registry.clone();
    let app = ConnectApp::start(wired.deps).context("start application")?;

    let control = ControlListener::bind(&format!("0.0.0.0:{}", config.network.control_port))
        .await
        .with_context(|| format!("bind control port {}", config.network.control_port))?;
    let transfers = TransferListener::bind(&format!("0.0.0.0:{}", config.network.transfer_port))
        .await
        .with_context(|| format!("bind transfer port {}", config.network.transfer_port))?;
    info!(
        device_id = %local.id,
        name = %local.name,
        address = %wired.advertised_address,
        control_port = config.network.control_port,
        transfer_port = config.network.transfer_port,
        "winux-connect listening"
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    app.serve_control(control, shutdown_rx.clone()).await;
    app.serve_transfers(transfers, shutdown_rx).await;

    let discovery = if config.network.discovery_enabled {
        let service = DiscoveryService::new(local.clone(), config.network.control_port);
        match service.start().await {
            Ok(stream) => {
                tokio::spawn(
                    DiscoveryRegistrar::new(registry)
                        .run(stream)
                        .instrument(info_span!("discovery")),
                );
                Some(service)
            }
            Err(err) => {
                // 没有组播时仍可通过配对 URI 手动连接
                warn!(error = %err, "discovery unavailable, continuing without it");
                None
            }
        }
    } else {
        info!("discovery disabled by configuration");
        None
    };

    match app.connect_paired().await {
        Ok(count) => info!(connected = count, "reconnected paired devices"),
        Err(err) => warn!(error = %err, "could not list paired devices"),
    }

    let reporter = spawn_event_reporter(&app, config.transfer.auto_accept);

    tokio::signal::ctrl_c()
        .await
        .context("listen for shutdown signal")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    if let Some(service) = discovery {
        service.stop().await;
    }
    reporter.abort();
    app.shutdown().await;
    Ok(())
}

/// Log pairing, transfer and connection events for the headless operator.
fn spawn_event_reporter(app: &ConnectApp, auto_accept: bool) -> JoinHandle<()> {
    let mut pairing = app.pairing().subscribe();
    let mut transfers = app.transfers().subscribe();
    let mut connections = app.subscribe_connections();

    tokio::spawn(
        async move {
            loop {
                tokio::select! {
                    update = pairing.recv() => match update {
                        Ok(update) => report_pairing(update),
                        Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "pairing events lagged"),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    update = transfers.recv() => match update {
                        Ok(update) => report_transfer(update, auto_accept),
                        Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "transfer events lagged"),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = connections.recv() => match event {
                        Ok(event) => report_connection(event),
                        Err(broadcast::error::RecvError::Lagged(n)) => debug!(skipped = n, "connection events lagged"),
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        }
        .instrument(info_span!("events")),
    )
}

fn report_pairing(update: PairingUpdate) {
    match update {
        PairingUpdate::StateChanged(state) => debug!(state = ?state, "pairing state"),
        PairingUpdate::ShowPin { pin, uri } => info!(%pin, %uri, "pairing PIN"),
        PairingUpdate::PinRequested { peer_name } => {
            info!(peer = %peer_name, "enter the PIN shown on the peer")
        }
        PairingUpdate::Finished {
            device_id,
            success,
            error,
        } => info!(device_id = ?device_id, success, error = ?error, "pairing finished"),
    }
}

fn report_transfer(update: TransferUpdate, auto_accept: bool) {
    match update {
        TransferUpdate::Offered(t) => {
            info!(
                transfer_id = %t.id,
                device_id = %t.device_id,
                file = %t.file_name,
                size = t.file_size,
                auto_accept,
                "file offered"
            );
        }
        TransferUpdate::Changed(t) => match t.state {
            TransferState::Completed => {
                info!(transfer_id = %t.id, file = %t.file_name, "transfer completed")
            }
            TransferState::Failed | TransferState::Cancelled => warn!(
                transfer_id = %t.id,
                state = ?t.state,
                error = ?t.error_message,
                "transfer ended"
            ),
            _ => debug!(transfer_id = %t.id, progress = t.progress, "transfer progress"),
        },
    }
}

fn report_connection(event: ConnectionEvent) {
    match event {
        ConnectionEvent::Connected { device_id } => info!(device_id = %device_id, "device connected"),
        ConnectionEvent::Disconnected { device_id, reason } => {
            info!(device_id = %device_id, reason = ?reason, "device disconnected")
        }
        ConnectionEvent::PairingRevoked { device_id } => {
            warn!(device_id = %device_id, "pairing revoked after authentication failure")
        }
    }
}
