//! File-transfer channel: one TCP connection per transfer, preamble then raw bytes.

mod preamble;
mod stream;

use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tracing::{debug, info};
use wc_core::error::NetworkError;

pub use preamble::{TransferPreamble, MAX_PREAMBLE_STRING_BYTES};
pub use stream::{receive_stream, send_stream, sha256_file, ReceivedStream};

/// Listener for inbound file-transfer connections.
pub struct TransferListener {
    listener: TcpListener,
}

impl TransferListener {
    pub async fn bind(address: &str) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| NetworkError::BindFailed {
                address: address.to_string(),
                reason: err.to_string(),
            })?;
        info!(address = %address, "transfer listener bound");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    pub async fn accept(&self) -> Result<(TcpStream, SocketAddr), NetworkError> {
        let (stream, peer) = self.listener.accept().await?;
        debug!(peer = %peer, "accepted transfer connection");
        Ok((stream, peer))
    }
}

/// Open the data connection announced in `file_transfer_accept`.
pub async fn dial(address: &str, port: u16, connect_timeout: Duration) -> Result<TcpStream, NetworkError> {
    let target = format_endpoint(address, port);
    match timeout(connect_timeout, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(err)) => Err(NetworkError::ConnectFailed {
            address: target,
            reason: err.to_string(),
        }),
        Err(_) => Err(NetworkError::Timeout(connect_timeout)),
    }
}

/// `host:port`, bracketing bare IPv6 literals.
pub fn format_endpoint(address: &str, port: u16) -> String {
    if address.contains(':') && !address.starts_with('[') {
        format!("[{address}]:{port}")
    } else {
        format!("{address}:{port}")
    }
}
