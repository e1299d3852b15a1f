//! Raw byte streaming for file transfers.
//!
//! Both directions move at most `chunk_size` bytes per step and report the
//! running total after every chunk, so progress is strictly increasing.

use std::path::Path;
use std::time::Duration;

use sha2::{Digest, Sha256};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use wc_core::error::TransferError;

/// Outcome of a completed receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedStream {
    pub bytes: u64,
    /// SHA-256 hex of everything written.
    pub sha256: String,
}

/// Copy exactly `file_size` bytes from `reader` to `writer`.
///
/// A source shorter than `file_size` is an I/O error; the receiver would
/// otherwise wait forever for the missing tail.
pub async fn send_stream<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    file_size: u64,
    chunk_size: usize,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<u64, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut sent = 0u64;

    while sent < file_size {
        let want = remaining_chunk(file_size - sent, buf.len());
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            n = reader.read(&mut buf[..want]) => n?,
        };
        if n == 0 {
            warn!(stage = "read_source", sent, expected = file_size, "source ended early");
            return Err(TransferError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!("source ended after {sent} of {file_size} bytes"),
            )));
        }

        tokio::select! {
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            res = writer.write_all(&buf[..n]) => res?,
        }
        sent += n as u64;
        trace!(stage = "write_chunk", len = n, sent, "chunk sent");
        on_progress(sent);
    }

    writer.flush().await?;
    debug!(bytes = sent, "stream sent");
    Ok(sent)
}

/// Read exactly `expected` bytes from `reader` into `writer`, hashing as it goes.
///
/// Early close yields [`TransferError::Truncated`] with the number of bytes
/// already written and flushed. A read that waits longer than `idle` yields
/// [`TransferError::Stalled`].
pub async fn receive_stream<R, W, F>(
    reader: &mut R,
    writer: &mut W,
    expected: u64,
    chunk_size: usize,
    idle: Duration,
    cancel: &CancellationToken,
    mut on_progress: F,
) -> Result<ReceivedStream, TransferError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: FnMut(u64),
{
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut hasher = Sha256::new();
    let mut received = 0u64;

    while received < expected {
        let want = remaining_chunk(expected - received, buf.len());
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                writer.flush().await?;
                return Err(TransferError::Cancelled);
            }
            n = tokio::time::timeout(idle, reader.read(&mut buf[..want])) => match n {
                Ok(n) => n?,
                Err(_) => {
                    writer.flush().await?;
                    warn!(stage = "read_chunk", received, expected, idle = ?idle, "sender went quiet");
                    return Err(TransferError::Stalled { received, idle });
                }
            },
        };
        if n == 0 {
            writer.flush().await?;
            warn!(stage = "read_chunk", received, expected, "peer closed before end of file");
            return Err(TransferError::Truncated { received, expected });
        }

        writer.write_all(&buf[..n]).await?;
        hasher.update(&buf[..n]);
        received += n as u64;
        trace!(stage = "read_chunk", len = n, received, "chunk received");
        on_progress(received);
    }

    writer.flush().await?;
    Ok(ReceivedStream {
        bytes: received,
        sha256: hex::encode(hasher.finalize()),
    })
}

/// Streaming SHA-256 of a file, hex encoded.
pub async fn sha256_file(path: &Path) -> Result<String, TransferError> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn remaining_chunk(remaining: u64, chunk: usize) -> usize {
    usize::try_from(remaining).map_or(chunk, |r| r.min(chunk))
}
