//! Preamble written at the head of every file-transfer connection.
//!
//! ```text
//! u32 BE len | transfer id | u32 BE len | file name | u64 BE size | u32 BE len | mime type
//! ```
//!
//! Strings are UTF-8, at most [`MAX_PREAMBLE_STRING_BYTES`] each. Raw file
//! bytes follow immediately.

use std::io;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{trace, warn};
use wc_core::error::TransferError;
use wc_core::ids::TransferId;

/// Upper bound for each preamble string (4 KiB).
pub const MAX_PREAMBLE_STRING_BYTES: usize = 4 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPreamble {
    pub transfer_id: TransferId,
    pub file_name: String,
    pub file_size: u64,
    pub mime_type: String,
}

impl TransferPreamble {
    pub async fn write_to<W>(&self, writer: &mut W) -> Result<(), TransferError>
    where
        W: AsyncWrite + Unpin,
    {
        write_string(writer, "transfer_id", self.transfer_id.as_str()).await?;
        write_string(writer, "file_name", &self.file_name).await?;
        trace!(stage = "write_file_size", size = self.file_size, "writing file size");
        writer.write_all(&self.file_size.to_be_bytes()).await?;
        write_string(writer, "mime_type", &self.mime_type).await?;
        writer.flush().await?;
        Ok(())
    }

    pub async fn read_from<R>(reader: &mut R) -> Result<Self, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        let transfer_id = read_string(reader, "transfer_id").await?;
        let file_name = read_string(reader, "file_name").await?;
        let mut size_buf = [0u8; 8];
        reader
            .read_exact(&mut size_buf)
            .await
            .map_err(|e| eof_as_invalid(e, "file_size"))?;
        let file_size = u64::from_be_bytes(size_buf);
        let mime_type = read_string(reader, "mime_type").await?;

        if transfer_id.is_empty() {
            return Err(TransferError::InvalidPreamble("empty transfer id".into()));
        }
        Ok(Self {
            transfer_id: TransferId::from(transfer_id),
            file_name,
            file_size,
            mime_type,
        })
    }
}

async fn write_string<W>(writer: &mut W, field: &'static str, value: &str) -> Result<(), TransferError>
where
    W: AsyncWrite + Unpin,
{
    let bytes = value.as_bytes();
    if bytes.len() > MAX_PREAMBLE_STRING_BYTES {
        return Err(TransferError::InvalidPreamble(format!(
            "{field} exceeds max: {} > {MAX_PREAMBLE_STRING_BYTES}",
            bytes.len()
        )));
    }
    // Bounded above, fits in u32.
    let len = bytes.len() as u32;
    trace!(stage = "write_len_prefix", field, len, "writing preamble field");
    writer.write_all(&len.to_be_bytes()).await?;
    writer.write_all(bytes).await?;
    Ok(())
}

async fn read_string<R>(reader: &mut R, field: &'static str) -> Result<String, TransferError>
where
    R: AsyncRead + Unpin,
{
    let mut len_buf = [0u8; 4];
    reader
        .read_exact(&mut len_buf)
        .await
        .map_err(|e| eof_as_invalid(e, field))?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_PREAMBLE_STRING_BYTES {
        warn!(stage = "read_len_prefix", field, len, "preamble field too large");
        return Err(TransferError::InvalidPreamble(format!(
            "{field} exceeds max: {len} > {MAX_PREAMBLE_STRING_BYTES}"
        )));
    }

    let mut buf = vec![0u8; len];
    reader
        .read_exact(&mut buf)
        .await
        .map_err(|e| eof_as_invalid(e, field))?;
    String::from_utf8(buf)
        .map_err(|_| TransferError::InvalidPreamble(format!("{field} is not valid utf-8")))
}

fn eof_as_invalid(err: io::Error, field: &'static str) -> TransferError {
    if err.kind() == io::ErrorKind::UnexpectedEof {
        warn!(stage = "read_preamble", field, "unexpected eof in preamble");
        TransferError::InvalidPreamble(format!("stream ended inside {field}"))
    } else {
        TransferError::Io(err)
    }
}
