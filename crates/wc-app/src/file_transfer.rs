//! File-transfer service.
//!
//! Negotiation runs over the control channel (`file_transfer_*` messages);
//! the bytes travel on a dedicated TCP connection per transfer. Every
//! transfer owns one task and one [`CancellationToken`]; the record map is
//! locked only while a record is read or updated.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use wc_core::error::TransferError;
use wc_core::network::{
    FileTransferAcceptPayload, FileTransferCompletePayload, FileTransferErrorPayload,
    FileTransferProgressPayload, FileTransferRejectPayload, FileTransferRequestPayload,
    MessagePayload, MessageType, WinuxMessage,
};
use wc_core::transfer::{mime_from_path, TransferDirection};
use wc_core::{DeviceId, FileTransfer, TransferId, TransferState};
use wc_network::transfer::{dial, receive_stream, send_stream, sha256_file};
use wc_network::{TransferListener, TransferPreamble};

use crate::connection::ConnectionManager;
use crate::events::TransferUpdate;

const PREAMBLE_TIMEOUT: Duration = Duration::from_secs(10);
const CANCELLED_BY_PEER: &str = "cancelled";

/// Runtime settings, resolved by bootstrap from `AppConfig`.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    pub download_dir: PathBuf,
    pub chunk_size: usize,
    pub auto_accept: bool,
    pub response_timeout: Duration,
    pub connect_timeout: Duration,
    /// Longest silence tolerated on an incoming data connection.
    pub idle_timeout: Duration,
    /// Address announced in `file_transfer_accept`.
    pub advertised_address: String,
    /// Port announced in `file_transfer_accept`.
    pub advertised_port: u16,
}

/// Peer answer to one of our requests.
#[derive(Debug)]
enum PeerReply {
    Accepted { address: String, port: u16 },
    Rejected(String),
}

struct Entry {
    transfer: FileTransfer,
    cancel: CancellationToken,
    /// Outgoing: resolves when the peer accepts or rejects.
    reply: Option<oneshot::Sender<PeerReply>>,
    /// Incoming: `file_transfer_accept` was sent, the data connection may come.
    accepted: bool,
}

pub struct FileTransferService {
    connections: Arc<ConnectionManager>,
    settings: TransferSettings,
    records: Mutex<HashMap<TransferId, Entry>>,
    /// Parent of every per-transfer token.
    shutdown: CancellationToken,
    updates_tx: broadcast::Sender<TransferUpdate>,
}

impl FileTransferService {
    pub fn new(connections: Arc<ConnectionManager>, settings: TransferSettings) -> Self {
        let (updates_tx, _) = broadcast::channel(256);
        Self {
            connections,
            settings,
            records: Mutex::new(HashMap::new()),
            shutdown: CancellationToken::new(),
            updates_tx,
        }
    }

    pub fn settings(&self) -> &TransferSettings {
        &self.settings
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransferUpdate> {
        self.updates_tx.subscribe()
    }

    pub fn get(&self, id: &TransferId) -> Option<FileTransfer> {
        self.records().get(id).map(|e| e.transfer.clone())
    }

    /// Every record, oldest first.
    pub fn list_transfers(&self) -> Vec<FileTransfer> {
        let mut all: Vec<FileTransfer> = self.records().values().map(|e| e.transfer.clone()).collect();
        all.sort_by_key(|t| t.created_at);
        all
    }

    pub fn active_transfers(&self) -> Vec<FileTransfer> {
        self.list_transfers()
            .into_iter()
            .filter(|t| !t.is_finished())
            .collect()
    }

    /// Drop finished records. Returns how many were removed.
    pub fn clear_finished(&self) -> usize {
        let mut records = self.records();
        let before = records.len();
        records.retain(|_, e| !e.transfer.is_finished());
        before - records.len()
    }

    /// Offer `path` to `device_id`. Returns once the request is sent; the rest
    /// runs in the transfer's own task and is reported through [`Self::subscribe`].
    pub async fn send_file(self: &Arc<Self>, device_id: &DeviceId, path: &Path) -> Result<FileTransfer> {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("stat {}", path.display()))?;
        if !metadata.is_file() {
            anyhow::bail!("{} is not a regular file", path.display());
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .with_context(|| format!("no usable file name in {}", path.display()))?
            .to_string();
        let checksum = sha256_file(path).await.context("checksum source file")?;

        let mut transfer = FileTransfer::outgoing(
            device_id.clone(),
            file_name,
            metadata.len(),
            mime_from_path(path),
            path.to_path_buf(),
        );
        transfer.checksum = Some(checksum.clone());

        let request = FileTransferRequestPayload {
            transfer_id: transfer.id.clone(),
            file_name: transfer.file_name.clone(),
            file_size: transfer.file_size,
            mime_type: transfer.mime_type.clone(),
            checksum: Some(checksum),
        }
        .into_message()?;

        let (reply_tx, reply_rx) = oneshot::channel();
        let cancel = self.shutdown.child_token();
        self.records().insert(
            transfer.id.clone(),
            Entry {
                transfer: transfer.clone(),
                cancel: cancel.clone(),
                reply: Some(reply_tx),
                accepted: false,
            },
        );
        self.publish(TransferUpdate::Changed(transfer.clone()));

        if let Err(err) = self.connections.send_to(device_id, request).await {
            self.fail(&transfer.id, &err.to_string());
            return Err(err).context("send file_transfer_request");
        }
        info!(
            transfer_id = %transfer.id,
            device_id = %device_id,
            file = %transfer.file_name,
            size = transfer.file_size,
            "file offered"
        );

        let service = self.clone();
        let span = info_span!("transfer.send", transfer_id = %transfer.id);
        let id = transfer.id.clone();
        tokio::spawn(
            async move {
                service.run_outgoing(id, reply_rx, cancel).await;
            }
            .instrument(span),
        );
        Ok(transfer)
    }

    /// Accept a pending incoming transfer.
    pub async fn accept_transfer(&self, id: &TransferId) -> Result<(), TransferError> {
        let device_id = {
            let mut records = self.records();
            let entry = records
                .get_mut(id)
                .filter(|e| e.transfer.direction == TransferDirection::Incoming)
                .ok_or_else(|| TransferError::NotFound(id.clone()))?;
            if entry.transfer.is_finished() {
                return Err(TransferError::AlreadyFinished(id.clone()));
            }
            entry.accepted = true;
            entry.transfer.device_id.clone()
        };
        self.send_accept(id, &device_id).await
    }

    /// Announce the data endpoint. The record must already be marked accepted.
    async fn send_accept(&self, id: &TransferId, device_id: &DeviceId) -> Result<(), TransferError> {
        let accept = FileTransferAcceptPayload {
            transfer_id: id.clone(),
            address: self.settings.advertised_address.clone(),
            port: self.settings.advertised_port,
        };
        if let Err(err) = self.send(device_id, &accept).await {
            self.fail(id, &err);
            return Err(TransferError::Rejected(err));
        }
        info!(transfer_id = %id, "incoming transfer accepted");
        Ok(())
    }

    /// Reject a pending incoming transfer; the record ends `Cancelled`.
    pub async fn reject_transfer(&self, id: &TransferId, reason: &str) -> Result<(), TransferError> {
        let device_id = {
            let records = self.records();
            let entry = records
                .get(id)
                .filter(|e| e.transfer.direction == TransferDirection::Incoming)
                .ok_or_else(|| TransferError::NotFound(id.clone()))?;
            entry.transfer.device_id.clone()
        };
        self.update(id, |t| t.cancel())?;

        let reject = FileTransferRejectPayload {
            transfer_id: id.clone(),
            reason: reason.to_string(),
        };
        if let Err(err) = self.send(&device_id, &reject).await {
            warn!(transfer_id = %id, error = %err, "failed to send file_transfer_reject");
        }
        info!(transfer_id = %id, reason, "incoming transfer rejected");
        Ok(())
    }

    /// Cancel a transfer in either direction and tell the peer.
    pub async fn cancel_transfer(&self, id: &TransferId) -> Result<(), TransferError> {
        let (device_id, token) = {
            let records = self.records();
            let entry = records.get(id).ok_or_else(|| TransferError::NotFound(id.clone()))?;
            (entry.transfer.device_id.clone(), entry.cancel.clone())
        };
        self.update(id, |t| t.cancel())?;
        token.cancel();

        let error = FileTransferErrorPayload {
            transfer_id: id.clone(),
            error: CANCELLED_BY_PEER.to_string(),
        };
        if let Err(err) = self.send(&device_id, &error).await {
            debug!(transfer_id = %id, error = %err, "peer not told about cancellation");
        }
        info!(transfer_id = %id, "transfer cancelled");
        Ok(())
    }

    /// Cancel every active transfer with `device_id` without notifying it.
    pub fn cancel_for_device(&self, device_id: &DeviceId) -> usize {
        let ids: Vec<TransferId> = self
            .records()
            .values()
            .filter(|e| e.transfer.device_id == *device_id && !e.transfer.is_finished())
            .map(|e| e.transfer.id.clone())
            .collect();
        for id in &ids {
            let token = self.records().get(id).map(|e| e.cancel.clone());
            if self.update(id, |t| t.cancel()).is_ok() {
                if let Some(token) = token {
                    token.cancel();
                }
            }
        }
        ids.len()
    }

    /// Stop every transfer task.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Feed one `file_transfer_*` message received from `from`.
    pub async fn handle_message(&self, from: &DeviceId, message: &WinuxMessage) -> Result<()> {
        match message.message_type() {
            MessageType::FileTransferRequest => {
                self.on_request(from, message.payload_as()?).await;
            }
            MessageType::FileTransferAccept => {
                let accept: FileTransferAcceptPayload = message.payload_as()?;
                self.resolve_reply(
                    from,
                    &accept.transfer_id,
                    PeerReply::Accepted {
                        address: accept.address,
                        port: accept.port,
                    },
                );
            }
            MessageType::FileTransferReject => {
                let reject: FileTransferRejectPayload = message.payload_as()?;
                self.resolve_reply(from, &reject.transfer_id, PeerReply::Rejected(reject.reason));
            }
            MessageType::FileTransferProgress => {
                let progress: FileTransferProgressPayload = message.payload_as()?;
                debug!(
                    transfer_id = %progress.transfer_id,
                    bytes = progress.bytes_transferred,
                    progress = progress.progress,
                    "peer progress"
                );
            }
            MessageType::FileTransferComplete => {
                let complete: FileTransferCompletePayload = message.payload_as()?;
                debug!(transfer_id = %complete.transfer_id, "peer reports transfer complete");
            }
            MessageType::FileTransferError => {
                let error: FileTransferErrorPayload = message.payload_as()?;
                self.on_peer_error(from, error);
            }
            other => anyhow::bail!("not a file-transfer message: {other}"),
        }
        Ok(())
    }

    /// Accept data connections until `shutdown` flips.
    pub async fn serve(self: Arc<Self>, listener: TransferListener, mut shutdown: watch::Receiver<bool>) {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(err) => {
                    warn!(error = %err, "transfer accept failed");
                    continue;
                }
            };
            let service = self.clone();
            tokio::spawn(
                async move {
                    if let Err(err) = service.run_incoming(stream).await {
                        warn!(error = %err, "incoming transfer connection dropped");
                    }
                }
                .instrument(info_span!("transfer.receive", peer = %peer)),
            );
        }
        debug!("transfer listener stopped");
    }

    async fn on_request(&self, from: &DeviceId, request: FileTransferRequestPayload) {
        if self.records().contains_key(&request.transfer_id) {
            debug!(transfer_id = %request.transfer_id, "duplicate file_transfer_request ignored");
            return;
        }
        let transfer = FileTransfer::incoming(
            request.transfer_id.clone(),
            from.clone(),
            request.file_name,
            request.file_size,
            request.mime_type,
            request.checksum,
        );
        info!(
            transfer_id = %transfer.id,
            device_id = %from,
            file = %transfer.file_name,
            size = transfer.file_size,
            "incoming file offered"
        );
        let auto_accept = self.settings.auto_accept;
        self.records().insert(
            transfer.id.clone(),
            Entry {
                transfer: transfer.clone(),
                cancel: self.shutdown.child_token(),
                reply: None,
                accepted: auto_accept,
            },
        );

        if auto_accept {
            let id = transfer.id.clone();
            self.publish(TransferUpdate::Changed(transfer));
            if let Err(err) = self.send_accept(&id, from).await {
                warn!(transfer_id = %id, error = %err, "auto-accept failed");
            }
        } else {
            self.publish(TransferUpdate::Offered(transfer));
        }
    }

    fn resolve_reply(&self, from: &DeviceId, id: &TransferId, reply: PeerReply) {
        let sender = {
            let mut records = self.records();
            records
                .get_mut(id)
                .filter(|e| e.transfer.device_id == *from)
                .and_then(|e| e.reply.take())
        };
        match sender {
            Some(sender) => {
                let _ = sender.send(reply);
            }
            None => debug!(transfer_id = %id, "reply for unknown or answered transfer ignored"),
        }
    }

    fn on_peer_error(&self, from: &DeviceId, error: FileTransferErrorPayload) {
        let token = {
            let records = self.records();
            records
                .get(&error.transfer_id)
                .filter(|e| e.transfer.device_id == *from && !e.transfer.is_finished())
                .map(|e| e.cancel.clone())
        };
        let Some(token) = token else {
            debug!(transfer_id = %error.transfer_id, "peer error for inactive transfer");
            return;
        };
        warn!(transfer_id = %error.transfer_id, error = %error.error, "peer aborted transfer");
        if self.update(&error.transfer_id, |t| t.cancel()).is_ok() {
            token.cancel();
        }
    }

    async fn run_outgoing(&self, id: TransferId, reply: oneshot::Receiver<PeerReply>, cancel: CancellationToken) {
        let answer = tokio::select! {
            _ = cancel.cancelled() => return,
            answer = tokio::time::timeout(self.settings.response_timeout, reply) => answer,
        };
        let (address, port) = match answer {
            Ok(Ok(PeerReply::Accepted { address, port })) => (address, port),
            Ok(Ok(PeerReply::Rejected(reason))) => {
                info!(transfer_id = %id, reason = %reason, "transfer rejected by peer");
                self.fail(&id, &format!("rejected: {reason}"));
                return;
            }
            Ok(Err(_)) => return,
            Err(_) => {
                self.fail_and_notify(&id, &TransferError::ResponseTimeout.to_string()).await;
                return;
            }
        };

        match self.stream_outgoing(&id, &address, port, &cancel).await {
            Ok(()) => {
                if self.update(&id, |t| t.complete()).is_ok() {
                    info!(transfer_id = %id, "file sent");
                    let device_id = self.get(&id).map(|t| t.device_id);
                    if let Some(device_id) = device_id {
                        let complete = FileTransferCompletePayload { transfer_id: id.clone() };
                        if let Err(err) = self.send(&device_id, &complete).await {
                            warn!(transfer_id = %id, error = %err, "failed to send file_transfer_complete");
                        }
                    }
                }
            }
            Err(TransferError::Cancelled) => debug!(transfer_id = %id, "send cancelled"),
            Err(err) => self.fail_and_notify(&id, &err.to_string()).await,
        }
    }

    async fn stream_outgoing(
        &self,
        id: &TransferId,
        address: &str,
        port: u16,
        cancel: &CancellationToken,
    ) -> Result<(), TransferError> {
        let transfer = self.get(id).ok_or_else(|| TransferError::NotFound(id.clone()))?;
        let path = transfer
            .local_path
            .clone()
            .ok_or_else(|| TransferError::NotFound(id.clone()))?;

        let mut socket = dial(address, port, self.settings.connect_timeout)
            .await
            .map_err(|err| TransferError::Io(std::io::Error::other(err.to_string())))?;
        let mut source = tokio::fs::File::open(&path).await?;
        self.update(id, |t| t.start())?;

        TransferPreamble {
            transfer_id: transfer.id.clone(),
            file_name: transfer.file_name.clone(),
            file_size: transfer.file_size,
            mime_type: transfer.mime_type.clone(),
        }
        .write_to(&mut socket)
        .await?;

        send_stream(
            &mut source,
            &mut socket,
            transfer.file_size,
            self.settings.chunk_size,
            cancel,
            |sent| self.record_progress(id, sent),
        )
        .await?;
        socket.shutdown().await?;
        Ok(())
    }

    async fn run_incoming(&self, mut socket: TcpStream) -> Result<()> {
        let preamble = tokio::time::timeout(PREAMBLE_TIMEOUT, TransferPreamble::read_from(&mut socket))
            .await
            .context("preamble timed out")??;
        let id = preamble.transfer_id.clone();

        // Claimed under the lock: only the first matching connection moves
        // the record out of Pending.
        let (transfer, cancel) = {
            let mut records = self.records();
            let entry = records
                .get_mut(&id)
                .filter(|e| {
                    e.accepted
                        && e.transfer.direction == TransferDirection::Incoming
                        && e.transfer.state == TransferState::Pending
                        && e.transfer.file_name == preamble.file_name
                        && e.transfer.file_size == preamble.file_size
                })
                .with_context(|| format!("no unclaimed transfer matches preamble {id}"))?;
            entry.transfer.start()?;
            (entry.transfer.clone(), entry.cancel.clone())
        };
        self.publish(TransferUpdate::Changed(transfer.clone()));

        let final_path = unique_destination(&self.settings.download_dir, &transfer.file_name).await?;
        let part_path = part_path(&final_path);
        tokio::fs::create_dir_all(&self.settings.download_dir)
            .await
            .with_context(|| format!("create {}", self.settings.download_dir.display()))?;
        let mut file = tokio::fs::File::create(&part_path)
            .await
            .with_context(|| format!("create {}", part_path.display()))?;

        let result = receive_stream(
            &mut socket,
            &mut file,
            transfer.file_size,
            self.settings.chunk_size,
            self.settings.idle_timeout,
            &cancel,
            |received| self.record_progress(&id, received),
        )
        .await;
        drop(file);

        match result {
            Ok(received) => {
                if let Some(expected) = &transfer.checksum {
                    if !expected.eq_ignore_ascii_case(&received.sha256) {
                        let _ = tokio::fs::remove_file(&part_path).await;
                        let err = TransferError::ChecksumMismatch {
                            expected: expected.clone(),
                            actual: received.sha256,
                        };
                        self.fail(&id, &err.to_string());
                        return Err(err.into());
                    }
                }
                tokio::fs::rename(&part_path, &final_path)
                    .await
                    .with_context(|| format!("rename into {}", final_path.display()))?;
                self.update(&id, |t| {
                    t.local_path = Some(final_path.clone());
                    t.complete()
                })?;
                info!(transfer_id = %id, path = %final_path.display(), bytes = received.bytes, "file received");
                Ok(())
            }
            Err(TransferError::Cancelled) => {
                let _ = tokio::fs::remove_file(&part_path).await;
                debug!(transfer_id = %id, "receive cancelled");
                Ok(())
            }
            Err(err) => {
                // The partial file keeps exactly the bytes written so far.
                self.update(&id, |t| {
                    t.local_path = Some(part_path.clone());
                    Ok(())
                })?;
                self.fail(&id, &err.to_string());
                Err(err.into())
            }
        }
    }

    fn records(&self) -> MutexGuard<'_, HashMap<TransferId, Entry>> {
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Apply `f` to a live record and publish the result.
    fn update<F>(&self, id: &TransferId, f: F) -> Result<FileTransfer, TransferError>
    where
        F: FnOnce(&mut FileTransfer) -> Result<(), TransferError>,
    {
        let snapshot = {
            let mut records = self.records();
            let entry = records.get_mut(id).ok_or_else(|| TransferError::NotFound(id.clone()))?;
            f(&mut entry.transfer)?;
            entry.transfer.clone()
        };
        self.publish(TransferUpdate::Changed(snapshot.clone()));
        Ok(snapshot)
    }

    /// Byte counts are recorded for every chunk; updates go out per percent step.
    fn record_progress(&self, id: &TransferId, bytes: u64) {
        let changed = {
            let mut records = self.records();
            let Some(entry) = records.get_mut(id) else { return };
            let before = entry.transfer.progress;
            if entry.transfer.record_progress(bytes).is_err() {
                return;
            }
            (entry.transfer.progress != before).then(|| entry.transfer.clone())
        };
        if let Some(snapshot) = changed {
            self.publish(TransferUpdate::Changed(snapshot));
        }
    }

    fn fail(&self, id: &TransferId, reason: &str) {
        match self.update(id, |t| t.fail(reason)) {
            Ok(_) => warn!(transfer_id = %id, reason, "transfer failed"),
            Err(err) => debug!(transfer_id = %id, error = %err, "fail on finished transfer ignored"),
        }
    }

    async fn fail_and_notify(&self, id: &TransferId, reason: &str) {
        self.fail(id, reason);
        if let Some(transfer) = self.get(id) {
            let error = FileTransferErrorPayload {
                transfer_id: id.clone(),
                error: reason.to_string(),
            };
            if let Err(err) = self.send(&transfer.device_id, &error).await {
                debug!(transfer_id = %id, error = %err, "peer not told about failure");
            }
        }
    }

    async fn send<P: MessagePayload>(&self, device_id: &DeviceId, payload: &P) -> Result<(), String> {
        let message = payload.into_message().map_err(|e| e.to_string())?;
        self.connections
            .send_to(device_id, message)
            .await
            .map_err(|e| e.to_string())
    }

    fn publish(&self, update: TransferUpdate) {
        let _ = self.updates_tx.send(update);
    }
}

/// Strip directories from a peer-supplied name.
fn sanitize_file_name(name: &str) -> String {
    Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "." && *n != "..")
        .unwrap_or("download")
        .to_string()
}

fn part_path(final_path: &Path) -> PathBuf {
    let mut name = final_path.as_os_str().to_os_string();
    name.push(".part");
    PathBuf::from(name)
}

/// `<dir>/<name>`, or `<dir>/<stem> (n).<ext>` when taken.
async fn unique_destination(dir: &Path, file_name: &str) -> Result<PathBuf> {
    let file_name = sanitize_file_name(file_name);
    let candidate = dir.join(&file_name);
    if !is_taken(&candidate).await {
        return Ok(candidate);
    }

    let as_path = Path::new(&file_name);
    let stem = as_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(&file_name)
        .to_string();
    let extension = as_path.extension().and_then(|e| e.to_str());
    for n in 1..10_000u32 {
        let name = match extension {
            Some(ext) => format!("{stem} ({n}).{ext}"),
            None => format!("{stem} ({n})"),
        };
        let candidate = dir.join(name);
        if !is_taken(&candidate).await {
            return Ok(candidate);
        }
    }
    anyhow::bail!("no free file name for {file_name} in {}", dir.display())
}

async fn is_taken(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(true)
        || tokio::fs::try_exists(part_path(path)).await.unwrap_or(true)
}
