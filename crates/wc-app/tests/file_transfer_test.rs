//! File transfers between two nodes over localhost TCP.

mod common;

use std::time::Duration;

use common::{eventually, Node, NodeOptions, WAIT};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use wc_app::TransferUpdate;
use wc_core::network::{FileTransferRequestPayload, MessagePayload};
use wc_core::ports::RemoteCommand;
use wc_core::{FileTransfer, TransferDirection, TransferId, TransferState};
use wc_network::transfer::dial;
use wc_network::TransferPreamble;

/// Next update for `id` matching `done`.
async fn wait_transfer(
    updates: &mut broadcast::Receiver<TransferUpdate>,
    id: &TransferId,
    done: impl Fn(&FileTransfer) -> bool,
) -> FileTransfer {
    tokio::time::timeout(WAIT, async {
        loop {
            match updates.recv().await {
                Ok(update) if update.transfer().id == *id && done(update.transfer()) => {
                    return update.transfer().clone();
                }
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => panic!("updates closed"),
            }
        }
    })
    .await
    .expect("transfer update timeout")
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Have `from` announce an incoming file to `to` by hand.
async fn announce(from: &Node, to: &Node, id: &TransferId, name: &str, size: u64, checksum: Option<String>) {
    let request = FileTransferRequestPayload {
        transfer_id: id.clone(),
        file_name: name.into(),
        file_size: size,
        mime_type: "application/octet-stream".into(),
        checksum,
    };
    from.app
        .connections()
        .send_to(&to.id(), request.into_message().unwrap())
        .await
        .unwrap();
}

async fn open_data(to: &Node, id: &TransferId, name: &str, size: u64) -> TcpStream {
    let mut socket = dial("127.0.0.1", to.transfer_port, Duration::from_secs(5))
        .await
        .unwrap();
    TransferPreamble {
        transfer_id: id.clone(),
        file_name: name.into(),
        file_size: size,
        mime_type: "application/octet-stream".into(),
    }
    .write_to(&mut socket)
    .await
    .unwrap();
    socket
}

/// Relays the first `limit` bytes of one connection to `target`, then stops
/// reading while holding both ends open.
fn stalling_relay(listener: TcpListener, target: u16, limit: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (mut inbound, _) = listener.accept().await.unwrap();
        let mut outbound = TcpStream::connect(("127.0.0.1", target)).await.unwrap();
        let mut head = vec![0u8; limit];
        inbound.read_exact(&mut head).await.unwrap();
        outbound.write_all(&head).await.unwrap();
        tokio::time::sleep(WAIT * 3).await;
        drop((inbound, outbound));
    })
}

#[tokio::test]
async fn file_arrives_intact_with_checksum() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions {
        auto_accept: true,
        ..NodeOptions::phone()
    })
    .await;
    desktop.pair_with(&phone).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("holiday.jpg");
    let content = pattern(300 * 1024 + 17);
    tokio::fs::write(&source, &content).await.unwrap();

    let mut sent_updates = desktop.app.transfers().subscribe();
    let mut received_updates = phone.app.transfers().subscribe();
    let offered = desktop.app.send_file(&phone.id(), &source).await.unwrap();
    assert_eq!(offered.mime_type, "image/jpeg");
    assert_eq!(offered.state, TransferState::Pending);

    let sent = wait_transfer(&mut sent_updates, &offered.id, FileTransfer::is_finished).await;
    assert_eq!(sent.state, TransferState::Completed);

    let received = wait_transfer(&mut received_updates, &offered.id, FileTransfer::is_finished).await;
    assert_eq!(received.state, TransferState::Completed);
    assert_eq!(received.direction, TransferDirection::Incoming);
    assert_eq!(received.bytes_transferred, content.len() as u64);
    assert_eq!(received.checksum, sent.checksum);

    let stored = tokio::fs::read(phone.download_path("holiday.jpg")).await.unwrap();
    assert_eq!(stored, content);
    assert!(!phone.download_path("holiday.jpg.part").exists());
}

#[tokio::test]
async fn progress_only_moves_forward() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions {
        auto_accept: true,
        ..NodeOptions::phone()
    })
    .await;
    desktop.pair_with(&phone).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("big.bin");
    tokio::fs::write(&source, pattern(1024 * 1024)).await.unwrap();

    let mut updates = phone.app.transfers().subscribe();
    let offered = desktop.app.send_file(&phone.id(), &source).await.unwrap();

    let mut last = 0u64;
    loop {
        let update = tokio::time::timeout(WAIT, updates.recv()).await.unwrap().unwrap();
        let t = update.transfer();
        if t.id != offered.id {
            continue;
        }
        assert!(t.bytes_transferred >= last, "{} < {last}", t.bytes_transferred);
        last = t.bytes_transferred;
        if t.is_finished() {
            assert_eq!(t.state, TransferState::Completed);
            break;
        }
    }
    assert_eq!(last, 1024 * 1024);
}

#[tokio::test]
async fn rejected_offer_fails_on_the_sender() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions::phone()).await;
    desktop.pair_with(&phone).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("notes.txt");
    tokio::fs::write(&source, b"not wanted").await.unwrap();

    let mut sent_updates = desktop.app.transfers().subscribe();
    let mut offers = phone.app.transfers().subscribe();
    let offered = desktop.app.send_file(&phone.id(), &source).await.unwrap();

    let incoming = wait_transfer(&mut offers, &offered.id, |t| t.state == TransferState::Pending).await;
    phone
        .app
        .transfers()
        .reject_transfer(&incoming.id, "no space")
        .await
        .unwrap();
    assert_eq!(
        phone.app.transfers().get(&incoming.id).unwrap().state,
        TransferState::Cancelled
    );

    let sent = wait_transfer(&mut sent_updates, &offered.id, FileTransfer::is_finished).await;
    assert_eq!(sent.state, TransferState::Failed);
    assert_eq!(sent.error_message.as_deref(), Some("rejected: no space"));
}

#[tokio::test]
async fn premature_close_after_four_mib_keeps_flushed_bytes() {
    const FOUR_MIB: usize = 4 * 1024 * 1024;
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions {
        auto_accept: true,
        ..NodeOptions::phone()
    })
    .await;
    desktop.pair_with(&phone).await;

    // Announce 8 MiB, then send only half and hang up.
    let id = TransferId::new();
    let request = FileTransferRequestPayload {
        transfer_id: id.clone(),
        file_name: "video.mp4".into(),
        file_size: 2 * FOUR_MIB as u64,
        mime_type: "video/mp4".into(),
        checksum: None,
    };
    let mut updates = phone.app.transfers().subscribe();
    desktop
        .app
        .connections()
        .send_to(&phone.id(), request.into_message().unwrap())
        .await
        .unwrap();
    wait_transfer(&mut updates, &id, |t| t.state == TransferState::Pending).await;

    let mut socket = dial("127.0.0.1", phone.transfer_port, Duration::from_secs(5))
        .await
        .unwrap();
    TransferPreamble {
        transfer_id: id.clone(),
        file_name: "video.mp4".into(),
        file_size: 2 * FOUR_MIB as u64,
        mime_type: "video/mp4".into(),
    }
    .write_to(&mut socket)
    .await
    .unwrap();
    socket.write_all(&pattern(FOUR_MIB)).await.unwrap();
    socket.shutdown().await.unwrap();
    drop(socket);

    let failed = wait_transfer(&mut updates, &id, FileTransfer::is_finished).await;
    assert_eq!(failed.state, TransferState::Failed);
    assert_eq!(failed.bytes_transferred, FOUR_MIB as u64);
    assert_eq!(failed.progress, 50);
    assert!(failed
        .error_message
        .as_deref()
        .unwrap()
        .contains("4194304 of 8388608"));

    let part = phone.download_path("video.mp4.part");
    assert_eq!(tokio::fs::metadata(&part).await.unwrap().len(), FOUR_MIB as u64);
}

#[tokio::test]
async fn cancelling_an_offer_stops_the_sender() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions::phone()).await;
    desktop.pair_with(&phone).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("a.txt");
    tokio::fs::write(&source, b"abc").await.unwrap();

    let mut offers = phone.app.transfers().subscribe();
    let offered = desktop.app.send_file(&phone.id(), &source).await.unwrap();
    wait_transfer(&mut offers, &offered.id, |t| t.state == TransferState::Pending).await;

    desktop.app.transfers().cancel_transfer(&offered.id).await.unwrap();
    assert_eq!(
        desktop.app.transfers().get(&offered.id).unwrap().state,
        TransferState::Cancelled
    );
    // The peer's file_transfer_error cancels the offer on the phone too.
    let remote = wait_transfer(&mut offers, &offered.id, FileTransfer::is_finished).await;
    assert_eq!(remote.state, TransferState::Cancelled);

    assert!(desktop.app.transfers().active_transfers().is_empty());
    assert_eq!(desktop.app.transfers().clear_finished(), 1);
    assert!(desktop.app.transfers().list_transfers().is_empty());
}

#[tokio::test]
async fn checksum_mismatch_fails_and_leaves_no_file() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions {
        auto_accept: true,
        ..NodeOptions::phone()
    })
    .await;
    desktop.pair_with(&phone).await;

    let id = TransferId::new();
    let mut updates = phone.app.transfers().subscribe();
    announce(&desktop, &phone, &id, "notes.bin", 8, Some("00".repeat(32))).await;
    wait_transfer(&mut updates, &id, |t| t.state == TransferState::Pending).await;

    let mut socket = open_data(&phone, &id, "notes.bin", 8).await;
    socket.write_all(b"AAAAAAAA").await.unwrap();
    socket.shutdown().await.unwrap();

    let failed = wait_transfer(&mut updates, &id, FileTransfer::is_finished).await;
    assert_eq!(failed.state, TransferState::Failed);
    assert!(failed.error_message.as_deref().unwrap().contains("checksum mismatch"));
    eventually(|| async { !phone.download_path("notes.bin.part").exists() }).await;
    assert!(!phone.download_path("notes.bin").exists());
}

#[tokio::test]
async fn second_data_connection_for_one_transfer_is_refused() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions {
        auto_accept: true,
        ..NodeOptions::phone()
    })
    .await;
    desktop.pair_with(&phone).await;

    let id = TransferId::from("t-dup");
    let mut updates = phone.app.transfers().subscribe();
    announce(&desktop, &phone, &id, "dup.bin", 8, None).await;
    wait_transfer(&mut updates, &id, |t| t.state == TransferState::Pending).await;

    let mut first = open_data(&phone, &id, "dup.bin", 8).await;
    first.write_all(b"AAAA").await.unwrap();
    wait_transfer(&mut updates, &id, |t| t.state == TransferState::InProgress).await;

    let mut second = open_data(&phone, &id, "dup.bin", 8).await;
    let _ = second.write_all(b"BBBBBBBB").await;
    let mut rest = Vec::new();
    let closed = tokio::time::timeout(WAIT, second.read_to_end(&mut rest)).await;
    assert!(closed.is_ok(), "second connection was kept open");
    assert!(rest.is_empty());

    first.write_all(b"AAAA").await.unwrap();
    first.shutdown().await.unwrap();
    let done = wait_transfer(&mut updates, &id, FileTransfer::is_finished).await;
    assert_eq!(done.state, TransferState::Completed);

    let stored = tokio::fs::read(phone.download_path("dup.bin")).await.unwrap();
    assert_eq!(stored, b"AAAAAAAA");
    assert!(!phone.download_path("dup (1).bin").exists());
}

#[tokio::test]
async fn receiver_cancelling_mid_stream_cancels_both_sides() {
    const SIZE: usize = 16 * 1024 * 1024;
    let relay = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let relay_port = relay.local_addr().unwrap().port();
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions {
        auto_accept: true,
        advertised_transfer_port: Some(relay_port),
        ..NodeOptions::phone()
    })
    .await;
    let _relay = stalling_relay(relay, phone.transfer_port, 1024 * 1024);
    desktop.pair_with(&phone).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("archive.tar");
    tokio::fs::write(&source, pattern(SIZE)).await.unwrap();

    let mut sent_updates = desktop.app.transfers().subscribe();
    let mut received_updates = phone.app.transfers().subscribe();
    let offered = desktop.app.send_file(&phone.id(), &source).await.unwrap();
    wait_transfer(&mut received_updates, &offered.id, |t| t.bytes_transferred > 0).await;

    phone.app.transfers().cancel_transfer(&offered.id).await.unwrap();
    assert_eq!(
        phone.app.transfers().get(&offered.id).unwrap().state,
        TransferState::Cancelled
    );
    let sent = wait_transfer(&mut sent_updates, &offered.id, FileTransfer::is_finished).await;
    assert_eq!(sent.state, TransferState::Cancelled);

    eventually(|| async { !phone.download_path("archive.tar.part").exists() }).await;
    assert!(!phone.download_path("archive.tar").exists());
}

#[tokio::test]
async fn request_reusing_a_live_transfer_id_is_ignored() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions::phone()).await;
    desktop.pair_with(&phone).await;

    let source_dir = tempfile::tempdir().unwrap();
    let source = source_dir.path().join("photo.png");
    tokio::fs::write(&source, b"png bytes").await.unwrap();
    let mut offers = desktop.app.transfers().subscribe();
    let outgoing = phone.app.send_file(&desktop.id(), &source).await.unwrap();
    wait_transfer(&mut offers, &outgoing.id, |t| t.state == TransferState::Pending).await;

    let mut phone_updates = phone.app.transfers().subscribe();
    announce(&desktop, &phone, &outgoing.id, "other.bin", 4, None).await;
    // Commands share the session, so the request has been routed once this lands.
    desktop.app.send_command(&phone.id(), RemoteCommand::Ring).await.unwrap();
    eventually(|| async { !phone.ports.commands.lock().unwrap().is_empty() }).await;

    let record = phone.app.transfers().get(&outgoing.id).unwrap();
    assert_eq!(record.direction, TransferDirection::Outgoing);
    assert_eq!(record.file_name, "photo.png");
    assert_eq!(record.state, TransferState::Pending);
    assert!(matches!(phone_updates.try_recv(), Err(broadcast::error::TryRecvError::Empty)));
}
