//! End-to-end pairing between two nodes over localhost TCP.

mod common;

use common::{eventually, Node, NodeOptions, WAIT};
use wc_app::PairingUpdate;
use wc_core::pairing::{FailureReason, PairingState};
use wc_core::ports::{DeviceRegistryPort, KeyAgreementPort};
use wc_core::PairingError;

/// Wait for the responder to display its PIN.
async fn shown_pin(updates: &mut tokio::sync::broadcast::Receiver<PairingUpdate>) -> String {
    tokio::time::timeout(WAIT, async {
        loop {
            if let PairingUpdate::ShowPin { pin, uri } = updates.recv().await.unwrap() {
                assert!(uri.starts_with("winux://pair?"));
                return pin;
            }
        }
    })
    .await
    .expect("responder never showed a pin")
}

#[tokio::test]
async fn shown_pin_pairs_both_sides_and_encrypts_the_session() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions::phone()).await;
    desktop.connect_to(&phone).await;

    let mut phone_updates = phone.app.pairing().subscribe();
    desktop.app.pairing().start_pairing(&phone.id()).await.unwrap();

    let pin = shown_pin(&mut phone_updates).await;
    desktop
        .wait_for_pairing(|s| *s == PairingState::WaitingForConfirmation)
        .await;
    desktop.app.pairing().submit_pin(&pin).await.unwrap();

    assert_eq!(
        desktop.wait_for_pairing(|s| !s.is_in_flight()).await,
        PairingState::Paired
    );
    assert_eq!(
        phone.wait_for_pairing(|s| !s.is_in_flight()).await,
        PairingState::Paired
    );

    // Each side stored the other's public key.
    let phone_row = desktop.registry.get(&phone.id()).await.unwrap().unwrap();
    assert!(phone_row.is_paired);
    assert_eq!(phone_row.public_key, Some(phone.keys.public_key().unwrap()));
    let desktop_row = phone.registry.get(&desktop.id()).await.unwrap().unwrap();
    assert!(desktop_row.is_paired);
    assert_eq!(desktop_row.public_key, Some(desktop.keys.public_key().unwrap()));

    // Both ends derived the same key; traffic now flows encrypted.
    desktop
        .app
        .send_clipboard(&phone.id(), "hello from desktop")
        .await
        .unwrap();
    eventually(|| async {
        phone.ports.clipboard.lock().unwrap().as_deref() == Some("hello from desktop")
    })
    .await;
    assert!(desktop.keys.session_for(&phone.id()).is_some());
    assert!(phone.keys.session_for(&desktop.id()).is_some());
}

#[tokio::test]
async fn wrong_pin_never_pairs() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions::phone()).await;
    desktop.connect_to(&phone).await;

    let mut phone_updates = phone.app.pairing().subscribe();
    desktop.app.pairing().start_pairing(&phone.id()).await.unwrap();
    let pin = shown_pin(&mut phone_updates).await;
    let wrong = if pin == "000000" { "111111" } else { "000000" };

    desktop
        .wait_for_pairing(|s| *s == PairingState::WaitingForConfirmation)
        .await;
    desktop.app.pairing().submit_pin(wrong).await.unwrap();

    assert_eq!(
        phone.wait_for_pairing(|s| !s.is_in_flight()).await,
        PairingState::Failed(FailureReason::PinMismatch)
    );
    assert_eq!(
        desktop.wait_for_pairing(|s| !s.is_in_flight()).await,
        PairingState::Failed(FailureReason::PinMismatch)
    );

    assert!(!desktop.registry.get(&phone.id()).await.unwrap().unwrap().is_paired);
    assert!(!phone.registry.get(&desktop.id()).await.unwrap().unwrap().is_paired);
    assert!(desktop.keys.session_for(&phone.id()).is_none());
}

#[tokio::test]
async fn second_attempt_is_refused_while_one_is_in_flight() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions::phone()).await;
    desktop.connect_to(&phone).await;

    desktop.app.pairing().start_pairing(&phone.id()).await.unwrap();
    desktop
        .wait_for_pairing(|s| *s == PairingState::WaitingForConfirmation)
        .await;

    let err = desktop.app.pairing().await_connection().await.unwrap_err();
    assert_eq!(err, PairingError::Busy);
    assert!(desktop.app.pairing().submit_pin("12ab56").await.is_err());
}

#[tokio::test]
async fn cancel_notifies_the_peer() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions::phone()).await;
    desktop.connect_to(&phone).await;

    desktop.app.pairing().start_pairing(&phone.id()).await.unwrap();
    phone
        .wait_for_pairing(|s| *s == PairingState::WaitingForConfirmation)
        .await;

    desktop.app.pairing().cancel().await;
    assert_eq!(desktop.app.pairing().state(), PairingState::Idle);
    assert_eq!(
        phone.wait_for_pairing(|s| !s.is_in_flight()).await,
        PairingState::Failed(FailureReason::CancelledByPeer)
    );
}

#[tokio::test]
async fn dropped_connection_fails_the_attempt() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions::phone()).await;
    desktop.connect_to(&phone).await;

    desktop.app.pairing().start_pairing(&phone.id()).await.unwrap();
    desktop
        .wait_for_pairing(|s| *s == PairingState::WaitingForConfirmation)
        .await;

    phone.app.disconnect(&desktop.id()).await;
    let state = desktop.wait_for_pairing(|s| !s.is_in_flight()).await;
    assert!(matches!(state, PairingState::Failed(FailureReason::Transport(_))));
}

#[tokio::test]
async fn paired_devices_reconnect_once_the_key_is_proven() {
    let desktop = Node::start(NodeOptions::desktop()).await;
    let phone = Node::start(NodeOptions::phone()).await;
    desktop.pair_with(&phone).await;

    desktop.app.disconnect(&phone.id()).await;
    let desktop_id = desktop.id();
    eventually(|| async { !phone.app.connections().is_connected(&desktop_id).await }).await;

    desktop.app.connect(&phone.id()).await.unwrap();
    let phone_id = phone.id();
    eventually(|| async {
        phone.app.connections().is_authenticated(&desktop_id).await
            && desktop.app.connections().is_authenticated(&phone_id).await
    })
    .await;
    assert!(phone.registry.get(&desktop_id).await.unwrap().unwrap().is_paired);

    desktop.app.send_clipboard(&phone_id, "back again").await.unwrap();
    eventually(|| async {
        phone.ports.clipboard.lock().unwrap().as_deref() == Some("back again")
    })
    .await;
}
