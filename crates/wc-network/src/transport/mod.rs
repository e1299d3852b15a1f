//! Control-channel transport.
//!
//! [`Transport`] owns at most one live session per device. Outbound
//! connections go through [`Transport::connect`]; inbound ones are accepted by
//! [`ControlListener`], identified with [`read_peer_hello`] and handed to
//! [`Transport::start`].

mod session;

use std::net::SocketAddr;

use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info};
use wc_core::error::NetworkError;

pub use session::{
    read_peer_hello, ReceivedMessage, Transport, TransportConfig, MAX_CONSECUTIVE_PROTOCOL_ERRORS,
};

use crate::framing::{control_framed, ControlFramed};

/// TCP listener for inbound control connections.
pub struct ControlListener {
    listener: TcpListener,
}

impl ControlListener {
    pub async fn bind(address: &str) -> Result<Self, NetworkError> {
        let listener = TcpListener::bind(address)
            .await
            .map_err(|err| NetworkError::BindFailed {
                address: address.to_string(),
                reason: err.to_string(),
            })?;
        info!(address = %address, "control listener bound");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, NetworkError> {
        Ok(self.listener.local_addr()?)
    }

    /// Wait for the next connection and frame it.
    pub async fn accept(&self) -> Result<(ControlFramed<TcpStream>, SocketAddr), NetworkError> {
        let (stream, peer_addr) = self.listener.accept().await?;
        if let Err(err) = stream.set_nodelay(true) {
            debug!(error = %err, "set_nodelay failed");
        }
        debug!(peer = %peer_addr, "accepted control connection");
        Ok((control_framed(stream), peer_addr))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::io::DuplexStream;
    use tokio::sync::broadcast;
    use wc_core::error::ConnectError;
    use wc_core::network::{
        ConnectionState, DisconnectReason, HelloPayload, MessageType, TransportEvent,
        WinuxMessage, PROTOCOL_VERSION,
    };
    use wc_core::network::payload::MessagePayload;
    use wc_core::ports::SessionCipher;
    use wc_core::{DeviceId, DeviceType};
    use wc_infra::SessionKey;

    use super::*;
    use crate::framing::{decode_line, encode_line};

    fn transport() -> Transport {
        Transport::new(DeviceId::from("peer-1"), TransportConfig::default())
    }

    async fn started(transport: &Transport) -> ControlFramed<DuplexStream> {
        let (ours, theirs) = tokio::io::duplex(64 * 1024);
        transport
            .start(control_framed(ours), Vec::new())
            .await
            .unwrap();
        control_framed(theirs)
    }

    async fn send_plain(peer: &mut ControlFramed<DuplexStream>, message: &WinuxMessage) {
        peer.send(encode_line(message, None).unwrap()).await.unwrap();
    }

    async fn next_message(
        peer: &mut ControlFramed<DuplexStream>,
        cipher: Option<&dyn SessionCipher>,
    ) -> WinuxMessage {
        let line = tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .expect("peer read timeout")
            .expect("stream ended")
            .expect("codec error");
        decode_line(&line, cipher).unwrap()
    }

    async fn disconnected_reason(events: &mut broadcast::Receiver<TransportEvent>) -> DisconnectReason {
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::Disconnected { reason, .. } => return reason,
                _ => continue,
            }
        }
    }

    #[tokio::test]
    async fn ping_is_answered_with_pong() {
        let transport = transport();
        let mut peer = started(&transport).await;
        assert_eq!(transport.state(), ConnectionState::Connected);

        send_plain(&mut peer, &WinuxMessage::ping()).await;
        let reply = next_message(&mut peer, None).await;
        assert_eq!(reply.message_type(), &MessageType::Pong);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn remote_disconnect_ends_session_cleanly() {
        let transport = transport();
        let mut events = transport.subscribe_events();
        let mut peer = started(&transport).await;

        send_plain(&mut peer, &WinuxMessage::disconnect()).await;
        assert_eq!(disconnected_reason(&mut events).await, DisconnectReason::Remote);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn peer_closing_the_socket_is_eof() {
        let transport = transport();
        let mut events = transport.subscribe_events();
        let peer = started(&transport).await;

        drop(peer);
        assert_eq!(disconnected_reason(&mut events).await, DisconnectReason::Eof);
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn silent_peer_times_out_after_read_timeout() {
        let transport = transport();
        let mut events = transport.subscribe_events();
        let mut peer = started(&transport).await;
        let started_at = tokio::time::Instant::now();

        // Our heartbeat still goes out while the peer stays silent.
        let line = peer.next().await.unwrap().unwrap();
        assert_eq!(
            decode_line(&line, None).unwrap().message_type(),
            &MessageType::Ping
        );

        assert_eq!(
            disconnected_reason(&mut events).await,
            DisconnectReason::HeartbeatTimeout
        );
        assert!(started_at.elapsed() >= Duration::from_secs(30));
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        drop(peer);
    }

    #[tokio::test]
    async fn repeated_garbage_tears_the_session_down() {
        let transport = transport();
        let mut events = transport.subscribe_events();
        let mut peer = started(&transport).await;

        for _ in 0..MAX_CONSECUTIVE_PROTOCOL_ERRORS {
            peer.send("definitely not a frame".to_string()).await.unwrap();
        }
        assert_eq!(
            disconnected_reason(&mut events).await,
            DisconnectReason::ProtocolViolation
        );
        assert_eq!(transport.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn a_good_frame_resets_the_garbage_counter() {
        let transport = transport();
        let mut inbound = transport.subscribe();
        let mut peer = started(&transport).await;

        for _ in 0..MAX_CONSECUTIVE_PROTOCOL_ERRORS - 1 {
            peer.send("junk".to_string()).await.unwrap();
        }
        send_plain(&mut peer, &WinuxMessage::clipboard_request()).await;
        for _ in 0..MAX_CONSECUTIVE_PROTOCOL_ERRORS - 1 {
            peer.send("junk".to_string()).await.unwrap();
        }
        send_plain(&mut peer, &WinuxMessage::battery_request()).await;

        assert_eq!(
            inbound.recv().await.unwrap().message.message_type(),
            &MessageType::ClipboardRequest
        );
        assert_eq!(
            inbound.recv().await.unwrap().message.message_type(),
            &MessageType::BatteryRequest
        );
        assert_eq!(transport.state(), ConnectionState::Connected);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn send_without_session_is_not_connected() {
        let transport = transport();
        let err = transport.send(WinuxMessage::ping()).await.unwrap_err();
        assert!(matches!(err, ConnectError::Network(NetworkError::NotConnected)));
    }

    #[tokio::test]
    async fn unknown_types_are_ignored() {
        let transport = transport();
        let mut inbound = transport.subscribe();
        let mut peer = started(&transport).await;

        peer.send(r#"{"id":"x","type":"hologram","timestamp":0,"payload":{}}"#.to_string())
            .await
            .unwrap();
        send_plain(&mut peer, &WinuxMessage::clipboard_request()).await;

        let first = inbound.recv().await.unwrap();
        assert_eq!(first.message.message_type(), &MessageType::ClipboardRequest);
        assert!(!first.authenticated);
        assert_eq!(transport.state(), ConnectionState::Connected);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn encrypted_session_exchanges_sealed_frames() {
        let key: Arc<dyn SessionCipher> = Arc::new(SessionKey::from_bytes(&[3u8; 32]));
        let peer_key = SessionKey::from_bytes(&[3u8; 32]);
        let transport = transport();
        transport.set_session_cipher(Some(key));
        assert!(transport.is_encrypted());
        let mut inbound = transport.subscribe();
        let mut peer = started(&transport).await;

        transport.send(WinuxMessage::battery_request()).await.unwrap();
        let line = tokio::time::timeout(Duration::from_secs(5), peer.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(!line.starts_with('{'));
        assert_eq!(
            decode_line(&line, Some(&peer_key)).unwrap().message_type(),
            &MessageType::BatteryRequest
        );

        assert!(!transport.is_authenticated());
        let sealed = encode_line(&WinuxMessage::clipboard_request(), Some(&peer_key)).unwrap();
        peer.send(sealed).await.unwrap();
        let received = inbound.recv().await.unwrap();
        assert_eq!(received.message.message_type(), &MessageType::ClipboardRequest);
        assert!(received.authenticated);
        assert!(transport.is_authenticated());
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn plain_frames_are_not_authenticated_until_the_key_is_proven() {
        let key = SessionKey::from_bytes(&[4u8; 32]);
        let transport = transport();
        transport.set_session_cipher(Some(Arc::new(SessionKey::from_bytes(&[4u8; 32]))));
        let mut inbound = transport.subscribe();
        let mut events = transport.subscribe_events();
        let mut peer = started(&transport).await;

        let hello = HelloPayload {
            device_id: DeviceId::from("peer-1"),
            device_name: "Pixel".into(),
            device_type: DeviceType::Phone,
            protocol_version: PROTOCOL_VERSION,
            hostname: None,
        }
        .into_message()
        .unwrap();
        send_plain(&mut peer, &hello).await;
        let first = inbound.recv().await.unwrap();
        assert_eq!(first.message.message_type(), &MessageType::Hello);
        assert!(!first.authenticated);

        peer.send(encode_line(&WinuxMessage::battery_request(), Some(&key)).unwrap())
            .await
            .unwrap();
        send_plain(&mut peer, &hello).await;
        assert!(inbound.recv().await.unwrap().authenticated);
        // Handshake lines stay plain but now come from a proven peer.
        assert!(inbound.recv().await.unwrap().authenticated);

        loop {
            if let TransportEvent::Authenticated { device_id } = events.recv().await.unwrap() {
                assert_eq!(device_id, DeviceId::from("peer-1"));
                break;
            }
        }
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn crypto_failure_reports_whether_the_key_was_proven() {
        let key = SessionKey::from_bytes(&[5u8; 32]);
        let wrong = SessionKey::from_bytes(&[6u8; 32]);

        for prove_first in [false, true] {
            let transport = transport();
            transport.set_session_cipher(Some(Arc::new(SessionKey::from_bytes(&[5u8; 32]))));
            let mut events = transport.subscribe_events();
            let mut peer = started(&transport).await;

            if prove_first {
                peer.send(encode_line(&WinuxMessage::battery_request(), Some(&key)).unwrap())
                    .await
                    .unwrap();
            }
            peer.send(encode_line(&WinuxMessage::battery_request(), Some(&wrong)).unwrap())
                .await
                .unwrap();

            loop {
                if let TransportEvent::CryptoFailure { authenticated, .. } =
                    events.recv().await.unwrap()
                {
                    assert_eq!(authenticated, prove_first);
                    break;
                }
            }
        }
    }

    #[tokio::test]
    async fn ping_flood_never_stalls_reads() {
        let transport = Transport::new(
            DeviceId::from("peer-1"),
            TransportConfig {
                outbound_queue_depth: 1,
                ..TransportConfig::default()
            },
        );
        let mut inbound = transport.subscribe();
        let mut peer = started(&transport).await;

        // The peer never reads, so pongs pile up far beyond the queue.
        let ping = encode_line(&WinuxMessage::ping(), None).unwrap();
        for _ in 0..2000 {
            peer.send(ping.clone()).await.unwrap();
        }
        send_plain(&mut peer, &WinuxMessage::clipboard_request()).await;

        let received = tokio::time::timeout(Duration::from_secs(5), inbound.recv())
            .await
            .expect("read loop stalled")
            .unwrap();
        assert_eq!(received.message.message_type(), &MessageType::ClipboardRequest);
        // Unblocks the write loop stuck on the full pipe.
        drop(peer);
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn frame_under_the_wrong_key_is_a_crypto_failure() {
        let transport = transport();
        transport.set_session_cipher(Some(Arc::new(SessionKey::from_bytes(&[1u8; 32]))));
        let mut events = transport.subscribe_events();
        let mut peer = started(&transport).await;

        let wrong = SessionKey::from_bytes(&[2u8; 32]);
        peer.send(encode_line(&WinuxMessage::ping(), Some(&wrong)).unwrap())
            .await
            .unwrap();

        let mut saw_crypto_failure = false;
        loop {
            match events.recv().await.unwrap() {
                TransportEvent::CryptoFailure { .. } => saw_crypto_failure = true,
                TransportEvent::Disconnected { reason, .. } => {
                    assert_eq!(reason, DisconnectReason::CryptoFailure);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_crypto_failure);
        assert_eq!(transport.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn local_disconnect_notifies_peer_and_is_idempotent() {
        let transport = transport();
        let mut peer = started(&transport).await;

        transport.disconnect().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
        let last = next_message(&mut peer, None).await;
        assert_eq!(last.message_type(), &MessageType::Disconnect);

        transport.disconnect().await;
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn hello_is_published_as_peer_hello() {
        let transport = transport();
        let mut events = transport.subscribe_events();
        let mut peer = started(&transport).await;

        let hello = HelloPayload {
            device_id: DeviceId::from("phone-7"),
            device_name: "Pixel".into(),
            device_type: DeviceType::Phone,
            protocol_version: PROTOCOL_VERSION,
            hostname: None,
        };
        send_plain(&mut peer, &hello.into_message().unwrap()).await;

        loop {
            if let TransportEvent::PeerHello {
                device_id,
                device_name,
                ..
            } = events.recv().await.unwrap()
            {
                assert_eq!(device_id, DeviceId::from("phone-7"));
                assert_eq!(device_name, "Pixel");
                break;
            }
        }
        transport.disconnect().await;
    }

    #[tokio::test]
    async fn listener_accepts_and_reads_hello_over_tcp() {
        let listener = ControlListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();

        let hello = HelloPayload {
            device_id: DeviceId::from("desk-1"),
            device_name: "Desk".into(),
            device_type: DeviceType::Desktop,
            protocol_version: PROTOCOL_VERSION,
            hostname: Some("desk.local".into()),
        };
        let client = Transport::new(DeviceId::from("server"), TransportConfig::default());
        let expected = hello.clone();
        let connect = tokio::spawn(async move {
            client.connect(&address, &expected).await.unwrap();
            client
        });

        let (mut framed, _) = listener.accept().await.unwrap();
        let received = read_peer_hello(&mut framed, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(received, hello);

        let client = connect.await.unwrap();
        assert_eq!(client.state(), ConnectionState::Connected);
        client.disconnect().await;
    }

    #[tokio::test]
    async fn paired_dialer_sends_plain_hello_then_encrypts() {
        let listener = ControlListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let key = Arc::new(SessionKey::from_bytes(&[9u8; 32]));

        let hello = HelloPayload {
            device_id: DeviceId::from("desk-1"),
            device_name: "Desk".into(),
            device_type: DeviceType::Desktop,
            protocol_version: PROTOCOL_VERSION,
            hostname: None,
        };
        let client = Transport::new(DeviceId::from("server"), TransportConfig::default());
        client.set_session_cipher(Some(key.clone()));
        let expected = hello.clone();
        let connect = tokio::spawn(async move {
            client.connect(&address, &expected).await.unwrap();
            client
        });

        let (mut framed, _) = listener.accept().await.unwrap();
        let received = read_peer_hello(&mut framed, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(received, hello);

        let client = connect.await.unwrap();
        client.send(WinuxMessage::battery_request()).await.unwrap();
        loop {
            let line = tokio::time::timeout(Duration::from_secs(5), framed.next())
                .await
                .unwrap()
                .unwrap()
                .unwrap();
            assert!(decode_line(&line, None).is_err());
            let message = decode_line(&line, Some(&*key)).unwrap();
            if *message.message_type() == MessageType::BatteryRequest {
                break;
            }
        }
        client.disconnect().await;
    }

    #[tokio::test]
    async fn connect_to_closed_port_reports_error_state() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        drop(listener);

        let transport = transport();
        let hello = HelloPayload {
            device_id: DeviceId::from("me"),
            device_name: "me".into(),
            device_type: DeviceType::Desktop,
            protocol_version: PROTOCOL_VERSION,
            hostname: None,
        };
        assert!(transport.connect(&address, &hello).await.is_err());
        assert_eq!(transport.state(), ConnectionState::Error);
    }
}
