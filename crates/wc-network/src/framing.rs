//! Control-channel framing.
//!
//! One message per `\n`-terminated line. Before a session key exists every
//! line is the JSON message. Once a key is installed, every non-handshake
//! line is `Base64(nonce ‖ ciphertext ‖ tag)` of that JSON. Handshake
//! messages (`hello`, `pair_*`) always travel as plain JSON.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{trace, warn};
use wc_core::error::{ConnectError, ProtocolError};
use wc_core::network::WinuxMessage;
use wc_core::ports::SessionCipher;

/// Maximum line length accepted on the control channel (1 MiB).
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Framed control stream over any byte transport.
pub type ControlFramed<S> = Framed<S, LinesCodec>;

pub fn control_codec() -> LinesCodec {
    LinesCodec::new_with_max_length(MAX_LINE_BYTES)
}

pub fn control_framed<S>(stream: S) -> ControlFramed<S>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite,
{
    Framed::new(stream, control_codec())
}

/// Serialize `message` into one line, sealing it when `cipher` is set.
pub fn encode_line(
    message: &WinuxMessage,
    cipher: Option<&dyn SessionCipher>,
) -> Result<String, ConnectError> {
    let json = message.to_json()?;
    match cipher {
        Some(cipher) if !message.message_type().is_handshake() => {
            let sealed = cipher.encrypt(json.as_bytes())?;
            trace!(
                stage = "encode_sealed",
                message_type = %message.message_type(),
                len = sealed.len(),
                "sealed control frame"
            );
            Ok(STANDARD.encode(sealed))
        }
        _ => {
            trace!(
                stage = "encode_plain",
                message_type = %message.message_type(),
                len = json.len(),
                "plain control frame"
            );
            Ok(json)
        }
    }
}

/// Decode one line. Pure apart from AEAD: the same line and key always give
/// the same result.
///
/// Errors are either [`ConnectError::Protocol`] (drop the line) or
/// [`ConnectError::Crypto`] (authentication failed; the session is compromised).
pub fn decode_line(
    line: &str,
    cipher: Option<&dyn SessionCipher>,
) -> Result<WinuxMessage, ConnectError> {
    let line = line.trim();
    if line.is_empty() {
        return Err(ProtocolError::MalformedJson("empty line".into()).into());
    }

    if line.starts_with('{') {
        let message = WinuxMessage::from_json(line)?;
        if cipher.is_some() && !message.message_type().is_handshake() {
            warn!(
                stage = "decode_plain",
                message_type = %message.message_type(),
                "plaintext frame on encrypted session"
            );
            return Err(ProtocolError::UnexpectedPlaintext(
                message.message_type().to_string(),
            )
            .into());
        }
        return Ok(message);
    }

    let Some(cipher) = cipher else {
        return Err(ProtocolError::Unexpected("sealed frame before key agreement".into()).into());
    };
    let sealed = STANDARD
        .decode(line)
        .map_err(|err| ProtocolError::InvalidBase64(err.to_string()))?;
    let plaintext = cipher.decrypt(&sealed)?;
    let json = std::str::from_utf8(&plaintext)
        .map_err(|err| ProtocolError::MalformedJson(format!("invalid utf-8: {err}")))?;
    trace!(stage = "decode_sealed", len = sealed.len(), "opened control frame");
    Ok(WinuxMessage::from_json(json)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use wc_core::error::CryptoError;
    use wc_core::network::{MessageType, PairRequestPayload};
    use wc_core::network::payload::MessagePayload;
    use wc_core::{DeviceId, DeviceType};
    use wc_infra::SessionKey;

    fn key(byte: u8) -> SessionKey {
        SessionKey::from_bytes(&[byte; 32])
    }

    #[test]
    fn plain_session_round_trips_json() {
        let ping = WinuxMessage::ping();
        let line = encode_line(&ping, None).unwrap();
        assert!(line.starts_with('{'));
        assert_eq!(decode_line(&line, None).unwrap(), ping);
    }

    #[test]
    fn sealed_lines_are_base64_and_open_with_the_same_key() {
        let k = key(1);
        let message = WinuxMessage::clipboard_request();
        let line = encode_line(&message, Some(&k)).unwrap();
        assert!(!line.starts_with('{'));
        assert!(!line.contains('\n'));
        assert_eq!(decode_line(&line, Some(&k)).unwrap(), message);
    }

    #[test]
    fn handshake_messages_stay_plain_after_pairing() {
        let k = key(1);
        let request = PairRequestPayload {
            device_id: DeviceId::from("d"),
            device_name: "n".into(),
            device_type: DeviceType::Phone,
            public_key: "AA==".into(),
        }
        .into_message()
        .unwrap();
        let line = encode_line(&request, Some(&k)).unwrap();
        assert!(line.starts_with('{'));
        assert_eq!(
            decode_line(&line, Some(&k)).unwrap().message_type(),
            &MessageType::PairRequest
        );
    }

    #[test]
    fn wrong_key_is_a_crypto_error_not_a_protocol_error() {
        let line = encode_line(&WinuxMessage::ping(), Some(&key(1))).unwrap();
        assert!(matches!(
            decode_line(&line, Some(&key(2))),
            Err(ConnectError::Crypto(CryptoError::Decryption))
        ));
    }

    #[test]
    fn plaintext_on_encrypted_session_is_rejected() {
        let line = encode_line(&WinuxMessage::ping(), None).unwrap();
        assert!(matches!(
            decode_line(&line, Some(&key(1))),
            Err(ConnectError::Protocol(ProtocolError::UnexpectedPlaintext(_)))
        ));
    }

    #[test]
    fn garbage_lines_are_protocol_errors() {
        let k = key(1);
        for line in ["", "{not json", "!!!", "{\"id\":1}"] {
            assert!(matches!(
                decode_line(line, Some(&k)),
                Err(ConnectError::Protocol(_))
            ));
        }
        assert!(matches!(
            decode_line("AAAA", None),
            Err(ConnectError::Protocol(_))
        ));
    }

    #[test]
    fn decoding_the_same_line_twice_is_identical() {
        let k = key(9);
        let line = encode_line(&WinuxMessage::battery_request(), Some(&k)).unwrap();
        assert_eq!(
            decode_line(&line, Some(&k)).unwrap(),
            decode_line(&line, Some(&k)).unwrap()
        );
    }
}
