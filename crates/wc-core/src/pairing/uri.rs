//! `winux://pair` URI carried by the pairing QR code.
//!
//! ```text
//! winux://pair?pin=<digits>&key=<url-encoded base64>&device=<name>&type=<device type>
//! ```

use base64::{engine::general_purpose::STANDARD, Engine as _};
use url::{form_urlencoded, Url};

use crate::device::DeviceType;
use crate::error::ProtocolError;
use crate::pairing::pin::validate_pin;

pub const PAIRING_URI_SCHEME: &str = "winux";
const PAIRING_URI_HOST: &str = "pair";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PairingUri {
    pub pin: String,
    /// Raw public key of the advertising device.
    pub public_key: Vec<u8>,
    pub device_name: String,
    pub device_type: DeviceType,
}

impl PairingUri {
    pub fn to_uri(&self) -> String {
        let query = form_urlencoded::Serializer::new(String::new())
            .append_pair("pin", &self.pin)
            .append_pair("key", &STANDARD.encode(&self.public_key))
            .append_pair("device", &self.device_name)
            .append_pair("type", self.device_type.as_str())
            .finish();
        format!("{PAIRING_URI_SCHEME}://{PAIRING_URI_HOST}?{query}")
    }

    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let url = Url::parse(raw.trim())
            .map_err(|err| ProtocolError::InvalidPairingUri(err.to_string()))?;
        if url.scheme() != PAIRING_URI_SCHEME {
            return Err(ProtocolError::InvalidPairingUri(format!(
                "unexpected scheme: {}",
                url.scheme()
            )));
        }
        if url.host_str() != Some(PAIRING_URI_HOST) {
            return Err(ProtocolError::InvalidPairingUri(
                "expected winux://pair".to_string(),
            ));
        }

        let mut pin = None;
        let mut key = None;
        let mut device = None;
        let mut device_type = None;
        for (name, value) in url.query_pairs() {
            match name.as_ref() {
                "pin" => pin = Some(value.into_owned()),
                "key" => key = Some(value.into_owned()),
                "device" => device = Some(value.into_owned()),
                "type" => device_type = Some(value.into_owned()),
                _ => {}
            }
        }

        let pin = pin.ok_or(ProtocolError::MissingField("pin"))?;
        validate_pin(&pin).map_err(|err| ProtocolError::InvalidPairingUri(err.to_string()))?;
        let public_key = STANDARD
            .decode(key.ok_or(ProtocolError::MissingField("key"))?)
            .map_err(|err| ProtocolError::InvalidPairingUri(format!("bad key: {err}")))?;
        let device_name = device.ok_or(ProtocolError::MissingField("device"))?;
        let device_type = device_type
            .ok_or(ProtocolError::MissingField("type"))?
            .parse::<DeviceType>()
            .map_err(ProtocolError::InvalidPairingUri)?;

        Ok(Self {
            pin,
            public_key,
            device_name,
            device_type,
        })
    }
}
