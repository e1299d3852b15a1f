//! Device domain model.
//!
//! A [`Device`] is a remote peer this host has discovered or paired with.
//! Devices are created on first discovery and deleted only on explicit
//! forget; pairing only flips `is_paired` and stores the peer key.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::DeviceId;
use crate::network::payload::{HelloPayload, PROTOCOL_VERSION};

/// Kind of device advertised over discovery and hello.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    Desktop,
    Phone,
    Tablet,
}

impl DeviceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceType::Desktop => "desktop",
            DeviceType::Phone => "phone",
            DeviceType::Tablet => "tablet",
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeviceType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "desktop" => Ok(DeviceType::Desktop),
            "phone" => Ok(DeviceType::Phone),
            "tablet" => Ok(DeviceType::Tablet),
            other => Err(format!("unknown device type: {other}")),
        }
    }
}

/// Identity this host presents to peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalDevice {
    pub id: DeviceId,
    pub name: String,
    pub hostname: String,
    pub device_type: DeviceType,
}

impl LocalDevice {
    pub fn hello(&self) -> HelloPayload {
        HelloPayload {
            device_id: self.id.clone(),
            device_name: self.name.clone(),
            device_type: self.device_type,
            protocol_version: PROTOCOL_VERSION,
            hostname: (!self.hostname.is_empty()).then(|| self.hostname.clone()),
        }
    }
}

/// A peer as reported by discovery, before it is reconciled with the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    /// Id advertised in the TXT record, when the peer publishes one.
    pub device_id: Option<DeviceId>,
    pub name: String,
    pub hostname: String,
    pub address: String,
    pub port: u16,
    pub device_type: Option<DeviceType>,
}

/// A remote device known to this host.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    pub hostname: String,
    pub ip_address: String,
    pub port: u16,
    pub device_type: DeviceType,
    pub is_paired: bool,
    /// Peer public key; present exactly when `is_paired`.
    #[serde(
        default,
        with = "public_key_serde",
        skip_serializing_if = "Option::is_none"
    )]
    pub public_key: Option<Vec<u8>>,
    pub last_seen: DateTime<Utc>,
    #[serde(default)]
    pub last_connected: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(
        name: impl Into<String>,
        hostname: impl Into<String>,
        ip_address: impl Into<String>,
        port: u16,
        device_type: DeviceType,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: DeviceId::new(),
            name: name.into(),
            hostname: hostname.into(),
            ip_address: ip_address.into(),
            port,
            device_type,
            is_paired: false,
            public_key: None,
            last_seen: now,
            last_connected: None,
        }
    }

    /// Build a fresh unpaired record from a discovery result.
    pub fn from_discovered(peer: &DiscoveredPeer, now: DateTime<Utc>) -> Self {
        let mut device = Device::new(
            peer.name.clone(),
            peer.hostname.clone(),
            peer.address.clone(),
            peer.port,
            peer.device_type.unwrap_or(DeviceType::Phone),
            now,
        );
        if let Some(id) = &peer.device_id {
            device.id = id.clone();
        }
        device
    }

    /// Whether a discovery result describes this device (same hostname or address).
    pub fn matches_discovered(&self, peer: &DiscoveredPeer) -> bool {
        let same_host = !peer.hostname.is_empty() && self.hostname == peer.hostname;
        let same_addr = !peer.address.is_empty() && self.ip_address == peer.address;
        same_host || same_addr
    }

    /// Refresh the volatile fields from a newer discovery result.
    pub fn refresh_from(&mut self, peer: &DiscoveredPeer, now: DateTime<Utc>) {
        if !peer.name.is_empty() {
            self.name = peer.name.clone();
        }
        if !peer.hostname.is_empty() {
            self.hostname = peer.hostname.clone();
        }
        if !peer.address.is_empty() {
            self.ip_address = peer.address.clone();
        }
        self.port = peer.port;
        if let Some(device_type) = peer.device_type {
            self.device_type = device_type;
        }
        self.last_seen = now;
    }

    pub fn mark_paired(&mut self, public_key: Vec<u8>) {
        self.is_paired = true;
        self.public_key = Some(public_key);
    }

    pub fn mark_unpaired(&mut self) {
        self.is_paired = false;
        self.public_key = None;
    }

    /// `public_key` is non-empty if and only if the device is paired.
    pub fn is_consistent(&self) -> bool {
        let has_key = self.public_key.as_ref().is_some_and(|k| !k.is_empty());
        has_key == self.is_paired
    }

    pub fn socket_addr(&self) -> String {
        if self.ip_address.contains(':') {
            format!("[{}]:{}", self.ip_address, self.port)
        } else {
            format!("{}:{}", self.ip_address, self.port)
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("hostname", &self.hostname)
            .field("ip_address", &self.ip_address)
            .field("port", &self.port)
            .field("device_type", &self.device_type)
            .field("is_paired", &self.is_paired)
            .field(
                "public_key",
                &self.public_key.as_ref().map(|k| format!("[{} bytes]", k.len())),
            )
            .field("last_seen", &self.last_seen)
            .field("last_connected", &self.last_connected)
            .finish()
    }
}

mod public_key_serde {
    use base64::{engine::general_purpose::STANDARD, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|s| STANDARD.decode(s).map_err(serde::de::Error::custom))
            .transpose()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(hostname: &str, address: &str) -> DiscoveredPeer {
        DiscoveredPeer {
            device_id: None,
            name: "Pixel".to_string(),
            hostname: hostname.to_string(),
            address: address.to_string(),
            port: 51820,
            device_type: Some(DeviceType::Phone),
        }
    }

    #[test]
    fn discovered_device_starts_unpaired_and_consistent() {
        let device = Device::from_discovered(&peer("pixel.local.", "10.0.0.5"), Utc::now());
        assert!(!device.is_paired);
        assert!(device.public_key.is_none());
        assert!(device.is_consistent());
    }

    #[test]
    fn matches_by_hostname_or_address() {
        let device = Device::from_discovered(&peer("pixel.local.", "10.0.0.5"), Utc::now());
        assert!(device.matches_discovered(&peer("pixel.local.", "10.0.0.9")));
        assert!(device.matches_discovered(&peer("", "10.0.0.5")));
        assert!(!device.matches_discovered(&peer("other.local.", "10.0.0.6")));
    }

    #[test]
    fn pairing_flags_follow_public_key() {
        let mut device = Device::from_discovered(&peer("pixel.local.", "10.0.0.5"), Utc::now());
        device.mark_paired(vec![7; 32]);
        assert!(device.is_paired && device.is_consistent());
        device.mark_unpaired();
        assert!(!device.is_paired && device.public_key.is_none());
    }

    #[test]
    fn public_key_round_trips_as_base64() {
        let mut device = Device::from_discovered(&peer("pixel.local.", "10.0.0.5"), Utc::now());
        device.mark_paired(vec![1, 2, 3]);
        let json = serde_json::to_value(&device).unwrap();
        assert_eq!(json["public_key"], "AQID");
        let back: Device = serde_json::from_value(json).unwrap();
        assert_eq!(back.public_key, Some(vec![1, 2, 3]));
    }

    #[test]
    fn device_type_parses_case_insensitively() {
        assert_eq!("Tablet".parse::<DeviceType>(), Ok(DeviceType::Tablet));
        assert!("toaster".parse::<DeviceType>().is_err());
    }

    #[test]
    fn ipv6_socket_addr_is_bracketed() {
        let mut device = Device::from_discovered(&peer("h", "fe80::1"), Utc::now());
        device.port = 51820;
        assert_eq!(device.socket_addr(), "[fe80::1]:51820");
    }
}
