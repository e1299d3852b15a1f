//! # Configuration DTO / 配置数据
//!
//! ## Responsibilities / 职责
//!
//! - ✅ Define configuration data structures / 定义配置数据结构
//! - ✅ Provide TOML → DTO mapping with documented defaults / TOML → DTO 映射
//!
//! ## Prohibited / 禁止事项
//!
//! ❌ No file I/O (the root crate reads the file) / 禁止文件读写
//! ❌ No path discovery (`dirs` lives in bootstrap) / 禁止平台目录探测
//!
//! Empty paths and an empty device name are valid facts here; bootstrap
//! resolves them against the platform directories and the hostname.

use std::path::PathBuf;
use std::time::Duration;

use crate::device::DeviceType;

pub mod defaults;

/// Application configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub general: GeneralConfig,
    pub network: NetworkConfig,
    pub pairing: PairingConfig,
    pub transfer: TransferConfig,
    pub clipboard: ClipboardConfig,
    pub media: MediaConfig,
    pub storage: StorageConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GeneralConfig {
    /// May be empty; bootstrap falls back to the hostname.
    pub device_name: String,
    pub device_type: DeviceType,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NetworkConfig {
    pub control_port: u16,
    pub transfer_port: u16,
    pub heartbeat_interval_secs: u64,
    pub read_timeout_secs: u64,
    pub connect_timeout_secs: u64,
    pub discovery_enabled: bool,
}

impl NetworkConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PairingConfig {
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransferConfig {
    /// Empty means "platform download dir".
    pub download_dir: PathBuf,
    pub chunk_size: usize,
    pub auto_accept: bool,
    pub response_timeout_secs: u64,
}

impl TransferConfig {
    pub fn response_timeout(&self) -> Duration {
        Duration::from_secs(self.response_timeout_secs)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClipboardConfig {
    pub sync_enabled: bool,
    /// Keep password- and OTP-looking text off the wire and out of the
    /// local clipboard.
    pub filter_sensitive: bool,
    /// 0 disables the history.
    pub history_size: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct MediaConfig {
    /// Let paired peers drive local players.
    pub allow_remote_control: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StorageConfig {
    /// Empty means "platform data dir".
    pub data_dir: PathBuf,
}

impl StorageConfig {
    pub fn devices_path(&self) -> PathBuf {
        self.data_dir.join("devices.json")
    }

    pub fn identity_key_path(&self) -> PathBuf {
        self.data_dir.join("identity.key")
    }

    pub fn device_id_path(&self) -> PathBuf {
        self.data_dir.join("device_id")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }
}

fn str_at<'a>(value: &'a toml::Value, section: &str, key: &str) -> Option<&'a str> {
    value
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_str())
}

fn int_at(value: &toml::Value, section: &str, key: &str) -> Option<i64> {
    value
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_integer())
}

fn bool_at(value: &toml::Value, section: &str, key: &str) -> Option<bool> {
    value
        .get(section)
        .and_then(|s| s.get(key))
        .and_then(|v| v.as_bool())
}

impl AppConfig {
    /// Map a parsed TOML document onto the DTO. Missing keys take the
    /// values in [`defaults`].
    pub fn from_toml(toml_value: &toml::Value) -> anyhow::Result<Self> {
        let device_type = match str_at(toml_value, "general", "device_type") {
            Some(raw) => raw.parse::<DeviceType>().map_err(anyhow::Error::msg)?,
            None => DeviceType::Desktop,
        };

        Ok(Self {
            general: GeneralConfig {
                device_name: str_at(toml_value, "general", "device_name")
                    .unwrap_or("")
                    .to_string(),
                device_type,
            },
            network: NetworkConfig {
                control_port: int_at(toml_value, "network", "control_port")
                    .and_then(|v| u16::try_from(v).ok())
                    .unwrap_or(defaults::CONTROL_PORT),
                transfer_port: int_at(toml_value, "network", "transfer_port")
                    .and_then(|v| u16::try_from(v).ok())
                    .unwrap_or(defaults::TRANSFER_PORT),
                heartbeat_interval_secs: int_at(toml_value, "network", "heartbeat_interval_secs")
                    .and_then(|v| u64::try_from(v).ok())
                    .unwrap_or(defaults::HEARTBEAT_INTERVAL_SECS),
                read_timeout_secs: int_at(toml_value, "network", "read_timeout_secs")
                    .and_then(|v| u64::try_from(v).ok())
                    .unwrap_or(defaults::READ_TIMEOUT_SECS),
                connect_timeout_secs: int_at(toml_value, "network", "connect_timeout_secs")
                    .and_then(|v| u64::try_from(v).ok())
                    .unwrap_or(defaults::CONNECT_TIMEOUT_SECS),
                discovery_enabled: bool_at(toml_value, "network", "discovery_enabled")
                    .unwrap_or(defaults::DISCOVERY_ENABLED),
            },
            pairing: PairingConfig {
                timeout_secs: int_at(toml_value, "pairing", "timeout_secs")
                    .and_then(|v| u64::try_from(v).ok())
                    .unwrap_or(defaults::PAIRING_STEP_TIMEOUT_SECS),
            },
            transfer: TransferConfig {
                download_dir: PathBuf::from(
                    str_at(toml_value, "transfer", "download_dir").unwrap_or(""),
                ),
                chunk_size: int_at(toml_value, "transfer", "chunk_size")
                    .and_then(|v| usize::try_from(v).ok())
                    .filter(|v| *v > 0)
                    .unwrap_or(defaults::CHUNK_SIZE),
                auto_accept: bool_at(toml_value, "transfer", "auto_accept")
                    .unwrap_or(defaults::AUTO_ACCEPT),
                response_timeout_secs: int_at(toml_value, "transfer", "response_timeout_secs")
                    .and_then(|v| u64::try_from(v).ok())
                    .unwrap_or(defaults::TRANSFER_RESPONSE_TIMEOUT_SECS),
            },
            clipboard: ClipboardConfig {
                sync_enabled: bool_at(toml_value, "clipboard", "sync_enabled")
                    .unwrap_or(defaults::CLIPBOARD_SYNC_ENABLED),
                filter_sensitive: bool_at(toml_value, "clipboard", "filter_sensitive")
                    .unwrap_or(defaults::CLIPBOARD_FILTER_SENSITIVE),
                history_size: int_at(toml_value, "clipboard", "history_size")
                    .and_then(|v| usize::try_from(v).ok())
                    .unwrap_or(defaults::CLIPBOARD_HISTORY_SIZE),
            },
            media: MediaConfig {
                allow_remote_control: bool_at(toml_value, "media", "allow_remote_control")
                    .unwrap_or(defaults::MEDIA_ALLOW_REMOTE_CONTROL),
            },
            storage: StorageConfig {
                data_dir: PathBuf::from(str_at(toml_value, "storage", "data_dir").unwrap_or("")),
            },
        })
    }

    /// Defaults with the given base directories filled in.
    ///
    /// 生产环境使用：调用方用 `dirs` 计算目录后传入。
    pub fn with_system_defaults(data_dir: PathBuf, download_dir: PathBuf) -> Self {
        let mut config = Self::default();
        config.storage.data_dir = data_dir;
        config.transfer.download_dir = download_dir;
        config
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            general: GeneralConfig {
                device_name: String::new(),
                device_type: DeviceType::Desktop,
            },
            network: NetworkConfig {
                control_port: defaults::CONTROL_PORT,
                transfer_port: defaults::TRANSFER_PORT,
                heartbeat_interval_secs: defaults::HEARTBEAT_INTERVAL_SECS,
                read_timeout_secs: defaults::READ_TIMEOUT_SECS,
                connect_timeout_secs: defaults::CONNECT_TIMEOUT_SECS,
                discovery_enabled: defaults::DISCOVERY_ENABLED,
            },
            pairing: PairingConfig {
                timeout_secs: defaults::PAIRING_STEP_TIMEOUT_SECS,
            },
            transfer: TransferConfig {
                download_dir: PathBuf::new(),
                chunk_size: defaults::CHUNK_SIZE,
                auto_accept: defaults::AUTO_ACCEPT,
                response_timeout_secs: defaults::TRANSFER_RESPONSE_TIMEOUT_SECS,
            },
            clipboard: ClipboardConfig {
                sync_enabled: defaults::CLIPBOARD_SYNC_ENABLED,
                filter_sensitive: defaults::CLIPBOARD_FILTER_SENSITIVE,
                history_size: defaults::CLIPBOARD_HISTORY_SIZE,
            },
            media: MediaConfig {
                allow_remote_control: defaults::MEDIA_ALLOW_REMOTE_CONTROL,
            },
            storage: StorageConfig {
                data_dir: PathBuf::new(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use toml::Value;

    #[test]
    fn empty_document_yields_defaults() {
        let value: Value = toml::from_str("").unwrap();
        let config = AppConfig::from_toml(&value).unwrap();
        assert_eq!(config, AppConfig::default());
        assert_eq!(config.network.control_port, 51820);
        assert_eq!(config.network.transfer_port, 51821);
        assert_eq!(config.network.heartbeat_interval_secs, 15);
        assert_eq!(config.network.read_timeout_secs, 30);
        assert_eq!(config.transfer.chunk_size, 64 * 1024);
        assert!(config.clipboard.sync_enabled);
        assert!(config.clipboard.filter_sensitive);
        assert_eq!(config.clipboard.history_size, 100);
        assert!(config.media.allow_remote_control);
    }

    #[test]
    fn clipboard_and_media_sections_are_read() {
        let value: Value = toml::from_str(
            r#"
            [clipboard]
            sync_enabled = false
            filter_sensitive = false
            history_size = 5

            [media]
            allow_remote_control = false
            "#,
        )
        .unwrap();
        let config = AppConfig::from_toml(&value).unwrap();
        assert!(!config.clipboard.sync_enabled);
        assert!(!config.clipboard.filter_sensitive);
        assert_eq!(config.clipboard.history_size, 5);
        assert!(!config.media.allow_remote_control);
    }

    #[test]
    fn present_keys_override_defaults() {
        let value: Value = toml::from_str(
            r#"
            [general]
            device_name = "Workstation"
            device_type = "tablet"

            [network]
            control_port = 6000
            discovery_enabled = false

            [transfer]
            auto_accept = true
            download_dir = "/tmp/in"
            "#,
        )
        .unwrap();
        let config = AppConfig::from_toml(&value).unwrap();
        assert_eq!(config.general.device_name, "Workstation");
        assert_eq!(config.general.device_type, DeviceType::Tablet);
        assert_eq!(config.network.control_port, 6000);
        assert!(!config.network.discovery_enabled);
        assert!(config.transfer.auto_accept);
        assert_eq!(config.transfer.download_dir, PathBuf::from("/tmp/in"));
    }

    #[test]
    fn out_of_range_port_falls_back() {
        let value: Value = toml::from_str("[network]\ncontrol_port = 99999").unwrap();
        let config = AppConfig::from_toml(&value).unwrap();
        assert_eq!(config.network.control_port, defaults::CONTROL_PORT);
    }

    #[test]
    fn unknown_device_type_is_an_error() {
        let value: Value = toml::from_str("[general]\ndevice_type = \"fridge\"").unwrap();
        assert!(AppConfig::from_toml(&value).is_err());
    }

    #[test]
    fn storage_paths_hang_off_data_dir() {
        let config = AppConfig::with_system_defaults(PathBuf::from("/data"), PathBuf::from("/dl"));
        assert_eq!(
            config.storage.identity_key_path(),
            PathBuf::from("/data/identity.key")
        );
        assert_eq!(config.storage.devices_path(), PathBuf::from("/data/devices.json"));
        assert_eq!(config.transfer.download_dir, PathBuf::from("/dl"));
    }
}
