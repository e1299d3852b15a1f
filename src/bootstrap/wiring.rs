//! # Dependency Injection / 依赖注入模块
//!
//! ## Responsibilities / 职责
//!
//! - ✅ Create infra implementations (identity, keys, registry) / 创建 infra 层具体实现
//! - ✅ Create headless collaborator adapters / 创建无界面适配器
//! - ✅ Translate `AppConfig` into service settings / 将配置转换为服务参数
//!
//! ## Prohibited / 禁止事项
//!
//! ❌ **No business logic / 禁止包含任何业务逻辑**
//! - Do not decide which devices to connect to or pair with
//! - 不决定连接或配对哪些设备
//!
//! ❌ **No network I/O / 禁止网络 I/O**
//! - Listeners and discovery are started by `run.rs`
//!
//! > **This is the only place allowed to depend on wc-infra + wc-app simultaneously.**
//! > **这是唯一允许同时依赖 wc-infra 和 wc-app 的地方。**

use std::net::IpAddr;
use std::sync::Arc;

use tracing::{info, warn};
use wc_app::{AppDeps, Collaborators, FeatureSettings, TransferSettings};
use wc_core::config::AppConfig;
use wc_core::device::LocalDevice;
use wc_core::pairing::PairingPolicy;
use wc_infra::{FileDeviceRegistry, FileKeyStore, LocalDeviceIdentity, X25519KeyAgreement};
use wc_network::TransportConfig;

use crate::adapters::{
    HeadlessBattery, HeadlessClipboard, LoggingMediaControl, LoggingNotifications,
    LoggingRemoteCommands,
};

/// Result type for wiring operations
pub type WiringResult<T> = Result<T, WiringError>;

/// Errors during dependency injection
/// 依赖注入错误（基础设施初始化失败）
#[derive(Debug, thiserror::Error)]
pub enum WiringError {
    #[error("Data directory unavailable: {0}")]
    DataDir(String),

    #[error("Device identity initialization failed: {0}")]
    Identity(String),

    #[error("Key store initialization failed: {0}")]
    KeyStore(String),

    #[error("Device registry initialization failed: {0}")]
    Registry(String),
}

/// Everything `run_app` needs besides the config itself.
pub struct WiredApp {
    pub deps: AppDeps,
    /// Address peers are told to dial for file data.
    pub advertised_address: IpAddr,
}

/// Build the application dependencies from configuration.
/// 根据配置构建应用依赖
pub async fn wire_app(config: &AppConfig) -> WiringResult<WiredApp> {
    let storage = &config.storage;
    std::fs::create_dir_all(&storage.data_dir)
        .map_err(|e| WiringError::DataDir(format!("{}: {e}", storage.data_dir.display())))?;

    let identity = LocalDeviceIdentity::load_or_create(&storage.data_dir)
        .map_err(|e| WiringError::Identity(format!("{e:#}")))?;
    let local = LocalDevice {
        id: identity.device_id().clone(),
        name: config.general.device_name.clone(),
        hostname: gethostname::gethostname().to_string_lossy().into_owned(),
        device_type: config.general.device_type,
    };

    let key_pair = FileKeyStore::new(storage.identity_key_path())
        .load_or_create()
        .map_err(|e| WiringError::KeyStore(e.to_string()))?;
    let keys = Arc::new(X25519KeyAgreement::new(key_pair));

    let registry = FileDeviceRegistry::open(storage.devices_path())
        .await
        .map_err(|e| WiringError::Registry(e.to_string()))?;

    let advertised_address = local_address();
    info!(
        device_id = %local.id,
        name = %local.name,
        address = %advertised_address,
        data_dir = %storage.data_dir.display(),
        "wired local device"
    );

    let deps = AppDeps {
        local,
        registry: Arc::new(registry),
        keys,
        ports: headless_collaborators(),
        transport: transport_config(config),
        pairing: PairingPolicy {
            step_timeout_secs: i64::try_from(config.pairing.timeout_secs).unwrap_or(i64::MAX),
        },
        transfers: transfer_settings(config, advertised_address),
        features: feature_settings(config),
    };
    Ok(WiredApp {
        deps,
        advertised_address,
    })
}

fn headless_collaborators() -> Collaborators {
    Collaborators {
        notifications: Arc::new(LoggingNotifications::new()),
        clipboard: Arc::new(HeadlessClipboard::new()),
        media: Arc::new(LoggingMediaControl::new()),
        commands: Arc::new(LoggingRemoteCommands),
        battery: Arc::new(HeadlessBattery::new()),
    }
}

fn transport_config(config: &AppConfig) -> TransportConfig {
    TransportConfig {
        heartbeat_interval: config.network.heartbeat_interval(),
        read_timeout: config.network.read_timeout(),
        connect_timeout: config.network.connect_timeout(),
        ..TransportConfig::default()
    }
}

fn transfer_settings(config: &AppConfig, advertised_address: IpAddr) -> TransferSettings {
    TransferSettings {
        download_dir: config.transfer.download_dir.clone(),
        chunk_size: config.transfer.chunk_size,
        auto_accept: config.transfer.auto_accept,
        response_timeout: config.transfer.response_timeout(),
        connect_timeout: config.network.connect_timeout(),
        idle_timeout: config.network.read_timeout(),
        advertised_address: advertised_address.to_string(),
        advertised_port: config.network.transfer_port,
    }
}

fn feature_settings(config: &AppConfig) -> FeatureSettings {
    FeatureSettings {
        clipboard_sync: config.clipboard.sync_enabled,
        filter_sensitive: config.clipboard.filter_sensitive,
        clipboard_history: config.clipboard.history_size,
        allow_remote_media_control: config.media.allow_remote_control,
    }
}

fn local_address() -> IpAddr {
    match local_ip_address::local_ip() {
        Ok(ip) => ip,
        Err(err) => {
            warn!(error = %err, "no routable local address, advertising loopback");
            IpAddr::from([127, 0, 0, 1])
        }
    }
}
