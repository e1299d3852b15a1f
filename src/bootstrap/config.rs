//! # Configuration Loader / 配置加载器
//!
//! ## Responsibilities / 职责
//!
//! - ✅ Read TOML configuration files / 读取 TOML 配置文件
//! - ✅ Locate the config file when none is given / 未指定时查找默认配置文件
//! - ✅ Fill machine-specific blanks (dirs, hostname) / 填充与机器相关的空值
//!
//! ## Prohibited / 禁止事项
//!
//! ❌ **No business rules / 禁止业务规则**
//! ❌ **No I/O beyond reading the config file / 除读取配置外禁止 I/O**
//!
//! Directory creation happens in wiring, not here.

use std::path::{Path, PathBuf};

use anyhow::Context;
use wc_core::config::{defaults, AppConfig};

const CONFIG_FILE_NAME: &str = "config.toml";

/// Load configuration from a TOML file
/// 从 TOML 文件加载配置
///
/// Missing keys take their documented defaults; empty directories and
/// device names are left empty for [`resolve_config`] to fill.
///
/// # Errors / 错误
///
/// - File cannot be read (I/O error)
/// - Content is not valid TOML (parse error)
/// - A value has the wrong shape, e.g. an unknown `device_type`
pub fn load_config(config_path: PathBuf) -> anyhow::Result<AppConfig> {
    let content = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read config file: {}", config_path.display()))?;
    let toml_value: toml::Value =
        toml::from_str(&content).context("Failed to parse config as TOML")?;
    AppConfig::from_toml(&toml_value)
}

/// Resolve the effective configuration for this run.
///
/// 查找顺序：
/// 1. explicit path (command line)
/// 2. `<config_dir>/winux-connect/config.toml` if present
/// 3. built-in defaults
pub fn resolve_config(explicit: Option<PathBuf>) -> anyhow::Result<AppConfig> {
    let config = match explicit.or_else(default_config_path) {
        Some(path) => load_config(path)?,
        None => AppConfig::default(),
    };
    Ok(fill_machine_defaults(
        config,
        &SystemDirs {
            data_dir: dirs::data_dir(),
            download_dir: dirs::download_dir().or_else(dirs::home_dir),
            hostname: gethostname::gethostname().to_string_lossy().into_owned(),
        },
    ))
}

fn default_config_path() -> Option<PathBuf> {
    let path = dirs::config_dir()?
        .join(defaults::APP_DIR_NAME)
        .join(CONFIG_FILE_NAME);
    path.exists().then_some(path)
}

/// Platform locations used to fill blanks in a loaded config.
struct SystemDirs {
    data_dir: Option<PathBuf>,
    download_dir: Option<PathBuf>,
    hostname: String,
}

fn fill_machine_defaults(mut config: AppConfig, system: &SystemDirs) -> AppConfig {
    if is_blank(&config.storage.data_dir) {
        config.storage.data_dir = system
            .data_dir
            .as_deref()
            .map(|dir| dir.join(defaults::APP_DIR_NAME))
            .unwrap_or_else(|| PathBuf::from(".").join(defaults::APP_DIR_NAME));
    }
    if is_blank(&config.transfer.download_dir) {
        config.transfer.download_dir = system
            .download_dir
            .as_deref()
            .map(|dir| dir.join(defaults::DOWNLOAD_SUBDIR))
            .unwrap_or_else(|| config.storage.data_dir.join("downloads"));
    }
    if config.general.device_name.trim().is_empty() {
        config.general.device_name = if system.hostname.is_empty() {
            "Winux".to_string()
        } else {
            system.hostname.clone()
        };
    }
    config
}

fn is_blank(path: &Path) -> bool {
    path.as_os_str().is_empty()
}
