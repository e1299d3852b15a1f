//! Documented fallback values for [`AppConfig`](super::AppConfig) fields.
//! 配置缺省值

use crate::network::{DEFAULT_CONTROL_PORT, DEFAULT_TRANSFER_PORT};
use crate::pairing::PAIRING_TIMEOUT_SECS;
use crate::transfer::DEFAULT_CHUNK_SIZE;

pub const CONTROL_PORT: u16 = DEFAULT_CONTROL_PORT;
pub const TRANSFER_PORT: u16 = DEFAULT_TRANSFER_PORT;

/// Interval between outbound `ping` messages.
pub const HEARTBEAT_INTERVAL_SECS: u64 = 15;

/// A session with no inbound traffic for this long is considered dead.
pub const READ_TIMEOUT_SECS: u64 = 30;

pub const CONNECT_TIMEOUT_SECS: u64 = 10;

pub const DISCOVERY_ENABLED: bool = true;

pub const PAIRING_STEP_TIMEOUT_SECS: u64 = PAIRING_TIMEOUT_SECS as u64;

pub const CHUNK_SIZE: usize = DEFAULT_CHUNK_SIZE;

pub const AUTO_ACCEPT: bool = false;

/// How long `send_file` waits for accept or reject.
pub const TRANSFER_RESPONSE_TIMEOUT_SECS: u64 = 60;

pub const CLIPBOARD_SYNC_ENABLED: bool = true;

pub const CLIPBOARD_FILTER_SENSITIVE: bool = true;

/// Entries kept in the clipboard history, newest first.
pub const CLIPBOARD_HISTORY_SIZE: usize = 100;

pub const MEDIA_ALLOW_REMOTE_CONTROL: bool = true;

/// Directory name used under the platform download/data dirs.
pub const APP_DIR_NAME: &str = "winux-connect";

pub const DOWNLOAD_SUBDIR: &str = "Winux Connect";
