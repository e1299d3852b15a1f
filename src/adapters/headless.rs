//! Headless collaborator ports.
//!
//! The daemon has no desktop shell to talk to, so inbound features are logged
//! and kept in memory where a later request needs them (active notifications,
//! clipboard text, the peer's player state). Battery is read from sysfs.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::{debug, info};
use wc_core::network::{
    BatteryStatusPayload, MediaControlPayload, MediaStatePayload, NotificationPayload,
};
use wc_core::ports::{
    BatteryPort, ClipboardPort, MediaControlPort, NotificationPort, RemoteCommand,
    RemoteCommandPort,
};
use wc_core::DeviceId;

const SYSFS_POWER_SUPPLY: &str = "/sys/class/power_supply";

/// Mirrored notifications, most recent last.
#[derive(Default)]
pub struct LoggingNotifications {
    active: Mutex<Vec<NotificationPayload>>,
}

impl LoggingNotifications {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> anyhow::Result<std::sync::MutexGuard<'_, Vec<NotificationPayload>>> {
        self.active
            .lock()
            .map_err(|_| anyhow::anyhow!("notification list poisoned"))
    }
}

#[async_trait]
impl NotificationPort for LoggingNotifications {
    async fn show(&self, from: &DeviceId, notification: NotificationPayload) -> anyhow::Result<()> {
        info!(
            device_id = %from,
            app = %notification.app_name,
            title = %notification.title,
            "notification"
        );
        let mut active = self.lock()?;
        // 同 id 的通知视为更新
        active.retain(|n| n.id != notification.id);
        active.push(notification);
        Ok(())
    }

    async fn dismiss(&self, from: &DeviceId, notification_id: &str) -> anyhow::Result<()> {
        debug!(device_id = %from, notification_id, "notification dismissed");
        self.lock()?.retain(|n| n.id != notification_id);
        Ok(())
    }

    async fn invoke_action(
        &self,
        from: &DeviceId,
        notification_id: &str,
        action: &str,
    ) -> anyhow::Result<()> {
        info!(device_id = %from, notification_id, action, "notification action invoked");
        Ok(())
    }

    async fn active(&self) -> anyhow::Result<Vec<NotificationPayload>> {
        Ok(self.lock()?.clone())
    }
}

/// Process-local clipboard.
#[derive(Default)]
pub struct HeadlessClipboard {
    text: Mutex<Option<String>>,
}

impl HeadlessClipboard {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ClipboardPort for HeadlessClipboard {
    async fn read_text(&self) -> anyhow::Result<Option<String>> {
        let text = self
            .text
            .lock()
            .map_err(|_| anyhow::anyhow!("clipboard poisoned"))?;
        Ok(text.clone())
    }

    async fn write_text(&self, text: &str) -> anyhow::Result<()> {
        debug!(len = text.len(), "clipboard updated by peer");
        *self
            .text
            .lock()
            .map_err(|_| anyhow::anyhow!("clipboard poisoned"))? = Some(text.to_string());
        Ok(())
    }
}

/// Logs control requests; remembers what each peer's player reports.
#[derive(Default)]
pub struct LoggingMediaControl {
    remote: Mutex<HashMap<DeviceId, MediaStatePayload>>,
}

impl LoggingMediaControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn remote_state(&self, device_id: &DeviceId) -> Option<MediaStatePayload> {
        self.remote.lock().ok()?.get(device_id).cloned()
    }
}

#[async_trait]
impl MediaControlPort for LoggingMediaControl {
    async fn apply(&self, from: &DeviceId, control: MediaControlPayload) -> anyhow::Result<()> {
        info!(device_id = %from, action = ?control.action, value = ?control.value, "media control");
        Ok(())
    }

    async fn current_state(&self) -> anyhow::Result<Option<MediaStatePayload>> {
        Ok(None)
    }

    async fn remote_state_changed(
        &self,
        from: &DeviceId,
        state: MediaStatePayload,
    ) -> anyhow::Result<()> {
        debug!(device_id = %from, playing = state.is_playing, title = ?state.title, "remote media state");
        self.remote
            .lock()
            .map_err(|_| anyhow::anyhow!("media state poisoned"))?
            .insert(from.clone(), state);
        Ok(())
    }
}

pub struct LoggingRemoteCommands;

#[async_trait]
impl RemoteCommandPort for LoggingRemoteCommands {
    async fn execute(&self, from: &DeviceId, command: RemoteCommand) -> anyhow::Result<()> {
        info!(device_id = %from, command = ?command, "remote command");
        Ok(())
    }
}

/// Reads the first `Battery` supply under `/sys/class/power_supply`.
pub struct HeadlessBattery {
    root: PathBuf,
}

impl HeadlessBattery {
    pub fn new() -> Self {
        Self::with_root(SYSFS_POWER_SUPPLY)
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for HeadlessBattery {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BatteryPort for HeadlessBattery {
    async fn local_status(&self) -> anyhow::Result<Option<BatteryStatusPayload>> {
        // 台式机通常没有 power_supply 目录
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(_) => return Ok(None),
        };
        let mut supplies = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            supplies.push(entry.path());
        }
        supplies.sort();

        for supply in supplies {
            if let Some(status) = read_battery(&supply).await {
                return Ok(Some(status));
            }
        }
        Ok(None)
    }
}

async fn read_battery(supply: &Path) -> Option<BatteryStatusPayload> {
    let kind = tokio::fs::read_to_string(supply.join("type")).await.ok()?;
    if kind.trim() != "Battery" {
        return None;
    }
    let capacity = tokio::fs::read_to_string(supply.join("capacity")).await.ok()?;
    let level = capacity.trim().parse::<u8>().ok()?.min(100);
    let is_charging = tokio::fs::read_to_string(supply.join("status"))
        .await
        .map(|s| matches!(s.trim(), "Charging" | "Full"))
        .unwrap_or(false);
    Some(BatteryStatusPayload {
        level,
        is_charging,
        threshold_event: false,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn notification(id: &str, title: &str) -> NotificationPayload {
        NotificationPayload {
            id: id.into(),
            app_name: "Chat".into(),
            title: title.into(),
            text: String::new(),
            ticker: None,
            is_clearable: true,
            time: None,
            actions: Vec::new(),
        }
    }

    async fn write_supply(root: &Path, name: &str, kind: &str, capacity: &str, status: &str) {
        let dir = root.join(name);
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("type"), format!("{kind}\n")).await.unwrap();
        tokio::fs::write(dir.join("capacity"), format!("{capacity}\n")).await.unwrap();
        tokio::fs::write(dir.join("status"), format!("{status}\n")).await.unwrap();
    }

    #[tokio::test]
    async fn notifications_update_in_place_and_dismiss() {
        let port = LoggingNotifications::new();
        let phone = DeviceId::new();
        port.show(&phone, notification("1", "first")).await.unwrap();
        port.show(&phone, notification("2", "second")).await.unwrap();
        port.show(&phone, notification("1", "edited")).await.unwrap();

        let active = port.active().await.unwrap();
        assert_eq!(active.len(), 2);
        assert_eq!(active[1].title, "edited");

        port.dismiss(&phone, "1").await.unwrap();
        let active = port.active().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "2");
    }

    #[tokio::test]
    async fn clipboard_starts_empty() {
        let clipboard = HeadlessClipboard::new();
        assert_eq!(clipboard.read_text().await.unwrap(), None);
        clipboard.write_text("hi").await.unwrap();
        assert_eq!(clipboard.read_text().await.unwrap().as_deref(), Some("hi"));
    }

    #[tokio::test]
    async fn remote_media_state_is_kept_per_device() {
        let media = LoggingMediaControl::new();
        let phone = DeviceId::new();
        let state = MediaStatePayload {
            title: Some("Song".into()),
            is_playing: true,
            ..MediaStatePayload::default()
        };
        media.remote_state_changed(&phone, state.clone()).await.unwrap();
        assert_eq!(media.remote_state(&phone), Some(state));
        assert_eq!(media.current_state().await.unwrap(), None);
    }

    #[tokio::test]
    async fn battery_reads_first_battery_supply() {
        let root = tempfile::tempdir().unwrap();
        write_supply(root.path(), "AC", "Mains", "0", "Unknown").await;
        write_supply(root.path(), "BAT0", "Battery", "76", "Charging").await;

        let status = HeadlessBattery::with_root(root.path())
            .local_status()
            .await
            .unwrap()
            .unwrap();
        assert_eq!(status.level, 76);
        assert!(status.is_charging);
        assert!(!status.threshold_event);
    }

    #[tokio::test]
    async fn battery_is_none_without_supplies() {
        let root = tempfile::tempdir().unwrap();
        let missing = root.path().join("power_supply");
        assert_eq!(
            HeadlessBattery::with_root(&missing).local_status().await.unwrap(),
            None
        );

        write_supply(root.path(), "AC", "Mains", "0", "Unknown").await;
        assert_eq!(
            HeadlessBattery::with_root(root.path()).local_status().await.unwrap(),
            None
        );
    }
}
