//! Platform collaborators reached by inbound control messages.

use async_trait::async_trait;

use crate::ids::DeviceId;
use crate::network::payload::{
    BatteryStatusPayload, MediaControlPayload, MediaStatePayload, NotificationPayload,
};

/// Mirrors phone notifications on this host.
#[async_trait]
pub trait NotificationPort: Send + Sync {
    async fn show(&self, from: &DeviceId, notification: NotificationPayload)
        -> anyhow::Result<()>;

    async fn dismiss(&self, from: &DeviceId, notification_id: &str) -> anyhow::Result<()>;

    /// The peer invoked `action` on a notification we forwarded.
    async fn invoke_action(
        &self,
        from: &DeviceId,
        notification_id: &str,
        action: &str,
    ) -> anyhow::Result<()>;

    async fn active(&self) -> anyhow::Result<Vec<NotificationPayload>>;
}

#[async_trait]
pub trait ClipboardPort: Send + Sync {
    async fn read_text(&self) -> anyhow::Result<Option<String>>;

    async fn write_text(&self, text: &str) -> anyhow::Result<()>;
}

#[async_trait]
pub trait MediaControlPort: Send + Sync {
    async fn apply(&self, from: &DeviceId, control: MediaControlPayload) -> anyhow::Result<()>;

    /// State of the local player, sent back on request.
    async fn current_state(&self) -> anyhow::Result<Option<MediaStatePayload>>;

    /// The peer reported its own player state.
    async fn remote_state_changed(
        &self,
        from: &DeviceId,
        state: MediaStatePayload,
    ) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemoteCommand {
    Ring,
    FindPhone,
    Lock,
    Screenshot,
}

#[async_trait]
pub trait RemoteCommandPort: Send + Sync {
    async fn execute(&self, from: &DeviceId, command: RemoteCommand) -> anyhow::Result<()>;
}

#[async_trait]
pub trait BatteryPort: Send + Sync {
    /// Battery of this host; `None` when there is none.
    async fn local_status(&self) -> anyhow::Result<Option<BatteryStatusPayload>>;
}
