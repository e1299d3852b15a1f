//! Identifier newtypes shared across the workspace.

mod id_macro;

use id_macro::impl_id;
use serde::{Deserialize, Serialize};

/// Stable identifier of a device, generated once and kept for its lifetime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

/// Identifier of a single file transfer, shared by both ends.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransferId(String);

/// Identifier carried by every control-channel message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MessageId(String);

impl_id!(DeviceId, TransferId, MessageId);
