use thiserror::Error;

use crate::ids::DeviceId;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceRegistryError {
    #[error("device {0} not found")]
    NotFound(DeviceId),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("storage error: {0}")]
    Storage(String),
}
