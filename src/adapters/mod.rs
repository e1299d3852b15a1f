//! Collaborator adapters for headless use.

pub mod headless;

pub use headless::{
    HeadlessBattery, HeadlessClipboard, LoggingMediaControl, LoggingNotifications,
    LoggingRemoteCommands,
};
