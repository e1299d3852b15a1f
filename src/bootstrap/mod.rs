pub mod config;
pub mod run;
pub mod tracing;
pub mod wiring;

pub use config::{load_config, resolve_config};
pub use run::run_app;
pub use self::tracing::init_tracing_subscriber;
pub use wiring::{wire_app, WiredApp, WiringError};
