//! Tracing configuration for Winux Connect
//!
//! ## Architecture / 架构
//!
//! - Stdout layer always on; file layer under `<data_dir>/logs` when writable
//! - `log` records from dependencies (mdns-sd) are bridged via `tracing-log`
//! - `RUST_LOG` overrides the built-in directives

use std::{fs, io, path::Path, sync::OnceLock};

use tracing_appender::non_blocking::{NonBlocking, WorkerGuard};
use tracing_subscriber::{fmt, fmt::writer::BoxMakeWriter, prelude::*, registry, EnvFilter};

const LOG_FILE_NAME: &str = "winux-connect.log";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

static LOG_GUARD: OnceLock<WorkerGuard> = OnceLock::new();

fn is_development() -> bool {
    cfg!(debug_assertions)
}

/// Build the default filter directives for tracing
///
/// ## Behavior / 行为
/// - **Development**: debug for the wc_* crates
/// - **Production**: info everywhere
/// - **mDNS**: mdns_sd is chatty about unreachable interfaces, keep it at warn
fn build_filter_directives(is_dev: bool) -> Vec<String> {
    let crate_level = if is_dev { "debug" } else { "info" };
    vec![
        "info".to_string(),
        "mdns_sd=warn".to_string(),
        format!("winux_connect={crate_level}"),
        format!("winux_connect_lib={crate_level}"),
        format!("wc_app={crate_level}"),
        format!("wc_network={crate_level}"),
        format!("wc_infra={crate_level}"),
        format!("wc_core={crate_level}"),
    ]
}

/// Initialize the tracing subscriber.
///
/// Call once from `main`, before the runtime starts. A file layer that
/// cannot be created is reported on stderr and skipped.
///
/// ## Errors / 错误
///
/// - A global subscriber is already registered
/// - The `log` bridge is already installed
pub fn init_tracing_subscriber(logs_dir: &Path) -> anyhow::Result<()> {
    let filter_directives = build_filter_directives(is_development());
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(filter_directives.join(",")));

    let file_writer = match build_file_writer(logs_dir) {
        Ok(writer) => Some(writer),
        Err(err) => {
            eprintln!("Failed to initialize file logging, falling back to stdout: {err}");
            None
        }
    };

    // "2026-01-15 10:30:45.123 INFO [file.rs:42] [target] message"
    let stdout_layer = fmt::layer()
        .with_timer(fmt::time::ChronoUtc::new(TIMESTAMP_FORMAT.to_string()))
        .with_level(true)
        .with_file(true)
        .with_line_number(true)
        .with_target(true)
        .with_ansi(cfg!(not(test)))
        .with_writer(BoxMakeWriter::new(io::stdout));

    let file_layer = file_writer.map(|writer| {
        fmt::layer()
            .with_timer(fmt::time::ChronoUtc::new(TIMESTAMP_FORMAT.to_string()))
            .with_level(true)
            .with_file(true)
            .with_line_number(true)
            .with_target(true)
            .with_ansi(false)
            .with_writer(writer)
    });

    let subscriber = registry()
        .with(env_filter)
        .with(stdout_layer)
        .with(file_layer);
    tracing::subscriber::set_global_default(subscriber)?;
    tracing_log::LogTracer::init()?;

    Ok(())
}

fn build_file_writer(logs_dir: &Path) -> anyhow::Result<NonBlocking> {
    fs::create_dir_all(logs_dir)?;

    let file_appender = tracing_appender::rolling::never(logs_dir, LOG_FILE_NAME);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    LOG_GUARD
        .set(guard)
        .map_err(|_| anyhow::anyhow!("Tracing log guard already initialized"))?;

    Ok(non_blocking)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_directives() {
        let dev_directives = build_filter_directives(true);
        assert!(dev_directives.contains(&"mdns_sd=warn".to_string()));
        assert!(dev_directives.contains(&"wc_app=debug".to_string()));
        assert!(dev_directives.contains(&"wc_network=debug".to_string()));

        let prod_directives = build_filter_directives(false);
        assert!(prod_directives.contains(&"info".to_string()));
        assert!(prod_directives.contains(&"mdns_sd=warn".to_string()));
        assert!(prod_directives.contains(&"wc_app=info".to_string()));
    }

    #[test]
    fn directives_form_a_valid_filter() {
        for is_dev in [true, false] {
            let joined = build_filter_directives(is_dev).join(",");
            assert!(EnvFilter::try_new(&joined).is_ok(), "{joined}");
        }
    }
}
