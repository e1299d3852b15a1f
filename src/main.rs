use std::path::PathBuf;

use anyhow::Context;
use winux_connect_lib::bootstrap::{init_tracing_subscriber, resolve_config, run_app};

fn main() -> anyhow::Result<()> {
    // 第一个参数为配置文件路径 (可选)
    let config_path = std::env::args_os().nth(1).map(PathBuf::from);
    let config = resolve_config(config_path)?;

    if let Err(err) = init_tracing_subscriber(&config.storage.logs_dir()) {
        eprintln!("Failed to initialize tracing: {err:#}");
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("winux-connect")
        .build()
        .context("build tokio runtime")?;
    runtime.block_on(run_app(config))
}
