//! hostlink binary - launched by the host application with connection
//! parameters.
//!
//! Connects to the host, announces itself, answers `ping`, and runs until
//! interrupted. See the `hostlink` library for the transport itself.

use anyhow::{Context, Result};
use clap::Parser;
use hostlink::constants::LOG_FILE_NAME;
use hostlink::{Args, Config, Transport};
use serde_json::{json, Value};

/// Set up file logging in the working directory.
///
/// Uses `HOSTLINK_LOG_FILE` when set, otherwise `<dir>/hostlink.log`.
fn init_logging(config: &Config) -> Result<()> {
    let log_path = match std::env::var("HOSTLINK_LOG_FILE") {
        Ok(path) => std::path::PathBuf::from(path),
        Err(_) => config.dir.join(LOG_FILE_NAME),
    };
    let log_file = std::fs::File::create(&log_path)
        .with_context(|| format!("Failed to create log file at {}", log_path.display()))?;

    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .target(env_logger::Target::Pipe(Box::new(log_file)))
        .format_timestamp_secs()
        .init();
    Ok(())
}

async fn run(config: Config) -> Result<()> {
    log::info!(
        "hostlink v{} starting (plugin {})",
        env!("CARGO_PKG_VERSION"),
        config.plugin_id
    );

    let transport = Transport::start(config.transport_config());
    transport.on("ping", |_: Value| async { Ok(json!({ "pong": true })) });

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    log::info!("Shutting down...");
    transport.shutdown();
    // Let the actor close the socket before the runtime goes away.
    let _ = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        transport.wait_for_state(|s| *s == hostlink::ConnectionState::Disconnected),
    )
    .await;
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args)?;
    init_logging(&config)?;

    // Log panics to the file; the host usually discards our stderr.
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        log::error!("PANIC: {:?}", panic_info);
        default_hook(panic_info);
    }));

    tokio::runtime::Runtime::new()
        .context("Failed to start tokio runtime")?
        .block_on(run(config))
}
