use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::{info, warn};
use tokio_util::sync::CancellationToken;

use pineconnect_lib::config::{default_config_path, DaemonConfig};
use pineconnect_lib::core::bluetooth::{BluestTransport, Transport};
use pineconnect_lib::daemon::Daemon;
use pineconnect_lib::logging;
use pineconnect_lib::state::AppState;

#[derive(Parser)]
#[command(name = "pineconnect")]
#[command(about = "Companion daemon keeping PineTime watches connected and in sync", long_about = None)]
#[command(version)]
struct Cli {
    /// Config file, defaults to <config dir>/pineconnect/config.json
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Overrides the configured log level (error, warn, info, verbose, debug, trace)
    #[arg(short, long)]
    log_level: Option<String>,

    /// Manages this device instead of the configured ones; may be repeated
    #[arg(short, long = "device", value_name = "ADDRESS")]
    devices: Vec<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .or_else(default_config_path)
        .context("No config directory available, pass --config")?;
    // nothing is logged until the level is known
    let (mut config, source) = DaemonConfig::read_config(&config_path).await?;
    if let Some(level) = cli.log_level {
        config.log_level = level;
    }
    if !cli.devices.is_empty() {
        config.managed_devices = cli.devices;
    }

    let level = logging::parse_level(&config.log_level)
        .with_context(|| format!("Unknown log level {:?}", config.log_level))?;
    logging::init(level).context("Failed to initialize logging")?;
    info!("Starting.");
    source.log();

    let transport: Arc<dyn Transport> = Arc::new(BluestTransport::new(config.adapter.clone()));
    let state = AppState::new(&config, transport.clone());

    let shutdown = CancellationToken::new();
    tokio::spawn(watch_signals(shutdown.clone()));

    Daemon::new(state, transport, config.cycle_interval(), shutdown)
        .run()
        .await;

    info!("Exiting.");
    Ok(())
}

/// Cancels `shutdown` on SIGINT, SIGTERM or SIGHUP
#[cfg(unix)]
async fn watch_signals(shutdown: CancellationToken) {
    use tokio::signal::unix::{signal, SignalKind};

    let streams = (
        signal(SignalKind::interrupt()),
        signal(SignalKind::terminate()),
        signal(SignalKind::hangup()),
    );
    let (mut interrupt, mut terminate, mut hangup) = match streams {
        (Ok(i), Ok(t), Ok(h)) => (i, t, h),
        _ => {
            warn!("Could not install signal handlers, falling back to Ctrl-C.");
            cancel_on_ctrl_c(tokio::signal::ctrl_c(), shutdown).await;
            return;
        }
    };

    tokio::select! {
        _ = interrupt.recv() => info!("Received SIGINT."),
        _ = terminate.recv() => info!("Received SIGTERM."),
        _ = hangup.recv() => info!("Received SIGHUP."),
    }
    shutdown.cancel();
}

#[cfg(not(unix))]
async fn watch_signals(shutdown: CancellationToken) {
    cancel_on_ctrl_c(tokio::signal::ctrl_c(), shutdown).await;
}

/// Cancels `shutdown` once `ctrl_c` fires. If listening fails the daemon keeps running.
async fn cancel_on_ctrl_c<F>(ctrl_c: F, shutdown: CancellationToken)
where
    F: Future<Output = io::Result<()>>,
{
    if let Err(e) = ctrl_c.await {
        warn!("Could not listen for Ctrl-C: {}", e);
        return;
    }
    info!("Received Ctrl-C.");
    shutdown.cancel();
}
