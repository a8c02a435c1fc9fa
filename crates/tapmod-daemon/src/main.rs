//! tapmod daemon
//!
//! Grabs one keyboard, remaps its keys and re-emits them through a virtual
//! device.

mod daemon;
mod device;
mod dual;
mod error;
mod injector;
mod remapper;
mod sync;

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tapmod_config::Config;
use tokio::signal::unix::{signal, SignalKind};
use tracing_subscriber::EnvFilter;

use crate::daemon::Daemon;
use crate::device::DeviceSource;
use crate::error::DaemonError;
use crate::injector::VirtualDevice;

#[derive(Parser, Debug)]
#[command(name = "tapmodd", version)]
#[command(about = "Tap/hold key remapping daemon")]
struct Args {
    /// Input device to remap (e.g. /dev/input/event3)
    device: PathBuf,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = Config::default();
    config.validate().map_err(DaemonError::InvalidConfig)?;

    tracing::info!(
        "Using built-in configuration with {} mapping(s) and {} dual-function key(s)",
        config.mappings.len(),
        config.dual_function_keys.len()
    );
    for key in &config.dual_function_keys {
        tracing::debug!("Dual-function key: {}", key);
    }

    // Let the key that launched us be released before the grab
    tokio::time::sleep(config.startup_delay).await;

    let mut source = DeviceSource::open(&args.device)
        .with_context(|| format!("Failed to open {}", args.device.display()))?;
    tracing::info!("Opened '{}' at {}", source.name(), args.device.display());

    let sink = VirtualDevice::from_template(source.device(), &config)
        .context("Failed to create virtual device")?;
    tracing::debug!("Virtual device '{}' ready", sink.name());

    source
        .grab()
        .with_context(|| format!("Failed to grab {}", args.device.display()))?;

    let mut daemon = Daemon::new(source, sink, &config);
    let result = daemon.run(shutdown_signal()).await;

    // Release the grab and destroy the virtual device before reporting
    drop(daemon);

    if let Err(ref e) = result {
        tracing::error!("Daemon stopped: {}", e);
    }
    result.context("Remapping failed")
}

/// Completes on SIGINT or SIGTERM.
async fn shutdown_signal() {
    let mut terminate = match signal(SignalKind::terminate()) {
        Ok(terminate) => terminate,
        Err(e) => {
            tracing::warn!("Failed to install SIGTERM handler: {}", e);
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
            return;
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => match result {
            Ok(()) => tracing::info!("Received SIGINT"),
            Err(e) => {
                tracing::warn!("Failed to listen for Ctrl-C: {}", e);
                terminate.recv().await;
                tracing::info!("Received SIGTERM");
            }
        },
        _ = terminate.recv() => {
            tracing::info!("Received SIGTERM");
        }
    }
}
