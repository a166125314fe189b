//! In-workload capture entrypoint.
//!
//! Reads the capture settings from the environment, captures on this node
//! until a stop condition or a termination signal, then ships the archive to
//! every configured sink.

use std::process::ExitCode;

use anyhow::{Context, Result};
use nettrace::runtime::{native_os, native_provider, CaptureEnv, CaptureManager};
use nettrace::sink::default_sinks;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

fn main() -> ExitCode {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("Capture failed: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run() -> Result<()> {
    let env = CaptureEnv::from_env().context("Failed to read capture settings")?;
    info!(
        capture = %env.capture_name,
        node = %env.node_hostname,
        "Starting nettrace-capture {}",
        env!("CARGO_PKG_VERSION")
    );

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    ctrlc::set_handler(move || {
        info!("Received termination signal, stopping capture");
        on_signal.cancel();
    })
    .context("Failed to set signal handler")?;

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("Failed to create Tokio runtime")?;

    let os = native_os();
    let mut manager = CaptureManager::new(env, native_provider()).with_sinks(default_sinks(os));
    runtime
        .block_on(manager.run(&cancel))
        .context("Capture did not complete")?;

    info!("Capture complete");
    Ok(())
}
