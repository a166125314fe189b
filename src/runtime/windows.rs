//! `netsh trace` capture provider.
//!
//! netsh runs the trace session in the background, so the spawned command
//! returns immediately and stopping means running `netsh trace stop`.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{info, warn};

use crate::constants::{CAPTURE_WORK_FOLDER, ENV_CONTAINER_SANDBOX_MOUNT_POINT};
use crate::domain::CaptureFilename;
use crate::error::RuntimeError;

use super::session::CaptureProcess;
use super::{combined_output, command_line, metadata, open_tool_log, CaptureEnv, NetworkCaptureProvider};

const NETSH: &str = "netsh";
const NETSH_LOG: &str = "netsh.log";
const NO_SESSION_MARKER: &str = "There is no trace session currently in progress";
const ETL2PCAPNG: &str = "etl2pcapng.exe";

/// State of the host's `netsh trace` facility.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TraceStatus {
    Idle,
    /// A session started by a previous capture of ours.
    Owned,
    /// A session started by someone else.
    Foreign,
}

/// Classify `netsh trace show status` output.
pub fn classify_trace_status(output: &str) -> TraceStatus {
    if output.contains(NO_SESSION_MARKER) {
        TraceStatus::Idle
    } else if output.contains(CAPTURE_WORK_FOLDER) {
        TraceStatus::Owned
    } else {
        TraceStatus::Foreign
    }
}

/// Arguments for `netsh trace start` writing to `trace_file`.
pub fn netsh_args(env: &CaptureEnv, trace_file: &Path) -> Vec<String> {
    let mut args: Vec<String> = [
        "trace",
        "start",
        "capture=yes",
        "report=disabled",
        "overwrite=yes",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect();
    args.push(format!("tracefile={}", trace_file.display()));

    // Each `Key=(values)` token is its own argument.
    if let Some(filter) = &env.netsh_filter {
        args.extend(filter.split_whitespace().map(str::to_string));
    }

    // netsh caps the trace file itself; it does not stop at the limit.
    if let Some(max) = env.max_size_mb {
        args.push(format!("maxSize={}", max));
    }
    args
}

#[derive(Debug, Default)]
pub struct WindowsProvider;

impl WindowsProvider {
    pub fn new() -> Self {
        Self
    }

    /// Stop a stale session of ours; refuse to touch anyone else's.
    async fn ensure_no_trace_session(&self) -> Result<(), RuntimeError> {
        let args = vec!["trace".to_string(), "show".to_string(), "status".to_string()];
        // `show status` exits non-zero when idle.
        let output = match combined_output(NETSH, &args).await {
            Ok(output) => output,
            Err(RuntimeError::ToolFailed { output, .. }) if output.contains(NO_SESSION_MARKER) => {
                output
            }
            Err(e) => return Err(e),
        };

        match classify_trace_status(&output) {
            TraceStatus::Idle => {
                info!("No running trace session");
                Ok(())
            }
            TraceStatus::Owned => {
                info!("Stopping trace session left by a previous capture");
                stop_trace().await
            }
            TraceStatus::Foreign => Err(RuntimeError::ConflictingTraceSession(
                output.trim().to_string(),
            )),
        }
    }
}

#[async_trait]
impl NetworkCaptureProvider for WindowsProvider {
    fn tool(&self) -> &'static str {
        NETSH
    }

    fn capture_file(&self, workdir: &Path, filename: &CaptureFilename) -> PathBuf {
        workdir.join(format!("{}.etl", filename))
    }

    async fn start(
        &mut self,
        env: &CaptureEnv,
        capture_file: &Path,
        workdir: &Path,
    ) -> Result<Box<dyn CaptureProcess>, RuntimeError> {
        self.ensure_no_trace_session().await?;

        let args = netsh_args(env, capture_file);
        info!("Running {}", command_line(NETSH, &args));
        let mut log = open_tool_log(workdir, NETSH_LOG, NETSH, &args)?;

        let output = combined_output(NETSH, &args).await?;
        std::io::Write::write_all(&mut log, output.as_bytes())?;
        info!("netsh output: {}", output.trim_end());

        Ok(Box::new(NetshSession))
    }

    async fn finish(&mut self, capture_file: &Path, _workdir: &Path) -> Result<(), RuntimeError> {
        // The .etl is kept next to the .pcap.
        if let Err(e) = etl_to_pcap(capture_file).await {
            warn!("Failed to convert {} to pcap: {}", capture_file.display(), e);
        }
        Ok(())
    }

    async fn collect_metadata(&self, workdir: &Path) -> Result<(), RuntimeError> {
        metadata::collect_windows(workdir).await
    }
}

async fn stop_trace() -> Result<(), RuntimeError> {
    let args = vec!["trace".to_string(), "stop".to_string()];
    match combined_output(NETSH, &args).await {
        Ok(_) => Ok(()),
        Err(RuntimeError::ToolFailed { output, .. }) if output.contains(NO_SESSION_MARKER) => Ok(()),
        Err(e) => Err(RuntimeError::StopFailed(e.to_string())),
    }
}

struct NetshSession;

#[async_trait]
impl CaptureProcess for NetshSession {
    fn tool(&self) -> &str {
        NETSH
    }

    fn has_exited(&mut self) -> Result<bool, RuntimeError> {
        Ok(false)
    }

    async fn request_stop(&mut self) -> Result<(), RuntimeError> {
        info!("Stopping netsh trace session");
        stop_trace().await
    }

    async fn kill(&mut self) -> Result<(), RuntimeError> {
        // Nothing left to kill once `trace stop` failed.
        Err(RuntimeError::StopFailed(
            "netsh trace session could not be stopped".to_string(),
        ))
    }

    async fn wait(&mut self) -> Result<(), RuntimeError> {
        Ok(())
    }
}

async fn etl_to_pcap(etl: &Path) -> Result<(), RuntimeError> {
    let sandbox = std::env::var(ENV_CONTAINER_SANDBOX_MOUNT_POINT)
        .ok()
        .filter(|v| !v.is_empty())
        .ok_or(RuntimeError::MissingEnv(ENV_CONTAINER_SANDBOX_MOUNT_POINT))?;
    let tool = Path::new(&sandbox).join(ETL2PCAPNG);
    let pcap = etl.with_extension("pcap");

    let args = vec![etl.display().to_string(), pcap.display().to_string()];
    combined_output(&tool.display().to_string(), &args).await?;
    info!("Converted capture to {}", pcap.display());
    Ok(())
}
