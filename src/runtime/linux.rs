//! tcpdump capture provider.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::{Child, Command};
use tracing::{info, warn};

use crate::domain::CaptureFilename;
use crate::error::RuntimeError;

use super::session::CaptureProcess;
use super::{command_line, metadata, open_tool_log, CaptureEnv, NetworkCaptureProvider};

const TCPDUMP: &str = "tcpdump";
const TCPDUMP_LOG: &str = "tcpdump.log";

/// Arguments for a tcpdump run writing to `capture_file`.
///
/// A raw filter replaces both the interface selection and the compiled
/// filter; otherwise the named interfaces are used, or `any`.
pub fn tcpdump_args(env: &CaptureEnv, capture_file: &Path) -> Vec<String> {
    // The image has no tcpdump user to drop privileges to.
    let mut args = vec![
        "-w".to_string(),
        capture_file.display().to_string(),
        "--relinquish-privileges=root".to_string(),
    ];

    if let Some(size) = env.packet_size {
        args.push("-s".to_string());
        args.push(size.to_string());
    }

    if let Some(raw) = &env.raw_filter {
        args.extend(raw.split_whitespace().map(str::to_string));
        return args;
    }

    if env.interfaces.is_empty() {
        args.push("-i".to_string());
        args.push("any".to_string());
    } else {
        for iface in &env.interfaces {
            args.push("-i".to_string());
            args.push(iface.clone());
        }
    }

    if let Some(filter) = &env.tcpdump_filter {
        args.push(filter.clone());
    }
    args
}

#[derive(Debug, Default)]
pub struct LinuxProvider;

impl LinuxProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl NetworkCaptureProvider for LinuxProvider {
    fn tool(&self) -> &'static str {
        TCPDUMP
    }

    fn capture_file(&self, workdir: &Path, filename: &CaptureFilename) -> PathBuf {
        workdir.join(format!("{}.pcap", filename))
    }

    async fn start(
        &mut self,
        env: &CaptureEnv,
        capture_file: &Path,
        workdir: &Path,
    ) -> Result<Box<dyn CaptureProcess>, RuntimeError> {
        // A leftover file would satisfy the size check early.
        if capture_file.exists() {
            tokio::fs::remove_file(capture_file).await?;
        }

        let args = tcpdump_args(env, capture_file);
        info!("Running {}", command_line(TCPDUMP, &args));

        let log = open_tool_log(workdir, TCPDUMP_LOG, TCPDUMP, &args)?;
        let child = Command::new(TCPDUMP)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log.try_clone()?))
            .stderr(Stdio::from(log))
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| RuntimeError::ToolStart {
                tool: TCPDUMP.to_string(),
                source,
            })?;

        Ok(Box::new(TcpdumpProcess { child }))
    }

    async fn finish(&mut self, _capture_file: &Path, workdir: &Path) -> Result<(), RuntimeError> {
        match tokio::fs::read_to_string(workdir.join(TCPDUMP_LOG)).await {
            Ok(output) => info!("tcpdump output: {}", output.trim_end()),
            Err(e) => warn!("Failed to read tcpdump log: {}", e),
        }
        Ok(())
    }

    async fn collect_metadata(&self, workdir: &Path) -> Result<(), RuntimeError> {
        metadata::collect_linux(workdir).await
    }
}

struct TcpdumpProcess {
    child: Child,
}

#[async_trait]
impl CaptureProcess for TcpdumpProcess {
    fn tool(&self) -> &str {
        TCPDUMP
    }

    fn has_exited(&mut self) -> Result<bool, RuntimeError> {
        Ok(self.child.try_wait()?.is_some())
    }

    /// SIGTERM lets tcpdump flush buffered packets before exiting.
    async fn request_stop(&mut self) -> Result<(), RuntimeError> {
        let pid = self
            .child
            .id()
            .ok_or_else(|| RuntimeError::StopFailed("tcpdump already exited".to_string()))?;
        terminate(pid)
    }

    async fn kill(&mut self) -> Result<(), RuntimeError> {
        self.child.start_kill()?;
        Ok(())
    }

    async fn wait(&mut self) -> Result<(), RuntimeError> {
        let status = self.child.wait().await?;
        info!("tcpdump exited with {}", status);
        Ok(())
    }
}

#[cfg(unix)]
fn terminate(pid: u32) -> Result<(), RuntimeError> {
    let pid = libc::pid_t::try_from(pid)
        .map_err(|_| RuntimeError::StopFailed(format!("invalid pid {}", pid)))?;
    // SAFETY: signalling a child process we spawned and have not reaped.
    let rc = unsafe { libc::kill(pid, libc::SIGTERM) };
    if rc == 0 {
        Ok(())
    } else {
        Err(RuntimeError::StopFailed(
            std::io::Error::last_os_error().to_string(),
        ))
    }
}

#[cfg(not(unix))]
fn terminate(pid: u32) -> Result<(), RuntimeError> {
    Err(RuntimeError::StopFailed(format!(
        "no graceful stop for pid {} on this platform",
        pid
    )))
}
