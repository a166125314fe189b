//! Capture runtime executed inside each capture workload.
//!
//! The `NetworkCaptureProvider` trait (DIP) hides the native capture tool:
//! tcpdump on Linux, `netsh trace` on Windows. The `CaptureManager` drives a
//! provider through setup, the capture session, metadata collection,
//! archiving and output.

mod archive;
mod env;
mod linux;
mod manager;
mod metadata;
mod session;
mod windows;

pub use archive::compress_dir;
pub use env::CaptureEnv;
pub use linux::{tcpdump_args, LinuxProvider};
pub use manager::CaptureManager;
pub use session::{run_session, CaptureBudget, CaptureProcess, CaptureState, StopReason};
pub use windows::{classify_trace_status, netsh_args, TraceStatus, WindowsProvider};

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use crate::domain::{CaptureFilename, NodeOs};
use crate::error::RuntimeError;

/// Trait for native capture tools (Dependency Inversion Principle).
///
/// A provider knows how to start its tool and how to collect node metadata.
/// Timing, stop conditions and output are handled by the caller.
#[async_trait]
pub trait NetworkCaptureProvider: Send {
    /// Name of the native tool, used in logs and errors.
    fn tool(&self) -> &'static str;

    /// Path of the capture file the tool writes inside `workdir`.
    fn capture_file(&self, workdir: &Path, filename: &CaptureFilename) -> PathBuf;

    /// Start the tool writing to `capture_file`.
    async fn start(
        &mut self,
        env: &CaptureEnv,
        capture_file: &Path,
        workdir: &Path,
    ) -> Result<Box<dyn CaptureProcess>, RuntimeError>;

    /// Post-process the capture after the tool stopped.
    async fn finish(&mut self, _capture_file: &Path, _workdir: &Path) -> Result<(), RuntimeError> {
        Ok(())
    }

    /// Collect node network metadata into `workdir`.
    async fn collect_metadata(&self, workdir: &Path) -> Result<(), RuntimeError>;
}

/// OS this binary was built for.
pub fn native_os() -> NodeOs {
    if cfg!(windows) {
        NodeOs::Windows
    } else {
        NodeOs::Linux
    }
}

/// Provider for the OS this binary runs on.
pub fn native_provider() -> Box<dyn NetworkCaptureProvider> {
    provider_for(native_os())
}

pub fn provider_for(os: NodeOs) -> Box<dyn NetworkCaptureProvider> {
    match os {
        NodeOs::Linux => Box::new(LinuxProvider::new()),
        NodeOs::Windows => Box::new(WindowsProvider::new()),
    }
}

/// Render a command line for logs and metadata summaries.
pub(crate) fn command_line(program: &str, args: &[String]) -> String {
    std::iter::once(program)
        .chain(args.iter().map(String::as_str))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Open `name` in `workdir` for the tool's stdout/stderr, headed by the command line.
pub(crate) fn open_tool_log(
    workdir: &Path,
    name: &str,
    program: &str,
    args: &[String],
) -> Result<File, RuntimeError> {
    let path = workdir.join(name);
    let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
    writeln!(file, "{}\n", command_line(program, args))?;
    Ok(file)
}

/// Run a short-lived command and return its combined output.
///
/// A non-zero exit is reported as `ToolFailed` carrying that output.
pub(crate) async fn combined_output(program: &str, args: &[String]) -> Result<String, RuntimeError> {
    debug!("Running {}", command_line(program, args));
    let output = Command::new(program)
        .args(args)
        .output()
        .await
        .map_err(|source| RuntimeError::ToolStart {
            tool: program.to_string(),
            source,
        })?;

    let mut text = String::from_utf8_lossy(&output.stdout).into_owned();
    text.push_str(&String::from_utf8_lossy(&output.stderr));
    if output.status.success() {
        Ok(text)
    } else {
        Err(RuntimeError::ToolFailed {
            tool: command_line(program, args),
            output: text,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_command_line() {
        let args = vec!["-w".to_string(), "out.pcap".to_string()];
        assert_eq!(command_line("tcpdump", &args), "tcpdump -w out.pcap");
        assert_eq!(command_line("ss", &[]), "ss");
    }

    #[test]
    fn test_open_tool_log_writes_header() {
        let temp_dir = TempDir::new().unwrap();
        let file = open_tool_log(temp_dir.path(), "tool.log", "tcpdump", &["-D".to_string()]);
        drop(file.unwrap());

        let content = std::fs::read_to_string(temp_dir.path().join("tool.log")).unwrap();
        assert_eq!(content, "tcpdump -D\n\n");
    }

    #[test]
    fn test_provider_for_os() {
        assert_eq!(provider_for(NodeOs::Linux).tool(), "tcpdump");
        assert_eq!(provider_for(NodeOs::Windows).tool(), "netsh");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_combined_output() {
        let out = combined_output("sh", &["-c".to_string(), "echo out; echo err >&2".to_string()])
            .await
            .unwrap();
        assert_eq!(out, "out\nerr\n");

        let err = combined_output("sh", &["-c".to_string(), "echo boom; exit 3".to_string()])
            .await
            .unwrap_err();
        assert!(matches!(err, RuntimeError::ToolFailed { ref output, .. } if output == "boom\n"));
    }
}
