//! Capture manager: the whole lifecycle of one capture inside a workload.

use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::constants::CAPTURE_WORK_FOLDER;
use crate::error::RuntimeError;
use crate::sink::OutputSink;

use super::archive::compress_dir;
use super::session::{run_session, StopReason};
use super::{CaptureEnv, NetworkCaptureProvider};

pub struct CaptureManager {
    env: CaptureEnv,
    provider: Box<dyn NetworkCaptureProvider>,
    sinks: Vec<Box<dyn OutputSink>>,
    temp_root: PathBuf,
    workdir: Option<PathBuf>,
}

impl CaptureManager {
    pub fn new(env: CaptureEnv, provider: Box<dyn NetworkCaptureProvider>) -> Self {
        Self {
            env,
            provider,
            sinks: Vec::new(),
            temp_root: std::env::temp_dir(),
            workdir: None,
        }
    }

    pub fn with_sinks(mut self, sinks: Vec<Box<dyn OutputSink>>) -> Self {
        self.sinks = sinks;
        self
    }

    /// Root under which the working directory is created.
    pub fn with_temp_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.temp_root = root.into();
        self
    }

    /// Working directory of the current capture, once set up.
    pub fn workdir(&self) -> Option<&Path> {
        self.workdir.as_deref()
    }

    /// Capture packets (and metadata if requested) into a fresh working directory.
    pub async fn capture_network(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<PathBuf, RuntimeError> {
        let filename = self.env.filename();
        let workdir = self
            .temp_root
            .join(CAPTURE_WORK_FOLDER)
            .join(filename.to_string());
        tokio::fs::create_dir_all(&workdir).await?;
        self.workdir = Some(workdir.clone());
        info!("Created capture working directory {}", workdir.display());

        let capture_file = self.provider.capture_file(&workdir, &filename);
        let budget = self.env.budget();
        info!(
            capture = %self.env.capture_name,
            node = %self.env.node_hostname,
            duration = ?budget.duration,
            max_size_bytes = ?budget.max_size_bytes,
            "Starting {} capture",
            self.provider.tool()
        );

        let mut process = self
            .provider
            .start(&self.env, &capture_file, &workdir)
            .await?;
        let reason = run_session(process.as_mut(), &capture_file, &budget, cancel).await?;
        if reason == StopReason::ProcessExited {
            warn!("{} exited before a stop condition was met", self.provider.tool());
        }
        self.provider.finish(&capture_file, &workdir).await?;

        if self.env.include_metadata {
            if let Err(e) = self.provider.collect_metadata(&workdir).await {
                error!("Failed to collect network metadata: {}", e);
            }
        }

        Ok(workdir)
    }

    /// Pack `workdir` and hand the archive to every enabled sink.
    ///
    /// All sinks are attempted; the archive is removed only when all succeed.
    pub async fn output_capture(&self, workdir: &Path) -> Result<(), RuntimeError> {
        if !workdir.is_dir() {
            return Err(RuntimeError::Io(std::io::Error::new(
                std::io::ErrorKind::NotFound,
                format!("capture directory {} does not exist", workdir.display()),
            )));
        }

        let archive = compress_dir(workdir).await?;

        let mut errors = Vec::new();
        for sink in self.sinks.iter().filter(|s| s.enabled()) {
            info!(sink = sink.name(), "Delivering {}", archive.display());
            if let Err(e) = sink.output(&archive).await {
                error!(sink = sink.name(), "Output failed: {}", e);
                errors.push(e);
            }
        }

        if !errors.is_empty() {
            return Err(RuntimeError::Output(errors));
        }

        if let Err(e) = tokio::fs::remove_file(&archive).await {
            warn!("Failed to delete archive {}: {}", archive.display(), e);
        }
        Ok(())
    }

    /// Remove the working directory.
    pub async fn cleanup(&mut self) {
        let Some(workdir) = self.workdir.take() else {
            return;
        };
        info!(capture = %self.env.capture_name, "Cleaning up {}", workdir.display());
        if let Err(e) = tokio::fs::remove_dir_all(&workdir).await {
            error!("Failed to delete {}: {}", workdir.display(), e);
        }
    }

    /// Capture, output, then clean up regardless of the outcome.
    pub async fn run(&mut self, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        let result = match self.capture_network(cancel).await {
            Ok(workdir) => self.output_capture(&workdir).await,
            Err(e) => Err(e),
        };
        self.cleanup().await;
        result
    }
}
