//! Output sinks for finished capture archives.
//!
//! This module defines the `OutputSink` trait (DIP). Each sink decides from
//! its own configuration whether it is enabled, so the runtime only needs
//! the list of candidates.

mod blob;
mod local;
mod s3;

pub use blob::{blob_url, trim_sas_url, BlobUploadSink};
pub use local::{HostPathSink, PvcSink};
pub use s3::{S3Settings, S3UploadSink};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::fs::File;
use tokio_util::io::ReaderStream;

use crate::constants::ENV_CONTAINER_SANDBOX_MOUNT_POINT;
use crate::domain::NodeOs;
use crate::error::SinkError;

/// Trait for archive destinations (Dependency Inversion Principle).
#[async_trait]
pub trait OutputSink: Send + Sync {
    fn name(&self) -> &'static str;

    /// True when the sink's configuration is present. Read on every call.
    fn enabled(&self) -> bool;

    /// Deliver the archive at `archive`.
    async fn output(&self, archive: &Path) -> Result<(), SinkError>;
}

/// Candidate sinks in delivery order.
pub fn default_sinks(os: NodeOs) -> Vec<Box<dyn OutputSink>> {
    vec![
        Box::new(HostPathSink::new()),
        Box::new(BlobUploadSink::new(os)),
        Box::new(PvcSink::new(os)),
        Box::new(S3UploadSink::new(os)),
    ]
}

/// Where a volume mounted at `path` appears to this process.
///
/// Windows host-process containers see their mounts under the sandbox mount point.
pub(crate) fn container_path(os: NodeOs, path: &str) -> Result<PathBuf, String> {
    match os {
        NodeOs::Linux => Ok(PathBuf::from(path)),
        NodeOs::Windows => {
            let sandbox = std::env::var(ENV_CONTAINER_SANDBOX_MOUNT_POINT)
                .ok()
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    format!(
                        "sandbox mount point not found through env {}",
                        ENV_CONTAINER_SANDBOX_MOUNT_POINT
                    )
                })?;
            Ok(Path::new(&sandbox).join(path.trim_start_matches(['/', '\\'])))
        }
    }
}

/// Non-empty value of an environment variable.
pub(crate) fn env_value(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub(crate) fn archive_name(archive: &Path, sink: &'static str) -> Result<String, SinkError> {
    archive
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| SinkError::Config {
            sink,
            message: format!("archive path {} has no file name", archive.display()),
        })
}

/// Streaming request body over the archive, with its length in bytes.
pub(crate) async fn archive_body(
    archive: &Path,
    sink: &'static str,
) -> Result<(reqwest::Body, u64), SinkError> {
    let file = File::open(archive)
        .await
        .map_err(|source| SinkError::Io { sink, source })?;
    let content_length = file
        .metadata()
        .await
        .map_err(|source| SinkError::Io { sink, source })?
        .len();
    Ok((reqwest::Body::wrap_stream(ReaderStream::new(file)), content_length))
}
