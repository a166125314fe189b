//! Sinks that copy the archive onto a mounted filesystem.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::info;

use crate::constants::{
    ENV_OUTPUT_HOST_PATH, ENV_OUTPUT_PVC, PVC_MOUNT_PATH_LINUX, PVC_MOUNT_PATH_WINDOWS,
};
use crate::domain::NodeOs;
use crate::error::SinkError;

use super::{archive_name, container_path, env_value, OutputSink};

async fn copy_into(sink: &'static str, archive: &Path, dir: &Path) -> Result<PathBuf, SinkError> {
    let io = |source| SinkError::Io { sink, source };
    let dst = dir.join(archive_name(archive, sink)?);
    tokio::fs::create_dir_all(dir).await.map_err(io)?;
    tokio::fs::copy(archive, &dst).await.map_err(io)?;
    Ok(dst)
}

/// Copies the archive to a directory on the node, mounted at the same path.
#[derive(Debug, Default)]
pub struct HostPathSink;

impl HostPathSink {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl OutputSink for HostPathSink {
    fn name(&self) -> &'static str {
        "HostPath"
    }

    fn enabled(&self) -> bool {
        env_value(ENV_OUTPUT_HOST_PATH).is_some()
    }

    async fn output(&self, archive: &Path) -> Result<(), SinkError> {
        let dir = env_value(ENV_OUTPUT_HOST_PATH).ok_or_else(|| SinkError::Config {
            sink: self.name(),
            message: format!("{} is not set", ENV_OUTPUT_HOST_PATH),
        })?;
        let dst = copy_into(self.name(), archive, Path::new(&dir)).await?;
        info!(sink = self.name(), "Copied capture to {}", dst.display());
        Ok(())
    }
}

/// Copies the archive onto the shared volume claim mounted into the workload.
#[derive(Debug)]
pub struct PvcSink {
    os: NodeOs,
    mount_path: Option<PathBuf>,
}

impl PvcSink {
    pub fn new(os: NodeOs) -> Self {
        Self {
            os,
            mount_path: None,
        }
    }

    /// Use `path` instead of the OS default mount point.
    pub fn with_mount_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.mount_path = Some(path.into());
        self
    }

    fn mount_dir(&self) -> Result<PathBuf, SinkError> {
        if let Some(path) = &self.mount_path {
            return Ok(path.clone());
        }
        let default = match self.os {
            NodeOs::Linux => PVC_MOUNT_PATH_LINUX,
            NodeOs::Windows => PVC_MOUNT_PATH_WINDOWS,
        };
        container_path(self.os, default).map_err(|message| SinkError::Config {
            sink: self.name(),
            message,
        })
    }
}

#[async_trait]
impl OutputSink for PvcSink {
    fn name(&self) -> &'static str {
        "PersistentVolumeClaim"
    }

    fn enabled(&self) -> bool {
        env_value(ENV_OUTPUT_PVC).is_some()
    }

    async fn output(&self, archive: &Path) -> Result<(), SinkError> {
        let dir = self.mount_dir()?;
        let dst = copy_into(self.name(), archive, &dir).await?;
        info!(sink = self.name(), "Copied capture to {}", dst.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use tempfile::TempDir;

    fn archive(temp_dir: &TempDir) -> PathBuf {
        let path = temp_dir.path().join("cap-node-a-20240501100000UTC.tar.gz");
        std::fs::write(&path, b"archive").unwrap();
        path
    }

    mod host_path_tests {
        use super::*;

        #[test]
        #[serial]
        fn test_enabled_follows_env() {
            std::env::remove_var(ENV_OUTPUT_HOST_PATH);
            assert!(!HostPathSink::new().enabled());
            std::env::set_var(ENV_OUTPUT_HOST_PATH, "  ");
            assert!(!HostPathSink::new().enabled());
            std::env::set_var(ENV_OUTPUT_HOST_PATH, "/tmp/capture");
            assert!(HostPathSink::new().enabled());
            std::env::remove_var(ENV_OUTPUT_HOST_PATH);
        }

        #[tokio::test]
        #[serial]
        async fn test_copies_into_host_path() {
            let temp_dir = TempDir::new().unwrap();
            let archive = archive(&temp_dir);
            let out = temp_dir.path().join("host").join("captures");
            std::env::set_var(ENV_OUTPUT_HOST_PATH, &out);

            HostPathSink::new().output(&archive).await.unwrap();
            std::env::remove_var(ENV_OUTPUT_HOST_PATH);

            let copied = out.join("cap-node-a-20240501100000UTC.tar.gz");
            assert_eq!(std::fs::read(copied).unwrap(), b"archive");
        }
    }

    mod pvc_tests {
        use super::*;

        #[tokio::test]
        #[serial]
        async fn test_copies_into_mount_path() {
            let temp_dir = TempDir::new().unwrap();
            let archive = archive(&temp_dir);
            let mount = temp_dir.path().join("mnt");
            std::env::set_var(ENV_OUTPUT_PVC, "captures");

            let sink = PvcSink::new(NodeOs::Linux).with_mount_path(&mount);
            assert!(sink.enabled());
            sink.output(&archive).await.unwrap();
            std::env::remove_var(ENV_OUTPUT_PVC);

            assert!(mount.join("cap-node-a-20240501100000UTC.tar.gz").exists());
        }

        #[test]
        fn test_linux_default_mount() {
            let dir = PvcSink::new(NodeOs::Linux).mount_dir().unwrap();
            assert_eq!(dir, PathBuf::from(PVC_MOUNT_PATH_LINUX));
        }

        #[tokio::test]
        async fn test_missing_archive_is_io_error() {
            let temp_dir = TempDir::new().unwrap();
            let sink = PvcSink::new(NodeOs::Linux).with_mount_path(temp_dir.path().join("mnt"));
            let err = sink
                .output(&temp_dir.path().join("missing.tar.gz"))
                .await
                .unwrap_err();
            assert!(matches!(err, SinkError::Io { sink: "PersistentVolumeClaim", .. }));
        }
    }
}
