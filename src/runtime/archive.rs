//! Capture archive packing.

use std::fs::File;
use std::path::{Path, PathBuf};

use flate2::write::GzEncoder;
use flate2::Compression;
use tracing::info;

use crate::error::RuntimeError;

/// Pack `dir` into `{dir}.tar.gz` next to it, with entries relative to `dir`.
pub async fn compress_dir(dir: &Path) -> Result<PathBuf, RuntimeError> {
    let src = dir.to_path_buf();
    let mut name = src.clone().into_os_string();
    name.push(".tar.gz");
    let dst = PathBuf::from(name);

    let target = dst.clone();
    tokio::task::spawn_blocking(move || write_tar_gz(&src, &target))
        .await
        .map_err(|e| RuntimeError::Io(std::io::Error::other(e)))??;

    info!("Packed capture into {}", dst.display());
    Ok(dst)
}

fn write_tar_gz(src: &Path, dst: &Path) -> std::io::Result<()> {
    let file = File::create(dst)?;
    let encoder = GzEncoder::new(file, Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);
    builder.append_dir_all(".", src)?;
    builder.into_inner()?.finish()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::read::GzDecoder;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_compress_dir_keeps_relative_layout() {
        let temp_dir = TempDir::new().unwrap();
        let workdir = temp_dir.path().join("cap-node-a-20240501100000UTC");
        std::fs::create_dir_all(workdir.join("metadata")).unwrap();
        std::fs::write(workdir.join("cap.pcap"), b"packets").unwrap();
        std::fs::write(workdir.join("metadata").join("ip.txt"), b"routes").unwrap();

        let archive = compress_dir(&workdir).await.unwrap();
        assert_eq!(
            archive,
            temp_dir.path().join("cap-node-a-20240501100000UTC.tar.gz")
        );

        let unpacked = temp_dir.path().join("unpacked");
        tar::Archive::new(GzDecoder::new(File::open(&archive).unwrap()))
            .unpack(&unpacked)
            .unwrap();
        assert_eq!(std::fs::read(unpacked.join("cap.pcap")).unwrap(), b"packets");
        assert_eq!(
            std::fs::read(unpacked.join("metadata").join("ip.txt")).unwrap(),
            b"routes"
        );
    }

    #[tokio::test]
    async fn test_compress_missing_dir_fails() {
        let temp_dir = TempDir::new().unwrap();
        assert!(compress_dir(&temp_dir.path().join("missing")).await.is_err());
    }
}
