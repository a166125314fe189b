//! Blob storage upload through a container SAS URL.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use reqwest::Url;
use tracing::{debug, info};

use crate::constants::{BLOB_SECRET_KEY, BLOB_SECRET_MOUNT_PATH};
use crate::domain::NodeOs;
use crate::error::SinkError;

use super::{archive_body, archive_name, container_path, OutputSink};

const SINK: &str = "BlobUpload";

/// Strip the quotes, newlines and spaces a mounted secret tends to carry.
pub fn trim_sas_url(raw: &str) -> &str {
    raw.trim_matches(|c| c == '"' || c == '\n').trim()
}

/// URL of blob `blob_name` inside the container addressed by `sas_url`.
pub fn blob_url(sas_url: &str, blob_name: &str) -> Result<Url, SinkError> {
    let invalid = |message: String| SinkError::Config {
        sink: SINK,
        message,
    };

    let mut url = Url::parse(sas_url).map_err(|e| invalid(format!("invalid blob SAS URL: {}", e)))?;
    if url.path().trim_start_matches('/').is_empty() {
        return Err(invalid("invalid blob SAS URL: no container in path".to_string()));
    }

    url.path_segments_mut()
        .map_err(|_| invalid("invalid blob SAS URL: cannot be a base".to_string()))?
        .pop_if_empty()
        .push(blob_name);
    Ok(url)
}

/// Uploads the archive as a block blob.
pub struct BlobUploadSink {
    os: NodeOs,
    secret_dir: Option<PathBuf>,
    client: reqwest::Client,
}

impl BlobUploadSink {
    pub fn new(os: NodeOs) -> Self {
        Self {
            os,
            secret_dir: None,
            client: reqwest::Client::new(),
        }
    }

    /// Read the secret from `dir` instead of the mounted secret volume.
    pub fn with_secret_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.secret_dir = Some(dir.into());
        self
    }

    fn read_sas_url(&self) -> Result<String, SinkError> {
        let dir = match &self.secret_dir {
            Some(dir) => dir.clone(),
            None => container_path(self.os, BLOB_SECRET_MOUNT_PATH)
                .map_err(|message| SinkError::Config { sink: SINK, message })?,
        };
        let raw = std::fs::read_to_string(dir.join(BLOB_SECRET_KEY))
            .map_err(|source| SinkError::Io { sink: SINK, source })?;
        let sas_url = trim_sas_url(&raw);
        if sas_url.is_empty() {
            return Err(SinkError::Config {
                sink: SINK,
                message: format!("{} is empty", BLOB_SECRET_KEY),
            });
        }
        Ok(sas_url.to_string())
    }
}

#[async_trait]
impl OutputSink for BlobUploadSink {
    fn name(&self) -> &'static str {
        SINK
    }

    fn enabled(&self) -> bool {
        match self.read_sas_url() {
            Ok(_) => true,
            Err(e) => {
                debug!(sink = SINK, "Output sink not enabled: {}", e);
                false
            }
        }
    }

    async fn output(&self, archive: &Path) -> Result<(), SinkError> {
        let sas_url = self.read_sas_url()?;
        let name = archive_name(archive, SINK)?;
        let url = blob_url(&sas_url, &name)?;

        let (body, content_length) = archive_body(archive, SINK).await?;
        info!(sink = SINK, blob = %name, bytes = content_length, "Uploading capture to blob storage");

        let response = self
            .client
            .put(url)
            .header("x-ms-blob-type", "BlockBlob")
            .header(reqwest::header::CONTENT_LENGTH, content_length)
            .body(body)
            .send()
            .await
            .map_err(|source| SinkError::Http { sink: SINK, source })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(SinkError::Rejected {
                sink: SINK,
                status: status.as_u16(),
                body,
            });
        }

        info!(sink = SINK, "Done uploading capture to blob storage");
        Ok(())
    }
}
