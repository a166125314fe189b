//! S3-compatible object storage upload, signed with AWS Signature Version 4.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use reqwest::Url;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

use crate::constants::{
    ENV_S3_BUCKET, ENV_S3_ENDPOINT, ENV_S3_PATH, ENV_S3_REGION, S3_ACCESS_KEY_ID_KEY,
    S3_SECRET_ACCESS_KEY_KEY, S3_SECRET_MOUNT_PATH,
};
use crate::domain::NodeOs;
use crate::error::SinkError;

use super::{archive_body, archive_name, container_path, env_value, OutputSink};

type HmacSha256 = Hmac<Sha256>;

const SINK: &str = "S3Upload";
const DEFAULT_REGION: &str = "auto";
const SIGNED_HEADERS: &str = "host;x-amz-content-sha256;x-amz-date";

/// Resolved object storage settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Settings {
    pub endpoint: Option<String>,
    pub region: String,
    pub bucket: String,
    pub path: Option<String>,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl S3Settings {
    /// Key of the uploaded object: the configured prefix joined with the archive name.
    pub fn object_key(&self, archive_name: &str) -> String {
        match self.path.as_deref().map(|p| p.trim_matches('/')) {
            Some(prefix) if !prefix.is_empty() => format!("{}/{}", prefix, archive_name),
            _ => archive_name.to_string(),
        }
    }

    fn endpoint_url(&self) -> String {
        match &self.endpoint {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => format!("https://s3.{}.amazonaws.com", self.region),
        }
    }

    /// Build a signed path-style PUT request for `key` whose body hashes to
    /// `payload_hash` (lowercase hex SHA256).
    pub(crate) fn sign_put(
        &self,
        key: &str,
        payload_hash: &str,
        now: DateTime<Utc>,
    ) -> Result<SignedRequest, SinkError> {
        let invalid = |message: String| SinkError::Config {
            sink: SINK,
            message,
        };

        let endpoint = Url::parse(&self.endpoint_url())
            .map_err(|e| invalid(format!("invalid endpoint: {}", e)))?;
        let host = match (endpoint.host_str(), endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(invalid("endpoint has no host".to_string())),
        };

        let base = endpoint.path().trim_end_matches('/');
        let canonical_uri = format!(
            "{}/{}/{}",
            base,
            uri_encode(&self.bucket, true),
            uri_encode(key, false)
        );

        let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
        let date = now.format("%Y%m%d").to_string();

        let canonical_request = format!(
            "PUT\n{}\n\nhost:{}\nx-amz-content-sha256:{}\nx-amz-date:{}\n\n{}\n{}",
            canonical_uri, host, payload_hash, amz_date, SIGNED_HEADERS, payload_hash
        );
        let scope = format!("{}/{}/s3/aws4_request", date, self.region);
        let string_to_sign = format!(
            "AWS4-HMAC-SHA256\n{}\n{}\n{}",
            amz_date,
            scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let key = signing_key(&self.secret_access_key, &date, &self.region, "s3")?;
        let signature = hex::encode(hmac(&key, string_to_sign.as_bytes())?);

        Ok(SignedRequest {
            url: format!(
                "{}://{}{}",
                endpoint.scheme(),
                host,
                canonical_uri
            ),
            authorization: format!(
                "AWS4-HMAC-SHA256 Credential={}/{}, SignedHeaders={}, Signature={}",
                self.access_key_id, scope, SIGNED_HEADERS, signature
            ),
            amz_date,
            payload_hash: payload_hash.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct SignedRequest {
    pub url: String,
    pub authorization: String,
    pub amz_date: String,
    pub payload_hash: String,
}

/// SHA256 of the archive, read in chunks.
async fn payload_sha256(archive: &Path) -> Result<String, SinkError> {
    let io = |source| SinkError::Io { sink: SINK, source };
    let mut file = tokio::fs::File::open(archive).await.map_err(io)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf).await.map_err(io)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn hmac(key: &[u8], data: &[u8]) -> Result<Vec<u8>, SinkError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| SinkError::Config {
        sink: SINK,
        message: format!("invalid signing key: {}", e),
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

pub(crate) fn signing_key(
    secret: &str,
    date: &str,
    region: &str,
    service: &str,
) -> Result<Vec<u8>, SinkError> {
    let k_date = hmac(format!("AWS4{}", secret).as_bytes(), date.as_bytes())?;
    let k_region = hmac(&k_date, region.as_bytes())?;
    let k_service = hmac(&k_region, service.as_bytes())?;
    hmac(&k_service, b"aws4_request")
}

/// SigV4 URI encoding; `/` is kept unless `encode_slash`.
pub(crate) fn uri_encode(value: &str, encode_slash: bool) -> String {
    let mut out = String::with_capacity(value.len());
    for byte in value.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'-' | b'_' | b'.' | b'~' => {
                out.push(byte as char)
            }
            b'/' if !encode_slash => out.push('/'),
            _ => out.push_str(&format!("%{:02X}", byte)),
        }
    }
    out
}

/// Uploads the archive to an S3-compatible bucket.
pub struct S3UploadSink {
    os: NodeOs,
    secret_dir: Option<PathBuf>,
    client: reqwest::Client,
}

impl S3UploadSink {
    pub fn new(os: NodeOs) -> Self {
        Self {
            os,
            secret_dir: None,
            client: reqwest::Client::new(),
        }
    }

    /// Read credentials from `dir` instead of the mounted secret volume.
    pub fn with_secret_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.secret_dir = Some(dir.into());
        self
    }

    /// Settings from the workload env and the mounted credentials.
    pub fn settings(&self) -> Result<S3Settings, SinkError> {
        let config = |message: String| SinkError::Config {
            sink: SINK,
            message,
        };

        let bucket =
            env_value(ENV_S3_BUCKET).ok_or_else(|| config(format!("{} is not set", ENV_S3_BUCKET)))?;
        let endpoint = env_value(ENV_S3_ENDPOINT);
        let region = env_value(ENV_S3_REGION);
        if endpoint.is_none() && region.is_none() {
            return Err(config(format!(
                "neither {} nor {} is set",
                ENV_S3_ENDPOINT, ENV_S3_REGION
            )));
        }

        let dir = match &self.secret_dir {
            Some(dir) => dir.clone(),
            None => container_path(self.os, S3_SECRET_MOUNT_PATH).map_err(config)?,
        };
        let read = |key: &str| {
            std::fs::read_to_string(dir.join(key))
                .map(|v| v.trim().to_string())
                .map_err(|source| SinkError::Io { sink: SINK, source })
        };

        Ok(S3Settings {
            endpoint,
            region: region.unwrap_or_else(|| DEFAULT_REGION.to_string()),
            bucket,
            path: env_value(ENV_S3_PATH),
            access_key_id: read(S3_ACCESS_KEY_ID_KEY)?,
            secret_access_key: read(S3_SECRET_ACCESS_KEY_KEY)?,
        })
    }
}

#[async_trait]
impl OutputSink for S3UploadSink {
    fn name(&self) -> &'static str {
        SINK
    }

    fn enabled(&self) -> bool {
        match self.settings() {
            Ok(_) => true,
            Err(e) => {
                debug!(sink = SINK, "Output sink not enabled: {}", e);
                false
            }
        }
    }

    async fn output(&self, archive: &Path) -> Result<(), SinkError> {
        let settings = self.settings()?;
        let key = settings.object_key(&archive_name(archive, SINK)?);
        info!(sink = SINK, bucket = %settings.bucket, key = %key, "Uploading capture to object storage");

        let payload_hash = payload_sha256(archive).await?;
        let signed = settings.sign_put(&key, &payload_hash, Utc::now())?;
        let (body, content_length) = archive_body(archive, SINK).await?;

        let response = self
            .client
            .put(&signed.url)
            .header("authorization", &signed.authorization)
            .header("x-amz-date", &signed.amz_date)
            .header("x-amz-content-sha256", &signed.payload_hash)
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

        info!(sink = SINK, "Done uploading capture to object storage");
        Ok(())
    }
}
