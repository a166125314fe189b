//! The declarative capture request.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::selector::LabelSelector;
use super::status::CaptureStatus;

/// Namespaced identity of a capture request.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CaptureKey {
    pub namespace: String,
    pub name: String,
}

impl CaptureKey {
    pub fn new(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            name: name.into(),
        }
    }
}

impl fmt::Display for CaptureKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// A user's request for a network trace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureRequest {
    pub name: String,
    pub namespace: String,
    #[serde(default)]
    pub uid: String,
    #[serde(default)]
    pub finalizers: Vec<String>,
    #[serde(default)]
    pub deletion_timestamp: Option<DateTime<Utc>>,
    pub spec: CaptureSpec,
    #[serde(default)]
    pub status: CaptureStatus,
}

impl CaptureRequest {
    pub fn key(&self) -> CaptureKey {
        CaptureKey::new(&self.namespace, &self.name)
    }

    pub fn has_finalizer(&self, finalizer: &str) -> bool {
        self.finalizers.iter().any(|f| f == finalizer)
    }

    /// Returns true if the finalizer was added.
    pub fn add_finalizer(&mut self, finalizer: &str) -> bool {
        if self.has_finalizer(finalizer) {
            return false;
        }
        self.finalizers.push(finalizer.to_string());
        true
    }

    /// Returns true if the finalizer was present.
    pub fn remove_finalizer(&mut self, finalizer: &str) -> bool {
        let before = self.finalizers.len();
        self.finalizers.retain(|f| f != finalizer);
        before != self.finalizers.len()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureSpec {
    pub capture_configuration: CaptureConfiguration,
    pub output_configuration: OutputConfiguration,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureConfiguration {
    pub capture_target: Target,
    #[serde(default)]
    pub capture_option: CaptureOption,
    #[serde(default)]
    pub filters: Filters,
    /// Raw tcpdump filter overriding the compiled filter and pod IPs.
    #[serde(default)]
    pub tcpdump_filter: Option<String>,
    #[serde(default)]
    pub include_metadata: bool,
}

/// Where to capture: either a node selector, or namespace/pod selectors.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Target {
    #[serde(default)]
    pub node_selector: Option<LabelSelector>,
    #[serde(default)]
    pub namespace_selector: Option<LabelSelector>,
    #[serde(default)]
    pub pod_selector: Option<LabelSelector>,
}

impl Target {
    pub fn nodes(selector: LabelSelector) -> Self {
        Self {
            node_selector: Some(selector),
            ..Self::default()
        }
    }

    pub fn pods(namespace_selector: Option<LabelSelector>, pod_selector: LabelSelector) -> Self {
        Self {
            node_selector: None,
            namespace_selector,
            pod_selector: Some(pod_selector),
        }
    }
}

/// Stop condition and capture tool knobs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaptureOption {
    #[serde(default, with = "humantime_opt")]
    pub duration: Option<Duration>,
    /// Size threshold in megabytes.
    #[serde(default)]
    pub max_capture_size: Option<u64>,
    /// Snap length in bytes.
    #[serde(default)]
    pub packet_size: Option<u32>,
    #[serde(default)]
    pub interfaces: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Filters {
    #[serde(default)]
    pub include: Vec<String>,
    #[serde(default)]
    pub exclude: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputConfiguration {
    #[serde(default)]
    pub host_path: Option<String>,
    #[serde(default)]
    pub persistent_volume_claim: Option<String>,
    /// Name of the secret holding the blob SAS URL.
    #[serde(default)]
    pub blob_upload: Option<String>,
    #[serde(default)]
    pub s3_upload: Option<S3Upload>,
}

impl OutputConfiguration {
    pub fn is_empty(&self) -> bool {
        self.host_path.is_none()
            && self.persistent_volume_claim.is_none()
            && self.blob_upload.is_none()
            && self.s3_upload.is_none()
    }
}

/// S3-compatible object storage destination.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct S3Upload {
    #[serde(default)]
    pub endpoint: Option<String>,
    pub bucket: String,
    pub secret_name: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

mod humantime_opt {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Option<Duration>, s: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => s.serialize_str(&humantime::format_duration(*d).to_string()),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
        let raw: Option<String> = Option::deserialize(d)?;
        raw.map(|s| humantime::parse_duration(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
