//! Runtime configuration read from the workload environment.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::config::parse_bool;
use crate::constants::*;
use crate::domain::{parse_timestamp, CaptureFilename};
use crate::error::RuntimeError;

use super::session::CaptureBudget;

const BYTES_PER_MB: u64 = 1024 * 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct CaptureEnv {
    pub capture_name: String,
    pub node_hostname: String,
    pub start_timestamp: DateTime<Utc>,
    pub duration: Option<Duration>,
    pub max_size_mb: Option<u64>,
    pub packet_size: Option<u32>,
    pub interfaces: Vec<String>,
    pub tcpdump_filter: Option<String>,
    pub raw_filter: Option<String>,
    pub netsh_filter: Option<String>,
    pub include_metadata: bool,
}

impl CaptureEnv {
    pub fn from_env() -> Result<Self, RuntimeError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, RuntimeError> {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let require = |key: &'static str| get(key).ok_or(RuntimeError::MissingEnv(key));

        let duration = get(ENV_CAPTURE_DURATION)
            .map(|v| {
                humantime::parse_duration(&v).map_err(|e| RuntimeError::InvalidEnv {
                    key: ENV_CAPTURE_DURATION,
                    value: v.clone(),
                    reason: e.to_string(),
                })
            })
            .transpose()?;

        let max_size_mb: Option<u64> =
            parse_number(ENV_CAPTURE_MAX_SIZE, get(ENV_CAPTURE_MAX_SIZE))?;
        if let Some(mb) = max_size_mb {
            if mb.checked_mul(BYTES_PER_MB).is_none() {
                return Err(RuntimeError::InvalidEnv {
                    key: ENV_CAPTURE_MAX_SIZE,
                    value: mb.to_string(),
                    reason: "size in bytes does not fit in 64 bits".to_string(),
                });
            }
        }
        let packet_size = parse_number(ENV_PACKET_SIZE, get(ENV_PACKET_SIZE))?;

        let include_metadata = match get(ENV_INCLUDE_METADATA) {
            Some(v) => parse_bool(&v).ok_or_else(|| RuntimeError::InvalidEnv {
                key: ENV_INCLUDE_METADATA,
                value: v.clone(),
                reason: "expected true or false".to_string(),
            })?,
            None => false,
        };

        let interfaces = get(ENV_CAPTURE_INTERFACES)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|i| !i.is_empty())
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default();

        Ok(Self {
            capture_name: require(ENV_CAPTURE_NAME)?,
            node_hostname: require(ENV_NODE_HOST_NAME)?,
            start_timestamp: parse_timestamp(&require(ENV_CAPTURE_START_TIMESTAMP)?)?,
            duration,
            max_size_mb,
            packet_size,
            interfaces,
            tcpdump_filter: get(ENV_TCPDUMP_FILTER),
            raw_filter: get(ENV_TCPDUMP_RAW_FILTER),
            netsh_filter: get(ENV_NETSH_FILTER),
            include_metadata,
        })
    }

    pub fn filename(&self) -> CaptureFilename {
        CaptureFilename::new(
            &self.capture_name,
            &self.node_hostname,
            Some(self.start_timestamp),
        )
    }

    pub fn budget(&self) -> CaptureBudget {
        CaptureBudget::default()
            .with_duration(self.duration)
            .with_max_size_bytes(self.max_size_mb.map(|mb| mb.saturating_mul(BYTES_PER_MB)))
    }
}

fn parse_number<T: std::str::FromStr>(
    key: &'static str,
    value: Option<String>,
) -> Result<Option<T>, RuntimeError>
where
    T::Err: std::fmt::Display,
{
    value
        .map(|v| {
            v.parse::<T>().map_err(|e| RuntimeError::InvalidEnv {
                key,
                value: v.clone(),
                reason: e.to_string(),
            })
        })
        .transpose()
}
