//! Operator configuration.
//!
//! The operator side ships as a library: the embedding process supplies a
//! `ClusterClient`, calls [`OperatorConfig::load`] once at startup and hands
//! the result to `WorkloadSynthesizer` and `CaptureReconciler`. Only the
//! in-workload capture has its own binary.

use std::path::Path;
use std::time::Duration;

use crate::error::AppError;

const ENV_CONFIG_PATH: &str = "NETTRACE_CONFIG";
const DEFAULT_CONFIG_PATH: &str = "/etc/nettrace.conf";
const DEFAULT_CAPTURE_IMAGE: &str = "ghcr.io/nettrace/nettrace-capture:latest";
const DEFAULT_SAS_VALIDITY: Duration = Duration::from_secs(60 * 60);

/// Operator-side configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorConfig {
    /// Maximum number of capture workloads per request; 0 means unlimited.
    pub capture_job_num_limit: usize,
    pub enable_managed_storage_account: bool,
    pub capture_image: String,
    /// API server identifier passed to workloads for log correlation.
    pub apiserver: String,
    /// SAS validity used when a capture only has a size limit.
    pub managed_sas_validity: Duration,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            capture_job_num_limit: 0,
            enable_managed_storage_account: false,
            capture_image: DEFAULT_CAPTURE_IMAGE.to_string(),
            apiserver: String::new(),
            managed_sas_validity: DEFAULT_SAS_VALIDITY,
        }
    }
}

impl OperatorConfig {
    /// Load from the file named by `NETTRACE_CONFIG` (default
    /// `/etc/nettrace.conf`), then apply env overrides.
    pub fn load() -> Result<Self, AppError> {
        let config_path =
            std::env::var(ENV_CONFIG_PATH).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(Path::new(&config_path))
    }

    /// Read `key = value` lines from `path` (if it exists), then apply env overrides.
    pub fn load_from(path: &Path) -> Result<Self, AppError> {
        let mut config = OperatorConfig::default();

        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            for line in content.lines() {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                if let Some((key, value)) = line.split_once('=') {
                    config.apply(key.trim(), value.trim())?;
                }
            }
        }

        // Allow environment variable overrides
        for (var, key) in [
            ("NETTRACE_JOB_NUM_LIMIT", "capture_job_num_limit"),
            ("NETTRACE_MANAGED_STORAGE", "enable_managed_storage_account"),
            ("NETTRACE_IMAGE", "capture_image"),
            ("NETTRACE_APISERVER", "apiserver"),
            ("NETTRACE_SAS_VALIDITY", "managed_sas_validity"),
        ] {
            if let Ok(value) = std::env::var(var) {
                config
                    .apply(key, value.trim())
                    .map_err(|_| AppError::Config(format!("Invalid {}: {}", var, value)))?;
            }
        }

        Ok(config)
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), AppError> {
        match key {
            "capture_job_num_limit" => {
                self.capture_job_num_limit = value.parse().map_err(|_| {
                    AppError::Config(format!("Invalid capture_job_num_limit: {}", value))
                })?;
            }
            "enable_managed_storage_account" => {
                self.enable_managed_storage_account = parse_bool(value).ok_or_else(|| {
                    AppError::Config(format!("Invalid enable_managed_storage_account: {}", value))
                })?;
            }
            "capture_image" => self.capture_image = value.to_string(),
            "apiserver" => self.apiserver = value.to_string(),
            "managed_sas_validity" => {
                self.managed_sas_validity = humantime::parse_duration(value).map_err(|_| {
                    AppError::Config(format!("Invalid managed_sas_validity: {}", value))
                })?;
            }
            _ => tracing::debug!("Ignoring unknown config key {}", key),
        }
        Ok(())
    }
}

pub(crate) fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" | "" => Some(false),
        _ => None,
    }
}
