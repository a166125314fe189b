//! Error types shared across the crate.

use std::path::PathBuf;

use thiserror::Error;

/// Configuration and process-level errors.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Errors returned by the cluster collaborator.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClusterError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: &'static str, name: String },

    #[error("conflict while writing {kind} '{name}'")]
    Conflict { kind: &'static str, name: String },

    #[error("cluster API error: {0}")]
    Api(String),
}

impl ClusterError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        ClusterError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, ClusterError::NotFound { .. })
    }
}

/// Errors raised while turning a capture request into workloads.
///
/// Validation variants are produced before any cluster call, resolution
/// variants by the target resolver, and synthesis variants while building
/// the per-node workloads.
#[derive(Error, Debug)]
pub enum TranslateError {
    #[error("either a node selector or namespace/pod selectors must be set")]
    NoSelector,

    #[error("node selector cannot be combined with namespace or pod selectors")]
    ConflictingSelectors,

    #[error("invalid label selector: {0}")]
    InvalidSelector(String),

    #[error("either duration or max capture size must be set")]
    MissingStopCondition,

    #[error("at least one output location must be set")]
    MissingOutput,

    #[error("invalid filter {0}")]
    InvalidFilter(String),

    #[error("no nodes are selected")]
    NoNodesSelected,

    #[error("no targets are selected")]
    NoTargetsSelected,

    #[error("node '{0}' does not report an operating system")]
    MissingOs(String),

    #[error("node '{node}' runs unsupported operating system '{os}'")]
    UnsupportedOs { node: String, os: String },

    #[error("a capture is already running on windows node(s): {}", .0.join(", "))]
    WindowsCaptureInProgress(Vec<String>),

    #[error("secret '{name}' not found in namespace '{namespace}'")]
    SecretNotFound { name: String, namespace: String },

    #[error("failed to look up secret '{name}': {source}")]
    SecretLookup {
        name: String,
        #[source]
        source: ClusterError,
    },

    #[error("persistent volume claim '{name}' not found in namespace '{namespace}'")]
    VolumeClaimNotFound { name: String, namespace: String },

    #[error("the number of capture jobs {current} exceeds the limit {limit}")]
    JobNumExceedLimit { current: usize, limit: usize },

    #[error(transparent)]
    Cluster(#[from] ClusterError),
}

impl TranslateError {
    /// Status reason recorded on the capture's `Error` condition.
    pub fn reason(&self) -> &'static str {
        match self {
            TranslateError::JobNumExceedLimit { .. } => "ExceedJobNumLimit",
            TranslateError::SecretNotFound { .. } => "FindSecretFailed",
            _ => "OtherError",
        }
    }
}

/// A malformed capture timestamp.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("invalid capture timestamp '{0}'")]
pub struct TimestampError(pub String);

/// Errors from a single output sink.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("{sink}: {source}")]
    Io {
        sink: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("{sink}: {message}")]
    Config { sink: &'static str, message: String },

    #[error("{sink}: upload failed: {source}")]
    Http {
        sink: &'static str,
        #[source]
        source: reqwest::Error,
    },

    #[error("{sink}: upload rejected with status {status}: {body}")]
    Rejected {
        sink: &'static str,
        status: u16,
        body: String,
    },
}

/// Errors from the in-workload capture runtime.
#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("missing environment variable {0}")]
    MissingEnv(&'static str),

    #[error("invalid value '{value}' for {key}: {reason}")]
    InvalidEnv {
        key: &'static str,
        value: String,
        reason: String,
    },

    #[error(transparent)]
    Timestamp(#[from] TimestampError),

    #[error("failed to start {tool}: {source}")]
    ToolStart {
        tool: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{tool} failed: {output}")]
    ToolFailed { tool: String, output: String },

    #[error("failed to stop capture: {0}")]
    StopFailed(String),

    #[error("capture file {} was not created", .0.display())]
    CaptureFileMissing(PathBuf),

    #[error("another network trace session is in progress: {0}")]
    ConflictingTraceSession(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("output failed: {}", join_sink_errors(.0))]
    Output(Vec<SinkError>),
}

fn join_sink_errors(errors: &[SinkError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Errors that make the reconciliation loop requeue a capture.
#[derive(Error, Debug)]
pub enum ControllerError {
    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error("failed to create SAS URL: {0}")]
    SasUrl(String),

    #[error("reconcile task failed: {0}")]
    Task(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    mod translate_error_tests {
        use super::*;

        #[test]
        fn test_reason_for_job_limit() {
            let err = TranslateError::JobNumExceedLimit {
                current: 3,
                limit: 2,
            };
            assert_eq!(err.reason(), "ExceedJobNumLimit");
            assert_eq!(
                err.to_string(),
                "the number of capture jobs 3 exceeds the limit 2"
            );
        }

        #[test]
        fn test_reason_for_missing_secret() {
            let err = TranslateError::SecretNotFound {
                name: "blob".to_string(),
                namespace: "default".to_string(),
            };
            assert_eq!(err.reason(), "FindSecretFailed");
        }

        #[test]
        fn test_secret_lookup_is_not_find_secret_failed() {
            let err = TranslateError::SecretLookup {
                name: "blob".to_string(),
                source: ClusterError::Api("timeout".to_string()),
            };
            assert_eq!(err.reason(), "OtherError");
        }

        #[test]
        fn test_windows_conflict_lists_nodes() {
            let err = TranslateError::WindowsCaptureInProgress(vec![
                "win-a".to_string(),
                "win-b".to_string(),
            ]);
            assert!(err.to_string().ends_with("win-a, win-b"));
        }
    }

    mod runtime_error_tests {
        use super::*;

        #[test]
        fn test_output_error_joins_sink_errors() {
            let err = RuntimeError::Output(vec![
                SinkError::Config {
                    sink: "BlobUpload",
                    message: "bad url".to_string(),
                },
                SinkError::Rejected {
                    sink: "S3Upload",
                    status: 403,
                    body: "denied".to_string(),
                },
            ]);
            assert_eq!(
                err.to_string(),
                "output failed: BlobUpload: bad url; S3Upload: upload rejected with status 403: denied"
            );
        }
    }

    #[test]
    fn test_cluster_error_not_found() {
        let err = ClusterError::not_found("Secret", "default/blob");
        assert!(err.is_not_found());
        assert!(!ClusterError::Api("x".to_string()).is_not_found());
    }
}
