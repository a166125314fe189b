//! Cluster-wide network capture orchestration.
//!
//! The operator side turns a declarative capture request into one capture
//! workload per node (`resolver`, `filter`, `synth`) and tracks them to
//! completion (`controller`). The workload side (`runtime`, `sink`) drives
//! the native capture tool on the node and ships the archive.

pub mod cluster;
pub mod config;
pub mod constants;
pub mod controller;
pub mod domain;
pub mod error;
pub mod filter;
pub mod managed;
pub mod resolver;
pub mod runtime;
pub mod sink;
pub mod synth;

pub use cluster::{ClusterClient, RetryPolicy};
pub use config::OperatorConfig;
pub use controller::{CaptureReconciler, Controller, Reconcile};
pub use domain::{CaptureKey, CaptureRequest, CaptureStatus, NodeOs, Workload};
pub use error::{
    AppError, ClusterError, ControllerError, RuntimeError, SinkError, TranslateError,
};
pub use managed::SasUrlIssuer;
pub use resolver::TargetResolver;
pub use runtime::{CaptureEnv, CaptureManager, NetworkCaptureProvider};
pub use sink::OutputSink;
pub use synth::WorkloadSynthesizer;
