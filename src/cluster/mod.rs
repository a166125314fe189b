//! Cluster API abstraction.
//!
//! This module defines the `ClusterClient` trait (DIP): the resolver, the
//! synthesizer and the reconciliation loop depend on it rather than on a
//! concrete API client, which keeps them testable against an in-memory
//! cluster and lets deployments plug in whatever client they use.

mod retry;

#[cfg(test)]
pub(crate) mod fake;

pub use retry::{with_retry, RetryPolicy};

use std::collections::BTreeMap;

use async_trait::async_trait;

use crate::domain::{CaptureRequest, LabelSelector, Workload};
use crate::error::ClusterError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    pub labels: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PodPhase {
    Pending,
    Running,
    Succeeded,
    Failed,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pod {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    /// Empty while the pod is unscheduled.
    pub node_name: Option<String>,
    pub phase: PodPhase,
    pub pod_ips: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Secret {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub data: BTreeMap<String, Vec<u8>>,
}

/// Result of a create-or-update call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Created,
    Updated,
    Unchanged,
}

/// Operations the orchestrator needs from the cluster.
///
/// Implementations report missing objects as `ClusterError::NotFound` so
/// callers can tell "nothing to do" from a failure worth retrying.
#[async_trait]
pub trait ClusterClient: Send + Sync {
    async fn list_nodes(&self, selector: &LabelSelector) -> Result<Vec<Node>, ClusterError>;

    async fn list_namespaces(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<Namespace>, ClusterError>;

    /// List pods in `namespace`, or in every namespace when `None`.
    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError>;

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError>;

    async fn create_or_update_secret(&self, secret: &Secret) -> Result<Operation, ClusterError>;

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    /// Succeeds when the persistent volume claim exists.
    async fn get_volume_claim(&self, namespace: &str, name: &str) -> Result<(), ClusterError>;

    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Workload>, ClusterError>;

    /// Idempotent upsert keyed by workload name.
    async fn create_or_update_workload(
        &self,
        workload: &Workload,
    ) -> Result<Operation, ClusterError>;

    /// Delete matching workloads and, in the background, their pods.
    async fn delete_workloads(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<(), ClusterError>;

    async fn get_capture(&self, namespace: &str, name: &str)
        -> Result<CaptureRequest, ClusterError>;

    /// Write metadata and spec (finalizers, output secret).
    async fn update_capture(&self, capture: &CaptureRequest) -> Result<(), ClusterError>;

    /// Write only the status subresource.
    async fn update_capture_status(&self, capture: &CaptureRequest) -> Result<(), ClusterError>;
}
