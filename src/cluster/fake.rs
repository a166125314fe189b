//! In-memory cluster used by tests.

use std::collections::BTreeMap;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{ClusterClient, Namespace, Node, Operation, Pod, PodPhase, Secret};
use crate::domain::{CaptureRequest, LabelSelector, Workload};
use crate::error::ClusterError;

#[derive(Default)]
struct State {
    nodes: Vec<Node>,
    namespaces: Vec<Namespace>,
    pods: Vec<Pod>,
    secrets: BTreeMap<(String, String), Secret>,
    volume_claims: Vec<(String, String)>,
    workloads: BTreeMap<(String, String), Workload>,
    captures: BTreeMap<(String, String), CaptureRequest>,
    deleted_secrets: Vec<(String, String)>,
    status_writes: usize,
    fail_workload_upserts: bool,
}

#[derive(Default)]
pub(crate) struct FakeCluster {
    state: Mutex<State>,
}

pub(crate) fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn key(namespace: &str, name: &str) -> (String, String) {
    (namespace.to_string(), name.to_string())
}

impl FakeCluster {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap()
    }

    pub fn add_node(&self, name: &str, os: &str, extra: &[(&str, &str)]) {
        let mut node_labels = labels(extra);
        node_labels.insert(crate::constants::NODE_OS_LABEL.to_string(), os.to_string());
        self.state().nodes.push(Node {
            name: name.to_string(),
            labels: node_labels,
        });
    }

    pub fn add_namespace(&self, name: &str, ns_labels: &[(&str, &str)]) {
        self.state().namespaces.push(Namespace {
            name: name.to_string(),
            labels: labels(ns_labels),
        });
    }

    pub fn add_pod(
        &self,
        namespace: &str,
        name: &str,
        node: Option<&str>,
        pod_labels: &[(&str, &str)],
        phase: PodPhase,
        ips: &[&str],
    ) {
        self.state().pods.push(Pod {
            name: name.to_string(),
            namespace: namespace.to_string(),
            labels: labels(pod_labels),
            node_name: node.map(str::to_string),
            phase,
            pod_ips: ips.iter().map(|ip| ip.to_string()).collect(),
        });
    }

    pub fn add_secret(&self, namespace: &str, name: &str) {
        self.state().secrets.insert(
            key(namespace, name),
            Secret {
                name: name.to_string(),
                namespace: namespace.to_string(),
                labels: BTreeMap::new(),
                data: BTreeMap::new(),
            },
        );
    }

    pub fn add_volume_claim(&self, namespace: &str, name: &str) {
        self.state().volume_claims.push(key(namespace, name));
    }

    pub fn put_capture(&self, capture: CaptureRequest) {
        self.state()
            .captures
            .insert(key(&capture.namespace, &capture.name), capture);
    }

    pub fn capture(&self, namespace: &str, name: &str) -> Option<CaptureRequest> {
        self.state().captures.get(&key(namespace, name)).cloned()
    }

    pub fn secret(&self, namespace: &str, name: &str) -> Option<Secret> {
        self.state().secrets.get(&key(namespace, name)).cloned()
    }

    pub fn workloads(&self) -> Vec<Workload> {
        self.state().workloads.values().cloned().collect()
    }

    pub fn update_workload_status(&self, name: &str, f: impl Fn(&mut Workload)) {
        let mut state = self.state();
        if let Some(w) = state.workloads.values_mut().find(|w| w.name == name) {
            f(w);
        }
    }

    pub fn deleted_secrets(&self) -> Vec<(String, String)> {
        self.state().deleted_secrets.clone()
    }

    pub fn status_writes(&self) -> usize {
        self.state().status_writes
    }

    pub fn fail_workload_upserts(&self) {
        self.state().fail_workload_upserts = true;
    }
}

#[async_trait]
impl ClusterClient for FakeCluster {
    async fn list_nodes(&self, selector: &LabelSelector) -> Result<Vec<Node>, ClusterError> {
        Ok(self
            .state()
            .nodes
            .iter()
            .filter(|n| selector.matches(&n.labels))
            .cloned()
            .collect())
    }

    async fn list_namespaces(
        &self,
        selector: &LabelSelector,
    ) -> Result<Vec<Namespace>, ClusterError> {
        Ok(self
            .state()
            .namespaces
            .iter()
            .filter(|n| selector.matches(&n.labels))
            .cloned()
            .collect())
    }

    async fn list_pods(
        &self,
        namespace: Option<&str>,
        selector: &LabelSelector,
    ) -> Result<Vec<Pod>, ClusterError> {
        Ok(self
            .state()
            .pods
            .iter()
            .filter(|p| namespace.map_or(true, |ns| p.namespace == ns))
            .filter(|p| selector.matches(&p.labels))
            .cloned()
            .collect())
    }

    async fn get_secret(&self, namespace: &str, name: &str) -> Result<Secret, ClusterError> {
        self.secret(namespace, name)
            .ok_or_else(|| ClusterError::not_found("Secret", format!("{}/{}", namespace, name)))
    }

    async fn create_or_update_secret(&self, secret: &Secret) -> Result<Operation, ClusterError> {
        let previous = self
            .state()
            .secrets
            .insert(key(&secret.namespace, &secret.name), secret.clone());
        Ok(match previous {
            None => Operation::Created,
            Some(p) if p == *secret => Operation::Unchanged,
            Some(_) => Operation::Updated,
        })
    }

    async fn delete_secret(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        let mut state = self.state();
        match state.secrets.remove(&key(namespace, name)) {
            Some(_) => {
                state.deleted_secrets.push(key(namespace, name));
                Ok(())
            }
            None => Err(ClusterError::not_found(
                "Secret",
                format!("{}/{}", namespace, name),
            )),
        }
    }

    async fn get_volume_claim(&self, namespace: &str, name: &str) -> Result<(), ClusterError> {
        if self.state().volume_claims.contains(&key(namespace, name)) {
            Ok(())
        } else {
            Err(ClusterError::not_found(
                "PersistentVolumeClaim",
                format!("{}/{}", namespace, name),
            ))
        }
    }

    async fn list_workloads(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<Vec<Workload>, ClusterError> {
        Ok(self
            .state()
            .workloads
            .values()
            .filter(|w| w.namespace == namespace && selector.matches(&w.labels))
            .cloned()
            .collect())
    }

    async fn create_or_update_workload(
        &self,
        workload: &Workload,
    ) -> Result<Operation, ClusterError> {
        let mut state = self.state();
        if state.fail_workload_upserts {
            return Err(ClusterError::Api("quota exceeded".to_string()));
        }
        let previous = state
            .workloads
            .insert(key(&workload.namespace, &workload.name), workload.clone());
        Ok(match previous {
            None => Operation::Created,
            Some(p) if p == *workload => Operation::Unchanged,
            Some(_) => Operation::Updated,
        })
    }

    async fn delete_workloads(
        &self,
        namespace: &str,
        selector: &LabelSelector,
    ) -> Result<(), ClusterError> {
        self.state()
            .workloads
            .retain(|_, w| !(w.namespace == namespace && selector.matches(&w.labels)));
        Ok(())
    }

    async fn get_capture(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<CaptureRequest, ClusterError> {
        self.capture(namespace, name)
            .ok_or_else(|| ClusterError::not_found("Capture", format!("{}/{}", namespace, name)))
    }

    async fn update_capture(&self, capture: &CaptureRequest) -> Result<(), ClusterError> {
        let mut state = self.state();
        let stored = state
            .captures
            .get_mut(&key(&capture.namespace, &capture.name))
            .ok_or_else(|| ClusterError::not_found("Capture", capture.name.clone()))?;
        stored.finalizers = capture.finalizers.clone();
        stored.spec = capture.spec.clone();
        Ok(())
    }

    async fn update_capture_status(&self, capture: &CaptureRequest) -> Result<(), ClusterError> {
        let mut state = self.state();
        let stored = state
            .captures
            .get_mut(&key(&capture.namespace, &capture.name))
            .ok_or_else(|| ClusterError::not_found("Capture", capture.name.clone()))?;
        stored.status = capture.status.clone();
        state.status_writes += 1;
        Ok(())
    }
}
