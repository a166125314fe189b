//! Target resolution.
//!
//! Maps a capture target selector onto the nodes that must run a capture,
//! with the pod IPs to filter on and each node's operating system.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use tracing::debug;

use crate::cluster::{with_retry, ClusterClient, PodPhase, RetryPolicy};
use crate::constants::{APP_LABEL_KEY, APP_LABEL_VALUE, DEFAULT_NAMESPACE, NODE_OS_LABEL};
use crate::domain::{CaptureTargetsOnNode, LabelSelector, NodeOs, Target};
use crate::error::TranslateError;

/// Check that exactly one selector family is set and that it is well formed.
pub fn validate_target(target: &Target) -> Result<(), TranslateError> {
    // A namespace selector alone does not pick pods.
    let pod_family = target.namespace_selector.is_some() || target.pod_selector.is_some();
    match (&target.node_selector, pod_family) {
        (Some(_), true) => return Err(TranslateError::ConflictingSelectors),
        (None, _) if target.pod_selector.is_none() => return Err(TranslateError::NoSelector),
        _ => {}
    }

    [
        &target.node_selector,
        &target.namespace_selector,
        &target.pod_selector,
    ]
    .into_iter()
    .flatten()
    .try_for_each(LabelSelector::validate)
}

pub struct TargetResolver {
    client: Arc<dyn ClusterClient>,
    retry: RetryPolicy,
}

impl TargetResolver {
    pub fn new(client: Arc<dyn ClusterClient>) -> Self {
        Self {
            client,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn resolve(&self, target: &Target) -> Result<CaptureTargetsOnNode, TranslateError> {
        validate_target(target)?;

        let mut targets = match (&target.node_selector, &target.pod_selector) {
            (Some(selector), _) => self.resolve_nodes(selector).await?,
            (None, Some(pod_selector)) => {
                self.resolve_pods(target.namespace_selector.as_ref(), pod_selector)
                    .await?
            }
            (None, None) => return Err(TranslateError::NoSelector),
        };

        self.annotate_os(&mut targets).await?;
        self.ensure_no_windows_capture_running(&targets).await?;
        Ok(targets)
    }

    async fn resolve_nodes(
        &self,
        selector: &LabelSelector,
    ) -> Result<CaptureTargetsOnNode, TranslateError> {
        let nodes = with_retry(self.retry, || self.client.list_nodes(selector)).await?;

        let mut targets = CaptureTargetsOnNode::new();
        for node in &nodes {
            targets.add_node_interface(&node.name);
        }
        if targets.is_empty() {
            return Err(TranslateError::NoNodesSelected);
        }
        Ok(targets)
    }

    async fn resolve_pods(
        &self,
        namespace_selector: Option<&LabelSelector>,
        pod_selector: &LabelSelector,
    ) -> Result<CaptureTargetsOnNode, TranslateError> {
        let namespaces = match namespace_selector {
            Some(selector) => with_retry(self.retry, || self.client.list_namespaces(selector))
                .await?
                .into_iter()
                .map(|ns| ns.name)
                .collect(),
            None => vec![DEFAULT_NAMESPACE.to_string()],
        };

        let mut targets = CaptureTargetsOnNode::new();
        for namespace in &namespaces {
            let pods = with_retry(self.retry, || {
                self.client.list_pods(Some(namespace.as_str()), pod_selector)
            })
            .await?;

            for pod in pods {
                let Some(node) = pod.node_name.as_deref() else {
                    debug!(pod = %pod.name, namespace = %namespace, "Skipping unscheduled pod");
                    continue;
                };
                if pod.pod_ips.is_empty() {
                    debug!(pod = %pod.name, namespace = %namespace, "Skipping pod without IPs");
                    continue;
                }
                targets.add_pod(node, &pod.pod_ips);
            }
        }

        if targets.is_empty() {
            return Err(TranslateError::NoTargetsSelected);
        }
        Ok(targets)
    }

    async fn annotate_os(&self, targets: &mut CaptureTargetsOnNode) -> Result<(), TranslateError> {
        let all_nodes = LabelSelector::new();
        let nodes = with_retry(self.retry, || self.client.list_nodes(&all_nodes)).await?;
        let os_by_node: BTreeMap<String, Option<String>> = nodes
            .into_iter()
            .map(|n| {
                let os = n.labels.get(NODE_OS_LABEL).cloned();
                (n.name, os)
            })
            .collect();

        let names: Vec<String> = targets.nodes().map(str::to_string).collect();
        for name in names {
            let label = os_by_node
                .get(&name)
                .cloned()
                .flatten()
                .ok_or_else(|| TranslateError::MissingOs(name.clone()))?;
            let os = NodeOs::parse(&label).ok_or_else(|| TranslateError::UnsupportedOs {
                node: name.clone(),
                os: label.clone(),
            })?;
            targets.set_os(&name, os);
        }
        Ok(())
    }

    /// netsh supports a single trace session per host.
    async fn ensure_no_windows_capture_running(
        &self,
        targets: &CaptureTargetsOnNode,
    ) -> Result<(), TranslateError> {
        let windows_nodes: BTreeSet<&str> = targets
            .iter()
            .filter(|(_, t)| t.os == NodeOs::Windows)
            .map(|(name, _)| name)
            .collect();
        if windows_nodes.is_empty() {
            return Ok(());
        }

        let selector = LabelSelector::new().with_label(APP_LABEL_KEY, APP_LABEL_VALUE);
        let pods = with_retry(self.retry, || self.client.list_pods(None, &selector)).await?;

        let busy: BTreeSet<String> = pods
            .iter()
            .filter(|p| matches!(p.phase, PodPhase::Pending | PodPhase::Running))
            .filter_map(|p| p.node_name.as_deref())
            .filter(|node| windows_nodes.contains(node))
            .map(str::to_string)
            .collect();

        if busy.is_empty() {
            Ok(())
        } else {
            Err(TranslateError::WindowsCaptureInProgress(
                busy.into_iter().collect(),
            ))
        }
    }
}
