//! Per-node capture targets produced by the resolver.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Operating system of a target node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeOs {
    #[default]
    Linux,
    Windows,
}

impl NodeOs {
    pub fn parse(label: &str) -> Option<Self> {
        match label {
            "linux" => Some(NodeOs::Linux),
            "windows" => Some(NodeOs::Windows),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            NodeOs::Linux => "linux",
            NodeOs::Windows => "windows",
        }
    }
}

impl fmt::Display for NodeOs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What to capture on one node: the whole node interface, or traffic of a
/// set of pod IPs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureTarget {
    pub pod_ips: Vec<String>,
    pub capture_node_interface: bool,
    pub os: NodeOs,
}

impl CaptureTarget {
    pub fn node_interface() -> Self {
        Self {
            pod_ips: Vec::new(),
            capture_node_interface: true,
            os: NodeOs::default(),
        }
    }

    pub fn pods() -> Self {
        Self {
            pod_ips: Vec::new(),
            capture_node_interface: false,
            os: NodeOs::default(),
        }
    }
}

/// Capture targets keyed by node name, iterated in node order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CaptureTargetsOnNode {
    targets: BTreeMap<String, CaptureTarget>,
}

impl CaptureTargetsOnNode {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node_interface(&mut self, node: &str) {
        self.targets
            .insert(node.to_string(), CaptureTarget::node_interface());
    }

    /// Record pod IPs scheduled on `node`, keeping each IP once.
    pub fn add_pod(&mut self, node: &str, ips: &[String]) {
        let target = self
            .targets
            .entry(node.to_string())
            .or_insert_with(CaptureTarget::pods);
        for ip in ips {
            if !target.pod_ips.contains(ip) {
                target.pod_ips.push(ip.clone());
            }
        }
    }

    pub fn set_os(&mut self, node: &str, os: NodeOs) {
        if let Some(target) = self.targets.get_mut(node) {
            target.os = os;
        }
    }

    pub fn get(&self, node: &str) -> Option<&CaptureTarget> {
        self.targets.get(node)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &str> {
        self.targets.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &CaptureTarget)> {
        self.targets.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.targets.is_empty()
    }
}
