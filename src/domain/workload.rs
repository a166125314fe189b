//! Per-node capture workload descriptor.
//!
//! A workload is a run-to-completion batch unit pinned to one node. The
//! shape mirrors what a cluster batch API needs; the cluster client is
//! responsible for mapping it onto concrete API objects.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OwnerReference {
    pub kind: String,
    pub name: String,
    pub uid: String,
    pub controller: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvValue {
    Literal(String),
    /// Resolved by the cluster from the running pod, e.g. `metadata.name`.
    FieldRef(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvVar {
    pub name: String,
    pub value: EnvValue,
}

impl EnvVar {
    pub fn literal(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: EnvValue::Literal(value.into()),
        }
    }

    pub fn field_ref(name: &str, path: &str) -> Self {
        Self {
            name: name.to_string(),
            value: EnvValue::FieldRef(path.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum VolumeSource {
    HostPath { path: String },
    Secret { secret_name: String },
    PersistentVolumeClaim { claim_name: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub source: VolumeSource,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceList {
    pub cpu: String,
    pub memory: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resources {
    pub requests: ResourceList,
    pub limits: ResourceList,
}

impl Default for Resources {
    fn default() -> Self {
        Self {
            requests: ResourceList {
                cpu: "10m".to_string(),
                memory: "64Mi".to_string(),
            },
            limits: ResourceList {
                cpu: "100m".to_string(),
                memory: "300Mi".to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecurityContext {
    pub capabilities: Vec<String>,
    pub run_as_user: Option<u32>,
    pub host_process: bool,
    pub run_as_user_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    pub image: String,
    pub command: Vec<String>,
    pub env: Vec<EnvVar>,
    pub volume_mounts: Vec<VolumeMount>,
    pub resources: Resources,
    pub security_context: SecurityContext,
}

/// Tolerate any taint matching `key` (or every key when `None`) and `effect`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Toleration {
    pub key: Option<String>,
    pub effect: Option<String>,
}

/// Required node affinity: `label In values`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAffinity {
    pub label: String,
    pub values: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub backoff_limit: u32,
    pub termination_grace_period: Duration,
    pub host_network: bool,
    pub host_ipc: bool,
    pub node_affinity: Option<NodeAffinity>,
    pub tolerations: Vec<Toleration>,
    pub container: Container,
    pub volumes: Vec<Volume>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkloadConditionType {
    Complete,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadCondition {
    pub condition_type: WorkloadConditionType,
    pub status: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkloadStatus {
    pub active: u32,
    pub succeeded: u32,
    pub failed: u32,
    pub completion_time: Option<DateTime<Utc>>,
    pub conditions: Vec<WorkloadCondition>,
}

impl WorkloadStatus {
    /// The terminal condition reached, if any.
    pub fn finished(&self) -> Option<WorkloadConditionType> {
        self.conditions
            .iter()
            .find(|c| c.status)
            .map(|c| c.condition_type)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Workload {
    pub name: String,
    pub namespace: String,
    pub labels: BTreeMap<String, String>,
    pub annotations: BTreeMap<String, String>,
    pub owner: Option<OwnerReference>,
    pub spec: WorkloadSpec,
    #[serde(default)]
    pub status: WorkloadStatus,
}

impl Workload {
    /// Literal value of an env var on the capture container.
    pub fn env(&self, name: &str) -> Option<&str> {
        self.spec
            .container
            .env
            .iter()
            .find(|e| e.name == name)
            .and_then(|e| match &e.value {
                EnvValue::Literal(v) => Some(v.as_str()),
                EnvValue::FieldRef(_) => None,
            })
    }

    pub fn set_env(&mut self, name: &str, value: impl Into<String>) {
        let value = EnvValue::Literal(value.into());
        match self.spec.container.env.iter_mut().find(|e| e.name == name) {
            Some(existing) => existing.value = value,
            None => self.spec.container.env.push(EnvVar {
                name: name.to_string(),
                value,
            }),
        }
    }

    pub fn remove_env(&mut self, name: &str) {
        self.spec.container.env.retain(|e| e.name != name);
    }

    pub fn volume_mount_mut(&mut self, name: &str) -> Option<&mut VolumeMount> {
        self.spec
            .container
            .volume_mounts
            .iter_mut()
            .find(|m| m.name == name)
    }

    pub fn pinned_node(&self) -> Option<&str> {
        self.spec
            .node_affinity
            .as_ref()
            .and_then(|a| a.values.first())
            .map(String::as_str)
    }
}
