//! Workload synthesis.
//!
//! Builds one capture workload per resolved node: a shared template with
//! the output volumes and common environment, specialised per node by an
//! [`OsPlan`].

mod plan;

pub use plan::OsPlan;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SubsecRound, Utc};
use sha2::{Digest, Sha256};
use tracing::{debug, info};

use crate::cluster::{with_retry, ClusterClient, RetryPolicy};
use crate::config::OperatorConfig;
use crate::constants::*;
use crate::domain::{
    render_timestamp, CaptureFilename, CaptureRequest, CaptureTargetsOnNode, Container, EnvVar,
    NodeAffinity, OwnerReference, Resources, SecurityContext, Toleration, Volume, VolumeMount,
    VolumeSource, Workload, WorkloadSpec, WorkloadStatus,
};
use crate::error::{ClusterError, TranslateError};
use crate::filter;
use crate::resolver::{validate_target, TargetResolver};

const TERMINATION_GRACE_PERIOD: Duration = Duration::from_secs(1800);
const BLOB_SECRET_VOLUME_NAME: &str = "blob-upload-secret";
const S3_SECRET_VOLUME_NAME: &str = "s3-upload-secret";
/// Room left for `-` plus an 8 character node hash in a 63 character name.
const MAX_NAME_PREFIX: usize = 54;

/// Labels identifying the workloads of a capture.
pub fn workload_labels(capture_name: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (APP_LABEL_KEY.to_string(), APP_LABEL_VALUE.to_string()),
        (CAPTURE_NAME_LABEL_KEY.to_string(), capture_name.to_string()),
    ])
}

/// Check selectors, stop condition and outputs before touching the cluster.
pub fn validate(request: &CaptureRequest) -> Result<(), TranslateError> {
    let config = &request.spec.capture_configuration;
    validate_target(&config.capture_target)?;

    let option = &config.capture_option;
    if option.duration.is_none() && option.max_capture_size.is_none() {
        return Err(TranslateError::MissingStopCondition);
    }

    if request.spec.output_configuration.is_empty() {
        return Err(TranslateError::MissingOutput);
    }
    Ok(())
}

/// Environment shared by every workload of a capture.
pub fn capture_env(request: &CaptureRequest) -> Result<BTreeMap<String, String>, TranslateError> {
    let config = &request.spec.capture_configuration;
    let output = &request.spec.output_configuration;
    let mut env = BTreeMap::new();

    if let Some(path) = &output.host_path {
        env.insert(ENV_OUTPUT_HOST_PATH.to_string(), path.clone());
    }
    if let Some(claim) = &output.persistent_volume_claim {
        env.insert(ENV_OUTPUT_PVC.to_string(), claim.clone());
    }
    if let Some(s3) = &output.s3_upload {
        env.insert(ENV_S3_BUCKET.to_string(), s3.bucket.clone());
        for (key, value) in [
            (ENV_S3_ENDPOINT, &s3.endpoint),
            (ENV_S3_REGION, &s3.region),
            (ENV_S3_PATH, &s3.path),
        ] {
            if let Some(value) = value {
                env.insert(key.to_string(), value.clone());
            }
        }
    }

    let option = &config.capture_option;
    if let Some(duration) = option.duration {
        env.insert(
            ENV_CAPTURE_DURATION.to_string(),
            humantime::format_duration(duration).to_string(),
        );
    }
    if let Some(max_size) = option.max_capture_size {
        env.insert(ENV_CAPTURE_MAX_SIZE.to_string(), max_size.to_string());
    }
    if !option.interfaces.is_empty() {
        env.insert(ENV_CAPTURE_INTERFACES.to_string(), option.interfaces.join(","));
    }
    if let Some(packet_size) = option.packet_size {
        env.insert(ENV_PACKET_SIZE.to_string(), packet_size.to_string());
    }

    let compiled = filter::compile(&config.filters.include, &config.filters.exclude)?;
    if !compiled.is_empty() {
        env.insert(ENV_TCPDUMP_FILTER.to_string(), compiled);
    }
    if let Some(raw) = config.tcpdump_filter.as_deref().filter(|f| !f.is_empty()) {
        env.insert(ENV_TCPDUMP_RAW_FILTER.to_string(), raw.to_string());
    }

    env.insert(ENV_CAPTURE_NAME.to_string(), request.name.clone());
    env.insert(
        ENV_INCLUDE_METADATA.to_string(),
        config.include_metadata.to_string(),
    );
    Ok(env)
}

/// Stable workload name for a capture on a node.
pub fn workload_name(capture_name: &str, node: &str) -> String {
    let digest = hex::encode(Sha256::digest(node.as_bytes()));
    let prefix: String = capture_name.chars().take(MAX_NAME_PREFIX).collect();
    format!("{}-{}", prefix, &digest[..8])
}

pub struct WorkloadSynthesizer {
    client: Arc<dyn ClusterClient>,
    resolver: TargetResolver,
    image: String,
    apiserver: String,
    job_num_limit: usize,
    retry: RetryPolicy,
}

impl WorkloadSynthesizer {
    pub fn new(client: Arc<dyn ClusterClient>, config: &OperatorConfig) -> Self {
        Self {
            resolver: TargetResolver::new(client.clone()),
            client,
            image: config.capture_image.clone(),
            apiserver: config.apiserver.clone(),
            job_num_limit: config.capture_job_num_limit,
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.resolver = TargetResolver::new(self.client.clone()).with_retry_policy(retry);
        self
    }

    /// Validate, resolve targets and synthesize workloads starting now.
    pub async fn translate(&self, request: &CaptureRequest) -> Result<Vec<Workload>, TranslateError> {
        validate(request)?;
        let targets = self
            .resolver
            .resolve(&request.spec.capture_configuration.capture_target)
            .await?;
        self.synthesize(request, &targets, Utc::now().trunc_subsecs(0))
            .await
    }

    /// Build one workload per node in `targets`.
    pub async fn synthesize(
        &self,
        request: &CaptureRequest,
        targets: &CaptureTargetsOnNode,
        start: DateTime<Utc>,
    ) -> Result<Vec<Workload>, TranslateError> {
        let template = self.template(request, start).await?;
        let env = capture_env(request)?;
        let timestamp = render_timestamp(Some(&start));

        let mut workloads = Vec::with_capacity(targets.len());
        for (node, target) in targets.iter() {
            let mut workload = template.clone();
            workload.name = workload_name(&request.name, node);
            workload.spec.node_affinity = Some(NodeAffinity {
                label: NODE_HOSTNAME_LABEL.to_string(),
                values: vec![node.to_string()],
            });

            let filename = CaptureFilename::new(&request.name, node, Some(start));
            workload
                .annotations
                .insert(CAPTURE_FILENAME_ANNOTATION.to_string(), filename.to_string());

            for (key, value) in &env {
                workload.set_env(key, value.clone());
            }
            OsPlan::for_os(target.os).decorate(&mut workload, target);
            workload.set_env(ENV_NODE_HOST_NAME, node);
            workload.set_env(ENV_CAPTURE_START_TIMESTAMP, timestamp.clone());

            debug!(capture = %request.key(), node = %node, os = %target.os, "Synthesized capture workload {}", workload.name);
            workloads.push(workload);
        }

        if self.job_num_limit > 0 && workloads.len() > self.job_num_limit {
            return Err(TranslateError::JobNumExceedLimit {
                current: workloads.len(),
                limit: self.job_num_limit,
            });
        }

        info!(capture = %request.key(), "Synthesized {} capture workloads", workloads.len());
        Ok(workloads)
    }

    async fn template(
        &self,
        request: &CaptureRequest,
        start: DateTime<Utc>,
    ) -> Result<Workload, TranslateError> {
        let mut container = Container {
            name: CONTAINER_NAME.to_string(),
            image: self.image.clone(),
            command: Vec::new(),
            env: vec![
                EnvVar::field_ref(ENV_POD_NAME, "metadata.name"),
                EnvVar::literal(ENV_APISERVER, self.apiserver.clone()),
            ],
            volume_mounts: Vec::new(),
            resources: Resources::default(),
            security_context: SecurityContext {
                capabilities: vec!["NET_ADMIN".to_string(), "SYS_ADMIN".to_string()],
                ..SecurityContext::default()
            },
        };
        let mut volumes = Vec::new();
        let output = &request.spec.output_configuration;

        if let Some(path) = output.host_path.as_deref().filter(|p| !p.is_empty()) {
            volumes.push(Volume {
                name: HOST_PATH_VOLUME_NAME.to_string(),
                source: VolumeSource::HostPath {
                    path: path.to_string(),
                },
            });
            container.volume_mounts.push(VolumeMount {
                name: HOST_PATH_VOLUME_NAME.to_string(),
                mount_path: path.to_string(),
                read_only: false,
            });
        }

        if let Some(secret) = output.blob_upload.as_deref().filter(|s| !s.is_empty()) {
            self.ensure_secret(&request.namespace, secret).await?;
            volumes.push(Volume {
                name: BLOB_SECRET_VOLUME_NAME.to_string(),
                source: VolumeSource::Secret {
                    secret_name: secret.to_string(),
                },
            });
            container.volume_mounts.push(VolumeMount {
                name: BLOB_SECRET_VOLUME_NAME.to_string(),
                mount_path: BLOB_SECRET_MOUNT_PATH.to_string(),
                read_only: true,
            });
        }

        if let Some(s3) = &output.s3_upload {
            self.ensure_secret(&request.namespace, &s3.secret_name).await?;
            volumes.push(Volume {
                name: S3_SECRET_VOLUME_NAME.to_string(),
                source: VolumeSource::Secret {
                    secret_name: s3.secret_name.clone(),
                },
            });
            container.volume_mounts.push(VolumeMount {
                name: S3_SECRET_VOLUME_NAME.to_string(),
                mount_path: S3_SECRET_MOUNT_PATH.to_string(),
                read_only: true,
            });
        }

        if let Some(claim) = output
            .persistent_volume_claim
            .as_deref()
            .filter(|c| !c.is_empty())
        {
            with_retry(self.retry, || {
                self.client.get_volume_claim(&request.namespace, claim)
            })
            .await
            .map_err(|e| match e {
                ClusterError::NotFound { .. } => TranslateError::VolumeClaimNotFound {
                    name: claim.to_string(),
                    namespace: request.namespace.clone(),
                },
                other => TranslateError::Cluster(other),
            })?;
            volumes.push(Volume {
                name: PVC_VOLUME_NAME.to_string(),
                source: VolumeSource::PersistentVolumeClaim {
                    claim_name: claim.to_string(),
                },
            });
            container.volume_mounts.push(VolumeMount {
                name: PVC_VOLUME_NAME.to_string(),
                mount_path: PVC_MOUNT_PATH_LINUX.to_string(),
                read_only: false,
            });
        }

        Ok(Workload {
            name: String::new(),
            namespace: request.namespace.clone(),
            labels: workload_labels(&request.name),
            annotations: BTreeMap::from([(
                CAPTURE_TIMESTAMP_ANNOTATION.to_string(),
                render_timestamp(Some(&start)),
            )]),
            owner: Some(OwnerReference {
                kind: "Capture".to_string(),
                name: request.name.clone(),
                uid: request.uid.clone(),
                controller: true,
            }),
            spec: WorkloadSpec {
                backoff_limit: 0,
                termination_grace_period: TERMINATION_GRACE_PERIOD,
                host_network: true,
                host_ipc: true,
                node_affinity: None,
                tolerations: vec![
                    Toleration {
                        key: Some("CriticalAddonsOnly".to_string()),
                        effect: None,
                    },
                    Toleration {
                        key: None,
                        effect: Some("NoExecute".to_string()),
                    },
                    Toleration {
                        key: None,
                        effect: Some("NoSchedule".to_string()),
                    },
                ],
                container,
                volumes,
            },
            status: WorkloadStatus::default(),
        })
    }

    async fn ensure_secret(&self, namespace: &str, name: &str) -> Result<(), TranslateError> {
        match with_retry(self.retry, || self.client.get_secret(namespace, name)).await {
            Ok(_) => Ok(()),
            Err(ClusterError::NotFound { .. }) => Err(TranslateError::SecretNotFound {
                name: name.to_string(),
                namespace: namespace.to_string(),
            }),
            Err(source) => Err(TranslateError::SecretLookup {
                name: name.to_string(),
                source,
            }),
        }
    }
}
