//! Reconciliation loop for capture requests.
//!
//! `CaptureReconciler` drives one request towards its desired state: it owns
//! the finalizer, provisions the managed upload secret, creates the per-node
//! workloads and folds their progress back into the request's status. The
//! `Controller` work queue feeds it keys, serialized per key.

mod queue;
mod status;

pub use queue::Controller;
pub use status::{
    aggregate_status, in_progress_message, REASON_CREATE_JOB_FAILED, REASON_CREATE_SECRET_FAILED,
    REASON_JOBS_COMPLETED, REASON_JOBS_IN_PROGRESS, REASON_RUN_JOB_FAILED,
};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::cluster::{with_retry, ClusterClient, RetryPolicy};
use crate::config::OperatorConfig;
use crate::constants::CAPTURE_FINALIZER;
use crate::domain::{CaptureKey, CaptureRequest, CaptureStatus, ConditionType, LabelSelector};
use crate::error::{ControllerError, TranslateError};
use crate::managed::{managed_secret, managed_secret_name, SasUrlIssuer};
use crate::synth::{workload_labels, WorkloadSynthesizer};

/// Something that can bring one keyed object to its desired state
/// (Dependency Inversion Principle).
///
/// The work queue only knows this trait, so it can be driven by a fake in
/// tests.
#[async_trait]
pub trait Reconcile: Send + Sync + 'static {
    async fn reconcile(&self, key: &CaptureKey) -> Result<(), ControllerError>;
}

pub struct CaptureReconciler {
    client: Arc<dyn ClusterClient>,
    synthesizer: WorkloadSynthesizer,
    sas_issuer: Option<Arc<dyn SasUrlIssuer>>,
    managed_storage: bool,
    sas_validity: Duration,
    retry: RetryPolicy,
}

impl CaptureReconciler {
    pub fn new(client: Arc<dyn ClusterClient>, config: &OperatorConfig) -> Self {
        Self {
            synthesizer: WorkloadSynthesizer::new(client.clone(), config),
            client,
            sas_issuer: None,
            managed_storage: config.enable_managed_storage_account,
            sas_validity: config.managed_sas_validity,
            retry: RetryPolicy::default(),
        }
    }

    /// Issuer used in managed storage mode.
    pub fn with_sas_issuer(mut self, issuer: Arc<dyn SasUrlIssuer>) -> Self {
        self.sas_issuer = Some(issuer);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self.synthesizer = self.synthesizer.with_retry_policy(retry);
        self
    }

    fn managed_issuer(&self) -> Option<&Arc<dyn SasUrlIssuer>> {
        if self.managed_storage {
            self.sas_issuer.as_ref()
        } else {
            None
        }
    }

    async fn reconcile_capture(&self, mut capture: CaptureRequest) -> Result<(), ControllerError> {
        let key = capture.key();

        if capture.add_finalizer(CAPTURE_FINALIZER) {
            debug!(capture = %key, "Adding finalizer");
            self.client.update_capture(&capture).await?;
        }

        let selector = LabelSelector::from_labels(&workload_labels(&capture.name));
        let workloads = with_retry(self.retry, || {
            self.client.list_workloads(&capture.namespace, &selector)
        })
        .await?;

        if !workloads.is_empty() {
            let mut status = capture.status.clone();
            aggregate_status(&mut status, &workloads, Utc::now());
            return self.update_status(&key, status).await;
        }

        if let Some(issuer) = self.managed_issuer() {
            if capture.spec.output_configuration.blob_upload.is_none() {
                self.provision_managed_secret(&mut capture, issuer.as_ref())
                    .await?;
            }
        }

        let workloads = match self.synthesizer.translate(&capture).await {
            Ok(workloads) => workloads,
            Err(e) => {
                warn!(capture = %key, "Failed to translate capture: {}", e);
                let mut status = capture.status.clone();
                status.set_condition(ConditionType::Error, true, e.reason(), e.to_string(), Utc::now());
                self.update_status(&key, status).await?;
                // Cluster hiccups are retried; everything else waits for a spec change.
                return match e {
                    TranslateError::Cluster(source) => Err(source.into()),
                    _ => Ok(()),
                };
            }
        };

        for workload in &workloads {
            if let Err(e) = self.client.create_or_update_workload(workload).await {
                error!(capture = %key, "Failed to create capture workload {}: {}", workload.name, e);
                let mut status = capture.status.clone();
                status.set_condition(
                    ConditionType::Error,
                    true,
                    REASON_CREATE_JOB_FAILED,
                    format!(
                        "Failed to create Capture job {}/{}",
                        workload.name, workload.namespace
                    ),
                    Utc::now(),
                );
                self.update_status(&key, status).await?;
                return Err(e.into());
            }
        }

        info!(capture = %key, "Created {} capture workloads", workloads.len());
        let now = Utc::now();
        let mut status = capture.status.clone();
        status.start_time.get_or_insert(now);
        status.set_condition(
            ConditionType::Complete,
            false,
            REASON_JOBS_IN_PROGRESS,
            in_progress_message(workloads.len(), workloads.len()),
            now,
        );
        self.update_status(&key, status).await
    }

    /// Mint a SAS URL, store it in the managed secret and point the request at it.
    async fn provision_managed_secret(
        &self,
        capture: &mut CaptureRequest,
        issuer: &dyn SasUrlIssuer,
    ) -> Result<(), ControllerError> {
        let key = capture.key();
        let validity = capture
            .spec
            .capture_configuration
            .capture_option
            .duration
            .unwrap_or(self.sas_validity);

        let sas_url = issuer
            .create_container_sas_url(&capture.namespace, validity)
            .await
            .map_err(|e| ControllerError::SasUrl(format!("{:#}", e)))?;

        let secret = managed_secret(capture, &sas_url);
        if let Err(e) = self.client.create_or_update_secret(&secret).await {
            error!(capture = %key, "Failed to create managed secret {}: {}", secret.name, e);
            let mut status = capture.status.clone();
            status.set_condition(
                ConditionType::Error,
                true,
                REASON_CREATE_SECRET_FAILED,
                format!("Failed to create secret {}/{}", secret.name, secret.namespace),
                Utc::now(),
            );
            self.update_status(&key, status).await?;
            return Err(e.into());
        }

        info!(
            capture = %key,
            container = %issuer.container_name(&capture.namespace),
            "Provisioned managed upload secret {}",
            secret.name
        );
        capture.spec.output_configuration.blob_upload = Some(secret.name);
        self.client.update_capture(capture).await?;
        Ok(())
    }

    /// Write `status` onto the latest copy of the request, only if it changed.
    async fn update_status(
        &self,
        key: &CaptureKey,
        status: CaptureStatus,
    ) -> Result<(), ControllerError> {
        let mut latest = with_retry(self.retry, || {
            self.client.get_capture(&key.namespace, &key.name)
        })
        .await?;
        if latest.status == status {
            debug!(capture = %key, "Status unchanged");
            return Ok(());
        }
        latest.status = status;
        self.client.update_capture_status(&latest).await?;
        Ok(())
    }

    async fn handle_delete(&self, mut capture: CaptureRequest) -> Result<(), ControllerError> {
        let key = capture.key();
        if !capture.has_finalizer(CAPTURE_FINALIZER) {
            return Ok(());
        }

        info!(capture = %key, "Deleting capture workloads");
        let selector = LabelSelector::from_labels(&workload_labels(&capture.name));
        with_retry(self.retry, || {
            self.client.delete_workloads(&capture.namespace, &selector)
        })
        .await?;

        let secret_name = managed_secret_name(&capture.name);
        if self.managed_storage
            && capture.spec.output_configuration.blob_upload.as_deref() == Some(secret_name.as_str())
        {
            match with_retry(self.retry, || {
                self.client.delete_secret(&capture.namespace, &secret_name)
            })
            .await
            {
                Ok(()) => info!(capture = %key, "Deleted managed secret {}", secret_name),
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e.into()),
            }
        }

        capture.remove_finalizer(CAPTURE_FINALIZER);
        self.client.update_capture(&capture).await?;
        Ok(())
    }
}

#[async_trait]
impl Reconcile for CaptureReconciler {
    async fn reconcile(&self, key: &CaptureKey) -> Result<(), ControllerError> {
        let capture = match self.client.get_capture(&key.namespace, &key.name).await {
            Ok(capture) => capture,
            Err(e) if e.is_not_found() => {
                debug!(capture = %key, "Capture no longer exists");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        };

        if capture.deletion_timestamp.is_some() {
            return self.handle_delete(capture).await;
        }
        self.reconcile_capture(capture).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use chrono::TimeZone;

    use crate::cluster::fake::FakeCluster;
    use crate::domain::{
        CaptureConfiguration, CaptureOption, CaptureSpec, Filters, OutputConfiguration, Target,
        WorkloadCondition, WorkloadConditionType,
    };

    struct FakeIssuer {
        validities: Mutex<Vec<Duration>>,
        fail: bool,
    }

    impl FakeIssuer {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                validities: Mutex::new(Vec::new()),
                fail,
            })
        }
    }

    #[async_trait]
    impl SasUrlIssuer for FakeIssuer {
        fn container_name(&self, namespace: &str) -> String {
            format!("capture-{}", namespace)
        }

        async fn create_container_sas_url(
            &self,
            namespace: &str,
            validity: Duration,
        ) -> anyhow::Result<String> {
            if self.fail {
                anyhow::bail!("storage account unavailable");
            }
            self.validities.lock().unwrap().push(validity);
            Ok(format!(
                "https://acct.blob.core.windows.net/{}?sig=x",
                self.container_name(namespace)
            ))
        }
    }

    fn request() -> CaptureRequest {
        CaptureRequest {
            name: "cap".to_string(),
            namespace: "default".to_string(),
            uid: "uid-1".to_string(),
            finalizers: Vec::new(),
            deletion_timestamp: None,
            spec: CaptureSpec {
                capture_configuration: CaptureConfiguration {
                    capture_target: Target::nodes(LabelSelector::new()),
                    capture_option: CaptureOption {
                        duration: Some(Duration::from_secs(60)),
                        ..CaptureOption::default()
                    },
                    filters: Filters::default(),
                    tcpdump_filter: None,
                    include_metadata: false,
                },
                output_configuration: OutputConfiguration {
                    host_path: Some("/tmp/capture".to_string()),
                    ..OutputConfiguration::default()
                },
            },
            status: CaptureStatus::default(),
        }
    }

    fn cluster_with_nodes(nodes: &[&str]) -> Arc<FakeCluster> {
        let cluster = Arc::new(FakeCluster::new());
        for node in nodes {
            cluster.add_node(node, "linux", &[]);
        }
        cluster
    }

    fn reconciler(cluster: &Arc<FakeCluster>, config: OperatorConfig) -> CaptureReconciler {
        CaptureReconciler::new(cluster.clone(), &config)
            .with_retry_policy(RetryPolicy::default().with_attempts(1))
    }

    fn key() -> CaptureKey {
        CaptureKey::new("default", "cap")
    }

    fn finish(cluster: &FakeCluster, name: &str, condition_type: WorkloadConditionType, minute: u32) {
        cluster.update_workload_status(name, |w| {
            w.status.conditions = vec![WorkloadCondition {
                condition_type,
                status: true,
            }];
            if condition_type == WorkloadConditionType::Complete {
                w.status.completion_time =
                    Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, minute, 0).unwrap());
            }
        });
    }

    mod create_tests {
        use super::*;

        #[tokio::test]
        async fn test_creates_workloads_with_finalizer_and_status() {
            let cluster = cluster_with_nodes(&["node-a", "node-b"]);
            cluster.put_capture(request());

            reconciler(&cluster, OperatorConfig::default())
                .reconcile(&key())
                .await
                .unwrap();

            let capture = cluster.capture("default", "cap").unwrap();
            assert!(capture.has_finalizer(CAPTURE_FINALIZER));
            assert_eq!(cluster.workloads().len(), 2);
            assert!(capture.status.start_time.is_some());
            let complete = capture.status.condition(ConditionType::Complete).unwrap();
            assert!(!complete.status);
            assert_eq!(complete.reason, REASON_JOBS_IN_PROGRESS);
            assert_eq!(
                complete.message,
                "2/2 Capture jobs are in progress, waiting for completion"
            );
        }

        #[tokio::test]
        async fn test_missing_capture_is_not_an_error() {
            let cluster = cluster_with_nodes(&["node-a"]);
            reconciler(&cluster, OperatorConfig::default())
                .reconcile(&key())
                .await
                .unwrap();
            assert!(cluster.workloads().is_empty());
        }

        #[tokio::test]
        async fn test_job_limit_sets_error_condition() {
            let cluster = cluster_with_nodes(&["node-a", "node-b", "node-c"]);
            cluster.put_capture(request());
            let config = OperatorConfig {
                capture_job_num_limit: 2,
                ..OperatorConfig::default()
            };

            reconciler(&cluster, config).reconcile(&key()).await.unwrap();

            let capture = cluster.capture("default", "cap").unwrap();
            let error = capture.status.condition(ConditionType::Error).unwrap();
            assert!(error.status);
            assert_eq!(error.reason, "ExceedJobNumLimit");
            assert!(cluster.workloads().is_empty());
        }

        #[tokio::test]
        async fn test_missing_blob_secret_sets_error_condition() {
            let cluster = cluster_with_nodes(&["node-a"]);
            let mut capture = request();
            capture.spec.output_configuration.blob_upload = Some("blob".to_string());
            cluster.put_capture(capture);

            reconciler(&cluster, OperatorConfig::default())
                .reconcile(&key())
                .await
                .unwrap();

            let capture = cluster.capture("default", "cap").unwrap();
            assert_eq!(
                capture.status.condition(ConditionType::Error).unwrap().reason,
                "FindSecretFailed"
            );
        }

        #[tokio::test]
        async fn test_workload_upsert_failure_sets_error_and_requeues() {
            let cluster = cluster_with_nodes(&["node-a"]);
            cluster.put_capture(request());
            cluster.fail_workload_upserts();

            let result = reconciler(&cluster, OperatorConfig::default())
                .reconcile(&key())
                .await;

            assert!(matches!(result, Err(ControllerError::Cluster(_))));
            let capture = cluster.capture("default", "cap").unwrap();
            let error = capture.status.condition(ConditionType::Error).unwrap();
            assert_eq!(error.reason, REASON_CREATE_JOB_FAILED);
            assert!(error.message.starts_with("Failed to create Capture job cap-"));
        }
    }

    mod progress_tests {
        use super::*;

        #[tokio::test]
        async fn test_aggregates_partial_progress() {
            let cluster = cluster_with_nodes(&["node-a", "node-b", "node-c"]);
            cluster.put_capture(request());
            let reconciler = reconciler(&cluster, OperatorConfig::default());
            reconciler.reconcile(&key()).await.unwrap();

            let names: Vec<String> = cluster.workloads().into_iter().map(|w| w.name).collect();
            finish(&cluster, &names[0], WorkloadConditionType::Complete, 1);
            finish(&cluster, &names[1], WorkloadConditionType::Complete, 2);
            reconciler.reconcile(&key()).await.unwrap();

            let status = cluster.capture("default", "cap").unwrap().status;
            assert_eq!((status.active, status.succeeded, status.failed), (1, 2, 0));
            assert_eq!(
                status.condition(ConditionType::Complete).unwrap().message,
                "1/3 Capture jobs are in progress, waiting for completion"
            );
        }

        #[tokio::test]
        async fn test_all_completed() {
            let cluster = cluster_with_nodes(&["node-a", "node-b"]);
            cluster.put_capture(request());
            let reconciler = reconciler(&cluster, OperatorConfig::default());
            reconciler.reconcile(&key()).await.unwrap();

            for (i, workload) in cluster.workloads().iter().enumerate() {
                finish(&cluster, &workload.name, WorkloadConditionType::Complete, 5 + i as u32);
            }
            reconciler.reconcile(&key()).await.unwrap();

            let status = cluster.capture("default", "cap").unwrap().status;
            assert!(status.is_complete());
            assert_eq!(
                status.completion_time,
                Some(Utc.with_ymd_and_hms(2024, 5, 1, 10, 6, 0).unwrap())
            );
        }

        #[tokio::test]
        async fn test_failed_workload_sets_run_job_failed() {
            let cluster = cluster_with_nodes(&["node-a"]);
            cluster.put_capture(request());
            let reconciler = reconciler(&cluster, OperatorConfig::default());
            reconciler.reconcile(&key()).await.unwrap();

            let name = cluster.workloads()[0].name.clone();
            finish(&cluster, &name, WorkloadConditionType::Failed, 0);
            reconciler.reconcile(&key()).await.unwrap();

            let status = cluster.capture("default", "cap").unwrap().status;
            assert_eq!(
                status.condition(ConditionType::Error).unwrap().reason,
                REASON_RUN_JOB_FAILED
            );
        }

        #[tokio::test]
        async fn test_unchanged_status_is_not_written() {
            let cluster = cluster_with_nodes(&["node-a"]);
            cluster.put_capture(request());
            let reconciler = reconciler(&cluster, OperatorConfig::default());
            reconciler.reconcile(&key()).await.unwrap();

            let name = cluster.workloads()[0].name.clone();
            finish(&cluster, &name, WorkloadConditionType::Complete, 1);
            reconciler.reconcile(&key()).await.unwrap();
            let writes = cluster.status_writes();

            reconciler.reconcile(&key()).await.unwrap();
            assert_eq!(cluster.status_writes(), writes);
        }
    }

    mod managed_tests {
        use super::*;

        fn managed_config() -> OperatorConfig {
            OperatorConfig {
                enable_managed_storage_account: true,
                ..OperatorConfig::default()
            }
        }

        #[tokio::test]
        async fn test_provisions_managed_secret() {
            let cluster = cluster_with_nodes(&["node-a"]);
            cluster.put_capture(request());
            let issuer = FakeIssuer::new(false);

            reconciler(&cluster, managed_config())
                .with_sas_issuer(issuer.clone())
                .reconcile(&key())
                .await
                .unwrap();

            let secret = cluster.secret("default", "managed-cap").unwrap();
            assert_eq!(
                secret.data.get(crate::constants::BLOB_SECRET_KEY).unwrap(),
                b"https://acct.blob.core.windows.net/capture-default?sig=x"
            );
            let capture = cluster.capture("default", "cap").unwrap();
            assert_eq!(
                capture.spec.output_configuration.blob_upload.as_deref(),
                Some("managed-cap")
            );
            assert_eq!(*issuer.validities.lock().unwrap(), vec![Duration::from_secs(60)]);
            assert_eq!(cluster.workloads().len(), 1);
        }

        #[tokio::test]
        async fn test_size_only_capture_uses_default_validity() {
            let cluster = cluster_with_nodes(&["node-a"]);
            let mut capture = request();
            capture.spec.capture_configuration.capture_option = CaptureOption {
                max_capture_size: Some(10),
                ..CaptureOption::default()
            };
            cluster.put_capture(capture);
            let issuer = FakeIssuer::new(false);

            reconciler(&cluster, managed_config())
                .with_sas_issuer(issuer.clone())
                .reconcile(&key())
                .await
                .unwrap();

            assert_eq!(
                *issuer.validities.lock().unwrap(),
                vec![OperatorConfig::default().managed_sas_validity]
            );
        }

        #[tokio::test]
        async fn test_issuer_failure_requeues() {
            let cluster = cluster_with_nodes(&["node-a"]);
            cluster.put_capture(request());

            let result = reconciler(&cluster, managed_config())
                .with_sas_issuer(FakeIssuer::new(true))
                .reconcile(&key())
                .await;

            assert!(matches!(result, Err(ControllerError::SasUrl(_))));
            assert!(cluster.workloads().is_empty());
        }

        #[tokio::test]
        async fn test_user_secret_is_left_alone() {
            let cluster = cluster_with_nodes(&["node-a"]);
            cluster.add_secret("default", "blob");
            let mut capture = request();
            capture.spec.output_configuration.blob_upload = Some("blob".to_string());
            cluster.put_capture(capture);
            let issuer = FakeIssuer::new(false);

            reconciler(&cluster, managed_config())
                .with_sas_issuer(issuer.clone())
                .reconcile(&key())
                .await
                .unwrap();

            assert!(issuer.validities.lock().unwrap().is_empty());
            assert!(cluster.secret("default", "managed-cap").is_none());
        }
    }

    mod delete_tests {
        use super::*;

        async fn created(cluster: &Arc<FakeCluster>, reconciler: &CaptureReconciler) {
            reconciler.reconcile(&key()).await.unwrap();
            let mut capture = cluster.capture("default", "cap").unwrap();
            capture.deletion_timestamp = Some(Utc::now());
            cluster.put_capture(capture);
        }

        #[tokio::test]
        async fn test_delete_removes_workloads_and_managed_secret() {
            let cluster = cluster_with_nodes(&["node-a", "node-b"]);
            cluster.put_capture(request());
            let reconciler = reconciler(
                &cluster,
                OperatorConfig {
                    enable_managed_storage_account: true,
                    ..OperatorConfig::default()
                },
            )
            .with_sas_issuer(FakeIssuer::new(false));
            created(&cluster, &reconciler).await;
            assert_eq!(cluster.workloads().len(), 2);

            reconciler.reconcile(&key()).await.unwrap();

            assert!(cluster.workloads().is_empty());
            assert_eq!(
                cluster.deleted_secrets(),
                vec![("default".to_string(), "managed-cap".to_string())]
            );
            let capture = cluster.capture("default", "cap").unwrap();
            assert!(!capture.has_finalizer(CAPTURE_FINALIZER));
        }

        #[tokio::test]
        async fn test_delete_keeps_user_secret() {
            let cluster = cluster_with_nodes(&["node-a"]);
            cluster.add_secret("default", "blob");
            let mut capture = request();
            capture.spec.output_configuration.blob_upload = Some("blob".to_string());
            cluster.put_capture(capture);
            let reconciler = reconciler(
                &cluster,
                OperatorConfig {
                    enable_managed_storage_account: true,
                    ..OperatorConfig::default()
                },
            );
            created(&cluster, &reconciler).await;

            reconciler.reconcile(&key()).await.unwrap();

            assert!(cluster.deleted_secrets().is_empty());
            assert!(cluster.secret("default", "blob").is_some());
            assert!(cluster.workloads().is_empty());
        }

        #[tokio::test]
        async fn test_delete_without_finalizer_is_noop() {
            let cluster = cluster_with_nodes(&["node-a"]);
            let mut capture = request();
            capture.deletion_timestamp = Some(Utc::now());
            cluster.put_capture(capture);

            reconciler(&cluster, OperatorConfig::default())
                .reconcile(&key())
                .await
                .unwrap();
            assert!(cluster.capture("default", "cap").unwrap().finalizers.is_empty());
        }
    }
}
