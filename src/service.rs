//! Hourly scaling loop.
//!
//! Each tick lists every Deployment in the cluster, gates them through the
//! eligibility policy, and dispatches one resize workflow per candidate.
//! Workloads are disjoint by namespace and name, so the workflows run
//! concurrently without coordination.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use tracing::{debug, error, info};

use crate::eligibility::{
    EligibilityPolicy, ANNOTATION_ENABLED, ANNOTATION_EXCLUDED, ANNOTATION_INTERVAL,
    ANNOTATION_TARGET_UTILIZATION,
};
use crate::error::{Result, ScalerError};
use crate::scaler::DiskScaler;

const SCALING_LOOP_INTERVAL: Duration = Duration::from_secs(60 * 60);
/// Deadline on the cluster-wide Deployment listing of one tick.
const LIST_TIMEOUT: Duration = Duration::from_secs(60);

/// Tally of one loop tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunStatus {
    pub enabled: usize,
    pub eligible: usize,
    pub succeeded: usize,
    pub failed: usize,
}

#[derive(Debug, Clone)]
pub struct WorkloadRef {
    pub namespace: String,
    pub deployment: String,
}

pub struct ScalerService {
    client: Client,
    scaler: DiskScaler,
    policy: EligibilityPolicy,
}

impl ScalerService {
    pub fn new(
        client: Client,
        scaler: DiskScaler,
        resize_all: bool,
        excluded_namespaces: &[String],
    ) -> Result<Self> {
        let policy = EligibilityPolicy::new(resize_all, excluded_namespaces)?;
        Ok(Self {
            client,
            scaler,
            policy,
        })
    }

    /// Spawns the scaling loop. The first tick fires immediately on
    /// startup, then once per hour.
    pub fn start(self: Arc<Self>) {
        info!("starting automated disk scaling loop every hour");
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SCALING_LOOP_INTERVAL);
            let mut last_run_failed = false;
            loop {
                ticker.tick().await;
                match self.run_once(Utc::now()).await {
                    Ok(status) => {
                        last_run_failed = false;
                        debug!(?status, "finished disk scaling tick");
                        if status.enabled == 0 {
                            debug!("no workloads have disk autoscaling enabled");
                        }
                        if status.eligible == 0 {
                            debug!("no enabled workload can be resized again yet");
                        }
                    }
                    Err(err) => {
                        if last_run_failed {
                            error!(error = %err, "scaling loop attempt failed consecutively");
                        } else {
                            error!(error = %err, "scaling loop attempt failed");
                        }
                        last_run_failed = true;
                    }
                }
            }
        });
    }

    /// One tick: list, gate, fan out, aggregate.
    pub async fn run_once(self: &Arc<Self>, now: DateTime<Utc>) -> Result<RunStatus> {
        let run_stamp = now.to_rfc3339_opts(SecondsFormat::Secs, true);
        let (mut status, workloads) = self.collect_candidates(now).await?;
        if workloads.is_empty() {
            return Ok(status);
        }
        debug!(
            run = %run_stamp,
            candidates = workloads.len(),
            "dispatching resize workflows"
        );

        let mut workflows = tokio::task::JoinSet::new();
        for workload in workloads {
            let service = Arc::clone(self);
            workflows.spawn(async move {
                let outcome = service
                    .scaler
                    .run_workflow(&workload.namespace, &workload.deployment)
                    .await;
                (workload, outcome)
            });
        }

        let mut failures = Vec::new();
        while let Some(joined) = workflows.join_next().await {
            match joined {
                Ok((_workload, Ok(()))) => status.succeeded += 1,
                Ok((workload, Err(err))) => {
                    status.failed += 1;
                    failures.push(format!(
                        "{}/{}: {err}",
                        workload.namespace, workload.deployment
                    ));
                }
                Err(join_err) => {
                    status.failed += 1;
                    failures.push(format!("resize workflow task failed: {join_err}"));
                }
            }
        }

        info!(
            run = %run_stamp,
            succeeded = status.succeeded,
            failed = status.failed,
            "disk autoscaling run finished"
        );
        if !failures.is_empty() {
            error!(run = %run_stamp, errors = %failures.join("; "), "disk autoscaling run had errors");
        }
        Ok(status)
    }

    /// Lists all Deployments and filters them down to this tick's
    /// candidates. Workloads with unavailable replicas are left alone.
    async fn collect_candidates(
        &self,
        now: DateTime<Utc>,
    ) -> Result<(RunStatus, Vec<WorkloadRef>)> {
        let deployments: Api<Deployment> = Api::all(self.client.clone());
        let list = tokio::time::timeout(LIST_TIMEOUT, deployments.list(&ListParams::default()))
            .await
            .map_err(|_| ScalerError::Api {
                message: "timed out listing deployments".to_string(),
            })?
            .map_err(|err| ScalerError::Api {
                message: format!("listing all deployments: {err}"),
            })?;

        let mut status = RunStatus::default();
        let mut workloads = Vec::new();
        for deployment in list.items {
            let unavailable = deployment
                .status
                .as_ref()
                .and_then(|s| s.unavailable_replicas)
                .unwrap_or(0);
            if unavailable > 0 {
                continue;
            }
            if !self.policy.workload_is_enabled(&deployment.metadata) {
                continue;
            }
            status.enabled += 1;
            if !self.policy.workload_is_eligible(&deployment.metadata, now) {
                continue;
            }
            status.eligible += 1;
            workloads.push(WorkloadRef {
                namespace: deployment.metadata.namespace.clone().unwrap_or_default(),
                deployment: deployment.metadata.name.clone().unwrap_or_default(),
            });
        }
        Ok((status, workloads))
    }

    /// Opts a workload in by writing the enable annotations. Used by the
    /// admission surface.
    pub async fn enable_deployment(
        &self,
        namespace: &str,
        deployment_name: &str,
        interval: &str,
        target_utilization: &str,
    ) -> Result<()> {
        self.policy.ensure_namespace_allowed(namespace)?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let mut deployment =
            deployments
                .get(deployment_name)
                .await
                .map_err(|err| ScalerError::Api {
                    message: format!(
                        "namespace {namespace}, deployment {deployment_name}: failed to get deployment: {err}"
                    ),
                })?;

        let annotations = deployment
            .metadata
            .annotations
            .get_or_insert_with(Default::default);
        annotations.insert(ANNOTATION_ENABLED.to_string(), "true".to_string());
        annotations.insert(ANNOTATION_INTERVAL.to_string(), interval.to_string());
        annotations.insert(
            ANNOTATION_TARGET_UTILIZATION.to_string(),
            target_utilization.to_string(),
        );

        deployments
            .replace(deployment_name, &PostParams::default(), &deployment)
            .await
            .map_err(|err| ScalerError::Api {
                message: format!("annotating deployment with autoscaling annotations failed: {err}"),
            })?;
        info!(
            namespace,
            deployment = deployment_name,
            "enabled disk autoscaling for deployment"
        );
        Ok(())
    }

    /// Hard-excludes a workload from autoscaling.
    pub async fn exclude_deployment(&self, namespace: &str, deployment_name: &str) -> Result<()> {
        self.policy.ensure_namespace_allowed(namespace)?;

        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let mut deployment =
            deployments
                .get(deployment_name)
                .await
                .map_err(|err| ScalerError::Api {
                    message: format!(
                        "namespace {namespace}, deployment {deployment_name}: failed to get deployment: {err}"
                    ),
                })?;

        deployment
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_EXCLUDED.to_string(), "true".to_string());

        deployments
            .replace(deployment_name, &PostParams::default(), &deployment)
            .await
            .map_err(|err| ScalerError::Api {
                message: format!("annotating deployment with autoscaling annotations failed: {err}"),
            })?;
        info!(
            namespace,
            deployment = deployment_name,
            "excluded deployment from disk autoscaling"
        );
        Ok(())
    }
}
