//! Per-workload resize workflow.
//!
//! One run owns every mutation on its workload: discover the claims and
//! their recommendations, freeze writes by scaling replicas to zero, then
//! per claim either patch the size in place (expansion) or migrate the data
//! onto a freshly provisioned smaller claim and repoint the workload at it.
//! Afterwards the workload is stamped, scaled back up, and leftover claims
//! are cleaned away.
//!
//! Scaling replicas to zero is the only write fence; workloads whose
//! volumes are written through other paths are not supported.

mod mover;
mod plan;
mod watch;

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{SecondsFormat, Utc};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{PersistentVolume, PersistentVolumeClaim};
use k8s_openapi::api::storage::v1::StorageClass;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DeleteParams, Patch, PatchParams, PostParams, WatchEvent};
use kube::Client;
use rand::Rng;
use tracing::{debug, error, info, warn};

use crate::advisor::SizingAdvisor;
use crate::eligibility::{
    ANNOTATION_INTERVAL, ANNOTATION_LAST_SCALED, ANNOTATION_TARGET_UTILIZATION, DEFAULT_INTERVAL,
    DEFAULT_TARGET_UTILIZATION,
};
use crate::error::{Result, ScalerError};
use crate::quantity::{is_equal, is_greater, StorageQuantity};
use plan::{plan_outcome, PlanEntry};

/// Marker value written into claims this controller creates.
pub const CONTROLLER_ID: &str = "kubecost_disk_auto_scaler";
pub const PVC_ANNOTATION_CREATED_BY: &str =
    "request.autodiskscaling.kubecost.com/volumeCreatedBy";
/// Reserved for auditing in-place expansions.
pub const PVC_ANNOTATION_EXTENDED_BY: &str =
    "request.autodiskscaling.kubecost.com/volumeExtendedBy";

/// Storage-class provisioners the shrink/expand workflow is known to work
/// against.
const SUPPORTED_PROVISIONERS: &[&str] = &["ebs.csi.aws.com"];
/// Replacement claims must bind on first consumer so the new volume lands in
/// the topology of the node that mounts it.
const VOLUME_BINDING_WAIT_FOR_FIRST_CONSUMER: &str = "WaitForFirstConsumer";

const MAX_RETRIES: u32 = 3;
const RETRY_DELAY: Duration = Duration::from_secs(10);
/// Deadline on any watch for claim or pod creation and deletion.
const SCALING_OPERATION_TIMEOUT: Duration = Duration::from_secs(4 * 60);
const MOVER_DELETE_TIMEOUT: Duration = Duration::from_secs(120);
const CONFLICT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const CONFLICT_MAX_ATTEMPTS: u32 = 5;

const DATA_MOVER_POD_PREFIX: &str = "kubecost-data-mover-pod";
/// Suffixes must stay label-compatible, hence lowercase letters only. The
/// stem truncation below hard-codes the 6-character `-xxxxx` tail; keep the
/// two in sync.
const NAME_SUFFIX_LEN: usize = 5;
const NAME_SUFFIX_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz";

pub struct DiskScaler {
    client: Client,
    advisor: Arc<dyn SizingAdvisor>,
}

impl DiskScaler {
    pub fn new(client: Client, advisor: Arc<dyn SizingAdvisor>) -> Self {
        Self { client, advisor }
    }

    /// Runs the full resize workflow for one workload. Discovery failures
    /// abort before any cluster mutation; once execution starts, per-claim
    /// failures are collected and surfaced as a partial or total failure
    /// after replicas are restored.
    pub async fn run_workflow(&self, namespace: &str, deployment: &str) -> Result<()> {
        let mut entries = self.build_plan(namespace, deployment).await?;
        debug!(
            namespace,
            deployment,
            claims = entries.len(),
            "assembled volume resize plan"
        );

        let original_scale = self
            .scale_deployment_with_retry(namespace, deployment, 0)
            .await?;

        // Claims are handled strictly one after another: two mover pods on
        // the same node would contend for resources and make rollback murky.
        for entry in entries.iter_mut() {
            self.execute_entry(namespace, deployment, entry).await;
        }

        self.annotate_deployment_with_retry(namespace, deployment)
            .await
            .map_err(|err| ScalerError::Api {
                message: format!("annotating deployment {deployment} after scaling failed: {err}"),
            })?;

        self.scale_deployment_with_retry(namespace, deployment, original_scale)
            .await?;

        self.cleanup(namespace, &entries).await;

        plan_outcome(namespace, deployment, &entries)
    }

    /// Discovery: resolve every claim of the workload into a plan entry.
    /// Any failure here is fatal to the workflow and leaves the cluster
    /// untouched.
    async fn build_plan(&self, namespace: &str, deployment_name: &str) -> Result<Vec<PlanEntry>> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let storage_classes: Api<StorageClass> = Api::all(self.client.clone());
        let pvs: Api<PersistentVolume> = Api::all(self.client.clone());

        let deployment = deployments
            .get(deployment_name)
            .await
            .map_err(|err| ScalerError::Api {
                message: format!("unable to get deployment {deployment_name}: {err}"),
            })?;
        let annotations = deployment.metadata.annotations.clone().unwrap_or_default();

        let target_utilization = match annotations.get(ANNOTATION_TARGET_UTILIZATION) {
            None => DEFAULT_TARGET_UTILIZATION,
            Some(raw) => raw.parse().unwrap_or_else(|_| {
                warn!(
                    deployment = deployment_name,
                    "targetUtilization annotation is invalid, defaulting to {DEFAULT_TARGET_UTILIZATION}"
                );
                DEFAULT_TARGET_UTILIZATION
            }),
        };
        let window = match annotations.get(ANNOTATION_INTERVAL) {
            Some(raw) if humantime::parse_duration(raw).is_ok() => raw.clone(),
            Some(_) => {
                warn!(
                    deployment = deployment_name,
                    "interval annotation is invalid, defaulting to {DEFAULT_INTERVAL}"
                );
                DEFAULT_INTERVAL.to_string()
            }
            None => DEFAULT_INTERVAL.to_string(),
        };

        let volumes = deployment
            .spec
            .as_ref()
            .and_then(|spec| spec.template.spec.as_ref())
            .and_then(|pod_spec| pod_spec.volumes.clone())
            .unwrap_or_default();

        let mut entries = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let claim = volume
                .persistent_volume_claim
                .as_ref()
                .ok_or_else(|| ScalerError::Validation {
                    message: format!(
                        "deployment {deployment_name} contains a volume source that is not a persistent volume claim"
                    ),
                })?;
            let pvc_name = claim.claim_name.clone();

            let pvc = pvcs.get(&pvc_name).await.map_err(|err| ScalerError::Api {
                message: format!("failed to get persistent volume claim {pvc_name}: {err}"),
            })?;
            let resized_pvc_name = new_pvc_name(&pvc);

            let spec = pvc.spec.clone().ok_or_else(|| ScalerError::Validation {
                message: format!("persistent volume claim {pvc_name} has no spec"),
            })?;
            let pv_name = spec
                .volume_name
                .clone()
                .filter(|name| !name.is_empty())
                .ok_or_else(|| ScalerError::Validation {
                    message: format!("persistent volume claim {pvc_name} is not bound to a volume"),
                })?;
            debug!(pvc = %pvc_name, pv = %pv_name, "resolved backing volume");

            let current_size = pvc
                .status
                .as_ref()
                .and_then(|status| status.capacity.as_ref())
                .and_then(|capacity| capacity.get("storage"))
                .map(|quantity| StorageQuantity::parse(&quantity.0))
                .transpose()?
                .ok_or_else(|| ScalerError::Validation {
                    message: format!("persistent volume claim {pvc_name} reports no storage capacity"),
                })?;

            let storage_class =
                spec.storage_class_name
                    .clone()
                    .ok_or_else(|| ScalerError::Validation {
                        message: format!("persistent volume claim {pvc_name} has no storage class"),
                    })?;
            let sc = storage_classes
                .get(&storage_class)
                .await
                .map_err(|err| ScalerError::Api {
                    message: format!(
                        "unable to get storage class {storage_class} for claim {pvc_name}: {err}"
                    ),
                })?;
            let provisioner = sc.provisioner.clone();
            let allow_expansion = sc.allow_volume_expansion.unwrap_or(false);
            let binding_mode = sc.volume_binding_mode.clone().unwrap_or_default();
            debug!(
                pvc = %pvc_name,
                provisioner = %provisioner,
                allow_expansion,
                binding_mode = %binding_mode,
                "resolved storage class"
            );

            if !SUPPORTED_PROVISIONERS.contains(&provisioner.as_str()) {
                return Err(ScalerError::Validation {
                    message: format!(
                        "unsupported provisioner {provisioner} for storage class {storage_class}"
                    ),
                });
            }
            if binding_mode != VOLUME_BINDING_WAIT_FOR_FIRST_CONSUMER {
                return Err(ScalerError::Validation {
                    message: format!(
                        "cannot support volume binding mode {binding_mode} for storage class {storage_class}"
                    ),
                });
            }

            let pv = pvs.get(&pv_name).await.map_err(|err| ScalerError::Api {
                message: format!("unable to get persistent volume {pv_name}: {err}"),
            })?;
            if pv.spec.as_ref().and_then(|spec| spec.host_path.as_ref()).is_some() {
                return Err(ScalerError::Validation {
                    message: format!("persistent volume {pv_name} is host-path backed"),
                });
            }

            let recommendation = self
                .advisor
                .recommendation(&pv_name, target_utilization, &window)
                .await?;
            debug!(
                pv = %pv_name,
                recommended = %recommendation.size,
                savings_monthly = recommendation.savings_monthly,
                "received sizing recommendation"
            );

            entries.push(PlanEntry {
                pvc_name,
                pv_name,
                current_size,
                resize_to: recommendation.size,
                storage_class,
                provisioner,
                allow_expansion,
                spec,
                resized_pvc_name,
                error: None,
                skip_cleanup: false,
            });
        }

        Ok(entries)
    }

    /// Executes one plan entry, stashing any failure on the entry so its
    /// siblings still get their turn.
    async fn execute_entry(&self, namespace: &str, deployment: &str, entry: &mut PlanEntry) {
        if is_equal(&entry.current_size, &entry.resize_to) {
            info!(
                namespace,
                deployment,
                pvc = %entry.pvc_name,
                "volume already has optimal storage, no action taken"
            );
            entry.skip_cleanup = true;
            return;
        }

        if entry.allow_expansion && is_greater(&entry.current_size, &entry.resize_to) {
            info!(
                namespace,
                deployment,
                pvc = %entry.pvc_name,
                storage_class = %entry.storage_class,
                from = %entry.current_size,
                to = %entry.resize_to,
                "increasing volume size in place"
            );
            if let Err(err) = self
                .patch_pvc_with_resize(namespace, &entry.pvc_name, &entry.resize_to)
                .await
            {
                entry.error = Some(err);
            }
            // The original claim survives either way; never delete it.
            entry.skip_cleanup = true;
            return;
        }

        info!(
            namespace,
            deployment,
            pvc = %entry.pvc_name,
            pv = %entry.pv_name,
            storage_class = %entry.storage_class,
            provisioner = %entry.provisioner,
            from = %entry.current_size,
            to = %entry.resize_to,
            "decreasing volume size via data migration"
        );
        if let Err(err) = self.shrink_entry(namespace, deployment, entry).await {
            entry.error = Some(err);
        }
    }

    /// Shrink path: new claim, mover pod, exec copy, deployment rewrite.
    /// The mover pod is deleted on every outcome, forcefully after a failed
    /// copy.
    async fn shrink_entry(
        &self,
        namespace: &str,
        deployment: &str,
        entry: &PlanEntry,
    ) -> Result<()> {
        self.create_pvc_from_spec(namespace, entry).await?;
        debug!(
            pvc = %entry.resized_pvc_name,
            size = %entry.resize_to,
            "created replacement claim"
        );

        let mover_pod_name = format!("{DATA_MOVER_POD_PREFIX}-{}", random_suffix(NAME_SUFFIX_LEN));
        let copy_result = mover::run_data_mover(
            &self.client,
            namespace,
            &mover_pod_name,
            &entry.pvc_name,
            &entry.resized_pvc_name,
        )
        .await;
        let copy_failed = copy_result.is_err();

        if let Err(err) = with_retries("delete data mover pod", || {
            mover::delete_mover_pod(&self.client, namespace, &mover_pod_name, copy_failed)
        })
        .await
        {
            return Err(ScalerError::Api {
                message: format!(
                    "failed to delete data mover pod {mover_pod_name} after {MAX_RETRIES} attempts, manual deletion needed: {err}"
                ),
            });
        }

        copy_result?;
        debug!(
            from = %entry.pvc_name,
            to = %entry.resized_pvc_name,
            "moved data between claims"
        );

        // Only a fully copied claim may be wired into the workload.
        self.rewrite_deployment_volume(namespace, deployment, &entry.pvc_name, &entry.resized_pvc_name)
            .await
    }

    /// Creates the replacement claim from the original's spec snapshot with
    /// only the requested size changed.
    async fn create_pvc_from_spec(&self, namespace: &str, entry: &PlanEntry) -> Result<()> {
        let mut spec = entry.spec.clone();
        // A pinned volume name would make the new claim unbindable.
        spec.volume_name = None;
        let resources = spec.resources.get_or_insert_with(Default::default);
        let requests = resources.requests.get_or_insert_with(Default::default);
        requests.insert("storage".to_string(), Quantity(entry.resize_to.to_string()));

        let pvc = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(entry.resized_pvc_name.clone()),
                namespace: Some(namespace.to_string()),
                annotations: Some(BTreeMap::from([(
                    PVC_ANNOTATION_CREATED_BY.to_string(),
                    CONTROLLER_ID.to_string(),
                )])),
                ..Default::default()
            },
            spec: Some(spec),
            ..Default::default()
        };

        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        pvcs.create(&PostParams::default(), &pvc)
            .await
            .map_err(|err| ScalerError::Api {
                message: format!(
                    "unable to create claim {} of size {} for original claim {}: {err}",
                    entry.resized_pvc_name, entry.resize_to, entry.pvc_name
                ),
            })?;
        Ok(())
    }

    /// Expand path: a merge patch on the claim's storage request, which
    /// cannot run into an optimistic-concurrency conflict.
    async fn patch_pvc_with_resize(
        &self,
        namespace: &str,
        pvc_name: &str,
        resize_to: &StorageQuantity,
    ) -> Result<()> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "spec": { "resources": { "requests": { "storage": resize_to.to_string() } } }
        });
        pvcs.patch(pvc_name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| ScalerError::Api {
                message: format!("unable to patch claim {pvc_name}: {err}"),
            })?;
        info!(pvc = pvc_name, size = %resize_to, "patched claim with expanded size");
        Ok(())
    }

    /// Rewrites the workload's volume to reference the replacement claim.
    /// Conflicting writers are handled by re-reading and re-applying with
    /// exponential backoff.
    async fn rewrite_deployment_volume(
        &self,
        namespace: &str,
        deployment_name: &str,
        old_claim: &str,
        new_claim: &str,
    ) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let mut attempt = 0;
        loop {
            let mut deployment =
                deployments
                    .get(deployment_name)
                    .await
                    .map_err(|err| ScalerError::Api {
                        message: format!("unable to get deployment {deployment_name}: {err}"),
                    })?;

            let volumes = deployment
                .spec
                .as_mut()
                .and_then(|spec| spec.template.spec.as_mut())
                .and_then(|pod_spec| pod_spec.volumes.as_mut())
                .ok_or_else(|| ScalerError::Api {
                    message: format!("deployment {deployment_name} has no volumes to rewrite"),
                })?;
            let volume = volumes
                .iter_mut()
                .find(|volume| {
                    volume
                        .persistent_volume_claim
                        .as_ref()
                        .is_some_and(|claim| claim.claim_name == old_claim)
                })
                .ok_or_else(|| ScalerError::Api {
                    message: format!(
                        "no volume in deployment {deployment_name} references claim {old_claim}"
                    ),
                })?;
            if let Some(claim) = volume.persistent_volume_claim.as_mut() {
                claim.claim_name = new_claim.to_string();
            }

            match deployments
                .replace(deployment_name, &PostParams::default(), &deployment)
                .await
            {
                Ok(_) => {
                    info!(
                        deployment = deployment_name,
                        pvc = new_claim,
                        "updated deployment with replacement claim"
                    );
                    return Ok(());
                }
                Err(err) if is_conflict(&err) && attempt + 1 < CONFLICT_MAX_ATTEMPTS => {
                    attempt += 1;
                    let delay = CONFLICT_BACKOFF_BASE * 2u32.pow(attempt - 1);
                    debug!(
                        deployment = deployment_name,
                        attempt, "conflict while updating deployment, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    return Err(ScalerError::Api {
                        message: format!("update failed for deployment {deployment_name}: {err}"),
                    })
                }
            }
        }
    }

    async fn scale_deployment_with_retry(
        &self,
        namespace: &str,
        deployment: &str,
        scale_to: i32,
    ) -> Result<i32> {
        with_retries("scale deployment", || {
            self.scale_deployment(namespace, deployment, scale_to)
        })
        .await
    }

    /// Sets the replica count through the scale subresource and returns the
    /// count found before the change.
    async fn scale_deployment(
        &self,
        namespace: &str,
        deployment: &str,
        scale_to: i32,
    ) -> Result<i32> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let scale = deployments
            .get_scale(deployment)
            .await
            .map_err(|err| ScalerError::Api {
                message: format!("failed to get scale of deployment {deployment}: {err}"),
            })?;
        let original_scale = scale.spec.and_then(|spec| spec.replicas).unwrap_or(0);
        if original_scale == scale_to {
            info!(
                deployment,
                replicas = original_scale,
                "deployment already at the requested scale"
            );
        }

        let patch = serde_json::json!({ "spec": { "replicas": scale_to } });
        deployments
            .patch_scale(deployment, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|err| ScalerError::Api {
                message: format!("unable to scale deployment {deployment}: {err}"),
            })?;
        info!(
            namespace,
            deployment,
            from = original_scale,
            to = scale_to,
            "scaled deployment"
        );
        Ok(original_scale)
    }

    async fn annotate_deployment_with_retry(&self, namespace: &str, deployment: &str) -> Result<()> {
        with_retries("annotate deployment", || {
            self.annotate_deployment(namespace, deployment)
        })
        .await
    }

    /// Stamps the workload with the scaling timestamp so it is not picked
    /// up again before its interval has passed, failures included.
    async fn annotate_deployment(&self, namespace: &str, deployment_name: &str) -> Result<()> {
        let deployments: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let mut deployment =
            deployments
                .get(deployment_name)
                .await
                .map_err(|err| ScalerError::Api {
                    message: format!("failed to get deployment {deployment_name}: {err}"),
                })?;

        let last_scaled = Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true);
        deployment
            .metadata
            .annotations
            .get_or_insert_with(Default::default)
            .insert(ANNOTATION_LAST_SCALED.to_string(), last_scaled.clone());

        deployments
            .replace(deployment_name, &PostParams::default(), &deployment)
            .await
            .map_err(|err| ScalerError::Api {
                message: format!("failed to annotate deployment {deployment_name}: {err}"),
            })?;
        debug!(
            deployment = deployment_name,
            last_scaled = %last_scaled,
            "updated deployment with last scaling timestamp"
        );
        Ok(())
    }

    /// Post-run cleanup: for failed shrink entries roll back the replacement
    /// claim, for successful ones drop the original that nothing references
    /// anymore. Deletion failures are logged, never escalated.
    async fn cleanup(&self, namespace: &str, entries: &[PlanEntry]) {
        for entry in entries {
            if entry.skip_cleanup {
                continue;
            }
            if let Some(err) = entry.error.as_ref() {
                error!(
                    namespace,
                    pvc = %entry.pvc_name,
                    error = %err,
                    "disk scaling of claim failed"
                );
                if let Err(delete_err) = self.delete_pvc(namespace, &entry.resized_pvc_name).await {
                    error!(
                        namespace,
                        pvc = %entry.resized_pvc_name,
                        error = %delete_err,
                        "unable to delete claim created during the scaling operation"
                    );
                }
                continue;
            }
            if let Err(delete_err) = self.delete_pvc(namespace, &entry.pvc_name).await {
                error!(
                    namespace,
                    pvc = %entry.pvc_name,
                    error = %delete_err,
                    "unable to delete claim after the scaling operation"
                );
            }
        }
    }

    /// Deletes a claim and waits for the deletion event. A missing claim is
    /// success; a watch timeout is logged and tolerated.
    async fn delete_pvc(&self, namespace: &str, pvc_name: &str) -> Result<()> {
        let pvcs: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);

        let existing = match pvcs.get_opt(pvc_name).await {
            Ok(Some(pvc)) => pvc,
            Ok(None) => {
                debug!(pvc = pvc_name, "no claim found to delete");
                return Ok(());
            }
            Err(err) => {
                return Err(ScalerError::Api {
                    message: format!("unable to get persistent volume claim {pvc_name}: {err}"),
                })
            }
        };

        match pvcs.delete(pvc_name, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(err) if is_not_found(&err) => return Ok(()),
            Err(err) => {
                return Err(ScalerError::Api {
                    message: format!("unable to delete persistent volume claim {pvc_name}: {err}"),
                })
            }
        }

        let resource_version = existing.metadata.resource_version.unwrap_or_default();
        let outcome = watch::wait_for_event(
            &pvcs,
            pvc_name,
            &resource_version,
            SCALING_OPERATION_TIMEOUT,
            |event| matches!(event, WatchEvent::Deleted(_)),
        )
        .await?;
        if outcome == watch::WaitOutcome::Matched {
            debug!(pvc = pvc_name, "deleted persistent volume claim");
        } else {
            warn!(pvc = pvc_name, "timed out waiting for claim deletion");
        }
        Ok(())
    }
}

/// Bounded retry with a fixed pause, for operations where the failure mode
/// is infrastructure lag rather than contention.
async fn with_retries<T, Fut>(what: &str, mut attempt_fn: impl FnMut() -> Fut) -> Result<T>
where
    Fut: Future<Output = Result<T>>,
{
    let mut last_error = None;
    for attempt in 0..MAX_RETRIES {
        match attempt_fn().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                debug!(attempt, error = %err, "failed to {what}");
                last_error = Some(err);
                if attempt + 1 < MAX_RETRIES {
                    tokio::time::sleep(RETRY_DELAY).await;
                }
            }
        }
    }
    Err(last_error.unwrap_or_else(|| ScalerError::Api {
        message: format!("{what} failed after {MAX_RETRIES} attempts"),
    }))
}

/// Generates the replacement claim name. Claims this controller created
/// earlier get their previous random tail cut off first, so repeated
/// shrinks never grow the name.
fn new_pvc_name(pvc: &PersistentVolumeClaim) -> String {
    let name = pvc.metadata.name.as_deref().unwrap_or_default();
    let created_by_us = pvc
        .metadata
        .annotations
        .as_ref()
        .and_then(|annotations| annotations.get(PVC_ANNOTATION_CREATED_BY))
        .is_some_and(|value| !value.is_empty());

    let stem = if created_by_us && name.len() > NAME_SUFFIX_LEN + 1 {
        &name[..name.len() - (NAME_SUFFIX_LEN + 1)]
    } else {
        name
    };
    format!("{stem}-{}", random_suffix(NAME_SUFFIX_LEN))
}

fn random_suffix(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| NAME_SUFFIX_ALPHABET[rng.gen_range(0..NAME_SUFFIX_ALPHABET.len())] as char)
        .collect()
}

fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 404)
}

fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(response) if response.code == 409)
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn pvc(name: &str, created_by: Option<&str>) -> PersistentVolumeClaim {
        PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                annotations: created_by.map(|value| {
                    BTreeMap::from([(PVC_ANNOTATION_CREATED_BY.to_string(), value.to_string())])
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_random_suffix_is_label_compatible() {
        let suffix = random_suffix(NAME_SUFFIX_LEN);
        assert_eq!(suffix.len(), NAME_SUFFIX_LEN);
        assert!(suffix.bytes().all(|b| b.is_ascii_lowercase()));
    }

    #[test]
    fn test_new_pvc_name_appends_random_tail() {
        let name = new_pvc_name(&pvc("data", None));
        assert_eq!(name.len(), "data".len() + NAME_SUFFIX_LEN + 1);
        assert!(name.starts_with("data-"));
    }

    #[test]
    fn test_new_pvc_name_truncates_own_claims() {
        // A claim this controller created already ends in `-xxxxx`; the
        // regenerated name must not grow.
        let name = new_pvc_name(&pvc("data-abcde", Some(CONTROLLER_ID)));
        assert_eq!(name.len(), "data-abcde".len());
        assert!(name.starts_with("data-"));
    }

    #[test]
    fn test_new_pvc_name_is_stable_over_repeated_shrinks() {
        let first = new_pvc_name(&pvc("data", None));
        let second = new_pvc_name(&pvc(&first, Some(CONTROLLER_ID)));
        let third = new_pvc_name(&pvc(&second, Some(CONTROLLER_ID)));
        assert_eq!(first.len(), second.len());
        assert_eq!(second.len(), third.len());
    }

    #[test]
    fn test_error_code_classifiers() {
        let not_found = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "not found".to_string(),
            reason: "NotFound".to_string(),
            code: 404,
        });
        let conflict = kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "conflict".to_string(),
            reason: "Conflict".to_string(),
            code: 409,
        });
        assert!(is_not_found(&not_found));
        assert!(!is_not_found(&conflict));
        assert!(is_conflict(&conflict));
        assert!(!is_conflict(&not_found));
    }
}
