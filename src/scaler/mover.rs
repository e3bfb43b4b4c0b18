//! Transient data-mover pod: mounts the original and the replacement claim
//! side by side and copies the data across through an exec stream.

use k8s_openapi::api::core::v1::{
    Container, PersistentVolumeClaimVolumeSource, Pod, PodSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, AttachParams, DeleteParams, PostParams, PropagationPolicy, WatchEvent};
use kube::Client;
use tokio::io::AsyncReadExt;
use tracing::{debug, error};

use crate::error::{Result, ScalerError};
use crate::scaler::watch::{wait_for_event, WaitOutcome};
use crate::scaler::{is_not_found, MOVER_DELETE_TIMEOUT, SCALING_OPERATION_TIMEOUT};

const ORIGINAL_MOUNT_PATH: &str = "/oldData";
const REPLACEMENT_MOUNT_PATH: &str = "/newData";
const ORIGINAL_VOLUME_NAME: &str = "orig-vol-mount";
const REPLACEMENT_VOLUME_NAME: &str = "backup-vol-mount";

/// Skips the copy entirely when the source volume is empty; `cp -r` fails
/// on an empty glob.
const COPY_COMMAND: &str = r#"if [ -z "$(ls -A /oldData)" ]; then echo "directory is empty no need to copy"; else cp -r /oldData/* /newData/; fi"#;

/// Creates the mover pod, waits for it to reach `Running`, and copies the
/// data across. The pod is left for the caller to delete on every outcome.
pub(crate) async fn run_data_mover(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    original_pvc: &str,
    replacement_pvc: &str,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    let pod = build_mover_pod(pod_name, original_pvc, replacement_pvc);
    let created = pods
        .create(&PostParams::default(), &pod)
        .await
        .map_err(|err| ScalerError::CopyFailed {
            message: format!("failed to create data mover pod {pod_name} in namespace {namespace}: {err}"),
        })?;
    debug!(pod = pod_name, namespace, "created transient data mover pod");

    let resource_version = created.metadata.resource_version.unwrap_or_default();
    let outcome = wait_for_event(
        &pods,
        pod_name,
        &resource_version,
        SCALING_OPERATION_TIMEOUT,
        |event| match event {
            WatchEvent::Added(pod) | WatchEvent::Modified(pod) => {
                pod.status.as_ref().and_then(|status| status.phase.as_deref()) == Some("Running")
            }
            _ => false,
        },
    )
    .await?;
    if outcome != WaitOutcome::Matched {
        return Err(ScalerError::CopyFailed {
            message: format!(
                "timed out waiting for data mover pod {pod_name} in namespace {namespace} to reach Running"
            ),
        });
    }

    exec_copy(&pods, pod_name).await
}

/// Opens an exec stream against the mover pod and runs the copy command,
/// draining stdout and stderr into memory.
async fn exec_copy(pods: &Api<Pod>, pod_name: &str) -> Result<()> {
    let params = AttachParams::default().stdout(true).stderr(true);
    let mut attached = pods
        .exec(pod_name, ["/bin/sh", "-c", COPY_COMMAND], &params)
        .await
        .map_err(|err| ScalerError::CopyFailed {
            message: format!("failed to open exec stream on pod {pod_name}: {err}"),
        })?;

    let stdout_reader = attached.stdout();
    let stderr_reader = attached.stderr();
    let status = attached.take_status();
    let mut stdout = Vec::new();
    let mut stderr = Vec::new();
    // Drain both sides concurrently so neither can stall the stream.
    tokio::join!(
        async {
            if let Some(mut reader) = stdout_reader {
                let _ = reader.read_to_end(&mut stdout).await;
            }
        },
        async {
            if let Some(mut reader) = stderr_reader {
                let _ = reader.read_to_end(&mut stderr).await;
            }
        },
    );

    if let Some(status) = status {
        if let Some(status) = status.await {
            if status.status.as_deref() == Some("Failure") {
                return Err(ScalerError::CopyFailed {
                    message: format!(
                        "copy command failed on pod {pod_name}: {}, stderr: {}",
                        status.message.unwrap_or_default(),
                        String::from_utf8_lossy(&stderr).trim()
                    ),
                });
            }
        }
    }
    attached.join().await.map_err(|err| ScalerError::CopyFailed {
        message: format!(
            "exec stream on pod {pod_name} failed: {err}, stderr: {}",
            String::from_utf8_lossy(&stderr).trim()
        ),
    })?;

    debug!(
        pod = pod_name,
        output = %String::from_utf8_lossy(&stdout).trim(),
        "executed copy command on data mover pod"
    );
    Ok(())
}

/// Deletes the mover pod with foreground propagation. A failed copy forces
/// a zero grace period since the pod may be wedged. A deletion-watch timeout
/// is logged but not treated as failure; the delete was accepted.
pub(crate) async fn delete_mover_pod(
    client: &Client,
    namespace: &str,
    pod_name: &str,
    force: bool,
) -> Result<()> {
    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);

    let existing = match pods.get_opt(pod_name).await {
        Ok(Some(pod)) => pod,
        Ok(None) => {
            debug!(pod = pod_name, namespace, "data mover pod already gone");
            return Ok(());
        }
        Err(err) => {
            return Err(ScalerError::Api {
                message: format!("unable to get data mover pod {pod_name}: {err}"),
            })
        }
    };

    let mut delete_params = DeleteParams {
        propagation_policy: Some(PropagationPolicy::Foreground),
        ..Default::default()
    };
    if force {
        delete_params.grace_period_seconds = Some(0);
    }
    match pods.delete(pod_name, &delete_params).await {
        Ok(_) => {}
        Err(err) if is_not_found(&err) => return Ok(()),
        Err(err) => {
            return Err(ScalerError::Api {
                message: format!("failed to delete data mover pod {pod_name}: {err}"),
            })
        }
    }

    let resource_version = existing.metadata.resource_version.unwrap_or_default();
    let outcome = wait_for_event(
        &pods,
        pod_name,
        &resource_version,
        MOVER_DELETE_TIMEOUT,
        |event| matches!(event, WatchEvent::Deleted(_)),
    )
    .await?;
    if outcome == WaitOutcome::Matched {
        debug!(pod = pod_name, namespace, "deleted transient data mover pod");
    } else {
        error!(
            pod = pod_name,
            namespace, "timed out waiting for data mover pod deletion"
        );
    }
    Ok(())
}

fn build_mover_pod(pod_name: &str, original_pvc: &str, replacement_pvc: &str) -> Pod {
    Pod {
        metadata: ObjectMeta {
            name: Some(pod_name.to_string()),
            ..Default::default()
        },
        spec: Some(PodSpec {
            containers: vec![Container {
                name: "data-mover".to_string(),
                image: Some("ubuntu".to_string()),
                command: Some(vec![
                    "/bin/bash".to_string(),
                    "-c".to_string(),
                    "sleep infinity".to_string(),
                ]),
                volume_mounts: Some(vec![
                    VolumeMount {
                        name: ORIGINAL_VOLUME_NAME.to_string(),
                        mount_path: ORIGINAL_MOUNT_PATH.to_string(),
                        ..Default::default()
                    },
                    VolumeMount {
                        name: REPLACEMENT_VOLUME_NAME.to_string(),
                        mount_path: REPLACEMENT_MOUNT_PATH.to_string(),
                        ..Default::default()
                    },
                ]),
                ..Default::default()
            }],
            volumes: Some(vec![
                Volume {
                    name: ORIGINAL_VOLUME_NAME.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: original_pvc.to_string(),
                        read_only: None,
                    }),
                    ..Default::default()
                },
                Volume {
                    name: REPLACEMENT_VOLUME_NAME.to_string(),
                    persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                        claim_name: replacement_pvc.to_string(),
                        read_only: None,
                    }),
                    ..Default::default()
                },
            ]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mover_pod_mounts_both_claims() {
        let pod = build_mover_pod("kubecost-data-mover-pod-abcde", "pvc-b", "pvc-b-xxxxx");
        let spec = pod.spec.expect("pod spec");

        let volumes = spec.volumes.expect("volumes");
        let claims: Vec<_> = volumes
            .iter()
            .filter_map(|volume| volume.persistent_volume_claim.as_ref())
            .map(|claim| claim.claim_name.as_str())
            .collect();
        assert_eq!(claims, vec!["pvc-b", "pvc-b-xxxxx"]);

        let container = &spec.containers[0];
        let mounts = container.volume_mounts.as_ref().expect("volume mounts");
        let paths: Vec<_> = mounts.iter().map(|mount| mount.mount_path.as_str()).collect();
        assert_eq!(paths, vec![ORIGINAL_MOUNT_PATH, REPLACEMENT_MOUNT_PATH]);
        // The mover idles until the exec stream runs the copy.
        assert_eq!(
            container.command.as_deref(),
            Some(&["/bin/bash".to_string(), "-c".to_string(), "sleep infinity".to_string()][..])
        );
    }

    #[test]
    fn test_copy_command_handles_empty_source() {
        assert!(COPY_COMMAND.starts_with(r#"if [ -z "$(ls -A /oldData)" ]"#));
        assert!(COPY_COMMAND.contains("cp -r /oldData/* /newData/"));
    }
}
