//! Per-claim resize plan assembled during discovery and mutated while the
//! workflow executes.

use k8s_openapi::api::core::v1::PersistentVolumeClaimSpec;

use crate::error::{Result, ScalerError};
use crate::quantity::StorageQuantity;

/// One persistent volume claim of the workload, with everything the
/// workflow needs to resize it and the outcome it accumulated so far.
#[derive(Debug)]
pub(crate) struct PlanEntry {
    pub pvc_name: String,
    pub pv_name: String,
    pub current_size: StorageQuantity,
    pub resize_to: StorageQuantity,
    pub storage_class: String,
    pub provisioner: String,
    pub allow_expansion: bool,
    /// Snapshot of the original claim spec, reused for the replacement claim.
    pub spec: PersistentVolumeClaimSpec,
    /// Pre-generated name for the replacement claim on the shrink path.
    pub resized_pvc_name: String,
    /// First error this entry ran into; set once, siblings keep executing.
    pub error: Option<ScalerError>,
    /// No claim may be deleted for this entry (no-op or in-place expansion).
    pub skip_cleanup: bool,
}

/// Collapses per-entry outcomes into the workflow result: success when no
/// entry failed, all-failed when every one did, otherwise a partial failure
/// naming the original claims that did not make it.
pub(crate) fn plan_outcome(namespace: &str, deployment: &str, entries: &[PlanEntry]) -> Result<()> {
    let failed_pvcs: Vec<String> = entries
        .iter()
        .filter(|entry| entry.error.is_some())
        .map(|entry| entry.pvc_name.clone())
        .collect();

    if failed_pvcs.is_empty() {
        return Ok(());
    }
    if failed_pvcs.len() == entries.len() {
        return Err(ScalerError::AllFailed {
            namespace: namespace.to_string(),
            deployment: deployment.to_string(),
        });
    }
    Err(ScalerError::PartialFailure {
        namespace: namespace.to_string(),
        deployment: deployment.to_string(),
        failed_pvcs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pvc_name: &str, failed: bool) -> PlanEntry {
        PlanEntry {
            pvc_name: pvc_name.to_string(),
            pv_name: format!("pv-{pvc_name}"),
            current_size: StorageQuantity::parse("50Gi").unwrap(),
            resize_to: StorageQuantity::parse("8Gi").unwrap(),
            storage_class: "gp3".to_string(),
            provisioner: "ebs.csi.aws.com".to_string(),
            allow_expansion: true,
            spec: PersistentVolumeClaimSpec::default(),
            resized_pvc_name: format!("{pvc_name}-abcde"),
            error: failed.then(|| ScalerError::CopyFailed {
                message: "copy timed out".to_string(),
            }),
            skip_cleanup: false,
        }
    }

    #[test]
    fn test_outcome_success() {
        let entries = [entry("pvc-a", false), entry("pvc-b", false)];
        assert!(plan_outcome("ns1", "app", &entries).is_ok());
    }

    #[test]
    fn test_outcome_empty_plan_is_success() {
        assert!(plan_outcome("ns1", "app", &[]).is_ok());
    }

    #[test]
    fn test_outcome_partial_failure_names_failed_claims() {
        let entries = [entry("pvc-a", false), entry("pvc-b", true)];
        let err = plan_outcome("ns1", "app", &entries).unwrap_err();
        match err {
            ScalerError::PartialFailure { failed_pvcs, .. } => {
                assert_eq!(failed_pvcs, vec!["pvc-b"]);
            }
            other => panic!("expected partial failure, got {other}"),
        }
    }

    #[test]
    fn test_outcome_all_failed() {
        let entries = [entry("pvc-a", true), entry("pvc-b", true)];
        let err = plan_outcome("ns1", "app", &entries).unwrap_err();
        assert!(matches!(err, ScalerError::AllFailed { .. }), "{err}");
    }
}
