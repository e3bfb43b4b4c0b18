//! Error taxonomy of the disk autoscaler.

pub type Result<T, E = ScalerError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum ScalerError {
    /// Bootstrap-time failure. Terminal: the process exits non-zero.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// Transient cluster API failure, surfaced after retries are exhausted.
    #[error("cluster API error: {message}")]
    Api { message: String },

    /// Unsupported provisioner, binding mode, volume source or host-path PV.
    /// Never retried; fatal to the whole workflow.
    #[error("{message}")]
    Validation { message: String },

    #[error("sizing advisor unavailable: {message}")]
    AdvisorUnavailable { message: String },

    #[error("sizing advisor returned a malformed response: {message}")]
    AdvisorMalformed { message: String },

    /// The advisor answered but has no usable data for the volume yet.
    #[error("sizing advisor has no usable recommendation for volume {volume}")]
    NoRecommendation { volume: String },

    /// Mover-pod readiness timeout or exec-stream failure. Fatal to one PVC,
    /// triggers forced mover deletion and rollback of the replacement claim.
    #[error("data copy failed: {message}")]
    CopyFailed { message: String },

    #[error("failed to scale persistent volume claims {} in deployment {deployment} of namespace {namespace}", .failed_pvcs.join(","))]
    PartialFailure {
        namespace: String,
        deployment: String,
        failed_pvcs: Vec<String>,
    },

    #[error("failed to scale all persistent volume claims in deployment {deployment} of namespace {namespace}")]
    AllFailed { namespace: String, deployment: String },
}
