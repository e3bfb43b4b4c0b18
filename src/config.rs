//! Environment-sourced controller configuration.
//!
//! All settings come from `DAS_`-prefixed environment variables, with `-`
//! translated to `_` in the variable name.

use tracing::{debug, warn};

use crate::error::{Result, ScalerError};

const ENV_PREFIX: &str = "DAS";

/// Namespace the controller itself runs in. Always excluded from scaling; an
/// install in a different namespace must add it via `DAS_EXCLUDE_NAMESPACES`.
pub const CONTROLLER_NAMESPACE: &str = "kubecost";

/// Default TCP port of the admission endpoints.
pub const DEFAULT_LISTEN_PORT: u16 = 9730;

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Base URL of the sizing-advisor cost model, without trailing slash.
    pub advisor_base_url: String,
    /// Explicit kubeconfig path when not running in-cluster.
    pub kubeconfig_path: Option<String>,
    /// When true, act on every non-excluded workload instead of opt-in only.
    pub resize_all: bool,
    /// Regex alternatives for namespaces that must never be resized.
    pub excluded_namespaces: Vec<String>,
    /// Port for the admission HTTP surface.
    pub listen_port: u16,
}

impl ControllerConfig {
    pub fn from_env() -> Result<Self> {
        let advisor_base_url = env_value("cost-model-path").ok_or_else(|| ScalerError::Config {
            message: format!(
                "a cost-model HTTP base path is required. Set with {ENV_PREFIX}_COST_MODEL_PATH, \
                 example: {ENV_PREFIX}_COST_MODEL_PATH=http://localhost:9090/model"
            ),
        })?;

        let mut resize_all = env_value("resize-all")
            .map(|raw| raw == "true" || raw == "1")
            .unwrap_or(false);
        if resize_all {
            // Experimental safeguard carried over from the initial rollout.
            warn!("disk autoscaling is experimental, resize-all is overridden to false");
            resize_all = false;
        }

        let mut excluded_namespaces: Vec<String> = env_value("exclude-namespaces")
            .map(|raw| raw.split(',').map(str::to_string).collect())
            .unwrap_or_default();
        if !excluded_namespaces.iter().any(|ns| ns == CONTROLLER_NAMESPACE) {
            excluded_namespaces.push(CONTROLLER_NAMESPACE.to_string());
        }
        debug!(?excluded_namespaces, "namespaces excluded from disk autoscaling");

        Ok(Self {
            advisor_base_url,
            kubeconfig_path: env_value("kubeconfig"),
            resize_all,
            excluded_namespaces,
            listen_port: DEFAULT_LISTEN_PORT,
        })
    }
}

fn env_value(key: &str) -> Option<String> {
    let name = format!("{ENV_PREFIX}_{}", key.replace('-', "_").to_uppercase());
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;

    // Single test so the process-wide environment is touched from one place.
    #[test]
    fn test_from_env() {
        std::env::remove_var("DAS_COST_MODEL_PATH");
        std::env::remove_var("DAS_EXCLUDE_NAMESPACES");
        std::env::remove_var("DAS_RESIZE_ALL");
        assert!(ControllerConfig::from_env().is_err());

        std::env::set_var("DAS_COST_MODEL_PATH", "http://localhost:9090/model");
        std::env::set_var("DAS_EXCLUDE_NAMESPACES", "monitoring,^ops-.*");
        std::env::set_var("DAS_RESIZE_ALL", "true");

        let config = ControllerConfig::from_env().expect("config should load");
        assert_eq!(config.advisor_base_url, "http://localhost:9090/model");
        // Forced off while the feature is experimental.
        assert!(!config.resize_all);
        assert_eq!(
            config.excluded_namespaces,
            vec!["monitoring", "^ops-.*", CONTROLLER_NAMESPACE]
        );
        assert_eq!(config.listen_port, DEFAULT_LISTEN_PORT);

        std::env::remove_var("DAS_COST_MODEL_PATH");
        std::env::remove_var("DAS_EXCLUDE_NAMESPACES");
        std::env::remove_var("DAS_RESIZE_ALL");
    }
}
