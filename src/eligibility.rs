//! Opt-in and re-run gating for workloads.
//!
//! A workload participates when its namespace is allowed and it carries the
//! opt-in annotation (or resize-all mode is active and it is not opted out).
//! It is eligible for another run once its last scaling lies further back
//! than its configured interval.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use regex::Regex;

use crate::error::{Result, ScalerError};

pub const ANNOTATION_ENABLED: &str = "request.autodiskscaling.kubecost.com/enabled";
pub const ANNOTATION_EXCLUDED: &str = "request.autodiskscaling.kubecost.com/excluded";
pub const ANNOTATION_LAST_SCALED: &str = "request.autodiskscaling.kubecost.com/lastScaled";
pub const ANNOTATION_INTERVAL: &str = "request.autodiskscaling.kubecost.com/interval";
pub const ANNOTATION_TARGET_UTILIZATION: &str =
    "request.autodiskscaling.kubecost.com/targetUtilization";

/// Minimum spacing between two runs on the same workload. Cloud block
/// storage typically refuses a second expansion within six hours of the
/// previous one, hence the seven hour floor.
pub const DEFAULT_INTERVAL: &str = "7h";
pub const DEFAULT_TARGET_UTILIZATION: u32 = 70;

pub struct EligibilityPolicy {
    resize_all: bool,
    excluded_namespaces: Regex,
}

impl EligibilityPolicy {
    /// Compiles the namespace exclusion pattern from regex alternatives.
    pub fn new(resize_all: bool, excluded_namespaces: &[String]) -> Result<Self> {
        let pattern = excluded_namespaces.join("|");
        let excluded_namespaces = Regex::new(&pattern).map_err(|err| ScalerError::Config {
            message: format!("invalid excluded-namespaces pattern {pattern:?}: {err}"),
        })?;
        Ok(Self {
            resize_all,
            excluded_namespaces,
        })
    }

    /// Returns an error when the namespace must never be touched.
    pub fn ensure_namespace_allowed(&self, namespace: &str) -> Result<()> {
        if namespace == "kube-system" || self.excluded_namespaces.is_match(namespace) {
            return Err(ScalerError::Validation {
                message: format!("namespace {namespace} is not eligible for disk autoscaling"),
            });
        }
        Ok(())
    }

    /// Whether the workload has opted into disk autoscaling. Keyed off
    /// object metadata so it stays generic over the workload kind.
    pub fn workload_is_enabled(&self, meta: &ObjectMeta) -> bool {
        let namespace = meta.namespace.as_deref().unwrap_or_default();
        // Never resize the control plane, even under resize-all.
        if namespace == "kube-system" {
            return false;
        }
        if self.excluded_namespaces.is_match(namespace) {
            return false;
        }

        let annotation = |key: &str| {
            meta.annotations
                .as_ref()
                .and_then(|annotations| annotations.get(key))
                .map(String::as_str)
        };
        let excluded = annotation(ANNOTATION_EXCLUDED) == Some("true");
        if self.resize_all {
            return !excluded;
        }
        if excluded {
            return false;
        }
        annotation(ANNOTATION_ENABLED) == Some("true")
    }

    /// Whether enough time has passed since the workload was last scaled.
    /// An unparseable timestamp or interval makes the workload ineligible
    /// rather than guessing.
    pub fn workload_is_eligible(&self, meta: &ObjectMeta, now: DateTime<Utc>) -> bool {
        let namespace = meta.namespace.as_deref().unwrap_or_default();
        if namespace == "kube-system" {
            return false;
        }

        let annotation = |key: &str| {
            meta.annotations
                .as_ref()
                .and_then(|annotations| annotations.get(key))
                .map(String::as_str)
                .filter(|value| !value.is_empty())
        };

        // Seen for the first time.
        let Some(raw_last_scaled) = annotation(ANNOTATION_LAST_SCALED) else {
            return true;
        };
        let Ok(last_scaled) = DateTime::parse_from_rfc3339(raw_last_scaled) else {
            return false;
        };

        let raw_interval = annotation(ANNOTATION_INTERVAL).unwrap_or(DEFAULT_INTERVAL);
        let Ok(interval) = humantime::parse_duration(raw_interval) else {
            return false;
        };
        let Ok(interval) = chrono::Duration::from_std(interval) else {
            return false;
        };

        last_scaled.with_timezone(&Utc) < now - interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn policy(resize_all: bool) -> EligibilityPolicy {
        EligibilityPolicy::new(resize_all, &["kubecost".to_string(), "^ops-.*".to_string()])
            .unwrap()
    }

    fn meta(namespace: &str, annotations: &[(&str, &str)]) -> ObjectMeta {
        ObjectMeta {
            namespace: Some(namespace.to_string()),
            annotations: Some(
                annotations
                    .iter()
                    .map(|(key, value)| (key.to_string(), value.to_string()))
                    .collect::<BTreeMap<_, _>>(),
            ),
            ..Default::default()
        }
    }

    #[test]
    fn test_enabled_requires_opt_in() {
        let policy = policy(false);
        assert!(policy.workload_is_enabled(&meta("ns1", &[(ANNOTATION_ENABLED, "true")])));
        assert!(!policy.workload_is_enabled(&meta("ns1", &[(ANNOTATION_ENABLED, "false")])));
        assert!(!policy.workload_is_enabled(&meta("ns1", &[])));
    }

    #[test]
    fn test_enabled_excluded_annotation_wins() {
        let policy = policy(false);
        let meta = meta(
            "ns1",
            &[(ANNOTATION_ENABLED, "true"), (ANNOTATION_EXCLUDED, "true")],
        );
        assert!(!policy.workload_is_enabled(&meta));
    }

    #[test]
    fn test_enabled_never_in_kube_system_or_excluded_namespaces() {
        let policy = policy(true);
        assert!(!policy.workload_is_enabled(&meta("kube-system", &[(ANNOTATION_ENABLED, "true")])));
        assert!(!policy.workload_is_enabled(&meta("kubecost", &[(ANNOTATION_ENABLED, "true")])));
        assert!(!policy.workload_is_enabled(&meta("ops-tools", &[(ANNOTATION_ENABLED, "true")])));
    }

    #[test]
    fn test_enabled_resize_all_skips_opt_in() {
        let policy = policy(true);
        assert!(policy.workload_is_enabled(&meta("ns1", &[])));
        assert!(!policy.workload_is_enabled(&meta("ns1", &[(ANNOTATION_EXCLUDED, "true")])));
    }

    #[test]
    fn test_eligible_on_first_sight() {
        let policy = policy(false);
        assert!(policy.workload_is_eligible(&meta("ns1", &[]), Utc::now()));
    }

    #[test]
    fn test_eligible_after_interval_elapsed() {
        let policy = policy(false);
        let now = Utc::now();
        let eight_hours_ago = (now - chrono::Duration::hours(8)).to_rfc3339();
        let one_hour_ago = (now - chrono::Duration::hours(1)).to_rfc3339();

        assert!(policy.workload_is_eligible(
            &meta("ns1", &[(ANNOTATION_LAST_SCALED, eight_hours_ago.as_str())]),
            now
        ));
        assert!(!policy.workload_is_eligible(
            &meta("ns1", &[(ANNOTATION_LAST_SCALED, one_hour_ago.as_str())]),
            now
        ));
    }

    #[test]
    fn test_eligible_honors_interval_annotation() {
        let policy = policy(false);
        let now = Utc::now();
        let two_hours_ago = (now - chrono::Duration::hours(2)).to_rfc3339();
        let meta = meta(
            "ns1",
            &[
                (ANNOTATION_LAST_SCALED, two_hours_ago.as_str()),
                (ANNOTATION_INTERVAL, "1h"),
            ],
        );
        assert!(policy.workload_is_eligible(&meta, now));
    }

    #[test]
    fn test_eligible_false_on_parse_failures() {
        let policy = policy(false);
        let now = Utc::now();
        let eight_hours_ago = (now - chrono::Duration::hours(8)).to_rfc3339();

        assert!(!policy.workload_is_eligible(
            &meta("ns1", &[(ANNOTATION_LAST_SCALED, "not-a-timestamp")]),
            now
        ));
        assert!(!policy.workload_is_eligible(
            &meta(
                "ns1",
                &[
                    (ANNOTATION_LAST_SCALED, eight_hours_ago.as_str()),
                    (ANNOTATION_INTERVAL, "soon"),
                ]
            ),
            now
        ));
    }

    #[test]
    fn test_eligible_never_in_kube_system() {
        let policy = policy(false);
        assert!(!policy.workload_is_eligible(&meta("kube-system", &[]), Utc::now()));
    }

    #[test]
    fn test_namespace_allowed() {
        let policy = policy(false);
        assert!(policy.ensure_namespace_allowed("ns1").is_ok());
        assert!(policy.ensure_namespace_allowed("kube-system").is_err());
        assert!(policy.ensure_namespace_allowed("ops-tools").is_err());
    }
}
