//! Client for the external sizing-advisor service.
//!
//! Wraps the advisor's persistent-volume sizing endpoint with a
//! time-windowed response cache, converts the target-utilization percentage
//! into the overhead parameter the advisor expects, and rounds recommended
//! byte counts up to whole storage units.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, trace};

use crate::error::{Result, ScalerError};
use crate::quantity::StorageQuantity;

const ONE_GI_BYTES: f64 = 1024.0 * 1024.0 * 1024.0;
const EQUALITY_THRESHOLD: f64 = 1e-5;
const CACHE_REFRESH: Duration = Duration::from_secs(10 * 60);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
/// A target utilization of 0 means "unset" and falls back to this.
const FALLBACK_TARGET_UTILIZATION: u32 = 70;

/// Seam between the workflow engine and the advisor, so workflows can be
/// exercised against a stub.
#[async_trait]
pub trait SizingAdvisor: Send + Sync {
    /// Looks up the recommended capacity for `pv_name` over the given window.
    async fn recommendation(
        &self,
        pv_name: &str,
        target_utilization: u32,
        window: &str,
    ) -> Result<SizingRecommendation>;

    /// Returns `Ok` if the advisor endpoint is reachable at all.
    async fn check_available(&self) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct SizingRecommendation {
    pub size: StorageQuantity,
    pub savings_monthly: f64,
}

#[derive(Debug, Deserialize)]
struct RecommendationResponse {
    #[serde(default)]
    recommendations: Vec<VolumeRecommendation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct VolumeRecommendation {
    #[serde(default)]
    volume_name: String,
    #[serde(default)]
    average_usage_bytes: f64,
    #[serde(default)]
    current_capacity_bytes: f64,
    #[serde(default)]
    recommended_capacity_bytes: f64,
    #[serde(default)]
    savings_monthly: f64,
}

pub struct AdvisorClient {
    recommendation_url: String,
    http: reqwest::Client,
    /// Raw response bodies keyed by window string. A single fleet-wide target
    /// utilization is assumed, so the overhead percent is sent on the wire
    /// but does not partition the cache.
    cache: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl AdvisorClient {
    /// Builds a client against the advisor base URL and starts the
    /// background task that flushes the response cache every ten minutes.
    pub fn new(base_url: &str) -> Result<Self> {
        let base = base_url.trim_end_matches('/');
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|err| ScalerError::Config {
                message: format!("failed to build advisor HTTP client: {err}"),
            })?;

        let cache = Arc::new(Mutex::new(HashMap::new()));
        let flushed = Arc::clone(&cache);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(CACHE_REFRESH);
            loop {
                ticker.tick().await;
                trace!("flushing cached advisor responses");
                flushed.lock().await.clear();
            }
        });

        Ok(Self {
            recommendation_url: format!("{base}/savings/persistentVolumeSizing"),
            http,
            cache,
        })
    }

    async fn cached_or_fetch(&self, window: &str, overhead_percent: &str) -> Result<Vec<u8>> {
        let mut cache = self.cache.lock().await;
        if let Some(body) = cache.get(window) {
            return Ok(body.clone());
        }

        let request = self
            .http
            .get(&self.recommendation_url)
            .query(&[("window", window), ("overheadPercent", overhead_percent)]);
        debug!(window, overhead_percent, "requesting volume sizing recommendations");

        let response = request
            .send()
            .await
            .map_err(|err| ScalerError::AdvisorUnavailable {
                message: format!("executing recommendation query: {err}"),
            })?;
        let status = response.status();
        let body = response
            .bytes()
            .await
            .map_err(|err| ScalerError::AdvisorUnavailable {
                message: format!("reading recommendation response body: {err}"),
            })?;
        if !status.is_success() {
            return Err(ScalerError::AdvisorUnavailable {
                message: format!(
                    "non-OK response status ({status}), body: {}",
                    String::from_utf8_lossy(&body)
                ),
            });
        }

        cache.insert(window.to_string(), body.to_vec());
        Ok(body.to_vec())
    }
}

#[async_trait]
impl SizingAdvisor for AdvisorClient {
    async fn recommendation(
        &self,
        pv_name: &str,
        target_utilization: u32,
        window: &str,
    ) -> Result<SizingRecommendation> {
        let overhead = overhead_percent_for_target(target_utilization);
        let body = self.cached_or_fetch(window, &overhead).await?;

        let response: RecommendationResponse =
            serde_json::from_slice(&body).map_err(|err| ScalerError::AdvisorMalformed {
                message: format!("unable to parse recommendation response: {err}"),
            })?;

        let mut recommended_bytes = 0.0;
        let mut savings_monthly = 0.0;
        for entry in &response.recommendations {
            if entry.volume_name == pv_name {
                recommended_bytes = entry.recommended_capacity_bytes;
                savings_monthly = entry.savings_monthly;
                trace!(
                    volume = pv_name,
                    average_usage_bytes = entry.average_usage_bytes,
                    current_capacity_bytes = entry.current_capacity_bytes,
                    "matched advisor entry"
                );
            }
        }

        // The volume exists but the advisor has not received usage data yet.
        if almost_equal(recommended_bytes, 0.0) {
            return Err(ScalerError::NoRecommendation {
                volume: pv_name.to_string(),
            });
        }

        // 1Gi is the smallest block size cloud provisioners will hand out.
        if recommended_bytes < ONE_GI_BYTES {
            debug!(
                volume = pv_name,
                recommended_bytes, "recommendation below 1Gi, clamping to the provisioning minimum"
            );
            return Ok(SizingRecommendation {
                size: StorageQuantity::parse("1Gi")?,
                savings_monthly,
            });
        }

        Ok(SizingRecommendation {
            size: round_bytes_to_quantity(recommended_bytes)?,
            savings_monthly,
        })
    }

    async fn check_available(&self) -> Result<()> {
        let response = self
            .http
            .get(&self.recommendation_url)
            .send()
            .await
            .map_err(|err| ScalerError::AdvisorUnavailable {
                message: format!("executing availability probe: {err}"),
            })?;

        // A 400 is acceptable: the probe is not a valid query, it only has
        // to show that the endpoint exists.
        if response.status().as_u16() == 404 {
            return Err(ScalerError::AdvisorUnavailable {
                message: format!("probe returned status {}", response.status()),
            });
        }
        Ok(())
    }
}

/// Rounds a byte recommendation up to the next whole storage unit. A
/// fractional request fails claim creation even though the cluster would
/// round it the same way.
fn round_bytes_to_quantity(bytes: f64) -> Result<StorageQuantity> {
    let mut value = bytes / ONE_GI_BYTES;
    for unit in ["Gi", "Ti", "Pi", "Ei", "Zi", "Yi"] {
        if value < 1024.0 {
            return StorageQuantity::parse(&format!("{}{unit}", value.ceil() as u128));
        }
        value /= 1024.0;
    }
    Err(ScalerError::AdvisorMalformed {
        message: format!("recommended capacity of {bytes} bytes is out of range"),
    })
}

/// Converts a target utilization into the overhead percentage the advisor
/// takes: filling to 70% means asking for (100 - 70) / 70 extra capacity.
fn overhead_percent_for_target(target_utilization: u32) -> String {
    let target = if target_utilization == 0 {
        FALLBACK_TARGET_UTILIZATION
    } else {
        target_utilization
    } as f64;
    format!("{:.2}", (100.0 - target) / target * 100.0)
}

fn almost_equal(a: f64, b: f64) -> bool {
    (a - b).abs() <= EQUALITY_THRESHOLD
}

#[cfg(test)]
mod tests {
    use super::*;

    fn recommendation_body() -> String {
        serde_json::json!({
            "recommendations": [
                {
                    "volumeName": "pv-abc",
                    "averageUsageBytes": 4.0 * ONE_GI_BYTES,
                    "currentCapacityBytes": 50.0 * ONE_GI_BYTES,
                    "recommendedCapacityBytes": 7.2 * ONE_GI_BYTES,
                    "savingsMonthly": 12.5
                },
                {
                    "volumeName": "pv-empty",
                    "recommendedCapacityBytes": 0.0,
                    "savingsMonthly": 0.0
                }
            ]
        })
        .to_string()
    }

    #[test]
    fn test_overhead_percent_for_target() {
        assert_eq!(overhead_percent_for_target(70), "42.86");
        assert_eq!(overhead_percent_for_target(50), "100.00");
        // Zero means unset and falls back to 70.
        assert_eq!(overhead_percent_for_target(0), overhead_percent_for_target(70));
    }

    #[test]
    fn test_almost_equal_threshold() {
        assert!(almost_equal(0.0, 0.0));
        assert!(almost_equal(2.0, 2.0 + EQUALITY_THRESHOLD / 10.0));
        assert!(!almost_equal(1.0, 1.0 + EQUALITY_THRESHOLD * 10.0));
        assert!(!almost_equal(2.0, 5.0));
    }

    #[test]
    fn test_round_bytes_to_quantity() {
        let cases = [
            (1.0 * ONE_GI_BYTES, "1Gi"),
            (1.2 * ONE_GI_BYTES, "2Gi"),
            (1.7 * ONE_GI_BYTES, "2Gi"),
            (1024.0 * ONE_GI_BYTES, "1Ti"),
            (1025.0 * ONE_GI_BYTES, "2Ti"),
        ];
        for (bytes, expected) in cases {
            let rounded = round_bytes_to_quantity(bytes).unwrap();
            let expected = StorageQuantity::parse(expected).unwrap();
            assert_eq!(rounded, expected, "rounding {bytes} bytes");
        }
    }

    #[tokio::test]
    async fn test_recommendation_rounds_and_carries_savings() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/savings/persistentVolumeSizing")
            .match_query(mockito::Matcher::AllOf(vec![
                mockito::Matcher::UrlEncoded("window".into(), "7h".into()),
                mockito::Matcher::UrlEncoded("overheadPercent".into(), "42.86".into()),
            ]))
            .with_status(200)
            .with_body(recommendation_body())
            .create_async()
            .await;

        let advisor = AdvisorClient::new(&server.url()).unwrap();
        let rec = advisor.recommendation("pv-abc", 70, "7h").await.unwrap();
        assert_eq!(rec.size, StorageQuantity::parse("8Gi").unwrap());
        assert_eq!(rec.savings_monthly, 12.5);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_recommendation_cache_hits_within_window() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/savings/persistentVolumeSizing")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(recommendation_body())
            .expect(1)
            .create_async()
            .await;

        let advisor = AdvisorClient::new(&server.url()).unwrap();
        advisor.recommendation("pv-abc", 70, "7h").await.unwrap();
        advisor.recommendation("pv-abc", 70, "7h").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_recommendation_without_usage_data() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/savings/persistentVolumeSizing")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body(recommendation_body())
            .create_async()
            .await;

        let advisor = AdvisorClient::new(&server.url()).unwrap();
        let err = advisor.recommendation("pv-empty", 70, "7h").await.unwrap_err();
        assert!(matches!(err, ScalerError::NoRecommendation { .. }), "{err}");

        // Same window, so the cached body answers for unknown volumes too.
        let err = advisor.recommendation("pv-unknown", 70, "7h").await.unwrap_err();
        assert!(matches!(err, ScalerError::NoRecommendation { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_recommendation_malformed_body() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/savings/persistentVolumeSizing")
            .match_query(mockito::Matcher::Any)
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let advisor = AdvisorClient::new(&server.url()).unwrap();
        let err = advisor.recommendation("pv-abc", 70, "7h").await.unwrap_err();
        assert!(matches!(err, ScalerError::AdvisorMalformed { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_recommendation_non_ok_status() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/savings/persistentVolumeSizing")
            .match_query(mockito::Matcher::Any)
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let advisor = AdvisorClient::new(&server.url()).unwrap();
        let err = advisor.recommendation("pv-abc", 70, "7h").await.unwrap_err();
        assert!(matches!(err, ScalerError::AdvisorUnavailable { .. }), "{err}");
    }

    #[tokio::test]
    async fn test_check_available() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/savings/persistentVolumeSizing")
            .with_status(400)
            .create_async()
            .await;
        let advisor = AdvisorClient::new(&server.url()).unwrap();
        // Any status but 404 means the endpoint exists.
        assert!(advisor.check_available().await.is_ok());

        let mut missing_server = mockito::Server::new_async().await;
        let _missing = missing_server
            .mock("GET", "/savings/persistentVolumeSizing")
            .with_status(404)
            .create_async()
            .await;
        let advisor = AdvisorClient::new(&missing_server.url()).unwrap();
        assert!(advisor.check_available().await.is_err());
    }
}
