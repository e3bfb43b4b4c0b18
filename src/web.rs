//! Admission surface: two HTTP endpoints operators use to opt a workload in
//! or out of disk autoscaling. Every failure surfaces as a 500 with a
//! textual body.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tracing::info;

use crate::eligibility::DEFAULT_INTERVAL;
use crate::error::{Result, ScalerError};
use crate::service::ScalerService;

#[derive(Debug, Deserialize)]
pub struct EnableParams {
    namespace: Option<String>,
    deployment: Option<String>,
    interval: Option<String>,
    #[serde(rename = "targetUtilization")]
    target_utilization: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ExcludeParams {
    namespace: Option<String>,
    deployment: Option<String>,
}

pub fn admission_router(service: Arc<ScalerService>) -> Router {
    Router::new()
        .route("/diskAutoScaler/enable", get(enable_handler))
        .route("/diskAutoScaler/exclude", get(exclude_handler))
        .with_state(service)
}

/// Binds the admission listener and serves until the process exits.
pub async fn serve(service: Arc<ScalerService>, port: u16) -> Result<()> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|err| ScalerError::Config {
            message: format!("failed to bind admission listener on {addr}: {err}"),
        })?;
    info!(%addr, "admission endpoints listening");
    axum::serve(listener, admission_router(service))
        .await
        .map_err(|err| ScalerError::Api {
            message: format!("admission server failed: {err}"),
        })
}

async fn enable_handler(
    State(service): State<Arc<ScalerService>>,
    Query(params): Query<EnableParams>,
) -> std::result::Result<StatusCode, (StatusCode, String)> {
    let namespace = required(params.namespace, "namespace")?;
    let deployment = required(params.deployment, "deployment")?;

    let interval = params
        .interval
        .filter(|value| !value.is_empty())
        .unwrap_or_else(|| DEFAULT_INTERVAL.to_string());
    humantime::parse_duration(&interval)
        .map_err(|err| internal(format!("interval duration parsing failed: {err}")))?;

    let target_utilization = params.target_utilization.unwrap_or_default();
    target_utilization
        .parse::<u32>()
        .map_err(|err| internal(format!("targetUtilization parsing failed: {err}")))?;

    service
        .enable_deployment(&namespace, &deployment, &interval, &target_utilization)
        .await
        .map_err(|err| {
            internal(format!(
                "unable to annotate namespace: {namespace}, deployment: {deployment}: {err}"
            ))
        })?;
    Ok(StatusCode::OK)
}

async fn exclude_handler(
    State(service): State<Arc<ScalerService>>,
    Query(params): Query<ExcludeParams>,
) -> std::result::Result<StatusCode, (StatusCode, String)> {
    let namespace = required(params.namespace, "namespace")?;
    let deployment = required(params.deployment, "deployment")?;

    service
        .exclude_deployment(&namespace, &deployment)
        .await
        .map_err(|err| {
            internal(format!(
                "unable to annotate namespace: {namespace}, deployment: {deployment}: {err}"
            ))
        })?;
    Ok(StatusCode::OK)
}

fn required(
    value: Option<String>,
    name: &str,
) -> std::result::Result<String, (StatusCode, String)> {
    value
        .filter(|value| !value.is_empty())
        .ok_or_else(|| internal(format!("{name} is empty")))
}

fn internal(message: String) -> (StatusCode, String) {
    (StatusCode::INTERNAL_SERVER_ERROR, message)
}
