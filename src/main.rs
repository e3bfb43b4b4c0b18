//! Disk autoscaler entry point: logging, configuration, cluster client,
//! scaling loop, admission server. Any failure here terminates the process
//! with a non-zero exit code.

use std::sync::Arc;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::Client;
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use disk_autoscaler::advisor::AdvisorClient;
use disk_autoscaler::config::ControllerConfig;
use disk_autoscaler::scaler::DiskScaler;
use disk_autoscaler::service::ScalerService;
use disk_autoscaler::web;
use disk_autoscaler::ScalerError;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let filter = std::env::var("DAS_LOG_LEVEL")
        .ok()
        .filter(|level| !level.is_empty())
        .and_then(|level| EnvFilter::try_new(level).ok())
        .unwrap_or_else(|| EnvFilter::new("info"));
    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(true)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = ControllerConfig::from_env()?;
    let client = build_kube_client(&config).await?;

    let advisor = Arc::new(AdvisorClient::new(&config.advisor_base_url)?);
    let scaler = DiskScaler::new(client.clone(), advisor);
    let service = Arc::new(ScalerService::new(
        client,
        scaler,
        config.resize_all,
        &config.excluded_namespaces,
    )?);

    Arc::clone(&service).start();
    web::serve(service, config.listen_port).await?;
    Ok(())
}

/// Tries the in-cluster configuration first and falls back to a kubeconfig,
/// either the explicitly configured path or the default lookup.
async fn build_kube_client(config: &ControllerConfig) -> Result<Client, ScalerError> {
    match kube::Config::incluster() {
        Ok(cluster_config) => {
            info!("determined to be running in a cluster, using in-cluster config");
            return Client::try_from(cluster_config).map_err(|err| ScalerError::Config {
                message: format!("failed to build cluster client from in-cluster config: {err}"),
            });
        }
        Err(err) => {
            info!(error = %err, "in-cluster config unavailable, falling back to kubeconfig");
        }
    }

    let kube_config = match &config.kubeconfig_path {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|err| ScalerError::Config {
                message: format!("failed to read kubeconfig at {path}: {err}"),
            })?;
            info!(path = %path, "built cluster config from configured kubeconfig path");
            kube::Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
                .await
                .map_err(|err| ScalerError::Config {
                    message: format!("failed to build cluster config from {path}: {err}"),
                })?
        }
        None => kube::Config::from_kubeconfig(&KubeConfigOptions::default())
            .await
            .map_err(|err| ScalerError::Config {
                message: format!("failed to build cluster config from local kubeconfig: {err}"),
            })?,
    };

    Client::try_from(kube_config).map_err(|err| ScalerError::Config {
        message: format!("failed to build cluster client: {err}"),
    })
}
