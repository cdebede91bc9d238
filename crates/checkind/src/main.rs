use anyhow::{Context, Result};
use checkin_core::{OnnxEngineFactory, QualityGate};
use checkin_models::{ModelSourceResolver, SourceFetcher, REQUIRED_MODELS};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod checkin;
mod cloud;
mod config;
mod dbus_interface;
mod endpoint;
mod orchestrator;
#[cfg(test)]
mod test_support;

use checkin::CheckIn;
use cloud::CloudOffloadClient;
use config::Config;
use endpoint::{InferenceEndpoint, RequestQuota};
use orchestrator::DetectionOrchestrator;

const BUS_NAME: &str = "org.checkin.Recognition1";
const OBJECT_PATH: &str = "/org/checkin/Recognition1";

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    tracing::info!("checkind starting");

    let config = Config::from_env();
    tracing::info!(
        sources = config.model_sources.len(),
        threshold = config.match_threshold,
        min_face_ratio = config.min_face_ratio,
        max_face_ratio = config.max_face_ratio,
        cloud = config.cloud_endpoint.is_some(),
        "configuration loaded"
    );

    // Model acquisition failure is fatal: nothing downstream can run without it.
    let resolver = ModelSourceResolver::new(SourceFetcher::new()?, REQUIRED_MODELS)
        .with_probe_timeout(config.probe_timeout);
    let resolved = resolver
        .resolve(&config.model_sources)
        .await
        .context("model acquisition failed")?;

    let factory = Arc::new(OnnxEngineFactory::new(config.prefer_gpu));
    let orchestrator = Arc::new(DetectionOrchestrator::new(factory));
    orchestrator
        .init(resolved.bundle.clone())
        .await
        .context("engine initialization failed")?;

    let cloud = config
        .cloud_endpoint
        .as_deref()
        .map(|endpoint| CloudOffloadClient::new(endpoint, config.cloud_timeout))
        .transpose()?;
    if let Some(client) = &cloud {
        tracing::info!(endpoint = client.endpoint(), "cloud offload enabled");
    }

    let gate = QualityGate::new(config.min_face_ratio, config.max_face_ratio);
    let checkin = Arc::new(CheckIn::new(orchestrator.clone(), cloud, gate, config.match_threshold));

    if let Some(path) = &config.roster_path {
        match checkin.load_roster_file(path) {
            Ok(count) => tracing::info!(path = %path.display(), identities = count, "roster loaded"),
            Err(e) => tracing::warn!(path = %path.display(), error = %e, "roster not loaded; identify will report no roster"),
        }
    }

    let endpoint = Arc::new(InferenceEndpoint::new(
        orchestrator,
        RequestQuota::hourly(config.endpoint_quota),
    ));

    let service = dbus_interface::RecognitionService {
        checkin,
        endpoint,
        model_source: resolved.source.to_string(),
        model_version: resolved.bundle.version().to_string(),
        roster_path: config.roster_path.clone(),
    };

    let _connection = zbus::connection::Builder::system()?
        .name(BUS_NAME)?
        .serve_at(OBJECT_PATH, service)?
        .build()
        .await
        .context("failed to register on the system bus")?;

    tracing::info!(bus = BUS_NAME, path = OBJECT_PATH, "checkind ready");

    tokio::signal::ctrl_c().await?;
    tracing::info!("checkind shutting down");

    Ok(())
}
