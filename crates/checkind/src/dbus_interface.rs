use crate::checkin::{CheckIn, CheckInError, Route};
use crate::cloud::CloudError;
use crate::endpoint::InferenceEndpoint;
use crate::orchestrator::EngineError;
use checkin_core::Frame;
use std::path::PathBuf;
use std::sync::Arc;
use zbus::interface;

/// D-Bus interface for the check-in recognition daemon.
///
/// Bus name: org.checkin.Recognition1
/// Object path: /org/checkin/Recognition1
pub struct RecognitionService {
    pub checkin: Arc<CheckIn>,
    pub endpoint: Arc<InferenceEndpoint>,
    /// Where the model bundle came from, and its manifest version.
    pub model_source: String,
    pub model_version: String,
    pub roster_path: Option<PathBuf>,
}

#[interface(name = "org.checkin.Recognition1")]
impl RecognitionService {
    /// Identify the face in an image file. Returns the verdict as JSON.
    async fn identify(&self, image_path: &str, route: &str) -> zbus::fdo::Result<String> {
        tracing::info!(image_path, route, "identify requested");
        let route: Route = route.parse().map_err(zbus::fdo::Error::InvalidArgs)?;
        let frame = open_frame(image_path).await?;

        match self.checkin.identify(frame, route).await {
            Ok(verdict) => serde_json::to_string(&verdict).map_err(|e| zbus::fdo::Error::Failed(e.to_string())),
            Err(err) => retry_or_error(err),
        }
    }

    /// Fast tracking pass: face box and quality verdict, as JSON.
    async fn track(&self, image_path: &str) -> zbus::fdo::Result<String> {
        let frame = open_frame(image_path).await?;
        match self.checkin.track(frame).await {
            Ok(tracking) => serde_json::to_string(&tracking).map_err(|e| zbus::fdo::Error::Failed(e.to_string())),
            Err(err) => retry_or_error(CheckInError::Engine(err)),
        }
    }

    /// Rebuild the matcher from a roster export. An empty path reloads the configured one.
    async fn reload_roster(&self, path: &str) -> zbus::fdo::Result<u32> {
        let path = if path.is_empty() {
            self.roster_path
                .clone()
                .ok_or_else(|| zbus::fdo::Error::InvalidArgs("no roster path configured".into()))?
        } else {
            PathBuf::from(path)
        };
        tracing::info!(path = %path.display(), "roster reload requested");

        let checkin = self.checkin.clone();
        let count = tokio::task::spawn_blocking(move || checkin.load_roster_file(&path))
            .await
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
            .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?;
        Ok(count as u32)
    }

    /// Serve one cloud inference request. Returns the HTTP status and JSON body.
    async fn handle_inference(&self, method: &str, body: &str) -> zbus::fdo::Result<(u16, String)> {
        let response = self.endpoint.handle(method, body.as_bytes()).await;
        Ok((response.status, response.body_json()))
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let states = self.checkin.orchestrator().states();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "engines": states,
            "model_source": self.model_source,
            "model_version": self.model_version,
            "enrolled": self.checkin.enrolled(),
            "cloud_enabled": self.checkin.cloud_enabled(),
            "endpoint_requests": self.endpoint.quota().used(),
            "endpoint_quota": self.endpoint.quota().limit(),
        })
        .to_string())
    }
}

async fn open_frame(image_path: &str) -> zbus::fdo::Result<Arc<Frame>> {
    let path = PathBuf::from(image_path);
    tokio::task::spawn_blocking(move || Frame::open(&path))
        .await
        .map_err(|e| zbus::fdo::Error::Failed(e.to_string()))?
        .map(Arc::new)
        .map_err(|e| zbus::fdo::Error::InvalidArgs(format!("{image_path}: {e}")))
}

/// Per-frame failures become a `retry` outcome; lifecycle problems stay D-Bus errors.
fn retry_or_error(err: CheckInError) -> zbus::fdo::Result<String> {
    match err {
        CheckInError::CloudDisabled => Err(zbus::fdo::Error::NotSupported(err.to_string())),
        CheckInError::Engine(EngineError::NotReady(..) | EngineError::ChannelClosed(_)) => {
            tracing::error!(error = %err, "check-in unavailable");
            Err(zbus::fdo::Error::Failed(err.to_string()))
        }
        CheckInError::Engine(EngineError::Busy(_)) => {
            tracing::debug!("frame dropped; engine busy");
            Ok(retry_json(&err))
        }
        CheckInError::Engine(EngineError::Inference(_)) | CheckInError::Cloud(_) => {
            tracing::warn!(error = %err, "check-in attempt failed; caller should retry");
            Ok(retry_json(&err))
        }
    }
}

fn retry_json(err: &CheckInError) -> String {
    let kind = match err {
        CheckInError::Cloud(CloudError::RateLimited(_)) => "rate_limited",
        CheckInError::Cloud(_) => "transport",
        CheckInError::Engine(EngineError::Busy(_)) => "busy",
        _ => "inference",
    };
    serde_json::json!({ "outcome": "retry", "kind": kind, "reason": err.to_string() }).to_string()
}
