//! Server side of cloud offload: decode the uploaded frame, run the deep
//! pipeline, and answer with the raw descriptor.
//!
//! The handler is transport-agnostic: it takes a method and body and returns
//! a status, headers and JSON body. It never fails; every error becomes a
//! response.

use crate::cloud::{decode_data_uri, RemoteInferenceRequest, RemoteInferenceResponse};
use crate::orchestrator::DetectionOrchestrator;
use checkin_core::DeepOutcome;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};

pub const DEFAULT_QUOTA_PER_HOUR: u32 = 100;

const MSG_IMAGE_REQUIRED: &str = "Imagen requerida";
const MSG_BAD_REQUEST: &str = "Solicitud inválida";
const MSG_NO_FACE: &str = "No se detectó ningún rostro en la imagen";
const MSG_RATE_LIMITED: &str = "Límite de solicitudes excedido. Intenta de nuevo más tarde.";
const MSG_METHOD: &str = "Método no permitido";

const CORS_HEADERS: [(&str, &str); 3] = [
    ("Access-Control-Allow-Origin", "*"),
    ("Access-Control-Allow-Methods", "POST, OPTIONS"),
    ("Access-Control-Allow-Headers", "Content-Type"),
];

/// Fixed ceiling per one-hour window, shared across all callers.
pub struct RequestQuota {
    limit: u32,
    window: Duration,
    state: Mutex<QuotaWindow>,
}

struct QuotaWindow {
    started: DateTime<Utc>,
    count: u32,
}

impl RequestQuota {
    pub fn hourly(limit: u32) -> Self {
        Self::starting_at(limit, Utc::now())
    }

    fn starting_at(limit: u32, started: DateTime<Utc>) -> Self {
        Self {
            limit,
            window: Duration::hours(1),
            state: Mutex::new(QuotaWindow { started, count: 0 }),
        }
    }

    /// Count one request at `now`; false when the window's ceiling is reached.
    pub fn try_acquire(&self, now: DateTime<Utc>) -> bool {
        let mut window = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if now - window.started >= self.window {
            window.started = now;
            window.count = 0;
        }
        if window.count >= self.limit {
            return false;
        }
        window.count += 1;
        true
    }

    pub fn used(&self) -> u32 {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).count
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }
}

#[derive(Debug, Clone)]
pub struct EndpointResponse {
    pub status: u16,
    pub headers: Vec<(&'static str, &'static str)>,
    /// `None` for no-content responses.
    pub body: Option<RemoteInferenceResponse>,
}

impl EndpointResponse {
    fn new(status: u16, body: Option<RemoteInferenceResponse>) -> Self {
        let mut headers = CORS_HEADERS.to_vec();
        if body.is_some() {
            headers.push(("Content-Type", "application/json"));
        }
        Self { status, headers, body }
    }

    fn error(status: u16, error: impl Into<String>) -> Self {
        Self::new(
            status,
            Some(RemoteInferenceResponse {
                success: false,
                descriptor: None,
                message: None,
                error: Some(error.into()),
            }),
        )
    }

    /// Serialized body, empty for no-content responses.
    pub fn body_json(&self) -> String {
        self.body
            .as_ref()
            .and_then(|b| serde_json::to_string(b).ok())
            .unwrap_or_default()
    }
}

pub struct InferenceEndpoint {
    orchestrator: Arc<DetectionOrchestrator>,
    quota: RequestQuota,
}

impl InferenceEndpoint {
    pub fn new(orchestrator: Arc<DetectionOrchestrator>, quota: RequestQuota) -> Self {
        Self { orchestrator, quota }
    }

    pub fn quota(&self) -> &RequestQuota {
        &self.quota
    }

    pub async fn handle(&self, method: &str, body: &[u8]) -> EndpointResponse {
        self.handle_at(method, body, Utc::now()).await
    }

    pub async fn handle_at(&self, method: &str, body: &[u8], now: DateTime<Utc>) -> EndpointResponse {
        match method.to_ascii_uppercase().as_str() {
            "OPTIONS" => return EndpointResponse::new(204, None),
            "POST" => {}
            other => {
                tracing::debug!(method = other, "endpoint: method not allowed");
                return EndpointResponse::error(405, MSG_METHOD);
            }
        }

        if !self.quota.try_acquire(now) {
            tracing::warn!(limit = self.quota.limit(), "endpoint: hourly quota exhausted");
            return EndpointResponse::error(429, MSG_RATE_LIMITED);
        }

        let request: RemoteInferenceRequest = match serde_json::from_slice(body) {
            Ok(request) => request,
            Err(e) => {
                tracing::debug!(error = %e, "endpoint: malformed request body");
                return EndpointResponse::error(500, MSG_BAD_REQUEST);
            }
        };
        let Some(image) = request.image.filter(|s| !s.trim().is_empty()) else {
            return EndpointResponse::error(500, MSG_IMAGE_REQUIRED);
        };

        let frame = match decode_data_uri(&image) {
            Ok(frame) => Arc::new(frame),
            Err(e) => return EndpointResponse::error(500, format!("{MSG_BAD_REQUEST}: {e}")),
        };

        match self.orchestrator.detect_deep(frame, None).await {
            Ok(DeepOutcome::Described(detection)) => {
                let descriptor = detection.descriptor.values().iter().map(|&v| f64::from(v)).collect();
                tracing::info!(confidence = detection.face.confidence, "endpoint: descriptor extracted");
                EndpointResponse::new(
                    200,
                    Some(RemoteInferenceResponse {
                        success: true,
                        descriptor: Some(descriptor),
                        message: None,
                        error: None,
                    }),
                )
            }
            // Ungated, so Rejected cannot occur; treat it like no face.
            Ok(DeepOutcome::NoFace) | Ok(DeepOutcome::Rejected { .. }) => EndpointResponse::new(
                200,
                Some(RemoteInferenceResponse {
                    success: false,
                    descriptor: None,
                    message: Some(MSG_NO_FACE.to_string()),
                    error: None,
                }),
            ),
            Err(e) => {
                tracing::error!(error = %e, "endpoint: inference failed");
                EndpointResponse::error(500, format!("Error de inferencia: {e}"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cloud::{encode_frame, interpret_response, CloudError, CloudOutcome};
    use crate::test_support::{frame, ready_orchestrator, StubFactory};
    use checkin_core::DESCRIPTOR_DIM;

    async fn endpoint(factory: StubFactory, limit: u32) -> InferenceEndpoint {
        InferenceEndpoint::new(ready_orchestrator(factory).await, RequestQuota::hourly(limit))
    }

    fn upload() -> Vec<u8> {
        let image = encode_frame(&frame(200, 150)).unwrap();
        serde_json::to_vec(&RemoteInferenceRequest { image: Some(image) }).unwrap()
    }

    #[tokio::test]
    async fn test_preflight_is_no_content_with_cors() {
        let endpoint = endpoint(StubFactory::default(), 5).await;
        let response = endpoint.handle("OPTIONS", b"").await;
        assert_eq!(response.status, 204);
        assert!(response.body.is_none());
        assert!(response.headers.contains(&("Access-Control-Allow-Origin", "*")));
        assert_eq!(endpoint.quota().used(), 0, "preflight does not count");
    }

    #[tokio::test]
    async fn test_other_methods_rejected() {
        let endpoint = endpoint(StubFactory::default(), 5).await;
        assert_eq!(endpoint.handle("GET", b"").await.status, 405);
    }

    #[tokio::test]
    async fn test_missing_image_is_server_error() {
        let endpoint = endpoint(StubFactory::default(), 5).await;
        let bodies: [&[u8]; 2] = [b"{}", br#"{"image":""}"#];
        for body in bodies {
            let response = endpoint.handle("POST", body).await;
            assert_eq!(response.status, 500);
            let body = response.body.unwrap();
            assert!(!body.success);
            assert_eq!(body.error.as_deref(), Some(MSG_IMAGE_REQUIRED));
        }
    }

    #[tokio::test]
    async fn test_undecodable_image_is_server_error() {
        let endpoint = endpoint(StubFactory::default(), 5).await;
        let response = endpoint.handle("POST", br#"{"image":"data:image/jpeg;base64,AAAA"}"#).await;
        assert_eq!(response.status, 500);
        assert!(response.body_json().contains("\"success\":false"));
    }

    #[tokio::test]
    async fn test_success_round_trips_through_client() {
        let endpoint = endpoint(StubFactory::default(), 5).await;
        let response = endpoint.handle("POST", &upload()).await;
        assert_eq!(response.status, 200);

        match interpret_response(response.status, response.body_json().as_bytes()).unwrap() {
            CloudOutcome::Descriptor(d) => {
                assert_eq!(d.values().len(), DESCRIPTOR_DIM);
                assert!(d.values().iter().all(|&v| v == 0.0));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_no_face_is_success_status() {
        let factory = StubFactory { deep_width: None, ..StubFactory::default() };
        let endpoint = endpoint(factory, 5).await;
        let response = endpoint.handle("POST", &upload()).await;
        assert_eq!(response.status, 200);
        let body = response.body.unwrap();
        assert!(!body.success);
        assert_eq!(body.message.as_deref(), Some(MSG_NO_FACE));
    }

    #[tokio::test]
    async fn test_quota_exhaustion_and_reset() {
        let endpoint = endpoint(StubFactory::default(), 2).await;
        let t0 = Utc::now();

        assert_eq!(endpoint.handle_at("POST", &upload(), t0).await.status, 200);
        assert_eq!(endpoint.handle_at("POST", b"{}", t0).await.status, 500, "bad requests still count");

        let limited = endpoint.handle_at("POST", &upload(), t0 + Duration::minutes(30)).await;
        assert_eq!(limited.status, 429);
        let err = interpret_response(limited.status, limited.body_json().as_bytes()).unwrap_err();
        assert!(matches!(err, CloudError::RateLimited(_)));

        let later = endpoint.handle_at("POST", &upload(), t0 + Duration::minutes(61)).await;
        assert_eq!(later.status, 200);
    }

    #[test]
    fn test_quota_window_boundary() {
        let t0 = Utc::now();
        let quota = RequestQuota::starting_at(1, t0);
        assert!(quota.try_acquire(t0));
        assert!(!quota.try_acquire(t0 + Duration::minutes(59)));
        assert!(quota.try_acquire(t0 + Duration::hours(1)));
        assert_eq!(quota.used(), 1);
    }
}
