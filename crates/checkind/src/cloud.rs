//! Remote descriptor extraction.
//!
//! Frames are downscaled to a fixed square canvas, JPEG-encoded and posted as
//! a data URI. The endpoint runs the same deep pipeline as the local engine, so
//! its descriptors live in the same space and share the match threshold.

use base64::Engine;
use checkin_core::{FaceDescriptor, Frame};
use image::codecs::jpeg::JpegEncoder;
use image::imageops::{self, FilterType};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Side of the square canvas frames are scaled to before upload.
pub const CANVAS_SIZE: u32 = 320;
pub const JPEG_QUALITY: u8 = 70;
pub const DEFAULT_CLOUD_TIMEOUT: Duration = Duration::from_secs(15);

const DATA_URI_PREFIX: &str = "data:image/jpeg;base64,";

#[derive(Error, Debug)]
pub enum CloudError {
    #[error("cloud transport: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("cloud endpoint returned HTTP {status}: {message}")]
    Status { status: u16, message: String },
    #[error("cloud rate limit exceeded: {0}")]
    RateLimited(String),
    #[error("invalid cloud response: {0}")]
    InvalidResponse(String),
    #[error("encode frame: {0}")]
    Encode(#[from] image::ImageError),
}

/// Request body shared by the client and the endpoint.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RemoteInferenceRequest {
    #[serde(default)]
    pub image: Option<String>,
}

/// Response body shared by the client and the endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteInferenceResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptor: Option<Vec<f64>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub enum CloudOutcome {
    Descriptor(FaceDescriptor),
    /// The endpoint found no face; carries its message.
    NoFace(String),
}

pub struct CloudOffloadClient {
    client: reqwest::Client,
    endpoint: String,
}

impl CloudOffloadClient {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self, CloudError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub async fn infer(&self, frame: &Frame) -> Result<CloudOutcome, CloudError> {
        let request = RemoteInferenceRequest {
            image: Some(encode_frame(frame)?),
        };

        let started = std::time::Instant::now();
        let response = self.client.post(&self.endpoint).json(&request).send().await?;
        let status = response.status().as_u16();
        let body = response.bytes().await?;
        tracing::debug!(
            endpoint = %self.endpoint,
            status,
            bytes = body.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "cloud inference response"
        );

        interpret_response(status, &body)
    }
}

/// Scale to the upload canvas and wrap as a base64 JPEG data URI.
pub fn encode_frame(frame: &Frame) -> Result<String, CloudError> {
    let canvas = imageops::resize(frame.image(), CANVAS_SIZE, CANVAS_SIZE, FilterType::Triangle);
    let mut jpeg = Vec::new();
    JpegEncoder::new_with_quality(&mut jpeg, JPEG_QUALITY).encode_image(&canvas)?;

    let mut uri = String::with_capacity(DATA_URI_PREFIX.len() + jpeg.len() * 4 / 3 + 4);
    uri.push_str(DATA_URI_PREFIX);
    base64::engine::general_purpose::STANDARD.encode_string(&jpeg, &mut uri);
    Ok(uri)
}

/// Map an endpoint status and body onto an outcome.
pub fn interpret_response(status: u16, body: &[u8]) -> Result<CloudOutcome, CloudError> {
    let parsed: Option<RemoteInferenceResponse> = serde_json::from_slice(body).ok();
    let detail = |parsed: &Option<RemoteInferenceResponse>| {
        parsed
            .as_ref()
            .and_then(|r| r.error.clone().or_else(|| r.message.clone()))
            .unwrap_or_else(|| format!("HTTP {status}"))
    };

    if status == 429 {
        return Err(CloudError::RateLimited(detail(&parsed)));
    }
    if !(200..300).contains(&status) {
        return Err(CloudError::Status {
            status,
            message: detail(&parsed),
        });
    }

    let response = parsed.ok_or_else(|| CloudError::InvalidResponse("body is not a JSON response object".into()))?;
    if !response.success {
        let message = response
            .message
            .or(response.error)
            .unwrap_or_else(|| "no face detected".to_string());
        return Ok(CloudOutcome::NoFace(message));
    }

    let values = response
        .descriptor
        .ok_or_else(|| CloudError::InvalidResponse("success without descriptor".into()))?;
    let descriptor = FaceDescriptor::new(values.into_iter().map(|v| v as f32).collect())
        .map_err(|e| CloudError::InvalidResponse(e.to_string()))?;
    Ok(CloudOutcome::Descriptor(descriptor))
}

/// Decode a data URI (or bare base64) image back into a frame.
pub fn decode_data_uri(uri: &str) -> Result<Frame, String> {
    let payload = match uri.split_once(',') {
        Some((header, payload)) if header.starts_with("data:") => {
            if !header.ends_with(";base64") {
                return Err("data URI is not base64-encoded".into());
            }
            payload
        }
        _ => uri,
    };
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.trim())
        .map_err(|e| format!("base64: {e}"))?;
    Frame::decode(&bytes).map_err(|e| format!("image: {e}"))
}
