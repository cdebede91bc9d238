use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Number of elements in a deep-recognizer face descriptor.
pub const DESCRIPTOR_DIM: usize = 128;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum DescriptorError {
    #[error("expected {DESCRIPTOR_DIM}-dim descriptor, got {0}")]
    Dimension(usize),
    #[error("descriptor index {0} is missing")]
    MissingIndex(usize),
    #[error("descriptor key {0:?} is not an index in 0..{DESCRIPTOR_DIM}")]
    UnexpectedKey(String),
    #[error("descriptor value at index {0} is not finite")]
    NonFinite(usize),
}

/// Bounding box for a detected face in source-frame pixels, with optional landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectionBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Identity descriptor from the deep recognizer (or the cloud path, which shares its space).
///
/// The length is checked on construction, so any two descriptors are comparable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<f32>", into = "Vec<f32>")]
pub struct FaceDescriptor {
    values: Vec<f32>,
}

impl FaceDescriptor {
    pub fn new(values: Vec<f32>) -> Result<Self, DescriptorError> {
        if values.len() != DESCRIPTOR_DIM {
            return Err(DescriptorError::Dimension(values.len()));
        }
        if let Some(idx) = values.iter().position(|v| !v.is_finite()) {
            return Err(DescriptorError::NonFinite(idx));
        }
        Ok(Self { values })
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    /// Euclidean distance, accumulated in f64.
    pub fn distance(&self, other: &FaceDescriptor) -> f64 {
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| {
                let d = *a as f64 - *b as f64;
                d * d
            })
            .sum::<f64>()
            .sqrt()
    }
}

impl TryFrom<Vec<f32>> for FaceDescriptor {
    type Error = DescriptorError;

    fn try_from(values: Vec<f32>) -> Result<Self, Self::Error> {
        Self::new(values)
    }
}

impl From<FaceDescriptor> for Vec<f32> {
    fn from(descriptor: FaceDescriptor) -> Self {
        descriptor.values
    }
}

/// Load state of a model source or engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineState {
    NotLoaded,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EngineState::NotLoaded => "not_loaded",
            EngineState::Loading => "loading",
            EngineState::Ready => "ready",
            EngineState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Why the quality gate turned a face away.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum QualityReason {
    TooFar,
    TooClose,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QualityVerdict {
    pub accepted: bool,
    pub ratio: f32,
    #[serde(rename = "reasonCode", skip_serializing_if = "Option::is_none")]
    pub reason: Option<QualityReason>,
}

/// An enrolled identity with its reference descriptors.
#[derive(Debug, Clone, PartialEq)]
pub struct LabeledDescriptor {
    pub label: String,
    pub descriptors: Vec<FaceDescriptor>,
}

/// Outcome label of a match: an enrolled identity or "unknown".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(into = "String")]
pub enum MatchLabel {
    Identity(String),
    Unknown,
}

impl fmt::Display for MatchLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MatchLabel::Identity(id) => f.write_str(id),
            MatchLabel::Unknown => f.write_str("unknown"),
        }
    }
}

impl From<MatchLabel> for String {
    fn from(label: MatchLabel) -> Self {
        label.to_string()
    }
}

/// Result of matching a probe descriptor against the enrolled set.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub label: MatchLabel,
    /// Euclidean distance to the nearest reference descriptor.
    pub distance: f64,
}

impl MatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self.label, MatchLabel::Identity(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeros() -> FaceDescriptor {
        FaceDescriptor::new(vec![0.0; DESCRIPTOR_DIM]).unwrap()
    }

    #[test]
    fn test_descriptor_rejects_wrong_length() {
        assert_eq!(
            FaceDescriptor::new(vec![0.0; 512]),
            Err(DescriptorError::Dimension(512))
        );
        assert_eq!(FaceDescriptor::new(vec![]), Err(DescriptorError::Dimension(0)));
    }

    #[test]
    fn test_descriptor_rejects_nan() {
        let mut values = vec![0.0; DESCRIPTOR_DIM];
        values[7] = f32::NAN;
        assert_eq!(FaceDescriptor::new(values), Err(DescriptorError::NonFinite(7)));
    }

    #[test]
    fn test_distance_identical_is_zero() {
        let a = zeros();
        assert_eq!(a.distance(&a.clone()), 0.0);
    }

    #[test]
    fn test_distance_single_component() {
        let mut values = vec![0.0; DESCRIPTOR_DIM];
        values[0] = 3.0;
        values[1] = 4.0;
        let b = FaceDescriptor::new(values).unwrap();
        assert!((zeros().distance(&b) - 5.0).abs() < 1e-9);
    }

    #[test]
    fn test_descriptor_json_is_plain_array() {
        let json = serde_json::to_string(&zeros()).unwrap();
        assert!(json.starts_with('['));
        let back: FaceDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(back, zeros());
        assert!(serde_json::from_str::<FaceDescriptor>("[1.0, 2.0]").is_err());
    }

    #[test]
    fn test_quality_reason_wire_names() {
        assert_eq!(serde_json::to_string(&QualityReason::TooFar).unwrap(), "\"TOO_FAR\"");
        assert_eq!(serde_json::to_string(&QualityReason::TooClose).unwrap(), "\"TOO_CLOSE\"");
    }

    #[test]
    fn test_match_label_serializes_unknown() {
        let result = MatchResult { label: MatchLabel::Unknown, distance: 1.0 };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["label"], "unknown");
        assert!(!result.is_match());
    }
}
