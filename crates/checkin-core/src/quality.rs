//! Frame-quality admission gate.
//!
//! Decides from the apparent face width alone whether a detection is worth a
//! descriptor extraction. Faces that are too small carry too little detail;
//! faces that fill the frame are usually cropped at the edges.

use crate::types::{DetectionBox, QualityReason, QualityVerdict};

pub const DEFAULT_MIN_FACE_RATIO: f32 = 0.22;
pub const DEFAULT_MAX_FACE_RATIO: f32 = 0.60;

/// Face-width to frame-width bounds, both inclusive.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct QualityGate {
    pub min_ratio: f32,
    pub max_ratio: f32,
}

impl Default for QualityGate {
    fn default() -> Self {
        Self {
            min_ratio: DEFAULT_MIN_FACE_RATIO,
            max_ratio: DEFAULT_MAX_FACE_RATIO,
        }
    }
}

impl QualityGate {
    pub fn new(min_ratio: f32, max_ratio: f32) -> Self {
        Self { min_ratio, max_ratio }
    }

    /// Evaluate a detection against the frame it came from.
    ///
    /// A zero-width frame yields ratio 0 and is rejected as too far.
    pub fn evaluate(&self, face: &DetectionBox, frame_width: u32) -> QualityVerdict {
        let ratio = if frame_width == 0 {
            0.0
        } else {
            face.width / frame_width as f32
        };

        let reason = if ratio < self.min_ratio || ratio.is_nan() {
            Some(QualityReason::TooFar)
        } else if ratio > self.max_ratio {
            Some(QualityReason::TooClose)
        } else {
            None
        };

        QualityVerdict {
            accepted: reason.is_none(),
            ratio,
            reason,
        }
    }
}
