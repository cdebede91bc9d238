//! Engine seams: the fast tracker, the deep detect → align → describe
//! pipeline, and the factory that loads them from model bytes.

use crate::detector::{DetectorError, FaceDetector, DEEP_INPUT_SIZE, FAST_INPUT_SIZE};
use crate::frame::Frame;
use crate::quality::QualityGate;
use crate::recognizer::{DescriptorNet, RecognizerError};
use crate::types::{DetectionBox, FaceDescriptor, QualityVerdict};
use serde::Serialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum InferenceError {
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
    #[error("{0}")]
    Other(String),
}

/// Lightweight detector for continuous tracking feedback.
pub trait FastEngine {
    fn detect(&mut self, frame: &Frame) -> Result<Option<DetectionBox>, InferenceError>;
}

/// Identity-grade pipeline, split so the quality gate can run between stages.
pub trait DeepEngine {
    /// Detect the most confident face, with landmarks.
    fn locate(&mut self, frame: &Frame) -> Result<Option<DetectionBox>, InferenceError>;
    /// Align and describe a face returned by [`locate`](Self::locate).
    fn describe(&mut self, frame: &Frame, face: &DetectionBox) -> Result<FaceDescriptor, InferenceError>;
}

/// Loads engines from model bytes. Called on the engine's own thread.
pub trait EngineFactory: Send + Sync {
    fn load_fast(&self, detector: &[u8]) -> Result<Box<dyn FastEngine>, InferenceError>;
    fn load_deep(&self, detector: &[u8], recognizer: &[u8]) -> Result<Box<dyn DeepEngine>, InferenceError>;
}

/// A face the deep pipeline described.
#[derive(Debug, Clone, Serialize)]
pub struct DeepDetection {
    pub face: DetectionBox,
    pub descriptor: FaceDescriptor,
    /// Gate verdict, when a gate was applied.
    pub quality: Option<QualityVerdict>,
}

#[derive(Debug, Clone)]
pub enum DeepOutcome {
    NoFace,
    Rejected {
        face: DetectionBox,
        verdict: QualityVerdict,
    },
    Described(DeepDetection),
}

/// Run the deep pipeline on one frame, gating before descriptor extraction.
pub fn run_deep(
    engine: &mut dyn DeepEngine,
    frame: &Frame,
    gate: Option<&QualityGate>,
) -> Result<DeepOutcome, InferenceError> {
    let Some(face) = engine.locate(frame)? else {
        return Ok(DeepOutcome::NoFace);
    };

    let quality = gate.map(|g| g.evaluate(&face, frame.width()));
    if let Some(verdict) = quality.filter(|v| !v.accepted) {
        tracing::debug!(
            ratio = verdict.ratio,
            reason = ?verdict.reason,
            brightness = frame.avg_brightness(),
            "deep: face rejected by quality gate"
        );
        return Ok(DeepOutcome::Rejected { face, verdict });
    }

    let descriptor = engine.describe(frame, &face)?;
    Ok(DeepOutcome::Described(DeepDetection {
        face,
        descriptor,
        quality,
    }))
}

/// Fast engine backed by a light SCRFD export.
pub struct OnnxFastEngine {
    detector: FaceDetector,
}

impl FastEngine for OnnxFastEngine {
    fn detect(&mut self, frame: &Frame) -> Result<Option<DetectionBox>, InferenceError> {
        Ok(self.detector.detect(frame)?.into_iter().next())
    }
}

/// Deep engine: SCRFD with keypoints, then the descriptor network.
pub struct OnnxDeepEngine {
    detector: FaceDetector,
    recognizer: DescriptorNet,
}

impl DeepEngine for OnnxDeepEngine {
    fn locate(&mut self, frame: &Frame) -> Result<Option<DetectionBox>, InferenceError> {
        Ok(self
            .detector
            .detect(frame)?
            .into_iter()
            .find(|face| face.landmarks.is_some()))
    }

    fn describe(&mut self, frame: &Frame, face: &DetectionBox) -> Result<FaceDescriptor, InferenceError> {
        Ok(self.recognizer.extract(frame, face)?)
    }
}

/// Production factory over ONNX Runtime.
#[derive(Debug, Clone, Copy)]
pub struct OnnxEngineFactory {
    pub prefer_accelerated: bool,
}

impl OnnxEngineFactory {
    pub fn new(prefer_accelerated: bool) -> Self {
        Self { prefer_accelerated }
    }
}

impl EngineFactory for OnnxEngineFactory {
    fn load_fast(&self, detector: &[u8]) -> Result<Box<dyn FastEngine>, InferenceError> {
        let detector = FaceDetector::load(detector, "fast_detector", FAST_INPUT_SIZE, self.prefer_accelerated)?;
        Ok(Box::new(OnnxFastEngine { detector }))
    }

    fn load_deep(&self, detector: &[u8], recognizer: &[u8]) -> Result<Box<dyn DeepEngine>, InferenceError> {
        let detector = FaceDetector::load(detector, "deep_detector", DEEP_INPUT_SIZE, self.prefer_accelerated)?;
        let recognizer = DescriptorNet::load(recognizer, "recognizer", self.prefer_accelerated)?;
        Ok(Box::new(OnnxDeepEngine { detector, recognizer }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::DESCRIPTOR_DIM;
    use image::RgbImage;

    struct Scripted {
        face: Option<DetectionBox>,
        described: usize,
    }

    impl DeepEngine for Scripted {
        fn locate(&mut self, _frame: &Frame) -> Result<Option<DetectionBox>, InferenceError> {
            Ok(self.face.clone())
        }

        fn describe(&mut self, _frame: &Frame, _face: &DetectionBox) -> Result<FaceDescriptor, InferenceError> {
            self.described += 1;
            Ok(FaceDescriptor::new(vec![0.0; DESCRIPTOR_DIM]).unwrap())
        }
    }

    fn face(width: f32) -> DetectionBox {
        DetectionBox {
            x: 0.0, y: 0.0, width, height: width,
            confidence: 0.9, landmarks: Some([(0.0, 0.0); 5]),
        }
    }

    fn frame() -> Frame {
        Frame::from_rgb(RgbImage::new(100, 100))
    }

    #[test]
    fn test_no_face() {
        let mut engine = Scripted { face: None, described: 0 };
        let outcome = run_deep(&mut engine, &frame(), Some(&QualityGate::default())).unwrap();
        assert!(matches!(outcome, DeepOutcome::NoFace));
        assert_eq!(engine.described, 0);
    }

    #[test]
    fn test_gate_runs_before_extraction() {
        let mut engine = Scripted { face: Some(face(5.0)), described: 0 };
        let outcome = run_deep(&mut engine, &frame(), Some(&QualityGate::default())).unwrap();
        assert!(matches!(outcome, DeepOutcome::Rejected { .. }));
        assert_eq!(engine.described, 0, "rejected faces must not be described");
    }

    #[test]
    fn test_accepted_face_is_described() {
        let mut engine = Scripted { face: Some(face(40.0)), described: 0 };
        let outcome = run_deep(&mut engine, &frame(), Some(&QualityGate::default())).unwrap();
        match outcome {
            DeepOutcome::Described(d) => {
                assert!(d.quality.unwrap().accepted);
                assert_eq!(d.descriptor.values().len(), DESCRIPTOR_DIM);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert_eq!(engine.described, 1);
    }

    #[test]
    fn test_ungated_describes_any_size() {
        let mut engine = Scripted { face: Some(face(5.0)), described: 0 };
        let outcome = run_deep(&mut engine, &frame(), None).unwrap();
        assert!(matches!(outcome, DeepOutcome::Described(DeepDetection { quality: None, .. })));
    }
}
