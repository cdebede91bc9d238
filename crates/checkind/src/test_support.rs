//! Stub engines for exercising the daemon without model files.

use crate::orchestrator::DetectionOrchestrator;
use checkin_core::pipeline::{DeepEngine, FastEngine};
use checkin_core::{DetectionBox, EngineFactory, FaceDescriptor, Frame, InferenceError, DESCRIPTOR_DIM};
use checkin_models::{ModelBundle, DEEP_DETECTOR, FAST_DETECTOR, RECOGNIZER};
use image::RgbImage;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

/// Frames of this width make the stub engines fail inference.
pub const FAILING_FRAME_WIDTH: u32 = 13;
/// Frames of this width make the stub engines panic.
pub const PANICKING_FRAME_WIDTH: u32 = 7;

pub struct StubFactory {
    /// Face width reported by the fast engine; `None` means no face.
    pub fast_width: Option<f32>,
    /// Face width reported by the deep engine; `None` means no face.
    pub deep_width: Option<f32>,
    pub descriptor: Vec<f32>,
    pub fast_delay: Duration,
    pub fail_fast: AtomicBool,
    pub fail_deep: AtomicBool,
    pub loads: AtomicUsize,
}

impl Default for StubFactory {
    fn default() -> Self {
        Self {
            fast_width: Some(40.0),
            deep_width: Some(40.0),
            descriptor: vec![0.0; DESCRIPTOR_DIM],
            fast_delay: Duration::ZERO,
            fail_fast: AtomicBool::new(false),
            fail_deep: AtomicBool::new(false),
            loads: AtomicUsize::new(0),
        }
    }
}

impl EngineFactory for StubFactory {
    fn load_fast(&self, _detector: &[u8]) -> Result<Box<dyn FastEngine>, InferenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_fast.load(Ordering::SeqCst) {
            return Err(InferenceError::Other("fast model rejected".into()));
        }
        Ok(Box::new(StubFast {
            width: self.fast_width,
            delay: self.fast_delay,
        }))
    }

    fn load_deep(&self, _detector: &[u8], _recognizer: &[u8]) -> Result<Box<dyn DeepEngine>, InferenceError> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        if self.fail_deep.load(Ordering::SeqCst) {
            return Err(InferenceError::Other("deep model rejected".into()));
        }
        Ok(Box::new(StubDeep {
            width: self.deep_width,
            descriptor: self.descriptor.clone(),
        }))
    }
}

struct StubFast {
    width: Option<f32>,
    delay: Duration,
}

impl FastEngine for StubFast {
    fn detect(&mut self, frame: &Frame) -> Result<Option<DetectionBox>, InferenceError> {
        std::thread::sleep(self.delay);
        if frame.width() == PANICKING_FRAME_WIDTH {
            panic!("stub fast engine hit a poisoned frame");
        }
        if frame.width() == FAILING_FRAME_WIDTH {
            return Err(InferenceError::Other("corrupt frame".into()));
        }
        Ok(self.width.map(|w| face_box(w, false)))
    }
}

struct StubDeep {
    width: Option<f32>,
    descriptor: Vec<f32>,
}

impl DeepEngine for StubDeep {
    fn locate(&mut self, frame: &Frame) -> Result<Option<DetectionBox>, InferenceError> {
        if frame.width() == PANICKING_FRAME_WIDTH {
            panic!("stub deep engine hit a poisoned frame");
        }
        if frame.width() == FAILING_FRAME_WIDTH {
            return Err(InferenceError::Other("corrupt frame".into()));
        }
        Ok(self.width.map(|w| face_box(w, true)))
    }

    fn describe(&mut self, _frame: &Frame, _face: &DetectionBox) -> Result<FaceDescriptor, InferenceError> {
        FaceDescriptor::new(self.descriptor.clone()).map_err(|e| InferenceError::Other(e.to_string()))
    }
}

fn face_box(width: f32, landmarks: bool) -> DetectionBox {
    DetectionBox {
        x: 10.0,
        y: 10.0,
        width,
        height: width * 1.2,
        confidence: 0.9,
        landmarks: landmarks.then_some([(20.0, 20.0), (30.0, 20.0), (25.0, 27.0), (21.0, 33.0), (29.0, 33.0)]),
    }
}

pub fn bundle() -> Arc<ModelBundle> {
    let models: HashMap<String, Vec<u8>> = [FAST_DETECTOR, DEEP_DETECTOR, RECOGNIZER]
        .into_iter()
        .map(|name| (name.to_string(), b"stub".to_vec()))
        .collect();
    Arc::new(ModelBundle::new("test", models))
}

pub fn frame(width: u32, height: u32) -> Arc<Frame> {
    Arc::new(Frame::from_rgb(RgbImage::from_pixel(width, height, image::Rgb([120, 110, 100]))))
}

pub async fn ready_orchestrator(factory: StubFactory) -> Arc<DetectionOrchestrator> {
    let orchestrator = Arc::new(DetectionOrchestrator::new(Arc::new(factory)));
    orchestrator
        .init(bundle())
        .await
        .expect("stub engines load");
    orchestrator
}
