//! checkin-core: face detection, quality gating, and descriptor matching.
//!
//! Two SCRFD detectors (fast tracking, deep identity) and a 128-d descriptor
//! network run via ONNX Runtime; matching is pure Euclidean nearest-neighbor.

pub mod alignment;
pub mod backend;
pub mod detector;
pub mod frame;
pub mod matcher;
pub mod pipeline;
pub mod quality;
pub mod record;
pub mod recognizer;
pub mod types;

pub use frame::Frame;
pub use matcher::{FaceMatcher, DEFAULT_MATCH_THRESHOLD};
pub use pipeline::{
    DeepDetection, DeepEngine, DeepOutcome, EngineFactory, FastEngine, InferenceError, OnnxEngineFactory,
};
pub use quality::QualityGate;
pub use types::{
    DescriptorError, DetectionBox, EngineState, FaceDescriptor, LabeledDescriptor, MatchLabel, MatchResult,
    QualityReason, QualityVerdict, DESCRIPTOR_DIM,
};
