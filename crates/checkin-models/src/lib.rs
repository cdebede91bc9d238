//! checkin-models: model bundle acquisition from interchangeable sources.

pub mod fetch;
pub mod manifest;
pub mod resolver;

pub use fetch::{AssetFetcher, FetchError, FetchedAsset, ModelSource, SourceFetcher};
pub use manifest::{BundleManifest, ManifestError, ModelEntry, MANIFEST_FILE};
pub use resolver::{
    AcquisitionError, ModelBundle, ModelSourceResolver, ResolvedSource, SourceFailure, SourceFailureCause,
    DEFAULT_PROBE_TIMEOUT,
};

/// Light SCRFD export driving the tracking engine.
pub const FAST_DETECTOR: &str = "fast_detector";
/// SCRFD export with keypoints driving the deep engine.
pub const DEEP_DETECTOR: &str = "deep_detector";
/// 128-d descriptor network.
pub const RECOGNIZER: &str = "recognizer";

/// Models every bundle must provide.
pub const REQUIRED_MODELS: &[&str] = &[FAST_DETECTOR, DEEP_DETECTOR, RECOGNIZER];
