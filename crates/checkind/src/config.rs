use checkin_core::quality::{DEFAULT_MAX_FACE_RATIO, DEFAULT_MIN_FACE_RATIO};
use checkin_core::DEFAULT_MATCH_THRESHOLD;
use checkin_models::{ModelSource, DEFAULT_PROBE_TIMEOUT};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::cloud::DEFAULT_CLOUD_TIMEOUT;
use crate::endpoint::DEFAULT_QUOTA_PER_HOUR;

/// Model locations tried when `CHECKIN_MODEL_SOURCES` is unset.
const DEFAULT_MODEL_SOURCES: &[&str] = &["/usr/share/checkin/models", "./models", "models"];

/// Daemon configuration, loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// Candidate model locations, raced at startup.
    pub model_sources: Vec<ModelSource>,
    /// Bound on each candidate's manifest probe.
    pub probe_timeout: Duration,
    /// Maximum Euclidean distance accepted as a match.
    pub match_threshold: f64,
    /// Inclusive lower bound on face width / frame width.
    pub min_face_ratio: f32,
    /// Inclusive upper bound on face width / frame width.
    pub max_face_ratio: f32,
    /// Try the CUDA execution provider before the default one.
    pub prefer_gpu: bool,
    /// Remote inference endpoint; cloud offload is disabled when unset.
    pub cloud_endpoint: Option<String>,
    pub cloud_timeout: Duration,
    /// Enrolled-identity export loaded at startup.
    pub roster_path: Option<PathBuf>,
    /// Requests per hour accepted by the hosted inference endpoint.
    pub endpoint_quota: u32,
}

impl Config {
    /// Load configuration from `CHECKIN_*` environment variables with defaults.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(var: impl Fn(&str) -> Option<String>) -> Self {
        let mut model_sources: Vec<ModelSource> = match var("CHECKIN_MODEL_SOURCES") {
            Some(list) => list
                .split(',')
                .filter(|s| !s.trim().is_empty())
                .map(ModelSource::parse)
                .collect(),
            None => DEFAULT_MODEL_SOURCES.iter().map(|s| ModelSource::parse(s)).collect(),
        };
        if let Some(url) = var("CHECKIN_MODEL_URL").filter(|s| !s.trim().is_empty()) {
            model_sources.insert(0, ModelSource::parse(&url));
        }

        Self {
            model_sources,
            probe_timeout: parsed(&var, "CHECKIN_PROBE_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_PROBE_TIMEOUT),
            match_threshold: parsed(&var, "CHECKIN_MATCH_THRESHOLD").unwrap_or(DEFAULT_MATCH_THRESHOLD),
            min_face_ratio: parsed(&var, "CHECKIN_MIN_FACE_RATIO").unwrap_or(DEFAULT_MIN_FACE_RATIO),
            max_face_ratio: parsed(&var, "CHECKIN_MAX_FACE_RATIO").unwrap_or(DEFAULT_MAX_FACE_RATIO),
            prefer_gpu: var("CHECKIN_PREFER_GPU").map(|v| v.trim() != "0").unwrap_or(true),
            cloud_endpoint: var("CHECKIN_CLOUD_ENDPOINT").filter(|s| !s.trim().is_empty()),
            cloud_timeout: parsed(&var, "CHECKIN_CLOUD_TIMEOUT_MS")
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_CLOUD_TIMEOUT),
            roster_path: var("CHECKIN_ROSTER_PATH")
                .filter(|s| !s.trim().is_empty())
                .map(PathBuf::from),
            endpoint_quota: parsed(&var, "CHECKIN_ENDPOINT_QUOTA").unwrap_or(DEFAULT_QUOTA_PER_HOUR),
        }
    }
}

fn parsed<T: FromStr>(var: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    var(key).and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> Config {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn test_defaults() {
        let c = config(&[]);
        assert_eq!(c.model_sources.len(), 3);
        assert_eq!(c.probe_timeout, DEFAULT_PROBE_TIMEOUT);
        assert_eq!(c.match_threshold, 0.45);
        assert_eq!((c.min_face_ratio, c.max_face_ratio), (0.22, 0.60));
        assert!(c.prefer_gpu);
        assert!(c.cloud_endpoint.is_none());
        assert!(c.roster_path.is_none());
        assert_eq!(c.endpoint_quota, 100);
    }

    #[test]
    fn test_model_url_is_tried_first() {
        let c = config(&[
            ("CHECKIN_MODEL_SOURCES", "/opt/models, ,https://mirror.example/m"),
            ("CHECKIN_MODEL_URL", "https://cdn.example/m"),
        ]);
        assert_eq!(
            c.model_sources,
            vec![
                ModelSource::Remote("https://cdn.example/m".into()),
                ModelSource::Local("/opt/models".into()),
                ModelSource::Remote("https://mirror.example/m".into()),
            ]
        );
    }

    #[test]
    fn test_overrides_and_bad_values() {
        let c = config(&[
            ("CHECKIN_PROBE_TIMEOUT_MS", "1500"),
            ("CHECKIN_MATCH_THRESHOLD", "0.5"),
            ("CHECKIN_MIN_FACE_RATIO", "nope"),
            ("CHECKIN_PREFER_GPU", "0"),
            ("CHECKIN_CLOUD_ENDPOINT", "https://infer.example/api"),
            ("CHECKIN_ENDPOINT_QUOTA", "-3"),
        ]);
        assert_eq!(c.probe_timeout, Duration::from_millis(1500));
        assert_eq!(c.match_threshold, 0.5);
        assert_eq!(c.min_face_ratio, DEFAULT_MIN_FACE_RATIO);
        assert!(!c.prefer_gpu);
        assert_eq!(c.cloud_endpoint.as_deref(), Some("https://infer.example/api"));
        assert_eq!(c.endpoint_quota, DEFAULT_QUOTA_PER_HOUR);
    }
}
