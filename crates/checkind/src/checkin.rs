//! Identity check-in: frame → quality gate → descriptor → matcher.

use crate::cloud::{CloudError, CloudOffloadClient, CloudOutcome};
use crate::orchestrator::{DetectionOrchestrator, EngineError};
use checkin_core::record::{parse_roster, RecordError};
use checkin_core::{
    DeepOutcome, DetectionBox, FaceDescriptor, FaceMatcher, Frame, LabeledDescriptor, MatchLabel, QualityGate,
    QualityVerdict,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, RwLock};
use thiserror::Error;

/// Where the identity descriptor is computed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Route {
    Local,
    Cloud,
}

impl FromStr for Route {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "local" => Ok(Route::Local),
            "cloud" => Ok(Route::Cloud),
            other => Err(format!("unknown route {other:?} (expected \"local\" or \"cloud\")")),
        }
    }
}

/// Outcome of one identify attempt. Negative outcomes are not errors.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Verdict {
    Match { label: String, distance: f64 },
    Unknown { distance: f64 },
    Rejected { quality: QualityVerdict },
    NoFace,
    NoRoster,
}

/// Tracking feedback for the interactive surface.
#[derive(Debug, Clone, Serialize)]
pub struct Tracking {
    pub face: Option<DetectionBox>,
    pub quality: Option<QualityVerdict>,
}

#[derive(Error, Debug)]
pub enum CheckInError {
    #[error("cloud offload is not configured")]
    CloudDisabled,
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

#[derive(Error, Debug)]
pub enum RosterError {
    #[error("read roster {}: {source}", path.display())]
    Io {
        path: std::path::PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error(transparent)]
    Record(#[from] RecordError),
}

pub struct CheckIn {
    orchestrator: Arc<DetectionOrchestrator>,
    cloud: Option<CloudOffloadClient>,
    gate: QualityGate,
    threshold: f64,
    matcher: RwLock<Option<Arc<FaceMatcher>>>,
}

impl CheckIn {
    pub fn new(
        orchestrator: Arc<DetectionOrchestrator>,
        cloud: Option<CloudOffloadClient>,
        gate: QualityGate,
        threshold: f64,
    ) -> Self {
        Self {
            orchestrator,
            cloud,
            gate,
            threshold,
            matcher: RwLock::new(None),
        }
    }

    pub fn orchestrator(&self) -> &Arc<DetectionOrchestrator> {
        &self.orchestrator
    }

    pub fn cloud_enabled(&self) -> bool {
        self.cloud.is_some()
    }

    /// Current matcher snapshot. Callers keep using it even if a rebuild lands.
    pub fn matcher(&self) -> Option<Arc<FaceMatcher>> {
        self.matcher.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Identities in the current matcher.
    pub fn enrolled(&self) -> usize {
        self.matcher().map_or(0, |m| m.len())
    }

    /// Build a fresh matcher and swap it in whole. Returns the identity count.
    pub fn replace_roster(&self, identities: Vec<LabeledDescriptor>) -> usize {
        let matcher = FaceMatcher::build(identities).map(|m| Arc::new(m.with_threshold(self.threshold)));
        let count = matcher.as_ref().map_or(0, |m| m.len());
        *self.matcher.write().unwrap_or_else(|e| e.into_inner()) = matcher;
        tracing::info!(identities = count, threshold = self.threshold, "roster replaced");
        count
    }

    pub fn load_roster_file(&self, path: &Path) -> Result<usize, RosterError> {
        let bytes = std::fs::read(path).map_err(|source| RosterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let identities = parse_roster(&bytes)?;
        Ok(self.replace_roster(identities))
    }

    /// Fast-engine tracking; drops the frame with `Busy` rather than queueing.
    pub async fn track(&self, frame: Arc<Frame>) -> Result<Tracking, EngineError> {
        let width = frame.width();
        let face = self.orchestrator.try_detect_fast(frame).await?;
        let quality = face.as_ref().map(|f| self.gate.evaluate(f, width));
        Ok(Tracking { face, quality })
    }

    pub async fn identify(&self, frame: Arc<Frame>, route: Route) -> Result<Verdict, CheckInError> {
        let Some(matcher) = self.matcher() else {
            tracing::debug!("identify: no enrolled identities");
            return Ok(Verdict::NoRoster);
        };

        let descriptor = match route {
            Route::Local => match self.local_descriptor(frame).await? {
                Ok(descriptor) => descriptor,
                Err(verdict) => return Ok(verdict),
            },
            Route::Cloud => match self.cloud_descriptor(frame).await? {
                Ok(descriptor) => descriptor,
                Err(verdict) => return Ok(verdict),
            },
        };

        let result = matcher.match_descriptor(&descriptor);
        tracing::info!(
            route = ?route,
            label = %result.label,
            distance = result.distance,
            "identify: matched"
        );
        Ok(match result.label {
            MatchLabel::Identity(label) => Verdict::Match {
                label,
                distance: result.distance,
            },
            MatchLabel::Unknown => Verdict::Unknown {
                distance: result.distance,
            },
        })
    }

    /// Deep engine, gated between detection and extraction.
    async fn local_descriptor(&self, frame: Arc<Frame>) -> Result<Result<FaceDescriptor, Verdict>, CheckInError> {
        Ok(match self.orchestrator.detect_deep(frame, Some(self.gate)).await? {
            DeepOutcome::Described(detection) => Ok(detection.descriptor),
            DeepOutcome::Rejected { verdict, .. } => Err(Verdict::Rejected { quality: verdict }),
            DeepOutcome::NoFace => Err(Verdict::NoFace),
        })
    }

    /// Remote extraction, gated on the fast engine's box before upload.
    async fn cloud_descriptor(&self, frame: Arc<Frame>) -> Result<Result<FaceDescriptor, Verdict>, CheckInError> {
        let cloud = self.cloud.as_ref().ok_or(CheckInError::CloudDisabled)?;

        let Some(face) = self.orchestrator.detect_fast(frame.clone()).await? else {
            return Ok(Err(Verdict::NoFace));
        };
        let quality = self.gate.evaluate(&face, frame.width());
        if !quality.accepted {
            return Ok(Err(Verdict::Rejected { quality }));
        }

        Ok(match cloud.infer(&frame).await? {
            CloudOutcome::Descriptor(descriptor) => Ok(descriptor),
            CloudOutcome::NoFace(message) => {
                tracing::debug!(message, "identify: cloud found no face");
                Err(Verdict::NoFace)
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{frame, ready_orchestrator, StubFactory, FAILING_FRAME_WIDTH};
    use checkin_core::{QualityReason, DEFAULT_MATCH_THRESHOLD, DESCRIPTOR_DIM};
    use std::time::Duration;

    fn identity(label: &str, values: Vec<f32>) -> LabeledDescriptor {
        LabeledDescriptor {
            label: label.into(),
            descriptors: vec![FaceDescriptor::new(values).unwrap()],
        }
    }

    async fn service(factory: StubFactory) -> CheckIn {
        CheckIn::new(
            ready_orchestrator(factory).await,
            None,
            QualityGate::default(),
            DEFAULT_MATCH_THRESHOLD,
        )
    }

    #[test]
    fn test_route_parse() {
        assert_eq!("".parse::<Route>().unwrap(), Route::Local);
        assert_eq!("Cloud".parse::<Route>().unwrap(), Route::Cloud);
        assert!("edge".parse::<Route>().is_err());
    }

    #[tokio::test]
    async fn test_identify_without_roster() {
        let checkin = service(StubFactory::default()).await;
        let verdict = checkin.identify(frame(100, 100), Route::Local).await.unwrap();
        assert_eq!(verdict, Verdict::NoRoster);
    }

    #[tokio::test]
    async fn test_local_identify_exact_match() {
        let checkin = service(StubFactory::default()).await;
        checkin.replace_roster(vec![identity("U1", vec![0.0; DESCRIPTOR_DIM])]);

        let verdict = checkin.identify(frame(100, 100), Route::Local).await.unwrap();
        assert_eq!(
            verdict,
            Verdict::Match {
                label: "U1".into(),
                distance: 0.0
            }
        );
    }

    #[tokio::test]
    async fn test_local_identify_far_descriptor_is_unknown() {
        let mut values = vec![0.0; DESCRIPTOR_DIM];
        values[0] = 10.0;
        let checkin = service(StubFactory { descriptor: values, ..StubFactory::default() }).await;
        checkin.replace_roster(vec![identity("U1", vec![0.0; DESCRIPTOR_DIM])]);

        let verdict = checkin.identify(frame(100, 100), Route::Local).await.unwrap();
        assert_eq!(verdict, Verdict::Unknown { distance: 10.0 });
    }

    #[tokio::test]
    async fn test_local_identify_gates_small_face() {
        let checkin = service(StubFactory { deep_width: Some(10.0), ..StubFactory::default() }).await;
        checkin.replace_roster(vec![identity("U1", vec![0.0; DESCRIPTOR_DIM])]);

        match checkin.identify(frame(100, 100), Route::Local).await.unwrap() {
            Verdict::Rejected { quality } => {
                assert!(!quality.accepted);
                assert_eq!(quality.reason, Some(QualityReason::TooFar));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_local_identify_no_face() {
        let checkin = service(StubFactory { deep_width: None, ..StubFactory::default() }).await;
        checkin.replace_roster(vec![identity("U1", vec![0.0; DESCRIPTOR_DIM])]);
        let verdict = checkin.identify(frame(100, 100), Route::Local).await.unwrap();
        assert_eq!(verdict, Verdict::NoFace);
    }

    #[tokio::test]
    async fn test_inference_failure_surfaces_and_engine_recovers() {
        let checkin = service(StubFactory::default()).await;
        checkin.replace_roster(vec![identity("U1", vec![0.0; DESCRIPTOR_DIM])]);

        let err = checkin
            .identify(frame(FAILING_FRAME_WIDTH, 100), Route::Local)
            .await
            .unwrap_err();
        assert!(matches!(err, CheckInError::Engine(EngineError::Inference(_))));

        let verdict = checkin.identify(frame(100, 100), Route::Local).await.unwrap();
        assert!(matches!(verdict, Verdict::Match { .. }));
    }

    #[tokio::test]
    async fn test_cloud_route_requires_client() {
        let checkin = service(StubFactory::default()).await;
        checkin.replace_roster(vec![identity("U1", vec![0.0; DESCRIPTOR_DIM])]);
        let err = checkin.identify(frame(100, 100), Route::Cloud).await.unwrap_err();
        assert!(matches!(err, CheckInError::CloudDisabled));
    }

    #[tokio::test]
    async fn test_cloud_route_gates_before_upload() {
        // The endpoint is unreachable; a gated frame must never try to reach it.
        let client = CloudOffloadClient::new("http://127.0.0.1:9/infer", Duration::from_millis(200)).unwrap();
        let checkin = CheckIn::new(
            ready_orchestrator(StubFactory { fast_width: Some(90.0), ..StubFactory::default() }).await,
            Some(client),
            QualityGate::default(),
            DEFAULT_MATCH_THRESHOLD,
        );
        checkin.replace_roster(vec![identity("U1", vec![0.0; DESCRIPTOR_DIM])]);

        match checkin.identify(frame(100, 100), Route::Cloud).await.unwrap() {
            Verdict::Rejected { quality } => assert_eq!(quality.reason, Some(QualityReason::TooClose)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_cloud_transport_failure_is_error() {
        let client = CloudOffloadClient::new("http://127.0.0.1:9/infer", Duration::from_millis(500)).unwrap();
        let checkin = CheckIn::new(
            ready_orchestrator(StubFactory::default()).await,
            Some(client),
            QualityGate::default(),
            DEFAULT_MATCH_THRESHOLD,
        );
        checkin.replace_roster(vec![identity("U1", vec![0.0; DESCRIPTOR_DIM])]);

        let err = checkin.identify(frame(100, 100), Route::Cloud).await.unwrap_err();
        assert!(matches!(err, CheckInError::Cloud(CloudError::Transport(_))));
    }

    #[tokio::test]
    async fn test_replace_roster_swaps_whole_matcher() {
        let checkin = service(StubFactory::default()).await;
        assert_eq!(checkin.replace_roster(vec![identity("U1", vec![0.0; DESCRIPTOR_DIM])]), 1);
        let before = checkin.matcher().unwrap();

        assert_eq!(
            checkin.replace_roster(vec![
                identity("U2", vec![1.0; DESCRIPTOR_DIM]),
                identity("U3", vec![2.0; DESCRIPTOR_DIM]),
            ]),
            2
        );
        assert_eq!(before.len(), 1, "earlier snapshot is untouched");
        assert_eq!(checkin.enrolled(), 2);

        assert_eq!(checkin.replace_roster(Vec::new()), 0);
        assert!(checkin.matcher().is_none());
    }

    #[tokio::test]
    async fn test_track_reports_gate_verdict() {
        let checkin = service(StubFactory::default()).await;
        let tracking = checkin.track(frame(100, 100)).await.unwrap();
        assert!(tracking.face.is_some());
        assert!(tracking.quality.unwrap().accepted);
    }

    #[tokio::test]
    async fn test_load_roster_file() {
        let dir = std::env::temp_dir().join(format!("checkin-roster-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("roster.json");

        let descriptor: serde_json::Map<String, serde_json::Value> =
            (0..DESCRIPTOR_DIM).map(|i| (i.to_string(), serde_json::json!(0.0))).collect();
        let roster = serde_json::json!([
            { "id": "U1", "descriptor": descriptor },
            { "id": "U2" }
        ]);
        std::fs::write(&path, serde_json::to_vec(&roster).unwrap()).unwrap();

        let checkin = service(StubFactory::default()).await;
        assert_eq!(checkin.load_roster_file(&path).unwrap(), 1);
        assert!(matches!(
            checkin.load_roster_file(&dir.join("missing.json")),
            Err(RosterError::Io { .. })
        ));

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
