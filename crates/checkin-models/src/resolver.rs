//! Multi-source model resolution.
//!
//! Every candidate base is probed concurrently: manifest status, content
//! type, and JSON shape are checked before any shard is downloaded. The first
//! candidate whose complete bundle loads wins; the remaining loader tasks are
//! dropped (aborted) and their results never looked at.

use crate::fetch::{AssetFetcher, FetchError, FetchedAsset, ModelSource, SourceFetcher};
use crate::manifest::{BundleManifest, ManifestError, MANIFEST_FILE};
use checkin_core::EngineState;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinSet;

pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(4);

#[derive(Error, Debug)]
pub enum SourceFailureCause {
    #[error("fetch {file}: {source}")]
    Fetch {
        file: String,
        #[source]
        source: FetchError,
    },
    #[error("manifest probe timed out after {0:?}")]
    ProbeTimeout(Duration),
    #[error("{file}: HTTP status {status}")]
    Status { file: String, status: u16 },
    #[error("{file}: HTML fallback page served as success ({content_type})")]
    HtmlFallback { file: String, content_type: String },
    #[error("manifest does not parse: {0}")]
    Malformed(#[source] serde_json::Error),
    #[error("manifest: {0}")]
    Manifest(#[from] ManifestError),
    #[error("model {model:?}: expected {expected} bytes, got {actual}")]
    Size { model: String, expected: u64, actual: u64 },
    #[error("model {model:?}: sha256 {actual} does not match manifest {expected}")]
    Digest { model: String, expected: String, actual: String },
    #[error("loader task ended without a result: {0}")]
    Task(String),
}

/// Why one candidate was rejected.
#[derive(Debug)]
pub struct SourceFailure {
    pub location: String,
    pub cause: SourceFailureCause,
}

impl fmt::Display for SourceFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.location, self.cause)
    }
}

/// Every candidate failed; one entry per candidate, in candidate order.
#[derive(Debug)]
pub struct AcquisitionError {
    pub failures: Vec<SourceFailure>,
}

impl fmt::Display for AcquisitionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.failures.is_empty() {
            return f.write_str("no model sources configured");
        }
        write!(f, "all {} model sources failed", self.failures.len())?;
        for failure in &self.failures {
            write!(f, "\n  - {failure}")?;
        }
        Ok(())
    }
}

impl std::error::Error for AcquisitionError {}

/// Assembled model bytes keyed by model name.
#[derive(Debug, Clone)]
pub struct ModelBundle {
    version: String,
    models: HashMap<String, Vec<u8>>,
}

impl ModelBundle {
    pub fn new(version: impl Into<String>, models: HashMap<String, Vec<u8>>) -> Self {
        Self {
            version: version.into(),
            models,
        }
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn model(&self, name: &str) -> Option<&[u8]> {
        self.models.get(name).map(Vec::as_slice)
    }

    pub fn total_bytes(&self) -> usize {
        self.models.values().map(Vec::len).sum()
    }
}

/// The winning source and its loaded bundle.
#[derive(Debug)]
pub struct ResolvedSource {
    pub source: ModelSource,
    pub manifest: BundleManifest,
    pub bundle: Arc<ModelBundle>,
}

pub struct ModelSourceResolver<F: AssetFetcher = SourceFetcher> {
    fetcher: F,
    required: Arc<[String]>,
    probe_timeout: Duration,
    state: Mutex<EngineState>,
    resolved: tokio::sync::Mutex<Option<Arc<ResolvedSource>>>,
}

impl<F: AssetFetcher> ModelSourceResolver<F> {
    pub fn new(fetcher: F, required: &[&str]) -> Self {
        Self {
            fetcher,
            required: required.iter().map(|s| s.to_string()).collect(),
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            state: Mutex::new(EngineState::NotLoaded),
            resolved: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// The cached winner, if resolution has succeeded and is not in progress.
    pub fn cached(&self) -> Option<Arc<ResolvedSource>> {
        self.resolved.try_lock().ok().and_then(|guard| guard.clone())
    }

    /// Resolve the bundle from the first candidate that fully loads.
    ///
    /// Once Ready, later calls return the cached source without fetching.
    /// After a failure, calling again performs a fresh resolution.
    pub async fn resolve(&self, candidates: &[ModelSource]) -> Result<Arc<ResolvedSource>, AcquisitionError> {
        let mut cached = self.resolved.lock().await;
        if let Some(resolved) = cached.as_ref() {
            tracing::debug!(source = %resolved.source, "model bundle already resolved");
            return Ok(resolved.clone());
        }

        if self.state() == EngineState::Failed {
            tracing::info!("re-resolving model sources after previous failure");
        }
        self.set_state(EngineState::Loading);

        match self.race(candidates).await {
            Ok(resolved) => {
                tracing::info!(
                    source = %resolved.source,
                    version = resolved.bundle.version(),
                    bytes = resolved.bundle.total_bytes(),
                    "model bundle resolved"
                );
                *cached = Some(resolved.clone());
                self.set_state(EngineState::Ready);
                Ok(resolved)
            }
            Err(err) => {
                tracing::error!(error = %err, "model acquisition failed");
                self.set_state(EngineState::Failed);
                Err(err)
            }
        }
    }

    async fn race(&self, candidates: &[ModelSource]) -> Result<Arc<ResolvedSource>, AcquisitionError> {
        let mut tasks = JoinSet::new();
        for (idx, candidate) in candidates.iter().enumerate() {
            let fetcher = self.fetcher.clone();
            let required = self.required.clone();
            let source = candidate.clone();
            let timeout = self.probe_timeout;
            tasks.spawn(async move { (idx, load_candidate(&fetcher, source, &required, timeout).await) });
        }

        let mut causes: Vec<Option<SourceFailureCause>> = candidates.iter().map(|_| None).collect();

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(resolved))) => return Ok(Arc::new(resolved)),
                Ok((idx, Err(cause))) => {
                    tracing::warn!(source = %candidates[idx], error = %cause, "model source rejected");
                    causes[idx] = Some(cause);
                }
                Err(e) => tracing::warn!(error = %e, "model source loader task failed"),
            }
        }

        let failures = candidates
            .iter()
            .zip(causes)
            .map(|(candidate, cause)| SourceFailure {
                location: candidate.to_string(),
                cause: cause.unwrap_or_else(|| SourceFailureCause::Task("panicked or cancelled".into())),
            })
            .collect();
        Err(AcquisitionError { failures })
    }
}

async fn load_candidate<F: AssetFetcher>(
    fetcher: &F,
    source: ModelSource,
    required: &[String],
    probe_timeout: Duration,
) -> Result<ResolvedSource, SourceFailureCause> {
    let probe = tokio::time::timeout(probe_timeout, fetcher.fetch(&source, MANIFEST_FILE))
        .await
        .map_err(|_| SourceFailureCause::ProbeTimeout(probe_timeout))?
        .map_err(|source| SourceFailureCause::Fetch {
            file: MANIFEST_FILE.into(),
            source,
        })?;
    check_asset(MANIFEST_FILE, &probe)?;

    let manifest = BundleManifest::parse(&probe.body).map_err(SourceFailureCause::Malformed)?;
    manifest.validate(required)?;
    tracing::debug!(source = %source, version = %manifest.version, "manifest accepted");

    let mut models = HashMap::with_capacity(required.len());
    for name in required {
        let entry = &manifest.models[name];
        let mut bytes = Vec::new();
        for shard in &entry.shards {
            let asset = fetcher
                .fetch(&source, shard)
                .await
                .map_err(|e| SourceFailureCause::Fetch {
                    file: shard.clone(),
                    source: e,
                })?;
            check_asset(shard, &asset)?;
            bytes.extend_from_slice(&asset.body);
        }

        if let Some(expected) = entry.size {
            if bytes.len() as u64 != expected {
                return Err(SourceFailureCause::Size {
                    model: name.clone(),
                    expected,
                    actual: bytes.len() as u64,
                });
            }
        }
        if let Some(expected) = &entry.sha256 {
            let actual = format!("{:x}", Sha256::digest(&bytes));
            if !actual.eq_ignore_ascii_case(expected) {
                return Err(SourceFailureCause::Digest {
                    model: name.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        models.insert(name.clone(), bytes);
    }

    Ok(ResolvedSource {
        source,
        bundle: Arc::new(ModelBundle::new(manifest.version.clone(), models)),
        manifest,
    })
}

/// Status and content-type checks shared by the manifest probe and shards.
fn check_asset(file: &str, asset: &FetchedAsset) -> Result<(), SourceFailureCause> {
    if !asset.is_success() {
        return Err(SourceFailureCause::Status {
            file: file.into(),
            status: asset.status,
        });
    }

    let content_type = asset.content_type.as_deref().unwrap_or("").to_ascii_lowercase();
    if content_type.contains("text/html") || looks_like_html(&asset.body) {
        return Err(SourceFailureCause::HtmlFallback {
            file: file.into(),
            content_type: if content_type.is_empty() { "sniffed".into() } else { content_type },
        });
    }
    Ok(())
}

fn looks_like_html(body: &[u8]) -> bool {
    let start = body.iter().position(|b| !b.is_ascii_whitespace()).unwrap_or(body.len());
    let head: Vec<u8> = body[start..].iter().take(15).map(u8::to_ascii_lowercase).collect();
    head.starts_with(b"<!doctype html") || head.starts_with(b"<html")
}
