use checkin_core::pipeline::{self, DeepEngine, FastEngine};
use checkin_core::{DeepOutcome, DetectionBox, EngineFactory, EngineState, Frame, InferenceError, QualityGate};
use checkin_models::{ModelBundle, DEEP_DETECTOR, FAST_DETECTOR, RECOGNIZER};
use serde::Serialize;
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    Fast,
    Deep,
}

impl fmt::Display for EngineKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            EngineKind::Fast => "fast",
            EngineKind::Deep => "deep",
        })
    }
}

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("{0} engine is {1}, not ready")]
    NotReady(EngineKind, EngineState),
    #[error("{0} engine is busy with a previous frame")]
    Busy(EngineKind),
    #[error("inference failed: {0}")]
    Inference(#[from] InferenceError),
    #[error("{0} engine thread exited")]
    ChannelClosed(EngineKind),
}

#[derive(Error, Debug)]
pub enum InitError {
    #[error("model bundle lacks {0:?}")]
    MissingModel(&'static str),
    #[error("{kind} engine failed to load: {source}")]
    Load {
        kind: EngineKind,
        #[source]
        source: InferenceError,
    },
    #[error("{0} engine failed earlier; re-resolve models before retrying")]
    PreviouslyFailed(EngineKind),
    #[error("{0} engine thread exited during initialization")]
    ThreadExited(EngineKind),
}

/// Per-engine states, as reported by `Status()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct EngineStates {
    pub fast: EngineState,
    pub deep: EngineState,
}

struct FastRequest {
    frame: Arc<Frame>,
    reply: oneshot::Sender<Result<Option<DetectionBox>, InferenceError>>,
}

struct DeepRequest {
    frame: Arc<Frame>,
    gate: Option<QualityGate>,
    reply: oneshot::Sender<Result<DeepOutcome, InferenceError>>,
}

/// One engine: its load state, its request channel, and its single-flight gate.
struct EngineSlot<R> {
    kind: EngineKind,
    state: Mutex<EngineState>,
    sender: Mutex<Option<mpsc::Sender<R>>>,
    in_flight: tokio::sync::Mutex<()>,
}

impl<R: Send + 'static> EngineSlot<R> {
    fn new(kind: EngineKind) -> Self {
        Self {
            kind,
            state: Mutex::new(EngineState::NotLoaded),
            sender: Mutex::new(None),
            in_flight: tokio::sync::Mutex::new(()),
        }
    }

    fn state(&self) -> EngineState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, state: EngineState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    /// Start the engine thread unless already Ready. Failed stays Failed.
    async fn start<E: 'static>(
        &self,
        load: impl FnOnce() -> Result<E, InferenceError> + Send + 'static,
        serve: impl FnMut(&mut E, R) + Send + 'static,
    ) -> Result<(), InitError> {
        match self.state() {
            EngineState::Ready => return Ok(()),
            EngineState::Failed => return Err(InitError::PreviouslyFailed(self.kind)),
            EngineState::NotLoaded | EngineState::Loading => {}
        }

        self.set_state(EngineState::Loading);
        tracing::info!(engine = %self.kind, "engine loading");

        match spawn_engine(self.kind, load, serve).await {
            Ok(Ok(tx)) => {
                *self.sender.lock().unwrap_or_else(|e| e.into_inner()) = Some(tx);
                self.set_state(EngineState::Ready);
                tracing::info!(engine = %self.kind, "engine ready");
                Ok(())
            }
            Ok(Err(source)) => {
                self.set_state(EngineState::Failed);
                Err(InitError::Load { kind: self.kind, source })
            }
            Err(_) => {
                self.set_state(EngineState::Failed);
                Err(InitError::ThreadExited(self.kind))
            }
        }
    }

    fn reset(&self) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if *state == EngineState::Failed {
            *state = EngineState::NotLoaded;
            self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
            tracing::info!(engine = %self.kind, "failed engine reset for a fresh load");
        }
    }

    /// Send one request and await its reply, holding the single-flight permit throughout.
    async fn call<T>(
        &self,
        wait: bool,
        request: impl FnOnce(oneshot::Sender<T>) -> R,
    ) -> Result<T, EngineError> {
        let tx = match self.state() {
            EngineState::Ready => self
                .sender
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .clone()
                .ok_or(EngineError::ChannelClosed(self.kind))?,
            other => return Err(EngineError::NotReady(self.kind, other)),
        };

        let _permit = if wait {
            self.in_flight.lock().await
        } else {
            self.in_flight
                .try_lock()
                .map_err(|_| EngineError::Busy(self.kind))?
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if tx.send(request(reply_tx)).await.is_err() {
            return Err(self.engine_lost());
        }
        reply_rx.await.map_err(|_| self.engine_lost())
    }

    /// The engine thread is gone; mark the slot Failed so `reset` and `init` can reload it.
    fn engine_lost(&self) -> EngineError {
        self.sender.lock().unwrap_or_else(|e| e.into_inner()).take();
        self.set_state(EngineState::Failed);
        tracing::error!(engine = %self.kind, "engine thread exited; marked failed");
        EngineError::ChannelClosed(self.kind)
    }
}

/// Spawn an engine on a dedicated OS thread.
///
/// The engine is loaded on that thread; the returned receiver yields the
/// request sender once loading succeeds, or the load error.
fn spawn_engine<E: 'static, R: Send + 'static>(
    kind: EngineKind,
    load: impl FnOnce() -> Result<E, InferenceError> + Send + 'static,
    mut serve: impl FnMut(&mut E, R) + Send + 'static,
) -> oneshot::Receiver<Result<mpsc::Sender<R>, InferenceError>> {
    let (ready_tx, ready_rx) = oneshot::channel();

    let spawned = std::thread::Builder::new()
        .name(format!("checkin-{kind}"))
        .spawn(move || {
            let mut engine = match load() {
                Ok(engine) => engine,
                Err(e) => {
                    tracing::error!(engine = %kind, error = %e, "engine load failed");
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            let (tx, mut rx) = mpsc::channel::<R>(1);
            if ready_tx.send(Ok(tx)).is_err() {
                return;
            }

            tracing::info!(engine = %kind, "engine thread started");
            while let Some(req) = rx.blocking_recv() {
                serve(&mut engine, req);
            }
            tracing::info!(engine = %kind, "engine thread exiting");
        });

    // On spawn failure the closure (and ready_tx) is dropped, so the
    // receiver resolves to an error.
    if let Err(e) = spawned {
        tracing::error!(engine = %kind, error = %e, "failed to spawn engine thread");
    }

    ready_rx
}

/// Owns both engines and their lifecycles.
pub struct DetectionOrchestrator {
    factory: Arc<dyn EngineFactory>,
    fast: EngineSlot<FastRequest>,
    deep: EngineSlot<DeepRequest>,
    init_lock: tokio::sync::Mutex<()>,
}

impl DetectionOrchestrator {
    pub fn new(factory: Arc<dyn EngineFactory>) -> Self {
        Self {
            factory,
            fast: EngineSlot::new(EngineKind::Fast),
            deep: EngineSlot::new(EngineKind::Deep),
            init_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn states(&self) -> EngineStates {
        EngineStates {
            fast: self.fast.state(),
            deep: self.deep.state(),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.fast.state() == EngineState::Ready && self.deep.state() == EngineState::Ready
    }

    /// Load both engines concurrently; succeeds only when both are Ready.
    ///
    /// A no-op once Ready. An engine that failed stays Failed until [`reset`](Self::reset).
    pub async fn init(&self, bundle: Arc<ModelBundle>) -> Result<(), InitError> {
        let _guard = self.init_lock.lock().await;
        if self.is_ready() {
            tracing::debug!("engines already ready");
            return Ok(());
        }

        for name in [FAST_DETECTOR, DEEP_DETECTOR, RECOGNIZER] {
            if bundle.model(name).is_none() {
                return Err(InitError::MissingModel(name));
            }
        }

        let fast_factory = self.factory.clone();
        let fast_bundle = bundle.clone();
        let fast = self.fast.start(
            move || fast_factory.load_fast(model_bytes(&fast_bundle, FAST_DETECTOR)?),
            |engine: &mut Box<dyn FastEngine>, req: FastRequest| {
                let result = contain_panic(EngineKind::Fast, || engine.detect(&req.frame));
                let _ = req.reply.send(result);
            },
        );

        let deep_factory = self.factory.clone();
        let deep = self.deep.start(
            move || {
                deep_factory.load_deep(
                    model_bytes(&bundle, DEEP_DETECTOR)?,
                    model_bytes(&bundle, RECOGNIZER)?,
                )
            },
            |engine: &mut Box<dyn DeepEngine>, req: DeepRequest| {
                let result = contain_panic(EngineKind::Deep, || {
                    pipeline::run_deep(engine.as_mut(), &req.frame, req.gate.as_ref())
                });
                let _ = req.reply.send(result);
            },
        );

        let (fast, deep) = tokio::join!(fast, deep);
        for err in [&fast, &deep].into_iter().filter_map(|r| r.as_ref().err()) {
            tracing::error!(error = %err, "engine initialization failed");
        }
        fast.and(deep)
    }

    /// Return Failed engines to NotLoaded so a freshly resolved bundle can load them.
    pub fn reset(&self) {
        self.fast.reset();
        self.deep.reset();
    }

    /// Fast tracking detection, waiting for any in-flight fast call.
    pub async fn detect_fast(&self, frame: Arc<Frame>) -> Result<Option<DetectionBox>, EngineError> {
        Ok(self.fast.call(true, |reply| FastRequest { frame, reply }).await??)
    }

    /// Fast tracking detection that returns `Busy` instead of waiting.
    pub async fn try_detect_fast(&self, frame: Arc<Frame>) -> Result<Option<DetectionBox>, EngineError> {
        Ok(self.fast.call(false, |reply| FastRequest { frame, reply }).await??)
    }

    /// Deep detect → align → describe, gated between detection and extraction.
    pub async fn detect_deep(
        &self,
        frame: Arc<Frame>,
        gate: Option<QualityGate>,
    ) -> Result<DeepOutcome, EngineError> {
        Ok(self.deep.call(true, |reply| DeepRequest { frame, gate, reply }).await??)
    }
}

/// Run one frame through an engine, turning a panic into an inference error
/// so the engine thread survives it.
fn contain_panic<T>(kind: EngineKind, run: impl FnOnce() -> Result<T, InferenceError>) -> Result<T, InferenceError> {
    panic::catch_unwind(AssertUnwindSafe(run)).unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        tracing::error!(engine = %kind, panic = %message, "engine panicked on a frame");
        Err(InferenceError::Other(format!("{kind} engine panicked: {message}")))
    })
}

fn model_bytes<'a>(bundle: &'a ModelBundle, name: &str) -> Result<&'a [u8], InferenceError> {
    bundle
        .model(name)
        .ok_or_else(|| InferenceError::Other(format!("model bundle lacks {name:?}")))
}
