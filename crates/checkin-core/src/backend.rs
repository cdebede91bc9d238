//! ONNX Runtime session construction with accelerated-backend fallback.

use ort::execution_providers::CUDAExecutionProvider;
use ort::session::Session;
use serde::Serialize;

const INTRA_THREADS: usize = 2;

/// Execution backend a session ended up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionBackend {
    Accelerated,
    Default,
}

/// Build a session from in-memory model bytes.
///
/// With `prefer_accelerated`, CUDA is tried first; any failure there is
/// logged and the session is rebuilt on the default CPU backend. Only a
/// failure of the default backend is returned.
pub fn build_session(
    model: &[u8],
    label: &str,
    prefer_accelerated: bool,
) -> Result<(Session, ExecutionBackend), ort::Error> {
    if prefer_accelerated {
        match build_accelerated(model) {
            Ok(session) => {
                tracing::info!(model = label, "session on accelerated backend");
                return Ok((session, ExecutionBackend::Accelerated));
            }
            Err(e) => {
                tracing::warn!(
                    model = label,
                    error = %e,
                    "accelerated backend unavailable; falling back to default"
                );
            }
        }
    }

    let session = Session::builder()?
        .with_intra_threads(INTRA_THREADS)?
        .commit_from_memory(model)?;
    tracing::info!(model = label, "session on default backend");
    Ok((session, ExecutionBackend::Default))
}

fn build_accelerated(model: &[u8]) -> Result<Session, ort::Error> {
    Session::builder()?
        .with_execution_providers([CUDAExecutionProvider::default().build().error_on_failure()])?
        .with_intra_threads(INTRA_THREADS)?
        .commit_from_memory(model)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backend_wire_names() {
        assert_eq!(
            serde_json::to_string(&ExecutionBackend::Accelerated).unwrap(),
            "\"accelerated\""
        );
        assert_eq!(serde_json::to_string(&ExecutionBackend::Default).unwrap(), "\"default\"");
    }
}
