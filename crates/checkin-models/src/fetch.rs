//! Asset retrieval from remote hosts and local directories.
//!
//! Both kinds of location answer with a status, a content type and a body,
//! so the resolver applies the same validation to each.

use std::fmt;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

const DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Error, Debug)]
pub enum FetchError {
    #[error("http: {0}")]
    Http(#[from] reqwest::Error),
    #[error("read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// One candidate base location for the model bundle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// `http://` or `https://` base URL.
    Remote(String),
    /// Absolute, `./`-relative, or bare relative directory.
    Local(PathBuf),
}

impl ModelSource {
    pub fn parse(location: &str) -> Self {
        let location = location.trim();
        if location.starts_with("http://") || location.starts_with("https://") {
            Self::Remote(location.to_string())
        } else {
            Self::Local(PathBuf::from(location))
        }
    }

    /// Location of `file` under this base.
    pub fn join(&self, file: &str) -> String {
        match self {
            Self::Remote(base) => {
                if base.ends_with('/') {
                    format!("{base}{file}")
                } else {
                    format!("{base}/{file}")
                }
            }
            Self::Local(dir) => dir.join(file).to_string_lossy().into_owned(),
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Remote(url) => f.write_str(url),
            Self::Local(dir) => write!(f, "{}", dir.display()),
        }
    }
}

/// A fetched file, before any validation.
#[derive(Debug, Clone)]
pub struct FetchedAsset {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
}

impl FetchedAsset {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// Retrieves files relative to a [`ModelSource`].
pub trait AssetFetcher: Clone + Send + Sync + 'static {
    fn fetch(
        &self,
        source: &ModelSource,
        file: &str,
    ) -> impl Future<Output = Result<FetchedAsset, FetchError>> + Send;
}

/// Default fetcher: HTTP via reqwest, local paths via tokio::fs.
#[derive(Clone)]
pub struct SourceFetcher {
    client: reqwest::Client,
}

impl SourceFetcher {
    pub fn new() -> Result<Self, FetchError> {
        let client = reqwest::Client::builder().timeout(DOWNLOAD_TIMEOUT).build()?;
        Ok(Self { client })
    }
}

impl AssetFetcher for SourceFetcher {
    async fn fetch(&self, source: &ModelSource, file: &str) -> Result<FetchedAsset, FetchError> {
        match source {
            ModelSource::Remote(_) => {
                let url = source.join(file);
                let response = self.client.get(&url).send().await?;
                let status = response.status().as_u16();
                let content_type = response
                    .headers()
                    .get(reqwest::header::CONTENT_TYPE)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string);
                let body = response.bytes().await?.to_vec();
                tracing::debug!(url, status, bytes = body.len(), "fetched remote asset");
                Ok(FetchedAsset { status, content_type, body })
            }
            ModelSource::Local(dir) => read_local(&dir.join(file)).await,
        }
    }
}

async fn read_local(path: &Path) -> Result<FetchedAsset, FetchError> {
    match tokio::fs::read(path).await {
        Ok(body) => Ok(FetchedAsset {
            status: 200,
            content_type: Some(content_type_for(path).to_string()),
            body,
        }),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(FetchedAsset {
            status: 404,
            content_type: None,
            body: Vec::new(),
        }),
        Err(source) => Err(FetchError::Io {
            path: path.to_path_buf(),
            source,
        }),
    }
}

fn content_type_for(path: &Path) -> &'static str {
    match path.extension().and_then(|e| e.to_str()) {
        Some("json") => "application/json",
        Some("html") | Some("htm") => "text/html",
        _ => "application/octet-stream",
    }
}
