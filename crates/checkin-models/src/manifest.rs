//! Bundle manifest: which models a source serves and how they are sharded.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use thiserror::Error;

pub const MANIFEST_FILE: &str = "manifest.json";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ManifestError {
    #[error("manifest lacks required model {0:?}")]
    MissingModel(String),
    #[error("model {0:?} lists no shards")]
    NoShards(String),
    #[error("model {model:?} shard path {path:?} escapes the source base")]
    UnsafeShardPath { model: String, path: String },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BundleManifest {
    pub version: String,
    pub models: BTreeMap<String, ModelEntry>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelEntry {
    /// Shard files, relative to the source base, concatenated in order.
    pub shards: Vec<String>,
    /// Total byte length of the assembled model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    /// Lowercase hex SHA-256 of the assembled model.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

impl BundleManifest {
    pub fn parse(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }

    /// Check that every required model is listed with usable shard paths.
    pub fn validate(&self, required: &[String]) -> Result<(), ManifestError> {
        for name in required {
            let entry = self
                .models
                .get(name)
                .ok_or_else(|| ManifestError::MissingModel(name.clone()))?;
            if entry.shards.is_empty() {
                return Err(ManifestError::NoShards(name.clone()));
            }
            if let Some(path) = entry.shards.iter().find(|p| !is_safe_shard_path(p)) {
                return Err(ManifestError::UnsafeShardPath {
                    model: name.clone(),
                    path: path.clone(),
                });
            }
        }
        Ok(())
    }
}

fn is_safe_shard_path(path: &str) -> bool {
    !path.is_empty()
        && !path.starts_with('/')
        && !path.contains("://")
        && path.split('/').all(|seg| seg != "..")
}
