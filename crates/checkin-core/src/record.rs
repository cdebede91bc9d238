//! Enrolled identity records as exported by the roster store.
//!
//! The store keeps a descriptor as an object keyed by zero-based index
//! strings (`{"0": 0.12, "1": -0.03, ...}`). Reconstruction is strict: every
//! index in `0..DESCRIPTOR_DIM` must be present and no other key may appear.

use crate::types::{DescriptorError, FaceDescriptor, LabeledDescriptor, DESCRIPTOR_DIM};
use serde::Deserialize;
use std::collections::HashMap;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RecordError {
    #[error("roster is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("record {id}: {source}")]
    Descriptor {
        id: String,
        #[source]
        source: DescriptorError,
    },
}

/// One identity as stored by the roster collaborator.
#[derive(Debug, Clone, Deserialize)]
pub struct EnrolledRecord {
    pub id: String,
    #[serde(default)]
    pub descriptor: Option<HashMap<String, f64>>,
}

impl EnrolledRecord {
    /// Convert into a labeled descriptor; `Ok(None)` when no descriptor is stored.
    pub fn to_labeled(&self) -> Result<Option<LabeledDescriptor>, RecordError> {
        let Some(map) = &self.descriptor else {
            return Ok(None);
        };
        let descriptor = descriptor_from_index_map(map).map_err(|source| RecordError::Descriptor {
            id: self.id.clone(),
            source,
        })?;
        Ok(Some(LabeledDescriptor {
            label: self.id.clone(),
            descriptors: vec![descriptor],
        }))
    }
}

/// Rebuild an ordered descriptor from an index-keyed map.
pub fn descriptor_from_index_map(map: &HashMap<String, f64>) -> Result<FaceDescriptor, DescriptorError> {
    if let Some(key) = map.keys().find(|k| !is_index_key(k)) {
        return Err(DescriptorError::UnexpectedKey(key.clone()));
    }

    let mut values = Vec::with_capacity(DESCRIPTOR_DIM);
    for idx in 0..DESCRIPTOR_DIM {
        let value = map
            .get(&idx.to_string())
            .ok_or(DescriptorError::MissingIndex(idx))?;
        values.push(*value as f32);
    }
    FaceDescriptor::new(values)
}

fn is_index_key(key: &str) -> bool {
    // Canonical decimal only: "07" would alias "7".
    match key.parse::<usize>() {
        Ok(idx) => idx < DESCRIPTOR_DIM && idx.to_string() == key,
        Err(_) => false,
    }
}

/// Parse a roster export (a JSON array of records) into labeled descriptors.
///
/// Records without a descriptor are skipped; a malformed descriptor fails the
/// whole roster.
pub fn parse_roster(json: &[u8]) -> Result<Vec<LabeledDescriptor>, RecordError> {
    let records: Vec<EnrolledRecord> = serde_json::from_slice(json)?;
    let mut labeled = Vec::with_capacity(records.len());
    for record in &records {
        match record.to_labeled()? {
            Some(l) => labeled.push(l),
            None => tracing::debug!(id = %record.id, "record has no descriptor; skipped"),
        }
    }
    Ok(labeled)
}
