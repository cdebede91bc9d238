//! Nearest-neighbor identification against enrolled descriptors.

use crate::types::{FaceDescriptor, LabeledDescriptor, MatchLabel, MatchResult};

/// Maximum Euclidean distance for a positive identification.
pub const DEFAULT_MATCH_THRESHOLD: f64 = 0.45;

/// Immutable query handle over one snapshot of the enrolled set.
///
/// Built once per roster; a roster change builds a new handle rather than
/// mutating this one.
#[derive(Debug, Clone)]
pub struct FaceMatcher {
    references: Vec<LabeledDescriptor>,
    threshold: f64,
}

impl FaceMatcher {
    /// Build a matcher, dropping identities without any descriptor.
    ///
    /// Returns `None` when nothing is left to match against.
    pub fn build(identities: impl IntoIterator<Item = LabeledDescriptor>) -> Option<Self> {
        let references: Vec<LabeledDescriptor> = identities
            .into_iter()
            .filter(|identity| !identity.descriptors.is_empty())
            .collect();

        if references.is_empty() {
            return None;
        }

        tracing::debug!(identities = references.len(), "matcher built");
        Some(Self {
            references,
            threshold: DEFAULT_MATCH_THRESHOLD,
        })
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    pub fn threshold(&self) -> f64 {
        self.threshold
    }

    /// Number of enrolled identities.
    pub fn len(&self) -> usize {
        self.references.len()
    }

    pub fn is_empty(&self) -> bool {
        self.references.is_empty()
    }

    /// Classify a probe by its globally nearest reference descriptor.
    ///
    /// Every reference is visited; ties keep the earliest identity.
    pub fn match_descriptor(&self, probe: &FaceDescriptor) -> MatchResult {
        let mut best_distance = f64::INFINITY;
        let mut best_idx = 0;

        for (i, identity) in self.references.iter().enumerate() {
            for reference in &identity.descriptors {
                let distance = probe.distance(reference);
                if distance < best_distance {
                    best_distance = distance;
                    best_idx = i;
                }
            }
        }

        let label = if best_distance <= self.threshold {
            MatchLabel::Identity(self.references[best_idx].label.clone())
        } else {
            MatchLabel::Unknown
        };

        MatchResult {
            label,
            distance: best_distance,
        }
    }
}
