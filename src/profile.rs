// Profiling solver - fingerprint matching in delay space
//
// Instead of converting delays to distances, each known datacenter gets a
// fingerprint: the vector of second-hop delays from its front-end to every
// other datacenter's baseline file. A target is matched to the candidate
// whose fingerprint is most cosine-similar to the target's observed delay
// vector. Relative timing patterns survive rate-model error, which makes
// this the right tool when propagation-speed assumptions are shaky.

use std::collections::HashMap;

use tracing::debug;

use crate::dataset::{ClosestRefs, Dataset};
use crate::delays::DelayTable;

/// Shared dimensions required before a cosine similarity is meaningful;
/// a single dimension always scores 1.0.
pub const MIN_SHARED_DIMS: usize = 2;

/// Per-datacenter delay fingerprints, kept in datacenter input order so
/// that equal-similarity ties resolve first-encountered-wins.
#[derive(Debug, Clone)]
pub struct FingerprintIndex {
    fingerprints: Vec<(String, HashMap<String, f64>)>,
}

/// Result of matching a target's delay vector against the index.
#[derive(Debug, Clone)]
pub struct ProfileMatch {
    pub datacenter: String,
    pub similarity: f64,
}

/// Builds the fingerprint of every datacenter that hosts a front-end.
///
/// Dimension key is the name of the *other* datacenter; the value is the
/// extracted one-way delay from this datacenter's front-end to that
/// datacenter's baseline file. Suspect pairs are left out.
pub fn build_fingerprints(
    dataset: &Dataset,
    refs: &ClosestRefs,
    delays: &DelayTable,
) -> FingerprintIndex {
    let mut fingerprints = Vec::new();

    for datacenter in &dataset.datacenters {
        let Some(own_frontend) = dataset.frontend_in(&datacenter.name) else {
            continue;
        };

        let mut dims = HashMap::new();
        for other in &dataset.datacenters {
            if other.name == datacenter.name {
                continue;
            }
            let Some(other_frontend) = dataset.frontend_in(&other.name) else {
                continue;
            };
            let baseline = &refs.baseline_for_frontend[&other_frontend.name];
            if let Some(delay) = delays.usable(&own_frontend.name, baseline) {
                dims.insert(other.name.clone(), delay);
            }
        }

        debug!(
            datacenter = %datacenter.name,
            dims = dims.len(),
            "built delay fingerprint"
        );
        fingerprints.push((datacenter.name.clone(), dims));
    }

    FingerprintIndex { fingerprints }
}

impl FingerprintIndex {
    /// Matches a feature vector (delay per datacenter whose front-end
    /// observed the target) against all candidate fingerprints.
    ///
    /// Similarity is computed over the dimensions present in the feature
    /// vector; candidates sharing fewer than [`MIN_SHARED_DIMS`] dimensions
    /// are skipped. Returns `None` when no candidate qualifies.
    pub fn match_target(&self, features: &HashMap<String, f64>) -> Option<ProfileMatch> {
        let mut best: Option<ProfileMatch> = None;

        for (candidate, fingerprint) in &self.fingerprints {
            let Some(similarity) = cosine_over_shared(features, fingerprint) else {
                continue;
            };
            debug!(candidate = %candidate, similarity, "fingerprint similarity");
            if best.as_ref().map_or(true, |b| similarity > b.similarity) {
                best = Some(ProfileMatch {
                    datacenter: candidate.clone(),
                    similarity,
                });
            }
        }

        best
    }

    /// A copy of the index keeping only the named candidates, in the
    /// original order. Learn-only datacenters calibrate fingerprints but
    /// are never offered as a match.
    pub fn restrict<'a>(&self, allowed: impl IntoIterator<Item = &'a str>) -> FingerprintIndex {
        let allowed: std::collections::HashSet<&str> = allowed.into_iter().collect();
        FingerprintIndex {
            fingerprints: self
                .fingerprints
                .iter()
                .filter(|(name, _)| allowed.contains(name.as_str()))
                .cloned()
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }
}

/// Cosine similarity restricted to the feature vector's dimensions.
fn cosine_over_shared(
    features: &HashMap<String, f64>,
    fingerprint: &HashMap<String, f64>,
) -> Option<f64> {
    let mut dot = 0.0;
    let mut feature_sq = 0.0;
    let mut fingerprint_sq = 0.0;
    let mut shared = 0usize;

    for (dim, &a) in features {
        let Some(&b) = fingerprint.get(dim) else {
            continue;
        };
        shared += 1;
        dot += a * b;
        feature_sq += a * a;
        fingerprint_sq += b * b;
    }

    if shared < MIN_SHARED_DIMS {
        return None;
    }
    let denom = feature_sq.sqrt() * fingerprint_sq.sqrt();
    if denom == 0.0 {
        return None;
    }
    Some(dot / denom)
}
