//! Probe-vs-gallery matching.

use crate::types::{Embedding, GalleryEntry};

/// Default accept threshold on Euclidean distance.
pub const DEFAULT_MATCH_THRESHOLD: f32 = 0.6;

/// Result of matching a probe embedding against a gallery.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Owner of the closest gallery embedding, if the match was accepted.
    pub identity: Option<String>,
    /// Distance to the closest gallery embedding; `None` when nothing was compared.
    pub distance: Option<f32>,
}

impl MatchResult {
    pub fn unknown() -> Self {
        Self {
            identity: None,
            distance: None,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.identity.is_some()
    }
}

/// Strategy for comparing a probe embedding against a gallery of enrolled faces.
pub trait Matcher {
    fn identify(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult;
}

/// Nearest-neighbour matcher on Euclidean distance.
///
/// The match is accepted iff the minimum distance is `<= threshold`. Ties
/// resolve to the entry inserted first. Entries whose dimension differs from
/// the probe, or whose distance is not finite, are never candidates.
#[derive(Debug, Clone, Copy, Default)]
pub struct EuclideanMatcher;

impl Matcher for EuclideanMatcher {
    fn identify(&self, probe: &Embedding, gallery: &[GalleryEntry], threshold: f32) -> MatchResult {
        let mut best: Option<(usize, f32)> = None;

        for (i, entry) in gallery.iter().enumerate() {
            let Some(distance) = probe.euclidean_distance(&entry.embedding) else {
                continue;
            };
            if !distance.is_finite() {
                continue;
            }
            // Strict `<` keeps the earliest entry on ties.
            if best.map_or(true, |(_, d)| distance < d) {
                best = Some((i, distance));
            }
        }

        match best {
            Some((idx, distance)) if distance <= threshold => MatchResult {
                identity: Some(gallery[idx].identity.clone()),
                distance: Some(distance),
            },
            Some((_, distance)) => MatchResult {
                identity: None,
                distance: Some(distance),
            },
            None => MatchResult::unknown(),
        }
    }
}
