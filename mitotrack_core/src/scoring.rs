//! The Scoring Function - pairwise linking penalty
//!
//! Computes a lower-is-better penalty between two components in different
//! frames from four terms:
//! 1. Shape: normalized differences of area and circularity
//! 2. Intensity: normalized difference of mean intensity
//! 3. Distance: centroid distance relative to the search radius and to the
//!    closest distance found in the pair's local neighbourhood
//! 4. Overlap: `1 - IoU` of the pixel footprints
//!
//! Every term lies in [0, 1] and the weights are normalized to sum to 1, so a
//! scored pair always lands in [0, 1]. Pairs beyond the radius get `REJECT_SCORE`.

use serde::{Deserialize, Serialize};

use crate::component::Component;

/// Sentinel penalty for pairs that must never link.
pub const REJECT_SCORE: f64 = 100.0;

/// Symmetric normalized difference `|a - b| / sqrt(a² + b²)`, in [0, 1].
///
/// Two zeros are identical and give 0.
#[inline]
pub fn normalized_difference(a: f64, b: f64) -> f64 {
    let norm = (a * a + b * b).sqrt();
    if norm < f64::EPSILON {
        0.0
    } else {
        ((a - b).abs() / norm).min(1.0)
    }
}

/// Weights of the linking penalty terms.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ScoreWeights {
    pub area: f64,
    pub circularity: f64,
    pub intensity: f64,
    pub distance: f64,
    pub overlap: f64,
}

impl Default for ScoreWeights {
    fn default() -> Self {
        Self {
            area: 0.2,
            circularity: 0.1,
            intensity: 0.15,
            distance: 0.4,
            overlap: 0.15,
        }
    }
}

impl ScoreWeights {
    /// Weights rescaled to sum to 1. All-zero weights fall back to the defaults.
    pub fn normalized(&self) -> ScoreWeights {
        let sum = self.area + self.circularity + self.intensity + self.distance + self.overlap;
        if sum <= f64::EPSILON {
            return ScoreWeights::default().normalized();
        }
        ScoreWeights {
            area: self.area / sum,
            circularity: self.circularity / sum,
            intensity: self.intensity / sum,
            distance: self.distance / sum,
            overlap: self.overlap / sum,
        }
    }
}

/// Per-pair context the linker computes once both frames are known.
#[derive(Debug, Clone, Copy)]
pub struct ScoreContext {
    /// Maximum centroid distance for a link
    pub max_radius: f64,

    /// Smallest nearest-neighbour distance seen from either side of the pair.
    ///
    /// Makes close-packed neighbourhoods comparable to sparse ones.
    pub local_min_distance: f64,
}

impl ScoreContext {
    /// Context that ignores the neighbourhood term (the pair is its own neighbourhood).
    pub fn isolated(max_radius: f64, pair_distance: f64) -> Self {
        Self {
            max_radius,
            local_min_distance: pair_distance,
        }
    }
}

/// Breakdown of a penalty, kept for diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ScoreTerms {
    pub area: f64,
    pub circularity: f64,
    pub intensity: f64,
    pub distance: f64,
    pub overlap: f64,
}

impl ScoreTerms {
    pub fn weighted(&self, w: &ScoreWeights) -> f64 {
        self.area * w.area
            + self.circularity * w.circularity
            + self.intensity * w.intensity
            + self.distance * w.distance
            + self.overlap * w.overlap
    }
}

/// Compute the individual penalty terms, or `None` if the pair is out of range.
pub fn score_terms(a: &Component, b: &Component, ctx: &ScoreContext) -> Option<ScoreTerms> {
    let d = a.distance_to(b);
    if d > ctx.max_radius {
        return None;
    }

    let radial = if ctx.max_radius > f64::EPSILON {
        d / ctx.max_radius
    } else {
        0.0
    };
    let relative = normalized_difference(d, ctx.local_min_distance.min(d));

    // Footprint-less components carry no overlap information.
    let overlap = if a.footprint.is_empty() || b.footprint.is_empty() {
        0.0
    } else if !a.bbox.intersects(&b.bbox) {
        1.0
    } else {
        1.0 - a.footprint.iou(&b.footprint)
    };

    Some(ScoreTerms {
        area: normalized_difference(a.area, b.area),
        circularity: normalized_difference(a.circularity, b.circularity),
        intensity: normalized_difference(a.avg_intensity, b.avg_intensity),
        distance: 0.5 * radial + 0.5 * relative,
        overlap,
    })
}

/// Linking penalty between two components. Lower is better.
///
/// Returns `REJECT_SCORE` when the centroids are farther apart than the radius.
pub fn score(a: &Component, b: &Component, ctx: &ScoreContext, weights: &ScoreWeights) -> f64 {
    match score_terms(a, b, ctx) {
        Some(terms) => terms.weighted(&weights.normalized()),
        None => REJECT_SCORE,
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::Footprint;
    use approx::assert_relative_eq;
    use nalgebra::Point2;

    fn blob(x: f64, y: f64, r: f64, intensity: f64) -> Component {
        let fp = Footprint::disk(Point2::new(x, y), r, 128, 128);
        Component::from_footprint(Point2::new(x, y), fp, intensity, 0.9)
    }

    #[test]
    fn test_normalized_difference_range() {
        assert_eq!(normalized_difference(0.0, 0.0), 0.0);
        assert_eq!(normalized_difference(5.0, 5.0), 0.0);
        assert_relative_eq!(normalized_difference(1.0, 0.0), 1.0);
        assert_relative_eq!(normalized_difference(3.0, 4.0), 1.0 / 5.0);
        assert_eq!(normalized_difference(3.0, 4.0), normalized_difference(4.0, 3.0));
    }

    #[test]
    fn test_weights_normalize_to_one() {
        let w = ScoreWeights {
            area: 2.0,
            circularity: 2.0,
            intensity: 2.0,
            distance: 2.0,
            overlap: 2.0,
        }
        .normalized();
        let sum = w.area + w.circularity + w.intensity + w.distance + w.overlap;
        assert_relative_eq!(sum, 1.0);
        assert_relative_eq!(w.area, 0.2);
    }

    #[test]
    fn test_score_identical_is_zero() {
        let a = blob(20.0, 20.0, 5.0, 100.0);
        let ctx = ScoreContext::isolated(20.0, 0.0);
        assert_relative_eq!(score(&a, &a, &ctx, &ScoreWeights::default()), 0.0);
    }

    #[test]
    fn test_score_symmetric_and_bounded() {
        let a = blob(20.0, 20.0, 5.0, 100.0);
        let b = blob(24.0, 22.0, 6.0, 80.0);
        let ctx = ScoreContext {
            max_radius: 20.0,
            local_min_distance: 2.0,
        };
        let w = ScoreWeights::default();

        let ab = score(&a, &b, &ctx, &w);
        let ba = score(&b, &a, &ctx, &w);
        assert_relative_eq!(ab, ba);
        assert!(ab > 0.0 && ab <= 1.0, "score {} out of range", ab);
    }

    #[test]
    fn test_score_rejects_beyond_radius() {
        let a = blob(10.0, 10.0, 3.0, 100.0);
        let b = blob(50.0, 50.0, 3.0, 100.0);
        let ctx = ScoreContext::isolated(20.0, a.distance_to(&b));
        assert_eq!(score(&a, &b, &ctx, &ScoreWeights::default()), REJECT_SCORE);
    }

    #[test]
    fn test_closer_candidate_scores_lower() {
        let a = blob(30.0, 30.0, 5.0, 100.0);
        let near = blob(31.0, 31.0, 5.0, 100.0);
        let far = blob(40.0, 30.0, 5.0, 100.0);
        let ctx = ScoreContext {
            max_radius: 20.0,
            local_min_distance: a.distance_to(&near),
        };
        let w = ScoreWeights::default();
        assert!(score(&a, &near, &ctx, &w) < score(&a, &far, &ctx, &w));
    }

    #[test]
    fn test_overlap_neutral_without_footprints() {
        let a = Component::from_measurements(Point2::new(0.0, 0.0), 10.0, 1.0, 1.0);
        let b = Component::from_measurements(Point2::new(1.0, 0.0), 10.0, 1.0, 1.0);
        let terms = score_terms(&a, &b, &ScoreContext::isolated(5.0, 1.0)).unwrap();
        assert_eq!(terms.overlap, 0.0);
        assert_eq!(terms.area, 0.0);
    }
}
