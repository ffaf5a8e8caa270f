//! The Marker-Blob Tracker - secondary division signal
//!
//! Tracks that ended on a suspected mitosis without getting children are
//! followed forward through bright "marker blobs" found by an external
//! `BlobFinder`. One detection is opened per track and advanced frame by frame:
//! 1. Every detection ranks nearby blobs by closeness and brightness
//! 2. Contested blobs go to the detection that ranks them best (greedy, in
//!    detection order; not a global optimum)
//! 3. The first blob becomes a `WhiteBlob` component linked to the parent.
//!    A sharp intensity drop restarts the division search rooted at the blob
//! 4. A second blob validated as a sibling completes the division; each blob
//!    is then linked to the closest unclaimed track start ahead of it
//!
//! A detection that finds nothing is carried into the next frame with the same
//! parent link until it ages out or the sequence ends.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::component::{Component, ComponentState, ComponentStack, Footprint};
use crate::division::{DivisionEvent, DivisionOutcome, DivisionResolver};
use crate::graph::{LineageGraph, NodeId, MAX_CHILDREN};
use crate::scoring::normalized_difference;
use crate::tracks::Track;

// ============================================================================
// BLOB FINDER
// ============================================================================

/// A bright region reported by the blob finder.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobCandidate {
    pub centroid: Point2<f64>,
    /// Used when the footprint is empty
    pub area: f64,
    pub avg_intensity: f64,
    pub footprint: Footprint,
}

impl BlobCandidate {
    pub fn to_component(&self) -> Component {
        let component = if self.footprint.is_empty() {
            Component::from_measurements(self.centroid, self.area, self.avg_intensity, 1.0)
        } else {
            Component::from_footprint(self.centroid, self.footprint.clone(), self.avg_intensity, 1.0)
        };
        component.with_state(ComponentState::WhiteBlob)
    }
}

/// External collaborator that locates marker blobs in a frame.
pub trait BlobFinder {
    /// Up to `max_count` blobs of `frame` within `radius` of `center`.
    fn find_blobs(&self, frame: usize, center: &Point2<f64>, radius: f64, max_count: usize)
        -> Vec<BlobCandidate>;
}

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Configuration for the BlobTracker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BlobConfig {
    /// Blob search radius around the detection anchor (default: 15 px)
    pub search_radius: f64,

    /// Blobs requested per detection and frame (default: 4)
    pub max_candidates: usize,

    /// Weight of distance in the ranking score (default: 0.6)
    pub closeness_weight: f64,

    /// Weight of brightness in the ranking score (default: 0.4)
    pub intensity_weight: f64,

    /// A first blob dimmer than this fraction of the parent restarts the division search (default: 0.6)
    pub intensity_drop_ratio: f64,

    /// Maximum sibling penalty for a second blob (default: 0.35)
    pub sibling_threshold: f64,

    /// Frames searched ahead of a blob for a track start (default: 3)
    pub link_window: usize,

    /// Maximum distance-plus-time cost for a blob to track-start link (default: 25 px)
    pub link_radius: f64,

    /// Cost per frame of delay beyond the next frame (default: 2 px)
    pub time_penalty: f64,

    /// Frames a detection survives without completing (default: 4)
    pub max_age: usize,
}

impl Default for BlobConfig {
    fn default() -> Self {
        Self {
            search_radius: 15.0,
            max_candidates: 4,
            closeness_weight: 0.6,
            intensity_weight: 0.4,
            intensity_drop_ratio: 0.6,
            sibling_threshold: 0.35,
            link_window: 3,
            link_radius: 25.0,
            time_penalty: 2.0,
            max_age: 4,
        }
    }
}

// ============================================================================
// DETECTIONS & REPORT
// ============================================================================

/// One short-lived secondary track.
#[derive(Debug, Clone, PartialEq)]
pub struct Detection {
    /// Node the division children hang from
    pub parent: NodeId,
    /// Search centre in the current frame
    pub anchor: Point2<f64>,
    pub frame: usize,
    pub parent_intensity: f64,
    /// Frames already spent searching
    pub age: usize,
    /// Latest blob of this detection, once one was found
    pub first_blob: Option<NodeId>,
}

impl Detection {
    /// Detection opened right after a track's end node.
    pub fn seed(end: NodeId, stack: &ComponentStack) -> Option<Self> {
        let parent = stack.get(end)?;
        Some(Self {
            parent: end,
            anchor: parent.centroid,
            frame: end.frame + 1,
            parent_intensity: parent.avg_intensity,
            age: 0,
            first_blob: None,
        })
    }
}

/// A division completed through two sibling blobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BlobDivision {
    pub parent: NodeId,
    pub blobs: [NodeId; 2],
    /// Track start each blob was linked to
    pub continuations: [Option<NodeId>; 2],
    pub sibling_penalty: f64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct BlobReport {
    pub detections: usize,
    pub blobs_created: usize,
    pub divisions: Vec<BlobDivision>,
    /// Divisions found by the resolver search rooted at a dimming blob
    pub resolver_divisions: Vec<DivisionEvent>,
    pub continuations: usize,
    pub expired: usize,
}

// ============================================================================
// BLOB TRACKER
// ============================================================================

pub struct BlobTracker {
    config: BlobConfig,
}

impl BlobTracker {
    pub fn new(config: BlobConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(BlobConfig::default())
    }

    pub fn config(&self) -> &BlobConfig {
        &self.config
    }

    /// Follow every track that ended on mitosis without children.
    pub fn run(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
        finder: &dyn BlobFinder,
        resolver: &DivisionResolver,
    ) -> BlobReport {
        let frame_count = stack.frame_count();
        let mut report = BlobReport::default();

        let mut pending: Vec<Detection> = tracks
            .iter()
            .filter(|t| t.ended_on_mitosis && graph.out_degree(t.end) == 0)
            .filter_map(|t| Detection::seed(t.end, stack))
            .filter(|d| d.frame < frame_count)
            .collect();
        report.detections = pending.len();

        while let Some(frame) = pending.iter().map(|d| d.frame).min() {
            let (current, rest): (Vec<_>, Vec<_>) = pending.into_iter().partition(|d| d.frame == frame);
            pending = rest;

            let assigned = self.allocate(finder, frame, &current);
            for (detection, blobs) in current.into_iter().zip(assigned) {
                if let Some(next) = self.advance(graph, stack, tracks, resolver, detection, blobs, &mut report) {
                    pending.push(next);
                }
            }
        }

        info!(
            "Blob tracking: {} detections, {} blobs, {} blob divisions, {} resolver divisions",
            report.detections,
            report.blobs_created,
            report.divisions.len(),
            report.resolver_divisions.len()
        );
        report
    }

    /// Lower is better: scaled distance plus relative dimness.
    fn rank_score(&self, distance: f64, intensity: f64, brightest: f64) -> f64 {
        let closeness = distance / self.config.search_radius.max(f64::EPSILON);
        let dimness = if brightest > f64::EPSILON {
            1.0 - intensity / brightest
        } else {
            0.0
        };
        self.config.closeness_weight * closeness + self.config.intensity_weight * dimness
    }

    /// Share the blobs of one frame among competing detections.
    ///
    /// Returns, per detection, the blobs it won in its own rank order.
    fn allocate(
        &self,
        finder: &dyn BlobFinder,
        frame: usize,
        detections: &[Detection],
    ) -> Vec<Vec<BlobCandidate>> {
        let mut pool: Vec<BlobCandidate> = Vec::new();
        let mut ranked: Vec<Vec<(usize, f64)>> = Vec::with_capacity(detections.len());

        for detection in detections {
            let found = finder.find_blobs(
                frame,
                &detection.anchor,
                self.config.search_radius,
                self.config.max_candidates,
            );
            let brightest = found.iter().map(|c| c.avg_intensity).fold(0.0, f64::max);

            let mut ranks = Vec::new();
            for candidate in found {
                let distance = nalgebra::distance(&candidate.centroid, &detection.anchor);
                if distance > self.config.search_radius {
                    continue;
                }
                let score = self.rank_score(distance, candidate.avg_intensity, brightest);
                let idx = match pool.iter().position(|p| p.centroid == candidate.centroid) {
                    Some(idx) => idx,
                    None => {
                        pool.push(candidate);
                        pool.len() - 1
                    }
                };
                ranks.push((idx, score));
            }
            ranks.sort_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap_or(std::cmp::Ordering::Equal)
                    .then(a.0.cmp(&b.0))
            });
            ranks.truncate(self.config.max_candidates);
            ranked.push(ranks);
        }

        // Owner of each blob; ties keep the earlier detection.
        let mut owner: Vec<Option<(usize, f64)>> = vec![None; pool.len()];
        for (d, ranks) in ranked.iter().enumerate() {
            for &(c, score) in ranks {
                match owner[c] {
                    Some((_, best)) if best <= score => {}
                    _ => owner[c] = Some((d, score)),
                }
            }
        }

        ranked
            .iter()
            .enumerate()
            .map(|(d, ranks)| {
                ranks
                    .iter()
                    .filter(|(c, _)| owner[*c].map(|(o, _)| o) == Some(d))
                    .map(|(c, _)| pool[*c].clone())
                    .collect()
            })
            .collect()
    }

    /// Apply the blobs a detection won. Returns the detection for the next frame, if any.
    #[allow(clippy::too_many_arguments)]
    fn advance(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
        resolver: &DivisionResolver,
        detection: Detection,
        blobs: Vec<BlobCandidate>,
        report: &mut BlobReport,
    ) -> Option<Detection> {
        let mut blobs = blobs.into_iter();
        let Some(first) = blobs.next() else {
            return self.propagate(graph, stack, tracks, detection, report);
        };

        match detection.first_blob {
            None => {
                let Some(blob) = self.attach_blob(graph, stack, detection.parent, detection.frame, &first) else {
                    report.expired += 1;
                    return None;
                };
                report.blobs_created += 1;

                if let Some(second) = blobs.next() {
                    if let Some(division) = self.try_sibling(graph, stack, tracks, detection.parent, blob, &second) {
                        report.blobs_created += 1;
                        report.divisions.push(division);
                        return None;
                    }
                }

                let dimmed = stack
                    .get(blob)
                    .map_or(false, |c| c.avg_intensity < self.config.intensity_drop_ratio * detection.parent_intensity);
                if dimmed {
                    match resolver.divide_from(graph, stack, tracks, blob, None) {
                        DivisionOutcome::Divided(event) => {
                            debug!("dimming blob {} resolved as division", blob);
                            report.resolver_divisions.push(event);
                            return None;
                        }
                        DivisionOutcome::Continued { .. } => {
                            report.continuations += 1;
                            return None;
                        }
                        _ => {}
                    }
                }

                self.propagate(
                    graph,
                    stack,
                    tracks,
                    Detection {
                        anchor: first.centroid,
                        first_blob: Some(blob),
                        ..detection
                    },
                    report,
                )
            }
            Some(previous) => {
                // The closest blob is the same one moved on; a sister must be seen alongside it.
                let Some(blob) = self.attach_blob(graph, stack, previous, detection.frame, &first) else {
                    report.expired += 1;
                    return None;
                };
                report.blobs_created += 1;

                if let Some(second) = blobs.next() {
                    if let Some(division) = self.try_sibling(graph, stack, tracks, detection.parent, blob, &second) {
                        report.blobs_created += 1;
                        report.divisions.push(division);
                        return None;
                    }
                }

                self.propagate(
                    graph,
                    stack,
                    tracks,
                    Detection {
                        anchor: first.centroid,
                        first_blob: Some(blob),
                        ..detection
                    },
                    report,
                )
            }
        }
    }

    /// Add a blob component in `frame` and link it under `parent`.
    fn attach_blob(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        parent: NodeId,
        frame: usize,
        candidate: &BlobCandidate,
    ) -> Option<NodeId> {
        if graph.out_degree(parent) >= MAX_CHILDREN || frame <= parent.frame {
            return None;
        }
        let blob = graph.add_component(stack, frame, candidate.to_component());
        match graph.connect(stack, parent, blob) {
            Ok(()) => Some(blob),
            Err(e) => {
                debug!("blob {} left unlinked: {}", blob, e);
                None
            }
        }
    }

    /// Validate `candidate`, seen in the same frame as `blob`, as its sister and commit the division.
    fn try_sibling(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
        parent: NodeId,
        blob: NodeId,
        candidate: &BlobCandidate,
    ) -> Option<BlobDivision> {
        let parent_component = stack.get(parent)?;
        let first = stack.get(blob)?;
        let second = candidate.to_component();
        let penalty = sibling_penalty(parent_component, first, &second);
        if penalty > self.config.sibling_threshold {
            debug!("blob near {} rejected as sibling, penalty {:.3}", blob, penalty);
            return None;
        }

        let sister = self.attach_blob(graph, stack, parent, blob.frame, candidate)?;
        if let Some(p) = stack.get_mut(parent) {
            p.state = ComponentState::MitosisStart;
        }

        let continuations = [
            self.link_to_track_start(graph, stack, tracks, blob),
            self.link_to_track_start(graph, stack, tracks, sister),
        ];
        debug!("blob division {} -> {} + {}", parent, blob, sister);
        Some(BlobDivision {
            parent,
            blobs: [blob, sister],
            continuations,
            sibling_penalty: penalty,
        })
    }

    /// Link a blob to the closest unclaimed, parentless track start shortly after it.
    fn link_to_track_start(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
        blob: NodeId,
    ) -> Option<NodeId> {
        let centroid = stack.get(blob)?.centroid;
        let last_frame = blob.frame + self.config.link_window;

        let mut best: Option<(f64, usize)> = None;
        for (j, track) in tracks.iter().enumerate() {
            if track.claimed_as_child || track.start_frame <= blob.frame || track.start_frame > last_frame {
                continue;
            }
            let Some(start) = stack.get(track.start) else {
                continue;
            };
            if start.has_parent {
                continue;
            }
            let delay = (track.start_frame - blob.frame - 1) as f64;
            let cost = nalgebra::distance(&centroid, &start.centroid) + self.config.time_penalty * delay;
            if cost > self.config.link_radius {
                continue;
            }
            if best.map_or(true, |(b, _)| cost < b) {
                best = Some((cost, j));
            }
        }

        let (_, j) = best?;
        let start = tracks[j].start;
        match graph.connect(stack, blob, start) {
            Ok(()) => {
                tracks[j].claimed_as_child = true;
                Some(start)
            }
            Err(e) => {
                debug!("blob {} could not adopt {}: {}", blob, start, e);
                None
            }
        }
    }

    /// Carry a detection into the next frame, or close it.
    fn propagate(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
        detection: Detection,
        report: &mut BlobReport,
    ) -> Option<Detection> {
        let next_frame = detection.frame + 1;
        if detection.age + 1 > self.config.max_age || next_frame >= stack.frame_count() {
            if let Some(blob) = detection.first_blob {
                if self.link_to_track_start(graph, stack, tracks, blob).is_some() {
                    report.continuations += 1;
                    return None;
                }
            }
            report.expired += 1;
            return None;
        }
        Some(Detection {
            frame: next_frame,
            age: detection.age + 1,
            ..detection
        })
    }
}

/// Mean of the area, intensity and distance-to-parent asymmetries of two blobs.
pub fn sibling_penalty(parent: &Component, a: &Component, b: &Component) -> f64 {
    (normalized_difference(a.area, b.area)
        + normalized_difference(a.avg_intensity, b.avg_intensity)
        + normalized_difference(parent.distance_to(a), parent.distance_to(b)))
        / 3.0
}

// ============================================================================
// TESTS
// ============================================================================
