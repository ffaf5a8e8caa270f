//! The Division Resolver - re-wires suspected mitoses
//!
//! A track that stops before the end of the sequence is suspected of ending in
//! a division. The resolver:
//! 1. Collects unclaimed, parentless track starts near the track's end node,
//!    inside a frame-offset window
//! 2. Connects a lone candidate directly (a gap-closing continuation)
//! 3. Otherwise scores every candidate against the parent, keeps the best
//!    `top_candidates`, scores every sibling pair among them and commits the
//!    cheapest feasible pair
//!
//! Per-track state machine:
//! `Active → EndedOnMitosis → Resolved | Unresolved`
//!
//! The top-N restriction is a bounded-width heuristic, not an exhaustive
//! search; downstream thresholds were tuned against it.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::component::{Component, ComponentState, ComponentStack};
use crate::graph::{LineageGraph, NodeId};
use crate::scoring::normalized_difference;
use crate::tracks::{disconnect_first_components, sort_by_end_frame, DivisionStatus, Track};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Weights of the parent-child penalty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParentChildWeights {
    pub area: f64,
    pub intensity: f64,
    pub distance: f64,
    /// Per frame of delay beyond the immediate next frame
    pub time_delay: f64,
}

impl Default for ParentChildWeights {
    fn default() -> Self {
        Self {
            area: 0.25,
            intensity: 0.25,
            distance: 0.4,
            time_delay: 0.1,
        }
    }
}

/// Weights of the sibling-pair penalty.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SiblingWeights {
    pub intensity: f64,
    pub size: f64,
    /// Asymmetry of the two children's distances to the parent
    pub distance_to_parent: f64,
    /// Per child, per frame of delay beyond the next frame
    pub time_to_parent: f64,
    /// Per frame between the two children's starts
    pub time_difference: f64,
}

impl Default for SiblingWeights {
    fn default() -> Self {
        Self {
            intensity: 0.3,
            size: 0.3,
            distance_to_parent: 0.25,
            time_to_parent: 0.1,
            time_difference: 0.05,
        }
    }
}

/// Configuration for the DivisionResolver
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DivisionConfig {
    /// Max distance from the parent's end centroid to a child start (default: 30 px)
    pub search_radius: f64,

    /// A child may start this many frames before the parent ends (default: 2)
    pub frames_before: usize,

    /// A child may start this many frames after the parent ends (default: 3)
    pub frames_after: usize,

    /// Tracks ending within this many frames of the sequence end are not suspected (default: 3)
    pub end_margin: usize,

    /// Candidates kept for pairwise scoring (default: 5)
    pub top_candidates: usize,

    pub parent_child: ParentChildWeights,

    pub sibling: SiblingWeights,
}

impl Default for DivisionConfig {
    fn default() -> Self {
        Self {
            search_radius: 30.0,
            frames_before: 2,
            frames_after: 3,
            end_margin: 3,
            top_candidates: 5,
            parent_child: ParentChildWeights::default(),
            sibling: SiblingWeights::default(),
        }
    }
}

// ============================================================================
// SCORES
// ============================================================================

/// Penalty of `child` (starting `d_slice` frames after the parent ends) as a
/// child of `parent`. Lower is better.
pub fn parent_child_score(
    parent: &Component,
    child: &Component,
    d_slice: i64,
    config: &DivisionConfig,
) -> f64 {
    let w = &config.parent_child;
    let distance = parent.distance_to(child) / config.search_radius.max(f64::EPSILON);
    w.area * normalized_difference(parent.area, child.area)
        + w.intensity * normalized_difference(parent.avg_intensity, child.avg_intensity)
        + w.distance * distance
        + w.time_delay * (d_slice - 1).abs() as f64
}

/// Penalty of `a` and `b` being sisters born from `parent`. Lower is better.
pub fn sibling_pair_score(
    parent: &Component,
    a: (&Component, i64),
    b: (&Component, i64),
    config: &DivisionConfig,
) -> f64 {
    let w = &config.sibling;
    let (ca, da) = a;
    let (cb, db) = b;
    w.intensity * normalized_difference(ca.avg_intensity, cb.avg_intensity)
        + w.size * normalized_difference(ca.area, cb.area)
        + w.distance_to_parent
            * normalized_difference(parent.distance_to(ca), parent.distance_to(cb))
        + w.time_to_parent * ((da - 1).abs() + (db - 1).abs()) as f64
        + w.time_difference * (da - db).abs() as f64
}

// ============================================================================
// OUTCOMES
// ============================================================================

/// A committed two-child division.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DivisionEvent {
    pub parent: NodeId,
    pub children: [NodeId; 2],
    /// Sibling-pair penalty of the chosen pair
    pub score: f64,
}

/// Result of examining one track (or blob root).
#[derive(Debug, Clone, PartialEq)]
pub enum DivisionOutcome {
    /// Two children attached
    Divided(DivisionEvent),
    /// A single candidate was attached as a continuation
    Continued { parent: NodeId, child: NodeId },
    /// No usable candidate; stays terminal
    Unresolved,
    /// Already has children; nothing changed
    AlreadyResolved,
    /// Ends too close to the end of the sequence to be examined
    NotSuspected,
}

/// Aggregate of a full resolver run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct DivisionReport {
    pub events: Vec<DivisionEvent>,
    pub continuations: usize,
    pub unresolved: usize,
    pub already_resolved: usize,
    pub not_suspected: usize,
}

impl DivisionReport {
    pub fn record(&mut self, outcome: &DivisionOutcome) {
        match outcome {
            DivisionOutcome::Divided(event) => self.events.push(event.clone()),
            DivisionOutcome::Continued { .. } => self.continuations += 1,
            DivisionOutcome::Unresolved => self.unresolved += 1,
            DivisionOutcome::AlreadyResolved => self.already_resolved += 1,
            DivisionOutcome::NotSuspected => self.not_suspected += 1,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct ChildCandidate {
    track: usize,
    d_slice: i64,
    score: f64,
}

// ============================================================================
// DIVISION RESOLVER
// ============================================================================

/// Searches for and commits the children of suspected divisions.
pub struct DivisionResolver {
    config: DivisionConfig,
}

impl DivisionResolver {
    pub fn new(config: DivisionConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(DivisionConfig::default())
    }

    pub fn config(&self) -> &DivisionConfig {
        &self.config
    }

    /// Resolve every track, earliest end frame first.
    ///
    /// The list is sorted once; tracks patched by earlier commits are not re-sorted.
    pub fn resolve_all(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
    ) -> DivisionReport {
        sort_by_end_frame(tracks);
        let mut report = DivisionReport::default();
        for idx in 0..tracks.len() {
            let outcome = self.resolve_track(graph, stack, tracks, idx);
            report.record(&outcome);
        }
        info!(
            "Division resolution: {} divisions, {} continuations, {} unresolved",
            report.events.len(),
            report.continuations,
            report.unresolved
        );
        report
    }

    /// Examine one track. Calling this again on a resolved track is a no-op.
    pub fn resolve_track(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
        idx: usize,
    ) -> DivisionOutcome {
        let (root, end_frame, status) = (tracks[idx].end, tracks[idx].end_frame, tracks[idx].status);
        if status == DivisionStatus::Resolved || graph.out_degree(root) > 0 {
            tracks[idx].status = DivisionStatus::Resolved;
            return DivisionOutcome::AlreadyResolved;
        }
        if end_frame + self.config.end_margin >= stack.frame_count() {
            return DivisionOutcome::NotSuspected;
        }

        tracks[idx].status = DivisionStatus::EndedOnMitosis;
        tracks[idx].ended_on_mitosis = true;

        let outcome = self.divide_from(graph, stack, tracks, root, Some(idx));
        tracks[idx].status = match outcome {
            DivisionOutcome::Divided(_) | DivisionOutcome::Continued { .. } => DivisionStatus::Resolved,
            _ => DivisionStatus::Unresolved,
        };
        outcome
    }

    /// The 1-to-2 search rooted at an arbitrary childless node.
    ///
    /// `exclude` names the root's own track, if it has one.
    pub fn divide_from(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
        root: NodeId,
        exclude: Option<usize>,
    ) -> DivisionOutcome {
        if graph.out_degree(root) > 0 {
            return DivisionOutcome::AlreadyResolved;
        }
        let Some(parent) = stack.get(root).cloned() else {
            return DivisionOutcome::Unresolved;
        };

        let mut candidates = self.find_candidates(stack, tracks, root, &parent, exclude);
        match candidates.len() {
            0 => {
                debug!("no division candidates for {}", root);
                DivisionOutcome::Unresolved
            }
            1 => self.commit_single(graph, stack, tracks, root, candidates[0]),
            _ => {
                candidates.sort_by(|a, b| {
                    a.score
                        .partial_cmp(&b.score)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(a.track.cmp(&b.track))
                });
                candidates.truncate(self.config.top_candidates.max(2));
                self.commit_best_pair(graph, stack, tracks, root, &parent, &candidates)
            }
        }
    }

    fn find_candidates(
        &self,
        stack: &ComponentStack,
        tracks: &[Track],
        root: NodeId,
        parent: &Component,
        exclude: Option<usize>,
    ) -> Vec<ChildCandidate> {
        let lo = -(self.config.frames_before as i64);
        let hi = self.config.frames_after as i64;

        tracks
            .iter()
            .enumerate()
            .filter_map(|(j, other)| {
                if Some(j) == exclude || other.claimed_as_child || other.end_frame <= root.frame {
                    return None;
                }
                let d_slice = other.start_frame as i64 - root.frame as i64;
                if d_slice < lo || d_slice > hi {
                    return None;
                }
                let start = stack.get(other.start)?;
                if start.has_parent {
                    return None;
                }
                if parent.distance_to(start) > self.config.search_radius {
                    return None;
                }
                Some(ChildCandidate {
                    track: j,
                    d_slice,
                    score: parent_child_score(parent, start, d_slice, &self.config),
                })
            })
            .collect()
    }

    /// Lone candidate: shift it to start right after the root if it starts at
    /// or before the root's frame (`d_slice <= 0`), then link.
    fn commit_single(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
        root: NodeId,
        candidate: ChildCandidate,
    ) -> DivisionOutcome {
        let child_track = &mut tracks[candidate.track];
        if candidate.d_slice <= 0 {
            let k = (1 - candidate.d_slice) as usize;
            if let Err(e) = disconnect_first_components(graph, stack, child_track, k) {
                debug!("single candidate for {} not usable: {}", root, e);
                return DivisionOutcome::Unresolved;
            }
        }

        let child = child_track.start;
        match graph.connect(stack, root, child) {
            Ok(()) => {
                child_track.claimed_as_child = true;
                debug!("continuation {} -> {}", root, child);
                DivisionOutcome::Continued { parent: root, child }
            }
            Err(e) => {
                debug!("continuation {} -> {} refused: {}", root, child, e);
                DivisionOutcome::Unresolved
            }
        }
    }

    /// Score all pairs of the kept candidates and commit the cheapest feasible one.
    fn commit_best_pair(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
        root: NodeId,
        parent: &Component,
        candidates: &[ChildCandidate],
    ) -> DivisionOutcome {
        let mut pairs = Vec::new();
        for i in 0..candidates.len() {
            for j in i + 1..candidates.len() {
                let (a, b) = (candidates[i], candidates[j]);
                let (Some(ca), Some(cb)) = (stack.get(tracks[a.track].start), stack.get(tracks[b.track].start)) else {
                    continue;
                };
                let s = sibling_pair_score(parent, (ca, a.d_slice), (cb, b.d_slice), &self.config);
                pairs.push((s, a, b));
            }
        }
        pairs.sort_by(|x, y| x.0.partial_cmp(&y.0).unwrap_or(std::cmp::Ordering::Equal));

        for (score, a, b) in pairs {
            if let Some(children) = self.commit_pair(graph, stack, tracks, root, a, b) {
                let event = DivisionEvent {
                    parent: root,
                    children,
                    score,
                };
                debug!("division {} -> {} + {} score {:.4}", root, children[0], children[1], score);
                return DivisionOutcome::Divided(event);
            }
        }
        DivisionOutcome::Unresolved
    }

    /// Align both children to a common start frame strictly after the root and link them.
    ///
    /// The earlier-starting child loses its leading components; a pair that
    /// cannot be aligned leaves the graph untouched and returns `None`.
    fn commit_pair(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        tracks: &mut [Track],
        root: NodeId,
        a: ChildCandidate,
        b: ChildCandidate,
    ) -> Option<[NodeId; 2]> {
        let target = tracks[a.track]
            .start_frame
            .max(tracks[b.track].start_frame)
            .max(root.frame + 1);
        let ka = target - tracks[a.track].start_frame;
        let kb = target - tracks[b.track].start_frame;
        if ka >= tracks[a.track].length || kb >= tracks[b.track].length {
            return None;
        }

        for (idx, k) in [(a.track, ka), (b.track, kb)] {
            if let Err(e) = disconnect_first_components(graph, stack, &mut tracks[idx], k) {
                debug!("alignment of track at {} failed: {}", tracks[idx].start, e);
                return None;
            }
        }

        let children = [tracks[a.track].start, tracks[b.track].start];
        for child in children {
            if let Err(e) = graph.connect(stack, root, child) {
                tracing::error!("division link {} -> {} refused after alignment: {}", root, child, e);
                return None;
            }
        }

        if let Some(p) = stack.get_mut(root) {
            p.state = ComponentState::MitosisStart;
        }
        for child in children {
            if let Some(c) = stack.get_mut(child) {
                c.state = ComponentState::MitosisEnd;
            }
        }
        tracks[a.track].claimed_as_child = true;
        tracks[b.track].claimed_as_child = true;
        Some(children)
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tracks::extract_tracks;
    use nalgebra::Point2;

    fn cell(x: f64, y: f64, area: f64) -> Component {
        Component::from_measurements(Point2::new(x, y), area, 100.0, 0.9)
    }

    /// Builds linked chains: each entry is (start_frame, length, x, y, area).
    fn build(chains: &[(usize, usize, f64, f64, f64)], frames: usize) -> (ComponentStack, LineageGraph) {
        let mut stack = ComponentStack::new(128, 128);
        for _ in 0..frames {
            stack.push_frame(Vec::new());
        }
        let mut graph = LineageGraph::from_stack(&stack);
        for &(start, len, x, y, area) in chains {
            let mut prev = None;
            for f in start..start + len {
                let node = graph.add_component(&mut stack, f, cell(x, y, area));
                if let Some(p) = prev {
                    graph.connect(&mut stack, p, node).unwrap();
                }
                prev = Some(node);
            }
        }
        (stack, graph)
    }

    fn track_ending_at(tracks: &[Track], frame: usize) -> usize {
        tracks.iter().position(|t| t.end_frame == frame).unwrap()
    }

    #[test]
    fn test_single_candidate_within_radius() {
        // Parent ends at frame 5; children start at frame 6 at distance 5 and 40.
        let (mut stack, mut graph) = build(
            &[
                (0, 6, 50.0, 50.0, 100.0),
                (6, 6, 55.0, 50.0, 60.0),
                (6, 6, 90.0, 50.0, 60.0),
            ],
            15,
        );
        let mut tracks = extract_tracks(&graph, &stack, 0);
        let resolver = DivisionResolver::new(DivisionConfig {
            search_radius: 30.0,
            ..DivisionConfig::default()
        });
        let parent = track_ending_at(&tracks, 5);

        let outcome = resolver.resolve_track(&mut graph, &mut stack, &mut tracks, parent);

        assert_eq!(
            outcome,
            DivisionOutcome::Continued {
                parent: NodeId::new(5, 0),
                child: NodeId::new(6, 0),
            }
        );
        assert_eq!(graph.out_degree(NodeId::new(5, 0)), 1);
        assert!(!stack.get(NodeId::new(6, 1)).unwrap().has_parent);
        assert_eq!(tracks[parent].status, DivisionStatus::Resolved);
        // A continuation is not a mitosis.
        assert_eq!(stack.get(NodeId::new(5, 0)).unwrap().state, ComponentState::Normal);
        assert!(graph.check_consistency(&stack).is_empty());
    }

    #[test]
    fn test_single_candidate_starting_early_is_shifted() {
        let (mut stack, mut graph) = build(&[(0, 6, 50.0, 50.0, 100.0), (4, 6, 52.0, 50.0, 60.0)], 15);
        let mut tracks = extract_tracks(&graph, &stack, 0);
        let parent = track_ending_at(&tracks, 5);

        let outcome = DivisionResolver::with_defaults().resolve_track(&mut graph, &mut stack, &mut tracks, parent);

        // d_slice = -1: two leading components removed so the child starts at frame 6.
        let DivisionOutcome::Continued { child, .. } = outcome else {
            panic!("expected continuation, got {:?}", outcome);
        };
        assert_eq!(child.frame, 6);
        assert_eq!(tracks.iter().find(|t| t.claimed_as_child).unwrap().length, 4);
        assert!(graph.check_consistency(&stack).is_empty());
    }

    #[test]
    fn test_pair_chosen_by_sibling_score() {
        // Two similar sisters and one odd candidate.
        let (mut stack, mut graph) = build(
            &[
                (0, 6, 50.0, 50.0, 100.0),
                (6, 6, 45.0, 50.0, 55.0),
                (6, 6, 55.0, 50.0, 55.0),
                (7, 6, 50.0, 62.0, 200.0),
            ],
            15,
        );
        let mut tracks = extract_tracks(&graph, &stack, 0);
        let parent = track_ending_at(&tracks, 5);

        let outcome = DivisionResolver::with_defaults().resolve_track(&mut graph, &mut stack, &mut tracks, parent);

        let DivisionOutcome::Divided(event) = outcome else {
            panic!("expected division, got {:?}", outcome);
        };
        let mut children = event.children;
        children.sort();
        assert_eq!(children, [NodeId::new(6, 0), NodeId::new(6, 1)]);
        assert_eq!(stack.get(event.parent).unwrap().child_count, 2);
        assert_eq!(stack.get(event.parent).unwrap().state, ComponentState::MitosisStart);
        for child in children {
            assert!(stack.get(child).unwrap().has_parent);
            assert_eq!(stack.get(child).unwrap().state, ComponentState::MitosisEnd);
        }
        assert_eq!(tracks.iter().filter(|t| t.claimed_as_child).count(), 2);
        assert!(graph.check_consistency(&stack).is_empty());
    }

    #[test]
    fn test_pair_aligned_to_common_start() {
        let (mut stack, mut graph) = build(
            &[
                (0, 6, 50.0, 50.0, 100.0),
                (6, 6, 45.0, 50.0, 55.0),
                (7, 6, 55.0, 50.0, 55.0),
            ],
            15,
        );
        let mut tracks = extract_tracks(&graph, &stack, 0);
        let parent = track_ending_at(&tracks, 5);

        let outcome = DivisionResolver::with_defaults().resolve_track(&mut graph, &mut stack, &mut tracks, parent);

        let DivisionOutcome::Divided(event) = outcome else {
            panic!("expected division, got {:?}", outcome);
        };
        assert!(event.children.iter().all(|c| c.frame == 7));
        assert_eq!(graph.in_degree(NodeId::new(6, 0)), 0);
        assert!(graph.check_consistency(&stack).is_empty());
    }

    #[test]
    fn test_resolve_twice_is_noop() {
        let (mut stack, mut graph) = build(
            &[
                (0, 6, 50.0, 50.0, 100.0),
                (6, 6, 45.0, 50.0, 55.0),
                (6, 6, 55.0, 50.0, 55.0),
            ],
            15,
        );
        let mut tracks = extract_tracks(&graph, &stack, 0);
        let parent = track_ending_at(&tracks, 5);
        let resolver = DivisionResolver::with_defaults();

        resolver.resolve_track(&mut graph, &mut stack, &mut tracks, parent);
        let links = graph.link_count();
        let child_count = stack.get(NodeId::new(5, 0)).unwrap().child_count;

        let again = resolver.resolve_track(&mut graph, &mut stack, &mut tracks, parent);

        assert_eq!(again, DivisionOutcome::AlreadyResolved);
        assert_eq!(graph.link_count(), links);
        assert_eq!(stack.get(NodeId::new(5, 0)).unwrap().child_count, child_count);
    }

    #[test]
    fn test_no_candidates_leaves_unresolved() {
        let (mut stack, mut graph) = build(&[(0, 6, 50.0, 50.0, 100.0), (6, 6, 110.0, 110.0, 60.0)], 15);
        let mut tracks = extract_tracks(&graph, &stack, 0);
        let parent = track_ending_at(&tracks, 5);

        let outcome = DivisionResolver::with_defaults().resolve_track(&mut graph, &mut stack, &mut tracks, parent);

        assert_eq!(outcome, DivisionOutcome::Unresolved);
        assert_eq!(tracks[parent].status, DivisionStatus::Unresolved);
        assert_eq!(graph.out_degree(NodeId::new(5, 0)), 0);
    }

    #[test]
    fn test_tracks_near_sequence_end_not_suspected() {
        let (mut stack, mut graph) = build(&[(0, 6, 50.0, 50.0, 100.0)], 8);
        let mut tracks = extract_tracks(&graph, &stack, 0);

        let report = DivisionResolver::with_defaults().resolve_all(&mut graph, &mut stack, &mut tracks);

        assert_eq!(report.not_suspected, 1);
        assert_eq!(tracks[0].status, DivisionStatus::Active);
    }

    #[test]
    fn test_earlier_division_claims_first() {
        // Two parents compete for the same children; the earlier-ending one wins.
        let (mut stack, mut graph) = build(
            &[
                (0, 5, 50.0, 50.0, 100.0),
                (0, 6, 60.0, 50.0, 100.0),
                (6, 6, 45.0, 52.0, 55.0),
                (6, 6, 55.0, 52.0, 55.0),
            ],
            15,
        );
        let mut tracks = extract_tracks(&graph, &stack, 0);

        let report = DivisionResolver::with_defaults().resolve_all(&mut graph, &mut stack, &mut tracks);

        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].parent, NodeId::new(4, 0));
        assert!(graph.check_consistency(&stack).is_empty());
    }

    #[test]
    fn test_sibling_score_symmetric() {
        let parent = cell(50.0, 50.0, 100.0);
        let a = cell(45.0, 50.0, 50.0);
        let b = cell(57.0, 50.0, 70.0);
        let config = DivisionConfig::default();
        let ab = sibling_pair_score(&parent, (&a, 1), (&b, 2), &config);
        let ba = sibling_pair_score(&parent, (&b, 2), (&a, 1), &config);
        assert!((ab - ba).abs() < 1e-12);
    }
}
