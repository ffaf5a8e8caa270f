//! The Frame Linker - builds the lineage graph
//!
//! For every unmatched component the linker:
//! 1. Scans a bounded window of neighbouring frames for the best-scoring
//!    candidate whose state transition is allowed (score grows with frame gap)
//! 2. Requires the best score to be under the pass threshold
//! 3. Verifies **mutual best match**: searching back from the candidate must
//!    return the original component
//! 4. Enforces degree constraints and the optional path-length cap
//! 5. Adds the link
//!
//! Passes run with progressively larger radius/threshold/window. They are
//! idempotent (parented components are skipped), so the schedule is a tuning
//! knob rather than a correctness requirement.

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::component::{Component, ComponentState, ComponentStack, StateTransitions};
use crate::graph::{LineageGraph, NodeId, MAX_CHILDREN};
use crate::scoring::{score, ScoreContext, ScoreWeights, REJECT_SCORE};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Which side of the link the pass searches from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LinkDirection {
    /// From each childless component to a successor
    Forward,
    /// From each parentless component to a predecessor
    Backward,
}

/// One linking pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkPass {
    /// Label used in logs and reports
    pub name: String,

    pub direction: LinkDirection,

    /// Number of frames searched ahead (or behind)
    pub window: usize,

    /// Maximum centroid distance in pixels
    pub max_radius: f64,

    /// Best score must be strictly below this
    pub score_threshold: f64,

    /// Score multiplier per frame of gap: `score × (1 + decay × frames_ahead)`
    pub time_decay: f64,

    pub transitions: StateTransitions,
}

impl Default for LinkPass {
    fn default() -> Self {
        Self {
            name: "tight".to_string(),
            direction: LinkDirection::Forward,
            window: 1,
            max_radius: 20.0,
            score_threshold: 0.35,
            time_decay: 0.0,
            transitions: StateTransitions::forward_default(),
        }
    }
}

/// Configuration for the FrameLinker
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkerConfig {
    /// Passes, run in order
    pub passes: Vec<LinkPass>,

    pub weights: ScoreWeights,

    /// Optional cap on the number of nodes in a root-to-leaf path
    pub max_path_length: Option<usize>,
}

impl Default for LinkerConfig {
    fn default() -> Self {
        Self {
            passes: vec![
                LinkPass::default(),
                LinkPass {
                    name: "relaxed".to_string(),
                    max_radius: 35.0,
                    score_threshold: 0.5,
                    ..LinkPass::default()
                },
                LinkPass {
                    name: "gap_closing".to_string(),
                    window: 3,
                    max_radius: 35.0,
                    score_threshold: 0.5,
                    time_decay: 0.25,
                    ..LinkPass::default()
                },
                LinkPass {
                    name: "backward_recovery".to_string(),
                    direction: LinkDirection::Backward,
                    window: 2,
                    max_radius: 30.0,
                    score_threshold: 0.5,
                    time_decay: 0.25,
                    transitions: StateTransitions::backward_default(),
                },
            ],
            weights: ScoreWeights::default(),
            max_path_length: None,
        }
    }
}

// ============================================================================
// SEARCH RESULTS
// ============================================================================

/// A scored candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Candidate {
    pub node: NodeId,
    /// Time-decayed penalty
    pub score: f64,
    pub frame_gap: usize,
}

/// Best and runner-up candidates of one search.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BestMatch {
    pub best: Candidate,
    /// Bookkeeping only
    pub second: Option<Candidate>,
}

impl BestMatch {
    fn offer(slot: &mut Option<BestMatch>, candidate: Candidate) {
        match slot {
            None => {
                *slot = Some(BestMatch {
                    best: candidate,
                    second: None,
                })
            }
            Some(m) if candidate.score < m.best.score => {
                m.second = Some(m.best);
                m.best = candidate;
            }
            Some(m) => {
                if m.second.map_or(true, |s| candidate.score < s.score) {
                    m.second = Some(candidate);
                }
            }
        }
    }
}

/// Outcome counts of one pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LinkStats {
    pub linked: usize,
    pub unmatched: usize,
    pub rejected_not_mutual: usize,
    pub rejected_degree: usize,
    pub rejected_path_length: usize,
}

impl LinkStats {
    fn absorb(&mut self, other: &LinkStats) {
        self.linked += other.linked;
        self.unmatched += other.unmatched;
        self.rejected_not_mutual += other.rejected_not_mutual;
        self.rejected_degree += other.rejected_degree;
        self.rejected_path_length += other.rejected_path_length;
    }
}

/// Per-pass statistics of a full linking run.
#[derive(Debug, Clone, Default, Serialize)]
pub struct LinkReport {
    pub passes: Vec<(String, LinkStats)>,
}

impl LinkReport {
    pub fn total_linked(&self) -> usize {
        self.passes.iter().map(|(_, s)| s.linked).sum()
    }
}

// ============================================================================
// FRAME LINKER
// ============================================================================

/// Nearest-neighbour linker with lookahead and mutual-best verification.
pub struct FrameLinker {
    config: LinkerConfig,
}

impl FrameLinker {
    pub fn new(config: LinkerConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(LinkerConfig::default())
    }

    pub fn config(&self) -> &LinkerConfig {
        &self.config
    }

    /// Run every configured pass over the whole stack.
    pub fn run(&self, graph: &mut LineageGraph, stack: &mut ComponentStack) -> LinkReport {
        let mut report = LinkReport::default();
        for pass in &self.config.passes {
            let stats = self.run_pass(graph, stack, pass);
            info!(
                "Link pass '{}': {} linked, {} unmatched, {} not mutual, {} degree, {} path",
                pass.name,
                stats.linked,
                stats.unmatched,
                stats.rejected_not_mutual,
                stats.rejected_degree,
                stats.rejected_path_length
            );
            report.passes.push((pass.name.clone(), stats));
        }
        report
    }

    /// One pass over all frames: forward passes go 0→N, backward passes N→1.
    pub fn run_pass(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        pass: &LinkPass,
    ) -> LinkStats {
        let mut stats = LinkStats::default();
        let n = stack.frame_count();
        match pass.direction {
            LinkDirection::Forward => {
                for frame in 0..n.saturating_sub(1) {
                    stats.absorb(&self.link_frame(graph, stack, frame, pass));
                }
            }
            LinkDirection::Backward => {
                for frame in (1..n).rev() {
                    stats.absorb(&self.link_frame_backward(graph, stack, frame, pass));
                }
            }
        }
        stats
    }

    // ========================================================================
    // SEARCH
    // ========================================================================

    /// Pair-symmetric neighbourhood minimum distance used by the score.
    fn score_context(&self, stack: &ComponentStack, a: NodeId, b: NodeId, pass: &LinkPass) -> Option<ScoreContext> {
        let ca = stack.get(a)?;
        let cb = stack.get(b)?;
        let from_a = stack.nearest_distance(b.frame, &ca.centroid)?;
        let from_b = stack.nearest_distance(a.frame, &cb.centroid)?;
        Some(ScoreContext {
            max_radius: pass.max_radius,
            local_min_distance: from_a.min(from_b),
        })
    }

    fn decayed_score(
        &self,
        stack: &ComponentStack,
        earlier: NodeId,
        later: NodeId,
        pass: &LinkPass,
    ) -> Option<f64> {
        let ctx = self.score_context(stack, earlier, later, pass)?;
        let raw = score(stack.get(earlier)?, stack.get(later)?, &ctx, &self.config.weights);
        if raw >= REJECT_SCORE {
            return None;
        }
        let gap = (later.frame - earlier.frame) as f64;
        Some(raw * (1.0 + pass.time_decay * gap))
    }

    /// Best successor of `source` within the pass window.
    pub fn search_forward(
        &self,
        stack: &ComponentStack,
        source: NodeId,
        pass: &LinkPass,
    ) -> Option<BestMatch> {
        self.search_forward_where(stack, source, pass, |_| true)
    }

    fn search_forward_where(
        &self,
        stack: &ComponentStack,
        source: NodeId,
        pass: &LinkPass,
        admit: impl Fn(&Component) -> bool,
    ) -> Option<BestMatch> {
        let from_state = stack.get(source)?.state;
        let last = (source.frame + pass.window).min(stack.frame_count().saturating_sub(1));
        let mut found = None;

        for frame in source.frame + 1..=last {
            for (slot, candidate) in stack.frame(frame).iter().enumerate() {
                if !admit(candidate) || !pass.transitions.allows(from_state, candidate.state) {
                    continue;
                }
                let node = NodeId::new(frame, slot);
                if let Some(s) = self.decayed_score(stack, source, node, pass) {
                    BestMatch::offer(
                        &mut found,
                        Candidate {
                            node,
                            score: s,
                            frame_gap: frame - source.frame,
                        },
                    );
                }
            }
        }
        found
    }

    /// Best predecessor of `target` within the pass window.
    pub fn search_backward(
        &self,
        stack: &ComponentStack,
        target: NodeId,
        pass: &LinkPass,
    ) -> Option<BestMatch> {
        let to_state = stack.get(target)?.state;
        let first = target.frame.saturating_sub(pass.window);
        let mut found = None;

        for frame in (first..target.frame).rev() {
            for (slot, candidate) in stack.frame(frame).iter().enumerate() {
                if !pass.transitions.allows(candidate.state, to_state) {
                    continue;
                }
                let node = NodeId::new(frame, slot);
                if let Some(s) = self.decayed_score(stack, node, target, pass) {
                    BestMatch::offer(
                        &mut found,
                        Candidate {
                            node,
                            score: s,
                            frame_gap: target.frame - frame,
                        },
                    );
                }
            }
        }
        found
    }

    fn exceeds_path_cap(&self, graph: &LineageGraph, from: NodeId, to: NodeId) -> bool {
        match self.config.max_path_length {
            Some(cap) => graph.depth(from) + graph.descendant_depth(to) > cap,
            None => false,
        }
    }

    // ========================================================================
    // LINKING
    // ========================================================================

    /// Forward-link every childless component of `frame`.
    pub fn link_frame(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        frame: usize,
        pass: &LinkPass,
    ) -> LinkStats {
        let mut stats = LinkStats::default();

        for slot in 0..stack.frame(frame).len() {
            let source = NodeId::new(frame, slot);
            if stack.get(source).map_or(true, |c| c.child_count > 0) {
                continue;
            }

            let Some(found) = self.search_forward(stack, source, pass) else {
                stats.unmatched += 1;
                continue;
            };
            if found.best.score >= pass.score_threshold {
                stats.unmatched += 1;
                continue;
            }
            let target = found.best.node;

            let mutual = self
                .search_backward(stack, target, pass)
                .map(|m| m.best.node);
            if mutual != Some(source) {
                stats.rejected_not_mutual += 1;
                continue;
            }

            let source_children = stack.get(source).map_or(0, |c| usize::from(c.child_count));
            if stack.get(target).map_or(true, |c| c.has_parent) || source_children >= MAX_CHILDREN {
                stats.rejected_degree += 1;
                continue;
            }
            if self.exceeds_path_cap(graph, source, target) {
                stats.rejected_path_length += 1;
                continue;
            }

            match graph.connect(stack, source, target) {
                Ok(()) => {
                    debug!("link {} -> {} score {:.4}", source, target, found.best.score);
                    stats.linked += 1;
                }
                Err(e) => {
                    debug!("link {} -> {} refused: {}", source, target, e);
                    stats.rejected_degree += 1;
                }
            }
        }
        stats
    }

    /// Backward-link every parentless component of `frame` to a predecessor.
    ///
    /// A predecessor that already has one child accepts a second only when it
    /// is in the `MitosisStart` state.
    pub fn link_frame_backward(
        &self,
        graph: &mut LineageGraph,
        stack: &mut ComponentStack,
        frame: usize,
        pass: &LinkPass,
    ) -> LinkStats {
        let mut stats = LinkStats::default();

        // Strongest matches first, so sisters claim a shared parent in score order.
        let mut targets = Vec::new();
        for slot in 0..stack.frame(frame).len() {
            let target = NodeId::new(frame, slot);
            if stack.get(target).map_or(true, |c| c.has_parent) {
                continue;
            }
            match self.search_backward(stack, target, pass) {
                Some(found) => targets.push((target, found)),
                None => stats.unmatched += 1,
            }
        }
        targets.sort_by(|a, b| {
            a.1.best
                .score
                .partial_cmp(&b.1.best.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(a.0.cmp(&b.0))
        });

        for (target, found) in targets {
            if found.best.score >= pass.score_threshold {
                stats.unmatched += 1;
                continue;
            }
            let source = found.best.node;

            // Successors that already have a parent are not competitors here.
            let mutual = self
                .search_forward_where(stack, source, pass, |c| !c.has_parent)
                .map(|m| m.best.node);
            if mutual != Some(target) {
                stats.rejected_not_mutual += 1;
                continue;
            }

            let accepts = stack.get(source).map_or(false, |p| match p.child_count {
                0 => true,
                1 => p.state == ComponentState::MitosisStart,
                _ => false,
            });
            if !accepts {
                stats.rejected_degree += 1;
                continue;
            }
            if self.exceeds_path_cap(graph, source, target) {
                stats.rejected_path_length += 1;
                continue;
            }

            match graph.connect(stack, source, target) {
                Ok(()) => {
                    debug!("backward link {} -> {} score {:.4}", source, target, found.best.score);
                    stats.linked += 1;
                }
                Err(e) => {
                    debug!("backward link {} -> {} refused: {}", source, target, e);
                    stats.rejected_degree += 1;
                }
            }
        }
        stats
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point2;

    fn cell(x: f64, y: f64) -> Component {
        Component::from_measurements(Point2::new(x, y), 50.0, 100.0, 0.9)
    }

    fn single_pass(window: usize, radius: f64) -> LinkerConfig {
        LinkerConfig {
            passes: vec![LinkPass {
                window,
                max_radius: radius,
                score_threshold: 0.5,
                ..LinkPass::default()
            }],
            ..LinkerConfig::default()
        }
    }

    #[test]
    fn test_links_nearest_and_leaves_far_unmatched() {
        let mut stack = ComponentStack::from_frames(
            vec![vec![cell(10.0, 10.0), cell(50.0, 50.0)], vec![cell(11.0, 11.0)]],
            64,
            64,
        );
        let mut graph = LineageGraph::from_stack(&stack);
        let linker = FrameLinker::new(single_pass(1, 20.0));

        let report = linker.run(&mut graph, &mut stack);

        assert_eq!(report.total_linked(), 1);
        assert!(graph.has_link(NodeId::new(0, 0), NodeId::new(1, 0)));
        assert_eq!(graph.out_degree(NodeId::new(0, 1)), 0);
        assert_eq!(report.passes[0].1.unmatched, 1);
        assert!(graph.check_consistency(&stack).is_empty());
    }

    #[test]
    fn test_mutual_best_rejects_many_to_one() {
        // Two sources compete for one target; only the closer one wins.
        let mut stack = ComponentStack::from_frames(
            vec![vec![cell(10.0, 10.0), cell(16.0, 10.0)], vec![cell(15.0, 10.0)]],
            64,
            64,
        );
        let mut graph = LineageGraph::from_stack(&stack);
        let linker = FrameLinker::new(single_pass(1, 20.0));

        let report = linker.run(&mut graph, &mut stack);

        assert!(graph.has_link(NodeId::new(0, 1), NodeId::new(1, 0)));
        assert_eq!(graph.link_count(), 1);
        assert_eq!(report.passes[0].1.rejected_not_mutual, 1);
    }

    #[test]
    fn test_added_links_are_mutual_best() {
        let mut stack = ComponentStack::from_frames(
            vec![
                vec![cell(10.0, 10.0), cell(30.0, 30.0), cell(50.0, 12.0)],
                vec![cell(12.0, 11.0), cell(31.0, 33.0), cell(49.0, 14.0)],
                vec![cell(13.0, 13.0), cell(33.0, 35.0)],
            ],
            64,
            64,
        );
        let mut graph = LineageGraph::from_stack(&stack);
        let config = single_pass(2, 20.0);
        let pass = config.passes[0].clone();
        let linker = FrameLinker::new(config);

        linker.run(&mut graph, &mut stack);

        assert!(graph.link_count() >= 4);
        for link in graph.links() {
            let back = linker.search_backward(&stack, link.to, &pass).unwrap();
            assert_eq!(back.best.node, link.from);
        }
    }

    #[test]
    fn test_lookahead_bridges_missing_frame() {
        let mut stack = ComponentStack::from_frames(
            vec![vec![cell(10.0, 10.0)], vec![], vec![cell(12.0, 10.0)]],
            64,
            64,
        );
        let mut graph = LineageGraph::from_stack(&stack);

        FrameLinker::new(single_pass(1, 20.0)).run(&mut graph, &mut stack);
        assert_eq!(graph.link_count(), 0);

        FrameLinker::new(single_pass(2, 20.0)).run(&mut graph, &mut stack);
        assert!(graph.has_link(NodeId::new(0, 0), NodeId::new(2, 0)));
    }

    #[test]
    fn test_passes_are_idempotent() {
        let mut stack = ComponentStack::from_frames(
            vec![vec![cell(10.0, 10.0)], vec![cell(11.0, 10.0)], vec![cell(12.0, 10.0)]],
            64,
            64,
        );
        let mut graph = LineageGraph::from_stack(&stack);
        let linker = FrameLinker::new(single_pass(1, 20.0));

        linker.run(&mut graph, &mut stack);
        let links = graph.link_count();
        let second = linker.run(&mut graph, &mut stack);

        assert_eq!(graph.link_count(), links);
        assert_eq!(second.total_linked(), 0);
    }

    #[test]
    fn test_path_length_cap() {
        let mut stack = ComponentStack::from_frames(
            (0..5).map(|f| vec![cell(10.0 + f as f64, 10.0)]).collect(),
            64,
            64,
        );
        let mut graph = LineageGraph::from_stack(&stack);
        let mut config = single_pass(1, 20.0);
        config.max_path_length = Some(3);

        let report = FrameLinker::new(config).run(&mut graph, &mut stack);

        // The chain breaks once the path would exceed three nodes.
        assert!(!graph.has_link(NodeId::new(2, 0), NodeId::new(3, 0)));
        assert_eq!(graph.link_count(), 3);
        assert_eq!(report.passes[0].1.rejected_path_length, 1);
        assert!(graph.depth(NodeId::new(2, 0)) <= 3);
    }

    #[test]
    fn test_state_transitions_gate_candidates() {
        let mut stack = ComponentStack::from_frames(
            vec![
                vec![cell(10.0, 10.0)],
                vec![cell(11.0, 10.0).with_state(ComponentState::WhiteBlob)],
            ],
            64,
            64,
        );
        let mut graph = LineageGraph::from_stack(&stack);
        FrameLinker::new(single_pass(1, 20.0)).run(&mut graph, &mut stack);
        assert_eq!(graph.link_count(), 0);
    }

    #[test]
    fn test_backward_pass_accepts_second_child_only_in_mitosis() {
        let build = |state: ComponentState| {
            let mut stack = ComponentStack::from_frames(
                vec![
                    vec![cell(20.0, 20.0).with_state(state)],
                    vec![cell(20.0, 18.0), cell(20.0, 23.0)],
                ],
                64,
                64,
            );
            let mut graph = LineageGraph::from_stack(&stack);
            graph
                .connect(&mut stack, NodeId::new(0, 0), NodeId::new(1, 0))
                .unwrap();
            (stack, graph)
        };
        let pass = LinkPass {
            direction: LinkDirection::Backward,
            window: 1,
            max_radius: 20.0,
            score_threshold: 0.9,
            transitions: StateTransitions::new([
                (ComponentState::Normal, ComponentState::Normal),
                (ComponentState::MitosisStart, ComponentState::Normal),
            ]),
            ..LinkPass::default()
        };
        let linker = FrameLinker::new(LinkerConfig {
            passes: vec![pass.clone()],
            ..LinkerConfig::default()
        });

        let (mut stack, mut graph) = build(ComponentState::Normal);
        let stats = linker.link_frame_backward(&mut graph, &mut stack, 1, &pass);
        assert_eq!(stats.linked, 0);
        assert_eq!(graph.out_degree(NodeId::new(0, 0)), 1);

        let (mut stack, mut graph) = build(ComponentState::MitosisStart);
        let stats = linker.link_frame_backward(&mut graph, &mut stack, 1, &pass);
        assert_eq!(stats.linked, 1);
        assert_eq!(stack.get(NodeId::new(0, 0)).unwrap().child_count, 2);
        assert!(graph.check_consistency(&stack).is_empty());
    }

    #[test]
    fn test_backward_pass_links_both_sisters_in_score_order() {
        // The closer sister sits in the higher slot; slot order alone would lose it.
        let mut stack = ComponentStack::from_frames(
            vec![
                vec![cell(20.0, 20.0).with_state(ComponentState::MitosisStart)],
                vec![
                    cell(20.0, 14.0).with_state(ComponentState::MitosisEnd),
                    cell(20.0, 24.0).with_state(ComponentState::MitosisEnd),
                ],
            ],
            64,
            64,
        );
        let mut graph = LineageGraph::from_stack(&stack);
        let pass = LinkPass {
            direction: LinkDirection::Backward,
            window: 1,
            max_radius: 20.0,
            score_threshold: 0.9,
            transitions: StateTransitions::backward_default(),
            ..LinkPass::default()
        };
        let linker = FrameLinker::new(LinkerConfig {
            passes: vec![pass.clone()],
            ..LinkerConfig::default()
        });

        let stats = linker.link_frame_backward(&mut graph, &mut stack, 1, &pass);

        assert_eq!(stats.linked, 2);
        assert_eq!(stats.rejected_not_mutual, 0);
        assert_eq!(graph.out_degree(NodeId::new(0, 0)), 2);
        assert!(graph.check_consistency(&stack).is_empty());
    }
}
