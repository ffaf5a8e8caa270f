//! The Track Extractor - linear chains of the lineage graph
//!
//! A track is a maximal run of single-child nodes: it starts at a node whose
//! parent is absent or divides, and ends at the first node with zero or two
//! children. Tracks are derived data; any graph mutation makes them stale
//! unless patched in lockstep (see `disconnect_first_components`).

use serde::{Deserialize, Serialize};

use crate::component::{ComponentState, ComponentStack};
use crate::graph::{GraphError, LineageGraph, NodeId};

/// Division-resolution state of a track.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DivisionStatus {
    /// Not yet examined
    Active,
    /// Ends prematurely; suspected division
    EndedOnMitosis,
    /// Children attached
    Resolved,
    /// Examined, no children found; stays terminal
    Unresolved,
}

/// A maximal linear chain of linked components.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    pub start: NodeId,
    pub end: NodeId,
    pub start_frame: usize,
    pub end_frame: usize,
    /// Number of components in the chain
    pub length: usize,
    /// End node divides, or its component is stamped `MitosisStart`
    pub ended_on_mitosis: bool,
    /// Already adopted as a division child (or blob continuation)
    pub claimed_as_child: bool,
    pub status: DivisionStatus,
}

/// Extract every track longer than `min_length` components.
///
/// Deterministic: tracks come out in order of their start node's global index.
pub fn extract_tracks(graph: &LineageGraph, stack: &ComponentStack, min_length: usize) -> Vec<Track> {
    let adjacency = graph.adjacency_snapshot();
    let n = adjacency.len();

    let mut reverse: Vec<Option<usize>> = vec![None; n];
    for (parent, children) in adjacency.iter().enumerate() {
        for &child in children {
            reverse[child] = Some(parent);
        }
    }

    let mut visited = vec![false; n];
    let mut tracks = Vec::new();

    for seed in 0..n {
        if visited[seed] {
            continue;
        }

        // Starting ancestor: climb while the parent continues this chain.
        let mut start = seed;
        while let Some(p) = reverse[start] {
            if adjacency[p].len() != 1 || visited[p] {
                break;
            }
            start = p;
        }

        let mut end = start;
        let mut length = 1;
        visited[end] = true;
        while adjacency[end].len() == 1 {
            let next = adjacency[end][0];
            if visited[next] {
                break;
            }
            end = next;
            visited[end] = true;
            length += 1;
        }

        if length <= min_length {
            continue;
        }

        let start_node = graph.node(start);
        let end_node = graph.node(end);
        let divides = adjacency[end].len() == 2;
        let stamped = stack
            .get(end_node)
            .map_or(false, |c| c.state == ComponentState::MitosisStart);

        tracks.push(Track {
            start: start_node,
            end: end_node,
            start_frame: start_node.frame,
            end_frame: end_node.frame,
            length,
            ended_on_mitosis: divides || stamped,
            claimed_as_child: false,
            status: if divides {
                DivisionStatus::Resolved
            } else {
                DivisionStatus::Active
            },
        });
    }

    tracks
}

/// Sort tracks by end frame so earlier mitoses are resolved first.
pub fn sort_by_end_frame(tracks: &mut [Track]) {
    tracks.sort_by_key(|t| (t.end_frame, t.start));
}

/// The nodes of a track from start to end.
pub fn track_nodes(graph: &LineageGraph, track: &Track) -> Vec<NodeId> {
    let mut nodes = Vec::with_capacity(track.length);
    let mut current = track.start;
    nodes.push(current);
    while current != track.end && nodes.len() < track.length {
        let children = graph.children(current);
        if children.len() != 1 {
            break;
        }
        current = children[0];
        nodes.push(current);
    }
    nodes
}

/// Detach the leading `k` components of a track and advance its start.
///
/// The detached prefix loses all its links, including any link into the old
/// start. Fails without touching the graph if `k >= track.length`.
pub fn disconnect_first_components(
    graph: &mut LineageGraph,
    stack: &mut ComponentStack,
    track: &mut Track,
    k: usize,
) -> Result<(), TrackError> {
    if k >= track.length {
        return Err(TrackError::CannotShrink {
            requested: k,
            length: track.length,
        });
    }
    if k == 0 {
        return Ok(());
    }

    let nodes = track_nodes(graph, track);
    if nodes.len() <= k {
        return Err(TrackError::BrokenChain(track.start));
    }

    if let Some(parent) = graph.parent(nodes[0]) {
        graph.disconnect(stack, parent, nodes[0])?;
    }
    for pair in nodes[..=k].windows(2) {
        graph.disconnect(stack, pair[0], pair[1])?;
    }

    let new_start = nodes[k];
    track.start = new_start;
    track.start_frame = new_start.frame;
    track.length -= k;
    Ok(())
}

// ============================================================================
// ERRORS
// ============================================================================

/// Guarded no-ops and failures of track surgery.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TrackError {
    #[error("Cannot remove {requested} components from a track of length {length}")]
    CannotShrink { requested: usize, length: usize },

    #[error("Track starting at {0} is not a linear chain in the graph")]
    BrokenChain(NodeId),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

// ============================================================================
// TESTS
// ============================================================================
