//! The Lineage Graph - directed links between components across frames
//!
//! Nodes are `(frame, slot)` pairs; a link `from -> to` means the component at
//! `from` is the biological predecessor of the one at `to`.
//!
//! Invariants enforced by every mutating operation:
//! - a node has at most one parent
//! - a node has at most two children (binary division only)
//! - links go from an earlier frame to a strictly later frame
//! - `Component::child_count` / `Component::has_parent` always mirror the degrees
//!
//! The adjacency list (node index → child indices) is the primary traversal
//! structure; the node list and link list are kept for direct lookup.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::component::{Component, ComponentStack};

/// Maximum children of a node.
pub const MAX_CHILDREN: usize = 2;

// ============================================================================
// NODES & LINKS
// ============================================================================

/// Identity of one component inside the graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NodeId {
    pub frame: usize,
    pub slot: usize,
}

impl NodeId {
    #[inline]
    pub const fn new(frame: usize, slot: usize) -> Self {
        Self { frame, slot }
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {})", self.frame, self.slot)
    }
}

/// A directed predecessor link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Link {
    pub from: NodeId,
    pub to: NodeId,
}

/// A violated graph/component invariant found by `check_consistency`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConsistencyViolation {
    OutDegreeExceeded { node: NodeId, degree: usize },
    InDegreeExceeded { node: NodeId, degree: usize },
    ChildCountMismatch { node: NodeId, child_count: u8, out_degree: usize },
    ParentFlagMismatch { node: NodeId, has_parent: bool, in_degree: usize },
    NotForward { from: NodeId, to: NodeId },
    MissingComponent { node: NodeId },
}

impl std::fmt::Display for ConsistencyViolation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::OutDegreeExceeded { node, degree } => {
                write!(f, "node {} has out-degree {}", node, degree)
            }
            Self::InDegreeExceeded { node, degree } => {
                write!(f, "node {} has in-degree {}", node, degree)
            }
            Self::ChildCountMismatch { node, child_count, out_degree } => write!(
                f,
                "node {} child_count {} != out-degree {}",
                node, child_count, out_degree
            ),
            Self::ParentFlagMismatch { node, has_parent, in_degree } => write!(
                f,
                "node {} has_parent {} but in-degree {}",
                node, has_parent, in_degree
            ),
            Self::NotForward { from, to } => write!(f, "link {} -> {} is not forward in time", from, to),
            Self::MissingComponent { node } => write!(f, "node {} has no component", node),
        }
    }
}

// ============================================================================
// LINEAGE GRAPH
// ============================================================================

/// Directed lineage graph over `(frame, slot)` nodes.
#[derive(Debug, Clone, Default)]
pub struct LineageGraph {
    /// Global index → node
    nodes: Vec<NodeId>,

    /// Node → global index
    index: HashMap<NodeId, usize>,

    /// All links, in insertion order
    links: Vec<Link>,

    /// Global index → child indices (at most `MAX_CHILDREN`)
    adjacency: Vec<Vec<usize>>,

    /// Global index → parent index
    parents: Vec<Option<usize>>,
}

impl LineageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graph with one node per component of the stack and no links.
    pub fn from_stack(stack: &ComponentStack) -> Self {
        let mut graph = Self::new();
        for (node, _) in stack.iter() {
            graph.add_node(node);
        }
        graph
    }

    // ========================================================================
    // NODES
    // ========================================================================

    /// Register a node, returning its global index. Idempotent.
    pub fn add_node(&mut self, node: NodeId) -> usize {
        if let Some(&idx) = self.index.get(&node) {
            return idx;
        }
        let idx = self.nodes.len();
        self.nodes.push(node);
        self.index.insert(node, idx);
        self.adjacency.push(Vec::new());
        self.parents.push(None);
        idx
    }

    /// Insert a new component into the stack and register it as a node.
    pub fn add_component(
        &mut self,
        stack: &mut ComponentStack,
        frame: usize,
        component: Component,
    ) -> NodeId {
        let node = stack.insert(frame, component);
        self.add_node(node);
        node
    }

    #[inline]
    pub fn index_of(&self, node: NodeId) -> Option<usize> {
        self.index.get(&node).copied()
    }

    #[inline]
    pub fn node(&self, idx: usize) -> NodeId {
        self.nodes[idx]
    }

    pub fn contains(&self, node: NodeId) -> bool {
        self.index.contains_key(&node)
    }

    pub fn nodes(&self) -> &[NodeId] {
        &self.nodes
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    // ========================================================================
    // LINKS & DEGREES
    // ========================================================================

    pub fn links(&self) -> &[Link] {
        &self.links
    }

    pub fn link_count(&self) -> usize {
        self.links.len()
    }

    /// Copy of the adjacency list for traversals that must not observe mutation.
    pub fn adjacency_snapshot(&self) -> Vec<Vec<usize>> {
        self.adjacency.clone()
    }

    pub fn children(&self, node: NodeId) -> Vec<NodeId> {
        self.index_of(node)
            .map(|idx| self.adjacency[idx].iter().map(|&c| self.nodes[c]).collect())
            .unwrap_or_default()
    }

    pub fn parent(&self, node: NodeId) -> Option<NodeId> {
        let idx = self.index_of(node)?;
        self.parents[idx].map(|p| self.nodes[p])
    }

    pub fn out_degree(&self, node: NodeId) -> usize {
        self.index_of(node).map_or(0, |idx| self.adjacency[idx].len())
    }

    pub fn in_degree(&self, node: NodeId) -> usize {
        self.index_of(node)
            .map_or(0, |idx| usize::from(self.parents[idx].is_some()))
    }

    pub fn has_link(&self, from: NodeId, to: NodeId) -> bool {
        self.parent(to) == Some(from)
    }

    /// Check whether `from -> to` may be added without breaking an invariant.
    pub fn can_link(&self, from: NodeId, to: NodeId) -> Result<(), GraphError> {
        let from_idx = self.index_of(from).ok_or(GraphError::NodeNotFound(from))?;
        let to_idx = self.index_of(to).ok_or(GraphError::NodeNotFound(to))?;

        if to.frame <= from.frame {
            return Err(GraphError::NotForward { from, to });
        }
        if self.parents[to_idx].is_some() {
            return Err(GraphError::AlreadyHasParent(to));
        }
        if self.adjacency[from_idx].len() >= MAX_CHILDREN {
            return Err(GraphError::TooManyChildren(from));
        }
        Ok(())
    }

    /// Add `from -> to` and update both components' bookkeeping.
    pub fn connect(
        &mut self,
        stack: &mut ComponentStack,
        from: NodeId,
        to: NodeId,
    ) -> Result<(), GraphError> {
        self.can_link(from, to)?;
        if stack.get(from).is_none() {
            return Err(GraphError::NodeNotFound(from));
        }
        if stack.get(to).is_none() {
            return Err(GraphError::NodeNotFound(to));
        }

        let from_idx = self.index[&from];
        let to_idx = self.index[&to];
        self.adjacency[from_idx].push(to_idx);
        self.parents[to_idx] = Some(from_idx);
        self.links.push(Link { from, to });

        if let Some(parent) = stack.get_mut(from) {
            parent.child_count += 1;
        }
        if let Some(child) = stack.get_mut(to) {
            child.has_parent = true;
        }
        Ok(())
    }

    /// Remove `from -> to` and update both components' bookkeeping.
    pub fn disconnect(
        &mut self,
        stack: &mut ComponentStack,
        from: NodeId,
        to: NodeId,
    ) -> Result<(), GraphError> {
        if !self.has_link(from, to) {
            return Err(GraphError::LinkNotFound { from, to });
        }
        let from_idx = self.index[&from];
        let to_idx = self.index[&to];

        self.adjacency[from_idx].retain(|&c| c != to_idx);
        self.parents[to_idx] = None;
        self.links.retain(|l| !(l.from == from && l.to == to));

        if let Some(parent) = stack.get_mut(from) {
            parent.child_count = parent.child_count.saturating_sub(1);
        }
        if let Some(child) = stack.get_mut(to) {
            child.has_parent = false;
        }
        Ok(())
    }

    // ========================================================================
    // PATH QUERIES
    // ========================================================================

    /// Number of nodes on the path from the earliest ancestor to `node`, inclusive.
    pub fn depth(&self, node: NodeId) -> usize {
        let Some(mut idx) = self.index_of(node) else {
            return 0;
        };
        let mut depth = 1;
        while let Some(p) = self.parents[idx] {
            idx = p;
            depth += 1;
        }
        depth
    }

    /// Number of nodes on the longest downstream path starting at `node`, inclusive.
    pub fn descendant_depth(&self, node: NodeId) -> usize {
        let Some(start) = self.index_of(node) else {
            return 0;
        };
        let mut best = 0;
        let mut stack = vec![(start, 1usize)];
        while let Some((idx, depth)) = stack.pop() {
            best = best.max(depth);
            for &child in &self.adjacency[idx] {
                stack.push((child, depth + 1));
            }
        }
        best
    }

    // ========================================================================
    // CONSISTENCY
    // ========================================================================

    /// Verify every degree/bookkeeping invariant against the component stack.
    pub fn check_consistency(&self, stack: &ComponentStack) -> Vec<ConsistencyViolation> {
        let mut violations = Vec::new();
        let mut in_degree = vec![0usize; self.nodes.len()];

        for link in &self.links {
            if link.to.frame <= link.from.frame {
                violations.push(ConsistencyViolation::NotForward {
                    from: link.from,
                    to: link.to,
                });
            }
            if let Some(idx) = self.index_of(link.to) {
                in_degree[idx] += 1;
            }
        }

        for (idx, &node) in self.nodes.iter().enumerate() {
            let out = self.adjacency[idx].len();
            if out > MAX_CHILDREN {
                violations.push(ConsistencyViolation::OutDegreeExceeded { node, degree: out });
            }
            if in_degree[idx] > 1 {
                violations.push(ConsistencyViolation::InDegreeExceeded {
                    node,
                    degree: in_degree[idx],
                });
            }

            let Some(component) = stack.get(node) else {
                violations.push(ConsistencyViolation::MissingComponent { node });
                continue;
            };
            if usize::from(component.child_count) != out {
                violations.push(ConsistencyViolation::ChildCountMismatch {
                    node,
                    child_count: component.child_count,
                    out_degree: out,
                });
            }
            if component.has_parent != (in_degree[idx] == 1) {
                violations.push(ConsistencyViolation::ParentFlagMismatch {
                    node,
                    has_parent: component.has_parent,
                    in_degree: in_degree[idx],
                });
            }
        }

        // Components the graph never registered must be unlinked.
        for (node, component) in stack.iter() {
            if !self.contains(node) && (component.child_count != 0 || component.has_parent) {
                violations.push(ConsistencyViolation::ChildCountMismatch {
                    node,
                    child_count: component.child_count,
                    out_degree: 0,
                });
            }
        }

        violations
    }
}

// ============================================================================
// ERRORS
// ============================================================================

/// Rejections raised by graph mutation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum GraphError {
    #[error("Node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("Link {from} -> {to} does not go forward in time")]
    NotForward { from: NodeId, to: NodeId },

    #[error("Node {0} already has a parent")]
    AlreadyHasParent(NodeId),

    #[error("Node {0} already has two children")]
    TooManyChildren(NodeId),

    #[error("Link {from} -> {to} not found")]
    LinkNotFound { from: NodeId, to: NodeId },
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use nalgebra::Point2;

    fn chain_stack(frames: usize, per_frame: usize) -> ComponentStack {
        let frames = (0..frames)
            .map(|f| {
                (0..per_frame)
                    .map(|s| {
                        Component::from_measurements(
                            Point2::new(s as f64 * 10.0, f as f64),
                            20.0,
                            100.0,
                            0.9,
                        )
                    })
                    .collect()
            })
            .collect();
        ComponentStack::from_frames(frames, 64, 64)
    }

    #[test]
    fn test_connect_updates_components() {
        let mut stack = chain_stack(2, 1);
        let mut graph = LineageGraph::from_stack(&stack);
        let (a, b) = (NodeId::new(0, 0), NodeId::new(1, 0));

        graph.connect(&mut stack, a, b).unwrap();

        assert_eq!(graph.out_degree(a), 1);
        assert_eq!(graph.in_degree(b), 1);
        assert_eq!(stack.get(a).unwrap().child_count, 1);
        assert!(stack.get(b).unwrap().has_parent);
        assert!(graph.check_consistency(&stack).is_empty());
    }

    #[test]
    fn test_single_parent_enforced() {
        let mut stack = chain_stack(2, 2);
        let mut graph = LineageGraph::from_stack(&stack);
        let child = NodeId::new(1, 0);

        graph.connect(&mut stack, NodeId::new(0, 0), child).unwrap();
        let err = graph.connect(&mut stack, NodeId::new(0, 1), child);

        assert_eq!(err, Err(GraphError::AlreadyHasParent(child)));
        assert_eq!(stack.get(NodeId::new(0, 1)).unwrap().child_count, 0);
    }

    #[test]
    fn test_binary_division_limit() {
        let mut stack = chain_stack(2, 3);
        let mut graph = LineageGraph::from_stack(&stack);
        let parent = NodeId::new(0, 0);

        graph.connect(&mut stack, parent, NodeId::new(1, 0)).unwrap();
        graph.connect(&mut stack, parent, NodeId::new(1, 1)).unwrap();
        let err = graph.connect(&mut stack, parent, NodeId::new(1, 2));

        assert_eq!(err, Err(GraphError::TooManyChildren(parent)));
        assert_eq!(stack.get(parent).unwrap().child_count, 2);
    }

    #[test]
    fn test_links_must_go_forward() {
        let mut stack = chain_stack(2, 2);
        let mut graph = LineageGraph::from_stack(&stack);

        let same = graph.connect(&mut stack, NodeId::new(1, 0), NodeId::new(1, 1));
        let back = graph.connect(&mut stack, NodeId::new(1, 0), NodeId::new(0, 0));

        assert!(matches!(same, Err(GraphError::NotForward { .. })));
        assert!(matches!(back, Err(GraphError::NotForward { .. })));
        assert_eq!(graph.link_count(), 0);
    }

    #[test]
    fn test_disconnect_restores_bookkeeping() {
        let mut stack = chain_stack(3, 1);
        let mut graph = LineageGraph::from_stack(&stack);
        let (a, b, c) = (NodeId::new(0, 0), NodeId::new(1, 0), NodeId::new(2, 0));
        graph.connect(&mut stack, a, b).unwrap();
        graph.connect(&mut stack, b, c).unwrap();

        graph.disconnect(&mut stack, a, b).unwrap();

        assert_eq!(graph.link_count(), 1);
        assert_eq!(stack.get(a).unwrap().child_count, 0);
        assert!(!stack.get(b).unwrap().has_parent);
        assert!(graph.check_consistency(&stack).is_empty());
        assert!(matches!(
            graph.disconnect(&mut stack, a, b),
            Err(GraphError::LinkNotFound { .. })
        ));
    }

    #[test]
    fn test_depth_queries() {
        let mut stack = chain_stack(4, 1);
        let mut graph = LineageGraph::from_stack(&stack);
        for f in 0..3 {
            graph
                .connect(&mut stack, NodeId::new(f, 0), NodeId::new(f + 1, 0))
                .unwrap();
        }

        assert_eq!(graph.depth(NodeId::new(0, 0)), 1);
        assert_eq!(graph.depth(NodeId::new(3, 0)), 4);
        assert_eq!(graph.descendant_depth(NodeId::new(1, 0)), 3);
    }

    #[test]
    fn test_consistency_detects_tampering() {
        let mut stack = chain_stack(2, 1);
        let mut graph = LineageGraph::from_stack(&stack);
        graph
            .connect(&mut stack, NodeId::new(0, 0), NodeId::new(1, 0))
            .unwrap();

        stack.get_mut(NodeId::new(0, 0)).unwrap().child_count = 2;
        stack.get_mut(NodeId::new(1, 0)).unwrap().has_parent = false;

        let violations = graph.check_consistency(&stack);
        assert_eq!(violations.len(), 2);
    }

    #[test]
    fn test_add_component_registers_node() {
        let mut stack = chain_stack(2, 1);
        let mut graph = LineageGraph::from_stack(&stack);
        let c = Component::from_measurements(Point2::new(1.0, 1.0), 5.0, 1.0, 1.0);

        let node = graph.add_component(&mut stack, 1, c);

        assert_eq!(node, NodeId::new(1, 1));
        assert!(graph.contains(node));
        assert_eq!(graph.node_count(), 3);
    }
}
