//! The Component Model - per-frame segmented regions
//!
//! Every frame of the time-lapse stack is a list of `Component`s produced by an
//! upstream segmenter. The tracking stages address a component by its
//! `(frame, slot)` pair and mutate only its bookkeeping fields:
//! - `state` (mitosis stamping by the division resolver)
//! - `child_count` / `has_parent` (kept equal to the lineage graph degrees)
//!
//! Geometry and intensity are read-only once linking starts.

use nalgebra::Point2;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

use crate::graph::NodeId;

// ============================================================================
// COMPONENT STATE
// ============================================================================

/// Biological tracking state of a single component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ComponentState {
    /// Interphase cell
    Normal,
    /// Last component of a parent track before division
    MitosisStart,
    /// First component of a child track after division
    MitosisEnd,
    /// Bright marker blob inserted by the blob tracker
    WhiteBlob,
}

impl Default for ComponentState {
    fn default() -> Self {
        ComponentState::Normal
    }
}

/// Allow-list of `(from, to)` state pairs a link may connect.
///
/// `from` is always the earlier (parent) component, `to` the later one,
/// regardless of the direction the linker searched in.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateTransitions {
    pairs: Vec<(ComponentState, ComponentState)>,
}

impl StateTransitions {
    /// Build from an explicit list of pairs.
    pub fn new(pairs: impl IntoIterator<Item = (ComponentState, ComponentState)>) -> Self {
        let mut seen = HashSet::new();
        let pairs = pairs.into_iter().filter(|p| seen.insert(*p)).collect();
        Self { pairs }
    }

    /// Only interphase-to-interphase links.
    pub fn normal_only() -> Self {
        Self::new([(ComponentState::Normal, ComponentState::Normal)])
    }

    /// Forward-pass defaults: interphase links plus links into a mitosis onset.
    pub fn forward_default() -> Self {
        use ComponentState::*;
        Self::new([
            (Normal, Normal),
            (Normal, MitosisStart),
            (MitosisEnd, Normal),
            (MitosisEnd, MitosisEnd),
        ])
    }

    /// Backward-pass defaults: also recovers children that start right after a division.
    pub fn backward_default() -> Self {
        use ComponentState::*;
        Self::new([
            (Normal, Normal),
            (MitosisStart, MitosisEnd),
            (MitosisStart, Normal),
            (MitosisEnd, Normal),
            (WhiteBlob, Normal),
            (WhiteBlob, MitosisEnd),
        ])
    }

    /// Whether a link `from -> to` is allowed.
    #[inline]
    pub fn allows(&self, from: ComponentState, to: ComponentState) -> bool {
        self.pairs.iter().any(|&(f, t)| f == from && t == to)
    }

    /// All allowed pairs.
    pub fn pairs(&self) -> &[(ComponentState, ComponentState)] {
        &self.pairs
    }
}

impl Default for StateTransitions {
    fn default() -> Self {
        Self::forward_default()
    }
}

// ============================================================================
// GEOMETRY
// ============================================================================

/// Axis-aligned bounding box in pixel coordinates (inclusive min, exclusive max).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BoundingBox {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
}

impl BoundingBox {
    /// Tightest box around a set of pixels. Empty input gives an empty box.
    pub fn from_pixels(pixels: &[[u32; 2]]) -> Self {
        let mut iter = pixels.iter();
        let Some(first) = iter.next() else {
            return Self::default();
        };
        let mut bbox = Self {
            min_x: first[0],
            min_y: first[1],
            max_x: first[0] + 1,
            max_y: first[1] + 1,
        };
        for p in iter {
            bbox.min_x = bbox.min_x.min(p[0]);
            bbox.min_y = bbox.min_y.min(p[1]);
            bbox.max_x = bbox.max_x.max(p[0] + 1);
            bbox.max_y = bbox.max_y.max(p[1] + 1);
        }
        bbox
    }

    pub fn width(&self) -> u32 {
        self.max_x.saturating_sub(self.min_x)
    }

    pub fn height(&self) -> u32 {
        self.max_y.saturating_sub(self.min_y)
    }

    /// Whether two boxes share at least one pixel.
    pub fn intersects(&self, other: &BoundingBox) -> bool {
        self.min_x < other.max_x
            && other.min_x < self.max_x
            && self.min_y < other.max_y
            && other.min_y < self.max_y
    }
}

/// Pixel footprint of a component, stored sorted by `(y, x)` without duplicates.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Footprint {
    pixels: Vec<[u32; 2]>,
}

impl Footprint {
    /// Build from arbitrary `[x, y]` pixels.
    pub fn new(mut pixels: Vec<[u32; 2]>) -> Self {
        pixels.sort_unstable_by_key(|p| (p[1], p[0]));
        pixels.dedup();
        Self { pixels }
    }

    /// Filled disk of the given radius, clipped to the image.
    pub fn disk(center: Point2<f64>, radius: f64, width: u32, height: u32) -> Self {
        let r2 = radius * radius;
        let x0 = (center.x - radius).floor().max(0.0) as u32;
        let y0 = (center.y - radius).floor().max(0.0) as u32;
        let x1 = ((center.x + radius).ceil().max(0.0) as u32).min(width.saturating_sub(1));
        let y1 = ((center.y + radius).ceil().max(0.0) as u32).min(height.saturating_sub(1));

        let mut pixels = Vec::new();
        for y in y0..=y1 {
            for x in x0..=x1 {
                let dx = x as f64 + 0.5 - center.x;
                let dy = y as f64 + 0.5 - center.y;
                if dx * dx + dy * dy <= r2 {
                    pixels.push([x, y]);
                }
            }
        }
        Self { pixels }
    }

    pub fn pixels(&self) -> &[[u32; 2]] {
        &self.pixels
    }

    pub fn len(&self) -> usize {
        self.pixels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pixels.is_empty()
    }

    /// Number of shared pixels (merge of two sorted lists).
    pub fn intersection_count(&self, other: &Footprint) -> usize {
        let (mut i, mut j, mut count) = (0, 0, 0);
        while i < self.pixels.len() && j < other.pixels.len() {
            let a = (self.pixels[i][1], self.pixels[i][0]);
            let b = (other.pixels[j][1], other.pixels[j][0]);
            match a.cmp(&b) {
                std::cmp::Ordering::Less => i += 1,
                std::cmp::Ordering::Greater => j += 1,
                std::cmp::Ordering::Equal => {
                    count += 1;
                    i += 1;
                    j += 1;
                }
            }
        }
        count
    }

    /// Intersection over union. Two empty footprints have IoU 0.
    pub fn iou(&self, other: &Footprint) -> f64 {
        let inter = self.intersection_count(other);
        let union = self.len() + other.len() - inter;
        if union == 0 {
            0.0
        } else {
            inter as f64 / union as f64
        }
    }
}

// ============================================================================
// COMPONENT
// ============================================================================

/// One segmented region in one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Component {
    /// Intensity-weighted centre in pixel coordinates
    pub centroid: Point2<f64>,

    /// Pixel count
    pub area: f64,

    /// Mean intensity over the footprint
    pub avg_intensity: f64,

    /// Circularity in [0, 1]
    pub circularity: f64,

    pub bbox: BoundingBox,

    /// Region touches the image border
    pub touches_border: bool,

    pub footprint: Footprint,

    /// Value of this region in the segmenter's label raster; `None` for
    /// components added during tracking
    #[serde(default)]
    pub source_label: Option<u16>,

    // === Tracking bookkeeping ===
    pub state: ComponentState,

    /// Out-degree in the lineage graph (0, 1 or 2)
    pub child_count: u8,

    /// In-degree in the lineage graph is 1
    pub has_parent: bool,
}

impl Component {
    /// Create a component whose area and bounding box are derived from its footprint.
    pub fn from_footprint(
        centroid: Point2<f64>,
        footprint: Footprint,
        avg_intensity: f64,
        circularity: f64,
    ) -> Self {
        let bbox = BoundingBox::from_pixels(footprint.pixels());
        Self {
            centroid,
            area: footprint.len() as f64,
            avg_intensity,
            circularity: circularity.clamp(0.0, 1.0),
            bbox,
            touches_border: false,
            footprint,
            source_label: None,
            state: ComponentState::Normal,
            child_count: 0,
            has_parent: false,
        }
    }

    /// Component without a pixel footprint (mask-overlap term is then neutral).
    pub fn from_measurements(
        centroid: Point2<f64>,
        area: f64,
        avg_intensity: f64,
        circularity: f64,
    ) -> Self {
        Self {
            centroid,
            area,
            avg_intensity,
            circularity: circularity.clamp(0.0, 1.0),
            bbox: BoundingBox::default(),
            touches_border: false,
            footprint: Footprint::default(),
            source_label: None,
            state: ComponentState::Normal,
            child_count: 0,
            has_parent: false,
        }
    }

    pub fn with_source_label(mut self, label: u16) -> Self {
        self.source_label = Some(label);
        self
    }

    pub fn with_state(mut self, state: ComponentState) -> Self {
        self.state = state;
        self
    }

    /// Euclidean centroid distance.
    #[inline]
    pub fn distance_to(&self, other: &Component) -> f64 {
        nalgebra::distance(&self.centroid, &other.centroid)
    }
}

// ============================================================================
// FILTERING
// ============================================================================

/// Filter applied to the raw segmenter output before linking begins.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ComponentFilter {
    /// Components smaller than this (pixels) are discarded (default: 10)
    pub min_area: f64,

    /// Discard components touching the image border (default: false)
    pub drop_border: bool,
}

impl Default for ComponentFilter {
    fn default() -> Self {
        Self {
            min_area: 10.0,
            drop_border: false,
        }
    }
}

impl ComponentFilter {
    pub fn keeps(&self, component: &Component) -> bool {
        component.area >= self.min_area && !(self.drop_border && component.touches_border)
    }
}

// ============================================================================
// COMPONENT STACK
// ============================================================================

/// All components of the sequence, one list per frame.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ComponentStack {
    frames: Vec<Vec<Component>>,

    /// Raster size, used by label rendering
    width: u32,
    height: u32,
}

impl ComponentStack {
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            frames: Vec::new(),
            width,
            height,
        }
    }

    /// Segmenter output; unlabelled components get label `slot + 1`.
    pub fn from_frames(frames: Vec<Vec<Component>>, width: u32, height: u32) -> Self {
        let mut stack = Self::new(width, height);
        for components in frames {
            stack.push_frame(components);
        }
        stack
    }

    /// Append the segmenter output of the next frame.
    ///
    /// Unlabelled components get label `slot + 1`, the raster convention of the segmenter.
    pub fn push_frame(&mut self, mut components: Vec<Component>) {
        for (slot, c) in components.iter_mut().enumerate() {
            if c.source_label.is_none() {
                c.source_label = u16::try_from(slot + 1).ok();
            }
        }
        self.frames.push(components);
    }

    pub fn frame_count(&self) -> usize {
        self.frames.len()
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width, self.height)
    }

    pub fn frame(&self, frame: usize) -> &[Component] {
        self.frames.get(frame).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn get(&self, node: NodeId) -> Option<&Component> {
        self.frames.get(node.frame)?.get(node.slot)
    }

    pub fn get_mut(&mut self, node: NodeId) -> Option<&mut Component> {
        self.frames.get_mut(node.frame)?.get_mut(node.slot)
    }

    /// Iterate `(node, component)` in frame-then-slot order.
    pub fn iter(&self) -> impl Iterator<Item = (NodeId, &Component)> {
        self.frames.iter().enumerate().flat_map(|(frame, comps)| {
            comps
                .iter()
                .enumerate()
                .map(move |(slot, c)| (NodeId::new(frame, slot), c))
        })
    }

    pub fn component_count(&self) -> usize {
        self.frames.iter().map(Vec::len).sum()
    }

    /// Add a component to `frame`, returning its node id.
    ///
    /// Frames past the end are created empty.
    pub fn insert(&mut self, frame: usize, component: Component) -> NodeId {
        if self.frames.len() <= frame {
            self.frames.resize_with(frame + 1, Vec::new);
        }
        let slots = &mut self.frames[frame];
        slots.push(component);
        NodeId::new(frame, slots.len() - 1)
    }

    /// Drop filtered components and re-index slots densely.
    ///
    /// Survivors keep their `source_label`, so label rasters still map back.
    ///
    /// Must run before any linking; returns the number of removed components.
    pub fn apply_filter(&mut self, filter: &ComponentFilter) -> usize {
        let before = self.component_count();
        for comps in &mut self.frames {
            comps.retain(|c| filter.keeps(c));
        }
        before - self.component_count()
    }

    /// Minimum centroid distance from `point` to any component of `frame`.
    pub fn nearest_distance(&self, frame: usize, point: &Point2<f64>) -> Option<f64> {
        self.frame(frame)
            .iter()
            .map(|c| nalgebra::distance(&c.centroid, point))
            .min_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal))
    }
}

// ============================================================================
// TESTS
// ============================================================================
