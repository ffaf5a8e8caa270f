//! The Lineage Exporter - flat track table, label rasters and mitosis records
//!
//! Track ids are assigned by a depth-first walk of the final graph, roots in
//! `(frame, slot)` order. A segment ends (and its children get fresh ids) when
//! a node divides or when the next linked component is more than one frame
//! away, so every row of the table is a gap-free linear chain.
//!
//! Table format, one row per segment: `id start_frame end_frame parent_id`,
//! with `parent_id = 0` for roots.

use image::{ImageBuffer, Luma};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::component::ComponentStack;
use crate::graph::{LineageGraph, NodeId};

/// 16-bit label raster: pixel value = track id, 0 = background.
pub type LabelImage = ImageBuffer<Luma<u16>, Vec<u16>>;

/// Parent id of a root track.
pub const NO_PARENT: u32 = 0;

// ============================================================================
// ID ALLOCATION
// ============================================================================

/// Hands out track ids; one allocator per export run.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: u32,
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl IdAllocator {
    pub fn new() -> Self {
        Self { next: 1 }
    }

    pub fn next_id(&mut self) -> u32 {
        let id = self.next;
        self.next += 1;
        id
    }
}

// ============================================================================
// TRACK TABLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackRow {
    pub id: u32,
    pub start_frame: usize,
    pub end_frame: usize,
    pub parent_id: u32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackTable {
    rows: Vec<TrackRow>,
}

impl TrackTable {
    /// Build a table from rows, validating it.
    pub fn from_rows(rows: Vec<TrackRow>) -> Result<Self, ExportError> {
        let table = Self { rows };
        table.validate()?;
        Ok(table)
    }

    pub fn rows(&self) -> &[TrackRow] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn get(&self, id: u32) -> Option<&TrackRow> {
        self.rows.iter().find(|r| r.id == id)
    }

    /// Render as text, one `id start end parent` line per row.
    pub fn to_text(&self) -> String {
        let mut out = String::new();
        for r in &self.rows {
            out.push_str(&format!("{} {} {} {}\n", r.id, r.start_frame, r.end_frame, r.parent_id));
        }
        out
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ExportError> {
        fs::write(path, self.to_text())?;
        Ok(())
    }

    /// Parse and validate a table. Blank lines are ignored; any malformed line fails.
    pub fn parse(text: &str) -> Result<Self, ExportError> {
        let mut rows = Vec::new();
        for (n, line) in text.lines().enumerate() {
            let line_no = n + 1;
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let fields: Vec<&str> = trimmed.split_whitespace().collect();
            if fields.len() != 4 {
                return Err(ExportError::MalformedLine {
                    line: line_no,
                    reason: format!("expected 4 fields, found {}", fields.len()),
                });
            }
            let number = |i: usize| -> Result<u64, ExportError> {
                fields[i].parse::<u64>().map_err(|_| ExportError::MalformedLine {
                    line: line_no,
                    reason: format!("field {} is not a non-negative integer: {:?}", i + 1, fields[i]),
                })
            };
            let id = u32::try_from(number(0)?).map_err(|_| ExportError::MalformedLine {
                line: line_no,
                reason: "track id out of range".to_string(),
            })?;
            let parent_id = u32::try_from(number(3)?).map_err(|_| ExportError::MalformedLine {
                line: line_no,
                reason: "parent id out of range".to_string(),
            })?;
            rows.push(TrackRow {
                id,
                start_frame: number(1)? as usize,
                end_frame: number(2)? as usize,
                parent_id,
            });
        }
        Self::from_rows(rows)
    }

    pub fn read_from(path: &Path) -> Result<Self, ExportError> {
        Self::parse(&fs::read_to_string(path)?)
    }

    /// Check intervals, id uniqueness and parent references.
    ///
    /// Gaps between a parent's end and a child's start are allowed.
    pub fn validate(&self) -> Result<(), ExportError> {
        let mut ids = HashSet::with_capacity(self.rows.len());
        for r in &self.rows {
            if r.id == NO_PARENT {
                return Err(ExportError::MalformedLine {
                    line: 0,
                    reason: "track id 0 is reserved for background".to_string(),
                });
            }
            if r.start_frame > r.end_frame {
                return Err(ExportError::InvalidInterval {
                    track: r.id,
                    start: r.start_frame,
                    end: r.end_frame,
                });
            }
            if !ids.insert(r.id) {
                return Err(ExportError::DuplicateTrack(r.id));
            }
        }
        for r in &self.rows {
            if r.parent_id != NO_PARENT && !ids.contains(&r.parent_id) {
                return Err(ExportError::UnknownParent {
                    track: r.id,
                    parent: r.parent_id,
                });
            }
        }
        Ok(())
    }

    /// `(start_frame, end_frame, parent_id)` of every row, each row an independent chain.
    ///
    /// Sorted, so two tables describing the same lineage compare equal.
    pub fn rebuild_tracks(&self) -> Vec<(usize, usize, u32)> {
        let mut triples: Vec<_> = self
            .rows
            .iter()
            .map(|r| (r.start_frame, r.end_frame, r.parent_id))
            .collect();
        triples.sort_unstable();
        triples
    }

    /// Every frame of every row's interval must contain that row's label.
    pub fn validate_labels(&self, labels: &[LabelImage]) -> Result<(), ExportError> {
        for r in &self.rows {
            let label = u16::try_from(r.id).map_err(|_| ExportError::LabelOverflow(r.id))?;
            for frame in r.start_frame..=r.end_frame {
                let present = labels
                    .get(frame)
                    .map_or(false, |img| img.pixels().any(|p| p.0[0] == label));
                if !present {
                    return Err(ExportError::MissingComponent { track: r.id, frame });
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// MITOSIS INTERVALS
// ============================================================================

/// Frames over which a track was dividing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MitosisInterval {
    pub track_id: u32,
    pub start_frame: usize,
    pub end_frame: usize,
}

pub fn save_mitosis_intervals(path: &Path, intervals: &[MitosisInterval]) -> Result<(), ExportError> {
    let json = serde_json::to_string_pretty(intervals)?;
    fs::write(path, json)?;
    Ok(())
}

/// Load persisted intervals. A missing or unreadable file yields an empty set.
pub fn load_mitosis_intervals(path: &Path) -> Vec<MitosisInterval> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) => {
            warn!("No mitosis records at {}: {}", path.display(), e);
            return Vec::new();
        }
    };
    match serde_json::from_str(&text) {
        Ok(intervals) => intervals,
        Err(e) => {
            warn!("Ignoring unparseable mitosis records at {}: {}", path.display(), e);
            Vec::new()
        }
    }
}

// ============================================================================
// EXPORT
// ============================================================================

/// Everything produced from a finished graph.
#[derive(Debug, Clone, Default)]
pub struct LineageExport {
    pub table: TrackTable,
    /// Final track id of every node
    pub assignments: HashMap<NodeId, u32>,
    pub mitosis: Vec<MitosisInterval>,
}

impl LineageExport {
    pub fn track_of(&self, node: NodeId) -> Option<u32> {
        self.assignments.get(&node).copied()
    }
}

/// Walk the graph depth-first and cut it into gap-free segments.
pub fn export(graph: &LineageGraph, stack: &ComponentStack) -> LineageExport {
    let mut ids = IdAllocator::new();
    let mut rows = Vec::new();
    let mut assignments = HashMap::with_capacity(graph.node_count());
    let mut mitosis = Vec::new();

    let mut roots: Vec<NodeId> = graph
        .nodes()
        .iter()
        .copied()
        .filter(|&n| graph.parent(n).is_none() && stack.get(n).is_some())
        .collect();
    roots.sort_unstable();

    for root in roots {
        let mut pending = vec![(root, NO_PARENT)];
        while let Some((first, parent_id)) = pending.pop() {
            let id = ids.next_id();
            let mut current = first;
            assignments.insert(current, id);

            let children = loop {
                let mut children = graph.children(current);
                children.sort_unstable();
                if children.len() == 1 && children[0].frame == current.frame + 1 {
                    current = children[0];
                    assignments.insert(current, id);
                } else {
                    break children;
                }
            };

            rows.push(TrackRow {
                id,
                start_frame: first.frame,
                end_frame: current.frame,
                parent_id,
            });

            if children.len() == 2 {
                let end = children.iter().map(|c| c.frame).max().unwrap_or(current.frame);
                mitosis.push(MitosisInterval {
                    track_id: id,
                    start_frame: current.frame,
                    end_frame: end,
                });
            }
            // Reversed so the lower child is walked first.
            for child in children.into_iter().rev() {
                pending.push((child, id));
            }
        }
    }

    rows.sort_by_key(|r| r.id);
    info!("Exported {} track segments, {} mitoses", rows.len(), mitosis.len());

    LineageExport {
        table: TrackTable { rows },
        assignments,
        mitosis,
    }
}

// ============================================================================
// LABEL RASTERS
// ============================================================================

fn label_value(id: u32) -> Result<u16, ExportError> {
    u16::try_from(id).map_err(|_| ExportError::LabelOverflow(id))
}

/// Draw every component footprint with its final track id, one raster per frame.
pub fn render_labels(stack: &ComponentStack, export: &LineageExport) -> Result<Vec<LabelImage>, ExportError> {
    let (width, height) = stack.dimensions();
    let mut images: Vec<LabelImage> = (0..stack.frame_count())
        .map(|_| ImageBuffer::new(width, height))
        .collect();

    for (node, component) in stack.iter() {
        let Some(id) = export.track_of(node) else {
            continue;
        };
        let value = label_value(id)?;
        let img = &mut images[node.frame];
        for &[x, y] in component.footprint.pixels() {
            if x < width && y < height {
                img.put_pixel(x, y, Luma([value]));
            }
        }
    }
    Ok(images)
}

/// Map the segmenter's label raster of `frame` onto final track ids.
///
/// Labels are matched through `Component::source_label`; labels of filtered
/// or untracked regions map to background.
pub fn relabel_frame(
    input: &LabelImage,
    frame: usize,
    stack: &ComponentStack,
    export: &LineageExport,
) -> Result<LabelImage, ExportError> {
    let mut lookup: HashMap<u16, u16> = HashMap::new();
    for (slot, component) in stack.frame(frame).iter().enumerate() {
        let (Some(label), Some(id)) = (
            component.source_label.filter(|&l| l != 0),
            export.track_of(NodeId::new(frame, slot)),
        ) else {
            continue;
        };
        lookup.insert(label, label_value(id)?);
    }

    let mut out = ImageBuffer::new(input.width(), input.height());
    for (x, y, pixel) in input.enumerate_pixels() {
        let value = lookup.get(&pixel.0[0]).copied().unwrap_or(0);
        if value != 0 {
            out.put_pixel(x, y, Luma([value]));
        }
    }
    Ok(out)
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum ExportError {
    #[error("Malformed track table line {line}: {reason}")]
    MalformedLine { line: usize, reason: String },

    #[error("Track {track} has start frame {start} after end frame {end}")]
    InvalidInterval { track: u32, start: usize, end: usize },

    #[error("Track {track} references unknown parent {parent}")]
    UnknownParent { track: u32, parent: u32 },

    #[error("Track id {0} appears more than once")]
    DuplicateTrack(u32),

    #[error("Track {track} has no labelled component in frame {frame}")]
    MissingComponent { track: u32, frame: usize },

    #[error("Track id {0} does not fit a 16-bit label")]
    LabelOverflow(u32),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ============================================================================
// TESTS
// ============================================================================
