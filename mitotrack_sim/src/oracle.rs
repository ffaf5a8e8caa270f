//! Ground truth oracle for synthetic time-lapse sequences.
//!
//! The Oracle maintains the "God's eye view" of the simulated culture:
//! - True positions, sizes and lineage of all cells
//! - Drift and division kinematics
//! - Segmenter output generation (with noise and detection dropouts)
//! - Marker blobs for daughters that are not yet segmentable

use mitotrack_core::{BlobCandidate, BlobFinder, Component, ComponentStack, ComponentState, Footprint};
use nalgebra::{Point2, Vector2};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rand_distr::{Distribution, Normal};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A ground truth cell in the simulation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GroundTruthCell {
    /// Unique cell ID
    pub id: u64,

    /// True centre in pixels
    pub position: Point2<f64>,

    /// Drift in pixels per frame
    pub velocity: Vector2<f64>,

    pub radius: f64,

    pub intensity: f64,

    pub born_frame: usize,

    pub parent: Option<u64>,

    /// Frame at which the cell is replaced by its two daughters
    pub divide_at: Option<usize>,

    /// Until this frame only a marker blob is visible
    pub hidden_until: usize,

    /// Cell still exists (not yet divided)
    pub active: bool,
}

/// A division that actually happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivisionTruth {
    pub parent: u64,
    pub children: [u64; 2],
    /// First frame of the daughters
    pub frame: usize,
}

/// Imaging and kinematics parameters of the Oracle
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub width: u32,
    pub height: u32,

    /// Centroid noise (default: 0.3 px)
    pub position_noise_std: f64,

    /// Mean intensity noise (default: 3.0)
    pub intensity_noise_std: f64,

    pub cell_radius: f64,
    pub daughter_radius: f64,

    /// Distance of each daughter from the mother's centre at birth (default: 7 px)
    pub daughter_offset: f64,

    /// Separation speed of the daughters (default: 0.4 px/frame)
    pub daughter_speed: f64,

    pub base_intensity: f64,

    /// Intensity multiplier of a mother's last frame (default: 0.5)
    pub mitosis_dip: f64,

    /// Per-component chance of a missed detection (default: 0.0)
    pub dropout_probability: f64,

    /// Frames after birth in which daughters only show as marker blobs (default: 0)
    pub hidden_daughter_frames: usize,

    pub blob_radius: f64,
    pub blob_intensity: f64,

    /// Segmenter flags mothers' last and daughters' first components (default: true)
    pub mark_mitosis_states: bool,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            width: 256,
            height: 256,
            position_noise_std: 0.3,
            intensity_noise_std: 3.0,
            cell_radius: 6.0,
            daughter_radius: 4.5,
            daughter_offset: 7.0,
            daughter_speed: 0.4,
            base_intensity: 120.0,
            mitosis_dip: 0.5,
            dropout_probability: 0.0,
            hidden_daughter_frames: 0,
            blob_radius: 2.5,
            blob_intensity: 220.0,
            mark_mitosis_states: true,
        }
    }
}

// ============================================================================
// BLOB FIELD
// ============================================================================

/// Marker blobs of a sequence, served through `BlobFinder`.
#[derive(Debug, Clone, Default)]
pub struct BlobField {
    frames: HashMap<usize, Vec<BlobCandidate>>,
}

impl BlobField {
    pub fn add(&mut self, frame: usize, blob: BlobCandidate) {
        self.frames.entry(frame).or_default().push(blob);
    }

    pub fn frame(&self, frame: usize) -> &[BlobCandidate] {
        self.frames.get(&frame).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.frames.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl BlobFinder for BlobField {
    fn find_blobs(&self, frame: usize, center: &Point2<f64>, radius: f64, max_count: usize) -> Vec<BlobCandidate> {
        let mut found: Vec<(f64, &BlobCandidate)> = self
            .frame(frame)
            .iter()
            .map(|b| (nalgebra::distance(&b.centroid, center), b))
            .filter(|(d, _)| *d <= radius)
            .collect();
        found.sort_by(|a, b| a.0.partial_cmp(&b.0).unwrap_or(std::cmp::Ordering::Equal));
        found.into_iter().take(max_count).map(|(_, b)| b.clone()).collect()
    }
}

/// A generated sequence together with its ground truth.
#[derive(Debug, Clone)]
pub struct SyntheticSequence {
    pub stack: ComponentStack,
    pub blobs: BlobField,
    pub divisions: Vec<DivisionTruth>,
    /// Cells that ever existed
    pub cell_count: usize,
}

// ============================================================================
// ORACLE
// ============================================================================

/// The Oracle - maintains ground truth and generates segmenter output.
pub struct Oracle {
    physics_seed: u64,

    /// RNG for noise and dropouts
    physics_rng: ChaCha8Rng,

    config: OracleConfig,

    /// All cells in spawn order
    cells: Vec<GroundTruthCell>,

    next_id: u64,

    /// Frame the next `step` renders
    frame: usize,

    divisions: Vec<DivisionTruth>,
}

impl Oracle {
    /// Creates a new Oracle with the given physics seed.
    pub fn new(physics_seed: u64, config: OracleConfig) -> Self {
        Self {
            physics_seed,
            physics_rng: ChaCha8Rng::seed_from_u64(physics_seed),
            config,
            cells: Vec::new(),
            next_id: 0,
            frame: 0,
            divisions: Vec::new(),
        }
    }

    pub fn seed(&self) -> u64 {
        self.physics_seed
    }

    pub fn config(&self) -> &OracleConfig {
        &self.config
    }

    /// Spawns a new cell and returns its ID.
    pub fn spawn_cell(&mut self, position: Point2<f64>, velocity: Vector2<f64>) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        self.cells.push(GroundTruthCell {
            id,
            position,
            velocity,
            radius: self.config.cell_radius,
            intensity: self.config.base_intensity,
            born_frame: self.frame,
            parent: None,
            divide_at: None,
            hidden_until: self.frame,
            active: true,
        });
        id
    }

    /// Makes a cell divide at `frame`. Frames already rendered are ignored.
    pub fn schedule_division(&mut self, id: u64, frame: usize) {
        if frame <= self.frame {
            return;
        }
        if let Some(cell) = self.cells.iter_mut().find(|c| c.id == id) {
            cell.divide_at = Some(frame);
        }
    }

    pub fn cells(&self) -> &[GroundTruthCell] {
        &self.cells
    }

    pub fn active_cells(&self) -> impl Iterator<Item = &GroundTruthCell> {
        self.cells.iter().filter(|c| c.active)
    }

    pub fn divisions(&self) -> &[DivisionTruth] {
        &self.divisions
    }

    pub fn frame(&self) -> usize {
        self.frame
    }

    fn jitter(&mut self, std_dev: f64) -> f64 {
        match Normal::new(0.0, std_dev.max(0.0)) {
            Ok(normal) => normal.sample(&mut self.physics_rng),
            Err(_) => 0.0,
        }
    }

    /// Replace every cell due at the current frame by two daughters.
    fn apply_divisions(&mut self) {
        let frame = self.frame;
        let due: Vec<usize> = self
            .cells
            .iter()
            .enumerate()
            .filter(|(_, c)| c.active && c.divide_at == Some(frame))
            .map(|(i, _)| i)
            .collect();

        for idx in due {
            self.cells[idx].active = false;
            let mother = self.cells[idx].clone();

            let heading = if mother.velocity.norm() > f64::EPSILON {
                mother.velocity.normalize()
            } else {
                Vector2::new(0.0, 1.0)
            };
            let axis = Vector2::new(-heading.y, heading.x);

            let mut children = [0u64; 2];
            for (k, sign) in [1.0, -1.0].into_iter().enumerate() {
                let id = self.next_id;
                self.next_id += 1;
                self.cells.push(GroundTruthCell {
                    id,
                    position: mother.position + axis * (sign * self.config.daughter_offset),
                    velocity: mother.velocity + axis * (sign * self.config.daughter_speed),
                    radius: self.config.daughter_radius,
                    intensity: self.config.base_intensity,
                    born_frame: frame,
                    parent: Some(mother.id),
                    divide_at: None,
                    hidden_until: frame + self.config.hidden_daughter_frames,
                    active: true,
                });
                children[k] = id;
            }
            self.divisions.push(DivisionTruth {
                parent: mother.id,
                children,
                frame,
            });
        }
    }

    /// Renders the current frame, then advances the world by one frame.
    pub fn step(&mut self) -> (Vec<Component>, Vec<BlobCandidate>) {
        self.apply_divisions();

        let frame = self.frame;
        let (width, height) = (self.config.width, self.config.height);
        let mut components = Vec::new();
        let mut blobs = Vec::new();

        for idx in 0..self.cells.len() {
            if !self.cells[idx].active {
                continue;
            }
            let cell = self.cells[idx].clone();

            if frame < cell.hidden_until {
                blobs.push(BlobCandidate {
                    centroid: cell.position,
                    area: std::f64::consts::PI * self.config.blob_radius * self.config.blob_radius,
                    avg_intensity: self.config.blob_intensity,
                    footprint: Footprint::disk(cell.position, self.config.blob_radius, width, height),
                });
                continue;
            }

            let dropout = self.config.dropout_probability.clamp(0.0, 1.0);
            if dropout > 0.0 && self.physics_rng.gen_bool(dropout) {
                continue;
            }

            let dividing_next = cell.divide_at == Some(frame + 1);
            let first_visible = cell.parent.is_some() && frame == cell.hidden_until;

            let noise = self.config.position_noise_std;
            let centroid = Point2::new(cell.position.x + self.jitter(noise), cell.position.y + self.jitter(noise));
            let dip = if dividing_next { self.config.mitosis_dip } else { 1.0 };
            let intensity = (cell.intensity * dip + self.jitter(self.config.intensity_noise_std)).max(1.0);
            let circularity = 0.9 + self.jitter(0.02);

            let footprint = Footprint::disk(centroid, cell.radius, width, height);
            if footprint.is_empty() {
                continue;
            }
            let mut component = Component::from_footprint(centroid, footprint, intensity, circularity);
            component.touches_border = component.bbox.min_x == 0
                || component.bbox.min_y == 0
                || component.bbox.max_x >= width
                || component.bbox.max_y >= height;

            if self.config.mark_mitosis_states {
                if dividing_next {
                    component.state = ComponentState::MitosisStart;
                } else if first_visible {
                    component.state = ComponentState::MitosisEnd;
                }
            }
            components.push(component);
        }

        self.advance_positions();
        self.frame += 1;
        (components, blobs)
    }

    /// Drift every active cell, bouncing off the image borders.
    fn advance_positions(&mut self) {
        let (w, h) = (self.config.width as f64, self.config.height as f64);
        for cell in self.cells.iter_mut().filter(|c| c.active) {
            cell.position += cell.velocity;
            let r = cell.radius;
            if cell.position.x < r || cell.position.x > w - r {
                cell.velocity.x = -cell.velocity.x;
                cell.position.x = cell.position.x.clamp(r, w - r);
            }
            if cell.position.y < r || cell.position.y > h - r {
                cell.velocity.y = -cell.velocity.y;
                cell.position.y = cell.position.y.clamp(r, h - r);
            }
        }
    }

    /// Renders `frames` frames and hands back the sequence with its ground truth.
    pub fn generate(mut self, frames: usize) -> SyntheticSequence {
        let mut stack = ComponentStack::new(self.config.width, self.config.height);
        let mut blobs = BlobField::default();

        for _ in 0..frames {
            let frame = self.frame;
            let (components, frame_blobs) = self.step();
            stack.push_frame(components);
            for blob in frame_blobs {
                blobs.add(frame, blob);
            }
        }

        SyntheticSequence {
            stack,
            blobs,
            divisions: self.divisions,
            cell_count: self.cells.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_mother(config: OracleConfig) -> Oracle {
        let mut oracle = Oracle::new(7, config);
        let id = oracle.spawn_cell(Point2::new(128.0, 128.0), Vector2::new(0.5, 0.0));
        oracle.schedule_division(id, 5);
        oracle
    }

    #[test]
    fn test_oracle_determinism() {
        let a = single_mother(OracleConfig::default()).generate(12);
        let b = single_mother(OracleConfig::default()).generate(12);

        let centroids = |s: &SyntheticSequence| -> Vec<(usize, f64, f64)> {
            s.stack.iter().map(|(n, c)| (n.frame, c.centroid.x, c.centroid.y)).collect()
        };
        assert_eq!(centroids(&a), centroids(&b));
    }

    #[test]
    fn test_division_states_and_truth() {
        let seq = single_mother(OracleConfig::default()).generate(12);

        assert_eq!(seq.divisions.len(), 1);
        assert_eq!(seq.divisions[0].frame, 5);
        assert_eq!(seq.cell_count, 3);

        assert_eq!(seq.stack.frame(4).len(), 1);
        assert_eq!(seq.stack.frame(4)[0].state, ComponentState::MitosisStart);
        assert!(seq.stack.frame(4)[0].avg_intensity < 100.0);

        assert_eq!(seq.stack.frame(5).len(), 2);
        assert!(seq.stack.frame(5).iter().all(|c| c.state == ComponentState::MitosisEnd));
        assert!(seq.stack.frame(6).iter().all(|c| c.state == ComponentState::Normal));
        assert!(seq.blobs.is_empty());
    }

    #[test]
    fn test_hidden_daughters_leave_blobs() {
        let config = OracleConfig {
            hidden_daughter_frames: 3,
            ..OracleConfig::default()
        };
        let seq = single_mother(config).generate(12);

        for frame in 5..8 {
            assert!(seq.stack.frame(frame).is_empty());
            assert_eq!(seq.blobs.frame(frame).len(), 2);
        }
        assert_eq!(seq.stack.frame(8).len(), 2);
        assert!(seq.stack.frame(8).iter().all(|c| c.state == ComponentState::MitosisEnd));
    }

    #[test]
    fn test_blob_field_finder_limits() {
        let mut field = BlobField::default();
        for x in [10.0, 14.0, 40.0] {
            field.add(
                2,
                BlobCandidate {
                    centroid: Point2::new(x, 10.0),
                    area: 20.0,
                    avg_intensity: 200.0,
                    footprint: Footprint::default(),
                },
            );
        }

        let near = field.find_blobs(2, &Point2::new(12.0, 10.0), 10.0, 5);
        assert_eq!(near.len(), 2);

        let one = field.find_blobs(2, &Point2::new(13.0, 10.0), 10.0, 1);
        assert_eq!(one[0].centroid, Point2::new(14.0, 10.0));

        assert!(field.find_blobs(3, &Point2::new(12.0, 10.0), 10.0, 5).is_empty());
    }

    #[test]
    fn test_dropouts_remove_components() {
        let config = OracleConfig {
            dropout_probability: 1.0,
            ..OracleConfig::default()
        };
        let mut oracle = Oracle::new(1, config);
        oracle.spawn_cell(Point2::new(50.0, 50.0), Vector2::zeros());
        let seq = oracle.generate(5);
        assert_eq!(seq.stack.component_count(), 0);
    }
}
