//! MitoTrack Deterministic Simulation Harness
//!
//! Generates synthetic time-lapse sequences with known lineage and runs the
//! full reconstruction pipeline against them.
//!
//! # Core Principle: One Seed, One Sequence
//!
//! All sources of variation are derived from a single 64-bit seed:
//! - **Layout**: initial positions and drift of every cell
//! - **Imaging**: centroid and intensity noise, missed detections
//! - **Division**: timing, daughter placement and marker blobs
//!
//! # Architecture
//!
//! ```text
//! ┌───────────────┐   components    ┌──────────────────┐
//! │    Oracle     │ ──────────────► │ LineagePipeline  │
//! │ (ground truth)│   marker blobs  │  (mitotrack_core)│
//! └───────┬───────┘ ──────────────► └────────┬─────────┘
//!         │ true divisions                   │ track table, labels
//!         └──────────────► ScenarioRunner ◄──┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use mitotrack_sim::{ScenarioRunner, scenarios::ScenarioId};
//!
//! let result = ScenarioRunner::new(42).run(ScenarioId::SingleDivision);
//! assert!(result.passed);
//! ```

pub mod oracle;
pub mod scenarios;
pub mod runner;
pub mod exporter;

pub use oracle::{BlobField, DivisionTruth, GroundTruthCell, Oracle, OracleConfig, SyntheticSequence};
pub use runner::{ScenarioMetrics, ScenarioResult, ScenarioRunner};
pub use exporter::{write_outputs, SimSummary};

use mitotrack_core::{ExportError, PipelineError};

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SimError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("Pipeline failed: {0}")]
    Pipeline(#[from] PipelineError),

    #[error("Export failed: {0}")]
    Export(#[from] ExportError),
}
