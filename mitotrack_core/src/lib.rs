//! MitoTrack Core - Cell Lineage Reconstruction from Segmented Time-Lapse Stacks
//!
//! This library turns per-frame segmented regions into a lineage:
//! 1. **Linking**: nearest-neighbour scoring with multi-frame lookahead and
//!    mutual-best verification builds a lineage graph
//! 2. **Division resolution**: tracks that stop early are re-wired to the best
//!    pair of child tracks, with a marker-blob tracker as fallback signal
//! 3. **Export**: gap-free track table, 16-bit label rasters and mitosis records
//!
//! The graph invariants (single parent, at most two children, strictly
//! forward links, component bookkeeping mirroring the degrees) hold after
//! every mutating operation.

pub mod component;
pub mod scoring;
pub mod graph;
pub mod linker;
pub mod tracks;
pub mod division;
pub mod blob;
pub mod export;
pub mod pipeline;

// Re-export key types for convenience
pub use component::{Component, ComponentFilter, ComponentStack, ComponentState, Footprint, StateTransitions};
pub use graph::{ConsistencyViolation, GraphError, LineageGraph, NodeId};
pub use linker::{FrameLinker, LinkPass, LinkReport, LinkerConfig};
pub use tracks::{extract_tracks, Track, TrackError};
pub use division::{DivisionConfig, DivisionEvent, DivisionReport, DivisionResolver};
pub use blob::{BlobCandidate, BlobConfig, BlobFinder, BlobTracker};
pub use export::{ExportError, LabelImage, LineageExport, MitosisInterval, TrackTable};
pub use pipeline::{LineagePipeline, PipelineConfig, PipelineError, PipelineResult};
