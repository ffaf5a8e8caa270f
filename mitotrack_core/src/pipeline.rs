//! The Pipeline Driver - single owner of the stack and graph
//!
//! Runs the stages strictly in order, each with exclusive access:
//! filter → link → extract → resolve divisions → blob tracking → export.
//!
//! Consistency is checked after every mutating stage. Violations are logged
//! and carried in the result; the run still completes with partial results.

use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::{error, info};

use crate::blob::{BlobConfig, BlobFinder, BlobReport, BlobTracker};
use crate::component::{ComponentFilter, ComponentStack};
use crate::division::{DivisionConfig, DivisionReport, DivisionResolver};
use crate::export::{export, render_labels, ExportError, LabelImage, LineageExport};
use crate::graph::{ConsistencyViolation, GraphError, LineageGraph};
use crate::linker::{FrameLinker, LinkReport, LinkerConfig};
use crate::tracks::{extract_tracks, Track, TrackError};

/// Configuration for the LineagePipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub filter: ComponentFilter,

    pub linker: LinkerConfig,

    /// Tracks with this many components or fewer are dropped before division resolution (default: 1)
    pub min_track_length: usize,

    pub division: DivisionConfig,

    /// Marker-blob tracking; `None` disables the stage (default: enabled)
    pub blob: Option<BlobConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            filter: ComponentFilter::default(),
            linker: LinkerConfig::default(),
            min_track_length: 1,
            division: DivisionConfig::default(),
            blob: Some(BlobConfig::default()),
        }
    }
}

impl PipelineConfig {
    /// Parse a JSON config; missing fields take their defaults.
    pub fn from_json(text: &str) -> Result<Self, PipelineError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn load(path: &Path) -> Result<Self, PipelineError> {
        Self::from_json(&std::fs::read_to_string(path)?)
    }
}

/// Everything a run produced, intermediate reports included.
#[derive(Debug)]
pub struct PipelineResult {
    pub stack: ComponentStack,
    pub graph: LineageGraph,
    /// Track list as patched by division resolution and blob tracking
    pub tracks: Vec<Track>,
    /// Components removed by the filter
    pub filtered: usize,
    pub link_report: LinkReport,
    pub division_report: DivisionReport,
    pub blob_report: Option<BlobReport>,
    /// Violations found by the final consistency check
    pub violations: Vec<ConsistencyViolation>,
    pub export: LineageExport,
}

impl PipelineResult {
    /// Label raster per frame, drawn from component footprints.
    pub fn render_labels(&self) -> Result<Vec<LabelImage>, PipelineError> {
        Ok(render_labels(&self.stack, &self.export)?)
    }

    /// Nodes of the final graph with two children, whichever stage linked them.
    pub fn division_count(&self) -> usize {
        self.export.mitosis.len()
    }
}

pub struct LineagePipeline {
    config: PipelineConfig,
}

impl LineagePipeline {
    pub fn new(config: PipelineConfig) -> Self {
        Self { config }
    }

    pub fn with_defaults() -> Self {
        Self::new(PipelineConfig::default())
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Reconstruct the lineage of a fully materialized sequence.
    ///
    /// `blobs` is the marker-blob collaborator; without it the blob stage is skipped.
    pub fn run(
        &self,
        mut stack: ComponentStack,
        blobs: Option<&dyn BlobFinder>,
    ) -> Result<PipelineResult, PipelineError> {
        if stack.frame_count() == 0 {
            return Err(PipelineError::EmptySequence);
        }

        let filtered = stack.apply_filter(&self.config.filter);
        info!(
            "Pipeline start: {} frames, {} components ({} filtered)",
            stack.frame_count(),
            stack.component_count(),
            filtered
        );

        let mut graph = LineageGraph::from_stack(&stack);
        let link_report = FrameLinker::new(self.config.linker.clone()).run(&mut graph, &mut stack);
        log_violations("linking", &graph.check_consistency(&stack));

        let mut tracks = extract_tracks(&graph, &stack, self.config.min_track_length);
        info!("Extracted {} tracks", tracks.len());

        let resolver = DivisionResolver::new(self.config.division.clone());
        let division_report = resolver.resolve_all(&mut graph, &mut stack, &mut tracks);
        log_violations("division resolution", &graph.check_consistency(&stack));

        let blob_report = match (&self.config.blob, blobs) {
            (Some(config), Some(finder)) => {
                let report = BlobTracker::new(config.clone()).run(&mut graph, &mut stack, &mut tracks, finder, &resolver);
                log_violations("blob tracking", &graph.check_consistency(&stack));
                Some(report)
            }
            _ => None,
        };

        let violations = graph.check_consistency(&stack);
        let export = export(&graph, &stack);

        info!(
            "Pipeline done: {} links, {} divisions, {} track segments",
            graph.link_count(),
            division_report.events.len(),
            export.table.len()
        );

        Ok(PipelineResult {
            stack,
            graph,
            tracks,
            filtered,
            link_report,
            division_report,
            blob_report,
            violations,
            export,
        })
    }
}

fn log_violations(stage: &str, violations: &[ConsistencyViolation]) {
    for v in violations {
        error!("Consistency violation after {}: {}", stage, v);
    }
}

// ============================================================================
// ERRORS
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Sequence has no frames")]
    EmptySequence,

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Track(#[from] TrackError),

    #[error(transparent)]
    Export(#[from] ExportError),

    #[error("Invalid configuration: {0}")]
    Config(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::component::{Component, ComponentState, Footprint};
    use crate::export::TrackRow;
    use nalgebra::Point2;

    fn disk(x: f64, y: f64, r: f64, intensity: f64) -> Component {
        let c = Point2::new(x, y);
        Component::from_footprint(c, Footprint::disk(c, r, 64, 64), intensity, 0.9)
    }

    /// One cell for frames 0..=5 dividing into two cells for frames 6..15.
    /// The children's first components are flagged `MitosisEnd` by the segmenter.
    fn dividing_sequence() -> ComponentStack {
        let mut frames = Vec::new();
        for _ in 0..6 {
            frames.push(vec![disk(30.0, 30.0, 6.0, 120.0)]);
        }
        for f in 6..15 {
            let state = if f == 6 {
                ComponentState::MitosisEnd
            } else {
                ComponentState::Normal
            };
            frames.push(vec![
                disk(22.0, 30.0, 4.0, 100.0).with_state(state),
                disk(38.0, 30.0, 4.0, 100.0).with_state(state),
            ]);
        }
        ComponentStack::from_frames(frames, 64, 64)
    }

    #[test]
    fn test_pipeline_resolves_division() {
        let result = LineagePipeline::with_defaults()
            .run(dividing_sequence(), None)
            .unwrap();

        assert!(result.violations.is_empty(), "{:?}", result.violations);
        assert_eq!(result.division_report.events.len(), 1);
        assert_eq!(result.division_count(), 1);
        assert!(result.blob_report.is_none());
        assert_eq!(
            result.export.table.rows(),
            &[
                TrackRow { id: 1, start_frame: 0, end_frame: 5, parent_id: 0 },
                TrackRow { id: 2, start_frame: 6, end_frame: 14, parent_id: 1 },
                TrackRow { id: 3, start_frame: 6, end_frame: 14, parent_id: 1 },
            ]
        );
        assert_eq!(result.export.mitosis.len(), 1);

        let labels = result.render_labels().unwrap();
        result.export.table.validate_labels(&labels).unwrap();
    }

    #[test]
    fn test_filter_runs_before_linking() {
        let mut stack = dividing_sequence();
        for f in 0..stack.frame_count() {
            stack.insert(f, disk(5.0, 5.0, 1.0, 50.0));
        }

        let result = LineagePipeline::with_defaults().run(stack, None).unwrap();

        assert_eq!(result.filtered, 15);
        assert_eq!(result.export.table.len(), 3);
    }

    #[test]
    fn test_empty_sequence_is_rejected() {
        let err = LineagePipeline::with_defaults()
            .run(ComponentStack::new(32, 32), None)
            .unwrap_err();
        assert!(matches!(err, PipelineError::EmptySequence));
    }

    #[test]
    fn test_config_from_partial_json() {
        let config = PipelineConfig::from_json(r#"{ "min_track_length": 3, "blob": null }"#).unwrap();
        assert_eq!(config.min_track_length, 3);
        assert!(config.blob.is_none());
        assert_eq!(config.linker.passes.len(), 4);
        assert_eq!(config.division.top_candidates, 5);

        assert!(matches!(
            PipelineConfig::from_json("{ \"min_track_length\": \"x\" }").unwrap_err(),
            PipelineError::Config(_)
        ));
    }
}
