//! Result exporter.
//!
//! Writes a finished run in the layout downstream evaluation expects:
//! `res_track.txt`, `mitosis.json`, one 16-bit `maskNNN.png` per frame and
//! a `summary.json` with the verdict and metrics.

use crate::runner::ScenarioResult;
use crate::SimError;

use mitotrack_core::export::save_mitosis_intervals;
use mitotrack_core::PipelineResult;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;
use tracing::debug;

/// Summary of one scenario run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimSummary {
    /// Scenario name
    pub scenario: String,

    /// Seed used
    pub seed: u64,

    pub frames: usize,
    pub passed: bool,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,

    pub expected_divisions: usize,
    pub detected_divisions: usize,
    pub track_segments: usize,
    pub links: usize,
    pub resolver_divisions: usize,
    pub blob_divisions: usize,
    pub unresolved: usize,
}

impl SimSummary {
    pub fn from_result(result: &ScenarioResult) -> Self {
        Self {
            scenario: result.scenario.name().to_string(),
            seed: result.seed,
            frames: result.frames,
            passed: result.passed,
            failure_reason: result.failure_reason.clone(),
            expected_divisions: result.expected_divisions,
            detected_divisions: result.detected_divisions,
            track_segments: result.track_segments,
            links: result.metrics.links,
            resolver_divisions: result.metrics.resolver_divisions,
            blob_divisions: result.metrics.blob_divisions,
            unresolved: result.metrics.unresolved,
        }
    }

    /// Writes to a JSON file.
    pub fn write_to_file(&self, path: &Path) -> Result<(), SimError> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }
}

/// Write every artifact of a run into `dir`, creating it if needed.
pub fn write_outputs(dir: &Path, result: &ScenarioResult, output: &PipelineResult) -> Result<(), SimError> {
    fs::create_dir_all(dir)?;

    output.export.table.write_to(&dir.join("res_track.txt"))?;
    save_mitosis_intervals(&dir.join("mitosis.json"), &output.export.mitosis)?;

    let labels = output.render_labels()?;
    for (frame, image) in labels.iter().enumerate() {
        image.save(dir.join(format!("mask{:03}.png", frame)))?;
    }

    SimSummary::from_result(result).write_to_file(&dir.join("summary.json"))?;
    debug!("Wrote {} masks to {}", labels.len(), dir.display());
    Ok(())
}
