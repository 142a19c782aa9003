//! Shared "estimate pipeline" logic.
//!
//! Keeping this in one place avoids duplicating the core workflow:
//! ingest -> checkpoint load -> search/inversion -> checkpoint save -> exports
//!
//! The CLI then only deals with presentation.

use std::path::{Path, PathBuf};

use log::info;

use crate::domain::{EstimateConfig, PointData};
use crate::error::AppError;
use crate::fit::fitter::{EstimateOutput, EstimationOrchestrator};
use crate::io::checkpoint::{SearchCheckpoint, load_for_run, write_checkpoint};
use crate::io::export::write_outputs;
use crate::io::ingest::{IngestedOffsets, load_offsets};

/// All computed outputs of a single `gls estimate` run.
#[derive(Debug, Clone)]
pub struct EstimateRun {
    pub ingest: IngestedOffsets,
    pub output: EstimateOutput,
    pub written: Vec<PathBuf>,
}

/// Execute the full pipeline against an offsets CSV.
pub fn run_estimate(config: &EstimateConfig, data: &Path) -> Result<EstimateRun, AppError> {
    let ingest = load_offsets(data, config.topo_residual)?;
    info!(
        "Loaded {} offsets for {} points from '{}'",
        ingest.stats.n_offsets,
        ingest.stats.n_points,
        data.display()
    );

    let mut checkpoint = load_for_run(config.checkpoint.as_deref(), config.run_mode)?;
    let output = run_points(config, &ingest.points, &mut checkpoint)?;

    if let Some(path) = &config.checkpoint {
        write_checkpoint(path, &mut checkpoint)?;
    }
    let written = match &config.output_dir {
        Some(dir) => write_outputs(dir, &output, &config.mode)?,
        None => Vec::new(),
    };

    Ok(EstimateRun {
        ingest,
        output,
        written,
    })
}

/// Run the search over in-memory points, updating `checkpoint` in place.
pub fn run_points(
    config: &EstimateConfig,
    points: &[PointData],
    checkpoint: &mut SearchCheckpoint,
) -> Result<EstimateOutput, AppError> {
    if points.is_empty() {
        return Err(AppError::no_data("No points to estimate."));
    }
    let orchestrator = EstimationOrchestrator::new(config)?;
    orchestrator.run(points, &mut checkpoint.points)
}
