//! Read/write the search checkpoint.
//!
//! The checkpoint is the resumable form of a search:
//! - one [`PerPointSearchState`] per point, keyed by `"lon_lat"`
//! - candidate maps keyed by the integer candidate
//! - non-finite likelihoods stored as `null`
//!
//! It is loaded once at the start of a run and written once at the end.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::Path;

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::domain::{PerPointSearchState, PointId, RunMode};
use crate::error::AppError;

pub const CHECKPOINT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SearchCheckpoint {
    pub version: u32,
    pub updated_at: Option<DateTime<Utc>>,
    pub points: BTreeMap<PointId, PerPointSearchState>,
}

impl SearchCheckpoint {
    pub fn new() -> Self {
        Self {
            version: CHECKPOINT_VERSION,
            updated_at: None,
            points: BTreeMap::new(),
        }
    }

    /// Number of candidates recorded across every point.
    pub fn candidate_count(&self) -> usize {
        self.points.values().map(|s| s.outcomes.len()).sum()
    }
}

/// Read a checkpoint file.
pub fn read_checkpoint(path: &Path) -> Result<SearchCheckpoint, AppError> {
    let file = File::open(path)
        .map_err(|e| AppError::config(format!("Failed to open checkpoint '{}': {e}", path.display())))?;
    let checkpoint: SearchCheckpoint = serde_json::from_reader(file)
        .map_err(|e| AppError::config(format!("Invalid checkpoint '{}': {e}", path.display())))?;
    if checkpoint.version != CHECKPOINT_VERSION {
        return Err(AppError::config(format!(
            "Checkpoint '{}' has version {} (expected {CHECKPOINT_VERSION}).",
            path.display(),
            checkpoint.version
        )));
    }
    Ok(checkpoint)
}

/// Resolve the starting checkpoint for a run.
///
/// `continue` loads the file when it exists; `redo` (or a missing file) starts empty.
pub fn load_for_run(path: Option<&Path>, run_mode: RunMode) -> Result<SearchCheckpoint, AppError> {
    let Some(path) = path else {
        return Ok(SearchCheckpoint::new());
    };
    match run_mode {
        RunMode::Redo => {
            info!("Ignoring existing checkpoint '{}' (redo)", path.display());
            Ok(SearchCheckpoint::new())
        }
        RunMode::Continue if path.exists() => {
            let checkpoint = read_checkpoint(path)?;
            info!(
                "Resuming from '{}': {} point(s), {} candidate(s) already solved",
                path.display(),
                checkpoint.points.len(),
                checkpoint.candidate_count()
            );
            Ok(checkpoint)
        }
        RunMode::Continue => {
            debug!("No checkpoint at '{}'; starting fresh", path.display());
            Ok(SearchCheckpoint::new())
        }
    }
}

/// Write a checkpoint file, stamping the update time.
pub fn write_checkpoint(path: &Path, checkpoint: &mut SearchCheckpoint) -> Result<(), AppError> {
    checkpoint.updated_at = Some(Utc::now());
    let file = File::create(path)
        .map_err(|e| AppError::config(format!("Failed to create checkpoint '{}': {e}", path.display())))?;
    serde_json::to_writer_pretty(BufWriter::new(file), checkpoint)
        .map_err(|e| AppError::config(format!("Failed to write checkpoint: {e}")))?;
    Ok(())
}
