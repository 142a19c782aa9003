//! Run configuration.
//!
//! A run is described by a JSON file deserialized into [`EstimateConfig`]. Every
//! field has a default so a config file only needs to name what it changes.
//! CLI flags may override a few fields afterwards (see `app::config_from_args`).

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::domain::{GlInt, PointId};
use crate::error::AppError;
use crate::math::tides::Constituent;

/// How grounding levels are searched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SearchMode {
    /// No grounding-level term at all: one plain linear inversion per point.
    SimpleLinear,
    /// One grounding level shared by every point.
    SingleValue { value: f64 },
    /// An explicit list of grounding levels.
    Manual { values: Vec<f64> },
    /// An inclusive, evenly spaced list `low..=high`.
    ManualRange { low: f64, high: f64, spacing: f64 },
    /// Staged grid refinement around the running optimum.
    Auto,
    /// Per-point grounding levels from an earlier product; no search.
    External { values: BTreeMap<PointId, f64> },
    /// Only the terminal inversion at the optimum stored in the checkpoint.
    InvertOptimal,
}

/// Whether an existing checkpoint is reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    Continue,
    Redo,
}

/// Global grounding-level search bounds (metres).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SearchBounds {
    pub low: f64,
    pub high: f64,
}

/// One refinement stage: `±half_range` around the reference at `spacing`.
///
/// `half_range = None` means "the whole search bounds" and is only valid for
/// the first stage.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct StageSpec {
    pub half_range: Option<f64>,
    pub spacing: f64,
}

/// Prior sigmas per parameter block. `None` means an uninformative prior.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PriorConfig {
    /// Secular velocity (m/day).
    pub secular_velocity: Option<f64>,
    /// Horizontal tidal cos/sin coefficients (m).
    pub horizontal_tide: Option<f64>,
    /// Vertical tidal cos/sin coefficients (m).
    pub vertical_tide: Option<f64>,
    /// Up-scale factor applied to the clipped tide (dimensionless).
    pub up_scale: Option<f64>,
    /// Change of secular velocity (m/day²).
    pub secular_variation: Option<f64>,
    /// Topographic residual (m).
    pub topo_residual: Option<f64>,
}

impl Default for PriorConfig {
    fn default() -> Self {
        Self {
            secular_velocity: Some(2.0),
            horizontal_tide: Some(1.0),
            vertical_tide: Some(3.0),
            up_scale: Some(2.0),
            secular_variation: Some(1e-3),
            topo_residual: Some(10.0),
        }
    }
}

/// Eligibility predicate applied before any enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CoverageCheck {
    /// Every point is searched.
    All,
    /// Point must lie south of `split_latitude` and carry `min_offsets` offsets.
    SouthernHalf { split_latitude: f64, min_offsets: usize },
    /// Point must carry at least `min_offsets` offsets.
    MinOffsets { min_offsets: usize },
}

/// Full run configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EstimateConfig {
    pub mode: SearchMode,
    pub run_mode: RunMode,
    pub bounds: SearchBounds,
    pub stages: Vec<StageSpec>,
    /// Target probability mass of the credible interval.
    pub credible_coverage: f64,
    /// Tidal constituents modelled by the base design matrix.
    pub tides: Vec<String>,
    pub secular_variation: bool,
    pub topo_residual: bool,
    pub prior: PriorConfig,
    pub coverage: CoverageCheck,
    /// Stop after this many enumeration rounds (resume later).
    pub max_rounds: Option<usize>,
    pub checkpoint: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
}

impl Default for EstimateConfig {
    fn default() -> Self {
        Self {
            mode: SearchMode::Auto,
            run_mode: RunMode::Continue,
            bounds: SearchBounds { low: -4.0, high: 4.0 },
            stages: default_stages(),
            credible_coverage: 0.68,
            tides: ["M2", "S2", "K1", "O1", "Mf", "Msf"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            secular_variation: false,
            topo_residual: false,
            prior: PriorConfig::default(),
            coverage: CoverageCheck::All,
            max_rounds: None,
            checkpoint: None,
            output_dir: None,
        }
    }
}

/// Stage table tuned for the Rutford/Evans studies.
pub fn default_stages() -> Vec<StageSpec> {
    vec![
        StageSpec { half_range: None, spacing: 0.1 },
        StageSpec { half_range: Some(0.15), spacing: 0.03 },
        StageSpec { half_range: Some(0.05), spacing: 0.01 },
    ]
}

impl EstimateConfig {
    /// Reject configurations that would make the run meaningless.
    pub fn validate(&self) -> Result<(), AppError> {
        let SearchBounds { low, high } = self.bounds;
        if !(low.is_finite() && high.is_finite() && high > low) {
            return Err(AppError::config(
                format!("Invalid search bounds: low={low}, high={high} (must be finite and high>low)."),
            ));
        }

        if self.stages.is_empty() {
            return Err(AppError::config("Stage table must contain at least one stage."));
        }
        for (i, stage) in self.stages.iter().enumerate() {
            // Spacings below the integer-key resolution would round to a zero step.
            if !(stage.spacing.is_finite() && GlInt::from_value(stage.spacing).0 > 0) {
                return Err(AppError::config(
                    format!("Stage {} has invalid spacing {}.", i + 1, stage.spacing),
                ));
            }
            match (i, stage.half_range) {
                (0, None) => {}
                (_, None) => {
                    return Err(AppError::config(
                        format!("Stage {} needs a half_range (only stage 1 may span the full bounds).", i + 1),
                    ));
                }
                (_, Some(h)) if !(h.is_finite() && h > 0.0) => {
                    return Err(AppError::config(
                        format!("Stage {} has invalid half_range {h}.", i + 1),
                    ));
                }
                _ => {}
            }
        }

        if !(self.credible_coverage > 0.0 && self.credible_coverage <= 1.0) {
            return Err(AppError::config(
                format!("credible_coverage must be in (0, 1], got {}.", self.credible_coverage),
            ));
        }

        if self.tides.is_empty() {
            return Err(AppError::config("At least one tidal constituent is required."));
        }
        for name in &self.tides {
            if Constituent::lookup(name).is_none() {
                return Err(AppError::config(format!("Unknown tidal constituent '{name}'.")));
            }
        }

        for (label, sigma) in [
            ("secular_velocity", self.prior.secular_velocity),
            ("horizontal_tide", self.prior.horizontal_tide),
            ("vertical_tide", self.prior.vertical_tide),
            ("up_scale", self.prior.up_scale),
            ("secular_variation", self.prior.secular_variation),
            ("topo_residual", self.prior.topo_residual),
        ] {
            if let Some(s) = sigma {
                if !(s.is_finite() && s > 0.0) {
                    return Err(AppError::config(format!("Prior sigma '{label}' must be > 0, got {s}.")));
                }
            }
        }

        match &self.mode {
            SearchMode::SingleValue { value } if !value.is_finite() => {
                return Err(AppError::config("single_value grounding level must be finite."));
            }
            SearchMode::Manual { values } => {
                if values.is_empty() {
                    return Err(AppError::config("manual mode needs at least one value."));
                }
                if values.iter().any(|v| !v.is_finite()) {
                    return Err(AppError::config("manual grounding levels must be finite."));
                }
            }
            SearchMode::ManualRange { low, high, spacing } => {
                if !(low.is_finite() && high.is_finite() && spacing.is_finite() && *spacing > 0.0 && high >= low) {
                    return Err(AppError::config(
                        format!("Invalid manual_range: low={low}, high={high}, spacing={spacing}."),
                    ));
                }
            }
            _ => {}
        }

        if self.max_rounds == Some(0) {
            return Err(AppError::config("max_rounds must be >= 1 when set."));
        }

        Ok(())
    }

    /// Resolved constituent table (validated names only).
    pub fn constituents(&self) -> Result<Vec<Constituent>, AppError> {
        self.tides
            .iter()
            .map(|name| {
                Constituent::lookup(name)
                    .ok_or_else(|| AppError::config(format!("Unknown tidal constituent '{name}'.")))
            })
            .collect()
    }

    /// Whether the design matrix carries the grounding-level column.
    pub fn uses_grounding_level(&self) -> bool {
        !matches!(self.mode, SearchMode::SimpleLinear)
    }
}

/// Load a JSON run configuration.
pub fn load_config(path: &Path) -> Result<EstimateConfig, AppError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| AppError::config(format!("Failed to read config {}: {e}", path.display())))?;
    let config: EstimateConfig = serde_json::from_str(&contents)
        .map_err(|e| AppError::config(format!("Failed to parse config {}: {e}", path.display())))?;
    Ok(config)
}
