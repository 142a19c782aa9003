//! Export per-point results.
//!
//! Three kinds of output land in the output directory:
//! - `*.xyz` tables (`lon lat value`), one per mapped quantity, for gridding/plotting
//! - `probability_curves.csv` with every solved candidate per point
//! - `summary.json` with the full per-point result

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use log::info;
use serde::Serialize;

use crate::domain::{
    CoverageStats, DataSource, PointId, PointIssue, ResidualSummary, SearchMode, nan_as_null,
};
use crate::error::AppError;
use crate::fit::fitter::{EstimateOutput, PointEstimate, SearchSummary};
use crate::models::params::{AmpPhase, SourceResidual, TideParams};

/// Serializable view of a terminal inversion.
#[derive(Debug, Serialize)]
pub struct InversionSummary<'a> {
    pub grounding_level: Option<f64>,
    #[serde(with = "nan_as_null")]
    pub log_likelihood: f64,
    pub residual: ResidualSummary,
    pub residual_by_source: &'a BTreeMap<DataSource, SourceResidual>,
    pub tide: &'a TideParams,
}

/// Serializable view of one point's result.
#[derive(Debug, Serialize)]
pub struct PointSummary<'a> {
    pub id: PointId,
    pub lon: f64,
    pub lat: f64,
    pub coverage: CoverageStats,
    pub lowest_tide_height: Option<f64>,
    pub issues: &'a [PointIssue],
    pub search: Option<&'a SearchSummary>,
    pub inversion: Option<InversionSummary<'a>>,
}

impl<'a> PointSummary<'a> {
    pub fn of(p: &'a PointEstimate) -> Self {
        Self {
            id: p.id,
            lon: p.id.lon(),
            lat: p.id.lat(),
            coverage: p.coverage,
            lowest_tide_height: p.lowest_tide_height,
            issues: &p.issues,
            search: p.search.as_ref(),
            inversion: p.inversion.as_ref().map(|inv| InversionSummary {
                grounding_level: inv.grounding_level,
                log_likelihood: inv.log_likelihood,
                residual: inv.residual,
                residual_by_source: &inv.residual_by_source,
                tide: &inv.tide,
            }),
        }
    }
}

#[derive(Debug, Serialize)]
struct RunSummary<'a> {
    generated_at: DateTime<Utc>,
    mode: &'a SearchMode,
    rounds: usize,
    converged: bool,
    points: Vec<PointSummary<'a>>,
}

/// Write every output table into `dir` and return the written paths.
pub fn write_outputs(dir: &Path, output: &EstimateOutput, mode: &SearchMode) -> Result<Vec<PathBuf>, AppError> {
    fs::create_dir_all(dir)
        .map_err(|e| AppError::config(format!("Failed to create output directory '{}': {e}", dir.display())))?;

    let mut written = Vec::new();
    for (name, rows) in xyz_layers(&output.points) {
        let path = dir.join(format!("{name}.xyz"));
        write_xyz(&path, &rows)?;
        written.push(path);
    }

    let curves = dir.join("probability_curves.csv");
    write_probability_csv(&curves, &output.points)?;
    written.push(curves);

    let summary = dir.join("summary.json");
    write_summary_json(&summary, output, mode)?;
    written.push(summary);

    info!("Wrote {} output file(s) to '{}'", written.len(), dir.display());
    Ok(written)
}

/// Mapped quantities per layer name, rows in point order.
pub fn xyz_layers(points: &[PointEstimate]) -> BTreeMap<String, Vec<(PointId, f64)>> {
    let mut layers: BTreeMap<String, Vec<(PointId, f64)>> = BTreeMap::new();
    let mut push = |name: String, id: PointId, v: f64| layers.entry(name).or_default().push((id, v));

    for p in points {
        if let Some(search) = &p.search {
            let opt = &search.optimum;
            push("grounding_level".into(), p.id, opt.grounding_level);
            push("grounding_level_low".into(), p.id, opt.interval.low);
            push("grounding_level_high".into(), p.id, opt.interval.high);
            push("up_scale".into(), p.id, opt.up_scale);
        }

        let Some(inv) = &p.inversion else {
            continue;
        };
        push("residual_tidal".into(), p.id, inv.residual.tidal);
        push("residual_secular".into(), p.id, inv.residual.secular);

        let tide = &inv.tide;
        for (axis, est) in ["e", "n", "u"].iter().zip(&tide.secular_velocity) {
            push(format!("secular_velocity_{axis}"), p.id, est.value);
        }
        for c in &tide.constituents {
            let name = c.name.to_ascii_lowercase();
            let mut amp_phase = |component: &str, ap: &AmpPhase| {
                push(format!("{name}_{component}_amp"), p.id, ap.amplitude.value);
                push(format!("{name}_{component}_phase"), p.id, ap.phase_deg.value);
            };
            amp_phase("e", &c.east);
            amp_phase("n", &c.north);
            if let Some(up) = &c.up {
                amp_phase("u", up);
            }
        }
        if let Some(sv) = &tide.secular_variation {
            for (axis, est) in ["e", "n", "u"].iter().zip(sv) {
                push(format!("secular_variation_{axis}"), p.id, est.value);
            }
        }
        if let Some(topo) = &tide.topo_residual {
            push("topo_residual".into(), p.id, topo.value);
        }
    }
    layers
}

/// Write a `lon lat value` table; NaN values are written as `nan`.
pub fn write_xyz(path: &Path, rows: &[(PointId, f64)]) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::config(format!("Failed to create xyz table '{}': {e}", path.display())))?;
    let mut out = BufWriter::new(file);
    for (id, v) in rows {
        let value = if v.is_finite() { format!("{v:.6}") } else { "nan".to_string() };
        writeln!(out, "{} {} {value}", id.lon(), id.lat())
            .map_err(|e| AppError::config(format!("Failed to write xyz row: {e}")))?;
    }
    out.flush()
        .map_err(|e| AppError::config(format!("Failed to flush xyz table '{}': {e}", path.display())))?;
    Ok(())
}

/// Write `point,gl,log_likelihood,probability` for every solved candidate.
pub fn write_probability_csv(path: &Path, points: &[PointEstimate]) -> Result<(), AppError> {
    let mut writer = csv::Writer::from_path(path)
        .map_err(|e| AppError::config(format!("Failed to create probability CSV '{}': {e}", path.display())))?;
    writer
        .write_record(["point", "gl", "log_likelihood", "probability"])
        .map_err(|e| AppError::config(format!("Failed to write probability CSV header: {e}")))?;

    for p in points {
        let Some(search) = &p.search else {
            continue;
        };
        for s in &search.curve {
            let ll = if s.log_likelihood.is_finite() {
                format!("{:.6}", s.log_likelihood)
            } else {
                String::new()
            };
            writer
                .write_record([
                    p.id.to_string(),
                    format!("{:.6}", s.grounding_level),
                    ll,
                    format!("{:.10}", s.probability),
                ])
                .map_err(|e| AppError::config(format!("Failed to write probability CSV row: {e}")))?;
        }
    }
    writer
        .flush()
        .map_err(|e| AppError::config(format!("Failed to flush probability CSV: {e}")))?;
    Ok(())
}

/// Write the JSON run summary.
pub fn write_summary_json(path: &Path, output: &EstimateOutput, mode: &SearchMode) -> Result<(), AppError> {
    let file = File::create(path)
        .map_err(|e| AppError::config(format!("Failed to create summary JSON '{}': {e}", path.display())))?;
    let summary = RunSummary {
        generated_at: Utc::now(),
        mode,
        rounds: output.rounds,
        converged: output.converged,
        points: output.points.iter().map(PointSummary::of).collect(),
    };
    serde_json::to_writer_pretty(BufWriter::new(file), &summary)
        .map_err(|e| AppError::config(format!("Failed to write summary JSON: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{CredibleInterval, OptimalResult};
    use crate::fit::fitter::CurveSample;

    fn estimate(lon: f64, gl: f64) -> PointEstimate {
        PointEstimate {
            id: PointId::new(lon, -78.0),
            coverage: CoverageStats {
                csk_pairs: 3,
                max_csk_pairs: 6,
                s1_pairs: 0,
                max_s1_pairs: 0,
            },
            lowest_tide_height: Some(-1.2),
            search: Some(SearchSummary {
                optimum: OptimalResult {
                    grounding_level: gl,
                    interval: CredibleInterval { low: gl - 0.1, high: gl + 0.1 },
                    up_scale: 0.95,
                },
                curve: vec![
                    CurveSample {
                        grounding_level: gl,
                        log_likelihood: -3.0,
                        probability: 0.9,
                    },
                    CurveSample {
                        grounding_level: gl + 0.1,
                        log_likelihood: f64::NAN,
                        probability: 0.0,
                    },
                ],
                n_candidates: 2,
                stage: 3,
            }),
            inversion: None,
            issues: vec![PointIssue::SingularModel],
        }
    }

    #[test]
    fn layers_hold_one_row_per_point() {
        let points = [estimate(-80.0, -1.0), estimate(-79.0, f64::NAN)];
        let layers = xyz_layers(&points);
        assert_eq!(layers["grounding_level"].len(), 2);
        assert!(layers["grounding_level"][1].1.is_nan());
        assert!(!layers.contains_key("residual_tidal"));
    }

    #[test]
    fn writes_all_tables() {
        let dir = tempfile::tempdir().unwrap();
        let output = EstimateOutput {
            points: vec![estimate(-80.0, -1.0), estimate(-79.0, f64::NAN)],
            rounds: 3,
            converged: true,
        };
        let written = write_outputs(dir.path(), &output, &SearchMode::Auto).unwrap();
        assert!(written.iter().all(|p| p.exists()));

        let xyz = fs::read_to_string(dir.path().join("grounding_level.xyz")).unwrap();
        assert_eq!(xyz.lines().count(), 2);
        assert!(xyz.lines().nth(1).unwrap().ends_with("nan"));

        let curves = fs::read_to_string(dir.path().join("probability_curves.csv")).unwrap();
        assert_eq!(curves.lines().count(), 5);
        assert!(curves.contains("-80_-78,-1.000000,-3.000000,"));

        let summary: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(dir.path().join("summary.json")).unwrap()).unwrap();
        assert_eq!(summary["rounds"], 3);
        assert_eq!(summary["points"][0]["issues"][0], "singular_model");
        assert!(summary["points"][1]["search"]["optimum"]["grounding_level"].is_null());
    }
}
