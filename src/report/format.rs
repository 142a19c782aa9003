//! Formatted terminal output.
//!
//! We keep formatting code in one place so:
//! - the search/inversion code stays clean and testable
//! - output changes are localized

use crate::domain::{EstimateConfig, PointIssue, SearchMode};
use crate::fit::fitter::{EstimateOutput, PointEstimate};
use crate::io::ingest::DatasetStats;

/// Aggregate counts over a run.
#[derive(Debug, Clone, PartialEq)]
pub struct RunTotals {
    pub n_points: usize,
    pub n_searched: usize,
    pub n_inverted: usize,
    pub n_singular: usize,
    pub n_insufficient: usize,
    pub n_all_nan: usize,
    /// Range of finite optimal grounding levels.
    pub gl_range: Option<(f64, f64)>,
}

impl RunTotals {
    pub fn of(output: &EstimateOutput) -> Self {
        let count = |issue: PointIssue| output.points.iter().filter(|p| p.issues.contains(&issue)).count();
        let gls = output
            .points
            .iter()
            .filter_map(|p| p.search.as_ref())
            .map(|s| s.optimum.grounding_level)
            .filter(|v| v.is_finite());
        let gl_range = gls.fold(None, |acc: Option<(f64, f64)>, v| match acc {
            None => Some((v, v)),
            Some((lo, hi)) => Some((lo.min(v), hi.max(v))),
        });

        Self {
            n_points: output.points.len(),
            n_searched: output.points.iter().filter(|p| p.search.is_some()).count(),
            n_inverted: output.points.iter().filter(|p| p.inversion.is_some()).count(),
            n_singular: count(PointIssue::SingularModel),
            n_insufficient: count(PointIssue::InsufficientCoverage),
            n_all_nan: count(PointIssue::AllCandidatesNaN),
            gl_range,
        }
    }
}

/// Format the run summary (dataset stats + search progress + issue counts).
pub fn format_run_summary(stats: Option<&DatasetStats>, output: &EstimateOutput, config: &EstimateConfig) -> String {
    let mut out = String::new();
    let totals = RunTotals::of(output);

    out.push_str("=== gls - Grounding-Level Search ===\n");
    out.push_str(&format!("Mode: {}\n", mode_label(&config.mode)));
    out.push_str(&format!("Tides: {}\n", config.tides.join(", ")));
    if let Some(s) = stats {
        out.push_str(&format!(
            "Data: points={} | offsets={} | epochs=[{}, {}]\n",
            s.n_points, s.n_offsets, s.first_epoch, s.last_epoch
        ));
    }

    out.push_str(&format!(
        "Search: rounds={} | converged={} | searched={} | inverted={}\n",
        output.rounds,
        if output.converged { "yes" } else { "no" },
        totals.n_searched,
        totals.n_inverted
    ));
    if let Some((lo, hi)) = totals.gl_range {
        out.push_str(&format!("Grounding level: [{lo:.3}, {hi:.3}] m\n"));
    }
    if totals.n_singular + totals.n_insufficient + totals.n_all_nan > 0 {
        out.push_str(&format!(
            "Issues: singular={} | insufficient_coverage={} | all_nan={}\n",
            totals.n_singular, totals.n_insufficient, totals.n_all_nan
        ));
    }
    out.push('\n');

    out
}

fn mode_label(mode: &SearchMode) -> String {
    match mode {
        SearchMode::SimpleLinear => "simple_linear".to_string(),
        SearchMode::SingleValue { value } => format!("single_value ({value})"),
        SearchMode::Manual { values } => format!("manual ({} values)", values.len()),
        SearchMode::ManualRange { low, high, spacing } => format!("manual [{low}, {high}] step {spacing}"),
        SearchMode::Auto => "auto".to_string(),
        SearchMode::External { values } => format!("external ({} points)", values.len()),
        SearchMode::InvertOptimal => "invert_optimal".to_string(),
    }
}

/// Format a per-point table (first `max_rows` points).
pub fn format_point_table(points: &[PointEstimate], max_rows: usize) -> String {
    let mut out = String::new();
    out.push_str(
        format!(
            "{:<24} {:>8} {:>8} {:>8} {:>8} {:>12} {:>9} {:<12}\n",
            "point", "gl", "gl_low", "gl_high", "up", "log_lik", "rms", "issues"
        )
        .trim_end(),
    );
    out.push('\n');
    out.push_str(
        format!(
            "{:-<24} {:-<8} {:-<8} {:-<8} {:-<8} {:-<12} {:-<9} {:-<12}\n",
            "", "", "", "", "", "", "", ""
        )
        .trim_end(),
    );
    out.push('\n');

    for p in points.iter().take(max_rows) {
        let (gl, lo, hi, up) = match &p.search {
            Some(s) => (
                s.optimum.grounding_level,
                s.optimum.interval.low,
                s.optimum.interval.high,
                s.optimum.up_scale,
            ),
            None => (f64::NAN, f64::NAN, f64::NAN, f64::NAN),
        };
        let (ll, rms) = match &p.inversion {
            Some(inv) => (inv.log_likelihood, inv.residual.tidal),
            None => (f64::NAN, f64::NAN),
        };
        let issues: Vec<&str> = p.issues.iter().map(|i| issue_label(*i)).collect();

        out.push_str(
            format!(
                "{:<24} {:>8} {:>8} {:>8} {:>8} {:>12} {:>9} {:<12}\n",
                truncate(&p.id.to_string(), 24),
                fmt_num(gl, 3),
                fmt_num(lo, 3),
                fmt_num(hi, 3),
                fmt_num(up, 3),
                fmt_num(ll, 2),
                fmt_num(rms, 4),
                issues.join(","),
            )
            .trim_end(),
        );
        out.push('\n');
    }
    if points.len() > max_rows {
        out.push_str(&format!("... {} more point(s)\n", points.len() - max_rows));
    }

    out
}

fn issue_label(issue: PointIssue) -> &'static str {
    match issue {
        PointIssue::SingularModel => "singular",
        PointIssue::InsufficientCoverage => "coverage",
        PointIssue::AllCandidatesNaN => "all_nan",
    }
}

fn fmt_num(v: f64, decimals: usize) -> String {
    if v.is_finite() {
        format!("{v:.decimals$}")
    } else {
        "-".to_string()
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max.saturating_sub(1)).collect();
    out.push('.');
    out
}
